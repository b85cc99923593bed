//! Lazy retrieval of custom input text.

use crate::cache::VolatileCache;
use crate::gateway::ChatGateway;
use std::sync::Arc;

/// Resolves the text of a custom input message: cache first, then the chat
/// platform, writing fetched text back through the cache.
pub struct ContentFetcher {
    cache: Arc<VolatileCache>,
    gateway: Arc<dyn ChatGateway>,
}

impl ContentFetcher {
    pub fn new(cache: Arc<VolatileCache>, gateway: Arc<dyn ChatGateway>) -> Self {
        Self { cache, gateway }
    }

    /// The display/winner text for a custom input. Falls back to a
    /// placeholder naming the message id when the text cannot be fetched.
    pub async fn custom_input_content(&self, group_id: &str, message_id: &str) -> String {
        if let Some(entry) = self.cache.get_vote_item(group_id, message_id).await
            && let Some(content) = entry.content
            && !content.is_empty()
        {
            return content;
        }

        match self.gateway.fetch_message_text(message_id).await {
            Ok(content) => {
                self.cache
                    .set_custom_input_content(group_id, message_id, &content)
                    .await;
                content
            }
            Err(error) => {
                tracing::warn!(message_id, %error, "failed to fetch custom input text");
                format!("自定义输入 (ID: {message_id})")
            }
        }
    }
}

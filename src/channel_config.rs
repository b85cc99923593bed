//! Per-channel flags, currently just the advanced mode toggle.
//!
//! Advanced mode makes the engine publish a web link for advancement
//! results instead of a rendered image.

use crate::error::Result;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Flags recorded for one channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelFlags {
    #[serde(default)]
    pub advanced_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_by: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChannelConfigData {
    #[serde(default)]
    channel_configs: HashMap<String, ChannelFlags>,
}

/// JSON-file-backed channel flag store.
pub struct ChannelConfigStore {
    path: PathBuf,
    state: Mutex<Option<ChannelConfigData>>,
}

impl ChannelConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(None),
        }
    }

    pub async fn is_advanced_mode(&self, channel_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let data = Self::loaded(&mut state, &self.path);
        data.channel_configs
            .get(channel_id)
            .map(|flags| flags.advanced_mode)
            .unwrap_or(false)
    }

    pub async fn channel_flags(&self, channel_id: &str) -> ChannelFlags {
        let mut state = self.state.lock().await;
        let data = Self::loaded(&mut state, &self.path);
        data.channel_configs
            .get(channel_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn enable_advanced_mode(&self, channel_id: &str, user_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let data = Self::loaded(&mut state, &self.path);
        let flags = data
            .channel_configs
            .entry(channel_id.to_string())
            .or_default();
        flags.advanced_mode = true;
        flags.enabled_at = Some(Utc::now());
        flags.enabled_by = Some(user_id.to_string());
        self.save(data)?;
        tracing::info!(channel_id, user_id, "advanced mode enabled");
        Ok(())
    }

    pub async fn disable_advanced_mode(&self, channel_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let data = Self::loaded(&mut state, &self.path);
        if let Some(flags) = data.channel_configs.get_mut(channel_id) {
            // Keep the audit fields, only drop the flag.
            flags.advanced_mode = false;
            self.save(data)?;
        }
        tracing::info!(channel_id, "advanced mode disabled");
        Ok(())
    }

    fn loaded<'a>(
        state: &'a mut Option<ChannelConfigData>,
        path: &std::path::Path,
    ) -> &'a mut ChannelConfigData {
        state.get_or_insert_with(|| match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|error| {
                tracing::error!(%error, "channel config file is malformed, starting empty");
                ChannelConfigData::default()
            }),
            Err(_) => ChannelConfigData::default(),
        })
    }

    fn save(&self, data: &ChannelConfigData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("failed to create config directory")?;
        }
        let encoded =
            serde_json::to_string_pretty(data).context("failed to serialize channel config")?;
        std::fs::write(&self.path, encoded).context("failed to write channel config")?;
        Ok(())
    }
}

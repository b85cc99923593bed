//! Shared test doubles: a recording chat gateway, scripted completions, and
//! a full wiring harness over an in-memory store.

use crate::cache::VolatileCache;
use crate::channel_config::ChannelConfigStore;
use crate::content::ContentFetcher;
use crate::engine::{GameEngine, VoteTally};
use crate::error::{GatewayError, LlmError, Result};
use crate::gateway::{
    AuthOracle, ChatGateway, ForwardBundle, MemberRole, Renderer, StructuredMessage, Visualizer,
    WebExposer,
};
use crate::llm::broker::LlmBroker;
use crate::llm::client::{ChatCompletion, ChatMessage, CompletionOutput, TokenUsage};
use crate::store::Store;
use crate::GameId;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Gateway double that records everything and hands out sequential message
/// ids (`m1`, `m2`, …).
#[derive(Default)]
pub struct RecordingGateway {
    next_id: AtomicU64,
    pub texts: Mutex<Vec<(String, String, Option<String>)>>,
    pub privates: Mutex<Vec<(String, String)>>,
    pub images: Mutex<Vec<(String, String)>>,
    pub bundles: Mutex<Vec<(String, usize)>>,
    pub reactions: Mutex<Vec<(String, u32, bool)>>,
    pub deleted: Mutex<Vec<String>>,
    pub message_texts: Mutex<HashMap<String, String>>,
    pub roles: Mutex<HashMap<(String, String), MemberRole>>,
}

impl RecordingGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn assign_id(&self) -> String {
        format!("m{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// The id of the most recently posted image message.
    pub fn last_image_id(&self) -> Option<String> {
        self.images.lock().unwrap().last().map(|(_, id)| id.clone())
    }

    pub fn posted_texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().iter().map(|(_, t, _)| t.clone()).collect()
    }

    pub fn reactions_on(&self, message_id: &str) -> Vec<u32> {
        self.reactions
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, active)| id == message_id && *active)
            .map(|(_, emoji, _)| *emoji)
            .collect()
    }

    pub fn set_role(&self, group_id: &str, user_id: &str, role: MemberRole) {
        self.roles
            .lock()
            .unwrap()
            .insert((group_id.to_string(), user_id.to_string()), role);
    }

    pub fn set_message_text(&self, message_id: &str, text: &str) {
        self.message_texts
            .lock()
            .unwrap()
            .insert(message_id.to_string(), text.to_string());
    }
}

#[async_trait]
impl ChatGateway for RecordingGateway {
    async fn post_text(&self, group_id: &str, text: &str, reply_to: Option<&str>) -> Result<String> {
        let id = self.assign_id();
        self.texts.lock().unwrap().push((
            group_id.to_string(),
            text.to_string(),
            reply_to.map(str::to_string),
        ));
        Ok(id)
    }

    async fn post_image(&self, group_id: &str, _image: &[u8]) -> Result<String> {
        let id = self.assign_id();
        self.images
            .lock()
            .unwrap()
            .push((group_id.to_string(), id.clone()));
        Ok(id)
    }

    async fn post_structured(&self, group_id: &str, message: &StructuredMessage) -> Result<String> {
        let id = self.assign_id();
        self.texts.lock().unwrap().push((
            group_id.to_string(),
            message.text.clone(),
            message.reply_to.clone(),
        ));
        Ok(id)
    }

    async fn post_forward_bundle(&self, group_id: &str, bundle: &ForwardBundle) -> Result<String> {
        let id = self.assign_id();
        self.bundles
            .lock()
            .unwrap()
            .push((group_id.to_string(), bundle.nodes.len()));
        Ok(id)
    }

    async fn post_private_text(&self, user_id: &str, text: &str) -> Result<String> {
        let id = self.assign_id();
        self.privates
            .lock()
            .unwrap()
            .push((user_id.to_string(), text.to_string()));
        Ok(id)
    }

    async fn set_reaction(&self, message_id: &str, emoji_id: u32, active: bool) -> Result<()> {
        self.reactions
            .lock()
            .unwrap()
            .push((message_id.to_string(), emoji_id, active));
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(message_id.to_string());
        Ok(())
    }

    async fn fetch_message_text(&self, message_id: &str) -> Result<String> {
        self.message_texts
            .lock()
            .unwrap()
            .get(message_id)
            .cloned()
            .ok_or_else(|| {
                GatewayError::MessageNotFound {
                    id: message_id.to_string(),
                }
                .into()
            })
    }

    async fn fetch_reactions(&self, message_id: &str) -> Result<Vec<(u32, Vec<String>)>> {
        let reactions = self.reactions.lock().unwrap();
        let mut by_emoji: HashMap<u32, Vec<String>> = HashMap::new();
        for (id, emoji_id, active) in reactions.iter() {
            if id == message_id && *active {
                by_emoji.entry(*emoji_id).or_default().push("bot".to_string());
            }
        }
        Ok(by_emoji.into_iter().collect())
    }

    async fn member_role(&self, group_id: &str, user_id: &str) -> Result<MemberRole> {
        Ok(self
            .roles
            .lock()
            .unwrap()
            .get(&(group_id.to_string(), user_id.to_string()))
            .copied()
            .unwrap_or(MemberRole::Member))
    }
}

/// Renderer double producing fixed bytes.
pub struct StaticRenderer;

#[async_trait]
impl Renderer for StaticRenderer {
    async fn render_markdown(&self, _markdown: &str, _extra_header: Option<&str>) -> Result<Vec<u8>> {
        Ok(b"image".to_vec())
    }

    async fn render_help_page(&self) -> Result<Vec<u8>> {
        Ok(b"help".to_vec())
    }

    async fn clear_help_cache(&self) {}
}

/// Visualizer double producing fixed bytes.
pub struct StaticVisualizer;

#[async_trait]
impl Visualizer for StaticVisualizer {
    async fn create_branch_graph(&self, _game_id: GameId) -> Result<Vec<u8>> {
        Ok(b"graph".to_vec())
    }

    async fn create_full_branch_graph(&self, _game_id: GameId) -> Result<Vec<u8>> {
        Ok(b"full-graph".to_vec())
    }
}

/// Auth oracle double with a fixed root set.
#[derive(Default)]
pub struct StaticAuth {
    pub roots: HashSet<String>,
}

impl StaticAuth {
    pub fn with_root(user_id: &str) -> Arc<Self> {
        let mut roots = HashSet::new();
        roots.insert(user_id.to_string());
        Arc::new(Self { roots })
    }
}

#[async_trait]
impl AuthOracle for StaticAuth {
    async fn has_role(&self, user_id: &str, role: &str) -> bool {
        role == "root" && self.roots.contains(user_id)
    }
}

/// Web exposer double with a fixed URL.
pub struct StaticWeb {
    pub url: Option<String>,
}

#[async_trait]
impl WebExposer for StaticWeb {
    fn public_url(&self) -> Option<String> {
        self.url.clone()
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

/// Completion double that replays a scripted queue of outcomes. An optional
/// barrier, once armed, holds every in-flight call at the provider boundary
/// until all participants arrive, which lets concurrency tests line up
/// racing advancements.
pub struct ScriptedCompletion {
    responses: Mutex<VecDeque<std::result::Result<CompletionOutput, LlmError>>>,
    barrier: Option<tokio::sync::Barrier>,
    barrier_armed: std::sync::atomic::AtomicBool,
    pub calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedCompletion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            barrier: None,
            barrier_armed: std::sync::atomic::AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn with_barrier(parties: usize) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            barrier: Some(tokio::sync::Barrier::new(parties)),
            barrier_armed: std::sync::atomic::AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Start holding completion calls at the barrier.
    pub fn arm_barrier(&self) {
        self.barrier_armed.store(true, Ordering::SeqCst);
    }

    pub fn push_ok(&self, content: &str, prompt_tokens: i64) {
        self.responses.lock().unwrap().push_back(Ok(CompletionOutput {
            content: content.to_string(),
            usage: Some(TokenUsage {
                prompt_tokens: Some(prompt_tokens),
                completion_tokens: Some(0),
                total_tokens: Some(prompt_tokens),
            }),
            model_name: "scripted-model".to_string(),
        }));
    }

    pub fn push_err(&self, error: LlmError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }
}

#[async_trait]
impl ChatCompletion for ScriptedCompletion {
    async fn get_completion(
        &self,
        messages: &[ChatMessage],
        _preset: &crate::llm::broker::LlmPreset,
    ) -> Result<CompletionOutput> {
        self.calls.lock().unwrap().push(messages.to_vec());
        if let Some(barrier) = &self.barrier
            && self.barrier_armed.load(Ordering::SeqCst)
        {
            barrier.wait().await;
        }
        let next = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("unexpected completion call");
        next.map_err(Into::into)
    }
}

/// Fully wired engine over an in-memory store, with a preset bound as the
/// fallback for group `g1` owned by `u1`.
pub struct Harness {
    pub store: Store,
    pub cache: Arc<VolatileCache>,
    pub broker: Arc<LlmBroker>,
    pub completion: Arc<ScriptedCompletion>,
    pub gateway: Arc<RecordingGateway>,
    pub flags: Arc<ChannelConfigStore>,
    pub content: Arc<ContentFetcher>,
    pub tally: Arc<VoteTally>,
    pub engine: Arc<GameEngine>,
    pub dir: tempfile::TempDir,
}

pub async fn harness() -> Harness {
    harness_with_completion(ScriptedCompletion::new()).await
}

pub async fn harness_with_completion(completion: Arc<ScriptedCompletion>) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir should be created");

    let store = Store::in_memory().await.expect("store should open");
    let cache = VolatileCache::new(
        dir.path().join("cache.json"),
        Duration::from_millis(10),
        Duration::from_secs(24 * 3600),
        Duration::from_secs(3600),
        Duration::from_secs(600),
    );
    let broker = Arc::new(LlmBroker::open(dir.path()).expect("broker should open"));
    broker.load().await.expect("broker should load");
    broker
        .add_preset("u1", "p1", "test-model", "https://api.example.com/v1", "sk-test-12345")
        .await
        .expect("preset should be added");
    broker
        .set_fallback("g1", "u1", "p1")
        .await
        .expect("fallback should bind");

    let gateway = RecordingGateway::new();
    let flags = Arc::new(ChannelConfigStore::new(dir.path().join("channel_config.json")));
    let content = Arc::new(ContentFetcher::new(cache.clone(), gateway.clone()));
    let tally = Arc::new(VoteTally::new(cache.clone(), content.clone()));

    let engine = Arc::new(GameEngine::new(
        store.clone(),
        cache.clone(),
        broker.clone(),
        completion.clone(),
        Arc::new(StaticRenderer),
        gateway.clone(),
        content.clone(),
        flags.clone(),
        None,
    ));

    Harness {
        store,
        cache,
        broker,
        completion,
        gateway,
        flags,
        content,
        tally,
        engine,
        dir,
    }
}

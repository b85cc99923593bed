//! In-memory, disk-backed cache of pending game proposals, per-message vote
//! tallies, and one-time web start tokens.
//!
//! Persistence uses delayed coalescing writes: a plain save request arms a
//! single deferred flush (~0.5 s) that later requests merge into; a forced
//! save cancels the deferred flush and writes before returning. Lock order
//! is always state → I/O, never the reverse.

use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// A game proposal awaiting reaction confirmation, keyed by the id of the
/// bot-posted preview message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingProposal {
    pub user_id: String,
    pub system_prompt: String,
    /// The originating upload message, if the proposal came from one.
    pub message_id: Option<String>,
    pub create_time: DateTime<Utc>,
}

/// Cached votes for one message: emoji id → voters, plus the lazily filled
/// text of a custom input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoteEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub votes: HashMap<String, HashSet<String>>,
    /// Last mutation time; entries expire 24 h after it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl VoteEntry {
    /// Unique voters for one emoji.
    pub fn voters(&self, emoji_id: u32) -> usize {
        self.votes
            .get(&emoji_id.to_string())
            .map(HashSet::len)
            .unwrap_or(0)
    }
}

/// A minted one-time web start token.
#[derive(Debug, Clone)]
struct WebStartToken {
    group_id: String,
    user_id: String,
    create_time: DateTime<Utc>,
}

/// On-disk shape of the cache. Web start tokens are deliberately not
/// persisted; they die with the process.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheDump {
    #[serde(default)]
    pending_new_games: HashMap<String, PendingProposal>,
    #[serde(default)]
    vote_cache: HashMap<String, HashMap<String, VoteEntry>>,
}

#[derive(Debug, Default)]
struct CacheState {
    pending_new_games: HashMap<String, PendingProposal>,
    vote_cache: HashMap<String, HashMap<String, VoteEntry>>,
    web_start_tokens: HashMap<String, WebStartToken>,
    loaded: bool,
    last_vote_sweep: Option<std::time::Instant>,
}

#[derive(Default)]
struct SaveState {
    pending: Option<JoinHandle<()>>,
    requested: bool,
}

/// The volatile cache aggregate.
pub struct VolatileCache {
    path: PathBuf,
    save_delay: Duration,
    vote_ttl: Duration,
    sweep_interval: Duration,
    web_token_ttl: Duration,
    state: Mutex<CacheState>,
    io: Mutex<()>,
    save: Mutex<SaveState>,
    weak_self: Weak<VolatileCache>,
}

impl VolatileCache {
    pub fn new(
        path: PathBuf,
        save_delay: Duration,
        vote_ttl: Duration,
        sweep_interval: Duration,
        web_token_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            path,
            save_delay,
            vote_ttl,
            sweep_interval,
            web_token_ttl,
            state: Mutex::new(CacheState::default()),
            io: Mutex::new(()),
            save: Mutex::new(SaveState::default()),
            weak_self: weak_self.clone(),
        })
    }

    // --- Pending proposals ---

    pub async fn add_pending_game(&self, preview_message_id: &str, proposal: PendingProposal) {
        {
            let mut state = self.state.lock().await;
            state
                .pending_new_games
                .insert(preview_message_id.to_string(), proposal);
        }
        self.request_save(false).await;
    }

    pub async fn get_pending_game(&self, preview_message_id: &str) -> Option<PendingProposal> {
        let state = self.state.lock().await;
        state.pending_new_games.get(preview_message_id).cloned()
    }

    pub async fn remove_pending_game(&self, preview_message_id: &str) {
        {
            let mut state = self.state.lock().await;
            state.pending_new_games.remove(preview_message_id);
        }
        self.request_save(false).await;
    }

    pub async fn clear_pending_games(&self) {
        {
            let mut state = self.state.lock().await;
            state.pending_new_games.clear();
        }
        self.request_save(true).await;
    }

    /// Atomically remove every proposal older than `timeout` and return the
    /// removed ids, so a racing reaction observes its own removal.
    pub async fn cleanup_expired_pending_games(&self, timeout: Duration) -> HashSet<String> {
        let expired: HashSet<String> = {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            let cutoff = chrono::TimeDelta::from_std(timeout).unwrap_or(chrono::TimeDelta::MAX);
            let expired: HashSet<String> = state
                .pending_new_games
                .iter()
                .filter(|(_, proposal)| now - proposal.create_time > cutoff)
                .map(|(id, _)| id.clone())
                .collect();

            for id in &expired {
                state.pending_new_games.remove(id);
            }
            expired
        };

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired pending game proposals");
            self.request_save(true).await;
        }
        expired
    }

    // --- Vote cache ---

    /// Record or retract a vote. Stamps the entry's mutation time and
    /// opportunistically sweeps stale entries.
    pub async fn update_vote(
        &self,
        group_id: &str,
        message_id: &str,
        emoji_id: u32,
        user_id: &str,
        is_add: bool,
    ) {
        {
            let mut state = self.state.lock().await;
            let entry = state
                .vote_cache
                .entry(group_id.to_string())
                .or_default()
                .entry(message_id.to_string())
                .or_default();

            let voters = entry.votes.entry(emoji_id.to_string()).or_default();
            if is_add {
                voters.insert(user_id.to_string());
            } else {
                voters.remove(user_id);
            }
            entry.timestamp = Some(Utc::now());

            Self::sweep_locked(&mut state, self.vote_ttl, self.sweep_interval);
        }
        self.request_save(false).await;
    }

    /// Cache the literal text of a custom input message.
    pub async fn set_custom_input_content(&self, group_id: &str, message_id: &str, content: &str) {
        {
            let mut state = self.state.lock().await;
            let entry = state
                .vote_cache
                .entry(group_id.to_string())
                .or_default()
                .entry(message_id.to_string())
                .or_default();
            entry.content = Some(content.to_string());
            if entry.timestamp.is_none() {
                entry.timestamp = Some(Utc::now());
            }
        }
        self.request_save(true).await;
    }

    /// Snapshot of one message's votes.
    pub async fn get_vote_item(&self, group_id: &str, message_id: &str) -> Option<VoteEntry> {
        let state = self.state.lock().await;
        state
            .vote_cache
            .get(group_id)
            .and_then(|group| group.get(message_id))
            .cloned()
    }

    /// Snapshot of a whole group's vote cache.
    pub async fn get_group_vote_cache(&self, group_id: &str) -> HashMap<String, VoteEntry> {
        let state = self.state.lock().await;
        state.vote_cache.get(group_id).cloned().unwrap_or_default()
    }

    pub async fn remove_vote_item(&self, group_id: &str, message_id: &str) {
        {
            let mut state = self.state.lock().await;
            if let Some(group) = state.vote_cache.get_mut(group_id) {
                group.remove(message_id);
            }
        }
        self.request_save(false).await;
    }

    pub async fn clear_group_vote_cache(&self, group_id: &str) {
        {
            let mut state = self.state.lock().await;
            if let Some(group) = state.vote_cache.get_mut(group_id) {
                group.clear();
            }
        }
        self.request_save(false).await;
    }

    /// Drop vote entries whose last mutation is older than the TTL. Public
    /// so the service loop can run it on a timer as well.
    pub async fn sweep_stale_votes(&self) {
        let mut state = self.state.lock().await;
        state.last_vote_sweep = None;
        Self::sweep_locked(&mut state, self.vote_ttl, self.sweep_interval);
    }

    fn sweep_locked(state: &mut CacheState, ttl: Duration, interval: Duration) {
        let due = state
            .last_vote_sweep
            .map(|at| at.elapsed() >= interval)
            .unwrap_or(true);
        if !due {
            return;
        }
        state.last_vote_sweep = Some(std::time::Instant::now());

        let now = Utc::now();
        let cutoff = chrono::TimeDelta::from_std(ttl).unwrap_or(chrono::TimeDelta::MAX);
        let mut removed = 0usize;
        for group in state.vote_cache.values_mut() {
            group.retain(|_, entry| {
                let stale = entry
                    .timestamp
                    .map(|stamp| now - stamp > cutoff)
                    .unwrap_or(false);
                if stale {
                    removed += 1;
                }
                !stale
            });
        }
        state.vote_cache.retain(|_, group| !group.is_empty());
        if removed > 0 {
            tracing::debug!(removed, "swept stale vote cache entries");
        }
    }

    // --- Web start tokens ---

    /// Mint a single-use token tying a web-submitted draft back to the
    /// requesting group and user.
    pub async fn issue_web_start_token(&self, group_id: &str, user_id: &str) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        let mut state = self.state.lock().await;
        state.web_start_tokens.insert(
            token.clone(),
            WebStartToken {
                group_id: group_id.to_string(),
                user_id: user_id.to_string(),
                create_time: Utc::now(),
            },
        );
        token
    }

    /// Consume a token, returning its `(group_id, user_id)` if it exists and
    /// has not expired. A consumed or expired token is gone either way.
    pub async fn take_web_start_token(&self, token: &str) -> Option<(String, String)> {
        let mut state = self.state.lock().await;
        let entry = state.web_start_tokens.remove(token)?;
        let cutoff =
            chrono::TimeDelta::from_std(self.web_token_ttl).unwrap_or(chrono::TimeDelta::MAX);
        if Utc::now() - entry.create_time > cutoff {
            return None;
        }
        Some((entry.group_id, entry.user_id))
    }

    // --- Persistence ---

    /// One-shot load from disk. Subsequent calls log and return.
    pub async fn load(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.loaded {
            tracing::warn!("cache already loaded, ignoring repeat load");
            return Ok(());
        }
        state.loaded = true;

        let _io = self.io.lock().await;
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(CacheError::Read(error.to_string()).into()),
        };

        let dump: CacheDump = serde_json::from_str(&raw).map_err(CacheError::Malformed)?;
        state.pending_new_games = dump.pending_new_games;
        state.vote_cache = dump.vote_cache;
        tracing::info!(path = %self.path.display(), "cache loaded from disk");
        Ok(())
    }

    /// Request a save. Plain requests coalesce into one deferred flush;
    /// forced requests cancel the deferred flush and write now.
    pub async fn request_save(&self, force: bool) {
        if force {
            {
                let mut save = self.save.lock().await;
                if let Some(handle) = save.pending.take() {
                    handle.abort();
                }
                save.requested = false;
            }
            self.write_to_disk().await;
            return;
        }

        let mut save = self.save.lock().await;
        save.requested = true;
        let running = save
            .pending
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        if running {
            return;
        }

        let weak = self.weak_self.clone();
        let delay = self.save_delay;
        save.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(cache) = weak.upgrade() else {
                return;
            };
            {
                let mut save = cache.save.lock().await;
                save.requested = false;
                save.pending = None;
            }
            cache.write_to_disk().await;
        }));
    }

    /// Drain any outstanding flush. Call before process exit.
    pub async fn shutdown(&self) {
        let (handle, requested) = {
            let mut save = self.save.lock().await;
            (save.pending.take(), save.requested)
        };

        if let Some(handle) = handle {
            if handle.await.is_err() {
                tracing::warn!("deferred cache flush died, writing once more");
                self.write_to_disk().await;
            }
        } else if requested {
            self.write_to_disk().await;
        }
    }

    async fn write_to_disk(&self) {
        let dump = {
            let state = self.state.lock().await;
            CacheDump {
                pending_new_games: state.pending_new_games.clone(),
                vote_cache: state.vote_cache.clone(),
            }
        };

        let _io = self.io.lock().await;
        let encoded = match serde_json::to_string_pretty(&dump) {
            Ok(encoded) => encoded,
            Err(error) => {
                tracing::error!(%error, "failed to serialize cache");
                return;
            }
        };
        // Recoverable: a failed write is retried by the next save request.
        if let Err(error) = tokio::fs::write(&self.path, encoded).await {
            tracing::error!(%error, path = %self.path.display(), "failed to write cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emoji;

    fn test_cache(dir: &std::path::Path) -> Arc<VolatileCache> {
        VolatileCache::new(
            dir.join("cache.json"),
            Duration::from_millis(10),
            Duration::from_secs(24 * 3600),
            Duration::ZERO,
            Duration::from_secs(600),
        )
    }

    #[tokio::test]
    async fn votes_are_idempotent_and_retractable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());

        cache.update_vote("g1", "m1", emoji::OPTION_A, "u1", true).await;
        cache.update_vote("g1", "m1", emoji::OPTION_A, "u1", true).await;
        let entry = cache.get_vote_item("g1", "m1").await.unwrap();
        assert_eq!(entry.voters(emoji::OPTION_A), 1);

        cache.update_vote("g1", "m1", emoji::OPTION_A, "u1", false).await;
        let entry = cache.get_vote_item("g1", "m1").await.unwrap();
        assert_eq!(entry.voters(emoji::OPTION_A), 0);
    }

    #[tokio::test]
    async fn snapshots_do_not_alias_cache_state() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());

        cache.update_vote("g1", "m1", emoji::OPTION_A, "u1", true).await;
        let mut snapshot = cache.get_group_vote_cache("g1").await;
        snapshot
            .get_mut("m1")
            .unwrap()
            .votes
            .get_mut(&emoji::OPTION_A.to_string())
            .unwrap()
            .insert("u2".to_string());

        let entry = cache.get_vote_item("g1", "m1").await.unwrap();
        assert_eq!(entry.voters(emoji::OPTION_A), 1);
    }

    #[tokio::test]
    async fn saved_state_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());

        cache
            .add_pending_game(
                "preview-1",
                PendingProposal {
                    user_id: "u1".to_string(),
                    system_prompt: "世界观: 废土".to_string(),
                    message_id: Some("origin-1".to_string()),
                    create_time: Utc::now(),
                },
            )
            .await;
        cache.update_vote("g1", "m1", emoji::OPTION_B, "u2", true).await;
        cache.set_custom_input_content("g1", "m2", "向北走").await;
        cache.request_save(true).await;

        let restored = test_cache(dir.path());
        restored.load().await.expect("load should succeed");

        let proposal = restored.get_pending_game("preview-1").await.unwrap();
        assert_eq!(proposal.user_id, "u1");
        assert_eq!(proposal.system_prompt, "世界观: 废土");

        let entry = restored.get_vote_item("g1", "m1").await.unwrap();
        assert_eq!(entry.voters(emoji::OPTION_B), 1);
        let custom = restored.get_vote_item("g1", "m2").await.unwrap();
        assert_eq!(custom.content.as_deref(), Some("向北走"));
    }

    #[tokio::test]
    async fn load_is_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        cache.update_vote("g1", "m1", emoji::OPTION_A, "u1", true).await;
        cache.request_save(true).await;

        let restored = test_cache(dir.path());
        restored.load().await.unwrap();
        // Mutate in memory, then attempt a second load; it must not clobber.
        restored.update_vote("g1", "m1", emoji::OPTION_A, "u9", true).await;
        restored.load().await.unwrap();
        let entry = restored.get_vote_item("g1", "m1").await.unwrap();
        assert_eq!(entry.voters(emoji::OPTION_A), 2);
    }

    #[tokio::test]
    async fn expired_proposals_are_removed_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());

        cache
            .add_pending_game(
                "old",
                PendingProposal {
                    user_id: "u1".to_string(),
                    system_prompt: "p".to_string(),
                    message_id: None,
                    create_time: Utc::now() - chrono::TimeDelta::seconds(600),
                },
            )
            .await;
        cache
            .add_pending_game(
                "fresh",
                PendingProposal {
                    user_id: "u2".to_string(),
                    system_prompt: "p".to_string(),
                    message_id: None,
                    create_time: Utc::now(),
                },
            )
            .await;

        let removed = cache
            .cleanup_expired_pending_games(Duration::from_secs(300))
            .await;

        assert!(removed.contains("old"));
        assert!(!removed.contains("fresh"));
        assert!(cache.get_pending_game("old").await.is_none());
        assert!(cache.get_pending_game("fresh").await.is_some());
    }

    #[tokio::test]
    async fn stale_vote_entries_are_swept_on_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VolatileCache::new(
            dir.path().join("cache.json"),
            Duration::from_millis(10),
            Duration::ZERO, // everything is immediately stale
            Duration::ZERO,
            Duration::from_secs(600),
        );

        cache.update_vote("g1", "old", emoji::OPTION_A, "u1", true).await;
        // The next mutation sweeps the previous (now stale) entry.
        cache.update_vote("g1", "new", emoji::OPTION_B, "u2", true).await;

        assert!(cache.get_vote_item("g1", "old").await.is_none());
    }

    #[tokio::test]
    async fn web_start_tokens_are_single_use() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());

        let token = cache.issue_web_start_token("g1", "u1").await;
        let (group, user) = cache.take_web_start_token(&token).await.unwrap();
        assert_eq!((group.as_str(), user.as_str()), ("g1", "u1"));
        assert!(cache.take_web_start_token(&token).await.is_none());
    }
}

//! The orchestrator: new-game startup, HEAD checkout, round advancement
//! under optimistic concurrency, revert, and branch surgery.

use crate::cache::VolatileCache;
use crate::channel_config::ChannelConfigStore;
use crate::content::ContentFetcher;
use crate::emoji;
use crate::engine::tally::TallyOutcome;
use crate::error::{EngineError, Error, LlmError, Result, StoreError};
use crate::gateway::{ChatGateway, Renderer, WebExposer};
use crate::llm::broker::{LlmBroker, LlmPreset};
use crate::llm::client::{ChatCompletion, ChatMessage, CompletionOutput};
use crate::store::Store;
use crate::{GameId, INITIAL_PARENT_ID, RoundId, SEED_PLAYER_CHOICE};
use std::sync::Arc;

/// Practically unbounded ancestor window for LLM history rebuilds.
const MAX_HISTORY_ROUNDS: i64 = 999_999;

/// Orchestrates every state change of a game.
pub struct GameEngine {
    store: Store,
    cache: Arc<VolatileCache>,
    broker: Arc<LlmBroker>,
    completion: Arc<dyn ChatCompletion>,
    renderer: Arc<dyn Renderer>,
    gateway: Arc<dyn ChatGateway>,
    content: Arc<ContentFetcher>,
    channel_flags: Arc<ChannelConfigStore>,
    web: Option<Arc<dyn WebExposer>>,
}

impl GameEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        cache: Arc<VolatileCache>,
        broker: Arc<LlmBroker>,
        completion: Arc<dyn ChatCompletion>,
        renderer: Arc<dyn Renderer>,
        gateway: Arc<dyn ChatGateway>,
        content: Arc<ContentFetcher>,
        channel_flags: Arc<ChannelConfigStore>,
        web: Option<Arc<dyn WebExposer>>,
    ) -> Self {
        Self {
            store,
            cache,
            broker,
            completion,
            renderer,
            gateway,
            content,
            channel_flags,
            web,
        }
    }

    /// The group's effective credentials: active binding if valid, else
    /// fallback.
    async fn resolve_preset(&self, group_id: &str) -> Result<LlmPreset> {
        let binding = self.broker.resolve(group_id).await.ok_or(LlmError::NoPreset)?;
        self.broker
            .resolve_preset(&binding)
            .await
            .ok_or_else(|| LlmError::NoPreset.into())
    }

    /// Create a game, ask the GM for the opening scene, and publish it.
    ///
    /// A failure anywhere after the insert deletes the game row again, so a
    /// botched start leaves no trace.
    pub async fn start_new_game(
        &self,
        group_id: &str,
        user_id: &str,
        system_prompt: &str,
    ) -> Result<()> {
        let game_id = self
            .store
            .create_game(group_id, user_id, system_prompt)
            .await?;
        tracing::info!(group_id, game_id, "new game created");

        match self.bootstrap_game(group_id, game_id, system_prompt).await {
            Ok(()) => Ok(()),
            Err(error) => {
                tracing::error!(game_id, %error, "failed to start new game");
                let _ = self
                    .gateway
                    .post_text(group_id, &format!("❌ 启动游戏失败: {error}"), None)
                    .await;
                if let Err(cleanup_error) = self.store.delete_game(game_id).await {
                    tracing::error!(game_id, %cleanup_error, "failed to clean up aborted game");
                } else {
                    tracing::info!(game_id, "cleaned up aborted game record");
                }
                Err(error)
            }
        }
    }

    async fn bootstrap_game(
        &self,
        group_id: &str,
        game_id: GameId,
        system_prompt: &str,
    ) -> Result<()> {
        self.gateway
            .post_text(group_id, "🚀 新游戏即将开始... 正在联系 GM 生成开场白...", None)
            .await?;

        let preset = self.resolve_preset(group_id).await?;
        let messages = [
            ChatMessage::system(system_prompt),
            ChatMessage::user(SEED_PLAYER_CHOICE),
        ];
        let output = self.completion.get_completion(&messages, &preset).await?;

        let usage = usage_json(&output);
        let round_id = self
            .store
            .create_round(
                game_id,
                INITIAL_PARENT_ID,
                SEED_PLAYER_CHOICE,
                &output.content,
                usage.as_ref(),
                Some(&output.model_name),
            )
            .await?;
        let branch_id = self.store.create_branch(game_id, "main", round_id).await?;
        self.store.update_game_head_branch(game_id, branch_id).await?;
        tracing::info!(game_id, round_id, branch_id, "seed round and main branch created");

        self.checkout_head(game_id).await
    }

    /// Publish the HEAD tip: clear the channel's votes, render the round,
    /// post it, record the new main message, and attach the reaction set.
    ///
    /// Idempotent; safe to call whenever the tip or HEAD moved.
    pub async fn checkout_head(&self, game_id: GameId) -> Result<()> {
        let (channel_id, tip_round_id) = self.store.head_tip(game_id).await?;
        let Some(channel_id) = channel_id else {
            return Err(EngineError::Other(anyhow::anyhow!(
                "game {game_id} is not attached to a channel"
            ))
            .into());
        };

        self.cache.clear_group_vote_cache(&channel_id).await;

        let round = self
            .store
            .get_round_info(tip_round_id)
            .await?
            .ok_or(StoreError::RoundNotFound { id: tip_round_id })?;

        let advanced = self.channel_flags.is_advanced_mode(&channel_id).await;
        let web_url = self.web.as_ref().and_then(|web| web.public_url());
        let main_message_id = if advanced && let Some(url) = web_url {
            self.gateway
                .post_text(
                    &channel_id,
                    &format!("📖 本轮剧情已更新，请在网页端查看:\n{url}/game/{game_id}"),
                    None,
                )
                .await?
        } else {
            let extra = round
                .prompt_tokens()
                .filter(|prompt_tokens| *prompt_tokens > 0)
                .map(|prompt_tokens| format!("{}k / 1M", ((prompt_tokens as f64) / 1000.0).round() as i64));
            let image = self
                .renderer
                .render_markdown(&round.assistant_response, extra.as_deref())
                .await?;
            self.gateway.post_image(&channel_id, &image).await?
        };

        self.store
            .update_game_main_message(game_id, &main_message_id)
            .await?;

        for emoji_id in emoji::MAIN_MESSAGE_REACTIONS {
            if let Err(error) = self
                .gateway
                .set_reaction(&main_message_id, emoji_id, true)
                .await
            {
                tracing::warn!(%main_message_id, emoji_id, %error, "failed to attach reaction");
            }
        }

        tracing::info!(game_id, %main_message_id, "checked out head");
        Ok(())
    }

    /// Advance the game by one round from a tallied ballot.
    ///
    /// The game is frozen for the duration; the tip is re-read inside the
    /// write transaction and the advancement is skipped if it moved
    /// (optimistic concurrency). Every completed path unfreezes; only
    /// cancellation mid-flight leaves the game frozen for an explicit admin
    /// unfreeze.
    pub async fn tally_and_advance(&self, game_id: GameId, outcome: &TallyOutcome) -> Result<()> {
        self.store.set_game_frozen_status(game_id, true).await?;
        let result = self.advance_frozen(game_id, outcome).await;
        if let Err(error) = self.store.set_game_frozen_status(game_id, false).await {
            tracing::error!(game_id, %error, "failed to unfreeze game");
        }
        result
    }

    async fn advance_frozen(&self, game_id: GameId, outcome: &TallyOutcome) -> Result<()> {
        let snapshot = self.store.snapshot_for_advance(game_id).await?;
        let Some(channel_id) = snapshot.channel_id.clone() else {
            return Err(EngineError::Other(anyhow::anyhow!(
                "game {game_id} is not attached to a channel"
            ))
            .into());
        };
        let reply_to = snapshot.main_message_id.as_deref();

        if outcome.scores.is_empty() {
            self.gateway
                .post_text(&channel_id, "无人投票，请继续投票后再确认。", reply_to)
                .await?;
            return Ok(());
        }

        let mut winner_lines = Vec::new();
        for winner in outcome.winners() {
            let is_letter = winner.len() == 1
                && winner
                    .chars()
                    .next()
                    .and_then(emoji::option_emoji)
                    .is_some();
            if is_letter {
                winner_lines.push(format!("选择选项 {winner}"));
            } else {
                winner_lines.push(
                    self.content
                        .custom_input_content(&channel_id, &winner)
                        .await,
                );
            }
        }
        let winner_content = winner_lines.join("\n");

        self.gateway
            .post_text(
                &channel_id,
                &format!(
                    "🏆 本轮胜出选项：{winner_content}\n{}",
                    outcome.result_lines.join("\n")
                ),
                reply_to,
            )
            .await?;

        let ancestors = self
            .store
            .get_round_ancestors(snapshot.initial_tip, MAX_HISTORY_ROUNDS)
            .await?;
        if ancestors.is_empty() {
            self.gateway
                .post_text(&channel_id, "构建对话历史失败，游戏中断。", None)
                .await?;
            return Err(EngineError::Other(anyhow::anyhow!(
                "round {} has no history",
                snapshot.initial_tip
            ))
            .into());
        }

        let mut messages = Vec::with_capacity(ancestors.len() * 2 + 2);
        messages.push(ChatMessage::system(&snapshot.system_prompt));
        for round in &ancestors {
            messages.push(ChatMessage::user(&round.player_choice));
            messages.push(ChatMessage::assistant(&round.assistant_response));
        }
        messages.push(ChatMessage::user(&winner_content));

        self.gateway
            .post_text(&channel_id, "🛠 GM 正在思考下一步剧情...", None)
            .await?;

        let preset = match self.resolve_preset(&channel_id).await {
            Ok(preset) => preset,
            Err(error) => {
                self.gateway
                    .post_text(&channel_id, "❌ 当前群组未绑定可用的 LLM 预设，无法推进。", None)
                    .await?;
                return Err(error);
            }
        };

        // The slow call happens outside any transaction.
        let output = match self.completion.get_completion(&messages, &preset).await {
            Ok(output) => output,
            Err(error) => {
                tracing::error!(game_id, %error, "GM call failed");
                self.gateway
                    .post_text(&channel_id, "GM没有回应，游戏中断。", None)
                    .await?;
                return Err(error);
            }
        };

        // Optimistic commit: the tip must not have moved while the GM was
        // thinking.
        let mut tx = self.store.begin().await?;
        let current_tip = Store::branch_tip_tx(&mut tx, snapshot.head_branch_id).await?;
        if current_tip != Some(snapshot.initial_tip) {
            drop(tx);
            tracing::info!(
                game_id,
                expected = snapshot.initial_tip,
                found = ?current_tip,
                "tip changed during advancement, skipping"
            );
            self.gateway
                .post_text(
                    &channel_id,
                    "本轮状态已变化，为避免并发冲突本次推进已取消。",
                    reply_to,
                )
                .await?;
            return Err(EngineError::TipChanged.into());
        }

        let usage = usage_json(&output);
        let new_round_id = Store::create_round_tx(
            &mut tx,
            game_id,
            snapshot.initial_tip,
            &winner_content,
            &output.content,
            usage.as_ref(),
            Some(&output.model_name),
        )
        .await?;
        Store::update_branch_tip_tx(&mut tx, snapshot.head_branch_id, new_round_id).await?;
        tx.commit()
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("failed to commit advancement: {e}")))?;

        tracing::info!(game_id, new_round_id, "advanced to new round");

        self.cache.clear_group_vote_cache(&channel_id).await;
        self.checkout_head(game_id).await
    }

    /// Move the HEAD branch back to the tip's parent and republish.
    ///
    /// The now-orphaned forward rounds stay in the store; a future reset can
    /// reach them again by id.
    pub async fn revert_last_round(&self, game_id: GameId) -> Result<()> {
        let (channel_id, tip_round_id) = self.store.head_tip(game_id).await?;
        let Some(channel_id) = channel_id else {
            return Err(EngineError::Other(anyhow::anyhow!(
                "game {game_id} is not attached to a channel"
            ))
            .into());
        };

        let round = self
            .store
            .get_round_info(tip_round_id)
            .await?
            .ok_or(StoreError::RoundNotFound { id: tip_round_id })?;

        if round.parent_id == INITIAL_PARENT_ID {
            self.gateway
                .post_text(&channel_id, "已经是第一轮了，无法再回退。", None)
                .await?;
            return Ok(());
        }

        let game = self
            .store
            .get_game_by_game_id(game_id)
            .await?
            .ok_or(StoreError::GameNotFound { id: game_id })?;
        let head_branch_id = game
            .head_branch_id
            .ok_or(StoreError::HeadBranchMissing { game_id })?;

        self.store
            .update_branch_tip(head_branch_id, round.parent_id)
            .await?;
        tracing::info!(game_id, round_id = round.parent_id, "reverted to previous round");

        self.gateway
            .post_text(&channel_id, "🔄 游戏已成功回退到上一轮。", None)
            .await?;
        self.cache.clear_group_vote_cache(&channel_id).await;
        self.checkout_head(game_id).await
    }

    /// Fork a new branch from `from_round_id`, defaulting to the HEAD tip.
    pub async fn create_new_branch(
        &self,
        game_id: GameId,
        name: &str,
        from_round_id: Option<RoundId>,
    ) -> Result<()> {
        let game = self
            .store
            .get_game_by_game_id(game_id)
            .await?
            .ok_or(StoreError::GameNotFound { id: game_id })?;

        let target_round_id = match from_round_id {
            Some(round_id) => round_id,
            None => self.store.head_tip(game_id).await?.1,
        };
        if self.store.get_round_info(target_round_id).await?.is_none() {
            return Err(StoreError::RoundNotFound {
                id: target_round_id,
            }
            .into());
        }

        self.store.create_branch(game_id, name, target_round_id).await?;
        tracing::info!(game_id, name, target_round_id, "branch created");

        if let Some(channel_id) = game.channel_id {
            self.gateway
                .post_text(
                    &channel_id,
                    &format!("🌿 已从回合 {target_round_id} 创建新分支: {name}"),
                    None,
                )
                .await?;
        }
        Ok(())
    }

    /// Point HEAD at another branch and republish its tip.
    pub async fn switch_branch(&self, game_id: GameId, branch_name: &str) -> Result<()> {
        let game = self
            .store
            .get_game_by_game_id(game_id)
            .await?
            .ok_or(StoreError::GameNotFound { id: game_id })?;

        let branch = self
            .store
            .get_branch_by_name(game_id, branch_name)
            .await?
            .ok_or_else(|| StoreError::BranchNotFound {
                name: branch_name.to_string(),
            })?;

        self.store
            .update_game_head_branch(game_id, branch.branch_id)
            .await?;
        tracing::info!(game_id, branch = branch_name, "HEAD switched");

        if let Some(channel_id) = game.channel_id {
            self.gateway
                .post_text(
                    &channel_id,
                    &format!("✅ 已切换到分支: {branch_name}。正在加载最新状态..."),
                    None,
                )
                .await?;
            self.checkout_head(game_id).await?;
        }
        Ok(())
    }

    /// Hard-reset the HEAD branch tip to a specific round and republish.
    pub async fn reset_current_branch(&self, game_id: GameId, round_id: RoundId) -> Result<()> {
        let game = self
            .store
            .get_game_by_game_id(game_id)
            .await?
            .ok_or(StoreError::GameNotFound { id: game_id })?;
        let head_branch_id = game
            .head_branch_id
            .ok_or(StoreError::HeadBranchMissing { game_id })?;

        if self.store.get_round_info(round_id).await?.is_none() {
            return Err(StoreError::RoundNotFound { id: round_id }.into());
        }

        self.store.update_branch_tip(head_branch_id, round_id).await?;
        tracing::info!(game_id, round_id, "HEAD branch reset");

        if let Some(channel_id) = game.channel_id {
            self.gateway
                .post_text(
                    &channel_id,
                    &format!("⏪ 当前分支已重置到回合 {round_id}。正在加载..."),
                    None,
                )
                .await?;
            self.checkout_head(game_id).await?;
        }
        Ok(())
    }
}

fn usage_json(output: &CompletionOutput) -> Option<serde_json::Value> {
    output
        .usage
        .as_ref()
        .and_then(|usage| serde_json::to_value(usage).ok())
}

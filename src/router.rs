//! Classifies incoming reaction and recall events and dispatches them to
//! the engine.
//!
//! A reaction is classified once, by the message it landed on, into a
//! [`ReactionTarget`]; the emoji id alone never decides anything (CONFIRM
//! and YAY share an id, as do DENY and NAY).

use crate::cache::VolatileCache;
use crate::emoji;
use crate::engine::{GameEngine, VoteTally};
use crate::error::{EngineError, Error, Result};
use crate::gateway::{AuthOracle, ChatGateway, StructuredMessage};
use crate::store::{GameRow, Store};
use crate::GameId;
use std::sync::Arc;
use std::time::Duration;

/// A reaction notice from the chat platform.
#[derive(Debug, Clone)]
pub struct ReactionEvent {
    pub group_id: String,
    pub message_id: String,
    pub user_id: String,
    pub emoji_id: u32,
    pub is_add: bool,
}

/// A message-recall notice from the chat platform.
#[derive(Debug, Clone)]
pub struct RecallEvent {
    pub group_id: String,
    pub message_id: String,
}

/// A group message replying to another message, as forwarded by the
/// platform adapter for custom-input detection.
#[derive(Debug, Clone)]
pub struct CustomInputSubmission {
    pub group_id: String,
    pub user_id: String,
    pub message_id: String,
    pub replied_to_message_id: String,
    pub text: String,
    pub mentions_bot: bool,
}

/// What a reaction is aimed at, resolved from one lookup pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionTarget {
    /// A pending new-game proposal preview.
    Proposal(String),
    /// The game's current main message.
    MainMessage(GameId),
    /// One of the game's custom input candidates.
    CustomInput(GameId, String),
}

enum CandidateRemoval {
    AdminCancel,
    AuthorRecall,
}

/// Routes chat events into engine operations.
pub struct ReactionRouter {
    store: Store,
    cache: Arc<VolatileCache>,
    engine: Arc<GameEngine>,
    tally: Arc<VoteTally>,
    gateway: Arc<dyn ChatGateway>,
    auth: Arc<dyn AuthOracle>,
    /// The bot's own user id; self-reactions are dropped.
    self_user_id: String,
    pending_timeout: Duration,
}

impl ReactionRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        cache: Arc<VolatileCache>,
        engine: Arc<GameEngine>,
        tally: Arc<VoteTally>,
        gateway: Arc<dyn ChatGateway>,
        auth: Arc<dyn AuthOracle>,
        self_user_id: String,
        pending_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            engine,
            tally,
            gateway,
            auth,
            self_user_id,
            pending_timeout,
        }
    }

    /// Entry point for reaction notices.
    pub async fn handle_reaction(&self, event: &ReactionEvent) -> Result<()> {
        if event.user_id == self.self_user_id {
            return Ok(());
        }

        let Some((target, game)) = self.classify(event).await? else {
            return Ok(());
        };

        match target {
            ReactionTarget::Proposal(preview_id) => {
                self.handle_proposal_reaction(event, &preview_id).await
            }
            ReactionTarget::MainMessage(_) | ReactionTarget::CustomInput(_, _) => {
                let Some(game) = game else {
                    return Ok(());
                };

                // Record the vote first, frozen or not; a reaction is never
                // lost.
                self.cache
                    .update_vote(
                        &event.group_id,
                        &event.message_id,
                        event.emoji_id,
                        &event.user_id,
                        event.is_add,
                    )
                    .await;

                if game.is_frozen {
                    return Ok(());
                }
                if !self.is_privileged(&event.group_id, &event.user_id, &game.host_user_id).await {
                    return Ok(());
                }

                match target {
                    ReactionTarget::MainMessage(game_id) => {
                        self.privileged_main_reaction(game_id, event).await
                    }
                    ReactionTarget::CustomInput(game_id, message_id)
                        if event.emoji_id == emoji::CANCEL && event.is_add =>
                    {
                        self.remove_candidate(
                            game_id,
                            &event.group_id,
                            &message_id,
                            CandidateRemoval::AdminCancel,
                        )
                        .await
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    /// Resolve what a reaction is aimed at. Unknown messages yield `None`.
    async fn classify(
        &self,
        event: &ReactionEvent,
    ) -> Result<Option<(ReactionTarget, Option<GameRow>)>> {
        if self.cache.get_pending_game(&event.message_id).await.is_some() {
            return Ok(Some((
                ReactionTarget::Proposal(event.message_id.clone()),
                None,
            )));
        }

        let Some(game) = self.store.get_game_by_channel_id(&event.group_id).await? else {
            return Ok(None);
        };

        if game.main_message_id.as_deref() == Some(event.message_id.as_str()) {
            let target = ReactionTarget::MainMessage(game.game_id);
            return Ok(Some((target, Some(game))));
        }
        if game.candidate_custom_input_ids.contains(&event.message_id) {
            let target = ReactionTarget::CustomInput(game.game_id, event.message_id.clone());
            return Ok(Some((target, Some(game))));
        }
        Ok(None)
    }

    /// root, group admin/owner, or the host of this channel's game.
    async fn is_privileged(&self, group_id: &str, user_id: &str, host_user_id: &str) -> bool {
        if self.auth.has_role(user_id, "root").await {
            return true;
        }
        match self.gateway.member_role(group_id, user_id).await {
            Ok(role) if role.is_moderator() => return true,
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(group_id, user_id, %error, "failed to look up member role");
            }
        }
        host_user_id == user_id
    }

    async fn handle_proposal_reaction(&self, event: &ReactionEvent, preview_id: &str) -> Result<()> {
        // Expire stale proposals in a batch; a racing reaction on one of
        // them observes its removal here and stops.
        let expired = self
            .cache
            .cleanup_expired_pending_games(self.pending_timeout)
            .await;
        if expired.contains(preview_id) {
            tracing::info!(preview_id, "proposal expired, ignoring reaction");
            return Ok(());
        }
        let Some(proposal) = self.cache.get_pending_game(preview_id).await else {
            return Ok(());
        };

        // Only the proposer may confirm or cancel, and only by adding.
        if event.user_id != proposal.user_id || !event.is_add {
            return Ok(());
        }

        match event.emoji_id {
            emoji::COFFEE => {
                if let Some(origin_id) = &proposal.message_id
                    && let Err(error) = self.gateway.delete_message(origin_id).await
                {
                    tracing::warn!(origin_id, %error, "failed to delete proposal origin");
                }
                let _ = self.gateway.set_reaction(preview_id, emoji::CONFIRM, false).await;
                let _ = self.gateway.set_reaction(preview_id, emoji::COFFEE, true).await;
                self.gateway
                    .post_structured(
                        &event.group_id,
                        &StructuredMessage {
                            text: " 新游戏创建已取消。".to_string(),
                            mention_user_id: Some(event.user_id.clone()),
                            reply_to: Some(preview_id.to_string()),
                        },
                    )
                    .await?;
                self.cache.remove_pending_game(preview_id).await;
                tracing::info!(user_id = %event.user_id, "new game proposal cancelled");
                Ok(())
            }
            emoji::CONFIRM => {
                if self.store.is_game_running(&event.group_id).await? {
                    self.gateway
                        .post_structured(
                            &event.group_id,
                            &StructuredMessage {
                                text: " 当前已有正在进行的游戏，无法创建新游戏。".to_string(),
                                mention_user_id: Some(event.user_id.clone()),
                                reply_to: Some(preview_id.to_string()),
                            },
                        )
                        .await?;
                    let _ = self.gateway.set_reaction(preview_id, emoji::COFFEE, true).await;
                    let _ = self.gateway.set_reaction(preview_id, emoji::CONFIRM, false).await;
                    return Ok(());
                }

                let _ = self.gateway.set_reaction(preview_id, emoji::CONFIRM, true).await;
                let _ = self.gateway.set_reaction(preview_id, emoji::COFFEE, false).await;
                self.cache.remove_pending_game(preview_id).await;

                if let Err(error) = self
                    .engine
                    .start_new_game(&event.group_id, &proposal.user_id, &proposal.system_prompt)
                    .await
                {
                    // The engine already told the channel; nothing to add.
                    tracing::error!(group_id = %event.group_id, %error, "new game failed to start");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn privileged_main_reaction(&self, game_id: GameId, event: &ReactionEvent) -> Result<()> {
        if !event.is_add {
            return Ok(());
        }

        // Re-read: the freeze may have landed since classification.
        let Some(game) = self.store.get_game_by_game_id(game_id).await? else {
            return Ok(());
        };
        if game.is_frozen {
            self.gateway
                .post_text(
                    &event.group_id,
                    "正在处理其他操作，请稍后再试。",
                    Some(&event.message_id),
                )
                .await?;
            return Ok(());
        }

        match event.emoji_id {
            emoji::CONFIRM => {
                let outcome = self
                    .tally
                    .tally(&event.group_id, &event.message_id, &game.candidate_custom_input_ids)
                    .await;
                match self.engine.tally_and_advance(game_id, &outcome).await {
                    Ok(()) => {}
                    // Benign: the other confirmer won; the channel was told.
                    Err(Error::Engine(EngineError::TipChanged)) => {}
                    Err(error) => {
                        tracing::error!(game_id, %error, "advancement failed");
                    }
                }
                Ok(())
            }
            emoji::DENY => {
                let outcome = self
                    .tally
                    .tally(&event.group_id, &event.message_id, &game.candidate_custom_input_ids)
                    .await;
                self.gateway
                    .post_text(
                        &event.group_id,
                        &format!(
                            "{}\n由于一位管理员/主持人的反对票，本轮投票并未获通过，将重新开始本轮。",
                            outcome.result_lines.join("\n")
                        ),
                        Some(&event.message_id),
                    )
                    .await?;
                self.cache.clear_group_vote_cache(&event.group_id).await;
                self.engine.checkout_head(game_id).await
            }
            emoji::RETRACT => self.engine.revert_last_round(game_id).await,
            _ => Ok(()),
        }
    }

    async fn remove_candidate(
        &self,
        game_id: GameId,
        group_id: &str,
        message_id: &str,
        reason: CandidateRemoval,
    ) -> Result<()> {
        let Some(game) = self.store.get_game_by_game_id(game_id).await? else {
            return Ok(());
        };

        let mut candidates = game.candidate_custom_input_ids;
        let Some(position) = candidates.iter().position(|id| id == message_id) else {
            return Ok(());
        };
        candidates.remove(position);
        self.store
            .update_candidate_custom_input_ids(game_id, &candidates)
            .await?;

        match reason {
            CandidateRemoval::AdminCancel => {
                self.gateway
                    .post_text(
                        group_id,
                        " 由于一名管理员/主持人的撤回，该条回复将不会被计入投票",
                        Some(message_id),
                    )
                    .await?;
            }
            CandidateRemoval::AuthorRecall => {
                self.gateway
                    .post_text(
                        group_id,
                        "一条候选回复已被作者撤回，将不计入投票。",
                        game.main_message_id.as_deref(),
                    )
                    .await?;
            }
        }

        self.cache.remove_vote_item(group_id, message_id).await;
        tracing::info!(game_id, message_id, "candidate custom input removed");
        Ok(())
    }

    /// Entry point for message-recall notices: a recalled candidate is
    /// removed as if an admin had cancelled it.
    pub async fn handle_recall(&self, event: &RecallEvent) -> Result<()> {
        let Some(game) = self.store.get_game_by_channel_id(&event.group_id).await? else {
            return Ok(());
        };
        if !game.candidate_custom_input_ids.contains(&event.message_id) {
            return Ok(());
        }
        self.remove_candidate(
            game.game_id,
            &event.group_id,
            &event.message_id,
            CandidateRemoval::AuthorRecall,
        )
        .await
    }

    /// Entry point for group messages that reply to another message: a
    /// reply-with-mention to the current main message joins the ballot.
    pub async fn handle_custom_input_submission(
        &self,
        submission: &CustomInputSubmission,
    ) -> Result<()> {
        if !submission.mentions_bot {
            return Ok(());
        }

        let Some(game) = self
            .store
            .get_game_by_channel_id(&submission.group_id)
            .await?
        else {
            return Ok(());
        };
        if game.main_message_id.as_deref() != Some(submission.replied_to_message_id.as_str()) {
            return Ok(());
        }

        let mut candidates = game.candidate_custom_input_ids;
        candidates.push(submission.message_id.clone());
        self.store
            .update_candidate_custom_input_ids(game.game_id, &candidates)
            .await?;
        self.cache
            .set_custom_input_content(
                &submission.group_id,
                &submission.message_id,
                submission.text.trim(),
            )
            .await;
        tracing::info!(
            game_id = game.game_id,
            message_id = %submission.message_id,
            "custom input joined the ballot"
        );

        for emoji_id in emoji::CUSTOM_INPUT_REACTIONS {
            if let Err(error) = self
                .gateway
                .set_reaction(&submission.message_id, emoji_id, true)
                .await
            {
                tracing::warn!(
                    message_id = %submission.message_id,
                    emoji_id,
                    %error,
                    "failed to attach vote reaction"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PendingProposal;
    use crate::gateway::MemberRole;
    use crate::testing::{Harness, StaticAuth, harness};

    const SELF_ID: &str = "bot";

    fn router(h: &Harness, auth: Arc<StaticAuth>) -> ReactionRouter {
        ReactionRouter::new(
            h.store.clone(),
            h.cache.clone(),
            h.engine.clone(),
            h.tally.clone(),
            h.gateway.clone(),
            auth,
            SELF_ID.to_string(),
            Duration::from_secs(300),
        )
    }

    fn reaction(message_id: &str, user_id: &str, emoji_id: u32) -> ReactionEvent {
        ReactionEvent {
            group_id: "g1".to_string(),
            message_id: message_id.to_string(),
            user_id: user_id.to_string(),
            emoji_id,
            is_add: true,
        }
    }

    async fn started_game(h: &Harness) -> (i64, String) {
        h.completion.push_ok("开场白", 100);
        h.engine.start_new_game("g1", "u1", "剧本").await.unwrap();
        let game = h.store.get_game_by_channel_id("g1").await.unwrap().unwrap();
        (game.game_id, game.main_message_id.unwrap())
    }

    #[tokio::test]
    async fn member_votes_are_recorded_without_action() {
        let h = harness().await;
        let router = router(&h, Arc::new(StaticAuth::default()));
        let (game_id, main) = started_game(&h).await;

        router
            .handle_reaction(&reaction(&main, "u5", emoji::OPTION_A))
            .await
            .unwrap();

        let entry = h.cache.get_vote_item("g1", &main).await.unwrap();
        assert_eq!(entry.voters(emoji::OPTION_A), 1);
        // No advancement happened.
        assert_eq!(h.store.get_all_rounds_for_game(game_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn votes_survive_a_frozen_game_but_controls_do_not_fire() {
        let h = harness().await;
        let router = router(&h, Arc::new(StaticAuth::default()));
        let (game_id, main) = started_game(&h).await;
        h.store.set_game_frozen_status(game_id, true).await.unwrap();
        h.gateway.set_role("g1", "admin", MemberRole::Admin);

        router
            .handle_reaction(&reaction(&main, "admin", emoji::CONFIRM))
            .await
            .unwrap();

        // The reaction is cached even though the game is frozen.
        let entry = h.cache.get_vote_item("g1", &main).await.unwrap();
        assert_eq!(entry.voters(emoji::CONFIRM), 1);
        // No new round was appended.
        assert_eq!(h.store.get_all_rounds_for_game(game_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reactions_on_unknown_messages_are_ignored() {
        let h = harness().await;
        let router = router(&h, Arc::new(StaticAuth::default()));
        started_game(&h).await;

        router
            .handle_reaction(&reaction("unrelated", "u5", emoji::OPTION_A))
            .await
            .unwrap();
        assert!(h.cache.get_vote_item("g1", "unrelated").await.is_none());
    }

    #[tokio::test]
    async fn self_reactions_are_ignored() {
        let h = harness().await;
        let router = router(&h, Arc::new(StaticAuth::default()));
        let (_, main) = started_game(&h).await;

        router
            .handle_reaction(&reaction(&main, SELF_ID, emoji::OPTION_A))
            .await
            .unwrap();
        assert!(h.cache.get_vote_item("g1", &main).await.is_none());
    }

    #[tokio::test]
    async fn admin_confirm_tallies_and_advances() {
        let h = harness().await;
        let router = router(&h, Arc::new(StaticAuth::default()));
        let (game_id, main) = started_game(&h).await;
        h.gateway.set_role("g1", "admin", MemberRole::Admin);

        router
            .handle_reaction(&reaction(&main, "u2", emoji::OPTION_A))
            .await
            .unwrap();

        h.completion.push_ok("第二幕", 200);
        router
            .handle_reaction(&reaction(&main, "admin", emoji::CONFIRM))
            .await
            .unwrap();

        let rounds = h.store.get_all_rounds_for_game(game_id).await.unwrap();
        assert_eq!(rounds.len(), 2);
        let (_, tip) = h.store.head_tip(game_id).await.unwrap();
        let new_round = h.store.get_round_info(tip).await.unwrap().unwrap();
        assert_eq!(new_round.player_choice, "选择选项 A");
    }

    #[tokio::test]
    async fn host_is_privileged_without_platform_role() {
        let h = harness().await;
        let router = router(&h, Arc::new(StaticAuth::default()));
        let (game_id, main) = started_game(&h).await;

        router
            .handle_reaction(&reaction(&main, "u2", emoji::OPTION_B))
            .await
            .unwrap();
        h.completion.push_ok("第二幕", 200);
        // u1 is the host.
        router
            .handle_reaction(&reaction(&main, "u1", emoji::CONFIRM))
            .await
            .unwrap();

        assert_eq!(h.store.get_all_rounds_for_game(game_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unprivileged_confirm_only_counts_as_a_vote() {
        let h = harness().await;
        let router = router(&h, Arc::new(StaticAuth::default()));
        let (game_id, main) = started_game(&h).await;

        router
            .handle_reaction(&reaction(&main, "u9", emoji::CONFIRM))
            .await
            .unwrap();

        assert_eq!(h.store.get_all_rounds_for_game(game_id).await.unwrap().len(), 1);
        let entry = h.cache.get_vote_item("g1", &main).await.unwrap();
        assert_eq!(entry.voters(emoji::CONFIRM), 1);
    }

    #[tokio::test]
    async fn deny_reports_clears_and_republishes() {
        let h = harness().await;
        let router = router(&h, Arc::new(StaticAuth::default()));
        let (game_id, main) = started_game(&h).await;
        h.gateway.set_role("g1", "admin", MemberRole::Admin);

        router
            .handle_reaction(&reaction(&main, "u2", emoji::OPTION_A))
            .await
            .unwrap();
        router
            .handle_reaction(&reaction(&main, "admin", emoji::DENY))
            .await
            .unwrap();

        // Same tip, fresh main message, votes gone.
        assert_eq!(h.store.get_all_rounds_for_game(game_id).await.unwrap().len(), 1);
        let game = h.store.get_game_by_game_id(game_id).await.unwrap().unwrap();
        assert_ne!(game.main_message_id.as_deref(), Some(main.as_str()));
        assert!(h.cache.get_vote_item("g1", &main).await.is_none());
        assert!(h
            .gateway
            .posted_texts()
            .iter()
            .any(|text| text.contains("反对票")));
    }

    #[tokio::test]
    async fn retract_reverts_the_last_round() {
        let h = harness().await;
        let router = router(&h, Arc::new(StaticAuth::default()));
        let (game_id, main) = started_game(&h).await;
        h.gateway.set_role("g1", "admin", MemberRole::Admin);

        router
            .handle_reaction(&reaction(&main, "u2", emoji::OPTION_A))
            .await
            .unwrap();
        h.completion.push_ok("第二幕", 200);
        router
            .handle_reaction(&reaction(&main, "admin", emoji::CONFIRM))
            .await
            .unwrap();
        let (_, advanced_tip) = h.store.head_tip(game_id).await.unwrap();

        let game = h.store.get_game_by_game_id(game_id).await.unwrap().unwrap();
        let new_main = game.main_message_id.unwrap();
        router
            .handle_reaction(&reaction(&new_main, "admin", emoji::RETRACT))
            .await
            .unwrap();

        let (_, tip) = h.store.head_tip(game_id).await.unwrap();
        assert_ne!(tip, advanced_tip);
        assert!(h.store.get_round_info(advanced_tip).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn custom_input_submission_joins_the_ballot() {
        let h = harness().await;
        let router = router(&h, Arc::new(StaticAuth::default()));
        let (game_id, main) = started_game(&h).await;

        router
            .handle_custom_input_submission(&CustomInputSubmission {
                group_id: "g1".to_string(),
                user_id: "u3".to_string(),
                message_id: "ci1".to_string(),
                replied_to_message_id: main.clone(),
                text: "向北走".to_string(),
                mentions_bot: true,
            })
            .await
            .unwrap();

        let game = h.store.get_game_by_game_id(game_id).await.unwrap().unwrap();
        assert_eq!(game.candidate_custom_input_ids, vec!["ci1".to_string()]);
        let entry = h.cache.get_vote_item("g1", "ci1").await.unwrap();
        assert_eq!(entry.content.as_deref(), Some("向北走"));
        let reactions = h.gateway.reactions_on("ci1");
        assert_eq!(reactions, emoji::CUSTOM_INPUT_REACTIONS.to_vec());

        // A reply without a mention is not a submission.
        router
            .handle_custom_input_submission(&CustomInputSubmission {
                group_id: "g1".to_string(),
                user_id: "u3".to_string(),
                message_id: "ci2".to_string(),
                replied_to_message_id: main,
                text: "别理我".to_string(),
                mentions_bot: false,
            })
            .await
            .unwrap();
        let game = h.store.get_game_by_game_id(game_id).await.unwrap().unwrap();
        assert_eq!(game.candidate_custom_input_ids.len(), 1);
    }

    #[tokio::test]
    async fn admin_cancel_removes_a_candidate() {
        let h = harness().await;
        let router = router(&h, Arc::new(StaticAuth::default()));
        let (game_id, main) = started_game(&h).await;
        h.gateway.set_role("g1", "admin", MemberRole::Admin);

        router
            .handle_custom_input_submission(&CustomInputSubmission {
                group_id: "g1".to_string(),
                user_id: "u3".to_string(),
                message_id: "ci1".to_string(),
                replied_to_message_id: main,
                text: "向北走".to_string(),
                mentions_bot: true,
            })
            .await
            .unwrap();

        router
            .handle_reaction(&reaction("ci1", "admin", emoji::CANCEL))
            .await
            .unwrap();

        let game = h.store.get_game_by_game_id(game_id).await.unwrap().unwrap();
        assert!(game.candidate_custom_input_ids.is_empty());
        assert!(h.cache.get_vote_item("g1", "ci1").await.is_none());
    }

    #[tokio::test]
    async fn recalled_candidates_drop_off_the_ballot() {
        let h = harness().await;
        let router = router(&h, Arc::new(StaticAuth::default()));
        let (game_id, main) = started_game(&h).await;

        router
            .handle_custom_input_submission(&CustomInputSubmission {
                group_id: "g1".to_string(),
                user_id: "u3".to_string(),
                message_id: "ci1".to_string(),
                replied_to_message_id: main,
                text: "向北走".to_string(),
                mentions_bot: true,
            })
            .await
            .unwrap();

        router
            .handle_recall(&RecallEvent {
                group_id: "g1".to_string(),
                message_id: "ci1".to_string(),
            })
            .await
            .unwrap();

        let game = h.store.get_game_by_game_id(game_id).await.unwrap().unwrap();
        assert!(game.candidate_custom_input_ids.is_empty());
        assert!(h
            .gateway
            .posted_texts()
            .iter()
            .any(|text| text.contains("已被作者撤回")));
    }

    #[tokio::test]
    async fn proposal_confirm_starts_the_game() {
        let h = harness().await;
        let router = router(&h, Arc::new(StaticAuth::default()));

        h.cache
            .add_pending_game(
                "preview",
                PendingProposal {
                    user_id: "u1".to_string(),
                    system_prompt: "世界观: 废土".to_string(),
                    message_id: Some("origin".to_string()),
                    create_time: chrono::Utc::now(),
                },
            )
            .await;

        // A different user's confirm is ignored.
        h.completion.push_ok("开场白", 100);
        router
            .handle_reaction(&reaction("preview", "u2", emoji::CONFIRM))
            .await
            .unwrap();
        assert!(h.store.get_game_by_channel_id("g1").await.unwrap().is_none());

        router
            .handle_reaction(&reaction("preview", "u1", emoji::CONFIRM))
            .await
            .unwrap();

        let game = h.store.get_game_by_channel_id("g1").await.unwrap().unwrap();
        assert_eq!(game.host_user_id, "u1");
        assert_eq!(game.system_prompt, "世界观: 废土");
        assert!(h.cache.get_pending_game("preview").await.is_none());
    }

    #[tokio::test]
    async fn proposal_coffee_cancels_and_deletes_the_origin() {
        let h = harness().await;
        let router = router(&h, Arc::new(StaticAuth::default()));

        h.cache
            .add_pending_game(
                "preview",
                PendingProposal {
                    user_id: "u1".to_string(),
                    system_prompt: "剧本".to_string(),
                    message_id: Some("origin".to_string()),
                    create_time: chrono::Utc::now(),
                },
            )
            .await;

        router
            .handle_reaction(&reaction("preview", "u1", emoji::COFFEE))
            .await
            .unwrap();

        assert!(h.cache.get_pending_game("preview").await.is_none());
        assert_eq!(h.gateway.deleted.lock().unwrap().as_slice(), ["origin"]);
        assert!(h.store.get_game_by_channel_id("g1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_proposals_ignore_reactions() {
        let h = harness().await;
        let router = router(&h, Arc::new(StaticAuth::default()));

        h.cache
            .add_pending_game(
                "preview",
                PendingProposal {
                    user_id: "u1".to_string(),
                    system_prompt: "剧本".to_string(),
                    message_id: None,
                    create_time: chrono::Utc::now() - chrono::TimeDelta::seconds(600),
                },
            )
            .await;

        router
            .handle_reaction(&reaction("preview", "u1", emoji::CONFIRM))
            .await
            .unwrap();

        assert!(h.store.get_game_by_channel_id("g1").await.unwrap().is_none());
        assert!(h.cache.get_pending_game("preview").await.is_none());
    }

    #[tokio::test]
    async fn confirm_on_a_busy_channel_flips_to_coffee() {
        let h = harness().await;
        let router = router(&h, Arc::new(StaticAuth::default()));
        started_game(&h).await;

        h.cache
            .add_pending_game(
                "preview",
                PendingProposal {
                    user_id: "u2".to_string(),
                    system_prompt: "另一个剧本".to_string(),
                    message_id: None,
                    create_time: chrono::Utc::now(),
                },
            )
            .await;

        router
            .handle_reaction(&reaction("preview", "u2", emoji::CONFIRM))
            .await
            .unwrap();

        // The proposal survives; the existing game is untouched.
        assert!(h.cache.get_pending_game("preview").await.is_some());
        let game = h.store.get_game_by_channel_id("g1").await.unwrap().unwrap();
        assert_eq!(game.host_user_id, "u1");
        assert!(h
            .gateway
            .posted_texts()
            .iter()
            .any(|text| text.contains("已有正在进行的游戏")));
    }
}

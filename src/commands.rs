//! Translates parsed command invocations into engine, store, and broker
//! calls, enforcing the permission tiers.
//!
//! Command-string parsing lives with the platform adapter; this surface
//! receives [`Command`] / [`PrivateCommand`] values and posts results back
//! through the gateway. Permission tiers, highest first: root (from the
//! auth oracle), group admin/owner (from the platform), then the host of
//! the channel's current game.

use crate::cache::{PendingProposal, VolatileCache};
use crate::channel_config::ChannelConfigStore;
use crate::emoji;
use crate::engine::GameEngine;
use crate::error::{Error, Result, StoreError};
use crate::gateway::{
    AuthOracle, ChatGateway, ForwardBundle, ForwardNode, MemberRole, Renderer, StructuredMessage,
    Visualizer, WebExposer,
};
use crate::llm::broker::{LlmBroker, mask_key, parse_duration};
use crate::llm::client::ChatCompletion;
use crate::store::{RoundRow, Store};
use crate::{GameId, RoundId};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

/// Names for branches and tags: 1–50 chars of `[A-Za-z0-9_-]`, with the
/// literal `head` reserved.
static NAME_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9_-]{1,50}$").expect("name pattern compiles"));

pub fn is_valid_name(name: &str) -> bool {
    name != "head" && NAME_PATTERN.is_match(name)
}

/// A parsed group-channel command.
#[derive(Debug, Clone)]
pub enum Command {
    Help,
    Status,
    WebUi,
    Start { system_prompt: Option<String> },
    GameList,
    GameAttach { game_id: GameId },
    GameDetach,
    GameSetHost { new_host_id: String, game_id: Option<GameId> },
    BranchList { all: bool },
    BranchShow { name: String },
    BranchHistory { name: Option<String>, limit: Option<usize> },
    BranchCreate { name: String, from_round_id: Option<RoundId> },
    BranchRename { old_name: String, new_name: String },
    BranchDelete { name: String },
    CheckoutHead,
    Checkout { branch_name: String },
    Reset { round_id: RoundId },
    RoundShow { round_id: RoundId },
    RoundHistory { round_id: RoundId, limit: Option<usize> },
    TagList,
    TagShow { name: String },
    TagHistory { name: String, limit: Option<usize> },
    TagCreate { name: String, round_id: Option<RoundId> },
    TagDelete { name: String },
    AdminUnfreeze,
    AdminDeleteGame { game_id: GameId },
    AdminRefreshTunnel,
    AdminClearHelpCache,
    AdminClearPendingProposals,
    AdvancedMode { action: AdvancedModeAction },
    LlmStatus,
    LlmBind { preset_name: String, duration: Option<String> },
    LlmUnbind,
    LlmSetFallback { preset_name: String },
    LlmClearFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvancedModeAction {
    Enable,
    Disable,
    Status,
}

/// A parsed private-message command (preset management).
#[derive(Debug, Clone)]
pub enum PrivateCommand {
    LlmAdd {
        name: String,
        model: String,
        base_url: String,
        api_key: String,
        force: bool,
    },
    LlmRemove { name: String },
    LlmTest { name: String },
    LlmList,
}

/// Who issued a group command, and from where.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub group_id: String,
    pub user_id: String,
    /// Role reported by the platform alongside the message, if any.
    pub sender_role: Option<MemberRole>,
    /// The command message itself, for replies.
    pub message_id: Option<String>,
}

/// The command dispatcher.
pub struct CommandSurface {
    store: Store,
    engine: Arc<GameEngine>,
    cache: Arc<VolatileCache>,
    broker: Arc<LlmBroker>,
    completion: Arc<dyn ChatCompletion>,
    renderer: Arc<dyn Renderer>,
    visualizer: Arc<dyn Visualizer>,
    gateway: Arc<dyn ChatGateway>,
    auth: Arc<dyn AuthOracle>,
    channel_flags: Arc<ChannelConfigStore>,
    web: Option<Arc<dyn WebExposer>>,
    history_limit: usize,
}

impl CommandSurface {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        engine: Arc<GameEngine>,
        cache: Arc<VolatileCache>,
        broker: Arc<LlmBroker>,
        completion: Arc<dyn ChatCompletion>,
        renderer: Arc<dyn Renderer>,
        visualizer: Arc<dyn Visualizer>,
        gateway: Arc<dyn ChatGateway>,
        auth: Arc<dyn AuthOracle>,
        channel_flags: Arc<ChannelConfigStore>,
        web: Option<Arc<dyn WebExposer>>,
        history_limit: usize,
    ) -> Self {
        Self {
            store,
            engine,
            cache,
            broker,
            completion,
            renderer,
            visualizer,
            gateway,
            auth,
            channel_flags,
            web,
            history_limit,
        }
    }

    // --- Permissions ---

    /// root, group admin/owner, or host of this channel's game.
    async fn check_channel_permission(&self, ctx: &CommandContext) -> Result<bool> {
        if self.has_root_or_admin(ctx).await {
            return Ok(true);
        }
        let game = self.store.get_game_by_channel_id(&ctx.group_id).await?;
        Ok(game.is_some_and(|game| game.host_user_id == ctx.user_id))
    }

    async fn has_root_or_admin(&self, ctx: &CommandContext) -> bool {
        if self.auth.has_role(&ctx.user_id, "root").await {
            return true;
        }
        ctx.sender_role.is_some_and(MemberRole::is_moderator)
    }

    async fn is_root(&self, user_id: &str) -> bool {
        self.auth.has_role(user_id, "root").await
    }

    async fn reply(&self, ctx: &CommandContext, text: &str) -> Result<()> {
        self.gateway
            .post_text(&ctx.group_id, text, ctx.message_id.as_deref())
            .await?;
        Ok(())
    }

    async fn deny(&self, ctx: &CommandContext, requirement: &str) -> Result<()> {
        self.reply(ctx, &format!("权限不足。{requirement}")).await
    }

    /// The channel's game, or a friendly notice and `None`.
    async fn channel_game(&self, ctx: &CommandContext) -> Result<Option<crate::store::GameRow>> {
        let game = self.store.get_game_by_channel_id(&ctx.group_id).await?;
        if game.is_none() {
            self.reply(ctx, "当前频道没有正在进行的游戏。").await?;
        }
        Ok(game)
    }

    // --- Dispatch ---

    pub async fn dispatch(&self, ctx: &CommandContext, command: Command) -> Result<()> {
        match command {
            Command::Help => self.handle_help(ctx).await,
            Command::Status => self.handle_status(ctx).await,
            Command::WebUi => self.handle_webui(ctx).await,
            Command::Start { system_prompt } => self.handle_start(ctx, system_prompt).await,
            Command::GameList => self.handle_game_list(ctx).await,
            Command::GameAttach { game_id } => self.handle_game_attach(ctx, game_id).await,
            Command::GameDetach => self.handle_game_detach(ctx).await,
            Command::GameSetHost { new_host_id, game_id } => {
                self.handle_game_set_host(ctx, &new_host_id, game_id).await
            }
            Command::BranchList { all } => self.handle_branch_list(ctx, all).await,
            Command::BranchShow { name } => self.handle_branch_show(ctx, &name).await,
            Command::BranchHistory { name, limit } => {
                self.handle_branch_history(ctx, name.as_deref(), limit).await
            }
            Command::BranchCreate { name, from_round_id } => {
                self.handle_branch_create(ctx, &name, from_round_id).await
            }
            Command::BranchRename { old_name, new_name } => {
                self.handle_branch_rename(ctx, &old_name, &new_name).await
            }
            Command::BranchDelete { name } => self.handle_branch_delete(ctx, &name).await,
            Command::CheckoutHead => self.handle_checkout_head(ctx).await,
            Command::Checkout { branch_name } => self.handle_checkout(ctx, &branch_name).await,
            Command::Reset { round_id } => self.handle_reset(ctx, round_id).await,
            Command::RoundShow { round_id } => self.handle_round_show(ctx, round_id).await,
            Command::RoundHistory { round_id, limit } => {
                self.handle_round_history(ctx, round_id, limit).await
            }
            Command::TagList => self.handle_tag_list(ctx).await,
            Command::TagShow { name } => self.handle_tag_show(ctx, &name).await,
            Command::TagHistory { name, limit } => self.handle_tag_history(ctx, &name, limit).await,
            Command::TagCreate { name, round_id } => {
                self.handle_tag_create(ctx, &name, round_id).await
            }
            Command::TagDelete { name } => self.handle_tag_delete(ctx, &name).await,
            Command::AdminUnfreeze => self.handle_admin_unfreeze(ctx).await,
            Command::AdminDeleteGame { game_id } => {
                self.handle_admin_delete_game(ctx, game_id).await
            }
            Command::AdminRefreshTunnel => self.handle_admin_refresh_tunnel(ctx).await,
            Command::AdminClearHelpCache => self.handle_admin_clear_help_cache(ctx).await,
            Command::AdminClearPendingProposals => {
                self.handle_admin_clear_pending(ctx).await
            }
            Command::AdvancedMode { action } => self.handle_advanced_mode(ctx, action).await,
            Command::LlmStatus => self.handle_llm_status(ctx).await,
            Command::LlmBind { preset_name, duration } => {
                self.handle_llm_bind(ctx, &preset_name, duration.as_deref()).await
            }
            Command::LlmUnbind => self.handle_llm_unbind(ctx).await,
            Command::LlmSetFallback { preset_name } => {
                self.handle_llm_set_fallback(ctx, &preset_name).await
            }
            Command::LlmClearFallback => self.handle_llm_clear_fallback(ctx).await,
        }
    }

    pub async fn dispatch_private(&self, user_id: &str, command: PrivateCommand) -> Result<()> {
        match command {
            PrivateCommand::LlmAdd { name, model, base_url, api_key, force } => {
                self.handle_llm_add(user_id, &name, &model, &base_url, &api_key, force)
                    .await
            }
            PrivateCommand::LlmRemove { name } => self.handle_llm_remove(user_id, &name).await,
            PrivateCommand::LlmTest { name } => self.handle_llm_test(user_id, &name).await,
            PrivateCommand::LlmList => self.handle_llm_list(user_id).await,
        }
    }

    // --- Plain queries ---

    async fn handle_help(&self, ctx: &CommandContext) -> Result<()> {
        match self.renderer.render_help_page().await {
            Ok(image) => {
                self.gateway.post_image(&ctx.group_id, &image).await?;
            }
            Err(error) => {
                tracing::error!(%error, "failed to render help page");
                self.reply(ctx, "❌ 生成帮助图片失败，请检查日志。").await?;
            }
        }
        Ok(())
    }

    async fn handle_status(&self, ctx: &CommandContext) -> Result<()> {
        let Some(game) = self.channel_game(ctx).await? else {
            return Ok(());
        };

        let mut text = format!(
            "游戏状态：\n- 游戏ID: {}\n- 是否冻结: {}\n- 创建时间: {}\n- 更新时间: {}",
            game.game_id,
            if game.is_frozen { "是" } else { "否" },
            game.created_at.format("%Y-%m-%d %H:%M:%S"),
            game.updated_at.format("%Y-%m-%d %H:%M:%S"),
        );
        if let Some(main_message_id) = &game.main_message_id {
            text.push_str(&format!("\n- 主消息ID: {main_message_id}"));
        }

        self.gateway
            .post_structured(
                &ctx.group_id,
                &StructuredMessage {
                    text,
                    mention_user_id: Some(game.host_user_id.clone()),
                    reply_to: game.main_message_id.clone(),
                },
            )
            .await?;
        Ok(())
    }

    async fn handle_webui(&self, ctx: &CommandContext) -> Result<()> {
        let Some(url) = self.web.as_ref().and_then(|web| web.public_url()) else {
            self.reply(ctx, "Web UI 未启用。").await?;
            return Ok(());
        };

        let game = self.store.get_game_by_channel_id(&ctx.group_id).await?;
        let message = match game {
            Some(game) => format!("✅ 当前游戏的 Web UI 地址:\n{url}/game/{}", game.game_id),
            None => format!("✅ Web UI 入口地址:\n{url}"),
        };
        self.reply(ctx, &message).await
    }

    async fn handle_game_list(&self, ctx: &CommandContext) -> Result<()> {
        let games = self.store.get_all_games().await?;
        if games.is_empty() {
            self.reply(ctx, "当前没有已创建的游戏。").await?;
            return Ok(());
        }

        let mut text = "游戏列表：\n".to_string();
        for game in games {
            text.push_str(&format!(
                "- ID: {}, 频道: {}, 主持人: {}, 创建于: {}\n",
                game.game_id,
                game.channel_id.as_deref().unwrap_or("未附加"),
                game.host_user_id,
                game.created_at.format("%Y-%m-%d %H:%M:%S"),
            ));
        }
        self.reply(ctx, text.trim_end()).await
    }

    // --- Game lifecycle ---

    async fn handle_start(&self, ctx: &CommandContext, system_prompt: Option<String>) -> Result<()> {
        if self.store.is_game_running(&ctx.group_id).await? {
            self.reply(ctx, "当前频道已有正在进行的游戏。请先结束或 detach 当前游戏。")
                .await?;
            return Ok(());
        }

        match system_prompt {
            Some(system_prompt) => {
                self.propose_new_game(ctx, &system_prompt).await
            }
            None => {
                let Some(url) = self.web.as_ref().and_then(|web| web.public_url()) else {
                    self.reply(
                        ctx,
                        "❌ Web UI 未启用，无法使用网页启动功能。\n请直接附带剧本: /aigm start <剧本内容>",
                    )
                    .await?;
                    return Ok(());
                };
                let token = self
                    .cache
                    .issue_web_start_token(&ctx.group_id, &ctx.user_id)
                    .await;
                self.reply(
                    ctx,
                    &format!(
                        "🚀 请点击下方链接进入网页端输入剧本：\n{url}/game/start?token={token}\n\n💡 链接有效期 10 分钟，提交后请在群内确认。"
                    ),
                )
                .await
            }
        }
    }

    /// Publish a scenario preview and open the reaction-confirmation window.
    ///
    /// Also the landing point for web-submitted drafts, which arrive with
    /// the `(group, user)` a consumed start token vouched for.
    pub async fn propose_new_game(&self, ctx: &CommandContext, system_prompt: &str) -> Result<()> {
        let preview: String = system_prompt.chars().take(2000).collect();

        let preview_message_id = match self.renderer.render_markdown(&preview, None).await {
            Ok(image) => self.gateway.post_image(&ctx.group_id, &image).await?,
            Err(error) => {
                tracing::warn!(%error, "preview render failed, falling back to text");
                self.gateway
                    .post_text(
                        &ctx.group_id,
                        &format!("文件预览:\n\n{preview}"),
                        ctx.message_id.as_deref(),
                    )
                    .await?
            }
        };

        // COFFEE marks a busy channel, CONFIRM an actionable proposal.
        let marker = if self.store.is_game_running(&ctx.group_id).await? {
            emoji::COFFEE
        } else {
            emoji::CONFIRM
        };
        if let Err(error) = self.gateway.set_reaction(&preview_message_id, marker, true).await {
            tracing::warn!(%preview_message_id, %error, "failed to mark proposal preview");
        }

        self.cache
            .add_pending_game(
                &preview_message_id,
                PendingProposal {
                    user_id: ctx.user_id.clone(),
                    system_prompt: system_prompt.to_string(),
                    message_id: ctx.message_id.clone(),
                    create_time: chrono::Utc::now(),
                },
            )
            .await;
        tracing::info!(group_id = %ctx.group_id, %preview_message_id, "new game proposed");
        Ok(())
    }

    async fn handle_game_attach(&self, ctx: &CommandContext, game_id: GameId) -> Result<()> {
        let target_game = self.store.get_game_by_game_id(game_id).await?;

        let is_target_host = target_game
            .as_ref()
            .is_some_and(|game| game.host_user_id == ctx.user_id);
        if !(self.has_root_or_admin(ctx).await || is_target_host) {
            return self.deny(ctx, "您必须是群管理员、root用户或该游戏的主持人。").await;
        }

        if self.store.is_game_running(&ctx.group_id).await? {
            self.reply(ctx, "当前频道已经有一个正在进行的游戏。").await?;
            return Ok(());
        }
        let Some(target_game) = target_game else {
            self.reply(ctx, &format!("找不到ID为 {game_id} 的游戏。")).await?;
            return Ok(());
        };
        if let Some(channel_id) = &target_game.channel_id {
            self.reply(ctx, &format!("游戏 {game_id} 已经附加到频道 {channel_id}。"))
                .await?;
            return Ok(());
        }

        match self.store.attach_game_to_channel(game_id, &ctx.group_id).await {
            Ok(()) => {
                self.reply(ctx, &format!("成功将游戏 {game_id} 附加到当前频道。正在发送主消息中..."))
                    .await?;
                self.engine.checkout_head(game_id).await
            }
            Err(Error::Store(StoreError::ChannelOccupied { .. })) => {
                self.reply(ctx, "附加失败：本频道已被其他并发操作占用，请稍后重试。")
                    .await
            }
            Err(error) => Err(error),
        }
    }

    async fn handle_game_detach(&self, ctx: &CommandContext) -> Result<()> {
        if !self.check_channel_permission(ctx).await? {
            return self
                .deny(ctx, "您必须是群管理员、root用户或该频道游戏的主持人。")
                .await;
        }
        let Some(game) = self.channel_game(ctx).await? else {
            return Ok(());
        };

        self.store.detach_game_from_channel(game.game_id).await?;
        self.cache.clear_group_vote_cache(&ctx.group_id).await;
        self.reply(
            ctx,
            &format!("成功从当前频道分离游戏 {}，并已清理相关缓存。", game.game_id),
        )
        .await
    }

    async fn handle_game_set_host(
        &self,
        ctx: &CommandContext,
        new_host_id: &str,
        game_id: Option<GameId>,
    ) -> Result<()> {
        let target_game_id = match game_id {
            Some(game_id) => Some(game_id),
            None => self
                .store
                .get_game_by_channel_id(&ctx.group_id)
                .await?
                .map(|game| game.game_id),
        };
        let Some(target_game_id) = target_game_id else {
            self.reply(ctx, "无法确定要操作的游戏。").await?;
            return Ok(());
        };

        let target_game = self.store.get_game_by_game_id(target_game_id).await?;
        let is_target_host = target_game
            .as_ref()
            .is_some_and(|game| game.host_user_id == ctx.user_id);
        if !(self.has_root_or_admin(ctx).await || is_target_host) {
            return self.deny(ctx, "您必须是群管理员、root用户或该游戏的主持人。").await;
        }
        if target_game.is_none() {
            self.reply(ctx, &format!("找不到ID为 {target_game_id} 的游戏。")).await?;
            return Ok(());
        }

        self.store.update_game_host(target_game_id, new_host_id).await?;
        self.gateway
            .post_structured(
                &ctx.group_id,
                &StructuredMessage {
                    text: format!("✅ 成功将游戏 {target_game_id} 的主持人变更为 "),
                    mention_user_id: Some(new_host_id.to_string()),
                    reply_to: None,
                },
            )
            .await?;
        Ok(())
    }

    // --- Branches ---

    async fn handle_branch_list(&self, ctx: &CommandContext, all: bool) -> Result<()> {
        let Some(game) = self.channel_game(ctx).await? else {
            return Ok(());
        };

        let notice = if all { "正在生成完整分支图，请稍候..." } else { "正在生成分支图，请稍候..." };
        self.reply(ctx, notice).await?;

        let graph = if all {
            self.visualizer.create_full_branch_graph(game.game_id).await
        } else {
            self.visualizer.create_branch_graph(game.game_id).await
        };
        match graph {
            Ok(image) => {
                self.gateway.post_image(&ctx.group_id, &image).await?;
            }
            Err(error) => {
                tracing::error!(game_id = game.game_id, %error, "branch graph failed");
                self.reply(ctx, "生成分支图失败，请检查日志。").await?;
            }
        }
        Ok(())
    }

    async fn handle_branch_show(&self, ctx: &CommandContext, name: &str) -> Result<()> {
        let Some(game) = self.channel_game(ctx).await? else {
            return Ok(());
        };

        let branch = self.store.get_branch_by_name(game.game_id, name).await?;
        let Some(tip_round_id) = branch.and_then(|branch| branch.tip_round_id) else {
            self.reply(
                ctx,
                &format!("找不到名为 '{name}' 的分支或该分支没有指向任何回合。"),
            )
            .await?;
            return Ok(());
        };

        self.show_round_content(ctx, tip_round_id).await
    }

    async fn handle_branch_history(
        &self,
        ctx: &CommandContext,
        name: Option<&str>,
        limit: Option<usize>,
    ) -> Result<()> {
        let Some(game) = self.channel_game(ctx).await? else {
            return Ok(());
        };

        let branch = match name {
            Some(name) => self.store.get_branch_by_name(game.game_id, name).await?,
            None => match game.head_branch_id {
                Some(branch_id) => self.store.get_branch_by_id(branch_id).await?,
                None => None,
            },
        };
        let Some(tip_round_id) = branch.and_then(|branch| branch.tip_round_id) else {
            let display = name
                .map(|name| format!("名为 '{name}' 的"))
                .unwrap_or_else(|| "HEAD".to_string());
            self.reply(ctx, &format!("找不到{display}分支或该分支没有指向任何回合。"))
                .await?;
            return Ok(());
        };

        self.handle_round_history(ctx, tip_round_id, limit).await
    }

    async fn handle_branch_create(
        &self,
        ctx: &CommandContext,
        name: &str,
        from_round_id: Option<RoundId>,
    ) -> Result<()> {
        if !self.check_channel_permission(ctx).await? {
            return self.deny(ctx, "").await;
        }
        let Some(game) = self.channel_game(ctx).await? else {
            return Ok(());
        };
        if !is_valid_name(name) {
            self.reply(
                ctx,
                "❌ 无效的分支名称。名称长度应在1-50之间，且只能包含字母、数字、下划线和连字符。",
            )
            .await?;
            return Ok(());
        }

        match self.engine.create_new_branch(game.game_id, name, from_round_id).await {
            Ok(()) => Ok(()),
            Err(Error::Store(StoreError::NameTaken { .. })) => {
                self.reply(ctx, &format!("❌ 分支 '{name}' 已存在。")).await
            }
            Err(Error::Store(StoreError::RoundNotFound { id })) => {
                self.reply(ctx, &format!("找不到回合 {id}。")).await
            }
            Err(error) => Err(error),
        }
    }

    async fn handle_branch_rename(
        &self,
        ctx: &CommandContext,
        old_name: &str,
        new_name: &str,
    ) -> Result<()> {
        if !self.check_channel_permission(ctx).await? {
            return self.deny(ctx, "").await;
        }
        let Some(game) = self.channel_game(ctx).await? else {
            return Ok(());
        };
        if !is_valid_name(new_name) {
            self.reply(
                ctx,
                "❌ 无效的分支名称。名称长度应在1-50之间，且只能包含字母、数字、下划线和连字符。",
            )
            .await?;
            return Ok(());
        }

        let Some(branch) = self.store.get_branch_by_name(game.game_id, old_name).await? else {
            self.reply(ctx, &format!("找不到名为 '{old_name}' 的分支。")).await?;
            return Ok(());
        };

        // The UNIQUE constraint is the authoritative duplicate check.
        match self.store.rename_branch(branch.branch_id, new_name).await {
            Ok(()) => {
                self.reply(
                    ctx,
                    &format!("✅ 分支 '{old_name}' 已成功重命名为 '{new_name}'。"),
                )
                .await
            }
            Err(Error::Store(StoreError::NameTaken { .. })) => {
                self.reply(ctx, &format!("❌ 分支名 '{new_name}' 已被占用。")).await
            }
            Err(error) => Err(error),
        }
    }

    async fn handle_branch_delete(&self, ctx: &CommandContext, name: &str) -> Result<()> {
        if !self.check_channel_permission(ctx).await? {
            return self.deny(ctx, "").await;
        }
        let Some(game) = self.channel_game(ctx).await? else {
            return Ok(());
        };

        match self.store.delete_branch_checked(game.game_id, name).await {
            Ok(()) => self.reply(ctx, &format!("✅ 已成功删除分支 '{name}'。")).await,
            Err(Error::Store(StoreError::BranchNotFound { .. })) => {
                self.reply(ctx, &format!("❌ 删除失败: 找不到名为 '{name}' 的分支。")).await
            }
            Err(Error::Store(StoreError::CannotDeleteHead)) => {
                self.reply(ctx, "❌ 删除失败: 不能删除当前所在的 HEAD 分支。").await
            }
            Err(error) => Err(error),
        }
    }

    async fn handle_checkout_head(&self, ctx: &CommandContext) -> Result<()> {
        if !self.check_channel_permission(ctx).await? {
            return self
                .deny(ctx, "您必须是群管理员、root用户或该频道游戏的主持人。")
                .await;
        }
        let Some(game) = self.channel_game(ctx).await? else {
            return Ok(());
        };
        self.engine.checkout_head(game.game_id).await
    }

    async fn handle_checkout(&self, ctx: &CommandContext, branch_name: &str) -> Result<()> {
        if !self.check_channel_permission(ctx).await? {
            return self.deny(ctx, "").await;
        }
        let Some(game) = self.channel_game(ctx).await? else {
            return Ok(());
        };
        match self.engine.switch_branch(game.game_id, branch_name).await {
            Ok(()) => Ok(()),
            Err(Error::Store(StoreError::BranchNotFound { .. })) => {
                self.reply(ctx, &format!("找不到名为 '{branch_name}' 的分支。")).await
            }
            Err(error) => Err(error),
        }
    }

    async fn handle_reset(&self, ctx: &CommandContext, round_id: RoundId) -> Result<()> {
        if !self.check_channel_permission(ctx).await? {
            return self.deny(ctx, "").await;
        }
        let Some(game) = self.channel_game(ctx).await? else {
            return Ok(());
        };
        match self.engine.reset_current_branch(game.game_id, round_id).await {
            Ok(()) => Ok(()),
            Err(Error::Store(StoreError::RoundNotFound { id })) => {
                self.reply(ctx, &format!("找不到回合 {id}。")).await
            }
            Err(error) => Err(error),
        }
    }

    // --- Rounds ---

    async fn show_round_content(&self, ctx: &CommandContext, round_id: RoundId) -> Result<()> {
        let Some(round) = self.store.get_round_info(round_id).await? else {
            self.reply(ctx, &format!("找不到 ID 为 {round_id} 的回合。")).await?;
            return Ok(());
        };

        self.reply(ctx, &format!("正在渲染 Round {round_id} 的内容...")).await?;
        let extra = usage_header(&round);
        match self
            .renderer
            .render_markdown(&round.assistant_response, extra.as_deref())
            .await
        {
            Ok(image) => {
                self.gateway.post_image(&ctx.group_id, &image).await?;
            }
            Err(error) => {
                tracing::error!(round_id, %error, "round render failed");
                self.reply(ctx, "渲染内容失败，请检查日志。").await?;
            }
        }
        Ok(())
    }

    async fn handle_round_show(&self, ctx: &CommandContext, round_id: RoundId) -> Result<()> {
        if self.channel_game(ctx).await?.is_none() {
            return Ok(());
        }
        self.show_round_content(ctx, round_id).await
    }

    async fn handle_round_history(
        &self,
        ctx: &CommandContext,
        round_id: RoundId,
        limit: Option<usize>,
    ) -> Result<()> {
        if self.channel_game(ctx).await?.is_none() {
            return Ok(());
        }

        let mut limit = limit.unwrap_or(self.history_limit);
        if limit > self.history_limit {
            limit = self.history_limit;
            self.reply(
                ctx,
                &format!("为了防止消息刷屏和性能问题，历史记录上限设置为{limit}条。"),
            )
            .await?;
        }

        self.reply(
            ctx,
            &format!("正在生成 round {round_id} 的历史记录（最多{limit}条），请稍候..."),
        )
        .await?;

        let history = self.store.get_round_ancestors(round_id, limit as i64).await?;
        if history.is_empty() {
            self.reply(ctx, &format!("找不到 round {round_id} 或其历史记录。")).await?;
            return Ok(());
        }

        let mut nodes = Vec::with_capacity(history.len());
        for round in &history {
            let combined = format!(
                "### 玩家选择 (Round {} -> {})\n\n{}\n\n---\n\n### GM 回应 (Round {})\n\n{}",
                round.parent_id,
                round.round_id,
                round.player_choice,
                round.round_id,
                round.assistant_response,
            );
            match self
                .renderer
                .render_markdown(&combined, usage_header(round).as_deref())
                .await
            {
                Ok(image) => nodes.push(ForwardNode::Image(image)),
                Err(_) => nodes.push(ForwardNode::Text(format!("[渲染失败]\n{combined}"))),
            }
        }

        self.gateway
            .post_forward_bundle(
                &ctx.group_id,
                &ForwardBundle {
                    author_id: ctx.user_id.clone(),
                    author_name: format!("#{round_id}"),
                    nodes,
                },
            )
            .await?;
        Ok(())
    }

    // --- Tags ---

    async fn handle_tag_create(
        &self,
        ctx: &CommandContext,
        name: &str,
        round_id: Option<RoundId>,
    ) -> Result<()> {
        if !self.check_channel_permission(ctx).await? {
            return self.deny(ctx, "").await;
        }
        let Some(game) = self.channel_game(ctx).await? else {
            return Ok(());
        };
        if !is_valid_name(name) {
            self.reply(
                ctx,
                "❌ 无效的标签名称。名称长度应在1-50之间，且只能包含字母、数字、下划线和连字符。",
            )
            .await?;
            return Ok(());
        }

        let target_round_id = match round_id {
            Some(round_id) => round_id,
            None => self.store.head_tip(game.game_id).await?.1,
        };
        if self.store.get_round_info(target_round_id).await?.is_none() {
            self.reply(ctx, &format!("找不到回合 {target_round_id}。")).await?;
            return Ok(());
        }

        match self.store.create_tag(game.game_id, name, target_round_id).await {
            Ok(_) => {
                self.reply(
                    ctx,
                    &format!("🏷️ 已在回合 {target_round_id} 创建标签 '{name}'。"),
                )
                .await
            }
            Err(Error::Store(StoreError::NameTaken { .. })) => {
                self.reply(ctx, &format!("❌ 标签 '{name}' 已存在。")).await
            }
            Err(error) => Err(error),
        }
    }

    async fn handle_tag_list(&self, ctx: &CommandContext) -> Result<()> {
        let Some(game) = self.channel_game(ctx).await? else {
            return Ok(());
        };

        let tags = self.store.get_all_tags_for_game(game.game_id).await?;
        if tags.is_empty() {
            self.reply(ctx, "当前游戏还没有任何标签。").await?;
            return Ok(());
        }

        let mut text = "标签列表:\n".to_string();
        for tag in tags {
            text.push_str(&format!("- {} -> (Round {})\n", tag.name, tag.round_id));
        }
        self.reply(ctx, text.trim_end()).await
    }

    async fn handle_tag_show(&self, ctx: &CommandContext, name: &str) -> Result<()> {
        let Some(game) = self.channel_game(ctx).await? else {
            return Ok(());
        };
        let Some(tag) = self.store.get_tag_by_name(game.game_id, name).await? else {
            self.reply(ctx, &format!("找不到名为 '{name}' 的标签。")).await?;
            return Ok(());
        };
        self.show_round_content(ctx, tag.round_id).await
    }

    async fn handle_tag_history(
        &self,
        ctx: &CommandContext,
        name: &str,
        limit: Option<usize>,
    ) -> Result<()> {
        let Some(game) = self.channel_game(ctx).await? else {
            return Ok(());
        };
        let Some(tag) = self.store.get_tag_by_name(game.game_id, name).await? else {
            self.reply(ctx, &format!("找不到名为 '{name}' 的标签。")).await?;
            return Ok(());
        };
        self.handle_round_history(ctx, tag.round_id, limit).await
    }

    async fn handle_tag_delete(&self, ctx: &CommandContext, name: &str) -> Result<()> {
        if !self.check_channel_permission(ctx).await? {
            return self.deny(ctx, "").await;
        }
        let Some(game) = self.channel_game(ctx).await? else {
            return Ok(());
        };

        if self.store.delete_tag(game.game_id, name).await? {
            self.reply(ctx, &format!("✅ 已成功删除标签 '{name}'。")).await
        } else {
            self.reply(ctx, &format!("找不到名为 '{name}' 的标签。")).await
        }
    }

    // --- Admin ---

    async fn handle_admin_unfreeze(&self, ctx: &CommandContext) -> Result<()> {
        if !self.has_root_or_admin(ctx).await {
            return self.deny(ctx, "您必须是群管理员或root用户。").await;
        }
        let Some(game) = self.channel_game(ctx).await? else {
            return Ok(());
        };
        if !game.is_frozen {
            self.reply(ctx, "游戏未处于冻结状态。").await?;
            return Ok(());
        }

        self.store.set_game_frozen_status(game.game_id, false).await?;
        tracing::info!(game_id = game.game_id, user_id = %ctx.user_id, "game unfrozen by admin");
        self.reply(
            ctx,
            &format!("✅ 游戏 {} 已被成功解冻，您可以继续操作了。", game.game_id),
        )
        .await
    }

    async fn handle_admin_delete_game(&self, ctx: &CommandContext, game_id: GameId) -> Result<()> {
        if !self.is_root(&ctx.user_id).await {
            return self.deny(ctx, "只有root用户才能删除游戏。").await;
        }
        let Some(game) = self.store.get_game_by_game_id(game_id).await? else {
            self.reply(ctx, &format!("找不到ID为 {game_id} 的游戏。")).await?;
            return Ok(());
        };

        self.store.delete_game(game_id).await?;
        if let Some(channel_id) = &game.channel_id {
            self.cache.clear_group_vote_cache(channel_id).await;
        }
        tracing::info!(game_id, user_id = %ctx.user_id, "game deleted by root");
        self.reply(ctx, &format!("✅ 成功删除游戏 {game_id}。")).await
    }

    async fn handle_admin_refresh_tunnel(&self, ctx: &CommandContext) -> Result<()> {
        if !self.is_root(&ctx.user_id).await {
            return self.deny(ctx, "只有root用户才能刷新tunnel。").await;
        }
        let Some(web) = self.web.as_ref() else {
            self.reply(ctx, "❌ Web UI 未启用。").await?;
            return Ok(());
        };

        self.reply(ctx, "🔄 正在刷新 tunnel，请稍候...").await?;
        match web.refresh().await {
            Ok(()) => match web.public_url() {
                Some(url) => self.reply(ctx, &format!("✅ Tunnel 刷新成功！\n新地址: {url}")).await,
                None => self.reply(ctx, "❌ Tunnel 刷新失败，请查看日志获取详细信息。").await,
            },
            Err(error) => {
                tracing::error!(%error, "tunnel refresh failed");
                self.reply(ctx, "❌ Tunnel 刷新失败，请查看日志获取详细信息。").await
            }
        }
    }

    async fn handle_admin_clear_help_cache(&self, ctx: &CommandContext) -> Result<()> {
        if !self.is_root(&ctx.user_id).await {
            return self.deny(ctx, "只有root用户才能清除帮助缓存。").await;
        }
        self.renderer.clear_help_cache().await;
        self.reply(ctx, "✅ 已成功清除帮助图片缓存。").await
    }

    async fn handle_admin_clear_pending(&self, ctx: &CommandContext) -> Result<()> {
        if !self.has_root_or_admin(ctx).await {
            return self.deny(ctx, "您必须是群管理员或root用户。").await;
        }
        self.cache.clear_pending_games().await;
        self.reply(ctx, "已清空所有待处理的新游戏请求缓存。").await
    }

    async fn handle_advanced_mode(
        &self,
        ctx: &CommandContext,
        action: AdvancedModeAction,
    ) -> Result<()> {
        if !self.check_channel_permission(ctx).await? {
            return self
                .deny(ctx, "您必须是群管理员、root用户或该频道游戏的主持人。")
                .await;
        }

        match action {
            AdvancedModeAction::Enable => {
                self.channel_flags
                    .enable_advanced_mode(&ctx.group_id, &ctx.user_id)
                    .await?;
                self.reply(
                    ctx,
                    "✅ 已为本频道启用高级模式。\n📌 在此模式下，AI GM 将发送 Web UI 链接而非渲染图片，但表情功能保持正常。",
                )
                .await
            }
            AdvancedModeAction::Disable => {
                self.channel_flags.disable_advanced_mode(&ctx.group_id).await?;
                self.reply(ctx, "✅ 已为本频道禁用高级模式，将恢复发送渲染图片。").await
            }
            AdvancedModeAction::Status => {
                let flags = self.channel_flags.channel_flags(&ctx.group_id).await;
                let text = if flags.advanced_mode {
                    format!(
                        "🔧 当前频道状态：高级模式已启用\n👤 启用者：{}\n⏰ 启用时间：{}\n📱 AI GM 将发送 Web UI 链接而非图片",
                        flags.enabled_by.as_deref().unwrap_or("未知用户"),
                        flags
                            .enabled_at
                            .map(|at| at.to_rfc3339())
                            .unwrap_or_else(|| "未知时间".to_string()),
                    )
                } else {
                    "🔧 当前频道状态：高级模式未启用\n📱 AI GM 将发送渲染图片".to_string()
                };
                self.reply(ctx, &text).await
            }
        }
    }

    // --- Group LLM bindings ---

    async fn handle_llm_status(&self, ctx: &CommandContext) -> Result<()> {
        let binding = self.broker.binding_status(&ctx.group_id).await;

        let mut lines = vec!["🤖 本群 LLM 绑定状态：".to_string()];
        match &binding.active {
            Some(active) if active.is_valid() => {
                let expiry = match active.expire_at {
                    Some(expire_at) => {
                        let remaining = expire_at - chrono::Utc::now().timestamp();
                        format!("剩余 {} 分钟", remaining.max(0) / 60)
                    }
                    None => "永久".to_string(),
                };
                lines.push(format!(
                    "- 活跃绑定: '{}' (所有者 {}, {})",
                    active.preset_name, active.owner_id, expiry
                ));
            }
            _ => lines.push("- 活跃绑定: 无".to_string()),
        }
        match &binding.fallback {
            Some(fallback) => lines.push(format!(
                "- 保底预设: '{}' (所有者 {})",
                fallback.preset_name, fallback.owner_id
            )),
            None => lines.push("- 保底预设: 无".to_string()),
        }

        self.reply(ctx, &lines.join("\n")).await
    }

    async fn handle_llm_bind(
        &self,
        ctx: &CommandContext,
        preset_name: &str,
        duration_raw: Option<&str>,
    ) -> Result<()> {
        let duration = match duration_raw {
            None => None,
            // A session lease is a day; the broker only sees seconds.
            Some("--session") => Some(Duration::from_secs(24 * 3600)),
            Some(raw) => match parse_duration(raw) {
                Some(duration) => Some(duration),
                None => {
                    self.reply(
                        ctx,
                        "❌ 无效的时长。支持 Nm/Nh/Nd（最长90天）或 --session。",
                    )
                    .await?;
                    return Ok(());
                }
            },
        };

        match self
            .broker
            .bind_active(&ctx.group_id, &ctx.user_id, preset_name, duration)
            .await
        {
            Ok(()) => {
                self.reply(ctx, &format!("✅ 绑定成功，本群将使用预设 '{preset_name}'。"))
                    .await
            }
            Err(Error::Broker(error)) => self.reply(ctx, &format!("❌ {error}")).await,
            Err(error) => Err(error),
        }
    }

    async fn handle_llm_unbind(&self, ctx: &CommandContext) -> Result<()> {
        let binding = self.broker.binding_status(&ctx.group_id).await;
        let Some(active) = binding.active else {
            self.reply(ctx, "本群当前没有活跃绑定。").await?;
            return Ok(());
        };

        if active.owner_id != ctx.user_id && !self.has_root_or_admin(ctx).await {
            return self.deny(ctx, "只有绑定所有者或管理员可以解绑。").await;
        }

        self.broker.unbind_active(&ctx.group_id).await?;
        self.reply(ctx, "✅ 已解除本群的活跃绑定。").await
    }

    async fn handle_llm_set_fallback(&self, ctx: &CommandContext, preset_name: &str) -> Result<()> {
        if !self.has_root_or_admin(ctx).await {
            return self.deny(ctx, "您必须是群管理员或root用户。").await;
        }

        match self
            .broker
            .set_fallback(&ctx.group_id, &ctx.user_id, preset_name)
            .await
        {
            Ok(()) => {
                self.reply(ctx, &format!("✅ 已将 '{preset_name}' 设为本群的保底预设。"))
                    .await
            }
            Err(Error::Broker(error)) => self.reply(ctx, &format!("❌ {error}")).await,
            Err(error) => Err(error),
        }
    }

    async fn handle_llm_clear_fallback(&self, ctx: &CommandContext) -> Result<()> {
        if !self.has_root_or_admin(ctx).await {
            return self.deny(ctx, "您必须是群管理员或root用户。").await;
        }
        self.broker.clear_fallback(&ctx.group_id).await?;
        self.reply(ctx, "✅ 已清除本群的保底预设。").await
    }

    // --- Private LLM preset management ---

    async fn reply_private(&self, user_id: &str, text: &str) -> Result<()> {
        self.gateway.post_private_text(user_id, text).await?;
        Ok(())
    }

    async fn handle_llm_add(
        &self,
        user_id: &str,
        name: &str,
        model: &str,
        base_url: &str,
        api_key: &str,
        force: bool,
    ) -> Result<()> {
        self.reply_private(user_id, &format!("🔍 正在测试预设 '{name}' 的连接性..."))
            .await?;

        let candidate = crate::llm::broker::LlmPreset {
            model: model.to_string(),
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
        };
        let (usable, message) = self
            .broker
            .test_preset(&candidate, self.completion.as_ref(), Duration::from_secs(30))
            .await;

        if !usable && !force {
            self.reply_private(
                user_id,
                &format!("❌ 预设测试失败: {message}\n如仍要保存，请追加 --force。"),
            )
            .await?;
            return Ok(());
        }

        match self
            .broker
            .add_preset(user_id, name, model, base_url, api_key)
            .await
        {
            Ok(()) => {
                let note = if usable { "" } else { "（测试未通过，已强制保存）" };
                self.reply_private(
                    user_id,
                    &format!(
                        "✅ 预设 '{name}' 已保存{note}。\n- 模型: {model}\n- 地址: {base_url}\n- Key: {}",
                        mask_key(api_key)
                    ),
                )
                .await
            }
            Err(Error::Broker(error)) => {
                self.reply_private(user_id, &format!("❌ {error}")).await
            }
            Err(error) => Err(error),
        }
    }

    async fn handle_llm_remove(&self, user_id: &str, name: &str) -> Result<()> {
        match self.broker.remove_preset(user_id, name).await {
            Ok(()) => self.reply_private(user_id, &format!("✅ 预设 '{name}' 已删除。")).await,
            Err(Error::Broker(error)) => self.reply_private(user_id, &format!("❌ {error}")).await,
            Err(error) => Err(error),
        }
    }

    async fn handle_llm_test(&self, user_id: &str, name: &str) -> Result<()> {
        let Some(preset) = self.broker.get_preset(user_id, name).await else {
            self.reply_private(user_id, &format!("❌ 预设 '{name}' 不存在。")).await?;
            return Ok(());
        };

        self.reply_private(user_id, &format!("🔍 正在测试预设 '{name}'...")).await?;
        let (usable, message) = self
            .broker
            .test_preset(&preset, self.completion.as_ref(), Duration::from_secs(30))
            .await;
        let prefix = if usable { "✅" } else { "❌" };
        self.reply_private(user_id, &format!("{prefix} {message}")).await
    }

    async fn handle_llm_list(&self, user_id: &str) -> Result<()> {
        let presets = self.broker.get_user_presets(user_id).await;
        if presets.is_empty() {
            self.reply_private(user_id, "您还没有保存任何 LLM 预设。").await?;
            return Ok(());
        }

        let mut names: Vec<&String> = presets.keys().collect();
        names.sort();
        let mut text = "📋 您的 LLM 预设：\n".to_string();
        for name in names {
            let preset = &presets[name];
            text.push_str(&format!(
                "- {name}: {} @ {} (Key: {})\n",
                preset.model,
                preset.base_url,
                mask_key(&preset.api_key)
            ));
        }
        self.reply_private(user_id, text.trim_end()).await
    }
}

fn usage_header(round: &RoundRow) -> Option<String> {
    round
        .prompt_tokens()
        .filter(|prompt_tokens| *prompt_tokens > 0)
        .map(|prompt_tokens| format!("{}k / 1M", ((prompt_tokens as f64) / 1000.0).round() as i64))
}

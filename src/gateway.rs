//! Collaborator traits for the chat platform, renderers, and the web surface.
//!
//! The core never talks to a chat platform directly. Everything outward goes
//! through these object-safe traits, consumed as `Arc<dyn …>`; adapters live
//! in their own crates or binaries and implement them against a concrete
//! platform. Tests supply recording fakes.

use crate::error::Result;
use crate::GameId;
use async_trait::async_trait;

/// A group member's role as reported by the chat platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    Member,
    Admin,
    Owner,
}

impl MemberRole {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "member" => Some(MemberRole::Member),
            "admin" => Some(MemberRole::Admin),
            "owner" => Some(MemberRole::Owner),
            _ => None,
        }
    }

    /// Admins and owners may drive game controls.
    pub fn is_moderator(self) -> bool {
        matches!(self, MemberRole::Admin | MemberRole::Owner)
    }
}

/// A message combining mentions, text, and a reply reference.
#[derive(Debug, Clone, Default)]
pub struct StructuredMessage {
    pub text: String,
    pub mention_user_id: Option<String>,
    pub reply_to: Option<String>,
}

/// One node of a forwarded bundle.
#[derive(Debug, Clone)]
pub enum ForwardNode {
    Image(Vec<u8>),
    Text(String),
}

/// A forwarded bundle with a synthetic author identity.
#[derive(Debug, Clone)]
pub struct ForwardBundle {
    pub author_id: String,
    pub author_name: String,
    pub nodes: Vec<ForwardNode>,
}

/// Chat platform adapter.
///
/// All operations may fail; reaction attachment failures in particular are
/// treated as non-fatal by callers.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Post a plain text message, optionally as a reply. Returns the posted
    /// message id.
    async fn post_text(
        &self,
        group_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<String>;

    /// Post an image. Returns the posted message id.
    async fn post_image(&self, group_id: &str, image: &[u8]) -> Result<String>;

    /// Post a structured message (mention + text + reply reference).
    async fn post_structured(&self, group_id: &str, message: &StructuredMessage)
    -> Result<String>;

    /// Post a forwarded bundle.
    async fn post_forward_bundle(&self, group_id: &str, bundle: &ForwardBundle)
    -> Result<String>;

    /// Post a private (direct) text message to a user.
    async fn post_private_text(&self, user_id: &str, text: &str) -> Result<String>;

    /// Attach (`active = true`) or detach a reaction emoji on a message.
    async fn set_reaction(&self, message_id: &str, emoji_id: u32, active: bool) -> Result<()>;

    /// Delete a message.
    async fn delete_message(&self, message_id: &str) -> Result<()>;

    /// Fetch the plain text of a message by id.
    async fn fetch_message_text(&self, message_id: &str) -> Result<String>;

    /// Fetch the reactions currently on a message: emoji id → reacting user
    /// ids. Used by adapters to rebuild vote state after a restart.
    async fn fetch_reactions(&self, message_id: &str) -> Result<Vec<(u32, Vec<String>)>>;

    /// Fetch a group member's role.
    async fn member_role(&self, group_id: &str, user_id: &str) -> Result<MemberRole>;
}

/// RBAC oracle for meta-roles outside the chat platform.
///
/// Only the `root` role is consulted by the core.
#[async_trait]
pub trait AuthOracle: Send + Sync {
    async fn has_role(&self, user_id: &str, role: &str) -> bool;
}

/// Markdown-to-image renderer.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render markdown to image bytes, with an optional header line (for the
    /// token usage readout).
    async fn render_markdown(&self, markdown: &str, extra_header: Option<&str>)
    -> Result<Vec<u8>>;

    /// Render the (cached) help page.
    async fn render_help_page(&self) -> Result<Vec<u8>>;

    /// Drop the cached help page so the next render rebuilds it.
    async fn clear_help_cache(&self);
}

/// Branch-graph visualizer. Reads game state from the store on its own.
#[async_trait]
pub trait Visualizer: Send + Sync {
    /// Simplified graph: roots, branch tips, tags, and fork points.
    async fn create_branch_graph(&self, game_id: GameId) -> Result<Vec<u8>>;

    /// Full graph with every round as a node.
    async fn create_full_branch_graph(&self, game_id: GameId) -> Result<Vec<u8>>;
}

/// Public-URL provisioner for the out-of-scope web surface.
#[async_trait]
pub trait WebExposer: Send + Sync {
    /// The currently published HTTPS base URL, if the tunnel is up.
    fn public_url(&self) -> Option<String>;

    /// Tear down and re-provision the tunnel.
    async fn refresh(&self) -> Result<()>;
}

//! Plotforge: a chat-group AI game master core with git-like branching of
//! story rounds, reaction-driven voting, and a multi-user LLM credential
//! broker.

pub mod cache;
pub mod channel_config;
pub mod commands;
pub mod config;
pub mod content;
pub mod emoji;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod router;
pub mod store;

#[cfg(test)]
pub mod testing;

pub use error::{Error, Result};

/// Game identifier type (SQLite rowid).
pub type GameId = i64;

/// Round identifier type.
pub type RoundId = i64;

/// Branch identifier type.
pub type BranchId = i64;

/// Tag identifier type.
pub type TagId = i64;

/// Sentinel parent id for the seed round of a game.
pub const INITIAL_PARENT_ID: RoundId = -1;

/// The literal player choice recorded for a game's seed round.
pub const SEED_PLAYER_CHOICE: &str = "开始";

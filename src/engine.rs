//! Game orchestration: vote tallying and round advancement.

pub mod game;
pub mod tally;

pub use game::GameEngine;
pub use tally::{TallyOutcome, VoteTally};

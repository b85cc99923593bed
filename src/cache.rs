//! Volatile (non-relational) state: pending proposals, vote tallies, and
//! web start tokens.

pub mod volatile;

pub use volatile::{PendingProposal, VolatileCache, VoteEntry};

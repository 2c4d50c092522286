//! The outer loop: persisted run state, budget ceilings, per-iteration
//! accounting, and the [`RunLoop`] that ties them to a [`Conversation`].
//!
//! [`Conversation`]: crate::agent::Conversation

pub mod accounting;
pub mod budget;
pub mod prompt;
pub mod runner;
pub mod state;

pub use budget::{StopCheck, evaluate_budget, remaining_budget_usd};
pub use runner::{LoopConfig, RUN_LOCK_NAME, RunLoop, run_loop};
pub use state::{
    DEFAULT_PROVIDER, LoopMode, RunIdentity, RunLimits, RunState, RunStatus, STATE_FILE_NAME,
    default_state_path,
};

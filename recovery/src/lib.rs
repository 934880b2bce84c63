//! Failure recovery, checkpointing, and preflight for agent battles.
//!
//! A battle runs a coding agent against a task over repeated iterations. This
//! crate covers what happens around those iterations:
//!
//! - **[`core`]**: Pure logic. Failure classification, resume planning,
//!   checkpoint validation and retention, task risk, preflight tokens.
//! - **[`io`]**: Side effects. Git, child processes, config files,
//!   checkpoint backends, file watches, manual-fix sessions.
//! - **[`preflight`]**: The check registry and the runner that decides
//!   whether a battle may start.
//!
//! The crate keeps no state on disk. Checkpoints, reports, and sessions are
//! returned to the caller, which stores them with its battle history.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod preflight;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

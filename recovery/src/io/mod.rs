//! Side-effecting operations: git, child processes, config files, file
//! watches, and the manual-fix session registry.

pub mod checkpoint_store;
pub mod config;
pub mod git;
pub mod manual_fix;
pub mod process;
pub mod watch;

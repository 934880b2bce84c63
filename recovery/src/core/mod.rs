//! Deterministic, pure logic for battle recovery.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! records and return values suitable for tests; functions that depend on
//! the clock have an `_at` variant taking an explicit `now`.

pub mod checkpoint;
pub mod failure;
pub mod resume;
pub mod retention;
pub mod risk;
pub mod token;
pub mod types;

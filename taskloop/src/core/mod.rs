//! Deterministic, pure logic shared by the loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod capability;
pub mod graph;
pub mod ledger;
pub mod types;

//! Deterministic, pure logic shared by the execution loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod audit;
pub mod classifier;
pub mod correction;
pub mod events;
pub mod plan;
pub mod records;
pub mod types;
pub mod verification;

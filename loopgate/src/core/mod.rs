//! Deterministic, pure logic shared by the controller.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod audit;
pub mod classifier;
pub mod machine;
pub mod pool;
pub mod types;

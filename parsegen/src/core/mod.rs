//! Deterministic, pure logic shared by the agent core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod contract;
pub mod extract;
pub mod state;
pub mod types;
pub mod validator;

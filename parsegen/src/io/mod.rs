//! Side-effecting operations: filesystem, child processes, prompt rendering.

pub mod artifact;
pub mod attempt_log;
pub mod config;
pub mod generator;
pub mod preview;
pub mod process;
pub mod prompt;
pub mod reference;
pub mod sandbox;
pub mod target;

//! Agents that talk to the code-generation backend.

pub mod synthesizer;

//! Autonomous parser generation for bank-statement style documents.
//!
//! Given a target (a sample document and the table it should yield), the agent
//! asks a code generator for a parser, runs it in a throwaway sandbox, compares
//! the result cell by cell with the reference, and feeds any failure back into
//! the next prompt until a candidate passes or the attempt budget runs out.
//!
//! - **[`core`]**: Pure logic (types, loop states, result contract, validation).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config, targets, generator and
//!   sandbox processes, audit logs). Behind traits where tests need fakes.
//!
//! [`agents::synthesizer`] turns (target, history) into candidates, [`agent`]
//! drives the loop, and [`run`] wires both to the CLI.

pub mod agent;
pub mod agents;
pub mod cancel;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

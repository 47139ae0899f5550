//! Agent loop state machine.
//!
//! The loop is strictly sequential: each state owns at most one live
//! candidate, and `Retrying` is the only place that decides between another
//! round and exhaustion.

use serde::Serialize;

use crate::core::types::{AttemptRecord, CandidateArtifact, ExecutionOutcome};

/// Observable phase of the loop, reported on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Generating,
    Executing,
    Validating,
    Retrying,
    Done,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Generating => "generating",
            Phase::Executing => "executing",
            Phase::Validating => "validating",
            Phase::Retrying => "retrying",
            Phase::Done => "done",
        }
    }
}

/// How a run ended, before reporting.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Success(CandidateArtifact),
    Exhausted,
    Cancelled,
}

/// Loop state with the data each phase owns.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopState {
    Planning,
    Generating,
    Executing(CandidateArtifact),
    Validating(CandidateArtifact, ExecutionOutcome),
    Retrying(AttemptRecord),
    Done(Terminal),
}

impl LoopState {
    pub fn phase(&self) -> Phase {
        match self {
            LoopState::Planning => Phase::Planning,
            LoopState::Generating => Phase::Generating,
            LoopState::Executing(_) => Phase::Executing,
            LoopState::Validating(..) => Phase::Validating,
            LoopState::Retrying(_) => Phase::Retrying,
            LoopState::Done(_) => Phase::Done,
        }
    }
}

/// Next state after a failed attempt has been appended to the history.
///
/// Synthesis failures and validation failures count the same toward the
/// ceiling.
pub fn after_failure(attempts_made: u32, max_attempts: u32) -> LoopState {
    if attempts_made >= max_attempts {
        LoopState::Done(Terminal::Exhausted)
    } else {
        LoopState::Generating
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_below_ceiling() {
        assert_eq!(after_failure(1, 3), LoopState::Generating);
        assert_eq!(after_failure(2, 3), LoopState::Generating);
    }

    #[test]
    fn exhausts_at_ceiling() {
        assert_eq!(after_failure(3, 3), LoopState::Done(Terminal::Exhausted));
        assert_eq!(after_failure(1, 1), LoopState::Done(Terminal::Exhausted));
    }

    #[test]
    fn phases_have_stable_names() {
        assert_eq!(LoopState::Planning.phase().as_str(), "planning");
        assert_eq!(LoopState::Done(Terminal::Cancelled).phase(), Phase::Done);
    }
}

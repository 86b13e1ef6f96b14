//! Typed error enum for pipe construction and runs.
//!
//! [`PipeError`] is the single public error type of the runtime. Stage
//! implementations report failures as `anyhow::Error`; the runtime wraps
//! them into the `SetupFailed`/`Work` variants tagged with the stage uid.

use thiserror::Error;

use crate::uid::Uid;

#[derive(Debug, Error)]
pub enum PipeError {
    /// Pipe or buffer construction was rejected.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Human-readable rejection reason.
        reason: String,
    },
    /// A command is not legal in the pipe's current state.
    #[error("cannot {command} while pipe is {state}")]
    InvalidState {
        /// Rejected command name.
        command: &'static str,
        /// State the pipe was in.
        state: &'static str,
    },
    /// Channel counts of two blocks or wiring points disagree.
    #[error("channel count mismatch: expected {expected}, got {actual}")]
    ChannelMismatch {
        /// Channel count required by the receiving side.
        expected: usize,
        /// Channel count that was offered.
        actual: usize,
    },
    /// A stage instance was reused within a single run.
    #[error("stage instance already in use for this run")]
    SingleUseViolation,
    /// A stage's setup failed; the run was aborted before its runners
    /// started.
    #[error("setup failed for stage {uid}")]
    SetupFailed {
        /// Uid of the failing stage.
        uid: Uid,
        /// Failure reported by the stage implementation.
        #[source]
        source: anyhow::Error,
    },
    /// A stage's work call (produce/process/consume) failed mid-run.
    #[error("stage {uid} failed")]
    Work {
        /// Uid of the failing stage.
        uid: Uid,
        /// Failure reported by the stage implementation.
        #[source]
        source: anyhow::Error,
    },
    /// Several stages failed in one run; `first` triggered the
    /// cancellation, the rest surfaced while tearing down.
    #[error("{first} ({} related failure(s))", .related.len())]
    Multiple {
        /// First failure observed by the controller.
        first: Box<PipeError>,
        /// Failures observed after cancellation began.
        related: Vec<PipeError>,
    },
    /// The run was cancelled before completion. Not a failure; reported so
    /// callers can tell cancellation from a clean drain.
    #[error("run cancelled")]
    Cancelled,
    /// The controller thread is gone; the pipe can no longer be driven.
    #[error("pipe controller exited")]
    ControllerExited,
}

impl PipeError {
    /// The error that triggered the failure, unwrapping aggregation.
    pub fn primary(&self) -> &PipeError {
        match self {
            Self::Multiple { first, .. } => first,
            other => other,
        }
    }

    /// Uid of the failing stage, when the failure is stage-tagged.
    pub fn stage_uid(&self) -> Option<Uid> {
        match self.primary() {
            Self::SetupFailed { uid, .. } | Self::Work { uid, .. } => Some(*uid),
            _ => None,
        }
    }
}

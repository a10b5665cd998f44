//! # Error Taxonomy
//!
//! Typed errors for the cross-cutting failures that callers must branch on.
//! Ownership denials are not errors: they come back as `PermissionResult`.

use crate::state::mode::Mode;
use crate::validation::checks::CheckFailure;

/// Errors raised by the coordination core
#[derive(Debug, thiserror::Error)]
pub enum ForemanError {
    /// A mode transition was rejected before any mutation took place
    #[error("cannot enter {mode}: {reason}")]
    TransitionConflict {
        mode: Mode,
        conflicting_mode: Option<Mode>,
        reason: String,
        suggestion: Option<String>,
    },

    /// One or more required checks failed; carries every failure
    #[error("validation failed for session {session_id}: {} check(s) failed", failures.len())]
    ValidationFailed {
        session_id: String,
        failures: Vec<CheckFailure>,
    },

    /// A bypass precondition was not met; nothing was written
    #[error("bypass rejected: {0}")]
    BypassRejected(String),

    /// A path escaped its root or was absolute
    #[error("unsafe path '{path}': {reason}")]
    UnsafePath { path: String, reason: String },

    /// The ownership map has error diagnostics
    #[error("invalid ownership map: {}", .0.join("; "))]
    OwnershipInvalid(Vec<String>),

    #[error("unknown section: {0}")]
    UnknownSection(String),

    /// Duplicate ids, unknown dependencies, or a dependency cycle
    #[error("invalid section plan: {0}")]
    InvalidPlan(String),

    /// A supervisor step was called out of order
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("crystallization candidate not found: {0}")]
    CandidateNotFound(String),

    /// Candidate already approved or rejected
    #[error("candidate {id} is already {status}")]
    CandidateDecided { id: String, status: String },

    #[error("candidate {0} no longer meets the crystallization thresholds")]
    CandidateBelowThreshold(String),

    /// The tool sequence needs more privilege than the deployment allows
    #[error("pattern requires risk tier {required} but the maximum allowed is {maximum}")]
    RiskTierExceeded { required: u8, maximum: u8 },

    /// Durable state could not be written; in-memory state was rolled back
    #[error("failed to persist state: {0}")]
    Persistence(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ForemanError {
    /// The mode that blocked a transition, if any
    pub fn conflicting_mode(&self) -> Option<Mode> {
        match self {
            ForemanError::TransitionConflict {
                conflicting_mode, ..
            } => *conflicting_mode,
            _ => None,
        }
    }

    /// Failures carried by a validation error (empty for other kinds)
    pub fn failures(&self) -> &[CheckFailure] {
        match self {
            ForemanError::ValidationFailed { failures, .. } => failures,
            _ => &[],
        }
    }
}

pub type Result<T, E = ForemanError> = std::result::Result<T, E>;

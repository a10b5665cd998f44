//! # Validation
//!
//! Evidence-based completion: checks, the gate that runs them, and the audit
//! trail behind every pass, failure, and bypass.

pub mod audit;
pub mod checks;
pub mod gate;

pub use audit::{AuditAction, AuditEntry, AuditLog};
pub use checks::{
    CheckContext, CheckFailure, CheckKind, CheckResult, CheckRunner, CommandCheckRunner,
    StaticCheckRunner,
};
pub use gate::{
    BypassOutcome, BypassRequest, CompletionStatus, ValidationGate, ValidationOutcome,
    ValidationSession,
};

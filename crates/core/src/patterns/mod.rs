//! # Pattern Crystallization
//!
//! Observations of worker tool use, mined into risk-bounded skills that an
//! operator must approve.

pub mod crystallizer;
pub mod risk;
pub mod signature;
pub mod skill;
pub mod store;

pub use crystallizer::{PatternCrystallizer, RecordedObservation};
pub use risk::{classify_tool, required_tier, RiskTier, ToolClass, RISK_TIER_CEILING};
pub use signature::tool_signature;
pub use skill::{SkillDescriptor, SkillProvenance, SkillStore, SqliteSkillStore};
pub use store::{
    CandidateStatus, CrystallizationCandidate, Detection, NewObservation, Observation,
    ObservationStore, Outcome, Thresholds,
};

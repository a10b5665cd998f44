//! # Swarm Orchestration
//!
//! Sections, the supervisor that carries them through a session, and the
//! events it streams.
//!
//! ## Session Flow
//!
//! ```text
//! idle → planning → decomposing → executing (⟷ validating per section) → integrating → idle
//! ```

pub mod events;
pub mod sections;
pub mod supervisor;

pub use events::{SwarmEvent, SwarmEventKind};
pub use sections::{FileAction, Section, SectionFile, SectionPlan, SectionStatus};
pub use supervisor::Supervisor;

//! # Foreman Core
//!
//! Coordination core for parallel coding agents working in one repository.
//!
//! ## Architecture
//!
//! - `state/` - Runtime paths, the SQLite store, and the session Mode Registry
//! - `ownership/` - Ownership map, worker enforcement, and shared-file merge
//! - `validation/` - Completion checks, the validation gate, and its audit log
//! - `patterns/` - Observation store and the pattern crystallizer
//! - `swarm/` - Sections and the supervisor that drives a session
//!
//! ## Usage
//!
//! ```rust,ignore
//! use foreman_core::state::{ModeRegistry, Mode, EnterContext, RuntimePaths};
//!
//! let registry = ModeRegistry::open(&RuntimePaths::from_env("."));
//! registry.enter(Mode::Planning, &EnterContext::new().project("shop")).await?;
//! ```

pub mod config;
pub mod error;
pub mod ownership;
pub mod patterns;
pub mod state;
pub mod swarm;
pub mod validation;

pub use config::ForemanConfig;
pub use error::{ForemanError, Result};

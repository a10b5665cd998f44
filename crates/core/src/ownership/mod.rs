//! # Ownership
//!
//! Disjoint file ownership for parallel workers: the map built from section
//! claims, the per-worker checks against it, and the merge of shared-file
//! changes once a wave completes.

pub mod enforcement;
pub mod glob;
pub mod map;
pub mod merge;

pub use enforcement::{EnforcementContext, PermissionResult, SharedChangeKind, SharedFileChange};
pub use glob::GlobPattern;
pub use map::{
    build_ownership_map, build_ownership_map_with, FileOwnership, OwnershipClaim, OwnershipMap,
};
pub use merge::{apply_shared_file_changes, MergeReport};

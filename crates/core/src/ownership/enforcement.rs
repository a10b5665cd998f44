//! # Worker Enforcement
//!
//! Per-worker permission checks over the session's ownership map. Checks are
//! plain reads; a denial is a `PermissionResult`, never an error, and leaves
//! nothing behind.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::map::OwnershipMap;
use crate::state::io::normalize_path;

/// Outcome of a write, edit, or import check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub owning_section: Option<String>,
    pub is_shared_file: bool,
}

impl PermissionResult {
    fn allow(owning_section: Option<&str>) -> Self {
        Self {
            allowed: true,
            reason: None,
            owning_section: owning_section.map(str::to_string),
            is_shared_file: false,
        }
    }

    fn shared() -> Self {
        Self {
            allowed: true,
            reason: None,
            owning_section: None,
            is_shared_file: true,
        }
    }

    fn deny(owner: &str, reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            owning_section: Some(owner.to_string()),
            is_shared_file: false,
        }
    }
}

/// Payload of a shared-file change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SharedChangeKind {
    Dependency {
        name: String,
        version: String,
        #[serde(default)]
        dev: bool,
    },
    Script {
        name: String,
        command: String,
    },
    TypeExport {
        content: String,
    },
    Patch {
        content: String,
    },
}

impl SharedChangeKind {
    pub fn label(&self) -> &'static str {
        match self {
            SharedChangeKind::Dependency { .. } => "dependency",
            SharedChangeKind::Script { .. } => "script",
            SharedChangeKind::TypeExport { .. } => "type_export",
            SharedChangeKind::Patch { .. } => "patch",
        }
    }
}

/// Intent to modify a shared file, merged once after the wave completes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedFileChange {
    pub file: String,
    pub section_id: String,
    pub change: SharedChangeKind,
    #[serde(default)]
    pub description: String,
}

impl SharedFileChange {
    pub fn new(
        file: &str,
        section_id: impl Into<String>,
        change: SharedChangeKind,
        description: impl Into<String>,
    ) -> Self {
        Self {
            file: normalize_path(file),
            section_id: section_id.into(),
            change,
            description: description.into(),
        }
    }
}

// The description is free text and does not make a change distinct
impl PartialEq for SharedFileChange {
    fn eq(&self, other: &Self) -> bool {
        normalize_path(&self.file) == normalize_path(&other.file)
            && self.section_id == other.section_id
            && self.change == other.change
    }
}

impl Eq for SharedFileChange {}

/// One worker's view of the ownership map
#[derive(Debug, Clone)]
pub struct EnforcementContext {
    section_id: String,
    map: Arc<OwnershipMap>,
    shared_file_changes: Vec<SharedFileChange>,
}

impl EnforcementContext {
    pub fn new(section_id: impl Into<String>, map: Arc<OwnershipMap>) -> Self {
        Self {
            section_id: section_id.into(),
            map,
            shared_file_changes: Vec::new(),
        }
    }

    pub fn section_id(&self) -> &str {
        &self.section_id
    }

    pub fn map(&self) -> &OwnershipMap {
        &self.map
    }

    pub fn check_write_permission(&self, path: &str) -> PermissionResult {
        let path = normalize_path(path);
        if self.map.is_shared_file(&path) {
            return PermissionResult::shared();
        }

        match self.map.owner_of(&path, Some(&self.section_id)) {
            None => PermissionResult::allow(None),
            Some(owner) if owner == self.section_id => PermissionResult::allow(Some(owner)),
            Some(owner) => {
                tracing::warn!(
                    section_id = %self.section_id,
                    owner = %owner,
                    path = %path,
                    "Write denied"
                );
                PermissionResult::deny(
                    owner,
                    format!(
                        "{} is exclusively owned by section {}; section {} may not modify it",
                        path, owner, self.section_id
                    ),
                )
            }
        }
    }

    /// Same rules as a write
    pub fn check_edit_permission(&self, path: &str) -> PermissionResult {
        self.check_write_permission(path)
    }

    /// May this section import `target`?
    pub fn check_import_permission(&self, target: &str) -> PermissionResult {
        let target = normalize_path(target);
        if self.map.is_shared_file(&target) {
            return PermissionResult::shared();
        }

        match self.map.owner_of(&target, Some(&self.section_id)) {
            None => PermissionResult::allow(None),
            Some(owner) if owner == self.section_id => PermissionResult::allow(Some(owner)),
            Some(owner) if self.map.boundary_allows(&self.section_id, &target) => {
                PermissionResult::allow(Some(owner))
            }
            Some(owner) => {
                tracing::debug!(
                    section_id = %self.section_id,
                    owner = %owner,
                    target = %target,
                    "Import denied"
                );
                PermissionResult::deny(
                    owner,
                    format!(
                        "{} belongs to section {} and is not a declared dependency of section {}",
                        target, owner, self.section_id
                    ),
                )
            }
        }
    }

    /// Append to the shared-change log.
    ///
    /// Returns `false` for duplicates, changes stamped with another section,
    /// and changes to files that are not shared.
    pub fn record_shared_file_change(&mut self, change: SharedFileChange) -> bool {
        if change.section_id != self.section_id {
            tracing::warn!(
                section_id = %self.section_id,
                stamped = %change.section_id,
                "Shared change carries another section's id"
            );
            return false;
        }
        if !self.map.is_shared_file(&change.file) {
            tracing::warn!(
                section_id = %self.section_id,
                file = %change.file,
                "Shared change targets a file that is not shared"
            );
            return false;
        }
        if self.shared_file_changes.contains(&change) {
            tracing::debug!(file = %change.file, kind = change.change.label(), "Duplicate shared change ignored");
            return false;
        }

        tracing::debug!(
            section_id = %self.section_id,
            file = %change.file,
            kind = change.change.label(),
            "Shared change recorded"
        );
        self.shared_file_changes.push(change);
        true
    }

    pub fn shared_file_changes(&self) -> &[SharedFileChange] {
        &self.shared_file_changes
    }

    /// Hand the log over for merging
    pub fn into_shared_file_changes(self) -> Vec<SharedFileChange> {
        self.shared_file_changes
    }
}

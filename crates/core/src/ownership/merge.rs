//! # Shared File Merge
//!
//! Applies the shared-change logs of a finished wave to the working tree.
//!
//! 1. **Validate**: every target must resolve inside the project root, or
//!    nothing is written
//! 2. **Group**: by file, in arrival order
//! 3. **Apply**: `package.json` gets a key-wise structured merge (later
//!    writers win); every other file gets content appends, skipped when the
//!    content is already present

use anyhow::Context;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use super::enforcement::{SharedChangeKind, SharedFileChange};
use crate::error::Result;
use crate::state::io::{normalize_path, resolve_within};

/// Manifest sections merged key-wise
const MERGEABLE_KEYS: &[&str] = &[
    "dependencies",
    "devDependencies",
    "peerDependencies",
    "optionalDependencies",
    "scripts",
];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedChange {
    pub file: String,
    pub section_id: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedChange {
    pub file: String,
    pub section_id: String,
    pub kind: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub applied: Vec<AppliedChange>,
    pub skipped: Vec<SkippedChange>,
    pub files_written: Vec<String>,
}

impl MergeReport {
    fn applied(&mut self, change: &SharedFileChange) {
        self.applied.push(AppliedChange {
            file: normalize_path(&change.file),
            section_id: change.section_id.clone(),
            kind: change.change.label().to_string(),
        });
    }

    fn skipped(&mut self, change: &SharedFileChange, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::debug!(file = %change.file, section_id = %change.section_id, reason = %reason, "Shared change skipped");
        self.skipped.push(SkippedChange {
            file: normalize_path(&change.file),
            section_id: change.section_id.clone(),
            kind: change.change.label().to_string(),
            reason,
        });
    }
}

/// Apply shared-file changes under `project_root`
pub fn apply_shared_file_changes(
    changes: &[SharedFileChange],
    project_root: &Path,
) -> Result<MergeReport> {
    let mut groups: Vec<(String, Vec<&SharedFileChange>)> = Vec::new();
    for change in changes {
        let file = normalize_path(&change.file);
        match groups.iter_mut().find(|(f, _)| *f == file) {
            Some((_, group)) => group.push(change),
            None => groups.push((file, vec![change])),
        }
    }

    // Resolve everything up front so a bad path aborts before any write
    let mut targets: Vec<(String, PathBuf, Vec<&SharedFileChange>)> = Vec::new();
    for (file, group) in groups {
        let target = resolve_within(project_root, &file)?;
        targets.push((file, target, group));
    }

    let mut report = MergeReport::default();
    for (file, target, group) in targets {
        let written = if is_package_manifest(&file) {
            merge_manifest(&target, &group, &mut report)?
        } else {
            append_patches(&target, &group, &mut report)?
        };
        if written {
            report.files_written.push(file);
        }
    }

    tracing::info!(
        applied = report.applied.len(),
        skipped = report.skipped.len(),
        files = report.files_written.len(),
        "Shared file changes merged"
    );
    Ok(report)
}

fn is_package_manifest(file: &str) -> bool {
    file == "package.json" || file.ends_with("/package.json")
}

fn merge_manifest(
    target: &Path,
    changes: &[&SharedFileChange],
    report: &mut MergeReport,
) -> Result<bool> {
    let mut manifest = if target.exists() {
        let content = std::fs::read_to_string(target)
            .with_context(|| format!("Failed to read manifest: {:?}", target))?;
        serde_json::from_str::<Value>(&content)
            .with_context(|| format!("Manifest is not valid JSON: {:?}", target))?
    } else {
        Value::Object(Map::new())
    };

    let Some(root) = manifest.as_object_mut() else {
        for change in changes {
            report.skipped(change, "manifest is not a JSON object");
        }
        return Ok(false);
    };

    let mut changed = false;
    for change in changes {
        let fragment = match &change.change {
            SharedChangeKind::Dependency { name, version, dev } => {
                let key = if *dev { "devDependencies" } else { "dependencies" };
                let mut entries = Map::new();
                entries.insert(name.clone(), Value::String(version.clone()));
                Map::from_iter([(key.to_string(), Value::Object(entries))])
            }
            SharedChangeKind::Script { name, command } => {
                let mut entries = Map::new();
                entries.insert(name.clone(), Value::String(command.clone()));
                Map::from_iter([("scripts".to_string(), Value::Object(entries))])
            }
            SharedChangeKind::Patch { content } | SharedChangeKind::TypeExport { content } => {
                match serde_json::from_str::<Value>(content) {
                    Ok(Value::Object(fragment)) => fragment,
                    _ => {
                        report.skipped(change, "manifest patch is not a JSON object");
                        continue;
                    }
                }
            }
        };

        let mut merged_any = false;
        for (key, value) in fragment {
            let Value::Object(entries) = value else {
                report.skipped(change, format!("'{}' is not an object", key));
                continue;
            };
            if !MERGEABLE_KEYS.contains(&key.as_str()) {
                report.skipped(change, format!("'{}' is not a mergeable manifest section", key));
                continue;
            }

            let section = root
                .entry(key.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !section.is_object() {
                *section = Value::Object(Map::new());
            }
            if let Value::Object(existing) = section {
                for (name, version) in entries {
                    existing.insert(name, version);
                }
            }
            merged_any = true;
        }

        if merged_any {
            changed = true;
            report.applied(change);
        }
    }

    if changed {
        let rendered =
            serde_json::to_string_pretty(&manifest).context("Failed to serialize manifest")?;
        write_file(target, &format!("{}\n", rendered))?;
    }
    Ok(changed)
}

fn append_patches(
    target: &Path,
    changes: &[&SharedFileChange],
    report: &mut MergeReport,
) -> Result<bool> {
    let original = if target.exists() {
        std::fs::read_to_string(target).with_context(|| format!("Failed to read {:?}", target))?
    } else {
        String::new()
    };

    let mut content = original.clone();
    for change in changes {
        let patch = match &change.change {
            SharedChangeKind::Patch { content } | SharedChangeKind::TypeExport { content } => {
                content
            }
            SharedChangeKind::Dependency { .. } | SharedChangeKind::Script { .. } => {
                report.skipped(change, "only package manifests accept dependency and script changes");
                continue;
            }
        };

        let trimmed = patch.trim_end();
        if trimmed.is_empty() {
            report.skipped(change, "empty patch");
            continue;
        }
        if content.contains(trimmed) {
            report.skipped(change, "content already present");
            continue;
        }

        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(trimmed);
        content.push('\n');
        report.applied(change);
    }

    if content == original {
        return Ok(false);
    }
    write_file(target, &content)?;
    Ok(true)
}

fn write_file(target: &Path, content: &str) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }
    std::fs::write(target, content).with_context(|| format!("Failed to write {:?}", target))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForemanError;

    fn patch(file: &str, section: &str, content: &str) -> SharedFileChange {
        SharedFileChange::new(
            file,
            section,
            SharedChangeKind::Patch {
                content: content.to_string(),
            },
            "",
        )
    }

    #[test]
    fn test_manifest_later_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"name":"app","version":"1.0.0","dependencies":{"react":"^18.2.0"},"private":true}"#,
        )
        .unwrap();

        let changes = vec![
            patch("package.json", "S1", r#"{"dependencies":{"axios":"^1.0.0"}}"#),
            patch("package.json", "S2", r#"{"dependencies":{"axios":"^1.6.0"}}"#),
        ];
        let report = apply_shared_file_changes(&changes, dir.path()).unwrap();
        assert_eq!(report.applied.len(), 2);

        let merged: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("package.json")).unwrap())
                .unwrap();
        assert_eq!(merged["dependencies"]["axios"], "^1.6.0");
        assert_eq!(merged["dependencies"]["react"], "^18.2.0");
        assert_eq!(merged["name"], "app");
        assert_eq!(merged["private"], true);

        let keys: Vec<&String> = merged.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["name", "version", "dependencies", "private"]);
    }

    #[test]
    fn test_dependency_and_script_changes() {
        let dir = tempfile::tempdir().unwrap();
        let changes = vec![
            SharedFileChange::new(
                "web/package.json",
                "S1",
                SharedChangeKind::Dependency {
                    name: "vitest".into(),
                    version: "^1.0.0".into(),
                    dev: true,
                },
                "",
            ),
            SharedFileChange::new(
                "web/package.json",
                "S1",
                SharedChangeKind::Script {
                    name: "test".into(),
                    command: "vitest run".into(),
                },
                "",
            ),
        ];
        let report = apply_shared_file_changes(&changes, dir.path()).unwrap();
        assert_eq!(report.files_written, vec!["web/package.json"]);

        let merged: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("web/package.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(merged["devDependencies"]["vitest"], "^1.0.0");
        assert_eq!(merged["scripts"]["test"], "vitest run");
    }

    #[test]
    fn test_text_patches_append_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/types")).unwrap();
        std::fs::write(dir.path().join("src/types/index.ts"), "export type Id = string;").unwrap();

        let changes = vec![
            SharedFileChange::new(
                "src/types/index.ts",
                "S1",
                SharedChangeKind::TypeExport {
                    content: "export type User = { id: Id };".into(),
                },
                "",
            ),
            patch("src/types/index.ts", "S2", "export type User = { id: Id };\n"),
            patch("src/types/index.ts", "S2", "export type Id = string;"),
        ];
        let report = apply_shared_file_changes(&changes, dir.path()).unwrap();
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.skipped.len(), 2);

        let content = std::fs::read_to_string(dir.path().join("src/types/index.ts")).unwrap();
        assert_eq!(content, "export type Id = string;\nexport type User = { id: Id };\n");
    }

    #[test]
    fn test_dependency_on_plain_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let changes = vec![SharedFileChange::new(
            "README.md",
            "S1",
            SharedChangeKind::Dependency {
                name: "x".into(),
                version: "1".into(),
                dev: false,
            },
            "",
        )];
        let report = apply_shared_file_changes(&changes, dir.path()).unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert!(!dir.path().join("README.md").exists());
    }

    #[test]
    fn test_traversal_aborts_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let changes = vec![
            patch("notes.md", "S1", "hello"),
            patch("../escape.md", "S1", "oops"),
        ];
        let err = apply_shared_file_changes(&changes, dir.path()).unwrap_err();
        assert!(matches!(err, ForemanError::UnsafePath { .. }));
        assert!(!dir.path().join("notes.md").exists());

        let err = apply_shared_file_changes(&[patch("/etc/hosts", "S1", "x")], dir.path())
            .unwrap_err();
        assert!(matches!(err, ForemanError::UnsafePath { .. }));
    }

    #[test]
    fn test_malformed_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), "{ broken").unwrap();
        let changes = vec![patch("package.json", "S1", r#"{"dependencies":{"a":"1"}}"#)];
        assert!(apply_shared_file_changes(&changes, dir.path()).is_err());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("package.json")).unwrap(),
            "{ broken"
        );
    }
}

//! # Validation Audit Log
//!
//! Append-only JSONL trail of validation outcomes and bypasses. One entry
//! per line; entries are never rewritten.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::checks::{CheckFailure, CheckKind};
use crate::error::ForemanError;
use crate::state::io::RuntimePaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ValidationPassed,
    ValidationFailed,
    BypassApproved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    /// Checks evaluated, or bypassed for `bypass_approved`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<CheckKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<CheckFailure>,
    /// Recommended checks that failed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<CheckFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEntry {
    pub fn new(session_id: impl Into<String>, action: AuditAction) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id: session_id.into(),
            action,
            section_id: None,
            checks: Vec::new(),
            failures: Vec::new(),
            warnings: Vec::new(),
            user: None,
            reason: None,
        }
    }
}

pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    /// Log at `relative` inside the runtime directory; traversal is rejected
    pub fn new(paths: &RuntimePaths, relative: &str) -> Result<Self, ForemanError> {
        let path = paths.runtime_file(relative)?;
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry).context("Failed to serialize audit entry")?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create audit directory: {:?}", parent))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open audit log: {:?}", self.path))?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to append audit entry")?;
        file.sync_data().await.context("Failed to sync audit log")?;

        tracing::debug!(session_id = %entry.session_id, action = ?entry.action, "Audit entry appended");
        Ok(())
    }

    /// Every parseable entry, oldest first
    pub async fn read_all(&self) -> Result<Vec<AuditEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read audit log: {:?}", self.path))
            }
        };

        let mut entries = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(line = idx + 1, error = %e, "Skipping malformed audit line"),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(&RuntimePaths::new(dir.path()), "audit/validation.jsonl").unwrap();

        let mut failed = AuditEntry::new("s1", AuditAction::ValidationFailed);
        failed.failures.push(CheckFailure {
            check: CheckKind::Lint,
            details: Some("3 errors".into()),
        });
        log.append(&failed).await.unwrap();
        log.append(&AuditEntry::new("s1", AuditAction::ValidationPassed))
            .await
            .unwrap();

        let entries = log.read_all().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], failed);
        assert_eq!(entries[1].action, AuditAction::ValidationPassed);

        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert!(raw.lines().next().unwrap().contains("\"action\":\"validation_failed\""));
    }

    #[tokio::test]
    async fn test_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(&RuntimePaths::new(dir.path()), "audit.jsonl").unwrap();
        assert!(log.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(&RuntimePaths::new(dir.path()), "audit.jsonl").unwrap();
        log.append(&AuditEntry::new("s1", AuditAction::BypassApproved))
            .await
            .unwrap();
        let mut raw = std::fs::read_to_string(log.path()).unwrap();
        raw.push_str("not json\n");
        std::fs::write(log.path(), raw).unwrap();

        assert_eq!(log.read_all().await.unwrap().len(), 1);
    }

    #[test]
    fn test_log_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::new(dir.path());
        for bad in ["../audit.jsonl", "/var/log/audit.jsonl", "a/../../b"] {
            assert!(matches!(
                AuditLog::new(&paths, bad),
                Err(ForemanError::UnsafePath { .. })
            ));
        }
    }
}

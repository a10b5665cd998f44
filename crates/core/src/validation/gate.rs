//! # Validation Gate
//!
//! A section is complete only on evidence: every enabled required check
//! passes, or an operator records an audited bypass. Every outcome lands in
//! the audit log.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use super::audit::{AuditAction, AuditEntry, AuditLog};
use super::checks::{CheckContext, CheckFailure, CheckKind, CheckResult, CheckRunner};
use crate::config::{ForemanConfig, ValidationGateConfig};
use crate::error::{ForemanError, Result};
use crate::state::io::RuntimePaths;

/// What is being validated
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSession {
    pub session_id: String,
    pub project_root: PathBuf,
    #[serde(default)]
    pub section_id: Option<String>,
}

impl ValidationSession {
    pub fn new(session_id: impl Into<String>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            project_root: project_root.into(),
            section_id: None,
        }
    }

    pub fn for_section(mut self, section_id: impl Into<String>) -> Self {
        self.section_id = Some(section_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    CompletedWithBypass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub status: CompletionStatus,
    pub validation_passed: bool,
    pub results: Vec<CheckResult>,
    /// Recommended checks that failed; never blocking
    pub warnings: Vec<CheckFailure>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BypassRequest {
    pub user: String,
    pub reason: String,
    #[serde(default)]
    pub acknowledge_risk: bool,
    /// Checks being bypassed; empty means every enabled required check
    #[serde(default)]
    pub checks: Vec<CheckKind>,
    #[serde(default)]
    pub section_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BypassOutcome {
    pub status: CompletionStatus,
    pub entry: AuditEntry,
}

pub struct ValidationGate {
    config: ValidationGateConfig,
    runner: Arc<dyn CheckRunner>,
    audit: AuditLog,
}

impl ValidationGate {
    pub fn new(config: ValidationGateConfig, runner: Arc<dyn CheckRunner>, audit: AuditLog) -> Self {
        Self {
            config,
            runner,
            audit,
        }
    }

    /// Gate with its audit log at the configured location
    pub fn from_config(
        paths: &RuntimePaths,
        config: &ForemanConfig,
        runner: Arc<dyn CheckRunner>,
    ) -> Result<Self> {
        let audit = AuditLog::new(paths, &config.validation.audit_log)?;
        Ok(Self::new(config.validation.clone(), runner, audit))
    }

    pub fn config(&self) -> &ValidationGateConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Run every enabled required check; all failures are collected.
    ///
    /// Recommended checks only run once the required ones pass.
    #[tracing::instrument(skip(self, session), fields(session_id = %session.session_id))]
    pub async fn validate_completion(&self, session: &ValidationSession) -> Result<ValidationOutcome> {
        let ctx = CheckContext {
            project_root: session.project_root.clone(),
            coverage_threshold: self.config.recommended.coverage_threshold,
        };

        let required = self.config.required.enabled();
        let mut results = Vec::with_capacity(required.len());
        for check in &required {
            results.push(self.run_check(*check, &ctx).await);
        }
        let failures: Vec<CheckFailure> = results.iter().filter_map(CheckResult::failure).collect();

        if !failures.is_empty() {
            let mut entry = AuditEntry::new(&session.session_id, AuditAction::ValidationFailed);
            entry.section_id = session.section_id.clone();
            entry.checks = required;
            entry.failures = failures.clone();
            if let Err(e) = self.audit.append(&entry).await {
                tracing::error!(error = %e, "Failed to audit validation failure");
            }

            tracing::warn!(
                failed = failures.len(),
                checks = %failures.iter().map(|f| f.check.as_str()).collect::<Vec<_>>().join(","),
                "Validation failed"
            );
            return Err(ForemanError::ValidationFailed {
                session_id: session.session_id.clone(),
                failures,
            });
        }

        let mut warnings = Vec::new();
        for check in self.config.recommended.enabled() {
            let result = self.run_check(check, &ctx).await;
            if let Some(failure) = result.failure() {
                tracing::warn!(check = %check, "Recommended check failed");
                warnings.push(failure);
            }
            results.push(result);
        }

        let mut entry = AuditEntry::new(&session.session_id, AuditAction::ValidationPassed);
        entry.section_id = session.section_id.clone();
        entry.checks = required;
        entry.warnings = warnings.clone();
        self.audit.append(&entry).await?;

        tracing::info!(checks = results.len(), warnings = warnings.len(), "Validation passed");
        Ok(ValidationOutcome {
            status: CompletionStatus::Completed,
            validation_passed: true,
            results,
            warnings,
        })
    }

    /// Record an audited bypass. Any unmet precondition rejects the request
    /// before anything is written.
    pub async fn request_validation_bypass(
        &self,
        session_id: &str,
        request: BypassRequest,
    ) -> Result<BypassOutcome> {
        let policy = &self.config.bypass;
        let reject = |message: &str| {
            tracing::warn!(session_id = %session_id, reason = %message, "Bypass rejected");
            Err(ForemanError::BypassRejected(message.to_string()))
        };

        if !policy.enabled {
            return reject("validation bypass is disabled");
        }
        if !policy.audit_logged {
            return reject("validation bypass requires audit logging");
        }

        let user = request.user.trim();
        if user.is_empty() {
            return reject("a user must be named");
        }

        let reason: String = request
            .reason
            .trim()
            .chars()
            .take(self.config.max_bypass_reason_len)
            .collect();
        if policy.require_reason && reason.is_empty() {
            return reject("a reason is required");
        }
        if !request.acknowledge_risk {
            return reject("the risk of bypassing validation must be acknowledged");
        }

        let mut checks = Vec::new();
        let requested = if request.checks.is_empty() {
            self.config.required.enabled()
        } else {
            request.checks
        };
        for check in requested {
            if !checks.contains(&check) {
                checks.push(check);
            }
        }

        let mut entry = AuditEntry::new(session_id, AuditAction::BypassApproved);
        entry.section_id = request.section_id;
        entry.checks = checks;
        entry.user = Some(user.to_string());
        entry.reason = (!reason.is_empty()).then_some(reason);
        self.audit.append(&entry).await?;

        tracing::info!(
            session_id = %session_id,
            user = %user,
            checks = entry.checks.len(),
            "Validation bypass approved"
        );
        Ok(BypassOutcome {
            status: CompletionStatus::CompletedWithBypass,
            entry,
        })
    }

    /// A runner error becomes a failed result carrying the error text
    async fn run_check(&self, check: CheckKind, ctx: &CheckContext) -> CheckResult {
        match self.runner.run(check, ctx).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(check = %check, error = %e, "Check could not run");
                CheckResult::fail(check, format!("check could not run: {:#}", e))
            }
        }
    }
}

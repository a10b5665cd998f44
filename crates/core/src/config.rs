//! # Configuration
//!
//! Workspace configuration persisted at `.foreman/config.json`.
//! Every field has a default, so a missing or partial file is fine; a
//! malformed file falls back to defaults with a warning.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::state::io::RuntimePaths;
use crate::validation::checks::CheckKind;

/// Config file name inside the runtime directory
pub const CONFIG_FILE: &str = "config.json";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForemanConfig {
    #[serde(default)]
    pub validation: ValidationGateConfig,
    #[serde(default)]
    pub checks: CheckCommands,
    #[serde(default)]
    pub ownership: OwnershipConfig,
    #[serde(default)]
    pub patterns: CrystallizerConfig,
}

impl ForemanConfig {
    /// Load from the runtime directory, falling back to defaults
    pub fn load(paths: &RuntimePaths) -> Self {
        let path = paths.runtime_dir().join(CONFIG_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => return Self::default(),
        };

        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Malformed config, using defaults");
                Self::default()
            }
        }
    }

    /// Write to the runtime directory
    pub fn save(&self, paths: &RuntimePaths) -> Result<()> {
        let dir = paths.ensure_runtime_dir()?;
        let path = dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config: {:?}", path))
    }
}

// ============================================================================
// Validation Gate
// ============================================================================

/// Gate configuration: which checks run and how bypass is governed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationGateConfig {
    #[serde(default)]
    pub required: RequiredChecks,
    #[serde(default)]
    pub recommended: RecommendedChecks,
    #[serde(default)]
    pub bypass: BypassPolicy,
    /// Audit log location, relative to the runtime directory
    #[serde(default = "default_audit_log")]
    pub audit_log: String,
    #[serde(default = "default_max_reason_len")]
    pub max_bypass_reason_len: usize,
}

impl Default for ValidationGateConfig {
    fn default() -> Self {
        Self {
            required: RequiredChecks::default(),
            recommended: RecommendedChecks::default(),
            bypass: BypassPolicy::default(),
            audit_log: default_audit_log(),
            max_bypass_reason_len: default_max_reason_len(),
        }
    }
}

fn default_audit_log() -> String {
    "audit/validation.jsonl".to_string()
}

fn default_max_reason_len() -> usize {
    500
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiredChecks {
    #[serde(default = "default_true")]
    pub typecheck: bool,
    #[serde(default = "default_true")]
    pub lint: bool,
    #[serde(default = "default_true")]
    pub tests: bool,
    #[serde(default = "default_true")]
    pub build: bool,
}

impl Default for RequiredChecks {
    fn default() -> Self {
        Self {
            typecheck: true,
            lint: true,
            tests: true,
            build: true,
        }
    }
}

impl RequiredChecks {
    /// Enabled required checks in evaluation order
    pub fn enabled(&self) -> Vec<CheckKind> {
        let mut checks = Vec::new();
        if self.typecheck {
            checks.push(CheckKind::Typecheck);
        }
        if self.lint {
            checks.push(CheckKind::Lint);
        }
        if self.tests {
            checks.push(CheckKind::Tests);
        }
        if self.build {
            checks.push(CheckKind::Build);
        }
        checks
    }
}

/// Non-blocking checks; failures surface as warnings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecommendedChecks {
    #[serde(default)]
    pub security_scan: bool,
    #[serde(default)]
    pub e2e: bool,
    /// Minimum coverage percentage; `None` disables the coverage check
    #[serde(default)]
    pub coverage_threshold: Option<f64>,
}

impl RecommendedChecks {
    pub fn enabled(&self) -> Vec<CheckKind> {
        let mut checks = Vec::new();
        if self.security_scan {
            checks.push(CheckKind::SecurityScan);
        }
        if self.e2e {
            checks.push(CheckKind::E2e);
        }
        if self.coverage_threshold.is_some() {
            checks.push(CheckKind::Coverage);
        }
        checks
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub require_reason: bool,
    #[serde(default = "default_true")]
    pub audit_logged: bool,
}

impl Default for BypassPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            require_reason: true,
            audit_logged: true,
        }
    }
}

// ============================================================================
// Check Commands
// ============================================================================

/// Shell commands backing each check kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckCommands {
    #[serde(default = "default_commands")]
    pub commands: BTreeMap<CheckKind, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CheckCommands {
    fn default() -> Self {
        Self {
            commands: default_commands(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_commands() -> BTreeMap<CheckKind, String> {
    BTreeMap::from([
        (CheckKind::Typecheck, "npm run typecheck".to_string()),
        (CheckKind::Lint, "npm run lint".to_string()),
        (CheckKind::Tests, "npm test".to_string()),
        (CheckKind::Build, "npm run build".to_string()),
        (CheckKind::SecurityScan, "npm audit".to_string()),
        (CheckKind::E2e, "npm run e2e".to_string()),
        (CheckKind::Coverage, "npm run coverage".to_string()),
    ])
}

fn default_timeout_secs() -> u64 {
    600
}

// ============================================================================
// Ownership
// ============================================================================

/// Paths every section may write by policy, regardless of claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnershipConfig {
    #[serde(default = "default_shared_patterns")]
    pub shared_patterns: Vec<String>,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            shared_patterns: default_shared_patterns(),
        }
    }
}

pub fn default_shared_patterns() -> Vec<String> {
    [
        // Type definitions
        "**/*.d.ts",
        "**/types/**",
        // Shared code
        "**/shared/**",
        "**/common/**",
        "**/utils/**",
        "**/util/**",
        // Package and build configuration
        "**/package.json",
        "**/package-lock.json",
        "**/pnpm-lock.yaml",
        "**/yarn.lock",
        "**/tsconfig*.json",
        "**/vite.config.*",
        "**/Cargo.toml",
        "**/Cargo.lock",
        // Lint and format configuration
        "**/.eslintrc*",
        "**/eslint.config.*",
        "**/.prettierrc*",
        "**/prettier.config.*",
        // Docs
        "**/*.md",
        "**/docs/**",
        // Environment
        "**/.env",
        "**/.env.*",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

// ============================================================================
// Pattern Crystallizer
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrystallizerConfig {
    #[serde(default = "default_min_observations")]
    pub min_observations: u32,
    #[serde(default = "default_min_sessions")]
    pub min_distinct_sessions: u32,
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
    /// Delay before a new observation counts toward detection
    #[serde(default = "default_quarantine_secs")]
    pub quarantine_secs: u64,
    /// Deployment ceiling for crystallized skills (clamped to 2)
    #[serde(default = "default_max_risk_tier")]
    pub max_risk_tier: u8,
    #[serde(default = "default_skill_ttl_days")]
    pub skill_ttl_days: i64,
}

impl Default for CrystallizerConfig {
    fn default() -> Self {
        Self {
            min_observations: default_min_observations(),
            min_distinct_sessions: default_min_sessions(),
            min_success_rate: default_min_success_rate(),
            quarantine_secs: default_quarantine_secs(),
            max_risk_tier: default_max_risk_tier(),
            skill_ttl_days: default_skill_ttl_days(),
        }
    }
}

fn default_min_observations() -> u32 {
    5
}

fn default_min_sessions() -> u32 {
    3
}

fn default_min_success_rate() -> f64 {
    0.7
}

fn default_quarantine_secs() -> u64 {
    300
}

fn default_max_risk_tier() -> u8 {
    2
}

fn default_skill_ttl_days() -> i64 {
    30
}

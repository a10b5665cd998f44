//! # Verification Checks
//!
//! The gate treats a check as an opaque pass/fail plus detail text. Where
//! that result comes from is behind [`CheckRunner`]: shell commands in
//! production, canned results in tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::config::CheckCommands;

/// Lines of combined output kept as failure detail
const OUTPUT_TAIL_LINES: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Typecheck,
    Lint,
    Tests,
    Build,
    SecurityScan,
    E2e,
    Coverage,
}

impl CheckKind {
    pub const ALL: [CheckKind; 7] = [
        CheckKind::Typecheck,
        CheckKind::Lint,
        CheckKind::Tests,
        CheckKind::Build,
        CheckKind::SecurityScan,
        CheckKind::E2e,
        CheckKind::Coverage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Typecheck => "typecheck",
            CheckKind::Lint => "lint",
            CheckKind::Tests => "tests",
            CheckKind::Build => "build",
            CheckKind::SecurityScan => "security_scan",
            CheckKind::E2e => "e2e",
            CheckKind::Coverage => "coverage",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        CheckKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| format!("unknown check: {}", s))
    }
}

/// What a runner needs to evaluate one check
#[derive(Debug, Clone)]
pub struct CheckContext {
    pub project_root: PathBuf,
    /// Minimum coverage percentage for [`CheckKind::Coverage`]
    pub coverage_threshold: Option<f64>,
}

impl CheckContext {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            coverage_threshold: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub check: CheckKind,
    pub passed: bool,
    pub details: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl CheckResult {
    pub fn pass(check: CheckKind) -> Self {
        Self {
            check,
            passed: true,
            details: None,
            duration_ms: 0,
        }
    }

    pub fn fail(check: CheckKind, details: impl Into<String>) -> Self {
        Self {
            check,
            passed: false,
            details: Some(details.into()),
            duration_ms: 0,
        }
    }

    pub fn failure(&self) -> Option<CheckFailure> {
        if self.passed {
            None
        } else {
            Some(CheckFailure {
                check: self.check,
                details: self.details.clone(),
            })
        }
    }
}

/// A failed check, as carried by errors and audit entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckFailure {
    pub check: CheckKind,
    pub details: Option<String>,
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{}: {}", self.check, details),
            None => write!(f, "{}", self.check),
        }
    }
}

#[async_trait]
pub trait CheckRunner: Send + Sync {
    /// Evaluate one check. An `Err` means the check could not be run at all.
    async fn run(&self, check: CheckKind, ctx: &CheckContext) -> Result<CheckResult>;
}

// ============================================================================
// Command runner
// ============================================================================

/// Runs the configured shell command for each check in the project root
#[derive(Debug, Clone)]
pub struct CommandCheckRunner {
    commands: BTreeMap<CheckKind, String>,
    timeout: Duration,
}

impl CommandCheckRunner {
    pub fn new(commands: BTreeMap<CheckKind, String>, timeout: Duration) -> Self {
        Self { commands, timeout }
    }

    pub fn from_config(config: &CheckCommands) -> Self {
        Self::new(
            config.commands.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn shell(command: &str) -> Command {
        if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", command]);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", command]);
            cmd
        }
    }
}

#[async_trait]
impl CheckRunner for CommandCheckRunner {
    async fn run(&self, check: CheckKind, ctx: &CheckContext) -> Result<CheckResult> {
        let command = self
            .commands
            .get(&check)
            .with_context(|| format!("No command configured for check {}", check))?;

        tracing::debug!(check = %check, command = %command, "Running check");
        let started = Instant::now();

        let child = Self::shell(command)
            .current_dir(&ctx.project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", command))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.with_context(|| format!("Failed to run '{}'", command))?,
            Err(_) => {
                let mut result = CheckResult::fail(
                    check,
                    format!("'{}' timed out after {:?}", command, self.timeout),
                );
                result.duration_ms = started.elapsed().as_millis() as u64;
                return Ok(result);
            }
        };

        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        let mut result = if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            CheckResult::fail(check, format!("exit {}\n{}", code, tail(&combined)))
        } else if check == CheckKind::Coverage {
            evaluate_coverage(&combined, ctx.coverage_threshold)
        } else {
            CheckResult::pass(check)
        };
        result.duration_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }
}

fn tail(output: &str) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines[start..].join("\n")
}

/// The last `NN.N%` in the output is taken as the coverage figure
fn evaluate_coverage(output: &str, threshold: Option<f64>) -> CheckResult {
    let Some(threshold) = threshold else {
        return CheckResult::pass(CheckKind::Coverage);
    };

    let measured = Regex::new(r"(\d+(?:\.\d+)?)\s*%")
        .ok()
        .and_then(|re| {
            re.captures_iter(output)
                .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse::<f64>().ok()))
                .last()
        });

    match measured {
        Some(value) if value >= threshold => CheckResult::pass(CheckKind::Coverage),
        Some(value) => CheckResult::fail(
            CheckKind::Coverage,
            format!("coverage {:.1}% is below the {:.1}% threshold", value, threshold),
        ),
        None => CheckResult::fail(
            CheckKind::Coverage,
            "no coverage percentage found in output",
        ),
    }
}

// ============================================================================
// Static runner
// ============================================================================

/// Canned results; every check passes unless told otherwise
#[derive(Debug, Default)]
pub struct StaticCheckRunner {
    failures: HashMap<CheckKind, String>,
    errors: HashMap<CheckKind, String>,
    calls: Mutex<Vec<CheckKind>>,
}

impl StaticCheckRunner {
    pub fn passing() -> Self {
        Self::default()
    }

    pub fn failing(mut self, check: CheckKind, details: impl Into<String>) -> Self {
        self.failures.insert(check, details.into());
        self
    }

    /// Make `check` unrunnable
    pub fn erroring(mut self, check: CheckKind, message: impl Into<String>) -> Self {
        self.errors.insert(check, message.into());
        self
    }

    /// Checks run so far, in order
    pub fn calls(&self) -> Vec<CheckKind> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CheckRunner for StaticCheckRunner {
    async fn run(&self, check: CheckKind, _ctx: &CheckContext) -> Result<CheckResult> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(check);
        }
        if let Some(message) = self.errors.get(&check) {
            anyhow::bail!("{}", message);
        }
        Ok(match self.failures.get(&check) {
            Some(details) => CheckResult::fail(check, details.clone()),
            None => CheckResult::pass(check),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_kind_parse() {
        assert_eq!("typecheck".parse::<CheckKind>().unwrap(), CheckKind::Typecheck);
        assert_eq!("security-scan".parse::<CheckKind>().unwrap(), CheckKind::SecurityScan);
        assert!("deploy".parse::<CheckKind>().is_err());
        assert_eq!(
            serde_json::to_string(&CheckKind::SecurityScan).unwrap(),
            "\"security_scan\""
        );
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let output: String = (1..=100).map(|i| format!("line {}\n", i)).collect();
        let kept = tail(&output);
        assert_eq!(kept.lines().count(), OUTPUT_TAIL_LINES);
        assert!(kept.starts_with("line 61"));
        assert!(kept.ends_with("line 100"));
    }

    #[test]
    fn test_coverage_threshold() {
        let output = "Statements : 91.2%\nAll files | 78.5 %";
        assert!(!evaluate_coverage(output, Some(80.0)).passed);
        assert!(evaluate_coverage(output, Some(75.0)).passed);
        assert!(!evaluate_coverage("no numbers", Some(10.0)).passed);
        assert!(evaluate_coverage("no numbers", None).passed);
    }

    #[tokio::test]
    async fn test_static_runner() {
        let runner = StaticCheckRunner::passing()
            .failing(CheckKind::Lint, "2 errors")
            .erroring(CheckKind::Build, "no toolchain");
        let ctx = CheckContext::new(".");

        assert!(runner.run(CheckKind::Typecheck, &ctx).await.unwrap().passed);
        let lint = runner.run(CheckKind::Lint, &ctx).await.unwrap();
        assert_eq!(lint.failure().unwrap().details.as_deref(), Some("2 errors"));
        assert!(runner.run(CheckKind::Build, &ctx).await.is_err());
        assert_eq!(
            runner.calls(),
            vec![CheckKind::Typecheck, CheckKind::Lint, CheckKind::Build]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_runner_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let runner = CommandCheckRunner::new(
            BTreeMap::from([
                (CheckKind::Lint, "echo ok".to_string()),
                (CheckKind::Tests, "echo first; echo 'boom' 1>&2; exit 3".to_string()),
            ]),
            Duration::from_secs(30),
        );
        let ctx = CheckContext::new(dir.path());

        assert!(runner.run(CheckKind::Lint, &ctx).await.unwrap().passed);

        let tests = runner.run(CheckKind::Tests, &ctx).await.unwrap();
        assert!(!tests.passed);
        let details = tests.details.unwrap();
        assert!(details.starts_with("exit 3"));
        assert!(details.contains("boom"));

        assert!(runner.run(CheckKind::Build, &ctx).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_runner_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let runner = CommandCheckRunner::new(
            BTreeMap::from([(CheckKind::E2e, "sleep 5".to_string())]),
            Duration::from_millis(100),
        );
        let result = runner
            .run(CheckKind::E2e, &CheckContext::new(dir.path()))
            .await
            .unwrap();
        assert!(!result.passed);
        let details = result.details.unwrap();
        assert!(details.contains("timed out after 100ms"), "{details}");
    }
}

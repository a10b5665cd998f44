//! # Risk Tiers
//!
//! A crystallized skill may never carry more privilege than the tools it
//! replays. Tier 1 tools only read or call approved skill-management
//! operations; tier 2 tools change code or run commands; anything this
//! module does not recognize is tier 3 and cannot be crystallized.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::signature::normalize_tool;
use crate::error::{ForemanError, Result};

/// Hard ceiling for any crystallized skill
pub const RISK_TIER_CEILING: u8 = 2;

const READ_ONLY_TOOLS: &[&str] = &[
    "read",
    "grep",
    "glob",
    "ls",
    "search",
    "webfetch",
    "websearch",
    "notebookread",
    "todoread",
];

const SKILL_TOOLS: &[&str] = &["skill_list", "skill_get", "skill_invoke"];

const CODE_MUTATION_TOOLS: &[&str] = &["write", "edit", "multiedit", "notebookedit", "todowrite"];

const COMMAND_TOOLS: &[&str] = &["bash", "shell", "exec", "task"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum RiskTier {
    ReadOnly = 1,
    Mutating = 2,
    Unclassified = 3,
}

impl RiskTier {
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl From<RiskTier> for u8 {
    fn from(tier: RiskTier) -> u8 {
        tier.level()
    }
}

impl TryFrom<u8> for RiskTier {
    type Error = String;

    fn try_from(level: u8) -> std::result::Result<Self, Self::Error> {
        match level {
            1 => Ok(RiskTier::ReadOnly),
            2 => Ok(RiskTier::Mutating),
            3 => Ok(RiskTier::Unclassified),
            other => Err(format!("invalid risk tier: {}", other)),
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolClass {
    ReadOnly,
    SkillManagement,
    CodeMutation,
    CommandExecution,
    Unclassified,
}

impl ToolClass {
    pub fn tier(self) -> RiskTier {
        match self {
            ToolClass::ReadOnly | ToolClass::SkillManagement => RiskTier::ReadOnly,
            ToolClass::CodeMutation | ToolClass::CommandExecution => RiskTier::Mutating,
            ToolClass::Unclassified => RiskTier::Unclassified,
        }
    }
}

/// Case-insensitive; `mcp__*` tools are always unclassified
pub fn classify_tool(tool: &str) -> ToolClass {
    let name = normalize_tool(tool);
    let name = name.as_str();
    if name.starts_with("mcp__") {
        ToolClass::Unclassified
    } else if READ_ONLY_TOOLS.contains(&name) {
        ToolClass::ReadOnly
    } else if SKILL_TOOLS.contains(&name) {
        ToolClass::SkillManagement
    } else if CODE_MUTATION_TOOLS.contains(&name) {
        ToolClass::CodeMutation
    } else if COMMAND_TOOLS.contains(&name) {
        ToolClass::CommandExecution
    } else {
        ToolClass::Unclassified
    }
}

/// Highest tier any tool in the sequence needs
pub fn required_tier<S: AsRef<str>>(tools: &[S]) -> RiskTier {
    tools
        .iter()
        .map(|t| classify_tool(t.as_ref()).tier())
        .max()
        .unwrap_or(RiskTier::ReadOnly)
}

/// `min(required, ceiling, configured)`, refusing when that would be below
/// `required`
pub fn effective_tier(required: RiskTier, configured_max: u8) -> Result<RiskTier> {
    let maximum = configured_max.min(RISK_TIER_CEILING);
    if required.level() > maximum {
        return Err(ForemanError::RiskTierExceeded {
            required: required.level(),
            maximum,
        });
    }
    Ok(required)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(classify_tool("Read"), ToolClass::ReadOnly);
        assert_eq!(classify_tool("skill_invoke"), ToolClass::SkillManagement);
        assert_eq!(classify_tool("MultiEdit"), ToolClass::CodeMutation);
        assert_eq!(classify_tool("Bash"), ToolClass::CommandExecution);
        assert_eq!(classify_tool("mcp__github__create_pr"), ToolClass::Unclassified);
        assert_eq!(classify_tool("deploy"), ToolClass::Unclassified);
    }

    #[test]
    fn test_required_tier_is_max() {
        assert_eq!(required_tier(&["read", "grep"]), RiskTier::ReadOnly);
        assert_eq!(required_tier(&["read", "edit", "grep"]), RiskTier::Mutating);
        assert_eq!(required_tier(&["read", "mcp__x"]), RiskTier::Unclassified);
        assert_eq!(required_tier::<&str>(&[]), RiskTier::ReadOnly);
    }

    #[test]
    fn test_effective_tier() {
        assert_eq!(effective_tier(RiskTier::ReadOnly, 2).unwrap(), RiskTier::ReadOnly);
        assert_eq!(effective_tier(RiskTier::Mutating, 5).unwrap(), RiskTier::Mutating);

        let err = effective_tier(RiskTier::Mutating, 1).unwrap_err();
        assert!(matches!(
            err,
            ForemanError::RiskTierExceeded {
                required: 2,
                maximum: 1
            }
        ));

        // A generous configuration still cannot lift the ceiling
        let err = effective_tier(RiskTier::Unclassified, 9).unwrap_err();
        assert!(matches!(err, ForemanError::RiskTierExceeded { maximum: 2, .. }));
    }

    #[test]
    fn test_tier_serializes_as_number() {
        assert_eq!(serde_json::to_string(&RiskTier::Mutating).unwrap(), "2");
        assert_eq!(serde_json::from_str::<RiskTier>("1").unwrap(), RiskTier::ReadOnly);
        assert!(serde_json::from_str::<RiskTier>("4").is_err());
    }
}

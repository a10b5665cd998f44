//! # Ownership Map
//!
//! Derived from per-section claims at execution time and immutable for the
//! rest of the session. Every path resolves to exactly one of owned, shared,
//! or unowned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::glob::GlobPattern;
use crate::config::default_shared_patterns;
use crate::error::{ForemanError, Result};
use crate::state::io::normalize_path;

/// What a section declares it owns
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipClaim {
    pub section_id: String,
    #[serde(default)]
    pub exclusive_files: Vec<String>,
    #[serde(default)]
    pub exclusive_globs: Vec<String>,
    /// Paths this section may read and import but never write
    #[serde(default)]
    pub read_only_dependencies: Vec<String>,
    /// Cross-boundary import targets (paths or globs)
    #[serde(default)]
    pub allowed_imports: Vec<String>,
}

impl OwnershipClaim {
    pub fn new(section_id: impl Into<String>) -> Self {
        Self {
            section_id: section_id.into(),
            ..Default::default()
        }
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclusive_files.extend(files.into_iter().map(Into::into));
        self
    }

    pub fn with_globs<I, S>(mut self, globs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclusive_globs.extend(globs.into_iter().map(Into::into));
        self
    }

    pub fn with_imports<I, S>(mut self, imports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_imports.extend(imports.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipDiagnostic {
    pub severity: DiagnosticSeverity,
    pub message: String,
}

impl OwnershipDiagnostic {
    fn error(message: String) -> Self {
        Self {
            severity: DiagnosticSeverity::Error,
            message,
        }
    }

    fn warning(message: String) -> Self {
        Self {
            severity: DiagnosticSeverity::Warning,
            message,
        }
    }
}

/// A path or glob that more than one section claimed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimConflict {
    pub path: String,
    pub sections: Vec<String>,
}

/// Where a path lands after resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "section", rename_all = "snake_case")]
pub enum FileOwnership {
    Owned(String),
    Shared,
    Unowned,
}

/// Read/import boundary of one section
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionBoundary {
    pub read_only_dependencies: Vec<String>,
    pub allowed_imports: Vec<String>,
    #[serde(skip)]
    matchers: Vec<GlobPattern>,
}

impl SectionBoundary {
    fn allows(&self, path: &str) -> bool {
        self.matchers.iter().any(|m| m.matches(path))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipMap {
    pub file_to_section: BTreeMap<String, String>,
    pub glob_to_section: BTreeMap<String, String>,
    pub shared_files: BTreeSet<String>,
    pub boundaries: BTreeMap<String, SectionBoundary>,
    pub file_conflicts: Vec<ClaimConflict>,
    pub glob_conflicts: Vec<ClaimConflict>,
    pub diagnostics: Vec<OwnershipDiagnostic>,
    pub shared_patterns: Vec<String>,
    pub validated_at: DateTime<Utc>,
    #[serde(skip)]
    glob_matchers: Vec<(GlobPattern, String)>,
    #[serde(skip)]
    shared_matchers: Vec<GlobPattern>,
}

/// Build a map using the built-in shared patterns
pub fn build_ownership_map(claims: &[OwnershipClaim]) -> OwnershipMap {
    build_ownership_map_with(claims, &default_shared_patterns())
}

/// Build a map from section claims.
///
/// A file claimed by two or more sections goes to `shared_files` and no
/// section owns it. A glob claimed by two or more sections is an error
/// diagnostic; `validate()` then fails.
pub fn build_ownership_map_with(
    claims: &[OwnershipClaim],
    shared_patterns: &[String],
) -> OwnershipMap {
    let mut diagnostics = Vec::new();

    let mut shared_matchers = Vec::new();
    for pattern in shared_patterns {
        match GlobPattern::new(pattern) {
            Ok(m) => shared_matchers.push(m),
            Err(e) => diagnostics.push(OwnershipDiagnostic::error(format!(
                "invalid shared pattern '{}': {}",
                pattern, e
            ))),
        }
    }
    let is_shared_pattern = |path: &str| shared_matchers.iter().any(|m| m.matches(path));

    // Exact files: collect every claimant first, then decide
    let mut file_claimants: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut glob_claimants: Vec<(String, Vec<String>)> = Vec::new();
    let mut boundaries = BTreeMap::new();

    for claim in claims {
        for file in &claim.exclusive_files {
            let file = normalize_path(file);
            if file.is_empty() {
                continue;
            }
            let entry = file_claimants.entry(file).or_default();
            if !entry.contains(&claim.section_id) {
                entry.push(claim.section_id.clone());
            }
        }

        for glob in &claim.exclusive_globs {
            let glob = normalize_path(glob);
            if glob.is_empty() {
                continue;
            }
            match glob_claimants.iter_mut().find(|(g, _)| *g == glob) {
                Some((_, sections)) => {
                    if !sections.contains(&claim.section_id) {
                        sections.push(claim.section_id.clone());
                    }
                }
                None => glob_claimants.push((glob, vec![claim.section_id.clone()])),
            }
        }

        let mut matchers = Vec::new();
        for target in claim
            .read_only_dependencies
            .iter()
            .chain(claim.allowed_imports.iter())
        {
            match GlobPattern::new(target) {
                Ok(m) => matchers.push(m),
                Err(e) => diagnostics.push(OwnershipDiagnostic::error(format!(
                    "section {}: invalid import boundary '{}': {}",
                    claim.section_id, target, e
                ))),
            }
        }
        boundaries.insert(
            claim.section_id.clone(),
            SectionBoundary {
                read_only_dependencies: claim.read_only_dependencies.clone(),
                allowed_imports: claim.allowed_imports.clone(),
                matchers,
            },
        );
    }

    let mut file_to_section = BTreeMap::new();
    let mut shared_files = BTreeSet::new();
    let mut file_conflicts = Vec::new();

    for (file, sections) in file_claimants {
        if sections.len() > 1 {
            diagnostics.push(OwnershipDiagnostic::warning(format!(
                "{} is claimed by sections {}; treating it as shared",
                file,
                sections.join(", ")
            )));
            file_conflicts.push(ClaimConflict {
                path: file.clone(),
                sections,
            });
            shared_files.insert(file);
        } else if is_shared_pattern(&file) {
            diagnostics.push(OwnershipDiagnostic::warning(format!(
                "{} (claimed by {}) matches a shared pattern; treating it as shared",
                file, sections[0]
            )));
            shared_files.insert(file);
        } else {
            file_to_section.insert(file, sections[0].clone());
        }
    }

    let mut glob_to_section = BTreeMap::new();
    let mut glob_matchers = Vec::new();
    let mut glob_conflicts = Vec::new();

    for (glob, sections) in glob_claimants {
        if sections.len() > 1 {
            diagnostics.push(OwnershipDiagnostic::error(format!(
                "glob {} is claimed by sections {}",
                glob,
                sections.join(", ")
            )));
            glob_conflicts.push(ClaimConflict {
                path: glob,
                sections,
            });
            continue;
        }
        match GlobPattern::new(&glob) {
            Ok(m) => {
                glob_matchers.push((m, sections[0].clone()));
                glob_to_section.insert(glob, sections[0].clone());
            }
            Err(e) => diagnostics.push(OwnershipDiagnostic::error(format!(
                "section {}: invalid glob '{}': {}",
                sections[0], glob, e
            ))),
        }
    }

    // An exact claim inside another section's glob is legal but worth a look
    for (file, owner) in &file_to_section {
        for (matcher, glob_owner) in &glob_matchers {
            if glob_owner != owner && matcher.matches(file) {
                diagnostics.push(OwnershipDiagnostic::warning(format!(
                    "{} is claimed by {} but also matches glob {} of {}; the exact claim wins",
                    file,
                    owner,
                    matcher.pattern(),
                    glob_owner
                )));
            }
        }
    }

    let map = OwnershipMap {
        file_to_section,
        glob_to_section,
        shared_files,
        boundaries,
        file_conflicts,
        glob_conflicts,
        diagnostics,
        shared_patterns: shared_patterns.to_vec(),
        validated_at: Utc::now(),
        glob_matchers,
        shared_matchers,
    };

    tracing::info!(
        sections = claims.len(),
        files = map.file_to_section.len(),
        globs = map.glob_to_section.len(),
        shared = map.shared_files.len(),
        errors = map.errors().len(),
        "Ownership map built"
    );

    map
}

impl OwnershipMap {
    /// Shared by conflict or by a shared pattern
    pub fn is_shared_file(&self, file: &str) -> bool {
        let file = normalize_path(file);
        self.shared_files.contains(&file) || self.shared_matchers.iter().any(|m| m.matches(&file))
    }

    /// Exact claim first, then globs owned by `section_id`. Shared paths are
    /// never owned.
    pub fn is_file_owned_by(&self, file: &str, section_id: &str) -> bool {
        if self.is_shared_file(file) {
            return false;
        }
        let file = normalize_path(file);
        if let Some(owner) = self.file_to_section.get(&file) {
            return owner == section_id;
        }
        self.glob_matchers
            .iter()
            .any(|(m, owner)| owner == section_id && m.matches(&file))
    }

    /// Owner of a path from the point of view of `caller`.
    ///
    /// When several globs match, the caller's own glob is preferred.
    pub fn owner_of(&self, file: &str, caller: Option<&str>) -> Option<&str> {
        let file = normalize_path(file);
        if let Some(owner) = self.file_to_section.get(&file) {
            return Some(owner.as_str());
        }

        let mut first = None;
        for (matcher, owner) in &self.glob_matchers {
            if matcher.matches(&file) {
                if Some(owner.as_str()) == caller {
                    return Some(owner.as_str());
                }
                first.get_or_insert(owner.as_str());
            }
        }
        first
    }

    pub fn resolve(&self, file: &str) -> FileOwnership {
        if self.is_shared_file(file) {
            return FileOwnership::Shared;
        }
        match self.owner_of(file, None) {
            Some(owner) => FileOwnership::Owned(owner.to_string()),
            None => FileOwnership::Unowned,
        }
    }

    pub fn boundary(&self, section_id: &str) -> Option<&SectionBoundary> {
        self.boundaries.get(section_id)
    }

    pub(crate) fn boundary_allows(&self, section_id: &str, target: &str) -> bool {
        self.boundary(section_id)
            .map(|b| b.allows(target))
            .unwrap_or(false)
    }

    pub fn errors(&self) -> Vec<&OwnershipDiagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == DiagnosticSeverity::Error)
            .collect()
    }

    pub fn warnings(&self) -> Vec<&OwnershipDiagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == DiagnosticSeverity::Warning)
            .collect()
    }

    /// Fails when any error diagnostic was recorded
    pub fn validate(&self) -> Result<()> {
        let errors: Vec<String> = self.errors().iter().map(|d| d.message.clone()).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ForemanError::OwnershipInvalid(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_sections() -> Vec<OwnershipClaim> {
        vec![
            OwnershipClaim::new("S1").with_files(["a.ts", "src/shared.ts"]),
            OwnershipClaim::new("S2").with_files(["b.ts", "./src/shared.ts"]),
        ]
    }

    #[test]
    fn test_exclusive_files() {
        let map = build_ownership_map(&two_sections());
        assert!(map.is_file_owned_by("a.ts", "S1"));
        assert!(!map.is_file_owned_by("a.ts", "S2"));
        assert_eq!(map.resolve("b.ts"), FileOwnership::Owned("S2".into()));
        assert_eq!(map.resolve("c.ts"), FileOwnership::Unowned);
    }

    #[test]
    fn test_double_claim_is_shared_and_owned_by_neither() {
        let map = build_ownership_map(&two_sections());

        assert!(map.shared_files.contains("src/shared.ts"));
        assert!(!map.file_to_section.contains_key("src/shared.ts"));
        assert!(!map.is_file_owned_by("src/shared.ts", "S1"));
        assert!(!map.is_file_owned_by("src/shared.ts", "S2"));
        assert_eq!(map.file_conflicts.len(), 1);
        assert_eq!(map.file_conflicts[0].sections, vec!["S1", "S2"]);
        assert_eq!(map.warnings().len(), 1);
        assert!(map.validate().is_ok());
    }

    #[test]
    fn test_shared_pattern_beats_exclusive_claim() {
        let claims = vec![OwnershipClaim::new("S1").with_files(["package.json", "src/types/user.ts"])];
        let map = build_ownership_map(&claims);

        assert_eq!(map.resolve("package.json"), FileOwnership::Shared);
        assert_eq!(map.resolve("src/types/user.ts"), FileOwnership::Shared);
        assert!(!map.is_file_owned_by("package.json", "S1"));
        assert_eq!(map.warnings().len(), 2);
    }

    #[test]
    fn test_builtin_shared_patterns() {
        let map = build_ownership_map(&[]);
        for path in [
            "package.json",
            "apps/web/package.json",
            "src/global.d.ts",
            "src/utils/format.ts",
            "README.md",
            "docs/guide/intro.txt",
            ".env",
            ".env.local",
            "tsconfig.build.json",
            ".eslintrc.cjs",
        ] {
            assert!(map.is_shared_file(path), "{path} should be shared");
        }
        assert!(!map.is_shared_file("src/app/main.ts"));
    }

    #[test]
    fn test_glob_ownership() {
        let claims = vec![
            OwnershipClaim::new("api").with_globs(["src/api/**"]),
            OwnershipClaim::new("ui").with_globs(["src/components/*.tsx"]),
        ];
        let map = build_ownership_map(&claims);

        assert!(map.is_file_owned_by("src/api/users/get.ts", "api"));
        assert!(map.is_file_owned_by("src/components/Button.tsx", "ui"));
        assert!(!map.is_file_owned_by("src/components/forms/Input.tsx", "ui"));
        assert_eq!(map.resolve("src/api/index.ts"), FileOwnership::Owned("api".into()));
        assert!(map.validate().is_ok());
    }

    #[test]
    fn test_glob_conflict_is_error() {
        let claims = vec![
            OwnershipClaim::new("S1").with_globs(["src/api/**"]),
            OwnershipClaim::new("S2").with_globs(["src/api/**"]),
        ];
        let map = build_ownership_map(&claims);

        assert_eq!(map.glob_conflicts.len(), 1);
        assert!(map.glob_to_section.is_empty());
        assert_eq!(map.owner_of("src/api/routes.ts", None), None);
        assert_eq!(map.owner_of("src/api/routes.ts", Some("S1")), None);
        let err = map.validate().unwrap_err();
        match err {
            ForemanError::OwnershipInvalid(messages) => {
                assert!(messages[0].contains("S1"));
                assert!(messages[0].contains("S2"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_same_section_repeating_a_claim_is_not_a_conflict() {
        let claims = vec![OwnershipClaim::new("S1")
            .with_files(["a.ts", "a.ts"])
            .with_globs(["lib/**", "lib/**"])];
        let map = build_ownership_map(&claims);
        assert!(map.file_conflicts.is_empty());
        assert!(map.glob_conflicts.is_empty());
        assert!(map.is_file_owned_by("a.ts", "S1"));
    }

    #[test]
    fn test_exact_claim_wins_over_foreign_glob() {
        let claims = vec![
            OwnershipClaim::new("api").with_globs(["src/api/**"]),
            OwnershipClaim::new("auth").with_files(["src/api/auth.ts"]),
        ];
        let map = build_ownership_map(&claims);

        assert!(map.is_file_owned_by("src/api/auth.ts", "auth"));
        assert!(!map.is_file_owned_by("src/api/auth.ts", "api"));
        assert_eq!(map.warnings().len(), 1);
    }

    #[test]
    fn test_custom_shared_patterns() {
        let claims = vec![OwnershipClaim::new("S1").with_files(["package.json"])];
        let map = build_ownership_map_with(&claims, &["config/**".to_string()]);

        assert!(map.is_file_owned_by("package.json", "S1"));
        assert!(map.is_shared_file("config/app.yaml"));
    }

    #[test]
    fn test_every_path_resolves_once() {
        let map = build_ownership_map(&two_sections());
        for shared in &map.shared_files {
            assert!(!map.file_to_section.contains_key(shared));
        }
    }
}

//! # Sections
//!
//! Units of work produced by decomposition, and the dependency plan that
//! orders them into waves of parallel workers.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ForemanError, Result};
use crate::ownership::OwnershipClaim;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionFile {
    pub path: String,
    pub action: FileAction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    #[default]
    Pending,
    Running,
    Validating,
    Completed,
    CompletedWithBypass,
    Failed,
}

impl SectionStatus {
    /// Completed, with or without a bypass
    pub fn is_done(self) -> bool {
        matches!(self, SectionStatus::Completed | SectionStatus::CompletedWithBypass)
    }
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub files: Vec<SectionFile>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Filled in by [`SectionPlan::new`]
    #[serde(default)]
    pub dependents: Vec<String>,
    #[serde(default)]
    pub status: SectionStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub ownership: OwnershipClaim,
}

impl Section {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            files: Vec::new(),
            dependencies: Vec::new(),
            dependents: Vec::new(),
            status: SectionStatus::Pending,
            retry_count: 0,
            max_retries: default_max_retries(),
            success_criteria: Vec::new(),
            ownership: OwnershipClaim::default(),
        }
    }

    pub fn with_file(mut self, path: &str, action: FileAction) -> Self {
        self.files.push(SectionFile {
            path: path.to_string(),
            action,
        });
        self
    }

    pub fn depends_on(mut self, id: &str) -> Self {
        self.dependencies.push(id.to_string());
        self
    }

    pub fn with_ownership(mut self, claim: OwnershipClaim) -> Self {
        self.ownership = claim;
        self
    }

    /// The section's ownership claim, stamped with its id. Without explicit
    /// files or globs, the section's own files are claimed.
    pub fn claim(&self) -> OwnershipClaim {
        let mut claim = self.ownership.clone();
        claim.section_id = self.id.clone();
        if claim.exclusive_files.is_empty() && claim.exclusive_globs.is_empty() {
            claim.exclusive_files = self.files.iter().map(|f| f.path.clone()).collect();
        }
        claim
    }
}

/// Validated dependency graph over sections
#[derive(Debug, Clone, Serialize)]
pub struct SectionPlan {
    sections: Vec<Section>,
}

impl SectionPlan {
    /// Rejects duplicate ids, unknown dependencies, and cycles
    pub fn new(mut sections: Vec<Section>) -> Result<Self> {
        let mut ids = BTreeSet::new();
        for section in &sections {
            if section.id.trim().is_empty() {
                return Err(ForemanError::InvalidPlan("section with an empty id".into()));
            }
            if !ids.insert(section.id.clone()) {
                return Err(ForemanError::InvalidPlan(format!(
                    "duplicate section id {}",
                    section.id
                )));
            }
        }

        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for section in &sections {
            for dep in &section.dependencies {
                if !ids.contains(dep) {
                    return Err(ForemanError::InvalidPlan(format!(
                        "section {} depends on unknown section {}",
                        section.id, dep
                    )));
                }
                dependents.entry(dep.clone()).or_default().push(section.id.clone());
            }
        }
        for section in &mut sections {
            section.dependents = dependents.remove(&section.id).unwrap_or_default();
        }

        let plan = Self { sections };
        let layered: usize = plan.layers().iter().map(Vec::len).sum();
        if layered != plan.sections.len() {
            let stuck: Vec<&str> = plan
                .sections
                .iter()
                .filter(|s| !plan.layers().iter().flatten().any(|id| id == &s.id))
                .map(|s| s.id.as_str())
                .collect();
            return Err(ForemanError::InvalidPlan(format!(
                "dependency cycle among sections {}",
                stuck.join(", ")
            )));
        }
        Ok(plan)
    }

    /// Kahn layers; sections that sit on a cycle never appear
    fn layers(&self) -> Vec<Vec<String>> {
        let mut done: BTreeSet<&str> = BTreeSet::new();
        let mut layers = Vec::new();
        loop {
            let layer: Vec<String> = self
                .sections
                .iter()
                .filter(|s| !done.contains(s.id.as_str()))
                .filter(|s| s.dependencies.iter().all(|d| done.contains(d.as_str())))
                .map(|s| s.id.clone())
                .collect();
            if layer.is_empty() {
                return layers;
            }
            for id in &layer {
                if let Some(section) = self.get(id) {
                    done.insert(section.id.as_str());
                }
            }
            layers.push(layer);
        }
    }

    /// Sections grouped so each wave depends only on earlier waves
    pub fn waves(&self) -> Vec<Vec<String>> {
        self.layers()
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn get(&self, id: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Section> {
        self.sections.iter_mut().find(|s| s.id == id)
    }

    pub fn claims(&self) -> Vec<OwnershipClaim> {
        self.sections.iter().map(Section::claim).collect()
    }

    /// Pending sections whose dependencies are all done
    pub fn ready(&self) -> Vec<&Section> {
        self.sections
            .iter()
            .filter(|s| s.status == SectionStatus::Pending)
            .filter(|s| {
                s.dependencies
                    .iter()
                    .all(|d| self.get(d).map(|dep| dep.status.is_done()).unwrap_or(false))
            })
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.sections.iter().all(|s| s.status.is_done())
    }

    pub fn unfinished(&self) -> Vec<&str> {
        self.sections
            .iter()
            .filter(|s| !s.status.is_done())
            .map(|s| s.id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Vec<Section> {
        vec![
            Section::new("types", "Shared types").with_file("src/model.ts", FileAction::Create),
            Section::new("api", "API").depends_on("types"),
            Section::new("ui", "UI").depends_on("types"),
            Section::new("e2e", "End to end").depends_on("api").depends_on("ui"),
        ]
    }

    #[test]
    fn test_waves_and_dependents() {
        let plan = SectionPlan::new(diamond()).unwrap();
        assert_eq!(
            plan.waves(),
            vec![
                vec!["types".to_string()],
                vec!["api".to_string(), "ui".to_string()],
                vec!["e2e".to_string()],
            ]
        );
        assert_eq!(plan.get("types").unwrap().dependents, vec!["api", "ui"]);
    }

    #[test]
    fn test_rejects_bad_plans() {
        let unknown = vec![Section::new("a", "A").depends_on("ghost")];
        assert!(matches!(SectionPlan::new(unknown), Err(ForemanError::InvalidPlan(_))));

        let duplicate = vec![Section::new("a", "A"), Section::new("a", "A again")];
        assert!(SectionPlan::new(duplicate).is_err());

        let cycle = vec![
            Section::new("a", "A").depends_on("b"),
            Section::new("b", "B").depends_on("a"),
            Section::new("c", "C"),
        ];
        match SectionPlan::new(cycle) {
            Err(ForemanError::InvalidPlan(message)) => {
                assert!(message.contains("a, b"));
            }
            other => panic!("expected a cycle error, got {other:?}"),
        }

        let self_loop = vec![Section::new("a", "A").depends_on("a")];
        assert!(SectionPlan::new(self_loop).is_err());
    }

    #[test]
    fn test_ready_follows_status() {
        let mut plan = SectionPlan::new(diamond()).unwrap();
        let ready: Vec<&str> = plan.ready().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["types"]);

        plan.get_mut("types").unwrap().status = SectionStatus::CompletedWithBypass;
        let ready: Vec<&str> = plan.ready().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["api", "ui"]);
        assert!(!plan.is_complete());
        assert_eq!(plan.unfinished(), vec!["api", "ui", "e2e"]);
    }

    #[test]
    fn test_claim_defaults_to_section_files() {
        let section = Section::new("types", "Types")
            .with_file("src/model.ts", FileAction::Create)
            .with_file("src/ids.ts", FileAction::Modify);
        let claim = section.claim();
        assert_eq!(claim.section_id, "types");
        assert_eq!(claim.exclusive_files, vec!["src/model.ts", "src/ids.ts"]);

        let explicit = section.with_ownership(OwnershipClaim::new("ignored").with_globs(["src/**"]));
        let claim = explicit.claim();
        assert_eq!(claim.section_id, "types");
        assert!(claim.exclusive_files.is_empty());
    }

    #[test]
    fn test_section_deserializes_with_defaults() {
        let json = r#"{ "id": "api", "name": "API", "files": [{ "path": "src/api.ts", "action": "create" }] }"#;
        let section: Section = serde_json::from_str(json).unwrap();
        assert_eq!(section.max_retries, 3);
        assert_eq!(section.status, SectionStatus::Pending);
        assert_eq!(section.files[0].action, FileAction::Create);
    }
}

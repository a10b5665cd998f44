//! # Crystallized Skills
//!
//! The artifact produced when a candidate is approved, and the storage seam
//! it is handed to. Skills expire; nothing here renews them.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::state::db::ForemanDb;

/// Where a skill came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SkillProvenance {
    /// Always `crystallized` for skills mined from observations
    pub source: String,
    pub signature: String,
    pub observation_count: u32,
    pub distinct_sessions: u32,
    pub success_rate: f64,
    pub approved_at: DateTime<Utc>,
}

/// A reusable, risk-bounded tool sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SkillDescriptor {
    pub name: String,
    pub description: String,
    pub trigger_keywords: Vec<String>,
    pub tool_sequence: Vec<String>,
    /// 1 or 2; never above the sequence's own requirement
    pub risk_tier: u8,
    pub provenance: SkillProvenance,
    /// Re-review required after this instant
    pub expires_at: DateTime<Utc>,
}

impl SkillDescriptor {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// JSON schema for external skill registries
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(SkillDescriptor)).unwrap_or_default()
    }
}

/// Persistence for approved skills
pub trait SkillStore: Send + Sync {
    /// Insert or replace by name
    fn save(&self, skill: &SkillDescriptor) -> Result<()>;
    fn get(&self, name: &str) -> Result<Option<SkillDescriptor>>;
    fn list(&self) -> Result<Vec<SkillDescriptor>>;
    /// Skills due for re-review at `now`
    fn expired(&self, now: DateTime<Utc>) -> Result<Vec<SkillDescriptor>>;
}

/// Skills table in the shared database
pub struct SqliteSkillStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSkillStore {
    pub fn new(db: &ForemanDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    fn query(&self, sql: &str, param: Option<String>) -> Result<Vec<SkillDescriptor>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(param.iter()), |row| row.get::<_, String>(0))?;

        let mut skills = Vec::new();
        for descriptor in rows {
            let descriptor = descriptor?;
            match serde_json::from_str(&descriptor) {
                Ok(skill) => skills.push(skill),
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable skill descriptor"),
            }
        }
        Ok(skills)
    }
}

impl SkillStore for SqliteSkillStore {
    fn save(&self, skill: &SkillDescriptor) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO skills (name, candidate_id, risk_tier, descriptor, approved_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                skill.name,
                skill.provenance.signature,
                skill.risk_tier,
                serde_json::to_string(skill)?,
                skill
                    .provenance
                    .approved_at
                    .to_rfc3339_opts(SecondsFormat::Micros, true),
                skill.expires_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )
        .context("Failed to save skill")?;
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<SkillDescriptor>> {
        let conn = self.lock()?;
        let descriptor: Option<String> = conn
            .query_row(
                "SELECT descriptor FROM skills WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        descriptor
            .map(|d| serde_json::from_str(&d).context("Unreadable skill descriptor"))
            .transpose()
    }

    fn list(&self) -> Result<Vec<SkillDescriptor>> {
        self.query("SELECT descriptor FROM skills ORDER BY name", None)
    }

    fn expired(&self, now: DateTime<Utc>) -> Result<Vec<SkillDescriptor>> {
        self.query(
            "SELECT descriptor FROM skills WHERE expires_at <= ?1 ORDER BY expires_at",
            Some(now.to_rfc3339_opts(SecondsFormat::Micros, true)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn skill(name: &str, approved_at: DateTime<Utc>) -> SkillDescriptor {
        SkillDescriptor {
            name: name.to_string(),
            description: "fix lint errors".into(),
            trigger_keywords: vec!["lint".into()],
            tool_sequence: vec!["read".into(), "edit".into()],
            risk_tier: 2,
            provenance: SkillProvenance {
                source: "crystallized".into(),
                signature: format!("sig-{}", name),
                observation_count: 6,
                distinct_sessions: 3,
                success_rate: 1.0,
                approved_at,
            },
            expires_at: approved_at + Duration::days(30),
        }
    }

    #[test]
    fn test_save_get_list() {
        let store = SqliteSkillStore::new(&ForemanDb::open_in_memory().unwrap());
        let now = Utc::now();
        store.save(&skill("auto-b", now)).unwrap();
        store.save(&skill("auto-a", now)).unwrap();

        assert_eq!(store.get("auto-a").unwrap().unwrap(), skill("auto-a", now));
        assert!(store.get("missing").unwrap().is_none());
        let names: Vec<String> = store.list().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["auto-a", "auto-b"]);
    }

    #[test]
    fn test_expired() {
        let store = SqliteSkillStore::new(&ForemanDb::open_in_memory().unwrap());
        let now = Utc::now();
        store.save(&skill("old", now - Duration::days(31))).unwrap();
        store.save(&skill("fresh", now)).unwrap();

        let expired = store.expired(now).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].name, "old");
        assert!(expired[0].is_expired(now));
    }

    #[test]
    fn test_schema_names_fields() {
        let schema = SkillDescriptor::json_schema();
        let properties = &schema["properties"];
        assert!(properties.get("triggerKeywords").is_some());
        assert!(properties.get("riskTier").is_some());
        assert!(properties.get("expiresAt").is_some());
    }
}

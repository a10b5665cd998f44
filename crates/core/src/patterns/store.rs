//! # Observation Store
//!
//! SQLite-backed observations and crystallization candidates, on the shared
//! `ForemanDb` connection. Every aggregate read and the candidate write that
//! follows it happen under one connection lock, so detection always sees a
//! consistent snapshot even while new observations are inserted.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::config::CrystallizerConfig;
use crate::state::db::ForemanDb;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "success" | "ok" | "passed" => Ok(Outcome::Success),
            "failure" | "failed" | "error" => Ok(Outcome::Failure),
            other => Err(format!("unknown outcome: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Candidate,
    Approved,
    Rejected,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::Candidate => "candidate",
            CandidateStatus::Approved => "approved",
            CandidateStatus::Rejected => "rejected",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "approved" => CandidateStatus::Approved,
            "rejected" => CandidateStatus::Rejected,
            _ => CandidateStatus::Candidate,
        }
    }
}

impl fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An observation as reported by a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewObservation {
    pub session_id: String,
    pub tool_sequence: Vec<String>,
    #[serde(default)]
    pub goal_summary: String,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub id: i64,
    pub session_id: String,
    pub signature: String,
    pub tool_sequence: Vec<String>,
    pub goal_summary: String,
    pub outcome: Outcome,
    pub observed_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub quarantined: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrystallizationCandidate {
    /// The tool-sequence signature
    pub id: String,
    pub tool_sequence: Vec<String>,
    pub observation_count: u32,
    pub success_count: u32,
    pub success_rate: f64,
    pub distinct_sessions: u32,
    pub status: CandidateStatus,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// Aggregate of active observations sharing one signature
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureAggregate {
    pub signature: String,
    pub tool_sequence: Vec<String>,
    pub observation_count: u32,
    pub success_count: u32,
    pub distinct_sessions: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl SignatureAggregate {
    pub fn success_rate(&self) -> f64 {
        if self.observation_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.observation_count as f64
        }
    }
}

/// Candidacy thresholds; all three must hold at once
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub min_observations: u32,
    pub min_distinct_sessions: u32,
    pub min_success_rate: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from(&CrystallizerConfig::default())
    }
}

impl From<&CrystallizerConfig> for Thresholds {
    fn from(config: &CrystallizerConfig) -> Self {
        Self {
            min_observations: config.min_observations,
            min_distinct_sessions: config.min_distinct_sessions,
            min_success_rate: config.min_success_rate,
        }
    }
}

impl Thresholds {
    pub fn met(&self, observations: u32, sessions: u32, success_rate: f64) -> bool {
        observations >= self.min_observations
            && sessions >= self.min_distinct_sessions
            && success_rate >= self.min_success_rate
    }

    pub fn met_by(&self, candidate: &CrystallizationCandidate) -> bool {
        self.met(
            candidate.observation_count,
            candidate.distinct_sessions,
            candidate.success_rate,
        )
    }
}

/// What a detection pass did for one signature
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Thresholds met for the first time
    Created(CrystallizationCandidate),
    /// Existing candidate refreshed with current counts
    Updated(CrystallizationCandidate),
    /// Approved or rejected; left alone
    Decided(CandidateStatus),
    /// Below at least one threshold, or nothing active yet
    BelowThreshold,
}

fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn parse_tools(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

pub struct ObservationStore {
    conn: Arc<Mutex<Connection>>,
}

impl ObservationStore {
    /// Create from the shared database connection
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

    /// Insert a quarantined observation
    pub fn insert(&self, observation: &NewObservation, signature: &str) -> Result<i64> {
        let conn = self.lock()?;
        let tools = serde_json::to_string(&observation.tool_sequence)?;
        conn.execute(
            r#"
            INSERT INTO observations
                (session_id, signature, tool_sequence, goal_summary, outcome, observed_at, recorded_at, quarantined)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)
            "#,
            params![
                observation.session_id,
                signature,
                tools,
                observation.goal_summary,
                observation.outcome.as_str(),
                timestamp(&observation.timestamp),
                timestamp(&Utc::now()),
            ],
        )
        .context("Failed to insert observation")?;
        Ok(conn.last_insert_rowid())
    }

    /// Flip one observation to active. Returns its signature the first time,
    /// `None` if it was already active or does not exist.
    pub fn release(&self, id: i64) -> Result<Option<String>> {
        let conn = self.lock()?;
        let signature: Option<String> = conn
            .query_row(
                "SELECT signature FROM observations WHERE id = ?1 AND quarantined = 1",
                [id],
                |row| row.get(0),
            )
            .optional()?;

        if signature.is_some() {
            conn.execute(
                "UPDATE observations SET quarantined = 0 WHERE id = ?1 AND quarantined = 1",
                [id],
            )
            .context("Failed to release observation")?;
        }
        Ok(signature)
    }

    /// Release everything recorded at or before `cutoff`; returns the
    /// distinct signatures affected
    pub fn release_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let cutoff = timestamp(&cutoff);

        let signatures = {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT signature FROM observations WHERE quarantined = 1 AND recorded_at <= ?1 ORDER BY signature",
            )?;
            let rows = stmt.query_map([&cutoff], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.execute(
            "UPDATE observations SET quarantined = 0 WHERE quarantined = 1 AND recorded_at <= ?1",
            [&cutoff],
        )?;
        tx.commit().context("Failed to release expired observations")?;
        Ok(signatures)
    }

    pub fn get_observation(&self, id: i64) -> Result<Option<Observation>> {
        let conn = self.lock()?;
        conn.query_row(
            r#"
            SELECT id, session_id, signature, tool_sequence, goal_summary, outcome,
                   observed_at, recorded_at, quarantined
            FROM observations WHERE id = ?1
            "#,
            [id],
            Self::row_to_observation,
        )
        .optional()
        .context("Failed to load observation")
    }

    pub fn quarantined_count(&self) -> Result<u32> {
        let conn = self.lock()?;
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM observations WHERE quarantined = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Goal summaries of active observations, newest first
    pub fn goal_summaries(&self, signature: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT goal_summary FROM observations WHERE signature = ?1 AND quarantined = 0 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([signature], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Active-observation aggregate for one signature
    pub fn aggregate(&self, signature: &str) -> Result<Option<SignatureAggregate>> {
        let conn = self.lock()?;
        Self::aggregate_locked(&conn, signature)
    }

    fn aggregate_locked(conn: &Connection, signature: &str) -> Result<Option<SignatureAggregate>> {
        let row = conn
            .query_row(
                r#"
                SELECT COUNT(*),
                       COALESCE(SUM(CASE WHEN outcome = 'success' THEN 1 ELSE 0 END), 0),
                       COUNT(DISTINCT session_id),
                       MIN(observed_at),
                       MAX(observed_at),
                       MAX(tool_sequence)
                FROM observations
                WHERE signature = ?1 AND quarantined = 0
                "#,
                [signature],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .context("Failed to aggregate observations")?;

        let (count, successes, sessions, first, last, tools) = row;
        if count == 0 {
            return Ok(None);
        }
        Ok(Some(SignatureAggregate {
            signature: signature.to_string(),
            tool_sequence: tools.as_deref().map(parse_tools).unwrap_or_default(),
            observation_count: count,
            success_count: successes,
            distinct_sessions: sessions,
            first_seen: first.as_deref().map(parse_timestamp).unwrap_or_default(),
            last_seen: last.as_deref().map(parse_timestamp).unwrap_or_default(),
        }))
    }

    /// Re-run detection for one signature
    pub fn refresh_signature(&self, signature: &str, thresholds: &Thresholds) -> Result<Detection> {
        let conn = self.lock()?;

        let existing = Self::candidate_locked(&conn, signature)?;
        if let Some(candidate) = &existing {
            if candidate.status != CandidateStatus::Candidate {
                return Ok(Detection::Decided(candidate.status));
            }
        }

        let Some(aggregate) = Self::aggregate_locked(&conn, signature)? else {
            return Ok(Detection::BelowThreshold);
        };
        let rate = aggregate.success_rate();

        match existing {
            Some(_) => {
                conn.execute(
                    r#"
                    UPDATE candidates
                    SET observation_count = ?2, success_count = ?3, success_rate = ?4,
                        distinct_sessions = ?5, last_seen = ?6
                    WHERE id = ?1 AND status = 'candidate'
                    "#,
                    params![
                        signature,
                        aggregate.observation_count,
                        aggregate.success_count,
                        rate,
                        aggregate.distinct_sessions,
                        timestamp(&aggregate.last_seen),
                    ],
                )
                .context("Failed to refresh candidate")?;
                let updated = Self::candidate_locked(&conn, signature)?
                    .context("Candidate vanished during refresh")?;
                tracing::debug!(candidate = %signature, count = updated.observation_count, "Candidate refreshed");
                Ok(Detection::Updated(updated))
            }
            None if thresholds.met(aggregate.observation_count, aggregate.distinct_sessions, rate) => {
                conn.execute(
                    r#"
                    INSERT INTO candidates
                        (id, tool_sequence, observation_count, success_count, success_rate,
                         distinct_sessions, status, first_seen, last_seen)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'candidate', ?7, ?8)
                    "#,
                    params![
                        signature,
                        serde_json::to_string(&aggregate.tool_sequence)?,
                        aggregate.observation_count,
                        aggregate.success_count,
                        rate,
                        aggregate.distinct_sessions,
                        timestamp(&aggregate.first_seen),
                        timestamp(&aggregate.last_seen),
                    ],
                )
                .context("Failed to insert candidate")?;
                let created = Self::candidate_locked(&conn, signature)?
                    .context("Candidate missing after insert")?;
                tracing::info!(
                    candidate = %signature,
                    observations = created.observation_count,
                    sessions = created.distinct_sessions,
                    success_rate = created.success_rate,
                    "Crystallization candidate detected"
                );
                Ok(Detection::Created(created))
            }
            None => Ok(Detection::BelowThreshold),
        }
    }

    /// Detection over every signature with active observations
    pub fn detect_all(&self, thresholds: &Thresholds) -> Result<Vec<Detection>> {
        let signatures: Vec<String> = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT DISTINCT signature FROM observations WHERE quarantined = 0 ORDER BY signature",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        signatures
            .iter()
            .map(|s| self.refresh_signature(s, thresholds))
            .collect()
    }

    pub fn get_candidate(&self, id: &str) -> Result<Option<CrystallizationCandidate>> {
        let conn = self.lock()?;
        Self::candidate_locked(&conn, id)
    }

    fn candidate_locked(conn: &Connection, id: &str) -> Result<Option<CrystallizationCandidate>> {
        conn.query_row(
            r#"
            SELECT id, tool_sequence, observation_count, success_count, success_rate,
                   distinct_sessions, status, first_seen, last_seen, decided_at
            FROM candidates WHERE id = ?1
            "#,
            [id],
            Self::row_to_candidate,
        )
        .optional()
        .context("Failed to load candidate")
    }

    /// Candidates, optionally filtered by status, most recently seen first
    pub fn list_candidates(
        &self,
        status: Option<CandidateStatus>,
    ) -> Result<Vec<CrystallizationCandidate>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, tool_sequence, observation_count, success_count, success_rate,
                   distinct_sessions, status, first_seen, last_seen, decided_at
            FROM candidates
            WHERE ?1 IS NULL OR status = ?1
            ORDER BY last_seen DESC, id
            "#,
        )?;
        let rows = stmt.query_map([status.map(|s| s.as_str())], Self::row_to_candidate)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Undecided candidates that currently meet every threshold
    pub fn pending_candidates(&self, thresholds: &Thresholds) -> Result<Vec<CrystallizationCandidate>> {
        Ok(self
            .list_candidates(Some(CandidateStatus::Candidate))?
            .into_iter()
            .filter(|c| thresholds.met_by(c))
            .collect())
    }

    /// Move an undecided candidate to a terminal status. Returns `false`
    /// when the candidate was not undecided.
    pub fn set_status(&self, id: &str, status: CandidateStatus, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE candidates SET status = ?2, decided_at = ?3 WHERE id = ?1 AND status = 'candidate'",
                params![id, status.as_str(), timestamp(&at)],
            )
            .context("Failed to update candidate status")?;
        Ok(changed == 1)
    }

    fn row_to_observation(row: &Row<'_>) -> rusqlite::Result<Observation> {
        let outcome: String = row.get(5)?;
        Ok(Observation {
            id: row.get(0)?,
            session_id: row.get(1)?,
            signature: row.get(2)?,
            tool_sequence: parse_tools(&row.get::<_, String>(3)?),
            goal_summary: row.get(4)?,
            outcome: outcome.parse().unwrap_or(Outcome::Failure),
            observed_at: parse_timestamp(&row.get::<_, String>(6)?),
            recorded_at: parse_timestamp(&row.get::<_, String>(7)?),
            quarantined: row.get::<_, i64>(8)? != 0,
        })
    }

    fn row_to_candidate(row: &Row<'_>) -> rusqlite::Result<CrystallizationCandidate> {
        Ok(CrystallizationCandidate {
            id: row.get(0)?,
            tool_sequence: parse_tools(&row.get::<_, String>(1)?),
            observation_count: row.get(2)?,
            success_count: row.get(3)?,
            success_rate: row.get(4)?,
            distinct_sessions: row.get(5)?,
            status: CandidateStatus::parse(&row.get::<_, String>(6)?),
            first_seen: parse_timestamp(&row.get::<_, String>(7)?),
            last_seen: parse_timestamp(&row.get::<_, String>(8)?),
            decided_at: row
                .get::<_, Option<String>>(9)?
                .as_deref()
                .map(parse_timestamp),
        })
    }
}

//! # Pattern Crystallizer
//!
//! Mines recurring successful tool sequences into skills.
//!
//! ## Lifecycle
//!
//! 1. **Record**: observation stored quarantined, release timer started
//! 2. **Release**: after the quarantine delay the observation turns active
//!    and detection re-runs for its signature
//! 3. **Detect**: a signature becomes a candidate once it has enough
//!    observations, sessions, and successes at the same time
//! 4. **Decide**: an operator approves (risk-tier bounded, expiring skill)
//!    or rejects (terminal)

use anyhow::anyhow;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::risk::{effective_tier, required_tier};
use super::signature::{normalize_tool, tool_signature};
use super::skill::{SkillDescriptor, SkillProvenance, SkillStore, SqliteSkillStore};
use super::store::{
    CandidateStatus, CrystallizationCandidate, Detection, NewObservation, ObservationStore,
    Thresholds,
};
use crate::config::CrystallizerConfig;
use crate::error::{ForemanError, Result};
use crate::state::db::ForemanDb;

const MAX_TRIGGER_KEYWORDS: usize = 5;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "into", "is", "it",
    "its", "of", "on", "or", "that", "the", "then", "this", "to", "up", "with", "all", "new",
];

/// Handle returned by [`PatternCrystallizer::record_observation`]
#[derive(Debug)]
pub struct RecordedObservation {
    pub id: i64,
    pub signature: String,
    /// Quarantine timer; dropping it detaches the timer
    pub release: JoinHandle<()>,
}

pub struct PatternCrystallizer {
    store: Arc<ObservationStore>,
    skills: Arc<dyn SkillStore>,
    config: CrystallizerConfig,
}

impl PatternCrystallizer {
    pub fn new(
        store: ObservationStore,
        skills: Arc<dyn SkillStore>,
        config: CrystallizerConfig,
    ) -> Self {
        Self {
            store: Arc::new(store),
            skills,
            config,
        }
    }

    /// Crystallizer on the shared database, recovering observations whose
    /// quarantine ran out while no process was watching
    pub fn open(db: &ForemanDb, config: CrystallizerConfig) -> Result<Self> {
        let crystallizer = Self::new(
            ObservationStore::new(db),
            Arc::new(SqliteSkillStore::new(db)),
            config,
        );
        crystallizer.recover()?;
        Ok(crystallizer)
    }

    pub fn store(&self) -> &ObservationStore {
        &self.store
    }

    pub fn skills(&self) -> &Arc<dyn SkillStore> {
        &self.skills
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds::from(&self.config)
    }

    fn quarantine(&self) -> Duration {
        Duration::from_secs(self.config.quarantine_secs)
    }

    /// Release overdue observations and re-run detection; returns how many
    /// signatures were released
    pub fn recover(&self) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.quarantine_secs as i64);
        let released = self.store.release_expired(cutoff)?;
        let thresholds = self.thresholds();
        for signature in &released {
            self.store.refresh_signature(signature, &thresholds)?;
        }
        if !released.is_empty() {
            tracing::info!(signatures = released.len(), "Recovered quarantined observations");
        }
        Ok(released.len())
    }

    /// Store the observation quarantined and start its release timer
    pub async fn record_observation(&self, observation: NewObservation) -> Result<RecordedObservation> {
        if observation.tool_sequence.iter().all(|t| t.trim().is_empty()) {
            return Err(anyhow!("observation has an empty tool sequence").into());
        }
        if observation.session_id.trim().is_empty() {
            return Err(anyhow!("observation has no session id").into());
        }

        let signature = tool_signature(&observation.tool_sequence);
        let id = self.store.insert(&observation, &signature)?;
        tracing::debug!(
            id,
            session_id = %observation.session_id,
            signature = %signature,
            outcome = observation.outcome.as_str(),
            "Observation recorded"
        );

        let store = Arc::clone(&self.store);
        let thresholds = self.thresholds();
        let delay = self.quarantine();
        let release = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = release_and_detect(&store, id, &thresholds) {
                tracing::warn!(id, error = %e, "Quarantine release failed");
            }
        });

        Ok(RecordedObservation {
            id,
            signature,
            release,
        })
    }

    /// Release one observation now and re-run detection for its signature
    pub fn release(&self, id: i64) -> Result<Option<Detection>> {
        Ok(release_and_detect(&self.store, id, &self.thresholds())?)
    }

    /// Undecided candidates that currently meet every threshold
    pub fn pending_candidates(&self) -> Result<Vec<CrystallizationCandidate>> {
        Ok(self.store.pending_candidates(&self.thresholds())?)
    }

    pub fn candidates(&self, status: Option<CandidateStatus>) -> Result<Vec<CrystallizationCandidate>> {
        Ok(self.store.list_candidates(status)?)
    }

    fn undecided(&self, id: &str) -> Result<CrystallizationCandidate> {
        let candidate = self
            .store
            .get_candidate(id)?
            .ok_or_else(|| ForemanError::CandidateNotFound(id.to_string()))?;
        if candidate.status != CandidateStatus::Candidate {
            return Err(ForemanError::CandidateDecided {
                id: id.to_string(),
                status: candidate.status.to_string(),
            });
        }
        Ok(candidate)
    }

    /// Turn a candidate into an expiring skill.
    ///
    /// Refused when the candidate is decided, no longer meets the
    /// thresholds, or needs a higher tier than the deployment allows.
    pub fn approve_candidate(&self, id: &str) -> Result<SkillDescriptor> {
        self.undecided(id)?;

        let thresholds = self.thresholds();
        let candidate = match self.store.refresh_signature(id, &thresholds)? {
            Detection::Updated(c) | Detection::Created(c) => c,
            Detection::Decided(status) => {
                return Err(ForemanError::CandidateDecided {
                    id: id.to_string(),
                    status: status.to_string(),
                })
            }
            Detection::BelowThreshold => {
                return Err(ForemanError::CandidateBelowThreshold(id.to_string()))
            }
        };
        if !thresholds.met_by(&candidate) {
            return Err(ForemanError::CandidateBelowThreshold(id.to_string()));
        }

        let required = required_tier(&candidate.tool_sequence);
        let tier = effective_tier(required, self.config.max_risk_tier).map_err(|e| {
            tracing::warn!(candidate = %id, required = required.level(), "Approval refused: {}", e);
            e
        })?;

        let approved_at = Utc::now();
        let goals = self.store.goal_summaries(id)?;
        let skill = build_descriptor(&candidate, &goals, tier.level(), approved_at, self.config.skill_ttl_days);

        self.skills.save(&skill)?;
        if !self.store.set_status(id, CandidateStatus::Approved, approved_at)? {
            let status = self
                .store
                .get_candidate(id)?
                .map(|c| c.status.to_string())
                .unwrap_or_else(|| "gone".to_string());
            return Err(ForemanError::CandidateDecided {
                id: id.to_string(),
                status,
            });
        }

        tracing::info!(
            candidate = %id,
            skill = %skill.name,
            risk_tier = skill.risk_tier,
            expires_at = %skill.expires_at,
            "Candidate approved"
        );
        Ok(skill)
    }

    /// Terminal; later observations never revive it
    pub fn reject_candidate(&self, id: &str) -> Result<CrystallizationCandidate> {
        self.undecided(id)?;
        if !self.store.set_status(id, CandidateStatus::Rejected, Utc::now())? {
            return Err(ForemanError::CandidateDecided {
                id: id.to_string(),
                status: "decided".to_string(),
            });
        }
        tracing::info!(candidate = %id, "Candidate rejected");
        self.store
            .get_candidate(id)?
            .ok_or_else(|| ForemanError::CandidateNotFound(id.to_string()))
    }

    /// Skills past their expiry, awaiting re-review
    pub fn expired_skills(&self, now: DateTime<Utc>) -> Result<Vec<SkillDescriptor>> {
        Ok(self.skills.expired(now)?)
    }
}

fn release_and_detect(
    store: &ObservationStore,
    id: i64,
    thresholds: &Thresholds,
) -> anyhow::Result<Option<Detection>> {
    let Some(signature) = store.release(id)? else {
        return Ok(None);
    };
    tracing::debug!(id, signature = %signature, "Observation released from quarantine");
    store.refresh_signature(&signature, thresholds).map(Some)
}

fn build_descriptor(
    candidate: &CrystallizationCandidate,
    goals: &[String],
    risk_tier: u8,
    approved_at: DateTime<Utc>,
    ttl_days: i64,
) -> SkillDescriptor {
    SkillDescriptor {
        name: skill_name(&candidate.tool_sequence, &candidate.id),
        description: describe(&candidate.tool_sequence, goals),
        trigger_keywords: trigger_keywords(goals),
        tool_sequence: candidate.tool_sequence.clone(),
        risk_tier,
        provenance: SkillProvenance {
            source: "crystallized".to_string(),
            signature: candidate.id.clone(),
            observation_count: candidate.observation_count,
            distinct_sessions: candidate.distinct_sessions,
            success_rate: candidate.success_rate,
            approved_at,
        },
        expires_at: approved_at + ChronoDuration::days(ttl_days),
    }
}

/// `auto-<tool slugs>-<first 8 hex of the signature>`
pub fn skill_name(tools: &[String], signature: &str) -> String {
    let slugs: Vec<String> = tools
        .iter()
        .map(|t| slug(&normalize_tool(t)))
        .filter(|s| !s.is_empty())
        .collect();
    let short: String = signature.chars().take(8).collect();
    format!("auto-{}-{}", slugs.join("-"), short)
}

fn slug(s: &str) -> String {
    let mut out = String::new();
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// Most frequent goal summary, ties broken alphabetically
fn describe(tools: &[String], goals: &[String]) -> String {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for goal in goals.iter().map(|g| g.trim()).filter(|g| !g.is_empty()) {
        *counts.entry(goal).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|(a, ca), (b, cb)| ca.cmp(cb).then_with(|| b.cmp(a)))
        .map(|(goal, _)| goal.to_string())
        .unwrap_or_else(|| format!("Replays the tool sequence {}", tools.join(" -> ")))
}

/// Frequency-ranked words from goal summaries, stop words removed
pub fn trigger_keywords(goals: &[String]) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for goal in goals {
        for word in goal
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 2)
            .filter(|w| !w.chars().all(|c| c.is_ascii_digit()))
            .filter(|w| !STOP_WORDS.contains(w))
        {
            *counts.entry(word.to_string()).or_default() += 1;
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|(a, ca), (b, cb)| cb.cmp(ca).then_with(|| a.cmp(b)));
    ranked
        .into_iter()
        .take(MAX_TRIGGER_KEYWORDS)
        .map(|(word, _)| word)
        .collect()
}

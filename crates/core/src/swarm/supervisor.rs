//! # Swarm Supervisor
//!
//! Drives one session through its phases: planning, decomposition into
//! sections, execution under an ownership map, per-section validation, and
//! integration. Every completed tool sequence is handed to the crystallizer.

use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::default_shared_patterns;
use crate::error::{ForemanError, Result};
use crate::ownership::{
    apply_shared_file_changes, build_ownership_map_with, EnforcementContext, MergeReport,
    OwnershipMap, SharedFileChange,
};
use crate::patterns::{NewObservation, Outcome, PatternCrystallizer, RecordedObservation};
use crate::state::mode::{EnterContext, Mode, ModeRegistry, ModeState};
use crate::validation::{BypassOutcome, BypassRequest, ValidationGate, ValidationOutcome, ValidationSession};

use super::events::{SwarmEvent, SwarmEventKind};
use super::sections::{SectionPlan, SectionStatus};

/// The session supervisor
pub struct Supervisor {
    registry: Arc<ModeRegistry>,
    gate: Arc<ValidationGate>,
    crystallizer: Arc<PatternCrystallizer>,
    project_root: PathBuf,
    shared_patterns: Vec<String>,
    project_id: Option<String>,
    session_id: Option<String>,
    plan: Option<SectionPlan>,
    map: Option<Arc<OwnershipMap>>,
    events: Vec<SwarmEvent>,
    event_tx: Option<mpsc::Sender<SwarmEvent>>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<ModeRegistry>,
        gate: Arc<ValidationGate>,
        crystallizer: Arc<PatternCrystallizer>,
        project_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            gate,
            crystallizer,
            project_root: project_root.into(),
            shared_patterns: default_shared_patterns(),
            project_id: None,
            session_id: None,
            plan: None,
            map: None,
            events: Vec::new(),
            event_tx: None,
        }
    }

    /// Replace the default shared-file patterns
    pub fn with_shared_patterns(mut self, patterns: Vec<String>) -> Self {
        self.shared_patterns = patterns;
        self
    }

    /// Set event channel for streaming events
    pub fn with_event_channel(mut self, tx: mpsc::Sender<SwarmEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn registry(&self) -> &Arc<ModeRegistry> {
        &self.registry
    }

    pub fn section_plan(&self) -> Option<&SectionPlan> {
        self.plan.as_ref()
    }

    pub fn ownership_map(&self) -> Option<&Arc<OwnershipMap>> {
        self.map.as_ref()
    }

    /// Events emitted since the last session started planning. Kept after
    /// `finish`/`abort` so the closing events stay readable.
    pub fn events(&self) -> &[SwarmEvent] {
        &self.events
    }

    async fn emit(&mut self, event: SwarmEvent) {
        self.events.push(event.clone());
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    async fn transition(&mut self, mode: Mode, ctx: &EnterContext) -> Result<ModeState> {
        let state = self.registry.enter(mode, ctx).await?;
        self.emit(SwarmEvent::new(SwarmEventKind::ModeChanged).with_data(json!({ "mode": mode })))
            .await;
        Ok(state)
    }

    fn session(&self) -> Result<String> {
        self.session_id
            .clone()
            .ok_or_else(|| ForemanError::NotReady("no session is executing".into()))
    }

    fn plan_mut(&mut self) -> Result<&mut SectionPlan> {
        self.plan
            .as_mut()
            .ok_or_else(|| ForemanError::NotReady("no section plan has been accepted".into()))
    }

    fn set_status(&mut self, section_id: &str, status: SectionStatus) -> Result<()> {
        let section = self
            .plan_mut()?
            .get_mut(section_id)
            .ok_or_else(|| ForemanError::UnknownSection(section_id.to_string()))?;
        section.status = status;
        Ok(())
    }

    /// Start planning for a project
    pub async fn plan(&mut self, project_id: &str) -> Result<ModeState> {
        let state = self
            .registry
            .enter(Mode::Planning, &EnterContext::new().project(project_id))
            .await?;
        self.events.clear();
        self.emit(
            SwarmEvent::new(SwarmEventKind::ModeChanged)
                .with_data(json!({ "mode": Mode::Planning })),
        )
        .await;
        self.project_id = Some(project_id.to_string());
        Ok(state)
    }

    /// Accept the decomposed sections
    pub async fn decompose(&mut self, project_id: &str, plan: SectionPlan) -> Result<ModeState> {
        let waves = plan.waves();
        let ctx = EnterContext::new()
            .project(project_id)
            .with_data(json!({ "sections": plan.sections().len(), "waves": waves }));
        let state = self.transition(Mode::Decomposing, &ctx).await?;

        tracing::info!(
            project_id = %project_id,
            sections = plan.sections().len(),
            waves = waves.len(),
            "Section plan accepted"
        );
        self.emit(
            SwarmEvent::new(SwarmEventKind::PlanAccepted)
                .with_data(json!({ "sections": plan.sections().len(), "waves": waves.len() })),
        )
        .await;
        self.project_id = Some(project_id.to_string());
        self.plan = Some(plan);
        Ok(state)
    }

    /// Build the ownership map and enter execution. An invalid map keeps
    /// the session in decomposition.
    pub async fn execute(&mut self, session_id: &str) -> Result<Arc<OwnershipMap>> {
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| ForemanError::NotReady("no section plan has been accepted".into()))?;

        let map = build_ownership_map_with(&plan.claims(), &self.shared_patterns);
        map.validate()?;
        let map = Arc::new(map);

        let mut ctx = EnterContext::new().session(session_id);
        if let Some(project_id) = self.project_id.clone() {
            ctx = ctx.project(&project_id);
        }
        self.transition(Mode::Executing, &ctx).await?;

        for warning in map.warnings() {
            tracing::warn!(message = %warning.message, "Ownership warning");
        }
        self.emit(SwarmEvent::new(SwarmEventKind::OwnershipMapBuilt).with_data(json!({
            "files": map.file_to_section.len(),
            "globs": map.glob_to_section.len(),
            "warnings": map.warnings().len(),
        })))
        .await;

        self.session_id = Some(session_id.to_string());
        self.map = Some(Arc::clone(&map));
        Ok(map)
    }

    /// Enforcement context for a worker bound to `section_id`
    pub async fn worker_context(&mut self, section_id: &str) -> Result<EnforcementContext> {
        let map = self
            .map
            .clone()
            .ok_or_else(|| ForemanError::NotReady("no ownership map; call execute first".into()))?;
        let plan = self.plan_mut()?;
        let section = plan
            .get(section_id)
            .ok_or_else(|| ForemanError::UnknownSection(section_id.to_string()))?;

        match section.status {
            SectionStatus::Pending | SectionStatus::Running => {}
            other => {
                return Err(ForemanError::NotReady(format!(
                    "section {} is {:?}",
                    section_id, other
                )))
            }
        }
        let blocked: Vec<String> = section
            .dependencies
            .iter()
            .filter(|d| !plan.get(d).map(|s| s.status.is_done()).unwrap_or(false))
            .cloned()
            .collect();
        if !blocked.is_empty() {
            return Err(ForemanError::NotReady(format!(
                "section {} waits on {}",
                section_id,
                blocked.join(", ")
            )));
        }

        self.set_status(section_id, SectionStatus::Running)?;
        tracing::info!(section_id = %section_id, "Worker dispatched");
        self.emit(SwarmEvent::new(SwarmEventKind::SectionStarted).for_section(section_id))
            .await;
        Ok(EnforcementContext::new(section_id, map))
    }

    /// Run the validation gate for a finished section. The validating
    /// sub-mode is always exited, whatever the gate returns.
    #[tracing::instrument(skip(self), fields(session_id = ?self.session_id))]
    pub async fn complete_section(&mut self, section_id: &str) -> Result<ValidationOutcome> {
        let session_id = self.session()?;
        let status = self
            .plan
            .as_ref()
            .and_then(|p| p.get(section_id))
            .map(|s| s.status)
            .ok_or_else(|| ForemanError::UnknownSection(section_id.to_string()))?;
        // Only a dispatched worker can finish; dispatch already checked dependencies
        if status != SectionStatus::Running {
            return Err(ForemanError::NotReady(format!(
                "section {} is {:?}, not running",
                section_id, status
            )));
        }

        self.transition(Mode::Validating, &EnterContext::new().session(&session_id))
            .await?;
        self.set_status(section_id, SectionStatus::Validating)?;

        let session = ValidationSession::new(&session_id, &self.project_root).for_section(section_id);
        let result = self.gate.validate_completion(&session).await;
        let exited = self.registry.exit().await;

        match result {
            Ok(outcome) => {
                exited?;
                self.set_status(section_id, SectionStatus::Completed)?;
                self.emit(
                    SwarmEvent::new(SwarmEventKind::SectionCompleted)
                        .for_section(section_id)
                        .with_data(json!({ "warnings": outcome.warnings.len() })),
                )
                .await;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(exit_error) = exited {
                    tracing::error!(error = %exit_error, "Failed to leave validating sub-mode");
                }
                let section = self
                    .plan_mut()?
                    .get_mut(section_id)
                    .ok_or_else(|| ForemanError::UnknownSection(section_id.to_string()))?;
                let failures = e.failures().len();
                if failures > 0 {
                    section.retry_count += 1;
                }
                section.status = if section.retry_count >= section.max_retries {
                    SectionStatus::Failed
                } else {
                    SectionStatus::Pending
                };
                let (retry_count, status) = (section.retry_count, section.status);

                tracing::warn!(section_id = %section_id, retry_count, ?status, "Section did not pass validation");
                self.emit(
                    SwarmEvent::new(SwarmEventKind::SectionFailed)
                        .for_section(section_id)
                        .with_data(json!({
                            "failures": failures,
                            "retryCount": retry_count,
                            "status": status,
                        })),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Complete a section through an audited bypass
    pub async fn bypass_section(
        &mut self,
        section_id: &str,
        mut request: BypassRequest,
    ) -> Result<BypassOutcome> {
        let session_id = self.session()?;
        let status = self
            .plan
            .as_ref()
            .and_then(|p| p.get(section_id))
            .map(|s| s.status)
            .ok_or_else(|| ForemanError::UnknownSection(section_id.to_string()))?;
        if status.is_done() {
            return Err(ForemanError::NotReady(format!(
                "section {} is already complete",
                section_id
            )));
        }

        request.section_id = Some(section_id.to_string());
        let outcome = self.gate.request_validation_bypass(&session_id, request).await?;
        self.set_status(section_id, SectionStatus::CompletedWithBypass)?;
        self.emit(
            SwarmEvent::new(SwarmEventKind::SectionBypassed)
                .for_section(section_id)
                .with_data(json!({ "user": outcome.entry.user })),
        )
        .await;
        Ok(outcome)
    }

    /// Apply the shared-file changes recorded by a finished wave of workers
    pub async fn merge_wave(&mut self, contexts: Vec<EnforcementContext>) -> Result<MergeReport> {
        if self.map.is_none() {
            return Err(ForemanError::NotReady("no ownership map; call execute first".into()));
        }
        let changes: Vec<SharedFileChange> = contexts
            .into_iter()
            .flat_map(EnforcementContext::into_shared_file_changes)
            .collect();

        let report = apply_shared_file_changes(&changes, &self.project_root)?;
        tracing::info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "Shared-file changes merged"
        );
        self.emit(SwarmEvent::new(SwarmEventKind::SharedChangesMerged).with_data(json!({
            "applied": report.applied.len(),
            "skipped": report.skipped.len(),
            "files": report.files_written,
        })))
        .await;
        Ok(report)
    }

    /// Move to integration once every section is done
    pub async fn integrate(&mut self) -> Result<ModeState> {
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| ForemanError::NotReady("no section plan has been accepted".into()))?;
        if !plan.is_complete() {
            return Err(ForemanError::NotReady(format!(
                "unfinished sections: {}",
                plan.unfinished().join(", ")
            )));
        }
        let session_id = self.session()?;
        self.transition(Mode::Integrating, &EnterContext::new().session(&session_id))
            .await
    }

    /// Return to idle and forget the session
    pub async fn finish(&mut self) -> Result<ModeState> {
        let mut state = self.registry.exit().await?;
        if state.current_mode != Mode::Idle {
            state = self.registry.exit().await?;
        }
        self.emit(
            SwarmEvent::new(SwarmEventKind::SessionFinished)
                .with_data(json!({ "sessionId": self.session_id })),
        )
        .await;
        self.clear();
        Ok(state)
    }

    /// Force the registry back to idle
    pub async fn abort(&mut self) -> Result<ModeState> {
        let state = self.registry.force_reset().await?;
        tracing::warn!(session_id = ?self.session_id, "Session aborted");
        self.emit(
            SwarmEvent::new(SwarmEventKind::SessionAborted)
                .with_data(json!({ "sessionId": self.session_id })),
        )
        .await;
        self.clear();
        Ok(state)
    }

    fn clear(&mut self) {
        self.project_id = None;
        self.session_id = None;
        self.plan = None;
        self.map = None;
    }

    /// Feed a completed tool sequence to the crystallizer
    pub async fn observe(
        &mut self,
        session_id: &str,
        tools: Vec<String>,
        goal: &str,
        outcome: Outcome,
    ) -> Result<RecordedObservation> {
        let recorded = self
            .crystallizer
            .record_observation(NewObservation {
                session_id: session_id.to_string(),
                tool_sequence: tools,
                goal_summary: goal.to_string(),
                outcome,
                timestamp: Utc::now(),
            })
            .await?;
        self.emit(SwarmEvent::new(SwarmEventKind::PatternObserved).with_data(json!({
            "observationId": recorded.id,
            "signature": recorded.signature,
        })))
        .await;
        Ok(recorded)
    }
}

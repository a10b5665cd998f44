//! # Mode Registry
//!
//! Session-wide state machine gating which phase is active.
//!
//! ## Phases
//!
//! ```text
//! idle → planning → decomposing → executing ⇄ integrating → idle
//!                                     │
//!                                     └── validating (sub-mode)
//! ```
//!
//! Every mutation runs inside one FIFO `tokio::sync::Mutex`, is written to
//! `.foreman/mode-state.json` before the lock is released, and is then
//! broadcast to listeners. A missing or malformed state file yields the
//! default idle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::Mutex;

use super::io::RuntimePaths;
use crate::error::{ForemanError, Result};

// ============================================================================
// Modes
// ============================================================================

/// A session phase or sub-mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Idle,
    Planning,
    Decomposing,
    Executing,
    Integrating,
    /// Sub-mode of `Executing`
    Validating,
}

impl Mode {
    pub const ALL: [Mode; 6] = [
        Mode::Idle,
        Mode::Planning,
        Mode::Decomposing,
        Mode::Executing,
        Mode::Integrating,
        Mode::Validating,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Decomposing => "decomposing",
            Self::Executing => "executing",
            Self::Integrating => "integrating",
            Self::Validating => "validating",
        }
    }

    /// Static transition rules for this mode
    pub fn definition(&self) -> &'static ModeDefinition {
        let index = match self {
            Self::Idle => 0,
            Self::Planning => 1,
            Self::Decomposing => 2,
            Self::Executing => 3,
            Self::Integrating => 4,
            Self::Validating => 5,
        };
        &MODE_TABLE[index]
    }

    pub fn is_sub_mode(&self) -> bool {
        self.definition().parent.is_some()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Mode::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| format!("unknown mode '{}'", s))
    }
}

/// Transition rules for one mode
#[derive(Debug)]
pub struct ModeDefinition {
    pub mode: Mode,
    /// Set for sub-modes: the only mode they can nest under
    pub parent: Option<Mode>,
    /// Exclusive modes may only be re-entered by the context that holds them
    pub exclusive: bool,
    pub allowed_transitions_from: &'static [Mode],
    pub allowed_sub_modes: &'static [Mode],
    pub requires_session: bool,
}

static MODE_TABLE: [ModeDefinition; 6] = [
    ModeDefinition {
        mode: Mode::Idle,
        parent: None,
        exclusive: false,
        allowed_transitions_from: &Mode::ALL,
        allowed_sub_modes: &[],
        requires_session: false,
    },
    ModeDefinition {
        mode: Mode::Planning,
        parent: None,
        exclusive: true,
        allowed_transitions_from: &[Mode::Idle, Mode::Planning],
        allowed_sub_modes: &[],
        requires_session: false,
    },
    ModeDefinition {
        mode: Mode::Decomposing,
        parent: None,
        exclusive: true,
        allowed_transitions_from: &[Mode::Planning, Mode::Decomposing],
        allowed_sub_modes: &[],
        requires_session: false,
    },
    ModeDefinition {
        mode: Mode::Executing,
        parent: None,
        exclusive: true,
        allowed_transitions_from: &[Mode::Decomposing, Mode::Executing, Mode::Integrating],
        allowed_sub_modes: &[Mode::Validating],
        requires_session: true,
    },
    ModeDefinition {
        mode: Mode::Integrating,
        parent: None,
        exclusive: true,
        allowed_transitions_from: &[Mode::Executing, Mode::Integrating],
        allowed_sub_modes: &[],
        requires_session: false,
    },
    ModeDefinition {
        mode: Mode::Validating,
        parent: Some(Mode::Executing),
        exclusive: false,
        allowed_transitions_from: &[],
        allowed_sub_modes: &[],
        requires_session: false,
    },
];

// ============================================================================
// State
// ============================================================================

/// Durable session-wide mode state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeState {
    pub current_mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub active_sub_modes: BTreeSet<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_data: Option<serde_json::Value>,
    pub entered_at: DateTime<Utc>,
}

impl Default for ModeState {
    fn default() -> Self {
        Self {
            current_mode: Mode::Idle,
            project_id: None,
            session_id: None,
            active_sub_modes: BTreeSet::new(),
            mode_data: None,
            entered_at: Utc::now(),
        }
    }
}

impl ModeState {
    /// Sub-modes must be allowed by the current parent, and at most one is active
    pub fn is_consistent(&self) -> bool {
        let parent = self.current_mode.definition();
        self.active_sub_modes.len() <= 1
            && self
                .active_sub_modes
                .iter()
                .all(|m| parent.allowed_sub_modes.contains(m))
            && !self.current_mode.is_sub_mode()
    }

    fn is_pristine_idle(&self) -> bool {
        self.current_mode == Mode::Idle
            && self.active_sub_modes.is_empty()
            && self.project_id.is_none()
            && self.session_id.is_none()
            && self.mode_data.is_none()
    }
}

/// Project/session context supplied with a transition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnterContext {
    pub project_id: Option<String>,
    pub session_id: Option<String>,
    pub mode_data: Option<serde_json::Value>,
}

impl EnterContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project(mut self, project_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.mode_data = Some(data);
        self
    }
}

/// Outcome of `can_enter`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnterCheck {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicting_mode: Option<Mode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl EnterCheck {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            conflicting_mode: None,
            suggestion: None,
        }
    }

    fn deny(reason: String, conflicting_mode: Option<Mode>, suggestion: Option<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            conflicting_mode,
            suggestion,
        }
    }
}

/// Pure transition predicate
pub fn evaluate_transition(state: &ModeState, mode: Mode, ctx: &EnterContext) -> EnterCheck {
    if mode == Mode::Idle {
        return EnterCheck::allow();
    }

    let current = state.current_mode;
    let definition = mode.definition();

    if let Some(parent) = definition.parent {
        if !current.definition().allowed_sub_modes.contains(&mode) {
            return EnterCheck::deny(
                format!("{} is only available while {} is active (current: {})", mode, parent, current),
                Some(current),
                Some(format!("Enter {} first", parent)),
            );
        }
        if let Some(other) = state.active_sub_modes.iter().find(|m| **m != mode) {
            return EnterCheck::deny(
                format!("sub-mode {} is already active", other),
                Some(*other),
                Some("Exit the active sub-mode first".to_string()),
            );
        }
        if let Some(mismatch) = context_mismatch(state, ctx) {
            return EnterCheck::deny(
                format!("{} context mismatch: {}", mode, mismatch),
                Some(current),
                Some(format!("Use the context of the active {} phase", current)),
            );
        }
        return EnterCheck::allow();
    }

    if !definition.allowed_transitions_from.contains(&current) {
        let from = definition
            .allowed_transitions_from
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        return EnterCheck::deny(
            format!("{} cannot be entered from {}", mode, current),
            Some(current),
            Some(format!("{} is reachable from: {}", mode, from)),
        );
    }

    if current == mode && definition.exclusive {
        if let Some(mismatch) = context_mismatch(state, ctx) {
            return EnterCheck::deny(
                format!("{} is already active for a different context: {}", mode, mismatch),
                Some(mode),
                Some("Finish the active session or force a reset".to_string()),
            );
        }
    }

    if definition.requires_session
        && ctx
            .session_id
            .as_deref()
            .map_or(true, |s| s.trim().is_empty())
    {
        return EnterCheck::deny(
            format!("{} requires a session id", mode),
            None,
            Some("Pass a session id in the context".to_string()),
        );
    }

    EnterCheck::allow()
}

/// Supplied fields must equal the stored ones; omitted fields are not compared
fn context_mismatch(state: &ModeState, ctx: &EnterContext) -> Option<String> {
    let fields = [
        ("project", &ctx.project_id, &state.project_id),
        ("session", &ctx.session_id, &state.session_id),
    ];
    for (label, supplied, stored) in fields {
        if let Some(supplied) = supplied {
            if stored.as_deref() != Some(supplied.as_str()) {
                return Some(format!(
                    "{} '{}' does not match active {} '{}'",
                    label,
                    supplied,
                    label,
                    stored.as_deref().unwrap_or("<none>")
                ));
            }
        }
    }
    None
}

fn apply_transition(state: &ModeState, mode: Mode, ctx: &EnterContext) -> ModeState {
    let mut next = state.clone();

    if mode.is_sub_mode() {
        next.active_sub_modes.insert(mode);
        return next;
    }

    let same_mode = state.current_mode == mode;
    next.current_mode = mode;
    next.entered_at = Utc::now();
    next.active_sub_modes.clear();

    if mode == Mode::Idle {
        next.project_id = None;
        next.session_id = None;
        next.mode_data = None;
        return next;
    }

    if let Some(project_id) = &ctx.project_id {
        next.project_id = Some(project_id.clone());
    }
    if let Some(session_id) = &ctx.session_id {
        next.session_id = Some(session_id.clone());
    }
    if !same_mode || ctx.mode_data.is_some() {
        next.mode_data = ctx.mode_data.clone();
    }

    next
}

// ============================================================================
// Registry
// ============================================================================

type Listener = Arc<dyn Fn(&ModeState) + Send + Sync>;
type ListenerList = StdMutex<Vec<(u64, Listener)>>;

/// Cancels a listener subscription
#[derive(Debug)]
pub struct ListenerHandle {
    id: u64,
    listeners: Weak<ListenerList>,
}

impl ListenerHandle {
    pub fn cancel(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            if let Ok(mut list) = listeners.lock() {
                list.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

/// Session-wide mode registry bound to one workspace
pub struct ModeRegistry {
    state: Mutex<ModeState>,
    state_path: PathBuf,
    listeners: Arc<ListenerList>,
    next_listener_id: AtomicU64,
}

impl ModeRegistry {
    /// Open the registry for a workspace, loading persisted state if usable
    pub fn open(paths: &RuntimePaths) -> Self {
        let state_path = paths.mode_state_path();
        let state = load_state(&state_path);
        tracing::debug!(mode = %state.current_mode, path = %state_path.display(), "Mode registry opened");

        Self {
            state: Mutex::new(state),
            state_path,
            listeners: Arc::new(StdMutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Snapshot of the current state
    pub async fn get_state(&self) -> ModeState {
        self.state.lock().await.clone()
    }

    pub async fn current_mode(&self) -> Mode {
        self.state.lock().await.current_mode
    }

    /// True if `mode` is the current phase or an active sub-mode
    pub async fn is_active(&self, mode: Mode) -> bool {
        let state = self.state.lock().await;
        state.current_mode == mode || state.active_sub_modes.contains(&mode)
    }

    /// Check whether a transition would be allowed, without applying it
    pub async fn can_enter(&self, mode: Mode, ctx: &EnterContext) -> EnterCheck {
        let state = self.state.lock().await;
        evaluate_transition(&state, mode, ctx)
    }

    /// Validate and apply a transition
    pub async fn enter(&self, mode: Mode, ctx: &EnterContext) -> Result<ModeState> {
        let mut state = self.state.lock().await;

        let check = evaluate_transition(&state, mode, ctx);
        if !check.allowed {
            let reason = check.reason.unwrap_or_default();
            tracing::warn!(mode = %mode, current = %state.current_mode, reason = %reason, "Mode transition rejected");
            return Err(ForemanError::TransitionConflict {
                mode,
                conflicting_mode: check.conflicting_mode,
                reason,
                suggestion: check.suggestion,
            });
        }

        let next = apply_transition(&state, mode, ctx);
        self.commit(&mut state, next).await?;
        tracing::info!(mode = %mode, project_id = ?state.project_id, session_id = ?state.session_id, "Entered mode");
        Ok(state.clone())
    }

    /// Leave the active sub-mode, or return to idle when none is active
    pub async fn exit(&self) -> Result<ModeState> {
        let mut state = self.state.lock().await;

        if !state.active_sub_modes.is_empty() {
            let mut next = state.clone();
            next.active_sub_modes.clear();
            self.commit(&mut state, next).await?;
            tracing::info!(mode = %state.current_mode, "Exited sub-mode");
            return Ok(state.clone());
        }

        if state.current_mode == Mode::Idle {
            return Ok(state.clone());
        }

        let next = apply_transition(&state, Mode::Idle, &EnterContext::default());
        self.commit(&mut state, next).await?;
        tracing::info!("Exited to idle");
        Ok(state.clone())
    }

    /// Unconditionally return to idle; the error-recovery path
    pub async fn force_reset(&self) -> Result<ModeState> {
        let mut state = self.state.lock().await;

        let next = if state.is_pristine_idle() {
            state.clone()
        } else {
            ModeState::default()
        };
        self.commit(&mut state, next).await?;
        tracing::warn!("Mode registry force-reset to idle");
        Ok(state.clone())
    }

    /// Replace the phase-specific payload of the current mode
    pub async fn set_mode_data(&self, data: Option<serde_json::Value>) -> Result<ModeState> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.mode_data = data;
        self.commit(&mut state, next).await?;
        Ok(state.clone())
    }

    /// Register a callback invoked with every new state
    pub fn subscribe<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&ModeState) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut list) = self.listeners.lock() {
            list.push((id, Arc::new(listener)));
        }
        ListenerHandle {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Persist, swap in, then notify. Runs with the state lock held.
    async fn commit(&self, state: &mut ModeState, next: ModeState) -> Result<()> {
        if let Err(e) = self.persist(&next).await {
            tracing::error!(error = %e, path = %self.state_path.display(), "Failed to persist mode state");
            return Err(ForemanError::Persistence(e.to_string()));
        }
        *state = next;
        self.notify(state);
        Ok(())
    }

    async fn persist(&self, state: &ModeState) -> anyhow::Result<()> {
        if let Some(parent) = self.state_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(state)?;
        let tmp = self.state_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.state_path).await?;
        Ok(())
    }

    fn notify(&self, state: &ModeState) {
        // Clone out so listeners may cancel subscriptions while running
        let listeners: Vec<Listener> = match self.listeners.lock() {
            Ok(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => return,
        };

        for listener in listeners {
            let snapshot = state.clone();
            if catch_unwind(AssertUnwindSafe(|| listener(&snapshot))).is_err() {
                tracing::warn!(mode = %state.current_mode, "Mode listener panicked");
            }
        }
    }
}

/// Read persisted state; anything unusable becomes the default
fn load_state(path: &Path) -> ModeState {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return ModeState::default(),
    };

    match serde_json::from_str::<ModeState>(&content) {
        Ok(state) if state.is_consistent() => state,
        Ok(_) => {
            tracing::warn!(path = %path.display(), "Persisted mode state is inconsistent, using idle");
            ModeState::default()
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Malformed mode state, using idle");
            ModeState::default()
        }
    }
}

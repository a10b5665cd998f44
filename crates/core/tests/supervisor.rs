use std::sync::Arc;

use foreman_core::config::{CrystallizerConfig, ForemanConfig};
use foreman_core::ownership::{OwnershipClaim, SharedChangeKind, SharedFileChange};
use foreman_core::patterns::{Outcome, PatternCrystallizer};
use foreman_core::state::{ForemanDb, Mode, ModeRegistry, RuntimePaths};
use foreman_core::swarm::{
    FileAction, Section, SectionPlan, SectionStatus, Supervisor, SwarmEventKind,
};
use foreman_core::validation::{
    AuditAction, AuditLog, BypassRequest, CheckKind, CheckRunner, StaticCheckRunner,
    ValidationGate,
};
use foreman_core::ForemanError;
use tokio::sync::mpsc;

struct Harness {
    _dir: tempfile::TempDir,
    paths: RuntimePaths,
    registry: Arc<ModeRegistry>,
    gate: Arc<ValidationGate>,
    supervisor: Supervisor,
}

fn harness(runner: StaticCheckRunner) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let paths = RuntimePaths::new(dir.path());
    let config = ForemanConfig::default();

    let registry = Arc::new(ModeRegistry::open(&paths));
    let runner: Arc<dyn CheckRunner> = Arc::new(runner);
    let audit = AuditLog::new(&paths, &config.validation.audit_log).unwrap();
    let gate = Arc::new(ValidationGate::new(config.validation.clone(), runner, audit));
    let db = ForemanDb::open(&paths).unwrap();
    let crystallizer = Arc::new(
        PatternCrystallizer::open(
            &db,
            CrystallizerConfig {
                quarantine_secs: 0,
                ..Default::default()
            },
        )
        .unwrap(),
    );

    let supervisor = Supervisor::new(
        Arc::clone(&registry),
        Arc::clone(&gate),
        crystallizer,
        dir.path(),
    );
    Harness {
        _dir: dir,
        paths,
        registry,
        gate,
        supervisor,
    }
}

fn shop_plan() -> SectionPlan {
    SectionPlan::new(vec![
        Section::new("models", "Data models").with_file("src/models/cart.ts", FileAction::Create),
        Section::new("api", "Checkout API")
            .depends_on("models")
            .with_ownership(OwnershipClaim::new("api").with_globs(["src/api/**"])),
        Section::new("ui", "Checkout UI")
            .depends_on("models")
            .with_ownership(OwnershipClaim::new("ui").with_globs(["src/ui/**"])),
    ])
    .unwrap()
}

#[tokio::test]
async fn test_session_runs_to_integration() {
    let mut h = harness(StaticCheckRunner::passing());
    let (tx, mut rx) = mpsc::channel(64);
    h.supervisor = h.supervisor.with_event_channel(tx);
    std::fs::write(h.paths.workspace().join("package.json"), r#"{"name":"shop"}"#).unwrap();

    h.supervisor.plan("shop").await.unwrap();
    h.supervisor.decompose("shop", shop_plan()).await.unwrap();
    let map = h.supervisor.execute("run-1").await.unwrap();
    assert_eq!(map.owner_of("src/api/routes.ts", None), Some("api"));
    assert_eq!(h.registry.current_mode().await, Mode::Executing);

    // Dependents wait on the first wave
    assert!(matches!(
        h.supervisor.worker_context("api").await,
        Err(ForemanError::NotReady(_))
    ));

    let models = h.supervisor.worker_context("models").await.unwrap();
    assert!(models.check_write_permission("src/models/cart.ts").allowed);
    assert!(!models.check_write_permission("src/ui/Cart.tsx").allowed);
    h.supervisor.complete_section("models").await.unwrap();
    assert!(!h.registry.is_active(Mode::Validating).await);

    let mut api = h.supervisor.worker_context("api").await.unwrap();
    let mut ui = h.supervisor.worker_context("ui").await.unwrap();
    assert!(!api.check_write_permission("src/ui/Cart.tsx").allowed);
    assert!(api.record_shared_file_change(SharedFileChange::new(
        "package.json",
        "api",
        SharedChangeKind::Dependency {
            name: "zod".into(),
            version: "^3.22.0".into(),
            dev: false,
        },
        "request validation",
    )));
    assert!(ui.record_shared_file_change(SharedFileChange::new(
        "package.json",
        "ui",
        SharedChangeKind::Script {
            name: "storybook".into(),
            command: "storybook dev".into(),
        },
        "",
    )));
    h.supervisor.complete_section("api").await.unwrap();
    h.supervisor.complete_section("ui").await.unwrap();

    let report = h.supervisor.merge_wave(vec![api, ui]).await.unwrap();
    assert_eq!(report.applied.len(), 2);
    let manifest: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(h.paths.workspace().join("package.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["dependencies"]["zod"], "^3.22.0");
    assert_eq!(manifest["scripts"]["storybook"], "storybook dev");

    h.supervisor.integrate().await.unwrap();
    assert_eq!(h.registry.current_mode().await, Mode::Integrating);

    let recorded = h
        .supervisor
        .observe("run-1", vec!["Read".into(), "Edit".into()], "add cart model", Outcome::Success)
        .await
        .unwrap();
    recorded.release.await.unwrap();

    let state = h.supervisor.finish().await.unwrap();
    assert_eq!(state.current_mode, Mode::Idle);
    assert!(h.supervisor.section_plan().is_none());

    let audit = h.gate.audit().read_all().await.unwrap();
    assert_eq!(audit.len(), 3);
    assert!(audit.iter().all(|e| e.action == AuditAction::ValidationPassed));

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    assert_eq!(kinds.len(), h.supervisor.events().len());
    assert!(kinds.contains(&SwarmEventKind::OwnershipMapBuilt));
    assert_eq!(
        kinds.iter().filter(|k| **k == SwarmEventKind::SectionCompleted).count(),
        3
    );
    assert_eq!(kinds.last(), Some(&SwarmEventKind::SessionFinished));
}

#[tokio::test]
async fn test_failed_validation_counts_retries_then_bypass() {
    let mut h = harness(StaticCheckRunner::passing().failing(CheckKind::Tests, "2 tests failed"));
    let plan = SectionPlan::new(vec![
        Section::new("solo", "Only section").with_file("src/index.ts", FileAction::Modify),
    ])
    .unwrap();

    h.supervisor.plan("shop").await.unwrap();
    h.supervisor.decompose("shop", plan).await.unwrap();
    h.supervisor.execute("run-2").await.unwrap();

    for attempt in 1..=3u32 {
        h.supervisor.worker_context("solo").await.unwrap();
        let err = h.supervisor.complete_section("solo").await.unwrap_err();
        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].check, CheckKind::Tests);
        assert!(!h.registry.is_active(Mode::Validating).await);

        let section = h.supervisor.section_plan().unwrap().get("solo").unwrap();
        assert_eq!(section.retry_count, attempt);
    }
    let section = h.supervisor.section_plan().unwrap().get("solo").unwrap();
    assert_eq!(section.status, SectionStatus::Failed);
    assert!(h.supervisor.worker_context("solo").await.is_err());
    assert!(h.supervisor.integrate().await.is_err());

    let rejected = h
        .supervisor
        .bypass_section(
            "solo",
            BypassRequest {
                user: "dana".into(),
                reason: "flaky upstream fixture".into(),
                acknowledge_risk: false,
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(rejected, Err(ForemanError::BypassRejected(_))));

    let outcome = h
        .supervisor
        .bypass_section(
            "solo",
            BypassRequest {
                user: "dana".into(),
                reason: "flaky upstream fixture".into(),
                acknowledge_risk: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.entry.section_id.as_deref(), Some("solo"));
    assert_eq!(
        h.supervisor.section_plan().unwrap().get("solo").unwrap().status,
        SectionStatus::CompletedWithBypass
    );

    h.supervisor.integrate().await.unwrap();
    let audit = h.gate.audit().read_all().await.unwrap();
    assert_eq!(
        audit.iter().filter(|e| e.action == AuditAction::ValidationFailed).count(),
        3
    );
    assert_eq!(audit.last().unwrap().action, AuditAction::BypassApproved);
}

#[tokio::test]
async fn test_invalid_ownership_keeps_session_decomposing() {
    let mut h = harness(StaticCheckRunner::passing());
    let plan = SectionPlan::new(vec![
        Section::new("a", "A").with_ownership(OwnershipClaim::new("a").with_globs(["src/**"])),
        Section::new("b", "B").with_ownership(OwnershipClaim::new("b").with_globs(["src/**"])),
    ])
    .unwrap();

    h.supervisor.plan("shop").await.unwrap();
    h.supervisor.decompose("shop", plan).await.unwrap();
    let err = h.supervisor.execute("run-3").await.unwrap_err();
    assert!(matches!(err, ForemanError::OwnershipInvalid(_)));
    assert_eq!(h.registry.current_mode().await, Mode::Decomposing);

    let state = h.supervisor.abort().await.unwrap();
    assert_eq!(state.current_mode, Mode::Idle);
    assert_eq!(
        h.supervisor.events().last().map(|e| e.kind),
        Some(SwarmEventKind::SessionAborted)
    );
}

#[tokio::test]
async fn test_complete_section_requires_dispatched_worker() {
    let mut h = harness(StaticCheckRunner::passing());
    h.supervisor.plan("shop").await.unwrap();
    h.supervisor.decompose("shop", shop_plan()).await.unwrap();
    h.supervisor.execute("run-4").await.unwrap();

    // Never dispatched, and its dependency has not started either
    let err = h.supervisor.complete_section("api").await.unwrap_err();
    assert!(matches!(err, ForemanError::NotReady(_)));
    let api = h.supervisor.section_plan().unwrap().get("api").unwrap();
    assert_eq!(api.status, SectionStatus::Pending);
    assert!(!h.registry.is_active(Mode::Validating).await);

    h.supervisor.worker_context("models").await.unwrap();
    h.supervisor.complete_section("models").await.unwrap();

    let again = h.supervisor.complete_section("models").await;
    assert!(matches!(again, Err(ForemanError::NotReady(_))));
    assert_eq!(
        h.supervisor.section_plan().unwrap().get("models").unwrap().status,
        SectionStatus::Completed
    );

    // Only the one real completion reached the gate
    assert_eq!(h.gate.audit().read_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_events_reset_when_next_session_plans() {
    let mut h = harness(StaticCheckRunner::passing());
    h.supervisor.plan("shop").await.unwrap();
    h.supervisor.decompose("shop", shop_plan()).await.unwrap();
    h.supervisor.abort().await.unwrap();
    assert_eq!(
        h.supervisor.events().last().map(|e| e.kind),
        Some(SwarmEventKind::SessionAborted)
    );

    h.supervisor.plan("shop").await.unwrap();
    let kinds: Vec<SwarmEventKind> = h.supervisor.events().iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![SwarmEventKind::ModeChanged]);
}

use foreman_core::state::{EnterContext, Mode, ModeRegistry, RuntimePaths};
use foreman_core::ForemanError;

fn registry(dir: &tempfile::TempDir) -> ModeRegistry {
    ModeRegistry::open(&RuntimePaths::new(dir.path()))
}

#[tokio::test]
async fn test_executing_requires_prior_phases() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir);
    assert_eq!(registry.current_mode().await, Mode::Idle);

    let err = registry
        .enter(Mode::Executing, &EnterContext::new().session("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, ForemanError::TransitionConflict { .. }));
    assert_eq!(err.conflicting_mode(), Some(Mode::Idle));
    assert_eq!(registry.current_mode().await, Mode::Idle);

    registry
        .enter(Mode::Planning, &EnterContext::new().project("p"))
        .await
        .unwrap();
    registry
        .enter(Mode::Decomposing, &EnterContext::new().project("p"))
        .await
        .unwrap();
    let state = registry
        .enter(Mode::Executing, &EnterContext::new().project("p").session("x"))
        .await
        .unwrap();
    assert_eq!(state.current_mode, Mode::Executing);
    assert_eq!(state.project_id.as_deref(), Some("p"));
    assert_eq!(state.session_id.as_deref(), Some("x"));
}

#[tokio::test]
async fn test_validating_sub_mode_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir);
    registry
        .enter(Mode::Planning, &EnterContext::new().project("p"))
        .await
        .unwrap();
    registry
        .enter(Mode::Decomposing, &EnterContext::new().project("p"))
        .await
        .unwrap();
    registry
        .enter(Mode::Executing, &EnterContext::new().project("p").session("x"))
        .await
        .unwrap();

    let state = registry
        .enter(Mode::Validating, &EnterContext::new().project("p").session("x"))
        .await
        .unwrap();
    assert_eq!(state.current_mode, Mode::Executing);
    assert!(state.active_sub_modes.contains(&Mode::Validating));
    assert!(registry.is_active(Mode::Validating).await);

    let state = registry.exit().await.unwrap();
    assert_eq!(state.current_mode, Mode::Executing);
    assert!(state.active_sub_modes.is_empty());
}

#[tokio::test]
async fn test_validating_rejects_other_session() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(&dir);
    registry
        .enter(Mode::Planning, &EnterContext::new().project("p"))
        .await
        .unwrap();
    registry
        .enter(Mode::Decomposing, &EnterContext::new().project("p"))
        .await
        .unwrap();
    registry
        .enter(Mode::Executing, &EnterContext::new().session("x"))
        .await
        .unwrap();

    let check = registry
        .can_enter(Mode::Validating, &EnterContext::new().session("y"))
        .await;
    assert!(!check.allowed);
    assert!(registry
        .enter(Mode::Validating, &EnterContext::new().session("y"))
        .await
        .is_err());
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let registry = registry(&dir);
        registry
            .enter(Mode::Planning, &EnterContext::new().project("shop"))
            .await
            .unwrap();
    }

    let reopened = registry(&dir);
    let state = reopened.get_state().await;
    assert_eq!(state.current_mode, Mode::Planning);
    assert_eq!(state.project_id.as_deref(), Some("shop"));

    let state = reopened.force_reset().await.unwrap();
    assert_eq!(state.current_mode, Mode::Idle);
    assert!(state.project_id.is_none());
}

#[tokio::test]
async fn test_corrupt_state_file_falls_back_to_idle() {
    let dir = tempfile::tempdir().unwrap();
    let paths = RuntimePaths::new(dir.path());
    paths.ensure_runtime_dir().unwrap();
    std::fs::write(paths.mode_state_path(), "{ not json").unwrap();

    let registry = ModeRegistry::open(&paths);
    assert_eq!(registry.current_mode().await, Mode::Idle);
    registry
        .enter(Mode::Planning, &EnterContext::new().project("p"))
        .await
        .unwrap();
}

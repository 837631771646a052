use procflow::orchestration::{
    lock_owner, LockOwner, OrchestratorError, ProcessRunStore, RunLock, RunState, RUN_LOCK_FILE,
};
use serde_json::{json, Map, Value};
use tempfile::tempdir;

fn inputs() -> Map<String, Value> {
    let mut inputs = Map::new();
    inputs.insert("target".to_string(), json!("api"));
    inputs.insert("deep_scan".to_string(), json!(false));
    inputs
}

#[test]
fn run_state_transitions_follow_the_lifecycle() {
    assert!(RunState::Queued.can_transition_to(RunState::Running));
    assert!(RunState::Running.can_transition_to(RunState::Waiting));
    assert!(RunState::Waiting.can_transition_to(RunState::Running));
    assert!(RunState::Running.can_transition_to(RunState::Canceled));
    assert!(!RunState::Succeeded.can_transition_to(RunState::Running));
    assert!(!RunState::Queued.can_transition_to(RunState::Succeeded));
    assert!(RunState::Canceled.is_terminal());
    assert!(!RunState::Waiting.is_terminal());
}

#[test]
fn create_run_persists_record_and_queued_progress() {
    let temp = tempdir().expect("tempdir");
    let store = ProcessRunStore::new(temp.path());

    let run = store
        .create_run("run-1", "security-review", inputs(), 100)
        .expect("create");
    assert_eq!(run.state, RunState::Queued);
    assert!(store.run_exists("run-1"));
    assert!(temp.path().join("runs/run-1/run.json").is_file());

    let progress = store.load_progress("run-1").expect("progress");
    assert_eq!(progress.summary, "queued");
    assert_eq!(progress.input_keys, vec!["deep_scan", "target"]);
    assert!(!progress.pending_human_input);

    let err = store
        .create_run("run-1", "security-review", Map::new(), 101)
        .expect_err("duplicate");
    assert!(matches!(err, OrchestratorError::RunAlreadyExists { .. }));
}

#[test]
fn transitions_update_progress_and_terminal_reason() {
    let temp = tempdir().expect("tempdir");
    let store = ProcessRunStore::new(temp.path());
    let mut run = store
        .create_run("run-1", "security-review", inputs(), 100)
        .expect("create");

    store
        .transition_state(&mut run, RunState::Running, 101, "running", "scan")
        .expect("running");
    run.pending_breakpoint = Some("bp-0001".to_string());
    store
        .transition_state(&mut run, RunState::Waiting, 102, "waiting", "decide bp-0001")
        .expect("waiting");
    let progress = store.load_progress("run-1").expect("progress");
    assert!(progress.pending_human_input);
    assert_eq!(progress.pending_breakpoint.as_deref(), Some("bp-0001"));

    store
        .transition_state(&mut run, RunState::Running, 103, "resumed", "continue")
        .expect("resume");
    assert_eq!(run.pending_breakpoint, None);
    store
        .transition_state(&mut run, RunState::Failed, 104, "gate failed at lint", "none")
        .expect("failed");

    let loaded = store.load_run("run-1").expect("load");
    assert_eq!(loaded.state, RunState::Failed);
    assert_eq!(loaded.terminal_reason.as_deref(), Some("gate failed at lint"));
    assert_eq!(loaded.updated_at, 104);

    let err = store
        .transition_state(&mut run, RunState::Running, 105, "again", "none")
        .expect_err("terminal");
    assert!(matches!(
        err,
        OrchestratorError::InvalidRunTransition {
            from: RunState::Failed,
            to: RunState::Running
        }
    ));
}

#[test]
fn unknown_runs_and_missing_results_are_reported() {
    let temp = tempdir().expect("tempdir");
    let store = ProcessRunStore::new(temp.path());
    assert!(matches!(
        store.load_run("run-missing"),
        Err(OrchestratorError::UnknownRunId { .. })
    ));
    assert!(store.list_runs().expect("list").is_empty());

    store
        .create_run("run-1", "p", Map::new(), 1)
        .expect("create");
    assert_eq!(store.load_result("run-1").expect("result"), None);
    let path = store
        .persist_result("run-1", &json!({ "success": true }))
        .expect("persist result");
    assert!(path.ends_with("runs/run-1/result.json"));
    assert_eq!(
        store.load_result("run-1").expect("result"),
        Some(json!({ "success": true }))
    );
}

#[test]
fn list_runs_orders_by_most_recent_update() {
    let temp = tempdir().expect("tempdir");
    let store = ProcessRunStore::new(temp.path());
    store.create_run("run-a", "p", Map::new(), 10).expect("a");
    let mut b = store.create_run("run-b", "p", Map::new(), 5).expect("b");
    store
        .checkpoint(&mut b, 20, "step lint", "lint")
        .expect("checkpoint");

    let ids = store
        .list_runs()
        .expect("list")
        .into_iter()
        .map(|run| run.run_id)
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["run-b", "run-a"]);
}

#[test]
fn run_lock_is_exclusive_and_released_on_drop() {
    let temp = tempdir().expect("tempdir");
    let run_dir = temp.path().join("runs/run-1");

    let lock = RunLock::acquire(&run_dir, "run-1").expect("lock");
    assert!(run_dir.join(RUN_LOCK_FILE).is_file());
    let err = RunLock::acquire(&run_dir, "run-1").expect_err("second lock");
    assert!(matches!(err, OrchestratorError::RunLocked { .. }));

    drop(lock);
    assert!(!run_dir.join(RUN_LOCK_FILE).exists());
    RunLock::acquire(&run_dir, "run-1").expect("lock again");
}

fn exited_pid() -> u32 {
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("spawn true");
    let pid = child.id();
    child.wait().expect("wait true");
    pid
}

#[test]
fn run_lock_left_by_an_exited_process_is_reclaimed() {
    let temp = tempdir().expect("tempdir");
    let run_dir = temp.path().join("runs/run-1");
    std::fs::create_dir_all(&run_dir).expect("run dir");
    let dead = exited_pid();
    std::fs::write(
        run_dir.join(RUN_LOCK_FILE),
        format!("pid={dead}\nacquired_at=2026-01-01T00:00:00Z\n"),
    )
    .expect("plant lock");
    assert_eq!(
        lock_owner(&run_dir.join(RUN_LOCK_FILE)).expect("owner"),
        LockOwner::Stale { pid: Some(dead) }
    );

    let lock = RunLock::acquire(&run_dir, "run-1").expect("reclaim");
    assert_eq!(lock.reclaimed_from(), Some(dead));
    let body = std::fs::read_to_string(lock.path()).expect("lock body");
    assert!(body.contains(&format!("pid={}", std::process::id())));
}

#[test]
fn run_lock_without_a_pid_is_not_reclaimed() {
    let temp = tempdir().expect("tempdir");
    let run_dir = temp.path().join("runs/run-1");
    std::fs::create_dir_all(&run_dir).expect("run dir");
    std::fs::write(run_dir.join(RUN_LOCK_FILE), "").expect("plant lock");

    let err = RunLock::acquire(&run_dir, "run-1").expect_err("locked");
    assert!(matches!(err, OrchestratorError::RunLocked { .. }));
}

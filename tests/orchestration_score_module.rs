use procflow::orchestration::{RunContext, ScoreBoard, ScoreError, ScorePolicy};
use procflow::shared::RunId;
use serde_json::json;
use tempfile::tempdir;

#[test]
fn additive_total_is_clamped_only_at_finalization() {
    let mut board = ScoreBoard::new(ScorePolicy::Additive, 100.0);
    board.add("lint", 60.0).expect("lint");
    board.add("tests", 55.6).expect("tests");
    assert!((board.running_total() - 115.6).abs() < 1e-9);

    let score = board.finalize().expect("finalize");
    assert_eq!(score.value, 100);
    assert!((score.raw - 115.6).abs() < 1e-9);
    assert_eq!(score.contributors, vec!["lint", "tests"]);
}

#[test]
fn finalization_rounds_and_clamps_below_zero() {
    let mut board = ScoreBoard::new(ScorePolicy::Additive, 100.0);
    board.add("a", 40.4).expect("a");
    board.add("b", 29.2).expect("b");
    assert_eq!(board.finalize().expect("finalize").value, 70);

    let mut negative = ScoreBoard::new(ScorePolicy::Additive, 100.0);
    negative.add("penalty", -12.0).expect("penalty");
    assert_eq!(negative.finalize().expect("finalize").value, 0);
}

#[test]
fn pending_steps_block_finalization_until_skipped() {
    let mut board = ScoreBoard::new(ScorePolicy::Additive, 100.0);
    board.expect("s1");
    board.expect("s2");
    board.add("s1", 40.0).expect("s1");

    let err = board.finalize().expect_err("pending");
    assert_eq!(
        err,
        ScoreError::Pending {
            pending: vec!["s2".to_string()]
        }
    );

    board.skip("s2");
    let score = board.finalize().expect("finalize");
    assert_eq!(score.value, 40);
    assert_eq!(score.skipped, vec!["s2"]);
}

#[test]
fn skipped_steps_refuse_contributions() {
    let mut board = ScoreBoard::new(ScorePolicy::Additive, 100.0);
    board.add("s2", 10.0).expect("s2");
    board.skip("s2");
    assert_eq!(board.running_total(), 0.0);
    assert!(matches!(
        board.add("s2", 5.0),
        Err(ScoreError::AlreadySkipped { step }) if step == "s2"
    ));
    assert!(matches!(
        board.add("s3", f64::NAN),
        Err(ScoreError::NotFinite { .. })
    ));
}

#[test]
fn cleared_steps_report_afresh() {
    let mut board = ScoreBoard::new(ScorePolicy::Additive, 100.0);
    board.add("scan", 30.0).expect("first attempt");
    board.clear("scan");
    board.add("scan", 35.0).expect("second attempt");
    assert_eq!(board.finalize().expect("finalize").value, 35);
}

#[test]
fn clearing_a_skipped_step_lets_a_rerun_score_it() {
    let mut board = ScoreBoard::new(ScorePolicy::Additive, 100.0);
    board.expect("scan");
    board.skip("scan");
    assert!(matches!(
        board.add("scan", 10.0),
        Err(ScoreError::AlreadySkipped { .. })
    ));

    board.clear("scan");
    assert_eq!(board.pending(), vec!["scan".to_string()]);
    board.add("scan", 42.0).expect("rerun scores");
    assert_eq!(board.finalize().expect("finalize").value, 42);
}

#[test]
fn normalized_policy_takes_the_weighted_mean_of_reporting_steps() {
    let mut board = ScoreBoard::new(ScorePolicy::Normalized, 100.0);
    board.expect("skipped");
    board.add_weighted("lint", 90.0, 1.0).expect("lint");
    board.add_weighted("tests", 60.0, 2.0).expect("tests");
    board.skip("skipped");

    let score = board.finalize().expect("finalize");
    assert_eq!(score.value, 70);
    assert_eq!(score.policy, ScorePolicy::Normalized);

    let empty = ScoreBoard::new(ScorePolicy::Normalized, 100.0);
    assert_eq!(empty.finalize().expect("finalize").value, 0);
}

#[test]
fn run_context_issues_deterministic_ids_and_summaries() {
    let temp = tempdir().expect("tempdir");
    let mut ctx = RunContext::new(
        RunId::parse("run-test").expect("run id"),
        temp.path(),
        ScorePolicy::Additive,
        100.0,
    );
    let scan = procflow::shared::TaskName::parse("scan").expect("task");
    assert_eq!(ctx.next_effect_id(&scan).as_str(), "0001-scan");
    assert_eq!(ctx.next_effect_id(&scan).as_str(), "0002-scan");
    assert_eq!(ctx.next_breakpoint_id().as_str(), "bp-0001");
    assert_eq!(ctx.effects_issued(), 2);
    assert_eq!(ctx.breakpoints_raised(), 1);

    ctx.append(vec![procflow::orchestration::Artifact::new(
        "scan/findings.json",
        "json",
        "findings",
    )]);
    ctx.add_score("scan", 25.0).expect("score");

    let snapshot = ctx.snapshot();
    assert_eq!(snapshot.artifact_count, 1);
    assert_eq!(snapshot.files, vec!["scan/findings.json"]);
    assert_eq!(snapshot.running_score, 25.0);

    let summary = ctx.summary_with(&json!({ "criticalCount": 3, "runningScore": "override" }));
    assert_eq!(summary["criticalCount"], json!(3));
    assert_eq!(summary["runningScore"], json!("override"));
    assert_eq!(summary["artifactCount"], json!(1));
}

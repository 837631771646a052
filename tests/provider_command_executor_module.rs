use procflow::provider::{
    parse_task_result, AgentExecutor, AgentRequest, CancelFlag, CommandExecutor, ExecutorError,
    EFFECT_ID_ENV, RUN_ID_ENV, TASK_DIR_ENV,
};
use procflow::registry::AgentContract;
use serde_json::{json, Value};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::tempdir;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut perms = fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod");
    path
}

fn request(task_dir: &Path, timeout: Duration) -> AgentRequest {
    AgentRequest {
        run_id: "run-test".to_string(),
        effect_id: "0001-scan".to_string(),
        task: "scan".to_string(),
        contract: AgentContract {
            role: "security engineer".to_string(),
            task: "scan the target".to_string(),
            context: json!({ "target": "api" }),
            instructions: vec!["report criticals".to_string()],
            output_format: Value::Null,
        },
        timeout,
        task_dir: task_dir.to_path_buf(),
        cancel: CancelFlag::default(),
    }
}

fn executor(script: &Path) -> CommandExecutor {
    CommandExecutor::new(script.display().to_string(), Vec::new())
}

#[test]
fn envelope_output_is_parsed() {
    let temp = tempdir().expect("tempdir");
    let script = write_script(
        temp.path(),
        "agent",
        "echo 'thinking...'\necho '[task_result]{\"passed\":true}[/task_result]'",
    );
    let value = executor(&script)
        .run(&request(temp.path(), Duration::from_secs(10)))
        .expect("run");
    assert_eq!(value, json!({ "passed": true }));
}

#[test]
fn whole_stdout_json_is_accepted() {
    let temp = tempdir().expect("tempdir");
    let script = write_script(temp.path(), "agent", "echo '{\"score\": 42}'");
    let value = executor(&script)
        .run(&request(temp.path(), Duration::from_secs(10)))
        .expect("run");
    assert_eq!(value, json!({ "score": 42 }));
}

#[test]
fn environment_and_working_directory_identify_the_effect() {
    let temp = tempdir().expect("tempdir");
    let task_dir = temp.path().join("tasks/0001-scan");
    fs::create_dir_all(&task_dir).expect("task dir");
    let script = write_script(
        temp.path(),
        "agent",
        &format!(
            "printf '{{\"effect\":\"%s\",\"run\":\"%s\",\"dir\":\"%s\",\"cwd\":\"%s\"}}' \"${EFFECT_ID_ENV}\" \"${RUN_ID_ENV}\" \"${TASK_DIR_ENV}\" \"$(pwd)\""
        ),
    );
    let value = executor(&script)
        .run(&request(&task_dir, Duration::from_secs(10)))
        .expect("run");
    assert_eq!(value["effect"], json!("0001-scan"));
    assert_eq!(value["run"], json!("run-test"));
    assert_eq!(value["dir"], json!(task_dir.display().to_string()));
    let cwd = PathBuf::from(value["cwd"].as_str().expect("cwd"));
    assert_eq!(
        cwd.canonicalize().expect("canonical cwd"),
        task_dir.canonicalize().expect("canonical task dir")
    );
}

#[test]
fn contract_is_written_to_stdin() {
    let temp = tempdir().expect("tempdir");
    let script = write_script(
        temp.path(),
        "agent",
        "contract=$(cat)\nprintf '[task_result]{\"contract\":%s}[/task_result]' \"$contract\"",
    );
    let value = executor(&script)
        .run(&request(temp.path(), Duration::from_secs(10)))
        .expect("run");
    assert_eq!(value["contract"]["role"], json!("security engineer"));
    assert_eq!(value["contract"]["context"]["target"], json!("api"));
    assert_eq!(value["contract"]["instructions"], json!(["report criticals"]));
}

#[test]
fn non_zero_exit_is_a_failure_with_stderr() {
    let temp = tempdir().expect("tempdir");
    let script = write_script(temp.path(), "agent", "echo 'quota exceeded' >&2\nexit 3");
    let err = executor(&script)
        .run(&request(temp.path(), Duration::from_secs(10)))
        .expect_err("failure");
    let ExecutorError::Failed { reason } = err else {
        panic!("expected failure, got {err:?}");
    };
    assert!(reason.contains("exited with code 3"));
    assert!(reason.contains("quota exceeded"));
}

#[test]
fn missing_binary_is_unavailable() {
    let temp = tempdir().expect("tempdir");
    let err = CommandExecutor::new(
        temp.path().join("no-such-agent").display().to_string(),
        Vec::new(),
    )
    .run(&request(temp.path(), Duration::from_secs(10)))
    .expect_err("missing binary");
    assert!(matches!(err, ExecutorError::Unavailable(_)));
}

#[test]
fn slow_binary_is_killed_at_the_timeout() {
    let temp = tempdir().expect("tempdir");
    let script = write_script(temp.path(), "agent", "exec sleep 5");
    let err = executor(&script)
        .run(&request(temp.path(), Duration::from_millis(200)))
        .expect_err("timeout");
    assert_eq!(err, ExecutorError::Timeout { timeout_ms: 200 });
}

#[test]
fn cancelled_request_kills_the_binary_early() {
    let temp = tempdir().expect("tempdir");
    let script = write_script(temp.path(), "agent", "exec sleep 5");
    let request = request(temp.path(), Duration::from_secs(10));
    request.cancel.cancel();

    let started = std::time::Instant::now();
    let err = executor(&script).run(&request).expect_err("cancelled");
    assert_eq!(err, ExecutorError::Timeout { timeout_ms: 10_000 });
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn malformed_output_is_a_parse_failure() {
    assert!(matches!(
        parse_task_result("   "),
        Err(ExecutorError::ParseFailure { .. })
    ));
    assert!(matches!(
        parse_task_result("no json here"),
        Err(ExecutorError::ParseFailure { .. })
    ));
    assert!(matches!(
        parse_task_result("[task_result]{\"a\":1}"),
        Err(ExecutorError::ParseFailure { reason }) if reason.contains("missing")
    ));
    assert!(matches!(
        parse_task_result("[task_result]{}[/task_result][task_result]{}[/task_result]"),
        Err(ExecutorError::ParseFailure { reason }) if reason.contains("multiple")
    ));
    assert!(matches!(
        parse_task_result("[task_result]not json[/task_result]"),
        Err(ExecutorError::ParseFailure { .. })
    ));
    assert_eq!(
        parse_task_result("log line\n[task_result]\n{\"ok\": true}\n[/task_result]\ntrailer")
            .expect("envelope"),
        json!({ "ok": true })
    );
}

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::tempdir;

const PROCESS: &str = r#"
id: cli-review
inputs:
  target:
    required: true
tasks:
  scan:
    role: security engineer
    task: scan the target
  report:
    role: technical writer
    task: write the report
steps:
  - type: task
    id: scan
    task: scan
    args: { target: "{{inputs.target}}" }
    score: {}
  - type: breakpoint
    id: review
    title: Review scan
    question: Write the report?
  - type: task
    id: report
    task: report
result:
  outputs:
    report: "{{steps.report.text}}"
"#;

const AGENT: &str = r#"contract=$(cat)
case "$contract" in
  *'"task":"scan the target"'*) echo '[task_result]{"passed":true,"score":50}[/task_result]' ;;
  *) echo '{"text":"report written"}' ;;
esac"#;

fn run(workdir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_procflow"))
        .args(args)
        .current_dir(workdir)
        .env_remove("PROCFLOW_SETTINGS")
        .output()
        .expect("run procflow")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn assert_ok(output: &Output) {
    assert!(
        output.status.success(),
        "stdout:\n{}\nstderr:\n{}",
        stdout(output),
        stderr(output)
    );
}

fn assert_err_contains(output: &Output, needle: &str) {
    assert!(
        !output.status.success(),
        "expected failure, stdout:\n{}\nstderr:\n{}",
        stdout(output),
        stderr(output)
    );
    let text = format!("{}{}", stdout(output), stderr(output));
    assert!(
        text.contains(needle),
        "expected error to contain `{needle}`, got:\n{text}"
    );
}

fn kv_lines(output: &Output) -> BTreeMap<String, String> {
    stdout(output)
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

struct Fixture {
    _temp: tempfile::TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();

        let agent = root.join("agent.sh");
        fs::write(&agent, format!("#!/bin/sh\n{AGENT}\n")).expect("write agent");
        let mut perms = fs::metadata(&agent).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&agent, perms).expect("chmod agent");

        fs::write(
            root.join("settings.yaml"),
            format!(
                "state_root: state\nbreakpoints:\n  mode: detach\nagent:\n  binary: {}\n",
                agent.display()
            ),
        )
        .expect("write settings");
        fs::write(root.join("process.yaml"), PROCESS).expect("write process");
        fs::write(root.join("inputs.json"), r#"{"target":"api"}"#).expect("write inputs");

        Self { _temp: temp, root }
    }

    fn run(&self, args: &[&str]) -> Output {
        let mut full = args.to_vec();
        full.extend(["--settings", "settings.yaml"]);
        run(&self.root, &full)
    }
}

#[test]
fn help_lists_every_command() {
    let temp = tempdir().expect("tempdir");
    let output = run(temp.path(), &["help"]);
    assert_ok(&output);
    let text = stdout(&output);
    for command in ["run", "resume", "decide", "status", "breakpoints"] {
        assert!(text.contains(&format!("  {command} ")), "missing {command}:\n{text}");
    }

    let bare = run(temp.path(), &[]);
    assert_ok(&bare);
    assert!(stdout(&bare).contains("Commands:"));
}

#[test]
fn unknown_commands_and_options_fail() {
    let temp = tempdir().expect("tempdir");
    assert_err_contains(&run(temp.path(), &["deploy"]), "unknown command `deploy`");

    let fixture = Fixture::new();
    assert_err_contains(
        &fixture.run(&["run", "process.yaml", "--force", "yes"]),
        "unknown option `--force`",
    );
    assert_err_contains(&fixture.run(&["status"]), "usage: status");
}

#[test]
fn run_decide_resume_and_inspect_a_parked_run() {
    let fixture = Fixture::new();

    let started = fixture.run(&[
        "run",
        "process.yaml",
        "--inputs",
        "inputs.json",
        "--run-id",
        "run-cli",
    ]);
    assert_ok(&started);
    let kv = kv_lines(&started);
    assert_eq!(kv.get("run_id").map(String::as_str), Some("run-cli"));
    assert_eq!(kv.get("state").map(String::as_str), Some("waiting"));
    assert_eq!(kv.get("pending_breakpoint").map(String::as_str), Some("bp-0001"));
    assert!(fixture
        .root
        .join("state/runs/run-cli/tasks/0001-scan/result.json")
        .is_file());

    let listed = fixture.run(&["breakpoints", "run-cli"]);
    assert_ok(&listed);
    assert!(stdout(&listed)
        .contains("bp-0001 state=awaiting_decision decision=none title=Review scan"));

    assert_err_contains(
        &fixture.run(&["decide", "run-cli", "bp-0001", "maybe"]),
        "invalid decision",
    );

    let decided = fixture.run(&["decide", "run-cli", "bp-0001", "proceed", "--by", "alice"]);
    assert_ok(&decided);
    let kv = kv_lines(&decided);
    assert_eq!(kv.get("decision").map(String::as_str), Some("proceed"));
    assert_eq!(kv.get("breakpoint_id").map(String::as_str), Some("bp-0001"));

    let resumed = fixture.run(&["resume", "process.yaml", "run-cli"]);
    assert_ok(&resumed);
    let kv = kv_lines(&resumed);
    assert_eq!(kv.get("state").map(String::as_str), Some("succeeded"));
    assert_eq!(kv.get("success").map(String::as_str), Some("true"));
    assert!(stdout(&resumed).contains("\"report\": \"report written\""));

    let status = fixture.run(&["status", "run-cli"]);
    assert_ok(&status);
    let kv = kv_lines(&status);
    assert_eq!(kv.get("process_id").map(String::as_str), Some("cli-review"));
    assert_eq!(kv.get("state").map(String::as_str), Some("succeeded"));
    assert_eq!(kv.get("executions").map(String::as_str), Some("2"));
    assert_eq!(kv.get("pending_breakpoint").map(String::as_str), Some("none"));
    assert_eq!(kv.get("success").map(String::as_str), Some("true"));

    assert_err_contains(
        &fixture.run(&["resume", "process.yaml", "run-cli"]),
        "cannot be resumed",
    );
}

#[test]
fn status_of_an_unknown_run_fails() {
    let fixture = Fixture::new();
    assert_err_contains(&fixture.run(&["status", "run-missing"]), "not found");
}

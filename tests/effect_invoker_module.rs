use procflow::effect::{
    EffectCall, EffectError, EffectErrorKind, EffectInvoker, EffectResultRecord, EffectStatus,
};
use procflow::provider::{AgentExecutor, AgentRequest, ExecutorError};
use procflow::registry::{
    AgentContract, AgentTemplate, InvocationContext, TaskDefinition, TaskDescriptor, TaskRegistry,
};
use procflow::shared::{EffectId, RunId, TaskName};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn task(name: &str) -> TaskName {
    TaskName::parse(name).expect("task name")
}

fn agent_template(schema: Value) -> AgentTemplate {
    AgentTemplate {
        contract: AgentContract {
            role: "security engineer".to_string(),
            task: "scan the target".to_string(),
            context: Value::Null,
            instructions: Vec::new(),
            output_format: schema,
        },
        timeout: None,
    }
}

fn registry() -> Arc<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    registry
        .insert(TaskDefinition::agent(
            task("scan"),
            agent_template(json!({
                "type": "object",
                "required": ["passed"],
                "properties": { "passed": { "type": "boolean" } }
            })),
        ))
        .expect("scan");
    registry
        .insert(TaskDefinition::native(task("double"), None, |args: &Value| {
            let n = args
                .get("n")
                .and_then(Value::as_i64)
                .ok_or_else(|| "missing n".to_string())?;
            Ok(json!({ "value": n * 2 }))
        }))
        .expect("double");
    registry
        .insert(TaskDefinition::native(task("boom"), None, |_args: &Value| {
            Err("disk full".to_string())
        }))
        .expect("boom");
    registry
        .insert(TaskDefinition::native(task("lint"), None, |_args: &Value| {
            Ok(json!({
                "passed": true,
                "artifacts": [
                    { "path": "lint/report.md", "format": "markdown", "label": "lint report" }
                ]
            }))
        }))
        .expect("lint");
    registry.into_shared()
}

fn counting_executor(calls: Arc<AtomicUsize>, value: Value) -> Arc<dyn AgentExecutor> {
    Arc::new(move |_request: &AgentRequest| -> Result<Value, ExecutorError> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(value.clone())
    })
}

fn invoker(run_dir: &Path, executor: Arc<dyn AgentExecutor>) -> EffectInvoker {
    EffectInvoker::new(
        RunId::parse("run-test").expect("run id"),
        run_dir,
        registry(),
        executor,
        Duration::from_millis(100),
    )
    .expect("invoker")
}

fn call(seq: u64, name: &str, args: Value) -> EffectCall {
    let name = task(name);
    EffectCall::new(EffectId::from_sequence(&name, seq), name, args)
}

fn read_result(run_dir: &Path, effect_id: &str) -> EffectResultRecord {
    let raw = fs::read_to_string(run_dir.join("tasks").join(effect_id).join("result.json"))
        .expect("read result");
    serde_json::from_str(&raw).expect("parse result")
}

#[test]
fn native_task_success_records_input_and_result() {
    let temp = tempdir().expect("tempdir");
    let calls = Arc::new(AtomicUsize::new(0));
    let invoker = invoker(temp.path(), counting_executor(calls, Value::Null));

    let output = invoker
        .call(call(1, "double", json!({ "n": 21 })))
        .expect("double");
    assert_eq!(output.value, json!({ "value": 42 }));
    assert!(!output.replayed);
    assert_eq!(output.number_field("value"), Some(42.0));

    let effect_dir = temp.path().join("tasks/0001-double");
    assert!(effect_dir.join("input.json").is_file());
    let result = read_result(temp.path(), "0001-double");
    assert_eq!(result.status, EffectStatus::Succeeded);
    assert_eq!(result.result, Some(json!({ "value": 42 })));
    assert_eq!(invoker.dispatched_count(), 1);
}

#[test]
fn schema_violation_is_raised_and_persisted() {
    let temp = tempdir().expect("tempdir");
    let calls = Arc::new(AtomicUsize::new(0));
    let invoker = invoker(
        temp.path(),
        counting_executor(Arc::clone(&calls), json!({ "passed": "yes" })),
    );

    let err = invoker
        .call(call(1, "scan", json!({ "target": "api" })))
        .expect_err("schema violation");
    assert_eq!(err.kind(), EffectErrorKind::SchemaViolation);
    let EffectError::SchemaViolation { violations, .. } = &err else {
        panic!("expected schema violation, got {err:?}");
    };
    assert!(!violations.is_empty());

    let result = read_result(temp.path(), "0001-scan");
    assert_eq!(result.status, EffectStatus::Failed);
    let failure = result.error.expect("failure record");
    assert_eq!(failure.kind, EffectErrorKind::SchemaViolation);
    assert!(!failure.violations.is_empty());
}

#[test]
fn native_failure_and_agent_failure_map_to_executor_failure() {
    let temp = tempdir().expect("tempdir");
    let executor: Arc<dyn AgentExecutor> =
        Arc::new(|_request: &AgentRequest| -> Result<Value, ExecutorError> {
            Err(ExecutorError::Failed {
                reason: "exit status 2".to_string(),
            })
        });
    let invoker = invoker(temp.path(), executor);

    let err = invoker
        .call(call(1, "boom", Value::Null))
        .expect_err("native failure");
    assert!(matches!(&err, EffectError::ExecutorFailure { reason, .. } if reason == "disk full"));
    assert!(err.is_retryable());

    let err = invoker
        .call(call(2, "scan", Value::Null))
        .expect_err("agent failure");
    assert_eq!(err.kind(), EffectErrorKind::ExecutorFailure);
    assert_eq!(err.effect_id(), Some("0002-scan"));
}

#[test]
fn timed_out_dispatch_raises_the_cancel_flag() {
    let temp = tempdir().expect("tempdir");
    let (seen_tx, seen_rx) = std::sync::mpsc::channel();
    let seen_tx = std::sync::Mutex::new(seen_tx);
    let executor: Arc<dyn AgentExecutor> =
        Arc::new(move |request: &AgentRequest| -> Result<Value, ExecutorError> {
            while !request.cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            let _ = seen_tx.lock().expect("sender").send(request.effect_id.clone());
            Err(ExecutorError::Failed {
                reason: "cancelled".to_string(),
            })
        });
    let invoker = invoker(temp.path(), executor);

    let err = invoker
        .call(call(1, "scan", Value::Null))
        .expect_err("timeout");
    assert!(matches!(err, EffectError::Timeout { .. }));
    let observed = seen_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("executor saw the cancel flag");
    assert_eq!(observed, "0001-scan");
}

#[test]
fn hung_executor_times_out_at_the_default_timeout() {
    let temp = tempdir().expect("tempdir");
    let executor: Arc<dyn AgentExecutor> =
        Arc::new(|_request: &AgentRequest| -> Result<Value, ExecutorError> {
            std::thread::sleep(Duration::from_millis(1_000));
            Ok(json!({ "passed": true }))
        });
    let invoker = invoker(temp.path(), executor);

    let err = invoker
        .call(call(1, "scan", Value::Null))
        .expect_err("timeout");
    assert!(matches!(err, EffectError::Timeout { timeout_ms: 100, .. }));

    let failure = read_result(temp.path(), "0001-scan")
        .error
        .expect("failure record");
    assert_eq!(failure.kind, EffectErrorKind::Timeout);
    assert_eq!(failure.timeout_ms, Some(100));
}

#[test]
fn reusing_an_effect_id_in_one_execution_is_rejected() {
    let temp = tempdir().expect("tempdir");
    let calls = Arc::new(AtomicUsize::new(0));
    let invoker = invoker(temp.path(), counting_executor(calls, Value::Null));

    invoker
        .call(call(1, "double", json!({ "n": 1 })))
        .expect("first");
    let err = invoker
        .call(call(1, "double", json!({ "n": 1 })))
        .expect_err("duplicate");
    assert!(matches!(err, EffectError::DuplicateEffect { effect_id } if effect_id == "0001-double"));
}

#[test]
fn recorded_results_are_replayed_without_dispatching() {
    let temp = tempdir().expect("tempdir");
    let calls = Arc::new(AtomicUsize::new(0));

    let first = invoker(
        temp.path(),
        counting_executor(Arc::clone(&calls), json!({ "passed": true })),
    );
    let original = first
        .call(call(1, "scan", json!({ "target": "api" })))
        .expect("scan");
    first
        .call(call(2, "boom", Value::Null))
        .expect_err("boom");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let second = invoker(
        temp.path(),
        counting_executor(Arc::clone(&calls), json!({ "passed": false })),
    );
    let replayed = second
        .call(call(1, "scan", json!({ "target": "api" })))
        .expect("replayed scan");
    assert!(replayed.replayed);
    assert_eq!(replayed.value, original.value);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let err = second
        .call(call(2, "boom", Value::Null))
        .expect_err("replayed failure");
    assert!(matches!(&err, EffectError::ExecutorFailure { reason, .. } if reason == "disk full"));
    assert_eq!(second.replayed_count(), 2);
    assert_eq!(second.dispatched_count(), 0);
}

#[test]
fn changed_arguments_for_a_recorded_effect_diverge() {
    let temp = tempdir().expect("tempdir");
    let calls = Arc::new(AtomicUsize::new(0));
    invoker(temp.path(), counting_executor(Arc::clone(&calls), Value::Null))
        .call(call(1, "double", json!({ "n": 2 })))
        .expect("double");

    let err = invoker(temp.path(), counting_executor(calls, Value::Null))
        .call(call(1, "double", json!({ "n": 3 })))
        .expect_err("divergence");
    assert_eq!(err.kind(), EffectErrorKind::ReplayDivergence);
}

#[test]
fn distinct_effects_get_distinct_audit_paths_and_increasing_sequences() {
    let temp = tempdir().expect("tempdir");
    let calls = Arc::new(AtomicUsize::new(0));
    let invoker = invoker(temp.path(), counting_executor(calls, Value::Null));

    let first = invoker.resolve(&call(1, "double", json!({ "n": 1 }))).expect("resolve 1");
    let second = invoker.resolve(&call(2, "double", json!({ "n": 1 }))).expect("resolve 2");
    assert_ne!(first.io.input, second.io.input);
    assert_ne!(first.io.result, second.io.result);

    invoker
        .call(call(1, "double", json!({ "n": 1 })))
        .expect("first");
    invoker
        .call(call(2, "double", json!({ "n": 1 })))
        .expect("second");
    let first_result = read_result(temp.path(), "0001-double");
    let raw = fs::read_to_string(temp.path().join("tasks/0002-double/input.json"))
        .expect("read input");
    let second_input: Value = serde_json::from_str(&raw).expect("parse input");
    let second_seq = second_input["sequence"].as_u64().expect("sequence");
    assert!(second_seq > first_result.sequence);
}

#[test]
fn declared_artifacts_are_extracted_with_their_producer() {
    let temp = tempdir().expect("tempdir");
    let calls = Arc::new(AtomicUsize::new(0));
    let invoker = invoker(temp.path(), counting_executor(calls, Value::Null));

    let output = invoker.call(call(1, "lint", Value::Null)).expect("lint");
    assert_eq!(output.artifacts.len(), 1);
    assert_eq!(output.artifacts[0].path, "lint/report.md");
    assert_eq!(output.artifacts[0].produced_by.as_deref(), Some("0001-lint"));
}

#[test]
fn unknown_tasks_fail_before_anything_is_recorded() {
    let temp = tempdir().expect("tempdir");
    let calls = Arc::new(AtomicUsize::new(0));
    let invoker = invoker(temp.path(), counting_executor(calls, Value::Null));

    let err = invoker
        .call(call(1, "missing", Value::Null))
        .expect_err("unknown");
    assert!(matches!(err, EffectError::UnknownTask { task } if task == "missing"));
    assert!(!temp.path().join("tasks/0001-missing").exists());
}

#[test]
fn descriptor_timeout_overrides_the_default() {
    let temp = tempdir().expect("tempdir");
    let mut registry = TaskRegistry::new();
    registry
        .register("quick", |_args: &Value, ctx: &InvocationContext| {
            Ok(TaskDescriptor::external_agent(
                TaskName::parse("quick").expect("task"),
                ctx,
                agent_template(Value::Null).contract,
            )
            .with_timeout(Duration::from_millis(30)))
        })
        .expect("register quick");
    let executor: Arc<dyn AgentExecutor> =
        Arc::new(|_request: &AgentRequest| -> Result<Value, ExecutorError> {
            std::thread::sleep(Duration::from_millis(60));
            Ok(json!({ "done": true }))
        });
    let invoker = EffectInvoker::new(
        RunId::parse("run-test").expect("run id"),
        temp.path(),
        registry.into_shared(),
        executor,
        Duration::from_secs(5),
    )
    .expect("invoker");

    let err = invoker
        .call(call(1, "quick", Value::Null))
        .expect_err("descriptor timeout");
    assert!(matches!(err, EffectError::Timeout { timeout_ms: 30, .. }));
}

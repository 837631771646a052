use crate::effect::error::EffectError;
use crate::effect::record::{
    args_digest, EffectFailureRecord, EffectInputRecord, EffectJournal, EffectResultRecord,
    EffectStatus,
};
use crate::effect::schema::validate_against_schema;
use crate::orchestration::artifact::{extract_artifacts, Artifact};
use crate::provider::{AgentExecutor, AgentRequest, CancelFlag, ExecutorError};
use crate::registry::{
    AgentContract, Execution, InvocationContext, NativeFn, TaskDescriptor, TaskRegistry,
};
use crate::shared::{now_rfc3339, EffectId, RunId, RunLog, TaskName};
use serde_json::Value;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Request to run one task under a pre-assigned effect id.
#[derive(Debug, Clone)]
pub struct EffectCall {
    pub effect_id: EffectId,
    pub task: TaskName,
    pub args: Value,
}

impl EffectCall {
    pub fn new(effect_id: EffectId, task: TaskName, args: Value) -> Self {
        Self {
            effect_id,
            task,
            args,
        }
    }
}

/// Validated output of a succeeded effect.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    pub effect_id: EffectId,
    pub task: TaskName,
    pub value: Value,
    pub artifacts: Vec<Artifact>,
    /// True when the value came from `result.json` instead of a fresh dispatch.
    pub replayed: bool,
}

impl TaskOutput {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.value.get(name)
    }

    pub fn bool_field(&self, name: &str) -> Option<bool> {
        self.field(name).and_then(Value::as_bool)
    }

    pub fn number_field(&self, name: &str) -> Option<f64> {
        self.field(name).and_then(Value::as_f64)
    }
}

/// In-memory lifecycle of one effect; refuses illegal transitions.
#[derive(Debug)]
struct EffectLifecycle {
    effect_id: EffectId,
    status: EffectStatus,
}

impl EffectLifecycle {
    fn new(effect_id: EffectId) -> Self {
        Self {
            effect_id,
            status: EffectStatus::Pending,
        }
    }

    fn advance(&mut self, next: EffectStatus) -> Result<(), EffectError> {
        if !self.status.can_transition_to(next) {
            return Err(EffectError::ExecutorFailure {
                effect_id: self.effect_id.to_string(),
                reason: format!("illegal effect transition {} -> {}", self.status, next),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Sole path through which process code reaches the outside world.
///
/// Each call resolves a descriptor, records `input.json`, dispatches to the
/// agent executor or a native function, validates the value, and records
/// `result.json`. A `result.json` already on disk is authoritative: the
/// recorded outcome is returned without dispatching again.
pub struct EffectInvoker {
    run_id: RunId,
    run_dir: PathBuf,
    registry: Arc<TaskRegistry>,
    executor: Arc<dyn AgentExecutor>,
    journal: EffectJournal,
    default_timeout: Duration,
    issued: Mutex<HashSet<EffectId>>,
    dispatched: AtomicU64,
    replayed: AtomicU64,
    log: RunLog,
}

impl std::fmt::Debug for EffectInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectInvoker")
            .field("run_id", &self.run_id)
            .field("run_dir", &self.run_dir)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl EffectInvoker {
    pub fn new(
        run_id: RunId,
        run_dir: &Path,
        registry: Arc<TaskRegistry>,
        executor: Arc<dyn AgentExecutor>,
        default_timeout: Duration,
    ) -> Result<Self, EffectError> {
        let journal = EffectJournal::open(run_dir)?;
        let log = RunLog::new(run_id.as_str(), run_dir);
        Ok(Self {
            run_id,
            run_dir: run_dir.to_path_buf(),
            registry,
            executor,
            journal,
            default_timeout,
            issued: Mutex::new(HashSet::new()),
            dispatched: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
            log,
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Effects actually sent to an executor or native function.
    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::SeqCst)
    }

    /// Effects answered from a recorded `result.json`.
    pub fn replayed_count(&self) -> u64 {
        self.replayed.load(Ordering::SeqCst)
    }

    pub fn resolve(&self, call: &EffectCall) -> Result<TaskDescriptor, EffectError> {
        let ctx = InvocationContext::new(self.run_id.clone(), &self.run_dir, call.effect_id.clone());
        Ok(self.registry.resolve(call.task.as_str(), &call.args, &ctx)?)
    }

    /// Resolves and invokes in one step.
    pub fn call(&self, call: EffectCall) -> Result<TaskOutput, EffectError> {
        let descriptor = self.resolve(&call)?;
        self.invoke(&descriptor, &call.effect_id, &call.args)
    }

    pub fn invoke(
        &self,
        descriptor: &TaskDescriptor,
        effect_id: &EffectId,
        args: &Value,
    ) -> Result<TaskOutput, EffectError> {
        self.claim(effect_id)?;
        let digest = args_digest(args);

        if let Some(recorded) = self.journal.load_result(&descriptor.io)? {
            return self.replay(descriptor, effect_id, &digest, recorded);
        }

        let mut lifecycle = EffectLifecycle::new(effect_id.clone());
        let sequence = match self.journal.load_input(&descriptor.io)? {
            Some(existing) => {
                if existing.args_digest != digest {
                    return Err(EffectError::ReplayDivergence {
                        effect_id: effect_id.to_string(),
                        recorded: existing.args_digest,
                        current: digest,
                    });
                }
                self.log.warn(
                    "effect.redispatch",
                    &format!("effect {effect_id} was in flight without a result; dispatching again"),
                );
                existing.sequence
            }
            None => {
                let record = EffectInputRecord {
                    effect_id: effect_id.to_string(),
                    run_id: self.run_id.to_string(),
                    task: descriptor.task.to_string(),
                    kind: descriptor.kind(),
                    sequence: self.journal.next_sequence(),
                    recorded_at: now_rfc3339(),
                    args_digest: digest.clone(),
                    args: args.clone(),
                    contract: descriptor.contract().cloned(),
                    output_schema: descriptor.output_schema.clone(),
                    timeout_ms: descriptor.timeout.map(duration_ms),
                };
                self.journal.write_input(&descriptor.io, &record)?;
                record.sequence
            }
        };

        lifecycle.advance(EffectStatus::Running)?;
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        self.log.info(
            "effect.dispatched",
            &format!(
                "effect {effect_id} task={} kind={} seq={sequence}",
                descriptor.task,
                descriptor.kind()
            ),
        );

        let started = Instant::now();
        let outcome = self
            .dispatch(descriptor, effect_id, args)
            .and_then(|value| self.validate(descriptor, effect_id, value));
        let duration = duration_ms(started.elapsed());

        match outcome {
            Ok((value, artifacts)) => {
                lifecycle.advance(EffectStatus::Succeeded)?;
                self.journal.write_result(
                    &descriptor.io,
                    &EffectResultRecord {
                        effect_id: effect_id.to_string(),
                        task: descriptor.task.to_string(),
                        status: lifecycle.status,
                        sequence: self.journal.next_sequence(),
                        completed_at: now_rfc3339(),
                        duration_ms: duration,
                        args_digest: digest,
                        result: Some(value.clone()),
                        error: None,
                    },
                )?;
                self.log.info(
                    "effect.succeeded",
                    &format!("effect {effect_id} succeeded in {duration}ms"),
                );
                Ok(TaskOutput {
                    effect_id: effect_id.clone(),
                    task: descriptor.task.clone(),
                    value,
                    artifacts,
                    replayed: false,
                })
            }
            Err(error) => {
                lifecycle.advance(EffectStatus::Failed)?;
                self.journal.write_result(
                    &descriptor.io,
                    &EffectResultRecord {
                        effect_id: effect_id.to_string(),
                        task: descriptor.task.to_string(),
                        status: lifecycle.status,
                        sequence: self.journal.next_sequence(),
                        completed_at: now_rfc3339(),
                        duration_ms: duration,
                        args_digest: digest,
                        result: None,
                        error: Some(EffectFailureRecord::from_error(&error)),
                    },
                )?;
                self.log
                    .error("effect.failed", &format!("effect {effect_id}: {error}"));
                Err(error)
            }
        }
    }

    fn claim(&self, effect_id: &EffectId) -> Result<(), EffectError> {
        let mut issued = match self.issued.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !issued.insert(effect_id.clone()) {
            return Err(EffectError::DuplicateEffect {
                effect_id: effect_id.to_string(),
            });
        }
        Ok(())
    }

    fn replay(
        &self,
        descriptor: &TaskDescriptor,
        effect_id: &EffectId,
        digest: &str,
        recorded: EffectResultRecord,
    ) -> Result<TaskOutput, EffectError> {
        if recorded.args_digest != digest {
            return Err(EffectError::ReplayDivergence {
                effect_id: effect_id.to_string(),
                recorded: recorded.args_digest,
                current: digest.to_string(),
            });
        }
        self.replayed.fetch_add(1, Ordering::SeqCst);
        self.log.info(
            "effect.replayed",
            &format!("effect {effect_id} answered from recorded {} result", recorded.status),
        );

        match (recorded.status, recorded.result, recorded.error) {
            (EffectStatus::Succeeded, Some(value), _) => {
                let artifacts = extract_artifacts(&value, effect_id.as_str()).map_err(|reason| {
                    EffectError::SchemaViolation {
                        effect_id: effect_id.to_string(),
                        violations: vec![reason],
                    }
                })?;
                Ok(TaskOutput {
                    effect_id: effect_id.clone(),
                    task: descriptor.task.clone(),
                    value,
                    artifacts,
                    replayed: true,
                })
            }
            (_, _, Some(failure)) => Err(failure.to_error(effect_id.as_str())),
            (status, _, None) => Err(EffectError::ExecutorFailure {
                effect_id: effect_id.to_string(),
                reason: format!("recorded result has status {status} but no outcome"),
            }),
        }
    }

    fn dispatch(
        &self,
        descriptor: &TaskDescriptor,
        effect_id: &EffectId,
        args: &Value,
    ) -> Result<Value, EffectError> {
        match &descriptor.execution {
            Execution::Agent(contract) => self.dispatch_agent(descriptor, contract, effect_id),
            Execution::Native(function) => run_native(function, effect_id, args),
        }
    }

    fn dispatch_agent(
        &self,
        descriptor: &TaskDescriptor,
        contract: &AgentContract,
        effect_id: &EffectId,
    ) -> Result<Value, EffectError> {
        let timeout = descriptor.timeout.unwrap_or(self.default_timeout);
        let request = AgentRequest {
            run_id: self.run_id.to_string(),
            effect_id: effect_id.to_string(),
            task: descriptor.task.to_string(),
            contract: contract.clone(),
            timeout,
            task_dir: descriptor
                .io
                .effect_dir()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.run_dir.clone()),
            cancel: CancelFlag::default(),
        };
        let cancel = request.cancel.clone();

        let executor = Arc::clone(&self.executor);
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("effect-{effect_id}"))
            .spawn(move || {
                let _ = tx.send(executor.run(&request));
            })
            .map_err(|err| EffectError::ExecutorFailure {
                effect_id: effect_id.to_string(),
                reason: format!("failed to spawn executor thread: {err}"),
            })?;

        match rx.recv_timeout(timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(ExecutorError::Timeout { timeout_ms })) => Err(EffectError::Timeout {
                effect_id: effect_id.to_string(),
                timeout_ms,
            }),
            Ok(Err(ExecutorError::ParseFailure { reason })) => Err(EffectError::SchemaViolation {
                effect_id: effect_id.to_string(),
                violations: vec![format!("malformed executor output: {reason}")],
            }),
            Ok(Err(err)) => Err(EffectError::ExecutorFailure {
                effect_id: effect_id.to_string(),
                reason: err.to_string(),
            }),
            Err(RecvTimeoutError::Timeout) => {
                cancel.cancel();
                Err(EffectError::Timeout {
                    effect_id: effect_id.to_string(),
                    timeout_ms: duration_ms(timeout),
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(EffectError::ExecutorFailure {
                effect_id: effect_id.to_string(),
                reason: "executor thread exited without a result".to_string(),
            }),
        }
    }

    fn validate(
        &self,
        descriptor: &TaskDescriptor,
        effect_id: &EffectId,
        value: Value,
    ) -> Result<(Value, Vec<Artifact>), EffectError> {
        if let Some(schema) = &descriptor.output_schema {
            validate_against_schema(schema, &value).map_err(|violations| {
                EffectError::SchemaViolation {
                    effect_id: effect_id.to_string(),
                    violations,
                }
            })?;
        }
        let artifacts = extract_artifacts(&value, effect_id.as_str()).map_err(|reason| {
            EffectError::SchemaViolation {
                effect_id: effect_id.to_string(),
                violations: vec![reason],
            }
        })?;
        Ok((value, artifacts))
    }
}

fn run_native(function: &NativeFn, effect_id: &EffectId, args: &Value) -> Result<Value, EffectError> {
    match catch_unwind(AssertUnwindSafe(|| function(args))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(reason)) => Err(EffectError::ExecutorFailure {
            effect_id: effect_id.to_string(),
            reason,
        }),
        Err(_) => Err(EffectError::ExecutorFailure {
            effect_id: effect_id.to_string(),
            reason: "native task panicked".to_string(),
        }),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

use crate::effect::{EffectCall, EffectError, EffectInvoker, TaskOutput};
use crate::orchestration::artifact::Artifact;
use crate::orchestration::breakpoint::{BreakpointContext, BreakpointController, Decision, Resolution};
use crate::orchestration::error::OrchestratorError;
use crate::orchestration::parallel::run_all;
use crate::orchestration::run_context::RunContext;
use crate::orchestration::run_store::{ProcessRunRecord, ProcessRunStore};
use crate::orchestration::score::{FinalScore, ScoreError};
use crate::registry::parse_task_name;
use crate::shared::{now_secs, EffectId, LogLevel, RunId, TaskName};
use serde_json::{Map, Value};

/// Why a process stopped before producing its outputs.
#[derive(Debug, thiserror::Error)]
pub enum Halt {
    #[error("step `{step}` failed: {reason}")]
    Failed { step: String, reason: String },
    #[error("aborted at breakpoint `{breakpoint_id}`: {reason}")]
    Aborted {
        breakpoint_id: String,
        reason: String,
    },
    #[error("suspended at breakpoint `{breakpoint_id}`")]
    Suspended { breakpoint_id: String },
    #[error(transparent)]
    Fatal(#[from] OrchestratorError),
}

impl Halt {
    pub fn failed(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            step: step.into(),
            reason: reason.into(),
        }
    }
}

/// A process body. `execute` must be deterministic given its inputs and the
/// outputs of the effects it issues; resume relies on it.
pub trait Process: Send + Sync {
    fn id(&self) -> &str;

    fn execute(
        &self,
        driver: &mut ProcessDriver,
        inputs: &Map<String, Value>,
    ) -> Result<Map<String, Value>, Halt>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed(TaskOutput),
    /// Explicitly absent: contributes no artifacts and no score.
    Skipped,
}

impl StepOutcome {
    pub fn output(&self) -> Option<&TaskOutput> {
        match self {
            Self::Completed(output) => Some(output),
            Self::Skipped => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    /// The task value, or `null` for a skipped step.
    pub fn value(&self) -> Value {
        self.output()
            .map(|output| output.value.clone())
            .unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParallelMember {
    pub task: String,
    pub args: Value,
    pub key: Option<String>,
}

impl ParallelMember {
    pub fn new(task: impl Into<String>, args: Value) -> Self {
        Self {
            task: task.into(),
            args,
            key: None,
        }
    }

    pub fn keyed(task: impl Into<String>, key: impl Into<String>, args: Value) -> Self {
        Self {
            task: task.into(),
            args,
            key: Some(key.into()),
        }
    }
}

/// State handed back to the runtime once a process returns.
#[derive(Debug)]
pub struct DriverParts {
    pub context: RunContext,
    pub record: ProcessRunRecord,
    pub effects_dispatched: u64,
    pub effects_replayed: u64,
}

/// Control-flow primitives a [`Process`] is written against.
pub struct ProcessDriver {
    ctx: RunContext,
    invoker: EffectInvoker,
    breakpoints: BreakpointController,
    store: ProcessRunStore,
    record: ProcessRunRecord,
    max_parallel: usize,
    retry_pass: u32,
}

impl std::fmt::Debug for ProcessDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessDriver")
            .field("run_id", self.ctx.run_id())
            .field("max_parallel", &self.max_parallel)
            .finish_non_exhaustive()
    }
}

impl ProcessDriver {
    pub fn new(
        ctx: RunContext,
        invoker: EffectInvoker,
        breakpoints: BreakpointController,
        store: ProcessRunStore,
        record: ProcessRunRecord,
        max_parallel: usize,
    ) -> Self {
        Self {
            ctx,
            invoker,
            breakpoints,
            store,
            record,
            max_parallel: max_parallel.max(1),
            retry_pass: 0,
        }
    }

    pub fn run_id(&self) -> &RunId {
        self.ctx.run_id()
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut RunContext {
        &mut self.ctx
    }

    pub fn invoker(&self) -> &EffectInvoker {
        &self.invoker
    }

    pub fn record(&self) -> &ProcessRunRecord {
        &self.record
    }

    /// Starts another pass over already executed steps. Keyed effects issued
    /// afterwards get `-pass<N>` appended to their key so they do not collide
    /// with the ones from earlier passes.
    pub fn begin_retry_pass(&mut self) -> u32 {
        self.retry_pass = self.retry_pass.saturating_add(1);
        self.retry_pass
    }

    pub fn retry_pass(&self) -> u32 {
        self.retry_pass
    }

    pub fn log(&self, level: LogLevel, event: &str, message: &str) {
        self.ctx.log(level, event, message);
    }

    /// Runs `task` once under the next sequential effect id of that task.
    pub fn step(&mut self, step_id: &str, task: &str, args: Value) -> Result<TaskOutput, EffectError> {
        let task_name = parse_task_name(task)?;
        let effect_id = self.ctx.next_effect_id(&task_name);
        self.run_effect(step_id, EffectCall::new(effect_id, task_name, args))
    }

    /// Like [`ProcessDriver::step`] but with a caller-chosen effect key.
    pub fn step_keyed(
        &mut self,
        step_id: &str,
        task: &str,
        key: &str,
        args: Value,
    ) -> Result<TaskOutput, EffectError> {
        let task_name = parse_task_name(task)?;
        let effect_id = self.keyed_effect_id(&task_name, key)?;
        self.run_effect(step_id, EffectCall::new(effect_id, task_name, args))
    }

    /// A step whose failure ends the run.
    pub fn require(&mut self, step_id: &str, task: &str, args: Value) -> Result<TaskOutput, Halt> {
        self.step(step_id, task, args)
            .map_err(|err| Halt::failed(step_id, err.to_string()))
    }

    /// Retries executor failures and timeouts up to `max_attempts` in total.
    /// Each attempt is a distinct effect.
    pub fn step_with_retry(
        &mut self,
        step_id: &str,
        task: &str,
        args: Value,
        max_attempts: u32,
    ) -> Result<TaskOutput, EffectError> {
        let attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.step(step_id, task, args.clone()) {
                Ok(output) => return Ok(output),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    self.log(
                        LogLevel::Warn,
                        "step.retry",
                        &format!("step {step_id} attempt {attempt}/{attempts} failed: {err}"),
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn optional_step(
        &mut self,
        step_id: &str,
        condition: bool,
        task: &str,
        args: Value,
    ) -> Result<StepOutcome, EffectError> {
        if !condition {
            return Ok(self.skip(step_id));
        }
        self.step(step_id, task, args).map(StepOutcome::Completed)
    }

    /// Records `step_id` as explicitly absent.
    pub fn skip(&mut self, step_id: &str) -> StepOutcome {
        self.ctx.skip_score(step_id);
        self.log(
            LogLevel::Info,
            "step.skipped",
            &format!("step {step_id} skipped"),
        );
        StepOutcome::Skipped
    }

    /// Fans members out and joins. Effect ids are reserved in member order
    /// before anything is dispatched; artifacts are appended in member order
    /// after the join.
    pub fn parallel(
        &mut self,
        group_id: &str,
        members: Vec<ParallelMember>,
    ) -> Vec<Result<TaskOutput, EffectError>> {
        self.enter_step(group_id, &format!("parallel group {group_id} running"));

        let mut calls = Vec::with_capacity(members.len());
        for member in members {
            let call = match parse_task_name(&member.task) {
                Ok(task) => match &member.key {
                    Some(key) => self
                        .keyed_effect_id(&task, key)
                        .map(|effect_id| EffectCall::new(effect_id, task, member.args)),
                    None => {
                        let effect_id = self.ctx.next_effect_id(&task);
                        Ok(EffectCall::new(effect_id, task, member.args))
                    }
                },
                Err(err) => Err(EffectError::from(err)),
            };
            calls.push(call);
        }

        let invoker = &self.invoker;
        let thunks = calls
            .into_iter()
            .map(|call| move || call.and_then(|call| invoker.call(call)))
            .collect::<Vec<_>>();
        let mut results = run_all(thunks, self.max_parallel);

        let mut failed = 0usize;
        for result in &mut results {
            match result {
                Ok(output) => {
                    tag_step(&mut output.artifacts, group_id);
                    self.ctx.append(output.artifacts.clone());
                }
                Err(_) => failed += 1,
            }
        }
        self.log(
            LogLevel::Info,
            "parallel.joined",
            &format!(
                "group {group_id} joined {} members ({failed} failed)",
                results.len()
            ),
        );
        results
    }

    /// Fails the run when `output.passed` is `false` and `fail_on_critical`
    /// is set.
    pub fn gate(&mut self, step_id: &str, output: &TaskOutput, fail_on_critical: bool) -> Result<(), Halt> {
        self.gate_field(step_id, output, "passed", fail_on_critical)
    }

    pub fn gate_field(
        &mut self,
        step_id: &str,
        output: &TaskOutput,
        field: &str,
        fail_on_critical: bool,
    ) -> Result<(), Halt> {
        match output.bool_field(field) {
            Some(false) if fail_on_critical => {
                self.log(
                    LogLevel::Error,
                    "gate.failed",
                    &format!("step {step_id} reported {field}=false; stopping run"),
                );
                Err(Halt::failed(
                    step_id,
                    format!("gate `{field}` reported false with fail-on-critical set"),
                ))
            }
            Some(false) => {
                self.log(
                    LogLevel::Warn,
                    "gate.ignored",
                    &format!("step {step_id} reported {field}=false; continuing"),
                );
                Ok(())
            }
            _ => {
                self.log(
                    LogLevel::Info,
                    "gate.passed",
                    &format!("step {step_id} gate `{field}` passed"),
                );
                Ok(())
            }
        }
    }

    /// Raises the next breakpoint. `Proceed` and `RetryPreviousStep` come
    /// back to the caller; `abort` and a parked run halt.
    pub fn breakpoint(&mut self, title: &str, question: &str, summary: Value) -> Result<Decision, Halt> {
        let breakpoint_id = self.ctx.next_breakpoint_id();
        let snapshot = self.ctx.snapshot();
        let context = BreakpointContext {
            run_id: snapshot.run_id,
            files: snapshot.files,
            summary: self.ctx.summary_with(&summary),
            artifacts: self.ctx.artifacts().to_vec(),
        };
        self.record.pending_breakpoint = Some(breakpoint_id.to_string());
        self.checkpoint(
            &format!("breakpoint {breakpoint_id} raised"),
            "await reviewer decision",
        );

        let resolution = self
            .breakpoints
            .raise(&breakpoint_id, title, question, context)
            .map_err(|err| Halt::Fatal(err.into()))?;
        match resolution {
            Resolution::Decided {
                decision: Decision::Abort,
                note,
                fail_closed_reason,
            } => Err(Halt::Aborted {
                breakpoint_id: breakpoint_id.to_string(),
                reason: fail_closed_reason
                    .or(note)
                    .unwrap_or_else(|| "reviewer aborted the run".to_string()),
            }),
            Resolution::Decided { decision, .. } => {
                self.record.pending_breakpoint = None;
                Ok(decision)
            }
            Resolution::Suspended { breakpoint_id } => Err(Halt::Suspended { breakpoint_id }),
        }
    }

    pub fn expect_score(&mut self, step_id: &str) {
        self.ctx.expect_score(step_id);
    }

    pub fn score(&mut self, step_id: &str, delta: f64) -> Result<(), Halt> {
        self.ctx
            .add_score(step_id, delta)
            .map_err(|err| score_halt(step_id, err))
    }

    pub fn score_weighted(&mut self, step_id: &str, points: f64, weight: f64) -> Result<(), Halt> {
        self.ctx
            .add_weighted_score(step_id, points, weight)
            .map_err(|err| score_halt(step_id, err))
    }

    pub fn clear_score(&mut self, step_id: &str) {
        self.ctx.clear_score(step_id);
    }

    pub fn skip_score(&mut self, step_id: &str) {
        self.ctx.skip_score(step_id);
    }

    pub fn final_score(&self) -> Result<FinalScore, Halt> {
        self.ctx
            .final_score()
            .map_err(|err| score_halt("final_score", err))
    }

    /// Run metrics merged with caller fields.
    pub fn summary(&self, extra: &Value) -> Value {
        self.ctx.summary_with(extra)
    }

    pub fn into_parts(self) -> DriverParts {
        DriverParts {
            effects_dispatched: self.invoker.dispatched_count(),
            effects_replayed: self.invoker.replayed_count(),
            context: self.ctx,
            record: self.record,
        }
    }

    fn keyed_effect_id(&self, task: &TaskName, key: &str) -> Result<EffectId, EffectError> {
        let scoped = if self.retry_pass == 0 {
            key.to_string()
        } else {
            format!("{key}-pass{}", self.retry_pass)
        };
        EffectId::from_key(task, &scoped).map_err(|reason| EffectError::Resolution {
            task: task.to_string(),
            reason,
        })
    }

    fn run_effect(&mut self, step_id: &str, call: EffectCall) -> Result<TaskOutput, EffectError> {
        self.enter_step(
            step_id,
            &format!("step {step_id} running task {} as {}", call.task, call.effect_id),
        );
        match self.invoker.call(call) {
            Ok(mut output) => {
                tag_step(&mut output.artifacts, step_id);
                self.ctx.append(output.artifacts.clone());
                Ok(output)
            }
            Err(err) => {
                self.log(
                    LogLevel::Warn,
                    "step.effect_failed",
                    &format!("step {step_id}: {err}"),
                );
                Err(err)
            }
        }
    }

    fn enter_step(&mut self, step_id: &str, summary: &str) {
        self.record.current_step = Some(step_id.to_string());
        self.log(LogLevel::Info, "step.started", summary);
        self.checkpoint(summary, "await step output");
    }

    /// Progress is advisory; a failed write is logged and the run goes on.
    fn checkpoint(&mut self, summary: &str, next_expected_action: &str) {
        self.record.effects_completed =
            self.invoker.dispatched_count() + self.invoker.replayed_count();
        if let Err(err) =
            self.store
                .checkpoint(&mut self.record, now_secs(), summary, next_expected_action)
        {
            self.ctx.log(
                LogLevel::Warn,
                "run.checkpoint_failed",
                &format!("progress checkpoint failed: {err}"),
            );
        }
    }
}

fn tag_step(artifacts: &mut [Artifact], step_id: &str) {
    for artifact in artifacts {
        if artifact.step.is_none() {
            artifact.step = Some(step_id.to_string());
        }
    }
}

fn score_halt(step_id: &str, err: ScoreError) -> Halt {
    Halt::failed(step_id, err.to_string())
}

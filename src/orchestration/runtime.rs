use crate::config::{BreakpointMode, RuntimeSettings};
use crate::effect::EffectInvoker;
use crate::orchestration::breakpoint::{
    BreakpointController, BreakpointRecord, BreakpointStore, Decision, DecisionChannel,
    DetachedDecisionChannel, FileDecisionChannel, ReviewerDecision, StaticDecisionChannel,
};
use crate::orchestration::driver::{DriverParts, Halt, Process, ProcessDriver};
use crate::orchestration::error::OrchestratorError;
use crate::orchestration::lock::RunLock;
use crate::orchestration::result::{ProcessResult, ResultMetadata};
use crate::orchestration::run_context::RunContext;
use crate::orchestration::run_store::{ProcessRunRecord, ProcessRunStore, ProgressSnapshot, RunState};
use crate::provider::AgentExecutor;
use crate::registry::TaskRegistry;
use crate::shared::{generate_run_id, now_secs, LogLevel, RunId, RunLog};
use chrono::SecondsFormat;
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub state: RunState,
    pub result: ProcessResult,
}

#[derive(Debug, Clone)]
pub struct RunStatus {
    pub record: ProcessRunRecord,
    pub progress: Option<ProgressSnapshot>,
    pub result: Option<Value>,
    pub breakpoints: Vec<BreakpointRecord>,
}

/// Starts, resumes and inspects runs under one state root.
///
/// Registry and executor are shared read-only by every run this runtime
/// drives; each run gets its own context, invoker and lock.
pub struct ProcessRuntime {
    settings: RuntimeSettings,
    store: ProcessRunStore,
    registry: Arc<TaskRegistry>,
    executor: Arc<dyn AgentExecutor>,
    decisions: Arc<dyn DecisionChannel>,
}

impl std::fmt::Debug for ProcessRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRuntime")
            .field("settings", &self.settings)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl ProcessRuntime {
    pub fn new(
        settings: RuntimeSettings,
        registry: Arc<TaskRegistry>,
        executor: Arc<dyn AgentExecutor>,
    ) -> Self {
        let decisions = decision_channel_for(&settings);
        let store = ProcessRunStore::new(settings.state_root.clone());
        Self {
            settings,
            store,
            registry,
            executor,
            decisions,
        }
    }

    pub fn with_decision_channel(mut self, channel: Arc<dyn DecisionChannel>) -> Self {
        self.decisions = channel;
        self
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn store(&self) -> &ProcessRunStore {
        &self.store
    }

    pub fn start(
        &self,
        process: &dyn Process,
        inputs: Map<String, Value>,
    ) -> Result<RunOutcome, OrchestratorError> {
        let run_id = generate_run_id(now_secs()).map_err(|reason| {
            OrchestratorError::InvalidRunId {
                run_id: "<generated>".to_string(),
                reason,
            }
        })?;
        self.start_with_run_id(process, run_id, inputs)
    }

    pub fn start_with_run_id(
        &self,
        process: &dyn Process,
        run_id: RunId,
        inputs: Map<String, Value>,
    ) -> Result<RunOutcome, OrchestratorError> {
        let record = self
            .store
            .create_run(run_id.as_str(), process.id(), inputs, now_secs())?;
        RunLog::new(run_id.as_str(), &self.store.run_dir(run_id.as_str())).info(
            "run.created",
            &format!("run {run_id} created for process {}", process.id()),
        );
        self.execute(process, run_id, record)
    }

    /// Re-executes `process` for an unfinished run. Recorded effects and
    /// resolved breakpoints replay from disk, so execution picks up at the
    /// first point that has no durable outcome yet.
    pub fn resume(
        &self,
        process: &dyn Process,
        run_id: &str,
    ) -> Result<RunOutcome, OrchestratorError> {
        let run_id = parse_run_id(run_id)?;
        let record = self.store.load_run(run_id.as_str())?;
        if record.process_id != process.id() {
            return Err(OrchestratorError::ProcessMismatch {
                run_id: run_id.to_string(),
                recorded: record.process_id,
                requested: process.id().to_string(),
            });
        }
        if record.state.is_terminal() {
            return Err(OrchestratorError::RunTerminal {
                run_id: run_id.to_string(),
                state: record.state,
            });
        }
        self.execute(process, run_id, record)
    }

    pub fn status(&self, run_id: &str) -> Result<RunStatus, OrchestratorError> {
        let run_id = parse_run_id(run_id)?;
        let record = self.store.load_run(run_id.as_str())?;
        let progress = self.store.load_progress(run_id.as_str()).ok();
        let result = self.store.load_result(run_id.as_str())?;
        let breakpoints = self.breakpoints(run_id.as_str())?;
        Ok(RunStatus {
            record,
            progress,
            result,
            breakpoints,
        })
    }

    pub fn breakpoints(&self, run_id: &str) -> Result<Vec<BreakpointRecord>, OrchestratorError> {
        let run_id = parse_run_id(run_id)?;
        let run_dir = self.store.run_dir(run_id.as_str());
        Ok(BreakpointStore::new(&run_dir).list()?)
    }

    /// Records a reviewer decision for a breakpoint of `run_id`.
    pub fn decide(
        &self,
        run_id: &str,
        breakpoint_id: &str,
        decision: &ReviewerDecision,
    ) -> Result<BreakpointRecord, OrchestratorError> {
        let run_id = parse_run_id(run_id)?;
        self.store.load_run(run_id.as_str())?;
        let run_dir = self.store.run_dir(run_id.as_str());
        let record = BreakpointStore::new(&run_dir).record_decision(breakpoint_id, decision)?;
        RunLog::new(run_id.as_str(), &run_dir).info(
            "breakpoint.decided",
            &format!("breakpoint {breakpoint_id} decided {}", decision.decision),
        );
        Ok(record)
    }

    fn execute(
        &self,
        process: &dyn Process,
        run_id: RunId,
        mut record: ProcessRunRecord,
    ) -> Result<RunOutcome, OrchestratorError> {
        let run_dir = self.store.run_dir(run_id.as_str());
        let lock = RunLock::acquire(&run_dir, run_id.as_str())?;
        let log = RunLog::new(run_id.as_str(), &run_dir);
        if let Some(pid) = lock.reclaimed_from() {
            log.append(
                LogLevel::Warn,
                "run.lock_reclaimed",
                &format!("took over run lock left by exited process {pid}"),
            );
        }

        if record.state != RunState::Running {
            self.store.transition_state(
                &mut record,
                RunState::Running,
                now_secs(),
                "running",
                "execute process",
            )?;
        }
        record.executions = record.executions.saturating_add(1);
        log.info(
            "run.started",
            &format!(
                "process {} execution {} of run {run_id}",
                process.id(),
                record.executions
            ),
        );

        let inputs = record.inputs.clone();
        let ctx = RunContext::new(
            run_id.clone(),
            &run_dir,
            self.settings.scoring.policy,
            self.settings.scoring.max,
        );
        let invoker = EffectInvoker::new(
            run_id.clone(),
            &run_dir,
            Arc::clone(&self.registry),
            Arc::clone(&self.executor),
            self.settings.effect_timeout(),
        )?;
        let breakpoints =
            BreakpointController::new(&run_dir, Arc::clone(&self.decisions), log.clone());
        let mut driver = ProcessDriver::new(
            ctx,
            invoker,
            breakpoints,
            self.store.clone(),
            record,
            self.settings.effects.max_parallel,
        );

        let outcome = process.execute(&mut driver, &inputs);
        let parts = driver.into_parts();
        let result = build_result(process.id(), outcome, &parts);
        let mut record = parts.record;
        record.effects_completed = parts.effects_dispatched + parts.effects_replayed;

        let next = result.run_state();
        let (summary, next_action) = match &result {
            ProcessResult::Success { .. } => ("process succeeded".to_string(), "none"),
            ProcessResult::Failure {
                reason,
                canceled: true,
                ..
            } => (format!("canceled: {reason}"), "none"),
            ProcessResult::Failure { reason, .. } => (format!("failed: {reason}"), "none"),
            ProcessResult::Suspended { breakpoint_id, .. } => {
                record.pending_breakpoint = Some(breakpoint_id.clone());
                (
                    format!("waiting on breakpoint {breakpoint_id}"),
                    "decide breakpoint, then resume",
                )
            }
        };
        self.store.persist_result(run_id.as_str(), &result)?;
        self.store
            .transition_state(&mut record, next, now_secs(), summary.as_str(), next_action)?;

        if result.is_success() {
            log.info("run.succeeded", &summary);
        } else if next == RunState::Waiting {
            log.info("run.waiting", &summary);
        } else {
            log.error("run.finished", &summary);
        }

        Ok(RunOutcome {
            run_id,
            state: next,
            result,
        })
    }
}

fn build_result(
    process_id: &str,
    outcome: Result<Map<String, Value>, Halt>,
    parts: &DriverParts,
) -> ProcessResult {
    let ctx = &parts.context;
    let metadata = ResultMetadata {
        run_id: ctx.run_id().to_string(),
        process_id: process_id.to_string(),
        started_at: ctx.started_at().to_rfc3339_opts(SecondsFormat::Millis, true),
        finished_at: ctx.now().to_rfc3339_opts(SecondsFormat::Millis, true),
        effects_issued: ctx.effects_issued(),
        effects_dispatched: parts.effects_dispatched,
        effects_replayed: parts.effects_replayed,
        breakpoints_raised: ctx.breakpoints_raised(),
        executions: parts.record.executions,
    };
    let artifacts = ctx.artifacts().to_vec();
    let duration_ms = u64::try_from(ctx.elapsed().as_millis()).unwrap_or(u64::MAX);

    match outcome {
        Ok(outputs) => ProcessResult::Success {
            outputs,
            artifacts,
            duration_ms,
            metadata,
        },
        Err(Halt::Failed { step, reason }) => ProcessResult::Failure {
            reason,
            failing_step: Some(step),
            canceled: false,
            artifacts,
            duration_ms,
            metadata,
        },
        Err(Halt::Aborted {
            breakpoint_id,
            reason,
        }) => ProcessResult::Failure {
            reason,
            failing_step: Some(breakpoint_id),
            canceled: true,
            artifacts,
            duration_ms,
            metadata,
        },
        Err(Halt::Suspended { breakpoint_id }) => ProcessResult::Suspended {
            breakpoint_id,
            artifacts,
            duration_ms,
            metadata,
        },
        Err(Halt::Fatal(err)) => ProcessResult::Failure {
            reason: err.to_string(),
            failing_step: parts.record.current_step.clone(),
            canceled: false,
            artifacts,
            duration_ms,
            metadata,
        },
    }
}

pub fn decision_channel_for(settings: &RuntimeSettings) -> Arc<dyn DecisionChannel> {
    match settings.breakpoints.mode {
        BreakpointMode::Block => Arc::new(FileDecisionChannel::new(
            settings.decision_timeout(),
            settings.poll_interval(),
        )),
        BreakpointMode::Detach => Arc::new(DetachedDecisionChannel),
        BreakpointMode::AutoProceed => Arc::new(StaticDecisionChannel::new(Decision::Proceed)),
    }
}

fn parse_run_id(raw: &str) -> Result<RunId, OrchestratorError> {
    RunId::parse(raw).map_err(|reason| OrchestratorError::InvalidRunId {
        run_id: raw.to_string(),
        reason,
    })
}

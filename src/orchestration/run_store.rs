use crate::orchestration::error::OrchestratorError;
pub use crate::orchestration::progress::ProgressSnapshot;
use crate::shared::atomic_write_json;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Waiting,
    Succeeded,
    Failed,
    Canceled,
}

impl RunState {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (RunState::Queued, RunState::Running)
                | (RunState::Queued, RunState::Failed)
                | (RunState::Queued, RunState::Canceled)
                | (RunState::Running, RunState::Waiting)
                | (RunState::Running, RunState::Succeeded)
                | (RunState::Running, RunState::Failed)
                | (RunState::Running, RunState::Canceled)
                | (RunState::Waiting, RunState::Running)
                | (RunState::Waiting, RunState::Failed)
                | (RunState::Waiting, RunState::Canceled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Canceled
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Queued => write!(f, "queued"),
            RunState::Running => write!(f, "running"),
            RunState::Waiting => write!(f, "waiting"),
            RunState::Succeeded => write!(f, "succeeded"),
            RunState::Failed => write!(f, "failed"),
            RunState::Canceled => write!(f, "canceled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRunRecord {
    pub run_id: String,
    pub process_id: String,
    pub state: RunState,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    pub started_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub pending_breakpoint: Option<String>,
    #[serde(default)]
    pub effects_completed: u64,
    #[serde(default)]
    pub executions: u32,
    #[serde(default)]
    pub terminal_reason: Option<String>,
}

/// File-backed store for `runs/<runId>/`.
#[derive(Debug, Clone)]
pub struct ProcessRunStore {
    state_root: PathBuf,
}

impl ProcessRunStore {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
        }
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    pub fn runs_root(&self) -> PathBuf {
        self.state_root.join("runs")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_root().join(run_id)
    }

    pub fn run_exists(&self, run_id: &str) -> bool {
        self.run_metadata_path(run_id).is_file()
    }

    pub fn create_run(
        &self,
        run_id: impl Into<String>,
        process_id: impl Into<String>,
        inputs: Map<String, Value>,
        now: i64,
    ) -> Result<ProcessRunRecord, OrchestratorError> {
        let run_id = run_id.into();
        if self.run_exists(&run_id) {
            return Err(OrchestratorError::RunAlreadyExists { run_id });
        }
        let run = ProcessRunRecord {
            run_id,
            process_id: process_id.into(),
            state: RunState::Queued,
            inputs,
            started_at: now,
            updated_at: now,
            current_step: None,
            pending_breakpoint: None,
            effects_completed: 0,
            executions: 0,
            terminal_reason: None,
        };
        self.persist_run(&run)?;
        self.persist_progress(&snapshot(&run, now, "queued", "process start"))?;
        Ok(run)
    }

    pub fn load_run(&self, run_id: &str) -> Result<ProcessRunRecord, OrchestratorError> {
        let path = self.run_metadata_path(run_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == ErrorKind::NotFound => {
                return Err(OrchestratorError::UnknownRunId {
                    run_id: run_id.to_string(),
                })
            }
            Err(source) => return Err(io_error(&path, source)),
        };
        serde_json::from_str(&raw).map_err(|e| json_error(&path, e))
    }

    pub fn persist_run(&self, run: &ProcessRunRecord) -> Result<(), OrchestratorError> {
        let path = self.run_metadata_path(&run.run_id);
        atomic_write_json(&path, run).map_err(|e| io_error(&path, e))
    }

    pub fn transition_state(
        &self,
        run: &mut ProcessRunRecord,
        next: RunState,
        now: i64,
        summary: impl Into<String>,
        next_expected_action: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        let summary = summary.into();
        if !run.state.can_transition_to(next) {
            return Err(OrchestratorError::InvalidRunTransition {
                from: run.state,
                to: next,
            });
        }
        run.state = next;
        run.updated_at = now;
        if run.state.is_terminal() {
            run.terminal_reason = Some(summary.clone());
        } else {
            run.terminal_reason = None;
        }
        if run.state != RunState::Waiting {
            run.pending_breakpoint = None;
        }
        self.persist_run(run)?;
        self.persist_progress(&snapshot(run, now, &summary, &next_expected_action.into()))
    }

    /// Persists `run` and a progress snapshot without changing state.
    pub fn checkpoint(
        &self,
        run: &mut ProcessRunRecord,
        now: i64,
        summary: impl Into<String>,
        next_expected_action: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        run.updated_at = now;
        self.persist_run(run)?;
        self.persist_progress(&snapshot(
            run,
            now,
            &summary.into(),
            &next_expected_action.into(),
        ))
    }

    pub fn persist_progress(&self, progress: &ProgressSnapshot) -> Result<(), OrchestratorError> {
        let path = self.progress_path(&progress.run_id);
        atomic_write_json(&path, progress).map_err(|e| io_error(&path, e))
    }

    pub fn load_progress(&self, run_id: &str) -> Result<ProgressSnapshot, OrchestratorError> {
        let path = self.progress_path(run_id);
        let raw = fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
        serde_json::from_str(&raw).map_err(|e| json_error(&path, e))
    }

    pub fn persist_result<T: Serialize>(
        &self,
        run_id: &str,
        result: &T,
    ) -> Result<PathBuf, OrchestratorError> {
        let path = self.result_path(run_id);
        atomic_write_json(&path, result).map_err(|e| io_error(&path, e))?;
        Ok(path)
    }

    pub fn load_result(&self, run_id: &str) -> Result<Option<Value>, OrchestratorError> {
        let path = self.result_path(run_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(io_error(&path, source)),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| json_error(&path, e))
    }

    /// Every run on disk, most recently updated first.
    pub fn list_runs(&self) -> Result<Vec<ProcessRunRecord>, OrchestratorError> {
        let runs_root = self.runs_root();
        let entries = match fs::read_dir(&runs_root) {
            Ok(entries) => entries,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(&runs_root, source)),
        };

        let mut runs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| io_error(&runs_root, source))?;
            let path = entry.path().join("run.json");
            if !path.is_file() {
                continue;
            }
            let raw = fs::read_to_string(&path).map_err(|source| io_error(&path, source))?;
            let run: ProcessRunRecord =
                serde_json::from_str(&raw).map_err(|source| json_error(&path, source))?;
            runs.push(run);
        }
        runs.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        Ok(runs)
    }

    fn run_metadata_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("run.json")
    }

    fn progress_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("progress.json")
    }

    fn result_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("result.json")
    }
}

fn snapshot(
    run: &ProcessRunRecord,
    now: i64,
    summary: &str,
    next_expected_action: &str,
) -> ProgressSnapshot {
    ProgressSnapshot {
        run_id: run.run_id.clone(),
        process_id: run.process_id.clone(),
        state: run.state,
        input_count: run.inputs.len(),
        input_keys: sorted_input_keys(&run.inputs),
        current_step: run.current_step.clone(),
        effects_completed: run.effects_completed,
        started_at: run.started_at,
        updated_at: now,
        last_progress_at: now,
        summary: summary.to_string(),
        pending_human_input: run.state == RunState::Waiting,
        pending_breakpoint: run.pending_breakpoint.clone(),
        next_expected_action: next_expected_action.to_string(),
    }
}

fn sorted_input_keys(inputs: &Map<String, Value>) -> Vec<String> {
    let mut keys = inputs.keys().cloned().collect::<Vec<_>>();
    keys.sort();
    keys
}

pub(crate) fn io_error(path: &Path, source: std::io::Error) -> OrchestratorError {
    OrchestratorError::Io {
        path: path.display().to_string(),
        source,
    }
}

pub(crate) fn json_error(path: &Path, source: serde_json::Error) -> OrchestratorError {
    OrchestratorError::Json {
        path: path.display().to_string(),
        source,
    }
}

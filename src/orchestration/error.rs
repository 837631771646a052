use crate::config::ConfigError;
use crate::effect::EffectError;
use crate::orchestration::breakpoint::BreakpointError;
use crate::orchestration::run_store::RunState;
use crate::orchestration::score::ScoreError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("process run `{run_id}` not found")]
    UnknownRunId { run_id: String },
    #[error("process run `{run_id}` already exists")]
    RunAlreadyExists { run_id: String },
    #[error("process run `{run_id}` is locked by another writer ({path})")]
    RunLocked { run_id: String, path: String },
    #[error("process run `{run_id}` belongs to process `{recorded}`, not `{requested}`")]
    ProcessMismatch {
        run_id: String,
        recorded: String,
        requested: String,
    },
    #[error("process run `{run_id}` is already {state} and cannot be resumed")]
    RunTerminal { run_id: String, state: RunState },
    #[error("process run state transition `{from}` -> `{to}` is invalid")]
    InvalidRunTransition { from: RunState, to: RunState },
    #[error("invalid run id `{run_id}`: {reason}")]
    InvalidRunId { run_id: String, reason: String },
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Effect(#[from] EffectError),
    #[error(transparent)]
    Breakpoint(#[from] BreakpointError),
    #[error(transparent)]
    Score(#[from] ScoreError),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<ConfigError> for OrchestratorError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

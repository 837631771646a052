use crate::registry::RegistryError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectErrorKind {
    UnknownTask,
    Resolution,
    SchemaViolation,
    ExecutorFailure,
    Timeout,
    DuplicateEffect,
    ReplayDivergence,
    Persistence,
}

#[derive(Debug, thiserror::Error)]
pub enum EffectError {
    #[error("unknown task `{task}`")]
    UnknownTask { task: String },
    #[error("task `{task}` could not be resolved: {reason}")]
    Resolution { task: String, reason: String },
    #[error("effect `{effect_id}` output violates its schema: {}", violations.join("; "))]
    SchemaViolation {
        effect_id: String,
        violations: Vec<String>,
    },
    #[error("effect `{effect_id}` executor failed: {reason}")]
    ExecutorFailure { effect_id: String, reason: String },
    #[error("effect `{effect_id}` timed out after {timeout_ms}ms")]
    Timeout { effect_id: String, timeout_ms: u64 },
    #[error("effect `{effect_id}` was already issued in this run")]
    DuplicateEffect { effect_id: String },
    #[error(
        "effect `{effect_id}` replay diverged: recorded args digest {recorded}, current {current}"
    )]
    ReplayDivergence {
        effect_id: String,
        recorded: String,
        current: String,
    },
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

impl EffectError {
    pub fn kind(&self) -> EffectErrorKind {
        match self {
            Self::UnknownTask { .. } => EffectErrorKind::UnknownTask,
            Self::Resolution { .. } => EffectErrorKind::Resolution,
            Self::SchemaViolation { .. } => EffectErrorKind::SchemaViolation,
            Self::ExecutorFailure { .. } => EffectErrorKind::ExecutorFailure,
            Self::Timeout { .. } => EffectErrorKind::Timeout,
            Self::DuplicateEffect { .. } => EffectErrorKind::DuplicateEffect,
            Self::ReplayDivergence { .. } => EffectErrorKind::ReplayDivergence,
            Self::Io { .. } | Self::Json { .. } => EffectErrorKind::Persistence,
        }
    }

    /// Executor failures and timeouts may be retried with a fresh effect.
    /// Everything else is deterministic and would fail again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExecutorFailure { .. } | Self::Timeout { .. })
    }

    pub fn effect_id(&self) -> Option<&str> {
        match self {
            Self::SchemaViolation { effect_id, .. }
            | Self::ExecutorFailure { effect_id, .. }
            | Self::Timeout { effect_id, .. }
            | Self::DuplicateEffect { effect_id }
            | Self::ReplayDivergence { effect_id, .. } => Some(effect_id),
            _ => None,
        }
    }
}

impl From<RegistryError> for EffectError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::UnknownTask { task } => Self::UnknownTask { task },
            RegistryError::InvalidArguments { task, reason } => Self::Resolution { task, reason },
            RegistryError::DuplicateTask { task } => Self::Resolution {
                task,
                reason: "task registered twice".to_string(),
            },
            RegistryError::InvalidTaskName { task, reason } => Self::Resolution { task, reason },
        }
    }
}

use crate::effect::error::{EffectError, EffectErrorKind};
use crate::registry::{AgentContract, IoLocations, TaskKind};
use crate::shared::atomic_write_json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl EffectStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (EffectStatus::Pending, EffectStatus::Running)
                | (EffectStatus::Pending, EffectStatus::Failed)
                | (EffectStatus::Running, EffectStatus::Succeeded)
                | (EffectStatus::Running, EffectStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EffectStatus::Succeeded | EffectStatus::Failed)
    }
}

impl std::fmt::Display for EffectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EffectStatus::Pending => write!(f, "pending"),
            EffectStatus::Running => write!(f, "running"),
            EffectStatus::Succeeded => write!(f, "succeeded"),
            EffectStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectInputRecord {
    pub effect_id: String,
    pub run_id: String,
    pub task: String,
    pub kind: TaskKind,
    pub sequence: u64,
    pub recorded_at: String,
    pub args_digest: String,
    pub args: Value,
    #[serde(default)]
    pub contract: Option<AgentContract>,
    #[serde(default)]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectFailureRecord {
    pub kind: EffectErrorKind,
    pub message: String,
    #[serde(default)]
    pub violations: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl EffectFailureRecord {
    pub fn from_error(error: &EffectError) -> Self {
        let (violations, timeout_ms, message) = match error {
            EffectError::SchemaViolation { violations, .. } => {
                (violations.clone(), None, error.to_string())
            }
            EffectError::Timeout { timeout_ms, .. } => (Vec::new(), Some(*timeout_ms), error.to_string()),
            EffectError::ExecutorFailure { reason, .. } => (Vec::new(), None, reason.clone()),
            other => (Vec::new(), None, other.to_string()),
        };
        Self {
            kind: error.kind(),
            message,
            violations,
            timeout_ms,
        }
    }

    /// Rebuilds the typed error a replayed failure stands for.
    pub fn to_error(&self, effect_id: &str) -> EffectError {
        match self.kind {
            EffectErrorKind::SchemaViolation => EffectError::SchemaViolation {
                effect_id: effect_id.to_string(),
                violations: self.violations.clone(),
            },
            EffectErrorKind::Timeout => EffectError::Timeout {
                effect_id: effect_id.to_string(),
                timeout_ms: self.timeout_ms.unwrap_or_default(),
            },
            _ => EffectError::ExecutorFailure {
                effect_id: effect_id.to_string(),
                reason: self.message.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectResultRecord {
    pub effect_id: String,
    pub task: String,
    pub status: EffectStatus,
    pub sequence: u64,
    pub completed_at: String,
    pub duration_ms: u64,
    pub args_digest: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<EffectFailureRecord>,
}

/// Hex SHA-256 of the canonical JSON encoding of `args`.
pub fn args_digest(args: &Value) -> String {
    let encoded = serde_json::to_vec(args).unwrap_or_default();
    let digest = Sha256::digest(&encoded);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Durable `tasks/` journal of one run.
///
/// Every record gets a sequence number from one counter shared by the whole
/// run, so the order of writes can be checked after the fact. The counter
/// resumes above the largest sequence already on disk.
#[derive(Debug)]
pub struct EffectJournal {
    tasks_root: PathBuf,
    sequence: AtomicU64,
}

impl EffectJournal {
    pub fn open(run_dir: &Path) -> Result<Self, EffectError> {
        let tasks_root = run_dir.join("tasks");
        let highest = highest_recorded_sequence(&tasks_root)?;
        Ok(Self {
            tasks_root,
            sequence: AtomicU64::new(highest),
        })
    }

    pub fn tasks_root(&self) -> &Path {
        &self.tasks_root
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn write_input(
        &self,
        io: &IoLocations,
        record: &EffectInputRecord,
    ) -> Result<(), EffectError> {
        atomic_write_json(&io.input, record).map_err(|source| io_error(&io.input, source))
    }

    pub fn write_result(
        &self,
        io: &IoLocations,
        record: &EffectResultRecord,
    ) -> Result<(), EffectError> {
        atomic_write_json(&io.result, record).map_err(|source| io_error(&io.result, source))
    }

    pub fn load_input(&self, io: &IoLocations) -> Result<Option<EffectInputRecord>, EffectError> {
        load_optional(&io.input)
    }

    pub fn load_result(&self, io: &IoLocations) -> Result<Option<EffectResultRecord>, EffectError> {
        load_optional(&io.result)
    }
}

pub fn load_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, EffectError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(source) if source.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(io_error(path, source)),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| EffectError::Json {
            path: path.display().to_string(),
            source,
        })
}

fn highest_recorded_sequence(tasks_root: &Path) -> Result<u64, EffectError> {
    let entries = match fs::read_dir(tasks_root) {
        Ok(entries) => entries,
        Err(source) if source.kind() == ErrorKind::NotFound => return Ok(0),
        Err(source) => return Err(io_error(tasks_root, source)),
    };

    let mut highest = 0u64;
    for entry in entries {
        let entry = entry.map_err(|source| io_error(tasks_root, source))?;
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        if let Some(input) = load_optional::<EffectInputRecord>(&dir.join("input.json"))? {
            highest = highest.max(input.sequence);
        }
        if let Some(result) = load_optional::<EffectResultRecord>(&dir.join("result.json"))? {
            highest = highest.max(result.sequence);
        }
    }
    Ok(highest)
}

fn io_error(path: &Path, source: std::io::Error) -> EffectError {
    EffectError::Io {
        path: path.display().to_string(),
        source,
    }
}

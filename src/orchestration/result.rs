use crate::orchestration::artifact::Artifact;
use crate::orchestration::run_store::RunState;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub run_id: String,
    pub process_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub effects_issued: u64,
    pub effects_dispatched: u64,
    pub effects_replayed: u64,
    pub breakpoints_raised: u64,
    pub executions: u32,
}

/// Final outcome of one process execution.
///
/// Serializes as one flat object: `success`, `status`, the domain outputs of
/// a successful run, `artifacts`, `durationMs` and `metadata`. Reserved keys
/// win over outputs of the same name.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessResult {
    Success {
        outputs: Map<String, Value>,
        artifacts: Vec<Artifact>,
        duration_ms: u64,
        metadata: ResultMetadata,
    },
    Failure {
        reason: String,
        failing_step: Option<String>,
        /// Ended by an `abort` decision rather than a failing step.
        canceled: bool,
        artifacts: Vec<Artifact>,
        duration_ms: u64,
        metadata: ResultMetadata,
    },
    Suspended {
        breakpoint_id: String,
        artifacts: Vec<Artifact>,
        duration_ms: u64,
        metadata: ResultMetadata,
    },
}

impl ProcessResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn run_state(&self) -> RunState {
        match self {
            Self::Success { .. } => RunState::Succeeded,
            Self::Failure { canceled: true, .. } => RunState::Canceled,
            Self::Failure { .. } => RunState::Failed,
            Self::Suspended { .. } => RunState::Waiting,
        }
    }

    pub fn status(&self) -> String {
        self.run_state().to_string()
    }

    pub fn artifacts(&self) -> &[Artifact] {
        match self {
            Self::Success { artifacts, .. }
            | Self::Failure { artifacts, .. }
            | Self::Suspended { artifacts, .. } => artifacts,
        }
    }

    pub fn metadata(&self) -> &ResultMetadata {
        match self {
            Self::Success { metadata, .. }
            | Self::Failure { metadata, .. }
            | Self::Suspended { metadata, .. } => metadata,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        match self {
            Self::Success { duration_ms, .. }
            | Self::Failure { duration_ms, .. }
            | Self::Suspended { duration_ms, .. } => *duration_ms,
        }
    }

    pub fn outputs(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Success { outputs, .. } => Some(outputs),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut body = Map::new();
        body.insert("success".to_string(), Value::Bool(self.is_success()));
        body.insert("status".to_string(), Value::String(self.status()));
        match self {
            Self::Success { outputs, .. } => {
                for (key, value) in outputs {
                    body.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
            Self::Failure {
                reason,
                failing_step,
                ..
            } => {
                body.insert("reason".to_string(), Value::String(reason.clone()));
                body.insert(
                    "failingStep".to_string(),
                    failing_step.clone().map(Value::String).unwrap_or(Value::Null),
                );
            }
            Self::Suspended { breakpoint_id, .. } => {
                body.insert(
                    "breakpointId".to_string(),
                    Value::String(breakpoint_id.clone()),
                );
            }
        }
        body.insert(
            "artifacts".to_string(),
            serde_json::to_value(self.artifacts()).unwrap_or(Value::Array(Vec::new())),
        );
        body.insert("durationMs".to_string(), Value::from(self.duration_ms()));
        body.insert(
            "metadata".to_string(),
            serde_json::to_value(self.metadata()).unwrap_or(Value::Null),
        );
        Value::Object(body)
    }
}

impl Serialize for ProcessResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

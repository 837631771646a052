use crate::shared::{EffectId, RunId, TaskName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// In-process task body. Errors become `EffectError::ExecutorFailure`.
pub type NativeFn = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ExternalAgent,
    Native,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExternalAgent => "external_agent",
            Self::Native => "native",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload handed to an external agent capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContract {
    pub role: String,
    pub task: String,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub instructions: Vec<String>,
    #[serde(default)]
    pub output_format: Value,
}

#[derive(Clone)]
pub enum Execution {
    Agent(AgentContract),
    Native(NativeFn),
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent(contract) => f.debug_tuple("Agent").field(contract).finish(),
            Self::Native(_) => f.write_str("Native(..)"),
        }
    }
}

/// Durable audit locations for one effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoLocations {
    pub input: PathBuf,
    pub result: PathBuf,
}

impl IoLocations {
    pub fn for_effect(run_dir: &Path, effect_id: &EffectId) -> Self {
        let dir = effect_dir(run_dir, effect_id);
        Self {
            input: dir.join("input.json"),
            result: dir.join("result.json"),
        }
    }

    pub fn effect_dir(&self) -> Option<&Path> {
        self.input.parent()
    }
}

pub fn effect_dir(run_dir: &Path, effect_id: &EffectId) -> PathBuf {
    run_dir.join("tasks").join(effect_id.as_str())
}

/// What a factory sees when it resolves a descriptor.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub run_id: RunId,
    pub effect_id: EffectId,
    pub io: IoLocations,
}

impl InvocationContext {
    pub fn new(run_id: RunId, run_dir: &Path, effect_id: EffectId) -> Self {
        let io = IoLocations::for_effect(run_dir, &effect_id);
        Self {
            run_id,
            effect_id,
            io,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub task: TaskName,
    pub execution: Execution,
    pub output_schema: Option<Value>,
    pub timeout: Option<Duration>,
    pub io: IoLocations,
}

impl TaskDescriptor {
    pub fn external_agent(task: TaskName, ctx: &InvocationContext, contract: AgentContract) -> Self {
        let output_schema = match &contract.output_format {
            Value::Null => None,
            schema => Some(schema.clone()),
        };
        Self {
            task,
            execution: Execution::Agent(contract),
            output_schema,
            timeout: None,
            io: ctx.io.clone(),
        }
    }

    pub fn native(task: TaskName, ctx: &InvocationContext, function: NativeFn) -> Self {
        Self {
            task,
            execution: Execution::Native(function),
            output_schema: None,
            timeout: None,
            io: ctx.io.clone(),
        }
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn kind(&self) -> TaskKind {
        match self.execution {
            Execution::Agent(_) => TaskKind::ExternalAgent,
            Execution::Native(_) => TaskKind::Native,
        }
    }

    pub fn contract(&self) -> Option<&AgentContract> {
        match &self.execution {
            Execution::Agent(contract) => Some(contract),
            Execution::Native(_) => None,
        }
    }
}

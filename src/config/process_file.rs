use super::ConfigError;
use crate::shared::{ProcessId, StepId, TaskName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

fn default_version() -> u32 {
    1
}

fn default_score_field() -> String {
    "score".to_string()
}

fn default_score_weight() -> f64 {
    1.0
}

fn default_gate_field() -> String {
    "passed".to_string()
}

fn default_gate_flag() -> String {
    "fail_on_critical".to_string()
}

/// Declarative process file: named agent tasks plus an ordered list of steps.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProcessDefinition {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputSpec>,
    #[serde(default)]
    pub tasks: BTreeMap<String, AgentTaskConfig>,
    /// Task names served by the host's own registry (native functions).
    #[serde(default)]
    pub native_tasks: Vec<String>,
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub result: ResultConfig,
    #[serde(default)]
    pub final_breakpoint: Option<BreakpointConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct InputSpec {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AgentTaskConfig {
    pub role: String,
    pub task: String,
    #[serde(default)]
    pub instructions: Vec<String>,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    Task(TaskStepConfig),
    Parallel(ParallelStepConfig),
    Breakpoint(BreakpointStepConfig),
}

impl StepConfig {
    pub fn id(&self) -> &str {
        match self {
            Self::Task(step) => &step.id,
            Self::Parallel(step) => &step.id,
            Self::Breakpoint(step) => &step.id,
        }
    }

    pub fn when(&self) -> Option<&Condition> {
        match self {
            Self::Task(step) => step.when.as_ref(),
            Self::Parallel(step) => step.when.as_ref(),
            Self::Breakpoint(step) => step.when.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Abort,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TaskStepConfig {
    pub id: String,
    pub task: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub when: Option<Condition>,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub score: Option<ScoreConfig>,
    #[serde(default)]
    pub gate: Option<GateConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ParallelStepConfig {
    pub id: String,
    pub members: Vec<ParallelMemberConfig>,
    #[serde(default)]
    pub when: Option<Condition>,
    #[serde(default)]
    pub require_all: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ParallelMemberConfig {
    pub task: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BreakpointStepConfig {
    pub id: String,
    pub title: String,
    pub question: String,
    #[serde(default)]
    pub summary: Value,
    #[serde(default)]
    pub when: Option<Condition>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BreakpointConfig {
    pub title: String,
    pub question: String,
    #[serde(default)]
    pub summary: Value,
}

/// Guard on a run input: truthy by default, or equal to `equals` when given.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Condition {
    pub input: String,
    #[serde(default)]
    pub equals: Option<Value>,
    #[serde(default)]
    pub negate: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScoreConfig {
    #[serde(default = "default_score_field")]
    pub field: String,
    #[serde(default = "default_score_weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GateConfig {
    #[serde(default = "default_gate_field")]
    pub field: String,
    #[serde(default = "default_gate_flag")]
    pub fail_flag: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ResultConfig {
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl ProcessDefinition {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ProcessId::parse(&self.id).map_err(|reason| self.invalid(reason))?;
        if self.steps.is_empty() {
            return Err(self.invalid("`steps` must be non-empty"));
        }

        for (name, task) in &self.tasks {
            TaskName::parse(name).map_err(|reason| self.invalid(reason))?;
            if task.role.trim().is_empty() || task.task.trim().is_empty() {
                return Err(self.invalid(format!(
                    "task `{name}` requires non-empty `role` and `task`"
                )));
            }
            if task.timeout_seconds == Some(0) {
                return Err(self.invalid(format!(
                    "task `{name}` timeout_seconds must be >= 1"
                )));
            }
            if let Some(schema) = &task.output_schema {
                if !schema.is_object() && !schema.is_boolean() {
                    return Err(self.invalid(format!(
                        "task `{name}` output_schema must be a JSON Schema object"
                    )));
                }
            }
        }
        for name in &self.native_tasks {
            TaskName::parse(name).map_err(|reason| self.invalid(reason))?;
            if self.tasks.contains_key(name) {
                return Err(self.invalid(format!(
                    "task `{name}` is declared both in `tasks` and `native_tasks`"
                )));
            }
        }

        let mut step_ids = HashSet::new();
        for step in &self.steps {
            StepId::parse(step.id()).map_err(|reason| self.invalid(reason))?;
            if !step_ids.insert(step.id()) {
                return Err(self.invalid(format!("step id `{}` must be unique", step.id())));
            }
            if let Some(condition) = step.when() {
                self.ensure_input_declared(&condition.input, step.id())?;
            }
            match step {
                StepConfig::Task(task_step) => {
                    self.ensure_task_declared(&task_step.task, &task_step.id)?;
                    if let Some(score) = &task_step.score {
                        if !score.weight.is_finite() || score.weight < 0.0 {
                            return Err(self.invalid(format!(
                                "step `{}` score weight must be a non-negative number",
                                task_step.id
                            )));
                        }
                    }
                    if let Some(gate) = &task_step.gate {
                        self.ensure_input_declared(&gate.fail_flag, &task_step.id)?;
                    }
                }
                StepConfig::Parallel(group) => {
                    if group.members.is_empty() {
                        return Err(self.invalid(format!(
                            "parallel step `{}` requires at least one member",
                            group.id
                        )));
                    }
                    let mut keyed = HashSet::new();
                    for member in &group.members {
                        self.ensure_task_declared(&member.task, &group.id)?;
                        if let Some(key) = &member.key {
                            if !keyed.insert((member.task.as_str(), key.as_str())) {
                                return Err(self.invalid(format!(
                                    "parallel step `{}` repeats task `{}` with key `{key}`",
                                    group.id, member.task
                                )));
                            }
                        }
                    }
                }
                StepConfig::Breakpoint(breakpoint) => {
                    if breakpoint.title.trim().is_empty() || breakpoint.question.trim().is_empty()
                    {
                        return Err(self.invalid(format!(
                            "breakpoint step `{}` requires non-empty `title` and `question`",
                            breakpoint.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn ensure_task_declared(&self, task: &str, step_id: &str) -> Result<(), ConfigError> {
        if self.tasks.contains_key(task) || self.native_tasks.iter().any(|name| name == task) {
            return Ok(());
        }
        Err(self.invalid(format!(
            "step `{step_id}` references undeclared task `{task}`"
        )))
    }

    fn ensure_input_declared(&self, input: &str, step_id: &str) -> Result<(), ConfigError> {
        if self.inputs.contains_key(input) {
            return Ok(());
        }
        Err(self.invalid(format!(
            "step `{step_id}` references undeclared input `{input}`"
        )))
    }

    fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::Process {
            process_id: self.id.clone(),
            reason: reason.into(),
        }
    }
}

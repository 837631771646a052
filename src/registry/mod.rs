//! Task name to descriptor factory mapping.
//!
//! The registry is assembled once, then frozen behind an `Arc` and shared by
//! every run. It never executes work; `resolve` only builds descriptors.

pub mod descriptor;

pub use descriptor::{
    effect_dir, AgentContract, Execution, InvocationContext, IoLocations, NativeFn, TaskDescriptor,
    TaskKind,
};

use crate::config::AgentTaskConfig;
use crate::shared::TaskName;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub type TaskFactory = Arc<
    dyn Fn(&Value, &InvocationContext) -> Result<TaskDescriptor, RegistryError> + Send + Sync,
>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown task `{task}`")]
    UnknownTask { task: String },
    #[error("task `{task}` is already registered")]
    DuplicateTask { task: String },
    #[error("invalid task name `{task}`: {reason}")]
    InvalidTaskName { task: String, reason: String },
    #[error("task `{task}` rejected its arguments: {reason}")]
    InvalidArguments { task: String, reason: String },
}

#[derive(Clone)]
pub struct TaskDefinition {
    name: TaskName,
    factory: TaskFactory,
}

impl TaskDefinition {
    pub fn new<F>(name: TaskName, factory: F) -> Self
    where
        F: Fn(&Value, &InvocationContext) -> Result<TaskDescriptor, RegistryError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name,
            factory: Arc::new(factory),
        }
    }

    /// Agent task whose contract is fixed apart from `context`, which carries
    /// the invocation arguments (merged over any static context object).
    pub fn agent(name: TaskName, template: AgentTemplate) -> Self {
        let task_name = name.clone();
        Self::new(name, move |args, ctx| {
            let mut contract = template.contract.clone();
            contract.context = merge_context(&template.contract.context, args);
            let mut descriptor = TaskDescriptor::external_agent(task_name.clone(), ctx, contract);
            descriptor.timeout = template.timeout;
            Ok(descriptor)
        })
    }

    /// Native task backed by `function`, validated against `output_schema`.
    pub fn native<F>(name: TaskName, output_schema: Option<Value>, function: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        let task_name = name.clone();
        let function: NativeFn = Arc::new(function);
        Self::new(name, move |_args, ctx| {
            let mut descriptor =
                TaskDescriptor::native(task_name.clone(), ctx, Arc::clone(&function));
            descriptor.output_schema = output_schema.clone();
            Ok(descriptor)
        })
    }

    pub fn name(&self) -> &TaskName {
        &self.name
    }
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct AgentTemplate {
    pub contract: AgentContract,
    pub timeout: Option<Duration>,
}

impl From<&AgentTaskConfig> for AgentTemplate {
    fn from(config: &AgentTaskConfig) -> Self {
        Self {
            contract: AgentContract {
                role: config.role.clone(),
                task: config.task.clone(),
                context: config.context.clone().unwrap_or(Value::Null),
                instructions: config.instructions.clone(),
                output_format: config.output_schema.clone().unwrap_or(Value::Null),
            },
            timeout: config.timeout_seconds.map(Duration::from_secs),
        }
    }
}

fn merge_context(base: &Value, args: &Value) -> Value {
    match (base, args) {
        (Value::Null, args) => args.clone(),
        (Value::Object(base), Value::Object(args)) => {
            let mut merged = base.clone();
            for (key, value) in args {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (base, args) => json!({ "static": base, "args": args }),
    }
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<TaskName, TaskDefinition>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&Value, &InvocationContext) -> Result<TaskDescriptor, RegistryError>
            + Send
            + Sync
            + 'static,
    {
        let name = parse_task_name(name)?;
        self.insert(TaskDefinition::new(name, factory))
    }

    pub fn insert(&mut self, definition: TaskDefinition) -> Result<(), RegistryError> {
        if self.tasks.contains_key(definition.name()) {
            return Err(RegistryError::DuplicateTask {
                task: definition.name().to_string(),
            });
        }
        self.tasks.insert(definition.name().clone(), definition);
        Ok(())
    }

    pub fn resolve(
        &self,
        name: &str,
        args: &Value,
        ctx: &InvocationContext,
    ) -> Result<TaskDescriptor, RegistryError> {
        let definition = self
            .tasks
            .get(name)
            .ok_or_else(|| RegistryError::UnknownTask {
                task: name.to_string(),
            })?;
        (definition.factory)(args, ctx)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.keys().map(TaskName::as_str).collect()
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

pub fn parse_task_name(name: &str) -> Result<TaskName, RegistryError> {
    TaskName::parse(name).map_err(|reason| RegistryError::InvalidTaskName {
        task: name.to_string(),
        reason,
    })
}

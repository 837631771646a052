use crate::config::{
    load_process_definition, BreakpointStepConfig, Condition, ConfigError, OnError,
    ParallelStepConfig, ProcessDefinition, StepConfig, TaskStepConfig,
};
use crate::orchestration::breakpoint::Decision;
use crate::orchestration::driver::{Halt, ParallelMember, Process, ProcessDriver};
use crate::orchestration::template::{
    render_text, render_value, truthy, TemplateError, TemplateScope,
};
use crate::registry::{parse_task_name, AgentTemplate, RegistryError, TaskDefinition, TaskRegistry};
use crate::shared::LogLevel;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Times a reviewer may send the run back to the previous task step.
pub const MAX_BREAKPOINT_RETRIES: u32 = 3;

/// Builds a registry holding the definition's agent tasks plus `natives`.
/// Every name listed under `native_tasks` must be supplied.
pub fn registry_for_definition(
    definition: &ProcessDefinition,
    natives: impl IntoIterator<Item = TaskDefinition>,
) -> Result<TaskRegistry, RegistryError> {
    let mut registry = TaskRegistry::new();
    for (name, config) in &definition.tasks {
        let task = parse_task_name(name)?;
        registry.insert(TaskDefinition::agent(task, AgentTemplate::from(config)))?;
    }
    for native in natives {
        registry.insert(native)?;
    }
    for name in &definition.native_tasks {
        if !registry.contains(name) {
            return Err(RegistryError::UnknownTask { task: name.clone() });
        }
    }
    Ok(registry)
}

/// A [`Process`] interpreted from a YAML [`ProcessDefinition`].
#[derive(Debug, Clone)]
pub struct DefinedProcess {
    definition: ProcessDefinition,
}

impl DefinedProcess {
    pub fn new(definition: ProcessDefinition) -> Result<Self, ConfigError> {
        definition.validate()?;
        Ok(Self { definition })
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self {
            definition: load_process_definition(path)?,
        })
    }

    pub fn definition(&self) -> &ProcessDefinition {
        &self.definition
    }

    /// Applies declared defaults and rejects missing required or undeclared
    /// inputs.
    pub fn prepare_inputs(
        &self,
        mut provided: Map<String, Value>,
    ) -> Result<Map<String, Value>, ConfigError> {
        if let Some(unknown) = provided
            .keys()
            .find(|name| !self.definition.inputs.contains_key(*name))
        {
            return Err(self.invalid(format!("input `{unknown}` is not declared")));
        }
        for (name, spec) in &self.definition.inputs {
            if provided.contains_key(name) {
                continue;
            }
            match &spec.default {
                Some(default) => {
                    provided.insert(name.clone(), default.clone());
                }
                None if spec.required => {
                    return Err(self.invalid(format!("required input `{name}` is missing")));
                }
                None => {}
            }
        }
        Ok(provided)
    }

    fn invalid(&self, reason: String) -> ConfigError {
        ConfigError::Process {
            process_id: self.definition.id.clone(),
            reason,
        }
    }

    fn run_task_step(
        &self,
        driver: &mut ProcessDriver,
        step: &TaskStepConfig,
        inputs: &Map<String, Value>,
        steps: &BTreeMap<String, Value>,
    ) -> Result<Value, Halt> {
        let run_id = driver.run_id().to_string();
        let scope = TemplateScope {
            run_id: &run_id,
            inputs,
            steps,
        };
        let args =
            render_value(&step.args, &scope).map_err(|err| Halt::failed(&step.id, err.to_string()))?;

        let output = match driver.step_with_retry(
            &step.id,
            &step.task,
            args,
            step.retries.saturating_add(1),
        ) {
            Ok(output) => output,
            Err(err) => {
                return match step.on_error {
                    OnError::Abort => Err(Halt::failed(&step.id, err.to_string())),
                    OnError::Continue => {
                        driver.log(
                            LogLevel::Warn,
                            "step.continued",
                            &format!("step {} failed and was skipped: {err}", step.id),
                        );
                        if step.score.is_some() {
                            driver.skip_score(&step.id);
                        }
                        Ok(Value::Null)
                    }
                };
            }
        };

        if let Some(score) = &step.score {
            let points = output.number_field(&score.field).ok_or_else(|| {
                Halt::failed(
                    &step.id,
                    format!("result has no numeric `{}` field to score", score.field),
                )
            })?;
            driver.clear_score(&step.id);
            driver.score_weighted(&step.id, points, score.weight)?;
        }
        if let Some(gate) = &step.gate {
            let fail_on_critical = inputs.get(&gate.fail_flag).is_some_and(truthy);
            driver.gate_field(&step.id, &output, &gate.field, fail_on_critical)?;
        }
        Ok(output.value)
    }

    fn run_parallel_step(
        &self,
        driver: &mut ProcessDriver,
        group: &ParallelStepConfig,
        inputs: &Map<String, Value>,
        steps: &BTreeMap<String, Value>,
    ) -> Result<Value, Halt> {
        let run_id = driver.run_id().to_string();
        let scope = TemplateScope {
            run_id: &run_id,
            inputs,
            steps,
        };
        let mut members = Vec::with_capacity(group.members.len());
        for member in &group.members {
            let args = render_value(&member.args, &scope)
                .map_err(|err| Halt::failed(&group.id, err.to_string()))?;
            members.push(ParallelMember {
                task: member.task.clone(),
                args,
                key: member.key.clone(),
            });
        }

        let mut values = Vec::with_capacity(members.len());
        let mut failures = Vec::new();
        for (index, result) in driver.parallel(&group.id, members).into_iter().enumerate() {
            match result {
                Ok(output) => values.push(output.value),
                Err(err) => {
                    failures.push(format!("member {index}: {err}"));
                    values.push(Value::Null);
                }
            }
        }
        if group.require_all && !failures.is_empty() {
            return Err(Halt::failed(&group.id, failures.join("; ")));
        }
        Ok(Value::Array(values))
    }

    fn run_breakpoint_step(
        &self,
        driver: &mut ProcessDriver,
        breakpoint: &BreakpointStepConfig,
        inputs: &Map<String, Value>,
        steps: &BTreeMap<String, Value>,
    ) -> Result<Decision, Halt> {
        let run_id = driver.run_id().to_string();
        let scope = TemplateScope {
            run_id: &run_id,
            inputs,
            steps,
        };
        let render_failed = |err: TemplateError| {
            Halt::failed(&breakpoint.id, err.to_string())
        };
        let title = render_text(&breakpoint.title, &scope).map_err(render_failed)?;
        let question = render_text(&breakpoint.question, &scope).map_err(render_failed)?;
        let summary = render_value(&breakpoint.summary, &scope).map_err(render_failed)?;
        driver.breakpoint(&title, &question, summary)
    }
}

impl Process for DefinedProcess {
    fn id(&self) -> &str {
        &self.definition.id
    }

    fn execute(
        &self,
        driver: &mut ProcessDriver,
        inputs: &Map<String, Value>,
    ) -> Result<Map<String, Value>, Halt> {
        let inputs = self
            .prepare_inputs(inputs.clone())
            .map_err(|err| Halt::failed("inputs", err.to_string()))?;

        let mut scored = false;
        for step in &self.definition.steps {
            if let StepConfig::Task(task) = step {
                if task.score.is_some() {
                    driver.expect_score(&task.id);
                    scored = true;
                }
            }
        }

        let mut steps: BTreeMap<String, Value> = BTreeMap::new();
        let mut last_task_step: Option<usize> = None;
        let mut retries_left = MAX_BREAKPOINT_RETRIES;
        let mut index = 0;
        while index < self.definition.steps.len() {
            let step = &self.definition.steps[index];
            if let Some(condition) = step.when() {
                if !condition_holds(condition, &inputs) {
                    driver.skip(step.id());
                    steps.insert(step.id().to_string(), Value::Null);
                    index += 1;
                    continue;
                }
            }

            match step {
                StepConfig::Task(task) => {
                    let value = self.run_task_step(driver, task, &inputs, &steps)?;
                    steps.insert(task.id.clone(), value);
                    last_task_step = Some(index);
                }
                StepConfig::Parallel(group) => {
                    let value = self.run_parallel_step(driver, group, &inputs, &steps)?;
                    steps.insert(group.id.clone(), value);
                }
                StepConfig::Breakpoint(breakpoint) => {
                    let decision = self.run_breakpoint_step(driver, breakpoint, &inputs, &steps)?;
                    steps.insert(
                        breakpoint.id.clone(),
                        json!({ "decision": decision.as_str() }),
                    );
                    if decision == Decision::RetryPreviousStep {
                        match last_task_step {
                            Some(previous) if retries_left > 0 => {
                                retries_left -= 1;
                                driver.begin_retry_pass();
                                driver.log(
                                    LogLevel::Info,
                                    "step.retry_requested",
                                    &format!(
                                        "breakpoint {} sent the run back to step {}",
                                        breakpoint.id,
                                        self.definition.steps[previous].id()
                                    ),
                                );
                                index = previous;
                                continue;
                            }
                            Some(_) => {
                                return Err(Halt::failed(
                                    &breakpoint.id,
                                    format!(
                                        "retry requested more than {MAX_BREAKPOINT_RETRIES} times"
                                    ),
                                ))
                            }
                            None => {
                                return Err(Halt::failed(
                                    &breakpoint.id,
                                    "retry requested but no task step precedes this breakpoint",
                                ))
                            }
                        }
                    }
                }
            }
            index += 1;
        }

        let final_score = if scored {
            Some(driver.final_score()?)
        } else {
            None
        };

        let run_id = driver.run_id().to_string();
        let scope = TemplateScope {
            run_id: &run_id,
            inputs: &inputs,
            steps: &steps,
        };
        let mut outputs = Map::new();
        for (key, template) in &self.definition.result.outputs {
            let value =
                render_value(template, &scope).map_err(|err| Halt::failed("result", err.to_string()))?;
            outputs.insert(key.clone(), value);
        }
        let text = match &self.definition.result.summary {
            Some(template) => Some(
                render_text(template, &scope).map_err(|err| Halt::failed("result", err.to_string()))?,
            ),
            None => None,
        };
        let final_breakpoint_summary = match &self.definition.final_breakpoint {
            Some(config) => Some((
                render_text(&config.title, &scope)
                    .map_err(|err| Halt::failed("final_breakpoint", err.to_string()))?,
                render_text(&config.question, &scope)
                    .map_err(|err| Halt::failed("final_breakpoint", err.to_string()))?,
                render_value(&config.summary, &scope)
                    .map_err(|err| Halt::failed("final_breakpoint", err.to_string()))?,
            )),
            None => None,
        };

        let mut extra = Map::new();
        if let Some(text) = &text {
            extra.insert("text".to_string(), Value::String(text.clone()));
        }
        if let Some(score) = &final_score {
            outputs.insert("score".to_string(), Value::from(score.value));
            outputs.insert(
                "scoreDetail".to_string(),
                serde_json::to_value(score).unwrap_or(Value::Null),
            );
            extra.insert("score".to_string(), Value::from(score.value));
        }
        outputs.insert("summary".to_string(), driver.summary(&Value::Object(extra.clone())));

        if let Some((title, question, summary)) = final_breakpoint_summary {
            let mut merged = extra;
            if let Value::Object(fields) = summary {
                merged.extend(fields);
            }
            let decision = driver.breakpoint(&title, &question, Value::Object(merged))?;
            if decision == Decision::RetryPreviousStep {
                return Err(Halt::failed(
                    "final_breakpoint",
                    "retry is not available at the final breakpoint",
                ));
            }
        }
        Ok(outputs)
    }
}

fn condition_holds(condition: &Condition, inputs: &Map<String, Value>) -> bool {
    let value = inputs.get(&condition.input).unwrap_or(&Value::Null);
    let holds = match &condition.equals {
        Some(expected) => value == expected,
        None => truthy(value),
    };
    holds != condition.negate
}

use crate::config::{load_settings, ConfigError, RuntimeSettings};
use crate::orchestration::{registry_for_definition, DefinedProcess, ProcessRuntime};
use crate::provider::{CommandExecutor, NoAgentExecutor};
use crate::registry::TaskRegistry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Positional arguments plus `--flag value` options, in any order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedArgs {
    pub positional: Vec<String>,
    pub options: BTreeMap<String, String>,
}

impl ParsedArgs {
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }
}

pub fn parse_args(args: &[String], allowed: &[&str]) -> Result<ParsedArgs, String> {
    let mut parsed = ParsedArgs::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let Some(name) = arg.strip_prefix("--") else {
            parsed.positional.push(arg.clone());
            continue;
        };
        if name != "settings" && !allowed.contains(&name) {
            return Err(format!("unknown option `--{name}`"));
        }
        let value = iter
            .next()
            .ok_or_else(|| format!("option `--{name}` requires a value"))?;
        if parsed.options.insert(name.to_string(), value.clone()).is_some() {
            return Err(format!("option `--{name}` given more than once"));
        }
    }
    Ok(parsed)
}

pub fn map_config_err(err: ConfigError) -> String {
    err.to_string()
}

pub fn settings_for(parsed: &ParsedArgs) -> Result<RuntimeSettings, String> {
    let explicit = parsed.option("settings").map(PathBuf::from);
    load_settings(explicit.as_deref()).map_err(map_config_err)
}

pub fn load_process(path: &Path) -> Result<DefinedProcess, String> {
    DefinedProcess::from_path(path).map_err(map_config_err)
}

/// Runtime that executes `process` with the configured agent binary.
pub fn runtime_for_process(
    settings: RuntimeSettings,
    process: &DefinedProcess,
) -> Result<ProcessRuntime, String> {
    if !process.definition().native_tasks.is_empty() {
        return Err(format!(
            "process `{}` declares native tasks ({}); native tasks can only be supplied through the library API",
            process.definition().id,
            process.definition().native_tasks.join(", ")
        ));
    }
    let registry = registry_for_definition(process.definition(), Vec::new())
        .map_err(|err| err.to_string())?;
    let executor = CommandExecutor::from_settings(&settings.agent);
    Ok(ProcessRuntime::new(
        settings,
        registry.into_shared(),
        Arc::new(executor),
    ))
}

/// Runtime for commands that only read or annotate run state.
pub fn inspection_runtime(settings: RuntimeSettings) -> ProcessRuntime {
    ProcessRuntime::new(
        settings,
        TaskRegistry::new().into_shared(),
        Arc::new(NoAgentExecutor),
    )
}

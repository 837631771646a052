use super::ConfigError;
use crate::orchestration::score::ScorePolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SETTINGS_FILE: &str = "procflow.yaml";
pub const SETTINGS_ENV_VAR: &str = "PROCFLOW_SETTINGS";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RuntimeSettings {
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,
    #[serde(default)]
    pub effects: EffectSettings,
    #[serde(default)]
    pub breakpoints: BreakpointSettings,
    #[serde(default)]
    pub scoring: ScoringSettings,
    #[serde(default)]
    pub agent: AgentCommandSettings,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            state_root: default_state_root(),
            effects: EffectSettings::default(),
            breakpoints: BreakpointSettings::default(),
            scoring: ScoringSettings::default(),
            agent: AgentCommandSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct EffectSettings {
    #[serde(default = "default_effect_timeout_seconds")]
    pub default_timeout_seconds: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

impl Default for EffectSettings {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_effect_timeout_seconds(),
            max_parallel: default_max_parallel(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointMode {
    /// Poll the durable breakpoint record until a decision lands or the
    /// decision timeout expires (expiry fails closed).
    #[default]
    Block,
    /// Park the run in `waiting` and return; `resume` picks it up later.
    Detach,
    /// Resolve every breakpoint with `proceed`. Unattended pipelines only.
    AutoProceed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct BreakpointSettings {
    #[serde(default)]
    pub mode: BreakpointMode,
    #[serde(default = "default_decision_timeout_seconds")]
    pub decision_timeout_seconds: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for BreakpointSettings {
    fn default() -> Self {
        Self {
            mode: BreakpointMode::default(),
            decision_timeout_seconds: default_decision_timeout_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ScoringSettings {
    #[serde(default)]
    pub policy: ScorePolicy,
    #[serde(default = "default_score_max")]
    pub max: f64,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            policy: ScorePolicy::default(),
            max: default_score_max(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AgentCommandSettings {
    #[serde(default = "default_agent_binary")]
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for AgentCommandSettings {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            args: Vec::new(),
        }
    }
}

impl RuntimeSettings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut settings: Self =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        if settings.state_root.is_relative() {
            if let Some(parent) = path.parent() {
                settings.state_root = parent.join(&settings.state_root);
            }
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_root.as_os_str().is_empty() {
            return Err(ConfigError::Settings(
                "state_root must be non-empty".to_string(),
            ));
        }
        if self.effects.default_timeout_seconds == 0 {
            return Err(ConfigError::Settings(
                "effects.default_timeout_seconds must be greater than zero".to_string(),
            ));
        }
        if self.effects.max_parallel == 0 {
            return Err(ConfigError::Settings(
                "effects.max_parallel must be greater than zero".to_string(),
            ));
        }
        if self.breakpoints.decision_timeout_seconds == 0 {
            return Err(ConfigError::Settings(
                "breakpoints.decision_timeout_seconds must be greater than zero".to_string(),
            ));
        }
        if self.breakpoints.poll_interval_ms == 0 {
            return Err(ConfigError::Settings(
                "breakpoints.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if !self.scoring.max.is_finite() || self.scoring.max <= 0.0 {
            return Err(ConfigError::Settings(
                "scoring.max must be a positive number".to_string(),
            ));
        }
        if self.agent.binary.trim().is_empty() {
            return Err(ConfigError::Settings(
                "agent.binary must be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn effect_timeout(&self) -> Duration {
        Duration::from_secs(self.effects.default_timeout_seconds)
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_secs(self.breakpoints.decision_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.breakpoints.poll_interval_ms)
    }
}

fn default_state_root() -> PathBuf {
    PathBuf::from(".procflow")
}

fn default_effect_timeout_seconds() -> u64 {
    900
}

fn default_max_parallel() -> usize {
    4
}

fn default_decision_timeout_seconds() -> u64 {
    3600
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_score_max() -> f64 {
    100.0
}

fn default_agent_binary() -> String {
    "procflow-agent".to_string()
}

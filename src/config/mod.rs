pub mod error;
pub mod load;
pub mod process_file;
pub mod settings;

pub use error::ConfigError;
pub use load::{load_inputs_file, load_process_definition, load_settings, resolve_settings_path};
pub use process_file::{
    AgentTaskConfig, BreakpointConfig, BreakpointStepConfig, Condition, GateConfig, InputSpec,
    OnError, ParallelMemberConfig, ParallelStepConfig, ProcessDefinition, ResultConfig,
    ScoreConfig, StepConfig, TaskStepConfig,
};
pub use settings::{
    AgentCommandSettings, BreakpointMode, BreakpointSettings, EffectSettings, RuntimeSettings,
    ScoringSettings,
};

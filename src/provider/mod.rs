pub mod output_parse;
pub mod runner;
pub mod types;

pub use output_parse::parse_task_result;
pub use runner::{CommandExecutor, EFFECT_ID_ENV, RUN_ID_ENV, TASK_DIR_ENV};
pub use types::{AgentExecutor, AgentRequest, CancelFlag, ExecutorError, NoAgentExecutor};

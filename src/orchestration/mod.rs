pub mod artifact;
pub mod breakpoint;
pub mod declarative;
pub mod driver;
pub mod error;
pub mod lock;
pub mod parallel;
pub mod progress;
pub mod result;
pub mod run_context;
pub mod run_store;
pub mod runtime;
pub mod score;
pub mod template;

pub use artifact::{extract_artifacts, Artifact};
pub use breakpoint::{
    BreakpointContext, BreakpointController, BreakpointError, BreakpointRecord, BreakpointState,
    BreakpointStore, ChannelOutcome, Decision, DecisionChannel, DetachedDecisionChannel,
    FileDecisionChannel, Resolution, ReviewerDecision, StaticDecisionChannel,
};
pub use declarative::{registry_for_definition, DefinedProcess, MAX_BREAKPOINT_RETRIES};
pub use driver::{DriverParts, Halt, ParallelMember, Process, ProcessDriver, StepOutcome};
pub use error::OrchestratorError;
pub use lock::{is_process_alive, lock_owner, LockOwner, RunLock, RUN_LOCK_FILE};
pub use parallel::run_all;
pub use result::{ProcessResult, ResultMetadata};
pub use run_context::{RunContext, RunSnapshot};
pub use run_store::{ProcessRunRecord, ProcessRunStore, ProgressSnapshot, RunState};
pub use runtime::{decision_channel_for, ProcessRuntime, RunOutcome, RunStatus};
pub use score::{FinalScore, ScoreBoard, ScoreError, ScorePolicy, StepScore};
pub use template::{render_string, render_text, render_value, truthy, TemplateError, TemplateScope};

use crate::registry::AgentContract;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("agent executor unavailable: {0}")]
    Unavailable(String),
    #[error("agent executor failed: {reason}")]
    Failed { reason: String },
    #[error("agent executor timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("agent output parse failure: {reason}")]
    ParseFailure { reason: String },
}

/// Set by the invoker once it has stopped waiting for a dispatch.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One dispatch of an agent contract.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub run_id: String,
    pub effect_id: String,
    pub task: String,
    pub contract: AgentContract,
    pub timeout: Duration,
    /// Directory holding the effect's `input.json`/`result.json`.
    pub task_dir: PathBuf,
    pub cancel: CancelFlag,
}

/// Capability that performs `external_agent` work.
///
/// Implementations block until a value is produced or an error occurs. The
/// invoker enforces `request.timeout` on top of whatever the implementation
/// does, so a hung executor cannot stall a run. On expiry the invoker stops
/// listening and raises `request.cancel`; the call itself keeps running on a
/// detached thread until it returns, so long-running implementations should
/// poll the flag and give up once it is set.
pub trait AgentExecutor: Send + Sync {
    fn run(&self, request: &AgentRequest) -> Result<Value, ExecutorError>;
}

impl<F> AgentExecutor for F
where
    F: Fn(&AgentRequest) -> Result<Value, ExecutorError> + Send + Sync,
{
    fn run(&self, request: &AgentRequest) -> Result<Value, ExecutorError> {
        self(request)
    }
}

/// Executor for runs whose processes only use native tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAgentExecutor;

impl AgentExecutor for NoAgentExecutor {
    fn run(&self, request: &AgentRequest) -> Result<Value, ExecutorError> {
        Err(ExecutorError::Unavailable(format!(
            "no agent executor configured for task `{}`",
            request.task
        )))
    }
}

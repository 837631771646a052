use crate::orchestration::run_store::RunState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub run_id: String,
    pub process_id: String,
    pub state: RunState,
    #[serde(default)]
    pub input_count: usize,
    #[serde(default)]
    pub input_keys: Vec<String>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub effects_completed: u64,
    pub started_at: i64,
    pub updated_at: i64,
    pub last_progress_at: i64,
    pub summary: String,
    pub pending_human_input: bool,
    #[serde(default)]
    pub pending_breakpoint: Option<String>,
    pub next_expected_action: String,
}

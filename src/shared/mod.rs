pub mod fs_atomic;
pub mod ids;
pub mod logging;

pub use fs_atomic::{atomic_write_file, atomic_write_json};
pub use ids::{
    generate_run_id, validate_identifier_value, BreakpointId, EffectId, ProcessId, RunId, StepId,
    TaskName,
};
pub use logging::{read_run_log, run_log_path, LogLevel, RunLog};

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

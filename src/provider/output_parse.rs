use crate::provider::ExecutorError;
use serde_json::Value;

const OPEN_TAG: &str = "[task_result]";
const CLOSE_TAG: &str = "[/task_result]";

/// Parses agent stdout: a single `[task_result]...[/task_result]` envelope
/// when present, otherwise the whole output as one JSON document.
pub fn parse_task_result(stdout: &str) -> Result<Value, ExecutorError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(ExecutorError::ParseFailure {
            reason: "stdout was empty".to_string(),
        });
    }

    let Some(start) = trimmed.find(OPEN_TAG) else {
        return serde_json::from_str(trimmed).map_err(|err| ExecutorError::ParseFailure {
            reason: format!("stdout is not valid json: {err}"),
        });
    };
    let end = trimmed
        .find(CLOSE_TAG)
        .ok_or_else(|| ExecutorError::ParseFailure {
            reason: format!("missing {CLOSE_TAG} tag"),
        })?;
    if trimmed[start + OPEN_TAG.len()..].contains(OPEN_TAG) {
        return Err(ExecutorError::ParseFailure {
            reason: format!("multiple {OPEN_TAG} tags are not allowed"),
        });
    }
    if trimmed[end + CLOSE_TAG.len()..].contains(CLOSE_TAG) {
        return Err(ExecutorError::ParseFailure {
            reason: format!("multiple {CLOSE_TAG} tags are not allowed"),
        });
    }
    if end <= start {
        return Err(ExecutorError::ParseFailure {
            reason: "invalid task_result tag ordering".to_string(),
        });
    }
    let body = trimmed[start + OPEN_TAG.len()..end].trim();
    serde_json::from_str(body).map_err(|err| ExecutorError::ParseFailure {
        reason: format!("invalid json in task_result envelope: {err}"),
    })
}

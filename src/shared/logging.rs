use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn run_log_path(run_dir: &Path) -> PathBuf {
    run_dir.join("logs/run.log")
}

/// Append-only JSON-lines sink scoped to one run directory.
///
/// Each call opens the file in append mode and writes a single line, so
/// parallel group members can log concurrently without interleaving lines.
/// Write failures are swallowed: a broken log never fails a run.
#[derive(Debug, Clone)]
pub struct RunLog {
    run_id: String,
    path: PathBuf,
}

impl RunLog {
    pub fn new(run_id: impl Into<String>, run_dir: &Path) -> Self {
        Self {
            run_id: run_id.into(),
            path: run_log_path(run_dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, level: LogLevel, event: &str, message: &str) {
        let payload = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "level": level.as_str(),
            "event": event,
            "runId": self.run_id,
            "message": message,
        });

        let Ok(line) = serde_json::to_string(&payload) else {
            return;
        };

        if let Some(parent) = self.path.parent() {
            if fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let Ok(mut file) = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        else {
            return;
        };
        let _ = writeln!(file, "{line}");
    }

    pub fn info(&self, event: &str, message: &str) {
        self.append(LogLevel::Info, event, message);
    }

    pub fn warn(&self, event: &str, message: &str) {
        self.append(LogLevel::Warn, event, message);
    }

    pub fn error(&self, event: &str, message: &str) {
        self.append(LogLevel::Error, event, message);
    }
}

/// Reads back every well-formed line of a run log.
pub fn read_run_log(run_dir: &Path) -> std::io::Result<Vec<serde_json::Value>> {
    let raw = match fs::read_to_string(run_log_path(run_dir)) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

use crate::config::AgentCommandSettings;
use crate::provider::output_parse::parse_task_result;
use crate::provider::{AgentExecutor, AgentRequest, ExecutorError};
use serde_json::Value;
use std::io::{BufReader, Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

pub const EFFECT_ID_ENV: &str = "PROCFLOW_EFFECT_ID";
pub const TASK_DIR_ENV: &str = "PROCFLOW_TASK_DIR";
pub const RUN_ID_ENV: &str = "PROCFLOW_RUN_ID";

/// Runs an agent binary per effect: the contract goes in on stdin, the
/// result comes back on stdout.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    binary: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(binary: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            args,
        }
    }

    pub fn from_settings(settings: &AgentCommandSettings) -> Self {
        Self::new(settings.binary.clone(), settings.args.clone())
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }
}

impl AgentExecutor for CommandExecutor {
    fn run(&self, request: &AgentRequest) -> Result<Value, ExecutorError> {
        let payload = serde_json::to_vec(&request.contract).map_err(|err| ExecutorError::Failed {
            reason: format!("failed to encode contract: {err}"),
        })?;

        let mut command = Command::new(&self.binary);
        command
            .args(&self.args)
            .env(EFFECT_ID_ENV, &request.effect_id)
            .env(RUN_ID_ENV, &request.run_id)
            .env(TASK_DIR_ENV, &request.task_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if request.task_dir.is_dir() {
            command.current_dir(&request.task_dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExecutorError::Unavailable(format!(
                    "agent binary `{}` not found",
                    self.binary
                )))
            }
            Err(err) => {
                return Err(ExecutorError::Failed {
                    reason: format!("failed to spawn `{}`: {err}", self.binary),
                })
            }
        };

        // A binary that exits without reading stdin is judged by its exit code.
        let stdin_writer = child.stdin.take().map(|mut stdin| {
            thread::spawn(move || {
                let _ = stdin.write_all(&payload);
            })
        });

        let stdout = child.stdout.take().ok_or_else(|| ExecutorError::Failed {
            reason: "missing stdout pipe".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ExecutorError::Failed {
            reason: "missing stderr pipe".to_string(),
        })?;

        let stdout_reader = thread::spawn(move || {
            let mut buf = String::new();
            let mut reader = BufReader::new(stdout);
            let _ = reader.read_to_string(&mut buf);
            buf
        });
        let stderr_reader = thread::spawn(move || {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_string(&mut buf);
            buf
        });

        let start = Instant::now();
        let exit_status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if start.elapsed() > request.timeout || request.cancel.is_cancelled() {
                        let _ = child.kill();
                        let _ = child.wait();
                        // Grandchildren may still hold the pipes; leave the readers detached.
                        return Err(ExecutorError::Timeout {
                            timeout_ms: request.timeout.as_millis() as u64,
                        });
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) => {
                    return Err(ExecutorError::Failed {
                        reason: format!("failed to wait for `{}`: {err}", self.binary),
                    })
                }
            }
        };

        if let Some(writer) = stdin_writer {
            let _ = writer.join();
        }
        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        if !exit_status.success() {
            return Err(ExecutorError::Failed {
                reason: format!(
                    "`{}` exited with code {}: {}",
                    self.binary,
                    exit_status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            });
        }

        parse_task_result(&stdout)
    }
}

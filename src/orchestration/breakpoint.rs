//! Human checkpoints: durable records plus the decision channel abstraction.
//!
//! A breakpoint moves `raised -> awaiting_decision -> resolved` and every
//! transition is written to `breakpoints/<id>.json` before anything else
//! happens. A record found already resolved replays its decision, which is
//! what makes a killed run resumable from its last unresolved breakpoint.

use crate::orchestration::artifact::Artifact;
use crate::shared::{atomic_write_json, now_rfc3339, BreakpointId, RunLog};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::orchestration::lock::{lock_owner, LockOwner};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const RECORD_LOCK_WAIT: Duration = Duration::from_secs(5);
const RECORD_LOCK_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Proceed,
    Abort,
    RetryPreviousStep,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proceed => "proceed",
            Self::Abort => "abort",
            Self::RetryPreviousStep => "retry_previous_step",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = BreakpointError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "proceed" | "approve" => Ok(Self::Proceed),
            "abort" | "reject" => Ok(Self::Abort),
            "retry" | "retry_previous_step" | "retry-previous-step" => Ok(Self::RetryPreviousStep),
            _ => Err(BreakpointError::InvalidDecision(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointState {
    Raised,
    AwaitingDecision,
    Resolved,
}

impl BreakpointState {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (BreakpointState::Raised, BreakpointState::AwaitingDecision)
                | (BreakpointState::AwaitingDecision, BreakpointState::Resolved)
        )
    }
}

impl std::fmt::Display for BreakpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakpointState::Raised => write!(f, "raised"),
            BreakpointState::AwaitingDecision => write!(f, "awaiting_decision"),
            BreakpointState::Resolved => write!(f, "resolved"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakpointError {
    #[error("breakpoint `{breakpoint_id}` unresolved: {reason}")]
    Unresolved {
        breakpoint_id: String,
        reason: String,
    },
    #[error("invalid decision `{0}`; expected proceed, abort or retry")]
    InvalidDecision(String),
    #[error("breakpoint `{breakpoint_id}` not found")]
    UnknownBreakpoint { breakpoint_id: String },
    #[error("breakpoint `{breakpoint_id}` already has decision `{decision}`")]
    AlreadyDecided {
        breakpoint_id: String,
        decision: Decision,
    },
    #[error("breakpoint `{breakpoint_id}` transition `{from}` -> `{to}` is invalid")]
    InvalidTransition {
        breakpoint_id: String,
        from: BreakpointState,
        to: BreakpointState,
    },
    #[error("breakpoint `{breakpoint_id}` is being updated by another writer ({path})")]
    Busy { breakpoint_id: String, path: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// What the reviewer is shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointContext {
    pub run_id: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub summary: Value,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointRecord {
    pub breakpoint_id: String,
    pub run_id: String,
    pub title: String,
    pub question: String,
    pub context: BreakpointContext,
    pub state: BreakpointState,
    pub raised_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub decided_at: Option<String>,
    #[serde(default)]
    pub fail_closed_reason: Option<String>,
}

impl BreakpointRecord {
    fn advance(&mut self, next: BreakpointState) -> Result<(), BreakpointError> {
        if !self.state.can_transition_to(next) {
            return Err(BreakpointError::InvalidTransition {
                breakpoint_id: self.breakpoint_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = now_rfc3339();
        Ok(())
    }
}

/// A reviewer's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewerDecision {
    pub decision: Decision,
    pub note: Option<String>,
    pub decided_by: Option<String>,
}

impl ReviewerDecision {
    pub fn new(decision: Decision) -> Self {
        Self {
            decision,
            note: None,
            decided_by: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_decided_by(mut self, decided_by: impl Into<String>) -> Self {
        self.decided_by = Some(decided_by.into());
        self
    }
}

/// `breakpoints/` directory of one run.
#[derive(Debug, Clone)]
pub struct BreakpointStore {
    root: PathBuf,
}

impl BreakpointStore {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            root: run_dir.join("breakpoints"),
        }
    }

    pub fn path(&self, breakpoint_id: &str) -> PathBuf {
        self.root.join(format!("{breakpoint_id}.json"))
    }

    fn lock_path(&self, breakpoint_id: &str) -> PathBuf {
        self.root.join(format!("{breakpoint_id}.lock"))
    }

    /// Runs `update` while holding `breakpoints/<id>.lock`, so the run and a
    /// `decide` call never interleave their read-modify-write of one record.
    pub fn with_record_lock<T>(
        &self,
        breakpoint_id: &str,
        update: impl FnOnce(&Self) -> Result<T, BreakpointError>,
    ) -> Result<T, BreakpointError> {
        fs::create_dir_all(&self.root).map_err(|source| io_error(&self.root, source))?;
        let path = self.lock_path(breakpoint_id);
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "pid={}", std::process::id());
                    break;
                }
                Err(source) if source.kind() == ErrorKind::AlreadyExists => {
                    let owner = lock_owner(&path).map_err(|err| BreakpointError::Busy {
                        breakpoint_id: breakpoint_id.to_string(),
                        path: err.to_string(),
                    })?;
                    if let LockOwner::Stale { pid: Some(_) } = owner {
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() >= RECORD_LOCK_WAIT {
                        return Err(BreakpointError::Busy {
                            breakpoint_id: breakpoint_id.to_string(),
                            path: path.display().to_string(),
                        });
                    }
                    thread::sleep(RECORD_LOCK_POLL);
                }
                Err(source) => return Err(io_error(&path, source)),
            }
        }
        let result = update(self);
        let _ = fs::remove_file(&path);
        result
    }

    pub fn load_optional(
        &self,
        breakpoint_id: &str,
    ) -> Result<Option<BreakpointRecord>, BreakpointError> {
        let path = self.path(breakpoint_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(io_error(&path, source)),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| BreakpointError::Json {
                path: path.display().to_string(),
                source,
            })
    }

    pub fn load(&self, breakpoint_id: &str) -> Result<BreakpointRecord, BreakpointError> {
        self.load_optional(breakpoint_id)?
            .ok_or_else(|| BreakpointError::UnknownBreakpoint {
                breakpoint_id: breakpoint_id.to_string(),
            })
    }

    pub fn persist(&self, record: &BreakpointRecord) -> Result<(), BreakpointError> {
        let path = self.path(&record.breakpoint_id);
        atomic_write_json(&path, record).map_err(|source| io_error(&path, source))
    }

    /// All records, ordered by breakpoint id.
    pub fn list(&self) -> Result<Vec<BreakpointRecord>, BreakpointError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(&self.root, source)),
        };
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| io_error(&self.root, source))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if let Some(record) = self.load_optional(stem)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.breakpoint_id.cmp(&b.breakpoint_id));
        Ok(records)
    }

    /// Writes a reviewer decision onto an awaiting breakpoint. The owning run
    /// resolves the record when it next observes it.
    pub fn record_decision(
        &self,
        breakpoint_id: &str,
        decision: &ReviewerDecision,
    ) -> Result<BreakpointRecord, BreakpointError> {
        // Unknown ids must not leave a sidecar lock behind.
        self.load(breakpoint_id)?;
        self.with_record_lock(breakpoint_id, |store| {
            let mut record = store.load(breakpoint_id)?;
            if let Some(existing) = record.decision {
                return Err(BreakpointError::AlreadyDecided {
                    breakpoint_id: breakpoint_id.to_string(),
                    decision: existing,
                });
            }
            if record.state != BreakpointState::AwaitingDecision {
                return Err(BreakpointError::InvalidTransition {
                    breakpoint_id: breakpoint_id.to_string(),
                    from: record.state,
                    to: BreakpointState::Resolved,
                });
            }
            let now = now_rfc3339();
            record.decision = Some(decision.decision);
            record.note = decision.note.clone();
            record.decided_by = decision.decided_by.clone();
            record.decided_at = Some(now.clone());
            record.updated_at = now;
            store.persist(&record)?;
            Ok(record)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    Decided(ReviewerDecision),
    /// No answer yet; park the run and pick it up on resume.
    Deferred,
}

/// Where decisions come from.
///
/// An `Err` means the channel could not produce an answer at all; the
/// controller turns that into an `abort`.
pub trait DecisionChannel: Send + Sync {
    fn await_decision(
        &self,
        record: &BreakpointRecord,
        store: &BreakpointStore,
    ) -> Result<ChannelOutcome, BreakpointError>;
}

impl<F> DecisionChannel for F
where
    F: Fn(&BreakpointRecord) -> Result<ChannelOutcome, BreakpointError> + Send + Sync,
{
    fn await_decision(
        &self,
        record: &BreakpointRecord,
        _store: &BreakpointStore,
    ) -> Result<ChannelOutcome, BreakpointError> {
        self(record)
    }
}

/// Polls the durable record until `decide` writes a decision onto it.
#[derive(Debug, Clone, Copy)]
pub struct FileDecisionChannel {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl FileDecisionChannel {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }
}

impl DecisionChannel for FileDecisionChannel {
    fn await_decision(
        &self,
        record: &BreakpointRecord,
        store: &BreakpointStore,
    ) -> Result<ChannelOutcome, BreakpointError> {
        let started = Instant::now();
        loop {
            let current = store.load(&record.breakpoint_id)?;
            if let Some(decision) = current.decision {
                return Ok(ChannelOutcome::Decided(ReviewerDecision {
                    decision,
                    note: current.note,
                    decided_by: current.decided_by,
                }));
            }
            if started.elapsed() >= self.timeout {
                return Err(BreakpointError::Unresolved {
                    breakpoint_id: record.breakpoint_id.clone(),
                    reason: format!("no decision within {}s", self.timeout.as_secs()),
                });
            }
            thread::sleep(self.poll_interval);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedDecisionChannel;

impl DecisionChannel for DetachedDecisionChannel {
    fn await_decision(
        &self,
        _record: &BreakpointRecord,
        _store: &BreakpointStore,
    ) -> Result<ChannelOutcome, BreakpointError> {
        Ok(ChannelOutcome::Deferred)
    }
}

/// Answers every breakpoint with the same decision.
#[derive(Debug, Clone, Copy)]
pub struct StaticDecisionChannel {
    pub decision: Decision,
}

impl StaticDecisionChannel {
    pub fn new(decision: Decision) -> Self {
        Self { decision }
    }
}

impl DecisionChannel for StaticDecisionChannel {
    fn await_decision(
        &self,
        _record: &BreakpointRecord,
        _store: &BreakpointStore,
    ) -> Result<ChannelOutcome, BreakpointError> {
        Ok(ChannelOutcome::Decided(
            ReviewerDecision::new(self.decision).with_decided_by("static"),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Decided {
        decision: Decision,
        note: Option<String>,
        fail_closed_reason: Option<String>,
    },
    Suspended {
        breakpoint_id: String,
    },
}

pub struct BreakpointController {
    store: BreakpointStore,
    channel: Arc<dyn DecisionChannel>,
    log: RunLog,
}

impl std::fmt::Debug for BreakpointController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakpointController")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl BreakpointController {
    pub fn new(run_dir: &Path, channel: Arc<dyn DecisionChannel>, log: RunLog) -> Self {
        Self {
            store: BreakpointStore::new(run_dir),
            channel,
            log,
        }
    }

    pub fn store(&self) -> &BreakpointStore {
        &self.store
    }

    pub fn raise(
        &self,
        breakpoint_id: &BreakpointId,
        title: &str,
        question: &str,
        context: BreakpointContext,
    ) -> Result<Resolution, BreakpointError> {
        let mut record = match self.store.load_optional(breakpoint_id.as_str())? {
            Some(existing) if existing.state == BreakpointState::Resolved => {
                let decision = existing.decision.unwrap_or(Decision::Abort);
                self.log.info(
                    "breakpoint.replayed",
                    &format!("breakpoint {breakpoint_id} replayed decision {decision}"),
                );
                return Ok(Resolution::Decided {
                    decision,
                    note: existing.note,
                    fail_closed_reason: existing.fail_closed_reason,
                });
            }
            Some(mut existing) => {
                if existing.state == BreakpointState::Raised {
                    existing.advance(BreakpointState::AwaitingDecision)?;
                    self.store.persist(&existing)?;
                }
                existing
            }
            None => self.open(breakpoint_id, title, question, context)?,
        };

        if let Some(decision) = record.decision {
            let reviewer = ReviewerDecision {
                decision,
                note: record.note.clone(),
                decided_by: record.decided_by.clone(),
            };
            return self.resolve(&mut record, reviewer, None);
        }

        match self.channel.await_decision(&record, &self.store) {
            Ok(ChannelOutcome::Decided(reviewer)) => self.resolve(&mut record, reviewer, None),
            Ok(ChannelOutcome::Deferred) => {
                self.log.info(
                    "breakpoint.deferred",
                    &format!("breakpoint {breakpoint_id} awaiting a decision; run parked"),
                );
                Ok(Resolution::Suspended {
                    breakpoint_id: breakpoint_id.to_string(),
                })
            }
            Err(err @ (BreakpointError::Io { .. } | BreakpointError::Json { .. })) => Err(err),
            Err(err) => self.resolve(
                &mut record,
                ReviewerDecision::new(Decision::Abort).with_decided_by("fail_closed"),
                Some(err.to_string()),
            ),
        }
    }

    fn open(
        &self,
        breakpoint_id: &BreakpointId,
        title: &str,
        question: &str,
        context: BreakpointContext,
    ) -> Result<BreakpointRecord, BreakpointError> {
        let now = now_rfc3339();
        let mut record = BreakpointRecord {
            breakpoint_id: breakpoint_id.to_string(),
            run_id: context.run_id.clone(),
            title: title.to_string(),
            question: question.to_string(),
            context,
            state: BreakpointState::Raised,
            raised_at: now.clone(),
            updated_at: now,
            decision: None,
            note: None,
            decided_by: None,
            decided_at: None,
            fail_closed_reason: None,
        };
        self.store.persist(&record)?;
        self.log.info(
            "breakpoint.raised",
            &format!("breakpoint {breakpoint_id}: {title}"),
        );
        record.advance(BreakpointState::AwaitingDecision)?;
        self.store.persist(&record)?;
        Ok(record)
    }

    /// Resolves under the record lock. A decision already written by
    /// `decide` wins over the channel's answer, a fail-closed abort included.
    fn resolve(
        &self,
        record: &mut BreakpointRecord,
        reviewer: ReviewerDecision,
        fail_closed_reason: Option<String>,
    ) -> Result<Resolution, BreakpointError> {
        let breakpoint_id = record.breakpoint_id.clone();
        self.store.with_record_lock(&breakpoint_id, |store| {
            if let Some(latest) = store.load_optional(&breakpoint_id)? {
                *record = latest;
            }
            if record.state == BreakpointState::Resolved {
                return Ok(Resolution::Decided {
                    decision: record.decision.unwrap_or(Decision::Abort),
                    note: record.note.clone(),
                    fail_closed_reason: record.fail_closed_reason.clone(),
                });
            }
            match record.decision {
                Some(decision) => {
                    let recorded = ReviewerDecision {
                        decision,
                        note: record.note.clone(),
                        decided_by: record.decided_by.clone(),
                    };
                    self.write_resolution(record, recorded, None)
                }
                None => self.write_resolution(record, reviewer, fail_closed_reason),
            }
        })
    }

    fn write_resolution(
        &self,
        record: &mut BreakpointRecord,
        reviewer: ReviewerDecision,
        fail_closed_reason: Option<String>,
    ) -> Result<Resolution, BreakpointError> {
        if let Some(reason) = &fail_closed_reason {
            self.log.warn(
                "breakpoint.fail_closed",
                &format!(
                    "breakpoint {} resolved as abort: {reason}",
                    record.breakpoint_id
                ),
            );
        }
        record.advance(BreakpointState::Resolved)?;
        if record.decided_at.is_none() {
            record.decided_at = Some(record.updated_at.clone());
        }
        record.decision = Some(reviewer.decision);
        record.note = reviewer.note.clone();
        record.decided_by = reviewer.decided_by;
        record.fail_closed_reason = fail_closed_reason.clone();
        self.store.persist(record)?;
        self.log.info(
            "breakpoint.resolved",
            &format!(
                "breakpoint {} resolved with {}",
                record.breakpoint_id, reviewer.decision
            ),
        );
        Ok(Resolution::Decided {
            decision: reviewer.decision,
            note: reviewer.note,
            fail_closed_reason,
        })
    }
}

fn io_error(path: &Path, source: std::io::Error) -> BreakpointError {
    BreakpointError::Io {
        path: path.display().to_string(),
        source,
    }
}

use crate::orchestration::artifact::Artifact;
use crate::orchestration::score::{FinalScore, ScoreBoard, ScoreError, ScorePolicy};
use crate::shared::{BreakpointId, EffectId, LogLevel, RunId, RunLog, TaskName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Metrics a reviewer or final result sees about the run so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: String,
    pub artifact_count: usize,
    pub files: Vec<String>,
    pub running_score: f64,
    pub effects_issued: u64,
    pub elapsed_ms: u64,
}

/// Process-wide state of exactly one run.
///
/// Owned by the driver thread. Parallel members never touch it directly; the
/// driver appends their artifacts after the join, in input order.
#[derive(Debug)]
pub struct RunContext {
    run_id: RunId,
    run_dir: PathBuf,
    started_at: DateTime<Utc>,
    clock: Instant,
    log: RunLog,
    artifacts: Vec<Artifact>,
    score: ScoreBoard,
    effect_sequence: u64,
    breakpoint_sequence: u64,
}

impl RunContext {
    pub fn new(run_id: RunId, run_dir: &Path, policy: ScorePolicy, score_max: f64) -> Self {
        let log = RunLog::new(run_id.as_str(), run_dir);
        Self {
            run_id,
            run_dir: run_dir.to_path_buf(),
            started_at: Utc::now(),
            clock: Instant::now(),
            log,
            artifacts: Vec::new(),
            score: ScoreBoard::new(policy, score_max),
            effect_sequence: 0,
            breakpoint_sequence: 0,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Wall-clock time derived from the run start and a monotonic offset, so
    /// successive calls never go backwards within a run.
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.started_at + elapsed
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    pub fn log(&self, level: LogLevel, event: &str, message: &str) {
        self.log.append(level, event, message);
    }

    pub fn log_sink(&self) -> &RunLog {
        &self.log
    }

    pub fn next_effect_id(&mut self, task: &TaskName) -> EffectId {
        self.effect_sequence += 1;
        EffectId::from_sequence(task, self.effect_sequence)
    }

    pub fn next_breakpoint_id(&mut self) -> BreakpointId {
        self.breakpoint_sequence += 1;
        BreakpointId::from_sequence(self.breakpoint_sequence)
    }

    pub fn effects_issued(&self) -> u64 {
        self.effect_sequence
    }

    pub fn breakpoints_raised(&self) -> u64 {
        self.breakpoint_sequence
    }

    pub fn append(&mut self, artifacts: impl IntoIterator<Item = Artifact>) {
        self.artifacts.extend(artifacts);
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn expect_score(&mut self, step: &str) {
        self.score.expect(step);
    }

    pub fn add_score(&mut self, step: &str, delta: f64) -> Result<(), ScoreError> {
        self.score.add(step, delta)
    }

    pub fn add_weighted_score(
        &mut self,
        step: &str,
        points: f64,
        weight: f64,
    ) -> Result<(), ScoreError> {
        self.score.add_weighted(step, points, weight)
    }

    pub fn skip_score(&mut self, step: &str) {
        self.score.skip(step);
    }

    pub fn clear_score(&mut self, step: &str) {
        self.score.clear(step);
    }

    pub fn running_score(&self) -> f64 {
        self.score.running_total()
    }

    pub fn score_policy(&self) -> ScorePolicy {
        self.score.policy()
    }

    pub fn final_score(&self) -> Result<FinalScore, ScoreError> {
        self.score.finalize()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id.to_string(),
            artifact_count: self.artifacts.len(),
            files: self
                .artifacts
                .iter()
                .map(|artifact| artifact.path.clone())
                .collect(),
            running_score: self.running_score(),
            effects_issued: self.effect_sequence,
            elapsed_ms: self.elapsed().as_millis() as u64,
        }
    }

    /// Snapshot merged with caller-supplied summary fields; caller keys win.
    pub fn summary_with(&self, extra: &Value) -> Value {
        let mut summary = Map::new();
        summary.insert("artifactCount".to_string(), Value::from(self.artifacts.len()));
        summary.insert("runningScore".to_string(), Value::from(self.running_score()));
        summary.insert(
            "effectsIssued".to_string(),
            Value::from(self.effect_sequence),
        );
        if let Value::Object(extra) = extra {
            for (key, value) in extra {
                summary.insert(key.clone(), value.clone());
            }
        }
        Value::Object(summary)
    }
}

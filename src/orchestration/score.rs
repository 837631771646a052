use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorePolicy {
    /// Sum every contribution, clamp once at finalization.
    #[default]
    Additive,
    /// Weighted mean over the steps that actually reported.
    Normalized,
}

impl ScorePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Additive => "additive",
            Self::Normalized => "normalized",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScoreError {
    #[error("score cannot be finalized; steps still pending: {}", pending.join(", "))]
    Pending { pending: Vec<String> },
    #[error("score contribution for step `{step}` is not a finite number")]
    NotFinite { step: String },
    #[error("step `{step}` was already skipped and cannot contribute a score")]
    AlreadySkipped { step: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepScore {
    pub points: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalScore {
    pub value: u32,
    pub raw: f64,
    pub max: f64,
    pub policy: ScorePolicy,
    pub contributors: Vec<String>,
    pub skipped: Vec<String>,
}

/// Run-scoped score accumulator.
///
/// Contributions are plain sums per step, so parallel members may report in
/// any order. Nothing is clamped until [`ScoreBoard::finalize`], which also
/// refuses to run while an expected step has neither reported nor been
/// skipped.
#[derive(Debug, Clone)]
pub struct ScoreBoard {
    policy: ScorePolicy,
    max: f64,
    expected: BTreeSet<String>,
    entries: BTreeMap<String, StepScore>,
    skipped: BTreeSet<String>,
}

impl ScoreBoard {
    pub fn new(policy: ScorePolicy, max: f64) -> Self {
        Self {
            policy,
            max,
            expected: BTreeSet::new(),
            entries: BTreeMap::new(),
            skipped: BTreeSet::new(),
        }
    }

    pub fn policy(&self) -> ScorePolicy {
        self.policy
    }

    pub fn expect(&mut self, step: &str) {
        self.expected.insert(step.to_string());
    }

    pub fn add(&mut self, step: &str, delta: f64) -> Result<(), ScoreError> {
        self.add_weighted(step, delta, 1.0)
    }

    /// Adds `points` for `step`. Under the normalized policy the weight of
    /// the step is the largest weight it reported with.
    pub fn add_weighted(&mut self, step: &str, points: f64, weight: f64) -> Result<(), ScoreError> {
        if !points.is_finite() || !weight.is_finite() {
            return Err(ScoreError::NotFinite {
                step: step.to_string(),
            });
        }
        if self.skipped.contains(step) {
            return Err(ScoreError::AlreadySkipped {
                step: step.to_string(),
            });
        }
        let entry = self.entries.entry(step.to_string()).or_insert(StepScore {
            points: 0.0,
            weight: 0.0,
        });
        entry.points += points;
        entry.weight = entry.weight.max(weight);
        Ok(())
    }

    /// Marks `step` as explicitly absent. Any earlier contribution is kept out
    /// of the total.
    pub fn skip(&mut self, step: &str) {
        self.entries.remove(step);
        self.skipped.insert(step.to_string());
    }

    /// Forgets what `step` reported, including an earlier skip, so a re-run
    /// can report afresh.
    pub fn clear(&mut self, step: &str) {
        self.entries.remove(step);
        self.skipped.remove(step);
    }

    pub fn running_total(&self) -> f64 {
        self.entries.values().map(|score| score.points).sum()
    }

    pub fn pending(&self) -> Vec<String> {
        self.expected
            .iter()
            .filter(|step| !self.entries.contains_key(*step) && !self.skipped.contains(*step))
            .cloned()
            .collect()
    }

    pub fn finalize(&self) -> Result<FinalScore, ScoreError> {
        let pending = self.pending();
        if !pending.is_empty() {
            return Err(ScoreError::Pending { pending });
        }

        let raw = match self.policy {
            ScorePolicy::Additive => self.running_total(),
            ScorePolicy::Normalized => {
                let total_weight: f64 = self.entries.values().map(|score| score.weight).sum();
                if total_weight <= 0.0 {
                    0.0
                } else {
                    self.entries
                        .values()
                        .map(|score| score.points * score.weight)
                        .sum::<f64>()
                        / total_weight
                }
            }
        };
        let value = raw.round().clamp(0.0, self.max) as u32;

        Ok(FinalScore {
            value,
            raw,
            max: self.max,
            policy: self.policy,
            contributors: self.entries.keys().cloned().collect(),
            skipped: self.skipped.iter().cloned().collect(),
        })
    }
}

use std::collections::HashSet;
use std::fmt;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

use super::entities::extract_entities;

/// One evaluated sequence: tokens with aligned gold and predicted tags.
///
/// `length` counts the real positions; anything after it is padding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub tokens: Vec<String>,
    pub gold: Vec<String>,
    pub predicted: Vec<String>,
    pub length: usize,
}

impl SequenceRecord {
    pub fn new(tokens: Vec<String>, gold: Vec<String>, predicted: Vec<String>) -> Self {
        let length = tokens.len();
        Self {
            tokens,
            gold,
            predicted,
            length,
        }
    }
}

/// Precision, recall and F1, each in `[0, 100]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub p: f64,
    pub r: f64,
    pub f: f64,
}

impl fmt::Display for Scores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P: {:.2} R: {:.2} F: {:.2}", self.p, self.r, self.f)
    }
}

/// Micro-averaged entity counts over an evaluation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringAccumulator {
    pub predicted_count: usize,
    pub gold_count: usize,
    pub correct_count: usize,
}

impl ScoringAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the entity counts of one sequence.
    pub fn add_record(&mut self, record: &SequenceRecord) {
        let predicted: HashSet<_> = extract_entities(&record.predicted, record.length)
            .into_iter()
            .collect();
        let gold: HashSet<_> = extract_entities(&record.gold, record.length)
            .into_iter()
            .collect();

        self.correct_count += predicted.intersection(&gold).count();
        self.predicted_count += predicted.len();
        self.gold_count += gold.len();
    }

    /// Derive precision, recall and F1 from the summed counts.
    pub fn finalize(&self) -> Scores {
        let precision = if self.predicted_count > 0 {
            100.0 * self.correct_count as f64 / self.predicted_count as f64
        } else {
            0.0
        };
        let recall = if self.gold_count > 0 {
            100.0 * self.correct_count as f64 / self.gold_count as f64
        } else {
            0.0
        };
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Scores {
            p: precision,
            r: recall,
            f: f1,
        }
    }
}

impl AddAssign for ScoringAccumulator {
    fn add_assign(&mut self, rhs: Self) {
        self.predicted_count += rhs.predicted_count;
        self.gold_count += rhs.gold_count;
        self.correct_count += rhs.correct_count;
    }
}

/// Accumulate entity counts over every record of a pass.
pub fn score_pass<'a, I>(records: I) -> ScoringAccumulator
where
    I: IntoIterator<Item = &'a SequenceRecord>,
{
    let mut acc = ScoringAccumulator::new();
    for record in records {
        acc.add_record(record);
    }
    acc
}

/// Convenience wrapper for [`ScoringAccumulator::finalize`].
pub fn finalize(acc: &ScoringAccumulator) -> Scores {
    acc.finalize()
}

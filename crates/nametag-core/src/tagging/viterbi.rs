//! # Viterbi Decoding for CRF
//!
//! Implements the Viterbi algorithm for finding the most likely tag sequence
//! given emission scores and a transition matrix.

use crate::error::{NametagError, Result};

/// Viterbi decoder for CRF tag sequences.
#[derive(Debug, Clone)]
pub struct ViterbiDecoder {
    num_tags: usize,
}

/// Path score and backpointer for Viterbi decoding.
#[derive(Debug, Clone, Copy)]
struct PathState {
    score: f32,
    prev_tag: Option<usize>,
}

impl ViterbiDecoder {
    /// Create a new Viterbi decoder.
    ///
    /// # Arguments
    /// * `num_tags` - Number of distinct labels
    pub fn new(num_tags: usize) -> Self {
        Self { num_tags }
    }

    /// Decode the optimal tag sequence.
    ///
    /// # Arguments
    /// * `emission_scores` - Matrix of shape [seq_len, num_tags]
    /// * `transition_matrix` - Matrix of shape [num_tags, num_tags], indexed `[from][to]`
    ///
    /// # Returns
    /// The optimal tag sequence as indices.
    pub fn decode(
        &self,
        emission_scores: &[Vec<f32>],
        transition_matrix: &[Vec<f32>],
    ) -> Result<Vec<usize>> {
        let seq_len = emission_scores.len();
        if seq_len == 0 {
            return Ok(Vec::new());
        }

        if let Some(row) = emission_scores.iter().find(|row| row.len() != self.num_tags) {
            return Err(NametagError::DimensionMismatch {
                expected: self.num_tags,
                actual: row.len(),
            });
        }
        if transition_matrix.len() != self.num_tags {
            return Err(NametagError::DimensionMismatch {
                expected: self.num_tags,
                actual: transition_matrix.len(),
            });
        }
        if let Some(row) = transition_matrix.iter().find(|row| row.len() != self.num_tags) {
            return Err(NametagError::DimensionMismatch {
                expected: self.num_tags,
                actual: row.len(),
            });
        }

        let mut dp = vec![
            vec![
                PathState {
                    score: f32::NEG_INFINITY,
                    prev_tag: None,
                };
                self.num_tags
            ];
            seq_len
        ];

        for tag in 0..self.num_tags {
            dp[0][tag].score = emission_scores[0][tag];
        }

        // Forward pass
        for pos in 1..seq_len {
            for curr_tag in 0..self.num_tags {
                let mut best_score = f32::NEG_INFINITY;
                let mut best_prev = None;

                for prev_tag in 0..self.num_tags {
                    let score = dp[pos - 1][prev_tag].score
                        + transition_matrix[prev_tag][curr_tag]
                        + emission_scores[pos][curr_tag];

                    if best_prev.is_none() || score > best_score {
                        best_score = score;
                        best_prev = Some(prev_tag);
                    }
                }

                dp[pos][curr_tag] = PathState {
                    score: best_score,
                    prev_tag: best_prev,
                };
            }
        }

        // Backtrack
        let mut best_final_tag = 0;
        let mut best_final_score = f32::NEG_INFINITY;
        for tag in 0..self.num_tags {
            if dp[seq_len - 1][tag].score > best_final_score {
                best_final_score = dp[seq_len - 1][tag].score;
                best_final_tag = tag;
            }
        }

        let mut path = Vec::with_capacity(seq_len);
        path.push(best_final_tag);
        let mut curr_tag = best_final_tag;

        for pos in (1..seq_len).rev() {
            curr_tag = dp[pos][curr_tag].prev_tag.unwrap_or(0);
            path.push(curr_tag);
        }

        path.reverse();
        Ok(path)
    }
}

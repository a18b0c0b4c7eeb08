//! # Viterbi Decoding for CRF
//!
//! Implements the Viterbi algorithm for finding the most likely tag sequence
//! given emission scores and pairwise transition scores.
//!
//! Comparisons are strict, so among equal scores the lowest tag index wins.

use crate::error::{Result, SeqLabError};
use crate::parser::bio_tags::Tag;

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
    /// * `num_tags` - Number of distinct tags (including the padding tag)
    pub fn new(num_tags: usize) -> Self {
        Self { num_tags }
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    /// Build a `[from][to]` mask of allowed transitions from tag labels.
    pub fn transition_mask<S: AsRef<str>>(labels: &[S]) -> Vec<Vec<bool>> {
        labels
            .iter()
            .map(|from| {
                let from = Tag::parse(from.as_ref());
                labels
                    .iter()
                    .map(|to| Tag::is_valid_transition(from, Tag::parse(to.as_ref())))
                    .collect()
            })
            .collect()
    }

    /// Decode the optimal tag sequence using Viterbi algorithm.
    ///
    /// # Arguments
    /// * `emission_scores` - Matrix of shape [seq_len, num_tags] with emission scores
    /// * `transition_matrix` - Matrix of shape [num_tags, num_tags], `[prev][curr]`
    ///
    /// # Returns
    /// The optimal tag sequence as indices.
    pub fn decode(
        &self,
        emission_scores: &[Vec<f32>],
        transition_matrix: &[Vec<f32>],
    ) -> Result<Vec<usize>> {
        self.run(emission_scores, transition_matrix, None)
    }

    /// Decode with hard constraints: transitions where `allowed[prev][curr]`
    /// is false are never taken.
    pub fn decode_constrained(
        &self,
        emission_scores: &[Vec<f32>],
        transition_matrix: &[Vec<f32>],
        allowed: &[Vec<bool>],
    ) -> Result<Vec<usize>> {
        if allowed.len() != self.num_tags || allowed.iter().any(|row| row.len() != self.num_tags) {
            return Err(SeqLabError::InvalidInput(format!(
                "transition mask must be {0}x{0}",
                self.num_tags
            )));
        }
        self.run(emission_scores, transition_matrix, Some(allowed))
    }

    fn run(
        &self,
        emission_scores: &[Vec<f32>],
        transition_matrix: &[Vec<f32>],
        allowed: Option<&[Vec<bool>]>,
    ) -> Result<Vec<usize>> {
        let seq_len = emission_scores.len();
        if seq_len == 0 {
            return Ok(Vec::new());
        }

        // Validate dimensions
        if let Some(row) = emission_scores.iter().find(|row| row.len() != self.num_tags) {
            return Err(SeqLabError::InvalidInput(format!(
                "emission score dimension mismatch: expected {}, got {}",
                self.num_tags,
                row.len()
            )));
        }
        if transition_matrix.len() != self.num_tags
            || transition_matrix.iter().any(|row| row.len() != self.num_tags)
        {
            return Err(SeqLabError::InvalidInput(format!(
                "transition matrix must be {0}x{0}",
                self.num_tags
            )));
        }

        // Initialize DP table: [seq_len][num_tags]
        let mut dp: Vec<Vec<PathState>> = vec![
            vec![
                PathState {
                    score: f32::NEG_INFINITY,
                    prev_tag: None
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
                    if let Some(allowed) = allowed {
                        if !allowed[prev_tag][curr_tag] {
                            continue;
                        }
                    }

                    let score = dp[pos - 1][prev_tag].score + transition_matrix[prev_tag][curr_tag];

                    if score > best_score || best_prev.is_none() {
                        best_score = score;
                        best_prev = Some(prev_tag);
                    }
                }

                dp[pos][curr_tag].score = best_score + emission_scores[pos][curr_tag];
                dp[pos][curr_tag].prev_tag = best_prev;
            }
        }

        // Find best final tag
        let mut best_final_tag = 0;
        let mut best_final_score = f32::NEG_INFINITY;
        for tag in 0..self.num_tags {
            if dp[seq_len - 1][tag].score > best_final_score {
                best_final_score = dp[seq_len - 1][tag].score;
                best_final_tag = tag;
            }
        }

        // Backtrack
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

/// Index of the first maximum of `scores`.
pub fn argmax(scores: &[f32]) -> usize {
    let mut best = 0;
    for (idx, &score) in scores.iter().enumerate() {
        if score > scores[best] {
            best = idx;
        }
    }
    best
}

//! # Trainable Model Boundary
//!
//! The trainer, evaluator and tagger only see [`SequenceModel`]. The concrete
//! candle network lives in [`neural`].

pub mod neural;

use std::path::Path;

use crate::batch::Batch;
use crate::error::{Result, SeqLabError};
use crate::parser::viterbi::argmax;

pub use neural::{build_model, NeuralTagger};

/// Host-side per-token tag scores for one batch, `[rows, max_len, num_tags]`
/// row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct EmissionScores {
    rows: usize,
    max_len: usize,
    num_tags: usize,
    scores: Vec<f32>,
    lengths: Vec<usize>,
}

impl EmissionScores {
    pub fn new(
        scores: Vec<f32>,
        lengths: Vec<usize>,
        max_len: usize,
        num_tags: usize,
    ) -> Result<Self> {
        let rows = lengths.len();
        if scores.len() != rows * max_len * num_tags {
            return Err(SeqLabError::InvalidInput(format!(
                "expected {} scores for {rows}x{max_len}x{num_tags}, got {}",
                rows * max_len * num_tags,
                scores.len()
            )));
        }
        if let Some(&len) = lengths.iter().find(|&&len| len > max_len) {
            return Err(SeqLabError::InvalidInput(format!(
                "sentence length {len} exceeds padded length {max_len}"
            )));
        }
        Ok(Self {
            rows,
            max_len,
            num_tags,
            scores,
            lengths,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Scores of one row, truncated to its true length.
    pub fn row(&self, row: usize) -> Vec<Vec<f32>> {
        (0..self.lengths[row])
            .map(|pos| {
                let start = (row * self.max_len + pos) * self.num_tags;
                self.scores[start..start + self.num_tags].to_vec()
            })
            .collect()
    }

    /// Independent per-token argmax, for models without a structured output
    /// layer.
    pub fn argmax_decode(&self) -> Vec<Vec<usize>> {
        (0..self.rows)
            .map(|row| self.row(row).iter().map(|s| argmax(s)).collect())
            .collect()
    }
}

/// A trainable tagger.
///
/// Parameters change only through `&mut self` methods, so evaluation can
/// never overlap a training step.
pub trait SequenceModel {
    /// Number of tags the model scores, padding included.
    fn num_tags(&self) -> usize;

    /// Per-token scores in inference mode.
    fn forward(&self, batch: &Batch) -> Result<EmissionScores>;

    /// Best tag sequence per row. Only positions below each row's length are
    /// read; output rows have exactly that length.
    fn decode(&self, scores: &EmissionScores) -> Result<Vec<Vec<usize>>>;

    fn predict(&self, batch: &Batch) -> Result<Vec<Vec<usize>>> {
        let scores = self.forward(batch)?;
        self.decode(&scores)
    }

    /// One optimizer step on a batch with tag targets. Returns the loss.
    fn train_step(&mut self, batch: &Batch) -> Result<f32>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Persist the weights.
    fn save(&self, path: &Path) -> Result<()>;

    /// Replace the weights with persisted ones of the same architecture.
    fn load(&mut self, path: &Path) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;

    /// Deterministic stand-in: every word index maps to a fixed tag.
    pub(crate) struct ScriptedModel {
        pub num_tags: usize,
        pub by_word: HashMap<u32, usize>,
        pub default_tag: usize,
        pub lr: f64,
    }

    impl ScriptedModel {
        pub(crate) fn new(num_tags: usize, default_tag: usize) -> Self {
            Self {
                num_tags,
                by_word: HashMap::new(),
                default_tag,
                lr: 0.1,
            }
        }

        pub(crate) fn with_word(mut self, word: u32, tag: usize) -> Self {
            self.by_word.insert(word, tag);
            self
        }
    }

    impl SequenceModel for ScriptedModel {
        fn num_tags(&self) -> usize {
            self.num_tags
        }

        fn forward(&self, batch: &Batch) -> Result<EmissionScores> {
            let mut scores = vec![0.0; batch.rows * batch.max_len * self.num_tags];
            for (pos, word) in batch.words.iter().enumerate() {
                let tag = self.by_word.get(word).copied().unwrap_or(self.default_tag);
                scores[pos * self.num_tags + tag] = 1.0;
            }
            EmissionScores::new(scores, batch.lengths.clone(), batch.max_len, self.num_tags)
        }

        fn decode(&self, scores: &EmissionScores) -> Result<Vec<Vec<usize>>> {
            Ok(scores.argmax_decode())
        }

        fn train_step(&mut self, _batch: &Batch) -> Result<f32> {
            Ok(0.0)
        }

        fn learning_rate(&self) -> f64 {
            self.lr
        }

        fn set_learning_rate(&mut self, lr: f64) {
            self.lr = lr;
        }

        fn save(&self, path: &Path) -> Result<()> {
            std::fs::write(path, b"scripted")?;
            Ok(())
        }

        fn load(&mut self, path: &Path) -> Result<()> {
            std::fs::read(path)?;
            Ok(())
        }
    }

    #[test]
    fn test_emission_rows_are_truncated() {
        // 2 rows, max_len 2, 3 tags
        let scores = EmissionScores::new(
            vec![
                0.1, 0.9, 0.0, //
                0.0, 0.0, 5.0, // padding of row 0
                1.0, 0.0, 0.0, //
                0.0, 2.0, 1.0,
            ],
            vec![1, 2],
            2,
            3,
        )
        .unwrap();

        assert_eq!(scores.row(0).len(), 1);
        assert_eq!(scores.argmax_decode(), vec![vec![1], vec![0, 1]]);
    }

    #[test]
    fn test_emission_shape_checked() {
        assert!(EmissionScores::new(vec![0.0; 5], vec![1, 1], 1, 3).is_err());
        assert!(EmissionScores::new(vec![0.0; 3], vec![2], 1, 3).is_err());
    }
}

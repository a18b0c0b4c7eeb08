//! # Entity-Level Evaluation
//!
//! Precision, recall and F1 over exactly matching entity spans, micro
//! averaged across sentences, with a per-category breakdown.
//!
//! Conventions for empty sets: with no predicted spans precision is 1, with
//! no gold spans recall is 1, and F1 is 0 whenever precision and recall are
//! both 0. Two empty sets therefore score 1/1/1.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::BatchGenerator;
use crate::error::{Result, SeqLabError};
use crate::model::SequenceModel;
use crate::parser::bio_tags::{extract_spans, Span};

/// Precision/recall/F1 for one category or for all spans.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Number of gold spans.
    pub support: usize,
    pub predicted: usize,
    pub correct: usize,
}

impl Score {
    pub fn from_counts(correct: usize, predicted: usize, gold: usize) -> Self {
        let precision = if predicted == 0 {
            1.0
        } else {
            correct as f64 / predicted as f64
        };
        let recall = if gold == 0 {
            1.0
        } else {
            correct as f64 / gold as f64
        };
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };
        Self {
            precision,
            recall,
            f1,
            support: gold,
            predicted,
            correct,
        }
    }
}

/// Result of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub overall: Score,
    pub categories: BTreeMap<String, Score>,
    pub sentences: usize,
}

impl EvaluationReport {
    pub fn precision(&self) -> f64 {
        self.overall.precision
    }

    pub fn recall(&self) -> f64 {
        self.overall.recall
    }

    pub fn f1(&self) -> f64 {
        self.overall.f1
    }
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .categories
            .keys()
            .map(String::len)
            .chain(std::iter::once("all (micro avg.)".len()))
            .max()
            .unwrap_or(0);

        writeln!(
            f,
            "{:>width$}  {:>9}  {:>9}  {:>9}  {:>7}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        writeln!(f)?;
        for (category, score) in &self.categories {
            write_row(f, category, score, width)?;
        }
        writeln!(f)?;
        write_row(f, "all (micro avg.)", &self.overall, width)
    }
}

fn write_row(f: &mut fmt::Formatter<'_>, label: &str, score: &Score, width: usize) -> fmt::Result {
    writeln!(
        f,
        "{:>width$}  {:>9.4}  {:>9.4}  {:>9.4}  {:>7}",
        label, score.precision, score.recall, score.f1, score.support
    )
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    correct: usize,
    predicted: usize,
    gold: usize,
}

/// Accumulates span counts sentence by sentence.
#[derive(Debug, Default)]
pub struct SpanScorer {
    overall: Counts,
    categories: BTreeMap<String, Counts>,
    sentences: usize,
}

impl SpanScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one sentence. Both tag sequences are truncated to the shorter
    /// length.
    pub fn add<P: AsRef<str>, G: AsRef<str>>(&mut self, predicted: &[P], gold: &[G]) {
        let len = predicted.len().min(gold.len());
        self.add_spans(
            &extract_spans(&predicted[..len]),
            &extract_spans(&gold[..len]),
        );
    }

    pub fn add_spans(&mut self, predicted: &[Span], gold: &[Span]) {
        let gold_set: HashSet<&Span> = gold.iter().collect();
        let predicted_set: HashSet<&Span> = predicted.iter().collect();

        for span in &predicted_set {
            let correct = gold_set.contains(*span);
            let entry = self.categories.entry(span.category.clone()).or_default();
            entry.predicted += 1;
            self.overall.predicted += 1;
            if correct {
                entry.correct += 1;
                self.overall.correct += 1;
            }
        }
        for span in &gold_set {
            self.categories.entry(span.category.clone()).or_default().gold += 1;
            self.overall.gold += 1;
        }
        self.sentences += 1;
    }

    pub fn report(&self) -> EvaluationReport {
        let score = |c: &Counts| Score::from_counts(c.correct, c.predicted, c.gold);
        EvaluationReport {
            overall: score(&self.overall),
            categories: self
                .categories
                .iter()
                .map(|(category, counts)| (category.clone(), score(counts)))
                .collect(),
            sentences: self.sentences,
        }
    }
}

/// Score tag sequences against gold tag sequences.
pub fn evaluate_tags<P: AsRef<str>, G: AsRef<str>>(
    predicted: &[Vec<P>],
    gold: &[Vec<G>],
) -> EvaluationReport {
    let mut scorer = SpanScorer::new();
    for (p, g) in predicted.iter().zip(gold) {
        scorer.add(p, g);
    }
    scorer.report()
}

/// Runs a model over a labelled generator and scores its spans.
pub struct Evaluator;

impl Evaluator {
    /// One pass over `generator`. The generator should not shuffle; gold
    /// spans are read from the generator's source tags so labels unknown to
    /// the model still count as missed.
    pub fn evaluate<M: SequenceModel + ?Sized>(
        model: &M,
        generator: &mut BatchGenerator<'_>,
    ) -> Result<EvaluationReport> {
        let preprocessor = generator.preprocessor();
        let source_tags = generator
            .source_tags()
            .ok_or_else(|| SeqLabError::InvalidInput("evaluation needs gold tags".into()))?;
        let mut scorer = SpanScorer::new();

        for batch in generator.epoch() {
            let batch = batch?;
            let predicted = model.predict(&batch)?;
            for (row, tags) in predicted.iter().enumerate() {
                let gold = &source_tags[batch.sentence_indices[row]];
                let len = batch.lengths[row];
                let labels = preprocessor.decode_tags(&tags[..len.min(tags.len())]);
                scorer.add(&labels, &gold[..len]);
            }
        }

        let report = scorer.report();
        debug!(
            sentences = report.sentences,
            precision = report.precision(),
            recall = report.recall(),
            f1 = report.f1(),
            "evaluation pass"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::ScriptedModel;
    use crate::preprocess::tests::{corpus, sentences};
    use crate::preprocess::{Preprocessor, PreprocessorOptions};

    fn tags(raw: &[&str]) -> Vec<Vec<String>> {
        sentences(raw)
    }

    #[test]
    fn test_both_empty_is_perfect() {
        let report = evaluate_tags(&tags(&["O O O"]), &tags(&["O O O"]));
        assert_eq!(report.precision(), 1.0);
        assert_eq!(report.recall(), 1.0);
        assert_eq!(report.f1(), 1.0);
    }

    #[test]
    fn test_nothing_predicted() {
        let report = evaluate_tags(&tags(&["O O"]), &tags(&["B-PER O"]));
        assert_eq!(report.precision(), 1.0);
        assert_eq!(report.recall(), 0.0);
        assert_eq!(report.f1(), 0.0);
    }

    #[test]
    fn test_exact_match_only() {
        // predicted PER span is one token short
        let report = evaluate_tags(
            &tags(&["B-PER O O B-LOC"]),
            &tags(&["B-PER I-PER O B-LOC"]),
        );
        assert_eq!(report.overall.correct, 1);
        assert_eq!(report.precision(), 0.5);
        assert_eq!(report.recall(), 0.5);
        assert_eq!(report.categories["LOC"].f1, 1.0);
        assert_eq!(report.categories["PER"].f1, 0.0);
        assert_eq!(report.categories["PER"].support, 1);
    }

    #[test]
    fn test_micro_average_across_sentences() {
        let report = evaluate_tags(
            &tags(&["B-PER O", "O O", "S-LOC O"]),
            &tags(&["B-PER O", "B-ORG O", "B-LOC O"]),
        );
        // 2 correct of 2 predicted, 3 gold
        assert_eq!(report.precision(), 1.0);
        assert!((report.recall() - 2.0 / 3.0).abs() < 1e-12);
        assert!((report.f1() - 0.8).abs() < 1e-12);
        assert_eq!(report.sentences, 3);
        assert_eq!(report.categories["ORG"].precision, 1.0);
        assert_eq!(report.categories["ORG"].recall, 0.0);
    }

    #[test]
    fn test_same_span_in_different_sentences_counts_twice() {
        let report = evaluate_tags(&tags(&["B-LOC", "B-LOC"]), &tags(&["B-LOC", "O"]));
        assert_eq!(report.overall.predicted, 2);
        assert_eq!(report.overall.correct, 1);
    }

    #[test]
    fn test_report_table() {
        let report = evaluate_tags(&tags(&["B-PER O"]), &tags(&["B-PER O"]));
        let table = report.to_string();
        assert!(table.contains("precision"));
        assert!(table.contains("PER"));
        assert!(table.contains("all (micro avg.)"));
        assert!(table.contains("1.0000"));
    }

    #[test]
    fn test_evaluator_over_generator() {
        let (tokens, gold) = corpus();
        let p = Preprocessor::fit(PreprocessorOptions::default(), &tokens, &gold).unwrap();
        let tag = |label: &str| p.tag_labels().iter().position(|t| t == label).unwrap();
        let word = |w: &str| p.encode_sentence(&[w], None).unwrap().words[0];

        // predicts only the persons "Anna" and "Levin", as single-token spans
        let model = ScriptedModel::new(p.num_tags(), tag("O"))
            .with_word(word("Anna"), tag("B-PER"))
            .with_word(word("Levin"), tag("B-PER"));

        let mut generator = BatchGenerator::new(&tokens, Some(gold.as_slice()), &p, 1).unwrap();
        let report = Evaluator::evaluate(&model, &mut generator).unwrap();

        // gold: (PER,0,1) (LOC,3,3) | (PER,0,0) (LOC,3,3)
        assert_eq!(report.overall.predicted, 2);
        assert_eq!(report.overall.correct, 1);
        assert_eq!(report.overall.support, 4);
        assert_eq!(report.precision(), 0.5);
        assert_eq!(report.recall(), 0.25);
    }

    #[test]
    fn test_evaluator_requires_gold() {
        let (tokens, gold) = corpus();
        let p = Preprocessor::fit(PreprocessorOptions::default(), &tokens, &gold).unwrap();
        let model = ScriptedModel::new(p.num_tags(), 0);
        let mut generator = BatchGenerator::new(&tokens, None, &p, 2).unwrap();
        assert!(Evaluator::evaluate(&model, &mut generator).is_err());
    }
}

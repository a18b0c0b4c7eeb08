//! Data loading and splitting for labelled corpora.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use oorandom::Rand64;
use seqlab_core::batch::shuffle;
use seqlab_core::{Result, SeqLabError};
use tracing::{info, warn};

/// Parallel token and tag sequences.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    pub tokens: Vec<Vec<String>>,
    pub tags: Vec<Vec<String>>,
}

impl Dataset {
    pub fn new(tokens: Vec<Vec<String>>, tags: Vec<Vec<String>>) -> Result<Self> {
        if tokens.len() != tags.len() {
            return Err(SeqLabError::InvalidInput(format!(
                "{} sentences but {} tag sequences",
                tokens.len(),
                tags.len()
            )));
        }
        Ok(Self { tokens, tags })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Sentences at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            tokens: indices.iter().map(|&i| self.tokens[i].clone()).collect(),
            tags: indices.iter().map(|&i| self.tags[i].clone()).collect(),
        }
    }

    pub fn as_split(&self) -> (&[Vec<String>], &[Vec<String>]) {
        (self.tokens.as_slice(), self.tags.as_slice())
    }
}

/// Load a CoNLL-style file: one `token ... tag` line per token (the first
/// column is the token, the last the tag), blank lines between sentences.
/// `-DOCSTART-` and `#` comment lines are skipped.
pub fn load_conll<P: AsRef<Path>>(path: P) -> Result<Dataset> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| SeqLabError::persistence(path, format!("cannot open dataset: {e}")))?;
    let reader = BufReader::new(file);

    let mut dataset = Dataset::default();
    let mut current_tokens = Vec::new();
    let mut current_tags = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();

        if line.is_empty() || line.starts_with("-DOCSTART-") {
            if !current_tokens.is_empty() {
                dataset.tokens.push(std::mem::take(&mut current_tokens));
                dataset.tags.push(std::mem::take(&mut current_tags));
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        match (parts.first(), parts.last()) {
            (Some(token), Some(tag)) if parts.len() >= 2 => {
                current_tokens.push(token.to_string());
                current_tags.push(tag.to_string());
            }
            _ => {
                warn!(line = line_no + 1, path = %path.display(), "skipping line without a tag");
            }
        }
    }

    // Don't forget the last sentence
    if !current_tokens.is_empty() {
        dataset.tokens.push(current_tokens);
        dataset.tags.push(current_tags);
    }

    info!(path = %path.display(), sentences = dataset.len(), "loaded dataset");
    Ok(dataset)
}

/// Seeded split into `(train, held_out)`, holding out `fraction` of the
/// sentences (at least one, if there are two or more).
pub fn holdout_split(dataset: &Dataset, fraction: f64, seed: u64) -> (Dataset, Dataset) {
    let n = dataset.len();
    let mut order: Vec<usize> = (0..n).collect();
    shuffle(&mut order, &mut Rand64::new(u128::from(seed)));

    let held = if n < 2 {
        0
    } else {
        ((n as f64 * fraction).round() as usize).clamp(1, n - 1)
    };
    let (held_out, train) = order.split_at(held);
    (dataset.select(train), dataset.select(held_out))
}

/// Seeded permutation of `0..n` cut into `k` contiguous partitions whose
/// sizes differ by at most one.
pub fn kfold_partitions(n: usize, k: usize, seed: u64) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..n).collect();
    shuffle(&mut order, &mut Rand64::new(u128::from(seed)));

    let k = k.max(1);
    let (base, extra) = (n / k, n % k);
    let mut partitions = Vec::with_capacity(k);
    let mut start = 0;
    for i in 0..k {
        let size = base + usize::from(i < extra);
        partitions.push(order[start..start + size].to_vec());
        start += size;
    }
    partitions
}

/// Training and validation sets for fold `fold`: partition `fold` is held
/// out, the others are trained on.
pub fn fold_split(dataset: &Dataset, folds: usize, fold: usize, seed: u64) -> (Dataset, Dataset) {
    let partitions = kfold_partitions(dataset.len(), folds, seed);
    let train: Vec<usize> = partitions
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != fold)
        .flat_map(|(_, p)| p.iter().copied())
        .collect();
    let held_out = partitions.get(fold).cloned().unwrap_or_default();
    (dataset.select(&train), dataset.select(&held_out))
}

/// Training and validation sets for fold `fold` of `folds`.
///
/// An explicit validation set is shared by every fold. Otherwise a single
/// model holds out 10% of the training data and fold `k` of an ensemble
/// holds out partition `k`.
pub fn training_splits(
    train: &Dataset,
    valid: Option<&Dataset>,
    folds: usize,
    fold: usize,
    seed: u64,
) -> (Dataset, Dataset) {
    match valid {
        Some(valid) => (train.clone(), valid.clone()),
        None if folds > 1 => fold_split(train, folds, fold, seed),
        None => holdout_split(train, 0.1, seed),
    }
}

/// Reject configurations whose derived validation split would be empty.
///
/// Without an explicit validation set a single model needs at least two
/// sentences to hold one out, and every fold of an ensemble needs its own
/// partition.
pub fn check_validation_source(train: &Dataset, valid: Option<&Dataset>, folds: usize) -> Result<()> {
    if valid.is_some() {
        return Ok(());
    }
    let n = train.len();
    if folds > 1 && folds > n {
        return Err(SeqLabError::Configuration(format!(
            "fold number {folds} exceeds the {n} training sentences; pass a validation set or lower the fold number"
        )));
    }
    if folds <= 1 && n < 2 {
        return Err(SeqLabError::Configuration(format!(
            "cannot hold out validation sentences from {n} training sentence(s); pass a validation set"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn numbered(n: usize) -> Dataset {
        Dataset::new(
            (0..n).map(|i| vec![format!("w{i}")]).collect(),
            (0..n).map(|_| vec!["O".to_string()]).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_load_conll() {
        let file = temp_file(
            "-DOCSTART- -X- O O\n\nEU NNP B-NP B-ORG\nrejects VBZ B-VP O\n\n# comment\nPeter\tB-PER\nBlackburn\tI-PER\n",
        );
        let dataset = load_conll(file.path()).unwrap();

        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.tokens[0], vec!["EU", "rejects"]);
        assert_eq!(dataset.tags[0], vec!["B-ORG", "O"]);
        assert_eq!(dataset.tags[1], vec!["B-PER", "I-PER"]);
    }

    #[test]
    fn test_load_skips_untagged_lines() {
        let file = temp_file("Anna B-PER\nlonely\nwent O\n");
        let dataset = load_conll(file.path()).unwrap();
        assert_eq!(dataset.tokens[0], vec!["Anna", "went"]);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            load_conll("/nonexistent/train.conll"),
            Err(SeqLabError::Persistence { .. })
        ));
    }

    #[test]
    fn test_holdout_split() {
        let dataset = numbered(20);
        let (train, held) = holdout_split(&dataset, 0.1, 3);
        assert_eq!(held.len(), 2);
        assert_eq!(train.len(), 18);
        assert_eq!(holdout_split(&dataset, 0.1, 3), (train, held));

        let (train, held) = holdout_split(&numbered(1), 0.1, 3);
        assert_eq!((train.len(), held.len()), (1, 0));
    }

    #[test]
    fn test_kfold_partitions_cover_everything_once() {
        let partitions = kfold_partitions(10, 3, 5);
        let sizes: Vec<usize> = partitions.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 3, 3]);

        let mut all: Vec<usize> = partitions.concat();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_fold_split_holds_out_one_partition() {
        let dataset = numbered(9);
        let (train, held) = fold_split(&dataset, 3, 1, 8);
        assert_eq!((train.len(), held.len()), (6, 3));
        for token in &held.tokens {
            assert!(!train.tokens.contains(token));
        }
    }

    #[test]
    fn test_training_splits() {
        let dataset = numbered(10);
        let valid = numbered(2);

        let (train, held) = training_splits(&dataset, Some(&valid), 3, 2, 1);
        assert_eq!((train.len(), held), (10, valid));

        let (train, held) = training_splits(&dataset, None, 1, 0, 1);
        assert_eq!((train.len(), held.len()), (9, 1));

        let (train, held) = training_splits(&dataset, None, 5, 4, 1);
        assert_eq!((train.len(), held.len()), (8, 2));
    }

    #[test]
    fn test_validation_source_needs_enough_sentences() {
        let one = numbered(1);
        assert!(matches!(
            check_validation_source(&one, None, 1),
            Err(SeqLabError::Configuration(msg)) if msg.contains("1 training sentence")
        ));
        assert!(check_validation_source(&one, Some(&numbered(1)), 1).is_ok());

        let three = numbered(3);
        assert!(matches!(
            check_validation_source(&three, None, 5),
            Err(SeqLabError::Configuration(msg)) if msg.contains("fold number 5") && msg.contains("3 training")
        ));
        assert!(check_validation_source(&three, None, 3).is_ok());
        assert!(check_validation_source(&three, Some(&one), 5).is_ok());
    }
}

//! # Preprocessor
//!
//! Builds word, character and tag vocabularies from training data and turns
//! token/tag sequences into index arrays. Vocabularies are frozen once
//! fitted: inference always goes through the state that was trained on.

pub mod case;
pub mod vocab;

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SeqLabError};
use crate::parser::bio_tags::OUTSIDE;

pub use case::{CaseFeature, CASE_RULES_VERSION};
pub use vocab::{Vocabulary, PAD, PAD_INDEX, UNK, UNK_INDEX};

/// Tokenization-independent preprocessing options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreprocessorOptions {
    /// Lowercase words before the word vocabulary lookup. Characters and
    /// case features always see the original form.
    pub lowercase: bool,
    /// Words longer than this are truncated for the character features.
    pub max_char_length: usize,
}

impl Default for PreprocessorOptions {
    fn default() -> Self {
        Self {
            lowercase: false,
            max_char_length: 30,
        }
    }
}

impl PreprocessorOptions {
    /// Set whether words are lowercased for the vocabulary lookup.
    pub fn with_lowercase(mut self, lowercase: bool) -> Self {
        self.lowercase = lowercase;
        self
    }

    /// Set the character truncation length. Values below 1 become 1.
    pub fn with_max_char_length(mut self, max_char_length: usize) -> Self {
        self.max_char_length = max_char_length.max(1);
        self
    }
}

/// Index arrays for one sentence. `words`, `chars` and `cases` always have
/// the sentence length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSequence {
    /// Word indices; unknown words map to [`UNK_INDEX`].
    pub words: Vec<u32>,
    /// Character indices of each word, truncated to `max_char_length`.
    pub chars: Vec<Vec<u32>>,
    /// [`CaseFeature`] index of each word.
    pub cases: Vec<u32>,
    /// Tag indices, present when tags were given.
    pub tags: Option<Vec<u32>>,
}

impl EncodedSequence {
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Fitted word, character and tag vocabularies plus the options used to
/// fit them. Frozen after fitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preprocessor {
    options: PreprocessorOptions,
    case_rules_version: u32,
    words: Vocabulary,
    chars: Vocabulary,
    tags: Vocabulary,
}

impl Preprocessor {
    /// Fit vocabularies on one labelled split.
    pub fn fit(
        options: PreprocessorOptions,
        tokens: &[Vec<String>],
        tags: &[Vec<String>],
    ) -> Result<Self> {
        Self::fit_splits(options, &[(tokens, tags)])
    }

    /// Fit vocabularies on several labelled splits (e.g. train and
    /// validation). Every distinct word, character and tag gets an index.
    pub fn fit_splits(
        options: PreprocessorOptions,
        splits: &[(&[Vec<String>], &[Vec<String>])],
    ) -> Result<Self> {
        let sentence_count: usize = splits.iter().map(|(tokens, _)| tokens.len()).sum();
        if sentence_count == 0 {
            return Err(SeqLabError::EmptyInput);
        }

        let mut words = Vocabulary::with_reserved(&[PAD, UNK]);
        let mut chars = Vocabulary::with_reserved(&[PAD, UNK]);
        let mut tag_vocab = Vocabulary::with_reserved(&[PAD]);

        for (tokens, tags) in splits {
            check_aligned(tokens, tags)?;
            for (sentence, labels) in tokens.iter().zip(tags.iter()) {
                for token in sentence {
                    words.insert(&normalize_word(token, options.lowercase));
                    let mut buf = [0u8; 4];
                    for c in token.chars() {
                        chars.insert(c.encode_utf8(&mut buf));
                    }
                }
                for label in labels {
                    tag_vocab.insert(label);
                }
            }
        }

        info!(
            sentences = sentence_count,
            words = words.len(),
            chars = chars.len(),
            tags = tag_vocab.len(),
            "fitted preprocessor vocabularies"
        );

        Ok(Self {
            options,
            case_rules_version: CASE_RULES_VERSION,
            words,
            chars,
            tags: tag_vocab,
        })
    }

    /// Encode sentences. When `tags` is `None` only features are produced.
    pub fn transform(
        &self,
        tokens: &[Vec<String>],
        tags: Option<&[Vec<String>]>,
    ) -> Result<Vec<EncodedSequence>> {
        if let Some(tags) = tags {
            check_aligned(tokens, tags)?;
        }
        tokens
            .iter()
            .enumerate()
            .map(|(i, sentence)| {
                let labels = tags.map(|t| t[i].as_slice());
                self.encode_sentence(sentence.as_slice(), labels)
            })
            .collect()
    }

    /// Encode one sentence. Words and characters never seen during fitting
    /// map to [`UNK_INDEX`]; unseen tags map to `O` (or padding if the
    /// training data had no `O`).
    pub fn encode_sentence<S: AsRef<str>>(
        &self,
        tokens: &[S],
        tags: Option<&[S]>,
    ) -> Result<EncodedSequence> {
        if let Some(tags) = tags {
            if tags.len() != tokens.len() {
                return Err(SeqLabError::InvalidInput(format!(
                    "sentence has {} tokens but {} tags",
                    tokens.len(),
                    tags.len()
                )));
            }
        }

        let mut words = Vec::with_capacity(tokens.len());
        let mut chars = Vec::with_capacity(tokens.len());
        let mut cases = Vec::with_capacity(tokens.len());
        let mut buf = [0u8; 4];

        for token in tokens {
            let token = token.as_ref();
            words.push(
                self.words
                    .get_or(&normalize_word(token, self.options.lowercase), UNK_INDEX),
            );
            chars.push(
                token
                    .chars()
                    .take(self.options.max_char_length)
                    .map(|c| self.chars.get_or(c.encode_utf8(&mut buf), UNK_INDEX))
                    .collect(),
            );
            cases.push(CaseFeature::classify(token).index());
        }

        let tags = tags.map(|labels| {
            let fallback = self.tags.get_or(OUTSIDE, PAD_INDEX);
            labels
                .iter()
                .map(|label| {
                    let label = label.as_ref();
                    self.tags.get(label).unwrap_or_else(|| {
                        debug!(label, "tag not in vocabulary, encoding as outside");
                        fallback
                    })
                })
                .collect()
        });

        Ok(EncodedSequence {
            words,
            chars,
            cases,
            tags,
        })
    }

    /// Map tag indices back to labels. Padding and out-of-range indices
    /// decode as `O`.
    pub fn decode_tags(&self, indices: &[usize]) -> Vec<String> {
        indices
            .iter()
            .map(|&idx| match self.tags.item(idx) {
                Some(label) if idx != PAD_INDEX as usize => label.to_string(),
                _ => OUTSIDE.to_string(),
            })
            .collect()
    }

    /// Word for a word index, for diagnostics.
    pub fn word(&self, idx: u32) -> Option<&str> {
        self.words.item(idx as usize)
    }

    pub fn options(&self) -> &PreprocessorOptions {
        &self.options
    }

    pub fn word_vocab_size(&self) -> usize {
        self.words.len()
    }

    pub fn char_vocab_size(&self) -> usize {
        self.chars.len()
    }

    pub fn case_vocab_size(&self) -> usize {
        CaseFeature::COUNT
    }

    /// Number of tags, padding included.
    pub fn num_tags(&self) -> usize {
        self.tags.len()
    }

    pub fn tag_labels(&self) -> &[String] {
        self.tags.items()
    }

    /// Persist as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string(self)?;
        fs::write(path, json)?;
        debug!(path = %path.display(), "preprocessor saved");
        Ok(())
    }

    /// Load a persisted preprocessor. Vocabularies are used as stored.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| SeqLabError::persistence(path, format!("cannot read preprocessor: {e}")))?;
        let preprocessor: Self = serde_json::from_str(&content)
            .map_err(|e| SeqLabError::persistence(path, format!("corrupt preprocessor: {e}")))?;

        if preprocessor.case_rules_version != CASE_RULES_VERSION {
            return Err(SeqLabError::persistence(
                path,
                format!(
                    "case rules version {} is not supported (expected {})",
                    preprocessor.case_rules_version, CASE_RULES_VERSION
                ),
            ));
        }
        if preprocessor.words.get(PAD) != Some(PAD_INDEX)
            || preprocessor.words.get(UNK) != Some(UNK_INDEX)
            || preprocessor.chars.get(UNK) != Some(UNK_INDEX)
        {
            return Err(SeqLabError::persistence(
                path,
                "reserved vocabulary entries are missing",
            ));
        }
        Ok(preprocessor)
    }
}

fn normalize_word(token: &str, lowercase: bool) -> String {
    if lowercase {
        token.to_lowercase()
    } else {
        token.to_string()
    }
}

fn check_aligned(tokens: &[Vec<String>], tags: &[Vec<String>]) -> Result<()> {
    if tokens.len() != tags.len() {
        return Err(SeqLabError::InvalidInput(format!(
            "{} sentences but {} tag sequences",
            tokens.len(),
            tags.len()
        )));
    }
    if let Some(i) = (0..tokens.len()).find(|&i| tokens[i].len() != tags[i].len()) {
        return Err(SeqLabError::InvalidInput(format!(
            "sentence {i} has {} tokens but {} tags",
            tokens[i].len(),
            tags[i].len()
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sentences(raw: &[&str]) -> Vec<Vec<String>> {
        raw.iter()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .collect()
    }

    pub(crate) fn corpus() -> (Vec<Vec<String>>, Vec<Vec<String>>) {
        (
            sentences(&["Anna Karenina went Moscow", "Levin lives in Pokrovskoe"]),
            sentences(&["B-PER I-PER O B-LOC", "B-PER O O B-LOC"]),
        )
    }

    #[test]
    fn test_fit_builds_vocabularies() {
        let (tokens, tags) = corpus();
        let p = Preprocessor::fit(PreprocessorOptions::default(), &tokens, &tags).unwrap();

        // <PAD>, <UNK> + 8 distinct words
        assert_eq!(p.word_vocab_size(), 10);
        // <PAD>, B-PER, I-PER, O, B-LOC
        assert_eq!(p.num_tags(), 5);
        assert_eq!(p.tag_labels()[0], PAD);
        assert_eq!(p.case_vocab_size(), CaseFeature::COUNT);
    }

    #[test]
    fn test_fit_empty_input() {
        let err = Preprocessor::fit(PreprocessorOptions::default(), &[], &[]).unwrap_err();
        assert!(matches!(err, SeqLabError::EmptyInput));
    }

    #[test]
    fn test_fit_misaligned_input() {
        let tokens = sentences(&["Anna went"]);
        let tags = sentences(&["B-PER"]);
        let err = Preprocessor::fit(PreprocessorOptions::default(), &tokens, &tags).unwrap_err();
        assert!(matches!(err, SeqLabError::InvalidInput(_)));
    }

    #[test]
    fn test_transform_shapes() {
        let (tokens, tags) = corpus();
        let p = Preprocessor::fit(PreprocessorOptions::default(), &tokens, &tags).unwrap();
        let encoded = p.transform(&tokens, Some(tags.as_slice())).unwrap();

        for (seq, sentence) in encoded.iter().zip(&tokens) {
            assert_eq!(seq.words.len(), sentence.len());
            assert_eq!(seq.chars.len(), sentence.len());
            assert_eq!(seq.cases.len(), sentence.len());
            assert_eq!(seq.tags.as_ref().unwrap().len(), sentence.len());
        }
        assert_eq!(encoded[0].chars[0].len(), "Anna".len());

        let features_only = p.transform(&tokens, None).unwrap();
        assert!(features_only[0].tags.is_none());
    }

    #[test]
    fn test_tag_roundtrip() {
        let (tokens, tags) = corpus();
        let p = Preprocessor::fit(PreprocessorOptions::default(), &tokens, &tags).unwrap();
        let encoded = p.transform(&tokens, Some(tags.as_slice())).unwrap();

        for (seq, labels) in encoded.iter().zip(&tags) {
            let indices: Vec<usize> = seq
                .tags
                .as_ref()
                .unwrap()
                .iter()
                .map(|&t| t as usize)
                .collect();
            assert_eq!(&p.decode_tags(&indices), labels);
        }
    }

    #[test]
    fn test_unknown_words_and_chars() {
        let (tokens, tags) = corpus();
        let p = Preprocessor::fit(PreprocessorOptions::default(), &tokens, &tags).unwrap();
        let seq = p.encode_sentence(&["Vronsky", "went"], None).unwrap();

        assert_eq!(seq.words[0], UNK_INDEX);
        assert_ne!(seq.words[1], UNK_INDEX);
        // 'V', 'y' never appear in the training corpus
        assert_eq!(seq.chars[0][0], UNK_INDEX);
        assert_eq!(seq.cases[0], CaseFeature::InitialUpper.index());
    }

    #[test]
    fn test_lowercase_and_truncation() {
        let (tokens, tags) = corpus();
        let options = PreprocessorOptions::default()
            .with_lowercase(true)
            .with_max_char_length(3);
        let p = Preprocessor::fit(options, &tokens, &tags).unwrap();
        let seq = p.encode_sentence(&["ANNA"], None).unwrap();

        assert_eq!(p.word(seq.words[0]), Some("anna"));
        assert_eq!(seq.chars[0].len(), 3);
        assert_eq!(seq.cases[0], CaseFeature::AllUpper.index());
    }

    #[test]
    fn test_unseen_tag_encodes_as_outside() {
        let (tokens, tags) = corpus();
        let p = Preprocessor::fit(PreprocessorOptions::default(), &tokens, &tags).unwrap();
        let seq = p
            .encode_sentence(&["Anna", "Google"], Some(&["B-PER", "B-ORG"][..]))
            .unwrap();
        assert_eq!(p.decode_tags(&[seq.tags.unwrap()[1] as usize]), vec!["O"]);
    }

    #[test]
    fn test_save_load_transform_idempotent() {
        let (tokens, tags) = corpus();
        let p = Preprocessor::fit(PreprocessorOptions::default(), &tokens, &tags).unwrap();
        let before = p.transform(&tokens, Some(tags.as_slice())).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preprocessor.json");
        p.save(&path).unwrap();
        let loaded = Preprocessor::load(&path).unwrap();

        assert_eq!(loaded, p);
        assert_eq!(loaded.transform(&tokens, Some(tags.as_slice())).unwrap(), before);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Preprocessor::load(dir.path().join("does-not-exist.json")).unwrap_err();
        assert!(matches!(err, SeqLabError::Persistence { .. }));
    }

    #[test]
    fn test_load_rejects_other_case_rules() {
        let (tokens, tags) = corpus();
        let p = Preprocessor::fit(PreprocessorOptions::default(), &tokens, &tags).unwrap();
        let mut value = serde_json::to_value(&p).unwrap();
        value["case_rules_version"] = serde_json::json!(CASE_RULES_VERSION + 1);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preprocessor-v2.json");
        std::fs::write(&path, value.to_string()).unwrap();
        let err = Preprocessor::load(&path).unwrap_err();
        assert!(matches!(err, SeqLabError::Persistence { .. }));
    }
}

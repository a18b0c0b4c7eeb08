//! # Batch Generation
//!
//! Groups encoded sentences into padded mini-batches. Padding is computed per
//! batch, so a batch is only as wide as its longest sentence and only as deep
//! as its longest word.

use oorandom::Rand64;
use tracing::debug;

use crate::embeddings::EmbeddingProvider;
use crate::error::{Result, SeqLabError};
use crate::preprocess::{Preprocessor, PAD_INDEX};

/// Padded view over a group of sentences.
///
/// All buffers are row-major. `words`, `cases` and `tags` are
/// `[rows, max_len]`, `chars` is `[rows, max_len, max_chars]` and
/// `embeddings` is `[rows, max_len, embedding_dim]`. Positions at or past a
/// row's length hold [`PAD_INDEX`] (or zeros).
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Number of sentences in the batch.
    pub rows: usize,
    /// Longest sentence in the batch, in tokens.
    pub max_len: usize,
    /// Longest (truncated) word in the batch, in characters.
    pub max_chars: usize,
    /// Word indices.
    pub words: Vec<u32>,
    /// Character indices per token.
    pub chars: Vec<u32>,
    /// Case feature indices.
    pub cases: Vec<u32>,
    /// Pretrained word vectors, when a provider is attached.
    pub embeddings: Option<Vec<f32>>,
    /// Width of one vector in `embeddings`; `0` without a provider.
    pub embedding_dim: usize,
    /// True sentence lengths.
    pub lengths: Vec<usize>,
    /// Gold tag indices, when the input was labelled.
    pub tags: Option<Vec<u32>>,
    /// Index of each row in the generator's input.
    pub sentence_indices: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// `[rows, max_len]` mask: 1 for real tokens, 0 for padding.
    pub fn mask(&self) -> Vec<f32> {
        let mut mask = vec![0.0; self.rows * self.max_len];
        for (row, &len) in self.lengths.iter().enumerate() {
            mask[row * self.max_len..row * self.max_len + len].fill(1.0);
        }
        mask
    }

    /// Tag targets of one row, truncated to its true length.
    pub fn row_tags(&self, row: usize) -> Option<&[u32]> {
        let start = row * self.max_len;
        self.tags
            .as_ref()
            .map(|tags| &tags[start..start + self.lengths[row]])
    }

    /// Total number of real tokens.
    pub fn token_count(&self) -> usize {
        self.lengths.iter().sum()
    }
}

/// Produces batches from parallel token/tag sequences.
///
/// Each call to [`BatchGenerator::epoch`] starts a new pass. With shuffling
/// enabled the sentence order is permuted at the start of every pass using
/// the seed given to [`BatchGenerator::with_shuffle`]; otherwise input order
/// is kept. Empty sentences are skipped: they have nothing to label.
pub struct BatchGenerator<'a> {
    tokens: &'a [Vec<String>],
    tags: Option<&'a [Vec<String>]>,
    preprocessor: &'a Preprocessor,
    embeddings: Option<&'a dyn EmbeddingProvider>,
    batch_size: usize,
    rng: Option<Rand64>,
    order: Vec<usize>,
    epochs_started: usize,
}

impl<'a> BatchGenerator<'a> {
    pub fn new(
        tokens: &'a [Vec<String>],
        tags: Option<&'a [Vec<String>]>,
        preprocessor: &'a Preprocessor,
        batch_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(SeqLabError::Configuration("batch size must be positive".into()));
        }
        if let Some(tags) = tags {
            if tags.len() != tokens.len() {
                return Err(SeqLabError::InvalidInput(format!(
                    "{} sentences but {} tag sequences",
                    tokens.len(),
                    tags.len()
                )));
            }
        }

        let order = (0..tokens.len())
            .filter(|&i| !tokens[i].is_empty())
            .collect();

        Ok(Self {
            tokens,
            tags,
            preprocessor,
            embeddings: None,
            batch_size,
            rng: None,
            order,
            epochs_started: 0,
        })
    }

    /// Attach pretrained embeddings; each batch then carries dense vectors.
    pub fn with_embeddings(mut self, provider: &'a dyn EmbeddingProvider) -> Self {
        self.embeddings = Some(provider);
        self
    }

    /// Permute sentence order at the start of every pass.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.rng = Some(Rand64::new(u128::from(seed)));
        self
    }

    /// Number of batches per pass.
    pub fn len(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Number of non-empty sentences served per pass.
    pub fn sentence_count(&self) -> usize {
        self.order.len()
    }

    pub fn epochs_started(&self) -> usize {
        self.epochs_started
    }

    pub fn preprocessor(&self) -> &'a Preprocessor {
        self.preprocessor
    }

    pub fn tokens(&self, sentence: usize) -> Option<&'a [String]> {
        self.tokens.get(sentence).map(Vec::as_slice)
    }

    /// Gold tag strings of an input sentence, as given (not re-decoded).
    pub fn gold_tags(&self, sentence: usize) -> Option<&'a [String]> {
        self.tags
            .and_then(|tags| tags.get(sentence))
            .map(Vec::as_slice)
    }

    /// All gold tag sequences, indexed like the input sentences.
    pub fn source_tags(&self) -> Option<&'a [Vec<String>]> {
        self.tags
    }

    /// Start a new pass.
    pub fn epoch(&mut self) -> Epoch<'_, 'a> {
        if let Some(rng) = self.rng.as_mut() {
            shuffle(&mut self.order, rng);
        }
        self.epochs_started += 1;
        debug!(
            epoch = self.epochs_started,
            batches = self.len(),
            shuffled = self.rng.is_some(),
            "starting pass"
        );
        Epoch {
            generator: self,
            cursor: 0,
        }
    }

    fn build(&self, rows: &[usize]) -> Result<Batch> {
        let encoded = rows
            .iter()
            .map(|&i| {
                let labels = self.tags.map(|t| t[i].as_slice());
                self.preprocessor
                    .encode_sentence(self.tokens[i].as_slice(), labels)
            })
            .collect::<Result<Vec<_>>>()?;

        let max_len = encoded.iter().map(|s| s.len()).max().unwrap_or(0).max(1);
        let max_chars = encoded
            .iter()
            .flat_map(|s| s.chars.iter().map(Vec::len))
            .max()
            .unwrap_or(0)
            .max(1);

        let n = rows.len();
        let mut words = vec![PAD_INDEX; n * max_len];
        let mut cases = vec![PAD_INDEX; n * max_len];
        let mut chars = vec![PAD_INDEX; n * max_len * max_chars];
        let mut tags = self.tags.map(|_| vec![PAD_INDEX; n * max_len]);
        let mut lengths = Vec::with_capacity(n);

        for (row, seq) in encoded.iter().enumerate() {
            let base = row * max_len;
            words[base..base + seq.len()].copy_from_slice(&seq.words);
            cases[base..base + seq.len()].copy_from_slice(&seq.cases);
            for (pos, word_chars) in seq.chars.iter().enumerate() {
                let start = (base + pos) * max_chars;
                chars[start..start + word_chars.len()].copy_from_slice(word_chars);
            }
            if let (Some(buf), Some(seq_tags)) = (tags.as_mut(), seq.tags.as_ref()) {
                buf[base..base + seq_tags.len()].copy_from_slice(seq_tags);
            }
            lengths.push(seq.len());
        }

        let (embeddings, embedding_dim) = match self.embeddings {
            Some(provider) => {
                let dim = provider.dim();
                let mut buf = vec![0.0f32; n * max_len * dim];
                for (row, &i) in rows.iter().enumerate() {
                    for (pos, token) in self.tokens[i].iter().enumerate() {
                        let start = (row * max_len + pos) * dim;
                        buf[start..start + dim].copy_from_slice(provider.vector(token));
                    }
                }
                (Some(buf), dim)
            }
            None => (None, 0),
        };

        Ok(Batch {
            rows: n,
            max_len,
            max_chars,
            words,
            chars,
            cases,
            embeddings,
            embedding_dim,
            lengths,
            tags,
            sentence_indices: rows.to_vec(),
        })
    }
}

/// One pass over a [`BatchGenerator`]. Batches are built lazily.
pub struct Epoch<'g, 'a> {
    generator: &'g BatchGenerator<'a>,
    cursor: usize,
}

impl Iterator for Epoch<'_, '_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let order = &self.generator.order;
        if self.cursor >= order.len() {
            return None;
        }
        let end = (self.cursor + self.generator.batch_size).min(order.len());
        let rows = &order[self.cursor..end];
        self.cursor = end;
        Some(self.generator.build(rows))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.generator.order.len() - self.cursor).div_ceil(self.generator.batch_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Epoch<'_, '_> {}

/// Fisher-Yates shuffle driven by `rng`.
pub fn shuffle<T>(items: &mut [T], rng: &mut Rand64) {
    for i in (1..items.len()).rev() {
        let j = rng.rand_range(0..(i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}

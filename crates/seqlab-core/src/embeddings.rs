//! # Pretrained Word Embeddings
//!
//! The provider boundary used by the batch generator. Lookups happen per
//! batch, so a provider only has to answer single-word queries.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::info;

use crate::error::{Result, SeqLabError};

/// Fixed-dimension dense vectors for words.
pub trait EmbeddingProvider {
    /// Name the vectors are registered under, persisted in the model config.
    fn name(&self) -> &str;

    /// Vector dimension.
    fn dim(&self) -> usize;

    /// Vector for a known word.
    fn lookup(&self, word: &str) -> Option<&[f32]>;

    /// Vector used for words the provider does not know.
    fn unknown(&self) -> &[f32];

    /// Vector for `word`, falling back to [`EmbeddingProvider::unknown`].
    fn vector(&self, word: &str) -> &[f32] {
        self.lookup(word).unwrap_or_else(|| self.unknown())
    }
}

/// In-memory embedding table.
#[derive(Debug, Clone)]
pub struct StaticEmbeddings {
    name: String,
    dim: usize,
    vectors: HashMap<String, Vec<f32>>,
    unknown: Vec<f32>,
    lowercase: bool,
}

impl StaticEmbeddings {
    /// Build from a map. All vectors must share one dimension; the unknown
    /// vector is all zeros.
    pub fn from_map(name: impl Into<String>, vectors: HashMap<String, Vec<f32>>) -> Result<Self> {
        let dim = vectors.values().next().map(Vec::len).unwrap_or(0);
        if dim == 0 {
            return Err(SeqLabError::Configuration(
                "embedding table is empty or has zero dimension".into(),
            ));
        }
        if let Some((word, v)) = vectors.iter().find(|(_, v)| v.len() != dim) {
            return Err(SeqLabError::Configuration(format!(
                "embedding for {word:?} has dimension {}, expected {dim}",
                v.len()
            )));
        }

        Ok(Self {
            name: name.into(),
            dim,
            vectors,
            unknown: vec![0.0; dim],
            lowercase: false,
        })
    }

    /// Load a GloVe / word2vec text file: one `word v1 v2 ...` per line. A
    /// word2vec header line (`count dim`) is skipped.
    pub fn from_text_file(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| SeqLabError::persistence(path, format!("cannot open embeddings: {e}")))?;
        let reader = BufReader::new(file);

        let mut vectors = HashMap::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let mut parts = line.split_whitespace();
            let Some(word) = parts.next() else {
                continue;
            };
            let values: std::result::Result<Vec<f32>, _> = parts.map(str::parse::<f32>).collect();
            let values = values.map_err(|e| {
                SeqLabError::persistence(path, format!("line {}: {e}", line_no + 1))
            })?;

            // word2vec header
            if line_no == 0 && values.len() == 1 {
                continue;
            }
            if values.is_empty() {
                continue;
            }
            vectors.insert(word.to_string(), values);
        }

        let embeddings = Self::from_map(name, vectors)?;
        info!(
            name = %embeddings.name,
            words = embeddings.vectors.len(),
            dim = embeddings.dim,
            "loaded embeddings"
        );
        Ok(embeddings)
    }

    /// Use a custom vector for unknown words.
    pub fn with_unknown(mut self, unknown: Vec<f32>) -> Result<Self> {
        if unknown.len() != self.dim {
            return Err(SeqLabError::Configuration(format!(
                "unknown vector has dimension {}, expected {}",
                unknown.len(),
                self.dim
            )));
        }
        self.unknown = unknown;
        Ok(self)
    }

    /// Retry lookups in lowercase when the exact form is missing.
    pub fn with_lowercase_fallback(mut self, lowercase: bool) -> Self {
        self.lowercase = lowercase;
        self
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

impl EmbeddingProvider for StaticEmbeddings {
    fn name(&self) -> &str {
        &self.name
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn lookup(&self, word: &str) -> Option<&[f32]> {
        match self.vectors.get(word) {
            Some(v) => Some(v.as_slice()),
            None if self.lowercase => self.vectors.get(&word.to_lowercase()).map(Vec::as_slice),
            None => None,
        }
    }

    fn unknown(&self) -> &[f32] {
        &self.unknown
    }
}

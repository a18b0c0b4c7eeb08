//! Frozen string → index vocabularies.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Padding entry, always index 0.
pub const PAD: &str = "<PAD>";
/// Unknown entry for words and characters, always index 1.
pub const UNK: &str = "<UNK>";

/// Index of [`PAD`].
pub const PAD_INDEX: u32 = 0;
/// Index of [`UNK`].
pub const UNK_INDEX: u32 = 1;

/// Dense mapping from items to indices plus the reverse mapping.
///
/// Serialized as the ordered item list; the lookup table is rebuilt on load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Vocabulary {
    items: Vec<String>,
    index: HashMap<String, u32>,
}

impl Vocabulary {
    /// Create a vocabulary whose first entries are `reserved`, in order.
    pub fn with_reserved(reserved: &[&str]) -> Self {
        let mut vocab = Self::default();
        for item in reserved {
            vocab.insert(item);
        }
        vocab
    }

    /// Insert `item` if absent and return its index.
    pub fn insert(&mut self, item: &str) -> u32 {
        if let Some(&idx) = self.index.get(item) {
            return idx;
        }
        let idx = self.items.len() as u32;
        self.items.push(item.to_string());
        self.index.insert(item.to_string(), idx);
        idx
    }

    pub fn get(&self, item: &str) -> Option<u32> {
        self.index.get(item).copied()
    }

    /// Index of `item`, or `fallback` when it was never seen.
    pub fn get_or(&self, item: &str, fallback: u32) -> u32 {
        self.get(item).unwrap_or(fallback)
    }

    /// Reverse lookup.
    pub fn item(&self, idx: usize) -> Option<&str> {
        self.items.get(idx).map(String::as_str)
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl From<Vec<String>> for Vocabulary {
    fn from(items: Vec<String>) -> Self {
        let index = items
            .iter()
            .enumerate()
            .map(|(idx, item)| (item.clone(), idx as u32))
            .collect();
        Self { items, index }
    }
}

impl From<Vocabulary> for Vec<String> {
    fn from(vocab: Vocabulary) -> Self {
        vocab.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_indices() {
        let vocab = Vocabulary::with_reserved(&[PAD, UNK]);
        assert_eq!(vocab.get(PAD), Some(PAD_INDEX));
        assert_eq!(vocab.get(UNK), Some(UNK_INDEX));
        assert_eq!(vocab.len(), 2);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut vocab = Vocabulary::with_reserved(&[PAD, UNK]);
        let a = vocab.insert("Moscow");
        let b = vocab.insert("Moscow");
        assert_eq!(a, b);
        assert_eq!(a, 2);
        assert_eq!(vocab.item(2), Some("Moscow"));
        assert_eq!(vocab.get_or("Paris", UNK_INDEX), UNK_INDEX);
    }

    #[test]
    fn test_serde_rebuilds_index() {
        let mut vocab = Vocabulary::with_reserved(&[PAD, UNK]);
        vocab.insert("Anna");
        let json = serde_json::to_string(&vocab).unwrap();
        assert_eq!(json, r#"["<PAD>","<UNK>","Anna"]"#);

        let restored: Vocabulary = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, vocab);
        assert_eq!(restored.get("Anna"), Some(2));
    }
}

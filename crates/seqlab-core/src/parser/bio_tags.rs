//! # BIO/BIOES Tags and Entity Spans
//!
//! Parses per-token labels such as `B-PER`, `I-LOC`, `E-ORG`, `S-MISC` or `O`
//! and groups contiguous tokens into entity spans.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The label used for tokens outside any entity.
pub const OUTSIDE: &str = "O";

/// Boundary prefix of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagPrefix {
    /// `B-` : first token of a multi-token entity.
    Begin,
    /// `I-` : continuation of an entity.
    Inside,
    /// `E-` / `L-` : last token of an entity.
    End,
    /// `S-` / `U-` : entity consisting of one token.
    Single,
    /// A category without prefix, e.g. `PER`. Contiguous runs form one entity.
    Plain,
    /// `O`
    Outside,
}

/// A parsed tag borrowing its category from the label string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag<'a> {
    pub prefix: TagPrefix,
    /// Category without its prefix; empty for the outside tag.
    pub category: &'a str,
}

impl<'a> Tag<'a> {
    /// Parse a label. Anything that is not `O` and carries no known prefix
    /// is a [`TagPrefix::Plain`] category.
    pub fn parse(label: &'a str) -> Self {
        let label = label.trim();
        if label.is_empty() || label == OUTSIDE || label == "<PAD>" {
            return Self {
                prefix: TagPrefix::Outside,
                category: "",
            };
        }

        let prefix = match label.split_once('-') {
            Some(("B", _)) => Some(TagPrefix::Begin),
            Some(("I", _)) => Some(TagPrefix::Inside),
            Some(("E" | "L", _)) => Some(TagPrefix::End),
            Some(("S" | "U", _)) => Some(TagPrefix::Single),
            _ => None,
        };

        match prefix {
            Some(prefix) => Self {
                prefix,
                category: &label[2..],
            },
            None => Self {
                prefix: TagPrefix::Plain,
                category: label,
            },
        }
    }

    /// Check if this is a "Begin" tag.
    pub fn is_begin(&self) -> bool {
        self.prefix == TagPrefix::Begin
    }

    /// Check if this tag continues an entity (`I-`, `E-` or a plain category).
    pub fn is_inside(&self) -> bool {
        matches!(
            self.prefix,
            TagPrefix::Inside | TagPrefix::End | TagPrefix::Plain
        )
    }

    /// True for the `O` tag.
    pub fn is_outside(&self) -> bool {
        self.prefix == TagPrefix::Outside
    }

    /// Entity category, `None` for `O`.
    pub fn entity_type(&self) -> Option<&'a str> {
        (!self.is_outside()).then_some(self.category)
    }

    /// Check if transitioning from `from` tag to `to` tag is valid.
    ///
    /// `I-X` and `E-X` may only follow `B-X` or `I-X`; every other move is allowed.
    pub fn is_valid_transition(from: Tag<'_>, to: Tag<'_>) -> bool {
        match to.prefix {
            TagPrefix::Inside | TagPrefix::End => {
                matches!(from.prefix, TagPrefix::Begin | TagPrefix::Inside)
                    && from.category == to.category
            }
            _ => true,
        }
    }
}

impl fmt::Display for Tag<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.prefix {
            TagPrefix::Begin => write!(f, "B-{}", self.category),
            TagPrefix::Inside => write!(f, "I-{}", self.category),
            TagPrefix::End => write!(f, "E-{}", self.category),
            TagPrefix::Single => write!(f, "S-{}", self.category),
            TagPrefix::Plain => write!(f, "{}", self.category),
            TagPrefix::Outside => write!(f, "{OUTSIDE}"),
        }
    }
}

/// An entity span over token offsets. `start` and `end` are both inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    /// Entity category, e.g. `PER`.
    pub category: String,
    /// Index of the first token.
    pub start: usize,
    /// Index of the last token.
    pub end: usize,
}

impl Span {
    /// Span of `category` covering tokens `start..=end`.
    pub fn new(category: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            category: category.into(),
            start,
            end,
        }
    }
}

/// Group a tag sequence into entity spans.
///
/// A span opens on `B-X` (or on an orphan `I-X`/`E-X`/`X`), keeps growing
/// while tags of the same category continue it and closes on `E-X`, on `O`,
/// on a new begin, or on a category change. `S-X` is a span of its own.
pub fn extract_spans<S: AsRef<str>>(tags: &[S]) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut open: Option<(&str, usize)> = None;

    for (i, label) in tags.iter().enumerate() {
        let tag = Tag::parse(label.as_ref());

        match tag.prefix {
            TagPrefix::Outside => {
                if let Some((category, start)) = open.take() {
                    spans.push(Span::new(category, start, i - 1));
                }
            }
            TagPrefix::Begin => {
                if let Some((category, start)) = open.take() {
                    spans.push(Span::new(category, start, i - 1));
                }
                open = Some((tag.category, i));
            }
            TagPrefix::Single => {
                if let Some((category, start)) = open.take() {
                    spans.push(Span::new(category, start, i - 1));
                }
                spans.push(Span::new(tag.category, i, i));
            }
            TagPrefix::Inside | TagPrefix::Plain => match open {
                Some((category, _)) if category == tag.category => {}
                _ => {
                    if let Some((category, start)) = open.take() {
                        spans.push(Span::new(category, start, i - 1));
                    }
                    open = Some((tag.category, i));
                }
            },
            TagPrefix::End => match open.take() {
                Some((category, start)) if category == tag.category => {
                    spans.push(Span::new(category, start, i));
                }
                other => {
                    if let Some((category, start)) = other {
                        spans.push(Span::new(category, start, i - 1));
                    }
                    spans.push(Span::new(tag.category, i, i));
                }
            },
        }
    }

    if let Some((category, start)) = open {
        spans.push(Span::new(category, start, tags.len() - 1));
    }

    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(tags: &[&str]) -> Vec<Span> {
        extract_spans(tags)
    }

    #[test]
    fn test_parse_prefixes() {
        assert_eq!(Tag::parse("B-PER").prefix, TagPrefix::Begin);
        assert_eq!(Tag::parse("I-PER").category, "PER");
        assert_eq!(Tag::parse("E-LOC").prefix, TagPrefix::End);
        assert_eq!(Tag::parse("L-LOC").prefix, TagPrefix::End);
        assert_eq!(Tag::parse("U-ORG").prefix, TagPrefix::Single);
        assert_eq!(Tag::parse("O").prefix, TagPrefix::Outside);
        assert_eq!(Tag::parse("<PAD>").prefix, TagPrefix::Outside);
        assert_eq!(Tag::parse("DATE").prefix, TagPrefix::Plain);
        assert_eq!(Tag::parse("B-date-time").category, "date-time");
    }

    #[test]
    fn test_display_roundtrip() {
        for label in ["B-PER", "I-PER", "E-PER", "S-PER", "O", "DATE"] {
            assert_eq!(Tag::parse(label).to_string(), label);
        }
    }

    #[test]
    fn test_bio_spans() {
        let result = spans(&["B-PER", "I-PER", "O", "B-LOC"]);
        assert_eq!(
            result,
            vec![Span::new("PER", 0, 1), Span::new("LOC", 3, 3)]
        );
    }

    #[test]
    fn test_bioes_spans() {
        let result = spans(&["B-ORG", "I-ORG", "E-ORG", "S-PER", "O", "S-LOC"]);
        assert_eq!(
            result,
            vec![
                Span::new("ORG", 0, 2),
                Span::new("PER", 3, 3),
                Span::new("LOC", 5, 5)
            ]
        );
    }

    #[test]
    fn test_category_change_closes_span() {
        let result = spans(&["B-PER", "I-LOC", "I-LOC"]);
        assert_eq!(
            result,
            vec![Span::new("PER", 0, 0), Span::new("LOC", 1, 2)]
        );
    }

    #[test]
    fn test_consecutive_begins() {
        let result = spans(&["B-PER", "B-PER", "I-PER"]);
        assert_eq!(
            result,
            vec![Span::new("PER", 0, 0), Span::new("PER", 1, 2)]
        );
    }

    #[test]
    fn test_orphan_inside_starts_span() {
        let result = spans(&["O", "I-MISC", "I-MISC", "O"]);
        assert_eq!(result, vec![Span::new("MISC", 1, 2)]);
    }

    #[test]
    fn test_plain_labels() {
        let result = spans(&["DATE", "DATE", "O", "PER"]);
        assert_eq!(
            result,
            vec![Span::new("DATE", 0, 1), Span::new("PER", 3, 3)]
        );
    }

    #[test]
    fn test_empty_and_outside_only() {
        assert!(spans(&[]).is_empty());
        assert!(spans(&["O", "O"]).is_empty());
    }

    #[test]
    fn test_valid_transitions() {
        let b = Tag::parse("B-PER");
        let i = Tag::parse("I-PER");
        let o = Tag::parse("O");
        let i_loc = Tag::parse("I-LOC");
        assert!(Tag::is_valid_transition(b, i));
        assert!(Tag::is_valid_transition(i, i));
        assert!(Tag::is_valid_transition(o, b));
        assert!(!Tag::is_valid_transition(o, i));
        assert!(!Tag::is_valid_transition(i, i_loc));
        assert!(Tag::is_valid_transition(i, o));
    }

    #[test]
    fn test_entity_type() {
        assert_eq!(Tag::parse("B-PER").entity_type(), Some("PER"));
        assert_eq!(Tag::parse("O").entity_type(), None);
    }
}

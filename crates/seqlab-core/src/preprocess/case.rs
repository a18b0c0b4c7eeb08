//! Orthographic case features.
//!
//! Computed from the surface form only, so they apply to words never seen
//! during training.

use serde::{Deserialize, Serialize};

/// Version of the rule table in [`CaseFeature::classify`]. Persisted with the
/// preprocessor; a model trained with another table must not be loaded.
pub const CASE_RULES_VERSION: u32 = 1;

/// Shape class of a word. `Padding` is index 0 and never produced by
/// [`CaseFeature::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaseFeature {
    Padding,
    Numeric,
    MainlyNumeric,
    AllLower,
    AllUpper,
    InitialUpper,
    ContainsDigit,
    Mixed,
    Other,
}

impl CaseFeature {
    /// Size of the case vocabulary, padding included.
    pub const COUNT: usize = 9;

    pub fn all() -> &'static [CaseFeature] {
        &[
            CaseFeature::Padding,
            CaseFeature::Numeric,
            CaseFeature::MainlyNumeric,
            CaseFeature::AllLower,
            CaseFeature::AllUpper,
            CaseFeature::InitialUpper,
            CaseFeature::ContainsDigit,
            CaseFeature::Mixed,
            CaseFeature::Other,
        ]
    }

    pub fn index(&self) -> u32 {
        match self {
            CaseFeature::Padding => 0,
            CaseFeature::Numeric => 1,
            CaseFeature::MainlyNumeric => 2,
            CaseFeature::AllLower => 3,
            CaseFeature::AllUpper => 4,
            CaseFeature::InitialUpper => 5,
            CaseFeature::ContainsDigit => 6,
            CaseFeature::Mixed => 7,
            CaseFeature::Other => 8,
        }
    }

    pub fn from_index(idx: u32) -> Option<Self> {
        Self::all().get(idx as usize).copied()
    }

    /// Classify a token. First matching rule wins.
    pub fn classify(token: &str) -> Self {
        let total = token.chars().count();
        if total == 0 {
            return CaseFeature::Other;
        }

        let digits = token.chars().filter(char::is_ascii_digit).count();
        let letters: Vec<char> = token.chars().filter(|c| c.is_alphabetic()).collect();
        let uppers = letters.iter().filter(|c| c.is_uppercase()).count();
        let lowers = letters.iter().filter(|c| c.is_lowercase()).count();
        let all_letters = letters.len() == total;

        if digits == total {
            CaseFeature::Numeric
        } else if digits * 2 > total {
            CaseFeature::MainlyNumeric
        } else if all_letters && lowers == total {
            CaseFeature::AllLower
        } else if all_letters && uppers == total {
            CaseFeature::AllUpper
        } else if token.chars().next().is_some_and(char::is_uppercase) {
            CaseFeature::InitialUpper
        } else if digits > 0 {
            CaseFeature::ContainsDigit
        } else if uppers > 0 && lowers > 0 {
            CaseFeature::Mixed
        } else {
            CaseFeature::Other
        }
    }
}

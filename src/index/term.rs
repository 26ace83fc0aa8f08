//! Terms used to address postings and deletions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A `(field, text)` pair matching one indexed term exactly.
///
/// Text fields are matched against their analyzed terms, so the text must
/// already be in analyzed form (for the standard analyzer: lowercase).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub text: String,
}

impl Term {
    pub fn new<F: Into<String>, T: Into<String>>(field: F, text: T) -> Self {
        Term {
            field: field.into(),
            text: text.into(),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.text)
    }
}

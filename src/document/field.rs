//! Field values and indexing modes.

use serde::{Deserialize, Serialize};

use crate::error::{Result, XiphosError};

/// Represents a value for a field in a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Text value
    Text(String),
    /// 64-bit signed integer value
    Long(i64),
    /// Raw byte data
    Binary(Vec<u8>),
}

impl FieldValue {
    /// Get the value as text, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as an integer, if it is one.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            FieldValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the value as bytes, if it is binary.
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Short name of the value type.
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Text(_) => "text",
            FieldValue::Long(_) => "long",
            FieldValue::Binary(_) => "binary",
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Long(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Binary(value)
    }
}

/// Kind of a doc-value column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocValueKind {
    /// One `i64` per document.
    Numeric,
    /// One byte string per document.
    Binary,
}

/// How a field is indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexingMode {
    /// Analyzed into terms with positions.
    IndexedText,
    /// Indexed as a single untokenized term.
    IndexedExact,
    /// Only stored.
    Stored,
    /// Columnar per-document value.
    DocValue(DocValueKind),
}

impl IndexingMode {
    /// Whether values of this mode go into the postings.
    pub fn is_indexed(&self) -> bool {
        matches!(self, IndexingMode::IndexedText | IndexingMode::IndexedExact)
    }

    /// Stable one-byte tag used by the on-disk schema.
    pub fn tag(&self) -> u8 {
        match self {
            IndexingMode::IndexedText => 0,
            IndexingMode::IndexedExact => 1,
            IndexingMode::Stored => 2,
            IndexingMode::DocValue(DocValueKind::Numeric) => 3,
            IndexingMode::DocValue(DocValueKind::Binary) => 4,
        }
    }

    /// Inverse of [`IndexingMode::tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(IndexingMode::IndexedText),
            1 => Some(IndexingMode::IndexedExact),
            2 => Some(IndexingMode::Stored),
            3 => Some(IndexingMode::DocValue(DocValueKind::Numeric)),
            4 => Some(IndexingMode::DocValue(DocValueKind::Binary)),
            _ => None,
        }
    }

    /// Human-readable name, used by the text codec.
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexingMode::IndexedText => "indexed_text",
            IndexingMode::IndexedExact => "indexed_exact",
            IndexingMode::Stored => "stored",
            IndexingMode::DocValue(DocValueKind::Numeric) => "doc_value_numeric",
            IndexingMode::DocValue(DocValueKind::Binary) => "doc_value_binary",
        }
    }

    /// Parse a name produced by [`IndexingMode::as_str`].
    pub fn parse(name: &str) -> Option<Self> {
        (0..=4)
            .filter_map(IndexingMode::from_tag)
            .find(|mode| mode.as_str() == name)
    }
}

/// Whether an indexed field value is also kept in the stored fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Store {
    Yes,
    No,
}

/// A named value with its indexing mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// The field name.
    pub name: String,

    /// The field value.
    pub value: FieldValue,

    /// How the field is indexed.
    pub mode: IndexingMode,

    /// Whether the value is stored.
    pub stored: bool,
}

impl Field {
    /// Create a new field, checking that the value fits the mode.
    pub fn new<S: Into<String>>(
        name: S,
        value: FieldValue,
        mode: IndexingMode,
        store: Store,
    ) -> Result<Self> {
        let name = name.into();
        let stored = match mode {
            IndexingMode::Stored => true,
            IndexingMode::DocValue(_) => false,
            IndexingMode::IndexedText | IndexingMode::IndexedExact => store == Store::Yes,
        };
        let field = Field {
            name,
            value,
            mode,
            stored,
        };
        field.validate()?;
        Ok(field)
    }

    /// Check that the value type is compatible with the indexing mode.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(XiphosError::invalid_argument("field name must not be empty"));
        }
        let ok = match (&self.mode, &self.value) {
            (IndexingMode::IndexedText | IndexingMode::IndexedExact, FieldValue::Text(_)) => true,
            (IndexingMode::Stored, _) => true,
            (IndexingMode::DocValue(DocValueKind::Numeric), FieldValue::Long(_)) => true,
            (IndexingMode::DocValue(DocValueKind::Binary), FieldValue::Binary(_)) => true,
            _ => false,
        };
        if !ok {
            return Err(XiphosError::invalid_argument(format!(
                "field '{}' with mode {} cannot hold a {} value",
                self.name,
                self.mode.as_str(),
                self.value.type_name()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_tags_roundtrip() {
        for tag in 0..=4 {
            let mode = IndexingMode::from_tag(tag).unwrap();
            assert_eq!(mode.tag(), tag);
            assert_eq!(IndexingMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(IndexingMode::from_tag(9), None);
        assert_eq!(IndexingMode::parse("vector"), None);
    }

    #[test]
    fn test_stored_flag_follows_mode() {
        let f = Field::new("a", "x".into(), IndexingMode::IndexedText, Store::No).unwrap();
        assert!(!f.stored);

        let f = Field::new("a", 7.into(), IndexingMode::Stored, Store::No).unwrap();
        assert!(f.stored);

        let mode = IndexingMode::DocValue(DocValueKind::Numeric);
        let f = Field::new("a", 7.into(), mode, Store::Yes).unwrap();
        assert!(!f.stored);
    }

    #[test]
    fn test_value_must_match_mode() {
        let err = Field::new("a", 7.into(), IndexingMode::IndexedExact, Store::Yes).unwrap_err();
        assert!(matches!(err, XiphosError::InvalidArgument(_)));

        let mode = IndexingMode::DocValue(DocValueKind::Binary);
        assert!(Field::new("a", "text".into(), mode, Store::No).is_err());
        assert!(Field::new("", "text".into(), IndexingMode::Stored, Store::No).is_err());
    }
}

//! Doc-value columns.
//!
//! Column-oriented per-document values used for sorting. Each column is
//! dense over the segment's ordinals; documents without a value hold `None`.

use std::collections::BTreeMap;

use crate::document::field::DocValueKind;
use crate::error::{Result, XiphosError};

/// One doc-value column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocValuesColumn {
    Numeric(Vec<Option<i64>>),
    Binary(Vec<Option<Vec<u8>>>),
}

impl DocValuesColumn {
    /// An all-missing column of the given kind.
    pub fn empty(kind: DocValueKind, doc_count: usize) -> Self {
        match kind {
            DocValueKind::Numeric => DocValuesColumn::Numeric(vec![None; doc_count]),
            DocValueKind::Binary => DocValuesColumn::Binary(vec![None; doc_count]),
        }
    }

    pub fn kind(&self) -> DocValueKind {
        match self {
            DocValuesColumn::Numeric(_) => DocValueKind::Numeric,
            DocValuesColumn::Binary(_) => DocValueKind::Binary,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DocValuesColumn::Numeric(values) => values.len(),
            DocValuesColumn::Binary(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `doc` has a value.
    pub fn has_value(&self, doc: u32) -> bool {
        match self {
            DocValuesColumn::Numeric(values) => {
                values.get(doc as usize).is_some_and(Option::is_some)
            }
            DocValuesColumn::Binary(values) => {
                values.get(doc as usize).is_some_and(Option::is_some)
            }
        }
    }

    pub fn numeric(&self, doc: u32) -> Option<i64> {
        match self {
            DocValuesColumn::Numeric(values) => values.get(doc as usize).copied().flatten(),
            DocValuesColumn::Binary(_) => None,
        }
    }

    pub fn binary(&self, doc: u32) -> Option<&[u8]> {
        match self {
            DocValuesColumn::Binary(values) => {
                values.get(doc as usize).and_then(|v| v.as_deref())
            }
            DocValuesColumn::Numeric(_) => None,
        }
    }

    /// Grow the column with missing values up to `doc_count` entries.
    pub fn pad_to(&mut self, doc_count: usize) {
        match self {
            DocValuesColumn::Numeric(values) => values.resize(doc_count, None),
            DocValuesColumn::Binary(values) => values.resize(doc_count, None),
        }
    }

    /// Copy the value of `doc` in `source` to the end of this column.
    pub(crate) fn push_from(&mut self, source: &DocValuesColumn, doc: u32) -> Result<()> {
        match (self, source) {
            (DocValuesColumn::Numeric(dst), DocValuesColumn::Numeric(src)) => {
                dst.push(src.get(doc as usize).copied().flatten());
            }
            (DocValuesColumn::Binary(dst), DocValuesColumn::Binary(src)) => {
                dst.push(src.get(doc as usize).cloned().flatten());
            }
            (dst, src) => {
                return Err(XiphosError::schema(format!(
                    "doc-value column kind mismatch: {:?} vs {:?}",
                    dst.kind(),
                    src.kind()
                )));
            }
        }
        Ok(())
    }
}

/// All doc-value columns of a segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocValues {
    doc_count: u32,
    columns: BTreeMap<String, DocValuesColumn>,
}

impl DocValues {
    pub fn new(doc_count: u32) -> Self {
        DocValues {
            doc_count,
            columns: BTreeMap::new(),
        }
    }

    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    /// Add a column. Its length must equal the segment's doc count.
    pub fn insert(&mut self, field: &str, column: DocValuesColumn) -> Result<()> {
        if column.len() != self.doc_count as usize {
            return Err(XiphosError::invalid_argument(format!(
                "doc-value column '{field}' has {} entries, expected {}",
                column.len(),
                self.doc_count
            )));
        }
        self.columns.insert(field.to_string(), column);
        Ok(())
    }

    pub fn column(&self, field: &str) -> Option<&DocValuesColumn> {
        self.columns.get(field)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &DocValuesColumn)> {
        self.columns.iter().map(|(name, column)| (name.as_str(), column))
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

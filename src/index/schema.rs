//! Field schema.
//!
//! A field name is bound to one [`IndexingMode`] the first time it is seen
//! and keeps it for the lifetime of the index. Each segment records the
//! schema of the fields it contains; the writer keeps the union of all of
//! them to reject conflicting documents before buffering anything.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::document::field::IndexingMode;
use crate::error::{Result, XiphosError};

/// Field name to indexing mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfos {
    fields: BTreeMap<String, IndexingMode>,
}

impl FieldInfos {
    pub fn new() -> Self {
        FieldInfos::default()
    }

    /// Mode bound to `name`, if any.
    pub fn mode(&self, name: &str) -> Option<IndexingMode> {
        self.fields.get(name).copied()
    }

    /// Fail if `name` is bound to a different mode.
    pub fn check(&self, name: &str, mode: IndexingMode) -> Result<()> {
        match self.fields.get(name) {
            Some(existing) if *existing != mode => Err(XiphosError::schema(format!(
                "field '{name}' is {} but was previously indexed as {}",
                mode.as_str(),
                existing.as_str()
            ))),
            _ => Ok(()),
        }
    }

    /// Bind `name` to `mode`, checking for conflicts first.
    pub fn add(&mut self, name: &str, mode: IndexingMode) -> Result<()> {
        self.check(name, mode)?;
        if !self.fields.contains_key(name) {
            self.fields.insert(name.to_string(), mode);
        }
        Ok(())
    }

    /// Union with another schema.
    pub fn merge(&mut self, other: &FieldInfos) -> Result<()> {
        for (name, mode) in other.iter() {
            self.add(name, mode)?;
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, IndexingMode)> {
        self.fields.iter().map(|(name, mode)| (name.as_str(), *mode))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::field::DocValueKind;

    #[test]
    fn test_conflicting_mode_is_rejected() {
        let mut infos = FieldInfos::new();
        infos.add("id", IndexingMode::IndexedExact).unwrap();
        infos.add("id", IndexingMode::IndexedExact).unwrap();

        let err = infos.add("id", IndexingMode::IndexedText).unwrap_err();
        assert!(matches!(err, XiphosError::SchemaConflict(_)));
        assert_eq!(infos.mode("id"), Some(IndexingMode::IndexedExact));
    }

    #[test]
    fn test_merge() {
        let mut a = FieldInfos::new();
        a.add("body", IndexingMode::IndexedText).unwrap();

        let mut b = FieldInfos::new();
        b.add("price", IndexingMode::DocValue(DocValueKind::Numeric))
            .unwrap();
        a.merge(&b).unwrap();
        assert_eq!(a.len(), 2);

        let mut c = FieldInfos::new();
        c.add("price", IndexingMode::DocValue(DocValueKind::Binary))
            .unwrap();
        assert!(a.merge(&c).is_err());
    }
}

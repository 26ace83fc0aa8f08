//! Documents and stored documents.

use serde::{Deserialize, Serialize};

use crate::document::field::{DocValueKind, Field, FieldValue, IndexingMode, Store};

/// A document represents a single item to be indexed.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct Document {
    fields: Vec<Field>,
}

impl Document {
    /// Create a new empty document.
    pub fn new() -> Self {
        Document { fields: Vec::new() }
    }

    /// Add a field to the document.
    pub fn add_field(&mut self, field: Field) {
        self.fields.push(field);
    }

    /// All fields, in insertion order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// First field with the given name.
    pub fn get_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Get the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the document is empty.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Create a builder for constructing documents.
    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::new()
    }
}

/// Builder for constructing documents.
///
/// The helpers build fields whose value type always matches their mode.
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    document: Document,
}

impl DocumentBuilder {
    /// Create a new document builder.
    pub fn new() -> Self {
        DocumentBuilder::default()
    }

    fn push(mut self, name: String, value: FieldValue, mode: IndexingMode, stored: bool) -> Self {
        self.document.add_field(Field {
            name,
            value,
            mode,
            stored,
        });
        self
    }

    /// Add an analyzed text field.
    pub fn add_text<S: Into<String>, T: Into<String>>(self, name: S, text: T, store: Store) -> Self {
        self.push(
            name.into(),
            FieldValue::Text(text.into()),
            IndexingMode::IndexedText,
            store == Store::Yes,
        )
    }

    /// Add a field indexed as one exact term.
    pub fn add_exact<S: Into<String>, T: Into<String>>(
        self,
        name: S,
        text: T,
        store: Store,
    ) -> Self {
        self.push(
            name.into(),
            FieldValue::Text(text.into()),
            IndexingMode::IndexedExact,
            store == Store::Yes,
        )
    }

    /// Add a stored-only field.
    pub fn add_stored<S: Into<String>, V: Into<FieldValue>>(self, name: S, value: V) -> Self {
        self.push(name.into(), value.into(), IndexingMode::Stored, true)
    }

    /// Add a numeric doc value.
    pub fn add_numeric_doc_value<S: Into<String>>(self, name: S, value: i64) -> Self {
        self.push(
            name.into(),
            FieldValue::Long(value),
            IndexingMode::DocValue(DocValueKind::Numeric),
            false,
        )
    }

    /// Add a binary doc value.
    pub fn add_binary_doc_value<S: Into<String>, B: Into<Vec<u8>>>(self, name: S, value: B) -> Self {
        self.push(
            name.into(),
            FieldValue::Binary(value.into()),
            IndexingMode::DocValue(DocValueKind::Binary),
            false,
        )
    }

    /// Add a prebuilt field.
    pub fn add_field(mut self, field: Field) -> Self {
        self.document.add_field(field);
        self
    }

    /// Build the document.
    pub fn build(self) -> Document {
        self.document
    }
}

/// A stored field value read back from a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredField {
    pub name: String,
    pub value: FieldValue,
}

/// The stored fields of one document, in indexing order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    fields: Vec<StoredField>,
}

impl StoredDocument {
    pub fn new(fields: Vec<StoredField>) -> Self {
        StoredDocument { fields }
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    /// First text value stored under `name`.
    pub fn get_text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_text)
    }

    /// Every value stored under `name`.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a FieldValue> + 'a {
        self.fields
            .iter()
            .filter(move |f| f.name == name)
            .map(|f| &f.value)
    }

    pub fn fields(&self) -> &[StoredField] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<StoredField> {
        self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

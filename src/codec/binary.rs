//! Compact binary codec.
//!
//! Postings are delta and varint encoded, doc-value columns are dense with a
//! presence bitmap, stored fields carry one type tag per value. Every file is
//! framed by a magic number, a format version and a CRC32 footer.

use bit_vec::BitVec;

use crate::codec::doc_values::{DocValues, DocValuesColumn};
use crate::codec::postings::{Posting, PostingList, SegmentPostings};
use crate::codec::stored::StoredFields;
use crate::codec::Codec;
use crate::document::document::{StoredDocument, StoredField};
use crate::document::field::{DocValueKind, FieldValue};
use crate::error::{Result, XiphosError};
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{Storage, StorageInput};

pub const POSTINGS_EXTENSION: &str = "pst";
pub const DOC_VALUES_EXTENSION: &str = "dvd";
pub const STORED_FIELDS_EXTENSION: &str = "fld";

const POSTINGS_MAGIC: u32 = 0x5850_5354; // "XPST"
const DOC_VALUES_MAGIC: u32 = 0x5844_5644; // "XDVD"
const STORED_FIELDS_MAGIC: u32 = 0x5846_4C44; // "XFLD"
const VERSION: u32 = 1;

const TAG_TEXT: u8 = 0;
const TAG_LONG: u8 = 1;
const TAG_BINARY: u8 = 2;

const KIND_NUMERIC: u8 = 0;
const KIND_BINARY: u8 = 1;

/// The default compact binary format.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

fn file_name(segment: &str, extension: &str) -> String {
    format!("{segment}.{extension}")
}

fn open(
    storage: &dyn Storage,
    segment: &str,
    name: &str,
    magic: u32,
) -> Result<StructReader<Box<dyn StorageInput>>> {
    let mut reader = StructReader::open(storage, name)?;
    reader.verify_integrity().map_err(|e| e.in_segment(segment))?;
    reader
        .check_header(magic, VERSION, VERSION)
        .map_err(|e| e.in_segment(segment))?;
    Ok(reader)
}

impl BinaryCodec {
    fn decode_postings(
        reader: &mut StructReader<Box<dyn StorageInput>>,
    ) -> Result<SegmentPostings> {
        let mut postings = SegmentPostings::new();
        let field_count = reader.read_len()?;
        for _ in 0..field_count {
            let field = reader.read_string()?;
            let term_count = reader.read_len()?;
            for _ in 0..term_count {
                let term = reader.read_string()?;
                let doc_count = reader.read_len()?;
                let mut list = PostingList::new();
                let mut doc = 0u32;
                for i in 0..doc_count {
                    let delta = reader.read_varint()?;
                    let base = if i == 0 { 0 } else { doc as u64 };
                    doc = base
                        .checked_add(delta)
                        .and_then(|value| u32::try_from(value).ok())
                        .ok_or_else(|| XiphosError::corrupt("", "doc ordinal overflows u32"))?;
                    let frequency = reader.read_len()?;
                    let mut positions = Vec::with_capacity(frequency);
                    let mut position = 0u32;
                    for _ in 0..frequency {
                        let delta = reader.read_varint()?;
                        position = (position as u64)
                            .checked_add(delta)
                            .and_then(|value| u32::try_from(value).ok())
                            .ok_or_else(|| XiphosError::corrupt("", "position overflows u32"))?;
                        positions.push(position);
                    }
                    list.push(Posting::with_positions(doc, positions));
                }
                postings.insert(&field, &term, list);
            }
        }
        Ok(postings)
    }

    fn decode_doc_values(reader: &mut StructReader<Box<dyn StorageInput>>) -> Result<DocValues> {
        let doc_count = u32::try_from(reader.read_varint()?)
            .map_err(|_| XiphosError::corrupt("", "doc count overflows u32"))?;
        let mut doc_values = DocValues::new(doc_count);
        let column_count = reader.read_len()?;
        for _ in 0..column_count {
            let field = reader.read_string()?;
            let kind = match reader.read_u8()? {
                KIND_NUMERIC => DocValueKind::Numeric,
                KIND_BINARY => DocValueKind::Binary,
                other => {
                    return Err(XiphosError::corrupt(
                        "",
                        format!("unknown doc-value kind {other}"),
                    ));
                }
            };
            let bitmap = BitVec::from_bytes(&reader.read_bytes()?);
            // Bounds the column allocation by the bytes actually on disk.
            if (bitmap.len() as u64) < doc_count as u64 {
                return Err(XiphosError::corrupt(
                    "",
                    format!(
                        "presence bitmap of '{field}' covers {} docs, expected {doc_count}",
                        bitmap.len()
                    ),
                ));
            }
            let mut column = DocValuesColumn::empty(kind, doc_count as usize);
            for doc in 0..doc_count as usize {
                if !bitmap.get(doc).unwrap_or(false) {
                    continue;
                }
                match &mut column {
                    DocValuesColumn::Numeric(values) => values[doc] = Some(reader.read_zigzag()?),
                    DocValuesColumn::Binary(values) => values[doc] = Some(reader.read_bytes()?),
                }
            }
            doc_values.insert(&field, column)?;
        }
        Ok(doc_values)
    }

    fn decode_stored(reader: &mut StructReader<Box<dyn StorageInput>>) -> Result<StoredFields> {
        let doc_count = reader.read_len()?;
        let mut stored = StoredFields::new();
        for _ in 0..doc_count {
            let field_count = reader.read_len()?;
            let mut fields = Vec::with_capacity(field_count);
            for _ in 0..field_count {
                let name = reader.read_string()?;
                let value = match reader.read_u8()? {
                    TAG_TEXT => FieldValue::Text(reader.read_string()?),
                    TAG_LONG => FieldValue::Long(reader.read_zigzag()?),
                    TAG_BINARY => FieldValue::Binary(reader.read_bytes()?),
                    other => {
                        return Err(XiphosError::corrupt(
                            "",
                            format!("unknown stored value tag {other}"),
                        ));
                    }
                };
                fields.push(StoredField { name, value });
            }
            stored.push(StoredDocument::new(fields));
        }
        Ok(stored)
    }
}

impl Codec for BinaryCodec {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn write_postings(
        &self,
        storage: &dyn Storage,
        segment: &str,
        postings: &SegmentPostings,
    ) -> Result<String> {
        let name = file_name(segment, POSTINGS_EXTENSION);
        let mut writer = StructWriter::create(storage, &name)?;
        writer.write_header(POSTINGS_MAGIC, VERSION)?;

        let fields: Vec<_> = postings.fields().collect();
        writer.write_varint(fields.len() as u64)?;
        for (field, terms) in fields {
            writer.write_string(field)?;
            writer.write_varint(terms.len() as u64)?;
            for (term, list) in terms {
                writer.write_string(term)?;
                writer.write_varint(list.len() as u64)?;
                let mut previous = 0u32;
                for (i, posting) in list.iter().enumerate() {
                    let delta = if i == 0 { posting.doc } else { posting.doc - previous };
                    writer.write_varint(delta as u64)?;
                    previous = posting.doc;

                    writer.write_varint(posting.positions.len() as u64)?;
                    let mut last_position = 0u32;
                    for &position in &posting.positions {
                        writer.write_varint((position - last_position) as u64)?;
                        last_position = position;
                    }
                }
            }
        }

        writer.close()?;
        Ok(name)
    }

    fn read_postings(&self, storage: &dyn Storage, segment: &str) -> Result<SegmentPostings> {
        let name = file_name(segment, POSTINGS_EXTENSION);
        let mut reader = open(storage, segment, &name, POSTINGS_MAGIC)?;
        let postings = Self::decode_postings(&mut reader).map_err(|e| e.in_segment(segment))?;
        reader.finish().map_err(|e| e.in_segment(segment))?;
        Ok(postings)
    }

    fn write_doc_values(
        &self,
        storage: &dyn Storage,
        segment: &str,
        doc_values: &DocValues,
    ) -> Result<String> {
        let name = file_name(segment, DOC_VALUES_EXTENSION);
        let mut writer = StructWriter::create(storage, &name)?;
        writer.write_header(DOC_VALUES_MAGIC, VERSION)?;
        writer.write_varint(doc_values.doc_count() as u64)?;

        let columns: Vec<_> = doc_values.columns().collect();
        writer.write_varint(columns.len() as u64)?;
        for (field, column) in columns {
            writer.write_string(field)?;
            let mut bitmap = BitVec::from_elem(column.len(), false);
            for doc in 0..column.len() {
                bitmap.set(doc, column.has_value(doc as u32));
            }
            match column {
                DocValuesColumn::Numeric(values) => {
                    writer.write_u8(KIND_NUMERIC)?;
                    writer.write_bytes(&bitmap.to_bytes())?;
                    for value in values.iter().flatten() {
                        writer.write_zigzag(*value)?;
                    }
                }
                DocValuesColumn::Binary(values) => {
                    writer.write_u8(KIND_BINARY)?;
                    writer.write_bytes(&bitmap.to_bytes())?;
                    for value in values.iter().flatten() {
                        writer.write_bytes(value)?;
                    }
                }
            }
        }

        writer.close()?;
        Ok(name)
    }

    fn read_doc_values(&self, storage: &dyn Storage, segment: &str) -> Result<DocValues> {
        let name = file_name(segment, DOC_VALUES_EXTENSION);
        let mut reader = open(storage, segment, &name, DOC_VALUES_MAGIC)?;
        let doc_values = Self::decode_doc_values(&mut reader).map_err(|e| e.in_segment(segment))?;
        reader.finish().map_err(|e| e.in_segment(segment))?;
        Ok(doc_values)
    }

    fn write_stored_fields(
        &self,
        storage: &dyn Storage,
        segment: &str,
        stored: &StoredFields,
    ) -> Result<String> {
        let name = file_name(segment, STORED_FIELDS_EXTENSION);
        let mut writer = StructWriter::create(storage, &name)?;
        writer.write_header(STORED_FIELDS_MAGIC, VERSION)?;
        writer.write_varint(stored.len() as u64)?;

        for doc in stored.iter() {
            writer.write_varint(doc.len() as u64)?;
            for field in doc.fields() {
                writer.write_string(&field.name)?;
                match &field.value {
                    FieldValue::Text(text) => {
                        writer.write_u8(TAG_TEXT)?;
                        writer.write_string(text)?;
                    }
                    FieldValue::Long(value) => {
                        writer.write_u8(TAG_LONG)?;
                        writer.write_zigzag(*value)?;
                    }
                    FieldValue::Binary(bytes) => {
                        writer.write_u8(TAG_BINARY)?;
                        writer.write_bytes(bytes)?;
                    }
                }
            }
        }

        writer.close()?;
        Ok(name)
    }

    fn read_stored_fields(&self, storage: &dyn Storage, segment: &str) -> Result<StoredFields> {
        let name = file_name(segment, STORED_FIELDS_EXTENSION);
        let mut reader = open(storage, segment, &name, STORED_FIELDS_MAGIC)?;
        let stored = Self::decode_stored(&mut reader).map_err(|e| e.in_segment(segment))?;
        reader.finish().map_err(|e| e.in_segment(segment))?;
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;
    use crate::storage::StorageOutput;
    use crate::storage::memory::MemoryStorage;

    fn sample_postings() -> SegmentPostings {
        let mut postings = SegmentPostings::new();
        let mut list = PostingList::new();
        list.push(Posting::with_positions(0, vec![0, 5]));
        list.push(Posting::with_positions(7, vec![2]));
        postings.insert("body", "fox", list);

        let mut list = PostingList::new();
        list.push(Posting::with_positions(3, vec![0]));
        postings.insert("id", "", list);
        postings
    }

    #[test]
    fn test_postings_roundtrip() {
        let storage = MemoryStorage::new_default();
        let postings = sample_postings();

        let name = BinaryCodec.write_postings(&storage, "_0", &postings).unwrap();
        assert_eq!(name, "_0.pst");
        assert_eq!(BinaryCodec.read_postings(&storage, "_0").unwrap(), postings);
    }

    #[test]
    fn test_doc_values_roundtrip() {
        let storage = MemoryStorage::new_default();
        let mut doc_values = DocValues::new(3);
        doc_values
            .insert("price", DocValuesColumn::Numeric(vec![Some(-3), None, Some(i64::MAX)]))
            .unwrap();
        doc_values
            .insert(
                "tag",
                DocValuesColumn::Binary(vec![None, Some(Vec::new()), Some(vec![0, 255])]),
            )
            .unwrap();

        BinaryCodec.write_doc_values(&storage, "_1", &doc_values).unwrap();
        assert_eq!(BinaryCodec.read_doc_values(&storage, "_1").unwrap(), doc_values);
    }

    #[test]
    fn test_stored_fields_roundtrip() {
        let storage = MemoryStorage::new_default();
        let stored = StoredFields::from_docs(vec![
            StoredDocument::new(vec![
                StoredField {
                    name: "title".into(),
                    value: FieldValue::Text("héllo\nworld".into()),
                },
                StoredField {
                    name: "n".into(),
                    value: FieldValue::Long(-42),
                },
            ]),
            StoredDocument::default(),
            StoredDocument::new(vec![StoredField {
                name: "raw".into(),
                value: FieldValue::Binary(vec![1, 2, 3]),
            }]),
        ]);

        BinaryCodec.write_stored_fields(&storage, "_2", &stored).unwrap();
        assert_eq!(BinaryCodec.read_stored_fields(&storage, "_2").unwrap(), stored);
    }

    fn sample_doc_values() -> DocValues {
        let mut doc_values = DocValues::new(3);
        doc_values
            .insert("price", DocValuesColumn::Numeric(vec![Some(1), None, Some(3)]))
            .unwrap();
        doc_values
    }

    fn read_file(storage: &MemoryStorage, name: &str) -> Vec<u8> {
        let mut bytes = Vec::new();
        storage
            .open_input(name)
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        bytes
    }

    /// Replace `name`, optionally recomputing the CRC footer over the new body.
    fn rewrite(storage: &MemoryStorage, name: &str, mut bytes: Vec<u8>, fix_checksum: bool) {
        if fix_checksum {
            let body = bytes.len() - 4;
            let checksum = crc32fast::hash(&bytes[..body]);
            bytes[body..].copy_from_slice(&checksum.to_le_bytes());
        }
        storage.delete_file(name).unwrap();
        let mut output = storage.create_output(name).unwrap();
        output.write_all(&bytes).unwrap();
        output.close().unwrap();
    }

    /// Header is 8 bytes; the doc count varint of a 3-doc file is byte 8.
    fn with_huge_doc_count(bytes: &[u8]) -> Vec<u8> {
        assert_eq!(bytes[8], 3);
        let mut damaged = bytes[..8].to_vec();
        damaged.extend_from_slice(&[0xff, 0xff, 0xff, 0xff, 0x0f]);
        damaged.extend_from_slice(&bytes[9..]);
        damaged
    }

    #[test]
    fn test_damaged_length_field_is_corruption() {
        let storage = MemoryStorage::new_default();
        BinaryCodec
            .write_doc_values(&storage, "_6", &sample_doc_values())
            .unwrap();
        let bytes = with_huge_doc_count(&read_file(&storage, "_6.dvd"));
        rewrite(&storage, "_6.dvd", bytes, false);

        let err = BinaryCodec.read_doc_values(&storage, "_6").unwrap_err();
        match err {
            XiphosError::CorruptSegment { segment, reason } => {
                assert_eq!(segment, "_6");
                assert!(reason.contains("checksum mismatch"), "{reason}");
            }
            other => panic!("expected corruption, got {other}"),
        }
    }

    #[test]
    fn test_doc_count_beyond_bitmap_is_corruption() {
        let storage = MemoryStorage::new_default();
        BinaryCodec
            .write_doc_values(&storage, "_7", &sample_doc_values())
            .unwrap();
        let bytes = with_huge_doc_count(&read_file(&storage, "_7.dvd"));
        rewrite(&storage, "_7.dvd", bytes, true);

        let err = BinaryCodec.read_doc_values(&storage, "_7").unwrap_err();
        match err {
            XiphosError::CorruptSegment { segment, reason } => {
                assert_eq!(segment, "_7");
                assert!(reason.contains("presence bitmap"), "{reason}");
            }
            other => panic!("expected corruption, got {other}"),
        }
    }

    #[test]
    fn test_position_overflow_is_corruption() {
        let storage = MemoryStorage::new_default();
        let mut postings = SegmentPostings::new();
        let mut list = PostingList::new();
        list.push(Posting::with_positions(0, vec![u32::MAX - 1, u32::MAX]));
        postings.insert("f", "t", list);
        BinaryCodec.write_postings(&storage, "_8", &postings).unwrap();

        // The second position delta is the varint 0x01 just before the footer.
        let mut bytes = read_file(&storage, "_8.pst");
        let delta = bytes.len() - 5;
        assert_eq!(bytes[delta], 1);
        bytes[delta] = 2;
        rewrite(&storage, "_8.pst", bytes, true);

        let err = BinaryCodec.read_postings(&storage, "_8").unwrap_err();
        assert!(err.is_corruption(), "{err}");
    }

    #[test]
    fn test_corruption_names_segment() {
        let storage = MemoryStorage::new_default();
        BinaryCodec
            .write_postings(&storage, "_5", &sample_postings())
            .unwrap();

        let mut bytes = Vec::new();
        storage
            .open_input("_5.pst")
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        storage.delete_file("_5.pst").unwrap();
        let mut output = storage.create_output("_5.pst").unwrap();
        output.write_all(&bytes).unwrap();
        output.close().unwrap();

        let err = BinaryCodec.read_postings(&storage, "_5").unwrap_err();
        match err {
            XiphosError::CorruptSegment { segment, .. } => assert_eq!(segment, "_5"),
            other => panic!("expected corruption, got {other}"),
        }
    }
}

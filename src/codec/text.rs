//! Human-readable line-oriented codec.
//!
//! Each file is a sequence of `key value` lines: a header line naming the
//! file kind, the records, an `END` line and a final `checksum` line holding
//! the CRC32 of everything before it. Strings are escaped (`\\`, `\n`, `\r`)
//! so one value never spans lines; binary values are lowercase hex.
//!
//! ```text
//! xiphos_text postings 1
//! field body
//! term fox
//! doc 0
//! freq 2
//! pos 0 5
//! END
//! checksum 3f0a21c4
//! ```

use std::fmt::Display;
use std::io::{Read, Write};
use std::str::FromStr;

use crate::codec::doc_values::{DocValues, DocValuesColumn};
use crate::codec::postings::{Posting, PostingList, SegmentPostings};
use crate::codec::stored::StoredFields;
use crate::codec::Codec;
use crate::document::document::{StoredDocument, StoredField};
use crate::document::field::{DocValueKind, FieldValue};
use crate::error::{Result, XiphosError};
use crate::storage::{Storage, StorageOutput};

pub const POSTINGS_EXTENSION: &str = "pst.txt";
pub const DOC_VALUES_EXTENSION: &str = "dvd.txt";
pub const STORED_FIELDS_EXTENSION: &str = "fld.txt";

const HEADER: &str = "xiphos_text";
const VERSION: u32 = 1;

/// Debugging codec whose files can be read with any text editor.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextCodec;

pub(crate) fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

pub(crate) fn unescape(value: &str) -> Option<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            '\\' => out.push('\\'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            _ => return None,
        }
    }
    Some(out)
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn from_hex(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(value.get(i..i + 2)?, 16).ok())
        .collect()
}

struct TextWriter {
    buffer: String,
}

impl TextWriter {
    fn new(kind: &str) -> Self {
        TextWriter {
            buffer: format!("{HEADER} {kind} {VERSION}\n"),
        }
    }

    fn line(&mut self, key: &str, value: impl Display) {
        self.buffer.push_str(key);
        self.buffer.push(' ');
        self.buffer.push_str(&value.to_string());
        self.buffer.push('\n');
    }

    fn text(&mut self, key: &str, value: &str) {
        self.line(key, escape(value));
    }

    fn finish(mut self, storage: &dyn Storage, name: &str) -> Result<()> {
        self.buffer.push_str("END\n");
        let checksum = crc32fast::hash(self.buffer.as_bytes());
        self.buffer.push_str(&format!("checksum {checksum:08x}\n"));

        let mut output = storage.create_output(name)?;
        output.write_all(self.buffer.as_bytes())?;
        output.close()
    }
}

struct TextReader {
    segment: String,
    lines: Vec<String>,
    position: usize,
}

impl TextReader {
    fn open(storage: &dyn Storage, segment: &str, name: &str, kind: &str) -> Result<Self> {
        let corrupt = |reason: String| XiphosError::corrupt(segment, format!("{name}: {reason}"));

        let mut bytes = Vec::new();
        storage.open_input(name)?.read_to_end(&mut bytes)?;
        let content =
            String::from_utf8(bytes).map_err(|e| corrupt(format!("invalid UTF-8: {e}")))?;

        let body_end = content
            .trim_end_matches('\n')
            .rfind('\n')
            .map(|i| i + 1)
            .ok_or_else(|| corrupt("missing checksum line".to_string()))?;
        let (body, footer) = content.split_at(body_end);
        let stored = footer
            .trim_end()
            .strip_prefix("checksum ")
            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
            .ok_or_else(|| corrupt("missing checksum line".to_string()))?;
        let actual = crc32fast::hash(body.as_bytes());
        if stored != actual {
            return Err(corrupt(format!(
                "checksum mismatch: stored {stored:08x}, computed {actual:08x}"
            )));
        }

        let mut lines: Vec<String> = body.lines().map(str::to_string).collect();
        if lines.pop().as_deref() != Some("END") {
            return Err(corrupt("missing END marker".to_string()));
        }
        let expected = format!("{HEADER} {kind} {VERSION}");
        if lines.first() != Some(&expected) {
            return Err(corrupt(format!("expected header '{expected}'")));
        }

        Ok(TextReader {
            segment: segment.to_string(),
            lines,
            position: 1,
        })
    }

    fn corrupt(&self, reason: impl Into<String>) -> XiphosError {
        XiphosError::corrupt(
            self.segment.clone(),
            format!("line {}: {}", self.position + 1, reason.into()),
        )
    }

    fn peek_key(&self) -> Option<&str> {
        self.lines
            .get(self.position)
            .map(|line| line.split_once(' ').map_or(line.as_str(), |(key, _)| key))
    }

    fn value(&mut self, key: &str) -> Result<String> {
        let line = self
            .lines
            .get(self.position)
            .ok_or_else(|| self.corrupt(format!("expected '{key}', found end of file")))?;
        let (actual, value) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        if actual != key {
            return Err(self.corrupt(format!("expected '{key}', found '{actual}'")));
        }
        let value = value.to_string();
        self.position += 1;
        Ok(value)
    }

    fn parse<T: FromStr>(&mut self, key: &str) -> Result<T> {
        let value = self.value(key)?;
        value
            .parse()
            .map_err(|_| self.corrupt(format!("invalid value for '{key}': {value}")))
    }

    fn text(&mut self, key: &str) -> Result<String> {
        let value = self.value(key)?;
        unescape(&value).ok_or_else(|| self.corrupt(format!("bad escape in '{key}'")))
    }

    fn hex(&mut self, key: &str) -> Result<Vec<u8>> {
        let value = self.value(key)?;
        from_hex(&value).ok_or_else(|| self.corrupt(format!("bad hex in '{key}'")))
    }

    fn finish(self) -> Result<()> {
        if self.position != self.lines.len() {
            return Err(self.corrupt("unexpected trailing records"));
        }
        Ok(())
    }
}

fn file_name(segment: &str, extension: &str) -> String {
    format!("{segment}.{extension}")
}

impl Codec for PlainTextCodec {
    fn name(&self) -> &'static str {
        "text"
    }

    fn write_postings(
        &self,
        storage: &dyn Storage,
        segment: &str,
        postings: &SegmentPostings,
    ) -> Result<String> {
        let name = file_name(segment, POSTINGS_EXTENSION);
        let mut out = TextWriter::new("postings");
        for (field, terms) in postings.fields() {
            out.text("field", field);
            for (term, list) in terms {
                out.text("term", term);
                for posting in list.iter() {
                    out.line("doc", posting.doc);
                    out.line("freq", posting.frequency);
                    let positions: Vec<String> =
                        posting.positions.iter().map(u32::to_string).collect();
                    out.line("pos", positions.join(" "));
                }
            }
        }
        out.finish(storage, &name)?;
        Ok(name)
    }

    fn read_postings(&self, storage: &dyn Storage, segment: &str) -> Result<SegmentPostings> {
        let name = file_name(segment, POSTINGS_EXTENSION);
        let mut input = TextReader::open(storage, segment, &name, "postings")?;
        let mut postings = SegmentPostings::new();

        while input.peek_key() == Some("field") {
            let field = input.text("field")?;
            while input.peek_key() == Some("term") {
                let term = input.text("term")?;
                let mut list = PostingList::new();
                while input.peek_key() == Some("doc") {
                    let doc: u32 = input.parse("doc")?;
                    let frequency: u32 = input.parse("freq")?;
                    let raw = input.value("pos")?;
                    let positions = raw
                        .split_whitespace()
                        .map(str::parse::<u32>)
                        .collect::<std::result::Result<Vec<_>, _>>()
                        .map_err(|_| input.corrupt(format!("invalid positions: {raw}")))?;
                    if positions.len() != frequency as usize {
                        return Err(input.corrupt("frequency does not match positions"));
                    }
                    if list.postings.last().is_some_and(|p| p.doc >= doc) {
                        return Err(input.corrupt("doc ordinals out of order"));
                    }
                    list.push(Posting::with_positions(doc, positions));
                }
                postings.insert(&field, &term, list);
            }
        }

        input.finish()?;
        Ok(postings)
    }

    fn write_doc_values(
        &self,
        storage: &dyn Storage,
        segment: &str,
        doc_values: &DocValues,
    ) -> Result<String> {
        let name = file_name(segment, DOC_VALUES_EXTENSION);
        let mut out = TextWriter::new("doc_values");
        out.line("doc_count", doc_values.doc_count());
        for (field, column) in doc_values.columns() {
            out.text("column", field);
            match column {
                DocValuesColumn::Numeric(values) => {
                    out.line("kind", "numeric");
                    for (doc, value) in values.iter().enumerate() {
                        if let Some(value) = value {
                            out.line("doc", doc);
                            out.line("value", value);
                        }
                    }
                }
                DocValuesColumn::Binary(values) => {
                    out.line("kind", "binary");
                    for (doc, value) in values.iter().enumerate() {
                        if let Some(value) = value {
                            out.line("doc", doc);
                            out.line("value", to_hex(value));
                        }
                    }
                }
            }
        }
        out.finish(storage, &name)?;
        Ok(name)
    }

    fn read_doc_values(&self, storage: &dyn Storage, segment: &str) -> Result<DocValues> {
        let name = file_name(segment, DOC_VALUES_EXTENSION);
        let mut input = TextReader::open(storage, segment, &name, "doc_values")?;
        let doc_count: u32 = input.parse("doc_count")?;
        let mut doc_values = DocValues::new(doc_count);

        while input.peek_key() == Some("column") {
            let field = input.text("column")?;
            let kind = match input.value("kind")?.as_str() {
                "numeric" => DocValueKind::Numeric,
                "binary" => DocValueKind::Binary,
                other => return Err(input.corrupt(format!("unknown doc-value kind {other}"))),
            };
            let mut column = DocValuesColumn::empty(kind, doc_count as usize);
            while input.peek_key() == Some("doc") {
                let doc: usize = input.parse("doc")?;
                if doc >= doc_count as usize {
                    return Err(input.corrupt(format!("doc {doc} beyond doc_count {doc_count}")));
                }
                match &mut column {
                    DocValuesColumn::Numeric(values) => values[doc] = Some(input.parse("value")?),
                    DocValuesColumn::Binary(values) => values[doc] = Some(input.hex("value")?),
                }
            }
            doc_values.insert(&field, column)?;
        }

        input.finish()?;
        Ok(doc_values)
    }

    fn write_stored_fields(
        &self,
        storage: &dyn Storage,
        segment: &str,
        stored: &StoredFields,
    ) -> Result<String> {
        let name = file_name(segment, STORED_FIELDS_EXTENSION);
        let mut out = TextWriter::new("stored_fields");
        out.line("doc_count", stored.len());
        for (ordinal, doc) in stored.iter().enumerate() {
            out.line("doc", ordinal);
            for field in doc.fields() {
                out.text("field", &field.name);
                match &field.value {
                    FieldValue::Text(text) => {
                        out.line("type", "text");
                        out.text("value", text);
                    }
                    FieldValue::Long(value) => {
                        out.line("type", "long");
                        out.line("value", value);
                    }
                    FieldValue::Binary(bytes) => {
                        out.line("type", "binary");
                        out.line("value", to_hex(bytes));
                    }
                }
            }
        }
        out.finish(storage, &name)?;
        Ok(name)
    }

    fn read_stored_fields(&self, storage: &dyn Storage, segment: &str) -> Result<StoredFields> {
        let name = file_name(segment, STORED_FIELDS_EXTENSION);
        let mut input = TextReader::open(storage, segment, &name, "stored_fields")?;
        let doc_count: usize = input.parse("doc_count")?;
        let mut stored = StoredFields::new();

        for expected in 0..doc_count {
            let ordinal: usize = input.parse("doc")?;
            if ordinal != expected {
                return Err(input.corrupt(format!("expected doc {expected}, found {ordinal}")));
            }
            let mut fields = Vec::new();
            while input.peek_key() == Some("field") {
                let name = input.text("field")?;
                let value = match input.value("type")?.as_str() {
                    "text" => FieldValue::Text(input.text("value")?),
                    "long" => FieldValue::Long(input.parse("value")?),
                    "binary" => FieldValue::Binary(input.hex("value")?),
                    other => return Err(input.corrupt(format!("unknown value type {other}"))),
                };
                fields.push(StoredField { name, value });
            }
            stored.push(StoredDocument::new(fields));
        }

        input.finish()?;
        Ok(stored)
    }
}

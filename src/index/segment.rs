//! Segment metadata.
//!
//! Every sealed segment has an `.si` file describing it: id, codec, document
//! count, field schema, the list of files the codec wrote and diagnostics.
//! The per-commit state of a segment (its current live-docs generation and
//! deletion count) lives in [`SegmentCommitInfo`] and is recorded in the
//! commit file, not in the `.si`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::document::field::IndexingMode;
use crate::error::{Result, XiphosError};
use crate::index::schema::FieldInfos;
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

pub const SEGMENT_INFO_EXTENSION: &str = "si";
pub const LIVE_DOCS_EXTENSION: &str = "liv";

const SEGMENT_INFO_MAGIC: u32 = 0x5853_4946; // "XSIF"
const SEGMENT_INFO_VERSION: u32 = 1;

/// Lowercase base-36 rendering used in file names.
pub fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Parse a lowercase base-36 number.
pub fn from_base36(value: &str) -> Option<u64> {
    if value.is_empty() || value.chars().any(|c| c.is_ascii_uppercase()) {
        return None;
    }
    u64::from_str_radix(value, 36).ok()
}

/// `_<id base36>`
pub fn segment_name(id: u64) -> String {
    format!("_{}", to_base36(id))
}

/// `_<id>_<gen>.liv`
pub fn live_docs_file_name(segment: &str, del_gen: u64) -> String {
    format!("{segment}_{}.{LIVE_DOCS_EXTENSION}", to_base36(del_gen))
}

/// Split an index file name into segment id and, for live-docs files, the
/// deletion generation.
pub fn parse_segment_file(name: &str) -> Option<(u64, Option<u64>)> {
    let rest = name.strip_prefix('_')?;
    let stem = rest.split('.').next()?;
    match stem.split_once('_') {
        Some((id, del_gen)) => Some((from_base36(id)?, Some(from_base36(del_gen)?))),
        None => Some((from_base36(stem)?, None)),
    }
}

/// Whether `file` belongs to the segment called `segment`.
pub fn belongs_to(file: &str, segment: &str) -> bool {
    file.strip_prefix(segment)
        .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('_'))
}

/// Immutable description of a sealed segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub id: u64,
    pub name: String,
    pub codec: String,
    pub doc_count: u32,
    pub fields: FieldInfos,
    /// Codec files plus the `.si` itself.
    pub files: Vec<String>,
    pub diagnostics: BTreeMap<String, String>,
}

impl SegmentInfo {
    pub fn info_file_name(segment: &str) -> String {
        format!("{segment}.{SEGMENT_INFO_EXTENSION}")
    }

    /// Write the `.si` file. The name is appended to `files` first.
    pub fn write(&mut self, storage: &dyn Storage) -> Result<()> {
        let file = Self::info_file_name(&self.name);
        if !self.files.contains(&file) {
            self.files.push(file.clone());
        }

        let mut writer = StructWriter::create(storage, &file)?;
        writer.write_header(SEGMENT_INFO_MAGIC, SEGMENT_INFO_VERSION)?;
        writer.write_u64(self.id)?;
        writer.write_string(&self.name)?;
        writer.write_string(&self.codec)?;
        writer.write_u32(self.doc_count)?;

        writer.write_varint(self.fields.len() as u64)?;
        for (name, mode) in self.fields.iter() {
            writer.write_string(name)?;
            writer.write_u8(mode.tag())?;
        }

        writer.write_varint(self.files.len() as u64)?;
        for name in &self.files {
            writer.write_string(name)?;
        }
        writer.write_string_map(&self.diagnostics)?;
        writer.close()
    }

    /// Read the `.si` file of `segment`.
    pub fn read(storage: &dyn Storage, segment: &str) -> Result<SegmentInfo> {
        let file = Self::info_file_name(segment);
        let mut reader = StructReader::open(storage, &file)?;
        let decode = |reader: &mut StructReader<_>| -> Result<SegmentInfo> {
            reader.check_header(SEGMENT_INFO_MAGIC, SEGMENT_INFO_VERSION, SEGMENT_INFO_VERSION)?;
            let id = reader.read_u64()?;
            let name = reader.read_string()?;
            let codec = reader.read_string()?;
            let doc_count = reader.read_u32()?;

            let mut fields = FieldInfos::new();
            for _ in 0..reader.read_len()? {
                let field = reader.read_string()?;
                let tag = reader.read_u8()?;
                let mode = IndexingMode::from_tag(tag).ok_or_else(|| {
                    XiphosError::corrupt(segment, format!("unknown indexing mode tag {tag}"))
                })?;
                fields.add(&field, mode)?;
            }

            let count = reader.read_len()?;
            let mut files = Vec::with_capacity(count);
            for _ in 0..count {
                files.push(reader.read_string()?);
            }
            let diagnostics = reader.read_string_map()?;

            Ok(SegmentInfo {
                id,
                name,
                codec,
                doc_count,
                fields,
                files,
                diagnostics,
            })
        };
        let info = decode(&mut reader).map_err(|e| e.in_segment(segment))?;
        reader.finish().map_err(|e| e.in_segment(segment))?;

        if info.name != segment {
            return Err(XiphosError::corrupt(
                segment,
                format!("segment info names '{}'", info.name),
            ));
        }
        Ok(info)
    }
}

/// A segment as referenced by one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentCommitInfo {
    pub info: Arc<SegmentInfo>,
    /// Generation of the live-docs file; 0 when all documents are live.
    pub del_gen: u64,
    pub del_count: u32,
}

impl SegmentCommitInfo {
    pub fn new(info: Arc<SegmentInfo>) -> Self {
        SegmentCommitInfo {
            info,
            del_gen: 0,
            del_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn live_docs_file(&self) -> Option<String> {
        (self.del_gen > 0).then(|| live_docs_file_name(&self.info.name, self.del_gen))
    }

    pub fn num_docs(&self) -> u32 {
        self.info.doc_count.saturating_sub(self.del_count)
    }

    /// All files of this segment, live docs included.
    pub fn files(&self) -> Vec<String> {
        let mut files = self.info.files.clone();
        files.extend(self.live_docs_file());
        files
    }
}

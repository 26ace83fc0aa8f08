//! Live-docs bitsets.
//!
//! A set bit marks a live ordinal. Segments without deletions have no
//! live-docs file at all. Each deletion pass that touches a committed
//! segment writes a new generation; older generations stay on disk for the
//! readers that still hold them.

use bit_vec::BitVec;

use crate::error::{Result, XiphosError};
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

const LIVE_DOCS_MAGIC: u32 = 0x584C_4956; // "XLIV"
const LIVE_DOCS_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveDocs {
    bits: BitVec,
    live: u32,
}

impl LiveDocs {
    /// Every ordinal below `doc_count` live.
    pub fn all_live(doc_count: u32) -> Self {
        LiveDocs {
            bits: BitVec::from_elem(doc_count as usize, true),
            live: doc_count,
        }
    }

    pub fn is_live(&self, doc: u32) -> bool {
        self.bits.get(doc as usize).unwrap_or(false)
    }

    /// Clear the bit of `doc`. Returns true if it was live.
    pub fn delete(&mut self, doc: u32) -> bool {
        if self.is_live(doc) {
            self.bits.set(doc as usize, false);
            self.live -= 1;
            true
        } else {
            false
        }
    }

    pub fn num_live(&self) -> u32 {
        self.live
    }

    pub fn num_deleted(&self) -> u32 {
        self.len() - self.live
    }

    pub fn len(&self) -> u32 {
        self.bits.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn write(&self, storage: &dyn Storage, name: &str) -> Result<()> {
        let mut writer = StructWriter::create(storage, name)?;
        writer.write_header(LIVE_DOCS_MAGIC, LIVE_DOCS_VERSION)?;
        writer.write_u32(self.len())?;
        writer.write_u32(self.live)?;
        writer.write_bytes(&self.bits.to_bytes())?;
        writer.close()
    }

    /// Read `name`, checking it against the segment's document count.
    pub fn read(storage: &dyn Storage, name: &str, doc_count: u32) -> Result<Self> {
        let mut reader = StructReader::open(storage, name)?;
        reader.check_header(LIVE_DOCS_MAGIC, LIVE_DOCS_VERSION, LIVE_DOCS_VERSION)?;
        let len = reader.read_u32()?;
        let live = reader.read_u32()?;
        let bytes = reader.read_bytes()?;
        reader.finish()?;

        if len != doc_count {
            return Err(XiphosError::corrupt(
                name,
                format!("live docs cover {len} documents, segment has {doc_count}"),
            ));
        }
        let mut bits = BitVec::from_bytes(&bytes);
        if bits.len() < len as usize {
            return Err(XiphosError::corrupt(name, "live docs bitmap truncated"));
        }
        bits.truncate(len as usize);

        let counted = bits.iter().filter(|bit| *bit).count() as u32;
        if counted != live {
            return Err(XiphosError::corrupt(
                name,
                format!("live count {live} does not match bitmap ({counted})"),
            ));
        }
        Ok(LiveDocs { bits, live })
    }
}

//! Structured file I/O for binary data serialization.
//!
//! Every binary index file is a header (magic + format version), a body of
//! little-endian integers, varints and length-prefixed byte strings, and a
//! CRC32 footer over everything before it. Readers verify the footer and
//! report mismatches as [`XiphosError::CorruptSegment`].

use std::collections::BTreeMap;
use std::io::{ErrorKind, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{Result, XiphosError};
use crate::storage::{Storage, StorageInput, StorageOutput};
use crate::util::varint::{decode_u64, encode_u64, zigzag_decode, zigzag_encode};

/// A structured file writer for binary data.
pub struct StructWriter<W: StorageOutput> {
    writer: W,
    hasher: Hasher,
    position: u64,
}

impl StructWriter<Box<dyn StorageOutput>> {
    /// Create `name` in `storage` and wrap it.
    pub fn create(storage: &dyn Storage, name: &str) -> Result<Self> {
        Ok(StructWriter::new(storage.create_output(name)?))
    }
}

impl<W: StorageOutput> StructWriter<W> {
    /// Create a new structured file writer.
    pub fn new(writer: W) -> Self {
        StructWriter {
            writer,
            hasher: Hasher::new(),
            position: 0,
        }
    }

    /// Write the file header.
    pub fn write_header(&mut self, magic: u32, version: u32) -> Result<()> {
        self.write_u32(magic)?;
        self.write_u32(version)
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.writer.write_u8(value)?;
        self.hasher.update(&[value]);
        self.position += 1;
        Ok(())
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.writer.write_u32::<LittleEndian>(value)?;
        self.hasher.update(&value.to_le_bytes());
        self.position += 4;
        Ok(())
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.writer.write_u64::<LittleEndian>(value)?;
        self.hasher.update(&value.to_le_bytes());
        self.position += 8;
        Ok(())
    }

    /// Write a variable-length integer.
    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        let encoded = encode_u64(value);
        self.write_raw(&encoded)
    }

    /// Write a signed integer as a zig-zag varint.
    pub fn write_zigzag(&mut self, value: i64) -> Result<()> {
        self.write_varint(zigzag_encode(value))
    }

    /// Write a string with length prefix.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Write raw bytes with length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.write_raw(value)
    }

    /// Write raw bytes without length prefix.
    pub fn write_raw(&mut self, value: &[u8]) -> Result<()> {
        self.writer.write_all(value)?;
        self.hasher.update(value);
        self.position += value.len() as u64;
        Ok(())
    }

    /// Write a sorted integer array using delta encoding.
    pub fn write_delta_compressed_u32s(&mut self, values: &[u32]) -> Result<()> {
        self.write_varint(values.len() as u64)?;

        let mut previous = 0u32;
        for &value in values {
            let delta = value.wrapping_sub(previous);
            self.write_varint(delta as u64)?;
            previous = value;
        }

        Ok(())
    }

    /// Write a string-to-string map in key order.
    pub fn write_string_map(&mut self, map: &BTreeMap<String, String>) -> Result<()> {
        self.write_varint(map.len() as u64)?;

        for (key, value) in map {
            self.write_string(key)?;
            self.write_string(value)?;
        }

        Ok(())
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Checksum of everything written so far.
    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Write the checksum footer and close the output.
    pub fn close(mut self) -> Result<()> {
        let checksum = self.checksum();
        self.writer.write_u32::<LittleEndian>(checksum)?;
        self.writer.close()?;
        Ok(())
    }
}

/// A structured file reader for binary data.
pub struct StructReader<R: StorageInput> {
    reader: R,
    name: String,
    hasher: Hasher,
    position: u64,
    file_size: u64,
}

impl StructReader<Box<dyn StorageInput>> {
    /// Open `name` in `storage` for structured reading.
    pub fn open(storage: &dyn Storage, name: &str) -> Result<Self> {
        let mut reader = StructReader::new(storage.open_input(name)?)?;
        reader.name = name.to_string();
        Ok(reader)
    }
}

impl<R: StorageInput> StructReader<R> {
    /// Create a new structured file reader.
    pub fn new(reader: R) -> Result<Self> {
        let file_size = reader.size()?;
        Ok(StructReader {
            reader,
            name: String::from("<input>"),
            hasher: Hasher::new(),
            position: 0,
            file_size,
        })
    }

    fn corrupt(&self, reason: impl Into<String>) -> XiphosError {
        XiphosError::corrupt(self.name.clone(), reason)
    }

    fn map_read(&self, err: std::io::Error) -> XiphosError {
        if err.kind() == ErrorKind::UnexpectedEof {
            self.corrupt("unexpected end of file")
        } else {
            XiphosError::Io(err)
        }
    }

    /// Bytes left before the checksum footer.
    pub fn remaining(&self) -> u64 {
        self.file_size
            .saturating_sub(4)
            .saturating_sub(self.position)
    }

    /// Check the footer against the whole body before anything is decoded.
    ///
    /// Length and count fields are only trusted once this has passed. Must be
    /// called before the first read.
    pub fn verify_integrity(&mut self) -> Result<()> {
        if self.position != 0 {
            return Err(XiphosError::index(format!(
                "integrity check on {} after {} bytes were read",
                self.name, self.position
            )));
        }
        if self.file_size < 4 {
            return Err(self.corrupt("file too short"));
        }

        let body = self.file_size - 4;
        let mut hasher = Hasher::new();
        let mut buffer = [0u8; 8192];
        let mut left = body;
        while left > 0 {
            let chunk = left.min(buffer.len() as u64) as usize;
            self.reader
                .read_exact(&mut buffer[..chunk])
                .map_err(|e| self.map_read(e))?;
            hasher.update(&buffer[..chunk]);
            left -= chunk as u64;
        }
        let stored = self
            .reader
            .read_u32::<LittleEndian>()
            .map_err(|e| self.map_read(e))?;
        let actual = hasher.finalize();
        if stored != actual {
            return Err(self.corrupt(format!(
                "checksum mismatch: stored {stored:#010x}, computed {actual:#010x}"
            )));
        }

        self.reader.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Read and validate the file header. Returns the format version.
    pub fn check_header(&mut self, magic: u32, min_version: u32, max_version: u32) -> Result<u32> {
        if self.file_size < 12 {
            return Err(self.corrupt("file too short"));
        }
        let actual = self.read_u32()?;
        if actual != magic {
            return Err(self.corrupt(format!(
                "bad magic: expected {magic:#010x}, got {actual:#010x}"
            )));
        }
        let version = self.read_u32()?;
        if version < min_version || version > max_version {
            return Err(self.corrupt(format!(
                "unsupported format version {version} (supported {min_version}..={max_version})"
            )));
        }
        Ok(version)
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> Result<u8> {
        let value = self.reader.read_u8().map_err(|e| self.map_read(e))?;
        self.hasher.update(&[value]);
        self.position += 1;
        Ok(value)
    }

    /// Read a u32 value (little-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self
            .reader
            .read_u32::<LittleEndian>()
            .map_err(|e| self.map_read(e))?;
        self.hasher.update(&value.to_le_bytes());
        self.position += 4;
        Ok(value)
    }

    /// Read a u64 value (little-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        let value = self
            .reader
            .read_u64::<LittleEndian>()
            .map_err(|e| self.map_read(e))?;
        self.hasher.update(&value.to_le_bytes());
        self.position += 8;
        Ok(value)
    }

    /// Read a variable-length integer.
    pub fn read_varint(&mut self) -> Result<u64> {
        let mut bytes = Vec::with_capacity(4);
        loop {
            let byte = self.reader.read_u8().map_err(|e| self.map_read(e))?;
            bytes.push(byte);
            if byte & 0x80 == 0 || bytes.len() > 10 {
                break;
            }
        }

        let (value, _) = decode_u64(&bytes).map_err(|e| e.in_segment(&self.name))?;
        self.hasher.update(&bytes);
        self.position += bytes.len() as u64;
        Ok(value)
    }

    /// Read a zig-zag encoded signed integer.
    pub fn read_zigzag(&mut self) -> Result<i64> {
        Ok(zigzag_decode(self.read_varint()?))
    }

    /// Read a varint that must fit in `usize` and in the rest of the file.
    pub fn read_len(&mut self) -> Result<usize> {
        let length = self.read_varint()?;
        if length > self.remaining() {
            return Err(self.corrupt(format!(
                "length {length} exceeds remaining {} bytes",
                self.remaining()
            )));
        }
        Ok(length as usize)
    }

    /// Read a string with length prefix.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| self.corrupt(format!("invalid UTF-8: {e}")))
    }

    /// Read bytes with length prefix.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_len()?;
        self.read_raw(length)
    }

    /// Read exact number of raw bytes.
    pub fn read_raw(&mut self, length: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; length];
        self.reader
            .read_exact(&mut bytes)
            .map_err(|e| self.map_read(e))?;
        self.hasher.update(&bytes);
        self.position += length as u64;
        Ok(bytes)
    }

    /// Read a delta-compressed integer array.
    pub fn read_delta_compressed_u32s(&mut self) -> Result<Vec<u32>> {
        let length = self.read_len()?;
        let mut values = Vec::with_capacity(length);
        let mut previous = 0u32;

        for _ in 0..length {
            let delta = self.read_varint()?;
            let value = u32::try_from(previous as u64 + delta)
                .map_err(|_| self.corrupt("delta-encoded value overflows u32"))?;
            values.push(value);
            previous = value;
        }

        Ok(values)
    }

    /// Read a string-to-string map.
    pub fn read_string_map(&mut self) -> Result<BTreeMap<String, String>> {
        let length = self.read_len()?;
        let mut map = BTreeMap::new();

        for _ in 0..length {
            let key = self.read_string()?;
            let value = self.read_string()?;
            map.insert(key, value);
        }

        Ok(map)
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Get file size.
    pub fn size(&self) -> u64 {
        self.file_size
    }

    /// Check if the body has been fully consumed.
    pub fn is_eof(&self) -> bool {
        self.remaining() == 0
    }

    /// Read the footer and compare it with the checksum of the body.
    pub fn verify_checksum(&mut self) -> Result<()> {
        if self.position + 4 != self.file_size {
            return Err(self.corrupt(format!(
                "{} trailing bytes before checksum",
                self.remaining()
            )));
        }

        let stored = self
            .reader
            .read_u32::<LittleEndian>()
            .map_err(|e| self.map_read(e))?;
        let actual = self.hasher.clone().finalize();
        if stored != actual {
            return Err(self.corrupt(format!(
                "checksum mismatch: stored {stored:#010x}, computed {actual:#010x}"
            )));
        }
        Ok(())
    }

    /// Verify the footer and close the reader.
    pub fn finish(mut self) -> Result<()> {
        self.verify_checksum()?;
        self.reader.close()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;
    use crate::storage::memory::MemoryStorage;

    const MAGIC: u32 = 0x5849_5054;

    #[test]
    fn test_struct_writer_reader() {
        let storage = MemoryStorage::new_default();

        {
            let mut writer = StructWriter::create(&storage, "test.struct").unwrap();

            writer.write_header(MAGIC, 1).unwrap();
            writer.write_u8(42).unwrap();
            writer.write_u32(5678).unwrap();
            writer.write_u64(9876543210).unwrap();
            writer.write_varint(12345).unwrap();
            writer.write_zigzag(-77).unwrap();
            writer.write_string("Hello, World!").unwrap();
            writer.write_bytes(b"binary data").unwrap();
            writer
                .write_delta_compressed_u32s(&[1, 5, 10, 15, 25])
                .unwrap();

            let mut map = BTreeMap::new();
            map.insert("source".to_string(), "flush".to_string());
            writer.write_string_map(&map).unwrap();

            writer.close().unwrap();
        }

        let mut reader = StructReader::open(&storage, "test.struct").unwrap();
        assert_eq!(reader.check_header(MAGIC, 1, 1).unwrap(), 1);
        assert_eq!(reader.read_u8().unwrap(), 42);
        assert_eq!(reader.read_u32().unwrap(), 5678);
        assert_eq!(reader.read_u64().unwrap(), 9876543210);
        assert_eq!(reader.read_varint().unwrap(), 12345);
        assert_eq!(reader.read_zigzag().unwrap(), -77);
        assert_eq!(reader.read_string().unwrap(), "Hello, World!");
        assert_eq!(reader.read_bytes().unwrap(), b"binary data");
        assert_eq!(
            reader.read_delta_compressed_u32s().unwrap(),
            vec![1, 5, 10, 15, 25]
        );
        assert_eq!(reader.read_string_map().unwrap()["source"], "flush");
        assert!(reader.is_eof());
        reader.finish().unwrap();
    }

    fn write_sample(storage: &MemoryStorage, name: &str) -> Vec<u8> {
        let mut writer = StructWriter::create(storage, name).unwrap();
        writer.write_header(MAGIC, 1).unwrap();
        writer.write_string("payload").unwrap();
        writer.close().unwrap();

        let mut input = storage.open_input(name).unwrap();
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes).unwrap();
        bytes
    }

    fn store(storage: &MemoryStorage, name: &str, bytes: &[u8]) {
        let mut output = storage.create_output(name).unwrap();
        output.write_all(bytes).unwrap();
        output.close().unwrap();
    }

    #[test]
    fn test_flipped_footer_byte_is_detected_at_finish() {
        let storage = MemoryStorage::new_default();
        let mut bytes = write_sample(&storage, "good");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        store(&storage, "bad", &bytes);

        let mut reader = StructReader::open(&storage, "bad").unwrap();
        reader.check_header(MAGIC, 1, 1).unwrap();
        assert_eq!(reader.read_string().unwrap(), "payload");
        let err = reader.finish().unwrap_err();
        assert!(err.is_corruption());
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn test_integrity_check_runs_before_decoding() {
        let storage = MemoryStorage::new_default();
        let mut bytes = write_sample(&storage, "good");
        // Inside the string payload.
        bytes[10] ^= 0xFF;
        store(&storage, "bad", &bytes);

        let mut reader = StructReader::open(&storage, "bad").unwrap();
        let err = reader.verify_integrity().unwrap_err();
        assert!(err.is_corruption());
        assert!(err.to_string().contains("checksum mismatch"));

        let mut reader = StructReader::open(&storage, "good").unwrap();
        reader.verify_integrity().unwrap();
        reader.check_header(MAGIC, 1, 1).unwrap();
        assert_eq!(reader.read_string().unwrap(), "payload");
        reader.finish().unwrap();
    }

    #[test]
    fn test_integrity_check_rejects_tiny_file() {
        let storage = MemoryStorage::new_default();
        store(&storage, "tiny", &[1, 2]);
        let mut reader = StructReader::open(&storage, "tiny").unwrap();
        assert!(reader.verify_integrity().unwrap_err().is_corruption());
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let storage = MemoryStorage::new_default();
        let bytes = write_sample(&storage, "good");
        store(&storage, "short", &bytes[..bytes.len() - 6]);

        let mut reader = StructReader::open(&storage, "short").unwrap();
        reader.check_header(MAGIC, 1, 1).unwrap();
        let err = reader.read_string().unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_wrong_magic_and_version() {
        let storage = MemoryStorage::new_default();
        write_sample(&storage, "file");

        let mut reader = StructReader::open(&storage, "file").unwrap();
        assert!(reader.check_header(MAGIC + 1, 1, 1).unwrap_err().is_corruption());

        let mut reader = StructReader::open(&storage, "file").unwrap();
        assert!(reader.check_header(MAGIC, 2, 3).unwrap_err().is_corruption());
    }
}

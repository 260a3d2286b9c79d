//! The `record-info` metadata sidecar.
//!
//! A small, checksummed description of a store: the record kind (with
//! table schema where applicable), sortedness, reduced flag, the
//! bucket/segment descriptors carried for partitioning, and size
//! estimates. Written once by the store writer, read at open, and
//! propagated into pipeline metadata.

use std::fs;
use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::record::{RecordKind, TableSchema};
use crate::util::coding::{
    decode_fixed32, decode_length_prefixed, decode_varint64, encode_fixed32,
    encode_length_prefixed, encode_varint64,
};
use crate::util::comparator::SortOrder;
use crate::util::filename;
use crate::{Error, Result};

/// Magic number at the head of a record-info file.
const RECORD_INFO_MAGIC: u32 = 0x5453_4F52; // "TSOR"

/// Sidecar format version.
const RECORD_INFO_VERSION: u32 = 1;

/// Store metadata: record kind, ordering guarantees, and size estimates.
#[derive(Debug, Clone)]
pub struct RecordInfo {
    /// The record kind stored (with table schema for table rows).
    pub kind: RecordKind,
    /// Sort direction, if the store is sorted.
    pub sorted: Option<SortOrder>,
    /// True if equal keys were folded by a combine before writing.
    pub reduced: bool,
    /// Bucket descriptor count (carried, not exercised).
    pub buckets: u32,
    /// Segment descriptor count (carried, not exercised).
    pub segments: u32,
    /// Logical record count.
    pub record_count: i64,
    /// Estimated total key+payload bytes.
    pub byte_size: u64,
}

impl RecordInfo {
    /// Metadata for a new ascending-sorted store of the given kind.
    pub fn sorted_ascending(kind: RecordKind) -> Self {
        Self {
            kind,
            sorted: Some(SortOrder::Ascending),
            reduced: false,
            buckets: 0,
            segments: 0,
            record_count: 0,
            byte_size: 0,
        }
    }

    /// Encode to sidecar bytes: magic, version, crc over the body, body.
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(128);

        body.put_u8(self.kind.tag());
        match &self.kind {
            RecordKind::Table(schema) => {
                encode_varint64(&mut body, schema.columns().len() as u64);
                for name in schema.columns() {
                    encode_length_prefixed(&mut body, name.as_bytes());
                }
                encode_varint64(&mut body, schema.key_columns().len() as u64);
                for &pos in schema.key_columns() {
                    encode_varint64(&mut body, pos as u64);
                }
                encode_fixed32(&mut body, schema.separator() as u32);
            }
            RecordKind::Custom { name, .. } => {
                encode_length_prefixed(&mut body, name.as_bytes());
            }
            RecordKind::Bytes | RecordKind::Counter | RecordKind::Text => {}
        }

        match self.sorted {
            None => body.put_u8(0xFF),
            Some(order) => body.put_u8(order.to_byte()),
        }
        body.put_u8(self.reduced as u8);
        encode_varint64(&mut body, self.buckets as u64);
        encode_varint64(&mut body, self.segments as u64);
        encode_varint64(&mut body, self.record_count as u64);
        encode_varint64(&mut body, self.byte_size);

        let crc = crc32fast::hash(&body);

        let mut out = BytesMut::with_capacity(body.len() + 12);
        encode_fixed32(&mut out, RECORD_INFO_MAGIC);
        encode_fixed32(&mut out, RECORD_INFO_VERSION);
        encode_fixed32(&mut out, crc);
        out.put_slice(&body);
        out.freeze()
    }

    /// Decode sidecar bytes, verifying magic and checksum.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = data;
        let magic = decode_fixed32(&mut cursor)
            .ok_or_else(|| Error::invalid_format("record-info too short"))?;
        if magic != RECORD_INFO_MAGIC {
            return Err(Error::invalid_format(format!(
                "bad record-info magic {:#x}",
                magic
            )));
        }
        let version = decode_fixed32(&mut cursor)
            .ok_or_else(|| Error::invalid_format("record-info too short"))?;
        if version != RECORD_INFO_VERSION {
            return Err(Error::invalid_format(format!(
                "unsupported record-info version {}",
                version
            )));
        }
        let stored_crc = decode_fixed32(&mut cursor)
            .ok_or_else(|| Error::invalid_format("record-info too short"))?;
        let actual_crc = crc32fast::hash(cursor);
        if stored_crc != actual_crc {
            return Err(Error::CrcMismatch {
                expected: stored_crc,
                actual: actual_crc,
            });
        }

        let kind_tag = read_u8(&mut cursor)?;
        let kind = match kind_tag {
            0 => RecordKind::Bytes,
            1 => RecordKind::Counter,
            2 => RecordKind::Text,
            3 => {
                let num_columns = read_varint(&mut cursor)? as usize;
                let mut columns = Vec::with_capacity(num_columns);
                for _ in 0..num_columns {
                    let name = decode_length_prefixed(&mut cursor)
                        .ok_or_else(|| Error::corruption("truncated column name"))?;
                    columns.push(
                        String::from_utf8(name.to_vec())
                            .map_err(|_| Error::corruption("column name is not UTF-8"))?,
                    );
                }
                let num_keys = read_varint(&mut cursor)? as usize;
                let mut key_columns = Vec::with_capacity(num_keys);
                for _ in 0..num_keys {
                    key_columns.push(read_varint(&mut cursor)? as usize);
                }
                let sep = decode_fixed32(&mut cursor)
                    .ok_or_else(|| Error::corruption("truncated separator"))?;
                let separator = char::from_u32(sep)
                    .ok_or_else(|| Error::corruption("invalid separator code point"))?;
                RecordKind::Table(TableSchema::new(columns, key_columns, separator)?)
            }
            4 => {
                let name = decode_length_prefixed(&mut cursor)
                    .ok_or_else(|| Error::corruption("truncated kind name"))?;
                RecordKind::Custom {
                    name: String::from_utf8(name.to_vec())
                        .map_err(|_| Error::corruption("kind name is not UTF-8"))?,
                    combine: None,
                }
            }
            other => {
                return Err(Error::invalid_format(format!(
                    "unknown record kind tag {}",
                    other
                )))
            }
        };

        let sorted = match read_u8(&mut cursor)? {
            0xFF => None,
            b => Some(
                SortOrder::from_byte(b)
                    .ok_or_else(|| Error::corruption("invalid sort order flag"))?,
            ),
        };
        let reduced = read_u8(&mut cursor)? != 0;
        let buckets = read_varint(&mut cursor)? as u32;
        let segments = read_varint(&mut cursor)? as u32;
        let record_count = read_varint(&mut cursor)? as i64;
        let byte_size = read_varint(&mut cursor)?;

        Ok(Self {
            kind,
            sorted,
            reduced,
            buckets,
            segments,
            record_count,
            byte_size,
        })
    }

    /// Write the sidecar into a store directory.
    pub fn write_to(&self, store_dir: &Path) -> Result<()> {
        fs::write(filename::record_info_path(store_dir), self.encode())?;
        Ok(())
    }

    /// Read the sidecar from a store directory.
    pub fn read_from(store_dir: &Path) -> Result<Self> {
        let data = fs::read(filename::record_info_path(store_dir))?;
        Self::decode(&data)
    }
}

fn read_u8(cursor: &mut &[u8]) -> Result<u8> {
    if cursor.is_empty() {
        return Err(Error::corruption("record-info truncated"));
    }
    Ok(cursor.get_u8())
}

fn read_varint(cursor: &mut &[u8]) -> Result<u64> {
    decode_varint64(cursor).ok_or_else(|| Error::corruption("record-info truncated"))
}

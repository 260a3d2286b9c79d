//! One data-file/index-file pair: the building block of a store.
//!
//! The data file is a concatenation of front-coded records:
//! `varint(overlap) varint(suffix_len) suffix varint(payload_len) payload`,
//! where `overlap` counts the leading bytes shared with the previous key.
//! The index file holds one 5-byte little-endian offset per group, then an
//! 8-byte signed record count and a 4-byte group size.
//!
//! Both the main record sequence and the nested cache store use this
//! shape; the cache simply stores one empty-payload record per group.

use bytes::{Bytes, BytesMut};

use crate::util::coding::{
    decode_fixed32, decode_fixed40, decode_fixed64, decode_varint64, encode_fixed32,
    encode_fixed40, encode_fixed64, encode_varint64,
};
use crate::util::comparator::common_prefix_len;
use crate::{Error, Result};

/// Bytes per group offset in an index file.
pub const INDEX_OFFSET_LEN: usize = 5;

/// Bytes of the index trailer: record count (8) + group size (4).
pub const INDEX_TRAILER_LEN: usize = 12;

/// Encode one front-coded record into `buf`.
///
/// `overlap` is the shared-prefix length against the previous key and
/// `suffix` the remaining key bytes.
pub fn encode_entry(buf: &mut BytesMut, overlap: usize, suffix: &[u8], payload: &[u8]) {
    encode_varint64(buf, overlap as u64);
    encode_varint64(buf, suffix.len() as u64);
    buf.extend_from_slice(suffix);
    encode_varint64(buf, payload.len() as u64);
    buf.extend_from_slice(payload);
}

/// Encode a record against the previous key, returning the new key's
/// shared-prefix length.
pub fn encode_record(buf: &mut BytesMut, prev_key: &[u8], key: &[u8], payload: &[u8]) -> usize {
    let overlap = common_prefix_len(prev_key, key);
    encode_entry(buf, overlap, &key[overlap..], payload);
    overlap
}

/// Parsed contents of an index file.
///
/// Offsets point at group starts in the companion data file. The record
/// count in the trailer is the logical count; padding records in the
/// final group are not included.
#[derive(Debug, Clone)]
pub struct GroupIndex {
    offsets: Vec<u64>,
    record_count: i64,
    group_size: usize,
}

impl GroupIndex {
    /// Parse a complete index file.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < INDEX_TRAILER_LEN {
            return Err(Error::corruption("index file too short for trailer"));
        }
        let body_len = data.len() - INDEX_TRAILER_LEN;
        if body_len % INDEX_OFFSET_LEN != 0 {
            return Err(Error::corruption("index body is not a whole number of offsets"));
        }

        let mut cursor = &data[..body_len];
        let mut offsets = Vec::with_capacity(body_len / INDEX_OFFSET_LEN);
        while !cursor.is_empty() {
            let offset = decode_fixed40(&mut cursor)
                .ok_or_else(|| Error::corruption("truncated group offset"))?;
            offsets.push(offset);
        }

        let mut trailer = &data[body_len..];
        let record_count = decode_fixed64(&mut trailer)
            .ok_or_else(|| Error::corruption("truncated record count"))? as i64;
        let group_size = decode_fixed32(&mut trailer)
            .ok_or_else(|| Error::corruption("truncated group size"))? as usize;

        if record_count < 0 {
            return Err(Error::corruption("negative record count"));
        }
        if group_size < 2 {
            return Err(Error::corruption("group size below minimum"));
        }

        let expected_groups = Self::groups_for(record_count, group_size);
        if offsets.len() != expected_groups {
            return Err(Error::corruption(format!(
                "index has {} group offsets, record count implies {}",
                offsets.len(),
                expected_groups
            )));
        }

        Ok(Self {
            offsets,
            record_count,
            group_size,
        })
    }

    /// Encode the offsets and trailer as index-file bytes.
    pub fn encode(offsets: &[u64], record_count: i64, group_size: usize) -> Result<Bytes> {
        let mut buf =
            BytesMut::with_capacity(offsets.len() * INDEX_OFFSET_LEN + INDEX_TRAILER_LEN);
        for &offset in offsets {
            if !encode_fixed40(&mut buf, offset) {
                return Err(Error::invalid_format(format!(
                    "group offset {} exceeds the 5-byte range",
                    offset
                )));
            }
        }
        encode_fixed64(&mut buf, record_count as u64);
        encode_fixed32(&mut buf, group_size as u32);
        Ok(buf.freeze())
    }

    fn groups_for(record_count: i64, group_size: usize) -> usize {
        (record_count as usize).div_ceil(group_size)
    }

    /// Logical record count.
    pub fn record_count(&self) -> i64 {
        self.record_count
    }

    /// Records per group.
    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Number of groups.
    pub fn num_groups(&self) -> usize {
        self.offsets.len()
    }

    /// Byte offset of a group's start in the data file.
    pub fn group_offset(&self, group: usize) -> u64 {
        self.offsets[group]
    }

    /// Byte span `[start, end)` of a group in a data file of `data_len`
    /// bytes.
    pub fn group_span(&self, group: usize, data_len: u64) -> (u64, u64) {
        let start = self.offsets[group];
        let end = if group + 1 < self.offsets.len() {
            self.offsets[group + 1]
        } else {
            data_len
        };
        (start, end)
    }

    /// Group containing a record number.
    pub fn group_of(&self, record_no: i64) -> usize {
        record_no as usize / self.group_size
    }

    /// Record number of a group's first record.
    pub fn first_record_of(&self, group: usize) -> i64 {
        (group * self.group_size) as i64
    }

    /// Logical records in a group (the final group may be short).
    pub fn records_in_group(&self, group: usize) -> usize {
        let first = group * self.group_size;
        let remaining = self.record_count as usize - first;
        remaining.min(self.group_size)
    }

    /// True if `record_no` is a valid logical record number.
    pub fn contains_record(&self, record_no: i64) -> bool {
        record_no >= 0 && record_no < self.record_count
    }
}

/// Cursor over the front-coded records of one group's byte span.
///
/// Keys are reconstructed incrementally: each record's key is the
/// previous key's first `overlap` bytes plus the stored suffix.
pub struct GroupCursor<'a> {
    data: &'a [u8],
    pos: usize,
    key: Vec<u8>,
    payload_start: usize,
    payload_len: usize,
    valid: bool,
}

impl<'a> GroupCursor<'a> {
    /// Create a cursor at the start of a group span.
    ///
    /// The front-coding chain starts empty, so the span's first record
    /// must carry a full key (overlap 0). The store writer restarts
    /// front coding at every group boundary to guarantee this.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            key: Vec::new(),
            payload_start: 0,
            payload_len: 0,
            valid: false,
        }
    }

    /// True if a record is available via `key`/`payload`.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// The current record's key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The current record's payload.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.payload_start..self.payload_start + self.payload_len]
    }

    /// Decode the next record. Returns false at the end of the span.
    pub fn advance(&mut self) -> Result<bool> {
        if self.pos >= self.data.len() {
            self.valid = false;
            return Ok(false);
        }

        let mut cursor = &self.data[self.pos..];
        let start_len = cursor.len();

        let overlap = decode_varint64(&mut cursor)
            .ok_or_else(|| Error::corruption("truncated record overlap"))?
            as usize;
        let suffix_len = decode_varint64(&mut cursor)
            .ok_or_else(|| Error::corruption("truncated record suffix length"))?
            as usize;

        if overlap > self.key.len() {
            return Err(Error::corruption(format!(
                "record overlap {} exceeds previous key length {}",
                overlap,
                self.key.len()
            )));
        }
        if cursor.len() < suffix_len {
            return Err(Error::corruption("truncated record suffix"));
        }

        self.key.truncate(overlap);
        self.key.extend_from_slice(&cursor[..suffix_len]);
        cursor = &cursor[suffix_len..];

        let payload_len = decode_varint64(&mut cursor)
            .ok_or_else(|| Error::corruption("truncated payload length"))?
            as usize;
        if cursor.len() < payload_len {
            return Err(Error::corruption("truncated payload"));
        }

        let header_len = start_len - cursor.len();
        self.payload_start = self.pos + header_len;
        self.payload_len = payload_len;
        self.pos = self.payload_start + payload_len;
        self.valid = true;
        Ok(true)
    }
}

/// A fully memory-resident data+index pair.
///
/// Used for the cache store, which is loaded whole so group binary
/// search never touches the main data file.
#[derive(Debug, Clone)]
pub struct MemSegment {
    data: Bytes,
    index: GroupIndex,
}

impl MemSegment {
    /// Wrap loaded data and its parsed index.
    pub fn new(data: Bytes, index: GroupIndex) -> Self {
        Self { data, index }
    }

    /// The parsed index.
    pub fn index(&self) -> &GroupIndex {
        &self.index
    }

    /// Logical record count.
    pub fn record_count(&self) -> i64 {
        self.index.record_count()
    }

    /// Key of record `record_no`, scanning within its group.
    pub fn key_at(&self, record_no: i64) -> Result<Bytes> {
        if !self.index.contains_record(record_no) {
            return Err(Error::RecordOutOfRange {
                record_no,
                count: self.index.record_count(),
            });
        }

        let group = self.index.group_of(record_no);
        let (start, end) = self.index.group_span(group, self.data.len() as u64);
        let span = &self.data[start as usize..end as usize];

        let mut cursor = GroupCursor::new(span);
        let steps = record_no as usize - group * self.index.group_size();
        for _ in 0..=steps {
            if !cursor.advance()? {
                return Err(Error::corruption("group shorter than index claims"));
            }
        }
        Ok(Bytes::copy_from_slice(cursor.key()))
    }
}

//! Core record types.
//!
//! A record is a UTF-8 key plus an opaque payload, moved by value through
//! the pipeline. Some record kinds are reducible: two records with the
//! same key can be folded into one via the kind's combine operation.

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::util::coding::{decode_varint64, encode_varint64};
use crate::{Error, Result};

/// Record number of a record not read from a store.
pub const NO_RECORD_NO: i64 = -1;

/// A key/payload pair flowing through the pipeline.
///
/// `record_no` is the ordinal assigned when the record was read from a
/// store, or [`NO_RECORD_NO`] otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    key: Bytes,
    payload: Bytes,
    record_no: i64,
}

impl Record {
    /// Create a record not backed by a store.
    pub fn new(key: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            record_no: NO_RECORD_NO,
        }
    }

    /// Create a record with a store-assigned ordinal.
    pub fn with_record_no(key: impl Into<Bytes>, payload: impl Into<Bytes>, record_no: i64) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            record_no,
        }
    }

    /// Create an empty record (empty key, empty payload).
    pub fn empty() -> Self {
        Self::new(Bytes::new(), Bytes::new())
    }

    /// The record key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The record key as shared bytes.
    pub fn key_bytes(&self) -> &Bytes {
        &self.key
    }

    /// The opaque payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload as shared bytes.
    pub fn payload_bytes(&self) -> &Bytes {
        &self.payload
    }

    /// The store ordinal, or [`NO_RECORD_NO`].
    pub fn record_no(&self) -> i64 {
        self.record_no
    }

    /// Replace the payload.
    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = payload.into();
    }

    /// Assign the store ordinal.
    pub fn set_record_no(&mut self, record_no: i64) {
        self.record_no = record_no;
    }

    /// Decompose into key and payload.
    pub fn into_parts(self) -> (Bytes, Bytes) {
        (self.key, self.payload)
    }
}

/// Encode a counter payload.
pub fn encode_count(count: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(10);
    encode_varint64(&mut buf, count);
    buf.freeze()
}

/// Decode a counter payload.
pub fn decode_count(payload: &[u8]) -> Result<u64> {
    let mut cursor = payload;
    let count = decode_varint64(&mut cursor)
        .ok_or_else(|| Error::invalid_format("counter payload is not a varint"))?;
    if !cursor.is_empty() {
        return Err(Error::invalid_format("trailing bytes in counter payload"));
    }
    Ok(count)
}

/// User-supplied combine operation for custom record kinds.
pub type CombineFn = Arc<dyn Fn(&mut Record, &Record) -> Result<()> + Send + Sync>;

/// The shape of a record's payload, and how two records sharing a key
/// are folded into one.
#[derive(Clone, Default)]
pub enum RecordKind {
    /// Opaque payload, not reducible.
    #[default]
    Bytes,
    /// Payload is a varint count; combine is saturating addition.
    Counter,
    /// Payload is UTF-8 text; combine is concatenation.
    Text,
    /// Payload is a delimited row; a subset of columns forms the key.
    /// Table rows are a reshaping view, not reduced.
    Table(TableSchema),
    /// User-pluggable kind with an optional associative combine.
    Custom {
        /// Kind name recorded in the sidecar.
        name: String,
        /// Combine operation; None when read back from disk.
        combine: Option<CombineFn>,
    },
}

impl fmt::Debug for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Bytes => write!(f, "Bytes"),
            RecordKind::Counter => write!(f, "Counter"),
            RecordKind::Text => write!(f, "Text"),
            RecordKind::Table(schema) => f.debug_tuple("Table").field(schema).finish(),
            RecordKind::Custom { name, combine } => f
                .debug_struct("Custom")
                .field("name", name)
                .field("combine", &combine.is_some())
                .finish(),
        }
    }
}

impl RecordKind {
    /// Tag byte recorded in the sidecar.
    pub fn tag(&self) -> u8 {
        match self {
            RecordKind::Bytes => 0,
            RecordKind::Counter => 1,
            RecordKind::Text => 2,
            RecordKind::Table(_) => 3,
            RecordKind::Custom { .. } => 4,
        }
    }

    /// True if combine can fold two records of this kind.
    pub fn is_reducible(&self) -> bool {
        match self {
            RecordKind::Counter | RecordKind::Text => true,
            RecordKind::Custom { combine, .. } => combine.is_some(),
            RecordKind::Bytes | RecordKind::Table(_) => false,
        }
    }

    /// The table schema, if this kind carries one.
    pub fn table_schema(&self) -> Option<&TableSchema> {
        match self {
            RecordKind::Table(schema) => Some(schema),
            _ => None,
        }
    }

    /// Fold `other` into `acc`.
    ///
    /// Returns `Ok(true)` if `other` was absorbed, `Ok(false)` if this
    /// kind has no combine. Both records must share a key.
    pub fn combine(&self, acc: &mut Record, other: &Record) -> Result<bool> {
        if acc.key() != other.key() {
            return Err(Error::internal(format!(
                "combine called on different keys: {:?} vs {:?}",
                String::from_utf8_lossy(acc.key()),
                String::from_utf8_lossy(other.key()),
            )));
        }

        match self {
            RecordKind::Counter => {
                let sum =
                    decode_count(acc.payload())?.saturating_add(decode_count(other.payload())?);
                acc.set_payload(encode_count(sum));
                Ok(true)
            }
            RecordKind::Text => {
                let mut buf =
                    BytesMut::with_capacity(acc.payload().len() + other.payload().len());
                buf.extend_from_slice(acc.payload());
                buf.extend_from_slice(other.payload());
                acc.set_payload(buf.freeze());
                Ok(true)
            }
            RecordKind::Custom {
                combine: Some(combine),
                ..
            } => {
                combine(acc, other)?;
                Ok(true)
            }
            RecordKind::Bytes | RecordKind::Table(_) | RecordKind::Custom { combine: None, .. } => {
                Ok(false)
            }
        }
    }
}

/// Column layout of table-row records.
///
/// The payload of a table record is the full row, columns joined by the
/// separator; the record key is the designated key columns joined the
/// same way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    columns: Vec<String>,
    key_columns: Vec<usize>,
    separator: char,
}

impl TableSchema {
    /// Create a schema, validating the key column positions.
    pub fn new(
        columns: Vec<String>,
        key_columns: Vec<usize>,
        separator: char,
    ) -> Result<Self> {
        if columns.is_empty() {
            return Err(Error::InvalidConfiguration(
                "table schema needs at least one column".into(),
            ));
        }
        if key_columns.is_empty() {
            return Err(Error::InvalidConfiguration(
                "table schema needs at least one key column".into(),
            ));
        }
        for &pos in &key_columns {
            if pos >= columns.len() {
                return Err(Error::InvalidConfiguration(format!(
                    "key column {} out of range ({} columns)",
                    pos,
                    columns.len()
                )));
            }
        }
        Ok(Self {
            columns,
            key_columns,
            separator,
        })
    }

    /// Column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Key column positions.
    pub fn key_columns(&self) -> &[usize] {
        &self.key_columns
    }

    /// The column separator.
    pub fn separator(&self) -> char {
        self.separator
    }

    /// Positions of the non-key columns, in column order.
    pub fn non_key_columns(&self) -> Vec<usize> {
        (0..self.columns.len())
            .filter(|i| !self.key_columns.contains(i))
            .collect()
    }

    /// Position of a named column.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Split a row payload into column values.
    pub fn split_row<'a>(&self, payload: &'a [u8]) -> Result<Vec<&'a str>> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| Error::invalid_format("table row is not UTF-8"))?;
        Ok(text.split(self.separator).collect())
    }

    /// Join column values into a row payload.
    pub fn join_row(&self, values: &[&str]) -> Bytes {
        let separator = self.separator.to_string();
        Bytes::from(values.join(separator.as_str()))
    }

    /// Extract the record key from a row payload.
    pub fn key_of(&self, payload: &[u8]) -> Result<Bytes> {
        let values = self.split_row(payload)?;
        let mut parts = Vec::with_capacity(self.key_columns.len());
        for &pos in &self.key_columns {
            let value = values.get(pos).ok_or_else(|| {
                Error::invalid_format(format!(
                    "row has {} columns, key column {} missing",
                    values.len(),
                    pos
                ))
            })?;
            parts.push(*value);
        }
        Ok(self.join_row(&parts))
    }

    /// Build a table record from a row payload.
    pub fn record_from_row(&self, payload: impl Into<Bytes>) -> Result<Record> {
        let payload = payload.into();
        let key = self.key_of(&payload)?;
        Ok(Record::new(key, payload))
    }

    /// Output schema of a join: left columns plus right non-key columns.
    ///
    /// Column names appearing on both sides are disambiguated by
    /// prefixing with the owning source's name.
    pub fn join_output(
        left: &TableSchema,
        right: &TableSchema,
        left_name: &str,
        right_name: &str,
    ) -> Result<TableSchema> {
        let right_non_key = right.non_key_columns();
        let mut columns = Vec::with_capacity(left.columns.len() + right_non_key.len());

        for name in &left.columns {
            if right_non_key
                .iter()
                .any(|&i| right.columns[i] == *name)
            {
                columns.push(format!("{}.{}", left_name, name));
            } else {
                columns.push(name.clone());
            }
        }
        for &i in &right_non_key {
            let name = &right.columns[i];
            if left.columns.contains(name) {
                columns.push(format!("{}.{}", right_name, name));
            } else {
                columns.push(name.clone());
            }
        }

        TableSchema::new(columns, left.key_columns.clone(), left.separator)
    }
}

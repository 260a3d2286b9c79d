//! Leaf record sources: in-memory vectors, user callbacks, flat text
//! files, framed record files, directories, and stores.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};

use crate::options::Options;
use crate::record::{Record, RecordKind, TableSchema};
use crate::store::{RecordRange, StoreReader};
use crate::util::coding::encode_varint64;
use crate::util::filename;
use crate::{Error, Result};

use super::{BoxedSource, RecordSource, SourceMeta};

/// An in-memory source over a vector of records.
pub struct VecSource {
    records: Vec<Record>,
    pos: usize,
    current: Record,
    meta: SourceMeta,
}

impl VecSource {
    /// Create from records, with default (unsorted, opaque) metadata.
    pub fn new(name: impl Into<String>, records: Vec<Record>) -> Self {
        let meta = SourceMeta::new(name).with_kind(RecordKind::Bytes);
        Self::with_meta(records, meta)
    }

    /// Create with explicit metadata.
    pub fn with_meta(records: Vec<Record>, mut meta: SourceMeta) -> Self {
        meta.estimated_records = Some(records.len() as i64);
        Self {
            records,
            pos: 0,
            current: Record::empty(),
            meta,
        }
    }

    /// Convenience: build from key/payload string pairs.
    pub fn from_pairs(name: impl Into<String>, pairs: &[(&str, &str)]) -> Self {
        let records = pairs
            .iter()
            .map(|(k, v)| Record::new(k.to_string(), v.to_string()))
            .collect();
        Self::new(name, records)
    }
}

impl RecordSource for VecSource {
    fn advance(&mut self) -> Result<bool> {
        if self.pos >= self.records.len() {
            return Ok(false);
        }
        self.current = self.records[self.pos].clone();
        self.pos += 1;
        Ok(true)
    }

    fn current(&self) -> &Record {
        &self.current
    }

    fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    fn close(&mut self) -> Result<()> {
        self.records.clear();
        self.pos = 0;
        Ok(())
    }
}

/// Generator type for [`CallbackSource`].
pub type RecordGenerator = Box<dyn FnMut() -> Result<Option<Record>> + Send>;

/// A source driven by a user callback returning one record per call,
/// None at exhaustion.
pub struct CallbackSource {
    generator: RecordGenerator,
    current: Record,
    done: bool,
    meta: SourceMeta,
}

impl CallbackSource {
    /// Create from a generator closure.
    pub fn new(name: impl Into<String>, generator: RecordGenerator) -> Self {
        Self {
            generator,
            current: Record::empty(),
            done: false,
            meta: SourceMeta::new(name),
        }
    }

    /// Create with explicit metadata (e.g. a generator that promises
    /// sorted output).
    pub fn with_meta(generator: RecordGenerator, meta: SourceMeta) -> Self {
        Self {
            generator,
            current: Record::empty(),
            done: false,
            meta,
        }
    }
}

impl RecordSource for CallbackSource {
    fn advance(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        match (self.generator)()? {
            Some(record) => {
                self.current = record;
                Ok(true)
            }
            None => {
                self.done = true;
                Ok(false)
            }
        }
    }

    fn current(&self) -> &Record {
        &self.current
    }

    fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    fn close(&mut self) -> Result<()> {
        self.done = true;
        Ok(())
    }
}

/// Write one framed record: `varint(key_len) key varint(payload_len)
/// payload`. The format of record files and spill runs.
pub(crate) fn write_framed(w: &mut impl Write, key: &[u8], payload: &[u8]) -> Result<()> {
    let mut header = BytesMut::with_capacity(20);
    encode_varint64(&mut header, key.len() as u64);
    w.write_all(&header)?;
    w.write_all(key)?;
    header.clear();
    encode_varint64(&mut header, payload.len() as u64);
    w.write_all(&header)?;
    w.write_all(payload)?;
    Ok(())
}

/// Read a varint from a byte stream. None at clean EOF on the first
/// byte; corruption mid-varint is an error.
fn read_varint_stream(r: &mut impl Read) -> Result<Option<u64>> {
    let mut result = 0u64;
    let mut first = true;
    loop {
        let mut byte = [0u8; 1];
        match r.read_exact(&mut byte) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && first => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::corruption("truncated varint in record file"))
            }
            Err(e) => return Err(e.into()),
        }
        first = false;
        if result >> 57 != 0 {
            return Err(Error::corruption("varint overflow in record file"));
        }
        result = (result << 7) | ((byte[0] & 0x7F) as u64);
        if byte[0] & 0x80 == 0 {
            return Ok(Some(result));
        }
    }
}

/// A source over a framed binary record file.
pub struct RecordFileSource {
    reader: Option<BufReader<File>>,
    current: Record,
    meta: SourceMeta,
}

impl RecordFileSource {
    /// Open a record file with default metadata.
    pub fn open(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "record-file".to_string());
        Self::with_meta(path, SourceMeta::new(name))
    }

    /// Open a record file with explicit metadata (spill runs pass the
    /// sorter's guarantees through here).
    pub fn with_meta(path: &Path, meta: SourceMeta) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: Some(BufReader::new(file)),
            current: Record::empty(),
            meta,
        })
    }
}

impl RecordSource for RecordFileSource {
    fn advance(&mut self) -> Result<bool> {
        let reader = match self.reader.as_mut() {
            Some(r) => r,
            None => return Ok(false),
        };

        let key_len = match read_varint_stream(reader)? {
            Some(len) => len as usize,
            None => {
                self.reader = None;
                return Ok(false);
            }
        };
        let mut key = vec![0u8; key_len];
        reader
            .read_exact(&mut key)
            .map_err(|_| Error::corruption("truncated key in record file"))?;

        let payload_len = read_varint_stream(reader)?
            .ok_or_else(|| Error::corruption("truncated record in record file"))?
            as usize;
        let mut payload = vec![0u8; payload_len];
        reader
            .read_exact(&mut payload)
            .map_err(|_| Error::corruption("truncated payload in record file"))?;

        self.current = Record::new(Bytes::from(key), Bytes::from(payload));
        Ok(true)
    }

    fn current(&self) -> &Record {
        &self.current
    }

    fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}

/// A source over a line-oriented text file.
///
/// Without a schema, each line splits at the first separator into key
/// and payload. With a table schema, each line is a full row and the
/// key is extracted from the schema's key columns.
pub struct FlatFileSource {
    reader: Option<BufReader<File>>,
    schema: Option<TableSchema>,
    separator: char,
    current: Record,
    meta: SourceMeta,
    line: String,
}

impl FlatFileSource {
    /// Open a flat file of key/payload lines.
    pub fn open(path: &Path, separator: char) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "flat-file".to_string());
        let file = File::open(path)?;
        Ok(Self {
            reader: Some(BufReader::new(file)),
            schema: None,
            separator,
            current: Record::empty(),
            meta: SourceMeta::new(name).with_kind(RecordKind::Text),
            line: String::new(),
        })
    }

    /// Open a flat file of table rows.
    pub fn with_schema(path: &Path, schema: TableSchema) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "flat-file".to_string());
        let file = File::open(path)?;
        let separator = schema.separator();
        let meta = SourceMeta::new(name).with_kind(RecordKind::Table(schema.clone()));
        Ok(Self {
            reader: Some(BufReader::new(file)),
            schema: Some(schema),
            separator,
            current: Record::empty(),
            meta,
            line: String::new(),
        })
    }
}

impl RecordSource for FlatFileSource {
    fn advance(&mut self) -> Result<bool> {
        let reader = match self.reader.as_mut() {
            Some(r) => r,
            None => return Ok(false),
        };

        loop {
            self.line.clear();
            let read = reader.read_line(&mut self.line)?;
            if read == 0 {
                self.reader = None;
                return Ok(false);
            }
            while self.line.ends_with('\n') || self.line.ends_with('\r') {
                self.line.pop();
            }
            if self.line.is_empty() {
                continue; // blank lines carry no record
            }

            self.current = match &self.schema {
                Some(schema) => schema.record_from_row(self.line.clone())?,
                None => match self.line.split_once(self.separator) {
                    Some((key, payload)) => {
                        Record::new(key.to_string(), payload.to_string())
                    }
                    None => Record::new(self.line.clone(), Bytes::new()),
                },
            };
            return Ok(true);
        }
    }

    fn current(&self) -> &Record {
        &self.current
    }

    fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}

/// Concatenation of all regular files in a directory, in name order.
pub struct DirectorySource {
    files: Vec<PathBuf>,
    next_file: usize,
    inner: Option<FlatFileSource>,
    schema: Option<TableSchema>,
    separator: char,
    current: Record,
    meta: SourceMeta,
}

impl DirectorySource {
    /// Open every regular file in `dir` as a flat file.
    pub fn open(dir: &Path, separator: char, schema: Option<TableSchema>) -> Result<Self> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        files.sort();

        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "directory".to_string());
        let kind = match &schema {
            Some(s) => RecordKind::Table(s.clone()),
            None => RecordKind::Text,
        };

        Ok(Self {
            files,
            next_file: 0,
            inner: None,
            schema,
            separator,
            current: Record::empty(),
            meta: SourceMeta::new(name).with_kind(kind),
        })
    }
}

impl RecordSource for DirectorySource {
    fn advance(&mut self) -> Result<bool> {
        loop {
            if let Some(inner) = self.inner.as_mut() {
                if inner.advance()? {
                    self.current = inner.current().clone();
                    return Ok(true);
                }
                self.inner = None;
            }
            if self.next_file >= self.files.len() {
                return Ok(false);
            }
            let path = &self.files[self.next_file];
            self.next_file += 1;
            self.inner = Some(match &self.schema {
                Some(schema) => FlatFileSource::with_schema(path, schema.clone())?,
                None => FlatFileSource::open(path, self.separator)?,
            });
        }
    }

    fn current(&self) -> &Record {
        &self.current
    }

    fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    fn close(&mut self) -> Result<()> {
        self.inner = None;
        self.next_file = self.files.len();
        Ok(())
    }
}

/// Sequential scan over a store, optionally restricted to a record
/// range (the shape of prefix and exact-key queries).
pub struct StoreSource {
    reader: Option<StoreReader>,
    range: RecordRange,
    exact_key: Option<Bytes>,
    current: Record,
    meta: SourceMeta,
}

impl StoreSource {
    /// Open a full-store scan.
    pub fn open(dir: &Path) -> Result<Self> {
        let reader = StoreReader::open(dir)?;
        let range = RecordRange {
            low: 0,
            high: reader.record_count() - 1,
        };
        Ok(Self::from_parts(dir, reader, range, None))
    }

    /// Open a scan over all records whose key starts with `prefix`.
    pub fn with_prefix(dir: &Path, prefix: &[u8]) -> Result<Self> {
        let mut reader = StoreReader::open(dir)?;
        let range = reader.matching_prefix(prefix)?;
        Ok(Self::from_parts(dir, reader, range, None))
    }

    /// Open a scan over all records whose key equals `key`.
    ///
    /// Equal keys are the contiguous head of the key's prefix range, so
    /// the scan stops at the first longer key.
    pub fn with_key(dir: &Path, key: &[u8]) -> Result<Self> {
        let mut reader = StoreReader::open(dir)?;
        let range = reader.matching_prefix(key)?;
        Ok(Self::from_parts(
            dir,
            reader,
            range,
            Some(Bytes::copy_from_slice(key)),
        ))
    }

    fn from_parts(
        dir: &Path,
        mut reader: StoreReader,
        range: RecordRange,
        exact_key: Option<Bytes>,
    ) -> Self {
        let info = reader.info();
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());
        let meta = SourceMeta {
            name,
            kind: info.kind.clone(),
            sorted: info.sorted,
            reduced: info.reduced,
            bucketed: info.buckets > 0,
            segmented: info.segments > 0,
            estimated_records: Some(range.len()),
            estimated_bytes: Some(info.byte_size),
        };
        reader.seek_to(range.low);
        Self {
            reader: Some(reader),
            range,
            exact_key,
            current: Record::empty(),
            meta,
        }
    }
}

impl RecordSource for StoreSource {
    fn advance(&mut self) -> Result<bool> {
        let reader = match self.reader.as_mut() {
            Some(r) => r,
            None => return Ok(false),
        };
        if reader.position() > self.range.high {
            self.reader = None;
            return Ok(false);
        }
        let record = match reader.next_record()? {
            Some(record) => record,
            None => {
                self.reader = None;
                return Ok(false);
            }
        };
        if record.record_no() > self.range.high {
            self.reader = None;
            return Ok(false);
        }
        if let Some(key) = &self.exact_key {
            if record.key() != key.as_ref() {
                self.reader = None;
                return Ok(false);
            }
        }
        self.current = record;
        Ok(true)
    }

    fn current(&self) -> &Record {
        &self.current
    }

    fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }

    fn move_next_hint(&mut self, key: &[u8]) {
        if let Some(reader) = self.reader.as_mut() {
            reader.move_next_hint(key);
        }
    }
}

/// Open a source from a path: a store directory, a plain directory, or
/// a flat file.
pub fn open_path(path: &Path, options: &Options) -> Result<BoxedSource> {
    if filename::is_store_dir(path) {
        Ok(Box::new(StoreSource::open(path)?))
    } else if path.is_dir() {
        Ok(Box::new(DirectorySource::open(
            path,
            options.separator,
            None,
        )?))
    } else if path.is_file() {
        Ok(Box::new(FlatFileSource::open(path, options.separator)?))
    } else {
        Err(Error::Io(format!("no such source: {}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreWriter;
    use crate::util::comparator::SortOrder;
    use std::io::BufWriter;
    use tempfile::tempdir;

    fn drain(source: &mut dyn RecordSource) -> Vec<(String, String)> {
        let mut out = Vec::new();
        while source.advance().unwrap() {
            let record = source.current();
            out.push((
                String::from_utf8(record.key().to_vec()).unwrap(),
                String::from_utf8(record.payload().to_vec()).unwrap(),
            ));
        }
        out
    }

    #[test]
    fn test_vec_source() {
        let mut source = VecSource::from_pairs("test", &[("a", "1"), ("b", "2")]);
        assert_eq!(source.meta().estimated_records, Some(2));
        assert_eq!(
            drain(&mut source),
            vec![("a".into(), "1".into()), ("b".into(), "2".into())]
        );
        assert!(!source.advance().unwrap()); // terminal stays terminal
    }

    #[test]
    fn test_callback_source() {
        let mut n = 0;
        let mut source = CallbackSource::new(
            "gen",
            Box::new(move || {
                n += 1;
                if n <= 3 {
                    Ok(Some(Record::new(format!("k{}", n), format!("v{}", n))))
                } else {
                    Ok(None)
                }
            }),
        );
        assert_eq!(drain(&mut source).len(), 3);
        assert!(!source.advance().unwrap());
    }

    #[test]
    fn test_record_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records");

        let mut writer = BufWriter::new(File::create(&path).unwrap());
        write_framed(&mut writer, b"alpha", b"1").unwrap();
        write_framed(&mut writer, b"", b"empty key").unwrap();
        write_framed(&mut writer, b"beta", b"").unwrap();
        writer.flush().unwrap();

        let mut source = RecordFileSource::open(&path).unwrap();
        assert_eq!(
            drain(&mut source),
            vec![
                ("alpha".into(), "1".into()),
                ("".into(), "empty key".into()),
                ("beta".into(), "".into()),
            ]
        );
    }

    #[test]
    fn test_record_file_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records");

        let mut writer = BufWriter::new(File::create(&path).unwrap());
        write_framed(&mut writer, b"alpha", b"payload").unwrap();
        writer.flush().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();

        let mut source = RecordFileSource::open(&path).unwrap();
        assert!(source.advance().is_err());
    }

    #[test]
    fn test_flat_file_source() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.tsv");
        std::fs::write(&path, "b\t2\na\t1\n\nnokey\n").unwrap();

        let mut source = FlatFileSource::open(&path, '\t').unwrap();
        assert_eq!(
            drain(&mut source),
            vec![
                ("b".into(), "2".into()),
                ("a".into(), "1".into()),
                ("nokey".into(), "".into()),
            ]
        );
    }

    #[test]
    fn test_flat_file_with_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.tsv");
        std::fs::write(&path, "1\tAlice\tParis\n2\tBob\tOslo\n").unwrap();

        let schema = TableSchema::new(
            vec!["id".into(), "name".into(), "city".into()],
            vec![0],
            '\t',
        )
        .unwrap();
        let mut source = FlatFileSource::with_schema(&path, schema).unwrap();

        assert!(source.advance().unwrap());
        assert_eq!(source.current().key(), b"1");
        assert_eq!(source.current().payload(), b"1\tAlice\tParis");
        assert!(matches!(source.meta().kind, RecordKind::Table(_)));
    }

    #[test]
    fn test_directory_source_name_order() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b.tsv"), "x\t2\n").unwrap();
        std::fs::write(dir.path().join("a.tsv"), "x\t1\n").unwrap();

        let mut source = DirectorySource::open(dir.path(), '\t', None).unwrap();
        let records = drain(&mut source);
        assert_eq!(records[0].1, "1");
        assert_eq!(records[1].1, "2");
    }

    fn build_store(keys: &[&str]) -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let mut options = Options::default();
        options.group_size = 2;
        let mut writer = StoreWriter::create(dir.path(), options, RecordKind::Bytes).unwrap();
        for key in keys {
            writer
                .append(&Record::new(key.to_string(), format!("v_{}", key)))
                .unwrap();
        }
        writer.finish().unwrap();
        dir
    }

    #[test]
    fn test_store_source_full_scan() {
        let dir = build_store(&["a", "b", "c", "d", "e"]);
        let mut source = StoreSource::open(dir.path()).unwrap();

        assert!(source.meta().is_sorted(SortOrder::Ascending));
        let records = drain(&mut source);
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].0, "a");
        assert_eq!(records[4].0, "e");
    }

    #[test]
    fn test_store_source_prefix_scan() {
        let dir = build_store(&["app", "apple", "apricot", "banana"]);
        let mut source = StoreSource::with_prefix(dir.path(), b"ap").unwrap();

        let keys: Vec<String> = drain(&mut source).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["app", "apple", "apricot"]);
    }

    #[test]
    fn test_store_source_exact_key() {
        let dir = build_store(&["app", "app", "apple"]);
        let mut source = StoreSource::with_key(dir.path(), b"app").unwrap();

        let keys: Vec<String> = drain(&mut source).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["app", "app"]);
    }

    #[test]
    fn test_open_path_dispatch() {
        let options = Options::default();

        let store = build_store(&["a"]);
        let source = open_path(store.path(), &options).unwrap();
        assert!(source.meta().is_sorted(SortOrder::Ascending));

        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f.tsv"), "k\tv\n").unwrap();
        let mut source = open_path(dir.path(), &options).unwrap();
        assert!(source.advance().unwrap());

        assert!(open_path(Path::new("/no/such/path"), &options).is_err());
    }
}

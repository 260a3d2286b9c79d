//! Store writer: builds the immutable store files from sorted input.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::BytesMut;

use crate::options::Options;
use crate::pipeline::sort::{SortOptions, Sorter};
use crate::pipeline::RecordSource;
use crate::record::{Record, RecordKind};
use crate::util::comparator::SortOrder;
use crate::util::filename;
use crate::{Error, Result};

use super::record_info::RecordInfo;
use super::segment::{encode_entry, encode_record, GroupIndex};

/// Writer for one data+index file pair.
///
/// Appends front-coded records, starting a fresh group (and a fresh
/// front-coding chain) every `group_size` records, and pads the final
/// group with empty records at finish.
struct SegmentWriter {
    data: BufWriter<File>,
    index_path: PathBuf,
    offsets: Vec<u64>,
    data_offset: u64,
    group_size: usize,
    record_count: i64,
    group_fill: usize,
    last_key: Vec<u8>,
    scratch: BytesMut,
}

impl SegmentWriter {
    fn create(data_path: &Path, index_path: &Path, group_size: usize) -> Result<Self> {
        let file = File::create(data_path)?;
        Ok(Self {
            data: BufWriter::new(file),
            index_path: index_path.to_path_buf(),
            offsets: Vec::new(),
            data_offset: 0,
            group_size,
            record_count: 0,
            group_fill: 0,
            last_key: Vec::new(),
            scratch: BytesMut::with_capacity(4 * 1024),
        })
    }

    /// Append a record. Returns true if it started a new group.
    fn append(&mut self, key: &[u8], payload: &[u8]) -> Result<bool> {
        if self.record_count > 0 && key < self.last_key.as_slice() {
            return Err(Error::KeyOutOfOrder(format!(
                "{:?} after {:?}",
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(&self.last_key),
            )));
        }

        let new_group = self.group_fill == 0;
        self.scratch.clear();
        if new_group {
            self.offsets.push(self.data_offset);
            // Full key at each group start so groups decode standalone.
            encode_entry(&mut self.scratch, 0, key, payload);
        } else {
            encode_record(&mut self.scratch, &self.last_key, key, payload);
        }
        self.data.write_all(&self.scratch)?;
        self.data_offset += self.scratch.len() as u64;

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.record_count += 1;
        self.group_fill = (self.group_fill + 1) % self.group_size;
        Ok(new_group)
    }

    /// Pad the final group, write the index, and sync both files.
    fn finish(mut self) -> Result<i64> {
        while self.group_fill != 0 {
            self.scratch.clear();
            encode_entry(&mut self.scratch, 0, b"", b"");
            self.data.write_all(&self.scratch)?;
            self.data_offset += self.scratch.len() as u64;
            self.group_fill = (self.group_fill + 1) % self.group_size;
        }

        self.data.flush()?;
        self.data.get_ref().sync_all()?;

        let index = GroupIndex::encode(&self.offsets, self.record_count, self.group_size)?;
        let index_file = File::create(&self.index_path)?;
        let mut index_writer = BufWriter::new(index_file);
        index_writer.write_all(&index)?;
        index_writer.flush()?;
        index_writer.get_ref().sync_all()?;

        Ok(self.record_count)
    }
}

/// Summary of a completed store.
#[derive(Debug, Clone)]
pub struct StoreSummary {
    /// Logical records written.
    pub record_count: i64,
    /// Total key+payload bytes.
    pub byte_size: u64,
}

/// Writer for a complete store directory.
///
/// Input must arrive in ascending key order through [`append`]; callers
/// without a pre-sorted source use [`add_record`], which routes records
/// through the external sorter and drains it at finish.
///
/// [`append`]: StoreWriter::append
/// [`add_record`]: StoreWriter::add_record
pub struct StoreWriter {
    dir: PathBuf,
    options: Options,
    kind: RecordKind,
    main: SegmentWriter,
    cache: SegmentWriter,
    byte_size: u64,
    reduced: bool,
    sorter: Option<Sorter>,
}

impl StoreWriter {
    /// Create a store directory and its writer.
    pub fn create(dir: &Path, options: Options, kind: RecordKind) -> Result<Self> {
        options.validate()?;
        fs::create_dir_all(dir)?;

        let main = SegmentWriter::create(
            &filename::keys_data_path(dir),
            &filename::keys_data_index_path(dir),
            options.group_size,
        )?;
        let cache = SegmentWriter::create(
            &filename::cache_path(dir),
            &filename::cache_index_path(dir),
            options.group_size,
        )?;

        Ok(Self {
            dir: dir.to_path_buf(),
            options,
            kind,
            main,
            cache,
            byte_size: 0,
            reduced: false,
            sorter: None,
        })
    }

    /// The store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Records appended so far (excluding any still buffered in the
    /// push-model sorter).
    pub fn record_count(&self) -> i64 {
        self.main.record_count
    }

    /// Mark the store as holding reduced output.
    pub fn set_reduced(&mut self, reduced: bool) {
        self.reduced = reduced;
    }

    /// Append a record that is already in ascending key order.
    pub fn append(&mut self, record: &Record) -> Result<()> {
        if self.sorter.is_some() {
            return Err(Error::internal(
                "append and add_record cannot be mixed on one writer",
            ));
        }
        self.append_inner(record)
    }

    fn append_inner(&mut self, record: &Record) -> Result<()> {
        let new_group = self.main.append(record.key(), record.payload())?;
        if new_group {
            self.cache.append(record.key(), b"")?;
        }
        self.byte_size += (record.key().len() + record.payload().len()) as u64;
        Ok(())
    }

    /// Push a record in arbitrary order.
    ///
    /// Lazily instantiates the external sorter; the sorted (and, for
    /// reducible kinds, reduced) output is written at finish.
    pub fn add_record(&mut self, record: Record) -> Result<()> {
        if self.main.record_count > 0 {
            return Err(Error::internal(
                "append and add_record cannot be mixed on one writer",
            ));
        }
        if self.sorter.is_none() {
            let sort_options = SortOptions {
                order: SortOrder::Ascending,
                reduce: self.kind.is_reducible(),
                kind: Some(self.kind.clone()),
                memory_limit: self.options.sort_memory_limit,
                arena_capacity: self.options.arena_capacity,
                temp_dir: self.options.temp_dir(),
                keep_temp_files: self.options.keep_temp_files,
            };
            self.reduced = sort_options.reduce;
            self.sorter = Some(Sorter::new(sort_options));
        }
        self.sorter
            .as_mut()
            .expect("sorter just created")
            .push(record)
    }

    /// Finish the store: drain any sorter, pad groups, write indexes and
    /// the record-info sidecar.
    pub fn finish(mut self) -> Result<StoreSummary> {
        if let Some(sorter) = self.sorter.take() {
            let mut sorted = sorter.into_source()?;
            while sorted.advance()? {
                let record = sorted.current().clone();
                self.append_inner(&record)?;
            }
            sorted.close()?;
        }

        let record_count = self.main.finish()?;
        self.cache.finish()?;

        let info = RecordInfo {
            kind: self.kind,
            sorted: Some(SortOrder::Ascending),
            reduced: self.reduced,
            buckets: 0,
            segments: 0,
            record_count,
            byte_size: self.byte_size,
        };
        info.write_to(&self.dir)?;

        Ok(StoreSummary {
            record_count,
            byte_size: self.byte_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::reader::StoreReader;
    use tempfile::tempdir;

    fn small_options() -> Options {
        let mut options = Options::default();
        options.group_size = 4;
        options
    }

    #[test]
    fn test_writer_empty_store() {
        let dir = tempdir().unwrap();
        let writer = StoreWriter::create(dir.path(), small_options(), RecordKind::Bytes).unwrap();
        let summary = writer.finish().unwrap();
        assert_eq!(summary.record_count, 0);
        assert_eq!(summary.byte_size, 0);

        let info = RecordInfo::read_from(dir.path()).unwrap();
        assert_eq!(info.record_count, 0);
    }

    #[test]
    fn test_writer_rejects_out_of_order() {
        let dir = tempdir().unwrap();
        let mut writer =
            StoreWriter::create(dir.path(), small_options(), RecordKind::Bytes).unwrap();

        writer.append(&Record::new(&b"b"[..], &b"1"[..])).unwrap();
        let err = writer.append(&Record::new(&b"a"[..], &b"2"[..]));
        assert!(matches!(err, Err(Error::KeyOutOfOrder(_))));
    }

    #[test]
    fn test_writer_allows_duplicate_keys() {
        let dir = tempdir().unwrap();
        let mut writer =
            StoreWriter::create(dir.path(), small_options(), RecordKind::Bytes).unwrap();

        writer.append(&Record::new(&b"a"[..], &b"1"[..])).unwrap();
        writer.append(&Record::new(&b"a"[..], &b"2"[..])).unwrap();
        let summary = writer.finish().unwrap();
        assert_eq!(summary.record_count, 2);
    }

    #[test]
    fn test_writer_files_exist() {
        let dir = tempdir().unwrap();
        let mut writer =
            StoreWriter::create(dir.path(), small_options(), RecordKind::Bytes).unwrap();
        for i in 0..10 {
            let key = format!("key_{:02}", i);
            writer.append(&Record::new(key, &b"v"[..])).unwrap();
        }
        writer.finish().unwrap();

        for name in [
            filename::KEYS_DATA,
            filename::KEYS_DATA_INDEX,
            filename::CACHE,
            filename::CACHE_INDEX,
            filename::RECORD_INFO,
        ] {
            assert!(dir.path().join(name).is_file(), "missing {}", name);
        }
        assert!(filename::is_store_dir(dir.path()));
    }

    #[test]
    fn test_add_record_sorts_input() {
        let dir = tempdir().unwrap();
        let mut writer =
            StoreWriter::create(dir.path(), small_options(), RecordKind::Bytes).unwrap();

        for key in ["delta", "alpha", "charlie", "bravo"] {
            writer.add_record(Record::new(key, &b"v"[..])).unwrap();
        }
        let summary = writer.finish().unwrap();
        assert_eq!(summary.record_count, 4);

        let mut reader = StoreReader::open(dir.path()).unwrap();
        let keys: Vec<_> = (0..4)
            .map(|i| {
                let record = reader.get_record_no(i).unwrap();
                String::from_utf8(record.key().to_vec()).unwrap()
            })
            .collect();
        assert_eq!(keys, ["alpha", "bravo", "charlie", "delta"]);
    }

    #[test]
    fn test_mixing_append_and_add_record_fails() {
        let dir = tempdir().unwrap();
        let mut writer =
            StoreWriter::create(dir.path(), small_options(), RecordKind::Bytes).unwrap();
        writer.append(&Record::new(&b"a"[..], &b"1"[..])).unwrap();
        assert!(writer.add_record(Record::new(&b"b"[..], &b"2"[..])).is_err());
    }
}

//! Store reader: keyed lookup, record-number access, and prefix ranges.
//!
//! Binary search never scans the data file: the nested cache store (one
//! record per group, holding the group's first key) is loaded whole at
//! open, so settling on a group costs in-memory comparisons only, after
//! which at most one group of the data file is decoded.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::record::Record;
use crate::util::filename;
use crate::{Error, Result};

use super::record_info::RecordInfo;
use super::segment::{GroupIndex, MemSegment};

/// Inclusive range of record numbers, as returned by prefix queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRange {
    /// First matching record number.
    pub low: i64,
    /// Last matching record number.
    pub high: i64,
}

impl RecordRange {
    /// The empty range.
    pub const EMPTY: RecordRange = RecordRange { low: 0, high: -1 };

    /// True if the range holds no records.
    pub fn is_empty(&self) -> bool {
        self.high < self.low
    }

    /// Number of records in the range.
    pub fn len(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.high - self.low + 1
        }
    }
}

/// Decode state for one loaded group of the data file.
struct GroupScan {
    group: usize,
    data: Bytes,
    pos: usize,
    decoded: usize,
    key: Vec<u8>,
    payload_start: usize,
    payload_len: usize,
}

impl GroupScan {
    fn new(group: usize, data: Bytes) -> Self {
        Self {
            group,
            data,
            pos: 0,
            decoded: 0,
            key: Vec::new(),
            payload_start: 0,
            payload_len: 0,
        }
    }

    /// Decode the next record of the group, continuing the front-coding
    /// chain from the previously decoded key.
    fn advance(&mut self) -> Result<()> {
        let mut view = &self.data[self.pos..];
        let start_len = view.len();
        let overlap = crate::util::coding::decode_varint64(&mut view)
            .ok_or_else(|| Error::corruption("truncated record overlap"))?
            as usize;
        let suffix_len = crate::util::coding::decode_varint64(&mut view)
            .ok_or_else(|| Error::corruption("truncated record suffix length"))?
            as usize;
        if overlap > self.key.len() {
            return Err(Error::corruption(format!(
                "record overlap {} exceeds previous key length {}",
                overlap,
                self.key.len()
            )));
        }
        if view.len() < suffix_len {
            return Err(Error::corruption("truncated record suffix"));
        }
        self.key.truncate(overlap);
        self.key.extend_from_slice(&view[..suffix_len]);
        view = &view[suffix_len..];

        let payload_len = crate::util::coding::decode_varint64(&mut view)
            .ok_or_else(|| Error::corruption("truncated payload length"))?
            as usize;
        if view.len() < payload_len {
            return Err(Error::corruption("truncated payload"));
        }

        let header_len = start_len - view.len();
        self.payload_start = self.pos + header_len;
        self.payload_len = payload_len;
        self.pos = self.payload_start + payload_len;
        self.decoded += 1;
        Ok(())
    }

    fn payload(&self) -> Bytes {
        self.data
            .slice(self.payload_start..self.payload_start + self.payload_len)
    }
}

/// Reader over one store directory.
pub struct StoreReader {
    dir: PathBuf,
    file: File,
    data_len: u64,
    index: GroupIndex,
    cache: MemSegment,
    info: RecordInfo,
    scan: Option<GroupScan>,
    next_no: i64,
    hint: Option<Bytes>,
}

impl StoreReader {
    /// Open a store directory, loading the index and the cache store.
    pub fn open(dir: &Path) -> Result<Self> {
        let index_bytes = fs::read(filename::keys_data_index_path(dir))?;
        let index = GroupIndex::parse(&index_bytes)?;

        let cache_index_bytes = fs::read(filename::cache_index_path(dir))?;
        let cache_index = GroupIndex::parse(&cache_index_bytes)?;
        let cache_data = fs::read(filename::cache_path(dir))?;
        let cache = MemSegment::new(Bytes::from(cache_data), cache_index);

        if cache.record_count() != index.num_groups() as i64 {
            return Err(Error::corruption(format!(
                "cache holds {} keys for {} groups",
                cache.record_count(),
                index.num_groups()
            )));
        }

        let info = RecordInfo::read_from(dir)?;
        if info.record_count != index.record_count() {
            return Err(Error::corruption(format!(
                "record-info count {} disagrees with index count {}",
                info.record_count,
                index.record_count()
            )));
        }

        let file = File::open(filename::keys_data_path(dir))?;
        let data_len = file.metadata()?.len();

        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            data_len,
            index,
            cache,
            info,
            scan: None,
            next_no: 0,
            hint: None,
        })
    }

    /// The store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Logical record count.
    pub fn record_count(&self) -> i64 {
        self.index.record_count()
    }

    /// The store's metadata sidecar.
    pub fn info(&self) -> &RecordInfo {
        &self.info
    }

    /// The parsed group index.
    pub fn index(&self) -> &GroupIndex {
        &self.index
    }

    /// First key of a group, from the memory-resident cache.
    fn group_first_key(&self, group: usize) -> Result<Bytes> {
        self.cache.key_at(group as i64)
    }

    /// Last group whose first key is <= `key`, or None if `key` sorts
    /// before the first record of the store.
    fn find_group(&self, key: &[u8]) -> Result<Option<usize>> {
        let groups = self.index.num_groups();
        if groups == 0 {
            return Ok(None);
        }
        if self.group_first_key(0)?.as_ref() > key {
            return Ok(None);
        }

        let mut left = 0usize;
        let mut right = groups - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            if self.group_first_key(mid)?.as_ref() <= key {
                left = mid;
            } else {
                right = mid - 1;
            }
        }
        Ok(Some(left))
    }

    /// Last group whose first key is strictly before `key`: the group
    /// where records >= `key` can begin. None when every group starts
    /// at or past `key` (the edge is then record 0).
    ///
    /// Edge searches must use this strict variant: when a duplicate key
    /// is the first key of several groups, the non-strict search lands
    /// on the last of them and would skip earlier occurrences.
    fn find_group_before(&self, key: &[u8]) -> Result<Option<usize>> {
        let groups = self.index.num_groups();
        if groups == 0 {
            return Ok(None);
        }
        if self.group_first_key(0)?.as_ref() >= key {
            return Ok(None);
        }

        let mut left = 0usize;
        let mut right = groups - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            if self.group_first_key(mid)?.as_ref() < key {
                left = mid;
            } else {
                right = mid - 1;
            }
        }
        Ok(Some(left))
    }

    fn load_group(&mut self, group: usize) -> Result<()> {
        if matches!(&self.scan, Some(s) if s.group == group && s.decoded == 0) {
            return Ok(());
        }
        if let Some(s) = &self.scan {
            if s.group == group {
                // Re-decode from the cached span rather than re-reading.
                let data = s.data.clone();
                self.scan = Some(GroupScan::new(group, data));
                return Ok(());
            }
        }

        let (start, end) = self.index.group_span(group, self.data_len);
        let len = (end - start) as usize;
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(start))?;
        self.file.read_exact(&mut buf)?;
        self.scan = Some(GroupScan::new(group, Bytes::from(buf)));
        Ok(())
    }

    /// Decode records of `group` until the record at `idx_in_group` is
    /// current, reusing an in-progress scan when it is behind the target.
    fn position_at(&mut self, group: usize, idx_in_group: usize) -> Result<()> {
        let reusable = matches!(
            &self.scan,
            Some(s) if s.group == group && s.decoded > 0 && s.decoded <= idx_in_group + 1
        );
        if !reusable {
            self.load_group(group)?;
        }
        let scan = self
            .scan
            .as_mut()
            .ok_or_else(|| Error::internal("group scan missing after load"))?;
        while scan.decoded < idx_in_group + 1 {
            scan.advance()?;
        }
        Ok(())
    }

    /// Fetch a record by its number.
    ///
    /// Sequential calls (`record_no` = previous + 1) continue the
    /// current group scan without touching the index.
    pub fn get_record_no(&mut self, record_no: i64) -> Result<Record> {
        if !self.index.contains_record(record_no) {
            return Err(Error::RecordOutOfRange {
                record_no,
                count: self.index.record_count(),
            });
        }

        let group = self.index.group_of(record_no);
        let idx_in_group = record_no as usize - group * self.index.group_size();
        self.position_at(group, idx_in_group)?;

        let scan = self.scan.as_ref().expect("scan positioned");
        let record = Record::with_record_no(
            Bytes::copy_from_slice(&scan.key),
            scan.payload(),
            record_no,
        );
        self.next_no = record_no + 1;
        Ok(record)
    }

    /// Exact-match lookup by key.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Record>> {
        let group = match self.find_group(key)? {
            Some(g) => g,
            None => return Ok(None),
        };

        let in_group = self.index.records_in_group(group);
        self.load_group(group)?;
        let first_no = self.index.first_record_of(group);

        for i in 0..in_group {
            let scan = self.scan.as_mut().expect("group loaded");
            if scan.decoded < i + 1 {
                scan.advance()?;
            }
            let scan = self.scan.as_ref().expect("group loaded");
            if scan.key.as_slice() == key {
                let record = Record::with_record_no(
                    Bytes::copy_from_slice(&scan.key),
                    scan.payload(),
                    first_no + i as i64,
                );
                return Ok(Some(record));
            }
            if scan.key.as_slice() > key {
                return Ok(None); // overshot: key absent
            }
        }
        Ok(None)
    }

    /// First record number whose key is >= `target`, or the record
    /// count when every key sorts before `target`.
    fn lower_bound(&mut self, target: &[u8]) -> Result<i64> {
        let count = self.index.record_count();
        let group = match self.find_group_before(target)? {
            Some(g) => g,
            None => return Ok(0),
        };

        let in_group = self.index.records_in_group(group);
        let first_no = self.index.first_record_of(group);
        self.load_group(group)?;

        for i in 0..in_group {
            let scan = self.scan.as_mut().expect("group loaded");
            if scan.decoded < i + 1 {
                scan.advance()?;
            }
            let scan = self.scan.as_ref().expect("group loaded");
            if scan.key.as_slice() >= target {
                return Ok(first_no + i as i64);
            }
        }
        // Every key in the settled group sorts before the target; the
        // next group's first key (if any) is the boundary.
        Ok((first_no + in_group as i64).min(count))
    }

    /// Record-number range of all keys starting with `prefix`.
    ///
    /// Two edge searches: the lower edge is the first key >= the prefix,
    /// the upper edge the first key >= the prefix's successor.
    pub fn matching_prefix(&mut self, prefix: &[u8]) -> Result<RecordRange> {
        let count = self.index.record_count();
        if count == 0 {
            return Ok(RecordRange::EMPTY);
        }

        let low = self.lower_bound(prefix)?;
        if low >= count {
            return Ok(RecordRange::EMPTY);
        }
        if !self.get_record_no(low)?.key().starts_with(prefix) {
            return Ok(RecordRange::EMPTY);
        }

        let high = match prefix_successor(prefix) {
            Some(successor) => self.lower_bound(&successor)? - 1,
            None => count - 1,
        };

        Ok(RecordRange { low, high })
    }

    /// Advise the reader to jump to the group that could contain `key`
    /// before the next sequential read.
    pub fn move_next_hint(&mut self, key: &[u8]) {
        self.hint = Some(Bytes::copy_from_slice(key));
    }

    /// Record number the next sequential read will return.
    pub fn position(&self) -> i64 {
        self.next_no
    }

    /// Reset the sequential cursor.
    pub fn seek_to(&mut self, record_no: i64) {
        self.next_no = record_no.max(0);
        self.hint = None;
    }

    /// Read the next record in sequence, honoring any pending hint.
    /// Returns None past the last record.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if let Some(hint) = self.hint.take() {
            // Jump to the group where keys >= the hint can begin; the
            // strict search keeps duplicates of the hinted key visible.
            if let Some(group) = self.find_group_before(&hint)? {
                let first = self.index.first_record_of(group);
                if first > self.next_no {
                    self.next_no = first;
                }
            }
        }

        if !self.index.contains_record(self.next_no) {
            return Ok(None);
        }
        let record = self.get_record_no(self.next_no)?;
        Ok(Some(record))
    }
}

/// Smallest byte string greater than every string with the given
/// prefix, or None when no such bound exists (all-0xFF prefixes).
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut successor = prefix.to_vec();
    while let Some(&last) = successor.last() {
        if last < 0xFF {
            *successor.last_mut().expect("non-empty") += 1;
            return Some(successor);
        }
        successor.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::record::RecordKind;
    use crate::store::writer::StoreWriter;
    use tempfile::{tempdir, TempDir};

    fn build_store(keys: &[&str], group_size: usize) -> (TempDir, StoreReader) {
        let dir = tempdir().unwrap();
        let mut options = Options::default();
        options.group_size = group_size;

        let mut writer = StoreWriter::create(dir.path(), options, RecordKind::Bytes).unwrap();
        for key in keys {
            let payload = format!("payload_{}", key);
            writer.append(&Record::new(key.to_string(), payload)).unwrap();
        }
        writer.finish().unwrap();

        let reader = StoreReader::open(dir.path()).unwrap();
        (dir, reader)
    }

    #[test]
    fn test_sequential_roundtrip() {
        let keys: Vec<String> = (0..100).map(|i| format!("key_{:04}", i)).collect();
        let key_refs: Vec<&str> = keys.iter().map(|s| s.as_str()).collect();
        let (_dir, mut reader) = build_store(&key_refs, 4);

        assert_eq!(reader.record_count(), 100);
        for i in 0..100 {
            let record = reader.get_record_no(i).unwrap();
            assert_eq!(record.key(), keys[i as usize].as_bytes());
            assert_eq!(
                record.payload(),
                format!("payload_{}", keys[i as usize]).as_bytes()
            );
            assert_eq!(record.record_no(), i);
        }
    }

    #[test]
    fn test_get_present_and_absent() {
        let keys = ["apple", "banana", "cherry", "date", "elder", "fig", "grape"];
        let (_dir, mut reader) = build_store(&keys, 3);

        for key in keys {
            let record = reader.get(key.as_bytes()).unwrap().unwrap();
            assert_eq!(record.key(), key.as_bytes());
        }

        assert!(reader.get(b"aardvark").unwrap().is_none()); // before first
        assert!(reader.get(b"blueberry").unwrap().is_none()); // between keys
        assert!(reader.get(b"zucchini").unwrap().is_none()); // after last
        assert!(reader.get(b"applex").unwrap().is_none()); // prefix overshoot
    }

    #[test]
    fn test_get_record_no_out_of_range() {
        let (_dir, mut reader) = build_store(&["a", "b"], 4);
        assert!(reader.get_record_no(2).is_err());
        assert!(reader.get_record_no(-1).is_err());
    }

    #[test]
    fn test_group_padding_invisible() {
        // 7 records with group size 4: final group holds 3 + 1 padding.
        let keys = ["a", "b", "c", "d", "e", "f", "g"];
        let (_dir, mut reader) = build_store(&keys, 4);

        assert_eq!(reader.record_count(), 7);
        assert!(reader.get_record_no(7).is_err());
        // The empty padding key must not be visible to lookups.
        assert!(reader.get(b"").unwrap().is_none());
    }

    #[test]
    fn test_empty_store() {
        let (_dir, mut reader) = build_store(&[], 4);
        assert_eq!(reader.record_count(), 0);
        assert!(reader.get(b"anything").unwrap().is_none());
        assert!(reader.next_record().unwrap().is_none());
        assert!(reader.matching_prefix(b"x").unwrap().is_empty());
    }

    #[test]
    fn test_matching_prefix() {
        let keys = [
            "app", "apple", "apple_pie", "apricot", "banana", "bananas", "cherry",
        ];
        let (_dir, mut reader) = build_store(&keys, 2);

        let range = reader.matching_prefix(b"apple").unwrap();
        assert_eq!(range, RecordRange { low: 1, high: 2 });

        let range = reader.matching_prefix(b"ap").unwrap();
        assert_eq!(range, RecordRange { low: 0, high: 3 });

        let range = reader.matching_prefix(b"banana").unwrap();
        assert_eq!(range, RecordRange { low: 4, high: 5 });

        let range = reader.matching_prefix(b"cherry").unwrap();
        assert_eq!(range, RecordRange { low: 6, high: 6 });

        assert!(reader.matching_prefix(b"blueberry").unwrap().is_empty());
        assert!(reader.matching_prefix(b"zzz").unwrap().is_empty());

        // Empty prefix matches everything.
        let range = reader.matching_prefix(b"").unwrap();
        assert_eq!(range, RecordRange { low: 0, high: 6 });
    }

    #[test]
    fn test_matching_prefix_duplicates_span_groups() {
        // The duplicate key is the first key of two groups; the lower
        // edge must still land on the first occurrence.
        let keys = ["a", "dup", "dup", "dup", "dup", "z"];
        let (_dir, mut reader) = build_store(&keys, 2);

        let range = reader.matching_prefix(b"dup").unwrap();
        assert_eq!(range, RecordRange { low: 1, high: 4 });
    }

    #[test]
    fn test_matching_prefix_order() {
        let keys = ["ba", "bb", "bc", "bd"];
        let (_dir, mut reader) = build_store(&keys, 2);

        let range = reader.matching_prefix(b"b").unwrap();
        assert_eq!(range.len(), 4);
        let mut got = Vec::new();
        for no in range.low..=range.high {
            got.push(reader.get_record_no(no).unwrap().key().to_vec());
        }
        assert_eq!(got, vec![b"ba".to_vec(), b"bb".to_vec(), b"bc".to_vec(), b"bd".to_vec()]);
    }

    #[test]
    fn test_sequential_cursor_and_hint() {
        let keys: Vec<String> = (0..64).map(|i| format!("key_{:04}", i)).collect();
        let key_refs: Vec<&str> = keys.iter().map(|s| s.as_str()).collect();
        let (_dir, mut reader) = build_store(&key_refs, 4);

        let first = reader.next_record().unwrap().unwrap();
        assert_eq!(first.record_no(), 0);

        // Hint far ahead: the next read lands in the hinted key's group.
        reader.move_next_hint(b"key_0050");
        let jumped = reader.next_record().unwrap().unwrap();
        assert!(jumped.record_no() >= 48, "jumped to {}", jumped.record_no());
        assert!(jumped.record_no() <= 50);

        // Hints never move the cursor backwards.
        reader.move_next_hint(b"key_0001");
        let next = reader.next_record().unwrap().unwrap();
        assert_eq!(next.record_no(), jumped.record_no() + 1);
    }

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(b"abc"), Some(b"abd".to_vec()));
        assert_eq!(prefix_successor(b"ab\xff"), Some(b"ac".to_vec()));
        assert_eq!(prefix_successor(b"\xff\xff"), None);
        assert_eq!(prefix_successor(b""), None);
    }

    #[test]
    fn test_corrupt_index_rejected() {
        let keys = ["a", "b", "c"];
        let dir = tempdir().unwrap();
        let mut options = Options::default();
        options.group_size = 2;
        let mut writer = StoreWriter::create(dir.path(), options, RecordKind::Bytes).unwrap();
        for key in keys {
            writer.append(&Record::new(key, &b"v"[..])).unwrap();
        }
        writer.finish().unwrap();

        // Truncate the index behind the reader's back.
        let index_path = filename::keys_data_index_path(dir.path());
        let bytes = fs::read(&index_path).unwrap();
        fs::write(&index_path, &bytes[..bytes.len() - 4]).unwrap();

        assert!(StoreReader::open(dir.path()).is_err());
    }
}

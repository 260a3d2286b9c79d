//! Thread-safe store reader.
//!
//! Index and cache are preloaded so group search is pure memory work;
//! the only disk access is reading a group's byte span, and those reads
//! are funneled through one dedicated I/O thread. Callers enqueue
//! `(offset, len)` requests and block on their own response slot, so any
//! number of logical threads can look up concurrently without
//! interleaved seeks on the shared file handle.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::record::Record;
use crate::util::filename;
use crate::{Error, Result};

use super::record_info::RecordInfo;
use super::segment::{GroupCursor, GroupIndex, MemSegment};

/// One caller's parked read: filled in by the worker, waited on by the
/// submitting thread.
struct ResponseSlot {
    result: Mutex<Option<Result<Bytes>>>,
    ready: Condvar,
}

impl ResponseSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    fn complete(&self, result: Result<Bytes>) {
        *self.result.lock() = Some(result);
        self.ready.notify_one();
    }

    fn wait(&self) -> Result<Bytes> {
        let mut guard = self.result.lock();
        while guard.is_none() {
            self.ready.wait(&mut guard);
        }
        guard.take().expect("slot completed")
    }
}

struct ReadRequest {
    offset: u64,
    len: usize,
    slot: Arc<ResponseSlot>,
}

struct FunnelQueue {
    requests: VecDeque<ReadRequest>,
    worker_alive: bool,
    shutdown: bool,
    handle: Option<JoinHandle<()>>,
}

struct FunnelShared {
    queue: Mutex<FunnelQueue>,
    work: Condvar,
}

/// Serializes physical reads of one file through a dedicated thread.
struct DiskFunnel {
    path: PathBuf,
    shared: Arc<FunnelShared>,
}

impl DiskFunnel {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            shared: Arc::new(FunnelShared {
                queue: Mutex::new(FunnelQueue {
                    requests: VecDeque::new(),
                    worker_alive: false,
                    shutdown: false,
                    handle: None,
                }),
                work: Condvar::new(),
            }),
        }
    }

    /// Submit a read and block until the worker completes it.
    fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        let slot = ResponseSlot::new();
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return Err(Error::WorkerDead("funnel shut down".into()));
            }
            if !queue.worker_alive {
                // A dead worker is restarted on next use.
                if let Some(handle) = queue.handle.take() {
                    let _ = handle.join();
                }
                let shared = Arc::clone(&self.shared);
                let path = self.path.clone();
                let handle = thread::Builder::new()
                    .name("tstore-disk-io".to_string())
                    .spawn(move || worker_loop(shared, path))
                    .map_err(|e| Error::WorkerDead(e.to_string()))?;
                queue.worker_alive = true;
                queue.handle = Some(handle);
            }
            queue.requests.push_back(ReadRequest {
                offset,
                len,
                slot: Arc::clone(&slot),
            });
            self.shared.work.notify_one();
        }
        slot.wait()
    }

    fn shutdown(&self) {
        let handle = {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            for request in queue.requests.drain(..) {
                request.slot.complete(Err(Error::WorkerDead("funnel shut down".into())));
            }
            self.shared.work.notify_all();
            queue.handle.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for DiskFunnel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker: dequeue, seek, read, complete. Any I/O failure kills the
/// worker after failing its request; queued requests are drained with
/// `WorkerDead` and the next submission restarts the thread.
fn worker_loop(shared: Arc<FunnelShared>, path: PathBuf) {
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(e) => {
            die(&shared, format!("open {}: {}", path.display(), e));
            return;
        }
    };

    loop {
        let request = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.shutdown {
                    queue.worker_alive = false;
                    return;
                }
                if let Some(request) = queue.requests.pop_front() {
                    break request;
                }
                shared.work.wait(&mut queue);
            }
        };

        match read_at(&mut file, request.offset, request.len) {
            Ok(data) => request.slot.complete(Ok(data)),
            Err(e) => {
                let message = e.to_string();
                request.slot.complete(Err(e));
                die(&shared, message);
                return;
            }
        }
    }
}

fn read_at(file: &mut File, offset: u64, len: usize) -> Result<Bytes> {
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(Bytes::from(buf))
}

fn die(shared: &FunnelShared, message: String) {
    warn!(error = %message, "disk worker died");
    let mut queue = shared.queue.lock();
    queue.worker_alive = false;
    for request in queue.requests.drain(..) {
        request
            .slot
            .complete(Err(Error::WorkerDead(message.clone())));
    }
}

/// A store reader usable from many threads at once.
///
/// Lookups take `&self`; cloneable via `Arc`.
pub struct ConcurrentStoreReader {
    index: GroupIndex,
    cache: MemSegment,
    info: RecordInfo,
    data_len: u64,
    funnel: DiskFunnel,
}

impl ConcurrentStoreReader {
    /// Open a store directory, preloading index and cache.
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
        let data_path = filename::keys_data_path(dir);
        let data_len = fs::metadata(&data_path)?.len();

        Ok(Self {
            index,
            cache,
            info,
            data_len,
            funnel: DiskFunnel::new(data_path),
        })
    }

    /// Logical record count.
    pub fn record_count(&self) -> i64 {
        self.index.record_count()
    }

    /// The store's metadata sidecar.
    pub fn info(&self) -> &RecordInfo {
        &self.info
    }

    fn find_group(&self, key: &[u8]) -> Result<Option<usize>> {
        let groups = self.index.num_groups();
        if groups == 0 {
            return Ok(None);
        }
        if self.cache.key_at(0)?.as_ref() > key {
            return Ok(None);
        }

        let mut left = 0usize;
        let mut right = groups - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            if self.cache.key_at(mid as i64)?.as_ref() <= key {
                left = mid;
            } else {
                right = mid - 1;
            }
        }
        Ok(Some(left))
    }

    fn read_group(&self, group: usize) -> Result<Bytes> {
        let (start, end) = self.index.group_span(group, self.data_len);
        self.funnel.read(start, (end - start) as usize)
    }

    /// Exact-match lookup by key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>> {
        let group = match self.find_group(key)? {
            Some(g) => g,
            None => return Ok(None),
        };

        let span = self.read_group(group)?;
        let mut cursor = GroupCursor::new(&span);
        let first_no = self.index.first_record_of(group);

        for i in 0..self.index.records_in_group(group) {
            if !cursor.advance()? {
                return Err(Error::corruption("group shorter than index claims"));
            }
            if cursor.key() == key {
                return Ok(Some(Record::with_record_no(
                    Bytes::copy_from_slice(cursor.key()),
                    Bytes::copy_from_slice(cursor.payload()),
                    first_no + i as i64,
                )));
            }
            if cursor.key() > key {
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// Fetch a record by its number.
    pub fn get_record_no(&self, record_no: i64) -> Result<Record> {
        if !self.index.contains_record(record_no) {
            return Err(Error::RecordOutOfRange {
                record_no,
                count: self.index.record_count(),
            });
        }

        let group = self.index.group_of(record_no);
        let idx_in_group = record_no as usize - group * self.index.group_size();
        let span = self.read_group(group)?;

        let mut cursor = GroupCursor::new(&span);
        for _ in 0..=idx_in_group {
            if !cursor.advance()? {
                return Err(Error::corruption("group shorter than index claims"));
            }
        }

        Ok(Record::with_record_no(
            Bytes::copy_from_slice(cursor.key()),
            Bytes::copy_from_slice(cursor.payload()),
            record_no,
        ))
    }
}

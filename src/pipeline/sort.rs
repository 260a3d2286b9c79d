//! External sort with optional reduction.
//!
//! Records accumulate in a byte arena plus a parallel entry table until
//! the memory ceiling is hit, then the full buffer is handed to a
//! background sort worker and its output to a background write worker
//! that spills the sorted (and optionally reduced) run to a temp file.
//! At most two workers are live at a time: buffer N sorts and buffer
//! N−1 writes while the caller fills N+1. At end of input the final
//! in-memory run meets the spilled runs in a k-way merge; a trailing
//! reduce stage is appended only when reducing, because the merge can
//! reunite equal keys that were reduced separately per run.
//!
//! Spill files are deleted when the sort's output closes, unless the
//! options retain them. Cancellation is cooperative: closing mid-sort
//! flags the workers, joins them, then removes the files.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use tempfile::TempPath;
use tracing::debug;

use crate::options::Options;
use crate::record::{Record, RecordKind};
use crate::util::comparator::{KeyComparator, SortOrder};
use crate::util::filename::SPILL_PREFIX;
use crate::{Error, Result};

use super::merge::MergeSource;
use super::source::{write_framed, RecordFileSource, VecSource};
use super::{BoxedSource, RecordSource, SourceMeta};

/// Configuration of one external sort.
#[derive(Debug, Clone)]
pub struct SortOptions {
    /// Output order.
    pub order: SortOrder,
    /// Fold equal keys via the record kind's combine.
    pub reduce: bool,
    /// Record kind (supplies the combine); None takes the input's.
    pub kind: Option<RecordKind>,
    /// Memory ceiling before spilling.
    pub memory_limit: usize,
    /// Initial arena capacity.
    pub arena_capacity: usize,
    /// Directory for spill files.
    pub temp_dir: PathBuf,
    /// Retain spill files after the output closes.
    pub keep_temp_files: bool,
}

impl SortOptions {
    /// Ascending sort with engine defaults.
    pub fn ascending() -> Self {
        Self::from_options(&Options::default(), SortOrder::Ascending)
    }

    /// Descending sort with engine defaults.
    pub fn descending() -> Self {
        Self::from_options(&Options::default(), SortOrder::Descending)
    }

    /// Derive from engine options.
    pub fn from_options(options: &Options, order: SortOrder) -> Self {
        Self {
            order,
            reduce: false,
            kind: None,
            memory_limit: options.sort_memory_limit,
            arena_capacity: options.arena_capacity,
            temp_dir: options.temp_dir(),
            keep_temp_files: options.keep_temp_files,
        }
    }

    /// Enable reduction.
    pub fn with_reduce(mut self, reduce: bool) -> Self {
        self.reduce = reduce;
        self
    }

    /// Set the record kind explicitly.
    pub fn with_kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Set the memory ceiling.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }
}

/// Entry table row: where one record lives in the arena.
#[derive(Debug, Clone, Copy)]
struct Entry {
    offset: usize,
    key_len: u32,
    payload_len: u32,
}

impl Entry {
    fn key<'a>(&self, arena: &'a [u8]) -> &'a [u8] {
        &arena[self.offset..self.offset + self.key_len as usize]
    }

    fn payload<'a>(&self, arena: &'a [u8]) -> &'a [u8] {
        let start = self.offset + self.key_len as usize;
        &arena[start..start + self.payload_len as usize]
    }
}

/// Growable byte arena plus entry table holding one sort buffer.
struct SortBuffer {
    arena: Vec<u8>,
    entries: Vec<Entry>,
}

impl SortBuffer {
    fn with_capacity(arena_capacity: usize) -> Self {
        Self {
            arena: Vec::with_capacity(arena_capacity),
            entries: Vec::new(),
        }
    }

    fn push(&mut self, record: &Record) {
        let offset = self.arena.len();
        self.arena.extend_from_slice(record.key());
        self.arena.extend_from_slice(record.payload());
        self.entries.push(Entry {
            offset,
            key_len: record.key().len() as u32,
            payload_len: record.payload().len() as u32,
        });
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn mem_usage(&self) -> usize {
        self.arena.len() + self.entries.len() * std::mem::size_of::<Entry>()
    }

    /// Sort the entry table in place by key. Equal keys keep their
    /// arrival order.
    fn sort(&mut self, comparator: KeyComparator) {
        let arena = &self.arena;
        self.entries
            .sort_by(|a, b| comparator.compare(a.key(arena), b.key(arena)));
    }

    fn record_at(&self, index: usize) -> Record {
        let entry = self.entries[index];
        Record::new(
            Bytes::copy_from_slice(entry.key(&self.arena)),
            Bytes::copy_from_slice(entry.payload(&self.arena)),
        )
    }
}

/// Iterate a sorted buffer, folding adjacent equal keys when reducing,
/// and pass each surviving record to `emit`.
fn drain_sorted(
    buffer: &SortBuffer,
    kind: &RecordKind,
    reduce: bool,
    cancel: &AtomicBool,
    mut emit: impl FnMut(&Record) -> Result<()>,
) -> Result<()> {
    let mut i = 0;
    while i < buffer.entries.len() {
        if cancel.load(Ordering::Relaxed) {
            return Ok(());
        }
        let mut acc = buffer.record_at(i);
        i += 1;
        if reduce {
            while i < buffer.entries.len()
                && buffer.entries[i].key(&buffer.arena) == acc.key()
            {
                let next = buffer.record_at(i);
                if !kind.combine(&mut acc, &next)? {
                    break;
                }
                i += 1;
            }
        }
        emit(&acc)?;
    }
    Ok(())
}

/// One spill file, deleted on drop unless retained.
struct SpillRun {
    path: PathBuf,
    _guard: Option<TempPath>,
}

/// Push-model external sorter.
///
/// Callers feed records with [`push`] and finish with [`into_source`],
/// which yields a source over the fully sorted (and optionally reduced)
/// stream.
///
/// [`push`]: Sorter::push
/// [`into_source`]: Sorter::into_source
pub struct Sorter {
    options: SortOptions,
    kind: RecordKind,
    reduce: bool,
    comparator: KeyComparator,
    buffer: SortBuffer,
    sorting: Option<JoinHandle<SortBuffer>>,
    writing: Option<(JoinHandle<Result<()>>, SpillRun)>,
    spills: Vec<SpillRun>,
    cancel: Arc<AtomicBool>,
    record_count: i64,
}

impl Sorter {
    /// Create a sorter.
    pub fn new(options: SortOptions) -> Self {
        let kind = options.kind.clone().unwrap_or_default();
        let reduce = options.reduce && kind.is_reducible();
        let comparator = KeyComparator::new(options.order);
        let buffer = SortBuffer::with_capacity(options.arena_capacity);
        Self {
            options,
            kind,
            reduce,
            comparator,
            buffer,
            sorting: None,
            writing: None,
            spills: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            record_count: 0,
        }
    }

    /// True if reduction is actually in effect (requested and the kind
    /// has a combine).
    pub fn reduces(&self) -> bool {
        self.reduce
    }

    /// Number of spill files written so far.
    pub fn spill_count(&self) -> usize {
        self.spills.len() + usize::from(self.writing.is_some())
    }

    /// Add a record in arbitrary order.
    pub fn push(&mut self, record: Record) -> Result<()> {
        self.buffer.push(&record);
        self.record_count += 1;
        if self.buffer.mem_usage() >= self.options.memory_limit {
            self.rotate()?;
        }
        Ok(())
    }

    /// Hand the full buffer to the worker pipeline: join the previous
    /// writer, move the previously sorted buffer to a new writer, and
    /// start sorting the buffer just filled.
    fn rotate(&mut self) -> Result<()> {
        self.join_writer()?;

        if let Some(handle) = self.sorting.take() {
            let sorted = handle
                .join()
                .map_err(|_| Error::internal("sort worker panicked"))?;
            self.spawn_writer(sorted)?;
        }

        let full = std::mem::replace(
            &mut self.buffer,
            SortBuffer::with_capacity(self.options.arena_capacity),
        );
        debug!(
            records = full.entries.len(),
            bytes = full.arena.len(),
            "sort buffer full, rotating"
        );

        let comparator = self.comparator;
        let cancel = Arc::clone(&self.cancel);
        let handle = thread::Builder::new()
            .name("tstore-sort".to_string())
            .spawn(move || {
                if !cancel.load(Ordering::Relaxed) {
                    let mut buffer = full;
                    buffer.sort(comparator);
                    buffer
                } else {
                    full
                }
            })
            .map_err(|e| Error::internal(format!("spawn sort worker: {}", e)))?;
        self.sorting = Some(handle);
        Ok(())
    }

    fn join_writer(&mut self) -> Result<()> {
        if let Some((handle, run)) = self.writing.take() {
            handle
                .join()
                .map_err(|_| Error::internal("write worker panicked"))??;
            self.spills.push(run);
        }
        Ok(())
    }

    fn spawn_writer(&mut self, sorted: SortBuffer) -> Result<()> {
        let (file, run) = self.create_spill()?;
        let kind = self.kind.clone();
        let reduce = self.reduce;
        let cancel = Arc::clone(&self.cancel);

        let handle = thread::Builder::new()
            .name("tstore-spill".to_string())
            .spawn(move || -> Result<()> {
                let mut writer = BufWriter::new(file);
                drain_sorted(&sorted, &kind, reduce, &cancel, |record| {
                    write_framed(&mut writer, record.key(), record.payload())
                })?;
                writer.flush()?;
                Ok(())
            })
            .map_err(|e| Error::internal(format!("spawn write worker: {}", e)))?;
        self.writing = Some((handle, run));
        Ok(())
    }

    fn create_spill(&self) -> Result<(File, SpillRun)> {
        let named = tempfile::Builder::new()
            .prefix(SPILL_PREFIX)
            .tempfile_in(&self.options.temp_dir)
            .map_err(|e| Error::Io(format!("create spill file: {}", e)))?;
        let (file, temp_path) = named.into_parts();

        let run = if self.options.keep_temp_files {
            let path = temp_path
                .keep()
                .map_err(|e| Error::Io(format!("retain spill file: {}", e)))?;
            SpillRun { path, _guard: None }
        } else {
            SpillRun {
                path: temp_path.to_path_buf(),
                _guard: Some(temp_path),
            }
        };
        Ok((file, run))
    }

    fn run_meta(&self) -> SourceMeta {
        SourceMeta::new("sort-run")
            .with_kind(self.kind.clone())
            .with_sorted(Some(self.options.order))
            .with_reduced(self.reduce)
    }

    /// Finish: drain the worker pipeline, sort the final in-memory run,
    /// and compose the output source.
    pub fn into_source(mut self) -> Result<BoxedSource> {
        // Settle in-flight workers: the run being written joins the
        // spill list, the run being sorted is written out inline.
        self.join_writer()?;
        if let Some(handle) = self.sorting.take() {
            let sorted = handle
                .join()
                .map_err(|_| Error::internal("sort worker panicked"))?;
            self.spawn_writer(sorted)?;
            self.join_writer()?;
        }

        self.buffer.sort(self.comparator);

        let order = self.options.order;
        let run_meta = self.run_meta();
        let mut runs: Vec<BoxedSource> = Vec::new();
        for run in &self.spills {
            runs.push(Box::new(RecordFileSource::with_meta(
                &run.path,
                run_meta.clone(),
            )?));
        }

        let buffer = std::mem::replace(&mut self.buffer, SortBuffer::with_capacity(0));
        if !buffer.is_empty() {
            runs.push(Box::new(MemRunSource::new(
                buffer,
                self.kind.clone(),
                self.reduce,
                run_meta.clone(),
            )));
        }

        debug!(
            runs = runs.len(),
            spilled = self.spills.len(),
            records = self.record_count,
            "sort finished, composing output"
        );

        let mut output_meta = run_meta.derive("sort");
        output_meta.estimated_records = Some(self.record_count);

        let inner: BoxedSource = match runs.len() {
            0 => Box::new(VecSource::with_meta(Vec::new(), output_meta.clone())),
            1 => runs.into_iter().next().expect("one run"),
            _ => {
                let merged: BoxedSource = Box::new(MergeSource::new(runs, order)?);
                if self.reduce {
                    // Equal keys reduced in different runs meet again
                    // here, so fold once more after the merge.
                    Box::new(ReduceSource::new(merged, self.kind.clone()))
                } else {
                    merged
                }
            }
        };

        Ok(Box::new(SortOutput {
            inner,
            meta: output_meta,
            _spills: std::mem::take(&mut self.spills),
        }))
    }

    /// Abort: flag workers, join them, drop spill files.
    pub fn cancel(mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some((handle, _run)) = self.writing.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.sorting.take() {
            let _ = handle.join();
        }
        self.spills.clear();
    }
}

/// Source over one sorted in-memory run.
struct MemRunSource {
    buffer: SortBuffer,
    pos: usize,
    kind: RecordKind,
    reduce: bool,
    current: Record,
    meta: SourceMeta,
}

impl MemRunSource {
    fn new(buffer: SortBuffer, kind: RecordKind, reduce: bool, meta: SourceMeta) -> Self {
        Self {
            buffer,
            pos: 0,
            kind,
            reduce,
            current: Record::empty(),
            meta,
        }
    }
}

impl RecordSource for MemRunSource {
    fn advance(&mut self) -> Result<bool> {
        if self.pos >= self.buffer.entries.len() {
            return Ok(false);
        }
        let mut acc = self.buffer.record_at(self.pos);
        self.pos += 1;
        if self.reduce {
            while self.pos < self.buffer.entries.len()
                && self.buffer.entries[self.pos].key(&self.buffer.arena) == acc.key()
            {
                let next = self.buffer.record_at(self.pos);
                if !self.kind.combine(&mut acc, &next)? {
                    break;
                }
                self.pos += 1;
            }
        }
        self.current = acc;
        Ok(true)
    }

    fn current(&self) -> &Record {
        &self.current
    }

    fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    fn close(&mut self) -> Result<()> {
        self.pos = self.buffer.entries.len();
        Ok(())
    }
}

/// Trailing reduce over an already-sorted stream: folds adjacent
/// equal-key records with the kind's combine.
pub struct ReduceSource {
    input: BoxedSource,
    kind: RecordKind,
    pending: Option<Record>,
    input_done: bool,
    current: Record,
    meta: SourceMeta,
}

impl ReduceSource {
    /// Wrap a sorted input.
    pub fn new(input: BoxedSource, kind: RecordKind) -> Self {
        let meta = input.meta().derive("reduce").with_reduced(true);
        Self {
            input,
            kind,
            pending: None,
            input_done: false,
            current: Record::empty(),
            meta,
        }
    }
}

impl RecordSource for ReduceSource {
    fn advance(&mut self) -> Result<bool> {
        let mut acc = match self.pending.take() {
            Some(record) => record,
            None => {
                if self.input_done || !self.input.advance()? {
                    return Ok(false);
                }
                self.input.current().clone()
            }
        };

        loop {
            if !self.input.advance()? {
                self.input_done = true;
                break;
            }
            let next = self.input.current().clone();
            if next.key() == acc.key() && self.kind.combine(&mut acc, &next)? {
                continue;
            }
            self.pending = Some(next);
            break;
        }

        self.current = acc;
        Ok(true)
    }

    fn current(&self) -> &Record {
        &self.current
    }

    fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    fn close(&mut self) -> Result<()> {
        self.pending = None;
        self.input_done = true;
        self.input.close()
    }
}

/// The composed sort output: the run/merge/reduce stack plus ownership
/// of the spill files, which are removed when this source drops.
struct SortOutput {
    inner: BoxedSource,
    meta: SourceMeta,
    _spills: Vec<SpillRun>,
}

impl RecordSource for SortOutput {
    fn advance(&mut self) -> Result<bool> {
        self.inner.advance()
    }

    fn current(&self) -> &Record {
        self.inner.current()
    }

    fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

/// Operator form of the sorter: drains its input on first advance.
pub struct SortSource {
    input: Option<BoxedSource>,
    sorter: Option<Sorter>,
    output: Option<BoxedSource>,
    current: Record,
    meta: SourceMeta,
}

impl SortSource {
    /// Sort `input` according to `options`. The input's record kind is
    /// used when the options name none.
    pub fn new(input: BoxedSource, mut options: SortOptions) -> Self {
        if options.kind.is_none() {
            options.kind = Some(input.meta().kind.clone());
        }
        let kind = options.kind.clone().unwrap_or_default();
        let reduce = options.reduce && kind.is_reducible();

        let mut meta = input
            .meta()
            .derive("sort")
            .with_sorted(Some(options.order))
            .with_reduced(reduce);
        if reduce {
            meta.estimated_records = None; // folding shrinks the count
        }

        Self {
            input: Some(input),
            sorter: Some(Sorter::new(options)),
            output: None,
            current: Record::empty(),
            meta,
        }
    }
}

impl RecordSource for SortSource {
    fn advance(&mut self) -> Result<bool> {
        if self.output.is_none() {
            let mut input = match self.input.take() {
                Some(input) => input,
                None => return Ok(false),
            };
            let mut sorter = self.sorter.take().expect("sorter present before drain");
            while input.advance()? {
                sorter.push(input.current().clone())?;
            }
            input.close()?;
            self.output = Some(sorter.into_source()?);
        }

        let output = self.output.as_mut().expect("output composed");
        if output.advance()? {
            self.current = output.current().clone();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn current(&self) -> &Record {
        &self.current
    }

    fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut input) = self.input.take() {
            input.close()?;
        }
        if let Some(sorter) = self.sorter.take() {
            sorter.cancel();
        }
        if let Some(mut output) = self.output.take() {
            output.close()?;
        }
        Ok(())
    }
}

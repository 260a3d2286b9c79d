//! The record pipeline: a pull-based cursor abstraction over
//! heterogeneous record sources, composed by operators.
//!
//! A consumer drives the whole upstream graph synchronously by calling
//! [`RecordSource::advance`]; there is no implicit parallelism across
//! operators. Each operator computes its metadata once at construction
//! from its inputs' metadata, overriding only the flags it guarantees
//! itself (a sorter asserts sortedness, a filter may clear it), so a
//! downstream stage can decide — without touching data — whether an
//! implicit sort must be inserted.

pub mod filter;
pub mod join;
pub mod limit;
pub mod merge;
pub mod sink;
pub mod sort;
pub mod source;

use crate::record::{Record, RecordKind};
use crate::util::comparator::SortOrder;
use crate::Result;

/// Metadata carried by every record source.
///
/// Immutable after construction; operators derive their own from their
/// inputs' via [`SourceMeta::derive`] plus explicit overrides.
#[derive(Debug, Clone)]
pub struct SourceMeta {
    /// Source name, used for diagnostics and join column prefixes.
    pub name: String,
    /// The record kind flowing out of this source.
    pub kind: RecordKind,
    /// Sort direction guaranteed by this source, if any.
    pub sorted: Option<SortOrder>,
    /// True if equal keys have already been folded by a combine.
    pub reduced: bool,
    /// Bucket descriptor flag (carried, not exercised).
    pub bucketed: bool,
    /// Segment descriptor flag (carried, not exercised).
    pub segmented: bool,
    /// Estimated record count, when the source knows it.
    pub estimated_records: Option<i64>,
    /// Estimated key+payload bytes, when the source knows it.
    pub estimated_bytes: Option<u64>,
}

impl SourceMeta {
    /// Metadata for an unsorted source of opaque records.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RecordKind::Bytes,
            sorted: None,
            reduced: false,
            bucketed: false,
            segmented: false,
            estimated_records: None,
            estimated_bytes: None,
        }
    }

    /// Derive an operator's metadata from its input's, renaming it.
    /// Flags pass through; the caller overrides what it guarantees.
    pub fn derive(&self, name: impl Into<String>) -> Self {
        let mut meta = self.clone();
        meta.name = name.into();
        meta
    }

    /// Set the record kind.
    pub fn with_kind(mut self, kind: RecordKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set (or clear) the sortedness guarantee.
    pub fn with_sorted(mut self, sorted: Option<SortOrder>) -> Self {
        self.sorted = sorted;
        self
    }

    /// Set the reduced flag.
    pub fn with_reduced(mut self, reduced: bool) -> Self {
        self.reduced = reduced;
        self
    }

    /// True if this source guarantees the given order.
    pub fn is_sorted(&self, order: SortOrder) -> bool {
        self.sorted == Some(order)
    }
}

/// A pull-based cursor over a stream of records.
///
/// `advance` moves to the next record and returns false at exhaustion;
/// once false it stays false. `current` is only meaningful after an
/// `advance` that returned true. `close` releases resources and
/// recursively closes inputs.
pub trait RecordSource: Send {
    /// Move to the next record. False (and terminal) at exhaustion.
    fn advance(&mut self) -> Result<bool>;

    /// The record `advance` moved to.
    fn current(&self) -> &Record;

    /// This source's metadata.
    fn meta(&self) -> &SourceMeta;

    /// Release resources; recursively closes inputs.
    fn close(&mut self) -> Result<()>;

    /// Advise the source to skip ahead to `key`'s position before the
    /// next `advance`. Advisory; sources that cannot seek ignore it.
    fn move_next_hint(&mut self, _key: &[u8]) {}
}

/// A heap-allocated source, the common operator input type.
pub type BoxedSource = Box<dyn RecordSource>;

impl RecordSource for BoxedSource {
    fn advance(&mut self) -> Result<bool> {
        (**self).advance()
    }

    fn current(&self) -> &Record {
        (**self).current()
    }

    fn meta(&self) -> &SourceMeta {
        (**self).meta()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn move_next_hint(&mut self, key: &[u8]) {
        (**self).move_next_hint(key)
    }
}

/// Composition helpers: wrap a source in the next operator.
pub trait SourceExt: RecordSource + Sized + 'static {
    /// Box the source.
    fn boxed(self) -> BoxedSource {
        Box::new(self)
    }

    /// Transform records through a user filter.
    fn filter<F: filter::RecordFilter + 'static>(self, f: F) -> filter::FilterSource {
        filter::FilterSource::new(self.boxed(), f)
    }

    /// Pass only the first `n` records.
    fn limit(self, n: u64) -> limit::LimitSource {
        limit::LimitSource::new(self.boxed(), n)
    }

    /// Keep each record with probability `p`.
    fn sample(self, p: f64, seed: u64) -> limit::SampleSource {
        limit::SampleSource::new(self.boxed(), p, seed)
    }

    /// Sort (and optionally reduce) through the external sorter.
    fn sorted(self, options: sort::SortOptions) -> sort::SortSource {
        sort::SortSource::new(self.boxed(), options)
    }

    /// Chain `other` after this source, no ordering guarantee.
    fn concat(self, other: BoxedSource) -> merge::ConcatSource {
        merge::ConcatSource::new(vec![self.boxed(), other])
    }

    /// Merge with another source sorted in the same order.
    fn merge_sorted(self, other: BoxedSource, order: SortOrder) -> Result<merge::MergeSource> {
        merge::MergeSource::new(vec![self.boxed(), other], order)
    }

    /// Keep records whose key appears in `right`.
    fn semi_filter(self, right: BoxedSource) -> Result<merge::SemiFilterSource> {
        merge::SemiFilterSource::new(self.boxed(), right, merge::SemiFilterMode::Keep)
    }

    /// Keep records whose key does not appear in `right`.
    fn anti_filter(self, right: BoxedSource) -> Result<merge::SemiFilterSource> {
        merge::SemiFilterSource::new(self.boxed(), right, merge::SemiFilterMode::Drop)
    }

    /// Inner join with `right` on key equality.
    fn join_inner(self, right: BoxedSource) -> Result<join::JoinSource> {
        join::JoinSource::inner(self.boxed(), right)
    }

    /// Left-outer join with `right` on key equality.
    fn join_left_outer(self, right: BoxedSource) -> Result<join::JoinSource> {
        join::JoinSource::left_outer(self.boxed(), right)
    }
}

impl<T: RecordSource + Sized + 'static> SourceExt for T {}

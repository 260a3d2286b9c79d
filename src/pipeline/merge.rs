//! K-way merge and the two-input pair operators: concatenation and
//! semi-join key filtering.
//!
//! The merge keeps a binary heap of at most one entry per open input,
//! keyed by the shared comparator and the chosen direction; each
//! `advance` pops the root, refills from that input, and reinserts.
//! Ties are broken by input position, so merge output is deterministic
//! and stable with respect to source order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::record::Record;
use crate::util::comparator::{KeyComparator, SortOrder};
use crate::{Error, Result};

use super::sort::{SortOptions, SortSource};
use super::{BoxedSource, RecordSource, SourceMeta};

/// Wrap `source` in an implicit ascending sort unless its metadata
/// already guarantees one.
pub(crate) fn ensure_ascending(source: BoxedSource) -> BoxedSource {
    if source.meta().is_sorted(SortOrder::Ascending) {
        source
    } else {
        Box::new(SortSource::new(source, SortOptions::ascending()))
    }
}

/// Heap entry: one input's current record.
struct HeapEntry {
    record: Record,
    source_index: usize,
    order: SortOrder,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the root is the record
        // that sorts first in the merge direction, with the earlier
        // input winning ties.
        let comparator = KeyComparator::new(self.order);
        match comparator.compare(other.record.key(), self.record.key()) {
            Ordering::Equal => other.source_index.cmp(&self.source_index),
            ord => ord,
        }
    }
}

/// Merges any number of sources sorted in the same direction.
pub struct MergeSource {
    inputs: Vec<BoxedSource>,
    heap: BinaryHeap<HeapEntry>,
    order: SortOrder,
    started: bool,
    last_source: Option<usize>,
    current: Record,
    meta: SourceMeta,
}

impl MergeSource {
    /// Create a merge over `inputs`, each of which must declare itself
    /// sorted in `order`.
    pub fn new(inputs: Vec<BoxedSource>, order: SortOrder) -> Result<Self> {
        for input in &inputs {
            if !input.meta().is_sorted(order) {
                return Err(Error::not_sorted(format!(
                    "merge input '{}' is not sorted {:?}",
                    input.meta().name,
                    order
                )));
            }
        }

        let meta = Self::merged_meta(&inputs, order);
        Ok(Self {
            inputs,
            heap: BinaryHeap::new(),
            order,
            started: false,
            last_source: None,
            current: Record::empty(),
            meta,
        })
    }

    /// Two-input sorted merge: the pair operator form.
    pub fn pair(left: BoxedSource, right: BoxedSource, order: SortOrder) -> Result<Self> {
        Self::new(vec![left, right], order)
    }

    fn merged_meta(inputs: &[BoxedSource], order: SortOrder) -> SourceMeta {
        let mut meta = match inputs.first() {
            Some(first) => first.meta().derive("merge"),
            None => SourceMeta::new("merge"),
        };
        meta.sorted = Some(order);
        // A merge interleaves runs, so per-run reduction no longer
        // holds across the union.
        meta.reduced = false;
        meta.estimated_records = inputs
            .iter()
            .map(|i| i.meta().estimated_records)
            .try_fold(0i64, |acc, est| est.map(|e| acc + e));
        meta.estimated_bytes = inputs
            .iter()
            .map(|i| i.meta().estimated_bytes)
            .try_fold(0u64, |acc, est| est.map(|e| acc + e));
        meta
    }

    fn refill(&mut self, source_index: usize) -> Result<()> {
        if self.inputs[source_index].advance()? {
            self.heap.push(HeapEntry {
                record: self.inputs[source_index].current().clone(),
                source_index,
                order: self.order,
            });
        }
        Ok(())
    }
}

impl RecordSource for MergeSource {
    fn advance(&mut self) -> Result<bool> {
        if !self.started {
            self.started = true;
            for i in 0..self.inputs.len() {
                self.refill(i)?;
            }
        } else if let Some(i) = self.last_source.take() {
            self.refill(i)?;
        }

        match self.heap.pop() {
            Some(entry) => {
                self.current = entry.record;
                self.last_source = Some(entry.source_index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn current(&self) -> &Record {
        &self.current
    }

    fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    fn close(&mut self) -> Result<()> {
        self.heap.clear();
        for input in &mut self.inputs {
            input.close()?;
        }
        Ok(())
    }
}

/// Chains sources one after another. No ordering guarantee.
pub struct ConcatSource {
    inputs: Vec<BoxedSource>,
    next_input: usize,
    current: Record,
    meta: SourceMeta,
}

impl ConcatSource {
    /// Concatenate `inputs` in order.
    pub fn new(inputs: Vec<BoxedSource>) -> Self {
        let mut meta = match inputs.first() {
            Some(first) => first.meta().derive("concat"),
            None => SourceMeta::new("concat"),
        };
        meta.sorted = None;
        meta.reduced = false;
        meta.estimated_records = inputs
            .iter()
            .map(|i| i.meta().estimated_records)
            .try_fold(0i64, |acc, est| est.map(|e| acc + e));

        Self {
            inputs,
            next_input: 0,
            current: Record::empty(),
            meta,
        }
    }
}

impl RecordSource for ConcatSource {
    fn advance(&mut self) -> Result<bool> {
        while self.next_input < self.inputs.len() {
            if self.inputs[self.next_input].advance()? {
                self.current = self.inputs[self.next_input].current().clone();
                return Ok(true);
            }
            self.next_input += 1;
        }
        Ok(false)
    }

    fn current(&self) -> &Record {
        &self.current
    }

    fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    fn close(&mut self) -> Result<()> {
        for input in &mut self.inputs {
            input.close()?;
        }
        self.next_input = self.inputs.len();
        Ok(())
    }
}

/// Whether the semi filter passes matching or non-matching keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemiFilterMode {
    /// Pass left records whose key appears on the right (semi-join).
    Keep,
    /// Pass left records whose key is absent on the right (anti-join).
    Drop,
}

/// Filters the left stream by key membership in the right stream.
///
/// A single forward lock-step scan, not a hash lookup: both inputs must
/// be ascending, and an implicit sort is injected when metadata says
/// otherwise. Key hints are passed both ways to skip large gaps.
pub struct SemiFilterSource {
    left: BoxedSource,
    right: BoxedSource,
    mode: SemiFilterMode,
    right_valid: bool,
    right_started: bool,
    current: Record,
    meta: SourceMeta,
}

impl SemiFilterSource {
    /// Create a semi (Keep) or anti (Drop) filter.
    pub fn new(left: BoxedSource, right: BoxedSource, mode: SemiFilterMode) -> Result<Self> {
        let left = ensure_ascending(left);
        let right = ensure_ascending(right);
        let meta = left.meta().derive(match mode {
            SemiFilterMode::Keep => "semi-filter",
            SemiFilterMode::Drop => "anti-filter",
        });
        Ok(Self {
            left,
            right,
            mode,
            right_valid: false,
            right_started: false,
            current: Record::empty(),
            meta,
        })
    }

    /// Advance the right side until its key is >= `key`.
    fn catch_up_right(&mut self, key: &[u8]) -> Result<()> {
        if !self.right_started {
            self.right_started = true;
            self.right_valid = self.right.advance()?;
        }
        if self.right_valid && self.right.current().key() < key {
            self.right.move_next_hint(key);
            while self.right_valid && self.right.current().key() < key {
                self.right_valid = self.right.advance()?;
            }
        }
        Ok(())
    }
}

impl RecordSource for SemiFilterSource {
    fn advance(&mut self) -> Result<bool> {
        loop {
            if !self.left.advance()? {
                return Ok(false);
            }
            let key = self.left.current().key().to_vec();
            self.catch_up_right(&key)?;

            let matched = self.right_valid && self.right.current().key() == key.as_slice();
            let pass = match self.mode {
                SemiFilterMode::Keep => matched,
                SemiFilterMode::Drop => !matched,
            };
            if pass {
                self.current = self.left.current().clone();
                return Ok(true);
            }
            if self.mode == SemiFilterMode::Keep && self.right_valid {
                // Nothing on the left can match before the right's
                // current key; let a seekable left skip the gap.
                self.left.move_next_hint(self.right.current().key());
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
        self.left.close()?;
        self.right.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::source::VecSource;
    use crate::pipeline::SourceExt;
    use crate::record::RecordKind;

    fn sorted_source(name: &str, pairs: &[(&str, &str)]) -> BoxedSource {
        let meta = SourceMeta::new(name)
            .with_kind(RecordKind::Bytes)
            .with_sorted(Some(SortOrder::Ascending));
        let records = pairs
            .iter()
            .map(|(k, v)| Record::new(k.to_string(), v.to_string()))
            .collect();
        Box::new(VecSource::with_meta(records, meta))
    }

    fn drain(source: &mut dyn RecordSource) -> Vec<(String, String)> {
        let mut out = Vec::new();
        while source.advance().unwrap() {
            out.push((
                String::from_utf8(source.current().key().to_vec()).unwrap(),
                String::from_utf8(source.current().payload().to_vec()).unwrap(),
            ));
        }
        out
    }

    #[test]
    fn test_merge_single_source() {
        let mut merge = MergeSource::new(
            vec![sorted_source("a", &[("a", "1"), ("b", "2"), ("c", "3")])],
            SortOrder::Ascending,
        )
        .unwrap();

        let keys: Vec<String> = drain(&mut merge).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_merge_multiple_sources() {
        let mut merge = MergeSource::new(
            vec![
                sorted_source("odd", &[("a", "1"), ("c", "3"), ("e", "5")]),
                sorted_source("even", &[("b", "2"), ("d", "4"), ("f", "6")]),
            ],
            SortOrder::Ascending,
        )
        .unwrap();

        let keys: Vec<String> = drain(&mut merge).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c", "d", "e", "f"]);
    }

    #[test]
    fn test_merge_empty_sources() {
        let mut merge = MergeSource::new(
            vec![
                sorted_source("empty", &[]),
                sorted_source("one", &[("a", "1")]),
                sorted_source("empty2", &[]),
            ],
            SortOrder::Ascending,
        )
        .unwrap();

        assert_eq!(drain(&mut merge).len(), 1);
    }

    #[test]
    fn test_merge_tie_break_is_source_order() {
        let mut merge = MergeSource::new(
            vec![
                sorted_source("first", &[("k", "from-first")]),
                sorted_source("second", &[("k", "from-second")]),
            ],
            SortOrder::Ascending,
        )
        .unwrap();

        let payloads: Vec<String> = drain(&mut merge).into_iter().map(|(_, v)| v).collect();
        assert_eq!(payloads, vec!["from-first", "from-second"]);
    }

    #[test]
    fn test_merge_descending() {
        let make = |name: &str, keys: &[&str]| {
            let meta = SourceMeta::new(name).with_sorted(Some(SortOrder::Descending));
            let records = keys
                .iter()
                .map(|k| Record::new(k.to_string(), &b"v"[..]))
                .collect();
            Box::new(VecSource::with_meta(records, meta)) as BoxedSource
        };

        let mut merge = MergeSource::new(
            vec![make("a", &["z", "m", "a"]), make("b", &["y", "n"])],
            SortOrder::Descending,
        )
        .unwrap();

        let keys: Vec<String> = drain(&mut merge).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["z", "y", "n", "m", "a"]);
    }

    #[test]
    fn test_merge_rejects_unsorted_input() {
        let unsorted: BoxedSource =
            Box::new(VecSource::from_pairs("u", &[("b", "2"), ("a", "1")]));
        let result = MergeSource::new(vec![unsorted], SortOrder::Ascending);
        assert!(matches!(result, Err(Error::NotSorted(_))));
    }

    #[test]
    fn test_merge_multiset_union() {
        let mut merge = MergeSource::new(
            vec![
                sorted_source("a", &[("a", "1"), ("b", "2"), ("b", "3")]),
                sorted_source("b", &[("b", "4"), ("c", "5")]),
            ],
            SortOrder::Ascending,
        )
        .unwrap();

        let keys: Vec<String> = drain(&mut merge).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "b", "b", "c"]);
    }

    #[test]
    fn test_concat_preserves_input_order() {
        let mut concat = ConcatSource::new(vec![
            sorted_source("tail", &[("x", "1"), ("y", "2")]),
            sorted_source("head", &[("a", "3")]),
        ]);

        assert!(concat.meta().sorted.is_none());
        let keys: Vec<String> = drain(&mut concat).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["x", "y", "a"]);
    }

    #[test]
    fn test_semi_filter_keeps_matches() {
        let left = sorted_source("l", &[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")]);
        let right = sorted_source("r", &[("b", "-"), ("d", "-"), ("e", "-")]);

        let mut semi = SemiFilterSource::new(left, right, SemiFilterMode::Keep).unwrap();
        let keys: Vec<String> = drain(&mut semi).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "d"]);
    }

    #[test]
    fn test_anti_filter_drops_matches() {
        let left = sorted_source("l", &[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")]);
        let right = sorted_source("r", &[("b", "-"), ("d", "-")]);

        let mut anti = SemiFilterSource::new(left, right, SemiFilterMode::Drop).unwrap();
        let keys: Vec<String> = drain(&mut anti).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "c"]);
    }

    #[test]
    fn test_semi_filter_duplicate_left_keys() {
        let left = sorted_source("l", &[("b", "1"), ("b", "2"), ("c", "3")]);
        let right = sorted_source("r", &[("b", "-")]);

        let mut semi = SemiFilterSource::new(left, right, SemiFilterMode::Keep).unwrap();
        let got = drain(&mut semi);
        assert_eq!(
            got,
            vec![("b".into(), "1".into()), ("b".into(), "2".into())]
        );
    }

    #[test]
    fn test_semi_filter_injects_sort() {
        let left: BoxedSource =
            Box::new(VecSource::from_pairs("l", &[("c", "3"), ("a", "1"), ("b", "2")]));
        let right: BoxedSource =
            Box::new(VecSource::from_pairs("r", &[("b", "-"), ("a", "-")]));

        let mut semi = SemiFilterSource::new(left, right, SemiFilterMode::Keep).unwrap();
        let keys: Vec<String> = drain(&mut semi).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_empty_right_side() {
        let left = sorted_source("l", &[("a", "1")]);
        let right = sorted_source("r", &[]);

        let mut semi =
            SemiFilterSource::new(left, right, SemiFilterMode::Keep).unwrap();
        assert!(drain(&mut semi).is_empty());

        let left = sorted_source("l", &[("a", "1")]);
        let right = sorted_source("r", &[]);
        let mut anti = SemiFilterSource::new(left, right, SemiFilterMode::Drop).unwrap();
        assert_eq!(drain(&mut anti).len(), 1);
    }
}

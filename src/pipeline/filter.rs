//! User filter operator.
//!
//! A filter receives each input record and an output accepter that
//! takes zero, one, or many records per input and can cut the upstream
//! short. A failure inside `process` is isolated to that record: the
//! shared error counter is bumped, a warning is logged, and the
//! pipeline continues. Diagnostics never enter the record stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::record::Record;
use crate::Result;

use super::{BoxedSource, RecordSource, SourceMeta};

/// Accepter handed to [`RecordFilter::process`].
pub struct FilterOutput {
    queue: VecDeque<Record>,
    stop: bool,
}

impl FilterOutput {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            stop: false,
        }
    }

    /// Emit an output record.
    pub fn push(&mut self, record: Record) {
        self.queue.push_back(record);
    }

    /// Signal that no further input is wanted; the upstream source is
    /// closed after pending output drains.
    pub fn stop_input(&mut self) {
        self.stop = true;
    }
}

/// A pluggable per-record transform.
pub trait RecordFilter: Send {
    /// Transform one input record into zero or more output records.
    fn process(&mut self, record: Record, out: &mut FilterOutput) -> Result<()>;

    /// Called once after input exhaustion; may emit trailing records.
    fn finish(&mut self, _out: &mut FilterOutput) -> Result<()> {
        Ok(())
    }

    /// True if output keys appear in the same order as input keys,
    /// letting downstream stages skip a re-sort.
    fn key_order_preserved(&self) -> bool {
        false
    }
}

/// A filter built from a closure.
pub struct FnFilter<F> {
    f: F,
    key_order_preserved: bool,
}

impl<F> FnFilter<F>
where
    F: FnMut(Record, &mut FilterOutput) -> Result<()> + Send,
{
    /// Wrap a closure; output order is assumed not preserved.
    pub fn new(f: F) -> Self {
        Self {
            f,
            key_order_preserved: false,
        }
    }

    /// Declare that the closure preserves key order.
    pub fn order_preserving(f: F) -> Self {
        Self {
            f,
            key_order_preserved: true,
        }
    }
}

impl<F> RecordFilter for FnFilter<F>
where
    F: FnMut(Record, &mut FilterOutput) -> Result<()> + Send,
{
    fn process(&mut self, record: Record, out: &mut FilterOutput) -> Result<()> {
        (self.f)(record, out)
    }

    fn key_order_preserved(&self) -> bool {
        self.key_order_preserved
    }
}

/// Operator applying a [`RecordFilter`] to a source.
pub struct FilterSource {
    input: BoxedSource,
    filter: Box<dyn RecordFilter>,
    out: FilterOutput,
    current: Record,
    input_done: bool,
    finish_called: bool,
    errors: Arc<AtomicU64>,
    meta: SourceMeta,
}

impl FilterSource {
    /// Wrap `input` with `filter`.
    pub fn new<F: RecordFilter + 'static>(input: BoxedSource, filter: F) -> Self {
        let sorted = if filter.key_order_preserved() {
            input.meta().sorted
        } else {
            None
        };
        let meta = input
            .meta()
            .derive("filter")
            .with_sorted(sorted)
            .with_reduced(false);

        Self {
            input,
            filter: Box::new(filter),
            out: FilterOutput::new(),
            current: Record::empty(),
            input_done: false,
            finish_called: false,
            errors: Arc::new(AtomicU64::new(0)),
            meta,
        }
    }

    /// Records that failed inside the filter so far.
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Shared handle to the error counter, readable after the source
    /// has been boxed into a larger pipeline.
    pub fn error_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.errors)
    }
}

impl RecordSource for FilterSource {
    fn advance(&mut self) -> Result<bool> {
        loop {
            if let Some(record) = self.out.queue.pop_front() {
                self.current = record;
                return Ok(true);
            }
            if self.finish_called {
                return Ok(false);
            }
            if self.input_done || self.out.stop {
                self.finish_called = true;
                self.filter.finish(&mut self.out)?;
                if self.out.stop {
                    self.input.close()?;
                }
                continue;
            }

            if !self.input.advance()? {
                self.input_done = true;
                continue;
            }
            let record = self.input.current().clone();
            if let Err(e) = self.filter.process(record, &mut self.out) {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "filter failed on record, continuing");
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
        self.out.queue.clear();
        self.input.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::source::VecSource;
    use crate::pipeline::SourceExt;
    use crate::Error;

    fn keys(source: &mut dyn RecordSource) -> Vec<String> {
        let mut out = Vec::new();
        while source.advance().unwrap() {
            out.push(String::from_utf8(source.current().key().to_vec()).unwrap());
        }
        out
    }

    #[test]
    fn test_filter_one_to_one() {
        let source = VecSource::from_pairs("in", &[("a", "1"), ("b", "2"), ("c", "3")]);
        let mut filtered = source.filter(FnFilter::new(|record: Record, out: &mut FilterOutput| {
            if record.key() != b"b" {
                out.push(record);
            }
            Ok(())
        }));

        assert_eq!(keys(&mut filtered), vec!["a", "c"]);
    }

    #[test]
    fn test_filter_multi_emit() {
        let source = VecSource::from_pairs("in", &[("a", "1")]);
        let mut filtered = source.filter(FnFilter::new(|record: Record, out: &mut FilterOutput| {
            out.push(record.clone());
            out.push(record);
            Ok(())
        }));

        assert_eq!(keys(&mut filtered), vec!["a", "a"]);
    }

    #[test]
    fn test_filter_early_stop() {
        let source = VecSource::from_pairs("in", &[("a", "1"), ("b", "2"), ("c", "3")]);
        let mut filtered = source.filter(FnFilter::new(|record: Record, out: &mut FilterOutput| {
            if record.key() == b"b" {
                out.stop_input();
            } else {
                out.push(record);
            }
            Ok(())
        }));

        assert_eq!(keys(&mut filtered), vec!["a"]);
    }

    #[test]
    fn test_filter_finish_hook() {
        struct Summing {
            total: u64,
        }
        impl RecordFilter for Summing {
            fn process(&mut self, record: Record, _out: &mut FilterOutput) -> Result<()> {
                self.total += record.payload().len() as u64;
                Ok(())
            }
            fn finish(&mut self, out: &mut FilterOutput) -> Result<()> {
                out.push(Record::new(&b"total"[..], format!("{}", self.total)));
                Ok(())
            }
        }

        let source = VecSource::from_pairs("in", &[("a", "xx"), ("b", "yyy")]);
        let mut filtered = FilterSource::new(source.boxed(), Summing { total: 0 });

        assert!(filtered.advance().unwrap());
        assert_eq!(filtered.current().key(), b"total");
        assert_eq!(filtered.current().payload(), b"5");
        assert!(!filtered.advance().unwrap());
    }

    #[test]
    fn test_filter_error_isolation() {
        let source =
            VecSource::from_pairs("in", &[("a", "1"), ("bad", "2"), ("c", "3"), ("bad", "4")]);
        let mut filtered = source.filter(FnFilter::new(|record: Record, out: &mut FilterOutput| {
            if record.key() == b"bad" {
                return Err(Error::invalid_format("unparseable record"));
            }
            out.push(record);
            Ok(())
        }));
        let counter = filtered.error_counter();

        assert_eq!(keys(&mut filtered), vec!["a", "c"]);
        assert_eq!(filtered.error_count(), 2);
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_filter_meta_sortedness() {
        use crate::util::comparator::SortOrder;

        let sorted_meta = crate::pipeline::SourceMeta::new("in")
            .with_sorted(Some(SortOrder::Ascending));
        let make = |order_preserving: bool| {
            let source = VecSource::with_meta(
                vec![Record::new(&b"a"[..], &b"1"[..])],
                sorted_meta.clone(),
            );
            if order_preserving {
                FilterSource::new(
                    source.boxed(),
                    FnFilter::order_preserving(|r: Record, out: &mut FilterOutput| {
                        out.push(r);
                        Ok(())
                    }),
                )
            } else {
                FilterSource::new(
                    source.boxed(),
                    FnFilter::new(|r: Record, out: &mut FilterOutput| {
                        out.push(r);
                        Ok(())
                    }),
                )
            }
        };

        assert!(make(true).meta().is_sorted(SortOrder::Ascending));
        assert!(make(false).meta().sorted.is_none());
    }
}

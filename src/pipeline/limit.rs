//! Limit and random-sample operators.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::record::Record;
use crate::Result;

use super::{BoxedSource, RecordSource, SourceMeta};

/// Passes through the first `n` records of its input.
pub struct LimitSource {
    input: BoxedSource,
    remaining: u64,
    meta: SourceMeta,
}

impl LimitSource {
    /// Wrap `input`, keeping at most `n` records.
    pub fn new(input: BoxedSource, n: u64) -> Self {
        let mut meta = input.meta().derive("limit");
        meta.estimated_records = match meta.estimated_records {
            Some(count) => Some(count.min(n as i64)),
            None => Some(n as i64),
        };
        Self {
            input,
            remaining: n,
            meta,
        }
    }
}

impl RecordSource for LimitSource {
    fn advance(&mut self) -> Result<bool> {
        if self.remaining == 0 {
            return Ok(false);
        }
        if !self.input.advance()? {
            self.remaining = 0;
            return Ok(false);
        }
        self.remaining -= 1;
        Ok(true)
    }

    fn current(&self) -> &Record {
        self.input.current()
    }

    fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    fn close(&mut self) -> Result<()> {
        self.input.close()
    }

    fn move_next_hint(&mut self, key: &[u8]) {
        self.input.move_next_hint(key)
    }
}

/// Keeps each record with probability `p`.
///
/// Sampling is order-preserving, so sortedness passes through. The RNG
/// is seeded explicitly so runs are reproducible.
pub struct SampleSource {
    input: BoxedSource,
    probability: f64,
    rng: StdRng,
    meta: SourceMeta,
}

impl SampleSource {
    /// Wrap `input`, keeping records with probability `p` (clamped to
    /// [0, 1]).
    pub fn new(input: BoxedSource, p: f64, seed: u64) -> Self {
        let p = p.clamp(0.0, 1.0);
        let mut meta = input.meta().derive("sample");
        meta.estimated_records = meta
            .estimated_records
            .map(|count| (count as f64 * p) as i64);
        Self {
            input,
            probability: p,
            rng: StdRng::seed_from_u64(seed),
            meta,
        }
    }
}

impl RecordSource for SampleSource {
    fn advance(&mut self) -> Result<bool> {
        while self.input.advance()? {
            if self.rng.gen_bool(self.probability) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn current(&self) -> &Record {
        self.input.current()
    }

    fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    fn close(&mut self) -> Result<()> {
        self.input.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::source::VecSource;
    use crate::pipeline::SourceExt;
    use crate::util::comparator::SortOrder;

    fn numbered(n: usize) -> VecSource {
        let records = (0..n)
            .map(|i| Record::new(format!("key_{:04}", i), format!("{}", i)))
            .collect();
        VecSource::new("numbers", records)
    }

    #[test]
    fn test_limit_truncates() {
        let mut limited = numbered(10).limit(3);
        let mut count = 0;
        while limited.advance().unwrap() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert!(!limited.advance().unwrap());
    }

    #[test]
    fn test_limit_larger_than_input() {
        let mut limited = numbered(3).limit(100);
        let mut count = 0;
        while limited.advance().unwrap() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_limit_zero() {
        let mut limited = numbered(3).limit(0);
        assert!(!limited.advance().unwrap());
    }

    #[test]
    fn test_limit_meta_estimate() {
        let limited = numbered(10).limit(3);
        assert_eq!(limited.meta().estimated_records, Some(3));
    }

    #[test]
    fn test_sample_deterministic() {
        let collect = |seed| {
            let mut sampled = numbered(1000).sample(0.3, seed);
            let mut keys = Vec::new();
            while sampled.advance().unwrap() {
                keys.push(sampled.current().key().to_vec());
            }
            keys
        };

        let first = collect(42);
        let second = collect(42);
        assert_eq!(first, second);

        // Roughly a third of the input survives.
        assert!(first.len() > 200 && first.len() < 400, "{}", first.len());

        let other_seed = collect(7);
        assert_ne!(first, other_seed);
    }

    #[test]
    fn test_sample_extremes() {
        let mut none = numbered(50).sample(0.0, 1);
        assert!(!none.advance().unwrap());

        let mut all = numbered(50).sample(1.0, 1);
        let mut count = 0;
        while all.advance().unwrap() {
            count += 1;
        }
        assert_eq!(count, 50);
    }

    #[test]
    fn test_sample_keeps_sortedness() {
        let meta = crate::pipeline::SourceMeta::new("in")
            .with_sorted(Some(SortOrder::Ascending));
        let source = VecSource::with_meta(vec![], meta);
        let sampled = source.sample(0.5, 3);
        assert!(sampled.meta().is_sorted(SortOrder::Ascending));
    }
}

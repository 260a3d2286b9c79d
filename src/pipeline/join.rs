//! Sort-merge joins: inner and left-outer.
//!
//! Both inputs must be ascending; an implicit sort is injected when a
//! side's metadata does not guarantee it. Duplicate keys on either side
//! are handled without materializing whole groups: the right side is
//! wrapped in a one-record lookahead that answers "does the next right
//! record share my key?", and the left side in a bookmarkable cursor
//! that can mark the start of its duplicate run and rewind to it. On a
//! key match the left run is swept against the current right record;
//! when the right lookahead shows another record at the same key, the
//! left cursor rewinds to the bookmark and the sweep repeats, so the
//! output is the full cross product of the two duplicate runs.

use bytes::Bytes;

use crate::options::DEFAULT_SEPARATOR;
use crate::record::{Record, RecordKind, TableSchema};
use crate::Result;

use super::merge::ensure_ascending;
use super::{BoxedSource, RecordSource, SourceMeta};

/// One-record lookahead over the right input.
struct LookaheadCursor {
    input: BoxedSource,
    current: Record,
    valid: bool,
    next: Option<Record>,
    primed: bool,
}

impl LookaheadCursor {
    fn new(input: BoxedSource) -> Self {
        Self {
            input,
            current: Record::empty(),
            valid: false,
            next: None,
            primed: false,
        }
    }

    fn pull(&mut self) -> Result<Option<Record>> {
        Ok(if self.input.advance()? {
            Some(self.input.current().clone())
        } else {
            None
        })
    }

    fn advance(&mut self) -> Result<bool> {
        if !self.primed {
            self.primed = true;
            self.next = self.pull()?;
        }
        match self.next.take() {
            Some(record) => {
                self.current = record;
                self.next = self.pull()?;
                self.valid = true;
                Ok(true)
            }
            None => {
                self.valid = false;
                Ok(false)
            }
        }
    }

    /// True if the record after the current one shares its key.
    fn next_shares_key(&self) -> bool {
        self.valid
            && self
                .next
                .as_ref()
                .is_some_and(|n| n.key() == self.current.key())
    }

    fn hint(&mut self, key: &[u8]) {
        self.input.move_next_hint(key);
    }

    fn close(&mut self) -> Result<()> {
        self.next = None;
        self.input.close()
    }
}

/// Bookmarkable cursor with one-record lookahead over the left input.
///
/// `mark` starts recording at the current record; `rewind` makes the
/// marked record current again and replays the recorded run before
/// resuming the live stream.
struct BookmarkCursor {
    input: BoxedSource,
    current: Record,
    valid: bool,
    next: Option<Record>,
    primed: bool,
    marked: bool,
    recorded: Vec<Record>,
    replay_next: Option<usize>,
}

impl BookmarkCursor {
    fn new(input: BoxedSource) -> Self {
        Self {
            input,
            current: Record::empty(),
            valid: false,
            next: None,
            primed: false,
            marked: false,
            recorded: Vec::new(),
            replay_next: None,
        }
    }

    fn pull(&mut self) -> Result<Option<Record>> {
        Ok(if self.input.advance()? {
            Some(self.input.current().clone())
        } else {
            None
        })
    }

    fn advance(&mut self) -> Result<bool> {
        if let Some(i) = self.replay_next {
            self.current = self.recorded[i].clone();
            self.replay_next = if i + 1 < self.recorded.len() {
                Some(i + 1)
            } else {
                None
            };
            self.valid = true;
            return Ok(true);
        }

        if !self.primed {
            self.primed = true;
            self.next = self.pull()?;
        }
        match self.next.take() {
            Some(record) => {
                self.current = record;
                if self.marked {
                    self.recorded.push(self.current.clone());
                }
                self.next = self.pull()?;
                self.valid = true;
                Ok(true)
            }
            None => {
                self.valid = false;
                Ok(false)
            }
        }
    }

    /// The record the next `advance` would surface.
    fn peek(&self) -> Option<&Record> {
        if let Some(i) = self.replay_next {
            return Some(&self.recorded[i]);
        }
        self.next.as_ref()
    }

    /// Start recording at the current record.
    fn mark(&mut self) {
        self.marked = true;
        self.recorded.clear();
        self.recorded.push(self.current.clone());
        self.replay_next = None;
    }

    /// Return to the marked record; subsequent advances replay the
    /// recorded run before resuming the live stream.
    fn rewind(&mut self) {
        self.current = self.recorded[0].clone();
        self.valid = true;
        self.replay_next = if self.recorded.len() > 1 {
            Some(1)
        } else {
            None
        };
    }

    fn clear_mark(&mut self) {
        self.marked = false;
        self.recorded.clear();
        self.replay_next = None;
    }

    fn hint(&mut self, key: &[u8]) {
        if !self.marked && self.replay_next.is_none() {
            self.input.move_next_hint(key);
        }
    }

    fn close(&mut self) -> Result<()> {
        self.next = None;
        self.recorded.clear();
        self.input.close()
    }
}

/// Shapes joined output rows; computed lazily from the first pair.
enum JoinShaper {
    /// Both sides are table rows: left columns plus right non-key
    /// columns, per the precomputed output schema.
    Table {
        left: TableSchema,
        right: TableSchema,
        right_non_key: Vec<usize>,
        separator: char,
    },
    /// Opaque payloads joined with a separator.
    Plain { separator: char },
}

impl JoinShaper {
    fn build(left_meta: &SourceMeta, right_meta: &SourceMeta, separator: char) -> Self {
        match (&left_meta.kind, &right_meta.kind) {
            (RecordKind::Table(left), RecordKind::Table(right)) => JoinShaper::Table {
                left: left.clone(),
                right: right.clone(),
                right_non_key: right.non_key_columns(),
                separator: left.separator(),
            },
            _ => JoinShaper::Plain { separator },
        }
    }

    /// Join the pair into one output record; None on the right pads a
    /// left-outer non-match.
    fn join(&self, left: &Record, right: Option<&Record>) -> Result<Record> {
        match self {
            JoinShaper::Table {
                left: left_schema,
                right: right_schema,
                right_non_key,
                separator,
            } => {
                let left_values = left_schema.split_row(left.payload())?;
                let mut values: Vec<&str> = left_values;
                let right_values = match right {
                    Some(record) => Some(right_schema.split_row(record.payload())?),
                    None => None,
                };
                for &i in right_non_key {
                    values.push(match &right_values {
                        Some(row) => row.get(i).copied().unwrap_or(""),
                        None => "",
                    });
                }
                let sep = separator.to_string();
                let payload = values.join(sep.as_str());
                Ok(Record::new(left.key_bytes().clone(), payload))
            }
            JoinShaper::Plain { separator } => {
                let mut payload = Vec::with_capacity(
                    left.payload().len()
                        + 1
                        + right.map_or(0, |r| r.payload().len()),
                );
                payload.extend_from_slice(left.payload());
                let mut sep = [0u8; 4];
                payload.extend_from_slice(separator.encode_utf8(&mut sep).as_bytes());
                if let Some(record) = right {
                    payload.extend_from_slice(record.payload());
                }
                Ok(Record::new(left.key_bytes().clone(), Bytes::from(payload)))
            }
        }
    }
}

/// Join flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinKind {
    Inner,
    LeftOuter,
}

/// Sort-merge join of two ascending inputs on key equality.
pub struct JoinSource {
    left: BookmarkCursor,
    right: LookaheadCursor,
    kind: JoinKind,
    separator: char,
    shaper: Option<JoinShaper>,
    primed: bool,
    in_run: bool,
    done: bool,
    current: Record,
    meta: SourceMeta,
}

impl JoinSource {
    /// Inner join: emit only matched pairs.
    pub fn inner(left: BoxedSource, right: BoxedSource) -> Result<Self> {
        Self::build(left, right, JoinKind::Inner)
    }

    /// Left-outer join: unmatched left records are padded.
    pub fn left_outer(left: BoxedSource, right: BoxedSource) -> Result<Self> {
        Self::build(left, right, JoinKind::LeftOuter)
    }

    fn build(left: BoxedSource, right: BoxedSource, kind: JoinKind) -> Result<Self> {
        let left = ensure_ascending(left);
        let right = ensure_ascending(right);

        let output_kind = match (&left.meta().kind, &right.meta().kind) {
            (RecordKind::Table(l), RecordKind::Table(r)) => RecordKind::Table(
                TableSchema::join_output(l, r, &left.meta().name, &right.meta().name)?,
            ),
            (other, _) => other.clone(),
        };
        let meta = left
            .meta()
            .derive("join")
            .with_kind(output_kind)
            .with_reduced(false);

        Ok(Self {
            left: BookmarkCursor::new(left),
            right: LookaheadCursor::new(right),
            kind,
            separator: DEFAULT_SEPARATOR,
            shaper: None,
            primed: false,
            in_run: false,
            done: false,
            current: Record::empty(),
            meta,
        })
    }

    /// Separator used when joining non-table payloads.
    pub fn with_separator(mut self, separator: char) -> Self {
        self.separator = separator;
        self
    }

    fn emit(&mut self, matched: bool) -> Result<()> {
        if self.shaper.is_none() {
            self.shaper = Some(JoinShaper::build(
                self.left.input.meta(),
                self.right.input.meta(),
                self.separator,
            ));
        }
        let shaper = self.shaper.as_ref().expect("shaper built");
        let right = if matched {
            Some(&self.right.current)
        } else {
            None
        };
        self.current = shaper.join(&self.left.current, right)?;
        Ok(())
    }
}

impl RecordSource for JoinSource {
    fn advance(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        if !self.primed {
            self.primed = true;
            self.left.advance()?;
            self.right.advance()?;
        }

        if self.in_run {
            // The previous call emitted (left.current, right.current).
            let run_key = self.right.current.key().to_vec();

            if self
                .left
                .peek()
                .is_some_and(|next| next.key() == run_key.as_slice())
            {
                self.left.advance()?;
                self.emit(true)?;
                return Ok(true);
            }
            if self.right.next_shares_key() {
                // Replay the left run against the next right duplicate.
                self.right.advance()?;
                self.left.rewind();
                self.emit(true)?;
                return Ok(true);
            }
            // Run fully joined; step both sides past it.
            self.left.clear_mark();
            self.in_run = false;
            self.left.advance()?;
            self.right.advance()?;
        }

        loop {
            if !self.left.valid {
                self.done = true;
                return Ok(false);
            }
            if !self.right.valid {
                match self.kind {
                    JoinKind::Inner => {
                        self.done = true;
                        return Ok(false);
                    }
                    JoinKind::LeftOuter => {
                        self.emit(false)?;
                        self.left.advance()?;
                        return Ok(true);
                    }
                }
            }

            let left_key = self.left.current.key();
            let right_key = self.right.current.key();
            if left_key < right_key {
                match self.kind {
                    JoinKind::LeftOuter => {
                        self.emit(false)?;
                        self.left.advance()?;
                        return Ok(true);
                    }
                    JoinKind::Inner => {
                        // Nothing matches before the right's key; let a
                        // seekable left skip the gap.
                        let target = self.right.current.key().to_vec();
                        self.left.hint(&target);
                        self.left.advance()?;
                    }
                }
            } else if left_key > right_key {
                let target = self.left.current.key().to_vec();
                self.right.hint(&target);
                self.right.advance()?;
            } else {
                self.left.mark();
                self.in_run = true;
                self.emit(true)?;
                return Ok(true);
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
        self.left.close()?;
        self.right.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::source::VecSource;
    use crate::util::comparator::SortOrder;

    fn sorted_source(name: &str, pairs: &[(&str, &str)]) -> BoxedSource {
        let meta = SourceMeta::new(name).with_sorted(Some(SortOrder::Ascending));
        let records = pairs
            .iter()
            .map(|(k, v)| Record::new(k.to_string(), v.to_string()))
            .collect();
        Box::new(VecSource::with_meta(records, meta))
    }

    fn table_source(
        name: &str,
        columns: &[&str],
        key_columns: &[usize],
        rows: &[&str],
    ) -> BoxedSource {
        let schema = TableSchema::new(
            columns.iter().map(|s| s.to_string()).collect(),
            key_columns.to_vec(),
            '\t',
        )
        .unwrap();
        let records = rows
            .iter()
            .map(|row| schema.record_from_row(row.to_string()).unwrap())
            .collect();
        let meta = SourceMeta::new(name)
            .with_kind(RecordKind::Table(schema))
            .with_sorted(Some(SortOrder::Ascending));
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
    fn test_inner_join_left_duplicates() {
        let left = sorted_source("l", &[("A", "1"), ("B", "2"), ("B", "3")]);
        let right = sorted_source("r", &[("B", "x"), ("C", "y")]);

        let mut join = JoinSource::inner(left, right).unwrap();
        assert_eq!(
            drain(&mut join),
            vec![
                ("B".into(), "2\tx".into()),
                ("B".into(), "3\tx".into()),
            ]
        );
    }

    #[test]
    fn test_left_outer_join_left_duplicates() {
        let left = sorted_source("l", &[("A", "1"), ("B", "2"), ("B", "3")]);
        let right = sorted_source("r", &[("B", "x"), ("C", "y")]);

        let mut join = JoinSource::left_outer(left, right).unwrap();
        assert_eq!(
            drain(&mut join),
            vec![
                ("A".into(), "1\t".into()),
                ("B".into(), "2\tx".into()),
                ("B".into(), "3\tx".into()),
            ]
        );
    }

    #[test]
    fn test_inner_join_right_duplicates() {
        let left = sorted_source("l", &[("A", "1"), ("B", "2"), ("C", "3")]);
        let right = sorted_source("r", &[("B", "x"), ("B", "y")]);

        let mut join = JoinSource::inner(left, right).unwrap();
        assert_eq!(
            drain(&mut join),
            vec![
                ("B".into(), "2\tx".into()),
                ("B".into(), "2\ty".into()),
            ]
        );
    }

    #[test]
    fn test_inner_join_duplicates_both_sides() {
        let left = sorted_source("l", &[("B", "1"), ("B", "2")]);
        let right = sorted_source("r", &[("B", "x"), ("B", "y")]);

        let mut join = JoinSource::inner(left, right).unwrap();
        // Cross product; the left run is swept per right record.
        assert_eq!(
            drain(&mut join),
            vec![
                ("B".into(), "1\tx".into()),
                ("B".into(), "2\tx".into()),
                ("B".into(), "1\ty".into()),
                ("B".into(), "2\ty".into()),
            ]
        );
    }

    #[test]
    fn test_join_runs_then_more_keys() {
        let left = sorted_source("l", &[("A", "1"), ("B", "2"), ("B", "3"), ("D", "4")]);
        let right = sorted_source("r", &[("B", "x"), ("B", "y"), ("D", "z")]);

        let mut join = JoinSource::inner(left, right).unwrap();
        assert_eq!(
            drain(&mut join),
            vec![
                ("B".into(), "2\tx".into()),
                ("B".into(), "3\tx".into()),
                ("B".into(), "2\ty".into()),
                ("B".into(), "3\ty".into()),
                ("D".into(), "4\tz".into()),
            ]
        );
    }

    #[test]
    fn test_inner_join_no_matches() {
        let left = sorted_source("l", &[("A", "1"), ("C", "2")]);
        let right = sorted_source("r", &[("B", "x"), ("D", "y")]);

        let mut join = JoinSource::inner(left, right).unwrap();
        assert!(drain(&mut join).is_empty());
    }

    #[test]
    fn test_left_outer_join_empty_right() {
        let left = sorted_source("l", &[("A", "1"), ("B", "2")]);
        let right = sorted_source("r", &[]);

        let mut join = JoinSource::left_outer(left, right).unwrap();
        assert_eq!(
            drain(&mut join),
            vec![("A".into(), "1\t".into()), ("B".into(), "2\t".into())]
        );
    }

    #[test]
    fn test_join_empty_left() {
        let left = sorted_source("l", &[]);
        let right = sorted_source("r", &[("A", "x")]);

        let mut join = JoinSource::left_outer(left, right).unwrap();
        assert!(drain(&mut join).is_empty());
    }

    #[test]
    fn test_join_injects_sort() {
        let left: BoxedSource =
            Box::new(VecSource::from_pairs("l", &[("B", "2"), ("A", "1")]));
        let right: BoxedSource =
            Box::new(VecSource::from_pairs("r", &[("B", "x")]));

        let mut join = JoinSource::inner(left, right).unwrap();
        assert_eq!(drain(&mut join), vec![("B".into(), "2\tx".into())]);
    }

    #[test]
    fn test_table_join_column_shaping() {
        let left = table_source(
            "users",
            &["id", "name"],
            &[0],
            &["1\tAlice", "2\tBob", "3\tCarol"],
        );
        let right = table_source(
            "cities",
            &["id", "city"],
            &[0],
            &["1\tParis", "3\tOslo"],
        );

        let join = JoinSource::inner(left, right).unwrap();
        let schema = join.meta().kind.table_schema().unwrap().clone();
        assert_eq!(schema.columns(), &["id", "name", "city"]);

        let mut join = join;
        assert_eq!(
            drain(&mut join),
            vec![
                ("1".into(), "1\tAlice\tParis".into()),
                ("3".into(), "3\tCarol\tOslo".into()),
            ]
        );
    }

    #[test]
    fn test_table_left_outer_padding() {
        let left = table_source("users", &["id", "name"], &[0], &["1\tAlice", "2\tBob"]);
        let right = table_source("cities", &["id", "city"], &[0], &["1\tParis"]);

        let mut join = JoinSource::left_outer(left, right).unwrap();
        assert_eq!(
            drain(&mut join),
            vec![
                ("1".into(), "1\tAlice\tParis".into()),
                ("2".into(), "2\tBob\t".into()),
            ]
        );
    }

    #[test]
    fn test_table_join_duplicate_column_names() {
        let left = table_source("l", &["id", "value"], &[0], &["1\ta"]);
        let right = table_source("r", &["id", "value"], &[0], &["1\tb"]);

        let join = JoinSource::inner(left, right).unwrap();
        let schema = join.meta().kind.table_schema().unwrap().clone();
        assert_eq!(schema.columns(), &["id", "l.value", "r.value"]);
    }
}

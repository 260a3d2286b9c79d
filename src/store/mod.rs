//! The TStore on-disk store: a sorted, front-coded, indexed sequence of
//! key/payload records.
//!
//! A store is a directory of five files: `keys-data` (front-coded
//! records), `keys-data-index` (5-byte group offsets plus a record-count
//! and group-size trailer), `cache` and `cache-index` (a nested store of
//! the same shape holding only each group's first key), and `record-info`
//! (the metadata sidecar). Stores are written once and read-only
//! thereafter.

mod concurrent;
mod record_info;
mod segment;
mod reader;
mod writer;

pub use concurrent::ConcurrentStoreReader;
pub use record_info::RecordInfo;
pub use segment::{GroupCursor, GroupIndex, MemSegment, INDEX_OFFSET_LEN, INDEX_TRAILER_LEN};
pub use reader::{RecordRange, StoreReader};
pub use writer::{StoreSummary, StoreWriter};

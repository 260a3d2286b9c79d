//! # tstore
//!
//! A sorted, front-coded, indexed key/value store plus a composable,
//! lazily-evaluated record pipeline.
//!
//! ## Features
//!
//! - **TStore format**: front-coded records in fixed-size groups, a
//!   5-byte group-offset index, and a nested cache store so keyed
//!   lookup binary-searches a small memory-resident structure
//! - **Record pipeline**: pull-based sources over stores, flat files,
//!   record files, directories, and callbacks, composed through filter,
//!   limit, sample, external sort+reduce, k-way merge, semi/anti
//!   filters, and sort-merge joins
//! - **External sort**: memory-bounded with background sort/write
//!   pipelining and spill files merged at the end
//! - **Thread-safe reads**: a random-access reader that serializes disk
//!   access through one dedicated I/O thread
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tstore::{Options, Record, RecordKind, StoreWriter, StoreReader};
//!
//! // Build a store from unsorted input.
//! let mut writer = StoreWriter::create(path, Options::default(), RecordKind::Text)?;
//! writer.add_record(Record::new("cherry", "3"))?;
//! writer.add_record(Record::new("apple", "1"))?;
//! writer.finish()?;
//!
//! // Look up by key, record number, or prefix.
//! let mut reader = StoreReader::open(path)?;
//! let record = reader.get(b"apple")?;
//! let range = reader.matching_prefix(b"a")?;
//! ```

// Public modules
pub mod error;
pub mod options;
pub mod record;

// Engine modules
pub mod pipeline;
pub mod store;

// Internal utilities
mod util;

pub use util::coding;
pub use util::comparator::{KeyComparator, SortOrder};
pub use util::filename;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use options::{Options, OptionsBuilder};
pub use record::{Record, RecordKind, TableSchema};

pub use store::{
    ConcurrentStoreReader, RecordInfo, RecordRange, StoreReader, StoreSummary, StoreWriter,
};

pub use pipeline::filter::{FilterOutput, FilterSource, FnFilter, RecordFilter};
pub use pipeline::join::JoinSource;
pub use pipeline::limit::{LimitSource, SampleSource};
pub use pipeline::merge::{ConcatSource, MergeSource, SemiFilterMode, SemiFilterSource};
pub use pipeline::sink::{write_flat_file, write_record_file, write_store};
pub use pipeline::sort::{ReduceSource, SortOptions, SortSource, Sorter};
pub use pipeline::source::{
    open_path, CallbackSource, DirectorySource, FlatFileSource, RecordFileSource, StoreSource,
    VecSource,
};
pub use pipeline::{BoxedSource, RecordSource, SourceExt, SourceMeta};

//! Terminal pipeline operations: write a source out as a store, a
//! framed record file, or a flat text file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::info;

use crate::options::Options;
use crate::record::RecordKind;
use crate::store::{StoreSummary, StoreWriter};
use crate::util::comparator::SortOrder;
use crate::Result;

use super::sort::{SortOptions, SortSource};
use super::source::write_framed;
use super::{BoxedSource, RecordSource};

/// Write a source into a new store directory.
///
/// Store input must be ascending; when the source's metadata does not
/// guarantee that, an implicit sort is inserted here — the decision is
/// made from metadata alone, without touching data.
pub fn write_store(source: BoxedSource, dir: &Path, options: &Options) -> Result<StoreSummary> {
    let mut source = if source.meta().is_sorted(SortOrder::Ascending) {
        source
    } else {
        info!(store = %dir.display(), "input not sorted, inserting implicit sort");
        Box::new(SortSource::new(
            source,
            SortOptions::from_options(options, SortOrder::Ascending),
        ))
    };

    let mut writer = StoreWriter::create(dir, options.clone(), source.meta().kind.clone())?;
    writer.set_reduced(source.meta().reduced);
    while source.advance()? {
        writer.append(source.current())?;
    }
    source.close()?;

    let summary = writer.finish()?;
    info!(
        store = %dir.display(),
        records = summary.record_count,
        bytes = summary.byte_size,
        "store written"
    );
    Ok(summary)
}

/// Write a source as a framed binary record file. Returns the record
/// count.
pub fn write_record_file(mut source: BoxedSource, path: &Path) -> Result<u64> {
    let mut writer = BufWriter::new(File::create(path)?);
    let mut count = 0u64;
    while source.advance()? {
        let record = source.current();
        write_framed(&mut writer, record.key(), record.payload())?;
        count += 1;
    }
    source.close()?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(count)
}

/// Write a source as a flat text file, one line per record. Table rows
/// emit their full row; other kinds emit key, separator, payload.
/// Returns the record count.
pub fn write_flat_file(mut source: BoxedSource, path: &Path, separator: char) -> Result<u64> {
    let is_table = matches!(source.meta().kind, RecordKind::Table(_));
    let mut writer = BufWriter::new(File::create(path)?);
    let mut count = 0u64;
    let mut sep = [0u8; 4];
    let sep = separator.encode_utf8(&mut sep).as_bytes();

    while source.advance()? {
        let record = source.current();
        if is_table {
            writer.write_all(record.payload())?;
        } else {
            writer.write_all(record.key())?;
            writer.write_all(sep)?;
            writer.write_all(record.payload())?;
        }
        writer.write_all(b"\n")?;
        count += 1;
    }
    source.close()?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(count)
}

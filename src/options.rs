//! Configuration options for tstore.

use std::path::PathBuf;

/// Default number of records per sorted group.
pub const DEFAULT_GROUP_SIZE: usize = 32;

/// Default memory ceiling for one external sort (512MB).
pub const DEFAULT_SORT_MEMORY_LIMIT: usize = 512 * 1024 * 1024;

/// Default initial capacity of a sort arena (4MB).
pub const DEFAULT_ARENA_CAPACITY: usize = 4 * 1024 * 1024;

/// Default column separator for table rows and flat files.
pub const DEFAULT_SEPARATOR: char = '\t';

/// Engine configuration.
///
/// One `Options` value is shared by store writers, readers, and the
/// pipeline operators created from it.
#[derive(Debug, Clone)]
pub struct Options {
    /// Number of consecutive records sharing one index entry.
    pub group_size: usize,

    /// Memory ceiling for one external sort before spilling to disk.
    pub sort_memory_limit: usize,

    /// Initial capacity of the sort arena.
    pub arena_capacity: usize,

    /// Directory for spill files (None: the system temp directory).
    pub temp_dir: Option<PathBuf>,

    /// Keep spill files after the sort output is closed.
    pub keep_temp_files: bool,

    /// Column separator for table rows and flat files.
    pub separator: char,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            group_size: DEFAULT_GROUP_SIZE,
            sort_memory_limit: DEFAULT_SORT_MEMORY_LIMIT,
            arena_capacity: DEFAULT_ARENA_CAPACITY,
            temp_dir: None,
            keep_temp_files: false,
            separator: DEFAULT_SEPARATOR,
        }
    }
}

impl Options {
    /// Create new options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the options.
    pub fn validate(&self) -> crate::Result<()> {
        if self.group_size < 2 {
            return Err(crate::Error::InvalidConfiguration(
                "group_size must be at least 2".into(),
            ));
        }

        if self.sort_memory_limit < 64 * 1024 {
            return Err(crate::Error::InvalidConfiguration(
                "sort_memory_limit must be at least 64KB".into(),
            ));
        }

        if self.arena_capacity > self.sort_memory_limit {
            return Err(crate::Error::InvalidConfiguration(
                "arena_capacity cannot exceed sort_memory_limit".into(),
            ));
        }

        Ok(())
    }

    /// Resolve the spill directory.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Builder for Options.
#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the group size.
    pub fn group_size(mut self, size: usize) -> Self {
        self.options.group_size = size;
        self
    }

    /// Set the sort memory ceiling.
    pub fn sort_memory_limit(mut self, bytes: usize) -> Self {
        self.options.sort_memory_limit = bytes;
        self
    }

    /// Set the sort arena initial capacity.
    pub fn arena_capacity(mut self, bytes: usize) -> Self {
        self.options.arena_capacity = bytes;
        self
    }

    /// Set the spill directory.
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.temp_dir = Some(dir.into());
        self
    }

    /// Keep spill files after the sort output is closed.
    pub fn keep_temp_files(mut self, keep: bool) -> Self {
        self.options.keep_temp_files = keep;
        self
    }

    /// Set the column separator.
    pub fn separator(mut self, sep: char) -> Self {
        self.options.separator = sep;
        self
    }

    /// Build the options.
    pub fn build(self) -> crate::Result<Options> {
        self.options.validate()?;
        Ok(self.options)
    }
}

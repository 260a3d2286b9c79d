//! Store directory naming conventions.

use std::path::{Path, PathBuf};

/// Key/payload data file of a store.
pub const KEYS_DATA: &str = "keys-data";

/// Group-offset index of the data file.
pub const KEYS_DATA_INDEX: &str = "keys-data-index";

/// Nested cache store holding each group's first key.
pub const CACHE: &str = "cache";

/// Group-offset index of the cache store.
pub const CACHE_INDEX: &str = "cache-index";

/// Metadata sidecar.
pub const RECORD_INFO: &str = "record-info";

/// Path of the key/payload data file.
pub fn keys_data_path(store_dir: &Path) -> PathBuf {
    store_dir.join(KEYS_DATA)
}

/// Path of the data file's group index.
pub fn keys_data_index_path(store_dir: &Path) -> PathBuf {
    store_dir.join(KEYS_DATA_INDEX)
}

/// Path of the cache store's data file.
pub fn cache_path(store_dir: &Path) -> PathBuf {
    store_dir.join(CACHE)
}

/// Path of the cache store's group index.
pub fn cache_index_path(store_dir: &Path) -> PathBuf {
    store_dir.join(CACHE_INDEX)
}

/// Path of the metadata sidecar.
pub fn record_info_path(store_dir: &Path) -> PathBuf {
    store_dir.join(RECORD_INFO)
}

/// Prefix used for spill-run temp files, visible in temp directories
/// when runs are retained for inspection.
pub const SPILL_PREFIX: &str = "tstore-run-";

/// True if `path` has the layout of a store directory.
pub fn is_store_dir(path: &Path) -> bool {
    path.is_dir() && keys_data_path(path).is_file() && keys_data_index_path(path).is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_paths() {
        let dir = Path::new("/data/users");
        assert_eq!(keys_data_path(dir), Path::new("/data/users/keys-data"));
        assert_eq!(
            keys_data_index_path(dir),
            Path::new("/data/users/keys-data-index")
        );
        assert_eq!(cache_path(dir), Path::new("/data/users/cache"));
        assert_eq!(cache_index_path(dir), Path::new("/data/users/cache-index"));
        assert_eq!(record_info_path(dir), Path::new("/data/users/record-info"));
    }

    #[test]
    fn test_is_store_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_store_dir(dir.path()));

        std::fs::write(keys_data_path(dir.path()), b"").unwrap();
        std::fs::write(keys_data_index_path(dir.path()), b"").unwrap();
        assert!(is_store_dir(dir.path()));
    }
}

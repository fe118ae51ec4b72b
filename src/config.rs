use std::path::{Component, Path, PathBuf};

use crate::error::Result;

/// Strategy used to assign internal data stream IDs. Fixed at store
/// creation and immutable for the lifetime of the store directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StreamIdStrategy {
    /// Monotonically increasing IDs, starting at 1.
    Sequential,
    /// Deterministic 48-bit hash of (system id, output name, valid time),
    /// with upward probing on collision.
    UidHash,
}

/// Configuration for an observation database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Directory holding the store files (lock, meta, log, snapshot)
    pub storage_path: PathBuf,

    /// When set, `storage_path` must resolve inside this root
    pub storage_root: Option<PathBuf>,

    /// Page cache budget in KiB (0 = engine default)
    pub memory_cache_kb: u32,

    /// Buffered write bytes before an implicit commit (0 = engine default)
    pub auto_commit_buffer_bytes: u32,

    /// Compress snapshot sections; immutable after creation
    pub use_compression: bool,

    /// Data stream ID assignment strategy; immutable after creation
    pub stream_id_strategy: StreamIdStrategy,

    /// Unique tag for this store among all stores mounted on the host
    pub database_id: u32,

    /// Opt-in spatial index on per-observation sampling geometry.
    /// Accepted and recorded; no spatial index is built at this layer.
    pub index_obs_location: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./obsdb"),
            storage_root: None,
            memory_cache_kb: 0,
            auto_commit_buffer_bytes: 0,
            use_compression: false,
            stream_id_strategy: StreamIdStrategy::Sequential,
            database_id: 0,
            index_obs_location: false,
        }
    }
}

impl DbConfig {
    /// Create a new config with the given storage directory
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            ..Default::default()
        }
    }

    /// Confine the storage path to the given root directory
    pub fn storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    /// Set the page cache budget in KiB
    pub fn memory_cache_kb(mut self, kb: u32) -> Self {
        self.memory_cache_kb = kb;
        self
    }

    /// Set the implicit-commit buffer size in bytes
    pub fn auto_commit_buffer_bytes(mut self, bytes: u32) -> Self {
        self.auto_commit_buffer_bytes = bytes;
        self
    }

    /// Enable snapshot compression
    pub fn use_compression(mut self, enabled: bool) -> Self {
        self.use_compression = enabled;
        self
    }

    /// Set the stream ID assignment strategy
    pub fn stream_id_strategy(mut self, strategy: StreamIdStrategy) -> Self {
        self.stream_id_strategy = strategy;
        self
    }

    /// Set the database tag
    pub fn database_id(mut self, id: u32) -> Self {
        self.database_id = id;
        self
    }

    /// Enable the per-observation sampling geometry index flag
    pub fn index_obs_location(mut self, enabled: bool) -> Self {
        self.index_obs_location = enabled;
        self
    }

    /// Validates the storage path: no traversal components, and containment
    /// in `storage_root` when one is configured.
    pub fn validate(&self) -> Result<()> {
        if !is_safe_path(&self.storage_path) {
            return Err(crate::error::Error::Unavailable(format!(
                "storage path contains illegal components: {}",
                self.storage_path.display()
            )));
        }
        if let Some(root) = &self.storage_root {
            let resolved = if self.storage_path.is_absolute() {
                self.storage_path.clone()
            } else {
                root.join(&self.storage_path)
            };
            if !resolved.starts_with(root) {
                return Err(crate::error::Error::Unavailable(format!(
                    "storage path {} escapes root {}",
                    self.storage_path.display(),
                    root.display()
                )));
            }
        }
        Ok(())
    }
}

/// A path is safe when it contains no parent-directory components.
fn is_safe_path(path: &Path) -> bool {
    path.components().all(|c| !matches!(c, Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DbConfig::default();
        assert_eq!(config.storage_path, PathBuf::from("./obsdb"));
        assert_eq!(config.memory_cache_kb, 0);
        assert_eq!(config.auto_commit_buffer_bytes, 0);
        assert!(!config.use_compression);
        assert_eq!(config.stream_id_strategy, StreamIdStrategy::Sequential);
    }

    #[test]
    fn test_config_builder() {
        let config = DbConfig::new("/data/stores/db1")
            .memory_cache_kb(64 * 1024)
            .auto_commit_buffer_bytes(1024 * 1024)
            .use_compression(true)
            .stream_id_strategy(StreamIdStrategy::UidHash)
            .database_id(3);

        assert_eq!(config.storage_path, PathBuf::from("/data/stores/db1"));
        assert_eq!(config.memory_cache_kb, 64 * 1024);
        assert_eq!(config.auto_commit_buffer_bytes, 1024 * 1024);
        assert!(config.use_compression);
        assert_eq!(config.stream_id_strategy, StreamIdStrategy::UidHash);
        assert_eq!(config.database_id, 3);
    }

    #[test]
    fn test_rejects_traversal() {
        let config = DbConfig::new("/data/../etc/stores");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_root_containment() {
        let config = DbConfig::new("db1").storage_root("/data/stores");
        assert!(config.validate().is_ok());

        let config = DbConfig::new("/elsewhere/db1").storage_root("/data/stores");
        assert!(config.validate().is_err());
    }
}

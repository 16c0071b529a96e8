//! # Configuration Management
//!
//! Handles configuration for the page arena and the transaction layer.
//! Every field has a default, so a JSON document only needs the keys it changes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub arena: ArenaConfig,
    pub txn: TxnConfig,
}

impl Config {
    /// Parse a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text).map_err(|e| Error::Configuration {
            message: format!("invalid configuration document: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .io_context(|| format!("reading configuration {:?}", path))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.arena.validate()?;
        self.txn.validate()
    }
}

/// Page arena configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Directory (device mount) holding one file per page
    pub device_path: PathBuf,
    /// Page files are named `<filename_prefix><file_id>`
    pub filename_prefix: String,
    pub num_pages_to_init: usize,
    /// Overrides topology detection when set
    pub num_nodes: Option<usize>,
    /// Per node: pages handed back right after initialization
    pub num_pages_to_free: Vec<usize>,
    /// Per node: pages withheld from `alloc`
    pub num_pages_to_reserve: Vec<usize>,
    pub clean_files_on_init: bool,
    pub verbose: bool,
    /// Attempts at binding a discovered address before giving up
    pub max_address_retries: u32,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/cxl"),
            filename_prefix: "tierdb_cxl_".to_string(),
            num_pages_to_init: 1024, // 2GB of 2MB pages
            num_nodes: None,
            num_pages_to_free: Vec::new(),
            num_pages_to_reserve: Vec::new(),
            clean_files_on_init: false,
            verbose: false,
            max_address_retries: 16,
        }
    }
}

impl ArenaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.filename_prefix.is_empty() || self.filename_prefix.contains('/') {
            return Err(Error::Configuration {
                message: format!("invalid filename prefix {:?}", self.filename_prefix),
            });
        }
        if self.num_nodes == Some(0) {
            return Err(Error::Configuration {
                message: "num_nodes must be at least 1".to_string(),
            });
        }
        if self.max_address_retries == 0 {
            return Err(Error::Configuration {
                message: "max_address_retries must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Per-node count from one of the per-node lists; missing nodes count as zero.
    pub fn per_node(counts: &[usize], node: usize) -> usize {
        counts.get(node).copied().unwrap_or(0)
    }
}

/// Transaction layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnConfig {
    /// Number of worker contexts (one commit slot table each)
    pub max_threads: u16,
    pub commit_slots_per_thread: usize,
    /// Abort on a pending version instead of spinning until it resolves
    pub no_wait_for_pending: bool,
    /// Step over pending versions on plain reads (validation never skips)
    pub skip_pending: bool,
    pub max_accesses_per_txn: usize,
    pub access_bucket_root_count: usize,
    pub access_bucket_size: usize,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            max_threads: 64,
            commit_slots_per_thread: 4096,
            no_wait_for_pending: true,
            skip_pending: false,
            max_accesses_per_txn: 4096,
            access_bucket_root_count: 16,
            access_bucket_size: 8,
        }
    }
}

impl TxnConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(Error::Configuration {
                message: "max_threads must be at least 1".to_string(),
            });
        }
        if self.commit_slots_per_thread == 0 || self.commit_slots_per_thread > u16::MAX as usize + 1 {
            return Err(Error::Configuration {
                message: format!(
                    "commit_slots_per_thread must be in 1..={}, got {}",
                    u16::MAX as usize + 1,
                    self.commit_slots_per_thread
                ),
            });
        }
        if self.access_bucket_root_count == 0 || self.access_bucket_size == 0 {
            return Err(Error::Configuration {
                message: "access bucket counts must be non-zero".to_string(),
            });
        }
        if self.max_accesses_per_txn == 0 {
            return Err(Error::Configuration {
                message: "max_accesses_per_txn must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_document_uses_defaults() {
        let config = Config::from_json(
            r#"{ "arena": { "device_path": "/mnt/cxl", "num_pages_to_init": 8, "verbose": true } }"#,
        )
        .unwrap();
        assert_eq!(config.arena.device_path, PathBuf::from("/mnt/cxl"));
        assert_eq!(config.arena.num_pages_to_init, 8);
        assert!(config.arena.verbose);
        assert_eq!(config.arena.filename_prefix, "tierdb_cxl_");
        assert_eq!(config.txn.commit_slots_per_thread, 4096);
        assert!(config.txn.no_wait_for_pending);
    }

    #[test]
    fn test_per_node_lists() {
        let config = Config::from_json(
            r#"{ "arena": { "num_pages_to_reserve": [2, 0, 1] } }"#,
        )
        .unwrap();
        assert_eq!(ArenaConfig::per_node(&config.arena.num_pages_to_reserve, 0), 2);
        assert_eq!(ArenaConfig::per_node(&config.arena.num_pages_to_reserve, 2), 1);
        assert_eq!(ArenaConfig::per_node(&config.arena.num_pages_to_reserve, 7), 0);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Config::from_json(r#"{ "txn": { "commit_slots_per_thread": 0 } }"#).unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");

        let err = Config::from_json(r#"{ "arena": { "num_nodes": 0 } }"#).unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");

        let err = Config::from_json("not json").unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tierdb.json");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, r#"{{ "txn": {{ "max_threads": 4, "skip_pending": true }} }}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.txn.max_threads, 4);
        assert!(config.txn.skip_pending);

        let missing = Config::load(dir.path().join("absent.json")).unwrap_err();
        assert_eq!(missing.error_code(), "IO_ERROR");
    }
}

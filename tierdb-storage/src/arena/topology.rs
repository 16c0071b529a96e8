use std::fs;
use std::path::Path;

use tracing::debug;

pub(crate) const CXL_DEVICES_DIR: &str = "/sys/bus/cxl/devices";

/// Count CXL memory devices (`mem*`) under `dir`. At least one node is always reported.
pub(crate) fn detect_nodes(dir: &Path) -> usize {
    let count = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("mem"))
            .count(),
        Err(_) => 0,
    };
    debug!(dir = ?dir, devices = count, "Detected CXL topology");
    count.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_counts_mem_devices() {
        let dir = TempDir::new().unwrap();
        for name in ["mem0", "mem1", "mem2", "port0", "decoder0.0"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        assert_eq!(detect_nodes(dir.path()), 3);
    }

    #[test]
    fn test_falls_back_to_one_node() {
        let dir = TempDir::new().unwrap();
        assert_eq!(detect_nodes(dir.path()), 1);
        assert_eq!(detect_nodes(&dir.path().join("absent")), 1);
    }
}

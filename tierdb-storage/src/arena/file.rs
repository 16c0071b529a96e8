//! Page files: one regular file per page, named `<prefix><file_id>`.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, warn};

use tierdb_core::{Error, IoResultExt, Result};

use super::types::PAGE_SIZE;

pub(crate) fn page_path(dir: &Path, prefix: &str, file_id: usize) -> PathBuf {
    dir.join(format!("{}{}", prefix, file_id))
}

/// Create (or reopen) a page file sized to exactly one page and map it shared.
pub(crate) fn create_page_file(path: &Path) -> Result<MmapMut> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .io_context(|| format!("creating page file {:?}", path))?;

    let len = file
        .metadata()
        .io_context(|| format!("reading metadata of {:?}", path))?
        .len();
    if len != PAGE_SIZE as u64 {
        file.set_len(PAGE_SIZE as u64)
            .io_context(|| format!("sizing page file {:?}", path))?;
    }

    // SAFETY: the file is exactly PAGE_SIZE bytes and only the arena resizes it.
    let home = unsafe { MmapOptions::new().len(PAGE_SIZE).map_mut(&file) }
        .io_context(|| format!("mapping page file {:?}", path))?;
    Ok(home)
}

/// Open an existing page file for a fixed-address mapping.
pub(crate) fn open_page_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .io_context(|| format!("opening page file {:?}", path))
}

pub(crate) fn remove_page_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = ?path, error = %e, "Failed to remove page file");
    }
}

/// Remove every `<prefix>*` file in `dir`. Returns how many were removed.
pub(crate) fn clean_files(dir: &Path, prefix: &str) -> Result<usize> {
    let mut removed = 0;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(Error::Io {
                message: format!("listing {:?}: {}", dir, e),
                source: e,
            });
        }
    };

    for entry in entries {
        let entry = entry.io_context(|| format!("listing {:?}", dir))?;
        let name = entry.file_name();
        let is_page_file = name
            .to_str()
            .map(|n| n.starts_with(prefix))
            .unwrap_or(false);
        if is_page_file && entry.path().is_file() {
            fs::remove_file(entry.path())
                .io_context(|| format!("removing stale page file {:?}", entry.path()))?;
            removed += 1;
        }
    }

    debug!(dir = ?dir, removed, "Cleaned page files");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_page_file_is_one_page_and_persistent() {
        let dir = TempDir::new().unwrap();
        let path = page_path(dir.path(), "p_", 3);
        assert!(path.ends_with("p_3"));

        let mut home = create_page_file(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), PAGE_SIZE as u64);
        home[0..4].copy_from_slice(b"tier");
        home.flush().unwrap();
        drop(home);

        let home = create_page_file(&path).unwrap();
        assert_eq!(&home[0..4], b"tier");
    }

    #[test]
    fn test_clean_only_matching_prefix() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("p_0"), b"x").unwrap();
        fs::write(dir.path().join("p_1"), b"x").unwrap();
        fs::write(dir.path().join("other"), b"x").unwrap();

        assert_eq!(clean_files(dir.path(), "p_").unwrap(), 2);
        assert!(dir.path().join("other").exists());
        assert_eq!(clean_files(&dir.path().join("missing"), "p_").unwrap(), 0);
    }
}

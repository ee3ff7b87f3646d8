//! Durable file helpers shared by the archive writer, stores and restore
//!
//! Every replacement of a visible file goes through a sibling temp file
//! followed by a rename, so readers never observe partial content.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// fsync a directory so a rename inside it is durable
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    // Opening a directory for sync is not supported on Windows
    if cfg!(windows) {
        return Ok(());
    }
    OpenOptions::new().read(true).open(dir)?.sync_all()
}

/// Sibling temp path in the same directory as `target`
pub fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.tmp-{}", name, Uuid::new_v4().simple()))
}

/// Write `bytes` to `path` via temp-then-rename
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = temp_sibling(path);
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
        return result;
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fsync_dir(parent)?;
        }
    }
    Ok(())
}

/// Copy `src` to `dst` via temp-then-rename, creating parent directories
pub fn copy_atomic(src: &Path, dst: &Path) -> io::Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = temp_sibling(dst);
    let result: io::Result<u64> = (|| {
        let mut reader = File::open(src)?;
        let mut writer = File::create(&tmp)?;
        let copied = io::copy(&mut reader, &mut writer)?;
        writer.sync_all()?;
        fs::rename(&tmp, dst)?;
        Ok(copied)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Delete a file if present, ignoring errors
pub fn remove_quietly(path: &Path) -> bool {
    path.exists() && fs::remove_file(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_creates_parents_and_leaves_no_temp() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("records.json");

        atomic_write(&path, b"[]").unwrap();
        atomic_write(&path, b"[1]").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "[1]");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_copy_atomic() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("a.pdf");
        fs::write(&src, b"%PDF").unwrap();

        let dst = temp.path().join("out").join("clients").join("a.pdf");
        let copied = copy_atomic(&src, &dst).unwrap();

        assert_eq!(copied, 4);
        assert_eq!(fs::read(&dst).unwrap(), b"%PDF");
    }

    #[test]
    fn test_copy_atomic_missing_source_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let dst = temp.path().join("dst.bin");

        assert!(copy_atomic(&temp.path().join("missing"), &dst).is_err());
        assert!(!dst.exists());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_remove_quietly() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("partial.tar.gz");
        fs::write(&path, b"partial").unwrap();

        assert!(remove_quietly(&path));
        assert!(!path.exists());
        assert!(!remove_quietly(&path));
    }
}

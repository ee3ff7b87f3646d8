//! Archive extraction for restore
//!
//! - Extracts into a private directory under the work dir
//! - Only regular files and directories are accepted
//! - Absolute paths, `..` components and duplicate entries are rejected
//! - The directory is removed when the extraction is dropped

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use uuid::Uuid;

use super::errors::{RestoreError, RestoreResult};

/// An archive unpacked on disk
#[derive(Debug)]
pub struct ExtractedArchive {
    root: PathBuf,
    /// `/`-separated names of regular-file entries
    entries: BTreeSet<String>,
}

impl ExtractedArchive {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &BTreeSet<String> {
        &self.entries
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries.contains(entry)
    }

    /// Location of an entry on disk
    pub fn path_of(&self, entry: &str) -> PathBuf {
        entry
            .split('/')
            .fold(self.root.clone(), |path, part| path.join(part))
    }
}

impl Drop for ExtractedArchive {
    fn drop(&mut self) {
        cleanup_temp_dir(&self.root);
    }
}

/// Unpack `archive_path` into a fresh directory below `work_dir`
pub fn extract_archive(archive_path: &Path, work_dir: &Path) -> RestoreResult<ExtractedArchive> {
    let file = File::open(archive_path).map_err(|e| {
        RestoreError::invalid_archive_io(
            format!("Failed to open backup archive: {}", archive_path.display()),
            e,
        )
    })?;

    let root = work_dir.join(format!(".restore-{}", Uuid::new_v4()));
    fs::create_dir_all(&root).map_err(|e| {
        RestoreError::io_error(
            format!("Failed to create restore directory: {}", root.display()),
            e,
        )
    })?;
    let mut extracted = ExtractedArchive {
        root,
        entries: BTreeSet::new(),
    };

    let mut archive = Archive::new(GzDecoder::new(file));
    let entries = archive.entries().map_err(|e| {
        RestoreError::invalid_archive_io(
            format!("Failed to read backup archive: {}", archive_path.display()),
            e,
        )
    })?;

    for entry in entries {
        let mut entry = entry.map_err(|e| {
            RestoreError::invalid_archive_io("Corrupt entry in backup archive", e)
        })?;
        let raw = entry
            .path()
            .map_err(|e| RestoreError::invalid_archive_io("Unreadable entry name", e))?
            .into_owned();
        let name = safe_entry_name(&raw)?;

        match entry.header().entry_type() {
            EntryType::Directory => {
                let dir = extracted.path_of(&name);
                fs::create_dir_all(&dir).map_err(|e| RestoreError::io_error_at_path(&dir, e))?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if !extracted.entries.insert(name.clone()) {
                    return Err(RestoreError::invalid_archive(format!(
                        "Duplicate archive entry: {}",
                        name
                    )));
                }
                let dest = extracted.path_of(&name);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| RestoreError::io_error_at_path(parent, e))?;
                }
                entry.unpack(&dest).map_err(|e| {
                    RestoreError::invalid_archive_io(format!("Failed to extract {}", name), e)
                })?;
            }
            other => {
                return Err(RestoreError::invalid_archive(format!(
                    "Unsupported entry type {:?} for {}",
                    other, name
                )))
            }
        }
    }

    Ok(extracted)
}

/// Normalized `/`-separated entry name, or an error for unsafe paths
fn safe_entry_name(path: &Path) -> RestoreResult<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(RestoreError::invalid_archive(format!(
                    "Unsafe path in archive: {}",
                    path.display()
                )))
            }
        }
    }
    if parts.is_empty() {
        return Err(RestoreError::invalid_archive("Empty entry name in archive"));
    }
    Ok(parts.join("/"))
}

pub fn cleanup_temp_dir(dir: &Path) {
    if !dir.as_os_str().is_empty() && dir.exists() {
        let _ = fs::remove_dir_all(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::RestoreErrorCode;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tar::{Builder, Header};
    use tempfile::TempDir;

    fn archive_with(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, data) in entries {
            let mut header = Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(EntryType::Regular);
            // set_path refuses `..`; write the raw name for hostile fixtures
            let bytes = name.as_bytes();
            header.as_old_mut().name[..bytes.len()].copy_from_slice(bytes);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_extract_and_cleanup_on_drop() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("b.tar.gz");
        archive_with(
            &archive,
            &[
                ("client.json", b"[]"),
                ("uploads/clients/1/id.pdf", b"pdf"),
                ("backup_manifest.json", b"{}"),
            ],
        );

        let extracted = extract_archive(&archive, temp.path()).unwrap();
        let root = extracted.root().to_path_buf();
        assert!(extracted.contains("uploads/clients/1/id.pdf"));
        assert_eq!(
            fs::read(extracted.path_of("uploads/clients/1/id.pdf")).unwrap(),
            b"pdf"
        );
        assert_eq!(extracted.entries().len(), 3);

        drop(extracted);
        assert!(!root.exists());
    }

    #[test]
    fn test_rejects_parent_dir_entries() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("evil.tar.gz");
        archive_with(&archive, &[("../escape.txt", b"x")]);

        let err = extract_archive(&archive, temp.path()).unwrap_err();
        assert_eq!(err.code(), RestoreErrorCode::InvalidArchive);
        assert!(!temp.path().parent().unwrap().join("escape.txt").exists());
    }

    #[test]
    fn test_rejects_duplicates() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("dup.tar.gz");
        archive_with(&archive, &[("a.json", b"1"), ("a.json", b"2")]);

        let err = extract_archive(&archive, temp.path()).unwrap_err();
        assert!(err.message().contains("Duplicate"));
    }

    #[test]
    fn test_not_gzip_is_invalid_archive() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("plain.tar.gz");
        fs::write(&archive, b"definitely not gzip").unwrap();

        let err = extract_archive(&archive, temp.path()).unwrap_err();
        assert_eq!(err.code(), RestoreErrorCode::InvalidArchive);
    }

    #[test]
    fn test_missing_archive() {
        let temp = TempDir::new().unwrap();
        assert!(extract_archive(&temp.path().join("nope.tar.gz"), temp.path()).is_err());
    }
}

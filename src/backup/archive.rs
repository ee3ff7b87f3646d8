//! Compressed archive writer
//!
//! - gzip-compressed tar
//! - Entries: `<table>.json` per table in dump order, `uploads/<path>` per
//!   uploaded file in sorted order, `backup_manifest.json` last
//! - Written to `<archive>.partial`, fsynced, checksummed, then renamed
//! - A `.sha256` sidecar records the checksum next to the archive
//! - Any failure removes the partial file
//! - Upload entries are sized from the open handle and copied exactly
//!   that many bytes; a file that shrinks mid-copy fails the backup

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::DateTime;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder, Header};

use super::checksum::{self, HashingReader};
use super::dumper::TableDump;
use super::errors::{BackupError, BackupResult};
use super::manifest::{BackupManifest, UploadEntry, UPLOADS_PREFIX};
use crate::config::MANIFEST_ENTRY;
use crate::fs_util;

/// A regular file under the uploads directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    /// `/`-separated path relative to the uploads root
    pub relative: String,
    pub path: PathBuf,
    pub size: u64,
}

/// The finished archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOutput {
    pub path: PathBuf,
    pub size: u64,
    pub checksum: String,
    pub uploaded_files_count: u64,
    pub uploaded_files_size: u64,
}

pub struct ArchiveWriter;

impl ArchiveWriter {
    /// Package `dumps` and `uploads` into `output_path`.
    ///
    /// Fills `manifest.uploads` as files are streamed in, so the manifest
    /// is appended after them.
    pub fn write(
        manifest: &mut BackupManifest,
        dumps: &[TableDump],
        uploads: &[UploadFile],
        output_path: &Path,
    ) -> BackupResult<ArchiveOutput> {
        let partial = partial_path(output_path);

        let result = Self::write_inner(manifest, dumps, uploads, output_path, &partial);
        if result.is_err() {
            cleanup_partial_archive(&partial);
            cleanup_partial_archive(output_path);
            cleanup_partial_archive(&checksum::sidecar_path(output_path));
        }
        result
    }

    fn write_inner(
        manifest: &mut BackupManifest,
        dumps: &[TableDump],
        uploads: &[UploadFile],
        output_path: &Path,
        partial: &Path,
    ) -> BackupResult<ArchiveOutput> {
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                BackupError::archive_write(
                    format!("Failed to create backup directory: {}", parent.display()),
                    e,
                )
            })?;
        }

        let mtime = DateTime::parse_from_rfc3339(&manifest.created_at)
            .map(|ts| ts.timestamp().max(0) as u64)
            .unwrap_or(0);

        let file = File::create(partial).map_err(|e| {
            BackupError::archive_write(
                format!("Failed to create archive file: {}", partial.display()),
                e,
            )
        })?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = Builder::new(encoder);

        for dump in dumps {
            let name = super::manifest::table_entry_name(dump.table());
            let mut source = File::open(&dump.path)
                .map_err(|e| BackupError::io_error_at_path(&dump.path, e))?;
            append_entry(&mut builder, &name, dump.bytes, mtime, &mut source)?;
        }

        manifest.uploads.files.clear();
        for upload in uploads {
            let name = format!("{}{}", UPLOADS_PREFIX, upload.relative);
            let file = File::open(&upload.path)
                .map_err(|e| BackupError::io_error_at_path(&upload.path, e))?;
            // The uploads tree is live; size the entry from what is open now
            let size = file
                .metadata()
                .map_err(|e| BackupError::io_error_at_path(&upload.path, e))?
                .len();
            let (sha256, size) = append_exact(&mut builder, &name, size, mtime, file)?;
            manifest.uploads.files.push(UploadEntry {
                path: upload.relative.clone(),
                size,
                sha256,
            });
        }
        manifest.uploads.file_count = manifest.uploads.files.len() as u64;
        manifest.uploads.total_size = manifest.uploads.files.iter().map(|f| f.size).sum();

        let manifest_json = manifest.to_json()?;
        append_entry(
            &mut builder,
            MANIFEST_ENTRY,
            manifest_json.len() as u64,
            mtime,
            &mut manifest_json.as_bytes(),
        )?;

        let encoder = builder
            .into_inner()
            .map_err(|e| BackupError::archive_write("Failed to finish archive", e))?;
        let buffered = encoder
            .finish()
            .map_err(|e| BackupError::archive_write("Failed to finish compression", e))?;
        let file = buffered.into_inner().map_err(|e| {
            BackupError::archive_write("Failed to flush archive buffer", e.into_error())
        })?;
        file.sync_all().map_err(|e| {
            BackupError::archive_write(format!("Failed to fsync archive: {}", partial.display()), e)
        })?;
        drop(file);

        let checksum = checksum::sha256_file(partial)
            .map_err(|e| BackupError::archive_write("Failed to checksum archive", e))?;
        let size = fs::metadata(partial)
            .map_err(|e| BackupError::archive_write("Failed to stat archive", e))?
            .len();

        fs::rename(partial, output_path).map_err(|e| {
            BackupError::archive_write(
                format!("Failed to move archive into place: {}", output_path.display()),
                e,
            )
        })?;
        fs_util::atomic_write(
            &checksum::sidecar_path(output_path),
            checksum::sidecar_contents(&checksum, output_path).as_bytes(),
        )
        .map_err(|e| BackupError::archive_write("Failed to write checksum file", e))?;

        Ok(ArchiveOutput {
            path: output_path.to_path_buf(),
            size,
            checksum,
            uploaded_files_count: manifest.uploads.file_count,
            uploaded_files_size: manifest.uploads.total_size,
        })
    }
}

fn append_entry<W: Write, R: io::Read>(
    builder: &mut Builder<W>,
    name: &str,
    size: u64,
    mtime: u64,
    data: &mut R,
) -> BackupResult<()> {
    let mut header = Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header.set_entry_type(tar::EntryType::Regular);
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| BackupError::archive_write(format!("Failed to add {} to archive", name), e))
}

/// Append exactly `size` bytes of `source` under `name`.
///
/// Returns the SHA-256 and length of what was written. Fewer bytes than
/// the header announced would shift every later entry, so that is an
/// error rather than a short entry.
fn append_exact<W: Write, R: Read>(
    builder: &mut Builder<W>,
    name: &str,
    size: u64,
    mtime: u64,
    source: R,
) -> BackupResult<(String, u64)> {
    let mut reader = HashingReader::new(source.take(size));
    append_entry(builder, name, size, mtime, &mut reader)?;
    let (sha256, copied) = reader.finish();
    if copied != size {
        return Err(BackupError::archive_write_msg(format!(
            "{} changed while being archived: expected {} bytes, read {}",
            name, size, copied
        )));
    }
    Ok((sha256, copied))
}

/// Where the archive is written before it is renamed into place
pub fn partial_path(output_path: &Path) -> PathBuf {
    let mut name = output_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    output_path.with_file_name(name)
}

/// Delete a partial archive if it exists
pub fn cleanup_partial_archive(path: &Path) {
    if fs_util::remove_quietly(path) {
        crate::observability::log_event(
            crate::observability::Event::PartialArchiveRemoved,
            &[("path", &path.display().to_string())],
        );
    }
}

/// Every regular file below `root`, sorted by relative path.
///
/// A missing root yields no files. Symlinks are skipped, and so are
/// names that are not valid UTF-8, since the archive could not restore
/// them under the same name.
pub fn collect_upload_files(root: &Path) -> BackupResult<Vec<UploadFile>> {
    let mut files = Vec::new();
    if root.is_dir() {
        collect_recursive(root, "", &mut files)?;
    }
    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

fn collect_recursive(dir: &Path, prefix: &str, files: &mut Vec<UploadFile>) -> BackupResult<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .map_err(|e| BackupError::io_error_at_path(dir, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BackupError::io_error_at_path(dir, e))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| BackupError::io_error_at_path(&path, e))?;
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                crate::observability::log_event(
                    crate::observability::Event::UploadSkipped,
                    &[
                        ("path", &path.display().to_string()),
                        ("reason", &format!("file name is not UTF-8: {:?}", raw)),
                    ],
                );
                continue;
            }
        };
        let relative = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };

        if file_type.is_dir() {
            collect_recursive(&path, &relative, files)?;
        } else if file_type.is_file() {
            let size = entry
                .metadata()
                .map_err(|e| BackupError::io_error_at_path(&path, e))?
                .len();
            files.push(UploadFile {
                relative,
                path,
                size,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::manifest::TableEntry;
    use crate::backup::BackupErrorCode;
    use crate::database::{ColumnKind, TableSchema};
    use crate::scope::{BackupScope, TableGroup};
    use chrono::{TimeZone, Utc};
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tar::Archive;
    use tempfile::TempDir;

    fn staged_dump(dir: &Path, table: &str, body: &str) -> TableDump {
        let path = dir.join(format!("{}.json", table));
        fs::write(&path, body).unwrap();
        TableDump {
            schema: TableSchema::new(table, "id", ColumnKind::Integer),
            row_count: 1,
            sha256: checksum::sha256_bytes(body.as_bytes()),
            path,
            bytes: body.len() as u64,
        }
    }

    fn manifest_for(dumps: &[TableDump], scope: BackupScope) -> BackupManifest {
        let created = Utc.with_ymd_and_hms(2026, 2, 4, 16, 30, 0).unwrap();
        let mut manifest = BackupManifest::new("id", "test", scope, created, "2.0.0", "1");
        for d in dumps {
            manifest.tables.push(TableEntry {
                schema: d.schema.clone(),
                group: TableGroup::Settings,
                row_count: d.row_count,
                sha256: d.sha256.clone(),
            });
        }
        manifest
    }

    fn entry_names(path: &Path) -> Vec<String> {
        let mut archive = Archive::new(GzDecoder::new(File::open(path).unwrap()));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_archive_entries_and_sidecar() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("staging");
        fs::create_dir_all(&staging).unwrap();
        let dumps = vec![staged_dump(&staging, "email_template", "[\n{\"id\":1}\n]\n")];
        let mut manifest = manifest_for(&dumps, BackupScope::Settings);

        let out_path = temp.path().join("out").join("backup.tar.gz");
        let output = ArchiveWriter::write(&mut manifest, &dumps, &[], &out_path).unwrap();

        assert_eq!(entry_names(&out_path), vec!["email_template.json", "backup_manifest.json"]);
        assert_eq!(output.checksum, checksum::sha256_file(&out_path).unwrap());
        assert_eq!(checksum::read_sidecar(&out_path), Some(output.checksum.clone()));
        assert_eq!(output.size, fs::metadata(&out_path).unwrap().len());
        assert!(!partial_path(&out_path).exists());
    }

    #[test]
    fn test_uploads_are_mirrored_with_checksums() {
        let temp = TempDir::new().unwrap();
        let uploads = temp.path().join("uploads");
        fs::create_dir_all(uploads.join("clients").join("7")).unwrap();
        fs::write(uploads.join("clients").join("7").join("passport.pdf"), b"pdf-bytes").unwrap();
        fs::write(uploads.join("logo.png"), b"png").unwrap();

        let files = collect_upload_files(&uploads).unwrap();
        assert_eq!(
            files.iter().map(|f| f.relative.as_str()).collect::<Vec<_>>(),
            vec!["clients/7/passport.pdf", "logo.png"]
        );

        let mut manifest = manifest_for(&[], BackupScope::Full);
        let out_path = temp.path().join("full.tar.gz");
        let output = ArchiveWriter::write(&mut manifest, &[], &files, &out_path).unwrap();

        assert_eq!(output.uploaded_files_count, 2);
        assert_eq!(output.uploaded_files_size, 12);
        assert_eq!(manifest.uploads.files[0].sha256, checksum::sha256_bytes(b"pdf-bytes"));

        let names = entry_names(&out_path);
        assert!(names.contains(&"uploads/clients/7/passport.pdf".to_string()));
        assert!(names.contains(&"uploads/logo.png".to_string()));

        let mut archive = Archive::new(GzDecoder::new(File::open(&out_path).unwrap()));
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().to_string_lossy() == "uploads/logo.png" {
                let mut body = Vec::new();
                entry.read_to_end(&mut body).unwrap();
                assert_eq!(body, b"png");
            }
        }
    }

    #[test]
    fn test_archive_deterministic() {
        let temp = TempDir::new().unwrap();
        let dumps = vec![staged_dump(temp.path(), "tag", "[]\n")];

        let a = temp.path().join("a.tar.gz");
        let b = temp.path().join("b.tar.gz");
        let out_a = ArchiveWriter::write(&mut manifest_for(&dumps, BackupScope::Settings), &dumps, &[], &a).unwrap();
        let out_b = ArchiveWriter::write(&mut manifest_for(&dumps, BackupScope::Settings), &dumps, &[], &b).unwrap();
        assert_eq!(out_a.checksum, out_b.checksum);
    }

    #[test]
    fn test_failure_removes_partial_archive() {
        let temp = TempDir::new().unwrap();
        let mut dumps = vec![staged_dump(temp.path(), "tag", "[]\n")];
        // The staged file vanished before packaging
        fs::remove_file(&dumps[0].path).unwrap();
        dumps[0].path = temp.path().join("missing.json");

        let out_path = temp.path().join("broken.tar.gz");
        let err = ArchiveWriter::write(&mut manifest_for(&dumps, BackupScope::Settings), &dumps, &[], &out_path)
            .unwrap_err();

        assert_eq!(err.code(), BackupErrorCode::Io);
        assert!(!out_path.exists());
        assert!(!partial_path(&out_path).exists());
        assert!(!checksum::sidecar_path(&out_path).exists());
    }

    #[test]
    fn test_unwritable_destination_is_archive_write_error() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, b"file").unwrap();

        let out_path = blocker.join("backup.tar.gz");
        let err = ArchiveWriter::write(&mut manifest_for(&[], BackupScope::Settings), &[], &[], &out_path)
            .unwrap_err();
        assert_eq!(err.code(), BackupErrorCode::ArchiveWrite);
        assert!(!out_path.exists());
    }

    #[test]
    fn test_cleanup_partial_archive() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("partial.tar.gz.partial");
        fs::write(&path, b"partial").unwrap();

        cleanup_partial_archive(&path);
        assert!(!path.exists());

        // Missing file is fine
        cleanup_partial_archive(&path);
    }

    #[test]
    fn test_upload_changed_after_enumeration_stays_readable() {
        let temp = TempDir::new().unwrap();
        let uploads = temp.path().join("uploads");
        fs::create_dir_all(&uploads).unwrap();
        fs::write(uploads.join("a.pdf"), b"first").unwrap();
        fs::write(uploads.join("b.pdf"), b"second").unwrap();
        let files = collect_upload_files(&uploads).unwrap();

        // A client keeps writing to a.pdf after the listing
        let grown = vec![b'x'; 2000];
        fs::write(uploads.join("a.pdf"), &grown).unwrap();

        let mut manifest = manifest_for(&[], BackupScope::Full);
        let out_path = temp.path().join("live.tar.gz");
        let output = ArchiveWriter::write(&mut manifest, &[], &files, &out_path).unwrap();
        assert_eq!(output.uploaded_files_size, 2000 + 6);
        assert_eq!(manifest.uploads.files[0].size, 2000);
        assert_eq!(manifest.uploads.files[0].sha256, checksum::sha256_bytes(&grown));

        let mut archive = Archive::new(GzDecoder::new(File::open(&out_path).unwrap()));
        let mut bodies = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            let mut body = Vec::new();
            entry.read_to_end(&mut body).unwrap();
            bodies.push((name, body));
        }
        assert_eq!(bodies[0], ("uploads/a.pdf".to_string(), grown));
        assert_eq!(bodies[1], ("uploads/b.pdf".to_string(), b"second".to_vec()));
        assert_eq!(bodies[2].0, MANIFEST_ENTRY);
    }

    #[test]
    fn test_short_read_is_archive_write_error() {
        let mut builder = Builder::new(Vec::new());
        let err = append_exact(&mut builder, "uploads/a.pdf", 10, 0, &b"four"[..]).unwrap_err();
        assert_eq!(err.code(), BackupErrorCode::ArchiveWrite);
        assert!(err.to_string().contains("changed while being archived"));

        // A longer source is cut at the announced size
        let mut builder = Builder::new(Vec::new());
        let (_, copied) = append_exact(&mut builder, "uploads/b.pdf", 3, 0, &b"abcdef"[..]).unwrap();
        assert_eq!(copied, 3);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_upload_names_are_skipped() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp = TempDir::new().unwrap();
        let uploads = temp.path().join("uploads");
        fs::create_dir_all(&uploads).unwrap();
        fs::write(uploads.join(OsStr::from_bytes(b"scan-\xff.pdf")), b"raw").unwrap();
        fs::write(uploads.join("ok.pdf"), b"ok").unwrap();

        let files = collect_upload_files(&uploads).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative, "ok.pdf");
    }

    #[test]
    fn test_missing_uploads_dir_is_empty() {
        let temp = TempDir::new().unwrap();
        assert!(collect_upload_files(&temp.path().join("nope")).unwrap().is_empty());
    }
}

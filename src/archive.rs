/// Zip archives of the asset directory.
///
/// The asset tree is shipped as a single deflate-compressed zip whose
/// entries are the paths relative to the archived directory, using `/`
/// separators. Extraction refuses entries that would land outside the
/// destination directory.
///
/// These functions block; async callers run them on the blocking pool.
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{BackupError, Result};

/// Summary of a written archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub files: usize,
    /// Size of the archive file itself.
    pub compressed_size: u64,
}

/// Write every file and directory under `source_dir` into a zip at
/// `archive_path`, replacing any existing file there.
pub fn archive_directory(source_dir: &Path, archive_path: &Path) -> Result<ArchiveInfo> {
    if !source_dir.is_dir() {
        return Err(BackupError::Archive(format!(
            "source directory {} does not exist",
            source_dir.display()
        )));
    }

    let output = File::create(archive_path).map_err(|e| {
        BackupError::Archive(format!("cannot create {}: {e}", archive_path.display()))
    })?;
    let mut zip = ZipWriter::new(BufWriter::new(output));
    let file_options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);
    let dir_options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    let mut files = 0usize;
    for entry in WalkDir::new(source_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| BackupError::Archive(format!("walk failed: {e}")))?;
        let path = entry.path();

        // Skip the archive itself when it is written inside the source tree.
        if path == archive_path {
            continue;
        }

        let name = relative_name(source_dir, path)?;
        if entry.file_type().is_dir() {
            zip.add_directory(name, dir_options.clone())?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, file_options.clone())?;
            let mut reader = BufReader::new(File::open(path).map_err(|e| {
                BackupError::Archive(format!("cannot read {}: {e}", path.display()))
            })?);
            io::copy(&mut reader, &mut zip)
                .map_err(|e| BackupError::Archive(format!("cannot archive {}: {e}", path.display())))?;
            files += 1;
        } else {
            warn!(path = %path.display(), "Skipping non-regular file");
        }
    }

    zip.finish()?;
    let compressed_size = fs::metadata(archive_path)
        .map_err(|e| BackupError::Archive(e.to_string()))?
        .len();

    debug!(
        source = %source_dir.display(),
        files,
        bytes = compressed_size,
        "Archive written"
    );

    Ok(ArchiveInfo {
        path: archive_path.to_path_buf(),
        files,
        compressed_size,
    })
}

/// Check that `archive_path` is a readable zip without extracting it.
pub fn verify_archive(archive_path: &Path) -> Result<usize> {
    let file = File::open(archive_path).map_err(|e| {
        BackupError::Archive(format!("cannot open {}: {e}", archive_path.display()))
    })?;
    let archive = ZipArchive::new(BufReader::new(file))?;
    Ok(archive.len())
}

/// Unpack `archive_path` into `dest_dir`, which must already exist.
/// Existing files with the same relative path are overwritten; nothing
/// else in `dest_dir` is touched. Returns the number of files written.
pub fn extract_archive(archive_path: &Path, dest_dir: &Path) -> Result<usize> {
    if !dest_dir.is_dir() {
        return Err(BackupError::Archive(format!(
            "destination directory {} does not exist",
            dest_dir.display()
        )));
    }

    let file = File::open(archive_path).map_err(|e| {
        BackupError::Archive(format!("cannot open {}: {e}", archive_path.display()))
    })?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;

    let mut files = 0usize;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let relative = entry.enclosed_name().ok_or_else(|| {
            BackupError::Archive(format!("entry {} escapes the destination", entry.name()))
        })?;
        let target = dest_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| extract_error(&target, e))?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| extract_error(parent, e))?;
        }
        let mut out = BufWriter::new(File::create(&target).map_err(|e| extract_error(&target, e))?);
        // A truncated or corrupt member surfaces here as a read error.
        io::copy(&mut entry, &mut out).map_err(|e| {
            BackupError::Archive(format!("corrupt entry {}: {e}", entry.name()))
        })?;
        files += 1;
    }

    Ok(files)
}

fn extract_error(path: &Path, err: io::Error) -> BackupError {
    BackupError::Archive(format!("cannot write {}: {err}", path.display()))
}

/// Zip entry name of `path` relative to `base`.
fn relative_name(base: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(base)
        .map_err(|e| BackupError::Archive(e.to_string()))?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(path: &Path, bytes: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_archive_and_extract_preserves_tree() {
        let src = tempfile::tempdir().unwrap();
        write(&src.path().join("w300/a.webp"), &[1u8; 2048]);
        write(&src.path().join("w780/a.webp"), &[2u8; 5120]);
        fs::create_dir_all(src.path().join("w1280")).unwrap();

        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("uploads.zip");
        let info = archive_directory(src.path(), &archive).unwrap();
        assert_eq!(info.files, 2);
        assert!(info.compressed_size > 0);

        let dest = tempfile::tempdir().unwrap();
        let written = extract_archive(&archive, dest.path()).unwrap();
        assert_eq!(written, 2);
        assert_eq!(fs::read(dest.path().join("w300/a.webp")).unwrap(), vec![1u8; 2048]);
        assert_eq!(fs::read(dest.path().join("w780/a.webp")).unwrap(), vec![2u8; 5120]);
        assert!(dest.path().join("w1280").is_dir());
    }

    #[test]
    fn test_entry_names_use_forward_slashes() {
        let src = tempfile::tempdir().unwrap();
        write(&src.path().join("w300/nested/b.webp"), b"x");

        let out = tempfile::tempdir().unwrap();
        let archive_path = out.path().join("a.zip");
        archive_directory(src.path(), &archive_path).unwrap();

        let mut archive = ZipArchive::new(File::open(&archive_path).unwrap()).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"w300/nested/b.webp".to_string()));
    }

    #[test]
    fn test_archive_overwrites_existing_target() {
        let src = tempfile::tempdir().unwrap();
        write(&src.path().join("a.webp"), b"new");

        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("uploads.zip");
        fs::write(&archive, b"stale bytes that are not a zip").unwrap();

        archive_directory(src.path(), &archive).unwrap();
        assert_eq!(verify_archive(&archive).unwrap(), 1);
    }

    #[test]
    fn test_missing_source_is_archive_error() {
        let out = tempfile::tempdir().unwrap();
        let err = archive_directory(&out.path().join("nope"), &out.path().join("a.zip")).unwrap_err();
        assert!(matches!(err, BackupError::Archive(_)));
    }

    #[test]
    fn test_corrupt_archive_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"PK\x03\x04 definitely not a complete zip").unwrap();

        assert!(matches!(verify_archive(&archive), Err(BackupError::Archive(_))));
        let dest = tempfile::tempdir().unwrap();
        assert!(matches!(
            extract_archive(&archive, dest.path()),
            Err(BackupError::Archive(_))
        ));
    }

    #[test]
    fn test_truncated_archive_is_rejected() {
        let src = tempfile::tempdir().unwrap();
        write(&src.path().join("big.bin"), &vec![9u8; 64 * 1024]);
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("a.zip");
        archive_directory(src.path(), &archive).unwrap();

        let bytes = fs::read(&archive).unwrap();
        fs::write(&archive, &bytes[..bytes.len() / 2]).unwrap();

        let dest = tempfile::tempdir().unwrap();
        assert!(extract_archive(&archive, dest.path()).is_err());
    }

    #[test]
    fn test_extract_requires_existing_destination() {
        let src = tempfile::tempdir().unwrap();
        write(&src.path().join("a.webp"), b"a");
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("a.zip");
        archive_directory(src.path(), &archive).unwrap();

        let err = extract_archive(&archive, &out.path().join("missing")).unwrap_err();
        assert!(matches!(err, BackupError::Archive(_)));
    }

    #[test]
    fn test_extract_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("evil.zip");
        {
            let mut zip = ZipWriter::new(File::create(&archive_path).unwrap());
            zip.start_file("../escaped.txt", SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"gotcha").unwrap();
            zip.finish().unwrap();
        }

        let dest = dir.path().join("dest");
        fs::create_dir_all(&dest).unwrap();
        assert!(extract_archive(&archive_path, &dest).is_err());
        assert!(!dir.path().join("escaped.txt").exists());
    }
}

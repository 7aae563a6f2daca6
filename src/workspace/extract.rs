//! Snapshot extraction.
//!
//! Repository tarballs wrap the tree in one top-level directory
//! (`owner-repo-<sha>/`). The archive is spooled and unpacked inside a
//! staging directory, the single wrapper is located, and its children are
//! moved into the workspace root. Zero or several top-level entries are
//! rejected. The staging directory is a `TempDir`, so it is removed on every
//! exit path.

use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{FetchError, SyncError};
use crate::source::SnapshotArchive;

const SPOOL_BUFFER_BYTES: usize = 64 * 1024;

/// Spool, unpack and move a snapshot into `workspace`. Returns the number of
/// top-level entries placed in the workspace.
pub async fn extract_snapshot(
    archive: SnapshotArchive,
    staging_root: &Path,
    workspace: &Path,
) -> Result<usize, SyncError> {
    tokio::fs::create_dir_all(staging_root).await?;
    let staging = tempfile::Builder::new()
        .prefix(".snapshot-")
        .tempdir_in(staging_root)?;
    log::debug!("[Sync] [EXTRACT] Staging {} in {}", archive.origin, staging.path().display());

    let spool_path = staging.path().join("snapshot.tar.gz");
    let spooled = spool_archive(archive, &spool_path).await?;
    log::info!("[Sync] [EXTRACT] Downloaded snapshot ({} bytes)", spooled);

    let workspace = workspace.to_path_buf();
    // The TempDir moves into the blocking task and is dropped there.
    tokio::task::spawn_blocking(move || unpack_and_install(staging, &spool_path, &workspace))
        .await
        .map_err(|e| SyncError::ExtractionFailed(format!("extraction task failed: {}", e)))?
}

/// Copy the archive stream to disk with a bounded buffer.
///
/// Read errors come from the transport; write errors are local I/O.
async fn spool_archive(archive: SnapshotArchive, dest: &Path) -> Result<u64, SyncError> {
    let mut reader = archive.into_reader();
    let mut file = tokio::fs::File::create(dest).await?;
    let mut buf = vec![0u8; SPOOL_BUFFER_BYTES];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await.map_err(|e| {
            SyncError::Fetch(FetchError::TransportFailure(format!(
                "snapshot stream interrupted: {}",
                e
            )))
        })?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    file.flush().await?;
    Ok(total)
}

fn unpack_and_install(staging: TempDir, spool_path: &Path, workspace: &Path) -> Result<usize, SyncError> {
    let tree = staging.path().join("tree");
    std::fs::create_dir(&tree)?;

    unpack_archive(spool_path, &tree)?;
    let wrapper = single_top_level_dir(&tree)?;
    let moved = move_children(&wrapper, workspace)?;

    drop(staging);
    Ok(moved)
}

fn unpack_archive(archive_path: &Path, dest: &Path) -> Result<(), SyncError> {
    let extraction = |e: io::Error| SyncError::ExtractionFailed(e.to_string());

    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.set_preserve_permissions(true);

    for entry in archive.entries().map_err(extraction)? {
        let mut entry = entry.map_err(extraction)?;
        if entry.header().entry_type() == EntryType::XGlobalHeader {
            continue;
        }
        // unpack_in refuses entries that would escape `dest`.
        let inside = entry.unpack_in(dest).map_err(extraction)?;
        if !inside {
            let path = entry.path().map(|p| p.display().to_string()).unwrap_or_default();
            return Err(SyncError::ExtractionFailed(format!(
                "archive entry escapes extraction root: {}",
                path
            )));
        }
    }
    Ok(())
}

/// The archive must contain exactly one top-level entry, and it must be a directory.
fn single_top_level_dir(tree: &Path) -> Result<PathBuf, SyncError> {
    let entries: Vec<PathBuf> = std::fs::read_dir(tree)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()?;

    match entries.as_slice() {
        [only] if only.is_dir() => Ok(only.clone()),
        [only] => Err(SyncError::ExtractionFailed(format!(
            "top-level archive entry is not a directory: {}",
            only.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
        ))),
        [] => Err(SyncError::ExtractionFailed("archive is empty".to_string())),
        many => Err(SyncError::ExtractionFailed(format!(
            "expected one top-level directory, found {} entries",
            many.len()
        ))),
    }
}

/// Move every child of `from` into `to`. Falls back to copy when a rename
/// crosses filesystems.
fn move_children(from: &Path, to: &Path) -> Result<usize, SyncError> {
    let mut moved = 0;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if std::fs::rename(entry.path(), &dest).is_err() {
            copy_recursive(&entry.path(), &dest)?;
        }
        moved += 1;
    }
    Ok(moved)
}

fn copy_recursive(from: &Path, to: &Path) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(from)?;
    if meta.file_type().is_symlink() {
        let target = std::fs::read_link(from)?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(target, to)?;
        #[cfg(not(unix))]
        let _ = target;
    } else if meta.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        std::fs::copy(from, to)?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    /// Build an in-memory gzip tar from `(path, contents)` pairs. Paths ending
    /// in `/` become directories.
    pub(crate) fn tarball(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
        for (path, contents) in entries {
            let mut header = tar::Header::new_gnu();
            if path.ends_with('/') {
                header.set_entry_type(EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                header.set_cksum();
                builder.append_data(&mut header, path, io::empty()).unwrap();
            } else {
                header.set_mode(0o644);
                header.set_size(contents.len() as u64);
                header.set_cksum();
                builder
                    .append_data(&mut header, path, contents.as_bytes())
                    .unwrap();
            }
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    pub(crate) fn firmware_tarball(wrapper: &str) -> Vec<u8> {
        let ini = format!("{}/platformio.ini", wrapper);
        let csv = format!("{}/partitions_custom.csv", wrapper);
        let src = format!("{}/src/", wrapper);
        let main = format!("{}/src/main.cpp", wrapper);
        tarball(&[
            (ini.as_str(), "[env:staging]\nplatform = espressif32\n"),
            (csv.as_str(), "nvs, data, nvs, 0x9000, 0x5000\n"),
            (src.as_str(), ""),
            (main.as_str(), "#include \"user_code.h\"\n"),
        ])
    }

    async fn extract(bytes: Vec<u8>, temp: &TempDir) -> Result<usize, SyncError> {
        let ws = temp.path().join("workspace");
        std::fs::create_dir_all(&ws).unwrap();
        extract_snapshot(
            SnapshotArchive::from_bytes("test", bytes),
            &temp.path().join("staging"),
            &ws,
        )
        .await
    }

    #[tokio::test]
    async fn test_wrapper_directory_is_stripped() {
        let temp = TempDir::new().unwrap();
        let moved = extract(firmware_tarball("bluedotrobots-pip-bot-firmware-abc123"), &temp)
            .await
            .unwrap();

        let ws = temp.path().join("workspace");
        assert_eq!(moved, 3);
        assert!(ws.join("platformio.ini").is_file());
        assert!(ws.join("src/main.cpp").is_file());
        assert!(!ws.join("bluedotrobots-pip-bot-firmware-abc123").exists());
    }

    #[tokio::test]
    async fn test_staging_is_removed_after_success_and_failure() {
        let temp = TempDir::new().unwrap();
        extract(firmware_tarball("wrap"), &temp).await.unwrap();
        let _ = extract(tarball(&[("a.txt", "x"), ("b.txt", "y")]), &temp).await;

        let leftovers = std::fs::read_dir(temp.path().join("staging")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_multiple_top_level_entries_rejected() {
        let temp = TempDir::new().unwrap();
        let result = extract(tarball(&[("one/a.txt", "x"), ("two/b.txt", "y")]), &temp).await;
        assert!(matches!(result, Err(SyncError::ExtractionFailed(_))));
    }

    #[tokio::test]
    async fn test_single_file_top_level_rejected() {
        let temp = TempDir::new().unwrap();
        let result = extract(tarball(&[("platformio.ini", "x")]), &temp).await;
        assert!(matches!(result, Err(SyncError::ExtractionFailed(_))));
    }

    #[tokio::test]
    async fn test_empty_archive_rejected() {
        let temp = TempDir::new().unwrap();
        let result = extract(tarball(&[]), &temp).await;
        assert!(matches!(result, Err(SyncError::ExtractionFailed(_))));
    }

    #[tokio::test]
    async fn test_corrupt_archive_rejected() {
        let temp = TempDir::new().unwrap();
        let result = extract(b"definitely not gzip".to_vec(), &temp).await;
        assert!(matches!(result, Err(SyncError::ExtractionFailed(_))));
    }

    #[test]
    fn test_copy_fallback_preserves_tree() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("from");
        std::fs::create_dir_all(from.join("src")).unwrap();
        std::fs::write(from.join("src/main.cpp"), "int x;").unwrap();
        copy_recursive(&from, &temp.path().join("to")).unwrap();
        assert_eq!(
            std::fs::read_to_string(temp.path().join("to/src/main.cpp")).unwrap(),
            "int x;"
        );
    }
}

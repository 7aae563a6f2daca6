//! Local mirror fetcher.
//!
//! Used by the `local` deployment, where the firmware checkout is mounted
//! into the container instead of pulled from GitHub. The directory is packed
//! into a gzip tar with a single `<repo>-local/` wrapper so the synchronizer
//! handles it exactly like a downloaded tarball. Hidden top-level entries
//! (`.git`, `.pio`, editor state) are left out.

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::{SnapshotArchive, SnapshotFetcher};
use crate::error::FetchError;
use crate::models::RepositoryCoordinate;

/// Serves snapshots from a mounted directory.
pub struct LocalMirrorFetcher {
    mirror_dir: PathBuf,
}

impl LocalMirrorFetcher {
    pub fn new(mirror_dir: impl Into<PathBuf>) -> Self {
        LocalMirrorFetcher {
            mirror_dir: mirror_dir.into(),
        }
    }
}

fn io_failure(e: std::io::Error) -> FetchError {
    FetchError::TransportFailure(format!("failed to pack local mirror: {}", e))
}

/// Pack `mirror_dir` into an anonymous temp file and rewind it.
fn pack_mirror(mirror_dir: &Path, wrapper: &str) -> Result<File, FetchError> {
    let spool = tempfile::tempfile().map_err(io_failure)?;
    let encoder = GzEncoder::new(spool, Compression::fast());
    let mut builder = tar::Builder::new(encoder);

    let entries = std::fs::read_dir(mirror_dir).map_err(io_failure)?;
    for entry in entries {
        let entry = entry.map_err(io_failure)?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let target = Path::new(wrapper).join(&name);
        let path = entry.path();
        if path.is_dir() {
            builder.append_dir_all(&target, &path).map_err(io_failure)?;
        } else {
            builder.append_path_with_name(&path, &target).map_err(io_failure)?;
        }
    }

    let encoder = builder.into_inner().map_err(io_failure)?;
    let mut spool = encoder.finish().map_err(io_failure)?;
    spool.seek(SeekFrom::Start(0)).map_err(io_failure)?;
    Ok(spool)
}

#[async_trait]
impl SnapshotFetcher for LocalMirrorFetcher {
    async fn fetch(&self, coordinate: &RepositoryCoordinate) -> Result<SnapshotArchive, FetchError> {
        if !self.mirror_dir.is_dir() {
            return Err(FetchError::NotFound(format!(
                "local firmware mirror not found at {}",
                self.mirror_dir.display()
            )));
        }

        log::info!(
            "[Fetch] Packing local mirror {} for {}",
            self.mirror_dir.display(),
            coordinate.repo
        );
        let mirror_dir = self.mirror_dir.clone();
        let wrapper = format!("{}-local", coordinate.repo);
        let spool = tokio::task::spawn_blocking(move || pack_mirror(&mirror_dir, &wrapper))
            .await
            .map_err(|e| FetchError::TransportFailure(format!("pack task failed: {}", e)))??;

        Ok(SnapshotArchive::new(
            format!("local:{}", self.mirror_dir.display()),
            tokio::fs::File::from_std(spool),
        ))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Branch;
    use flate2::read::GzDecoder;
    use std::fs;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_pack_wraps_tree_in_single_directory() {
        let mirror = TempDir::new().unwrap();
        fs::write(mirror.path().join("platformio.ini"), "[env:staging]\n").unwrap();
        fs::write(mirror.path().join("partitions_custom.csv"), "nvs,data\n").unwrap();
        fs::create_dir(mirror.path().join("src")).unwrap();
        fs::write(mirror.path().join("src/main.cpp"), "void setup() {}\n").unwrap();
        fs::create_dir(mirror.path().join(".git")).unwrap();
        fs::write(mirror.path().join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();

        let coord = RepositoryCoordinate::new("bluedotrobots", "pip-bot-firmware", Branch::Staging);
        let archive = LocalMirrorFetcher::new(mirror.path()).fetch(&coord).await.unwrap();
        let mut bytes = Vec::new();
        archive.into_reader().read_to_end(&mut bytes).await.unwrap();

        let mut tar = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
        let paths: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();

        assert!(paths.iter().all(|p| p.starts_with("pip-bot-firmware-local")));
        assert!(paths.iter().any(|p| p.ends_with("platformio.ini")));
        assert!(paths.iter().any(|p| p.ends_with("src/main.cpp")));
        assert!(!paths.iter().any(|p| p.contains(".git")));
    }

    #[tokio::test]
    async fn test_missing_mirror_is_not_found() {
        let coord = RepositoryCoordinate::new("o", "r", Branch::Main);
        let result = LocalMirrorFetcher::new("/nonexistent/firmware").fetch(&coord).await;
        assert!(matches!(result, Err(FetchError::NotFound(_))));
    }
}

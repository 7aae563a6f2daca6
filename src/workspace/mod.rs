//! Workspace synchronizer.
//!
//! Owns the on-disk firmware workspace and replaces its contents with a fresh
//! snapshot. One sync runs these steps in order:
//!
//! 1. Quiesce: report processes holding handles in the workspace (informational)
//! 2. Clear with bounded retry (`cleaner`)
//! 3. Materialize the root with group-writable permissions
//! 4. Fetch and extract the snapshot through a staging directory (`extract`)
//! 5. Verify the required files
//!
//! Only clearing is retried. Fetch, extraction and verification failures are
//! returned on first occurrence; retrying the whole sync is the caller's call.

pub mod cleaner;
pub mod extract;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ServiceConfig;
use crate::error::SyncError;
use crate::models::{DeploymentEnvironment, RepositoryCoordinate, SyncOutcome, REQUIRED_FILES};
use crate::source::SnapshotFetcher;

pub use cleaner::{clear_with_retry, find_open_handles, Cleaner, FsCleaner, OpenHandle};

/// Check every required entry exists. `src` must be a directory.
pub fn verify_required_files(root: &Path) -> Result<(), SyncError> {
    for name in REQUIRED_FILES {
        let path = root.join(name);
        let present = if name == "src" { path.is_dir() } else { path.exists() };
        if !present {
            return Err(SyncError::RequiredFileMissing {
                path: name.to_string(),
            });
        }
    }
    Ok(())
}

/// Create the workspace root (if needed) and make it group-writable.
pub async fn materialize(root: &Path) -> Result<(), SyncError> {
    tokio::fs::create_dir_all(root).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(root, std::fs::Permissions::from_mode(0o775)).await?;
    }
    Ok(())
}

/// Replaces the workspace with snapshots from a `SnapshotFetcher`.
pub struct WorkspaceSynchronizer {
    root: PathBuf,
    staging_root: PathBuf,
    deployment: DeploymentEnvironment,
    fetcher: Arc<dyn SnapshotFetcher>,
    cleaner: Arc<dyn Cleaner>,
    cleanup_attempts: u32,
    cleanup_backoff: Duration,
}

impl WorkspaceSynchronizer {
    pub fn new(root: impl Into<PathBuf>, fetcher: Arc<dyn SnapshotFetcher>) -> Self {
        let root = root.into();
        let staging_root = root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        WorkspaceSynchronizer {
            root,
            staging_root,
            deployment: DeploymentEnvironment::Staging,
            fetcher,
            cleaner: Arc::new(FsCleaner),
            cleanup_attempts: crate::config::DEFAULT_CLEANUP_ATTEMPTS,
            cleanup_backoff: Duration::from_millis(crate::config::DEFAULT_CLEANUP_BACKOFF_MS),
        }
    }

    pub fn from_config(config: &ServiceConfig, fetcher: Arc<dyn SnapshotFetcher>) -> Self {
        WorkspaceSynchronizer::new(&config.workspace_dir, fetcher)
            .with_staging_root(config.staging_root())
            .with_deployment(config.deployment)
            .with_retry(config.cleanup_attempts, config.cleanup_backoff())
    }

    pub fn with_cleaner(mut self, cleaner: Arc<dyn Cleaner>) -> Self {
        self.cleaner = cleaner;
        self
    }

    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.cleanup_attempts = attempts;
        self.cleanup_backoff = backoff;
        self
    }

    pub fn with_staging_root(mut self, staging_root: impl Into<PathBuf>) -> Self {
        self.staging_root = staging_root.into();
        self
    }

    pub fn with_deployment(mut self, deployment: DeploymentEnvironment) -> Self {
        self.deployment = deployment;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Replace the workspace contents with the snapshot at `coordinate`.
    pub async fn sync(&self, coordinate: &RepositoryCoordinate) -> Result<SyncOutcome, SyncError> {
        let started = Instant::now();
        log::info!(
            "[Sync] Synchronizing {} from {} ({})",
            self.root.display(),
            coordinate,
            self.fetcher.name()
        );

        let root = self.root.clone();
        let holders = tokio::task::spawn_blocking(move || find_open_handles(&root))
            .await
            .unwrap_or_default();
        if !holders.is_empty() {
            let mut pids: Vec<u32> = holders.iter().map(|h| h.pid).collect();
            pids.sort_unstable();
            pids.dedup();
            log::warn!(
                "[Sync] [QUIESCE] {} open handle(s) under workspace held by pid(s) {:?}",
                holders.len(),
                pids
            );
        }

        clear_with_retry(
            self.cleaner.as_ref(),
            &self.root,
            self.cleanup_attempts,
            self.cleanup_backoff,
        )
        .await?;

        materialize(&self.root).await?;

        let archive = self.fetcher.fetch(coordinate).await?;
        let moved = extract::extract_snapshot(archive, &self.staging_root, &self.root).await?;
        log::info!("[Sync] [EXTRACT] Installed {} top-level entries", moved);

        verify_required_files(&self.root)?;

        log::info!(
            "[Sync] Workspace ready from {} in {:.1}s",
            coordinate,
            started.elapsed().as_secs_f64()
        );
        Ok(SyncOutcome::completed(self.deployment, coordinate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_verify_required_files() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        assert!(matches!(
            verify_required_files(root),
            Err(SyncError::RequiredFileMissing { ref path }) if path == "platformio.ini"
        ));

        fs::write(root.join("platformio.ini"), "").unwrap();
        fs::write(root.join("partitions_custom.csv"), "").unwrap();
        // A file named src does not satisfy the directory requirement.
        fs::write(root.join("src"), "").unwrap();
        assert!(matches!(
            verify_required_files(root),
            Err(SyncError::RequiredFileMissing { ref path }) if path == "src"
        ));

        fs::remove_file(root.join("src")).unwrap();
        fs::create_dir(root.join("src")).unwrap();
        assert!(verify_required_files(root).is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_materialize_sets_group_writable() {
        use std::os::unix::fs::PermissionsExt;
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("a/b/workspace");
        materialize(&root).await.unwrap();
        let mode = fs::metadata(&root).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o775);
    }
}

//! Workspace clearing with bounded retry, plus open-handle diagnostics.
//!
//! Clearing removes every child of the workspace root but keeps the root
//! itself, so bind mounts and directory ownership survive a refresh.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SyncError;

/// Removes workspace contents.
#[async_trait]
pub trait Cleaner: Send + Sync {
    async fn clear(&self, root: &Path) -> io::Result<()>;
}

/// Filesystem cleaner: deletes every entry under the root.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsCleaner;

#[async_trait]
impl Cleaner for FsCleaner {
    async fn clear(&self, root: &Path) -> io::Result<()> {
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            // file_type() does not follow symlinks, so a link to a directory is unlinked, not walked.
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}

/// Clear `root`, retrying up to `attempts` times with a fixed backoff.
///
/// Returns the number of attempts used. The last error is reported as
/// `WorkspaceCleanupFailed`.
pub async fn clear_with_retry(
    cleaner: &dyn Cleaner,
    root: &Path,
    attempts: u32,
    backoff: Duration,
) -> Result<u32, SyncError> {
    let attempts = attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match cleaner.clear(root).await {
            Ok(()) => {
                log::info!("[Sync] [CLEAN] Workspace cleared on attempt {}/{}", attempt, attempts);
                return Ok(attempt);
            }
            Err(e) => {
                log::warn!(
                    "[Sync] [CLEAN] Attempt {}/{} to clear {} failed: {}",
                    attempt,
                    attempts,
                    root.display(),
                    e
                );
                last_error = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    Err(SyncError::WorkspaceCleanupFailed {
        attempts,
        reason: last_error,
    })
}

/// A process holding an open handle under the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenHandle {
    pub pid: u32,
    pub path: PathBuf,
}

/// Best-effort scan of `/proc/*/fd` for handles inside `root`.
///
/// Purely diagnostic: nothing is killed or waited on. Unreadable process
/// entries (other users, exited processes) are skipped.
#[cfg(target_os = "linux")]
pub fn find_open_handles(root: &Path) -> Vec<OpenHandle> {
    let mut found = Vec::new();
    let Ok(procs) = std::fs::read_dir("/proc") else {
        return found;
    };

    for proc_entry in procs.flatten() {
        let Some(pid) = proc_entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(proc_entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            if let Ok(target) = std::fs::read_link(fd.path()) {
                if target.starts_with(root) {
                    found.push(OpenHandle { pid, path: target });
                }
            }
        }
    }
    found
}

#[cfg(not(target_os = "linux"))]
pub fn find_open_handles(_root: &Path) -> Vec<OpenHandle> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct FlakyCleaner {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Cleaner for FlakyCleaner {
        async fn clear(&self, _root: &Path) -> io::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(io::Error::new(io::ErrorKind::Other, "Device or resource busy"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fs_cleaner_removes_children_keeps_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("ws");
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::write(root.join("platformio.ini"), "x").unwrap();
        fs::write(root.join(".hidden"), "x").unwrap();
        fs::write(root.join("src/nested/a.cpp"), "x").unwrap();

        FsCleaner.clear(&root).await.unwrap();

        assert!(root.is_dir());
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_fs_cleaner_missing_root_is_ok() {
        let temp = TempDir::new().unwrap();
        assert!(FsCleaner.clear(&temp.path().join("absent")).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fs_cleaner_unlinks_symlinked_directory() {
        let temp = TempDir::new().unwrap();
        let outside = temp.path().join("outside");
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("keep.txt"), "x").unwrap();
        let root = temp.path().join("ws");
        fs::create_dir(&root).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        FsCleaner.clear(&root).await.unwrap();

        assert!(outside.join("keep.txt").exists());
        assert!(!root.join("link").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let cleaner = FlakyCleaner {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        };
        let used = clear_with_retry(&cleaner, Path::new("/ws"), 3, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(used, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_attempts() {
        let cleaner = FlakyCleaner {
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
        };
        let result = clear_with_retry(&cleaner, Path::new("/ws"), 3, Duration::from_secs(2)).await;
        match result {
            Err(SyncError::WorkspaceCleanupFailed { attempts, reason }) => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("busy"));
            }
            other => panic!("expected WorkspaceCleanupFailed, got {:?}", other),
        }
        assert_eq!(cleaner.calls.load(Ordering::SeqCst), 3);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_find_open_handles_sees_own_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("held.txt");
        let _held = fs::File::create(&path).unwrap();
        let handles = find_open_handles(temp.path());
        assert!(handles
            .iter()
            .any(|h| h.pid == std::process::id() && h.path.starts_with(temp.path())));
    }
}

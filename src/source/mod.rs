//! Snapshot fetchers.
//!
//! A fetcher turns a `RepositoryCoordinate` into a gzip tar byte stream of
//! the full tree at the branch tip. It does not interpret the archive; the
//! workspace synchronizer owns extraction.
//!
//! - `github`: GitHub App installation token + tarball endpoint
//! - `local`: packs a locally mounted checkout into the same archive shape

pub mod github;
pub mod local;

use async_trait::async_trait;
use std::fmt;
use std::pin::Pin;
use tokio::io::AsyncRead;

use crate::error::FetchError;
use crate::models::RepositoryCoordinate;

pub use github::{AppJwtTokenSource, GitHubSnapshotFetcher, InstallationTokenSource};
pub use local::LocalMirrorFetcher;

/// A gzip tar stream for one snapshot.
pub struct SnapshotArchive {
    /// Human-readable origin, for logging only.
    pub origin: String,
    reader: Pin<Box<dyn AsyncRead + Send>>,
}

impl SnapshotArchive {
    pub fn new(origin: impl Into<String>, reader: impl AsyncRead + Send + 'static) -> Self {
        SnapshotArchive {
            origin: origin.into(),
            reader: Box::pin(reader),
        }
    }

    /// Archive backed by an in-memory buffer.
    pub fn from_bytes(origin: impl Into<String>, bytes: Vec<u8>) -> Self {
        SnapshotArchive::new(origin, std::io::Cursor::new(bytes))
    }

    pub fn into_reader(self) -> Pin<Box<dyn AsyncRead + Send>> {
        self.reader
    }
}

impl fmt::Debug for SnapshotArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotArchive")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Retrieves snapshot archives. Idempotent and safe to retry.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self, coordinate: &RepositoryCoordinate) -> Result<SnapshotArchive, FetchError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

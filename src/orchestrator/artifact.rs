//! Artifact streaming.
//!
//! An `ArtifactStream` owns the open firmware file and the workspace gate
//! guard. The gate stays held until the stream is consumed or dropped, so the
//! next build cannot rewrite `firmware.bin` mid-transfer. Bytes are copied
//! through a bounded buffer; the artifact is never read into memory whole.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::sync::OwnedMutexGuard;

use crate::error::BuildError;
use crate::models::WarmupReport;

pub const ARTIFACT_CONTENT_TYPE: &str = "application/octet-stream";
const STREAM_BUFFER_BYTES: usize = 64 * 1024;

/// What a compile hands back to the caller.
#[derive(Debug)]
pub enum CompileOutcome {
    /// Binary to stream as an attachment.
    Artifact(ArtifactStream),
    /// Warm-up completed; there is nothing to stream.
    Warmup(WarmupReport),
}

/// Open artifact plus the guard that keeps the workspace quiet while it is sent.
#[derive(Debug)]
pub struct ArtifactStream {
    pub filename: String,
    pub content_type: &'static str,
    pub length: u64,
    reader: GuardedReader,
}

impl ArtifactStream {
    /// Re-check the artifact and open it for streaming.
    pub async fn open(
        path: &Path,
        filename: String,
        gate: OwnedMutexGuard<()>,
    ) -> Result<Self, BuildError> {
        let not_found = || BuildError::ArtifactNotFound(path.to_path_buf());
        let meta = tokio::fs::metadata(path).await.map_err(|_| not_found())?;
        if !meta.is_file() {
            return Err(not_found());
        }
        let file = tokio::fs::File::open(path).await.map_err(|_| not_found())?;

        log::info!(
            "[Build] [STREAM] Sending {} ({} bytes) as {}",
            path.display(),
            meta.len(),
            filename
        );
        Ok(ArtifactStream {
            filename,
            content_type: ARTIFACT_CONTENT_TYPE,
            length: meta.len(),
            reader: GuardedReader {
                inner: BufReader::with_capacity(STREAM_BUFFER_BYTES, file),
                _gate: gate,
            },
        })
    }

    /// `Content-Disposition` value for this artifact.
    pub fn content_disposition(&self) -> String {
        format!("attachment; filename={}", self.filename)
    }

    /// Reader over the artifact bytes; releases the gate when dropped.
    pub fn into_reader(self) -> GuardedReader {
        self.reader
    }

    /// Copy the artifact into `sink`, returning the number of bytes written.
    pub async fn copy_to<W>(self, sink: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut reader = self.reader;
        tokio::io::copy_buf(&mut reader.inner, sink).await
    }
}

/// File reader that owns the workspace gate guard.
pub struct GuardedReader {
    inner: BufReader<tokio::fs::File>,
    _gate: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for GuardedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedReader").finish_non_exhaustive()
    }
}

impl AsyncRead for GuardedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

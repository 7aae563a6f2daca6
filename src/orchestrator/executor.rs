//! Build invoker: runs the firmware toolchain against the synchronized workspace.
//!
//! One build:
//! 1. Clears `.pio/build`, keeping only the previous `firmware.bin` so a
//!    failed build leaves it untouched
//! 2. Writes the submitted source verbatim into the user source file
//! 3. Spawns the toolchain in the workspace with request-scoped `PIP_ID` and
//!    `ENVIRONMENT` set on the child only
//! 4. Captures stdout/stderr in fixed-size chunks up to a per-stream cap,
//!    draining and counting the rest
//! 5. Requires a zero exit status and a freshly written artifact
//!
//! stderr output alone never fails a build; PlatformIO writes progress there.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant, SystemTime};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::config::ServiceConfig;
use crate::error::BuildError;
use crate::models::{BuildOutcome, BuildRequest, CapturedOutput};

/// Diagnostics returned to callers are limited to the tail of the output.
const DIAGNOSTIC_TAIL_BYTES: usize = 16 * 1024;

/// Identity of an artifact file at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArtifactFingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

async fn fingerprint(path: &Path) -> Option<ArtifactFingerprint> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    if !meta.is_file() {
        return None;
    }
    Some(ArtifactFingerprint {
        len: meta.len(),
        modified: meta.modified().ok(),
    })
}

/// Pipe read size. Memory per stream is this plus the capture cap.
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Bytes kept from one output stream.
#[derive(Debug)]
struct StreamCapture {
    bytes: Vec<u8>,
    discarded: u64,
    cap: usize,
    /// Transcript cursor sits at the start of a line.
    line_start: bool,
}

impl StreamCapture {
    fn new(cap: usize) -> Self {
        StreamCapture {
            bytes: Vec::new(),
            discarded: 0,
            cap,
            line_start: true,
        }
    }

    fn truncated(&self) -> bool {
        self.discarded > 0
    }

    /// Keep what fits under the cap and count the rest. Returns true when
    /// this chunk overflowed the cap for the first time.
    fn push(&mut self, chunk: &[u8]) -> bool {
        let room = self.cap.saturating_sub(self.bytes.len());
        let kept = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..kept]);

        let overflow = (chunk.len() - kept) as u64;
        let first_overflow = overflow > 0 && !self.truncated();
        self.discarded += overflow;
        first_overflow
    }

    fn into_output(self) -> CapturedOutput {
        CapturedOutput {
            text: String::from_utf8_lossy(&self.bytes).into_owned(),
            discarded_bytes: self.discarded,
        }
    }
}

/// Last `max` bytes of `text`, cut on a char boundary.
fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Runs one toolchain build at a time. Admission is the caller's job.
#[derive(Debug, Clone)]
pub struct BuildInvoker {
    workspace: PathBuf,
    toolchain_environment: String,
    command: Vec<String>,
    user_source_path: PathBuf,
    output_cap: usize,
    timeout: Option<Duration>,
    transcript_dir: Option<PathBuf>,
}

impl BuildInvoker {
    pub fn from_config(config: &ServiceConfig) -> Self {
        BuildInvoker {
            workspace: config.workspace_dir.clone(),
            toolchain_environment: config.toolchain_environment.clone(),
            command: config.toolchain_invocation(),
            user_source_path: config.user_source_path.clone(),
            output_cap: config.output_cap_bytes,
            timeout: config.compile_timeout(),
            transcript_dir: Some(config.log_dir.join("builds")),
        }
    }

    /// Write per-build toolchain transcripts to `dir` (None disables them).
    pub fn with_transcript_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.transcript_dir = dir;
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Where the toolchain leaves the binary.
    pub fn artifact_path(&self) -> PathBuf {
        self.build_output_dir()
            .join(&self.toolchain_environment)
            .join("firmware.bin")
    }

    fn build_output_dir(&self) -> PathBuf {
        self.workspace.join(".pio").join("build")
    }

    /// Remove everything under `.pio/build` except the current artifact.
    async fn clear_build_output(&self) -> Result<(), BuildError> {
        let output_dir = self.build_output_dir();
        let artifact = self.artifact_path();
        let mut envs = match tokio::fs::read_dir(&output_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(env_entry) = envs.next_entry().await? {
            let env_path = env_entry.path();
            let is_dir = env_entry.file_type().await?.is_dir();
            if !is_dir {
                tokio::fs::remove_file(&env_path).await?;
                continue;
            }
            if env_entry.file_name().to_string_lossy() != self.toolchain_environment {
                tokio::fs::remove_dir_all(&env_path).await?;
                continue;
            }

            let mut children = tokio::fs::read_dir(&env_path).await?;
            while let Some(child) = children.next_entry().await? {
                let path = child.path();
                if path == artifact {
                    continue;
                }
                if child.file_type().await?.is_dir() {
                    tokio::fs::remove_dir_all(&path).await?;
                } else {
                    tokio::fs::remove_file(&path).await?;
                }
            }
        }
        log::debug!("[Build] [PREPARATION] Cleared {}", output_dir.display());
        Ok(())
    }

    async fn write_user_source(&self, source_text: &str) -> Result<PathBuf, BuildError> {
        let path = self.workspace.join(&self.user_source_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, source_text.as_bytes()).await?;
        Ok(path)
    }

    async fn open_transcript(&self, request: &BuildRequest) -> Option<tokio::fs::File> {
        let dir = self.transcript_dir.as_ref()?;
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            log::warn!("[Build] Cannot create transcript dir {}: {}", dir.display(), e);
            return None;
        }
        let path = dir.join(format!("{}.log", request.file_stem()));
        match tokio::fs::File::create(&path).await {
            Ok(file) => Some(file),
            Err(e) => {
                log::warn!("[Build] Cannot create transcript {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Run one build for `request`.
    pub async fn build(&self, request: &BuildRequest) -> Result<BuildOutcome, BuildError> {
        let started = Instant::now();
        log::info!(
            "[Build] [PREPARATION] Starting build for {}{}",
            request.correlation_id,
            if request.is_warmup { " (warm-up)" } else { "" }
        );

        self.clear_build_output().await?;
        let artifact = self.artifact_path();
        let previous = fingerprint(&artifact).await;

        let source_path = self.write_user_source(&request.source_text).await?;
        log::debug!(
            "[Build] [PREPARATION] Wrote {} bytes to {}",
            request.source_text.len(),
            source_path.display()
        );

        let (program, args) = self.command.split_first().ok_or_else(|| BuildError::ToolchainFailure {
            exit_code: None,
            diagnostics: "toolchain command is empty".to_string(),
        })?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.workspace)
            .env("PIP_ID", &request.correlation_id)
            .env("ENVIRONMENT", &self.toolchain_environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| BuildError::ToolchainFailure {
            exit_code: None,
            diagnostics: format!("failed to start toolchain '{}': {}", program, e),
        })?;
        log::info!("[Build] [BUILDING] Toolchain started: {}", self.command.join(" "));

        let mut transcript = self.open_transcript(request).await;
        let run = self.drive(&mut child, transcript.as_mut());
        let finished = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.ok(),
            None => Some(run.await),
        };
        let (status, stdout, stderr) = match finished {
            Some(result) => result?,
            None => {
                let seconds = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
                log::error!("[Build] [FAILED] Toolchain exceeded {}s, killing it", seconds);
                let _ = child.kill().await;
                return Err(BuildError::Timeout { seconds });
            }
        };
        if let Some(file) = transcript.as_mut() {
            let _ = file.flush().await;
        }

        if !status.success() {
            let source = if stderr.text.trim().is_empty() { &stdout } else { &stderr };
            let diagnostics = tail(&source.text, DIAGNOSTIC_TAIL_BYTES).to_string();
            log::error!(
                "[Build] [FAILED] Toolchain exited with {:?} for {}",
                status.code(),
                request.correlation_id
            );
            return Err(BuildError::ToolchainFailure {
                exit_code: status.code(),
                diagnostics,
            });
        }

        match fingerprint(&artifact).await {
            Some(current) if Some(current) != previous => {}
            _ => {
                log::error!(
                    "[Build] [VALIDATION] No fresh artifact at {}",
                    artifact.display()
                );
                return Err(BuildError::ArtifactNotFound(artifact));
            }
        }

        let duration = started.elapsed();
        log::info!(
            "[Build] [SUCCESS] Built {} in {:.1}s",
            request.correlation_id,
            duration.as_secs_f64()
        );
        Ok(BuildOutcome {
            artifact_path: artifact,
            stdout,
            stderr,
            duration,
        })
    }

    /// Read both output streams to EOF, then wait for exit.
    async fn drive(
        &self,
        child: &mut Child,
        mut transcript: Option<&mut tokio::fs::File>,
    ) -> Result<(ExitStatus, CapturedOutput, CapturedOutput), BuildError> {
        let mut stdout = child.stdout.take().ok_or_else(|| BuildError::ToolchainFailure {
            exit_code: None,
            diagnostics: "failed to capture stdout".to_string(),
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| BuildError::ToolchainFailure {
            exit_code: None,
            diagnostics: "failed to capture stderr".to_string(),
        })?;

        let mut stdout_buf = [0u8; READ_CHUNK_BYTES];
        let mut stderr_buf = [0u8; READ_CHUNK_BYTES];
        let mut out = StreamCapture::new(self.output_cap);
        let mut err = StreamCapture::new(self.output_cap);
        let mut stdout_closed = false;
        let mut stderr_closed = false;

        // read() is cancel-safe: a branch that loses the race has consumed nothing.
        while !(stdout_closed && stderr_closed) {
            tokio::select! {
                read = stdout.read(&mut stdout_buf), if !stdout_closed => match read {
                    Ok(0) => stdout_closed = true,
                    Ok(n) => self.record(&mut out, &stdout_buf[..n], "stdout", transcript.as_deref_mut()).await,
                    Err(e) => {
                        log::warn!("[Build] Toolchain stdout read error: {}", e);
                        stdout_closed = true;
                    }
                },
                read = stderr.read(&mut stderr_buf), if !stderr_closed => match read {
                    Ok(0) => stderr_closed = true,
                    Ok(n) => self.record(&mut err, &stderr_buf[..n], "stderr", transcript.as_deref_mut()).await,
                    Err(e) => {
                        log::warn!("[Build] Toolchain stderr read error: {}", e);
                        stderr_closed = true;
                    }
                },
            }
        }

        let status = child.wait().await.map_err(|e| BuildError::ToolchainFailure {
            exit_code: None,
            diagnostics: format!("failed to wait for toolchain: {}", e),
        })?;
        if out.truncated() || err.truncated() {
            log::warn!(
                "[Build] Output cap reached: discarded {} stdout and {} stderr bytes",
                out.discarded,
                err.discarded
            );
        }
        Ok((status, out.into_output(), err.into_output()))
    }

    async fn record(
        &self,
        capture: &mut StreamCapture,
        chunk: &[u8],
        stream: &str,
        transcript: Option<&mut tokio::fs::File>,
    ) {
        let was_truncated = capture.truncated();
        if capture.push(chunk) {
            log::warn!(
                "[Build] {} exceeded {} bytes, further output is discarded",
                stream,
                self.output_cap
            );
        }
        if let Some(file) = transcript {
            let prefix: &[u8] = if stream == "stderr" { b"[STDERR] " } else { b"" };
            write_transcript(file, chunk, prefix, &mut capture.line_start).await;
        }
        if !was_truncated {
            log::debug!("[Build] [pio] {}", String::from_utf8_lossy(chunk).trim_end());
        }
    }
}

/// Append a chunk to the transcript, prefixing every line that starts in it.
async fn write_transcript(file: &mut tokio::fs::File, chunk: &[u8], prefix: &[u8], line_start: &mut bool) {
    for piece in chunk.split_inclusive(|b| *b == b'\n') {
        if *line_start && !prefix.is_empty() {
            let _ = file.write_all(prefix).await;
        }
        let _ = file.write_all(piece).await;
        *line_start = piece.ends_with(b"\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn invoker(ws: &Path, script: &str) -> BuildInvoker {
        BuildInvoker {
            workspace: ws.to_path_buf(),
            toolchain_environment: "test".to_string(),
            command: vec!["sh".into(), "-c".into(), script.into()],
            user_source_path: PathBuf::from("src/user_code.h"),
            output_cap: 1024,
            timeout: None,
            transcript_dir: None,
        }
    }

    const PRODUCE: &str = "mkdir -p .pio/build/test && { echo \"$PIP_ID $ENVIRONMENT\"; cat src/user_code.h; } > .pio/build/test/firmware.bin";

    #[test]
    fn test_stream_capture_respects_cap() {
        let mut capture = StreamCapture::new(10);
        assert!(!capture.push(b"12345\n"));
        assert!(capture.push(b"abcdefgh\n"));
        assert!(!capture.push(b"more\n"));
        let out = capture.into_output();
        assert_eq!(out.text, "12345\nabcd");
        assert_eq!(out.discarded_bytes, 5 + 5);
        assert!(out.truncated());
    }

    #[test]
    fn test_stream_capture_keeps_split_utf8() {
        let mut capture = StreamCapture::new(64);
        let text = "héllo".as_bytes();
        capture.push(&text[..2]);
        capture.push(&text[2..]);
        assert_eq!(capture.into_output().text, "héllo");
    }

    #[test]
    fn test_tail_cuts_on_char_boundary() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("héllo", 4), "llo");
    }

    #[tokio::test]
    async fn test_successful_build_passes_request_env() {
        let temp = TempDir::new().unwrap();
        let inv = invoker(temp.path(), PRODUCE);
        let outcome = inv
            .build(&BuildRequest::new("delay(5);", "pip-42"))
            .await
            .unwrap();

        let bytes = fs::read_to_string(&outcome.artifact_path).unwrap();
        assert_eq!(bytes, "pip-42 test\ndelay(5);");
        assert_eq!(
            fs::read_to_string(temp.path().join("src/user_code.h")).unwrap(),
            "delay(5);"
        );
    }

    #[tokio::test]
    async fn test_stderr_alone_is_not_failure() {
        let temp = TempDir::new().unwrap();
        let script = format!("echo 'Compiling .pio/build/test/src/main.o' >&2; {}", PRODUCE);
        let outcome = invoker(temp.path(), &script)
            .build(&BuildRequest::new("x", "1"))
            .await
            .unwrap();
        assert!(outcome.stderr.text.contains("Compiling"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_toolchain_failure() {
        let temp = TempDir::new().unwrap();
        let result = invoker(temp.path(), "echo 'user_code.h:1: error: boom' >&2; exit 3")
            .build(&BuildRequest::new("x", "1"))
            .await;
        match result {
            Err(BuildError::ToolchainFailure { exit_code, diagnostics }) => {
                assert_eq!(exit_code, Some(3));
                assert!(diagnostics.contains("error: boom"));
            }
            other => panic!("expected ToolchainFailure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_artifact_is_not_accepted() {
        let temp = TempDir::new().unwrap();
        let inv = invoker(temp.path(), PRODUCE);
        inv.build(&BuildRequest::new("a", "1")).await.unwrap();

        // Exits cleanly but writes nothing new.
        let noop = invoker(temp.path(), "true");
        let result = noop.build(&BuildRequest::new("b", "2")).await;
        assert!(matches!(result, Err(BuildError::ArtifactNotFound(_))));
    }

    #[tokio::test]
    async fn test_missing_artifact_after_success() {
        let temp = TempDir::new().unwrap();
        let result = invoker(temp.path(), "exit 0")
            .build(&BuildRequest::new("x", "1"))
            .await;
        assert!(matches!(result, Err(BuildError::ArtifactNotFound(_))));
    }

    #[tokio::test]
    async fn test_clear_keeps_previous_artifact_only() {
        let temp = TempDir::new().unwrap();
        let env_dir = temp.path().join(".pio/build/test");
        fs::create_dir_all(env_dir.join("src")).unwrap();
        fs::write(env_dir.join("firmware.bin"), "old").unwrap();
        fs::write(env_dir.join("firmware.elf"), "old").unwrap();
        fs::create_dir_all(temp.path().join(".pio/build/other")).unwrap();
        fs::create_dir_all(temp.path().join(".pio/libdeps/test")).unwrap();

        let result = invoker(temp.path(), "exit 1")
            .build(&BuildRequest::new("x", "1"))
            .await;
        assert!(result.is_err());

        assert_eq!(fs::read_to_string(env_dir.join("firmware.bin")).unwrap(), "old");
        assert!(!env_dir.join("firmware.elf").exists());
        assert!(!env_dir.join("src").exists());
        assert!(!temp.path().join(".pio/build/other").exists());
        assert!(temp.path().join(".pio/libdeps/test").exists());
    }

    #[tokio::test]
    async fn test_output_beyond_cap_is_drained() {
        let temp = TempDir::new().unwrap();
        // ~200 KiB of stdout against a 1 KiB cap; the child must not block on a full pipe.
        let script = format!(
            "i=0; while [ $i -lt 4000 ]; do echo 'line of toolchain output padding padding'; i=$((i+1)); done; {}",
            PRODUCE
        );
        let outcome = invoker(temp.path(), &script)
            .build(&BuildRequest::new("x", "1"))
            .await
            .unwrap();
        assert_eq!(outcome.stdout.text.len(), 1024);
        assert!(outcome.stdout.truncated());
    }

    #[tokio::test]
    async fn test_output_without_newlines_is_capped() {
        let temp = TempDir::new().unwrap();
        // 2 MiB on one line, as a progress bar redrawn with '\r' would produce.
        let script = format!("head -c 2097152 /dev/zero | tr '\\0' 'a'; {}", PRODUCE);
        let outcome = invoker(temp.path(), &script)
            .build(&BuildRequest::new("x", "1"))
            .await
            .unwrap();

        assert_eq!(outcome.stdout.text.len(), 1024);
        assert!(outcome.stdout.text.bytes().all(|b| b == b'a'));
        assert_eq!(outcome.stdout.discarded_bytes, 2097152 - 1024);
    }

    #[tokio::test]
    async fn test_unterminated_diagnostic_is_kept() {
        let temp = TempDir::new().unwrap();
        let result = invoker(temp.path(), "printf 'progress\\r'; printf 'fatal: linker out of memory' >&2; exit 2")
            .build(&BuildRequest::new("x", "1"))
            .await;
        match result {
            Err(BuildError::ToolchainFailure { exit_code, diagnostics }) => {
                assert_eq!(exit_code, Some(2));
                assert_eq!(diagnostics, "fatal: linker out of memory");
            }
            other => panic!("expected ToolchainFailure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_toolchain() {
        let temp = TempDir::new().unwrap();
        let mut inv = invoker(temp.path(), "sleep 5");
        inv.timeout = Some(Duration::from_millis(200));
        let result = inv.build(&BuildRequest::new("x", "1")).await;
        assert!(matches!(result, Err(BuildError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_transcript_written() {
        let temp = TempDir::new().unwrap();
        let logs = temp.path().join("logs");
        let ws = temp.path().join("ws");
        fs::create_dir_all(&ws).unwrap();
        let script = format!("echo hello-out; echo hello-err >&2; {}", PRODUCE);
        invoker(&ws, &script)
            .with_transcript_dir(Some(logs.clone()))
            .build(&BuildRequest::new("x", "pip/7"))
            .await
            .unwrap();

        let transcript = fs::read_to_string(logs.join("pip_7.log")).unwrap();
        assert!(transcript.contains("hello-out"));
        assert!(transcript.contains("[STDERR] hello-err"));
    }
}

//! Decoupled logging pipeline for the compile service.
//!
//! ```text
//! log::info!() / warn!() / ...
//!     |
//! [LogCollector] (impl log::Log, non-blocking send)
//!     | (crossbeam unbounded channel)
//!     v
//! [persister thread] --> logs/service/<ts>_service.log
//!                    \-> stderr
//! ```
//!
//! The persister is a plain OS thread, so records logged from blocking tasks
//! or nested runtimes still reach disk. `wait_for_empty()` flushes everything
//! queued before it was called.

use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Internal log line or flush marker
enum LogMessage {
    Line(LogLine),
    /// Signalled once every earlier line has been written
    Flush(std::sync::mpsc::Sender<()>),
}

/// A log line with metadata
#[derive(Clone, Debug)]
pub struct LogLine {
    pub message: String,
    pub level: Level,
    /// `HH:MM:SS.mmm`
    pub timestamp: String,
}

impl LogLine {
    pub fn new(level: Level, message: String) -> Self {
        LogLine {
            message,
            level,
            timestamp: Local::now().format("%H:%M:%S%.3f").to_string(),
        }
    }

    fn formatted(&self) -> String {
        format!("[{}] [{}] {}\n", self.timestamp, self.level, self.message)
    }
}

/// Create `<log_dir>/service/<timestamp>_service.log`.
fn create_session_log(service_dir: &Path) -> Result<PathBuf, String> {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let path = service_dir.join(format!("{}_service.log", timestamp));
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("Failed to create log file {}: {}", path.display(), e))?;
    Ok(path)
}

/// Unified logger: stderr mirror plus an on-disk session log
#[derive(Clone)]
pub struct LogCollector {
    /// crossbeam unbounded sender; usable from any thread or runtime
    tx: Sender<LogMessage>,
    session_log: PathBuf,
    max_level: LevelFilter,
}

impl LogCollector {
    /// Create a collector writing under `log_dir` and start its persister thread.
    pub fn new(log_dir: PathBuf) -> Result<Self, String> {
        let service_dir = log_dir.join("service");
        std::fs::create_dir_all(&service_dir)
            .map_err(|e| format!("Failed to create service log dir: {}", e))?;
        let session_log = create_session_log(&service_dir)?;

        let (tx, rx) = unbounded::<LogMessage>();
        let path = session_log.clone();
        let mut file: Option<File> = OpenOptions::new().create(true).append(true).open(&path).ok();

        std::thread::Builder::new()
            .name("log-persister".to_string())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        LogMessage::Line(line) => {
                            let formatted = line.formatted();
                            if let Some(f) = file.as_mut() {
                                let _ = f.write_all(formatted.as_bytes());
                            }
                            let _ = std::io::stderr().write_all(formatted.as_bytes());
                        }
                        LogMessage::Flush(done) => {
                            if let Some(f) = file.as_mut() {
                                let _ = f.flush();
                            }
                            let _ = done.send(());
                        }
                    }
                }
            })
            .map_err(|e| format!("Failed to spawn log persister: {}", e))?;

        Ok(LogCollector {
            tx,
            session_log,
            max_level: LevelFilter::Info,
        })
    }

    /// Path of this process's service log.
    pub fn session_log_path(&self) -> &Path {
        &self.session_log
    }

    /// Queue a line (non-blocking; the channel is unbounded).
    pub fn log_line(&self, line: LogLine) {
        let _ = self.tx.send(LogMessage::Line(line));
    }

    /// Install this collector as the `log` crate's global logger.
    pub fn init_global_logger(mut self, max_level: LevelFilter) -> Result<(), String> {
        self.max_level = max_level;
        log::set_boxed_logger(Box::new(self))
            .map(|()| log::set_max_level(max_level))
            .map_err(|e| format!("Failed to set global logger: {}", e))
    }

    /// Wait until every line queued before this call is on disk.
    pub async fn wait_for_empty(&self) -> Result<(), String> {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        self.tx
            .send(LogMessage::Flush(tx))
            .map_err(|e| format!("Failed to send flush marker: {}", e))?;
        tokio::task::spawn_blocking(move || rx.recv())
            .await
            .map_err(|e| format!("Flush task failed: {}", e))?
            .map_err(|e| format!("Flush signal interrupted: {}", e))
    }
}

impl Log for LogCollector {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if metadata.level() > self.max_level {
            return false;
        }
        // Dependencies only get warnings and errors through.
        metadata.target().starts_with(env!("CARGO_CRATE_NAME")) || metadata.level() <= Level::Warn
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.log_line(LogLine::new(record.level(), record.args().to_string()));
        }
    }

    fn flush(&self) {}
}

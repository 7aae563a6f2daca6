//! Unified error type hierarchy for the firmware compiler
//!
//! Each pipeline layer owns one enum: FetchError (repository host),
//! SyncError (workspace synchronizer), BuildError (toolchain invocation),
//! OrchestratorError (admission and state), plus ConfigError for startup.
//! Lower layers are wrapped by the layer above via `#[from]`.

use std::io;
use std::path::PathBuf;

use axum::http::StatusCode;
use thiserror::Error;

/// Snapshot retrieval errors.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Credentials rejected or unusable. Never carries key or token material.
    #[error("Repository host rejected credentials: {0}")]
    AuthFailure(String),

    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("Snapshot transfer failed: {0}")]
    TransportFailure(String),
}

/// Workspace synchronization errors.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Workspace cleanup failed after {attempts} attempts: {reason}")]
    WorkspaceCleanupFailed { attempts: u32, reason: String },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Snapshot extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Required file missing after sync: {path}")]
    RequiredFileMissing { path: String },

    #[error("IO error during workspace sync: {0}")]
    IoError(#[from] io::Error),
}

/// Build process execution errors.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Toolchain failed ({}): {diagnostics}", exit_description(.exit_code))]
    ToolchainFailure {
        exit_code: Option<i32>,
        diagnostics: String,
    },

    #[error("Binary not found after compilation: {}", .0.display())]
    ArtifactNotFound(PathBuf),

    #[error("Toolchain exceeded the {seconds}s compile deadline")]
    Timeout { seconds: u64 },

    #[error("Failed to prepare workspace for build: {0}")]
    IoError(#[from] io::Error),
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid JSON in config: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Missing required setting: {0}")]
    MissingVariable(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error during config operations: {0}")]
    IoError(#[from] io::Error),
}

/// Errors surfaced by the orchestration facade to the HTTP layer.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Another synchronization or build holds the workspace.
    #[error("Workspace is busy")]
    Busy,

    #[error("Workspace not ready (state: {state})")]
    WorkspaceNotReady { state: String },

    #[error("Invalid workspace transition: {0}")]
    InvalidTransition(String),

    /// The detached sync or build task panicked or was cancelled.
    #[error("Workspace task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Build(#[from] BuildError),
}

impl OrchestratorError {
    /// Get a user-facing error message suitable for a response body
    pub fn user_message(&self) -> String {
        match self {
            OrchestratorError::Busy => {
                "Another compilation or firmware update is in progress, retry shortly".to_string()
            }
            OrchestratorError::WorkspaceNotReady { state } => {
                format!("Firmware workspace is not ready ({})", state)
            }
            OrchestratorError::InvalidTransition(msg) => format!("Internal state error: {}", msg),
            OrchestratorError::TaskFailed(msg) => format!("Internal error: {}", msg),
            OrchestratorError::Sync(SyncError::Fetch(e)) => {
                format!("Failed to download firmware: {}", e)
            }
            OrchestratorError::Sync(e) => format!("Firmware update failed: {}", e),
            OrchestratorError::Build(BuildError::ToolchainFailure { diagnostics, .. }) => {
                format!("Compilation failed: {}", diagnostics)
            }
            OrchestratorError::Build(BuildError::ArtifactNotFound(_)) => {
                "Binary not found after compilation".to_string()
            }
            OrchestratorError::Build(e) => format!("Compilation failed: {}", e),
        }
    }

    /// HTTP status for this error.
    ///
    /// Busy and not-ready map to 503 so clients can retry; everything else is a 500.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Busy | Self::WorkspaceNotReady { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result type for facade operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toolchain_failure_display() {
        let err = BuildError::ToolchainFailure {
            exit_code: Some(1),
            diagnostics: "src/main.cpp:3: error: expected ';'".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Toolchain failed (exit code 1): src/main.cpp:3: error: expected ';'"
        );

        let err = BuildError::ToolchainFailure {
            exit_code: None,
            diagnostics: String::new(),
        };
        assert!(err.to_string().contains("terminated by signal"));
    }

    #[test]
    fn test_fetch_error_is_wrapped_transparently() {
        let err: SyncError = FetchError::NotFound("bluedotrobots/pip-bot-firmware@main".into()).into();
        assert_eq!(
            err.to_string(),
            "Snapshot not found: bluedotrobots/pip-bot-firmware@main"
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            OrchestratorError::Busy.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            OrchestratorError::WorkspaceNotReady {
                state: "failed".into()
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        let err: OrchestratorError =
            BuildError::ArtifactNotFound(PathBuf::from("/workspace/.pio/build/staging/firmware.bin"))
                .into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.user_message(), "Binary not found after compilation");
    }

    #[test]
    fn test_cleanup_failure_user_message() {
        let err: OrchestratorError = SyncError::WorkspaceCleanupFailed {
            attempts: 3,
            reason: "Device or resource busy".into(),
        }
        .into();
        assert_eq!(
            err.user_message(),
            "Firmware update failed: Workspace cleanup failed after 3 attempts: Device or resource busy"
        );
    }
}

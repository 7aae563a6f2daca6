//! Firmware Compiler Service
//!
//! Builds firmware images on demand for remotely submitted source code. The
//! core is a pipeline that keeps one local build workspace synchronized with a
//! branch snapshot and runs one toolchain build at a time against it.
//!
//! The system is organized into functional modules:
//! - **error**: Unified error type hierarchy
//! - **models**: Core data structures and types
//! - **config**: Service configuration (JSON file + environment)
//! - **source**: Snapshot fetchers (GitHub App, local mirror)
//! - **workspace**: Workspace synchronizer (clear, extract, verify)
//! - **orchestrator**: Build invoker, artifact streaming and the facade state machine
//! - **server**: axum HTTP surface
//! - **log_collector**: Decoupled logging pipeline

// Core foundational modules
pub mod error;
pub mod models;

pub mod config;

// Snapshot retrieval and workspace ownership
pub mod source;
pub mod workspace;

// Build coordination and state management
pub mod orchestrator;

pub mod server;

// Robust, decoupled logging system
pub mod log_collector;

// Re-export the log crate for macro usage
pub use log;

pub use log_collector::{LogCollector, LogLine};

// ============================================================================
// PUBLIC RE-EXPORTS FOR CONVENIENCE
// ============================================================================

pub use config::{CompileAdmission, ServiceConfig};
pub use error::{BuildError, ConfigError, FetchError, OrchestratorError, Result, SyncError};
pub use models::{
    Branch, BuildOutcome, BuildRequest, DeploymentEnvironment, RepositoryCoordinate, SyncOutcome,
    WarmupReport, REQUIRED_FILES,
};
pub use orchestrator::{CompileOutcome, Orchestrator, WorkspaceState};

/// Crate version, reported at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

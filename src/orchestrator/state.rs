//! Workspace State Management
//!
//! The orchestrator tracks the shared workspace through a small state machine:
//!
//! ```text
//! Uninitialized -> Synchronizing -> Ready <-> Building
//!                      |    ^
//!                      v    |
//!                     Failed
//! ```
//!
//! `Ready -> Synchronizing` is an operator refresh. `Failed -> Synchronizing`
//! lets a refresh recover from a bad startup sync. A build always returns to
//! `Ready`, whatever its outcome.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Discrete states of the shared workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceState {
    /// No sync has run since process start.
    Uninitialized,
    Synchronizing,
    /// Holds a verified snapshot; builds are admitted.
    Ready,
    Building,
    /// Last sync failed; only a refresh is admitted.
    Failed,
}

impl WorkspaceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceState::Uninitialized => "uninitialized",
            WorkspaceState::Synchronizing => "synchronizing",
            WorkspaceState::Ready => "ready",
            WorkspaceState::Building => "building",
            WorkspaceState::Failed => "failed",
        }
    }

    /// Get all valid transitions FROM this state.
    pub fn valid_next_states(&self) -> Vec<WorkspaceState> {
        match self {
            WorkspaceState::Uninitialized => vec![WorkspaceState::Synchronizing],
            WorkspaceState::Synchronizing => vec![WorkspaceState::Ready, WorkspaceState::Failed],
            WorkspaceState::Ready => vec![WorkspaceState::Building, WorkspaceState::Synchronizing],
            WorkspaceState::Building => vec![WorkspaceState::Ready],
            WorkspaceState::Failed => vec![WorkspaceState::Synchronizing],
        }
    }

    pub fn can_transition_to(&self, next: WorkspaceState) -> bool {
        self.valid_next_states().contains(&next)
    }

    /// True while the workspace is being mutated.
    pub fn is_active(&self) -> bool {
        matches!(self, WorkspaceState::Synchronizing | WorkspaceState::Building)
    }
}

impl fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the workspace state plus bookkeeping for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceStatus {
    pub state: WorkspaceState,
    /// Timestamp of the last successful sync.
    pub last_synced_at: Option<String>,
    /// Error text from the last failed sync or build.
    pub last_error: Option<String>,
    pub builds_succeeded: u64,
    pub builds_failed: u64,
    #[serde(skip)]
    pub last_update_time: SystemTime,
}

impl Default for WorkspaceStatus {
    fn default() -> Self {
        WorkspaceStatus {
            state: WorkspaceState::Uninitialized,
            last_synced_at: None,
            last_error: None,
            builds_succeeded: 0,
            builds_failed: 0,
            last_update_time: SystemTime::now(),
        }
    }
}

impl WorkspaceStatus {
    /// Attempt to move to `next`.
    pub fn transition_to(&mut self, next: WorkspaceState) -> Result<(), String> {
        if !self.state.can_transition_to(next) {
            return Err(format!(
                "Invalid workspace transition: {} -> {}",
                self.state.as_str(),
                next.as_str()
            ));
        }
        self.state = next;
        self.last_update_time = SystemTime::now();
        Ok(())
    }

    pub fn record_sync_success(&mut self, timestamp: String) {
        self.last_synced_at = Some(timestamp);
        self.last_error = None;
    }

    pub fn record_sync_failure(&mut self, error: String) {
        self.last_error = Some(error);
    }

    pub fn record_build(&mut self, result: Result<(), String>) {
        match result {
            Ok(()) => self.builds_succeeded += 1,
            Err(e) => {
                self.builds_failed += 1;
                self.last_error = Some(e);
            }
        }
    }
}

//! Core data types for the firmware compiler.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Entries every synchronized workspace must contain. `src` is a directory.
pub const REQUIRED_FILES: [&str; 3] = ["platformio.ini", "partitions_custom.csv", "src"];

/// Source text compiled by the warm-up pass.
pub const WARMUP_SOURCE: &str = "delay(1000);";

/// Correlation id used for warm-up builds.
pub const WARMUP_CORRELATION_ID: &str = "warmup";

/// Deployment environment the service runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentEnvironment {
    Production,
    Staging,
    /// Snapshot comes from a locally mounted firmware checkout.
    Local,
}

impl DeploymentEnvironment {
    /// Branch tracked by this environment. Only production follows `main`.
    pub fn branch(&self) -> Branch {
        match self {
            DeploymentEnvironment::Production => Branch::Main,
            _ => Branch::Staging,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentEnvironment::Production => "production",
            DeploymentEnvironment::Staging => "staging",
            DeploymentEnvironment::Local => "local",
        }
    }
}

impl fmt::Display for DeploymentEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentEnvironment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "production" => Ok(DeploymentEnvironment::Production),
            "staging" => Ok(DeploymentEnvironment::Staging),
            "local" => Ok(DeploymentEnvironment::Local),
            other => Err(format!("Unknown deployment environment: {}", other)),
        }
    }
}

impl Default for DeploymentEnvironment {
    fn default() -> Self {
        DeploymentEnvironment::Staging
    }
}

/// Tracked firmware branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Branch {
    Main,
    Staging,
}

impl Branch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Branch::Main => "main",
            Branch::Staging => "staging",
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies the snapshot to synchronize. Derived once per process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryCoordinate {
    pub owner: String,
    pub repo: String,
    pub branch: Branch,
}

impl RepositoryCoordinate {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, branch: Branch) -> Self {
        RepositoryCoordinate {
            owner: owner.into(),
            repo: repo.into(),
            branch,
        }
    }
}

impl fmt::Display for RepositoryCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.repo, self.branch)
    }
}

/// A single compile request. Request-scoped; never stored globally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    #[serde(rename = "userCode")]
    pub source_text: String,
    #[serde(rename = "pipUUID")]
    pub correlation_id: String,
    #[serde(default)]
    pub is_warmup: bool,
}

impl BuildRequest {
    pub fn new(source_text: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        BuildRequest {
            source_text: source_text.into(),
            correlation_id: correlation_id.into(),
            is_warmup: false,
        }
    }

    /// The request issued by the startup warm-up pass.
    pub fn warmup() -> Self {
        BuildRequest {
            source_text: WARMUP_SOURCE.to_string(),
            correlation_id: WARMUP_CORRELATION_ID.to_string(),
            is_warmup: true,
        }
    }

    /// Correlation id reduced to characters safe in file names and headers.
    pub fn file_stem(&self) -> String {
        let stem: String = self
            .correlation_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if stem.is_empty() || stem.chars().all(|c| c == '.') {
            "firmware".to_string()
        } else {
            stem
        }
    }

    /// Attachment filename for the produced binary.
    pub fn artifact_filename(&self) -> String {
        format!("{}.bin", self.file_stem())
    }
}

/// ISO-8601 timestamp used in every outcome and response body.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Result of a successful workspace synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub message: String,
    /// Display label: "Local" for the mirror source, otherwise the deployment name.
    pub environment: String,
    pub timestamp: String,
}

impl SyncOutcome {
    pub fn completed(environment: DeploymentEnvironment, coordinate: &RepositoryCoordinate) -> Self {
        let (message, label) = match environment {
            DeploymentEnvironment::Local => (
                "Firmware updated successfully from local repo".to_string(),
                "Local".to_string(),
            ),
            other => (
                format!(
                    "Firmware updated successfully from {} branch",
                    coordinate.branch
                ),
                other.to_string(),
            ),
        };
        SyncOutcome {
            success: true,
            message,
            environment: label,
            timestamp: timestamp_now(),
        }
    }
}

/// Captured output of one toolchain stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub text: String,
    /// Bytes that arrived after the cap and were discarded.
    pub discarded_bytes: u64,
}

impl CapturedOutput {
    pub fn truncated(&self) -> bool {
        self.discarded_bytes > 0
    }
}

/// Result of a successful toolchain run.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub artifact_path: PathBuf,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub duration: Duration,
}

/// Structured reply for a warm-up compile. No artifact bytes accompany it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmupReport {
    pub success: bool,
    pub message: String,
    pub timestamp: String,
}

impl WarmupReport {
    pub fn completed() -> Self {
        WarmupReport {
            success: true,
            message: "Warmup compilation successful".to_string(),
            timestamp: timestamp_now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_mapping() {
        assert_eq!(DeploymentEnvironment::Production.branch(), Branch::Main);
        assert_eq!(DeploymentEnvironment::Staging.branch(), Branch::Staging);
        assert_eq!(DeploymentEnvironment::Local.branch(), Branch::Staging);
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!(
            "Production".parse::<DeploymentEnvironment>(),
            Ok(DeploymentEnvironment::Production)
        );
        assert_eq!(
            " local ".parse::<DeploymentEnvironment>(),
            Ok(DeploymentEnvironment::Local)
        );
        assert!("qa".parse::<DeploymentEnvironment>().is_err());
    }

    #[test]
    fn test_build_request_wire_format() {
        let req: BuildRequest =
            serde_json::from_str(r#"{"userCode":"delay(5);","pipUUID":"abc-123"}"#).unwrap();
        assert_eq!(req.source_text, "delay(5);");
        assert_eq!(req.correlation_id, "abc-123");
        assert!(!req.is_warmup);
        assert_eq!(req.artifact_filename(), "abc-123.bin");

        let req: BuildRequest = serde_json::from_str(
            r#"{"userCode":"x","pipUUID":"1","isWarmup":true}"#,
        )
        .unwrap();
        assert!(req.is_warmup);
    }

    #[test]
    fn test_file_stem_sanitizes_header_characters() {
        let req = BuildRequest::new("x", "a\"b\r\nc/../d");
        assert_eq!(req.file_stem(), "a_b__c_.._d");
        assert_eq!(BuildRequest::new("x", "").artifact_filename(), "firmware.bin");
        assert_eq!(BuildRequest::new("x", "..").file_stem(), "firmware");
    }

    #[test]
    fn test_warmup_request() {
        let req = BuildRequest::warmup();
        assert_eq!(req.source_text, "delay(1000);");
        assert!(req.is_warmup);
    }

    #[test]
    fn test_sync_outcome_messages() {
        let coord = RepositoryCoordinate::new("bluedotrobots", "pip-bot-firmware", Branch::Main);
        let outcome = SyncOutcome::completed(DeploymentEnvironment::Production, &coord);
        assert_eq!(outcome.message, "Firmware updated successfully from main branch");
        assert_eq!(outcome.environment, "production");

        let outcome = SyncOutcome::completed(DeploymentEnvironment::Local, &coord);
        assert_eq!(outcome.message, "Firmware updated successfully from local repo");
        assert_eq!(outcome.environment, "Local");
    }
}

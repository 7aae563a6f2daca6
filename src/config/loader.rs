//! Config file loader and environment overlay.
//!
//! Precedence, lowest to highest: built-in defaults, the JSON file named by
//! `COMPILER_CONFIG`, individual environment variables.

use super::{CompileAdmission, GitHubAppCredentials, ServiceConfig};
use crate::error::ConfigError;
use crate::models::DeploymentEnvironment;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Env var naming an optional JSON config file.
pub const CONFIG_FILE_VAR: &str = "COMPILER_CONFIG";

/// Load config from JSON file.
pub fn load_config_from_file(path: &Path) -> Result<ServiceConfig, ConfigError> {
    validate_config_path(path)?;

    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(format!(
                "Configuration file not found at: {}",
                path.display()
            ))
        } else {
            ConfigError::IoError(e)
        }
    })?;

    let config: ServiceConfig = serde_json::from_str(&content).map_err(ConfigError::InvalidJson)?;
    Ok(config)
}

/// Validate config path (.json extension required).
pub fn validate_config_path(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "Configuration path cannot be empty".to_string(),
        ));
    }

    match path.extension() {
        Some(ext) if ext == "json" => Ok(()),
        Some(ext) => Err(ConfigError::ValidationFailed(format!(
            "Configuration file must have .json extension, got .{}",
            ext.to_string_lossy()
        ))),
        None => Err(ConfigError::ValidationFailed(
            "Configuration file must have .json extension".to_string(),
        )),
    }
}

/// Build the service configuration from the process environment.
pub fn load_from_env() -> Result<ServiceConfig, ConfigError> {
    load_with(|key| std::env::var(key).ok())
}

/// Build the service configuration from an arbitrary variable lookup.
///
/// Tests pass a map-backed closure so they never touch process-global state.
pub fn load_with<F>(lookup: F) -> Result<ServiceConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    let base = match lookup(CONFIG_FILE_VAR) {
        Some(path) => load_config_from_file(&PathBuf::from(path))?,
        None => ServiceConfig::default(),
    };

    let config = apply_env_overrides(base, &lookup)?;
    config.validate()?;
    Ok(config)
}

fn parse_var<T: FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value,
    })
}

/// Overlay environment variables on top of `config`.
pub fn apply_env_overrides<F>(mut config: ServiceConfig, lookup: &F) -> Result<ServiceConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup("ENVIRONMENT") {
        // Unknown names fall back to staging, matching branch selection.
        config.deployment = raw.parse().unwrap_or_else(|e: String| {
            log::warn!("[Config] {}; falling back to staging", e);
            DeploymentEnvironment::Staging
        });
        config.toolchain_environment = raw.trim().to_string();
    }
    if let Some(env_name) = lookup("PIO_ENVIRONMENT") {
        config.toolchain_environment = env_name.trim().to_string();
    }

    if let Some(dir) = lookup("WORKSPACE_BASE_DIR") {
        config.workspace_dir = PathBuf::from(dir);
    }
    if let Some(dir) = lookup("STAGING_DIR") {
        config.staging_dir = Some(PathBuf::from(dir));
    }
    if let Some(dir) = lookup("FIRMWARE_SOURCE") {
        config.local_mirror_dir = PathBuf::from(dir);
    }
    if let Some(owner) = lookup("FIRMWARE_REPO_OWNER") {
        config.repo_owner = owner;
    }
    if let Some(repo) = lookup("FIRMWARE_REPO_NAME") {
        config.repo_name = repo;
    }
    if let Some(url) = lookup("GITHUB_API_URL") {
        config.github_api_url = url;
    }

    match (
        lookup("GITHUB_APP_ID"),
        lookup("GITHUB_INSTALLATION_ID"),
        lookup("GITHUB_APP_PRIVATE_KEY"),
    ) {
        (Some(app_id), Some(installation_id), Some(key)) => {
            config.github = Some(GitHubAppCredentials::new(app_id, installation_id, &key));
        }
        (None, None, None) => {}
        _ => {
            log::warn!("[Config] Incomplete GitHub App credentials in environment, ignoring them");
        }
    }

    if let Some(cmd) = lookup("TOOLCHAIN_COMMAND") {
        config.toolchain_command = cmd.split_whitespace().map(str::to_string).collect();
    }
    if let Some(path) = lookup("USER_SOURCE_PATH") {
        config.user_source_path = PathBuf::from(path);
    }
    if let Some(cap) = lookup("TOOLCHAIN_OUTPUT_CAP") {
        config.output_cap_bytes = parse_var("TOOLCHAIN_OUTPUT_CAP", cap)?;
    }
    if let Some(secs) = lookup("COMPILE_TIMEOUT_SECS") {
        config.compile_timeout_secs = Some(parse_var("COMPILE_TIMEOUT_SECS", secs)?);
    }
    if let Some(attempts) = lookup("CLEANUP_ATTEMPTS") {
        config.cleanup_attempts = parse_var("CLEANUP_ATTEMPTS", attempts)?;
    }
    if let Some(ms) = lookup("CLEANUP_BACKOFF_MS") {
        config.cleanup_backoff_ms = parse_var("CLEANUP_BACKOFF_MS", ms)?;
    }
    if let Some(mode) = lookup("COMPILE_ADMISSION") {
        config.compile_admission = parse_var::<CompileAdmission>("COMPILE_ADMISSION", mode)?;
    }
    if let Some(flag) = lookup("WARMUP_ON_START") {
        config.warmup_on_start = parse_var("WARMUP_ON_START", flag)?;
    }
    if let Some(port) = lookup("PORT") {
        config.port = parse_var("PORT", port)?;
    }
    if let Some(dir) = lookup("LOG_DIR") {
        config.log_dir = PathBuf::from(dir);
    }

    Ok(config)
}

use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::models::Bitrate;

/// Environment variable that overrides `storage.token`
pub const STORAGE_TOKEN_ENV: &str = "STEMQ_STORAGE_TOKEN";

/// Configuration for the stem separation job service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Root directory for every local artifact (sources, workspaces)
    pub media_root: PathBuf,
    /// Subdirectory of `media_root` holding per-job workspaces
    pub separate_dir: String,
    /// Subdirectory of `media_root` holding per-source-file directories
    pub upload_dir: String,
    /// Directory where job records are stored as JSON files
    pub store_dir: PathBuf,
    /// Interval in seconds between static mix queue checks
    pub static_poll_secs: u64,
    /// Interval in seconds between dynamic mix queue checks
    pub dynamic_poll_secs: u64,
    /// Interval in seconds between stale job / orphaned workspace sweeps
    pub recovery_interval_secs: u64,
    /// Hard execution time limit for a single pipeline run
    pub job_time_limit_secs: u64,
    /// Age after which an IN_PROGRESS job is considered abandoned and requeued
    pub stale_job_secs: u64,
    /// Maximum number of pipelines running at the same time
    pub workers: usize,
    /// Run separation on CPU unless a job's arguments say otherwise
    pub cpu_separation: bool,
    /// Bitrate used when a request does not specify one
    pub default_bitrate: Bitrate,
    /// Separator model used when a request does not specify one
    pub default_separator: String,
    /// HTTP timeout for downloading source audio
    pub fetch_timeout_secs: u64,
    /// External separation command
    pub separator: SeparatorCommandConfig,
    /// Remote storage endpoint
    pub storage: StorageConfig,
}

/// External program invoked for separation.
///
/// Argument templates may reference `{input}`, `{output_dir}`, `{output}`,
/// `{parts}`, `{bitrate}`, `{separator}`, `{shifts}`, `{device}` and `{segment}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparatorCommandConfig {
    pub program: PathBuf,
    /// Arguments for the full five-stem split
    pub split_all_args: Vec<String>,
    /// Arguments for a single mixed output of selected stems
    pub split_selected_args: Vec<String>,
}

impl Default for SeparatorCommandConfig {
    fn default() -> Self {
        let common = |args: &[&str]| args.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            program: PathBuf::from("stem-separate"),
            split_all_args: common(&[
                "all", "--input", "{input}", "--output-dir", "{output_dir}",
                "--model", "{separator}", "--bitrate", "{bitrate}",
                "--shifts", "{shifts}", "--device", "{device}", "--segment", "{segment}",
            ]),
            split_selected_args: common(&[
                "mix", "--input", "{input}", "--output", "{output}", "--parts", "{parts}",
                "--model", "{separator}", "--bitrate", "{bitrate}",
                "--shifts", "{shifts}", "--device", "{device}", "--segment", "{segment}",
            ]),
        }
    }
}

/// Remote storage endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base URL of the storage API
    pub endpoint: String,
    /// Bearer token, overridden by `STEMQ_STORAGE_TOKEN` when set
    pub token: Option<String>,
    /// Request timeout in seconds (uploads of long stems can be slow)
    pub timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9000".to_string(),
            token: None,
            timeout_secs: 300,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ServiceConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            media_root: PathBuf::from("media"),
            separate_dir: "separate".to_string(),
            upload_dir: "uploads".to_string(),
            store_dir: PathBuf::from("state"),
            static_poll_secs: 300,
            dynamic_poll_secs: 300,
            recovery_interval_secs: 900,
            job_time_limit_secs: 3600,
            stale_job_secs: 7200,
            workers: 2,
            cpu_separation: true,
            default_bitrate: Bitrate::Kbps256,
            default_separator: "spleeter".to_string(),
            fetch_timeout_secs: 600,
            separator: SeparatorCommandConfig::default(),
            storage: StorageConfig::default(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        if let Ok(token) = std::env::var(STORAGE_TOKEN_ENV) {
            if !token.is_empty() {
                config.storage.token = Some(token);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the dispatcher cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.static_poll_secs == 0 || self.dynamic_poll_secs == 0 || self.recovery_interval_secs == 0 {
            anyhow::bail!("poll and recovery intervals must be greater than zero");
        }
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.job_time_limit_secs == 0 {
            anyhow::bail!("job_time_limit_secs must be greater than zero");
        }
        // A sweep younger than the time limit would requeue jobs that are still running.
        if self.stale_job_secs <= self.job_time_limit_secs {
            anyhow::bail!(
                "stale_job_secs ({}) must be greater than job_time_limit_secs ({})",
                self.stale_job_secs,
                self.job_time_limit_secs
            );
        }
        Ok(())
    }

    /// `<media_root>/<separate_dir>`
    pub fn separate_root(&self) -> PathBuf {
        self.media_root.join(&self.separate_dir)
    }

    /// `<media_root>/<upload_dir>`
    pub fn upload_root(&self) -> PathBuf {
        self.media_root.join(&self.upload_dir)
    }

    pub fn job_time_limit(&self) -> Duration {
        Duration::from_secs(self.job_time_limit_secs)
    }

    pub fn stale_job_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_job_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServiceConfig::load_config(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(cfg.separate_root(), PathBuf::from("media/separate"));
        assert_eq!(cfg.default_bitrate, Bitrate::Kbps256);
        assert_eq!(cfg.workers, 2);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stemq.toml");
        fs::write(
            &path,
            "media_root = \"/srv/media\"\nworkers = 4\ndefault_bitrate = 320\n\n[storage]\nendpoint = \"https://cdn.example\"\n",
        )
        .unwrap();

        let cfg = ServiceConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.upload_root(), PathBuf::from("/srv/media/uploads"));
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.default_bitrate, Bitrate::Kbps320);
        assert_eq!(cfg.storage.endpoint, "https://cdn.example");
        assert_eq!(cfg.storage.timeout_secs, 300);
        assert_eq!(cfg.static_poll_secs, 300);
    }

    #[test]
    fn test_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stemq.json");
        fs::write(&path, r#"{"dynamic_poll_secs": 30, "default_separator": "demucs"}"#).unwrap();

        let cfg = ServiceConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.dynamic_poll_secs, 30);
        assert_eq!(cfg.default_separator, "demucs");
    }

    #[test]
    fn test_invalid_bitrate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stemq.json");
        fs::write(&path, r#"{"default_bitrate": 128}"#).unwrap();
        assert!(ServiceConfig::load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_validate_stale_age_must_exceed_time_limit() {
        let mut cfg = ServiceConfig::default_config();
        cfg.stale_job_secs = cfg.job_time_limit_secs;
        assert!(cfg.validate().is_err());

        cfg.stale_job_secs = cfg.job_time_limit_secs + 1;
        assert!(cfg.validate().is_ok());

        cfg.workers = 0;
        assert!(cfg.validate().is_err());
    }
}

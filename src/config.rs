//! Pipeline configuration loaded from a YAML file.
//!
//! Every key is optional; missing keys fall back to the defaults below, and
//! command-line flags (see [`crate::cli`]) override whatever the file says.
//!
//! ```yaml
//! database_url: sqlite://job_pulse.db
//! cooldown_minutes: 120
//! default_keyword: embedded
//! stale_run_grace_minutes: 90
//! scraper:
//!   program: python3
//!   args: ["scraper/main.py"]
//!   timeout_secs: 600
//!   max_jobs: 100
//!   headless: true
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument};

/// Headroom between the scraper timeout and the abandoned-run sweep, for
/// ingestion and closing the run record.
pub const STALE_RUN_MARGIN_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for the whole pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// sqlx connection string for the SQLite store.
    pub database_url: String,
    /// Minimum minutes between two completed runs of the same source.
    ///
    /// This single value drives both the gate and the status query. Older
    /// deployments used 120 for scheduled runs and 60 on a status read-path;
    /// set it explicitly if you relied on the latter.
    pub cooldown_minutes: u32,
    /// Keyword used when a trigger does not supply one.
    pub default_keyword: String,
    /// Runs still marked `running` after this long are treated as abandoned.
    pub stale_run_grace_minutes: u32,
    pub scraper: ScraperConfig,
}

/// How to launch the external scraper.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub program: String,
    /// Leading arguments; the pipeline appends `--keyword`, `--source`,
    /// `--max-jobs`, and `--headless`.
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub max_jobs: u32,
    pub headless: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://job_pulse.db".to_string(),
            cooldown_minutes: 120,
            default_keyword: "embedded".to_string(),
            stale_run_grace_minutes: 90,
            scraper: ScraperConfig::default(),
        }
    }
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["scraper/main.py".to_string()],
            timeout_secs: 600,
            max_jobs: 100,
            headless: true,
        }
    }
}

impl ScraperConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PipelineConfig {
    /// Load from `path` if it exists, otherwise start from defaults.
    ///
    /// A missing file is not an error when `required` is false, so the binary
    /// runs out of the box; an explicitly requested file must exist.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn load(path: impl AsRef<Path>, required: bool) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();

        let config = match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_yaml::from_str::<PipelineConfig>(&raw).map_err(|source| {
                ConfigError::Parse {
                    path: display.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                info!("No config file found; using defaults");
                PipelineConfig::default()
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: display,
                    source,
                });
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cooldown_minutes == 0 {
            return Err(ConfigError::Invalid("cooldown_minutes must be > 0".into()));
        }
        if self.scraper.timeout_secs == 0 {
            return Err(ConfigError::Invalid("scraper.timeout_secs must be > 0".into()));
        }
        if self.scraper.max_jobs == 0 {
            return Err(ConfigError::Invalid("scraper.max_jobs must be > 0".into()));
        }
        // The sweep must never reach a run that can still be in flight: its
        // scraper may live for the full timeout, and ingestion follows.
        let grace_secs = u64::from(self.stale_run_grace_minutes) * 60;
        let min_grace_secs = self.scraper.timeout_secs.saturating_add(STALE_RUN_MARGIN_SECS);
        if grace_secs < min_grace_secs {
            return Err(ConfigError::Invalid(format!(
                "stale_run_grace_minutes must cover scraper.timeout_secs plus {STALE_RUN_MARGIN_SECS}s \
                 (at least {} minute(s), got {})",
                min_grace_secs.div_ceil(60),
                self.stale_run_grace_minutes
            )));
        }
        if self.scraper.program.trim().is_empty() {
            return Err(ConfigError::Invalid("scraper.program must not be empty".into()));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(u64::from(self.cooldown_minutes) * 60)
    }

    pub fn stale_run_grace(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.stale_run_grace_minutes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_missing_optional_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::load(dir.path().join("nope.yaml"), false)
            .await
            .unwrap();
        assert_eq!(config.cooldown_minutes, 120);
        assert_eq!(config.scraper.program, "python3");
    }

    #[tokio::test]
    async fn test_missing_required_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let result = PipelineConfig::load(dir.path().join("nope.yaml"), true).await;
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[tokio::test]
    async fn test_partial_file_merges_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "cooldown_minutes: 60\nscraper:\n  program: /usr/bin/python3\n  max_jobs: 25"
        )
        .unwrap();

        let config = PipelineConfig::load(file.path(), true).await.unwrap();
        assert_eq!(config.cooldown_minutes, 60);
        assert_eq!(config.scraper.program, "/usr/bin/python3");
        assert_eq!(config.scraper.max_jobs, 25);
        assert_eq!(config.scraper.timeout_secs, 600);
        assert_eq!(config.default_keyword, "embedded");
    }

    #[tokio::test]
    async fn test_zero_cooldown_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cooldown_minutes: 0").unwrap();
        let result = PipelineConfig::load(file.path(), true).await;
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_stale_grace_must_outlast_the_scraper() {
        let mut config = PipelineConfig::default();
        assert!(config.validate().is_ok());

        config.stale_run_grace_minutes = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        // 600s timeout + 300s margin = 15 minutes.
        config.stale_run_grace_minutes = 14;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.stale_run_grace_minutes = 15;
        assert!(config.validate().is_ok());

        config.scraper.timeout_secs = 3600;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_zero_grace_file_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "stale_run_grace_minutes: 0").unwrap();
        let result = PipelineConfig::load(file.path(), true).await;
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_cooldown_duration() {
        let config = PipelineConfig::default();
        assert_eq!(config.cooldown(), Duration::from_secs(7200));
        assert_eq!(config.stale_run_grace(), chrono::Duration::minutes(90));
    }
}

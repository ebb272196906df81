//! Command-line interface definitions for job_pulse.
//!
//! Global options locate the config file and override individual config
//! values. Every option can also be supplied through an environment variable.

use crate::config::PipelineConfig;
use crate::models::Source;
use clap::{Parser, Subcommand};

/// Command-line arguments for job_pulse.
///
/// # Examples
///
/// ```sh
/// # One manual cycle for LinkedIn with the default keyword
/// job_pulse run --source linkedin
///
/// # Long-running scheduler, kicking off both sources for "fpga"
/// job_pulse daemon --source all --keyword fpga
///
/// # Inspect
/// job_pulse status --source stepstone
/// job_pulse runs --limit 20
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the YAML config file (optional; defaults apply when absent)
    #[arg(short, long, global = true, env = "JOB_PULSE_CONFIG")]
    pub config: Option<String>,

    /// SQLite database URL, overriding the config file
    #[arg(long, global = true, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Minutes a source must rest after a completed run, overriding the config file
    #[arg(long, global = true, env = "JOB_PULSE_COOLDOWN_MINUTES")]
    pub cooldown_minutes: Option<u32>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one manual scrape cycle now and print the trigger response
    Run {
        #[arg(short, long, value_enum)]
        source: Source,

        /// Search keyword; falls back to `default_keyword` from config
        #[arg(short, long)]
        keyword: Option<String>,
    },

    /// Keep scheduled cycles running until interrupted
    Daemon {
        /// Sources to run immediately at startup (repeatable)
        #[arg(short, long, value_enum)]
        source: Vec<Source>,

        /// Keyword for the startup runs
        #[arg(short, long)]
        keyword: Option<String>,
    },

    /// Show the last run and cooldown state of a source
    Status {
        #[arg(short, long, value_enum, default_value = "all")]
        source: Source,
    },

    /// List recent run records, newest first
    Runs {
        #[arg(short, long, value_enum)]
        source: Option<Source>,

        #[arg(short, long, default_value_t = 10)]
        limit: u32,
    },

    /// List stored listings, most recently discovered first
    Listings {
        #[arg(short, long, value_enum)]
        source: Option<Source>,

        /// Only listings first seen in their source's latest cycle
        #[arg(long)]
        fresh: bool,

        #[arg(short, long, default_value_t = 50)]
        limit: u32,
    },

    /// Mark runs left open by a crashed process as failed
    Sweep,
}

impl Cli {
    /// Apply command-line overrides on top of a loaded config.
    pub fn apply_overrides(&self, config: &mut PipelineConfig) {
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        if let Some(minutes) = self.cooldown_minutes {
            config.cooldown_minutes = minutes;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_run_parsing() {
        let cli = Cli::parse_from(["job_pulse", "run", "--source", "linkedin", "--keyword", "fpga"]);

        match cli.command {
            Command::Run { source, keyword } => {
                assert_eq!(source, Source::Linkedin);
                assert_eq!(keyword.as_deref(), Some("fpga"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "job_pulse",
            "status",
            "-s",
            "stepstone",
            "--database-url",
            "sqlite::memory:",
            "--cooldown-minutes",
            "60",
        ]);

        assert_eq!(cli.database_url.as_deref(), Some("sqlite::memory:"));
        assert_eq!(cli.cooldown_minutes, Some(60));
        assert!(matches!(cli.command, Command::Status { source: Source::Stepstone }));
    }

    #[test]
    fn test_cli_daemon_repeated_sources() {
        let cli = Cli::parse_from(["job_pulse", "daemon", "-s", "linkedin", "-s", "stepstone"]);
        match cli.command {
            Command::Daemon { source, keyword } => {
                assert_eq!(source, vec![Source::Linkedin, Source::Stepstone]);
                assert!(keyword.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_listings_defaults() {
        let cli = Cli::parse_from(["job_pulse", "listings", "--fresh"]);
        assert!(matches!(
            cli.command,
            Command::Listings { source: None, fresh: true, limit: 50 }
        ));
    }

    #[test]
    fn test_cli_rejects_unknown_source() {
        assert!(Cli::try_parse_from(["job_pulse", "run", "--source", "indeed"]).is_err());
    }

    #[test]
    fn test_overrides_replace_config_values() {
        let cli = Cli::parse_from(["job_pulse", "--cooldown-minutes", "45", "sweep"]);
        let mut config = PipelineConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.cooldown_minutes, 45);
    }
}

//! Error taxonomy for the scrape → ingest pipeline.
//!
//! Every failure that can happen between "the gate let us through" and "the
//! run record was closed" is one variant of [`PipelineError`]. The workflow
//! coordinator catches all of them and turns them into a failed run record,
//! so nothing here ever reaches the caller as a raw error.

use crate::models::Source;
use std::time::Duration;
use thiserror::Error;

/// Failures raised by the invoker, the ledger, or the ingestion engine.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The scraper exited with a non-zero status (or was killed by a signal).
    #[error("scraper exited with status {}: {stderr}", display_code(.code))]
    ExternalProcess { code: Option<i32>, stderr: String },

    /// The scraper exited cleanly but stdout was not a valid result document.
    #[error("scraper output violated the JSON contract: {0}")]
    ContractViolation(String),

    /// Well-formed output with `"success": false`. Displays the embedded
    /// error text verbatim so it can be stored as-is on the run record.
    #[error("{0}")]
    ScraperReportedFailure(String),

    /// The scraper did not finish before the deadline and was killed.
    #[error("scraper timed out after {0:?}")]
    Timeout(Duration),

    /// The scraper process could not be started at all.
    #[error("failed to launch scraper: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Another run already holds the `running` reservation for this source.
    #[error("a run is already in progress for {0}")]
    AlreadyRunning(String),

    /// A run for this source completed while the reservation was being taken.
    #[error("{blocked_source} is cooling down; next run allowed in {minutes_until_next} minute(s)")]
    CoolingDown {
        blocked_source: Source,
        minutes_until_next: i64,
    },

    /// Attempted to close a run record that is not (or no longer) running.
    #[error("run record {0} is not open")]
    RunNotOpen(i64),
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "<signal>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reported_failure_displays_raw_text() {
        let e = PipelineError::ScraperReportedFailure("blocked".to_string());
        assert_eq!(e.to_string(), "blocked");
    }

    #[test]
    fn test_external_process_display() {
        let e = PipelineError::ExternalProcess {
            code: Some(2),
            stderr: "boom".to_string(),
        };
        assert_eq!(e.to_string(), "scraper exited with status 2: boom");

        let killed = PipelineError::ExternalProcess {
            code: None,
            stderr: String::new(),
        };
        assert!(killed.to_string().contains("<signal>"));
    }
}

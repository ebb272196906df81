//! Data models for scrape results, stored listings, and run records.
//!
//! This module defines the core data structures used throughout the pipeline:
//! - [`ScrapeResult`] / [`ScrapedJob`]: the JSON document the external scraper
//!   writes to stdout. Field names are part of the wire contract.
//! - [`Listing`]: a deduplicated job listing row, keyed by URL
//! - [`RunRecord`]: one audited attempt to run the scraper for one source
//! - [`WorkflowResult`], [`TriggerResponse`], [`SourceStatus`]: what the
//!   coordinator hands back to callers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A scrape source understood by the external scraper.
///
/// `All` is only a selector: it expands to every concrete source and is never
/// stored on a listing or a run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Linkedin,
    Stepstone,
    All,
}

impl Source {
    /// Every source that maps to a real site.
    pub const CONCRETE: [Source; 2] = [Source::Linkedin, Source::Stepstone];

    /// The value passed to `--source` and stored in the `source` columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Linkedin => "linkedin",
            Source::Stepstone => "stepstone",
            Source::All => "all",
        }
    }

    /// Expand `All` into its constituent sources; concrete sources map to themselves.
    pub fn expand(&self) -> Vec<Source> {
        match self {
            Source::All => Self::CONCRETE.to_vec(),
            other => vec![*other],
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linkedin" => Ok(Source::Linkedin),
            "stepstone" => Ok(Source::Stepstone),
            "all" => Ok(Source::All),
            other => Err(format!("unknown source '{other}'")),
        }
    }
}

/// One job as emitted by the scraper.
///
/// All fields are opaque text. Missing fields deserialize to empty strings so
/// a sparse record is rejected by ingestion validation rather than by the
/// JSON parser.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ScrapedJob {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub salary: String,
    #[serde(default)]
    pub job_type: String,
    #[serde(default)]
    pub posted_at: String,
    #[serde(default)]
    pub role_slug: String,
    #[serde(default)]
    pub source: String,
}

/// The single JSON document written to stdout by the scraper.
///
/// ```text
/// { "success": bool, "keyword": string, "timestamp": ISO8601,
///   "total_jobs": int, "jobs": [ScrapedJob], "error"?: string }
/// ```
///
/// Only `success` is mandatory; failure documents typically carry just
/// `success` and `error`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScrapeResult {
    pub success: bool,
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub total_jobs: usize,
    #[serde(default)]
    pub jobs: Vec<ScrapedJob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A stored listing, unique by `url`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Listing {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub salary: String,
    pub job_type: String,
    pub posted_at: String,
    pub role_slug: String,
    pub source: String,
    /// True only if this listing was first seen in the most recent completed
    /// ingestion cycle for its source.
    pub is_fresh: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle state of a [`RunRecord`]. Only `Running → Completed` and
/// `Running → Failed` are legal, each at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// Audit entry for one execution attempt of the scraper for one source.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RunRecord {
    pub id: i64,
    pub source: String,
    /// Keyword the run was started with; used to restore schedules after a restart.
    pub keyword: Option<String>,
    pub status: RunStatus,
    pub jobs_found: i64,
    pub new_jobs: i64,
    pub started_at: DateTime<Utc>,
    /// Set iff `status != Running`.
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Counts reported by a successful cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub jobs_found: usize,
    pub new_jobs: usize,
}

/// Outcome of one coordinator run. Never an error: failures are described here.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<RunStats>,
    /// Set when the cooldown gate refused the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_source: Option<Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minutes_until_next: Option<i64>,
}

impl WorkflowResult {
    pub fn completed(message: impl Into<String>, stats: RunStats) -> Self {
        Self {
            success: true,
            message: message.into(),
            stats: Some(stats),
            blocked_source: None,
            minutes_until_next: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            stats: None,
            blocked_source: None,
            minutes_until_next: None,
        }
    }

    pub fn blocked(source: Source, minutes_until_next: i64) -> Self {
        Self {
            success: false,
            message: format!(
                "{source} is cooling down; next run allowed in {minutes_until_next} minute(s)"
            ),
            stats: None,
            blocked_source: Some(source),
            minutes_until_next: Some(minutes_until_next),
        }
    }
}

/// Answer to an upstream trigger request.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minutes_until_next: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<RunStats>,
}

impl From<WorkflowResult> for TriggerResponse {
    fn from(result: WorkflowResult) -> Self {
        Self {
            accepted: result.success,
            reason: (!result.success).then_some(result.message),
            minutes_until_next: result.minutes_until_next,
            stats: result.stats,
        }
    }
}

/// Current state of one source as seen by the status query.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source: Source,
    pub last_run: Option<RunRecord>,
    pub can_run: bool,
    pub minutes_until_next_run: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_expand_all() {
        assert_eq!(Source::All.expand(), vec![Source::Linkedin, Source::Stepstone]);
        assert_eq!(Source::Stepstone.expand(), vec![Source::Stepstone]);
    }

    #[test]
    fn test_source_from_str() {
        assert_eq!("LinkedIn".parse::<Source>(), Ok(Source::Linkedin));
        assert_eq!(" all ".parse::<Source>(), Ok(Source::All));
        assert!("indeed".parse::<Source>().is_err());
    }

    #[test]
    fn test_scrape_result_full_document() {
        let json = r#"{
            "success": true,
            "keyword": "firmware",
            "timestamp": "2025-05-06T14:30:00.123456",
            "total_jobs": 1,
            "jobs": [{
                "title": "Firmware Engineer",
                "company": "Acme",
                "location": "Berlin",
                "url": "https://example.com/jobs/1",
                "description": "",
                "salary": "",
                "job_type": "Full-time",
                "posted_at": "2 hours ago",
                "role_slug": "firmware",
                "source": "linkedin"
            }]
        }"#;

        let result: ScrapeResult = serde_json::from_str(json).unwrap();
        assert!(result.success);
        assert_eq!(result.total_jobs, 1);
        assert_eq!(result.jobs[0].role_slug, "firmware");
        assert_eq!(result.error, None);
    }

    #[test]
    fn test_scrape_result_failure_document() {
        let result: ScrapeResult =
            serde_json::from_str(r#"{"success":false,"error":"blocked"}"#).unwrap();
        assert!(!result.success);
        assert!(result.jobs.is_empty());
        assert_eq!(result.error.as_deref(), Some("blocked"));
    }

    #[test]
    fn test_scrape_result_requires_success() {
        assert!(serde_json::from_str::<ScrapeResult>(r#"{"jobs": []}"#).is_err());
    }

    #[test]
    fn test_trigger_response_from_blocked_result() {
        let response = TriggerResponse::from(WorkflowResult::blocked(Source::Linkedin, 90));
        assert!(!response.accepted);
        assert_eq!(response.minutes_until_next, Some(90));
        assert!(response.reason.unwrap().contains("linkedin"));
    }

    #[test]
    fn test_trigger_response_from_success_has_no_reason() {
        let stats = RunStats { jobs_found: 3, new_jobs: 1 };
        let response = TriggerResponse::from(WorkflowResult::completed("ok", stats));
        assert!(response.accepted);
        assert!(response.reason.is_none());
        assert_eq!(response.stats, Some(stats));
    }
}

//! The boundary to the external job scraper.
//!
//! The scraper is an opaque program with a fixed contract:
//!
//! | Channel | Content |
//! |---------|---------|
//! | args | `--keyword K --source linkedin\|stepstone\|all --max-jobs N --headless true\|false` |
//! | stdout | exactly one [`ScrapeResult`] JSON document |
//! | stderr | free-form diagnostics, forwarded to the log and never parsed |
//! | exit code | `0` on success; anything else is a failure |
//!
//! [`ScraperInvoker`] is the capability the coordinator depends on, so tests
//! can swap in a canned implementation instead of spawning a process.
//! [`process::ProcessInvoker`] is the real thing.

use crate::error::PipelineError;
use crate::models::{ScrapeResult, Source};
use crate::utils::truncate_for_log;
use std::future::Future;
use tracing::warn;

pub mod process;

/// Something that can run a scrape for a keyword and source selector.
///
/// On `Ok`, the returned result always has `success == true`.
pub trait ScraperInvoker: Send + Sync + 'static {
    fn invoke(
        &self,
        keyword: &str,
        source: Source,
    ) -> impl Future<Output = Result<ScrapeResult, PipelineError>> + Send;
}

/// Interpret the stdout of a cleanly exited scraper.
///
/// - not a JSON document of the expected shape → [`PipelineError::ContractViolation`]
/// - `"success": false` → [`PipelineError::ScraperReportedFailure`] with the embedded error
/// - otherwise the parsed document
pub fn parse_output(stdout: &[u8]) -> Result<ScrapeResult, PipelineError> {
    let result: ScrapeResult = serde_json::from_slice(stdout).map_err(|e| {
        let preview = String::from_utf8_lossy(stdout);
        PipelineError::ContractViolation(format!(
            "{e} (stdout: {})",
            truncate_for_log(preview.trim(), 300)
        ))
    })?;

    if !result.success {
        let message = result
            .error
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| "scraper reported failure without an error message".to_string());
        return Err(PipelineError::ScraperReportedFailure(message));
    }

    if result.total_jobs != result.jobs.len() {
        warn!(
            total_jobs = result.total_jobs,
            jobs = result.jobs.len(),
            "Scraper total_jobs disagrees with jobs array; using the array"
        );
    }

    Ok(result)
}

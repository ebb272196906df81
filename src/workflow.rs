//! The workflow coordinator: one place where a scrape cycle is run end to end.
//!
//! Manual triggers and scheduled timers both go through
//! [`WorkflowCoordinator::run`]:
//!
//! 1. Sweep runs abandoned by a crashed process
//! 2. Check the cooldown gate for every concrete source (`all` expands)
//! 3. Reserve the sources by opening `running` records
//! 4. Invoke the scraper once for the requested selector
//! 5. Reconcile the returned records per source and close each run record
//! 6. For manual runs, arm the next automatic cycle
//!
//! Nothing past this boundary returns an error to the caller. Every failure
//! becomes a closed `failed` run record and a [`WorkflowResult`] with
//! `success == false`.

use crate::config::PipelineConfig;
use crate::cooldown::{self, CooldownDecision, CooldownGate};
use crate::error::PipelineError;
use crate::ingest::IngestionEngine;
use crate::ledger::RunLedger;
use crate::models::{
    Listing, RunRecord, RunStats, ScrapedJob, Source, SourceStatus, TriggerResponse,
    WorkflowResult,
};
use crate::scheduler::{ArmedTimer, ScheduleKey, Scheduler};
use crate::scraper::ScraperInvoker;
use chrono::Utc;
use itertools::Itertools;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

pub struct WorkflowCoordinator<I: ScraperInvoker> {
    ledger: RunLedger,
    gate: CooldownGate,
    ingest: IngestionEngine,
    invoker: I,
    scheduler: Scheduler,
    interval: Duration,
    default_keyword: String,
    stale_run_grace: chrono::Duration,
}

impl<I: ScraperInvoker> WorkflowCoordinator<I> {
    pub fn new(pool: SqlitePool, invoker: I, config: &PipelineConfig) -> Arc<Self> {
        let ledger = RunLedger::new(pool.clone());
        Arc::new(Self {
            gate: CooldownGate::new(ledger.clone(), config.cooldown_minutes),
            ledger,
            ingest: IngestionEngine::new(pool),
            invoker,
            scheduler: Scheduler::new(),
            interval: config.cooldown(),
            default_keyword: config.default_keyword.clone(),
            stale_run_grace: config.stale_run_grace(),
        })
    }

    /// Run one scrape cycle for `source` and `keyword`.
    #[instrument(level = "info", skip(self))]
    pub async fn run(self: &Arc<Self>, source: Source, keyword: &str, is_manual: bool) -> WorkflowResult {
        let now = Utc::now();

        if let Err(e) = self.ledger.sweep_abandoned(self.stale_run_grace, now).await {
            warn!(error = %e, "Abandoned-run sweep failed; continuing");
        }

        let sources = source.expand();
        for concrete in &sources {
            match self.gate.can_run(*concrete, now).await {
                Ok(decision) if !decision.allowed => {
                    info!(
                        source = %concrete,
                        minutes_until_next = decision.minutes_until_next,
                        "Run blocked by cooldown"
                    );
                    return WorkflowResult::blocked(*concrete, decision.minutes_until_next);
                }
                Ok(_) => {}
                Err(e) => {
                    error!(source = %concrete, error = %e, "Cooldown check failed");
                    return WorkflowResult::failed(format!("cooldown check failed: {e}"));
                }
            }
        }

        let ids = match self
            .ledger
            .open_if_cooled(&sources, keyword, now, self.gate.required_minutes())
            .await
        {
            Ok(ids) => ids,
            Err(PipelineError::CoolingDown { blocked_source, minutes_until_next }) => {
                info!(source = %blocked_source, minutes_until_next, "Run blocked by cooldown at reservation");
                return WorkflowResult::blocked(blocked_source, minutes_until_next);
            }
            Err(e) => {
                warn!(error = %e, "Could not reserve run");
                return WorkflowResult::failed(e.to_string());
            }
        };
        let runs: Vec<(Source, i64)> = sources.iter().copied().zip(ids).collect();

        let result = self.execute(source, keyword, &runs).await;

        if is_manual {
            self.arm(source, keyword, self.interval);
        }
        result
    }

    /// Invoke, reconcile and close the already-opened `runs`.
    async fn execute(&self, source: Source, keyword: &str, runs: &[(Source, i64)]) -> WorkflowResult {
        let scraped = match self.invoker.invoke(keyword, source).await {
            Ok(scraped) => scraped,
            Err(e) => {
                error!(%source, error = %e, "Scrape failed");
                let message = e.to_string();
                self.fail_runs(runs, &message).await;
                return WorkflowResult::failed(format!("scrape failed for {source}: {message}"));
            }
        };

        let mut batches = partition_jobs(scraped.jobs, source);
        let mut totals = RunStats::default();
        let mut failures = Vec::new();

        for (concrete, id) in runs {
            let batch = batches.remove(concrete).unwrap_or_default();
            match self.ingest.reconcile(&batch, *concrete, Utc::now()).await {
                Ok(stats) => {
                    if let Err(e) = self
                        .ledger
                        .complete(*id, stats.total_seen, stats.new_count, Utc::now())
                        .await
                    {
                        error!(id, error = %e, "Could not close run as completed");
                    }
                    totals.jobs_found += stats.total_seen;
                    totals.new_jobs += stats.new_count;
                }
                Err(e) => {
                    error!(source = %concrete, error = %e, "Ingestion failed");
                    let message = e.to_string();
                    self.fail_runs(&[(*concrete, *id)], &message).await;
                    failures.push(format!("{concrete}: {message}"));
                }
            }
        }

        if failures.is_empty() {
            info!(%source, jobs_found = totals.jobs_found, new_jobs = totals.new_jobs, "Run completed");
            WorkflowResult::completed(
                format!(
                    "Scraped {} jobs ({} new) for {source}",
                    totals.jobs_found, totals.new_jobs
                ),
                totals,
            )
        } else {
            WorkflowResult::failed(format!("ingestion failed for {}", failures.join("; ")))
        }
    }

    async fn fail_runs(&self, runs: &[(Source, i64)], message: &str) {
        for (_, id) in runs {
            if let Err(e) = self.ledger.fail(*id, message, Utc::now()).await {
                error!(id, error = %e, "Could not close run as failed");
            }
        }
    }

    /// Upstream trigger: a manual run, keyword defaulting from config.
    pub async fn trigger_run(self: &Arc<Self>, source: Source, keyword: Option<&str>) -> TriggerResponse {
        let keyword = keyword
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .unwrap_or(self.default_keyword.as_str())
            .to_string();
        self.run(source, &keyword, true).await.into()
    }

    /// Latest run and cooldown state. For `all`, the gate is closed if either
    /// source is closed and the wait is the longer of the two.
    pub async fn get_status(&self, source: Source) -> Result<SourceStatus, PipelineError> {
        let now = Utc::now();
        let mut last_run: Option<RunRecord> = None;
        let mut can_run = true;
        let mut minutes_until_next_run = 0;

        for concrete in source.expand() {
            if let Some(record) = self.ledger.last_run(concrete).await? {
                if last_run.as_ref().is_none_or(|r| record.started_at > r.started_at) {
                    last_run = Some(record);
                }
            }
            let CooldownDecision { allowed, minutes_until_next } = self.gate.can_run(concrete, now).await?;
            can_run &= allowed;
            minutes_until_next_run = minutes_until_next_run.max(minutes_until_next);
        }

        Ok(SourceStatus {
            source,
            last_run,
            can_run,
            minutes_until_next_run,
        })
    }

    pub async fn recent_runs(
        &self,
        source: Option<Source>,
        limit: u32,
    ) -> Result<Vec<RunRecord>, PipelineError> {
        self.ledger.recent(source, limit).await
    }

    pub async fn listings(
        &self,
        source: Option<Source>,
        fresh_only: bool,
        limit: u32,
    ) -> Result<Vec<Listing>, PipelineError> {
        self.ingest.listings(source, fresh_only, limit).await
    }

    /// Re-arm timers from history after a restart.
    ///
    /// Each concrete source whose latest completed run carries a keyword is
    /// armed for the rest of its cooldown, or immediately if it has elapsed.
    #[instrument(level = "info", skip(self))]
    pub async fn restore_schedules(self: &Arc<Self>) -> Result<usize, PipelineError> {
        let now = Utc::now();
        let mut restored = 0;

        for source in Source::CONCRETE {
            let Some(record) = self.ledger.last_completed(source).await? else {
                continue;
            };
            let Some(keyword) = record.keyword.filter(|k| !k.trim().is_empty()) else {
                continue;
            };
            let decision = cooldown::evaluate(record.completed_at, now, self.gate.required_minutes());
            let delay = Duration::from_secs(decision.minutes_until_next.max(0) as u64 * 60);
            self.arm(source, &keyword, delay);
            restored += 1;
        }

        info!(restored, "Restored schedules from run history");
        Ok(restored)
    }

    pub async fn sweep(&self) -> Result<u64, PipelineError> {
        self.ledger
            .sweep_abandoned(self.stale_run_grace, Utc::now())
            .await
    }

    pub fn clear_schedules(&self) -> usize {
        self.scheduler.clear_all()
    }

    pub fn armed_schedules(&self) -> Vec<ArmedTimer> {
        self.scheduler.armed_keys()
    }

    fn arm(self: &Arc<Self>, source: Source, keyword: &str, delay: Duration) {
        let this = Arc::clone(self);
        let owned = keyword.to_string();
        self.scheduler.arm_next(ScheduleKey::new(source, keyword), delay, async move {
            this.run_scheduled(source, owned).await;
        });
    }

    /// Body of a fired timer: an automatic run, then the next timer.
    async fn run_scheduled(self: Arc<Self>, source: Source, keyword: String) {
        let result = self.run(source, &keyword, false).await;
        if result.success {
            info!(%source, %keyword, message = %result.message, "Scheduled run finished");
        } else {
            warn!(%source, %keyword, message = %result.message, "Scheduled run did not succeed");
        }
        self.arm(source, &keyword, self.interval);
    }
}

/// Split scraped records by the source they will be stored under.
///
/// A concrete selector claims every record. For `all`, each record is routed
/// by its own `source` field and records naming no known site are dropped.
fn partition_jobs(jobs: Vec<ScrapedJob>, requested: Source) -> HashMap<Source, Vec<ScrapedJob>> {
    if requested != Source::All {
        return HashMap::from([(requested, jobs)]);
    }

    jobs.into_iter()
        .filter_map(|job| match job.source.parse::<Source>() {
            Ok(source) if source != Source::All => Some((source, job)),
            _ => {
                warn!(url = %job.url, source = %job.source, "Dropping record with unknown source");
                None
            }
        })
        .into_group_map()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{RunStatus, ScrapeResult};
    use crate::scraper::parse_output;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns the same stdout document on every call.
    struct CannedInvoker {
        stdout: String,
        calls: AtomicUsize,
    }

    impl ScraperInvoker for CannedInvoker {
        async fn invoke(&self, _keyword: &str, _source: Source) -> Result<ScrapeResult, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            parse_output(self.stdout.as_bytes())
        }
    }

    fn job(url: &str, title: &str, source: &str) -> serde_json::Value {
        json!({ "title": title, "company": "Acme", "url": url, "source": source })
    }

    fn success(jobs: Vec<serde_json::Value>) -> String {
        json!({ "success": true, "keyword": "rust", "total_jobs": jobs.len(), "jobs": jobs }).to_string()
    }

    async fn setup(stdout: String) -> (Arc<WorkflowCoordinator<CannedInvoker>>, SqlitePool) {
        let db = Database::in_memory().await.unwrap();
        let pool = db.pool().clone();
        let invoker = CannedInvoker {
            stdout,
            calls: AtomicUsize::new(0),
        };
        let coordinator = WorkflowCoordinator::new(pool.clone(), invoker, &PipelineConfig::default());
        (coordinator, pool)
    }

    async fn listing_count(pool: &SqlitePool, source: &str) -> i64 {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM listings WHERE source = ?")
            .bind(source)
            .fetch_one(pool)
            .await
            .unwrap();
        n
    }

    /// Seed a completed run `minutes_ago` in the past.
    async fn seed_completed(ledger: &RunLedger, source: Source, minutes_ago: i64) {
        let at = Utc::now() - ChronoDuration::minutes(minutes_ago);
        let ids = ledger.open(&[source], "rust", at).await.unwrap();
        ledger.complete(ids[0], 0, 0, at).await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_run_stores_listings_and_arms_schedule() {
        let stdout = success(vec![
            job("https://example.com/jobs/1", "Firmware Engineer", "linkedin"),
            job("https://example.com/jobs/2", "PCB Designer", "linkedin"),
        ]);
        let (coordinator, pool) = setup(stdout).await;

        let response = coordinator.trigger_run(Source::Linkedin, Some("rust")).await;
        assert!(response.accepted, "{:?}", response.reason);
        assert_eq!(response.stats, Some(RunStats { jobs_found: 2, new_jobs: 2 }));
        assert_eq!(listing_count(&pool, "linkedin").await, 2);

        let record = coordinator.ledger.last_run(Source::Linkedin).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.jobs_found, 2);
        assert_eq!(record.new_jobs, 2);

        let armed = coordinator.armed_schedules();
        assert_eq!(armed.len(), 1);
        assert_eq!(armed[0].key, ScheduleKey::new(Source::Linkedin, "rust"));
        coordinator.clear_schedules();
    }

    #[tokio::test]
    async fn test_trigger_without_keyword_uses_default() {
        let (coordinator, _pool) = setup(success(vec![])).await;

        coordinator.trigger_run(Source::Stepstone, None).await;
        let record = coordinator.ledger.last_run(Source::Stepstone).await.unwrap().unwrap();
        assert_eq!(record.keyword.as_deref(), Some("embedded"));
        coordinator.clear_schedules();
    }

    #[tokio::test]
    async fn test_reported_failure_closes_run_as_failed() {
        let (coordinator, _pool) = setup(r#"{"success":false,"error":"blocked"}"#.to_string()).await;

        let result = coordinator.run(Source::Linkedin, "rust", false).await;
        assert!(!result.success);
        assert!(result.message.contains("blocked"));

        let record = coordinator.ledger.last_run(Source::Linkedin).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("blocked"));
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_contract_violation_closes_run_as_failed() {
        let (coordinator, _pool) = setup("Traceback (most recent call last):".to_string()).await;

        let result = coordinator.run(Source::Stepstone, "rust", false).await;
        assert!(!result.success);
        assert_eq!(
            coordinator.ledger.count(Source::Stepstone, RunStatus::Failed).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_cooldown_blocks_second_trigger_without_new_record() {
        let (coordinator, _pool) = setup(success(vec![])).await;
        seed_completed(&coordinator.ledger, Source::Linkedin, 10).await;

        let response = coordinator.trigger_run(Source::Linkedin, Some("rust")).await;
        assert!(!response.accepted);
        assert_eq!(response.minutes_until_next, Some(110));

        assert_eq!(coordinator.invoker.calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.recent_runs(Some(Source::Linkedin), 10).await.unwrap().len(), 1);
        assert!(coordinator.armed_schedules().is_empty());
    }

    #[tokio::test]
    async fn test_all_is_blocked_by_either_source() {
        let (coordinator, _pool) = setup(success(vec![])).await;
        seed_completed(&coordinator.ledger, Source::Stepstone, 30).await;

        let result = coordinator.run(Source::All, "rust", true).await;
        assert!(!result.success);
        assert_eq!(result.blocked_source, Some(Source::Stepstone));
        assert_eq!(result.minutes_until_next, Some(90));
        assert!(coordinator.ledger.last_run(Source::Linkedin).await.unwrap().is_none());
        assert_eq!(coordinator.invoker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_partitions_records_by_source() {
        let stdout = success(vec![
            job("https://example.com/l/1", "Embedded Engineer", "linkedin"),
            job("https://example.com/l/2", "Software Engineer", "linkedin"),
            job("https://example.com/s/1", "Hardware Engineer", "stepstone"),
            job("https://example.com/x/1", "Anything", "indeed"),
        ]);
        let (coordinator, pool) = setup(stdout).await;

        let result = coordinator.run(Source::All, "rust", false).await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.stats, Some(RunStats { jobs_found: 3, new_jobs: 3 }));
        assert_eq!(coordinator.invoker.calls.load(Ordering::SeqCst), 1);

        assert_eq!(listing_count(&pool, "linkedin").await, 2);
        assert_eq!(listing_count(&pool, "stepstone").await, 1);

        let linkedin = coordinator.ledger.last_run(Source::Linkedin).await.unwrap().unwrap();
        let stepstone = coordinator.ledger.last_run(Source::Stepstone).await.unwrap().unwrap();
        assert_eq!((linkedin.status, linkedin.jobs_found), (RunStatus::Completed, 2));
        assert_eq!((stepstone.status, stepstone.jobs_found), (RunStatus::Completed, 1));
    }

    #[tokio::test]
    async fn test_open_run_refuses_concurrent_attempt() {
        let (coordinator, _pool) = setup(success(vec![])).await;
        coordinator
            .ledger
            .open(&[Source::Linkedin], "rust", Utc::now())
            .await
            .unwrap();

        let result = coordinator.run(Source::Linkedin, "rust", true).await;
        assert!(!result.success);
        assert!(result.message.contains("already in progress"), "{}", result.message);
        assert_eq!(coordinator.invoker.calls.load(Ordering::SeqCst), 0);
        assert!(coordinator.armed_schedules().is_empty());
    }

    #[tokio::test]
    async fn test_automatic_run_does_not_arm() {
        let (coordinator, _pool) = setup(success(vec![])).await;

        let result = coordinator.run(Source::Stepstone, "rust", false).await;
        assert!(result.success);
        assert!(coordinator.armed_schedules().is_empty());
    }

    #[tokio::test]
    async fn test_status_reports_cooldown_and_last_run() {
        let (coordinator, _pool) = setup(success(vec![])).await;

        let fresh = coordinator.get_status(Source::Linkedin).await.unwrap();
        assert!(fresh.can_run);
        assert_eq!(fresh.minutes_until_next_run, 0);
        assert!(fresh.last_run.is_none());

        seed_completed(&coordinator.ledger, Source::Linkedin, 30).await;
        let status = coordinator.get_status(Source::Linkedin).await.unwrap();
        assert!(!status.can_run);
        assert_eq!(status.minutes_until_next_run, 90);
        assert!(status.last_run.is_some());

        let all = coordinator.get_status(Source::All).await.unwrap();
        assert!(!all.can_run);
        assert_eq!(all.minutes_until_next_run, 90);
    }

    #[tokio::test]
    async fn test_restore_schedules_from_history() {
        let (coordinator, _pool) = setup(success(vec![])).await;
        seed_completed(&coordinator.ledger, Source::Linkedin, 30).await;

        assert_eq!(coordinator.restore_schedules().await.unwrap(), 1);
        let armed = coordinator.armed_schedules();
        assert_eq!(armed.len(), 1);
        assert_eq!(armed[0].key, ScheduleKey::new(Source::Linkedin, "rust"));

        let wait = armed[0].due_at - Utc::now();
        assert!(wait > ChronoDuration::minutes(85) && wait <= ChronoDuration::minutes(90));
        coordinator.clear_schedules();
    }

    #[tokio::test]
    async fn test_fired_timer_runs_automatic_cycle_and_rearms() {
        let (coordinator, _pool) = setup(success(vec![])).await;
        coordinator.arm(Source::Linkedin, "rust", Duration::from_millis(20));

        let waited = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let fired = coordinator.invoker.calls.load(Ordering::SeqCst) == 1;
                if fired && !coordinator.armed_schedules().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "scheduled run never fired");

        let record = coordinator.ledger.last_run(Source::Linkedin).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Completed);

        let armed = coordinator.armed_schedules();
        assert_eq!(armed.len(), 1);
        assert!(armed[0].due_at - Utc::now() > ChronoDuration::minutes(100));
        coordinator.clear_schedules();
    }

    #[test]
    fn test_partition_concrete_claims_everything() {
        let jobs = vec![ScrapedJob {
            url: "https://example.com/1".into(),
            source: "whatever".into(),
            ..ScrapedJob::default()
        }];
        let batches = partition_jobs(jobs, Source::Stepstone);
        assert_eq!(batches[&Source::Stepstone].len(), 1);
    }
}

//! Durable log of scraper runs.
//!
//! Each [`RunRecord`] is opened as `running` and closed exactly once as
//! `completed` or `failed`. The `running` insert is guarded by a partial
//! unique index on `source`, so opening a run doubles as a per-source
//! reservation: a second concurrent attempt fails with
//! [`PipelineError::AlreadyRunning`] instead of launching a second scraper.
//! [`RunLedger::open_if_cooled`] also re-reads the last completion inside the
//! reserving transaction, after the insert has taken the write lock, so a run
//! that completed between the gate check and the reservation still blocks.

use crate::cooldown;
use crate::error::PipelineError;
use crate::models::{RunRecord, Source};
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::{info, instrument, warn};

const RUN_COLUMNS: &str =
    "id, source, keyword, status, jobs_found, new_jobs, started_at, completed_at, error";

#[derive(Debug, Clone)]
pub struct RunLedger {
    pool: SqlitePool,
}

impl RunLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open one `running` record per source, all or nothing.
    ///
    /// Returns the new record ids in the same order as `sources`. If any
    /// source already has an open run, nothing is written.
    pub async fn open(
        &self,
        sources: &[Source],
        keyword: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, PipelineError> {
        self.reserve(sources, keyword, now, None).await
    }

    /// Like [`RunLedger::open`], but refuses with
    /// [`PipelineError::CoolingDown`] when a source completed less than
    /// `required_minutes` before `now`.
    pub async fn open_if_cooled(
        &self,
        sources: &[Source],
        keyword: &str,
        now: DateTime<Utc>,
        required_minutes: u32,
    ) -> Result<Vec<i64>, PipelineError> {
        self.reserve(sources, keyword, now, Some(required_minutes)).await
    }

    #[instrument(level = "info", skip(self))]
    async fn reserve(
        &self,
        sources: &[Source],
        keyword: &str,
        now: DateTime<Utc>,
        required_minutes: Option<u32>,
    ) -> Result<Vec<i64>, PipelineError> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(sources.len());

        for source in sources {
            let inserted = sqlx::query(
                "INSERT INTO run_records (source, keyword, status, started_at) VALUES (?, ?, 'running', ?)",
            )
            .bind(source.as_str())
            .bind(keyword)
            .bind(now)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(done) => ids.push(done.last_insert_rowid()),
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    warn!(%source, "Run already in progress; reservation refused");
                    return Err(PipelineError::AlreadyRunning(source.to_string()));
                }
                Err(e) => return Err(e.into()),
            }

            let Some(required) = required_minutes else {
                continue;
            };
            let last_completed_at: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
                "SELECT completed_at FROM run_records WHERE source = ? AND status = 'completed'
                 ORDER BY completed_at DESC, id DESC LIMIT 1",
            )
            .bind(source.as_str())
            .fetch_optional(&mut *tx)
            .await?;
            let last_completed_at = last_completed_at.and_then(|(at,)| at);

            let decision = cooldown::evaluate(last_completed_at, now, required);
            if !decision.allowed {
                warn!(%source, minutes_until_next = decision.minutes_until_next, "Completed run landed before reservation");
                return Err(PipelineError::CoolingDown {
                    blocked_source: *source,
                    minutes_until_next: decision.minutes_until_next,
                });
            }
        }

        tx.commit().await?;
        info!(?ids, "Opened run records");
        Ok(ids)
    }

    /// Close a run as completed with its counts.
    pub async fn complete(
        &self,
        id: i64,
        jobs_found: usize,
        new_jobs: usize,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let done = sqlx::query(
            "UPDATE run_records SET status = 'completed', jobs_found = ?, new_jobs = ?, completed_at = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(jobs_found as i64)
        .bind(new_jobs as i64)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() != 1 {
            return Err(PipelineError::RunNotOpen(id));
        }
        info!(id, jobs_found, new_jobs, "Run completed");
        Ok(())
    }

    /// Close a run as failed with the error text.
    pub async fn fail(&self, id: i64, error: &str, now: DateTime<Utc>) -> Result<(), PipelineError> {
        let done = sqlx::query(
            "UPDATE run_records SET status = 'failed', error = ?, completed_at = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() != 1 {
            return Err(PipelineError::RunNotOpen(id));
        }
        warn!(id, error, "Run failed");
        Ok(())
    }

    /// Most recent completed run for `source`, by completion time.
    pub async fn last_completed(&self, source: Source) -> Result<Option<RunRecord>, PipelineError> {
        let record = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {RUN_COLUMNS} FROM run_records
             WHERE source = ? AND status = 'completed'
             ORDER BY completed_at DESC, id DESC LIMIT 1"
        ))
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Most recent run for `source` in any state.
    pub async fn last_run(&self, source: Source) -> Result<Option<RunRecord>, PipelineError> {
        let record = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {RUN_COLUMNS} FROM run_records WHERE source = ? ORDER BY started_at DESC, id DESC LIMIT 1"
        ))
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Newest-first run history, optionally narrowed to one source.
    ///
    /// `Source::All` behaves like no filter.
    pub async fn recent(
        &self,
        source: Option<Source>,
        limit: u32,
    ) -> Result<Vec<RunRecord>, PipelineError> {
        let records = match source.filter(|s| *s != Source::All) {
            Some(source) => {
                sqlx::query_as::<_, RunRecord>(&format!(
                    "SELECT {RUN_COLUMNS} FROM run_records WHERE source = ?
                     ORDER BY started_at DESC, id DESC LIMIT ?"
                ))
                .bind(source.as_str())
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, RunRecord>(&format!(
                    "SELECT {RUN_COLUMNS} FROM run_records ORDER BY started_at DESC, id DESC LIMIT ?"
                ))
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(records)
    }

    /// Close every run left `running` for longer than `grace` as failed.
    ///
    /// A host crash mid-run leaves its record open forever; this is the sweep
    /// that releases the per-source reservation again.
    #[instrument(level = "info", skip(self))]
    pub async fn sweep_abandoned(
        &self,
        grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, PipelineError> {
        let cutoff = now - grace;
        let done = sqlx::query(
            "UPDATE run_records SET status = 'failed', completed_at = ?,
                error = 'abandoned: run never closed (process crashed or was killed)'
             WHERE status = 'running' AND started_at < ?",
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let swept = done.rows_affected();
        if swept > 0 {
            warn!(swept, "Marked abandoned runs as failed");
        }
        Ok(swept)
    }
}

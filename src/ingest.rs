//! Reconcile a scraped batch into the `listings` table.
//!
//! One call is one ingestion cycle for one source, executed in a single
//! transaction:
//!
//! 1. every stored listing of the source loses its fresh flag;
//! 2. each incoming record is upserted by canonical URL inside its own
//!    savepoint. A known URL only has its `last_seen_at`/`updated_at`
//!    advanced; an unknown URL is inserted as fresh;
//! 3. the transaction commits.
//!
//! "Fresh" therefore means "first seen in the latest completed cycle for this
//! source". A cycle that returns nothing leaves every listing of that source
//! stale. A record that fails to store is rolled back to its savepoint and
//! skipped; the rest of the batch still commits. If the transaction itself
//! fails nothing changes, so freshness is never half-updated.

use crate::error::PipelineError;
use crate::models::{Listing, ScrapedJob, Source};
use crate::utils::{canonical_url, classify_role, clean_text, truncate_chars};
use chrono::{DateTime, Utc};
use itertools::{Either, Itertools};
use serde::Serialize;
use sqlx::{Acquire, SqliteConnection, SqlitePool};
use tracing::{info, instrument, warn};

const MAX_TEXT_CHARS: usize = 500;
const MAX_URL_CHARS: usize = 1000;
const MAX_SHORT_CHARS: usize = 200;

/// Counts from one reconcile cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    /// Number of incoming records, including ones later skipped.
    pub total_seen: usize,
    /// Listings inserted for the first time in this cycle.
    pub new_count: usize,
    /// Records rejected by validation or by the store.
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct IngestionEngine {
    pool: SqlitePool,
}

/// A validated, normalized record ready to be written.
#[derive(Debug, Clone, PartialEq)]
struct NewListing {
    url: String,
    title: String,
    company: String,
    location: String,
    description: String,
    salary: String,
    job_type: String,
    posted_at: String,
    role_slug: String,
    source: String,
}

impl NewListing {
    fn from_job(job: &ScrapedJob, source: Source) -> Result<Self, &'static str> {
        let url = canonical_url(&job.url).ok_or("missing url")?;
        let title = truncate_chars(&clean_text(&job.title), MAX_TEXT_CHARS);
        if title.is_empty() {
            return Err("missing title");
        }

        let role_slug = match job.role_slug.trim() {
            "" => classify_role(&title).to_string(),
            slug => slug.to_string(),
        };

        Ok(Self {
            url: truncate_chars(&url, MAX_URL_CHARS),
            company: truncate_chars(&clean_text(&job.company), MAX_TEXT_CHARS),
            location: truncate_chars(&clean_text(&job.location), MAX_TEXT_CHARS),
            description: job.description.clone(),
            salary: truncate_chars(job.salary.trim(), MAX_SHORT_CHARS),
            job_type: truncate_chars(job.job_type.trim(), MAX_SHORT_CHARS),
            posted_at: truncate_chars(job.posted_at.trim(), MAX_SHORT_CHARS),
            role_slug,
            source: source.as_str().to_string(),
            title,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upserted {
    Inserted,
    Revisited,
}

impl IngestionEngine {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run one ingestion cycle for `source`.
    #[instrument(level = "info", skip(self, records), fields(records = records.len()))]
    pub async fn reconcile(
        &self,
        records: &[ScrapedJob],
        source: Source,
        now: DateTime<Utc>,
    ) -> Result<ReconcileStats, PipelineError> {
        let mut stats = ReconcileStats {
            total_seen: records.len(),
            ..ReconcileStats::default()
        };

        let (valid, rejected): (Vec<NewListing>, Vec<(&ScrapedJob, &str)>) =
            records.iter().partition_map(|job| match NewListing::from_job(job, source) {
                Ok(listing) => Either::Left(listing),
                Err(reason) => Either::Right((job, reason)),
            });
        for (job, reason) in &rejected {
            warn!(url = %job.url, title = %job.title, reason, "Skipping invalid record");
        }
        stats.skipped += rejected.len();

        let mut tx = self.pool.begin().await?;

        let cleared = sqlx::query("UPDATE listings SET is_fresh = 0 WHERE source = ? AND is_fresh = 1")
            .bind(source.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let mut revisited = 0usize;
        // In batch order: a URL repeated within the batch takes the revisit
        // path and ends up stale, like any other re-sighting.
        for listing in &valid {
            let mut savepoint = tx.begin().await?;
            match upsert(&mut savepoint, listing, now).await {
                Ok(outcome) => {
                    savepoint.commit().await?;
                    match outcome {
                        Upserted::Inserted => stats.new_count += 1,
                        Upserted::Revisited => revisited += 1,
                    }
                }
                Err(e) => {
                    warn!(url = %listing.url, error = %e, "Failed to store record; skipping");
                    savepoint.rollback().await?;
                    stats.skipped += 1;
                }
            }
        }

        tx.commit().await?;

        info!(
            %source,
            total_seen = stats.total_seen,
            new = stats.new_count,
            revisited,
            skipped = stats.skipped,
            cleared,
            "Reconciled batch"
        );
        Ok(stats)
    }

    /// Stored listings, newest first sighting first.
    ///
    /// `Source::All` or `None` lists every source; `fresh_only` keeps the
    /// listings first seen in their source's latest cycle.
    pub async fn listings(
        &self,
        source: Option<Source>,
        fresh_only: bool,
        limit: u32,
    ) -> Result<Vec<Listing>, PipelineError> {
        let source = source.filter(|s| *s != Source::All).map(|s| s.as_str());
        let listings = sqlx::query_as::<_, Listing>(
            "SELECT * FROM listings
             WHERE (?1 IS NULL OR source = ?1) AND (?2 = 0 OR is_fresh = 1)
             ORDER BY first_seen_at DESC, id DESC LIMIT ?3",
        )
        .bind(source)
        .bind(fresh_only)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(listings)
    }
}

async fn upsert(
    conn: &mut SqliteConnection,
    listing: &NewListing,
    now: DateTime<Utc>,
) -> Result<Upserted, sqlx::Error> {
    let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM listings WHERE url = ?")
        .bind(&listing.url)
        .fetch_optional(&mut *conn)
        .await?;

    if let Some((id,)) = existing {
        sqlx::query("UPDATE listings SET last_seen_at = ?, updated_at = ?, is_fresh = 0 WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&mut *conn)
            .await?;
        return Ok(Upserted::Revisited);
    }

    sqlx::query(
        "INSERT INTO listings (
            url, title, company, location, description, salary, job_type, posted_at,
            role_slug, source, is_fresh, first_seen_at, last_seen_at, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?)",
    )
    .bind(&listing.url)
    .bind(&listing.title)
    .bind(&listing.company)
    .bind(&listing.location)
    .bind(&listing.description)
    .bind(&listing.salary)
    .bind(&listing.job_type)
    .bind(&listing.posted_at)
    .bind(&listing.role_slug)
    .bind(&listing.source)
    .bind(now)
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(Upserted::Inserted)
}

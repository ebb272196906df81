//! Per-source cooldown gate.
//!
//! A source may run again once `cooldown_minutes` have passed since its most
//! recent *completed* run. Failed and still-running records are ignored: a
//! failure only records a fact, it never extends the wait, and a run that
//! crashed mid-flight never blocks the gate.

use crate::error::PipelineError;
use crate::ledger::RunLedger;
use crate::models::Source;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

/// Result of asking the gate whether a source may run now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CooldownDecision {
    pub allowed: bool,
    /// Whole minutes (rounded up) until the gate opens; zero when allowed.
    pub minutes_until_next: i64,
}

impl CooldownDecision {
    pub const OPEN: CooldownDecision = CooldownDecision {
        allowed: true,
        minutes_until_next: 0,
    };
}

#[derive(Debug, Clone)]
pub struct CooldownGate {
    ledger: RunLedger,
    required_minutes: u32,
}

impl CooldownGate {
    pub fn new(ledger: RunLedger, required_minutes: u32) -> Self {
        Self {
            ledger,
            required_minutes,
        }
    }

    pub fn required_minutes(&self) -> u32 {
        self.required_minutes
    }

    pub async fn can_run(
        &self,
        source: Source,
        now: DateTime<Utc>,
    ) -> Result<CooldownDecision, PipelineError> {
        let last = self.ledger.last_completed(source).await?;
        let decision = evaluate(
            last.and_then(|r| r.completed_at),
            now,
            self.required_minutes,
        );
        debug!(%source, ?decision, "Cooldown check");
        Ok(decision)
    }
}

/// Pure cooldown arithmetic.
///
/// `minutes_until_next = ceil(required - elapsed)`, with elapsed measured in
/// fractional minutes and clamped at zero so a completion timestamp in the
/// future never yields more than `required`.
pub fn evaluate(
    last_completed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    required_minutes: u32,
) -> CooldownDecision {
    let Some(completed_at) = last_completed_at else {
        return CooldownDecision::OPEN;
    };

    let elapsed = ((now - completed_at).num_milliseconds() as f64 / 60_000.0).max(0.0);
    let required = f64::from(required_minutes);

    if elapsed >= required {
        CooldownDecision::OPEN
    } else {
        CooldownDecision {
            allowed: false,
            minutes_until_next: (required - elapsed).ceil() as i64,
        }
    }
}

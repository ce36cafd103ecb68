//! Delayed job queue on the `jobs` table.
//!
//! Delivery is at-least-once: a claimed job holds a lease, and a job whose
//! worker disappeared is claimed again once the lease runs out. Nothing here
//! prevents a job from running twice; every completion handler guards on the
//! value carried in its payload instead.

use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Deferred state transition. Each payload names the exact value the target
/// field must still hold when the job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Job {
    EndStructureUpgrade {
        planet_id: String,
        structure: String,
        construction_end_ms: i64,
    },
    EndResearch {
        user_id: String,
        technology: String,
        research_finish_time_ms: i64,
    },
    ProcessShipyardQueue {
        planet_id: String,
        item_finish_ms: i64,
    },
    CompleteFleetMovement {
        movement_id: String,
        arrival_time_ms: i64,
    },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EndStructureUpgrade { .. } => "endStructureUpgrade",
            Self::EndResearch { .. } => "endResearch",
            Self::ProcessShipyardQueue { .. } => "processShipyardQueue",
            Self::CompleteFleetMovement { .. } => "completeFleetMovement",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub job: Job,
    pub delay_ms: i64,
}

impl ScheduleRequest {
    /// Fires at `fire_at_ms`, or immediately if that is already past.
    pub fn at(job: Job, fire_at_ms: i64, now_ms: i64) -> Self {
        Self {
            job,
            delay_ms: (fire_at_ms - now_ms).max(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: i64,
    pub max_backoff_ms: i64,
    /// Added to every delay before a job becomes due.
    pub commit_slack_ms: i64,
    pub lease_ms: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            commit_slack_ms: 250,
            lease_ms: 30_000,
        }
    }
}

impl SchedulerConfig {
    /// Delay before retry number `attempt` (1-based): base doubled per attempt, capped.
    pub fn backoff_ms(&self, attempt: u32) -> i64 {
        let exp = attempt.saturating_sub(1).min(30);
        self.base_backoff_ms
            .saturating_mul(1_i64 << exp)
            .min(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub id: String,
    pub season: String,
    pub job: Job,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub season: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub run_at_ms: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
}

pub fn enqueue(
    conn: &Connection,
    season: &str,
    req: &ScheduleRequest,
    now_ms: i64,
    cfg: &SchedulerConfig,
) -> anyhow::Result<String> {
    let id = super::new_id("job");
    let run_at = now_ms + req.delay_ms.max(0) + cfg.commit_slack_ms;
    let payload_json = serde_json::to_string(&req.job)?;
    conn.execute(
        "INSERT INTO jobs (id, season, kind, payload_json, status, run_at_ms, created_at_ms, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?6, ?6)",
        (&id, season, req.job.kind(), &payload_json, run_at, now_ms),
    )
    .with_context(|| format!("enqueue {}", req.job.kind()))?;
    debug!(job_id = %id, kind = req.job.kind(), run_at_ms = run_at, "job scheduled");
    Ok(id)
}

/// Atomically takes the oldest due job (or one whose lease expired) and marks
/// it running. Undecodable payloads are failed on the spot.
pub fn claim_next(
    conn: &mut Connection,
    now_ms: i64,
    cfg: &SchedulerConfig,
) -> anyhow::Result<Option<ClaimedJob>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    // A worker that died on the final attempt never calls mark_failed.
    let exhausted = tx.execute(
        "UPDATE jobs SET status = 'failed', last_error = 'lease expired on final attempt',
                updated_at_ms = ?1
         WHERE status = 'running' AND lease_until_ms < ?1 AND attempts >= ?2",
        (now_ms, i64::from(cfg.max_attempts)),
    )?;
    if exhausted > 0 {
        warn!(count = exhausted, "dropping jobs whose last attempt never finished");
    }
    let row: Option<(String, String, String, i64)> = tx
        .query_row(
            "SELECT id, season, payload_json, attempts FROM jobs
             WHERE (status = 'queued' AND run_at_ms <= ?1)
                OR (status = 'running' AND lease_until_ms < ?1)
             ORDER BY run_at_ms ASC, rowid ASC
             LIMIT 1",
            [now_ms],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((id, season, payload_json, attempts)) = row else {
        tx.commit()?;
        return Ok(None);
    };

    let job: Job = match serde_json::from_str(&payload_json) {
        Ok(job) => job,
        Err(e) => {
            warn!(job_id = %id, error = %e, "dropping job with undecodable payload");
            tx.execute(
                "UPDATE jobs SET status = 'failed', last_error = ?1, updated_at_ms = ?2 WHERE id = ?3",
                (e.to_string(), now_ms, &id),
            )?;
            tx.commit()?;
            return Ok(None);
        }
    };

    let attempts = u32::try_from(attempts).unwrap_or(0) + 1;
    tx.execute(
        "UPDATE jobs SET status = 'running', attempts = ?1, lease_until_ms = ?2, updated_at_ms = ?3
         WHERE id = ?4",
        (i64::from(attempts), now_ms + cfg.lease_ms, now_ms, &id),
    )?;
    tx.commit()?;
    Ok(Some(ClaimedJob {
        id,
        season,
        job,
        attempts,
    }))
}

pub fn mark_done(conn: &Connection, id: &str, now_ms: i64) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE jobs SET status = 'done', last_error = NULL, updated_at_ms = ?1 WHERE id = ?2",
        (now_ms, id),
    )?;
    Ok(())
}

/// Requeues with backoff, or marks the job failed once attempts are used up.
/// Returns true when the job was dropped.
pub fn mark_failed(
    conn: &Connection,
    job: &ClaimedJob,
    error: &str,
    now_ms: i64,
    cfg: &SchedulerConfig,
) -> anyhow::Result<bool> {
    if job.attempts >= cfg.max_attempts {
        conn.execute(
            "UPDATE jobs SET status = 'failed', last_error = ?1, updated_at_ms = ?2 WHERE id = ?3",
            (error, now_ms, &job.id),
        )?;
        return Ok(true);
    }
    let run_at = now_ms + cfg.backoff_ms(job.attempts);
    conn.execute(
        "UPDATE jobs SET status = 'queued', run_at_ms = ?1, last_error = ?2, updated_at_ms = ?3
         WHERE id = ?4",
        (run_at, error, now_ms, &job.id),
    )?;
    Ok(false)
}

pub fn list(conn: &Connection, limit: u32) -> anyhow::Result<Vec<JobRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, season, kind, payload_json, status, run_at_ms, attempts, last_error
         FROM jobs ORDER BY run_at_ms DESC, rowid DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map([i64::from(limit)], |row| {
        let payload_json: String = row.get(3)?;
        let attempts: i64 = row.get(6)?;
        Ok(JobRecord {
            id: row.get(0)?,
            season: row.get(1)?,
            kind: row.get(2)?,
            payload: serde_json::from_str(&payload_json).unwrap_or_default(),
            status: row.get(4)?,
            run_at_ms: row.get(5)?,
            attempts: u32::try_from(attempts).unwrap_or(0),
            last_error: row.get(7)?,
        })
    })?;
    Ok(rows.filter_map(Result::ok).collect())
}

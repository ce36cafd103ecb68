use anyhow::Context;
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub mod accrual;
pub mod actions;
pub mod clock;
pub mod completion;
pub mod error;
pub mod formulas;
pub mod jobs;
pub mod model;
pub mod rules;
pub mod store;

#[cfg(test)]
mod tests;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ActionError;
pub use jobs::{ClaimedJob, Job, JobRecord, ScheduleRequest, SchedulerConfig};
pub use model::{
    FleetMovement, FleetStatus, Planet, Position, Resource, ResourceAmounts, ShipCommand,
    ShipyardQueue, Structure, UserResearch,
};
pub use rules::{ConfigProvider, Ruleset};

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

const TRANSACT_MAX_ATTEMPTS: u32 = 8;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

pub(crate) fn new_id(prefix: &str) -> String {
    let c = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{c}", now_ms())
}

/// Result of an action handler: the entity it touched plus the jobs enqueued
/// in the same transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionReceipt {
    pub entity_id: String,
    pub finishes_at_ms: Option<i64>,
    pub follow_ups: Vec<ScheduleRequest>,
}

/// Outcome of one worker step.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkReport {
    pub job_id: String,
    pub kind: String,
    pub applied: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: String,
}

/// Planet resources brought up to date for display. Never written back.
#[derive(Debug, Clone, Serialize)]
pub struct PlanetView {
    pub planet: Planet,
    pub production: accrual::Production,
}

#[derive(Debug, Clone)]
pub struct Engine {
    db_path: PathBuf,
    rules: Arc<ConfigProvider>,
    clock: Arc<dyn Clock>,
    scheduler: SchedulerConfig,
}

impl Engine {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            rules: Arc::new(ConfigProvider::builtin()),
            clock: Arc::new(SystemClock),
            scheduler: SchedulerConfig::default(),
        }
    }

    pub fn with_rules(mut self, rules: Arc<ConfigProvider>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_scheduler_config(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn rules(&self) -> &ConfigProvider {
        &self.rules
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn open(&self) -> anyhow::Result<Connection> {
        let path = self.db_path.clone();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create db dir: {}", dir.display()))?;
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("open sqlite db: {}", path.display()))?;

        // Durable + fast defaults.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_millis(250))?;

        migrate(&conn)?;
        Ok(conn)
    }

    /// Runs `f` inside one transaction. Store write conflicts and busy errors
    /// roll everything back and re-run the closure from the top, so `f` must
    /// do all of its reads before its writes and keep no state between runs.
    pub fn transact<T>(
        &self,
        mut f: impl FnMut(&Transaction<'_>) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut conn = self.open()?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let result = match f(&tx) {
                Ok(v) => tx.commit().map(|_| v).map_err(anyhow::Error::from),
                Err(e) => Err(e),
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e) if attempt < TRANSACT_MAX_ATTEMPTS && store::is_retryable(&e) => {
                    debug!(attempt, error = %e, "transaction conflict, retrying");
                    std::thread::sleep(Duration::from_millis(5 * u64::from(attempt)));
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn create_planet(&self, position: Position, biome: &str) -> anyhow::Result<Planet> {
        let rules = self.rules.snapshot();
        let now = self.now_ms();
        if !rules.biomes.contains_key(biome) {
            return Err(ActionError::UnknownDefinition {
                what: "biome",
                id: biome.to_string(),
            }
            .into());
        }
        let planet = self.transact(|tx| {
            let mut planet = Planet::unowned(new_id("planet"), &rules.season, position, biome, now);
            store::put_planet(tx, &mut planet)?;
            append_event_tx(
                tx,
                "planet.created",
                Some(&planet.id),
                serde_json::json!({ "id": planet.id, "position": planet.position, "biome": biome }),
            )?;
            Ok(planet)
        })?;
        info!(planet_id = %planet.id, biome, "planet created");
        Ok(planet)
    }

    pub fn assign_homeworld(
        &self,
        req: &starhold_protocol::AssignHomeworld,
    ) -> anyhow::Result<ActionReceipt> {
        self.run_action(|tx, rules, now| actions::assign_homeworld(tx, rules, now, req))
    }

    pub fn upgrade_structure(
        &self,
        req: &starhold_protocol::UpgradeStructure,
    ) -> anyhow::Result<ActionReceipt> {
        self.run_action(|tx, rules, now| actions::upgrade_structure(tx, rules, now, req))
    }

    pub fn start_research(
        &self,
        req: &starhold_protocol::StartResearch,
    ) -> anyhow::Result<ActionReceipt> {
        self.run_action(|tx, rules, now| actions::start_research(tx, rules, now, req))
    }

    pub fn build_ship(&self, req: &starhold_protocol::BuildShip) -> anyhow::Result<ActionReceipt> {
        self.run_action(|tx, rules, now| actions::build_ship(tx, rules, now, req))
    }

    pub fn start_mission(
        &self,
        req: &starhold_protocol::StartMission,
    ) -> anyhow::Result<ActionReceipt> {
        self.run_action(|tx, rules, now| actions::start_mission(tx, rules, now, req))
    }

    fn run_action(
        &self,
        mut handler: impl FnMut(&Transaction<'_>, &Ruleset, i64) -> anyhow::Result<ActionReceipt>,
    ) -> anyhow::Result<ActionReceipt> {
        let rules = self.rules.snapshot();
        let now = self.now_ms();
        self.transact(|tx| {
            let receipt = handler(tx, &rules, now)?;
            self.enqueue_all(tx, &rules.season, &receipt.follow_ups, now)?;
            Ok(receipt)
        })
    }

    /// Enqueues a deferred job; it fires `delay_ms` (plus commit slack) from now.
    pub fn schedule(&self, season: &str, req: &ScheduleRequest) -> anyhow::Result<String> {
        let conn = self.open()?;
        jobs::enqueue(&conn, season, req, self.now_ms(), &self.scheduler)
    }

    /// Follow-ups go into the jobs table inside the caller's transaction, so a
    /// committed transition always has its job and a rolled back one has none.
    fn enqueue_all(
        &self,
        conn: &Connection,
        season: &str,
        reqs: &[ScheduleRequest],
        now_ms: i64,
    ) -> anyhow::Result<()> {
        for req in reqs {
            jobs::enqueue(conn, season, req, now_ms, &self.scheduler)?;
        }
        Ok(())
    }

    /// Runs the completion handler for `job` in its own transaction, together
    /// with whatever follow-ups it asks for. Returns whether the transition applied.
    pub fn run_job(&self, season: &str, job: &Job) -> anyhow::Result<bool> {
        let rules = self.rules.snapshot();
        let now = self.now_ms();
        let done = self.transact(|tx| {
            let done = completion::dispatch(tx, &rules, season, now, job)?;
            self.enqueue_all(tx, season, &done.follow_ups, now)?;
            Ok(done)
        })?;
        Ok(done.applied)
    }

    /// Claims the oldest due job, runs it and records the outcome.
    /// Returns `None` when nothing is due.
    pub fn work_once(&self) -> anyhow::Result<Option<WorkReport>> {
        let mut conn = self.open()?;
        let Some(claimed) = jobs::claim_next(&mut conn, self.now_ms(), &self.scheduler)? else {
            return Ok(None);
        };
        let kind = claimed.job.kind().to_string();
        match catch_panic(|| self.run_job(&claimed.season, &claimed.job)) {
            Ok(applied) => {
                jobs::mark_done(&conn, &claimed.id, self.now_ms())?;
                Ok(Some(WorkReport {
                    job_id: claimed.id,
                    kind,
                    applied,
                    error: None,
                }))
            }
            Err(e) => {
                let msg = format!("{e:#}");
                let dropped =
                    jobs::mark_failed(&conn, &claimed, &msg, self.now_ms(), &self.scheduler)?;
                warn!(job_id = %claimed.id, %kind, attempt = claimed.attempts, dropped, error = %msg, "job failed");
                Ok(Some(WorkReport {
                    job_id: claimed.id,
                    kind,
                    applied: false,
                    error: Some(msg),
                }))
            }
        }
    }

    pub fn planet_view(&self, planet_id: &str) -> anyhow::Result<Option<PlanetView>> {
        let rules = self.rules.snapshot();
        let conn = self.open()?;
        let Some(mut planet) = store::get_planet(&conn, &rules.season, planet_id)? else {
            return Ok(None);
        };
        let research = match &planet.owner_id {
            Some(owner) => store::get_research(&conn, &rules.season, owner)?,
            None => None,
        };
        let production = accrual::accrue(&rules, &mut planet, research.as_ref(), self.now_ms());
        Ok(Some(PlanetView { planet, production }))
    }

    pub fn research(&self, user_id: &str) -> anyhow::Result<Option<UserResearch>> {
        let rules = self.rules.snapshot();
        store::get_research(&self.open()?, &rules.season, user_id)
    }

    pub fn shipyard(&self, planet_id: &str) -> anyhow::Result<Option<ShipyardQueue>> {
        let rules = self.rules.snapshot();
        store::get_shipyard_queue(&self.open()?, &rules.season, planet_id)
    }

    pub fn fleets(&self, user_id: &str) -> anyhow::Result<Vec<FleetMovement>> {
        let rules = self.rules.snapshot();
        store::list_fleet_movements(&self.open()?, &rules.season, user_id)
    }

    pub fn notifications(&self, user_id: &str, limit: u32) -> anyhow::Result<Vec<Notification>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, kind, payload_json, created_at FROM notifications
             WHERE user_id = ?1 ORDER BY rowid DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map((user_id, i64::from(limit)), |row| {
            let payload_json: String = row.get(3)?;
            Ok(Notification {
                id: row.get(0)?,
                user_id: row.get(1)?,
                kind: row.get(2)?,
                payload: serde_json::from_str(&payload_json).unwrap_or_default(),
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    pub fn jobs(&self, limit: u32) -> anyhow::Result<Vec<JobRecord>> {
        jobs::list(&self.open()?, limit)
    }

    pub fn get_rev(&self) -> anyhow::Result<i64> {
        let conn = self.open()?;
        let rev: Option<i64> =
            conn.query_row("SELECT MAX(seq) FROM event_log", [], |row| row.get(0))?;
        Ok(rev.unwrap_or(0))
    }
}

/// Turns a panic in `f` into an error so the job goes through the normal
/// retry and drop path.
fn catch_panic<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(anyhow::anyhow!("handler panicked: {msg}"))
    })
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    let v: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if v < 1 {
        conn.execute_batch(
            r#"
-- Monotonic revision source for clients polling for changes.
CREATE TABLE IF NOT EXISTS event_log (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  ts_ms INTEGER NOT NULL,
  kind TEXT NOT NULL,
  entity_id TEXT,
  payload_json TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_event_log_ts ON event_log(ts_ms);
CREATE INDEX IF NOT EXISTS idx_event_log_kind ON event_log(kind);

-- Entity documents. `rev` is the optimistic concurrency token: every write
-- must name the rev it read.
CREATE TABLE IF NOT EXISTS planets (
  season TEXT NOT NULL,
  id TEXT NOT NULL,
  owner_id TEXT,
  x INTEGER NOT NULL,
  y INTEGER NOT NULL,
  galaxy INTEGER NOT NULL,
  doc_json TEXT NOT NULL,
  rev INTEGER NOT NULL DEFAULT 1,
  updated_at_ms INTEGER NOT NULL,
  PRIMARY KEY (season, id)
);

CREATE INDEX IF NOT EXISTS idx_planets_owner ON planets(season, owner_id);

CREATE TABLE IF NOT EXISTS user_research (
  season TEXT NOT NULL,
  user_id TEXT NOT NULL,
  doc_json TEXT NOT NULL,
  rev INTEGER NOT NULL DEFAULT 1,
  updated_at_ms INTEGER NOT NULL,
  PRIMARY KEY (season, user_id)
);

CREATE TABLE IF NOT EXISTS shipyard_queues (
  season TEXT NOT NULL,
  planet_id TEXT NOT NULL,
  doc_json TEXT NOT NULL,
  rev INTEGER NOT NULL DEFAULT 1,
  updated_at_ms INTEGER NOT NULL,
  PRIMARY KEY (season, planet_id)
);

CREATE TABLE IF NOT EXISTS fleet_movements (
  season TEXT NOT NULL,
  id TEXT NOT NULL,
  owner_id TEXT NOT NULL,
  arrival_ms INTEGER NOT NULL,
  doc_json TEXT NOT NULL,
  rev INTEGER NOT NULL DEFAULT 1,
  updated_at_ms INTEGER NOT NULL,
  PRIMARY KEY (season, id)
);

CREATE INDEX IF NOT EXISTS idx_fleet_movements_owner ON fleet_movements(season, owner_id);

CREATE TABLE IF NOT EXISTS jobs (
  id TEXT PRIMARY KEY,
  season TEXT NOT NULL,
  kind TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'queued',
  run_at_ms INTEGER NOT NULL,
  lease_until_ms INTEGER NOT NULL DEFAULT 0,
  attempts INTEGER NOT NULL DEFAULT 0,
  last_error TEXT,
  created_at_ms INTEGER NOT NULL,
  updated_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(status, run_at_ms);

-- Outbox for the mail/notification service.
CREATE TABLE IF NOT EXISTS notifications (
  id TEXT PRIMARY KEY,
  season TEXT NOT NULL,
  user_id TEXT NOT NULL,
  kind TEXT NOT NULL,
  payload_json TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id);
"#,
        )?;

        conn.pragma_update(None, "user_version", 1_i64)?;
    }

    Ok(())
}

pub(crate) fn append_event_tx(
    tx: &Transaction<'_>,
    kind: &str,
    entity_id: Option<&str>,
    payload: serde_json::Value,
) -> anyhow::Result<i64> {
    let ts = now_ms();
    let payload_json = payload.to_string();
    tx.execute(
        "INSERT INTO event_log (ts_ms, kind, entity_id, payload_json) VALUES (?1, ?2, ?3, ?4)",
        (ts, kind, entity_id, payload_json),
    )?;
    Ok(tx.last_insert_rowid())
}

/// `createNotification(user, payload)`: written in the same transaction as the
/// transition it reports, delivered by whoever drains the table.
pub(crate) fn notify_tx(
    tx: &Transaction<'_>,
    season: &str,
    user_id: &str,
    kind: &str,
    at_ms: i64,
    payload: serde_json::Value,
) -> anyhow::Result<()> {
    let created_at = format_ms(at_ms);
    tx.execute(
        "INSERT INTO notifications (id, season, user_id, kind, payload_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        (
            new_id("note"),
            season,
            user_id,
            kind,
            payload.to_string(),
            created_at,
        ),
    )?;
    Ok(())
}

fn format_ms(ms: i64) -> String {
    time::OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .ok()
        .and_then(|t| {
            t.format(&time::format_description::well_known::Rfc3339)
                .ok()
        })
        .unwrap_or_else(|| ms.to_string())
}

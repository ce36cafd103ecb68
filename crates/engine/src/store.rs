//! Entity documents in SQLite. Reads take any connection; writes take the
//! transaction and check the `rev` they were read at.

use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction};
use thiserror::Error;

use crate::model::{FleetMovement, Planet, ShipyardQueue, UserResearch};

/// Another writer committed a newer revision since this one was read.
#[derive(Debug, Error)]
#[error("write conflict on {table} {key} (expected rev {expected_rev})")]
pub struct StoreConflict {
    pub table: &'static str,
    pub key: String,
    pub expected_rev: i64,
}

pub fn is_retryable(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<StoreConflict>().is_some() {
        return true;
    }
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(e, _))
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn is_constraint(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn decode<T: serde::de::DeserializeOwned>(
    row: Option<(String, i64)>,
) -> anyhow::Result<Option<(T, i64)>> {
    match row {
        Some((doc, rev)) => Ok(Some((serde_json::from_str(&doc)?, rev))),
        None => Ok(None),
    }
}

/// Inserts when `rev == 0`, otherwise updates only if the stored rev still matches.
/// Returns the new rev.
fn write_doc(
    tx: &Transaction<'_>,
    table: &'static str,
    key: &str,
    rev: i64,
    insert: impl FnOnce() -> rusqlite::Result<usize>,
    update: impl FnOnce() -> rusqlite::Result<usize>,
) -> anyhow::Result<i64> {
    let conflict = || StoreConflict {
        table,
        key: key.to_string(),
        expected_rev: rev,
    };
    if rev == 0 {
        match insert() {
            Ok(_) => Ok(1),
            Err(e) if is_constraint(&e) => Err(conflict().into()),
            Err(e) => Err(e.into()),
        }
    } else {
        match update()? {
            0 => Err(conflict().into()),
            _ => Ok(rev + 1),
        }
    }
}

pub fn get_planet(conn: &Connection, season: &str, id: &str) -> anyhow::Result<Option<Planet>> {
    let row = conn
        .query_row(
            "SELECT doc_json, rev FROM planets WHERE season = ?1 AND id = ?2",
            (season, id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    Ok(decode::<Planet>(row)?.map(|(mut p, rev)| {
        p.rev = rev;
        p
    }))
}

pub fn put_planet(tx: &Transaction<'_>, planet: &mut Planet) -> anyhow::Result<()> {
    let doc = serde_json::to_string(planet)?;
    let ts = super::now_ms();
    let p = &*planet;
    let rev = write_doc(
        tx,
        "planets",
        &p.id,
        p.rev,
        || {
            tx.execute(
                "INSERT INTO planets (season, id, owner_id, x, y, galaxy, doc_json, rev, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
                (
                    &p.season,
                    &p.id,
                    p.owner_id.as_deref(),
                    p.position.x,
                    p.position.y,
                    p.position.galaxy,
                    &doc,
                    ts,
                ),
            )
        },
        || {
            tx.execute(
                "UPDATE planets SET owner_id = ?1, doc_json = ?2, rev = rev + 1, updated_at_ms = ?3
                 WHERE season = ?4 AND id = ?5 AND rev = ?6",
                (p.owner_id.as_deref(), &doc, ts, &p.season, &p.id, p.rev),
            )
        },
    )?;
    planet.rev = rev;
    Ok(())
}

pub fn count_owned_planets(conn: &Connection, season: &str, owner_id: &str) -> anyhow::Result<u32> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM planets WHERE season = ?1 AND owner_id = ?2",
        (season, owner_id),
        |r| r.get(0),
    )?;
    Ok(u32::try_from(n).unwrap_or(u32::MAX))
}

pub fn get_research(
    conn: &Connection,
    season: &str,
    user_id: &str,
) -> anyhow::Result<Option<UserResearch>> {
    let row = conn
        .query_row(
            "SELECT doc_json, rev FROM user_research WHERE season = ?1 AND user_id = ?2",
            (season, user_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    Ok(decode::<UserResearch>(row)?.map(|(mut r, rev)| {
        r.rev = rev;
        r
    }))
}

pub fn put_research(tx: &Transaction<'_>, research: &mut UserResearch) -> anyhow::Result<()> {
    let doc = serde_json::to_string(research)?;
    let ts = super::now_ms();
    let r = &*research;
    let rev = write_doc(
        tx,
        "user_research",
        &r.user_id,
        r.rev,
        || {
            tx.execute(
                "INSERT INTO user_research (season, user_id, doc_json, rev, updated_at_ms)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                (&r.season, &r.user_id, &doc, ts),
            )
        },
        || {
            tx.execute(
                "UPDATE user_research SET doc_json = ?1, rev = rev + 1, updated_at_ms = ?2
                 WHERE season = ?3 AND user_id = ?4 AND rev = ?5",
                (&doc, ts, &r.season, &r.user_id, r.rev),
            )
        },
    )?;
    research.rev = rev;
    Ok(())
}

pub fn get_shipyard_queue(
    conn: &Connection,
    season: &str,
    planet_id: &str,
) -> anyhow::Result<Option<ShipyardQueue>> {
    let row = conn
        .query_row(
            "SELECT doc_json, rev FROM shipyard_queues WHERE season = ?1 AND planet_id = ?2",
            (season, planet_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    Ok(decode::<ShipyardQueue>(row)?.map(|(mut q, rev)| {
        q.rev = rev;
        q
    }))
}

pub fn put_shipyard_queue(tx: &Transaction<'_>, queue: &mut ShipyardQueue) -> anyhow::Result<()> {
    let doc = serde_json::to_string(queue)?;
    let ts = super::now_ms();
    let q = &*queue;
    let rev = write_doc(
        tx,
        "shipyard_queues",
        &q.planet_id,
        q.rev,
        || {
            tx.execute(
                "INSERT INTO shipyard_queues (season, planet_id, doc_json, rev, updated_at_ms)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                (&q.season, &q.planet_id, &doc, ts),
            )
        },
        || {
            tx.execute(
                "UPDATE shipyard_queues SET doc_json = ?1, rev = rev + 1, updated_at_ms = ?2
                 WHERE season = ?3 AND planet_id = ?4 AND rev = ?5",
                (&doc, ts, &q.season, &q.planet_id, q.rev),
            )
        },
    )?;
    queue.rev = rev;
    Ok(())
}

pub fn get_fleet_movement(
    conn: &Connection,
    season: &str,
    id: &str,
) -> anyhow::Result<Option<FleetMovement>> {
    let row = conn
        .query_row(
            "SELECT doc_json, rev FROM fleet_movements WHERE season = ?1 AND id = ?2",
            (season, id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    Ok(decode::<FleetMovement>(row)?.map(|(mut m, rev)| {
        m.rev = rev;
        m
    }))
}

pub fn list_fleet_movements(
    conn: &Connection,
    season: &str,
    owner_id: &str,
) -> anyhow::Result<Vec<FleetMovement>> {
    let mut stmt = conn.prepare(
        "SELECT doc_json, rev FROM fleet_movements WHERE season = ?1 AND owner_id = ?2
         ORDER BY arrival_ms ASC",
    )?;
    let rows = stmt.query_map((season, owner_id), |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (doc, rev) = row?;
        let mut movement: FleetMovement = serde_json::from_str(&doc)?;
        movement.rev = rev;
        out.push(movement);
    }
    Ok(out)
}

pub fn put_fleet_movement(tx: &Transaction<'_>, movement: &mut FleetMovement) -> anyhow::Result<()> {
    let doc = serde_json::to_string(movement)?;
    let ts = super::now_ms();
    let m = &*movement;
    let rev = write_doc(
        tx,
        "fleet_movements",
        &m.id,
        m.rev,
        || {
            tx.execute(
                "INSERT INTO fleet_movements (season, id, owner_id, arrival_ms, doc_json, rev, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
                (&m.season, &m.id, &m.owner_id, m.arrival_ms, &doc, ts),
            )
        },
        || {
            tx.execute(
                "UPDATE fleet_movements SET arrival_ms = ?1, doc_json = ?2, rev = rev + 1, updated_at_ms = ?3
                 WHERE season = ?4 AND id = ?5 AND rev = ?6",
                (m.arrival_ms, &doc, ts, &m.season, &m.id, m.rev),
            )
        },
    )?;
    movement.rev = rev;
    Ok(())
}

pub fn delete_fleet_movement(tx: &Transaction<'_>, movement: &FleetMovement) -> anyhow::Result<()> {
    let n = tx.execute(
        "DELETE FROM fleet_movements WHERE season = ?1 AND id = ?2 AND rev = ?3",
        (&movement.season, &movement.id, movement.rev),
    )?;
    if n == 0 {
        return Err(StoreConflict {
            table: "fleet_movements",
            key: movement.id.clone(),
            expected_rev: movement.rev,
        }
        .into());
    }
    Ok(())
}

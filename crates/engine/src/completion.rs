//! Completion handlers fired by the job worker.
//!
//! The first thing every handler does is compare the value carried in the job
//! payload with what is stored now. On mismatch (duplicate delivery, or the
//! state moved on) it returns [`Completion::stale`] and writes nothing.

use rusqlite::Transaction;
use starhold_protocol::MissionKind;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::accrual::accrue;
use crate::formulas;
use crate::jobs::{Job, ScheduleRequest};
use crate::model::{
    FleetMovement, FleetStatus, Planet, PlanetResources, ResourceAmounts, UserResearch,
};
use crate::rules::{Ruleset, ShipRole};
use crate::{append_event_tx, new_id, notify_tx, store};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub applied: bool,
    /// Jobs to enqueue in the same transaction.
    pub follow_ups: Vec<ScheduleRequest>,
}

impl Completion {
    pub fn stale() -> Self {
        Self::default()
    }

    fn applied(follow_ups: Vec<ScheduleRequest>) -> Self {
        Self {
            applied: true,
            follow_ups,
        }
    }
}

pub fn dispatch(
    tx: &Transaction<'_>,
    rules: &Ruleset,
    season: &str,
    now_ms: i64,
    job: &Job,
) -> anyhow::Result<Completion> {
    match job {
        Job::EndStructureUpgrade {
            planet_id,
            structure,
            construction_end_ms,
        } => end_structure_upgrade(tx, rules, season, now_ms, planet_id, structure, *construction_end_ms),
        Job::EndResearch {
            user_id,
            technology,
            research_finish_time_ms,
        } => end_research(tx, season, now_ms, user_id, technology, *research_finish_time_ms),
        Job::ProcessShipyardQueue {
            planet_id,
            item_finish_ms,
        } => process_shipyard_queue(tx, season, now_ms, planet_id, *item_finish_ms),
        Job::CompleteFleetMovement {
            movement_id,
            arrival_time_ms,
        } => complete_fleet_movement(tx, rules, season, now_ms, movement_id, *arrival_time_ms),
    }
}

pub fn end_structure_upgrade(
    tx: &Transaction<'_>,
    rules: &Ruleset,
    season: &str,
    now_ms: i64,
    planet_id: &str,
    structure: &str,
    construction_end_ms: i64,
) -> anyhow::Result<Completion> {
    let Some(mut planet) = store::get_planet(tx, season, planet_id)? else {
        return Ok(Completion::stale());
    };
    let actual = planet
        .structure(structure)
        .and_then(|s| s.construction_finish_ms);
    if actual != Some(construction_end_ms) {
        debug!(planet_id, structure, expected = construction_end_ms, ?actual, "stale endStructureUpgrade");
        return Ok(Completion::stale());
    }
    let mut research = match &planet.owner_id {
        Some(owner) => Some(
            store::get_research(tx, season, owner)?
                .unwrap_or_else(|| UserResearch::new(owner, season, rules.research.base_capacity)),
        ),
        None => None,
    };

    // Production up to the finish time still runs at the old level.
    accrue(rules, &mut planet, research.as_ref(), construction_end_ms.min(now_ms));
    let built = planet.structure_mut(structure);
    let from_level = built.level;
    let levels = built.construction_levels.unwrap_or(0);
    built.level += levels;
    built.clear_construction();
    let to_level = built.level;

    store::put_planet(tx, &mut planet)?;
    if from_level == 0 && levels > 0 && structure == rules.research.laboratory {
        if let Some(research) = research.as_mut() {
            research.capacity += 1;
            store::put_research(tx, research)?;
        }
    }
    append_event_tx(
        tx,
        "structure.upgraded",
        Some(planet_id),
        serde_json::json!({ "planet_id": planet_id, "structure": structure, "level": to_level }),
    )?;
    info!(planet_id, structure, from_level, to_level, "structure upgrade finished");
    Ok(Completion::applied(Vec::new()))
}

pub fn end_research(
    tx: &Transaction<'_>,
    season: &str,
    now_ms: i64,
    user_id: &str,
    technology: &str,
    research_finish_time_ms: i64,
) -> anyhow::Result<Completion> {
    let Some(mut research) = store::get_research(tx, season, user_id)? else {
        return Ok(Completion::stale());
    };
    let Some(entry) = research.technologies.get_mut(technology) else {
        return Ok(Completion::stale());
    };
    if !entry.is_researching || entry.research_finish_ms != Some(research_finish_time_ms) {
        debug!(user_id, technology, expected = research_finish_time_ms, actual = ?entry.research_finish_ms, "stale endResearch");
        return Ok(Completion::stale());
    }
    entry.level += 1;
    entry.clear_research();
    let level = entry.level;

    store::put_research(tx, &mut research)?;
    append_event_tx(
        tx,
        "research.finished",
        None,
        serde_json::json!({ "user_id": user_id, "technology": technology, "level": level }),
    )?;
    notify_tx(
        tx,
        season,
        user_id,
        "research.finished",
        now_ms,
        serde_json::json!({ "technology": technology, "level": level }),
    )?;
    info!(user_id, technology, new_level = level, "research finished");
    Ok(Completion::applied(Vec::new()))
}

/// Credits every item of the queue whose finish time has passed, one ship per
/// item, and re-arms the job for the next item.
pub fn process_shipyard_queue(
    tx: &Transaction<'_>,
    season: &str,
    now_ms: i64,
    planet_id: &str,
    item_finish_ms: i64,
) -> anyhow::Result<Completion> {
    let Some(mut queue) = store::get_shipyard_queue(tx, season, planet_id)? else {
        return Ok(Completion::stale());
    };
    let actual = queue.commands.front().map(|c| c.current_item_finish_ms);
    if actual != Some(item_finish_ms) {
        debug!(planet_id, expected = item_finish_ms, ?actual, "stale processShipyardQueue");
        return Ok(Completion::stale());
    }
    if item_finish_ms > now_ms {
        // Fired ahead of the item; come back when it is actually done.
        return Ok(Completion {
            applied: false,
            follow_ups: vec![ScheduleRequest::at(
                Job::ProcessShipyardQueue {
                    planet_id: planet_id.to_string(),
                    item_finish_ms,
                },
                item_finish_ms,
                now_ms,
            )],
        });
    }
    let Some(mut planet) = store::get_planet(tx, season, planet_id)? else {
        warn!(planet_id, "shipyard queue without planet");
        return Ok(Completion::stale());
    };

    let mut credited: BTreeMap<String, u64> = BTreeMap::new();
    while let Some(head) = queue.commands.front_mut() {
        if head.current_item_finish_ms > now_ms || head.remaining == 0 {
            break;
        }
        let finished_at = head.current_item_finish_ms;
        *credited.entry(head.ship.clone()).or_default() += 1;
        head.remaining -= 1;
        if head.remaining == 0 {
            queue.commands.pop_front();
            if let Some(next) = queue.commands.front_mut() {
                next.begin(finished_at);
            }
        } else {
            head.current_item_start_ms = finished_at;
            head.current_item_finish_ms = finished_at + head.item_ms;
        }
    }
    planet.station_ships(&credited);

    store::put_planet(tx, &mut planet)?;
    store::put_shipyard_queue(tx, &mut queue)?;
    append_event_tx(
        tx,
        "shipyard.delivered",
        Some(planet_id),
        serde_json::json!({ "planet_id": planet_id, "ships": credited }),
    )?;
    debug!(planet_id, ships = ?credited, "shipyard items delivered");

    let follow_ups = queue
        .commands
        .front()
        .map(|head| {
            ScheduleRequest::at(
                Job::ProcessShipyardQueue {
                    planet_id: planet_id.to_string(),
                    item_finish_ms: head.current_item_finish_ms,
                },
                head.current_item_finish_ms,
                now_ms,
            )
        })
        .into_iter()
        .collect();
    Ok(Completion::applied(follow_ups))
}

pub fn complete_fleet_movement(
    tx: &Transaction<'_>,
    rules: &Ruleset,
    season: &str,
    now_ms: i64,
    movement_id: &str,
    arrival_time_ms: i64,
) -> anyhow::Result<Completion> {
    let Some(movement) = store::get_fleet_movement(tx, season, movement_id)? else {
        return Ok(Completion::stale());
    };
    if movement.arrival_ms != arrival_time_ms {
        debug!(movement_id, expected = arrival_time_ms, actual = movement.arrival_ms, "stale completeFleetMovement");
        return Ok(Completion::stale());
    }
    let destination = store::get_planet(tx, season, &movement.destination.planet_id)?;
    let research = match destination.as_ref().and_then(|p| p.owner_id.as_deref()) {
        Some(owner) => store::get_research(tx, season, owner)?,
        None => None,
    };

    let arrival = Arrival {
        tx,
        rules,
        season,
        now_ms,
        movement: &movement,
    };
    let follow_ups = match movement.mission {
        MissionKind::Colonize => arrival.colonize(destination)?,
        MissionKind::Transport => arrival.transport(destination, research.as_ref())?,
        MissionKind::Move => arrival.relocate(destination, research.as_ref())?,
        MissionKind::Attack | MissionKind::Spy | MissionKind::Recycle => {
            warn!(movement_id, mission = movement.mission.as_str(), "mission resolution not implemented, fleet turns back");
            vec![arrival.send_home(movement.cargo)?]
        }
    };

    store::delete_fleet_movement(tx, &movement)?;
    append_event_tx(
        tx,
        "fleet.arrived",
        Some(movement_id),
        serde_json::json!({
            "movement_id": movement_id,
            "mission": movement.mission.as_str(),
            "destination": movement.destination.planet_id,
            "returning": !follow_ups.is_empty(),
        }),
    )?;
    info!(movement_id, mission = movement.mission.as_str(), returning = !follow_ups.is_empty(), "fleet arrived");
    Ok(Completion::applied(follow_ups))
}

/// Context for resolving one arrived fleet.
struct Arrival<'a> {
    tx: &'a Transaction<'a>,
    rules: &'a Ruleset,
    season: &'a str,
    now_ms: i64,
    movement: &'a FleetMovement,
}

impl Arrival<'_> {
    fn notify(&self, kind: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        notify_tx(self.tx, self.season, &self.movement.owner_id, kind, self.now_ms, payload)
    }

    /// Creates the trip back to the origin, departing at the arrival time.
    fn send_home(&self, cargo: ResourceAmounts) -> anyhow::Result<ScheduleRequest> {
        let m = self.movement;
        let travel_secs = formulas::fleet_travel_seconds(
            self.rules,
            &m.ships,
            &m.destination.position,
            &m.origin.position,
        )?;
        let departure = m.arrival_ms;
        let arrival = formulas::arrival_ms(departure, travel_secs)?;
        let mut back = FleetMovement {
            id: new_id("fleet"),
            season: m.season.clone(),
            owner_id: m.owner_id.clone(),
            ships: m.ships.clone(),
            origin: m.destination.clone(),
            destination: m.origin.clone(),
            mission: MissionKind::Move,
            status: FleetStatus::Returning,
            departure_ms: departure,
            arrival_ms: arrival,
            cargo,
            rev: 0,
        };
        store::put_fleet_movement(self.tx, &mut back)?;
        debug!(movement_id = %back.id, from = %m.id, arrival_ms = arrival, "return movement created");
        Ok(ScheduleRequest::at(
            Job::CompleteFleetMovement {
                movement_id: back.id,
                arrival_time_ms: arrival,
            },
            arrival,
            self.now_ms,
        ))
    }

    fn colonize(&self, destination: Option<Planet>) -> anyhow::Result<Vec<ScheduleRequest>> {
        let m = self.movement;
        let mut planet = match destination {
            Some(planet) if planet.owner_id.is_none() => planet,
            other => {
                let reason = if other.is_some() {
                    "destination already colonized"
                } else {
                    "destination no longer exists"
                };
                self.notify(
                    "colonize.failed",
                    serde_json::json!({ "planet_id": m.destination.planet_id, "reason": reason }),
                )?;
                return Ok(vec![self.send_home(m.cargo)?]);
            }
        };

        let stationed: BTreeMap<String, u64> = m
            .ships
            .iter()
            .filter(|(id, _)| self.rules.ship(id).and_then(|d| d.role) != Some(ShipRole::Colonizer))
            .map(|(id, count)| (id.clone(), *count))
            .collect();
        planet.owner_id = Some(m.owner_id.clone());
        planet.structures = self.rules.seed_structures(&self.rules.colony);
        planet.resources =
            PlanetResources::seeded(&self.rules.colony.resources.plus(&m.cargo), self.now_ms);
        planet.station_ships(&stationed);
        store::put_planet(self.tx, &mut planet)?;
        append_event_tx(
            self.tx,
            "planet.colonized",
            Some(&planet.id),
            serde_json::json!({ "planet_id": planet.id, "owner_id": m.owner_id }),
        )?;
        self.notify(
            "colonize.succeeded",
            serde_json::json!({
                "planet_id": planet.id,
                "position": planet.position,
                "ships": stationed,
            }),
        )?;
        Ok(Vec::new())
    }

    fn transport(
        &self,
        destination: Option<Planet>,
        research: Option<&UserResearch>,
    ) -> anyhow::Result<Vec<ScheduleRequest>> {
        let m = self.movement;
        let mut planet = match destination {
            Some(planet) if planet.owner_id.is_some() => planet,
            _ => {
                self.notify(
                    "transport.failed",
                    serde_json::json!({
                        "planet_id": m.destination.planet_id,
                        "reason": "destination is not colonized",
                    }),
                )?;
                return Ok(vec![self.send_home(m.cargo)?]);
            }
        };

        accrue(self.rules, &mut planet, research, self.now_ms);
        planet.resources.credit(&m.cargo);
        store::put_planet(self.tx, &mut planet)?;
        self.notify(
            "transport.delivered",
            serde_json::json!({ "planet_id": planet.id, "cargo": m.cargo }),
        )?;
        if let Some(receiver) = planet.owner_id.as_deref().filter(|o| *o != m.owner_id) {
            notify_tx(
                self.tx,
                self.season,
                receiver,
                "transport.received",
                self.now_ms,
                serde_json::json!({ "planet_id": planet.id, "from": m.owner_id, "cargo": m.cargo }),
            )?;
        }
        Ok(vec![self.send_home(ResourceAmounts::default())?])
    }

    /// Stations the fleet on a planet its owner holds; otherwise turns back.
    fn relocate(
        &self,
        destination: Option<Planet>,
        research: Option<&UserResearch>,
    ) -> anyhow::Result<Vec<ScheduleRequest>> {
        let m = self.movement;
        match destination {
            Some(mut planet) if planet.is_owned_by(&m.owner_id) => {
                accrue(self.rules, &mut planet, research, self.now_ms);
                planet.resources.credit(&m.cargo);
                planet.station_ships(&m.ships);
                store::put_planet(self.tx, &mut planet)?;
                if m.status == FleetStatus::Traveling {
                    self.notify(
                        "move.arrived",
                        serde_json::json!({ "planet_id": planet.id, "ships": m.ships }),
                    )?;
                }
                Ok(Vec::new())
            }
            _ if m.status == FleetStatus::Traveling => {
                self.notify(
                    "move.failed",
                    serde_json::json!({
                        "planet_id": m.destination.planet_id,
                        "reason": "destination is not yours",
                    }),
                )?;
                Ok(vec![self.send_home(m.cargo)?])
            }
            _ => {
                warn!(movement_id = %m.id, planet_id = %m.destination.planet_id, "home planet lost, returning fleet disbanded");
                self.notify(
                    "fleet.lost",
                    serde_json::json!({ "planet_id": m.destination.planet_id, "ships": m.ships }),
                )?;
                Ok(Vec::new())
            }
        }
    }
}

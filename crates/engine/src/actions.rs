//! Action handlers. Each runs inside one transaction: read everything, bring
//! resources up to date, validate, write, and hand back the completion job to
//! schedule once the commit went through.

use rusqlite::Transaction;
use starhold_protocol::{
    AssignHomeworld, BuildShip, MissionKind, StartMission, StartResearch, UpgradeStructure,
};
use std::collections::BTreeMap;
use tracing::info;

use crate::accrual::accrue;
use crate::error::ActionError;
use crate::formulas;
use crate::jobs::{Job, ScheduleRequest};
use crate::model::{
    FleetEndpoint, FleetMovement, FleetStatus, Planet, PlanetResources, ResourceAmounts,
    ShipCommand, ShipyardQueue, Structure, UserResearch,
};
use crate::rules::{Prerequisites, Ruleset, ShipRole};
use crate::{append_event_tx, new_id, notify_tx, store, ActionReceipt};

fn load_planet(tx: &Transaction<'_>, season: &str, planet_id: &str) -> anyhow::Result<Planet> {
    store::get_planet(tx, season, planet_id)?.ok_or_else(|| {
        ActionError::NotFound {
            what: "planet",
            id: planet_id.to_string(),
        }
        .into()
    })
}

fn ensure_owner(planet: &Planet, user_id: &str) -> Result<(), ActionError> {
    if planet.is_owned_by(user_id) {
        Ok(())
    } else {
        Err(ActionError::NotOwner {
            planet_id: planet.id.clone(),
            user_id: user_id.to_string(),
        })
    }
}

/// Every listed structure (on `planet`) and technology (in `research`) must be
/// at least at the required level.
pub fn check_prerequisites(
    prerequisites: &Prerequisites,
    planet: &Planet,
    research: Option<&UserResearch>,
) -> Result<(), ActionError> {
    let mut missing = Vec::new();
    for (id, required) in &prerequisites.structures {
        let have = planet.structure_level(id);
        if have < *required {
            missing.push(format!("{id} level {required} (have {have})"));
        }
    }
    for (id, required) in &prerequisites.technologies {
        let have = research.map(|r| r.level(id)).unwrap_or(0);
        if have < *required {
            missing.push(format!("{id} level {required} (have {have})"));
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ActionError::PrerequisitesUnmet(missing.join(", ")))
    }
}

pub fn assign_homeworld(
    tx: &Transaction<'_>,
    rules: &Ruleset,
    now_ms: i64,
    req: &AssignHomeworld,
) -> anyhow::Result<ActionReceipt> {
    let season = &rules.season;
    let mut planet = load_planet(tx, season, &req.planet_id)?;
    if planet.owner_id.is_some() {
        return Err(ActionError::InvalidTarget(format!("planet {} is already owned", planet.id)).into());
    }
    if store::count_owned_planets(tx, season, &req.user_id)? > 0 {
        return Err(ActionError::HomeworldAssigned(req.user_id.clone()).into());
    }
    let existing = store::get_research(tx, season, &req.user_id)?;

    planet.owner_id = Some(req.user_id.clone());
    planet.structures = rules.seed_structures(&rules.homeworld);
    planet.resources = PlanetResources::seeded(&rules.homeworld.resources, now_ms);
    store::put_planet(tx, &mut planet)?;
    if existing.is_none() {
        let mut research = UserResearch::new(&req.user_id, season, rules.research.base_capacity);
        store::put_research(tx, &mut research)?;
    }
    append_event_tx(
        tx,
        "planet.homeworld_assigned",
        Some(&planet.id),
        serde_json::json!({ "planet_id": planet.id, "user_id": req.user_id }),
    )?;
    notify_tx(
        tx,
        season,
        &req.user_id,
        "homeworld.assigned",
        now_ms,
        serde_json::json!({ "planet_id": planet.id, "position": planet.position }),
    )?;
    info!(planet_id = %planet.id, user_id = %req.user_id, "homeworld assigned");
    Ok(ActionReceipt {
        entity_id: planet.id,
        finishes_at_ms: None,
        follow_ups: Vec::new(),
    })
}

pub fn upgrade_structure(
    tx: &Transaction<'_>,
    rules: &Ruleset,
    now_ms: i64,
    req: &UpgradeStructure,
) -> anyhow::Result<ActionReceipt> {
    if req.levels == 0 {
        return Err(ActionError::InvalidRequest("levels must be at least 1".into()).into());
    }
    let season = &rules.season;
    let def = rules
        .structure(&req.structure)
        .ok_or_else(|| ActionError::UnknownDefinition {
            what: "structure",
            id: req.structure.clone(),
        })?;
    let mut planet = load_planet(tx, season, &req.planet_id)?;
    let research = store::get_research(tx, season, &req.user_id)?;
    accrue(rules, &mut planet, research.as_ref(), now_ms);
    ensure_owner(&planet, &req.user_id)?;

    let current = planet
        .structure(&def.id)
        .cloned()
        .unwrap_or_else(|| Structure::new(&def.id, 0));
    if current.level.saturating_add(req.levels) > def.max_level {
        return Err(ActionError::MaxLevel {
            what: def.id.clone(),
            max_level: def.max_level,
        }
        .into());
    }
    if current.is_upgrading() {
        return Err(ActionError::AlreadyInProgress(format!("upgrade of {}", def.id)).into());
    }
    if current.level == 0 {
        check_prerequisites(&def.prerequisites, &planet, research.as_ref())?;
    }
    let cost = ResourceAmounts::metal(formulas::upgrade_cost(&def.cost, current.level, req.levels));
    planet.resources.check_affordable(&cost)?;
    planet.resources.debit(&cost);

    let finish = now_ms + formulas::secs_to_ms(formulas::upgrade_seconds(def, req.levels, rules));
    let structure = planet.structure_mut(&def.id);
    structure.construction_levels = Some(req.levels);
    structure.construction_start_ms = Some(now_ms);
    structure.construction_finish_ms = Some(finish);

    store::put_planet(tx, &mut planet)?;
    append_event_tx(
        tx,
        "structure.upgrade_started",
        Some(&planet.id),
        serde_json::json!({
            "planet_id": planet.id,
            "structure": def.id,
            "from_level": current.level,
            "levels": req.levels,
            "metal": cost.metal,
            "finish_ms": finish,
        }),
    )?;
    info!(planet_id = %planet.id, structure = %def.id, levels = req.levels, finish_ms = finish, "structure upgrade started");
    Ok(ActionReceipt {
        follow_ups: vec![ScheduleRequest::at(
            Job::EndStructureUpgrade {
                planet_id: planet.id.clone(),
                structure: def.id.clone(),
                construction_end_ms: finish,
            },
            finish,
            now_ms,
        )],
        entity_id: planet.id,
        finishes_at_ms: Some(finish),
    })
}

pub fn start_research(
    tx: &Transaction<'_>,
    rules: &Ruleset,
    now_ms: i64,
    req: &StartResearch,
) -> anyhow::Result<ActionReceipt> {
    let season = &rules.season;
    let def = rules
        .technology(&req.technology)
        .ok_or_else(|| ActionError::UnknownDefinition {
            what: "technology",
            id: req.technology.clone(),
        })?;
    let mut research = store::get_research(tx, season, &req.user_id)?.unwrap_or_else(|| {
        UserResearch::new(&req.user_id, season, rules.research.base_capacity)
    });
    let mut planet = load_planet(tx, season, &req.planet_id)?;
    accrue(rules, &mut planet, Some(&research), now_ms);
    ensure_owner(&planet, &req.user_id)?;

    let active = research.active_count();
    if active >= research.capacity as usize {
        return Err(ActionError::ResearchCapacity {
            active,
            capacity: research.capacity,
        }
        .into());
    }
    check_prerequisites(&def.prerequisites, &planet, Some(&research))?;
    let entry = research
        .technologies
        .get(&def.id)
        .cloned()
        .unwrap_or_default();
    if entry.is_researching {
        return Err(ActionError::AlreadyInProgress(format!("research of {}", def.id)).into());
    }
    if entry.level >= def.max_level {
        return Err(ActionError::MaxLevel {
            what: def.id.clone(),
            max_level: def.max_level,
        }
        .into());
    }
    let cost = formulas::research_cost(def, entry.level);
    planet.resources.check_affordable(&cost)?;
    planet.resources.debit(&cost);

    let finish = now_ms + formulas::secs_to_ms(formulas::research_seconds(def, entry.level, rules));
    let entry = research.technologies.entry(def.id.clone()).or_default();
    entry.is_researching = true;
    entry.research_start_ms = Some(now_ms);
    entry.research_finish_ms = Some(finish);
    entry.researching_planet_id = Some(planet.id.clone());
    let from_level = entry.level;

    store::put_planet(tx, &mut planet)?;
    store::put_research(tx, &mut research)?;
    append_event_tx(
        tx,
        "research.started",
        Some(&planet.id),
        serde_json::json!({
            "user_id": req.user_id,
            "technology": def.id,
            "level": from_level,
            "finish_ms": finish,
        }),
    )?;
    info!(user_id = %req.user_id, technology = %def.id, from_level, finish_ms = finish, "research started");
    Ok(ActionReceipt {
        entity_id: def.id.clone(),
        finishes_at_ms: Some(finish),
        follow_ups: vec![ScheduleRequest::at(
            Job::EndResearch {
                user_id: req.user_id.clone(),
                technology: def.id.clone(),
                research_finish_time_ms: finish,
            },
            finish,
            now_ms,
        )],
    })
}

pub fn build_ship(
    tx: &Transaction<'_>,
    rules: &Ruleset,
    now_ms: i64,
    req: &BuildShip,
) -> anyhow::Result<ActionReceipt> {
    if req.count == 0 {
        return Err(ActionError::InvalidRequest("count must be at least 1".into()).into());
    }
    let season = &rules.season;
    let def = rules.ship(&req.ship).ok_or_else(|| ActionError::UnknownDefinition {
        what: "ship",
        id: req.ship.clone(),
    })?;
    let mut planet = load_planet(tx, season, &req.planet_id)?;
    let mut queue = store::get_shipyard_queue(tx, season, &planet.id)?
        .unwrap_or_else(|| ShipyardQueue::new(&planet.id, season, rules.shipyard.capacity));
    let research = store::get_research(tx, season, &req.user_id)?;
    accrue(rules, &mut planet, research.as_ref(), now_ms);

    if queue.is_full() {
        return Err(ActionError::QueueFull {
            capacity: queue.capacity,
        }
        .into());
    }
    ensure_owner(&planet, &req.user_id)?;
    let cost = def.cost.scaled(req.count as f64);
    planet.resources.check_affordable(&cost)?;
    planet.resources.debit(&cost);

    let starts_now = queue.commands.is_empty();
    let start = queue
        .commands
        .back()
        .map(|c| c.construction_finish_ms.max(now_ms))
        .unwrap_or(now_ms);
    let mut command = ShipCommand::new(&def.id, req.count, formulas::ship_item_ms(def.seconds, rules));
    command.begin(start);
    let first_finish = command.current_item_finish_ms;
    let batch_finish = command.construction_finish_ms;
    queue.commands.push_back(command);

    store::put_planet(tx, &mut planet)?;
    store::put_shipyard_queue(tx, &mut queue)?;
    append_event_tx(
        tx,
        "shipyard.enqueued",
        Some(&planet.id),
        serde_json::json!({
            "planet_id": planet.id,
            "ship": def.id,
            "count": req.count,
            "finish_ms": batch_finish,
        }),
    )?;
    info!(planet_id = %planet.id, ship = %def.id, count = req.count, "ship batch enqueued");

    let follow_ups = if starts_now {
        vec![ScheduleRequest::at(
            Job::ProcessShipyardQueue {
                planet_id: planet.id.clone(),
                item_finish_ms: first_finish,
            },
            first_finish,
            now_ms,
        )]
    } else {
        Vec::new()
    };
    Ok(ActionReceipt {
        entity_id: planet.id,
        finishes_at_ms: Some(batch_finish),
        follow_ups,
    })
}

pub fn start_mission(
    tx: &Transaction<'_>,
    rules: &Ruleset,
    now_ms: i64,
    req: &StartMission,
) -> anyhow::Result<ActionReceipt> {
    let season = &rules.season;
    if req.origin_planet_id == req.destination_planet_id {
        return Err(ActionError::InvalidTarget("origin and destination are the same planet".into()).into());
    }
    let research = store::get_research(tx, season, &req.user_id)?;
    let mut origin = load_planet(tx, season, &req.origin_planet_id)?;
    let destination = load_planet(tx, season, &req.destination_planet_id)?;
    ensure_owner(&origin, &req.user_id)?;

    let ships: BTreeMap<String, u64> = req
        .ships
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(id, count)| (id.clone(), *count))
        .collect();
    if ships.is_empty() {
        return Err(ActionError::InvalidFleet("no ships selected".into()).into());
    }
    for id in ships.keys() {
        if rules.ship(id).is_none() {
            return Err(ActionError::UnknownDefinition {
                what: "ship",
                id: id.clone(),
            }
            .into());
        }
    }
    origin.remove_ships(&ships)?;
    accrue(rules, &mut origin, research.as_ref(), now_ms);

    if req.cargo.has_negative() {
        return Err(ActionError::InvalidRequest("cargo amounts must not be negative".into()).into());
    }
    let cargo = ResourceAmounts::from(req.cargo);
    if !cargo.is_empty() {
        let capacity = formulas::cargo_capacity(rules, &ships);
        if cargo.total() > capacity {
            return Err(ActionError::InvalidFleet(format!(
                "cargo of {:.0} exceeds fleet capacity {capacity:.0}",
                cargo.total()
            ))
            .into());
        }
        origin.resources.check_affordable(&cargo)?;
        origin.resources.debit(&cargo);
    }

    validate_mission(tx, rules, req, &ships, &destination, research.as_ref())?;

    let travel_secs =
        formulas::fleet_travel_seconds(rules, &ships, &origin.position, &destination.position)?;
    let arrival = formulas::arrival_ms(now_ms, travel_secs)?;
    let mut movement = FleetMovement {
        id: new_id("fleet"),
        season: season.clone(),
        owner_id: req.user_id.clone(),
        ships,
        origin: FleetEndpoint {
            planet_id: origin.id.clone(),
            position: origin.position,
            owner_id: origin.owner_id.clone(),
        },
        destination: FleetEndpoint {
            planet_id: destination.id.clone(),
            position: destination.position,
            owner_id: destination.owner_id.clone(),
        },
        mission: req.mission,
        status: FleetStatus::Traveling,
        departure_ms: now_ms,
        arrival_ms: arrival,
        cargo,
        rev: 0,
    };

    store::put_planet(tx, &mut origin)?;
    store::put_fleet_movement(tx, &mut movement)?;
    append_event_tx(
        tx,
        "fleet.departed",
        Some(&movement.id),
        serde_json::json!({
            "movement_id": movement.id,
            "mission": req.mission.as_str(),
            "origin": origin.id,
            "destination": destination.id,
            "arrival_ms": arrival,
        }),
    )?;
    info!(movement_id = %movement.id, mission = req.mission.as_str(), arrival_ms = arrival, "fleet departed");
    Ok(ActionReceipt {
        follow_ups: vec![ScheduleRequest::at(
            Job::CompleteFleetMovement {
                movement_id: movement.id.clone(),
                arrival_time_ms: arrival,
            },
            arrival,
            now_ms,
        )],
        entity_id: movement.id,
        finishes_at_ms: Some(arrival),
    })
}

fn validate_mission(
    tx: &Transaction<'_>,
    rules: &Ruleset,
    req: &StartMission,
    ships: &BTreeMap<String, u64>,
    destination: &Planet,
    research: Option<&UserResearch>,
) -> anyhow::Result<()> {
    let role_count = |role: ShipRole| -> u64 {
        ships
            .iter()
            .filter(|(id, _)| rules.ship(id).and_then(|d| d.role) == Some(role))
            .map(|(_, count)| *count)
            .sum()
    };
    match req.mission {
        MissionKind::Transport => {
            if destination.owner_id.is_none() {
                return Err(ActionError::InvalidTarget("transport destination is not colonized".into()).into());
            }
        }
        MissionKind::Colonize => {
            if destination.owner_id.is_some() {
                return Err(ActionError::InvalidTarget("destination is already colonized".into()).into());
            }
            if role_count(ShipRole::Colonizer) == 0 {
                return Err(ActionError::InvalidFleet("colonize mission needs a colony ship".into()).into());
            }
            let owned = store::count_owned_planets(tx, &rules.season, &req.user_id)?;
            let allowed = research
                .map(|r| r.level(&rules.research.colonization_technology))
                .unwrap_or(0)
                + 1;
            if owned >= allowed {
                return Err(ActionError::ColonyLimit { owned, allowed }.into());
            }
        }
        MissionKind::Spy => {
            match destination.owner_id.as_deref() {
                None => {
                    return Err(ActionError::InvalidTarget("spy target is not colonized".into()).into())
                }
                Some(owner) if owner == req.user_id => {
                    return Err(ActionError::InvalidTarget("cannot spy on your own planet".into()).into())
                }
                Some(_) => {}
            }
            let total: u64 = ships.values().sum();
            if role_count(ShipRole::SpyProbe) != total {
                return Err(ActionError::InvalidFleet("spy missions may only send spy probes".into()).into());
            }
        }
        // Checked on arrival, not at departure.
        MissionKind::Attack | MissionKind::Move | MissionKind::Recycle => {}
    }
    Ok(())
}

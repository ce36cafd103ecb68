use super::*;
use starhold_protocol::{
    AssignHomeworld, BuildShip, Cargo, MissionKind, StartMission, StartResearch, UpgradeStructure,
};
use std::collections::BTreeMap;

const SEASON: &str = "s1";
const T0: i64 = 1_700_000_000_000;

fn temp_engine_with(rules: Ruleset) -> (Engine, Arc<ManualClock>) {
    let p = std::env::temp_dir().join(format!(
        "starhold-engine-test-{}-{}.db",
        time::OffsetDateTime::now_utc().unix_timestamp_nanos(),
        ID_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let clock = Arc::new(ManualClock::new(T0));
    let engine = Engine::new(p)
        .with_rules(Arc::new(ConfigProvider::fixed(rules)))
        .with_clock(clock.clone())
        .with_scheduler_config(SchedulerConfig {
            commit_slack_ms: 0,
            ..SchedulerConfig::default()
        });
    let _ = engine.open().expect("open db");
    (engine, clock)
}

fn temp_engine() -> (Engine, Arc<ManualClock>) {
    temp_engine_with(Ruleset::builtin())
}

fn homeworld(engine: &Engine, user: &str, position: Position) -> String {
    let planet = engine.create_planet(position, "temperate").unwrap();
    engine
        .assign_homeworld(&AssignHomeworld {
            user_id: user.into(),
            planet_id: planet.id.clone(),
        })
        .unwrap();
    planet.id
}

fn edit_planet(engine: &Engine, id: &str, f: impl Fn(&mut Planet)) {
    engine
        .transact(|tx| {
            let mut planet = store::get_planet(tx, SEASON, id)?.expect("planet");
            f(&mut planet);
            store::put_planet(tx, &mut planet)
        })
        .unwrap();
}

fn edit_research(engine: &Engine, user: &str, f: impl Fn(&mut UserResearch)) {
    engine
        .transact(|tx| {
            let mut research = store::get_research(tx, SEASON, user)?.expect("research");
            f(&mut research);
            store::put_research(tx, &mut research)
        })
        .unwrap();
}

fn view(engine: &Engine, id: &str) -> Planet {
    engine.planet_view(id).unwrap().expect("planet").planet
}

fn stored(engine: &Engine, id: &str) -> Planet {
    store::get_planet(&engine.open().unwrap(), SEASON, id)
        .unwrap()
        .expect("planet")
}

fn code(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<ActionError>()
        .map(ActionError::code)
        .unwrap_or("other")
}

fn ships(entries: &[(&str, u64)]) -> BTreeMap<String, u64> {
    entries.iter().map(|(id, n)| (id.to_string(), *n)).collect()
}

#[test]
fn homeworld_is_seeded_and_only_assigned_once() {
    let (engine, _clock) = temp_engine();
    let home = homeworld(&engine, "u1", Position::new(0, 0, 0));

    let planet = stored(&engine, &home);
    assert_eq!(planet.owner_id.as_deref(), Some("u1"));
    assert_eq!(planet.structure_level("metal_mine"), 1);
    assert_eq!(planet.resources.metal, 1000.0);
    assert_eq!(engine.research("u1").unwrap().expect("research").capacity, 0);

    let other = engine.create_planet(Position::new(5, 5, 0), "oceanic").unwrap();
    let err = engine
        .assign_homeworld(&AssignHomeworld {
            user_id: "u1".into(),
            planet_id: other.id.clone(),
        })
        .unwrap_err();
    assert_eq!(code(&err), "homeworld_assigned");

    let err = engine
        .assign_homeworld(&AssignHomeworld {
            user_id: "u2".into(),
            planet_id: home,
        })
        .unwrap_err();
    assert_eq!(code(&err), "invalid_target");
}

#[test]
fn planet_view_accrues_without_persisting() {
    let (engine, clock) = temp_engine();
    let home = homeworld(&engine, "u1", Position::new(0, 0, 0));

    clock.advance(100_000);
    // metal_mine 1 at 0.75/s for 100 s.
    assert_eq!(view(&engine, &home).resources.metal, 1075.0);
    assert_eq!(stored(&engine, &home).resources.metal, 1000.0);
    assert_eq!(stored(&engine, &home).resources.last_update_ms, T0);
}

#[test]
fn multi_level_upgrade_costs_the_sum_of_levels_and_completes_once() {
    let (engine, clock) = temp_engine();
    let home = homeworld(&engine, "u1", Position::new(0, 0, 0));
    edit_planet(&engine, &home, |p| p.structures.retain(|s| s.kind != "metal_mine"));

    let receipt = engine
        .upgrade_structure(&UpgradeStructure {
            user_id: "u1".into(),
            planet_id: home.clone(),
            structure: "metal_mine".into(),
            levels: 3,
        })
        .unwrap();
    let finish = T0 + 180_000;
    assert_eq!(receipt.finishes_at_ms, Some(finish));
    // 150 + 200 + 250
    assert_eq!(view(&engine, &home).resources.metal, 400.0);

    let err = engine
        .upgrade_structure(&UpgradeStructure {
            user_id: "u1".into(),
            planet_id: home.clone(),
            structure: "metal_mine".into(),
            levels: 1,
        })
        .unwrap_err();
    assert_eq!(code(&err), "already_in_progress");

    clock.set(finish);
    let report = engine.work_once().unwrap().expect("job due");
    assert_eq!(report.kind, "endStructureUpgrade");
    assert!(report.applied);
    let planet = view(&engine, &home);
    assert_eq!(planet.structure_level("metal_mine"), 3);
    assert!(!planet.structure("metal_mine").unwrap().is_upgrading());
    assert_eq!(planet.resources.metal, 400.0);

    let job = Job::EndStructureUpgrade {
        planet_id: home.clone(),
        structure: "metal_mine".into(),
        construction_end_ms: finish,
    };
    assert!(!engine.run_job(SEASON, &job).unwrap());
    assert_eq!(view(&engine, &home).structure_level("metal_mine"), 3);
}

#[test]
fn upgrade_rejections_leave_state_unchanged() {
    let (engine, _clock) = temp_engine();
    let home = homeworld(&engine, "u1", Position::new(0, 0, 0));
    let before = stored(&engine, &home);

    let req = |user: &str, structure: &str, levels: u32| UpgradeStructure {
        user_id: user.into(),
        planet_id: home.clone(),
        structure: structure.into(),
        levels,
    };
    let cases = [
        (req("u2", "metal_mine", 1), "not_owner"),
        (req("u1", "metal_mine", 40), "max_level"),
        (req("u1", "microchip_factory", 1), "prerequisites_unmet"),
        (req("u1", "metal_storage", 2), "insufficient_resources"),
        (req("u1", "warp_gate", 1), "unknown_definition"),
        (req("u1", "metal_mine", 0), "invalid_request"),
    ];
    for (request, expected) in cases {
        let err = engine.upgrade_structure(&request).unwrap_err();
        assert_eq!(code(&err), expected, "{}", err);
    }
    assert_eq!(stored(&engine, &home), before);
    assert!(engine.jobs(10).unwrap().is_empty());
}

#[test]
fn research_lab_grants_capacity_and_capacity_is_never_exceeded() {
    let (engine, clock) = temp_engine();
    let home = homeworld(&engine, "u1", Position::new(0, 0, 0));
    let research = |technology: &str| StartResearch {
        user_id: "u1".into(),
        planet_id: home.clone(),
        technology: technology.into(),
    };

    let err = engine.start_research(&research("energy_technology")).unwrap_err();
    assert_eq!(code(&err), "research_capacity_reached");

    engine
        .upgrade_structure(&UpgradeStructure {
            user_id: "u1".into(),
            planet_id: home.clone(),
            structure: "research_lab".into(),
            levels: 1,
        })
        .unwrap();
    clock.set(T0 + 120_000);
    assert!(engine.work_once().unwrap().expect("job due").applied);
    assert_eq!(engine.research("u1").unwrap().unwrap().capacity, 1);

    let receipt = engine.start_research(&research("energy_technology")).unwrap();
    let finish = T0 + 120_000 + 300_000;
    assert_eq!(receipt.finishes_at_ms, Some(finish));

    let before = view(&engine, &home);
    let err = engine.start_research(&research("mining_technology")).unwrap_err();
    assert_eq!(code(&err), "research_capacity_reached");
    assert!(err.to_string().contains("1 of 1"));
    assert_eq!(view(&engine, &home), before);
    let record = engine.research("u1").unwrap().unwrap();
    assert_eq!(record.active_count(), 1);
    assert!(record.active_count() <= record.capacity as usize);

    let stale = Job::EndResearch {
        user_id: "u1".into(),
        technology: "energy_technology".into(),
        research_finish_time_ms: finish + 1,
    };
    assert!(!engine.run_job(SEASON, &stale).unwrap());
    assert!(engine.research("u1").unwrap().unwrap().technologies["energy_technology"].is_researching);

    clock.set(finish);
    let report = engine.work_once().unwrap().expect("job due");
    assert_eq!(report.kind, "endResearch");
    assert!(report.applied);
    let record = engine.research("u1").unwrap().unwrap();
    assert_eq!(record.level("energy_technology"), 1);
    assert_eq!(record.active_count(), 0);

    let again = Job::EndResearch {
        user_id: "u1".into(),
        technology: "energy_technology".into(),
        research_finish_time_ms: finish,
    };
    assert!(!engine.run_job(SEASON, &again).unwrap());
    assert_eq!(engine.research("u1").unwrap().unwrap().level("energy_technology"), 1);
    let notes = engine.notifications("u1", 10).unwrap();
    assert_eq!(notes[0].kind, "research.finished");
}

#[test]
fn full_shipyard_queue_rejects_without_debit() {
    let (engine, _clock) = temp_engine();
    let home = homeworld(&engine, "u1", Position::new(0, 0, 0));
    edit_planet(&engine, &home, |p| {
        p.resources.deuterium = 10_000.0;
        p.resources.microchips = 1_000.0;
    });
    let probe = BuildShip {
        user_id: "u1".into(),
        planet_id: home.clone(),
        ship: "spy_probe".into(),
        count: 1,
    };
    for _ in 0..5 {
        engine.build_ship(&probe).unwrap();
    }
    let before = view(&engine, &home);
    assert_eq!(before.resources.deuterium, 9_500.0);

    let err = engine.build_ship(&probe).unwrap_err();
    assert_eq!(code(&err), "queue_full");
    assert!(err.to_string().contains("queue is full"));
    assert_eq!(view(&engine, &home), before);
    assert_eq!(engine.shipyard(&home).unwrap().unwrap().commands.len(), 5);
    // Only the first command scheduled a job.
    assert_eq!(engine.jobs(10).unwrap().len(), 1);
}

#[test]
fn shipyard_credits_each_item_and_catches_up_when_late() {
    let (engine, clock) = temp_engine();
    let home = homeworld(&engine, "u1", Position::new(0, 0, 0));
    let build = |ship: &str, count: u64| BuildShip {
        user_id: "u1".into(),
        planet_id: home.clone(),
        ship: ship.into(),
        count,
    };
    let probes = engine.build_ship(&build("spy_probe", 2)).unwrap();
    assert_eq!(probes.finishes_at_ms, Some(T0 + 20_000));
    let fighter = engine.build_ship(&build("light_fighter", 1)).unwrap();
    assert_eq!(fighter.finishes_at_ms, Some(T0 + 50_000));
    assert!(fighter.follow_ups.is_empty());

    clock.set(T0 + 15_000);
    assert!(engine.work_once().unwrap().expect("job due").applied);
    assert_eq!(view(&engine, &home).ships.get("spy_probe"), Some(&1));
    let queue = engine.shipyard(&home).unwrap().unwrap();
    assert_eq!(queue.commands[0].remaining, 1);
    assert_eq!(queue.commands[0].current_item_finish_ms, T0 + 20_000);

    clock.set(T0 + 60_000);
    assert!(engine.work_once().unwrap().expect("job due").applied);
    let planet = view(&engine, &home);
    assert_eq!(planet.ships.get("spy_probe"), Some(&2));
    assert_eq!(planet.ships.get("light_fighter"), Some(&1));
    assert!(engine.shipyard(&home).unwrap().unwrap().commands.is_empty());
    assert!(engine.work_once().unwrap().is_none());

    let duplicate = Job::ProcessShipyardQueue {
        planet_id: home.clone(),
        item_finish_ms: T0 + 20_000,
    };
    assert!(!engine.run_job(SEASON, &duplicate).unwrap());
    assert_eq!(view(&engine, &home).ships.get("spy_probe"), Some(&2));
}

#[test]
fn fleet_travel_time_and_return_trip() {
    let mut rules = Ruleset::builtin();
    for ship in rules.ships.iter_mut().filter(|s| s.id == "light_fighter") {
        ship.speed = 1.0;
    }
    let (engine, clock) = temp_engine_with(rules);
    let home = homeworld(&engine, "u1", Position::new(0, 0, 0));
    let target = engine.create_planet(Position::new(3, 4, 0), "desert").unwrap();
    edit_planet(&engine, &home, |p| {
        p.ships.insert("light_fighter".into(), 3);
    });

    let receipt = engine
        .start_mission(&StartMission {
            user_id: "u1".into(),
            origin_planet_id: home.clone(),
            destination_planet_id: target.id.clone(),
            mission: MissionKind::Move,
            ships: ships(&[("light_fighter", 1)]),
            cargo: Cargo::default(),
        })
        .unwrap();
    assert_eq!(receipt.finishes_at_ms, Some(T0 + 5_000));
    assert_eq!(view(&engine, &home).ships.get("light_fighter"), Some(&2));
    let outbound = engine.fleets("u1").unwrap();
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].status, FleetStatus::Traveling);

    // The target is not the sender's, so the fleet turns back.
    clock.set(T0 + 5_000);
    assert!(engine.work_once().unwrap().expect("job due").applied);
    let back = engine.fleets("u1").unwrap();
    assert_eq!(back.len(), 1);
    assert_eq!(back[0].status, FleetStatus::Returning);
    assert_eq!(back[0].departure_ms, T0 + 5_000);
    assert_eq!(back[0].arrival_ms, T0 + 10_000);
    assert_eq!(back[0].destination.planet_id, home);

    clock.set(T0 + 10_000);
    assert!(engine.work_once().unwrap().expect("job due").applied);
    assert!(engine.fleets("u1").unwrap().is_empty());
    assert_eq!(view(&engine, &home).ships.get("light_fighter"), Some(&3));
    let kinds: Vec<String> = engine
        .notifications("u1", 10)
        .unwrap()
        .into_iter()
        .map(|n| n.kind)
        .collect();
    assert!(kinds.contains(&"move.failed".to_string()));
}

#[test]
fn mission_preconditions_are_checked_at_departure() {
    let (engine, _clock) = temp_engine();
    let home = homeworld(&engine, "u1", Position::new(0, 0, 0));
    let rival = homeworld(&engine, "u2", Position::new(9, 0, 0));
    let empty = engine.create_planet(Position::new(4, 0, 0), "temperate").unwrap();
    edit_planet(&engine, &home, |p| {
        p.ships.insert("light_fighter".into(), 2);
        p.ships.insert("colony_ship".into(), 1);
        p.ships.insert("spy_probe".into(), 1);
    });
    let mission = |dest: &str, kind: MissionKind, fleet: &[(&str, u64)], cargo: Cargo| StartMission {
        user_id: "u1".into(),
        origin_planet_id: home.clone(),
        destination_planet_id: dest.into(),
        mission: kind,
        ships: ships(fleet),
        cargo,
    };
    let before = stored(&engine, &home);

    let cases = [
        (mission(&empty.id, MissionKind::Transport, &[("light_fighter", 1)], Cargo::default()), "invalid_target"),
        (mission(&rival, MissionKind::Colonize, &[("colony_ship", 1)], Cargo::default()), "invalid_target"),
        (mission(&empty.id, MissionKind::Colonize, &[("light_fighter", 1)], Cargo::default()), "invalid_fleet"),
        (mission(&empty.id, MissionKind::Colonize, &[("colony_ship", 1)], Cargo::default()), "colony_limit"),
        (mission(&rival, MissionKind::Spy, &[("spy_probe", 1), ("light_fighter", 1)], Cargo::default()), "invalid_fleet"),
        (mission(&empty.id, MissionKind::Spy, &[("spy_probe", 1)], Cargo::default()), "invalid_target"),
        (mission(&rival, MissionKind::Attack, &[("light_fighter", 3)], Cargo::default()), "invalid_fleet"),
        (
            mission(&rival, MissionKind::Transport, &[("light_fighter", 1)], Cargo { metal: 60.0, ..Cargo::default() }),
            "invalid_fleet",
        ),
        (mission(&home, MissionKind::Move, &[("light_fighter", 1)], Cargo::default()), "invalid_target"),
    ];
    for (request, expected) in cases {
        let err = engine.start_mission(&request).unwrap_err();
        assert_eq!(code(&err), expected, "{}", err);
    }
    assert_eq!(stored(&engine, &home), before);
    assert!(engine.fleets("u1").unwrap().is_empty());
}

#[test]
fn destination_out_of_reach_is_rejected() {
    let (engine, _clock) = temp_engine();
    let home = homeworld(&engine, "u1", Position::new(0, 0, 0));
    let far = engine
        .create_planet(Position::new(100_000_000_000_000_000, 0, 0), "temperate")
        .unwrap();
    edit_planet(&engine, &home, |p| {
        p.ships.insert("colony_ship".into(), 1);
    });
    let before = stored(&engine, &home);

    let err = engine
        .start_mission(&StartMission {
            user_id: "u1".into(),
            origin_planet_id: home.clone(),
            destination_planet_id: far.id.clone(),
            mission: MissionKind::Move,
            ships: ships(&[("colony_ship", 1)]),
            cargo: Cargo::default(),
        })
        .unwrap_err();
    assert_eq!(code(&err), "invalid_target");
    assert_eq!(stored(&engine, &home), before);
    assert!(engine.fleets("u1").unwrap().is_empty());
}

#[test]
fn second_colonizer_finds_planet_taken_and_returns_with_cargo() {
    let (engine, clock) = temp_engine();
    let home_a = homeworld(&engine, "a", Position::new(0, 0, 0));
    let home_b = homeworld(&engine, "b", Position::new(10, 0, 0));
    let target = engine.create_planet(Position::new(5, 0, 0), "volcanic").unwrap();
    for user in ["a", "b"] {
        edit_research(&engine, user, |r| {
            r.technologies.entry("colonization".into()).or_default().level = 1;
        });
    }
    edit_planet(&engine, &home_a, |p| {
        p.ships.insert("colony_ship".into(), 1);
        p.ships.insert("light_fighter".into(), 1);
    });
    edit_planet(&engine, &home_b, |p| {
        p.ships.insert("colony_ship".into(), 1);
    });

    let a_fleet = engine
        .start_mission(&StartMission {
            user_id: "a".into(),
            origin_planet_id: home_a.clone(),
            destination_planet_id: target.id.clone(),
            mission: MissionKind::Colonize,
            ships: ships(&[("colony_ship", 1), ("light_fighter", 1)]),
            cargo: Cargo::default(),
        })
        .unwrap();
    engine
        .start_mission(&StartMission {
            user_id: "b".into(),
            origin_planet_id: home_b.clone(),
            destination_planet_id: target.id.clone(),
            mission: MissionKind::Colonize,
            ships: ships(&[("colony_ship", 1)]),
            cargo: Cargo {
                metal: 100.0,
                ..Cargo::default()
            },
        })
        .unwrap();
    // distance 5 at colony ship speed 2.5
    assert_eq!(a_fleet.finishes_at_ms, Some(T0 + 2_000));

    clock.set(T0 + 2_000);
    assert!(engine.work_once().unwrap().expect("a arrives").applied);
    assert!(engine.work_once().unwrap().expect("b arrives").applied);

    let colony = view(&engine, &target.id);
    assert_eq!(colony.owner_id.as_deref(), Some("a"));
    assert_eq!(colony.resources.metal, 200.0);
    assert_eq!(colony.ships.get("light_fighter"), Some(&1));
    assert!(!colony.ships.contains_key("colony_ship"));
    let a_notes = engine.notifications("a", 10).unwrap();
    assert_eq!(a_notes[0].kind, "colonize.succeeded");

    let b_notes = engine.notifications("b", 10).unwrap();
    assert_eq!(b_notes[0].kind, "colonize.failed");
    let returning = engine.fleets("b").unwrap();
    assert_eq!(returning.len(), 1);
    assert_eq!(returning[0].status, FleetStatus::Returning);
    assert_eq!(returning[0].mission, MissionKind::Move);
    assert_eq!(returning[0].cargo.metal, 100.0);
    assert_eq!(returning[0].ships, ships(&[("colony_ship", 1)]));
    assert_eq!(returning[0].arrival_ms, T0 + 4_000);

    let replay = Job::CompleteFleetMovement {
        movement_id: a_fleet.entity_id.clone(),
        arrival_time_ms: T0 + 2_000,
    };
    assert!(!engine.run_job(SEASON, &replay).unwrap());
    assert_eq!(view(&engine, &target.id).owner_id.as_deref(), Some("a"));

    clock.set(T0 + 4_000);
    let before = view(&engine, &home_b);
    assert!(engine.work_once().unwrap().expect("b returns").applied);
    let home = view(&engine, &home_b);
    assert_eq!(home.ships.get("colony_ship"), Some(&1));
    assert_eq!(home.resources.metal, before.resources.metal + 100.0);
    assert!(engine.fleets("b").unwrap().is_empty());
}

#[test]
fn transport_delivers_and_always_returns_empty() {
    let (engine, clock) = temp_engine();
    let home_a = homeworld(&engine, "a", Position::new(0, 0, 0));
    let home_b = homeworld(&engine, "b", Position::new(8, 0, 0));
    edit_planet(&engine, &home_a, |p| {
        p.ships.insert("cargo_ship".into(), 1);
    });

    let receipt = engine
        .start_mission(&StartMission {
            user_id: "a".into(),
            origin_planet_id: home_a.clone(),
            destination_planet_id: home_b.clone(),
            mission: MissionKind::Transport,
            ships: ships(&[("cargo_ship", 1)]),
            cargo: Cargo {
                metal: 500.0,
                deuterium: 100.0,
                microchips: 0.0,
            },
        })
        .unwrap();
    assert_eq!(receipt.finishes_at_ms, Some(T0 + 1_000));
    assert_eq!(view(&engine, &home_a).resources.metal, 500.0);

    clock.set(T0 + 1_000);
    let before = view(&engine, &home_b);
    assert!(engine.work_once().unwrap().expect("job due").applied);
    let after = view(&engine, &home_b);
    assert_eq!(after.resources.metal, before.resources.metal + 500.0);
    assert_eq!(after.resources.deuterium, before.resources.deuterium + 100.0);
    assert!(!after.ships.contains_key("cargo_ship"));

    let returning = engine.fleets("a").unwrap();
    assert_eq!(returning.len(), 1);
    assert!(returning[0].cargo.is_empty());
    assert_eq!(engine.notifications("a", 10).unwrap()[0].kind, "transport.delivered");
    assert_eq!(engine.notifications("b", 10).unwrap()[0].kind, "transport.received");

    clock.set(T0 + 2_000);
    assert!(engine.work_once().unwrap().expect("job due").applied);
    assert_eq!(view(&engine, &home_a).ships.get("cargo_ship"), Some(&1));
}

#[test]
fn colony_is_seeded_with_template_plus_cargo() {
    let (engine, clock) = temp_engine();
    let home = homeworld(&engine, "u1", Position::new(0, 0, 0));
    let target = engine.create_planet(Position::new(5, 0, 0), "temperate").unwrap();
    edit_research(&engine, "u1", |r| {
        r.technologies.entry("colonization".into()).or_default().level = 1;
    });
    edit_planet(&engine, &home, |p| {
        p.ships.insert("colony_ship".into(), 1);
    });

    engine
        .start_mission(&StartMission {
            user_id: "u1".into(),
            origin_planet_id: home.clone(),
            destination_planet_id: target.id.clone(),
            mission: MissionKind::Colonize,
            ships: ships(&[("colony_ship", 1)]),
            cargo: Cargo {
                metal: 300.0,
                deuterium: 50.0,
                microchips: 20.0,
            },
        })
        .unwrap();

    clock.set(T0 + 2_000);
    assert!(engine.work_once().unwrap().expect("arrival due").applied);
    let colony = stored(&engine, &target.id);
    assert_eq!(colony.owner_id.as_deref(), Some("u1"));
    // colony template is 200 / 100 / 0
    assert_eq!(colony.resources.metal, 500.0);
    assert_eq!(colony.resources.deuterium, 150.0);
    assert_eq!(colony.resources.microchips, 20.0);
    assert_eq!(colony.resources.last_update_ms, T0 + 2_000);
    assert!(colony.ships.is_empty());
    assert!(engine.fleets("u1").unwrap().is_empty());
}

#[test]
fn attack_spy_and_recycle_turn_back_unchanged_on_arrival() {
    let (engine, clock) = temp_engine();
    let home = homeworld(&engine, "u1", Position::new(0, 0, 0));
    let rival = homeworld(&engine, "u2", Position::new(12, 0, 0));
    edit_planet(&engine, &home, |p| {
        p.ships.insert("light_fighter".into(), 2);
        p.ships.insert("spy_probe".into(), 1);
    });
    let send = |kind: MissionKind, fleet: &[(&str, u64)], cargo: Cargo| {
        engine
            .start_mission(&StartMission {
                user_id: "u1".into(),
                origin_planet_id: home.clone(),
                destination_planet_id: rival.clone(),
                mission: kind,
                ships: ships(fleet),
                cargo,
            })
            .unwrap()
    };
    send(
        MissionKind::Attack,
        &[("light_fighter", 1)],
        Cargo {
            metal: 40.0,
            ..Cargo::default()
        },
    );
    send(MissionKind::Spy, &[("spy_probe", 1)], Cargo::default());
    send(MissionKind::Recycle, &[("light_fighter", 1)], Cargo::default());
    let rival_before = stored(&engine, &rival);

    // light fighters cover 12 units in 1 s; the probe rounds up to 1 s.
    clock.set(T0 + 1_000);
    for _ in 0..3 {
        assert!(engine.work_once().unwrap().expect("arrival due").applied);
    }
    assert_eq!(stored(&engine, &rival), rival_before);

    let returning = engine.fleets("u1").unwrap();
    assert_eq!(returning.len(), 3);
    for fleet in &returning {
        assert_eq!(fleet.status, FleetStatus::Returning);
        assert_eq!(fleet.mission, MissionKind::Move);
        assert_eq!(fleet.destination.planet_id, home);
        assert_eq!(fleet.arrival_ms, T0 + 2_000);
    }
    let mut carried: Vec<f64> = returning.iter().map(|f| f.cargo.metal).collect();
    carried.sort_by(f64::total_cmp);
    assert_eq!(carried, vec![0.0, 0.0, 40.0]);

    clock.set(T0 + 2_000);
    for _ in 0..3 {
        assert!(engine.work_once().unwrap().expect("return due").applied);
    }
    let planet = view(&engine, &home);
    assert_eq!(planet.ships.get("light_fighter"), Some(&2));
    assert_eq!(planet.ships.get("spy_probe"), Some(&1));
    assert!(engine.fleets("u1").unwrap().is_empty());
}

#[test]
fn failing_job_backs_off_then_is_dropped() {
    let (engine, clock) = temp_engine();
    let engine = engine.with_scheduler_config(SchedulerConfig {
        max_attempts: 2,
        base_backoff_ms: 1_000,
        commit_slack_ms: 0,
        ..SchedulerConfig::default()
    });
    engine
        .open()
        .unwrap()
        .execute(
            "INSERT INTO shipyard_queues (season, planet_id, doc_json, rev, updated_at_ms)
             VALUES ('s1', 'p-bad', 'not json', 1, 0)",
            [],
        )
        .unwrap();
    engine
        .schedule(
            SEASON,
            &ScheduleRequest {
                job: Job::ProcessShipyardQueue {
                    planet_id: "p-bad".into(),
                    item_finish_ms: T0,
                },
                delay_ms: 0,
            },
        )
        .unwrap();

    let report = engine.work_once().unwrap().expect("job due");
    assert!(!report.applied);
    assert!(report.error.is_some());
    let record = &engine.jobs(10).unwrap()[0];
    assert_eq!(record.status, "queued");
    assert_eq!(record.attempts, 1);
    assert_eq!(record.run_at_ms, T0 + 1_000);

    assert!(engine.work_once().unwrap().is_none());

    clock.set(T0 + 1_000);
    assert!(engine.work_once().unwrap().expect("retry due").error.is_some());
    let record = &engine.jobs(10).unwrap()[0];
    assert_eq!(record.status, "failed");
    assert_eq!(record.attempts, 2);
    assert!(record.last_error.is_some());
    assert!(engine.work_once().unwrap().is_none());
}

#[test]
fn expired_lease_is_claimed_again() {
    let (engine, clock) = temp_engine();
    let home = homeworld(&engine, "u1", Position::new(0, 0, 0));
    engine
        .build_ship(&BuildShip {
            user_id: "u1".into(),
            planet_id: home.clone(),
            ship: "spy_probe".into(),
            count: 1,
        })
        .unwrap();

    clock.set(T0 + 10_000);
    let cfg = SchedulerConfig::default();
    let mut conn = engine.open().unwrap();
    let abandoned = jobs::claim_next(&mut conn, engine.now_ms(), &cfg)
        .unwrap()
        .expect("claimed");
    assert!(jobs::claim_next(&mut conn, engine.now_ms(), &cfg).unwrap().is_none());

    clock.set(T0 + 10_000 + cfg.lease_ms + 1);
    let report = engine.work_once().unwrap().expect("lease expired");
    assert_eq!(report.job_id, abandoned.id);
    assert!(report.applied);
    assert_eq!(view(&engine, &home).ships.get("spy_probe"), Some(&1));
}

#[test]
fn conflicting_writer_is_retried_against_fresh_state() {
    let (engine, _clock) = temp_engine();
    let home = homeworld(&engine, "u1", Position::new(0, 0, 0));

    let mut runs = 0;
    engine
        .transact(|tx| {
            runs += 1;
            let mut planet = store::get_planet(tx, SEASON, &home)?.expect("planet");
            if runs == 1 {
                planet.rev -= 1;
            }
            planet.resources.metal += 1.0;
            store::put_planet(tx, &mut planet)
        })
        .unwrap();
    assert_eq!(runs, 2);
    assert_eq!(stored(&engine, &home).resources.metal, 1001.0);
    assert!(engine.get_rev().unwrap() > 0);
}

#[test]
fn job_abandoned_on_its_last_attempt_is_dropped() {
    let (engine, clock) = temp_engine();
    let cfg = SchedulerConfig {
        max_attempts: 2,
        commit_slack_ms: 0,
        ..SchedulerConfig::default()
    };
    let engine = engine.with_scheduler_config(cfg.clone());
    let home = homeworld(&engine, "u1", Position::new(0, 0, 0));
    engine
        .build_ship(&BuildShip {
            user_id: "u1".into(),
            planet_id: home.clone(),
            ship: "spy_probe".into(),
            count: 1,
        })
        .unwrap();

    clock.set(T0 + 10_000);
    let mut conn = engine.open().unwrap();
    for attempt in 1..=2 {
        let claimed = jobs::claim_next(&mut conn, engine.now_ms(), &cfg)
            .unwrap()
            .expect("claimed");
        assert_eq!(claimed.attempts, attempt);
        clock.advance(cfg.lease_ms + 1);
    }

    assert!(engine.work_once().unwrap().is_none());
    let record = &engine.jobs(10).unwrap()[0];
    assert_eq!(record.status, "failed");
    assert_eq!(record.attempts, 2);
    assert_eq!(record.last_error.as_deref(), Some("lease expired on final attempt"));
    assert!(!view(&engine, &home).ships.contains_key("spy_probe"));
}

#[test]
fn panicking_handler_becomes_an_error() {
    let err = catch_panic(|| -> anyhow::Result<()> { panic!("shipyard exploded") }).unwrap_err();
    assert!(err.to_string().contains("shipyard exploded"));
    assert_eq!(catch_panic(|| Ok(7)).unwrap(), 7);
}

#[test]
fn action_is_rolled_back_when_its_job_cannot_be_queued() {
    let (engine, _clock) = temp_engine();
    let home = homeworld(&engine, "u1", Position::new(0, 0, 0));
    let before = stored(&engine, &home);
    engine.open().unwrap().execute_batch("DROP TABLE jobs").unwrap();

    let err = engine
        .upgrade_structure(&UpgradeStructure {
            user_id: "u1".into(),
            planet_id: home.clone(),
            structure: "metal_mine".into(),
            levels: 1,
        })
        .unwrap_err();
    assert_eq!(code(&err), "other");
    let after = stored(&engine, &home);
    assert_eq!(after, before);
    assert!(!after.structure("metal_mine").unwrap().is_upgrading());
}

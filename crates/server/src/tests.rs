use super::*;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{HeaderValue, Request};
use starhold_engine::{ManualClock, SchedulerConfig};
use tower::ServiceExt;

const T0: i64 = 1_700_000_000_000;

fn temp_path(ext: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "starhold-server-test-{}.{ext}",
        time::OffsetDateTime::now_utc().unix_timestamp_nanos()
    ))
}

fn temp_engine() -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(T0));
    let engine = Engine::new(temp_path("db"))
        .with_clock(clock.clone())
        .with_scheduler_config(SchedulerConfig {
            commit_slack_ms: 0,
            ..SchedulerConfig::default()
        });
    let _ = engine.open().expect("open db");
    (engine, clock)
}

fn state_for(engine: &Engine) -> State<Arc<AppState>> {
    State(Arc::new(AppState {
        engine: engine.clone(),
    }))
}

async fn seed_homeworld(state: &State<Arc<AppState>>, user: &str) -> String {
    let planet = api_create_planet(
        state.clone(),
        Json(CreatePlanet {
            x: 0,
            y: 0,
            galaxy: 0,
            biome: "temperate".to_string(),
        }),
    )
    .await
    .unwrap()
    .0;
    let status = api_assign_homeworld(
        state.clone(),
        Json(AssignHomeworld {
            user_id: user.to_string(),
            planet_id: planet.id.clone(),
        }),
    )
    .await
    .unwrap()
    .0;
    assert!(status.ok);
    planet.id
}

#[tokio::test]
async fn health_and_rev_track_commits() {
    let (engine, _clock) = temp_engine();
    let state = state_for(&engine);
    assert_eq!(health().await, "ok");
    assert_eq!(api_rev(state.clone()).await.unwrap().0.rev, 0);

    seed_homeworld(&state, "u1").await;
    assert!(api_rev(state).await.unwrap().0.rev >= 2);
}

#[tokio::test]
async fn accepted_action_reports_entity_and_finish_time() {
    let (engine, _clock) = temp_engine();
    let state = state_for(&engine);
    let home = seed_homeworld(&state, "u1").await;

    let status = api_upgrade_structure(
        state.clone(),
        Json(UpgradeStructure {
            user_id: "u1".to_string(),
            planet_id: home.clone(),
            structure: "metal_mine".to_string(),
            levels: 1,
        }),
    )
    .await
    .unwrap()
    .0;
    assert!(status.ok);
    assert_eq!(status.entity_id.as_deref(), Some(home.as_str()));
    // metal_mine: 60 s per level
    assert_eq!(status.finishes_at_ms, Some(T0 + 60_000));

    let view = api_planet(state.clone(), Path(home.clone())).await.unwrap().0;
    assert!(view.planet.structure("metal_mine").unwrap().is_upgrading());
    // 1000 minus the level 2 cost of 200
    assert_eq!(view.planet.resources.metal, 800.0);

    let jobs = api_jobs(state, Query(ListQuery::default())).await.unwrap().0;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, "endStructureUpgrade");
}

#[tokio::test]
async fn rejected_action_maps_code_and_status() {
    let (engine, _clock) = temp_engine();
    let state = state_for(&engine);
    let home = seed_homeworld(&state, "u1").await;

    let err = api_upgrade_structure(
        state.clone(),
        Json(UpgradeStructure {
            user_id: "intruder".to_string(),
            planet_id: home.clone(),
            structure: "metal_mine".to_string(),
            levels: 1,
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.0, StatusCode::FORBIDDEN);
    assert!(!err.1 .0.ok);
    assert_eq!(err.1 .0.code.as_deref(), Some("not_owner"));

    let err = api_start_research(
        state.clone(),
        Json(StartResearch {
            user_id: "u1".to_string(),
            planet_id: home.clone(),
            technology: "energy_technology".to_string(),
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.0, StatusCode::CONFLICT);
    assert_eq!(err.1 .0.code.as_deref(), Some("research_capacity_reached"));

    let err = api_build_ship(
        state.clone(),
        Json(BuildShip {
            user_id: "u1".to_string(),
            planet_id: "missing".to_string(),
            ship: "spy_probe".to_string(),
            count: 1,
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.0, StatusCode::NOT_FOUND);

    let err = api_create_planet(
        state,
        Json(CreatePlanet {
            x: 1,
            y: 1,
            galaxy: 0,
            biome: "lava_moon".to_string(),
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.0, StatusCode::BAD_REQUEST);
    assert_eq!(err.1 .0.code.as_deref(), Some("unknown_definition"));
}

#[tokio::test]
async fn missing_read_models() {
    let (engine, _clock) = temp_engine();
    let state = state_for(&engine);

    let err = api_planet(state.clone(), Path("nope".to_string()))
        .await
        .unwrap_err();
    assert_eq!(err.0, StatusCode::NOT_FOUND);
    assert_eq!(err.1 .0.code.as_deref(), Some("not_found"));

    let err = api_research(state.clone(), Path("nobody".to_string()))
        .await
        .unwrap_err();
    assert_eq!(err.0, StatusCode::NOT_FOUND);

    let queue = api_shipyard(state.clone(), Path("p-empty".to_string()))
        .await
        .unwrap()
        .0;
    assert!(queue.commands.is_empty());
    assert_eq!(queue.capacity, 5);

    assert!(api_fleets(state.clone(), Path("nobody".to_string()))
        .await
        .unwrap()
        .0
        .is_empty());
    assert!(api_notifications(state, Path("nobody".to_string()), Query(ListQuery::default()))
        .await
        .unwrap()
        .0
        .is_empty());
}

#[tokio::test]
async fn workers_apply_due_jobs_and_stop_on_signal() {
    let (engine, clock) = temp_engine();
    let state = state_for(&engine);
    let home = seed_homeworld(&state, "u1").await;
    let status = api_build_ship(
        state.clone(),
        Json(BuildShip {
            user_id: "u1".to_string(),
            planet_id: home.clone(),
            ship: "spy_probe".to_string(),
            count: 1,
        }),
    )
    .await
    .unwrap()
    .0;
    assert_eq!(status.finishes_at_ms, Some(T0 + 10_000));
    clock.set(T0 + 10_000);

    let (stop_tx, stop_rx) = watch::channel(false);
    let workers = spawn_workers(engine.clone(), 2, Duration::from_millis(10), stop_rx);
    let mut delivered = false;
    for _ in 0..300 {
        let view = api_planet(state.clone(), Path(home.clone())).await.unwrap().0;
        if view.planet.ships.get("spy_probe") == Some(&1) {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(delivered, "worker never delivered the ship");

    let _ = stop_tx.send(true);
    for worker in workers {
        worker.await.unwrap();
    }
    let jobs = api_jobs(state, Query(ListQuery { limit: Some(10) }))
        .await
        .unwrap()
        .0;
    assert_eq!(jobs[0].status, "done");
}

#[tokio::test]
async fn router_serves_local_peers_only() {
    let (engine, _clock) = temp_engine();
    let planet = engine
        .create_planet(Position::new(1, 2, 0), "oceanic")
        .unwrap();
    let body = serde_json::json!({ "user_id": "u1", "planet_id": planet.id }).to_string();
    let request = || {
        Request::builder()
            .method("POST")
            .uri("/api/actions/assign-homeworld")
            .header("content-type", "application/json")
            .body(Body::from(body.clone()))
            .unwrap()
    };

    let remote = build_router(AppState {
        engine: engine.clone(),
    })
    .layer(MockConnectInfo(SocketAddr::from(([203, 0, 113, 7], 5000))));
    let res = remote.oneshot(request()).await.unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let local = build_router(AppState {
        engine: engine.clone(),
    })
    .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 5000))));
    let res = local.clone().oneshot(request()).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    let status: ActionStatus = serde_json::from_slice(&bytes).unwrap();
    assert!(status.ok);
    assert_eq!(status.entity_id.as_deref(), Some(planet.id.as_str()));

    let res = local.oneshot(request()).await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    let status: ActionStatus = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(status.code.as_deref(), Some("homeworld_assigned"));
}

#[tokio::test]
async fn rules_reload_swaps_snapshot_and_keeps_it_on_bad_input() {
    let rules_path = temp_path("yaml");
    let default = include_str!("../../engine/rules/default.yaml");
    std::fs::write(&rules_path, default).unwrap();
    let mut config = ServerConfig::new(temp_path("db"));
    config.rules_path = Some(rules_path.clone());
    let engine = config.build_engine().unwrap();
    let state = state_for(&engine);
    assert_eq!(engine.rules().snapshot().season, "s1");

    std::fs::write(&rules_path, default.replacen("season: s1", "season: s2", 1)).unwrap();
    let body = api_reload_rules(state.clone()).await.unwrap().0;
    assert_eq!(body.season, "s2");
    assert_eq!(body.ships, 4);

    std::fs::write(&rules_path, "season: [unterminated").unwrap();
    let err = api_reload_rules(state).await.unwrap_err();
    assert_eq!(err.0, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(err.1 .0.code.as_deref(), Some("invalid_rules"));
    assert_eq!(engine.rules().snapshot().season, "s2");
}

#[test]
fn peer_and_origin_allowlists() {
    assert!(is_allowed_peer_ip("127.0.0.1".parse().unwrap()));
    assert!(is_allowed_peer_ip("::1".parse().unwrap()));
    assert!(is_allowed_peer_ip("100.100.1.2".parse().unwrap()));
    assert!(!is_allowed_peer_ip("100.128.0.1".parse().unwrap()));
    assert!(!is_allowed_peer_ip("192.0.2.10".parse().unwrap()));

    let origin = |s: &'static str| HeaderValue::from_static(s);
    assert!(is_allowed_local_origin(&origin("http://localhost:5173")));
    assert!(is_allowed_local_origin(&origin("https://127.0.0.1")));
    assert!(!is_allowed_local_origin(&origin("http://localhost.evil.com")));
    assert!(!is_allowed_local_origin(&origin("https://example.com")));
}

#[test]
fn list_limit_is_clamped() {
    assert_eq!(ListQuery::default().limit(), DEFAULT_LIST_LIMIT);
    assert_eq!(ListQuery { limit: Some(0) }.limit(), 1);
    assert_eq!(ListQuery { limit: Some(10_000) }.limit(), MAX_LIST_LIMIT);
}

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use starhold_engine::{
    ActionError, ActionReceipt, ConfigProvider, Engine, FleetMovement, JobRecord, Notification,
    Planet, PlanetView, Position, ShipyardQueue, UserResearch,
};
use starhold_protocol::{
    actions, ActionStatus, AssignHomeworld, BuildShip, CreatePlanet, StartMission, StartResearch,
    UpgradeStructure,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, error, info, warn};

#[cfg(test)]
mod tests;

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 500;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

/// Everything `serve` needs besides the listener.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub rules_path: Option<PathBuf>,
    pub workers: usize,
    pub poll_interval: Duration,
}

impl ServerConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            rules_path: None,
            workers: 2,
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn build_engine(&self) -> anyhow::Result<Engine> {
        let rules = match &self.rules_path {
            Some(path) => ConfigProvider::from_file(path)
                .with_context(|| format!("load ruleset: {}", path.display()))?,
            None => ConfigProvider::builtin(),
        };
        Ok(Engine::new(&self.db_path).with_rules(Arc::new(rules)))
    }
}

pub fn build_router(state: AppState) -> Router {
    let action = |name: &str| format!("/api/actions/{name}");
    Router::new()
        .route("/health", get(health))
        .route("/api/rev", get(api_rev))
        .route(&action(actions::UPGRADE_STRUCTURE), post(api_upgrade_structure))
        .route(&action(actions::START_RESEARCH), post(api_start_research))
        .route(&action(actions::BUILD_SHIP), post(api_build_ship))
        .route(&action(actions::START_MISSION), post(api_start_mission))
        .route(&action(actions::ASSIGN_HOMEWORLD), post(api_assign_homeworld))
        .route("/api/planets/{id}", get(api_planet))
        .route("/api/planets/{id}/shipyard", get(api_shipyard))
        .route("/api/users/{id}/research", get(api_research))
        .route("/api/users/{id}/fleets", get(api_fleets))
        .route("/api/users/{id}/notifications", get(api_notifications))
        .route("/api/jobs", get(api_jobs))
        .route("/api/admin/planets", post(api_create_planet))
        .route("/api/admin/rules/reload", post(api_reload_rules))
        .with_state(Arc::new(state))
        // Outermost first: CORS answers preflights, then only loopback and
        // Tailscale peers get through.
        // Never use `Access-Control-Allow-Origin: *` here; any website open in
        // a local browser could then drive game actions.
        .layer(
            ServiceBuilder::new()
                .layer(local_only_cors())
                .layer(middleware::from_fn(ip_allowlist)),
        )
}

async fn health() -> &'static str {
    "ok"
}

type ApiError = (StatusCode, Json<ActionStatus>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn status_for(err: &ActionError) -> StatusCode {
    match err {
        ActionError::NotFound { .. } => StatusCode::NOT_FOUND,
        ActionError::NotOwner { .. } => StatusCode::FORBIDDEN,
        ActionError::UnknownDefinition { .. } | ActionError::InvalidRequest(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::CONFLICT,
    }
}

fn reject(err: anyhow::Error) -> ApiError {
    match err.downcast_ref::<ActionError>() {
        Some(action) => (
            status_for(action),
            Json(ActionStatus::rejected(action.code(), action.to_string())),
        ),
        None => internal(err),
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    let msg = format!("{err:#}");
    error!(error = %msg, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ActionStatus::rejected("internal", msg)),
    )
}

fn not_found(what: &str, id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ActionStatus::rejected("not_found", format!("{what} not found: {id}"))),
    )
}

/// Engine calls touch SQLite and may sleep on retry; keep them off the
/// async workers.
async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("engine task panicked")?
}

async fn run_action<F>(state: Arc<AppState>, action: &'static str, f: F) -> ApiResult<ActionStatus>
where
    F: FnOnce(&Engine) -> anyhow::Result<ActionReceipt> + Send + 'static,
{
    let engine = state.engine.clone();
    match blocking(move || f(&engine)).await {
        Ok(receipt) => {
            debug!(action, entity_id = %receipt.entity_id, "action accepted");
            Ok(Json(ActionStatus::accepted(
                receipt.entity_id,
                receipt.finishes_at_ms,
            )))
        }
        Err(err) => {
            if let Some(rejected) = err.downcast_ref::<ActionError>() {
                info!(action, code = rejected.code(), reason = %rejected, "action rejected");
            }
            Err(reject(err))
        }
    }
}

async fn api_upgrade_structure(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpgradeStructure>,
) -> ApiResult<ActionStatus> {
    run_action(state, actions::UPGRADE_STRUCTURE, move |engine| {
        engine.upgrade_structure(&req)
    })
    .await
}

async fn api_start_research(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartResearch>,
) -> ApiResult<ActionStatus> {
    run_action(state, actions::START_RESEARCH, move |engine| {
        engine.start_research(&req)
    })
    .await
}

async fn api_build_ship(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BuildShip>,
) -> ApiResult<ActionStatus> {
    run_action(state, actions::BUILD_SHIP, move |engine| engine.build_ship(&req)).await
}

async fn api_start_mission(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartMission>,
) -> ApiResult<ActionStatus> {
    run_action(state, actions::START_MISSION, move |engine| {
        engine.start_mission(&req)
    })
    .await
}

async fn api_assign_homeworld(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AssignHomeworld>,
) -> ApiResult<ActionStatus> {
    run_action(state, actions::ASSIGN_HOMEWORLD, move |engine| {
        engine.assign_homeworld(&req)
    })
    .await
}

#[derive(Debug, Serialize)]
struct RevBody {
    rev: i64,
}

async fn api_rev(State(state): State<Arc<AppState>>) -> ApiResult<RevBody> {
    let engine = state.engine.clone();
    let rev = blocking(move || engine.get_rev()).await.map_err(internal)?;
    Ok(Json(RevBody { rev }))
}

async fn api_planet(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<PlanetView> {
    let engine = state.engine.clone();
    let key = id.clone();
    blocking(move || engine.planet_view(&key))
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| not_found("planet", &id))
}

/// A planet that never built anything has an empty queue, not a missing one.
async fn api_shipyard(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<ShipyardQueue> {
    let engine = state.engine.clone();
    let key = id.clone();
    let queue = blocking(move || engine.shipyard(&key))
        .await
        .map_err(internal)?;
    Ok(Json(queue.unwrap_or_else(|| {
        let rules = state.engine.rules().snapshot();
        ShipyardQueue::new(&id, &rules.season, rules.shipyard.capacity)
    })))
}

async fn api_research(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult<UserResearch> {
    let engine = state.engine.clone();
    let key = user_id.clone();
    blocking(move || engine.research(&key))
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| not_found("research record", &user_id))
}

async fn api_fleets(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult<Vec<FleetMovement>> {
    let engine = state.engine.clone();
    let fleets = blocking(move || engine.fleets(&user_id))
        .await
        .map_err(internal)?;
    Ok(Json(fleets))
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    limit: Option<u32>,
}

impl ListQuery {
    fn limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

async fn api_notifications(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Vec<Notification>> {
    let engine = state.engine.clone();
    let limit = q.limit();
    let notes = blocking(move || engine.notifications(&user_id, limit))
        .await
        .map_err(internal)?;
    Ok(Json(notes))
}

async fn api_jobs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Vec<JobRecord>> {
    let engine = state.engine.clone();
    let limit = q.limit();
    let jobs = blocking(move || engine.jobs(limit)).await.map_err(internal)?;
    Ok(Json(jobs))
}

async fn api_create_planet(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreatePlanet>,
) -> ApiResult<Planet> {
    let engine = state.engine.clone();
    let planet = blocking(move || {
        engine.create_planet(Position::new(req.x, req.y, req.galaxy), &req.biome)
    })
    .await
    .map_err(reject)?;
    Ok(Json(planet))
}

#[derive(Debug, Serialize)]
struct ReloadBody {
    season: String,
    structures: usize,
    ships: usize,
    technologies: usize,
}

async fn api_reload_rules(State(state): State<Arc<AppState>>) -> ApiResult<ReloadBody> {
    let engine = state.engine.clone();
    let reloaded = blocking(move || Ok(engine.rules().reload()))
        .await
        .map_err(internal)?;
    match reloaded {
        Ok(rules) => Ok(Json(ReloadBody {
            season: rules.season.clone(),
            structures: rules.structures.len(),
            ships: rules.ships.len(),
            technologies: rules.technologies.len(),
        })),
        Err(err) => {
            warn!(error = %err, "ruleset reload rejected, keeping previous rules");
            Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ActionStatus::rejected("invalid_rules", err.to_string())),
            ))
        }
    }
}

/// Starts `count` tasks draining the job queue. Each runs one job at a time
/// and naps for `poll_interval` whenever nothing is due. Flip `shutdown` to
/// `true` to stop them after their current job.
pub fn spawn_workers(
    engine: Engine,
    count: usize,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker| {
            let engine = engine.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                debug!(worker, "job worker started");
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    let step = engine.clone();
                    let busy = match blocking(move || step.work_once()).await {
                        Ok(Some(report)) => {
                            debug!(worker, job_id = %report.job_id, kind = %report.kind, applied = report.applied, "job processed");
                            true
                        }
                        Ok(None) => false,
                        Err(err) => {
                            warn!(worker, error = %format!("{err:#}"), "worker step failed");
                            false
                        }
                    };
                    if busy {
                        continue;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                debug!(worker, "job worker stopped");
            })
        })
        .collect()
}

pub async fn serve(addr: SocketAddr, config: ServerConfig) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    serve_listener(listener, config, shutdown_signal()).await?;
    Ok(())
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    config: ServerConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SocketAddr> {
    let engine = config.build_engine()?;
    // Fail fast if sqlite is unavailable, and migrate before workers start.
    let _ = engine.open()?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let workers = spawn_workers(engine.clone(), config.workers, config.poll_interval, stop_rx);

    let app = build_router(AppState { engine });
    let addr = listener.local_addr()?;
    info!(%addr, db = %config.db_path.display(), workers = config.workers, "starhold server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    let _ = stop_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    info!("starhold server stopped");
    Ok(addr)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn ip_allowlist(
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<SocketAddr>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let ip = peer.ip();
    if is_allowed_peer_ip(ip) {
        return next.run(req).await;
    }
    warn!(%ip, "rejected request from non-local peer");
    (StatusCode::FORBIDDEN, "forbidden").into_response()
}

fn is_allowed_peer_ip(ip: IpAddr) -> bool {
    if ip.is_loopback() {
        return true;
    }

    // Tailscale CGNAT range (100.64.0.0/10).
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 100 && (64..=127).contains(&o[1])
        }
        IpAddr::V6(_) => false,
    }
}

fn local_only_cors() -> CorsLayer {
    use axum::http::header;
    use axum::http::HeaderValue;
    use axum::http::Method;

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _req| {
            is_allowed_local_origin(origin)
        }))
}

fn is_allowed_local_origin(origin: &axum::http::HeaderValue) -> bool {
    let Ok(s) = origin.to_str() else {
        return false;
    };
    is_http_origin_for_host(s, "localhost") || is_http_origin_for_host(s, "127.0.0.1")
}

fn is_http_origin_for_host(origin: &str, host: &str) -> bool {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = origin.strip_prefix(scheme) {
            if let Some(after) = rest.strip_prefix(host) {
                // scheme://host[:port] only
                return after.is_empty() || after.starts_with(':');
            }
        }
    }
    false
}

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info};

use crate::application::{ClassifierKnobs, Coordinator, Executor};
use crate::config::{AppConfig, OverrideFlags};
use crate::domain::{
    AckItem, AckKind, AssignItem, CreateFaceItem, DomainError, MatchThresholds, ProgressEvent,
    RenameItem, SourceRepository, TargetApi, TargetRepository,
};
use crate::infrastructure::{ImmichClient, LegacySqliteReader, TargetPostgresReader};

/// Connection singletons, established at first use or via the config
/// endpoints. Swapping one replaces the Arc; readers already mid-analysis
/// keep the instance they started with.
#[derive(Default)]
pub struct Connections {
    pub source: Option<Arc<dyn SourceRepository>>,
    pub target: Option<Arc<dyn TargetRepository>>,
    pub api: Option<Arc<dyn TargetApi>>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub overrides: Arc<RwLock<OverrideFlags>>,
    pub connections: Arc<RwLock<Connections>>,
    pub coordinator: Arc<Coordinator>,
    pub executor: Arc<Executor>,
    pub tx: broadcast::Sender<ProgressEvent>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            config: Arc::new(RwLock::new(config)),
            overrides: Arc::new(RwLock::new(OverrideFlags::default())),
            connections: Arc::new(RwLock::new(Connections::default())),
            coordinator: Arc::new(Coordinator::new()),
            executor: Arc::new(Executor::new(tx.clone())),
            tx,
        }
    }

    /// Builds whichever connections the current configuration describes.
    /// Failures are reported on /status rather than failing startup.
    pub async fn connect_configured(&self) {
        let config = self.config.read().await.clone();
        let mut connections = self.connections.write().await;

        if let Some(path) = &config.source_db.path {
            match LegacySqliteReader::open(&path.to_string_lossy()) {
                Ok(reader) => connections.source = Some(Arc::new(reader)),
                Err(e) => error!("source db connection failed: {}", e),
            }
        }
        match TargetPostgresReader::connect(
            &config.target_db.host,
            config.target_db.port,
            &config.target_db.name,
            &config.target_db.user,
            config.target_db.password.as_deref(),
        ) {
            Ok(reader) => connections.target = Some(Arc::new(reader)),
            Err(e) => error!("target db connection failed: {}", e),
        }
        if let (Some(url), Some(key)) = (&config.target_api.url, &config.target_api.api_key) {
            match ImmichClient::new(url, key) {
                Ok(client) => connections.api = Some(Arc::new(client)),
                Err(e) => error!("target api client failed: {}", e),
            }
        }
    }

    async fn require_source(&self) -> Result<Arc<dyn SourceRepository>, DomainError> {
        self.connections.read().await.source.clone().ok_or_else(|| {
            DomainError::Configuration("source database is not configured".into())
        })
    }

    async fn require_target(&self) -> Result<Arc<dyn TargetRepository>, DomainError> {
        self.connections.read().await.target.clone().ok_or_else(|| {
            DomainError::Configuration("target database is not configured".into())
        })
    }

    async fn require_api(&self) -> Result<Arc<dyn TargetApi>, DomainError> {
        self.connections.read().await.api.clone().ok_or_else(|| {
            DomainError::Configuration("target API is not configured".into())
        })
    }

    async fn knobs(&self) -> ClassifierKnobs {
        let config = self.config.read().await;
        ClassifierKnobs {
            min_merge_matches: config.matching.min_merge_matches,
            min_pair_matches: config.matching.min_photos_in_cluster,
            person_name_case_insensitive: config.matching.person_name_case_insensitive,
            ..ClassifierKnobs::default()
        }
    }
}

impl IntoResponse for DomainError {
    fn into_response(self) -> axum::response::Response {
        match &self {
            DomainError::Configuration(_) | DomainError::NotFound(_) | DomainError::Invalid(_) => {}
            other => error!("{}", other),
        }
        let status = match &self {
            DomainError::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            DomainError::Invalid(_) => StatusCode::BAD_REQUEST,
            DomainError::NotFound(_) => StatusCode::NOT_FOUND,
            DomainError::Network(_) | DomainError::Timeout(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "facebridge" }))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let connections = state.connections.read().await;

    let source = match &connections.source {
        Some(repo) => match repo.totals() {
            Ok(totals) => json!({ "connected": true, "totals": totals }),
            Err(e) => json!({ "connected": false, "error": e.to_string() }),
        },
        None => json!({ "connected": false, "error": "not configured" }),
    };
    let target_db = match &connections.target {
        Some(repo) => match repo.totals() {
            Ok(totals) => json!({ "connected": true, "totals": totals }),
            Err(e) => json!({ "connected": false, "error": e.to_string() }),
        },
        None => json!({ "connected": false, "error": "not configured" }),
    };
    let target_api = match &connections.api {
        Some(api) => match api.ping().await {
            Ok(()) => json!({ "connected": true }),
            Err(e) => json!({ "connected": false, "error": e.to_string() }),
        },
        None => json!({ "connected": false, "error": "not configured" }),
    };

    Json(json!({
        "source_db": source,
        "target_db": target_db,
        "target_api": target_api,
    }))
}

async fn stats_handler(State(state): State<AppState>) -> Result<impl IntoResponse, DomainError> {
    let source = state.require_source().await?.totals()?;
    let target = state.require_target().await?.totals()?;
    Ok(Json(json!({ "source": source, "target": target })))
}

async fn get_config_handler(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config.read().await;
    let overrides = state.overrides.read().await;
    Json(config.redacted(&overrides))
}

#[derive(Deserialize)]
struct SourceDbRequest {
    path: String,
}

async fn set_source_db_handler(
    State(state): State<AppState>,
    Json(req): Json<SourceDbRequest>,
) -> impl IntoResponse {
    let reader = match LegacySqliteReader::open(&req.path) {
        Ok(reader) => reader,
        Err(e) => return Json(json!({ "connected": false, "error": e.to_string() })),
    };
    let totals = match reader.totals() {
        Ok(totals) => totals,
        Err(e) => return Json(json!({ "connected": false, "error": e.to_string() })),
    };

    state.config.write().await.source_db.path = Some(PathBuf::from(&req.path));
    state.connections.write().await.source = Some(Arc::new(reader));
    state.overrides.write().await.source_db = true;
    state.coordinator.invalidate().await;
    info!(path = %req.path, "source database hot-swapped");
    Json(json!({ "connected": true, "totals": totals }))
}

#[derive(Deserialize)]
struct TargetApiRequest {
    url: Option<String>,
    api_key: Option<String>,
}

async fn set_target_api_handler(
    State(state): State<AppState>,
    Json(req): Json<TargetApiRequest>,
) -> impl IntoResponse {
    let (url, api_key) = {
        let config = state.config.read().await;
        (
            req.url.or_else(|| config.target_api.url.clone()),
            req.api_key.or_else(|| config.target_api.api_key.clone()),
        )
    };
    let (Some(url), Some(api_key)) = (url, api_key) else {
        return Json(json!({ "connected": false, "error": "url and api_key are required" }));
    };

    let client = match ImmichClient::new(&url, &api_key) {
        Ok(client) => client,
        Err(e) => return Json(json!({ "connected": false, "error": e.to_string() })),
    };
    if let Err(e) = client.ping().await {
        return Json(json!({ "connected": false, "error": e.to_string() }));
    }

    {
        let mut config = state.config.write().await;
        config.target_api.url = Some(url);
        config.target_api.api_key = Some(api_key);
    }
    state.connections.write().await.api = Some(Arc::new(client));
    state.overrides.write().await.target_api = true;
    info!("target API hot-swapped");
    Json(json!({ "connected": true }))
}

#[derive(Deserialize)]
struct TargetDbRequest {
    host: Option<String>,
    port: Option<u16>,
    name: Option<String>,
    user: Option<String>,
    password: Option<String>,
}

async fn set_target_db_handler(
    State(state): State<AppState>,
    Json(req): Json<TargetDbRequest>,
) -> impl IntoResponse {
    let merged = {
        let config = state.config.read().await;
        let mut db = config.target_db.clone();
        if let Some(host) = req.host {
            db.host = host;
        }
        if let Some(port) = req.port {
            db.port = port;
        }
        if let Some(name) = req.name {
            db.name = name;
        }
        if let Some(user) = req.user {
            db.user = user;
        }
        if let Some(password) = req.password {
            db.password = Some(password);
        }
        db
    };

    let reader = match TargetPostgresReader::connect(
        &merged.host,
        merged.port,
        &merged.name,
        &merged.user,
        merged.password.as_deref(),
    ) {
        Ok(reader) => reader,
        Err(e) => return Json(json!({ "connected": false, "error": e.to_string() })),
    };
    let totals = match reader.totals() {
        Ok(totals) => totals,
        Err(e) => return Json(json!({ "connected": false, "error": e.to_string() })),
    };

    state.config.write().await.target_db = merged;
    state.connections.write().await.target = Some(Arc::new(reader));
    state.overrides.write().await.target_db = true;
    state.coordinator.invalidate().await;
    info!("target database hot-swapped");
    Json(json!({ "connected": true, "totals": totals }))
}

#[derive(Deserialize)]
struct RunRequest {
    min_iou: Option<f64>,
    max_center_dist: Option<f64>,
}

async fn run_algorithm_handler(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> Result<impl IntoResponse, DomainError> {
    let defaults = state.config.read().await.default_thresholds();
    let thresholds = MatchThresholds {
        min_iou: req.min_iou.unwrap_or(defaults.min_iou),
        max_center_dist: req.max_center_dist.unwrap_or(defaults.max_center_dist),
    };
    if !(0.0..=1.0).contains(&thresholds.min_iou)
        || !(0.0..=1.0).contains(&thresholds.max_center_dist)
    {
        return Err(DomainError::Invalid("thresholds must lie in [0, 1]".into()));
    }

    let source = state.require_source().await?;
    let target = state.require_target().await?;
    let knobs = state.knobs().await;
    let bundle = state
        .coordinator
        .run_full_analysis(source, target, thresholds, knobs)
        .await?;
    Ok(Json(bundle))
}

#[derive(Deserialize)]
struct ApplyRenamesRequest {
    matches: Vec<RenameItem>,
    #[serde(default)]
    dry_run: bool,
}

async fn apply_renames_handler(
    State(state): State<AppState>,
    Json(req): Json<ApplyRenamesRequest>,
) -> Result<impl IntoResponse, DomainError> {
    let api = state.require_api().await?;
    let report = state
        .executor
        .rename_clusters(api, req.matches, req.dry_run)
        .await;
    state.coordinator.invalidate().await;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct ApplyUnclusteredRequest {
    items: Vec<AssignItem>,
    #[serde(default)]
    dry_run: bool,
}

async fn apply_unclustered_handler(
    State(state): State<AppState>,
    Json(req): Json<ApplyUnclusteredRequest>,
) -> Result<impl IntoResponse, DomainError> {
    let api = state.require_api().await?;
    let report = state
        .executor
        .assign_unclustered_faces(api, req.items, req.dry_run)
        .await;
    state.coordinator.invalidate().await;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct CreateFacesRequest {
    #[allow(dead_code)]
    src_person_id: i64,
    src_person_name: String,
    faces: Vec<CreateFaceItem>,
    #[serde(default)]
    dry_run: bool,
}

async fn apply_create_faces_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateFacesRequest>,
) -> Result<impl IntoResponse, DomainError> {
    let api = state.require_api().await?;
    let report = state
        .executor
        .create_faces(api, &req.src_person_name, req.faces, req.dry_run)
        .await;
    state.coordinator.invalidate().await;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct AcknowledgeRequest {
    kind: AckKind,
    items: Vec<AckItem>,
    #[serde(default)]
    dry_run: bool,
}

async fn apply_acknowledge_handler(
    State(state): State<AppState>,
    Json(req): Json<AcknowledgeRequest>,
) -> impl IntoResponse {
    let report = state.executor.acknowledge(req.kind, req.items, req.dry_run).await;
    Json(report)
}

async fn apply_cancel_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.executor.request_cancel();
    Json(json!({ "cancelled": true }))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let rx = state.tx.subscribe();
    ws.on_upgrade(move |socket| progress_feed(socket, rx))
}

/// Pushes executor progress events to the socket as JSON. Lagging
/// subscribers skip events rather than stalling the executor.
async fn progress_feed(socket: WebSocket, mut rx: broadcast::Receiver<ProgressEvent>) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = stream.next() => match msg {
                Some(Ok(_)) => continue,
                _ => break,
            },
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/stats", get(stats_handler))
        .route("/config", get(get_config_handler))
        .route("/config/source-db", post(set_source_db_handler))
        .route("/config/target-api", post(set_target_api_handler))
        .route("/config/target-db", post(set_target_db_handler))
        .route("/algorithm/run", post(run_algorithm_handler))
        .route("/apply", post(apply_renames_handler))
        .route("/apply/unclustered", post(apply_unclustered_handler))
        .route("/apply/acknowledge", post(apply_acknowledge_handler))
        .route("/apply/cancel", post(apply_cancel_handler))
        .route("/create-faces/apply", post(apply_create_faces_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use prayermap_realtime::{
    DeliveryOutcome, LivingMap, LivingMapStatus, PresenceTracker, RealtimeError,
};
use prayermap_shared::{
    ChatMessage, ConnectionId, ConversationId, GeoPoint, MapUpdate, MapUpdateKind, MessageId,
    OnlineStats, PrayerConnection, PrayerId, PresenceRecord, PresenceStatus, UserId,
};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::{EventHub, HubStats};

#[derive(Clone)]
pub struct AppState {
    pub living_map: LivingMap,
    pub presence: PresenceTracker,
    pub hub: EventHub,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(living_map_status))
        .route("/map-updates", post(submit_map_update))
        .route("/memorials", post(create_memorial))
        .route("/messages", post(deliver_message))
        .route("/presence", post(update_presence))
        .route("/presence/stats", get(presence_stats))
        .route("/presence/:user_id", get(get_presence))
        .route("/admin/status", get(admin_status))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn living_map_status(State(state): State<AppState>) -> Json<LivingMapStatus> {
    Json(state.living_map.status())
}

// ─── Map updates ───

#[derive(Deserialize)]
struct MapUpdateRequest {
    #[serde(default)]
    prayer_id: Option<PrayerId>,
    kind: MapUpdateKind,
    lat: f64,
    lng: f64,
    actor_id: String,
    #[serde(default)]
    connection_id: Option<ConnectionId>,
}

#[derive(Serialize)]
struct MapUpdateResponse {
    prayer_id: PrayerId,
    latency_ms: u64,
    compliant: bool,
}

async fn submit_map_update(
    State(state): State<AppState>,
    Json(req): Json<MapUpdateRequest>,
) -> Result<Json<MapUpdateResponse>, ServerError> {
    let update = MapUpdate {
        prayer_id: req.prayer_id.unwrap_or_default(),
        kind: req.kind,
        location: geo_point(req.lat, req.lng)?,
        actor_id: user_id(req.actor_id)?,
        connection_id: req.connection_id,
        occurred_at: Utc::now(),
    };

    state.living_map.handle_map_update(&update).await?;

    let metrics = state.living_map.metrics();
    Ok(Json(MapUpdateResponse {
        prayer_id: update.prayer_id,
        latency_ms: metrics.map_update_latency_ms,
        compliant: state.living_map.is_compliant(),
    }))
}

// ─── Memorial lines ───

#[derive(Deserialize)]
struct MemorialRequest {
    prayer_id: PrayerId,
    requester_id: String,
    responder_id: String,
    requester_lat: f64,
    requester_lng: f64,
    responder_lat: f64,
    responder_lng: f64,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct MemorialResponse {
    id: ConnectionId,
    preserved: bool,
}

/// 201 once durable, 202 when the write failed and a retry is queued.
async fn create_memorial(
    State(state): State<AppState>,
    Json(req): Json<MemorialRequest>,
) -> Result<(StatusCode, Json<MemorialResponse>), ServerError> {
    let connection = PrayerConnection {
        id: ConnectionId::new(),
        prayer_id: req.prayer_id,
        requester_id: user_id(req.requester_id)?,
        responder_id: user_id(req.responder_id)?,
        requester_location: geo_point(req.requester_lat, req.requester_lng)?,
        responder_location: geo_point(req.responder_lat, req.responder_lng)?,
        created_at: Utc::now(),
        expires_at: req.expires_at,
    };
    let id = connection.id;

    match state.living_map.handle_memorial_line_creation(&connection).await {
        Ok(()) => Ok((StatusCode::CREATED, Json(MemorialResponse { id, preserved: true }))),
        Err(RealtimeError::MemorialPending { .. }) => {
            info!(connection = %id, "Memorial line accepted, retry pending");
            Ok((StatusCode::ACCEPTED, Json(MemorialResponse { id, preserved: false })))
        }
        Err(e) => Err(e.into()),
    }
}

// ─── Messages ───

#[derive(Deserialize)]
struct MessageRequest {
    #[serde(default)]
    conversation_id: Option<ConversationId>,
    sender_id: String,
    body: String,
}

#[derive(Serialize)]
struct MessageResponse {
    id: MessageId,
    outcome: DeliveryOutcome,
}

async fn deliver_message(
    State(state): State<AppState>,
    Json(req): Json<MessageRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ServerError> {
    if req.body.trim().is_empty() {
        return Err(ServerError::BadRequest("Message body must not be empty".into()));
    }

    let message = ChatMessage {
        id: MessageId::new(),
        conversation_id: req.conversation_id.unwrap_or_default(),
        sender_id: user_id(req.sender_id)?,
        body: req.body,
        sent_at: Utc::now(),
    };
    let id = message.id;

    let outcome = state.living_map.handle_message_delivery(message).await;
    let status = match outcome {
        DeliveryOutcome::Sent => StatusCode::OK,
        DeliveryOutcome::Deferred => StatusCode::ACCEPTED,
        DeliveryOutcome::Failed => StatusCode::BAD_GATEWAY,
    };
    Ok((status, Json(MessageResponse { id, outcome })))
}

// ─── Presence ───

#[derive(Deserialize)]
struct PresenceRequest {
    status: PresenceStatus,
    #[serde(default)]
    custom_status: Option<String>,
    #[serde(default)]
    active_task_ids: Vec<PrayerId>,
}

async fn update_presence(
    State(state): State<AppState>,
    Json(req): Json<PresenceRequest>,
) -> Result<Json<PresenceRecord>, ServerError> {
    let user = state
        .presence
        .current_user()
        .ok_or_else(|| ServerError::BadRequest("Presence tracking is not running".into()))?;

    if req.status == PresenceStatus::ActiveTask {
        state
            .presence
            .set_active_task_status(&user, req.active_task_ids, req.custom_status)
            .await;
    } else {
        state
            .presence
            .update_presence(&user, req.status, req.custom_status, Vec::new())
            .await;
    }

    state
        .presence
        .cached_presence(&user)
        .map(Json)
        .ok_or_else(|| ServerError::Internal("Presence write was not recorded".into()))
}

async fn presence_stats(State(state): State<AppState>) -> Result<Json<OnlineStats>, ServerError> {
    Ok(Json(state.presence.get_online_stats().await?))
}

async fn get_presence(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<PresenceRecord>, ServerError> {
    let user = user_id(raw)?;
    if let Some(record) = state.presence.cached_presence(&user) {
        return Ok(Json(record));
    }
    state
        .presence
        .fetch_presence(&user)
        .await?
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("No presence for {user}")))
}

// ─── Admin ───

#[derive(Serialize)]
struct AdminStatusResponse {
    version: &'static str,
    uptime_secs: u64,
    device_id: String,
    tracked_user: Option<UserId>,
    presence_status: Option<PresenceStatus>,
    heartbeat_interval_secs: u64,
    hub: HubStats,
    pending_memorials: Vec<ConnectionId>,
    living_map: LivingMapStatus,
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    Ok(Json(AdminStatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        device_id: state.config.device_id.to_string(),
        tracked_user: state.presence.current_user(),
        presence_status: state.presence.current_status(),
        heartbeat_interval_secs: state.presence.heartbeat_interval().as_secs(),
        hub: state.hub.stats(),
        pending_memorials: state
            .living_map
            .memorials()
            .pending_connections()
            .into_iter()
            .map(|c| c.id)
            .collect(),
        living_map: state.living_map.status(),
    }))
}

fn user_id(raw: String) -> Result<UserId, ServerError> {
    UserId::new(raw).map_err(|e| ServerError::BadRequest(e.to_string()))
}

fn geo_point(lat: f64, lng: f64) -> Result<GeoPoint, ServerError> {
    GeoPoint::new(lat, lng).map_err(|e| ServerError::BadRequest(e.to_string()))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

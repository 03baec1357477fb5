use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use application::{with_deadline, ApplicationError, SendMessageRequest};
use domain::{
    CapabilityProfile, Conversation, ConversationId, GeoPoint, Message, NearbyFilter,
    NearbySitter, SitterPresence, Species, UserId,
};

use crate::{auth::AuthUser, error::ApiError, state::AppState, ws_connection};

#[derive(Debug, Deserialize)]
struct LocationPayload {
    #[serde(alias = "latitude")]
    lat: f64,
    #[serde(alias = "longitude")]
    lon: f64,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    profile: CapabilityProfile,
}

#[derive(Debug, Deserialize)]
struct OnlinePayload {
    online: bool,
    /// 还没有已知位置时可以随上线一起给出
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    profile: Option<CapabilityProfile>,
}

#[derive(Debug, Deserialize)]
struct NearbyQuery {
    lat: f64,
    lon: f64,
    radius: f64,
    species: Option<Species>,
    max_rate: Option<u32>,
    specialty: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct PresenceStatus {
    online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence: Option<SitterPresence>,
}

#[derive(Debug, Deserialize)]
struct StartConversationPayload {
    #[serde(alias = "otherUserId")]
    other_user_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    #[serde(default)]
    since: u64,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SendMessagePayload {
    body: String,
    #[serde(alias = "clientNonce")]
    client_nonce: String,
}

#[derive(Debug, Deserialize)]
struct ReadPayload {
    #[serde(alias = "uptoSeq", alias = "upToSeq")]
    upto_seq: u64,
}

#[derive(Debug, Serialize)]
struct ReadResponse {
    updated: u64,
}

pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    layer.allow_origin(origins)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/presence/location", post(update_location))
        .route("/presence/online", post(set_online))
        .route("/sitters/nearby", get(query_nearby))
        .route("/sitters/{sitter_id}/presence", get(get_presence))
        .route(
            "/conversations",
            post(start_conversation).get(list_conversations),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            post(send_message).get(get_messages),
        )
        .route("/conversations/{conversation_id}/read", post(mark_read))
        .route("/ws", get(websocket_upgrade))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn update_location(
    State(state): State<AppState>,
    AuthUser(sitter_id): AuthUser,
    Json(payload): Json<LocationPayload>,
) -> Result<Json<SitterPresence>, ApiError> {
    let location = GeoPoint::new(payload.lat, payload.lon)?;
    let presence = state.presence_service.update_location(
        sitter_id,
        location,
        payload.address,
        payload.profile,
    )?;
    Ok(Json(presence))
}

async fn set_online(
    State(state): State<AppState>,
    AuthUser(sitter_id): AuthUser,
    Json(payload): Json<OnlinePayload>,
) -> Result<Json<PresenceStatus>, ApiError> {
    if !payload.online {
        state.presence_service.set_online(sitter_id, false)?;
        return Ok(Json(PresenceStatus {
            online: false,
            presence: None,
        }));
    }

    let presence = match (payload.lat, payload.lon) {
        (Some(lat), Some(lon)) => {
            let location = GeoPoint::new(lat, lon)?;
            let profile = match payload.profile {
                Some(profile) => profile,
                None => state
                    .presence_service
                    .get(sitter_id)
                    .map(|current| current.profile)
                    .unwrap_or_default(),
            };
            state
                .presence_service
                .update_location(sitter_id, location, payload.address, profile)?
        }
        _ => {
            state.presence_service.set_online(sitter_id, true)?;
            state
                .presence_service
                .get(sitter_id)
                .ok_or(domain::DomainError::PresenceNotFound)?
        }
    };

    Ok(Json(PresenceStatus {
        online: true,
        presence: Some(presence),
    }))
}

async fn query_nearby(
    State(state): State<AppState>,
    _caller: AuthUser,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<Vec<NearbySitter>>, ApiError> {
    let center = GeoPoint::new(query.lat, query.lon)?;
    let filter = NearbyFilter {
        species: query.species,
        max_hourly_rate_cents: query.max_rate,
        specialty: query.specialty,
    };
    let timeout = state.request_timeout(query.timeout_ms);
    let presence = state.presence_service.clone();
    let radius = query.radius;

    let results = with_deadline(timeout, async move {
        tokio::task::spawn_blocking(move || presence.query_nearby(center, radius, &filter))
            .await
            .map_err(|err| ApplicationError::infrastructure(err.to_string()))?
            .map_err(ApplicationError::from)
    })
    .await?;

    Ok(Json(results))
}

async fn get_presence(
    State(state): State<AppState>,
    _caller: AuthUser,
    Path(sitter_id): Path<Uuid>,
) -> Json<PresenceStatus> {
    let presence = state.presence_service.get(UserId::from(sitter_id));
    Json(PresenceStatus {
        online: presence.is_some(),
        presence,
    })
}

async fn start_conversation(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<StartConversationPayload>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let outcome = state
        .chat_service
        .start_conversation(user_id, UserId::from(payload.other_user_id))
        .await?;

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome.conversation)))
}

async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    let items = state.chat_service.list_conversations(user_id).await?;
    Ok(Json(items))
}

async fn get_messages(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let timeout = state.request_timeout(query.timeout_ms);
    let items = with_deadline(
        timeout,
        state
            .chat_service
            .get_messages(ConversationId::from(conversation_id), user_id, query.since),
    )
    .await?;

    Ok(Json(items))
}

async fn send_message(
    State(state): State<AppState>,
    AuthUser(sender_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(payload): Json<SendMessagePayload>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let outcome = state
        .chat_service
        .send_message(SendMessageRequest {
            conversation_id,
            sender_id: sender_id.0,
            body: payload.body,
            client_nonce: payload.client_nonce,
        })
        .await?;

    // 重复发送同一 nonce 返回 200 和原消息
    let status = if outcome.is_duplicate() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome.into_message())))
}

async fn mark_read(
    State(state): State<AppState>,
    AuthUser(reader_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(payload): Json<ReadPayload>,
) -> Result<Json<ReadResponse>, ApiError> {
    let updated = state
        .chat_service
        .mark_read(ConversationId::from(conversation_id), reader_id, payload.upto_seq)
        .await?;
    Ok(Json(ReadResponse { updated }))
}

/// 认证在连接建立后的第一帧完成，升级本身不要求凭证
async fn websocket_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| ws_connection::handle_socket(socket, state))
}

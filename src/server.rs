//! HTTP surface: message send and history, membership event hooks,
//! translation metrics, the realtime socket and uploaded media.

use crate::auth::{token_from_headers, Authenticator};
use crate::error::{AppError, AppResult};
use crate::fanout::{Content, Fanout};
use crate::i18n::MetricsReport;
use crate::media::MediaStore;
use crate::models::{Message, Target, UserId};
use crate::ws;
use axum::{
    async_trait,
    extract::{DefaultBodyLimit, FromRequestParts, Multipart, Path, State},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub fanout: Arc<Fanout>,
    pub auth: Arc<dyn Authenticator>,
    pub media: Arc<dyn MediaStore>,
}

/// Where uploaded files live on disk and the URL prefix they are served at.
#[derive(Debug, Clone)]
pub struct MediaRoute {
    pub dir: String,
    pub base_url: String,
}

pub fn create_router(state: AppState, media: &MediaRoute) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/api/messages/send-text", post(send_text))
        .route(
            "/api/messages/send-image",
            post(send_image).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route(
            "/api/messages/conversation/:user_a/:user_b",
            get(get_conversation),
        )
        .route("/api/messages/room/:room_id/messages", get(get_room_messages))
        .route("/api/rooms/:room_id/events/invite", post(room_invite_event))
        .route("/api/rooms/:room_id/events/remove", post(room_removal_event))
        .route("/api/translation/metrics", get(translation_metrics))
        .route("/ws", get(ws::ws_handler));

    // Only a local path prefix can be served from here; an absolute base URL
    // points at a CDN in front of the directory
    let base = media.base_url.trim_end_matches('/');
    if base.starts_with('/') && !base.is_empty() {
        router = router.nest_service(base, ServeDir::new(&media.dir));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// The authenticated caller, from the bearer header or the `jwt` cookie.
pub struct AuthUser(pub UserId);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = token_from_headers(&parts.headers)
            .ok_or_else(|| AppError::Unauthorized("Missing credentials".to_string()))?;
        Ok(AuthUser(state.auth.authenticate(&token)?))
    }
}

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTextRequest {
    pub receiver_id: Option<String>,
    pub room_id: Option<String>,
    pub text: Option<String>,
    pub source_lang_override: Option<String>,
}

/// Run the send on its own task so a client hanging up mid-request cannot
/// cancel the write, then render the result for the sender.
async fn send_detached(
    state: &AppState,
    sender_id: UserId,
    target: Target,
    content: Content,
) -> AppResult<Message> {
    let fanout = Arc::clone(&state.fanout);
    let sender = sender_id.clone();
    let message = tokio::spawn(async move { fanout.send(&sender, target, content).await })
        .await
        .map_err(|e| AppError::Internal(format!("Send task failed: {}", e)))??;

    let lang = state.fanout.viewer_language(&sender_id).await;
    Ok(message.for_viewer(&lang))
}

async fn send_text(
    State(state): State<AppState>,
    AuthUser(sender_id): AuthUser,
    Json(body): Json<SendTextRequest>,
) -> AppResult<impl IntoResponse> {
    let target = Target::from_fields(body.receiver_id, body.room_id)?;
    let text = body
        .text
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| AppError::Validation("text is required".to_string()))?;

    let content = Content {
        text,
        image_url: None,
        source_lang_override: body.source_lang_override,
    };
    let message = send_detached(&state, sender_id, target, content).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

struct ImageUpload {
    content_type: String,
    file_name: Option<String>,
    bytes: Vec<u8>,
}

async fn send_image(
    State(state): State<AppState>,
    AuthUser(sender_id): AuthUser,
    mut multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    let mut receiver_id = None;
    let mut room_id = None;
    let mut text = None;
    let mut source_lang_override = None;
    let mut image = None;

    let bad_field = |e: axum::extract::multipart::MultipartError| {
        AppError::Validation(format!("Malformed upload: {}", e))
    };

    while let Some(field) = multipart.next_field().await.map_err(bad_field)? {
        match field.name() {
            Some("receiverId") => receiver_id = Some(field.text().await.map_err(bad_field)?),
            Some("roomId") => room_id = Some(field.text().await.map_err(bad_field)?),
            Some("text") => text = Some(field.text().await.map_err(bad_field)?),
            Some("sourceLangOverride") => {
                source_lang_override = Some(field.text().await.map_err(bad_field)?)
            }
            Some("image") => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let file_name = field.file_name().map(str::to_string);
                let bytes = field.bytes().await.map_err(bad_field)?.to_vec();
                image = Some(ImageUpload {
                    content_type,
                    file_name,
                    bytes,
                });
            }
            _ => continue,
        }
    }

    let target = Target::from_fields(receiver_id, room_id)?;
    let image = image.ok_or_else(|| AppError::Validation("image file is required".to_string()))?;
    state.fanout.authorize_send(&sender_id, &target).await?;

    let image_url = state
        .media
        .store_image(&image.content_type, image.file_name.as_deref(), &image.bytes)
        .await?;
    info!("{} uploaded {} ({} bytes)", sender_id, image_url, image.bytes.len());

    let content = Content {
        text: text.unwrap_or_default(),
        image_url: Some(image_url.clone()),
        source_lang_override: source_lang_override.filter(|code| !code.trim().is_empty()),
    };
    match send_detached(&state, sender_id, target, content).await {
        Ok(message) => Ok((StatusCode::CREATED, Json(message))),
        Err(e) => {
            state.media.discard(&image_url).await;
            Err(e)
        }
    }
}

async fn get_conversation(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path((user_a, user_b)): Path<(String, String)>,
) -> AppResult<Json<Vec<Message>>> {
    let messages = state
        .fanout
        .conversation_history(&caller, &user_a, &user_b)
        .await?;
    Ok(Json(messages))
}

async fn get_room_messages(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(room_id): Path<String>,
) -> AppResult<Json<Vec<Message>>> {
    let messages = state.fanout.room_history(&caller, &room_id).await?;
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteEventRequest {
    pub invitee_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalEventRequest {
    pub user_id: String,
}

/// Called by room administration after it added `inviteeId` to the room.
async fn room_invite_event(
    State(state): State<AppState>,
    AuthUser(inviter): AuthUser,
    Path(room_id): Path<String>,
    Json(body): Json<InviteEventRequest>,
) -> AppResult<impl IntoResponse> {
    let subscribed = state
        .fanout
        .room_invite(&room_id, &inviter, &body.invitee_id)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "subscribedConnections": subscribed })),
    ))
}

/// Called by room administration after it removed `userId` from the room.
async fn room_removal_event(
    State(state): State<AppState>,
    AuthUser(remover): AuthUser,
    Path(room_id): Path<String>,
    Json(body): Json<RemovalEventRequest>,
) -> AppResult<impl IntoResponse> {
    let unsubscribed = state
        .fanout
        .room_member_removed(&room_id, &remover, &body.user_id)
        .await
        .inspect_err(|e| warn!("Removal event for room {} rejected: {}", room_id, e))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "unsubscribedConnections": unsubscribed })),
    ))
}

async fn translation_metrics(State(state): State<AppState>) -> Json<MetricsReport> {
    Json(state.fanout.translator().metrics().report())
}

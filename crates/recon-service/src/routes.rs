use crate::{
  aggregator::PresentationView,
  error::ApiError,
  reconciler::ReconcileSummary,
  session::SessionStatus,
  state::AppState,
};
use axum::{
  extract::{Path, State},
  http::{header, StatusCode},
  response::IntoResponse,
  routing::{get, post},
  Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use common::frames::DetectionFrame;
use common::identities::{KnownIdentity, UnknownIdentity};
use common::validation::{validate_http_url, validate_id, validate_username};
use inference_client::{ApiStatus, EmbeddingImage};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

/// Upper bound on images accepted per enrolment request
pub const MAX_EMBEDDING_IMAGES: usize = 20;

const MIN_POLL_INTERVAL_MS: u64 = 100;

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/healthz", get(healthz))
    .route("/readyz", get(readyz))
    .route("/metrics", get(metrics))
    .route("/v1/sessions", get(list_sessions).post(start_session))
    .route("/v1/sessions/:id", get(get_session).delete(stop_session))
    .route(
      "/v1/identities/known",
      get(list_known).post(create_known),
    )
    .route("/v1/identities/known/:username", get(get_known))
    .route(
      "/v1/identities/known/:username/embedding",
      post(enroll_embedding),
    )
    .route("/v1/identities/unknown", get(list_unknown))
    .route("/v1/frames/reconcile", post(reconcile_frame))
    .route("/v1/inference/status", get(inference_status))
    .route("/v1/inference/video-feed", get(video_feed))
    .with_state(state)
}

async fn healthz() -> &'static str {
  "ok"
}

async fn readyz(State(state): State<AppState>) -> Result<&'static str, ApiError> {
  match state.store().health_check().await {
    Ok(true) => Ok("ready"),
    Ok(false) => Err(ApiError::internal("identity store not ready")),
    Err(e) => Err(ApiError::internal(format!("health check failed: {}", e))),
  }
}

async fn metrics() -> Result<impl IntoResponse, ApiError> {
  let body = telemetry::metrics::encode_metrics()
    .map_err(|e| ApiError::internal(format!("failed to encode metrics: {e}")))?;
  Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

#[derive(Debug, Default, Deserialize)]
pub struct StartSessionRequest {
  #[serde(default)]
  pub session_id: Option<String>,
  #[serde(default)]
  pub endpoint: Option<String>,
  #[serde(default)]
  pub interval_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartSessionResponse {
  pub session_id: String,
}

async fn start_session(
  State(state): State<AppState>,
  Json(payload): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<StartSessionResponse>), ApiError> {
  let session_id = payload
    .session_id
    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
  validate_id(&session_id, "session_id").map_err(|e| ApiError::bad_request(e.to_string()))?;

  let endpoint = match payload.endpoint {
    Some(raw) => {
      validate_http_url(&raw, "endpoint").map_err(|e| ApiError::bad_request(e.to_string()))?;
      Some(Url::parse(&raw).map_err(|e| ApiError::bad_request(format!("invalid endpoint: {e}")))?)
    }
    None => None,
  };

  let interval = match payload.interval_ms {
    Some(ms) if ms < MIN_POLL_INTERVAL_MS => {
      return Err(ApiError::bad_request(format!(
        "interval_ms must be at least {MIN_POLL_INTERVAL_MS}"
      )))
    }
    Some(ms) => Some(Duration::from_millis(ms)),
    None => None,
  };

  let session_id = state.start_session(session_id, endpoint, interval).await;
  info!(session = %session_id, node = %state.node_id(), "polling session requested");

  Ok((StatusCode::CREATED, Json(StartSessionResponse { session_id })))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionStatus>> {
  Json(state.sessions().list().await)
}

#[derive(Debug, Serialize)]
pub struct SessionDetail {
  pub status: SessionStatus,
  pub view: PresentationView,
}

async fn get_session(
  State(state): State<AppState>,
  Path(id): Path<String>,
) -> Result<Json<SessionDetail>, ApiError> {
  let (status, view) = state
    .sessions()
    .view(&id)
    .await
    .ok_or_else(|| ApiError::not_found(format!("session '{}' not found", id)))?;
  Ok(Json(SessionDetail { status, view }))
}

async fn stop_session(
  State(state): State<AppState>,
  Path(id): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
  let status = state
    .sessions()
    .stop(&id)
    .await
    .ok_or_else(|| ApiError::not_found(format!("session '{}' not found", id)))?;
  info!(session = %id, "polling session stopped by request");
  Ok(Json(status))
}

#[derive(Debug, Deserialize)]
pub struct CreateKnownRequest {
  pub username: String,
}

async fn create_known(
  State(state): State<AppState>,
  Json(payload): Json<CreateKnownRequest>,
) -> Result<(StatusCode, Json<KnownIdentity>), ApiError> {
  validate_username(&payload.username).map_err(|e| ApiError::bad_request(e.to_string()))?;

  let identity = KnownIdentity::new(payload.username);
  if !state.store().create_known(&identity).await? {
    return Err(ApiError::conflict(format!(
      "identity '{}' already exists",
      identity.username
    )));
  }
  info!(username = %identity.username, "known identity provisioned");
  Ok((StatusCode::CREATED, Json(identity)))
}

async fn list_known(State(state): State<AppState>) -> Result<Json<Vec<KnownIdentity>>, ApiError> {
  Ok(Json(state.store().list_known().await?))
}

async fn get_known(
  State(state): State<AppState>,
  Path(username): Path<String>,
) -> Result<Json<KnownIdentity>, ApiError> {
  state
    .store()
    .find_by_username(&username)
    .await?
    .map(Json)
    .ok_or_else(|| ApiError::not_found(format!("identity '{}' not found", username)))
}

#[derive(Debug, Deserialize)]
pub struct EnrollEmbeddingRequest {
  /// Base64 images, optionally as `data:` URLs
  pub images: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct EnrollEmbeddingResponse {
  pub identity: KnownIdentity,
  pub dimensions: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

async fn enroll_embedding(
  State(state): State<AppState>,
  Path(username): Path<String>,
  Json(payload): Json<EnrollEmbeddingRequest>,
) -> Result<Json<EnrollEmbeddingResponse>, ApiError> {
  if payload.images.is_empty() {
    return Err(ApiError::bad_request("at least one image is required"));
  }
  if payload.images.len() > MAX_EMBEDDING_IMAGES {
    return Err(ApiError::bad_request(format!(
      "at most {MAX_EMBEDDING_IMAGES} images per request"
    )));
  }

  let store = state.store();
  if store.find_by_username(&username).await?.is_none() {
    return Err(ApiError::not_found(format!(
      "identity '{}' not found",
      username
    )));
  }

  let images = payload
    .images
    .iter()
    .enumerate()
    .map(|(index, raw)| decode_image(index, raw))
    .collect::<Result<Vec<_>, _>>()?;

  let result = state
    .client()
    .calculate_average_embedding(&username, images, state.config().embedding_timeout())
    .await?;
  let dimensions = result.embedding.len();

  let identity = store
    .set_known_embedding(&username, result.embedding)
    .await?
    .ok_or_else(|| ApiError::not_found(format!("identity '{}' not found", username)))?;

  info!(username = %username, dimensions, "embedding enrolled");
  Ok(Json(EnrollEmbeddingResponse {
    identity,
    dimensions,
    message: result.message,
  }))
}

fn decode_image(index: usize, raw: &str) -> Result<EmbeddingImage, ApiError> {
  let (content_type, data) = match raw.strip_prefix("data:") {
    Some(rest) => {
      let (meta, data) = rest
        .split_once(',')
        .ok_or_else(|| ApiError::bad_request(format!("image {index} is not a valid data URL")))?;
      let mime = meta.strip_suffix(";base64").unwrap_or(meta);
      (mime.to_string(), data)
    }
    None => ("image/jpeg".to_string(), raw),
  };

  let bytes = STANDARD
    .decode(data.trim())
    .map_err(|e| ApiError::bad_request(format!("image {index} is not valid base64: {e}")))?;
  if bytes.is_empty() {
    return Err(ApiError::bad_request(format!("image {index} is empty")));
  }

  let extension = match content_type.as_str() {
    "image/png" => "png",
    "image/webp" => "webp",
    _ => "jpg",
  };
  Ok(EmbeddingImage {
    file_name: format!("capture_{index}.{extension}"),
    content_type,
    data: bytes,
  })
}

async fn list_unknown(
  State(state): State<AppState>,
) -> Result<Json<Vec<UnknownIdentity>>, ApiError> {
  Ok(Json(state.store().list_unknown().await?))
}

async fn reconcile_frame(
  State(state): State<AppState>,
  Json(body): Json<Value>,
) -> Result<Json<ReconcileSummary>, ApiError> {
  let frame = DetectionFrame::from_metadata(&body, Utc::now())
    .map_err(|e| ApiError::bad_request(e.to_string()))?;
  let summary = state.reconciler().reconcile_frame(&frame).await;
  info!(
    succeeded = summary.succeeded,
    failed = summary.failed,
    skipped = summary.skipped,
    "pushed frame reconciled"
  );
  Ok(Json(summary))
}

async fn inference_status(State(state): State<AppState>) -> Json<ApiStatus> {
  Json(
    state
      .client()
      .api_status(state.config().status_timeout)
      .await,
  )
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VideoFeedResponse {
  pub url: String,
}

async fn video_feed(State(state): State<AppState>) -> Result<Json<VideoFeedResponse>, ApiError> {
  let url = state.client().video_feed_url()?;
  Ok(Json(VideoFeedResponse {
    url: url.to_string(),
  }))
}

//! REST endpoints for the booking wizard.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::controller::FlowSnapshot;
use super::model::{ContactInfo, PatientDetails};
use super::session::SessionRegistry;
use crate::error::{Error, FieldError, FlowError, SessionError};

/// Shared state for booking routes.
#[derive(Clone)]
pub struct BookingRouteState {
    pub registry: Arc<SessionRegistry>,
}

// ── Error responses ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorObject,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

/// An error rendered as a JSON body with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorObject,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorObject {
                code,
                message: message.into(),
                fields: Vec::new(),
                retryable: None,
            },
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::Session(SessionError::NotFound(_)) => {
                Self::new(StatusCode::NOT_FOUND, "SESSION_NOT_FOUND", message)
            }
            Error::Session(SessionError::LimitReached { .. }) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "SESSION_LIMIT", message)
            }
            Error::Flow(FlowError::Validation(v)) => {
                let mut api = Self::new(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR", message);
                api.body.fields = v.fields;
                api
            }
            Error::Flow(FlowError::Submission(s)) => {
                let (status, code) = if s.retryable {
                    (StatusCode::BAD_GATEWAY, "SUBMISSION_FAILED")
                } else {
                    (StatusCode::CONFLICT, "SUBMISSION_REJECTED")
                };
                let mut api = Self::new(status, code, message);
                api.body.retryable = Some(s.retryable);
                api
            }
            Error::Flow(FlowError::FetchFailed { retryable, .. }) => {
                let mut api = Self::new(StatusCode::BAD_GATEWAY, "FETCH_FAILED", message);
                api.body.retryable = Some(retryable);
                api
            }
            Error::Flow(FlowError::FetchInFlight { .. } | FlowError::SubmissionInFlight) => {
                Self::new(StatusCode::CONFLICT, "IN_FLIGHT", message)
            }
            Error::Flow(FlowError::Finished { .. }) => {
                Self::new(StatusCode::CONFLICT, "FLOW_FINISHED", message)
            }
            Error::Flow(
                FlowError::WrongStep { .. }
                | FlowError::NotLoaded { .. }
                | FlowError::NothingToLoad { .. },
            ) => Self::new(StatusCode::CONFLICT, "WRONG_STEP", message),
            Error::Directory(_) => Self::new(StatusCode::BAD_GATEWAY, "DIRECTORY_ERROR", message),
            Error::Database(_) | Error::Config(_) => {
                tracing::error!(error = %message, "Internal error in booking route");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "Internal error")
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), "INVALID_BODY", rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.body })).into_response()
    }
}

type ApiResult = Result<Json<FlowSnapshot>, ApiError>;

fn parse_session_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request("Invalid session ID"))
}

// ── Request bodies ──────────────────────────────────────────────────────

/// JSON body extractor whose rejections use the error envelope.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
struct ApiJson<T>(T);

#[derive(Debug, Deserialize)]
struct IntentBody {
    is_for_self: bool,
}

#[derive(Debug, Deserialize)]
struct PayerBody {
    payer_id: String,
    #[serde(default)]
    member_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderBody {
    provider_id: String,
}

#[derive(Debug, Deserialize)]
struct SlotBody {
    slot_id: String,
}

#[derive(Debug, Deserialize)]
struct ReasonBody {
    #[serde(default)]
    reason: Option<String>,
}

// ── Handlers ────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// POST /api/booking/sessions
async fn create_session(State(state): State<BookingRouteState>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.registry.create().await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// GET /api/booking/sessions/{id}
async fn get_session(State(state): State<BookingRouteState>, Path(id): Path<String>) -> ApiResult {
    let id = parse_session_id(&id)?;
    Ok(Json(state.registry.snapshot(id).await?))
}

/// DELETE /api/booking/sessions/{id}
///
/// Abandons the booking and discards the draft.
async fn abandon_session(
    State(state): State<BookingRouteState>,
    Path(id): Path<String>,
) -> ApiResult {
    let id = parse_session_id(&id)?;
    Ok(Json(state.registry.abandon(id).await?))
}

async fn select_intent(
    State(state): State<BookingRouteState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<IntentBody>,
) -> ApiResult {
    let id = parse_session_id(&id)?;
    Ok(Json(state.registry.select_intent(id, body.is_for_self).await?))
}

async fn advance(State(state): State<BookingRouteState>, Path(id): Path<String>) -> ApiResult {
    let id = parse_session_id(&id)?;
    Ok(Json(state.registry.advance(id).await?))
}

async fn back(State(state): State<BookingRouteState>, Path(id): Path<String>) -> ApiResult {
    let id = parse_session_id(&id)?;
    Ok(Json(state.registry.back(id).await?))
}

async fn set_patient(
    State(state): State<BookingRouteState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<PatientDetails>,
) -> ApiResult {
    let id = parse_session_id(&id)?;
    Ok(Json(state.registry.set_patient(id, body).await?))
}

async fn set_contact(
    State(state): State<BookingRouteState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<ContactInfo>,
) -> ApiResult {
    let id = parse_session_id(&id)?;
    Ok(Json(state.registry.set_contact(id, body).await?))
}

async fn select_payer(
    State(state): State<BookingRouteState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<PayerBody>,
) -> ApiResult {
    let id = parse_session_id(&id)?;
    Ok(Json(
        state
            .registry
            .select_payer(id, body.payer_id, body.member_id)
            .await?,
    ))
}

async fn select_provider(
    State(state): State<BookingRouteState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<ProviderBody>,
) -> ApiResult {
    let id = parse_session_id(&id)?;
    Ok(Json(state.registry.select_provider(id, body.provider_id).await?))
}

async fn select_slot(
    State(state): State<BookingRouteState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<SlotBody>,
) -> ApiResult {
    let id = parse_session_id(&id)?;
    Ok(Json(state.registry.select_slot(id, &body.slot_id).await?))
}

async fn set_reason(
    State(state): State<BookingRouteState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<ReasonBody>,
) -> ApiResult {
    let id = parse_session_id(&id)?;
    Ok(Json(state.registry.set_reason(id, body.reason).await?))
}

/// POST /api/booking/sessions/{id}/load
///
/// Loads (or retries) the list the current step renders.
async fn load(State(state): State<BookingRouteState>, Path(id): Path<String>) -> ApiResult {
    let id = parse_session_id(&id)?;
    Ok(Json(state.registry.load(id).await?))
}

/// POST /api/booking/sessions/{id}/submit
async fn submit(State(state): State<BookingRouteState>, Path(id): Path<String>) -> ApiResult {
    let id = parse_session_id(&id)?;
    Ok(Json(state.registry.submit(id).await?))
}

/// Build the booking REST routes.
pub fn booking_routes(state: BookingRouteState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/booking/sessions", post(create_session))
        .route(
            "/api/booking/sessions/{id}",
            get(get_session).delete(abandon_session),
        )
        .route("/api/booking/sessions/{id}/intent", post(select_intent))
        .route("/api/booking/sessions/{id}/advance", post(advance))
        .route("/api/booking/sessions/{id}/back", post(back))
        .route("/api/booking/sessions/{id}/patient", put(set_patient))
        .route("/api/booking/sessions/{id}/contact", put(set_contact))
        .route("/api/booking/sessions/{id}/payer", put(select_payer))
        .route("/api/booking/sessions/{id}/provider", put(select_provider))
        .route("/api/booking/sessions/{id}/slot", put(select_slot))
        .route("/api/booking/sessions/{id}/reason", put(set_reason))
        .route("/api/booking/sessions/{id}/load", post(load))
        .route("/api/booking/sessions/{id}/submit", post(submit))
        .with_state(state)
}

//! HTTP boundary: resolves each request to a client identity and forwards it
//! to the hub.
//!
//! | method | path        | purpose                    |
//! |--------|-------------|----------------------------|
//! | GET    | `/`         | long-poll registration     |
//! | POST   | `/`         | submit remote edits        |
//! | GET    | `/projects` | projects visible to a place|

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use tidepool_core::{ClientId, PlaceId, ProjectName, SubmitBody};
use tidepool_sync::{ConnectionId, HubHandle, Responder, SyncError};

use crate::paths::{CLIENT_ID_HEADER, LEGACY_PLACE_ID_HEADER, PLACE_ID_HEADER, PROJECTS_ROUTE};

#[derive(Clone)]
struct AppState {
    hub: HubHandle,
    next_connection: Arc<AtomicU64>,
}

/// Build the router over a running hub.
pub fn router(hub: HubHandle) -> Router {
    let state = AppState {
        hub,
        next_connection: Arc::new(AtomicU64::new(1)),
    };
    Router::new()
        .route("/", get(long_poll).post(submit))
        .route(PROJECTS_ROUTE, get(list_projects))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Rendered as `{ "error": "<message>" }`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let message = err.to_string();
        match err {
            SyncError::NotRunning | SyncError::HubClosed => ApiError::Unavailable(message),
            SyncError::InvalidPlaceId(_) => ApiError::BadRequest(message),
            SyncError::UnknownProject(_) => ApiError::NotFound(message),
            SyncError::Unauthorized { .. } => ApiError::Forbidden(message),
            _ => ApiError::Internal(message),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

fn client_id(headers: &HeaderMap) -> Result<ClientId, ApiError> {
    let value = headers
        .get(CLIENT_ID_HEADER)
        .ok_or_else(|| ApiError::BadRequest(format!("missing {CLIENT_ID_HEADER} header")))?;
    let text = value
        .to_str()
        .map_err(|_| ApiError::BadRequest(format!("{CLIENT_ID_HEADER} header is not valid text")))?
        .trim();
    if text.is_empty() {
        return Err(ApiError::BadRequest(format!("{CLIENT_ID_HEADER} header is empty")));
    }
    Ok(ClientId::from(text))
}

fn place_id(headers: &HeaderMap) -> Result<PlaceId, ApiError> {
    let value = headers
        .get(PLACE_ID_HEADER)
        .or_else(|| headers.get(LEGACY_PLACE_ID_HEADER))
        .ok_or_else(|| ApiError::BadRequest(format!("missing {PLACE_ID_HEADER} header")))?;
    let id = value
        .to_str()
        .ok()
        .and_then(|text| text.trim().parse::<u64>().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| {
            ApiError::BadRequest(format!("{PLACE_ID_HEADER} header must be a positive integer"))
        })?;
    Ok(PlaceId(id))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Releases the hub's reference to this request's responder when the request
/// future is dropped (peer closed the connection, or the response was sent).
struct ConnectionGuard {
    hub: HubHandle,
    client: ClientId,
    connection: ConnectionId,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.hub.disconnect(self.client.clone(), self.connection);
    }
}

async fn long_poll(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let client = client_id(&headers)?;
    let place = place_id(&headers)?;
    let connection = state.next_connection.fetch_add(1, Ordering::Relaxed);

    let (responder, rx) = Responder::channel(connection);
    state.hub.connect(client.clone(), place, responder).await?;
    let _guard = ConnectionGuard {
        hub: state.hub.clone(),
        client,
        connection,
    };

    match rx.await {
        Ok(payload) => Ok(Json(payload).into_response()),
        // Superseded by a newer registration, or the hub stopped.
        Err(_) => Ok(StatusCode::OK.into_response()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub ok: bool,
    pub received: usize,
}

async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SubmitBody>, JsonRejection>,
) -> Result<Json<Acknowledgement>, ApiError> {
    let client = client_id(&headers)?;
    let place = place_id(&headers)?;
    let Json(body) = body?;
    let received = state.hub.submit(client, place, body).await?;
    Ok(Json(Acknowledgement { ok: true, received }))
}

async fn list_projects(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ProjectName>>, ApiError> {
    let place = place_id(&headers)?;
    Ok(Json(state.hub.list_projects(place).await?))
}

//! HTTP API handlers
//!
//! Session calls block (they join loop threads), so they run on the blocking
//! pool rather than on the async workers.

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::audio::device::{list_devices, AudioDeviceInfo};
use crate::error::{Error, ErrorKind};
use crate::protocol::{ConnectionDescriptor, StatusUpdate};
use crate::session::PeerSessionManager;
use crate::ui::server::AppState;

/// API response wrapper
#[derive(Debug, serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            kind: None,
        }
    }

    pub fn error(err: &Error) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.to_string()),
            kind: Some(err.kind()),
        }
    }
}

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

fn status_code(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidState => StatusCode::CONFLICT,
        ErrorKind::DeviceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Configuration => StatusCode::BAD_REQUEST,
        ErrorKind::ExchangeFailed | ErrorKind::PeerDisconnected => StatusCode::BAD_GATEWAY,
        ErrorKind::TransientSendFailure | ErrorKind::Io => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reply<T>(result: crate::Result<T>, success: StatusCode) -> ApiResult<T> {
    match result {
        Ok(data) => (success, Json(ApiResponse::ok(data))),
        Err(e) => (status_code(e.kind()), Json(ApiResponse::error(&e))),
    }
}

/// Run a session call on the blocking pool
async fn blocking<T, F>(state: &AppState, call: F) -> crate::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&PeerSessionManager) -> crate::Result<T> + Send + 'static,
{
    let manager = state.manager.clone();
    tokio::task::spawn_blocking(move || call(&manager))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

/// Current session status
pub async fn get_status(State(state): State<Arc<AppState>>) -> ApiResult<StatusUpdate> {
    let result = blocking(&state, |manager| Ok(manager.status())).await;
    reply(result, StatusCode::OK)
}

/// Available audio devices
pub async fn get_devices() -> Json<ApiResponse<Vec<AudioDeviceInfo>>> {
    let devices = tokio::task::spawn_blocking(list_devices)
        .await
        .unwrap_or_default();
    Json(ApiResponse::ok(devices))
}

/// Start a session; progress is reported over `/ws`
pub async fn select_peer(
    State(state): State<Arc<AppState>>,
    Json(descriptor): Json<ConnectionDescriptor>,
) -> ApiResult<StatusUpdate> {
    let result = blocking(&state, move |manager| {
        manager.select_peer(descriptor)?;
        Ok(manager.status())
    })
    .await;
    reply(result, StatusCode::ACCEPTED)
}

/// Push-to-talk pressed
pub async fn begin_transmit(State(state): State<Arc<AppState>>) -> ApiResult<StatusUpdate> {
    let result = blocking(&state, |manager| {
        manager.begin_transmit()?;
        Ok(manager.status())
    })
    .await;
    reply(result, StatusCode::OK)
}

/// Push-to-talk released
pub async fn end_transmit(State(state): State<Arc<AppState>>) -> ApiResult<StatusUpdate> {
    let result = blocking(&state, |manager| {
        manager.end_transmit();
        Ok(manager.status())
    })
    .await;
    reply(result, StatusCode::OK)
}

pub async fn disconnect(State(state): State<Arc<AppState>>) -> ApiResult<StatusUpdate> {
    let result = blocking(&state, |manager| {
        manager.disconnect();
        Ok(manager.status())
    })
    .await;
    reply(result, StatusCode::OK)
}

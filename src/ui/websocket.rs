//! WebSocket event stream

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::protocol::{SessionEvent, StatusUpdate};
use crate::session::SessionObserver;
use crate::ui::server::AppState;

/// Forwards session events from the control thread to WebSocket clients
pub struct BroadcastObserver {
    tx: broadcast::Sender<SessionEvent>,
}

impl BroadcastObserver {
    pub fn new(tx: broadcast::Sender<SessionEvent>) -> Self {
        Self { tx }
    }
}

impl SessionObserver for BroadcastObserver {
    fn on_status(&mut self, status: &StatusUpdate) {
        tracing::info!(
            "Status: {} peer={} role={:?} address={}",
            status.state,
            status.peer_name.as_deref().unwrap_or("-"),
            status.role,
            status.address
        );
        // No subscribers is fine
        let _ = self.tx.send(SessionEvent::Status(status.clone()));
    }

    fn on_error(&mut self, session_id: Option<Uuid>, kind: ErrorKind, message: &str) {
        tracing::warn!("Session error ({:?}): {}", kind, message);
        let _ = self.tx.send(SessionEvent::Error {
            session_id,
            kind,
            message: message.to_string(),
        });
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.events.subscribe();

    // Current status first so a fresh client has something to render
    let Some(initial) = current_status(&state).await else {
        return;
    };
    if send_event(&mut sender, &initial).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("WebSocket client lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::debug!("WebSocket client disconnected");
}

/// Status lookups take the session lock, so they run on the blocking pool
async fn current_status(state: &AppState) -> Option<SessionEvent> {
    let manager = state.manager.clone();
    match tokio::task::spawn_blocking(move || manager.status()).await {
        Ok(status) => Some(SessionEvent::Status(status)),
        Err(e) => {
            tracing::warn!("Status lookup failed: {}", e);
            None
        }
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &SessionEvent,
) -> Result<(), ()> {
    let json = serde_json::to_string(event).map_err(|e| {
        tracing::warn!("Failed to encode event: {}", e);
    })?;
    sender.send(Message::Text(json)).await.map_err(|_| ())
}

//! Control server

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use crate::config::UiConfig;
use crate::error::{Error, Result};
use crate::protocol::SessionEvent;
use crate::session::PeerSessionManager;
use crate::ui::{handlers, websocket};

/// Events buffered per WebSocket client before it starts lagging
const EVENT_BUFFER: usize = 64;

/// Shared application state
pub struct AppState {
    pub manager: Arc<PeerSessionManager>,
    pub events: broadcast::Sender<SessionEvent>,
}

/// Web server for the control API
pub struct WebServer {
    config: UiConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: UiConfig, manager: Arc<PeerSessionManager>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            config,
            state: Arc::new(AppState { manager, events }),
        }
    }

    /// Sender that fans session events out to WebSocket clients
    pub fn events(&self) -> broadcast::Sender<SessionEvent> {
        self.state.events.clone()
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/api/status", get(handlers::get_status))
            .route("/api/devices", get(handlers::get_devices))
            .route("/api/peer", post(handlers::select_peer))
            .route("/api/transmit/start", post(handlers::begin_transmit))
            .route("/api/transmit/stop", post(handlers::end_transmit))
            .route("/api/disconnect", post(handlers::disconnect))
            .route("/ws", get(websocket::ws_handler))
            .layer(cors)
            .with_state(self.state.clone())
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.config.bind_address, self.config.http_port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid UI bind address: {e}")))
    }

    /// Serve until the listener fails
    pub async fn run(self) -> Result<()> {
        let addr = self.addr()?;
        let app = self.router();

        tracing::info!("Control API listening on http://{}", addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Serve on the current runtime in the background
    pub fn start_background(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                tracing::error!("Control API stopped: {}", e);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SyntheticBackend;
    use crate::config::SessionConfig;

    #[test]
    fn test_addr_from_config() {
        let (manager, _events) =
            PeerSessionManager::new(SessionConfig::default(), Arc::new(SyntheticBackend::new()))
                .unwrap();
        let server = WebServer::new(UiConfig::default(), Arc::new(manager));
        assert_eq!(server.addr().unwrap().port(), UiConfig::default().http_port);

        let bad = WebServer::new(
            UiConfig {
                bind_address: "not an address".into(),
                ..Default::default()
            },
            server.state.manager.clone(),
        );
        assert!(bad.addr().is_err());
    }
}

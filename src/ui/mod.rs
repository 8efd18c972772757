//! HTTP/WebSocket control surface
//!
//! Mirrors the collaborator API over JSON so a browser (or `curl`) can drive
//! the session and watch its events.

pub mod handlers;
pub mod server;
pub mod websocket;

pub use server::{AppState, WebServer};
pub use websocket::BroadcastObserver;

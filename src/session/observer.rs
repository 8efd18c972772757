//! Delivery of session events on a dedicated control thread

use crossbeam_channel::Receiver;
use std::thread::{self, JoinHandle};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::protocol::{SessionEvent, StatusUpdate};

/// UI-side callbacks. Both run on the control thread, never on an audio
/// or network thread, so implementations may block briefly.
pub trait SessionObserver: Send + 'static {
    fn on_status(&mut self, status: &StatusUpdate);

    fn on_error(&mut self, session_id: Option<Uuid>, kind: ErrorKind, message: &str);
}

/// Drain `events` into `observer` on a thread named `session-control`.
/// The thread exits once every sender (i.e. the manager) is gone.
pub fn spawn_observer<O: SessionObserver>(
    events: Receiver<SessionEvent>,
    mut observer: O,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("session-control".to_string())
        .spawn(move || {
            for event in events.iter() {
                match event {
                    SessionEvent::Status(status) => observer.on_status(&status),
                    SessionEvent::Error {
                        session_id,
                        kind,
                        message,
                    } => observer.on_error(session_id, kind, &message),
                }
            }
            tracing::debug!("Session event stream closed");
        })
}

//! Top-level session orchestration
//!
//! The manager is the only component that starts or ends a session. It
//! turns a [`ConnectionDescriptor`] into an armed [`StreamingSession`]
//! (exchange, transport, arm, listen), forwards push-to-talk requests, and
//! tears everything down on disconnect or on the first fatal fault.
//!
//! Every state change is published as a [`SessionEvent`] on the channel
//! returned by [`PeerSessionManager::new`]. Events are sent while the
//! control lock is held, so their order matches the order of transitions.

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread;
use uuid::Uuid;

use crate::audio::AudioBackend;
use crate::config::SessionConfig;
use crate::error::{Error, ErrorKind, ExchangeError, Result};
use crate::network::{open_transport, AddressExchange, CancelToken};
use crate::protocol::{
    ConnectionDescriptor, PeerEndpoint, SessionEvent, SessionState, SharedEndpoint, StatusUpdate,
};
use crate::session::completion::{Completion, Resolver};
use crate::session::streaming::{SessionSignal, StreamingSession};

struct Control {
    /// Manager-level state; `Ready` means a streaming session is armed
    state: SessionState,
    session_id: Option<Uuid>,
    cancel: Option<CancelToken>,
    endpoint: SharedEndpoint,
    streaming: Option<Arc<StreamingSession>>,
}

impl Control {
    fn is_current(&self, id: Uuid) -> bool {
        self.session_id == Some(id)
    }

    fn effective_state(&self) -> SessionState {
        match (&self.state, &self.streaming) {
            (SessionState::Ready, Some(streaming)) => match streaming.state() {
                SessionState::Idle => SessionState::Ready,
                state => state,
            },
            (state, _) => *state,
        }
    }
}

struct Shared {
    config: SessionConfig,
    backend: Arc<dyn AudioBackend>,
    events: Sender<SessionEvent>,
    control: Mutex<Control>,
}

/// Orchestrates one peer session at a time
pub struct PeerSessionManager {
    shared: Arc<Shared>,
}

impl PeerSessionManager {
    /// Create a manager and the receiving end of its event stream
    pub fn new(
        config: SessionConfig,
        backend: Arc<dyn AudioBackend>,
    ) -> Result<(Self, Receiver<SessionEvent>)> {
        config.validate()?;
        let (events, rx) = unbounded();

        let shared = Arc::new(Shared {
            config,
            backend,
            events,
            control: Mutex::new(Control {
                state: SessionState::Idle,
                session_id: None,
                cancel: None,
                endpoint: SharedEndpoint::default(),
                streaming: None,
            }),
        });

        Ok((Self { shared }, rx))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Start a session with the peer described by `descriptor`.
    ///
    /// Allowed from `Idle` or `Failed`. Setup runs on its own thread; the
    /// returned completion yields the resolved endpoint once the session is
    /// armed, or the error that failed it.
    pub fn select_peer(&self, descriptor: ConnectionDescriptor) -> Result<Completion<PeerEndpoint>> {
        let mut control = self.shared.control.lock();
        if !control.state.accepts_new_peer() {
            tracing::warn!("select_peer rejected in state {}", control.state);
            return Err(Error::invalid_state(format!(
                "cannot select a peer while {}",
                control.state
            )));
        }

        let id = Uuid::new_v4();
        let cancel = CancelToken::new();
        let endpoint = SharedEndpoint::new(PeerEndpoint::new(descriptor.peer_display_name()));

        control.session_id = Some(id);
        control.cancel = Some(cancel.clone());
        control.endpoint = endpoint.clone();
        control.streaming = None;
        tracing::info!(
            "Session {} started with {} as {:?}",
            id,
            descriptor.peer_display_name(),
            descriptor.role()
        );
        self.shared.transition(&mut control, SessionState::Connecting);

        let (completion, resolver) = Completion::pair();
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("session-setup".to_string())
            .spawn(move || shared.setup(id, descriptor, endpoint, cancel, resolver));

        if let Err(e) = spawned {
            let error = Error::from(e);
            self.shared.fail_locked(&mut control, id, &error);
            return Err(error);
        }
        Ok(completion)
    }

    /// Push-to-talk pressed
    pub fn begin_transmit(&self) -> Result<()> {
        let control = self.shared.control.lock();
        let streaming = self.armed_session(&control, "begin_transmit")?;

        match streaming.begin_transmit() {
            Ok(()) => {
                self.shared.publish(&control);
                Ok(())
            }
            Err(e) => {
                if e.kind() == ErrorKind::DeviceUnavailable {
                    self.shared.report(control.session_id, &e);
                }
                Err(e)
            }
        }
    }

    /// Push-to-talk released. Safe to call at any time.
    pub fn end_transmit(&self) {
        let control = self.shared.control.lock();
        if let Some(streaming) = &control.streaming {
            if streaming.is_transmitting() {
                streaming.end_transmit();
                self.shared.publish(&control);
            }
        }
    }

    /// End the current session and return to `Idle`. No-op when idle.
    pub fn disconnect(&self) {
        let mut control = self.shared.control.lock();
        if control.state == SessionState::Idle {
            return;
        }

        if control.state != SessionState::Failed {
            if let Some(cancel) = control.cancel.take() {
                cancel.cancel();
            }
            self.shared.transition(&mut control, SessionState::Disconnecting);
            if let Some(streaming) = control.streaming.take() {
                streaming.shutdown();
            }
            tracing::info!("Disconnected from {}", control.endpoint.snapshot().display_name);
        }

        control.cancel = None;
        control.session_id = None;
        control.endpoint = SharedEndpoint::default();
        self.shared.transition(&mut control, SessionState::Idle);
    }

    pub fn state(&self) -> SessionState {
        self.shared.control.lock().effective_state()
    }

    /// Current peer endpoint (default when idle)
    pub fn endpoint(&self) -> PeerEndpoint {
        self.shared.control.lock().endpoint.snapshot()
    }

    pub fn status(&self) -> StatusUpdate {
        self.shared.status(&self.shared.control.lock())
    }

    fn armed_session<'a>(
        &self,
        control: &'a Control,
        what: &str,
    ) -> Result<&'a Arc<StreamingSession>> {
        match (&control.state, &control.streaming) {
            (state, Some(streaming)) if state.is_armed() => Ok(streaming),
            (state, _) => {
                tracing::warn!("{} rejected in state {}", what, state);
                Err(Error::invalid_state(format!("{what} requires a ready session, state is {state}")))
            }
        }
    }
}

impl Drop for PeerSessionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Shared {
    /// Exchange, open the transport, arm, start listening
    fn setup(
        self: Arc<Self>,
        id: Uuid,
        descriptor: ConnectionDescriptor,
        endpoint: SharedEndpoint,
        cancel: CancelToken,
        resolver: Resolver<PeerEndpoint>,
    ) {
        if !self.advance(id, SessionState::RoleNegotiation) {
            resolver.resolve(Err(ExchangeError::Cancelled.into()));
            return;
        }

        let outcome = match AddressExchange::new(&self.config).run(&descriptor, &endpoint, &cancel) {
            Ok(outcome) => outcome,
            Err(e) => {
                let error = Error::from(e);
                self.fail(id, &error);
                resolver.resolve(Err(error));
                return;
            }
        };

        let transport =
            match open_transport(&self.config, outcome.role, outcome.peer_address, &cancel) {
                Ok(transport) => transport,
                Err(e) => {
                    let error = Error::from(e);
                    self.fail(id, &error);
                    resolver.resolve(Err(error));
                    return;
                }
            };

        let (signals, signal_rx) = unbounded();
        let streaming = Arc::new(StreamingSession::new(
            id,
            &self.config,
            self.backend.clone(),
            transport,
            endpoint.clone(),
            signals,
        ));
        if let Err(error) = streaming.arm() {
            self.fail(id, &error);
            resolver.resolve(Err(error));
            return;
        }

        let mut control = self.control.lock();
        if !control.is_current(id) {
            tracing::debug!("Session {} was superseded during setup", id);
            drop(control);
            streaming.shutdown();
            resolver.resolve(Err(Error::invalid_state("session ended during setup")));
            return;
        }

        control.streaming = Some(streaming.clone());
        control.cancel = None;
        tracing::info!(
            "Session {} ready: {:?} with {}",
            id,
            outcome.role,
            outcome.peer_address
        );
        self.transition(&mut control, SessionState::Ready);

        if let Err(e) = streaming.begin_receive() {
            self.report(Some(id), &e);
        }

        if let Err(e) = self.spawn_supervisor(signal_rx) {
            let error = Error::from(e);
            self.fail_locked(&mut control, id, &error);
            resolver.resolve(Err(error));
            return;
        }

        resolver.resolve(Ok(endpoint.snapshot()));
    }

    /// Route loop signals back into the state machine. Holds only a weak
    /// reference so a dropped manager is not kept alive by its own session.
    fn spawn_supervisor(self: &Arc<Self>, signals: Receiver<SessionSignal>) -> std::io::Result<()> {
        let shared: Weak<Shared> = Arc::downgrade(self);
        thread::Builder::new()
            .name("session-supervisor".to_string())
            .spawn(move || {
                for signal in signals.iter() {
                    let Some(shared) = shared.upgrade() else {
                        break;
                    };
                    match signal {
                        SessionSignal::Fault { session_id, error } => {
                            shared.fail(session_id, &Error::from(error));
                        }
                        SessionSignal::ReceiveActivity { session_id, active } => {
                            tracing::debug!("Peer {} talking", if active { "started" } else { "stopped" });
                            shared.publish_if_current(session_id);
                        }
                        SessionSignal::TransmitEnded { session_id } => {
                            tracing::warn!("Transmit loop ended on its own");
                            shared.publish_if_current(session_id);
                        }
                    }
                }
            })?;
        Ok(())
    }

    /// Move a live session forward; false if it has been superseded
    fn advance(&self, id: Uuid, state: SessionState) -> bool {
        let mut control = self.control.lock();
        if !control.is_current(id) {
            return false;
        }
        self.transition(&mut control, state);
        true
    }

    fn fail(&self, id: Uuid, error: &Error) {
        let mut control = self.control.lock();
        self.fail_locked(&mut control, id, error);
    }

    /// Tear down session `id` and report `error`. Stale ids are ignored.
    fn fail_locked(&self, control: &mut Control, id: Uuid, error: &Error) {
        if !control.is_current(id) {
            tracing::debug!("Ignoring failure of stale session {}: {}", id, error);
            return;
        }

        tracing::error!("Session {} failed: {}", id, error);
        if let Some(cancel) = control.cancel.take() {
            cancel.cancel();
        }
        if let Some(streaming) = control.streaming.take() {
            streaming.shutdown();
        }
        control.endpoint = SharedEndpoint::default();

        self.report(Some(id), error);
        self.transition(control, SessionState::Failed);
        control.session_id = None;
    }

    fn transition(&self, control: &mut Control, state: SessionState) {
        if control.state != state {
            tracing::info!("Session state: {} -> {}", control.state, state);
        }
        control.state = state;
        self.publish(control);
    }

    fn publish_if_current(&self, id: Uuid) {
        let control = self.control.lock();
        if control.is_current(id) {
            self.publish(&control);
        }
    }

    fn publish(&self, control: &Control) {
        let _ = self.events.send(SessionEvent::Status(self.status(control)));
    }

    fn report(&self, session_id: Option<Uuid>, error: &Error) {
        let _ = self.events.send(SessionEvent::Error {
            session_id,
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    fn status(&self, control: &Control) -> StatusUpdate {
        let endpoint = control.endpoint.snapshot();
        StatusUpdate {
            session_id: control.session_id,
            state: control.effective_state(),
            peer_name: Some(endpoint.display_name).filter(|name| !name.is_empty()),
            role: endpoint.role,
            address: endpoint.address,
            stats: control
                .streaming
                .as_ref()
                .map(|s| s.stats())
                .unwrap_or_default(),
            timestamp: Utc::now(),
        }
    }
}

//! Capture → transport → playback state machine
//!
//! `Idle → Armed → (Transmitting | Receiving) → Armed → Idle`
//!
//! Each direction runs its own loop on its own thread. Whether a loop is
//! active is decided under one mutex, so two racing `begin_transmit` calls
//! can never both start a loop. Loops never take that mutex themselves;
//! they report back through [`SessionSignal`]s.

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::audio::{AudioBackend, AudioFormat, FrameSink, FrameSource};
use crate::config::SessionConfig;
use crate::error::{AudioError, Error, NetworkError, Result};
use crate::network::TransportChannel;
use crate::protocol::{SessionState, SharedEndpoint, StreamStats};
use crate::session::arbiter::TalkArbiter;

/// Silence this long after the last inbound frame ends a "receiving" spell
const RECEIVE_ACTIVITY_WINDOW: Duration = Duration::from_millis(500);

/// Loop → manager notifications
#[derive(Debug)]
pub enum SessionSignal {
    /// The transport failed in a way that ends the session
    Fault { session_id: Uuid, error: NetworkError },
    /// The peer started (`true`) or stopped (`false`) sending audio
    ReceiveActivity { session_id: Uuid, active: bool },
    /// The transmit loop ended without being asked to
    TransmitEnded { session_id: Uuid },
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> StreamStats {
        StreamStats {
            frames_sent: self.sent.load(Ordering::Relaxed),
            frames_received: self.received.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

struct LoopHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl LoopHandle {
    fn is_active(&self) -> bool {
        !self.thread.is_finished()
    }

    fn stop_and_join(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.thread.join();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Armed,
}

struct Loops {
    phase: Phase,
    transmit: Option<LoopHandle>,
    receive: Option<LoopHandle>,
}

/// Streaming half of one peer session
pub struct StreamingSession {
    id: Uuid,
    format: AudioFormat,
    backend: Arc<dyn AudioBackend>,
    transport: Arc<dyn TransportChannel>,
    endpoint: SharedEndpoint,
    arbiter: Arc<TalkArbiter>,
    counters: Arc<Counters>,
    peer_active: Arc<AtomicBool>,
    signals: Sender<SessionSignal>,
    loops: Mutex<Loops>,
}

impl StreamingSession {
    pub fn new(
        id: Uuid,
        config: &SessionConfig,
        backend: Arc<dyn AudioBackend>,
        transport: Arc<dyn TransportChannel>,
        endpoint: SharedEndpoint,
        signals: Sender<SessionSignal>,
    ) -> Self {
        Self {
            id,
            format: AudioFormat::from_config(config),
            backend,
            transport,
            endpoint,
            arbiter: Arc::new(TalkArbiter::new(config.duplex, config.half_duplex_holdoff())),
            counters: Arc::new(Counters::default()),
            peer_active: Arc::new(AtomicBool::new(false)),
            signals,
            loops: Mutex::new(Loops {
                phase: Phase::Idle,
                transmit: None,
                receive: None,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Enter `Armed`; requires a role and a resolved peer address
    pub fn arm(&self) -> Result<()> {
        let mut loops = self.loops.lock();
        if !self.endpoint.snapshot().is_ready() {
            return Err(Error::invalid_state("peer endpoint is not resolved"));
        }
        loops.phase = Phase::Armed;
        tracing::info!("Session {} armed", self.id);
        Ok(())
    }

    /// Start the capture → send loop.
    ///
    /// Rejected with `InvalidState` unless armed, while another transmit
    /// loop is active, or (half-duplex) while the peer holds the floor.
    pub fn begin_transmit(&self) -> Result<()> {
        let mut loops = self.loops.lock();
        self.check_streamable(&loops, "transmit")?;

        if loops.transmit.as_ref().is_some_and(LoopHandle::is_active) {
            tracing::warn!("begin_transmit ignored: already transmitting");
            return Err(Error::invalid_state("already transmitting"));
        }
        if let Some(finished) = loops.transmit.take() {
            finished.stop_and_join();
        }

        if !self.arbiter.try_acquire() {
            tracing::warn!("begin_transmit ignored: peer is talking");
            return Err(Error::invalid_state("peer is talking"));
        }

        let source = match self.open_capture() {
            Ok(source) => source,
            Err(e) => {
                self.arbiter.release();
                tracing::error!("Microphone unavailable: {}", e);
                return Err(e.into());
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let ctx = TransmitLoop {
            session_id: self.id,
            frame_size: self.format.frame_size,
            source,
            transport: self.transport.clone(),
            arbiter: self.arbiter.clone(),
            counters: self.counters.clone(),
            source_dropped: 0,
            signals: self.signals.clone(),
            stop: stop.clone(),
        };
        let thread = match thread::Builder::new()
            .name("transmit-loop".to_string())
            .spawn(move || ctx.run())
        {
            Ok(thread) => thread,
            Err(e) => {
                self.arbiter.release();
                return Err(e.into());
            }
        };

        loops.transmit = Some(LoopHandle { stop, thread });
        tracing::info!("Transmitting");
        Ok(())
    }

    /// Stop transmitting and release the microphone. No-op when idle.
    pub fn end_transmit(&self) {
        let mut loops = self.loops.lock();
        if let Some(handle) = loops.transmit.take() {
            handle.stop_and_join();
            tracing::info!("Transmit ended");
        }
    }

    /// Start the receive → playback loop
    pub fn begin_receive(&self) -> Result<()> {
        let mut loops = self.loops.lock();
        self.check_streamable(&loops, "receive")?;

        if loops.receive.as_ref().is_some_and(LoopHandle::is_active) {
            tracing::warn!("begin_receive ignored: already receiving");
            return Err(Error::invalid_state("already receiving"));
        }
        if let Some(finished) = loops.receive.take() {
            finished.stop_and_join();
        }

        let sink = self.open_playback().map_err(|e| {
            tracing::error!("Speaker unavailable: {}", e);
            Error::from(e)
        })?;

        let stop = Arc::new(AtomicBool::new(false));
        let ctx = ReceiveLoop {
            session_id: self.id,
            sink,
            transport: self.transport.clone(),
            arbiter: self.arbiter.clone(),
            counters: self.counters.clone(),
            peer_active: self.peer_active.clone(),
            signals: self.signals.clone(),
            stop: stop.clone(),
        };
        let thread = thread::Builder::new()
            .name("receive-loop".to_string())
            .spawn(move || ctx.run())?;

        loops.receive = Some(LoopHandle { stop, thread });
        tracing::info!("Listening for peer audio");
        Ok(())
    }

    /// Stop receiving and release the speaker. No-op when idle.
    pub fn end_receive(&self) {
        let mut loops = self.loops.lock();
        if let Some(handle) = loops.receive.take() {
            handle.stop_and_join();
            self.peer_active.store(false, Ordering::SeqCst);
            tracing::info!("Receive ended");
        }
    }

    /// Stop both loops, close the transport and return to `Idle`
    pub fn shutdown(&self) {
        let mut loops = self.loops.lock();
        let was_armed = loops.phase == Phase::Armed;
        loops.phase = Phase::Idle;

        let transmit = loops.transmit.take();
        let receive = loops.receive.take();
        for handle in transmit.iter().chain(receive.iter()) {
            handle.stop.store(true, Ordering::SeqCst);
        }
        self.transport.shutdown();

        for handle in transmit.into_iter().chain(receive) {
            let _ = handle.thread.join();
        }
        self.peer_active.store(false, Ordering::SeqCst);

        if was_armed {
            tracing::info!("Session {} shut down", self.id);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.loops.lock().phase == Phase::Armed
    }

    pub fn is_transmitting(&self) -> bool {
        self.loops
            .lock()
            .transmit
            .as_ref()
            .is_some_and(LoopHandle::is_active)
    }

    pub fn is_receiving(&self) -> bool {
        self.loops
            .lock()
            .receive
            .as_ref()
            .is_some_and(LoopHandle::is_active)
    }

    /// `Idle`, `Ready`, `Transmitting`, or `Receiving` while the peer talks
    pub fn state(&self) -> SessionState {
        let loops = self.loops.lock();
        if loops.phase == Phase::Idle {
            return SessionState::Idle;
        }
        if loops.transmit.as_ref().is_some_and(LoopHandle::is_active) {
            SessionState::Transmitting
        } else if self.peer_active.load(Ordering::SeqCst)
            && loops.receive.as_ref().is_some_and(LoopHandle::is_active)
        {
            SessionState::Receiving
        } else {
            SessionState::Ready
        }
    }

    pub fn stats(&self) -> StreamStats {
        self.counters.snapshot()
    }

    fn check_streamable(&self, loops: &Loops, what: &str) -> Result<()> {
        if loops.phase != Phase::Armed {
            tracing::warn!("begin_{} rejected: session not armed", what);
            return Err(Error::invalid_state(format!("cannot {what}: session not armed")));
        }
        if !self.endpoint.address().is_resolved() {
            tracing::warn!("begin_{} rejected: peer address unset", what);
            return Err(Error::invalid_state(format!("cannot {what}: peer address unset")));
        }
        Ok(())
    }

    fn open_capture(&self) -> std::result::Result<Box<dyn FrameSource>, AudioError> {
        let mut source = self.backend.open_capture(self.format)?;
        source.start()?;
        Ok(source)
    }

    fn open_playback(&self) -> std::result::Result<Box<dyn FrameSink>, AudioError> {
        let mut sink = self.backend.open_playback(self.format)?;
        sink.start()?;
        Ok(sink)
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct TransmitLoop {
    session_id: Uuid,
    frame_size: usize,
    source: Box<dyn FrameSource>,
    transport: Arc<dyn TransportChannel>,
    arbiter: Arc<TalkArbiter>,
    counters: Arc<Counters>,
    /// Capture overflows already folded into `counters`
    source_dropped: u64,
    signals: Sender<SessionSignal>,
    stop: Arc<AtomicBool>,
}

impl TransmitLoop {
    fn run(mut self) {
        let mut interrupted = false;

        while !self.stop.load(Ordering::SeqCst) {
            let read = self.source.read_frame();
            self.collect_capture_drops();
            let frame = match read {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Capture ended: {}", e);
                    interrupted = true;
                    break;
                }
            };

            if frame.len() != self.frame_size {
                tracing::debug!("Dropping short capture frame ({} bytes)", frame.len());
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            match self.transport.send(frame) {
                Ok(()) => {
                    self.counters.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(NetworkError::Transient(e)) => {
                    tracing::warn!("Frame dropped: {}", e);
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(e @ NetworkError::FrameSize { .. }) => {
                    tracing::warn!("Frame dropped: {}", e);
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(NetworkError::Closed) => break,
                Err(error) => {
                    tracing::error!("Transmit path lost: {}", error);
                    let _ = self.signals.send(SessionSignal::Fault {
                        session_id: self.session_id,
                        error,
                    });
                    interrupted = true;
                    break;
                }
            }
        }

        self.collect_capture_drops();
        self.source.stop();
        self.arbiter.release();

        if interrupted {
            let _ = self.signals.send(SessionSignal::TransmitEnded {
                session_id: self.session_id,
            });
        }
    }

    fn collect_capture_drops(&mut self) {
        let total = self.source.frames_dropped();
        if total > self.source_dropped {
            self.counters
                .dropped
                .fetch_add(total - self.source_dropped, Ordering::Relaxed);
            self.source_dropped = total;
        }
    }
}

struct ReceiveLoop {
    session_id: Uuid,
    sink: Box<dyn FrameSink>,
    transport: Arc<dyn TransportChannel>,
    arbiter: Arc<TalkArbiter>,
    counters: Arc<Counters>,
    peer_active: Arc<AtomicBool>,
    signals: Sender<SessionSignal>,
    stop: Arc<AtomicBool>,
}

impl ReceiveLoop {
    fn run(mut self) {
        let mut last_frame: Option<Instant> = None;

        while !self.stop.load(Ordering::SeqCst) {
            match self.transport.receive() {
                Ok(Some(frame)) => {
                    self.counters.received.fetch_add(1, Ordering::Relaxed);
                    self.arbiter.note_peer_frame();
                    last_frame = Some(Instant::now());
                    self.set_active(true);

                    if !self.arbiter.should_play() {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    match self.sink.write_frame(frame) {
                        Ok(()) => {}
                        Err(AudioError::NotPlaying) => break,
                        Err(AudioError::Stalled) => {
                            tracing::debug!("Playback stalled, frame dropped");
                            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            tracing::debug!("Playback rejected frame: {}", e);
                            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Ok(None) => {
                    if last_frame.is_some_and(|at| at.elapsed() >= RECEIVE_ACTIVITY_WINDOW) {
                        last_frame = None;
                        self.set_active(false);
                    }
                }
                Err(NetworkError::Closed) => break,
                Err(NetworkError::Transient(e)) => {
                    tracing::debug!("Receive hiccup: {}", e);
                }
                Err(error) => {
                    tracing::error!("Receive path lost: {}", error);
                    let _ = self.signals.send(SessionSignal::Fault {
                        session_id: self.session_id,
                        error,
                    });
                    break;
                }
            }
        }

        self.sink.stop();
        self.peer_active.store(false, Ordering::SeqCst);
    }

    fn set_active(&self, active: bool) {
        if self.peer_active.swap(active, Ordering::SeqCst) != active {
            let _ = self.signals.send(SessionSignal::ReceiveActivity {
                session_id: self.session_id,
                active,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioFrame, SyntheticBackend};
    use crate::config::{DuplexMode, TransportKind};
    use crate::error::ErrorKind;
    use crate::protocol::{PeerAddress, PeerEndpoint, Role};
    use crossbeam_channel::{unbounded, Receiver};
    use std::collections::VecDeque;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    const FRAME_SIZE: usize = 64;

    /// In-memory transport: records sends, replays a scripted inbox
    #[derive(Default)]
    struct ScriptedTransport {
        sent: Mutex<Vec<AudioFrame>>,
        inbox: Mutex<VecDeque<std::result::Result<Option<AudioFrame>, NetworkError>>>,
        fail_sends: AtomicBool,
        closed: AtomicBool,
    }

    impl TransportChannel for ScriptedTransport {
        fn send(&self, frame: AudioFrame) -> std::result::Result<(), NetworkError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(NetworkError::Closed);
            }
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(NetworkError::PeerDisconnected("reset".into()));
            }
            self.sent.lock().push(frame);
            Ok(())
        }

        fn receive(&self) -> std::result::Result<Option<AudioFrame>, NetworkError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(NetworkError::Closed);
            }
            match self.inbox.lock().pop_front() {
                Some(next) => next,
                None => {
                    thread::sleep(Duration::from_millis(2));
                    Ok(None)
                }
            }
        }

        fn shutdown(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Datagram
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    fn resolved_endpoint() -> SharedEndpoint {
        SharedEndpoint::new(PeerEndpoint {
            display_name: "peer".into(),
            address: PeerAddress::Resolved(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            role: Role::Client,
        })
    }

    fn config(duplex: DuplexMode) -> SessionConfig {
        SessionConfig {
            frame_size: FRAME_SIZE,
            duplex,
            half_duplex_holdoff_ms: 10_000,
            ..Default::default()
        }
    }

    fn session_with(
        duplex: DuplexMode,
        endpoint: SharedEndpoint,
    ) -> (
        Arc<StreamingSession>,
        SyntheticBackend,
        Arc<ScriptedTransport>,
        Receiver<SessionSignal>,
    ) {
        let backend = SyntheticBackend::new().with_pace(Duration::from_millis(1));
        let transport = Arc::new(ScriptedTransport::default());
        let (tx, rx) = unbounded();
        let session = Arc::new(StreamingSession::new(
            Uuid::new_v4(),
            &config(duplex),
            Arc::new(backend.clone()),
            transport.clone(),
            endpoint,
            tx,
        ));
        (session, backend, transport, rx)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_begin_requires_armed() {
        let (session, backend, _t, _rx) = session_with(DuplexMode::Full, resolved_endpoint());
        let err = session.begin_transmit().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(backend.capture_starts(), 0);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_arm_requires_resolved_address() {
        let endpoint = SharedEndpoint::new(PeerEndpoint {
            role: Role::Server,
            ..Default::default()
        });
        let (session, _b, _t, _rx) = session_with(DuplexMode::Full, endpoint);
        assert_eq!(session.arm().unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_begin_fails_when_address_cleared() {
        let endpoint = resolved_endpoint();
        let (session, _b, _t, _rx) = session_with(DuplexMode::Full, endpoint.clone());
        session.arm().unwrap();

        endpoint.update(|e| e.address = PeerAddress::Unset);
        assert_eq!(session.begin_transmit().unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(session.begin_receive().unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_transmit_sends_frames_in_capture_order() {
        let (session, _b, transport, _rx) = session_with(DuplexMode::Full, resolved_endpoint());
        session.arm().unwrap();
        session.begin_transmit().unwrap();
        assert_eq!(session.state(), SessionState::Transmitting);

        assert!(wait_until(|| transport.sent.lock().len() >= 5));
        session.end_transmit();
        assert_eq!(session.state(), SessionState::Ready);

        let sent = transport.sent.lock();
        let firsts: Vec<i16> = sent.iter().map(|f| f.samples().next().unwrap()).collect();
        let step = (FRAME_SIZE / 2) as i16;
        for pair in firsts.windows(2) {
            assert_eq!(pair[1], pair[0].wrapping_add(step));
        }
    }

    #[test]
    fn test_concurrent_begin_transmit_starts_one_loop() {
        let (session, backend, _t, _rx) = session_with(DuplexMode::Full, resolved_endpoint());
        session.arm().unwrap();

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let session = session.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    session.begin_transmit()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let rejected = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(rejected.kind(), ErrorKind::InvalidState);
        assert_eq!(backend.capture_starts(), 1);
        assert_eq!(backend.max_active_captures(), 1);

        session.end_transmit();
        assert_eq!(backend.active_captures(), 0);
    }

    #[test]
    fn test_end_transmit_is_idempotent() {
        let (session, _b, _t, _rx) = session_with(DuplexMode::Full, resolved_endpoint());
        session.arm().unwrap();

        session.end_transmit();
        session.begin_transmit().unwrap();
        session.end_transmit();
        session.end_transmit();

        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.is_armed());
    }

    #[test]
    fn test_device_unavailable_keeps_session_armed() {
        let (session, backend, _t, _rx) = session_with(DuplexMode::Full, resolved_endpoint());
        session.arm().unwrap();
        backend.set_capture_unavailable(true);

        let err = session.begin_transmit().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
        assert_eq!(session.state(), SessionState::Ready);

        backend.set_capture_unavailable(false);
        session.begin_transmit().unwrap();
        session.end_transmit();
    }

    #[test]
    fn test_send_failure_signals_fault() {
        let (session, _b, transport, rx) = session_with(DuplexMode::Full, resolved_endpoint());
        session.arm().unwrap();
        transport.fail_sends.store(true, Ordering::SeqCst);
        session.begin_transmit().unwrap();

        let signal = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(
            signal,
            SessionSignal::Fault { error: NetworkError::PeerDisconnected(_), .. }
        ));
        assert!(wait_until(|| !session.is_transmitting()));
    }

    #[test]
    fn test_receive_plays_frames_and_survives_loss() {
        let (session, backend, transport, rx) = session_with(DuplexMode::Full, resolved_endpoint());
        {
            let mut inbox = transport.inbox.lock();
            inbox.push_back(Ok(Some(AudioFrame::from_samples(&[1; FRAME_SIZE / 2]))));
            for _ in 0..5 {
                inbox.push_back(Err(NetworkError::Transient("lost".into())));
                inbox.push_back(Ok(None));
            }
            inbox.push_back(Ok(Some(AudioFrame::from_samples(&[2; FRAME_SIZE / 2]))));
        }

        session.arm().unwrap();
        session.begin_receive().unwrap();
        assert!(wait_until(|| backend.played_count() == 2));
        assert!(session.is_receiving());

        let played = backend.take_played();
        assert_eq!(played[0].samples().next(), Some(1));
        assert_eq!(played[1].samples().next(), Some(2));
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            SessionSignal::ReceiveActivity { active: true, .. }
        ));

        session.end_receive();
        assert!(!session.is_receiving());
    }

    #[test]
    fn test_receive_disconnect_signals_fault() {
        let (session, _b, transport, rx) = session_with(DuplexMode::Full, resolved_endpoint());
        transport
            .inbox
            .lock()
            .push_back(Err(NetworkError::PeerDisconnected("eof".into())));

        session.arm().unwrap();
        session.begin_receive().unwrap();

        let signal = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(signal, SessionSignal::Fault { .. }));
    }

    #[test]
    fn test_capture_overruns_count_as_dropped() {
        let (session, backend, transport, _rx) =
            session_with(DuplexMode::Full, resolved_endpoint());
        session.arm().unwrap();
        backend.set_capture_overruns(3);
        session.begin_transmit().unwrap();

        assert!(wait_until(|| !transport.sent.lock().is_empty()));
        assert_eq!(session.stats().frames_dropped, 3);

        session.end_transmit();
        assert_eq!(session.stats().frames_dropped, 3);
    }

    #[test]
    fn test_stalled_playback_counts_as_dropped() {
        let (session, backend, transport, _rx) =
            session_with(DuplexMode::Full, resolved_endpoint());
        backend.set_playback_stalled(true);
        {
            let mut inbox = transport.inbox.lock();
            inbox.push_back(Ok(Some(AudioFrame::from_samples(&[1; FRAME_SIZE / 2]))));
            inbox.push_back(Ok(Some(AudioFrame::from_samples(&[2; FRAME_SIZE / 2]))));
        }

        session.arm().unwrap();
        session.begin_receive().unwrap();
        assert!(wait_until(|| session.stats().frames_dropped == 2));

        let stats = session.stats();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(backend.played_count(), 0);
        assert!(session.is_receiving());
        session.end_receive();
    }

    #[test]
    fn test_full_duplex_runs_both_loops() {
        let (session, _b, _t, _rx) = session_with(DuplexMode::Full, resolved_endpoint());
        session.arm().unwrap();
        session.begin_receive().unwrap();
        session.begin_transmit().unwrap();

        assert!(session.is_receiving());
        assert!(session.is_transmitting());
        session.shutdown();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_half_duplex_refuses_while_peer_talks() {
        let (session, backend, transport, _rx) = session_with(DuplexMode::Half, resolved_endpoint());
        transport
            .inbox
            .lock()
            .push_back(Ok(Some(AudioFrame::from_samples(&[3; FRAME_SIZE / 2]))));

        session.arm().unwrap();
        session.begin_receive().unwrap();
        assert!(wait_until(|| backend.played_count() == 1));

        assert_eq!(session.begin_transmit().unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(backend.capture_starts(), 0);
    }

    #[test]
    fn test_frames_cross_a_datagram_link_in_order() {
        use crate::network::{create_socket, UdpTransport};

        const LINK_FRAME: usize = 4096;
        let timeout = Duration::from_millis(50);
        let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let a_addr = create_socket(loopback, timeout).unwrap().local_addr().unwrap();
        let b_addr = create_socket(loopback, timeout).unwrap().local_addr().unwrap();

        let link_config = SessionConfig {
            frame_size: LINK_FRAME,
            ..Default::default()
        };
        let talker_backend = SyntheticBackend::new()
            .with_pace(Duration::from_millis(2))
            .with_frame_limit(10);
        let listener_backend = SyntheticBackend::new();
        let (tx, _rx) = unbounded();

        let talker = StreamingSession::new(
            Uuid::new_v4(),
            &link_config,
            Arc::new(talker_backend.clone()),
            Arc::new(UdpTransport::bind(a_addr, b_addr, LINK_FRAME, timeout).unwrap()),
            resolved_endpoint(),
            tx.clone(),
        );
        let listener = StreamingSession::new(
            Uuid::new_v4(),
            &link_config,
            Arc::new(listener_backend.clone()),
            Arc::new(UdpTransport::bind(b_addr, a_addr, LINK_FRAME, timeout).unwrap()),
            resolved_endpoint(),
            tx,
        );

        listener.arm().unwrap();
        listener.begin_receive().unwrap();
        talker.arm().unwrap();
        talker.begin_transmit().unwrap();

        assert!(wait_until(|| listener_backend.played_count() == 10));
        talker.end_transmit();
        listener.end_receive();

        let played = listener_backend.take_played();
        assert!(played.iter().all(|f| f.len() == LINK_FRAME));
        let firsts: Vec<i16> = played.iter().map(|f| f.samples().next().unwrap()).collect();
        let expected: Vec<i16> = (0..10).map(|i| (i * LINK_FRAME / 2) as i16).collect();
        assert_eq!(firsts, expected);
        assert_eq!(talker.stats().frames_sent, 10);
        assert_eq!(listener.stats().frames_received, 10);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_disarms() {
        let (session, _b, _t, _rx) = session_with(DuplexMode::Full, resolved_endpoint());
        session.arm().unwrap();
        session.begin_receive().unwrap();

        session.shutdown();
        session.shutdown();
        assert_eq!(session.begin_transmit().unwrap_err().kind(), ErrorKind::InvalidState);
    }
}

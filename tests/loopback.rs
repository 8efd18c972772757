//! Two peers on one host, talking over loopback

use crossbeam_channel::Receiver;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use peer_voice::audio::SyntheticBackend;
use peer_voice::config::{SessionConfig, TransportKind};
use peer_voice::protocol::{
    ConnectionDescriptor, PeerAddress, PeerEndpoint, Role, SessionEvent, SessionState,
};
use peer_voice::{ErrorKind, PeerSessionManager};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const FRAME_SIZE: usize = 4096;
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

fn free_port() -> u16 {
    TcpListener::bind((LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

struct Peer {
    manager: PeerSessionManager,
    events: Receiver<SessionEvent>,
    backend: SyntheticBackend,
}

fn peer(config: SessionConfig, backend: SyntheticBackend) -> Peer {
    let (manager, events) = PeerSessionManager::new(config, Arc::new(backend.clone())).unwrap();
    Peer {
        manager,
        events,
        backend,
    }
}

/// Owner and client configs sharing a rendezvous port, each with its own
/// audio port pointed at the other.
fn configs(transport: TransportKind) -> (SessionConfig, SessionConfig) {
    let rendezvous_port = free_port();
    let owner_audio = free_port();
    let client_audio = free_port();

    let base = SessionConfig {
        rendezvous_port,
        frame_size: FRAME_SIZE,
        bind_address: LOCALHOST,
        transport,
        connect_timeout_ms: 5_000,
        accept_timeout_ms: 5_000,
        receive_timeout_ms: 50,
        ..Default::default()
    };
    let owner = SessionConfig {
        audio_port: owner_audio,
        peer_audio_port: Some(client_audio),
        ..base.clone()
    };
    let client = SessionConfig {
        audio_port: client_audio,
        peer_audio_port: Some(owner_audio),
        ..base
    };
    (owner, client)
}

fn connect(owner: &Peer, client: &Peer) -> (PeerEndpoint, PeerEndpoint) {
    let owner_done = owner
        .manager
        .select_peer(ConnectionDescriptor::owner("client-device"))
        .unwrap();
    let client_done = client
        .manager
        .select_peer(ConnectionDescriptor::client("owner-device", LOCALHOST))
        .unwrap();

    let owner_endpoint = owner_done.wait_timeout(SETUP_TIMEOUT).unwrap().unwrap();
    let client_endpoint = client_done.wait_timeout(SETUP_TIMEOUT).unwrap().unwrap();
    (owner_endpoint, client_endpoint)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn assert_ten_frames_in_order(played: &[peer_voice::audio::AudioFrame]) {
    assert_eq!(played.len(), 10);
    for (i, frame) in played.iter().enumerate() {
        assert_eq!(frame.len(), FRAME_SIZE);
        let expected_first = (i * FRAME_SIZE / 2) as i16;
        assert_eq!(frame.samples().next(), Some(expected_first));
    }
}

#[test]
fn test_roles_and_addresses_are_exchanged() {
    let (owner_config, client_config) = configs(TransportKind::Datagram);
    let owner = peer(owner_config, SyntheticBackend::new());
    let client = peer(client_config, SyntheticBackend::new());

    let (owner_endpoint, client_endpoint) = connect(&owner, &client);

    assert_eq!(owner_endpoint.role, Role::Server);
    assert_eq!(owner_endpoint.address, PeerAddress::Resolved(LOCALHOST));
    assert_eq!(owner_endpoint.display_name, "client-device");

    assert_eq!(client_endpoint.role, Role::Client);
    assert_eq!(client_endpoint.address, PeerAddress::Resolved(LOCALHOST));
    assert_eq!(client_endpoint.display_name, "owner-device");

    assert_eq!(owner.manager.state(), SessionState::Ready);
    assert_eq!(client.manager.state(), SessionState::Ready);
}

#[test]
fn test_client_frames_reach_owner_over_datagrams() {
    let (owner_config, client_config) = configs(TransportKind::Datagram);
    let owner = peer(owner_config, SyntheticBackend::new());
    let client = peer(
        client_config,
        SyntheticBackend::new()
            .with_pace(Duration::from_millis(5))
            .with_frame_limit(10),
    );
    connect(&owner, &client);

    client.manager.begin_transmit().unwrap();
    assert!(wait_until(|| owner.backend.played_count() == 10));
    client.manager.end_transmit();

    assert_ten_frames_in_order(&owner.backend.take_played());
    assert_eq!(client.manager.status().stats.frames_sent, 10);
    assert_eq!(owner.manager.status().stats.frames_received, 10);
    assert_eq!(client.manager.state(), SessionState::Ready);
}

#[test]
fn test_full_duplex_over_stream_transport() {
    let (owner_config, client_config) = configs(TransportKind::Stream);
    let talker = || {
        SyntheticBackend::new()
            .with_pace(Duration::from_millis(5))
            .with_frame_limit(10)
    };
    let owner = peer(owner_config, talker());
    let client = peer(client_config, talker());
    connect(&owner, &client);

    owner.manager.begin_transmit().unwrap();
    client.manager.begin_transmit().unwrap();

    assert!(wait_until(|| owner.backend.played_count() == 10
        && client.backend.played_count() == 10));
    assert_ten_frames_in_order(&owner.backend.take_played());
    assert_ten_frames_in_order(&client.backend.take_played());

    owner.manager.end_transmit();
    client.manager.end_transmit();
}

#[test]
fn test_peer_hangup_fails_the_other_side() {
    let (owner_config, client_config) = configs(TransportKind::Stream);
    let owner = peer(owner_config, SyntheticBackend::new());
    let client = peer(client_config, SyntheticBackend::new());
    connect(&owner, &client);

    client.manager.disconnect();
    assert_eq!(client.manager.state(), SessionState::Idle);

    assert!(wait_until(|| owner.manager.state() == SessionState::Failed));
    let kinds: Vec<ErrorKind> = owner
        .events
        .try_iter()
        .filter_map(|event| match event {
            SessionEvent::Error { kind, .. } => Some(kind),
            SessionEvent::Status(_) => None,
        })
        .collect();
    assert_eq!(kinds, vec![ErrorKind::PeerDisconnected]);
    assert_eq!(owner.manager.endpoint().address, PeerAddress::Unset);

    owner.manager.disconnect();
    assert_eq!(owner.manager.state(), SessionState::Idle);
}

#[test]
fn test_unreachable_owner_fails_exchange() {
    let (_, mut client_config) = configs(TransportKind::Datagram);
    client_config.connect_timeout_ms = 300;
    let client = peer(client_config, SyntheticBackend::new());

    let done = client
        .manager
        .select_peer(ConnectionDescriptor::client("owner-device", LOCALHOST))
        .unwrap();
    let err = done.wait_timeout(SETUP_TIMEOUT).unwrap().unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ExchangeFailed);
    assert_eq!(client.manager.state(), SessionState::Failed);
    assert!(client.events.try_iter().any(|event| matches!(
        event,
        SessionEvent::Error { kind: ErrorKind::ExchangeFailed, .. }
    )));
    assert_eq!(client.backend.capture_starts(), 0);
}

//! Session data model shared between the core and its collaborators

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ErrorKind;

/// This device's role relative to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Unknown,
    /// Joined the peer's group; knows the owner's address up front
    Client,
    /// Owns the group; learns the client's address from its announce
    Server,
}

impl Role {
    /// Owners are servers, everyone else is a client
    pub fn from_ownership(is_owner: bool) -> Self {
        if is_owner {
            Role::Server
        } else {
            Role::Client
        }
    }
}

/// Reachable address of the peer, if known yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", content = "ip", rename_all = "snake_case")]
pub enum PeerAddress {
    #[default]
    Unset,
    Resolved(IpAddr),
}

impl PeerAddress {
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            PeerAddress::Unset => None,
            PeerAddress::Resolved(ip) => Some(*ip),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, PeerAddress::Resolved(_))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddress::Unset => f.write_str("unset"),
            PeerAddress::Resolved(ip) => write!(f, "{ip}"),
        }
    }
}

/// The remote party of the current session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub display_name: String,
    pub address: PeerAddress,
    pub role: Role,
}

impl PeerEndpoint {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Default::default()
        }
    }

    /// Streaming needs both a role and a resolved address
    pub fn is_ready(&self) -> bool {
        self.role != Role::Unknown && self.address.is_resolved()
    }
}

/// Single-writer, many-reader handle to the session's endpoint
#[derive(Debug, Clone, Default)]
pub struct SharedEndpoint(Arc<RwLock<PeerEndpoint>>);

impl SharedEndpoint {
    pub fn new(endpoint: PeerEndpoint) -> Self {
        Self(Arc::new(RwLock::new(endpoint)))
    }

    pub fn snapshot(&self) -> PeerEndpoint {
        self.0.read().clone()
    }

    pub fn address(&self) -> PeerAddress {
        self.0.read().address
    }

    pub fn role(&self) -> Role {
        self.0.read().role
    }

    pub fn update(&self, f: impl FnOnce(&mut PeerEndpoint)) {
        f(&mut self.0.write());
    }
}

/// Lifecycle of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    RoleNegotiation,
    /// Armed: endpoint resolved, no loop active
    Ready,
    Transmitting,
    Receiving,
    Disconnecting,
    Failed,
}

impl SessionState {
    /// States in which streaming may be started or stopped
    pub fn is_armed(&self) -> bool {
        matches!(
            self,
            SessionState::Ready | SessionState::Transmitting | SessionState::Receiving
        )
    }

    /// States from which a new peer may be selected
    pub fn accepts_new_peer(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::RoleNegotiation => "role-negotiation",
            SessionState::Ready => "ready",
            SessionState::Transmitting => "transmitting",
            SessionState::Receiving => "receiving",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What the discovery layer knows once a group/connection exists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Whether this device owns the group
    pub is_owner: bool,
    /// Owner's address; present when this device is not the owner
    #[serde(default)]
    pub owner_address: Option<IpAddr>,
    /// Owner's device name as reported by discovery
    #[serde(default)]
    pub owner_name: Option<String>,
    /// Names of devices that joined the group (owner side)
    #[serde(default)]
    pub joined_peers: Vec<String>,
}

impl ConnectionDescriptor {
    /// Descriptor for the owner side of a fresh group
    pub fn owner(joined_peer: impl Into<String>) -> Self {
        Self {
            is_owner: true,
            joined_peers: vec![joined_peer.into()],
            ..Default::default()
        }
    }

    /// Descriptor for the joining side
    pub fn client(owner_name: impl Into<String>, owner_address: IpAddr) -> Self {
        Self {
            is_owner: false,
            owner_address: Some(owner_address),
            owner_name: Some(owner_name.into()),
            joined_peers: Vec::new(),
        }
    }

    /// Groups only ever hold two devices, so the peer is the first client
    /// (owner side) or the owner (client side).
    pub fn peer_display_name(&self) -> String {
        let name = if self.is_owner {
            self.joined_peers.first().cloned()
        } else {
            self.owner_name.clone()
        };
        name.unwrap_or_else(|| "unknown peer".to_string())
    }

    pub fn role(&self) -> Role {
        Role::from_ownership(self.is_owner)
    }
}

/// Frame counters for the active session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
}

/// Snapshot handed to the UI on every status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub session_id: Option<Uuid>,
    pub state: SessionState,
    pub peer_name: Option<String>,
    pub role: Role,
    pub address: PeerAddress,
    pub stats: StreamStats,
    pub timestamp: DateTime<Utc>,
}

/// Events marshaled to the control context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Status(StatusUpdate),
    Error {
        session_id: Option<Uuid>,
        kind: ErrorKind,
        message: String,
    },
}

//! Runtime configuration
//!
//! Everything has a working default; a TOML file can override any field.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub ui: UiConfig,
}

impl AppConfig {
    /// Parse from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.session.validate()?;
        Ok(config)
    }

    /// Load from a file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Load from the default location, falling back to defaults if absent
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// `<config_dir>/peer-voice/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "peer-voice")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Audio transport backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Connectionless; lossy, unordered, no retries
    #[default]
    Datagram,
    /// Connection-oriented; ordered and reliable, peer may close at any time
    Stream,
}

/// Whether both directions may be active at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplexMode {
    #[default]
    Full,
    /// Walkie-talkie: one talker at a time
    Half,
}

/// Session parameters shared by both peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Port the owner listens on for the client's announce
    pub rendezvous_port: u16,
    /// Port this device receives audio on
    pub audio_port: u16,
    /// Port the peer receives audio on; same as `audio_port` when unset
    pub peer_audio_port: Option<u16>,
    /// Bytes per audio frame (16-bit samples, so must be even)
    pub frame_size: usize,
    pub sample_rate_hz: u32,
    /// Local interface to bind
    pub bind_address: IpAddr,
    pub transport: TransportKind,
    pub duplex: DuplexMode,
    pub connect_timeout_ms: u64,
    pub accept_timeout_ms: u64,
    /// Upper bound on any single blocking receive/read
    pub receive_timeout_ms: u64,
    /// Half-duplex only: how long after hearing the peer we refuse to talk
    pub half_duplex_holdoff_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rendezvous_port: DEFAULT_RENDEZVOUS_PORT,
            audio_port: DEFAULT_AUDIO_PORT,
            peer_audio_port: None,
            frame_size: DEFAULT_FRAME_SIZE,
            sample_rate_hz: DEFAULT_SAMPLE_RATE,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            transport: TransportKind::default(),
            duplex: DuplexMode::default(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            accept_timeout_ms: DEFAULT_ACCEPT_TIMEOUT.as_millis() as u64,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT.as_millis() as u64,
            half_duplex_holdoff_ms: 300,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frame_size == 0 || self.frame_size % BYTES_PER_SAMPLE != 0 {
            return Err(Error::Config(format!(
                "frame_size must be a positive multiple of {BYTES_PER_SAMPLE}, got {}",
                self.frame_size
            )));
        }
        if self.frame_size > MAX_DATAGRAM_SIZE {
            return Err(Error::Config(format!(
                "frame_size {} exceeds the datagram limit {MAX_DATAGRAM_SIZE}",
                self.frame_size
            )));
        }
        if self.sample_rate_hz == 0 {
            return Err(Error::Config("sample_rate_hz must be non-zero".into()));
        }
        if self.rendezvous_port == 0 || self.audio_port == 0 || self.peer_audio_port == Some(0) {
            return Err(Error::Config("ports must be non-zero".into()));
        }
        if self.rendezvous_port == self.audio_port {
            return Err(Error::Config(format!(
                "rendezvous and audio ports must differ (both {})",
                self.audio_port
            )));
        }
        if self.receive_timeout_ms == 0 {
            return Err(Error::Config("receive_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }

    /// Samples carried by one frame
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size / BYTES_PER_SAMPLE
    }

    pub fn peer_audio_port(&self) -> u16 {
        self.peer_audio_port.unwrap_or(self.audio_port)
    }

    pub fn audio_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.audio_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn half_duplex_holdoff(&self) -> Duration {
        Duration::from_millis(self.half_duplex_holdoff_ms)
    }
}

/// Control surface settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.rendezvous_port, 4540);
        assert_eq!(config.sample_rate_hz, 44_100);
        assert_eq!(config.samples_per_frame(), 2048);
        assert_eq!(config.peer_audio_port(), config.audio_port);
    }

    #[test]
    fn test_rejects_shared_port() {
        let config = SessionConfig {
            audio_port: 4540,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_odd_frame_size() {
        let config = SessionConfig {
            frame_size: 1023,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = AppConfig::from_toml_str(
            r#"
            [session]
            frame_size = 1024
            transport = "stream"
            duplex = "half"

            [ui]
            http_port = 9000
            "#,
        )
        .unwrap();

        assert_eq!(config.session.frame_size, 1024);
        assert_eq!(config.session.transport, TransportKind::Stream);
        assert_eq!(config.session.duplex, DuplexMode::Half);
        assert_eq!(config.session.audio_port, DEFAULT_AUDIO_PORT);
        assert_eq!(config.ui.http_port, 9000);
    }

    #[test]
    fn test_toml_round_trip_preserves_session() {
        let mut config = AppConfig::default();
        config.session.peer_audio_port = Some(5000);
        let text = config.to_toml_string().unwrap();
        let parsed = AppConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.session, config.session);
    }
}

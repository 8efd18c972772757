//! One-shot role and address exchange
//!
//! After the group forms only the client knows where the owner is. The
//! owner therefore listens on the rendezvous port for a single announce
//! and records the sender's address; the client connects, sends an opaque
//! marker and hangs up. The payload is never interpreted.

use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::time::Duration;

use crate::config::SessionConfig;
use crate::constants::ANNOUNCE_MARKER;
use crate::error::ExchangeError;
use crate::network::tcp::{accept_one, connect_until, listen};
use crate::network::{CancelToken, WaitError};
use crate::protocol::{ConnectionDescriptor, PeerAddress, Role, SharedEndpoint};

/// Announce payloads beyond this are not read
const MAX_ANNOUNCE_LEN: usize = 1024;

/// How long the owner waits for the announce body after accepting
const ANNOUNCE_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of a completed exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOutcome {
    pub role: Role,
    pub peer_address: IpAddr,
}

/// Negotiates role and peer address for one session.
///
/// [`run`](AddressExchange::run) consumes the exchange; a failed exchange is
/// never repeated and the caller is expected to abandon the session.
#[derive(Debug, Clone)]
pub struct AddressExchange {
    bind_address: IpAddr,
    port: u16,
    connect_timeout: Duration,
    accept_timeout: Duration,
}

impl AddressExchange {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            bind_address: config.bind_address,
            port: config.rendezvous_port,
            connect_timeout: config.connect_timeout(),
            accept_timeout: config.accept_timeout(),
        }
    }

    /// Derive the role from `descriptor`, exchange addresses and write both
    /// into `endpoint`. On failure the endpoint's address is left unset.
    pub fn run(
        self,
        descriptor: &ConnectionDescriptor,
        endpoint: &SharedEndpoint,
        cancel: &CancelToken,
    ) -> Result<ExchangeOutcome, ExchangeError> {
        let role = descriptor.role();
        endpoint.update(|e| {
            e.role = role;
            e.address = PeerAddress::Unset;
        });

        let result = match role {
            Role::Server => self.await_announce(cancel),
            _ => self.announce(descriptor, endpoint, cancel),
        };

        match result {
            Ok(peer_address) => {
                endpoint.update(|e| e.address = PeerAddress::Resolved(peer_address));
                tracing::info!("Exchange complete: role {:?}, peer {}", role, peer_address);
                Ok(ExchangeOutcome { role, peer_address })
            }
            Err(e) => {
                endpoint.update(|e| e.address = PeerAddress::Unset);
                tracing::error!("Exchange failed as {:?}: {}", role, e);
                Err(e)
            }
        }
    }

    /// Owner side: accept one announce, then release the port
    fn await_announce(&self, cancel: &CancelToken) -> Result<IpAddr, ExchangeError> {
        let addr = SocketAddr::new(self.bind_address, self.port);
        let listener = listen(addr).map_err(|e| ExchangeError::AcceptFailed(format!("{addr}: {e}")))?;
        tracing::info!("Waiting for announce on {}", addr);

        let (mut stream, source) =
            accept_one(&listener, self.accept_timeout, cancel).map_err(|e| match e {
                WaitError::Cancelled => ExchangeError::Cancelled,
                WaitError::TimedOut => ExchangeError::Timeout(self.accept_timeout.as_millis() as u64),
                WaitError::Io(e) => ExchangeError::AcceptFailed(e.to_string()),
            })?;
        drop(listener);

        let len = read_announce(&mut stream)
            .map_err(|e| ExchangeError::AcceptFailed(format!("announce from {source}: {e}")))?;
        if len == 0 {
            return Err(ExchangeError::AcceptFailed(format!("empty announce from {source}")));
        }
        tracing::debug!("Announce of {} bytes from {}", len, source);

        Ok(source.ip())
    }

    /// Client side: the owner's address comes with the descriptor
    fn announce(
        &self,
        descriptor: &ConnectionDescriptor,
        endpoint: &SharedEndpoint,
        cancel: &CancelToken,
    ) -> Result<IpAddr, ExchangeError> {
        let owner = descriptor
            .owner_address
            .ok_or(ExchangeError::MissingOwnerAddress)?;
        endpoint.update(|e| e.address = PeerAddress::Resolved(owner));

        let addr = SocketAddr::new(owner, self.port);
        let mut stream = connect_until(addr, self.bind_address, self.connect_timeout, cancel)
            .map_err(|e| match e {
                WaitError::Cancelled => ExchangeError::Cancelled,
                WaitError::TimedOut => {
                    ExchangeError::Timeout(self.connect_timeout.as_millis() as u64)
                }
                WaitError::Io(e) => ExchangeError::ConnectFailed {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                },
            })?;

        stream
            .write_all(ANNOUNCE_MARKER)
            .and_then(|_| stream.shutdown(Shutdown::Write))
            .map_err(|e| ExchangeError::ConnectFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!("Announced to owner at {}", addr);
        Ok(owner)
    }
}

/// Drain the announce until the client hangs up
fn read_announce(stream: &mut std::net::TcpStream) -> std::io::Result<usize> {
    stream.set_read_timeout(Some(ANNOUNCE_READ_TIMEOUT))?;
    let mut buf = [0u8; MAX_ANNOUNCE_LEN];
    let mut total = 0;
    loop {
        match stream.read(&mut buf[total..]) {
            Ok(0) => return Ok(total),
            Ok(n) => {
                total += n;
                if total == buf.len() {
                    return Ok(total);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerEndpoint;
    use std::net::Ipv4Addr;
    use std::thread;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn free_port() -> u16 {
        std::net::TcpListener::bind((LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn config(port: u16) -> SessionConfig {
        SessionConfig {
            rendezvous_port: port,
            bind_address: LOCALHOST,
            connect_timeout_ms: 2_000,
            accept_timeout_ms: 2_000,
            ..Default::default()
        }
    }

    #[test]
    fn test_owner_learns_client_address() {
        let port = free_port();
        let cfg = config(port);

        let owner_endpoint = SharedEndpoint::new(PeerEndpoint::new("client"));
        let owner = {
            let endpoint = owner_endpoint.clone();
            let exchange = AddressExchange::new(&cfg);
            thread::spawn(move || {
                exchange.run(&ConnectionDescriptor::owner("client"), &endpoint, &CancelToken::new())
            })
        };

        let client_endpoint = SharedEndpoint::new(PeerEndpoint::new("owner"));
        let client_outcome = AddressExchange::new(&cfg)
            .run(
                &ConnectionDescriptor::client("owner", LOCALHOST),
                &client_endpoint,
                &CancelToken::new(),
            )
            .unwrap();
        let owner_outcome = owner.join().unwrap().unwrap();

        assert_eq!(owner_outcome.role, Role::Server);
        assert_eq!(owner_outcome.peer_address, LOCALHOST);
        assert_eq!(client_outcome.role, Role::Client);

        assert_eq!(owner_endpoint.role(), Role::Server);
        assert_eq!(owner_endpoint.address(), PeerAddress::Resolved(LOCALHOST));
        assert_eq!(client_endpoint.role(), Role::Client);
        assert_eq!(client_endpoint.address(), PeerAddress::Resolved(LOCALHOST));

        // The rendezvous port is released after the single accept
        assert!(listen(SocketAddr::new(LOCALHOST, port)).is_ok());
    }

    #[test]
    fn test_client_without_owner_address_fails() {
        let endpoint = SharedEndpoint::default();
        let descriptor = ConnectionDescriptor {
            is_owner: false,
            ..Default::default()
        };
        let result = AddressExchange::new(&config(free_port())).run(&descriptor, &endpoint, &CancelToken::new());

        assert!(matches!(result, Err(ExchangeError::MissingOwnerAddress)));
        assert_eq!(endpoint.address(), PeerAddress::Unset);
        assert_eq!(endpoint.role(), Role::Client);
    }

    #[test]
    fn test_refused_connect_leaves_address_unset() {
        let mut cfg = config(free_port());
        cfg.connect_timeout_ms = 200;
        let endpoint = SharedEndpoint::default();

        let result = AddressExchange::new(&cfg).run(
            &ConnectionDescriptor::client("owner", LOCALHOST),
            &endpoint,
            &CancelToken::new(),
        );

        assert!(matches!(
            result,
            Err(ExchangeError::ConnectFailed { .. }) | Err(ExchangeError::Timeout(_))
        ));
        assert_eq!(endpoint.address(), PeerAddress::Unset);
    }

    #[test]
    fn test_owner_times_out_without_announce() {
        let mut cfg = config(free_port());
        cfg.accept_timeout_ms = 100;
        let endpoint = SharedEndpoint::default();

        let result = AddressExchange::new(&cfg).run(
            &ConnectionDescriptor::owner("client"),
            &endpoint,
            &CancelToken::new(),
        );

        assert!(matches!(result, Err(ExchangeError::Timeout(100))));
        assert_eq!(endpoint.role(), Role::Server);
        assert_eq!(endpoint.address(), PeerAddress::Unset);
    }

    fn owner_exchange(
        cfg: &SessionConfig,
        endpoint: &SharedEndpoint,
    ) -> thread::JoinHandle<Result<ExchangeOutcome, ExchangeError>> {
        let endpoint = endpoint.clone();
        let exchange = AddressExchange::new(cfg);
        thread::spawn(move || {
            exchange.run(&ConnectionDescriptor::owner("client"), &endpoint, &CancelToken::new())
        })
    }

    fn connect_when_listening(port: u16) -> std::net::TcpStream {
        for _ in 0..200 {
            if let Ok(stream) = std::net::TcpStream::connect((LOCALHOST, port)) {
                return stream;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("owner never listened on {port}");
    }

    #[test]
    fn test_unreadable_announce_fails_exchange() {
        let port = free_port();
        let endpoint = SharedEndpoint::default();
        let owner = owner_exchange(&config(port), &endpoint);

        // Connected but silent until the owner's read times out
        let silent = connect_when_listening(port);
        let result = owner.join().unwrap();
        drop(silent);

        assert!(matches!(result, Err(ExchangeError::AcceptFailed(_))));
        assert_eq!(endpoint.address(), PeerAddress::Unset);
    }

    #[test]
    fn test_empty_announce_fails_exchange() {
        let port = free_port();
        let endpoint = SharedEndpoint::default();
        let owner = owner_exchange(&config(port), &endpoint);

        let stream = connect_when_listening(port);
        stream.shutdown(Shutdown::Write).unwrap();
        let result = owner.join().unwrap();

        assert!(matches!(result, Err(ExchangeError::AcceptFailed(_))));
        assert_eq!(endpoint.role(), Role::Server);
        assert_eq!(endpoint.address(), PeerAddress::Unset);
    }

    #[test]
    fn test_cancel_aborts_owner_wait() {
        let cancel = CancelToken::new();
        let handle = {
            let cancel = cancel.clone();
            let exchange = AddressExchange::new(&config(free_port()));
            thread::spawn(move || {
                exchange.run(&ConnectionDescriptor::owner("client"), &SharedEndpoint::default(), &cancel)
            })
        };

        thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        assert!(matches!(handle.join().unwrap(), Err(ExchangeError::Cancelled)));
    }
}

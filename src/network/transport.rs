//! UDP datagram transport
//!
//! Two sockets per session: a receive socket bound to the listen port and a
//! separate send socket on an ephemeral port. Both are non-blocking; `send`
//! and `receive` never wait.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};

use crate::audio::dsp;
use crate::constants::{MAX_DATAGRAM_BYTES, SOCKET_BUFFER_BYTES};
use crate::error::NetworkError;

/// Unreliable datagram channel to a single peer
pub trait DatagramTransport: Send + Sync {
    /// Bind the receive socket to `listen_port` and target `peer`. Any
    /// previously open sockets are released first.
    fn open(&self, listen_port: u16, peer: SocketAddr) -> Result<(), NetworkError>;

    /// Fire-and-forget send. Returns false if the datagram was not handed to
    /// the network stack.
    fn send(&self, data: &[u8]) -> bool;

    /// Take one pending datagram. Returns 0 when nothing valid is pending.
    fn receive(&self, buf: &mut [u8]) -> usize;

    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Transport-level counters
#[derive(Debug, Default)]
pub struct TransportStats {
    pub datagrams_sent: AtomicU64,
    pub datagrams_received: AtomicU64,
    pub malformed: AtomicU64,
    pub send_failures: AtomicU64,
}

/// Serializable copy of [`TransportStats`]
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TransportStatsSnapshot {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub malformed: u64,
    pub send_failures: u64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

struct Sockets {
    rx: UdpSocket,
    tx: UdpSocket,
    peer: SocketAddr,
}

/// [`DatagramTransport`] over UDP sockets
#[derive(Default)]
pub struct UdpTransport {
    sockets: RwLock<Option<Sockets>>,
    stats: TransportStats,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Port the receive socket is actually bound to
    pub fn local_port(&self) -> Option<u16> {
        self.sockets
            .read()
            .as_ref()
            .and_then(|s| s.rx.local_addr().ok())
            .map(|addr| addr.port())
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.sockets.read().as_ref().map(|s| s.peer)
    }

    /// Receive one datagram and decode it into samples
    pub fn receive_samples(&self, samples: &mut [i16]) -> usize {
        let mut buf = [0u8; MAX_DATAGRAM_BYTES];
        let n = self.receive(&mut buf);
        dsp::decode_s16le(&buf[..n], samples)
    }
}

fn unspecified(domain: Domain) -> IpAddr {
    if domain == Domain::IPV6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
}

fn new_socket(domain: Domain) -> Result<Socket, NetworkError> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::SocketFailed(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::SocketFailed(format!("SO_REUSEADDR: {}", e)))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::SocketFailed(format!("non-blocking: {}", e)))?;
    Ok(socket)
}

/// Receive socket bound to the unspecified address on `port`
fn bind_receive(domain: Domain, port: u16) -> Result<UdpSocket, NetworkError> {
    let socket = new_socket(domain)?;
    socket
        .set_recv_buffer_size(SOCKET_BUFFER_BYTES)
        .map_err(|e| NetworkError::SocketFailed(format!("SO_RCVBUF: {}", e)))?;

    let addr = SocketAddr::new(unspecified(domain), port);
    socket.bind(&addr.into()).map_err(|e| NetworkError::BindFailed {
        port,
        reason: e.to_string(),
    })?;

    Ok(socket.into())
}

fn bind_send(domain: Domain) -> Result<UdpSocket, NetworkError> {
    let socket = new_socket(domain)?;
    socket
        .set_send_buffer_size(SOCKET_BUFFER_BYTES)
        .map_err(|e| NetworkError::SocketFailed(format!("SO_SNDBUF: {}", e)))?;

    let addr = SocketAddr::new(unspecified(domain), 0);
    socket.bind(&addr.into()).map_err(|e| NetworkError::BindFailed {
        port: 0,
        reason: e.to_string(),
    })?;

    Ok(socket.into())
}

impl DatagramTransport for UdpTransport {
    fn open(&self, listen_port: u16, peer: SocketAddr) -> Result<(), NetworkError> {
        self.close();

        let domain = Domain::for_address(peer);
        let rx = bind_receive(domain, listen_port)?;
        let tx = bind_send(domain)?;

        tracing::info!(
            "UDP transport open: listening on {}, sending to {}",
            rx.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            peer
        );

        *self.sockets.write() = Some(Sockets { rx, tx, peer });
        Ok(())
    }

    fn send(&self, data: &[u8]) -> bool {
        let sockets = self.sockets.read();
        let Some(sockets) = sockets.as_ref() else {
            return false;
        };

        match sockets.tx.send_to(data, sockets.peer) {
            Ok(_) => {
                self.stats.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                let failures = self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                if e.kind() != ErrorKind::WouldBlock && failures % 100 == 0 {
                    tracing::debug!("UDP send to {} failed: {}", sockets.peer, e);
                }
                false
            }
        }
    }

    fn receive(&self, buf: &mut [u8]) -> usize {
        let sockets = self.sockets.read();
        let Some(sockets) = sockets.as_ref() else {
            return 0;
        };

        match sockets.rx.recv_from(buf) {
            Ok((0, _)) => 0,
            Ok((n, from)) if n % 2 != 0 => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Ignoring odd-sized datagram ({} bytes) from {}", n, from);
                0
            }
            Ok((n, _)) => {
                self.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);
                n
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => 0,
            Err(e) => {
                tracing::trace!("UDP receive error: {}", e);
                0
            }
        }
    }

    fn close(&self) {
        if self.sockets.write().take().is_some() {
            tracing::info!("UDP transport closed");
        }
    }

    fn is_open(&self) -> bool {
        self.sockets.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn loopback_peer() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        socket
    }

    fn receive_within(transport: &UdpTransport, buf: &mut [u8], wait: Duration) -> usize {
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            let n = transport.receive(buf);
            if n > 0 {
                return n;
            }
            thread::sleep(Duration::from_millis(2));
        }
        0
    }

    #[test]
    fn test_closed_transport_is_inert() {
        let transport = UdpTransport::new();
        let mut buf = [0u8; 16];
        assert!(!transport.is_open());
        assert!(!transport.send(&[1, 2]));
        assert_eq!(transport.receive(&mut buf), 0);
        transport.close();
        transport.close();
    }

    #[test]
    fn test_send_reaches_peer() {
        let peer = loopback_peer();
        let transport = UdpTransport::new();
        transport.open(0, peer.local_addr().unwrap()).unwrap();

        assert!(transport.send(&[1, 0, 2, 0]));

        let mut buf = [0u8; 16];
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 0, 2, 0]);
        assert_eq!(transport.stats().snapshot().datagrams_sent, 1);
    }

    #[test]
    fn test_receive_filters_malformed_datagrams() {
        let peer = loopback_peer();
        let transport = UdpTransport::new();
        transport.open(0, peer.local_addr().unwrap()).unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], transport.local_port().unwrap()));

        let mut buf = [0u8; MAX_DATAGRAM_BYTES];
        assert_eq!(transport.receive(&mut buf), 0);

        peer.send_to(&[], target).unwrap();
        peer.send_to(&[1, 2, 3], target).unwrap();
        peer.send_to(&[0x10, 0x00, 0xF0, 0xFF], target).unwrap();

        let n = receive_within(&transport, &mut buf, Duration::from_secs(2));
        assert_eq!(&buf[..n], &[0x10, 0x00, 0xF0, 0xFF]);

        let stats = transport.stats().snapshot();
        assert_eq!(stats.datagrams_received, 1);
        assert_eq!(stats.malformed, 1);
    }

    #[test]
    fn test_receive_samples_decodes() {
        let peer = loopback_peer();
        let transport = UdpTransport::new();
        transport.open(0, peer.local_addr().unwrap()).unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], transport.local_port().unwrap()));

        let mut payload = [0u8; 4];
        dsp::encode_s16le(&[300, -300], &mut payload);
        peer.send_to(&payload, target).unwrap();

        let mut samples = [0i16; 8];
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut n = 0;
        while n == 0 && Instant::now() < deadline {
            n = transport.receive_samples(&mut samples);
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(&samples[..n], &[300, -300]);
    }

    #[test]
    fn test_reopen_replaces_sockets() {
        let peer = loopback_peer();
        let transport = UdpTransport::new();
        transport.open(0, "127.0.0.1:9".parse().unwrap()).unwrap();
        transport.open(0, peer.local_addr().unwrap()).unwrap();
        assert!(transport.is_open());
        assert_eq!(transport.peer(), Some(peer.local_addr().unwrap()));
        transport.close();
        assert!(!transport.is_open());
    }
}

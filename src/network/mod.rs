//! Network subsystem for UDP audio transport
//!
//! Audio travels as raw s16le PCM with no header: one datagram is a whole
//! number of samples and carries at most `MAX_DATAGRAM_BYTES`. There is no
//! sequencing, retransmission or reordering; loss shows up as jitter-buffer
//! underrun on the receiving side.

pub mod peer;
pub mod transport;

pub use peer::{resolve_addr, DiscoveryPeer, PeerDiscovery, PeerEndpoint, PeerResolver};
pub use transport::{DatagramTransport, TransportStats, UdpTransport};

use std::net::SocketAddr;

use mrpc_transport::{ConnHandle, Packet};

/// Result of a reliable exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The peer answered; this is its reply.
    Arrived(Packet),
    /// The peer refused the packet.
    Naked,
    /// Retries ran out.
    Timeout,
}

/// The retransmission engine underneath an endpoint.
///
/// Production wires this to the socket layer; tests use a scripted or
/// loopback implementation.
#[async_trait::async_trait]
pub trait ReliableSender: Send + Sync {
    /// Send `packet` to `peer` on behalf of `conn` and wait for the reply,
    /// retrying as needed. Multicast packets are addressed to the group,
    /// so `conn` says which member this copy is for.
    async fn send_reliably(
        &self,
        peer: Option<SocketAddr>,
        conn: ConnHandle,
        packet: Packet,
    ) -> SendOutcome;

    /// Send once, no reply expected.
    async fn transmit(&self, peer: Option<SocketAddr>, packet: Packet);
}

// ── MockSender (tests) ──────────────────────────────────────────────────

use mrpc_metrics::{Counter, Gauge};
use serde::Serialize;

/// Counters for the multicast layer of one endpoint.
#[derive(Debug, Default, Serialize)]
pub struct MulticastStats {
    /// Group records handed out by the table.
    pub groups_allocated: Counter,
    /// Group records returned to the free list.
    pub groups_freed: Counter,
    /// Times the record pool grew because the free list was empty.
    pub pool_growth: Counter,
    pub groups_in_use: Gauge,
    /// Inbound packets dropped as bogus.
    pub bogus_packets: Counter,
    /// New requests accepted on the receive path, handshakes included.
    pub requests: Counter,
    pub handshakes: Counter,
}

use crate::TransportError;

/// Protocol version stamped into every outgoing header.
pub const PROTOCOL_VERSION: u32 = 7;

/// Default ceiling on a whole packet (header + body).
const DEFAULT_MAX_PACKET_SIZE: usize = 64 * 1024;

/// Transport-level settings shared by every connection of an endpoint.
///
/// ```rust
/// use mrpc_transport::TransportConfig;
///
/// let config = TransportConfig::new().max_packet_size(8 * 1024);
/// assert_eq!(config.get_max_packet_size(), 8 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub(crate) protocol_version: u32,
    pub(crate) max_packet_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Defaults, with `MRPC_MAX_PACKET_SIZE` overriding the packet ceiling
    /// when it is set to a valid number.
    pub fn new() -> Self {
        let max_packet_size = std::env::var("MRPC_MAX_PACKET_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_PACKET_SIZE);

        Self {
            protocol_version: PROTOCOL_VERSION,
            max_packet_size,
        }
    }

    pub fn protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn max_packet_size(mut self, bytes: usize) -> Self {
        self.max_packet_size = bytes;
        self
    }

    pub fn get_protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn get_max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Reject a body that would not fit in one packet.
    pub fn check_body_len(&self, body_len: usize) -> Result<(), TransportError> {
        let size = crate::HEADER_LEN + body_len;
        if size > self.max_packet_size {
            return Err(TransportError::PacketTooLarge {
                size,
                max: self.max_packet_size,
            });
        }
        Ok(())
    }
}

use mrpc_transport::TransportConfig;

/// Default number of fan-out slots added each time a group's member list
/// is full.
pub const DEFAULT_FANOUT_INCREMENT: usize = 8;

/// Configuration for an [`Endpoint`](crate::Endpoint).
///
/// ```rust
/// use mrpc_multicast::EndpointConfig;
/// use mrpc_transport::TransportConfig;
///
/// let config = EndpointConfig::new()
///     .fanout_increment(16)
///     .transport(TransportConfig::new().max_packet_size(8 * 1024));
/// assert_eq!(config.get_fanout_increment(), 16);
/// ```
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub(crate) fanout_increment: usize,
    pub(crate) transport: TransportConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointConfig {
    /// Defaults. `MRPC_FANOUT_INCREMENT` overrides the fan-out increment
    /// when set to a positive number.
    pub fn new() -> Self {
        let fanout_increment = std::env::var("MRPC_FANOUT_INCREMENT")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(DEFAULT_FANOUT_INCREMENT);

        Self {
            fanout_increment,
            transport: TransportConfig::new(),
        }
    }

    /// Fan-out slots added per growth step (minimum 1).
    pub fn fanout_increment(mut self, slots: usize) -> Self {
        self.fanout_increment = slots.max(1);
        self
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn get_fanout_increment(&self) -> usize {
        self.fanout_increment
    }

    pub fn get_transport(&self) -> &TransportConfig {
        &self.transport
    }

    /// Version stamped on every packet this endpoint builds.
    pub fn protocol_version(&self) -> u32 {
        self.transport.get_protocol_version()
    }
}

use crate::SecurityLevel;

/// Errors returned by the mrpc transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("packet truncated: {len} bytes (header is {header} bytes)")]
    Truncated { len: usize, header: usize },

    #[error("malformed {what} body: {len} bytes (expected {expected})")]
    MalformedBody {
        what: &'static str,
        len: usize,
        expected: usize,
    },

    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("unknown security level: {0}")]
    UnknownSecurityLevel(u32),

    #[error("invalid security parameters: {level:?} with encryption type {encryption:#x}")]
    InvalidSecurity {
        level: SecurityLevel,
        encryption: u32,
    },
}

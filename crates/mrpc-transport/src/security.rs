use std::fmt;

use serde::{Deserialize, Serialize};

use crate::TransportError;

pub const SESSION_KEY_LEN: usize = 32;

/// How much of a packet is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SecurityLevel {
    #[default]
    Open,
    AuthOnly,
    HeadersOnly,
    Secure,
}

impl SecurityLevel {
    pub fn wire_value(self) -> u32 {
        match self {
            SecurityLevel::Open => 0,
            SecurityLevel::AuthOnly => 1,
            SecurityLevel::HeadersOnly => 2,
            SecurityLevel::Secure => 3,
        }
    }
}

impl TryFrom<u32> for SecurityLevel {
    type Error = TransportError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SecurityLevel::Open),
            1 => Ok(SecurityLevel::AuthOnly),
            2 => Ok(SecurityLevel::HeadersOnly),
            3 => Ok(SecurityLevel::Secure),
            other => Err(TransportError::UnknownSecurityLevel(other)),
        }
    }
}

/// Encryption algorithm bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EncryptionType(pub u32);

impl EncryptionType {
    pub const NONE: EncryptionType = EncryptionType(0);
    /// Rolling-key XOR.
    pub const XOR: EncryptionType = EncryptionType(0x1);
    /// ChaCha20 stream cipher.
    pub const CHACHA20: EncryptionType = EncryptionType(0x2);
    /// Every bit this build understands.
    pub const KNOWN: EncryptionType = EncryptionType(0x1 | 0x2);

    /// At least one known bit, and exactly one bit overall.
    pub fn is_single_known(self) -> bool {
        self.0 & Self::KNOWN.0 != 0 && self.0.count_ones() == 1
    }

    pub fn contains(self, other: EncryptionType) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }
}

/// Symmetric key shared by a connection or group.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionKey(pub [u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub fn zeroed() -> Self {
        Self([0u8; SESSION_KEY_LEN])
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Level, key and algorithm, validated together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecurityParams {
    pub level: SecurityLevel,
    pub key: SessionKey,
    pub encryption: EncryptionType,
}

impl SecurityParams {
    /// Validate a combination. `Open` discards key material; every other
    /// level needs exactly one known encryption bit.
    pub fn new(
        level: SecurityLevel,
        key: SessionKey,
        encryption: EncryptionType,
    ) -> Result<Self, TransportError> {
        if level == SecurityLevel::Open {
            return Ok(Self::open());
        }
        if !encryption.is_single_known() {
            return Err(TransportError::InvalidSecurity {
                level,
                encryption: encryption.0,
            });
        }
        Ok(Self {
            level,
            key,
            encryption,
        })
    }

    pub fn open() -> Self {
        Self {
            level: SecurityLevel::Open,
            key: SessionKey::zeroed(),
            encryption: EncryptionType::NONE,
        }
    }

    /// Whether a connection with `self` may join a group with `group`.
    /// The algorithm only has to match when there is one.
    pub fn compatible_with(&self, group: &SecurityParams) -> bool {
        self.level == group.level
            && (self.level == SecurityLevel::Open || self.encryption == group.encryption)
    }
}

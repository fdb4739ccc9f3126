use mrpc_transport::{codes, ConnHandle, EncryptionType, GroupHandle, SecurityLevel};

/// Errors returned by multicast group operations.
///
/// Every variant maps onto a wire return code through [`MulticastError::code`],
/// so a failure seen locally can be reported to a peer unchanged.
#[derive(Debug, thiserror::Error)]
pub enum MulticastError {
    #[error("no such multicast group: {0}")]
    NoSuchGroup(GroupHandle),

    #[error("no such connection: {0}")]
    NoSuchConnection(ConnHandle),

    #[error("{0} is in hard error")]
    HardError(String),

    #[error("{0} is not a client connection")]
    NotClientConnection(ConnHandle),

    #[error("{conn} is already a member of {group}")]
    DuplicateMember { group: GroupHandle, conn: ConnHandle },

    #[error("incompatible group: {reason}")]
    IncompatibleGroup { reason: &'static str },

    #[error("{conn} is not a member of {group}")]
    NotGroupMember { group: GroupHandle, conn: ConnHandle },

    #[error("invalid security parameters: {level:?} with encryption type {:#x}", .encryption.0)]
    InvalidSecurityParameters {
        level: SecurityLevel,
        encryption: EncryptionType,
    },

    #[error("unknown side-effect type {0}")]
    UnknownSideEffect(u32),

    #[error("side effect failed ({}): code {code}", severity(.soft))]
    SideEffectFailure { soft: bool, code: i32 },

    #[error("peer rejected the request (NAK)")]
    Naked,

    #[error("peer did not answer")]
    Dead,

    #[error("peer replied with code {code}")]
    Rejected { code: i32 },

    #[error("address resolution failed: {0}")]
    AddressResolution(String),

    #[error("transport error: {0}")]
    Transport(#[from] mrpc_transport::TransportError),
}

fn severity(soft: &bool) -> &'static str {
    if *soft {
        "soft"
    } else {
        "hard"
    }
}

impl MulticastError {
    /// Return code carried on the wire for this failure.
    pub fn code(&self) -> i32 {
        match self {
            MulticastError::NoSuchGroup(_) => codes::NO_MGROUP,
            MulticastError::NoSuchConnection(_) => codes::NO_CONNECTION,
            MulticastError::DuplicateMember { .. } => codes::DUPLICATE_MEMBER,
            MulticastError::IncompatibleGroup { .. } => codes::BAD_MGROUP,
            MulticastError::NotGroupMember { .. } => codes::NOT_GROUP_MEMBER,
            MulticastError::SideEffectFailure { soft: true, .. } => codes::SE_FAIL_SOFT,
            MulticastError::SideEffectFailure { soft: false, .. } => codes::SE_FAIL_HARD,
            MulticastError::Naked => codes::NAKED,
            MulticastError::Dead => codes::DEAD,
            MulticastError::Rejected { code } => *code,
            MulticastError::HardError(_)
            | MulticastError::NotClientConnection(_)
            | MulticastError::InvalidSecurityParameters { .. }
            | MulticastError::UnknownSideEffect(_)
            | MulticastError::AddressResolution(_)
            | MulticastError::Transport(_) => codes::FAIL,
        }
    }
}

use bytes::{Buf, BufMut, BytesMut};

use crate::{GroupHandle, SessionKey, TransportError, SESSION_KEY_LEN};

/// Body of the `InitMulticast` control call.
///
/// Layout: group handle (u32 BE), initial sequence number (u32 BE),
/// session key (32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitMulticastBody {
    pub group: GroupHandle,
    pub initial_seq: u32,
    pub session_key: SessionKey,
}

impl InitMulticastBody {
    pub const LEN: usize = 4 + 4 + SESSION_KEY_LEN;

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u32(self.group.0);
        buf.put_u32(self.initial_seq);
        buf.put_slice(self.session_key.as_bytes());
        buf
    }

    /// Decode from a packet body. Trailing bytes are ignored.
    pub fn decode(mut body: &[u8]) -> Result<Self, TransportError> {
        if body.len() < Self::LEN {
            return Err(TransportError::MalformedBody {
                what: "InitMulticast",
                len: body.len(),
                expected: Self::LEN,
            });
        }
        let group = GroupHandle(body.get_u32());
        let initial_seq = body.get_u32();
        let mut key = [0u8; SESSION_KEY_LEN];
        body.copy_to_slice(&mut key);
        Ok(Self {
            group,
            initial_seq,
            session_key: SessionKey(key),
        })
    }
}

//! RPC packet: fixed header followed by an opaque body.
//!
//! The packet owns its bytes in wire form. Header fields are read and
//! rewritten in place, which is what multicast translation and in-place
//! decryption need: one exclusively borrowed buffer, no decoded copy that
//! could drift from the bytes.
use std::net::SocketAddr;
use std::ops::Range;

use bytes::{Buf, BufMut, BytesMut};

use crate::TransportError;

/// Header flag bits.
pub mod flags {
    /// Retransmission of an earlier packet.
    pub const RETRY: u32 = 0x1;
    /// Bytes past the control words are encrypted.
    pub const ENCRYPTED: u32 = 0x2;
    /// Packet was sent to a multicast group (or is a retry of one).
    pub const MULTICAST: u32 = 0x4;
}

/// Reserved opcodes. Application calls use positive opcodes.
pub mod opcode {
    pub const REPLY: i32 = -1;
    pub const INIT_MULTICAST: i32 = -10;
}

const PROTO_VERSION: usize = 0;
const REMOTE_HANDLE: usize = 4;
const LOCAL_HANDLE: usize = 8;
const FLAGS: usize = 12;
const BODY_LENGTH: usize = 16;
const SEQ_NUMBER: usize = 20;
const OPCODE: usize = 24;
const SE_FLAGS: usize = 28;
const SE_DATA_OFFSET: usize = 32;
const SUBSYS_ID: usize = 36;
const RETURN_CODE: usize = 40;
const UNIQUEFIER: usize = 44;
const TIMESTAMP: usize = 48;

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 52;

/// The leading words (version, remote handle, local handle, flags) that
/// are never encrypted; everything after them may be.
pub const CONTROL_WORDS_LEN: usize = 4 * 4;

/// The sequence number and opcode words. Stream ciphers that need a
/// per-packet nonce leave these in clear.
pub const SEQUENCE_WORDS: Range<usize> = SEQ_NUMBER..OPCODE + 4;

/// Decoded header, used to build packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub proto_version: u32,
    pub remote_handle: u32,
    pub local_handle: u32,
    pub flags: u32,
    pub body_length: u32,
    pub seq_number: u32,
    pub opcode: i32,
    pub se_flags: u32,
    pub se_data_offset: u32,
    pub subsys_id: u32,
    pub return_code: i32,
    pub uniquefier: u32,
    pub timestamp: u32,
}

impl PacketHeader {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.proto_version);
        buf.put_u32(self.remote_handle);
        buf.put_u32(self.local_handle);
        buf.put_u32(self.flags);
        buf.put_u32(self.body_length);
        buf.put_u32(self.seq_number);
        buf.put_i32(self.opcode);
        buf.put_u32(self.se_flags);
        buf.put_u32(self.se_data_offset);
        buf.put_u32(self.subsys_id);
        buf.put_i32(self.return_code);
        buf.put_u32(self.uniquefier);
        buf.put_u32(self.timestamp);
    }

    fn read_from(mut bytes: &[u8]) -> Self {
        Self {
            proto_version: bytes.get_u32(),
            remote_handle: bytes.get_u32(),
            local_handle: bytes.get_u32(),
            flags: bytes.get_u32(),
            body_length: bytes.get_u32(),
            seq_number: bytes.get_u32(),
            opcode: bytes.get_i32(),
            se_flags: bytes.get_u32(),
            se_data_offset: bytes.get_u32(),
            subsys_id: bytes.get_u32(),
            return_code: bytes.get_i32(),
            uniquefier: bytes.get_u32(),
            timestamp: bytes.get_u32(),
        }
    }
}

/// A packet in wire form plus the address it came from (inbound only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    buf: BytesMut,
    peer: Option<SocketAddr>,
}

impl Packet {
    /// Build a packet; `body_length` is taken from `body`.
    pub fn new(header: &PacketHeader, body: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
        PacketHeader {
            body_length: body.len() as u32,
            ..*header
        }
        .write_to(&mut buf);
        buf.put_slice(body);
        Self { buf, peer: None }
    }

    /// Wrap bytes received from `peer`.
    pub fn from_wire(bytes: &[u8], peer: Option<SocketAddr>) -> Result<Self, TransportError> {
        if bytes.len() < HEADER_LEN {
            return Err(TransportError::Truncated {
                len: bytes.len(),
                header: HEADER_LEN,
            });
        }
        Ok(Self {
            buf: BytesMut::from(bytes),
            peer,
        })
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn set_peer(&mut self, peer: Option<SocketAddr>) {
        self.peer = peer;
    }

    /// Decode the whole header. Meaningless past the control words while
    /// the packet is still encrypted.
    pub fn header(&self) -> PacketHeader {
        PacketHeader::read_from(&self.buf[..HEADER_LEN])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Whole packet, mutable. Used by security transforms.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn body(&self) -> &[u8] {
        &self.buf[HEADER_LEN..]
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.buf[HEADER_LEN..]
    }

    /// Replace the body, keeping the header and fixing `body_length`.
    pub fn set_body(&mut self, body: &[u8]) {
        self.buf.truncate(HEADER_LEN);
        self.buf.put_slice(body);
        self.set_word(BODY_LENGTH, body.len() as u32);
    }

    // ── Header words ─────────────────────────────────────────────────────

    fn word(&self, offset: usize) -> u32 {
        let mut bytes = &self.buf[offset..offset + 4];
        bytes.get_u32()
    }

    fn set_word(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn proto_version(&self) -> u32 {
        self.word(PROTO_VERSION)
    }

    pub fn remote_handle(&self) -> u32 {
        self.word(REMOTE_HANDLE)
    }

    pub fn set_remote_handle(&mut self, handle: u32) {
        self.set_word(REMOTE_HANDLE, handle);
    }

    pub fn local_handle(&self) -> u32 {
        self.word(LOCAL_HANDLE)
    }

    pub fn set_local_handle(&mut self, handle: u32) {
        self.set_word(LOCAL_HANDLE, handle);
    }

    pub fn flags(&self) -> u32 {
        self.word(FLAGS)
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags() & flag != 0
    }

    pub fn set_flag(&mut self, flag: u32) {
        let flags = self.flags() | flag;
        self.set_word(FLAGS, flags);
    }

    pub fn clear_flag(&mut self, flag: u32) {
        let flags = self.flags() & !flag;
        self.set_word(FLAGS, flags);
    }

    pub fn body_length(&self) -> u32 {
        self.word(BODY_LENGTH)
    }

    pub fn seq_number(&self) -> u32 {
        self.word(SEQ_NUMBER)
    }

    pub fn set_seq_number(&mut self, seq: u32) {
        self.set_word(SEQ_NUMBER, seq);
    }

    pub fn opcode(&self) -> i32 {
        self.word(OPCODE) as i32
    }

    pub fn se_flags(&self) -> u32 {
        self.word(SE_FLAGS)
    }

    pub fn set_se_flags(&mut self, se_flags: u32) {
        self.set_word(SE_FLAGS, se_flags);
    }

    pub fn se_data_offset(&self) -> u32 {
        self.word(SE_DATA_OFFSET)
    }

    pub fn subsys_id(&self) -> u32 {
        self.word(SUBSYS_ID)
    }

    pub fn return_code(&self) -> i32 {
        self.word(RETURN_CODE) as i32
    }

    pub fn set_return_code(&mut self, code: i32) {
        self.set_word(RETURN_CODE, code as u32);
    }

    pub fn uniquefier(&self) -> u32 {
        self.word(UNIQUEFIER)
    }

    pub fn timestamp(&self) -> u32 {
        self.word(TIMESTAMP)
    }
}

//! Packet security transforms.
//!
//! The scope of a transform follows the security level: nothing for
//! `Open` and `AuthOnly`, the header words past the control words for
//! `HeadersOnly`, and every byte past the control words for `Secure`.
//! Both ciphers are length preserving, so packets are transformed in
//! place and the control words (which carry the handles needed to find
//! the key) always stay readable.
//!
//! `CHACHA20` keys the stream cipher with HKDF-SHA256 of the session key,
//! one key per direction (requests and replies). The nonce is the remote
//! handle, the local handle and the sequence number, so no two packets of
//! one direction share a keystream unless they are retransmissions of the
//! same packet. The sequence and opcode words are left in clear for this
//! cipher; the opcode picks the direction on the receiving side.
use std::ops::Range;

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use sha2::Sha256;

use mrpc_transport::{
    flags, opcode, EncryptionType, Packet, SecurityLevel, SecurityParams, SessionKey,
    CONTROL_WORDS_LEN, HEADER_LEN, SEQUENCE_WORDS,
};

/// HKDF info strings, one per direction.
const HKDF_INFO_REQUEST: &[u8] = b"mrpc-mgrp-chacha20-v2-request";
const HKDF_INFO_REPLY: &[u8] = b"mrpc-mgrp-chacha20-v2-reply";

const NONCE_LEN: usize = 12;

/// Encrypt `packet` under `params` and set the encrypted flag. No-op for
/// levels that do not encrypt.
pub fn apply(packet: &mut Packet, params: &SecurityParams) {
    if let Some(range) = scope(params.level, packet.len()) {
        transform(packet, params, range);
        packet.set_flag(flags::ENCRYPTED);
    }
}

/// Decrypt `packet` under `params` and clear the encrypted flag.
pub fn strip(packet: &mut Packet, params: &SecurityParams) {
    if let Some(range) = scope(params.level, packet.len()) {
        transform(packet, params, range);
    }
    packet.clear_flag(flags::ENCRYPTED);
}

fn scope(level: SecurityLevel, packet_len: usize) -> Option<Range<usize>> {
    match level {
        SecurityLevel::Open | SecurityLevel::AuthOnly => None,
        SecurityLevel::HeadersOnly => Some(CONTROL_WORDS_LEN..HEADER_LEN.min(packet_len)),
        SecurityLevel::Secure => Some(CONTROL_WORDS_LEN..packet_len),
    }
}

fn transform(packet: &mut Packet, params: &SecurityParams, range: Range<usize>) {
    if params.encryption == EncryptionType::CHACHA20 {
        let key = derive_key(&params.key, packet.opcode() == opcode::REPLY);
        let mut cipher = ChaCha20::new(&key.into(), &nonce(packet).into());
        let bytes = packet.bytes_mut();
        for piece in around(range, SEQUENCE_WORDS) {
            cipher.apply_keystream(&mut bytes[piece]);
        }
    } else {
        xor_in_place(&mut packet.bytes_mut()[range], &params.key);
    }
}

fn nonce(packet: &Packet) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..4].copy_from_slice(&packet.remote_handle().to_be_bytes());
    nonce[4..8].copy_from_slice(&packet.local_handle().to_be_bytes());
    nonce[8..].copy_from_slice(&packet.seq_number().to_be_bytes());
    nonce
}

/// The parts of `range` before and after `hole`, skipping empty ones.
fn around(range: Range<usize>, hole: Range<usize>) -> impl Iterator<Item = Range<usize>> {
    let before = range.start..range.end.min(hole.start);
    let after = range.start.max(hole.end)..range.end;
    [before, after].into_iter().filter(|r| r.start < r.end)
}

/// Rolling-key XOR; each pass over the key shifts it by the pass number.
fn xor_in_place(data: &mut [u8], key: &SessionKey) {
    let key = key.as_bytes();
    for (i, byte) in data.iter_mut().enumerate() {
        let pass = (i / key.len()) as u8;
        *byte ^= key[i % key.len()].wrapping_add(pass);
    }
}

/// Derive the 32-byte ChaCha20 key for one direction from a session key
/// using HKDF-SHA256.
fn derive_key(session_key: &SessionKey, reply: bool) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, session_key.as_bytes());
    let info = if reply { HKDF_INFO_REPLY } else { HKDF_INFO_REQUEST };
    let mut key = [0u8; 32];
    hkdf.expand(info, &mut key)
        .expect("HKDF-SHA256 expand to 32 bytes always succeeds");
    key
}

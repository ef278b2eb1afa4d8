//! Rewind transport codec
//!
//! Compact framed protocol: 8 byte `"REWIND01"` signature, little-endian
//! u16 type, u16 flags, u32 sequence, u16 payload length, payload. The
//! server challenges with a salt; the client authenticates with
//! `SHA-256(salt || password)` and keeps the session alive with a
//! KEEP_ALIVE every five seconds.

use sha2::{Digest, Sha256};

use crate::error::{NetError, NetResult};

pub const REWIND_SIGN: &[u8; 8] = b"REWIND01";
pub const REWIND_HEADER_LEN: usize = 8 + 2 + 2 + 4 + 2;
pub const REWIND_KEEP_ALIVE_INTERVAL_MS: u64 = 5000;

pub const REWIND_CLASS_REWIND_CONTROL: u16 = 0x0000;
pub const REWIND_CLASS_APPLICATION: u16 = 0x0900;

pub const REWIND_TYPE_KEEP_ALIVE: u16 = REWIND_CLASS_REWIND_CONTROL;
pub const REWIND_TYPE_CLOSE: u16 = REWIND_CLASS_REWIND_CONTROL + 1;
pub const REWIND_TYPE_CHALLENGE: u16 = REWIND_CLASS_REWIND_CONTROL + 2;
pub const REWIND_TYPE_AUTHENTICATION: u16 = REWIND_CLASS_REWIND_CONTROL + 3;

pub const REWIND_TYPE_CONFIGURATION: u16 = REWIND_CLASS_APPLICATION;
pub const REWIND_TYPE_SUBSCRIPTION: u16 = REWIND_CLASS_APPLICATION + 0x01;
pub const REWIND_TYPE_DMR_AUDIO_FRAME: u16 = REWIND_CLASS_APPLICATION + 0x20;
pub const REWIND_TYPE_SUPER_HEADER: u16 = REWIND_CLASS_APPLICATION + 0x28;
pub const REWIND_TYPE_FAILURE_CODE: u16 = REWIND_CLASS_APPLICATION + 0x29;

pub const REWIND_FLAG_NONE: u16 = 0;

pub const REWIND_SERVICE_SIMPLE_APPLICATION: u8 = 0x20;

pub const REWIND_OPTION_SUPER_HEADER: u32 = 1 << 0;
pub const REWIND_OPTION_LINEAR_FRAME: u32 = 1 << 1;

pub const REWIND_CALL_LENGTH: usize = 10;
pub const SHA256_DIGEST_LENGTH: usize = 32;

/// One framed Rewind datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewindFrame {
    pub frame_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl RewindFrame {
    pub fn new(frame_type: u16, seq: u32, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            flags: REWIND_FLAG_NONE,
            seq,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REWIND_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(REWIND_SIGN);
        buf.extend_from_slice(&self.frame_type.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(data: &[u8]) -> NetResult<Self> {
        if data.len() < REWIND_HEADER_LEN {
            return Err(NetError::Truncated(data.len()));
        }
        if &data[0..8] != REWIND_SIGN {
            return Err(NetError::BadSignature);
        }
        let frame_type = u16::from_le_bytes([data[8], data[9]]);
        let flags = u16::from_le_bytes([data[10], data[11]]);
        let seq = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);
        let length = u16::from_le_bytes([data[16], data[17]]) as usize;
        if data.len() < REWIND_HEADER_LEN + length {
            return Err(NetError::Truncated(data.len()));
        }
        Ok(Self {
            frame_type,
            flags,
            seq,
            payload: data[REWIND_HEADER_LEN..REWIND_HEADER_LEN + length].to_vec(),
        })
    }
}

/// `AUTHENTICATION` response payload: SHA-256 over salt then password
pub fn authentication_digest(salt: &[u8], password: &str) -> [u8; SHA256_DIGEST_LENGTH] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Client version/keep-alive payload: remote id, service id, description
pub fn version_payload(remote_id: u32, description: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + description.len());
    buf.extend_from_slice(&remote_id.to_le_bytes());
    buf.push(REWIND_SERVICE_SIMPLE_APPLICATION);
    buf.extend_from_slice(description.as_bytes());
    buf
}

/// `CONFIGURATION` payload: option flags
pub fn configuration_payload(options: u32) -> Vec<u8> {
    options.to_le_bytes().to_vec()
}

/// `SUBSCRIPTION` payload: session type and destination talkgroup
pub fn subscription_payload(session_type: u32, tg: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(&session_type.to_le_bytes());
    buf.extend_from_slice(&tg.to_le_bytes());
    buf
}

/// `SUPER_HEADER` payload sent before keyed audio
pub fn super_header_payload(
    session_type: u32,
    source_id: u32,
    destination_id: u32,
    source_call: &str,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + 2 * REWIND_CALL_LENGTH);
    buf.extend_from_slice(&session_type.to_le_bytes());
    buf.extend_from_slice(&source_id.to_le_bytes());
    buf.extend_from_slice(&destination_id.to_le_bytes());
    let mut call = [0u8; REWIND_CALL_LENGTH];
    for (i, b) in source_call.bytes().take(REWIND_CALL_LENGTH).enumerate() {
        call[i] = b;
    }
    buf.extend_from_slice(&call);
    buf.extend_from_slice(&[0u8; REWIND_CALL_LENGTH]);
    buf
}

//! USRP datagram codec
//!
//! 32 byte little-endian header: `"USRP"` signature, then sequence,
//! memory, keyup, talkgroup, type, mpxid and a reserved word. A VOICE
//! payload is 160 network-order (big-endian) 16 bit samples; a
//! header-only VOICE frame with keyup false ends a transmission. TEXT
//! frames carry either a JSON record or a TLV block whose first byte is
//! 0x08 (set-info).

use rg_core::Sample;
use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};

pub const USRP_SIGN: &[u8; 4] = b"USRP";
pub const USRP_HEADER_LEN: usize = 32;
pub const USRP_VOICE_FRAME_SAMPLES: usize = 160;

pub const USRP_TYPE_VOICE: u32 = 0;
pub const USRP_TYPE_DTMF: u32 = 1;
pub const USRP_TYPE_TEXT: u32 = 2;
pub const USRP_TYPE_PING: u32 = 3;
pub const USRP_TYPE_TLV: u32 = 4;

pub const TLV_TAG_SET_INFO: u8 = 0x08;
pub const TLV_META_MAX: usize = 306;

/// Sequence numbers wrap at 2^15
pub const USRP_SEQ_MODULO: u32 = 1 << 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsrpHeader {
    pub seq: u32,
    pub memory: u32,
    pub keyup: bool,
    pub tg: u32,
    pub frame_type: u32,
    pub mpxid: u32,
    pub reserved: u32,
}

impl UsrpHeader {
    pub fn encode(&self) -> [u8; USRP_HEADER_LEN] {
        let mut buf = [0u8; USRP_HEADER_LEN];
        buf[0..4].copy_from_slice(USRP_SIGN);
        buf[4..8].copy_from_slice(&self.seq.to_le_bytes());
        buf[8..12].copy_from_slice(&self.memory.to_le_bytes());
        buf[12..16].copy_from_slice(&(self.keyup as u32).to_le_bytes());
        buf[16..20].copy_from_slice(&self.tg.to_le_bytes());
        buf[20..24].copy_from_slice(&self.frame_type.to_le_bytes());
        buf[24..28].copy_from_slice(&self.mpxid.to_le_bytes());
        buf[28..32].copy_from_slice(&self.reserved.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> NetResult<Self> {
        if data.len() < USRP_HEADER_LEN {
            return Err(NetError::Truncated(data.len()));
        }
        if &data[0..4] != USRP_SIGN {
            return Err(NetError::BadSignature);
        }
        let word = |off: usize| {
            u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
        };
        Ok(Self {
            seq: word(4),
            memory: word(8),
            keyup: word(12) != 0,
            tg: word(16),
            frame_type: word(20),
            mpxid: word(24),
            reserved: word(28),
        })
    }
}

/// JSON-formatted TEXT metadata record
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsrpJsonMeta {
    #[serde(default)]
    pub callsign: String,
    #[serde(default)]
    pub dmr_id: u32,
    #[serde(default)]
    pub tg: u32,
}

/// Structured set-info TLV record
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UsrpTlvMeta {
    pub dmr_id: u32,
    pub rpt_id: u32,
    pub tg: u32,
    pub timeslot: u8,
    pub color_code: u8,
    pub callsign: String,
}

impl UsrpTlvMeta {
    pub fn encode(&self) -> Vec<u8> {
        let meta_bytes = self.callsign.as_bytes();
        let mut buf = Vec::with_capacity(2 + 13 + meta_bytes.len().min(TLV_META_MAX));
        buf.push(TLV_TAG_SET_INFO);
        // tag length: fixed fields plus callsign and terminator
        let body_len = 13 + meta_bytes.len().min(TLV_META_MAX) + 1;
        buf.push(body_len as u8);
        buf.extend_from_slice(&[
            (self.dmr_id >> 16) as u8,
            (self.dmr_id >> 8) as u8,
            self.dmr_id as u8,
        ]);
        buf.extend_from_slice(&self.rpt_id.to_le_bytes());
        buf.extend_from_slice(&[
            (self.tg >> 16) as u8,
            (self.tg >> 8) as u8,
            self.tg as u8,
        ]);
        buf.push(self.timeslot);
        buf.push(self.color_code);
        buf.extend_from_slice(&meta_bytes[..meta_bytes.len().min(TLV_META_MAX)]);
        buf.push(0);
        buf
    }

    pub fn decode(data: &[u8]) -> NetResult<Self> {
        if data.len() < 15 {
            return Err(NetError::Truncated(data.len()));
        }
        if data[0] != TLV_TAG_SET_INFO {
            return Err(NetError::BadPayload(format!(
                "unexpected TLV tag {:#04x}",
                data[0]
            )));
        }
        let dmr_id = ((data[2] as u32) << 16) | ((data[3] as u32) << 8) | data[4] as u32;
        let rpt_id = u32::from_le_bytes([data[5], data[6], data[7], data[8]]);
        let tg = ((data[9] as u32) << 16) | ((data[10] as u32) << 8) | data[11] as u32;
        let timeslot = data[12];
        let color_code = data[13];
        let meta = &data[14..data.len().min(14 + TLV_META_MAX)];
        let end = meta.iter().position(|&b| b == 0).unwrap_or(meta.len());
        let callsign = String::from_utf8_lossy(&meta[..end]).to_string();
        Ok(Self {
            dmr_id,
            rpt_id,
            tg,
            timeslot,
            color_code,
            callsign,
        })
    }
}

/// Decoded TEXT payload
#[derive(Debug, Clone, PartialEq)]
pub enum UsrpText {
    Json(UsrpJsonMeta),
    SetInfo(UsrpTlvMeta),
    Plain(String),
}

/// A whole decoded datagram
#[derive(Debug, Clone, PartialEq)]
pub enum UsrpFrame {
    Voice {
        header: UsrpHeader,
        samples: Vec<Sample>,
    },
    /// Header-only VOICE frame; with keyup false this ends a transmission
    VoiceEnd {
        header: UsrpHeader,
    },
    Text {
        header: UsrpHeader,
        text: UsrpText,
    },
    Ping {
        header: UsrpHeader,
    },
    Dtmf {
        header: UsrpHeader,
        digits: String,
    },
    Tlv {
        header: UsrpHeader,
        data: Vec<u8>,
    },
}

impl UsrpFrame {
    pub fn decode(data: &[u8]) -> NetResult<Self> {
        let header = UsrpHeader::decode(data)?;
        let payload = &data[USRP_HEADER_LEN..];
        match header.frame_type {
            USRP_TYPE_VOICE => {
                if payload.is_empty() {
                    return Ok(Self::VoiceEnd { header });
                }
                if payload.len() < USRP_VOICE_FRAME_SAMPLES * 2 {
                    return Err(NetError::Truncated(data.len()));
                }
                let samples = payload[..USRP_VOICE_FRAME_SAMPLES * 2]
                    .chunks_exact(2)
                    .map(|c| i16::from_be_bytes([c[0], c[1]]))
                    .collect();
                Ok(Self::Voice { header, samples })
            }
            USRP_TYPE_TEXT => {
                let text = if payload.first() == Some(&TLV_TAG_SET_INFO) {
                    UsrpText::SetInfo(UsrpTlvMeta::decode(payload)?)
                } else {
                    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
                    let s = String::from_utf8_lossy(&payload[..end]).to_string();
                    match serde_json::from_str::<UsrpJsonMeta>(&s) {
                        Ok(meta) => UsrpText::Json(meta),
                        Err(_) => UsrpText::Plain(s),
                    }
                };
                Ok(Self::Text { header, text })
            }
            USRP_TYPE_PING => Ok(Self::Ping { header }),
            USRP_TYPE_DTMF => {
                let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
                Ok(Self::Dtmf {
                    header,
                    digits: String::from_utf8_lossy(&payload[..end]).to_string(),
                })
            }
            USRP_TYPE_TLV => Ok(Self::Tlv {
                header,
                data: payload.to_vec(),
            }),
            other => Err(NetError::UnexpectedType(other as u16)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Voice { header, samples } => {
                let mut buf = Vec::with_capacity(USRP_HEADER_LEN + samples.len() * 2);
                buf.extend_from_slice(&header.encode());
                for s in samples {
                    buf.extend_from_slice(&s.to_be_bytes());
                }
                buf
            }
            Self::VoiceEnd { header } | Self::Ping { header } => header.encode().to_vec(),
            Self::Text { header, text } => {
                let mut buf = header.encode().to_vec();
                match text {
                    UsrpText::SetInfo(meta) => buf.extend_from_slice(&meta.encode()),
                    UsrpText::Json(meta) => {
                        buf.extend_from_slice(
                            serde_json::to_string(meta).unwrap_or_default().as_bytes(),
                        );
                        buf.push(0);
                    }
                    UsrpText::Plain(s) => {
                        buf.extend_from_slice(s.as_bytes());
                        buf.push(0);
                    }
                }
                buf
            }
            Self::Dtmf { header, digits } => {
                let mut buf = header.encode().to_vec();
                buf.extend_from_slice(digits.as_bytes());
                buf.push(0);
                buf
            }
            Self::Tlv { header, data } => {
                let mut buf = header.encode().to_vec();
                buf.extend_from_slice(data);
                buf
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let hdr = UsrpHeader {
            seq: 1234,
            memory: 0,
            keyup: true,
            tg: 91,
            frame_type: USRP_TYPE_VOICE,
            mpxid: 0,
            reserved: 0,
        };
        let bytes = hdr.encode();
        assert_eq!(&bytes[0..4], b"USRP");
        assert_eq!(UsrpHeader::decode(&bytes).unwrap(), hdr);
    }

    #[test]
    fn test_bad_signature_rejected() {
        let mut bytes = UsrpHeader::default().encode();
        bytes[0] = b'X';
        assert!(matches!(
            UsrpHeader::decode(&bytes),
            Err(NetError::BadSignature)
        ));
    }

    #[test]
    fn test_header_only_voice_is_end_of_transmission() {
        let hdr = UsrpHeader {
            frame_type: USRP_TYPE_VOICE,
            keyup: false,
            ..Default::default()
        };
        let frame = UsrpFrame::decode(&hdr.encode()).unwrap();
        assert!(matches!(frame, UsrpFrame::VoiceEnd { header } if !header.keyup));
    }

    #[test]
    fn test_voice_payload_is_big_endian() {
        let hdr = UsrpHeader {
            frame_type: USRP_TYPE_VOICE,
            keyup: true,
            ..Default::default()
        };
        let samples: Vec<Sample> = (0..160).map(|i| i as Sample - 80).collect();
        let frame = UsrpFrame::Voice {
            header: hdr,
            samples: samples.clone(),
        };
        let bytes = frame.encode();
        assert_eq!(bytes.len(), 32 + 320);
        // Sample 0 is -80: big-endian on the wire
        assert_eq!(&bytes[32..34], &(-80i16).to_be_bytes());
        match UsrpFrame::decode(&bytes).unwrap() {
            UsrpFrame::Voice { samples: got, .. } => assert_eq!(got, samples),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_tlv_set_info_roundtrip() {
        let meta = UsrpTlvMeta {
            dmr_id: 2400123,
            rpt_id: 240012301,
            tg: 2405,
            timeslot: 2,
            color_code: 1,
            callsign: "SM0ABC".into(),
        };
        let hdr = UsrpHeader {
            frame_type: USRP_TYPE_TEXT,
            ..Default::default()
        };
        let frame = UsrpFrame::Text {
            header: hdr,
            text: UsrpText::SetInfo(meta.clone()),
        };
        let bytes = frame.encode();
        assert_eq!(bytes[32], TLV_TAG_SET_INFO);
        match UsrpFrame::decode(&bytes).unwrap() {
            UsrpFrame::Text { text: UsrpText::SetInfo(got), .. } => assert_eq!(got, meta),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_json_text_roundtrip() {
        let meta = UsrpJsonMeta {
            callsign: "SM0XYZ".into(),
            dmr_id: 2400001,
            tg: 91,
        };
        let frame = UsrpFrame::Text {
            header: UsrpHeader {
                frame_type: USRP_TYPE_TEXT,
                ..Default::default()
            },
            text: UsrpText::Json(meta.clone()),
        };
        match UsrpFrame::decode(&frame.encode()).unwrap() {
            UsrpFrame::Text { text: UsrpText::Json(got), .. } => assert_eq!(got, meta),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_truncated_voice_rejected() {
        let hdr = UsrpHeader {
            frame_type: USRP_TYPE_VOICE,
            ..Default::default()
        };
        let mut bytes = hdr.encode().to_vec();
        bytes.extend_from_slice(&[0u8; 100]);
        assert!(matches!(
            UsrpFrame::decode(&bytes),
            Err(NetError::Truncated(_))
        ));
    }
}

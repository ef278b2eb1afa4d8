//! USRP reflector logic
//!
//! Bridges a logic to a USRP-speaking reflector over UDP. The socket is
//! owned by the event loop; this logic consumes decoded datagrams and
//! queues encoded ones. Every outgoing transmission starts with exactly
//! one metadata TEXT frame and ends with a header-only VOICE frame with
//! keyup false.

use std::collections::VecDeque;

use rg_core::{RxEvent, Sample};
use rg_logic::{Logic, LogicCore};

use crate::bridge::{DEFAULT_FLUSH_TIMEOUT_MS, NetBridge};
use crate::usrp::{
    USRP_SEQ_MODULO, USRP_TYPE_TEXT, USRP_TYPE_VOICE, USRP_VOICE_FRAME_SAMPLES, UsrpFrame,
    UsrpHeader, UsrpText, UsrpTlvMeta,
};

pub struct UsrpLogic {
    core: LogicCore,
    bridge: NetBridge,
    outgoing: VecDeque<Vec<u8>>,

    tx_seq: u32,
    tx_active: bool,
    tx_buffer: Vec<Sample>,
    tx_flush_pending: bool,
    rx_active: bool,
    rx_stream_open: bool,

    default_tg: u32,
    dmr_id: u32,
    rpt_id: u32,
    timeslot: u8,
    color_code: u8,
}

impl UsrpLogic {
    pub fn new(core: LogicCore) -> Self {
        Self {
            core,
            bridge: NetBridge::new(
                USRP_VOICE_FRAME_SAMPLES,
                1000,
                30000,
                32000,
                DEFAULT_FLUSH_TIMEOUT_MS,
            ),
            outgoing: VecDeque::new(),
            tx_seq: 0,
            tx_active: false,
            tx_buffer: Vec::new(),
            tx_flush_pending: false,
            rx_active: false,
            rx_stream_open: false,
            default_tg: 0,
            dmr_id: 0,
            rpt_id: 0,
            timeslot: 0,
            color_code: 1,
        }
    }

    pub fn initialize(&mut self, now_ms: u64) -> rg_core::CoreResult<()> {
        {
            let cfg = self.core.config().clone();
            let cfg = cfg.lock();
            let name = self.core.name();
            self.default_tg = cfg.get_or(name, "DEFAULT_TG", 0)?;
            self.dmr_id = cfg.get_or(name, "DMR_ID", 0)?;
            self.rpt_id = cfg.get_or(name, "RPT_ID", 0)?;
            self.timeslot = cfg.get_or(name, "TIMESLOT", 2)?;
            self.color_code = cfg.get_or(name, "COLOR_CODE", 1)?;
        }
        self.core.initialize(now_ms)?;
        // Far end audio enters as receiver audio and fans out to the
        // connected logics
        self.core.set_rx_valve_open(true);
        Ok(())
    }

    /// Datagrams queued for the reflector
    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        self.outgoing.drain(..).collect()
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.tx_seq;
        self.tx_seq = (self.tx_seq + 1) % USRP_SEQ_MODULO;
        seq
    }

    fn current_tg(&self) -> u32 {
        match self.core.received_tg() {
            0 => self.default_tg,
            tg => tg,
        }
    }

    fn send_metadata(&mut self) {
        let meta = UsrpTlvMeta {
            dmr_id: self.dmr_id,
            rpt_id: self.rpt_id,
            tg: self.current_tg(),
            timeslot: self.timeslot,
            color_code: self.color_code,
            callsign: self.core.callsign().to_string(),
        };
        let header = UsrpHeader {
            seq: self.next_seq(),
            frame_type: USRP_TYPE_TEXT,
            tg: self.current_tg(),
            ..Default::default()
        };
        self.outgoing
            .push_back(UsrpFrame::Text { header, text: UsrpText::SetInfo(meta) }.encode());
    }

    fn send_voice_frame(&mut self, samples: Vec<Sample>) {
        let header = UsrpHeader {
            seq: self.next_seq(),
            keyup: true,
            tg: self.current_tg(),
            frame_type: USRP_TYPE_VOICE,
            ..Default::default()
        };
        self.outgoing
            .push_back(UsrpFrame::Voice { header, samples }.encode());
    }

    fn send_end_of_transmission(&mut self) {
        let header = UsrpHeader {
            seq: self.next_seq(),
            keyup: false,
            tg: self.current_tg(),
            frame_type: USRP_TYPE_VOICE,
            ..Default::default()
        };
        self.outgoing.push_back(UsrpFrame::VoiceEnd { header }.encode());
    }

    /// A datagram arrived from the reflector
    pub fn datagram_received(&mut self, data: &[u8], now_ms: u64) {
        let frame = match UsrpFrame::decode(data) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("{}: dropping bad USRP frame: {e}", self.core.name());
                return;
            }
        };
        match frame {
            UsrpFrame::Voice { header, samples } => {
                if !self.rx_active {
                    self.rx_active = true;
                    self.core.publish_state_event("usrp_rx", "1");
                }
                if header.tg != 0 {
                    self.core.set_received_tg(header.tg);
                }
                self.bridge.write_net(&samples, now_ms);
            }
            UsrpFrame::VoiceEnd { .. } => {
                if self.rx_active {
                    self.rx_active = false;
                    self.core.publish_state_event("usrp_rx", "0");
                    self.bridge.end_of_stream();
                }
            }
            UsrpFrame::Text { text, .. } => match text {
                UsrpText::SetInfo(meta) => {
                    if meta.tg != 0 {
                        self.core.set_received_tg(meta.tg);
                    }
                    self.core
                        .process_event(&format!("talker_start {}", meta.callsign), now_ms);
                }
                UsrpText::Json(meta) => {
                    if meta.tg != 0 {
                        self.core.set_received_tg(meta.tg);
                    }
                    self.core
                        .process_event(&format!("talker_start {}", meta.callsign), now_ms);
                }
                UsrpText::Plain(s) => {
                    log::info!("{}: reflector says: {s}", self.core.name());
                }
            },
            UsrpFrame::Ping { header } => {
                // Reflectors expect their pings echoed
                self.outgoing
                    .push_back(UsrpFrame::Ping { header }.encode());
            }
            UsrpFrame::Dtmf { digits, .. } => {
                self.core.inject_dtmf_digits(&digits, 100, now_ms);
            }
            UsrpFrame::Tlv { .. } => {}
        }
    }
}

impl Logic for UsrpLogic {
    fn core(&self) -> &LogicCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LogicCore {
        &mut self.core
    }

    fn handle_rx_event(&mut self, _ev: &RxEvent, _now_ms: u64) -> bool {
        false
    }

    /// Audio from the connected logics is what goes out on the wire
    fn link_audio_in(&mut self, samples: &[Sample], _now_ms: u64) {
        self.core.write_link_in(samples);
        self.tx_buffer.extend_from_slice(samples);
        self.tx_flush_pending = false;
    }

    fn link_audio_flush(&mut self, _now_ms: u64) {
        self.core.flush_link_in();
        if self.tx_active || !self.tx_buffer.is_empty() {
            self.tx_flush_pending = true;
        }
    }

    fn tick(&mut self, now_ms: u64) {
        // Network → logic graph, through the receiver path
        let timed_out = self.bridge.tick(now_ms);
        if timed_out {
            self.rx_active = false;
            self.core.publish_state_event("usrp_rx", "0");
        }
        let audio = self.bridge.take_audio();
        if !audio.is_empty() {
            self.rx_stream_open = true;
            self.core.write_rx_audio(&audio);
        }
        if self.rx_stream_open && self.bridge.stream_done() {
            self.rx_stream_open = false;
            self.core.flush_rx_audio();
        }

        // Logic → network, 160 samples per frame with one leading
        // metadata frame per transmission
        while self.tx_buffer.len() >= USRP_VOICE_FRAME_SAMPLES {
            if !self.tx_active {
                self.tx_active = true;
                self.send_metadata();
            }
            let frame: Vec<Sample> = self
                .tx_buffer
                .drain(..USRP_VOICE_FRAME_SAMPLES)
                .collect();
            self.send_voice_frame(frame);
        }
        if self.tx_flush_pending {
            if !self.tx_buffer.is_empty() {
                if !self.tx_active {
                    self.tx_active = true;
                    self.send_metadata();
                }
                let mut frame = std::mem::take(&mut self.tx_buffer);
                frame.resize(USRP_VOICE_FRAME_SAMPLES, 0);
                self.send_voice_frame(frame);
            }
            if self.tx_active {
                self.send_end_of_transmission();
            }
            self.tx_active = false;
            self.tx_flush_pending = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usrp::USRP_HEADER_LEN;
    use crate::testsupport::{TestEngine, core_with_config};

    fn usrp_logic(extra: &str) -> UsrpLogic {
        let ini = format!("[NetLogic]\n{extra}");
        let (core, _) = core_with_config("NetLogic", &ini, TestEngine::new());
        let mut logic = UsrpLogic::new(core);
        logic.initialize(0).unwrap();
        logic
    }

    fn voice_datagram(tg: u32, keyup: bool, fill: Sample) -> Vec<u8> {
        UsrpFrame::Voice {
            header: UsrpHeader {
                keyup,
                tg,
                frame_type: USRP_TYPE_VOICE,
                ..Default::default()
            },
            samples: vec![fill; USRP_VOICE_FRAME_SAMPLES],
        }
        .encode()
    }

    #[test]
    fn test_incoming_voice_reaches_link_and_sets_tg() {
        let mut logic = usrp_logic("");
        logic.datagram_received(&voice_datagram(2405, true, 3), 0);
        logic.tick(0);
        assert_eq!(logic.core().received_tg(), 2405);
        // Far end audio took the receiver path and fanned out towards
        // the connected logics
        logic.core_mut().tick(0);
        assert!(!logic.core_mut().take_link_out().is_empty());
    }

    #[test]
    fn test_outgoing_transmission_framing() {
        let mut logic = usrp_logic("DEFAULT_TG=91\nDMR_ID=2400123\n");
        // Audio from the connected logics is framed onto the wire
        logic.link_audio_in(&[7; 400], 0);
        logic.core_mut().tick(0);
        logic.tick(0);
        logic.link_audio_flush(10);
        logic.core_mut().tick(10);
        logic.tick(10);

        let frames = logic.take_outgoing();
        assert!(frames.len() >= 3, "got {} frames", frames.len());
        // First frame of the transmission is the metadata TEXT
        let first = UsrpHeader::decode(&frames[0]).unwrap();
        assert_eq!(first.frame_type, USRP_TYPE_TEXT);
        // Then voice, then the header-only trailer with keyup=0
        let second = UsrpHeader::decode(&frames[1]).unwrap();
        assert_eq!(second.frame_type, USRP_TYPE_VOICE);
        assert!(second.keyup);
        let last = &frames[frames.len() - 1];
        assert_eq!(last.len(), USRP_HEADER_LEN);
        let trailer = UsrpHeader::decode(last).unwrap();
        assert!(!trailer.keyup);
        // Exactly one TEXT frame per transmission
        let text_frames = frames
            .iter()
            .filter(|f| UsrpHeader::decode(f).unwrap().frame_type == USRP_TYPE_TEXT)
            .count();
        assert_eq!(text_frames, 1);
    }

    #[test]
    fn test_sequence_wraps_mod_2_pow_15() {
        let mut logic = usrp_logic("");
        logic.tx_seq = USRP_SEQ_MODULO - 1;
        assert_eq!(logic.next_seq(), USRP_SEQ_MODULO - 1);
        assert_eq!(logic.next_seq(), 0);
    }

    #[test]
    fn test_ping_echoed() {
        let mut logic = usrp_logic("");
        let ping = UsrpFrame::Ping {
            header: UsrpHeader {
                frame_type: crate::usrp::USRP_TYPE_PING,
                ..Default::default()
            },
        }
        .encode();
        logic.datagram_received(&ping, 0);
        let out = logic.take_outgoing();
        assert_eq!(out, vec![ping]);
    }

    #[test]
    fn test_bad_datagram_dropped() {
        let mut logic = usrp_logic("");
        logic.datagram_received(b"garbage", 0);
        logic.datagram_received(&[0u8; 32], 0);
        assert!(logic.take_outgoing().is_empty());
    }
}

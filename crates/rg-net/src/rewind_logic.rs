//! Rewind reflector logic
//!
//! Client side of a Rewind session: answer the server's challenge with
//! the salted password digest, subscribe to the configured talkgroup and
//! keep the session alive every five seconds. Audio frames are bridged
//! to the logic's link pipes; a missed-keep-alive window tears the
//! session down and starts over.

use std::collections::VecDeque;

use rg_core::{Sample, Timer};
use rg_logic::{Logic, LogicCore};

use crate::bridge::{DEFAULT_FLUSH_TIMEOUT_MS, NetBridge};
use crate::error::NetResult;
use crate::rewind::{
    REWIND_KEEP_ALIVE_INTERVAL_MS, REWIND_OPTION_LINEAR_FRAME, REWIND_OPTION_SUPER_HEADER,
    REWIND_TYPE_AUTHENTICATION, REWIND_TYPE_CHALLENGE, REWIND_TYPE_CLOSE,
    REWIND_TYPE_CONFIGURATION, REWIND_TYPE_DMR_AUDIO_FRAME, REWIND_TYPE_FAILURE_CODE,
    REWIND_TYPE_KEEP_ALIVE, REWIND_TYPE_SUBSCRIPTION, REWIND_TYPE_SUPER_HEADER, RewindFrame,
    authentication_digest, configuration_payload, subscription_payload, super_header_payload,
    version_payload,
};

const AUDIO_FRAME_SAMPLES: usize = 160;
const MISSED_KEEP_ALIVE_LIMIT: u32 = 3;
const SESSION_TYPE_GROUP_VOICE: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    WaitingChallenge,
    Authenticating,
    Connected,
}

pub struct RewindLogic {
    core: LogicCore,
    bridge: NetBridge,
    outgoing: VecDeque<Vec<u8>>,

    state: SessionState,
    password: String,
    remote_id: u32,
    tg: u32,
    seq: u32,
    keep_alive_timer: Timer,
    last_rx_ms: u64,
    tx_active: bool,
    tx_buffer: Vec<Sample>,
    tx_flush_pending: bool,
    rx_stream_open: bool,
}

impl RewindLogic {
    pub fn new(core: LogicCore) -> Self {
        Self {
            core,
            bridge: NetBridge::new(
                AUDIO_FRAME_SAMPLES,
                1000,
                30000,
                32000,
                DEFAULT_FLUSH_TIMEOUT_MS,
            ),
            outgoing: VecDeque::new(),
            state: SessionState::Disconnected,
            password: String::new(),
            remote_id: 0,
            tg: 0,
            seq: 0,
            keep_alive_timer: Timer::periodic(REWIND_KEEP_ALIVE_INTERVAL_MS),
            last_rx_ms: 0,
            tx_active: false,
            tx_buffer: Vec::new(),
            tx_flush_pending: false,
            rx_stream_open: false,
        }
    }

    pub fn initialize(&mut self, now_ms: u64) -> rg_core::CoreResult<()> {
        {
            let cfg = self.core.config().clone();
            let cfg = cfg.lock();
            let name = self.core.name();
            self.password = cfg.get_required(name, "AUTH_KEY")?;
            self.remote_id = cfg.get_or(name, "REMOTE_ID", 0)?;
            self.tg = cfg.get_or(name, "DEFAULT_TG", 0)?;
        }
        self.core.initialize(now_ms)?;
        self.core.set_rx_valve_open(true);
        self.start_session(now_ms);
        Ok(())
    }

    pub fn session_state(&self) -> SessionState {
        self.state
    }

    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        self.outgoing.drain(..).collect()
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    fn send(&mut self, frame_type: u16, payload: Vec<u8>) {
        let seq = self.next_seq();
        self.outgoing
            .push_back(RewindFrame::new(frame_type, seq, payload).encode());
    }

    fn send_keep_alive(&mut self) {
        let payload = version_payload(self.remote_id, "RigForge");
        self.send(REWIND_TYPE_KEEP_ALIVE, payload);
    }

    fn start_session(&mut self, now_ms: u64) {
        self.state = SessionState::WaitingChallenge;
        self.last_rx_ms = now_ms;
        self.send_keep_alive();
        self.keep_alive_timer.start(now_ms);
    }

    /// A datagram arrived from the server
    pub fn datagram_received(&mut self, data: &[u8], now_ms: u64) {
        let frame = match RewindFrame::decode(data) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("{}: dropping bad Rewind frame: {e}", self.core.name());
                return;
            }
        };
        self.last_rx_ms = now_ms;

        match frame.frame_type {
            REWIND_TYPE_CHALLENGE => {
                let digest = authentication_digest(&frame.payload, &self.password);
                self.send(REWIND_TYPE_AUTHENTICATION, digest.to_vec());
                self.state = SessionState::Authenticating;
            }
            REWIND_TYPE_KEEP_ALIVE => {
                if self.state == SessionState::Authenticating {
                    // Authentication accepted: configure and subscribe
                    let options = REWIND_OPTION_SUPER_HEADER | REWIND_OPTION_LINEAR_FRAME;
                    self.send(REWIND_TYPE_CONFIGURATION, configuration_payload(options));
                    self.send(
                        REWIND_TYPE_SUBSCRIPTION,
                        subscription_payload(SESSION_TYPE_GROUP_VOICE, self.tg),
                    );
                    self.state = SessionState::Connected;
                    log::info!("{}: Rewind session established", self.core.name());
                    self.core.publish_state_event("rewind_session", "1");
                    self.core.process_event("reflector_connected", now_ms);
                }
            }
            REWIND_TYPE_FAILURE_CODE => {
                log::error!(
                    "*** ERROR: {}: Rewind server reported failure",
                    self.core.name()
                );
                self.close_session(now_ms);
            }
            REWIND_TYPE_CLOSE => {
                log::info!("{}: Rewind server closed the session", self.core.name());
                self.close_session(now_ms);
            }
            REWIND_TYPE_DMR_AUDIO_FRAME => {
                let samples: Vec<Sample> = frame
                    .payload
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]]))
                    .collect();
                self.bridge.write_net(&samples, now_ms);
            }
            REWIND_TYPE_SUPER_HEADER => {
                if frame.payload.len() >= 12 {
                    let tg = u32::from_le_bytes([
                        frame.payload[8],
                        frame.payload[9],
                        frame.payload[10],
                        frame.payload[11],
                    ]);
                    if tg != 0 {
                        self.core.set_received_tg(tg);
                    }
                }
            }
            other => {
                log::debug!("{}: unhandled Rewind type {other:#06x}", self.core.name());
            }
        }
    }

    fn close_session(&mut self, now_ms: u64) {
        if self.state == SessionState::Connected {
            self.core.publish_state_event("rewind_session", "0");
            self.core.process_event("reflector_disconnected", now_ms);
        }
        self.state = SessionState::Disconnected;
        self.bridge.clear();
    }

    fn send_audio_frame(&mut self, samples: &[Sample]) {
        let mut payload = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            payload.extend_from_slice(&s.to_le_bytes());
        }
        self.send(REWIND_TYPE_DMR_AUDIO_FRAME, payload);
    }

    /// Reconnect support for the event loop
    pub fn reconnect(&mut self, now_ms: u64) -> NetResult<()> {
        self.start_session(now_ms);
        Ok(())
    }
}

impl Logic for RewindLogic {
    fn core(&self) -> &LogicCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LogicCore {
        &mut self.core
    }

    fn next_deadline(&self) -> Option<u64> {
        self.keep_alive_timer.deadline()
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
        // Keep-alive cadence, in any state once started
        if self.state != SessionState::Disconnected && self.keep_alive_timer.poll(now_ms) {
            self.send_keep_alive();
        }

        // Missed keep-alives close the session and start over
        if self.state == SessionState::Connected
            && now_ms.saturating_sub(self.last_rx_ms)
                > REWIND_KEEP_ALIVE_INTERVAL_MS * MISSED_KEEP_ALIVE_LIMIT as u64
        {
            log::warn!(
                "*** WARNING: {}: Rewind server stopped answering, reconnecting",
                self.core.name()
            );
            self.close_session(now_ms);
            self.start_session(now_ms);
        }

        // Network → logic graph, through the receiver path
        self.bridge.tick(now_ms);
        let audio = self.bridge.take_audio();
        if !audio.is_empty() {
            self.rx_stream_open = true;
            self.core.write_rx_audio(&audio);
        }
        if self.rx_stream_open && self.bridge.stream_done() {
            self.rx_stream_open = false;
            self.core.flush_rx_audio();
        }

        // Logic → network
        if self.state == SessionState::Connected {
            while self.tx_buffer.len() >= AUDIO_FRAME_SAMPLES {
                if !self.tx_active {
                    self.tx_active = true;
                    let payload = super_header_payload(
                        SESSION_TYPE_GROUP_VOICE,
                        self.remote_id,
                        self.tg,
                        &self.core.callsign().to_string(),
                    );
                    self.send(REWIND_TYPE_SUPER_HEADER, payload);
                }
                let frame: Vec<Sample> =
                    self.tx_buffer.drain(..AUDIO_FRAME_SAMPLES).collect();
                self.send_audio_frame(&frame);
            }
            if self.tx_flush_pending {
                if !self.tx_buffer.is_empty() {
                    if !self.tx_active {
                        self.tx_active = true;
                        let payload = super_header_payload(
                            SESSION_TYPE_GROUP_VOICE,
                            self.remote_id,
                            self.tg,
                            &self.core.callsign().to_string(),
                        );
                        self.send(REWIND_TYPE_SUPER_HEADER, payload);
                    }
                    let mut frame = std::mem::take(&mut self.tx_buffer);
                    frame.resize(AUDIO_FRAME_SAMPLES, 0);
                    self.send_audio_frame(&frame);
                }
                self.tx_active = false;
                self.tx_flush_pending = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::{TestEngine, core_with_config};

    fn rewind_logic() -> RewindLogic {
        let (core, _) = core_with_config(
            "ReflectorLogic",
            "[ReflectorLogic]\nAUTH_KEY=test\nREMOTE_ID=2400123\nDEFAULT_TG=91\n",
            TestEngine::new(),
        );
        let mut logic = RewindLogic::new(core);
        logic.initialize(0).unwrap();
        logic
    }

    fn server_frame(frame_type: u16, payload: &[u8]) -> Vec<u8> {
        RewindFrame::new(frame_type, 1, payload.to_vec()).encode()
    }

    #[test]
    fn test_challenge_answered_with_salted_digest() {
        let mut logic = rewind_logic();
        // The client opens with a keep-alive
        let opening = logic.take_outgoing();
        assert_eq!(opening.len(), 1);
        let first = RewindFrame::decode(&opening[0]).unwrap();
        assert_eq!(first.frame_type, REWIND_TYPE_KEEP_ALIVE);

        logic.datagram_received(&server_frame(REWIND_TYPE_CHALLENGE, b"ABCDEFGH"), 10);
        assert_eq!(logic.session_state(), SessionState::Authenticating);
        let out = logic.take_outgoing();
        assert_eq!(out.len(), 1);
        let auth = RewindFrame::decode(&out[0]).unwrap();
        assert_eq!(auth.frame_type, REWIND_TYPE_AUTHENTICATION);
        assert_eq!(
            auth.payload,
            authentication_digest(b"ABCDEFGH", "test").to_vec()
        );
    }

    #[test]
    fn test_subscription_after_auth_ack() {
        let mut logic = rewind_logic();
        logic.datagram_received(&server_frame(REWIND_TYPE_CHALLENGE, b"SALT0000"), 10);
        logic.take_outgoing();
        logic.datagram_received(&server_frame(REWIND_TYPE_KEEP_ALIVE, &[]), 20);
        assert_eq!(logic.session_state(), SessionState::Connected);

        let out = logic.take_outgoing();
        let types: Vec<u16> = out
            .iter()
            .map(|f| RewindFrame::decode(f).unwrap().frame_type)
            .collect();
        assert_eq!(
            types,
            vec![REWIND_TYPE_CONFIGURATION, REWIND_TYPE_SUBSCRIPTION]
        );
        let sub = RewindFrame::decode(&out[1]).unwrap();
        assert_eq!(&sub.payload[4..8], &91u32.to_le_bytes());
    }

    #[test]
    fn test_keep_alive_every_five_seconds() {
        let mut logic = rewind_logic();
        logic.take_outgoing();
        logic.tick(4_999);
        assert!(logic.take_outgoing().is_empty());
        logic.tick(5_000);
        let out = logic.take_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(
            RewindFrame::decode(&out[0]).unwrap().frame_type,
            REWIND_TYPE_KEEP_ALIVE
        );
        logic.datagram_received(&server_frame(REWIND_TYPE_KEEP_ALIVE, &[]), 5_100);
        logic.tick(10_000);
        assert_eq!(logic.take_outgoing().len(), 1);
    }

    #[test]
    fn test_missed_keep_alives_reconnect() {
        let mut logic = rewind_logic();
        logic.datagram_received(&server_frame(REWIND_TYPE_CHALLENGE, b"SALT0000"), 0);
        logic.datagram_received(&server_frame(REWIND_TYPE_KEEP_ALIVE, &[]), 10);
        assert_eq!(logic.session_state(), SessionState::Connected);
        logic.take_outgoing();

        logic.tick(16_000); // > 3 missed keep-alive intervals
        assert_eq!(logic.session_state(), SessionState::WaitingChallenge);
    }

    #[test]
    fn test_audio_frame_bridged_to_logic() {
        let mut logic = rewind_logic();
        let samples: Vec<u8> = std::iter::repeat_n(5i16.to_le_bytes(), 160)
            .flatten()
            .collect();
        logic.datagram_received(&server_frame(REWIND_TYPE_DMR_AUDIO_FRAME, &samples), 0);
        logic.tick(0);
        logic.core_mut().tick(0);
        // Far end audio fans out towards the connected logics
        assert!(!logic.core_mut().take_link_out().is_empty());
    }

    #[test]
    fn test_super_header_sets_received_tg() {
        let mut logic = rewind_logic();
        let payload = super_header_payload(SESSION_TYPE_GROUP_VOICE, 1234, 2405, "SM0ABC");
        logic.datagram_received(&server_frame(REWIND_TYPE_SUPER_HEADER, &payload), 0);
        assert_eq!(logic.core().received_tg(), 2405);
    }
}

//! Analog phone logic
//!
//! Bridges a phone line to the RF side through an AT-command voice modem
//! on a serial port. The serial driver is an external collaborator; this
//! logic owns the modem command sequencing, ring handling, busy-tone
//! detection, deferred hangup and PIN authentication.

use std::collections::HashMap;

use rg_core::{RxEvent, Timer, TxCtrlMode, earliest_deadline};

use crate::Logic;
use crate::logic::LogicCore;

/// Serial port seam towards the modem
pub trait SerialLine: Send {
    fn write_line(&mut self, line: &str) -> std::io::Result<()>;
}

/// Inert serial port for builds without a modem driver
#[derive(Default)]
pub struct NullSerial;

impl SerialLine for NullSerial {
    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        log::debug!("null serial discards: {line}");
        Ok(())
    }
}

/// Classified modem replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModemReply {
    Ok,
    Ringing,
    Busy,
    NoCarrier,
    NoDialtone,
    Error,
    Connect,
    Vcon,
    Other(String),
}

pub fn classify_reply(line: &str) -> ModemReply {
    let line = line.trim();
    match line {
        "OK" => ModemReply::Ok,
        "RING" | "RINGING" => ModemReply::Ringing,
        "BUSY" => ModemReply::Busy,
        "NO CARRIER" => ModemReply::NoCarrier,
        "NO DIALTONE" | "NO DIAL TONE" => ModemReply::NoDialtone,
        "ERROR" => ModemReply::Error,
        "VCON" => ModemReply::Vcon,
        _ if line.starts_with("CONNECT") => ModemReply::Connect,
        other => ModemReply::Other(other.to_string()),
    }
}

/// Modem/line sequencing state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Down,
    Resetting,
    Initializing,
    EnteringVoiceMode,
    Idle,
    Incoming,
    Dialing,
    Up,
    HangingUp,
}

const MAX_DEFERRED_HANGUPS: u32 = 4;
const AUTH_SETTLE_MS: u64 = 1500;

pub struct AnalogPhoneLogic {
    core: LogicCore,
    serial: Box<dyn SerialLine>,
    state: LineState,

    cmd_reset: String,
    cmd_init: String,
    cmd_voice: String,
    cmd_pickup: String,
    cmd_hangup: String,
    cmd_dial: String,

    response_timer: Timer,
    vcon_timer: Timer,
    auth_timer: Timer,
    settle_timer: Timer,
    hangup_retry_timer: Timer,

    rings: u32,
    max_rings: u32,
    voice_ok: bool,
    phone_up: bool,
    hangup_count: u32,

    busy_tone_min_ms: u64,
    busy_tone_max_ms: u64,
    busy_pulses: u32,

    auth_required: bool,
    auth_active: bool,
    auth_pins: HashMap<String, String>,
    authed_user: Option<String>,
    pin_buffer: String,
}

impl AnalogPhoneLogic {
    pub fn new(core: LogicCore, serial: Box<dyn SerialLine>) -> Self {
        Self {
            core,
            serial,
            state: LineState::Down,
            cmd_reset: "ATZ".into(),
            cmd_init: "AT&F".into(),
            cmd_voice: "AT+FCLASS=8".into(),
            cmd_pickup: "AT+VLS=1".into(),
            cmd_hangup: "ATH0".into(),
            cmd_dial: "ATD".into(),
            response_timer: Timer::one_shot(5000),
            vcon_timer: Timer::one_shot(30_000),
            auth_timer: Timer::one_shot(10_000),
            settle_timer: Timer::one_shot(AUTH_SETTLE_MS),
            hangup_retry_timer: Timer::one_shot(1000),
            rings: 0,
            max_rings: 2,
            voice_ok: false,
            phone_up: false,
            hangup_count: 0,
            busy_tone_min_ms: 400,
            busy_tone_max_ms: 600,
            busy_pulses: 0,
            auth_required: false,
            auth_active: false,
            auth_pins: HashMap::new(),
            authed_user: None,
            pin_buffer: String::new(),
        }
    }

    pub fn initialize(&mut self, now_ms: u64) -> rg_core::CoreResult<()> {
        {
            let cfg = self.core.config().clone();
            let cfg = cfg.lock();
            let name = self.core.name();
            if let Some(v) = cfg.value(name, "MODEM_RESET_CMD") {
                self.cmd_reset = v.to_string();
            }
            if let Some(v) = cfg.value(name, "MODEM_INIT_CMD") {
                self.cmd_init = v.to_string();
            }
            if let Some(v) = cfg.value(name, "MODEM_VOICE_CMD") {
                self.cmd_voice = v.to_string();
            }
            if let Some(v) = cfg.value(name, "MODEM_PICKUP_CMD") {
                self.cmd_pickup = v.to_string();
            }
            if let Some(v) = cfg.value(name, "MODEM_HANGUP_CMD") {
                self.cmd_hangup = v.to_string();
            }
            if let Some(v) = cfg.value(name, "MODEM_DIAL_CMD") {
                self.cmd_dial = v.to_string();
            }
            let resp: u64 = cfg.get_or(name, "MODEM_RESPONSE_TIMEOUT", 5000)?;
            self.response_timer.set_timeout(resp);
            let vcon: u64 = cfg.get_or(name, "VCON_TIMEOUT", 30)?;
            self.vcon_timer.set_timeout(vcon.clamp(8, 60) * 1000);
            let auth: u64 = cfg.get_or(name, "AUTH_TIMEOUT", 10)?;
            self.auth_timer.set_timeout(auth * 1000);
            self.max_rings = cfg.get_or(name, "MAX_RINGS", 2)?;
            self.busy_tone_min_ms = cfg.get_or(name, "BUSY_TONE_MIN", 400)?;
            self.busy_tone_max_ms = cfg.get_or(name, "BUSY_TONE_MAX", 600)?;
            self.auth_required = cfg.get_or::<u8>(name, "AUTH_REQUIRED", 0)? != 0;
            if let Some(section) = cfg.value(name, "AUTH_PINS") {
                for pin in cfg.list_section(section) {
                    if let Some(user) = cfg.value(section, &pin) {
                        self.auth_pins.insert(pin.clone(), user.to_string());
                    }
                }
            }
        }
        self.core.initialize(now_ms)?;
        self.core.set_tx_ctrl_mode(TxCtrlMode::Auto);
        self.core.set_rx_valve_open(true);
        self.reset_modem(now_ms);
        Ok(())
    }

    pub fn line_state(&self) -> LineState {
        self.state
    }

    pub fn phone_is_up(&self) -> bool {
        self.phone_up
    }

    pub fn authed_user(&self) -> Option<&str> {
        self.authed_user.as_deref()
    }

    /// Kept as an effective no-op; the original short-circuits here and
    /// the intent is unclear, so no behaviour is invented.
    pub fn set_idle(&mut self, _idle: bool) {}

    fn send(&mut self, cmd: &str, now_ms: u64) {
        log::debug!("{}: modem <- {cmd}", self.core.name());
        if let Err(e) = self.serial.write_line(cmd) {
            log::error!("*** ERROR: {}: serial write failed: {e}", self.core.name());
        }
        self.response_timer.start(now_ms);
    }

    fn reset_modem(&mut self, now_ms: u64) {
        self.state = LineState::Resetting;
        self.voice_ok = false;
        let cmd = self.cmd_reset.clone();
        self.send(&cmd, now_ms);
    }

    /// Place an outgoing call
    pub fn dial(&mut self, number: &str, now_ms: u64) {
        if self.state != LineState::Idle {
            log::warn!("{}: cannot dial in state {:?}", self.core.name(), self.state);
            return;
        }
        let cmd = format!("{}{number};", self.cmd_dial);
        self.state = LineState::Dialing;
        self.send(&cmd, now_ms);
        self.vcon_timer.start(now_ms);
    }

    /// Take the phone line down
    pub fn hangup(&mut self, reason: &str, now_ms: u64) {
        // While an announcement is playing the hangup is deferred a few
        // times so the far end hears the whole prompt
        if self.core.msg().is_writing_message() && self.hangup_count <= MAX_DEFERRED_HANGUPS {
            self.hangup_count += 1;
            self.hangup_retry_timer.start(now_ms);
            return;
        }
        self.hangup_count = 0;
        self.hangup_retry_timer.stop();
        self.drop_line(now_ms);
        self.state = LineState::HangingUp;
        let cmd = self.cmd_hangup.clone();
        self.send(&cmd, now_ms);
        self.core
            .process_event(&format!("phone_hangup {reason}"), now_ms);
    }

    fn raise_line(&mut self, now_ms: u64) {
        self.state = LineState::Up;
        self.voice_ok = true;
        if self.auth_required && self.authed_user.is_none() {
            self.request_authentication(now_ms);
            return;
        }
        self.phone_up = true;
        self.core.publish_state_event("phone_line", "1");
        self.core.process_event("phone_line_up", now_ms);
    }

    fn drop_line(&mut self, now_ms: u64) {
        if self.phone_up {
            self.core.publish_state_event("phone_line", "0");
            self.core.process_event("phone_line_down", now_ms);
        }
        self.phone_up = false;
        self.voice_ok = false;
        self.rings = 0;
        self.busy_pulses = 0;
        self.authed_user = None;
        self.auth_active = false;
        self.auth_timer.stop();
        self.settle_timer.stop();
        self.vcon_timer.stop();
    }

    fn request_authentication(&mut self, now_ms: u64) {
        self.auth_active = true;
        self.auth_timer.start(now_ms);
        self.core.process_event("auth_request", now_ms);
    }

    /// PIN entry collected by the DTMF pipeline while authentication is
    /// pending
    fn auth_pin_received(&mut self, pin: &str, now_ms: u64) {
        self.auth_timer.stop();
        self.auth_active = false;
        match self.auth_pins.get(pin) {
            Some(user) => {
                let user = user.clone();
                log::info!("{}: caller authenticated as {user}", self.core.name());
                self.authed_user = Some(user.clone());
                self.core
                    .process_event(&format!("auth_ok {user}"), now_ms);
                // Give the line a moment to settle before opening audio
                self.settle_timer.start(now_ms);
            }
            None => {
                self.core.process_event("wrong_pin", now_ms);
            }
        }
    }

    /// A line of modem output arrived on the serial port
    pub fn serial_line_received(&mut self, line: &str, now_ms: u64) {
        let reply = classify_reply(line);
        log::debug!("{}: modem -> {reply:?}", self.core.name());
        self.response_timer.stop();

        match (self.state, reply) {
            (LineState::Resetting, ModemReply::Ok) => {
                self.state = LineState::Initializing;
                let cmd = self.cmd_init.clone();
                self.send(&cmd, now_ms);
            }
            (LineState::Initializing, ModemReply::Ok) => {
                self.state = LineState::EnteringVoiceMode;
                let cmd = self.cmd_voice.clone();
                self.send(&cmd, now_ms);
            }
            (LineState::EnteringVoiceMode, ModemReply::Ok | ModemReply::Vcon) => {
                self.state = LineState::Idle;
                log::info!("{}: modem ready", self.core.name());
            }
            (
                LineState::Resetting | LineState::Initializing | LineState::EnteringVoiceMode,
                ModemReply::Error,
            ) => {
                log::warn!("{}: modem setup failed, retrying reset", self.core.name());
                self.reset_modem(now_ms);
            }
            (LineState::Idle | LineState::Incoming, ModemReply::Ringing) => {
                self.state = LineState::Incoming;
                self.rings += 1;
                log::info!("{}: ring {}", self.core.name(), self.rings);
                if self.rings >= self.max_rings {
                    let cmd = self.cmd_pickup.clone();
                    self.send(&cmd, now_ms);
                }
            }
            (LineState::Incoming, ModemReply::Ok | ModemReply::Vcon) => {
                self.rings = 0;
                self.raise_line(now_ms);
            }
            (LineState::Dialing, ModemReply::Vcon | ModemReply::Connect) => {
                self.vcon_timer.stop();
                self.raise_line(now_ms);
            }
            (LineState::Dialing, ModemReply::Busy) => {
                self.vcon_timer.stop();
                self.hangup("busy", now_ms);
            }
            (
                LineState::Dialing | LineState::Up,
                ModemReply::NoCarrier | ModemReply::NoDialtone,
            ) => {
                self.vcon_timer.stop();
                self.hangup("no_carrier", now_ms);
            }
            (LineState::HangingUp, ModemReply::Ok) => {
                // Line is down, re-initialize the modem for the next call
                self.state = LineState::Initializing;
                let cmd = self.cmd_init.clone();
                self.send(&cmd, now_ms);
            }
            (_, reply) => {
                log::debug!("{}: unhandled modem reply {reply:?}", self.core.name());
            }
        }
    }

    fn busy_tone_pulse(&mut self, duration_ms: u64, now_ms: u64) {
        if duration_ms >= self.busy_tone_min_ms && duration_ms <= self.busy_tone_max_ms {
            self.busy_pulses += 1;
            if self.busy_pulses >= 3 {
                self.busy_pulses = 0;
                self.hangup("busy", now_ms);
            }
        } else {
            self.busy_pulses = 0;
        }
    }
}

impl Logic for AnalogPhoneLogic {
    fn core(&self) -> &LogicCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LogicCore {
        &mut self.core
    }

    fn next_deadline(&self) -> Option<u64> {
        earliest_deadline(&[
            &self.response_timer,
            &self.vcon_timer,
            &self.auth_timer,
            &self.settle_timer,
            &self.hangup_retry_timer,
        ])
    }

    fn handle_rx_event(&mut self, ev: &RxEvent, now_ms: u64) -> bool {
        match ev {
            RxEvent::ToneDuration { duration_ms, .. } => {
                if self.phone_up || self.state == LineState::Dialing {
                    self.busy_tone_pulse(*duration_ms, now_ms);
                }
                true
            }
            RxEvent::DtmfDigit { digit, .. } if self.auth_active => {
                // PIN digits terminated by # go to the authenticator, not
                // to the command pipeline
                if *digit == '#' {
                    let pin = std::mem::take(&mut self.pin_buffer);
                    self.auth_pin_received(&pin, now_ms);
                } else {
                    self.pin_buffer.push(*digit);
                }
                true
            }
            _ => false,
        }
    }

    fn tick(&mut self, now_ms: u64) {
        if self.response_timer.poll(now_ms) {
            match self.state {
                LineState::Resetting | LineState::Initializing | LineState::EnteringVoiceMode => {
                    log::warn!("{}: modem response timeout, retrying", self.core.name());
                    self.reset_modem(now_ms);
                }
                LineState::Incoming => {
                    self.rings = 0;
                    self.state = LineState::Idle;
                }
                _ => {}
            }
        }
        if self.vcon_timer.poll(now_ms) && self.state == LineState::Dialing {
            self.core.process_event("call_timeout", now_ms);
            self.hangup("timeout", now_ms);
        }
        if self.auth_timer.poll(now_ms) && self.auth_active {
            self.auth_active = false;
            self.pin_buffer.clear();
            self.core.process_event("auth_timeout", now_ms);
        }
        if self.settle_timer.poll(now_ms) {
            self.phone_up = true;
            self.core.publish_state_event("phone_line", "1");
            self.core.process_event("phone_line_up", now_ms);
        }
        if self.hangup_retry_timer.poll(now_ms) {
            self.hangup("deferred", now_ms);
        }
    }
}

//! SIP gateway logic
//!
//! The SIP stack itself is an external collaborator behind the
//! `SipStack`/`SipCall` seams; this logic owns call policy: caller
//! filtering, auto-answer, auto-connect redial, call timeout, duplex
//! gating, phone-number to talkgroup mapping, the DNS peer check and the
//! control PTY command surface.

use regex::Regex;

use rg_core::{Sample, Timer};
use rg_logic::{Logic, LogicCore};

use crate::bridge::{DEFAULT_FLUSH_TIMEOUT_MS, NetBridge};
use crate::error::NetResult;

/// Call state as exposed by the SIP stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipCallState {
    Incoming,
    Calling,
    Early,
    Connecting,
    Confirmed,
    Disconnected,
}

/// One call leg owned by the external stack
pub trait SipCall: Send {
    fn remote_uri(&self) -> String;
    fn state(&self) -> SipCallState;
    fn has_media(&self) -> bool;
    fn answer(&mut self);
    fn hangup(&mut self);
    /// Audio towards the far end
    fn write_samples(&mut self, samples: &[Sample]);
    /// Audio from the far end; returns the sample count delivered
    fn read_samples(&mut self, out: &mut [Sample]) -> usize;
}

/// Registration/placement surface of the external stack
pub trait SipStack: Send {
    fn is_registered(&self) -> bool;
    fn make_call(&mut self, uri: &str) -> NetResult<Box<dyn SipCall>>;
}

/// A-record resolution, completion-callback style collapsed to a poll
pub trait DnsResolver: Send {
    fn resolve_a(&mut self, host: &str) -> Vec<std::net::Ipv4Addr>;
}

/// Inert stack for builds without a VoIP backend: never registers and
/// refuses to place calls.
#[derive(Default)]
pub struct NullSipStack;

impl SipStack for NullSipStack {
    fn is_registered(&self) -> bool {
        false
    }

    fn make_call(&mut self, _uri: &str) -> NetResult<Box<dyn SipCall>> {
        Err(crate::error::NetError::NoSipStack)
    }
}

/// Resolver that answers nothing; the peer check then only trusts
/// literal host matches.
#[derive(Default)]
pub struct NullDnsResolver;

impl DnsResolver for NullDnsResolver {
    fn resolve_a(&mut self, _host: &str) -> Vec<std::net::Ipv4Addr> {
        Vec::new()
    }
}

/// Extract the user part of `sip:user@host`
pub fn uri_user(uri: &str) -> &str {
    let rest = uri.strip_prefix("sip:").unwrap_or(uri);
    rest.split('@').next().unwrap_or(rest)
}

/// Extract the host part of `sip:user@host:port`
pub fn uri_host(uri: &str) -> &str {
    let rest = uri.strip_prefix("sip:").unwrap_or(uri);
    match rest.split_once('@') {
        Some((_, host)) => host.split(':').next().unwrap_or(host),
        None => rest.split(':').next().unwrap_or(rest),
    }
}

struct CallSlot {
    call: Box<dyn SipCall>,
    outgoing: bool,
    started_ms: u64,
    media_seen: bool,
}

pub struct SipLogic {
    core: LogicCore,
    stack: Box<dyn SipStack>,
    dns: Box<dyn DnsResolver>,
    bridge: NetBridge,
    calls: Vec<CallSlot>,

    server: String,
    accept_incoming: Option<Regex>,
    reject_incoming: Option<Regex>,
    accept_outgoing: Option<Regex>,
    reject_outgoing: Option<Regex>,
    auto_answer: bool,
    auto_connect: Option<String>,
    redial_timer: Timer,
    call_timeout_ms: u64,
    max_calls: usize,
    semi_duplex: bool,
    vox_threshold: Sample,
    vox_hang_ms: u64,
    vox_open_until_ms: u64,
    ignore_peer_check: bool,
    phone_to_tg: Vec<(String, u32)>,
    rx_stream_open: bool,
    tx_buffer: Vec<Sample>,
}

impl SipLogic {
    pub fn new(core: LogicCore, stack: Box<dyn SipStack>, dns: Box<dyn DnsResolver>) -> Self {
        Self {
            core,
            stack,
            dns,
            bridge: NetBridge::new(160, 1000, 30000, 32000, DEFAULT_FLUSH_TIMEOUT_MS),
            calls: Vec::new(),
            server: String::new(),
            accept_incoming: None,
            reject_incoming: None,
            accept_outgoing: None,
            reject_outgoing: None,
            auto_answer: true,
            auto_connect: None,
            redial_timer: Timer::one_shot(5000),
            call_timeout_ms: 0,
            max_calls: 4,
            semi_duplex: true,
            vox_threshold: 1000,
            vox_hang_ms: 1000,
            vox_open_until_ms: 0,
            ignore_peer_check: false,
            phone_to_tg: Vec::new(),
            rx_stream_open: false,
            tx_buffer: Vec::new(),
        }
    }

    pub fn initialize(&mut self, now_ms: u64) -> rg_core::CoreResult<()> {
        let compile = |pat: Option<String>, what: &str| -> rg_core::CoreResult<Option<Regex>> {
            match pat {
                None => Ok(None),
                Some(p) => Regex::new(&p).map(Some).map_err(|e| {
                    rg_core::CoreError::InvalidValue(what.to_string(), format!("{p}: {e}"))
                }),
            }
        };
        let (ai, ri, ao, ro);
        {
            let cfg = self.core.config().clone();
            let cfg = cfg.lock();
            let name = self.core.name();
            self.server = cfg.value(name, "SIP_SERVER").unwrap_or_default().to_string();
            ai = cfg.value(name, "ACCEPT_INCOMING").map(str::to_string);
            ri = cfg.value(name, "REJECT_INCOMING").map(str::to_string);
            ao = cfg.value(name, "ACCEPT_OUTGOING").map(str::to_string);
            ro = cfg.value(name, "REJECT_OUTGOING").map(str::to_string);
            self.auto_answer = cfg.get_or::<u8>(name, "AUTO_ANSWER", 1)? != 0;
            self.auto_connect = cfg.value(name, "AUTO_CONNECT").map(str::to_string);
            self.call_timeout_ms = cfg.get_or::<u64>(name, "CALL_TIMEOUT", 0)? * 1000;
            self.max_calls = cfg.get_or(name, "MAX_CALLS", 4)?;
            self.semi_duplex = cfg.get_or::<u8>(name, "SEMI_DUPLEX", 1)? != 0;
            self.vox_threshold = cfg.get_or(name, "VOX_THRESHOLD", 1000)?;
            self.vox_hang_ms = cfg.get_or(name, "VOX_HANG", 1000)?;
            self.ignore_peer_check = cfg.get_or::<u8>(name, "IGNORE_PEER_CHECK", 0)? != 0;
            if let Some(map) = cfg.value(name, "PHONE_TO_TG") {
                for pair in map.split(',').filter(|s| !s.is_empty()) {
                    let Some((prefix, tg)) = pair.split_once(':') else {
                        return Err(rg_core::CoreError::InvalidValue(
                            format!("{name}/PHONE_TO_TG"),
                            pair.to_string(),
                        ));
                    };
                    let tg: u32 = tg.trim().parse().map_err(|_| {
                        rg_core::CoreError::InvalidValue(
                            format!("{name}/PHONE_TO_TG"),
                            pair.to_string(),
                        )
                    })?;
                    self.phone_to_tg.push((prefix.trim().to_string(), tg));
                }
                // Longest prefix first
                self.phone_to_tg
                    .sort_by(|a, b| b.0.len().cmp(&a.0.len()));
            }
        }
        self.accept_incoming = compile(ai, "ACCEPT_INCOMING")?;
        self.reject_incoming = compile(ri, "REJECT_INCOMING")?;
        self.accept_outgoing = compile(ao, "ACCEPT_OUTGOING")?;
        self.reject_outgoing = compile(ro, "REJECT_OUTGOING")?;

        self.core.initialize(now_ms)?;
        self.core.set_rx_valve_open(true);

        if let Some(uri) = self.auto_connect.clone() {
            self.place_call(&uri, now_ms);
        }
        Ok(())
    }

    pub fn call_count(&self) -> usize {
        self.calls.len()
    }

    fn number_allowed(
        accept: &Option<Regex>,
        reject: &Option<Regex>,
        number: &str,
    ) -> bool {
        if let Some(re) = reject
            && re.is_match(number)
        {
            return false;
        }
        match accept {
            Some(re) => re.is_match(number),
            None => true,
        }
    }

    fn tg_for_number(&self, number: &str) -> Option<u32> {
        self.phone_to_tg
            .iter()
            .find(|(prefix, _)| number.starts_with(prefix.as_str()))
            .map(|(_, tg)| *tg)
    }

    /// An incoming call was offered by the stack
    pub fn incoming_call(&mut self, call: Box<dyn SipCall>, now_ms: u64) {
        let uri = call.remote_uri();
        let number = uri_user(&uri).to_string();

        if self.calls.len() >= self.max_calls {
            log::warn!("{}: too many calls, rejecting {uri}", self.core.name());
            let mut call = call;
            call.hangup();
            self.core
                .process_event(&format!("reject_incoming_call {number}"), now_ms);
            return;
        }

        if !Self::number_allowed(&self.accept_incoming, &self.reject_incoming, &number) {
            let mut call = call;
            call.hangup();
            self.core
                .process_event(&format!("reject_incoming_call {number}"), now_ms);
            return;
        }

        // The caller is trusted when the proxy's A records cover its host
        if !self.ignore_peer_check && !self.server.is_empty() {
            let caller_host = uri_host(&uri).to_string();
            let proxy_addrs = self.dns.resolve_a(&self.server);
            let caller_addr: Option<std::net::Ipv4Addr> = caller_host.parse().ok();
            let trusted = match caller_addr {
                Some(addr) => proxy_addrs.contains(&addr),
                None => caller_host == self.server,
            };
            if !trusted {
                let mut call = call;
                call.hangup();
                self.core
                    .process_event(&format!("invalid_call {number}"), now_ms);
                return;
            }
        }

        if let Some(tg) = self.tg_for_number(&number) {
            self.core.set_received_tg(tg);
        }

        let mut call = call;
        if self.auto_answer {
            call.answer();
        }
        self.core
            .process_event(&format!("incoming_call {number}"), now_ms);
        self.calls.push(CallSlot {
            call,
            outgoing: false,
            started_ms: now_ms,
            media_seen: false,
        });
    }

    /// Place an outgoing call to a URI or bare number
    pub fn place_call(&mut self, dest: &str, now_ms: u64) {
        let uri = if dest.starts_with("sip:") {
            dest.to_string()
        } else {
            format!("sip:{dest}@{}", self.server)
        };
        let number = uri_user(&uri).to_string();
        if !Self::number_allowed(&self.accept_outgoing, &self.reject_outgoing, &number) {
            self.core
                .process_event(&format!("drop_outgoing_call {number}"), now_ms);
            return;
        }
        if self.calls.len() >= self.max_calls {
            self.core
                .process_event(&format!("drop_outgoing_call {number}"), now_ms);
            return;
        }
        match self.stack.make_call(&uri) {
            Ok(call) => {
                self.core
                    .process_event(&format!("outgoing_call {number}"), now_ms);
                self.calls.push(CallSlot {
                    call,
                    outgoing: true,
                    started_ms: now_ms,
                    media_seen: false,
                });
            }
            Err(e) => {
                log::error!("*** ERROR: {}: call to {uri} failed: {e}", self.core.name());
                self.core
                    .process_event(&format!("drop_outgoing_call {number}"), now_ms);
            }
        }
    }

    pub fn hangup_all(&mut self, now_ms: u64) {
        for slot in self.calls.iter_mut() {
            slot.call.hangup();
        }
        self.calls.clear();
        self.core.process_event("call_hangup all", now_ms);
    }

    /// Answer the oldest unanswered incoming call
    pub fn answer_incoming(&mut self) {
        if let Some(slot) = self
            .calls
            .iter_mut()
            .find(|s| !s.outgoing && s.call.state() == SipCallState::Incoming)
        {
            slot.call.answer();
        }
    }

    /// Control PTY surface: `C#` hang up all, `CA` answer,
    /// `C<digits>#` place a call.
    pub fn pty_command_received(&mut self, line: &str, now_ms: u64) {
        let line = line.trim();
        match line {
            "C#" => self.hangup_all(now_ms),
            "CA" => self.answer_incoming(),
            _ => {
                if let Some(rest) = line.strip_prefix('C')
                    && let Some(digits) = rest.strip_suffix('#')
                    && !digits.is_empty()
                {
                    self.place_call(digits, now_ms);
                } else {
                    log::warn!("{}: unknown PTY command: {line}", self.core.name());
                }
            }
        }
    }

    fn vox_open(&self) -> bool {
        !self.semi_duplex
    }
}

impl Logic for SipLogic {
    fn core(&self) -> &LogicCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LogicCore {
        &mut self.core
    }

    fn next_deadline(&self) -> Option<u64> {
        self.redial_timer.deadline()
    }

    /// Audio from the connected logics goes to the far end
    fn link_audio_in(&mut self, samples: &[Sample], _now_ms: u64) {
        self.core.write_link_in(samples);
        self.tx_buffer.extend_from_slice(samples);
    }

    fn link_audio_flush(&mut self, _now_ms: u64) {
        self.core.flush_link_in();
    }

    fn tick(&mut self, now_ms: u64) {
        // Call supervision
        let mut ended = Vec::new();
        let call_timeout = self.call_timeout_ms;
        for (idx, slot) in self.calls.iter_mut().enumerate() {
            if slot.call.has_media() {
                slot.media_seen = true;
            }
            match slot.call.state() {
                SipCallState::Disconnected => ended.push(idx),
                _ => {
                    if slot.outgoing
                        && call_timeout > 0
                        && !slot.media_seen
                        && now_ms.saturating_sub(slot.started_ms) >= call_timeout
                    {
                        slot.call.hangup();
                        ended.push(idx);
                        self.core.process_event("call_timeout", now_ms);
                    }
                }
            }
        }
        for idx in ended.into_iter().rev() {
            let slot = self.calls.remove(idx);
            let number = uri_user(&slot.call.remote_uri()).to_string();
            self.core
                .process_event(&format!("call_disconnected {number}"), now_ms);
        }

        // All calls gone: redial the auto-connect destination
        if self.calls.is_empty()
            && self.auto_connect.is_some()
            && !self.redial_timer.is_running()
        {
            self.redial_timer.start(now_ms);
        }
        if self.redial_timer.poll(now_ms)
            && self.calls.is_empty()
            && let Some(uri) = self.auto_connect.clone()
        {
            self.place_call(&uri, now_ms);
        }

        // Far end → logic
        let mut buf = [0 as Sample; 1024];
        let mut collected: Vec<Sample> = Vec::new();
        for slot in self.calls.iter_mut() {
            if slot.call.state() == SipCallState::Confirmed {
                let n = slot.call.read_samples(&mut buf);
                if n > 0 {
                    collected.extend_from_slice(&buf[..n]);
                }
            }
        }
        if !collected.is_empty() {
            // Full duplex gates on VOX; semi duplex passes while a call
            // is up
            let loud = collected
                .iter()
                .any(|s| s.unsigned_abs() as i32 >= self.vox_threshold as i32);
            if loud {
                self.vox_open_until_ms = now_ms + self.vox_hang_ms;
            }
            let gate = if self.vox_open() {
                now_ms < self.vox_open_until_ms
            } else {
                true
            };
            if gate {
                self.bridge.write_net(&collected, now_ms);
            }
        }
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

        // Logic → far end
        if !self.tx_buffer.is_empty() {
            let out = std::mem::take(&mut self.tx_buffer);
            for slot in self.calls.iter_mut() {
                if slot.call.state() == SipCallState::Confirmed {
                    slot.call.write_samples(&out);
                }
            }
        }
    }
}

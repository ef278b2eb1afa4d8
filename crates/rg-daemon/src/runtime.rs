//! The event loop
//!
//! Single-threaded: the loop thread owns every logic, the link manager
//! and every socket. Reader threads (PTYs) and library internals only
//! post `LoopMessage`s onto the channel; nothing mutates core state off
//! the loop.

use std::net::UdpSocket;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, bail};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use rg_core::{Clock, Config, LoopMessage, SharedConfig, StateEvent, SystemClock};
use rg_link::LinkManager;
use rg_logic::{Logic, LogicCore};
use rg_script::LuaScriptEngine;

use crate::pty::{PtyCommand, StatePty, parse_command_line, spawn_command_reader,
    spawn_dtmf_reader, spawn_sip_ctrl_reader};
use crate::registry::{BuiltLogic, LogicDeps, LogicRegistry};

const LOOP_TICK: Duration = Duration::from_millis(20);
const GLOBAL_SECTION: &str = "GLOBAL";
const PTY_DIGIT_MS: u64 = 100;

struct NetEndpoint {
    socket: UdpSocket,
}

struct Managed {
    logic: BuiltLogic,
    net: Option<NetEndpoint>,
    state_pty: Option<StatePty>,
    last_sql: bool,
    link_in_open: bool,
}

impl Managed {
    fn name(&self) -> String {
        self.logic.name()
    }
}

pub struct Runtime {
    cfg: SharedConfig,
    clock: SystemClock,
    link_mgr: LinkManager,
    logics: Vec<Managed>,
    msg_rx: Receiver<LoopMessage>,
    msg_tx: Sender<LoopMessage>,
    shutdown: bool,
}

impl Runtime {
    /// Build everything from configuration: logics, links, PTYs and
    /// sockets. Fails fatally on configuration errors.
    pub fn bootstrap(
        config: Config,
        registry: &LogicRegistry,
        deps: &LogicDeps,
    ) -> anyhow::Result<Self> {
        let clock = SystemClock::new();
        let now = clock.now_ms();
        let (msg_tx, msg_rx) = unbounded();

        let logic_names = config.get_list(GLOBAL_SECTION, "LOGICS");
        if logic_names.is_empty() {
            bail!("no logics configured ({GLOBAL_SECTION}/LOGICS is empty)");
        }
        let sample_rate: u32 = config
            .get_or(GLOBAL_SECTION, "CARD_SAMPLE_RATE", rg_core::INTERNAL_SAMPLE_RATE)
            .context("CARD_SAMPLE_RATE")?;

        let mut link_mgr = LinkManager::from_config(&config, GLOBAL_SECTION)
            .context("loading link definitions")?;
        let cfg: SharedConfig = Arc::new(Mutex::new(config));

        let mut logics = Vec::new();
        for name in &logic_names {
            let (logic_type, rx_section, tx_section);
            {
                let config = cfg.lock();
                logic_type = config
                    .get_required::<String>(name, "TYPE")
                    .with_context(|| format!("logic {name}"))?;
                rx_section = config.value(name, "RX").unwrap_or("NONE").to_string();
                tx_section = config.value(name, "TX").unwrap_or("NONE").to_string();
            }
            let (rx, tx) = {
                let config = cfg.lock();
                (
                    deps.trx
                        .create_rx(&config, &rx_section)
                        .with_context(|| format!("receiver for {name}"))?,
                    deps.trx
                        .create_tx(&config, &tx_section)
                        .with_context(|| format!("transmitter for {name}"))?,
                )
            };
            let engine = LuaScriptEngine::new(cfg.clone())
                .with_context(|| format!("script engine for {name}"))?;
            let core = LogicCore::new(name, cfg.clone(), sample_rate, rx, tx, Box::new(engine));
            let logic = registry
                .create(&logic_type, core, deps, now)
                .with_context(|| format!("initializing logic {name}"))?;
            log::info!("### logic {name} ({logic_type}) is up");

            let mut managed = Managed {
                logic,
                net: None,
                state_pty: None,
                last_sql: false,
                link_in_open: false,
            };
            Self::setup_ptys(&cfg, name, &msg_tx, &mut managed)?;
            Self::setup_net(&cfg, name, &mut managed)?;
            logics.push(managed);
            link_mgr.add_logic(name);
        }

        // Register every link command with its member logics
        for link in link_mgr.link_names() {
            for member in link_mgr.members_of(&link) {
                let Some(base) = link_mgr.base_cmd_for(&link, &member).map(str::to_string)
                else {
                    continue;
                };
                if let Some(managed) = logics.iter_mut().find(|m| m.name() == member) {
                    if !managed
                        .logic
                        .as_logic_mut()
                        .core_mut()
                        .register_link_cmd(&base)
                    {
                        bail!("duplicate command {base} while wiring link {link}");
                    }
                }
            }
        }

        let mut runtime = Self {
            cfg,
            clock,
            link_mgr,
            logics,
            msg_rx,
            msg_tx,
            shutdown: false,
        };

        let names: Vec<String> = runtime.logics.iter().map(|m| m.name()).collect();
        for name in names {
            runtime.link_mgr.logic_is_up(&name, now);
        }
        runtime.dispatch_link_events(now);
        Ok(runtime)
    }

    fn setup_ptys(
        cfg: &SharedConfig,
        name: &str,
        msg_tx: &Sender<LoopMessage>,
        managed: &mut Managed,
    ) -> anyhow::Result<()> {
        let (dtmf_pty, command_pty, state_pty, sip_ctrl_pty);
        {
            let config = cfg.lock();
            dtmf_pty = config.value(name, "DTMF_CTRL_PTY").map(str::to_string);
            command_pty = config.value(name, "COMMAND_PTY").map(str::to_string);
            state_pty = config.value(name, "STATE_PTY").map(str::to_string);
            sip_ctrl_pty = config.value(name, "SIP_CTRL_PTY").map(str::to_string);
        }
        if let Some(path) = dtmf_pty {
            spawn_dtmf_reader(Path::new(&path), name.to_string(), msg_tx.clone())
                .with_context(|| format!("DTMF PTY {path}"))?;
        }
        if let Some(path) = command_pty {
            spawn_command_reader(Path::new(&path), name.to_string(), msg_tx.clone())
                .with_context(|| format!("command PTY {path}"))?;
        }
        if let Some(path) = sip_ctrl_pty {
            spawn_sip_ctrl_reader(Path::new(&path), name.to_string(), msg_tx.clone())
                .with_context(|| format!("SIP control PTY {path}"))?;
        }
        if let Some(path) = state_pty {
            managed.state_pty = Some(
                StatePty::open(Path::new(&path))
                    .with_context(|| format!("state PTY {path}"))?,
            );
        }
        Ok(())
    }

    fn setup_net(cfg: &SharedConfig, name: &str, managed: &mut Managed) -> anyhow::Result<()> {
        if !matches!(managed.logic, BuiltLogic::Usrp(_) | BuiltLogic::Rewind(_)) {
            return Ok(());
        }
        let (host, port, local_port);
        {
            let config = cfg.lock();
            host = config
                .get_required::<String>(name, "UDP_HOST")
                .with_context(|| format!("logic {name}"))?;
            port = config
                .get_required::<u16>(name, "UDP_PORT")
                .with_context(|| format!("logic {name}"))?;
            local_port = config.get_or::<u16>(name, "LOCAL_PORT", 0)?;
        }
        let socket = UdpSocket::bind(("0.0.0.0", local_port))
            .with_context(|| format!("binding UDP for {name}"))?;
        socket
            .connect((host.as_str(), port))
            .with_context(|| format!("connecting UDP for {name} to {host}:{port}"))?;
        socket.set_nonblocking(true)?;
        managed.net = Some(NetEndpoint { socket });
        Ok(())
    }

    /// Run until shutdown
    pub fn run(&mut self) {
        log::info!("### event loop running");
        while !self.shutdown {
            match self.msg_rx.recv_timeout(self.next_wait()) {
                Ok(msg) => {
                    let now = self.clock.now_ms();
                    self.handle_message(msg, now);
                    // Drain whatever else queued up meanwhile
                    while let Ok(msg) = self.msg_rx.try_recv() {
                        self.handle_message(msg, now);
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
            let now = self.clock.now_ms();
            self.iteration(now);
        }
        let now = self.clock.now_ms();
        for managed in self.logics.iter_mut() {
            managed.logic.as_logic_mut().core_mut().teardown(now);
        }
        log::info!("### shutting down");
    }

    /// Request an orderly shutdown from another thread
    pub fn shutdown_handle(&self) -> Sender<LoopMessage> {
        self.msg_tx.clone()
    }

    /// Sleep at most one audio pump period, less when an embedded timer
    /// is due sooner.
    fn next_wait(&self) -> Duration {
        let mut deadlines = vec![self.link_mgr.next_deadline()];
        for managed in &self.logics {
            let logic = managed.logic.as_logic();
            deadlines.push(logic.next_deadline());
            deadlines.push(logic.core().next_deadline());
        }
        match deadlines.into_iter().flatten().min() {
            Some(deadline) => {
                let now = self.clock.now_ms();
                let until = deadline.saturating_sub(now).max(1);
                LOOP_TICK.min(Duration::from_millis(until))
            }
            None => LOOP_TICK,
        }
    }

    fn handle_message(&mut self, msg: LoopMessage, now: u64) {
        match msg {
            LoopMessage::PtyDtmfDigit { logic, digit } => {
                if let Some(managed) = self.logics.iter_mut().find(|m| m.name() == logic) {
                    managed
                        .logic
                        .as_logic_mut()
                        .core_mut()
                        .dtmf_digit_received(digit, PTY_DIGIT_MS, now);
                }
            }
            LoopMessage::PtyCommandLine { logic, line } => {
                self.handle_pty_command(&logic, &line, now);
            }
            LoopMessage::Datagram { logic, data } => {
                if let Some(managed) = self.logics.iter_mut().find(|m| m.name() == logic) {
                    match &mut managed.logic {
                        BuiltLogic::Usrp(l) => l.datagram_received(&data, now),
                        BuiltLogic::Rewind(l) => l.datagram_received(&data, now),
                        _ => {}
                    }
                }
            }
            LoopMessage::SerialLine { logic, line } => {
                if let Some(managed) = self.logics.iter_mut().find(|m| m.name() == logic)
                    && let BuiltLogic::Phone(l) = &mut managed.logic
                {
                    l.serial_line_received(&line, now);
                }
            }
            LoopMessage::SipCtrlLine { logic, line } => {
                if let Some(managed) = self.logics.iter_mut().find(|m| m.name() == logic)
                    && let BuiltLogic::Sip(l) = &mut managed.logic
                {
                    l.pty_command_received(&line, now);
                }
            }
            LoopMessage::Shutdown => self.shutdown = true,
        }
    }

    fn handle_pty_command(&mut self, logic: &str, line: &str, now: u64) {
        match parse_command_line(line) {
            Some(PtyCommand::SetConfig {
                section,
                tag,
                value,
            }) => {
                self.cfg.lock().set_value(&section, &tag, &value);
            }
            Some(PtyCommand::RaiseEvent { name, args }) => {
                let (target, event_name) = match name.split_once("::") {
                    Some((ns, ev)) => (ns.to_string(), ev.to_string()),
                    None => (logic.to_string(), name),
                };
                let event = if args.is_empty() {
                    event_name
                } else {
                    format!("{event_name} {args}")
                };
                if let Some(managed) =
                    self.logics.iter_mut().find(|m| m.name() == target)
                {
                    managed
                        .logic
                        .as_logic_mut()
                        .core_mut()
                        .process_event(&event, now);
                } else {
                    log::warn!("EVENT for unknown logic {target}");
                }
            }
            None => log::warn!("unparsable command PTY line: {line:?}"),
        }
    }

    fn iteration(&mut self, now: u64) {
        let mut link_cmds: Vec<(String, String, String)> = Vec::new();
        let mut sql_closed: Vec<String> = Vec::new();

        for managed in self.logics.iter_mut() {
            let name = managed.name();

            // Network input
            if let Some(net) = managed.net.as_mut() {
                let mut buf = [0u8; 2048];
                loop {
                    match net.socket.recv(&mut buf) {
                        Ok(len) => match &mut managed.logic {
                            BuiltLogic::Usrp(l) => l.datagram_received(&buf[..len], now),
                            BuiltLogic::Rewind(l) => l.datagram_received(&buf[..len], now),
                            _ => {}
                        },
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            log::warn!("{name}: UDP receive failed: {e}");
                            break;
                        }
                    }
                }
            }

            // Receiver events, variant and core processing
            rg_logic::pump_logic(managed.logic.as_logic_mut(), now);

            let core = managed.logic.as_logic_mut().core_mut();

            // Squelch edges drive the link activity timers
            let sql = core.sql_is_open();
            if managed.last_sql && !sql {
                sql_closed.push(name.clone());
            }
            managed.last_sql = sql;

            for (cmd, sub) in core.take_link_cmds() {
                link_cmds.push((name.clone(), cmd, sub));
            }

            // Audio towards the other logics
            let out = core.take_link_out();
            if !out.is_empty() {
                self.link_mgr.write_audio(&name, &out);
            }
            if core.link_out_stream_done() {
                self.link_mgr.flush_audio(&name);
            }

            // State events
            let events = core.take_state_events();
            if !events.is_empty() {
                let stamp = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                for (event_name, msg) in events {
                    let event = StateEvent {
                        unix_sec: stamp.as_secs(),
                        millis: stamp.subsec_millis(),
                        name: event_name,
                        msg,
                    };
                    log::debug!("{name}: state event {}", event.to_line().trim_end());
                    if let Some(pty) = managed.state_pty.as_mut() {
                        pty.publish(&event);
                    }
                }
            }

            // Network output
            if let Some(net) = managed.net.as_mut() {
                let frames = match &mut managed.logic {
                    BuiltLogic::Usrp(l) => l.take_outgoing(),
                    BuiltLogic::Rewind(l) => l.take_outgoing(),
                    _ => Vec::new(),
                };
                for frame in frames {
                    if let Err(e) = net.socket.send(&frame) {
                        log::warn!("{name}: UDP send failed: {e}");
                    }
                }
            }
        }

        // Audio from the link network into each logic
        for managed in self.logics.iter_mut() {
            let name = managed.name();
            let audio = self.link_mgr.take_audio_for(&name);
            if !audio.is_empty() {
                managed.link_in_open = true;
                managed.logic.as_logic_mut().link_audio_in(&audio, now);
            }
            if managed.link_in_open && self.link_mgr.audio_for_is_done(&name) {
                managed.link_in_open = false;
                managed.logic.as_logic_mut().link_audio_flush(now);
            }
        }

        // Link commands and activity
        for (logic, cmd, sub) in link_cmds {
            let event = self.link_mgr.cmd_received(&logic, &cmd, &sub, now);
            if let Some(managed) = self.logics.iter_mut().find(|m| m.name() == logic) {
                managed
                    .logic
                    .as_logic_mut()
                    .core_mut()
                    .process_event(&event, now);
            }
        }
        for name in sql_closed {
            self.link_mgr.reset_timers(&name, now);
        }

        self.link_mgr.tick(now);
        self.dispatch_link_events(now);
    }

    fn dispatch_link_events(&mut self, now: u64) {
        for link_event in self.link_mgr.take_events() {
            for member in self.link_mgr.members_of(&link_event.link) {
                if let Some(managed) =
                    self.logics.iter_mut().find(|m| m.name() == member)
                {
                    managed
                        .logic
                        .as_logic_mut()
                        .core_mut()
                        .process_event(&link_event.event, now);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{
        LogicRegistry, NullSerialFactory, NullSipFactory, NullTrxFactory,
    };

    fn config(text: &str) -> Config {
        let mut cfg = Config::new();
        cfg.load_str(text).unwrap();
        cfg
    }

    fn bootstrap(cfg: Config) -> anyhow::Result<Runtime> {
        let registry = LogicRegistry::with_builtins();
        let deps = LogicDeps {
            trx: &NullTrxFactory,
            serial: &NullSerialFactory,
            sip: &NullSipFactory,
        };
        Runtime::bootstrap(cfg, &registry, &deps)
    }

    #[test]
    fn test_bootstrap_requires_logics() {
        assert!(bootstrap(config("[GLOBAL]\n")).is_err());
    }

    #[test]
    fn test_bootstrap_two_linked_logics() {
        let cfg = config(
            "[GLOBAL]\n\
             LOGICS=NodeA,NodeB\n\
             LINKS=Main\n\
             [NodeA]\nTYPE=Dummy\n\
             [NodeB]\nTYPE=Dummy\n\
             [Main]\n\
             CONNECT_LOGICS=NodeA:81:MainA,NodeB:82:MainB\n\
             DEFAULT_CONNECT=1\n",
        );
        let runtime = bootstrap(cfg).unwrap();
        assert!(runtime.link_mgr.link_is_connected("Main"));
        assert_eq!(runtime.logics.len(), 2);
    }

    #[test]
    fn test_unknown_type_fails() {
        let cfg = config("[GLOBAL]\nLOGICS=X\n[X]\nTYPE=Quantum\n");
        assert!(bootstrap(cfg).is_err());
    }

    #[test]
    fn test_phone_and_sip_types_bootstrap_on_null_seams() {
        let cfg = config(
            "[GLOBAL]\n\
             LOGICS=PhoneLogic,SipLogic\n\
             [PhoneLogic]\nTYPE=AnalogPhone\n\
             [SipLogic]\nTYPE=Sip\nSIP_SERVER=sip.example.org\n",
        );
        let mut runtime = bootstrap(cfg).unwrap();
        assert_eq!(runtime.logics.len(), 2);

        // A modem reply reaches the phone automaton through the loop
        runtime.handle_message(
            LoopMessage::SerialLine {
                logic: "PhoneLogic".into(),
                line: "OK".into(),
            },
            0,
        );
        match &runtime.logics[0].logic {
            BuiltLogic::Phone(l) => {
                assert_eq!(l.line_state(), rg_logic::phone::LineState::Initializing)
            }
            _ => panic!("expected the phone logic first"),
        }

        // SIP control lines route to the call surface; the null stack
        // refuses the call, so nothing sticks
        runtime.handle_message(
            LoopMessage::SipCtrlLine {
                logic: "SipLogic".into(),
                line: "C12345#".into(),
            },
            0,
        );
        match &runtime.logics[1].logic {
            BuiltLogic::Sip(l) => assert_eq!(l.call_count(), 0),
            _ => panic!("expected the SIP logic second"),
        }
    }

    #[test]
    fn test_next_wait_honours_timer_deadlines() {
        let cfg = config("[GLOBAL]\nLOGICS=NodeA\n[NodeA]\nTYPE=Dummy\n");
        let mut runtime = bootstrap(cfg).unwrap();
        assert_eq!(runtime.next_wait(), LOOP_TICK);

        // A half-entered command arms the inter-digit timeout; the wait
        // stays capped at the audio pump period
        runtime.logics[0]
            .logic
            .as_logic_mut()
            .core_mut()
            .dtmf_digit_received('1', 100, runtime.clock.now_ms());
        assert!(runtime.next_wait() <= LOOP_TICK);
        assert!(runtime.next_wait() > Duration::ZERO);
    }

    #[test]
    fn test_link_command_round_trip() {
        let cfg = config(
            "[GLOBAL]\n\
             LOGICS=NodeA,NodeB\n\
             LINKS=Main\n\
             [NodeA]\nTYPE=Dummy\n\
             [NodeB]\nTYPE=Dummy\n\
             [Main]\n\
             CONNECT_LOGICS=NodeA:81:Main,NodeB:82:Main\n\
             TIMEOUT=30\n",
        );
        let mut runtime = bootstrap(cfg).unwrap();
        let now = 0;

        // Feed the connect command into NodeA as DTMF
        {
            let managed = runtime
                .logics
                .iter_mut()
                .find(|m| m.name() == "NodeA")
                .unwrap();
            let core = managed.logic.as_logic_mut().core_mut();
            for d in "811#".chars() {
                core.dtmf_digit_received(d, 100, now);
            }
        }
        runtime.iteration(now);
        assert!(runtime.link_mgr.link_is_connected("Main"));
        assert_eq!(runtime.link_mgr.connected_pairs().len(), 2);

        // The 30 s auto-disconnect fires without activity
        runtime.iteration(31_000);
        assert!(!runtime.link_mgr.link_is_connected("Main"));
        assert!(runtime.link_mgr.connected_pairs().is_empty());
    }
}

//! Logic base
//!
//! `LogicCore` is the shared machinery of every logic variant: the audio
//! graph between receiver, modules, links and transmitter; the message
//! handler; the DTMF command pipeline; the event script; TX CTCSS policy
//! and CTCSS to talkgroup mapping; online/offline handling.
//!
//! Graph wiring:
//!
//! ```text
//! Rx → rxValve → rxSplitter ┬→ (toModule selector src, prio 10)
//!                           ├→ (toLogicConOut)
//!                           ├→ rptValve → (txSelector src, prio 20)
//!                           ├→ [event recorder sink]
//!                           └→ [QSO recorder selector src]
//! logicConIn → (toModule selector src, prio 0)
//!            → ssdet → (txSelector src, prio 10)
//! moduleAudio → splitter ┬→ ssdet → (txSelector src, prio 0)
//!                        └→ (toLogicConOut)
//! txSelector → ssdet → fifo(prebuf) → mixer → Tx
//! msgHandler → fxGainAmp → pacer → mixer (second input)
//! ```

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use rg_audio::{
    AmplifierSink, AudioSink, BranchId, Collector, Fifo, Mixer, MixerInput, Pacer, Selector,
    SelectorPort, Splitter, StreamEvent, StreamStateDetector, Valve, WavRecorderSink, shared,
};
use rg_core::{
    CoreResult, Receiver, RxEvent, Sample, SharedConfig, Timer, Transmitter, TxCtrlMode,
};
use rg_msg::{MessageHandler, MsgEvent};
use rg_script::{EventScriptEngine, ScriptAction, result_is_handled};

use crate::cmd_parser::CmdParser;
use crate::dtmf::DtmfAggregator;
use crate::macros::{MacroError, MacroTable};
use crate::module::ModuleRegistry;
use crate::qso_recorder::QsoRecorder;

/// TX CTCSS transmit reasons, combined as a bitmask
pub mod tx_ctcss {
    pub const ALWAYS: u8 = 1 << 0;
    pub const SQL_OPEN: u8 = 1 << 1;
    pub const LOGIC: u8 = 1 << 2;
    pub const MODULE: u8 = 1 << 3;
    pub const ANNOUNCEMENT: u8 = 1 << 4;
}

/// Values dispatched by the command registry
#[derive(Debug, Clone, PartialEq, Eq)]
enum CmdAction {
    ActivateModule(i32),
    Link(String),
    ChangeLanguage,
    QsoRecorder,
    Online,
}

const MSG_PUMP_BLOCK: usize = 512;
const TX_MIX_BLOCK: usize = 4096;
const DEFAULT_INJECTED_DIGIT_MS: u64 = 100;

/// Common machinery shared by every logic variant
pub struct LogicCore {
    name: String,
    cfg: SharedConfig,
    sample_rate: u32,
    callsign: String,

    rx: Box<dyn Receiver>,
    tx: Box<dyn Transmitter>,
    event_engine: Box<dyn EventScriptEngine>,

    msg_handler: MessageHandler,
    aggregator: DtmfAggregator,
    parser: CmdParser<CmdAction>,
    macros: MacroTable,
    macro_prefix: String,
    modules: ModuleRegistry,
    active_module: Option<usize>,
    cmd_queue: VecDeque<String>,

    // Audio graph
    rx_valve: Valve,
    rpt_valve: Arc<Mutex<Valve>>,
    event_recorder: Arc<Mutex<WavRecorderSink>>,
    recorder_branch: BranchId,
    rx_splitter_ref: Arc<Mutex<Splitter>>,
    module_in: Arc<Mutex<Collector>>,
    module_sel_link_port: SelectorPort,
    link_in_ssdet: StreamStateDetector,
    module_splitter: Splitter,
    module_ssdet: Arc<Mutex<StreamStateDetector>>,
    tx_ssdet: Arc<Mutex<StreamStateDetector>>,
    tx_fifo: Arc<Mutex<Fifo>>,
    link_out: Arc<Mutex<Collector>>,
    fx_amp: AmplifierSink,
    msg_pacer: Arc<Mutex<Pacer>>,
    mixer: Mixer,
    mixer_program_in: MixerInput,

    qso_recorder: Option<QsoRecorder>,
    qso_rx_port: Option<SelectorPort>,

    // State
    is_online: bool,
    online_cmd: Option<String>,
    normal_tx_ctrl_mode: TxCtrlMode,
    sql_open: bool,
    tx_ctcss_mask: u8,
    tx_ctcss_active: u8,
    tx_program_active: bool,
    tx_flushed: bool,
    last_announcement: bool,
    fx_gain_normal: i32,
    fx_gain_low: i32,
    received_tg: u32,
    ctcss_to_tg: HashMap<u32, u32>,
    ctcss_to_tg_timer: Timer,
    last_ctcss_fq: f32,
    report_ctcss: bool,
    ctcss_reported: bool,
    exec_on_sql_close: Option<Timer>,
    record_timer: Option<Timer>,
    long_cmd_digits: usize,
    long_cmd_module: Option<String>,
    sel5_range: Option<(String, String)>,

    pending_state_events: VecDeque<(String, String)>,
    pending_link_cmds: VecDeque<(String, String)>,
    pending_custom_actions: VecDeque<ScriptAction>,
    module_stream_events: VecDeque<StreamEvent>,
}

impl LogicCore {
    pub fn new(
        name: &str,
        cfg: SharedConfig,
        sample_rate: u32,
        rx: Box<dyn Receiver>,
        tx: Box<dyn Transmitter>,
        event_engine: Box<dyn EventScriptEngine>,
    ) -> Self {
        // TX chain: selector → ssdet → fifo; the fifo is drained into the
        // mixer's program input from tick().
        let tx_fifo = shared(Fifo::new(
            rg_core::sample::ms_to_samples(100, sample_rate),
            sample_rate as usize * 4,
        ));
        let tx_ssdet = {
            let mut det = StreamStateDetector::new(0);
            det.set_output(Box::new(tx_fifo.clone()));
            shared(det)
        };
        let tx_selector = Selector::new();
        tx_selector.set_output(Box::new(tx_ssdet.clone()));

        let rpt_port = tx_selector.add_source(20, true);
        let link_tx_port = tx_selector.add_source(10, true);
        let module_tx_port = tx_selector.add_source(0, true);

        let link_out = shared(Collector::new());

        // Module fan-in: receiver audio beats link audio
        let module_selector = Selector::new();
        let module_in = shared(Collector::new());
        module_selector.set_output(Box::new(module_in.clone()));
        let module_sel_rx_port = module_selector.add_source(10, true);
        let module_sel_link_port = module_selector.add_source(0, true);

        // Link input side chain towards TX
        let mut link_in_ssdet = StreamStateDetector::new(0);
        link_in_ssdet.set_output(Box::new(link_tx_port));

        // Module audio fan-out
        let module_ssdet = {
            let mut det = StreamStateDetector::new(0);
            det.set_output(Box::new(module_tx_port));
            shared(det)
        };
        let mut module_splitter = Splitter::new();
        module_splitter.add_sink(Box::new(module_ssdet.clone()));
        module_splitter.add_sink(Box::new(link_out.clone()));

        // RX fan-out behind the RX valve
        let rpt_valve = {
            let mut v = Valve::new(false);
            v.set_output(Box::new(rpt_port));
            shared(v)
        };
        let event_recorder = shared(WavRecorderSink::new(sample_rate));
        let mut rx_splitter = Splitter::new();
        rx_splitter.add_sink(Box::new(module_sel_rx_port));
        rx_splitter.add_sink(Box::new(link_out.clone()));
        rx_splitter.add_sink(Box::new(rpt_valve.clone()));
        let recorder_branch = rx_splitter.add_sink(Box::new(event_recorder.clone()));
        let rx_splitter_ref = shared(rx_splitter);

        let mut rx_valve = Valve::new(false);
        rx_valve.set_output(Box::new(rx_splitter_ref.clone()));
        rx_splitter_ref.lock().enable_sink(recorder_branch, false);

        // Message chain: handler → fx gain → pacer → mixer input
        let mixer = Mixer::new();
        let mixer_program_in = mixer.add_input();
        let mixer_msg_in = mixer.add_input();
        let msg_pacer = {
            let mut p = Pacer::new(sample_rate);
            p.set_output(Box::new(mixer_msg_in));
            shared(p)
        };
        let mut fx_amp = AmplifierSink::new(1000);
        fx_amp.set_output(Box::new(msg_pacer.clone()));

        Self {
            name: name.to_string(),
            cfg,
            sample_rate,
            callsign: String::new(),
            rx,
            tx,
            event_engine,
            msg_handler: MessageHandler::new(sample_rate),
            aggregator: DtmfAggregator::new(),
            parser: CmdParser::new(),
            macros: MacroTable::default(),
            macro_prefix: String::new(),
            modules: ModuleRegistry::new(),
            active_module: None,
            cmd_queue: VecDeque::new(),
            rx_valve,
            rpt_valve,
            event_recorder,
            recorder_branch,
            rx_splitter_ref,
            module_in,
            module_sel_link_port,
            link_in_ssdet,
            module_splitter,
            module_ssdet,
            tx_ssdet,
            tx_fifo,
            link_out,
            fx_amp,
            msg_pacer,
            mixer,
            mixer_program_in,
            qso_recorder: None,
            qso_rx_port: None,
            is_online: true,
            online_cmd: None,
            normal_tx_ctrl_mode: TxCtrlMode::Off,
            sql_open: false,
            tx_ctcss_mask: 0,
            tx_ctcss_active: 0,
            tx_program_active: false,
            tx_flushed: true,
            last_announcement: false,
            fx_gain_normal: 1000,
            fx_gain_low: 250,
            received_tg: 0,
            ctcss_to_tg: HashMap::new(),
            ctcss_to_tg_timer: Timer::one_shot(1000),
            last_ctcss_fq: 0.0,
            report_ctcss: false,
            ctcss_reported: false,
            exec_on_sql_close: None,
            record_timer: None,
            long_cmd_digits: 0,
            long_cmd_module: None,
            sel5_range: None,
            pending_state_events: VecDeque::new(),
            pending_link_cmds: VecDeque::new(),
            pending_custom_actions: VecDeque::new(),
            module_stream_events: VecDeque::new(),
        }
    }

    /// Read configuration, register the built-in commands, load the event
    /// script and announce startup.
    pub fn initialize(&mut self, now_ms: u64) -> CoreResult<()> {
        let (
            callsign,
            online,
            online_cmd,
            macro_prefix,
            macro_section,
            sel5,
            tx_ctcss_list,
            fx_normal,
            fx_low,
            long_cmd,
            qso_cfg,
            exec_sql_close,
            report_ctcss,
            ctcss_to_tg,
            ctcss_delay,
            script,
        );
        {
            let cfg = self.cfg.lock();
            let name = self.name.as_str();
            callsign = cfg.value(name, "CALLSIGN").unwrap_or_default().to_string();
            online = cfg.get_or::<u8>(name, "ONLINE", 1)? != 0;
            online_cmd = cfg.value(name, "ONLINE_CMD").map(str::to_string);
            macro_prefix = cfg.value(name, "MACRO_PREFIX").unwrap_or("D").to_string();
            macro_section = cfg.value(name, "MACROS").map(str::to_string);
            sel5 = cfg.value(name, "SEL5_MACRO_RANGE").map(str::to_string);
            tx_ctcss_list = cfg.value(name, "TX_CTCSS").unwrap_or_default().to_string();
            fx_normal = cfg.get_or(name, "FX_GAIN_NORMAL", 1000)?;
            fx_low = cfg.get_or(name, "FX_GAIN_LOW", 250)?;
            long_cmd = cfg
                .value(name, "ACTIVATE_MODULE_ON_LONG_CMD")
                .map(str::to_string);
            qso_cfg = cfg.value(name, "QSO_RECORDER").map(str::to_string);
            exec_sql_close = cfg.get::<u64>(name, "EXEC_CMD_ON_SQL_CLOSE")?;
            report_ctcss = cfg.get_or::<u8>(name, "REPORT_CTCSS", 0)? != 0;
            ctcss_to_tg = cfg.value(name, "CTCSS_TO_TG").map(str::to_string);
            ctcss_delay = cfg.get_or(name, "CTCSS_TO_TG_DELAY", 1000)?;
            script = cfg.value(name, "EVENT_HANDLER").map(str::to_string);
        }

        self.callsign = callsign;
        self.is_online = online;
        self.macro_prefix = macro_prefix;
        self.fx_gain_normal = fx_normal;
        self.fx_gain_low = fx_low;
        self.report_ctcss = report_ctcss;
        self.ctcss_to_tg_timer.set_timeout(ctcss_delay);
        self.fx_amp.set_gain(self.fx_gain_normal);

        if let Some(cmd) = online_cmd {
            self.parser.add_cmd(&cmd, CmdAction::Online);
            self.online_cmd = Some(cmd);
        }
        self.parser.add_cmd("00", CmdAction::ChangeLanguage);

        if let Some(section) = macro_section {
            self.macros = MacroTable::load(&self.cfg.lock(), &section);
        }

        if let Some(range) = sel5 {
            let Some((from, to)) = range.split_once(',') else {
                return Err(rg_core::CoreError::InvalidValue(
                    format!("{}/SEL5_MACRO_RANGE", self.name),
                    range,
                ));
            };
            self.sel5_range = Some((from.trim().to_string(), to.trim().to_string()));
        }

        for reason in tx_ctcss_list
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
        {
            self.tx_ctcss_mask |= match reason {
                "ALWAYS" => tx_ctcss::ALWAYS,
                "SQL_OPEN" => tx_ctcss::SQL_OPEN,
                "LOGIC" => tx_ctcss::LOGIC,
                "MODULE" => tx_ctcss::MODULE,
                "ANNOUNCEMENT" => tx_ctcss::ANNOUNCEMENT,
                other => {
                    return Err(rg_core::CoreError::InvalidValue(
                        format!("{}/TX_CTCSS", self.name),
                        other.to_string(),
                    ));
                }
            };
        }
        self.update_tx_ctcss(tx_ctcss::ALWAYS, true);

        if let Some(spec) = long_cmd {
            let Some((digits, module)) = spec.split_once(':') else {
                return Err(rg_core::CoreError::InvalidValue(
                    format!("{}/ACTIVATE_MODULE_ON_LONG_CMD", self.name),
                    spec,
                ));
            };
            self.long_cmd_digits = digits.trim().parse().map_err(|_| {
                rg_core::CoreError::InvalidValue(
                    format!("{}/ACTIVATE_MODULE_ON_LONG_CMD", self.name),
                    digits.to_string(),
                )
            })?;
            self.long_cmd_module = Some(module.trim().to_string());
        }

        if let Some(spec) = qso_cfg {
            let (cmd, section) = spec.split_once(':').unwrap_or((spec.as_str(), "QsoRecorder"));
            let recorder =
                QsoRecorder::from_config(&self.cfg.lock(), section, &self.name, self.sample_rate)?;
            let port = recorder.add_source(10);
            if !cmd.is_empty() {
                self.parser.add_cmd(cmd, CmdAction::QsoRecorder);
            }
            self.qso_rx_port = Some(port);
            self.qso_recorder = Some(recorder);
        }

        if let Some(ms) = exec_sql_close {
            self.exec_on_sql_close = Some(Timer::one_shot(ms));
        }

        if let Some(map) = ctcss_to_tg {
            for pair in map.split(',').filter(|s| !s.is_empty()) {
                let Some((fq, tg)) = pair.split_once(':') else {
                    return Err(rg_core::CoreError::InvalidValue(
                        format!("{}/CTCSS_TO_TG", self.name),
                        pair.to_string(),
                    ));
                };
                let fq: f32 = fq.trim().parse().map_err(|_| {
                    rg_core::CoreError::InvalidValue(
                        format!("{}/CTCSS_TO_TG", self.name),
                        pair.to_string(),
                    )
                })?;
                let tg: u32 = tg.trim().parse().map_err(|_| {
                    rg_core::CoreError::InvalidValue(
                        format!("{}/CTCSS_TO_TG", self.name),
                        pair.to_string(),
                    )
                })?;
                self.ctcss_to_tg.insert((fq * 10.0).round() as u32, tg);
            }
        }

        // Modules register before initialize; MODULES names ones the
        // configuration expects to exist
        let wanted_modules = self.cfg.lock().get_list(&self.name, "MODULES");
        for module in wanted_modules {
            let short = module.strip_prefix("Module").unwrap_or(&module);
            if self.modules.find_by_name(short).is_none() {
                log::warn!(
                    "{}: configured module {module} is not registered in this build",
                    self.name
                );
            }
        }
        let ids: Vec<i32> = self.modules.ids().collect();
        for id in ids {
            self.parser
                .add_cmd(&id.to_string(), CmdAction::ActivateModule(id));
        }

        if let Some(path) = script {
            self.event_engine
                .load_script(Path::new(&path))
                .map_err(|e| {
                    rg_core::CoreError::Config(format!("event handler {path}: {e}"))
                })?;
        }
        let callsign = self.callsign.clone();
        if let Err(e) = self
            .event_engine
            .set_variable(&self.name, "CALLSIGN", &callsign)
        {
            log::warn!("{}: could not export CALLSIGN to script: {e}", self.name);
        }
        if !self.is_online {
            self.tx.set_tx_ctrl_mode(TxCtrlMode::Off);
        }
        self.process_event("startup", now_ms);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn callsign(&self) -> &str {
        &self.callsign
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn config(&self) -> &SharedConfig {
        &self.cfg
    }

    pub fn is_online(&self) -> bool {
        self.is_online
    }

    pub fn sql_is_open(&self) -> bool {
        self.sql_open
    }

    pub fn received_tg(&self) -> u32 {
        self.received_tg
    }

    /// Digits collected so far towards the next command
    pub fn dtmf_buffer(&self) -> &str {
        self.aggregator.buffer()
    }

    pub fn rx(&mut self) -> &mut dyn Receiver {
        self.rx.as_mut()
    }

    pub fn tx(&mut self) -> &mut dyn Transmitter {
        self.tx.as_mut()
    }

    pub fn msg(&mut self) -> &mut MessageHandler {
        &mut self.msg_handler
    }

    pub fn modules_mut(&mut self) -> &mut ModuleRegistry {
        &mut self.modules
    }

    pub fn add_module(&mut self, module: Box<dyn crate::module::Module>) {
        self.modules.add(module);
    }

    pub fn active_module_name(&self) -> Option<&str> {
        self.active_module.and_then(|i| self.modules.name_of(i))
    }

    pub fn set_rx_valve_open(&mut self, open: bool) {
        self.rx_valve.set_open(open);
    }

    pub fn set_rpt_valve_open(&self, open: bool) {
        self.rpt_valve.lock().set_open(open);
    }

    /// Remember and apply the wanted TX control mode; while offline only
    /// the remembered value changes.
    pub fn set_tx_ctrl_mode(&mut self, mode: TxCtrlMode) {
        self.normal_tx_ctrl_mode = mode;
        if self.is_online {
            self.tx.set_tx_ctrl_mode(mode);
        }
    }

    /// True when nothing is happening: squelch closed, no pending
    /// messages, no program audio, module idle.
    pub fn is_idle(&self) -> bool {
        !self.sql_open
            && self.msg_handler.is_idle()
            && !self.tx_program_active
            && self.active_module.is_none()
    }

    pub fn tx_ctcss_is_on(&self) -> bool {
        (self.tx_ctcss_active & self.tx_ctcss_mask) != 0
    }

    /// Earliest deadline among the core's embedded timers
    pub fn next_deadline(&self) -> Option<u64> {
        [
            self.aggregator.next_deadline(),
            self.ctcss_to_tg_timer.deadline(),
            self.exec_on_sql_close.as_ref().and_then(Timer::deadline),
            self.record_timer.as_ref().and_then(Timer::deadline),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn publish_state_event(&mut self, name: &str, msg: &str) {
        self.pending_state_events
            .push_back((name.to_string(), msg.to_string()));
    }

    pub fn take_state_events(&mut self) -> Vec<(String, String)> {
        self.pending_state_events.drain(..).collect()
    }

    pub fn take_link_cmds(&mut self) -> Vec<(String, String)> {
        self.pending_link_cmds.drain(..).collect()
    }

    pub fn take_custom_actions(&mut self) -> Vec<ScriptAction> {
        self.pending_custom_actions.drain(..).collect()
    }

    /// Module audio activity edges seen since the last call
    pub fn take_module_stream_events(&mut self) -> Vec<StreamEvent> {
        self.module_stream_events.drain(..).collect()
    }

    /// Register a link command so the prefix registry routes it here
    pub fn register_link_cmd(&mut self, base_cmd: &str) -> bool {
        self.parser
            .add_cmd(base_cmd, CmdAction::Link(base_cmd.to_string()))
    }

    pub fn deregister_link_cmd(&mut self, base_cmd: &str) -> bool {
        self.parser.remove_cmd(base_cmd)
    }

    // ------------------------------------------------------------------
    // Audio towards and from other logics
    // ------------------------------------------------------------------

    /// Receiver-side audio from a non-radio source (network far end,
    /// phone line); takes the same path as driver audio through the RX
    /// valve.
    pub fn write_rx_audio(&mut self, samples: &[Sample]) {
        self.rx_valve.write(samples);
    }

    pub fn flush_rx_audio(&mut self) {
        self.rx_valve.flush();
    }

    /// Audio arriving from connected logics
    pub fn write_link_in(&mut self, samples: &[Sample]) {
        self.module_sel_link_port.write(samples);
        self.link_in_ssdet.write(samples);
    }

    pub fn flush_link_in(&mut self) {
        self.module_sel_link_port.flush();
        self.link_in_ssdet.flush();
    }

    /// Drain audio destined for connected logics
    pub fn take_link_out(&mut self) -> Vec<Sample> {
        self.link_out.lock().take_all()
    }

    /// True when the outgoing link stream has flushed and been drained
    pub fn link_out_stream_done(&self) -> bool {
        self.link_out.lock().stream_done()
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    /// Default handling for a receiver event
    pub fn handle_rx_event(&mut self, ev: RxEvent, now_ms: u64) {
        match ev {
            RxEvent::SquelchOpen(open) => self.squelch_open(open, now_ms),
            RxEvent::DtmfDigit { digit, duration_ms } => {
                self.dtmf_digit_received(digit, duration_ms, now_ms)
            }
            RxEvent::CtcssDetected(fq) => {
                self.last_ctcss_fq = fq;
                self.ctcss_to_tg_timer.reset(now_ms);
                if self.report_ctcss && !self.ctcss_reported {
                    self.ctcss_reported = true;
                    self.process_event(&format!("report_ctcss {fq:.1}"), now_ms);
                }
            }
            RxEvent::SelcallSequence(seq) => self.selcall_received(&seq, now_ms),
            RxEvent::FmsMessage(msg) => {
                self.process_event(&format!("fms_message {msg}"), now_ms);
            }
            RxEvent::Samples(samples) => self.rx_valve.write(&samples),
            RxEvent::ToneDetected(_) | RxEvent::ToneDuration { .. } => {}
        }
    }

    /// Drain pending receiver events
    pub fn drain_rx_events(&mut self) -> Vec<RxEvent> {
        self.rx.poll_events()
    }

    pub fn squelch_open(&mut self, open: bool, now_ms: u64) {
        if self.sql_open == open {
            return;
        }
        self.sql_open = open;
        log::info!("{}: The squelch is {}", self.name, if open { "OPEN" } else { "CLOSED" });
        self.update_tx_ctcss(tx_ctcss::SQL_OPEN, open);
        if let Some(idx) = self.active_module
            && let Some(m) = self.modules.get_mut(idx)
        {
            m.squelch_open(open);
        }
        if open {
            self.ctcss_reported = false;
            if let Some(t) = self.exec_on_sql_close.as_mut() {
                t.stop();
            }
        } else {
            if let Some(t) = self.exec_on_sql_close.as_mut() {
                t.start(now_ms);
            }
            // The receiver stream ends with the carrier
            self.rx_valve.flush();
            self.process_command_queue(now_ms);
        }
        self.process_event(&format!("squelch_open {}", open as u8), now_ms);
    }

    pub fn dtmf_digit_received(&mut self, digit: char, duration_ms: u64, now_ms: u64) {
        log::info!("{}: digit={digit} duration={duration_ms} ms", self.name);
        if let Some(idx) = self.active_module
            && let Some(m) = self.modules.get_mut(idx)
            && m.dtmf_digit_received(digit, duration_ms)
        {
            return;
        }
        if let Some(cmd) = self.aggregator.digit_received(digit, now_ms) {
            self.enqueue_command(cmd, now_ms);
        }
    }

    /// Inject digits as if they had been received over the air
    pub fn inject_dtmf_digits(&mut self, digits: &str, duration_ms: u64, now_ms: u64) {
        for digit in digits.chars() {
            self.dtmf_digit_received(digit, duration_ms, now_ms);
        }
    }

    fn selcall_received(&mut self, seq: &str, now_ms: u64) {
        if let Some((from, to)) = self.sel5_range.clone()
            && seq.len() == from.len()
            && *seq >= *from
            && *seq <= *to
        {
            let cmd = format!("{}{}", self.macro_prefix, seq);
            self.process_macro_cmd(&cmd, now_ms);
            return;
        }
        self.process_event(&format!("selcall_sequence_detected {seq}"), now_ms);
    }

    // ------------------------------------------------------------------
    // Command pipeline
    // ------------------------------------------------------------------

    fn enqueue_command(&mut self, cmd: String, now_ms: u64) {
        if !self.is_online {
            // The only thing an offline logic listens to is its own
            // online command
            let back_online = self
                .online_cmd
                .as_ref()
                .is_some_and(|oc| cmd == *oc || cmd == format!("{oc}1"));
            if back_online {
                self.set_online(true, now_ms);
            } else {
                log::info!("{}: offline, ignoring command {cmd}", self.name);
            }
            return;
        }
        self.cmd_queue.push_back(cmd);
        if !self.sql_open {
            self.process_command_queue(now_ms);
        }
    }

    fn process_command_queue(&mut self, now_ms: u64) {
        while !self.sql_open {
            let Some(cmd) = self.cmd_queue.pop_front() else {
                break;
            };
            self.process_command(&cmd, false, now_ms);
        }
    }

    fn process_command(&mut self, cmd: &str, force_core: bool, now_ms: u64) {
        if cmd.is_empty() {
            return;
        }
        log::info!("{}: command received: {cmd}", self.name);

        let result = self.process_event_ret(&format!("dtmf_cmd_received \"{cmd}\""), now_ms);
        if result_is_handled(&result) {
            return;
        }

        if let Some(rest) = cmd.strip_prefix('*') {
            let rest = rest.to_string();
            self.process_command(&rest, true, now_ms);
            return;
        }

        if !self.macro_prefix.is_empty()
            && cmd.starts_with(self.macro_prefix.as_str())
            && cmd.len() > self.macro_prefix.len()
        {
            self.process_macro_cmd(cmd, now_ms);
            return;
        }

        if !force_core
            && let Some(idx) = self.active_module
        {
            let cmd = cmd.to_string();
            if let Some(m) = self.modules.get_mut(idx) {
                m.dtmf_cmd_received(&cmd);
            }
            return;
        }

        if self.long_cmd_digits > 0
            && cmd.len() >= self.long_cmd_digits
            && let Some(module) = self.long_cmd_module.clone()
        {
            if self.activate_module_by_name(&module, now_ms) {
                let cmd = cmd.to_string();
                if let Some(idx) = self.active_module
                    && let Some(m) = self.modules.get_mut(idx)
                {
                    m.dtmf_cmd_received(&cmd);
                }
            }
            return;
        }

        match self.parser.process_cmd(cmd) {
            Some((action, sub)) => {
                let action = action.clone();
                let sub = sub.to_string();
                self.exec_cmd_action(action, &sub, now_ms);
            }
            None => {
                self.process_event(&format!("unknown_command {cmd}"), now_ms);
            }
        }
    }

    fn exec_cmd_action(&mut self, action: CmdAction, sub: &str, now_ms: u64) {
        match action {
            CmdAction::ActivateModule(id) => {
                let Some(idx) = self.modules.find_by_id(id) else {
                    return;
                };
                if self.activate_module_idx(idx, now_ms) && !sub.is_empty() {
                    let sub = sub.to_string();
                    if let Some(m) = self.modules.get_mut(idx) {
                        m.dtmf_cmd_received(&sub);
                    }
                }
            }
            CmdAction::Online => match sub {
                "0" => self.set_online(false, now_ms),
                "1" => self.set_online(true, now_ms),
                _ => self.process_event(&format!("command_failed {sub}"), now_ms),
            },
            CmdAction::ChangeLanguage => {
                self.process_event(&format!("change_language {sub}"), now_ms);
            }
            CmdAction::QsoRecorder => {
                let enable = match sub {
                    "1" => true,
                    "0" => false,
                    _ => {
                        self.process_event(&format!("command_failed {sub}"), now_ms);
                        return;
                    }
                };
                if let Some(q) = self.qso_recorder.as_mut() {
                    q.set_enabled(enable, now_ms);
                    self.publish_state_event("qso_recorder", if enable { "1" } else { "0" });
                }
            }
            CmdAction::Link(base) => {
                self.pending_link_cmds.push_back((base, sub.to_string()));
            }
        }
    }

    fn process_macro_cmd(&mut self, cmd: &str, now_ms: u64) {
        let id = &cmd[self.macro_prefix.len()..];
        let expansion = match self.macros.expand(id) {
            Ok(e) => e,
            Err(MacroError::NotFound) => {
                self.process_event("macro_not_found", now_ms);
                return;
            }
            Err(MacroError::Empty) => {
                self.process_event("macro_empty", now_ms);
                return;
            }
            Err(MacroError::SyntaxError) => {
                self.process_event("macro_syntax_error", now_ms);
                return;
            }
        };

        if expansion.module_name.is_empty() {
            let digits = expansion.module_cmd;
            self.inject_dtmf_digits(&digits, DEFAULT_INJECTED_DIGIT_MS, now_ms);
            self.inject_dtmf_digits("#", DEFAULT_INJECTED_DIGIT_MS, now_ms);
            return;
        }

        let Some(idx) = self.modules.find_by_name(&expansion.module_name) else {
            self.process_event("macro_module_not_found", now_ms);
            return;
        };
        match self.active_module {
            Some(cur) if cur != idx => {
                // Another module is active: report, do not activate
                self.process_event("macro_another_active_module", now_ms);
                return;
            }
            Some(_) => {}
            None => {
                if !self.activate_module_idx(idx, now_ms) {
                    self.process_event("macro_module_activation_failed", now_ms);
                    return;
                }
            }
        }
        let digits = expansion.module_cmd;
        self.inject_dtmf_digits(&digits, DEFAULT_INJECTED_DIGIT_MS, now_ms);
        self.inject_dtmf_digits("#", DEFAULT_INJECTED_DIGIT_MS, now_ms);
    }

    // ------------------------------------------------------------------
    // Modules
    // ------------------------------------------------------------------

    pub fn activate_module_by_name(&mut self, name: &str, now_ms: u64) -> bool {
        match self.modules.find_by_name(name) {
            Some(idx) => self.activate_module_idx(idx, now_ms),
            None => false,
        }
    }

    fn activate_module_idx(&mut self, idx: usize, now_ms: u64) -> bool {
        if !self.is_online {
            return false;
        }
        match self.active_module {
            Some(cur) if cur == idx => return true,
            Some(_) => {
                self.process_event("command_failed module_active", now_ms);
                return false;
            }
            None => {}
        }
        self.active_module = Some(idx);
        let name = self
            .modules
            .name_of(idx)
            .unwrap_or_default()
            .to_string();
        if let Some(m) = self.modules.get_mut(idx) {
            m.activate();
        }
        log::info!("{}: activating module {name}", self.name);
        self.publish_state_event("active_module", &name);
        self.process_event(&format!("module_activated {name}"), now_ms);
        true
    }

    pub fn deactivate_module(&mut self, now_ms: u64) {
        if let Some(idx) = self.active_module.take() {
            let name = self
                .modules
                .name_of(idx)
                .unwrap_or_default()
                .to_string();
            if let Some(m) = self.modules.get_mut(idx) {
                m.deactivate();
            }
            self.module_splitter.flush();
            log::info!("{}: deactivating module {name}", self.name);
            self.publish_state_event("active_module", "");
            self.process_event(&format!("module_deactivated {name}"), now_ms);
        }
    }

    // ------------------------------------------------------------------
    // Online state
    // ------------------------------------------------------------------

    pub fn set_online(&mut self, online: bool, now_ms: u64) {
        if self.is_online == online {
            return;
        }
        self.is_online = online;
        log::info!("{}: logic is now {}", self.name, if online { "ONLINE" } else { "OFFLINE" });
        self.cfg
            .lock()
            .set_value(&self.name, "ONLINE", if online { "1" } else { "0" });
        if online {
            self.tx.set_tx_ctrl_mode(self.normal_tx_ctrl_mode);
        } else {
            self.deactivate_module(now_ms);
            self.tx.set_tx_ctrl_mode(TxCtrlMode::Off);
        }
        self.publish_state_event("logic_online", if online { "1" } else { "0" });
        self.process_event(&format!("logic_online {}", online as u8), now_ms);
    }

    // ------------------------------------------------------------------
    // TX CTCSS
    // ------------------------------------------------------------------

    fn update_tx_ctcss(&mut self, reason: u8, active: bool) {
        let was_on = self.tx_ctcss_is_on();
        if active {
            self.tx_ctcss_active |= reason;
        } else {
            self.tx_ctcss_active &= !reason;
        }
        let is_on = self.tx_ctcss_is_on();
        if is_on != was_on {
            self.tx.enable_ctcss(is_on);
        }
    }

    // ------------------------------------------------------------------
    // Talkgroups
    // ------------------------------------------------------------------

    pub fn set_received_tg(&mut self, tg: u32) {
        if self.received_tg != tg {
            self.received_tg = tg;
            log::info!("{}: received talkgroup #{tg}", self.name);
            self.publish_state_event("received_tg", &tg.to_string());
        }
    }

    // ------------------------------------------------------------------
    // Event script
    // ------------------------------------------------------------------

    /// Raise a named event in the logic's script namespace
    pub fn process_event(&mut self, event: &str, now_ms: u64) {
        let _ = self.process_event_ret(event, now_ms);
    }

    fn process_event_ret(&mut self, event: &str, now_ms: u64) -> String {
        // Plays staged by one event start together after it returns
        self.msg_handler.begin();
        let result = match self.event_engine.process_event(&self.name, event) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("{}: event \"{event}\" failed: {e}", self.name);
                String::new()
            }
        };
        let actions = self.event_engine.drain_actions();
        self.apply_script_actions(actions, now_ms);
        self.msg_handler.end();
        result
    }

    fn apply_script_actions(&mut self, actions: Vec<ScriptAction>, now_ms: u64) {
        for action in actions {
            match action {
                ScriptAction::PlayFile { path } => {
                    self.msg_handler.play_file(Path::new(&path), false);
                }
                ScriptAction::PlaySilence { length_ms } => {
                    self.msg_handler.play_silence(length_ms, false);
                }
                ScriptAction::PlayTone {
                    fq,
                    amp_permille,
                    length_ms,
                } => {
                    self.msg_handler.play_tone(fq, amp_permille, length_ms, false);
                }
                ScriptAction::PlayDtmf {
                    digits,
                    amp_permille,
                    length_ms,
                } => {
                    for digit in digits.chars() {
                        self.msg_handler
                            .play_dtmf(digit, amp_permille, length_ms, false);
                    }
                }
                ScriptAction::RecordStart { path, max_ms } => {
                    self.start_recording(&path, max_ms, now_ms);
                }
                ScriptAction::RecordStop => self.stop_recording(),
                ScriptAction::DeactivateModule => self.deactivate_module(now_ms),
                ScriptAction::PublishStateEvent { name, msg } => {
                    self.pending_state_events.push_back((name, msg));
                }
                ScriptAction::InjectDtmf { digits, duration_ms } => {
                    self.inject_dtmf_digits(&digits, duration_ms, now_ms);
                }
                ScriptAction::SetConfigValue { .. } => {
                    // Already applied by the engine's config callback
                }
                custom @ ScriptAction::Custom { .. } => {
                    self.pending_custom_actions.push_back(custom);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Event-triggered recording
    // ------------------------------------------------------------------

    fn start_recording(&mut self, path: &str, max_ms: u64, now_ms: u64) {
        {
            let mut rec = self.event_recorder.lock();
            if rec.is_open() {
                let _ = rec.close();
            }
            if let Err(e) = rec.open(Path::new(path)) {
                log::error!("*** ERROR: {}: could not start recording: {e}", self.name);
                return;
            }
        }
        self.rx_splitter_ref
            .lock()
            .enable_sink(self.recorder_branch, true);
        self.record_timer = (max_ms > 0).then(|| Timer::one_shot(max_ms));
        if let Some(t) = self.record_timer.as_mut() {
            t.start(now_ms);
        }
    }

    fn stop_recording(&mut self) {
        self.rx_splitter_ref
            .lock()
            .enable_sink(self.recorder_branch, false);
        let mut rec = self.event_recorder.lock();
        if rec.is_open()
            && let Err(e) = rec.close()
        {
            log::warn!("*** WARNING: {}: recording close failed: {e}", self.name);
        }
        self.record_timer = None;
    }

    // ------------------------------------------------------------------
    // Periodic pump
    // ------------------------------------------------------------------

    /// Run timers and move audio through the TX side. Call once per loop
    /// iteration.
    pub fn tick(&mut self, now_ms: u64) {
        self.aggregator.tick(now_ms);

        if let Some(t) = self.exec_on_sql_close.as_mut()
            && t.poll(now_ms)
            && let Some(cmd) = self.aggregator.force_command_complete()
        {
            self.enqueue_command(cmd, now_ms);
        }

        if self.ctcss_to_tg_timer.poll(now_ms) {
            let key = (self.last_ctcss_fq * 10.0).round() as u32;
            if let Some(&tg) = self.ctcss_to_tg.get(&key) {
                self.set_received_tg(tg);
            }
            self.last_ctcss_fq = 0.0;
        }

        if let Some(t) = self.record_timer.as_mut()
            && t.poll(now_ms)
        {
            self.stop_recording();
        }

        // Audio routed to the active module
        let to_module = self.module_in.lock().take_all();
        if !to_module.is_empty()
            && let Some(idx) = self.active_module
            && let Some(m) = self.modules.get_mut(idx)
        {
            m.audio_in(&to_module);
        }

        // Module audio towards TX and links
        if let Some(idx) = self.active_module {
            let mut buf = [0 as Sample; MSG_PUMP_BLOCK];
            if let Some(m) = self.modules.get_mut(idx) {
                let n = m.read_audio(&mut buf);
                if n > 0 {
                    self.module_splitter.write(&buf[..n]);
                }
            }
        }

        // Stream state bookkeeping
        self.link_in_ssdet.tick(now_ms);
        for ev in self.link_in_ssdet.take_events() {
            let active = ev == StreamEvent::Activated;
            self.update_tx_ctcss(tx_ctcss::LOGIC, active);
        }
        {
            let events = {
                let mut det = self.module_ssdet.lock();
                det.tick(now_ms);
                det.take_events()
            };
            for ev in events {
                let active = ev == StreamEvent::Activated;
                self.update_tx_ctcss(tx_ctcss::MODULE, active);
                self.module_stream_events.push_back(ev);
            }
        }
        {
            let events = {
                let mut det = self.tx_ssdet.lock();
                det.tick(now_ms);
                det.take_events()
            };
            for ev in events {
                self.tx_program_active = ev == StreamEvent::Activated;
                // Announcements duck under live program audio
                let gain = if self.tx_program_active {
                    self.fx_gain_low
                } else {
                    self.fx_gain_normal
                };
                self.fx_amp.set_gain(gain);
            }
        }

        let announcing = self.msg_handler.is_writing_message();
        if announcing != self.last_announcement {
            self.last_announcement = announcing;
            self.update_tx_ctcss(tx_ctcss::ANNOUNCEMENT, announcing);
        }

        // Message audio: handler → fx gain → pacer → mixer
        let mut buf = [0 as Sample; MSG_PUMP_BLOCK];
        let n = self.msg_handler.read(&mut buf);
        if n > 0 {
            self.fx_amp.write(&buf[..n]);
        }
        for ev in self.msg_handler.take_events() {
            match ev {
                MsgEvent::AllMsgsWritten => {
                    self.fx_amp.flush();
                    if let Some(idx) = self.active_module
                        && let Some(m) = self.modules.get_mut(idx)
                    {
                        m.all_msgs_written();
                    }
                    self.process_event("all_msgs_written", now_ms);
                }
            }
        }
        self.msg_pacer.lock().tick(now_ms);

        // Program audio: TX fifo → mixer
        {
            let mut fifo = self.tx_fifo.lock();
            let mut out = [0 as Sample; TX_MIX_BLOCK];
            let n = fifo.read(&mut out);
            if n > 0 {
                self.mixer_program_in.write(&out[..n]);
            }
            if fifo.stream_done() {
                self.mixer_program_in.flush();
                fifo.ack_stream_done();
            }
        }

        // Mix towards the transmitter
        let mixed = self.mixer.mix(TX_MIX_BLOCK);
        if !mixed.is_empty() {
            self.tx.write_samples(&mixed);
            self.tx_flushed = false;
        } else if !self.mixer.is_active() && !self.tx_flushed {
            self.tx.flush_samples();
            self.tx_flushed = true;
        }

        if let Some(q) = self.qso_recorder.as_mut() {
            q.tick(now_ms);
        }
    }

    /// Feed receiver audio into the QSO recorder as well
    pub fn qso_record(&mut self, samples: &[Sample]) {
        if let Some(port) = self.qso_rx_port.as_mut() {
            port.write(samples);
        }
    }

    pub fn qso_flush(&mut self) {
        if let Some(port) = self.qso_rx_port.as_mut() {
            port.flush();
        }
    }

    pub fn qso_recorder_mut(&mut self) -> Option<&mut QsoRecorder> {
        self.qso_recorder.as_mut()
    }

    /// Close files and say goodbye; the logic is unusable afterwards
    pub fn teardown(&mut self, now_ms: u64) {
        self.deactivate_module(now_ms);
        if let Some(q) = self.qso_recorder.as_mut() {
            q.finalize(now_ms);
        }
        self.stop_recording();
        self.rx_valve.flush();
    }
}

//! Repeater logic
//!
//! Keeps the transmitter keyed while the repeater is "up" and passes
//! receiver audio straight through to the transmitter. The repeater opens
//! on one of several triggers (carrier, tone burst, CTCSS, DTMF digit,
//! selcall, module audio or activation) and closes on idle timeout or
//! squelch-flap suppression.

use rg_core::{RxEvent, Timer, TxCtrlMode, earliest_deadline};

use crate::Logic;
use crate::logic::LogicCore;
use rg_audio::StreamEvent;

/// What happens when an open trigger fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlFlank {
    /// Open immediately
    Open,
    /// Arm and open when the squelch closes
    Close,
}

pub struct RepeaterLogic {
    core: LogicCore,
    repeater_up: bool,
    open_reason: String,
    pending_open_reason: Option<String>,
    activate_on_sql_close: bool,
    sql_flank: SqlFlank,
    no_repeat: bool,

    open_on_sql_ms: u64,
    open_on_sql_timer: Timer,
    open_on_tone_fq: f32,
    open_on_ctcss: Option<(f32, u64)>,
    open_on_ctcss_timer: Timer,
    open_on_dtmf: Option<char>,
    open_on_sel5: Option<String>,
    open_sql_after_close_ms: u64,

    idle_timeout_ms: u64,
    idle_timer: Timer,
    idle_sound_timer: Timer,
    ident_nag_timer: Timer,
    ident_nag_min_time_ms: u64,
    ident_heard: bool,
    rgr_enable: bool,
    rgr_timer: Timer,

    sql_flap_min_time_ms: u64,
    sql_flap_max_cnt: u32,
    short_sql_open_cnt: u32,

    sql_open_ms: u64,
    last_close_ms: Option<u64>,
    delayed_tg_activation: Option<u32>,
    last_active_module: Option<String>,
}

impl RepeaterLogic {
    pub fn new(core: LogicCore) -> Self {
        Self {
            core,
            repeater_up: false,
            open_reason: String::new(),
            pending_open_reason: None,
            activate_on_sql_close: false,
            sql_flank: SqlFlank::Open,
            no_repeat: false,
            open_on_sql_ms: 0,
            open_on_sql_timer: Timer::one_shot(0),
            open_on_tone_fq: 0.0,
            open_on_ctcss: None,
            open_on_ctcss_timer: Timer::one_shot(0),
            open_on_dtmf: None,
            open_on_sel5: None,
            open_sql_after_close_ms: 0,
            idle_timeout_ms: 0,
            idle_timer: Timer::one_shot(0),
            idle_sound_timer: Timer::periodic(0),
            ident_nag_timer: Timer::one_shot(0),
            ident_nag_min_time_ms: 2000,
            ident_heard: false,
            rgr_enable: true,
            rgr_timer: Timer::one_shot(0),
            sql_flap_min_time_ms: 1000,
            sql_flap_max_cnt: 0,
            short_sql_open_cnt: 0,
            sql_open_ms: 0,
            last_close_ms: None,
            delayed_tg_activation: None,
            last_active_module: None,
        }
    }

    pub fn initialize(&mut self, now_ms: u64) -> rg_core::CoreResult<()> {
        let tone_duration;
        {
            let cfg = self.core.config().clone();
            let cfg = cfg.lock();
            let name = self.core.name();

            self.idle_timeout_ms = cfg.get_or::<u64>(name, "IDLE_TIMEOUT", 0)? * 1000;
            self.idle_timer.set_timeout(self.idle_timeout_ms);

            self.open_on_sql_ms = cfg.get_or(name, "OPEN_ON_SQL", 0)?;
            self.open_on_sql_timer.set_timeout(self.open_on_sql_ms);

            tone_duration = cfg.get_or::<u64>(name, "OPEN_ON_1750", 0)?;
            self.open_on_tone_fq = 1750.0;

            if let Some(spec) = cfg.value(name, "OPEN_ON_CTCSS") {
                let Some((fq, dur)) = spec.split_once(':') else {
                    return Err(rg_core::CoreError::InvalidValue(
                        format!("{name}/OPEN_ON_CTCSS"),
                        spec.to_string(),
                    ));
                };
                let fq: f32 = fq.trim().parse().map_err(|_| {
                    rg_core::CoreError::InvalidValue(
                        format!("{name}/OPEN_ON_CTCSS"),
                        spec.to_string(),
                    )
                })?;
                let dur: u64 = dur.trim().parse().map_err(|_| {
                    rg_core::CoreError::InvalidValue(
                        format!("{name}/OPEN_ON_CTCSS"),
                        spec.to_string(),
                    )
                })?;
                self.open_on_ctcss = Some((fq, dur));
                self.open_on_ctcss_timer.set_timeout(dur);
            }

            self.open_on_dtmf = cfg
                .value(name, "OPEN_ON_DTMF")
                .and_then(|s| s.chars().next());
            self.open_on_sel5 = cfg.value(name, "OPEN_ON_SEL5").map(str::to_string);
            self.open_sql_after_close_ms =
                cfg.get_or::<u64>(name, "OPEN_ON_SQL_AFTER_RPT_CLOSE", 0)? * 1000;

            self.sql_flank = match cfg.value(name, "OPEN_SQL_FLANK").unwrap_or("OPEN") {
                "OPEN" => SqlFlank::Open,
                "CLOSE" => SqlFlank::Close,
                other => {
                    return Err(rg_core::CoreError::InvalidValue(
                        format!("{name}/OPEN_SQL_FLANK"),
                        other.to_string(),
                    ));
                }
            };

            let idle_sound: u64 = cfg.get_or(name, "IDLE_SOUND_INTERVAL", 0)?;
            if idle_sound > 0 {
                self.idle_sound_timer.set_timeout(idle_sound);
            }

            self.sql_flap_min_time_ms = cfg.get_or(name, "SQL_FLAP_SUP_MIN_TIME", 1000)?;
            self.sql_flap_max_cnt = cfg.get_or(name, "SQL_FLAP_SUP_MAX_CNT", 0)?;

            let nag: u64 = cfg.get_or(name, "IDENT_NAG_TIMEOUT", 0)?;
            self.ident_nag_timer.set_timeout(nag * 1000);
            self.ident_nag_min_time_ms = cfg.get_or(name, "IDENT_NAG_MIN_TIME", 2000)?;

            self.no_repeat = cfg.get_or::<u8>(name, "NO_REPEAT", 0)? != 0;
            let rgr_delay: u64 = cfg.get_or(name, "RGR_SOUND_DELAY", 0)?;
            self.rgr_timer.set_timeout(rgr_delay);
        }

        self.core.initialize(now_ms)?;
        self.core.set_rx_valve_open(true);
        self.core.set_tx_ctrl_mode(TxCtrlMode::Auto);

        if tone_duration > 0 && !self.core.rx().add_tone_detector(1750.0, 50.0, 10.0, tone_duration)
        {
            return Err(rg_core::CoreError::Config(format!(
                "{}: could not set up the 1750 Hz tone detector",
                self.core.name()
            )));
        }
        if let Some((fq, dur)) = self.open_on_ctcss
            && !self.core.rx().add_tone_detector(fq, 2.0, 10.0, dur)
        {
            return Err(rg_core::CoreError::Config(format!(
                "{}: could not set up the CTCSS open tone detector",
                self.core.name()
            )));
        }
        Ok(())
    }

    pub fn is_up(&self) -> bool {
        self.repeater_up
    }

    pub fn open_reason(&self) -> &str {
        &self.open_reason
    }

    pub fn activate_on_sql_close(&self) -> bool {
        self.activate_on_sql_close
    }

    /// Talkgroup selection arriving while the repeater is closed is
    /// deferred until it opens.
    pub fn remote_received_tg_updated(&mut self, tg: u32) {
        if self.repeater_up {
            self.core.set_received_tg(tg);
        } else {
            self.delayed_tg_activation = Some(tg);
        }
    }

    fn trigger_open(&mut self, reason: &str, now_ms: u64) {
        if self.repeater_up {
            return;
        }
        match self.sql_flank {
            SqlFlank::Open => self.set_up(true, reason.to_string(), now_ms),
            SqlFlank::Close => {
                if self.core.sql_is_open() {
                    self.activate_on_sql_close = true;
                    self.pending_open_reason = Some(format!("{reason}_CLOSE"));
                } else {
                    self.set_up(true, format!("{reason}_CLOSE"), now_ms);
                }
            }
        }
    }

    fn set_up(&mut self, up: bool, reason: String, now_ms: u64) {
        if up == self.repeater_up {
            return;
        }
        self.repeater_up = up;
        self.activate_on_sql_close = false;
        self.pending_open_reason = None;

        if up {
            self.open_reason = reason.clone();
            log::info!("{}: repeater UP ({reason})", self.core.name());
            self.core.set_tx_ctrl_mode(TxCtrlMode::On);
            self.core.set_rpt_valve_open(!self.no_repeat);
            self.short_sql_open_cnt = 0;
            self.ident_heard = false;
            if self.idle_timeout_ms > 0 {
                self.idle_timer.start(now_ms);
            }
            if self.idle_sound_timer.timeout() > 0 {
                self.idle_sound_timer.start(now_ms);
            }
            if self.ident_nag_timer.timeout() > 0 {
                self.ident_nag_timer.start(now_ms);
            }
            if let Some(tg) = self.delayed_tg_activation.take() {
                self.core.set_received_tg(tg);
            }
            self.core.publish_state_event("repeater_up", &reason);
            self.core
                .process_event(&format!("repeater_up {reason}"), now_ms);
        } else {
            log::info!("{}: repeater DOWN ({reason})", self.core.name());
            self.core.set_rpt_valve_open(false);
            self.core.set_tx_ctrl_mode(TxCtrlMode::Auto);
            self.idle_timer.stop();
            self.idle_sound_timer.stop();
            self.ident_nag_timer.stop();
            self.rgr_timer.stop();
            self.last_close_ms = Some(now_ms);
            self.core.publish_state_event("repeater_down", &reason);
            self.core
                .process_event(&format!("repeater_down {reason}"), now_ms);
        }
    }

    fn squelch_open(&mut self, open: bool, now_ms: u64) {
        if open {
            self.sql_open_ms = now_ms;
            if self.repeater_up {
                self.idle_timer.stop();
                self.rgr_timer.stop();
            } else {
                if self.open_on_sql_ms > 0 {
                    self.open_on_sql_timer.start(now_ms);
                }
                // Re-open on carrier shortly after a close
                if self.open_sql_after_close_ms > 0
                    && let Some(closed) = self.last_close_ms
                    && now_ms.saturating_sub(closed) <= self.open_sql_after_close_ms
                {
                    self.trigger_open("SQL_RPT_REOPEN", now_ms);
                }
            }
        } else {
            self.open_on_sql_timer.stop();
            self.open_on_ctcss_timer.stop();
            let open_duration = now_ms.saturating_sub(self.sql_open_ms);

            if self.repeater_up {
                // Squelch flap suppression
                if self.sql_flap_max_cnt > 0 {
                    if open_duration < self.sql_flap_min_time_ms {
                        self.short_sql_open_cnt += 1;
                        if self.short_sql_open_cnt >= self.sql_flap_max_cnt {
                            self.set_up(false, "SQL_FLAP_SUP".to_string(), now_ms);
                            return;
                        }
                    } else {
                        self.short_sql_open_cnt = 0;
                    }
                }
                if open_duration >= self.ident_nag_min_time_ms {
                    self.ident_heard = true;
                    self.ident_nag_timer.stop();
                }
                if self.idle_timeout_ms > 0 {
                    self.idle_timer.start(now_ms);
                }
                if self.rgr_enable && self.core.msg().is_idle() {
                    self.rgr_timer.start(now_ms);
                }
            } else if self.activate_on_sql_close {
                let reason = self
                    .pending_open_reason
                    .take()
                    .unwrap_or_else(|| "SQL_CLOSE".to_string());
                self.set_up(true, reason, now_ms);
            }
        }
    }
}

impl Logic for RepeaterLogic {
    fn core(&self) -> &LogicCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LogicCore {
        &mut self.core
    }

    fn next_deadline(&self) -> Option<u64> {
        earliest_deadline(&[
            &self.open_on_sql_timer,
            &self.open_on_ctcss_timer,
            &self.idle_timer,
            &self.idle_sound_timer,
            &self.ident_nag_timer,
            &self.rgr_timer,
        ])
    }

    fn handle_rx_event(&mut self, ev: &RxEvent, now_ms: u64) -> bool {
        match ev {
            RxEvent::SquelchOpen(open) => {
                // Variant bookkeeping first, then the core sees the edge
                self.squelch_open(*open, now_ms);
                false
            }
            RxEvent::ToneDetected(fq) => {
                if !self.repeater_up && (*fq - self.open_on_tone_fq).abs() < 1.0 {
                    self.trigger_open("TONE", now_ms);
                }
                false
            }
            RxEvent::CtcssDetected(fq) => {
                if !self.repeater_up
                    && let Some((want_fq, _)) = self.open_on_ctcss
                    && (fq - want_fq).abs() < 0.5
                    && !self.open_on_ctcss_timer.is_running()
                {
                    self.open_on_ctcss_timer.start(now_ms);
                }
                false
            }
            RxEvent::DtmfDigit { digit, .. } => {
                if !self.repeater_up && Some(*digit) == self.open_on_dtmf {
                    self.trigger_open("DTMF", now_ms);
                }
                false
            }
            RxEvent::SelcallSequence(seq) => {
                if !self.repeater_up && self.open_on_sel5.as_deref() == Some(seq.as_str()) {
                    self.trigger_open("SEL5", now_ms);
                }
                false
            }
            _ => false,
        }
    }

    fn tick(&mut self, now_ms: u64) {
        if self.open_on_sql_timer.poll(now_ms) && self.core.sql_is_open() {
            self.trigger_open("SQL", now_ms);
        }
        if self.open_on_ctcss_timer.poll(now_ms) {
            self.trigger_open("CTCSS", now_ms);
        }

        // Module activity: audio or activation opens the repeater
        for ev in self.core.take_module_stream_events() {
            if ev == StreamEvent::Activated {
                if !self.repeater_up {
                    self.trigger_open("AUDIO", now_ms);
                } else {
                    self.idle_timer.stop();
                }
            } else if self.repeater_up && self.idle_timeout_ms > 0 && self.core.is_idle() {
                self.idle_timer.start(now_ms);
            }
        }
        let active_module = self.core.active_module_name().map(str::to_string);
        if active_module != self.last_active_module {
            if active_module.is_some() && !self.repeater_up {
                self.trigger_open("MODULE", now_ms);
            }
            self.last_active_module = active_module;
        }

        if self.repeater_up {
            // Mute the pass-through while a core command is being entered
            if !self.no_repeat {
                let entering_cmd = self.core.dtmf_buffer().starts_with('*');
                self.core.set_rpt_valve_open(!entering_cmd);
            }

            if self.idle_timer.poll(now_ms) {
                if self.core.is_idle() {
                    self.set_up(false, "IDLE".to_string(), now_ms);
                } else {
                    self.idle_timer.start(now_ms);
                }
            }
            if self.idle_sound_timer.poll(now_ms) && self.core.is_idle() {
                self.core.process_event("repeater_idle", now_ms);
            }
            if self.ident_nag_timer.poll(now_ms) && !self.ident_heard {
                self.core.process_event("identify_nag", now_ms);
            }
            if self.rgr_timer.poll(now_ms) && self.core.is_idle() {
                self.core.process_event("send_rgr_sound", now_ms);
            }
        }
    }
}

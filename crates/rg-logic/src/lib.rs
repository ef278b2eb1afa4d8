//! rg-logic: logic cores
//!
//! A logic is the top level controller of one radio site, phone line or
//! network endpoint. `LogicCore` carries everything the variants share
//! (audio graph, message handler, command pipeline, event script, TX
//! CTCSS policy, QSO recorder); the variant types add their own state
//! machines on top:
//!
//! - `SimplexLogic` — single-frequency transmit/receive
//! - `RepeaterLogic` — keyed transmitter with open/close triggers
//! - `AnalogPhoneLogic` — AT-modem phone line bridge
//! - `AnnounceLogic` — periodic transmit-only announcements
//! - `DummyLogic` — no radio, pure link endpoint

pub mod announce;
pub mod cmd_parser;
pub mod dtmf;
pub mod dummy;
pub mod logic;
pub mod macros;
pub mod module;
pub mod phone;
pub mod qso_recorder;
pub mod repeater;
pub mod simplex;

#[cfg(test)]
pub mod testutil;

pub use announce::AnnounceLogic;
pub use cmd_parser::CmdParser;
pub use dtmf::DtmfAggregator;
pub use dummy::DummyLogic;
pub use logic::{LogicCore, tx_ctcss};
pub use macros::{MacroError, MacroExpansion, MacroTable};
pub use module::{Module, ModuleRegistry};
pub use phone::{AnalogPhoneLogic, NullSerial, SerialLine};
pub use qso_recorder::QsoRecorder;
pub use repeater::RepeaterLogic;
pub use simplex::SimplexLogic;

use rg_core::{RxEvent, Sample};

/// Uniform surface the event loop drives every logic variant through
pub trait Logic: Send {
    fn core(&self) -> &LogicCore;

    fn core_mut(&mut self) -> &mut LogicCore;

    /// Variant hook, called before the core sees the event. Return true
    /// to consume it.
    fn handle_rx_event(&mut self, _ev: &RxEvent, _now_ms: u64) -> bool {
        false
    }

    /// Audio arriving from connected logics. Network variants override
    /// this to also feed their far end.
    fn link_audio_in(&mut self, samples: &[Sample], _now_ms: u64) {
        self.core_mut().write_link_in(samples);
    }

    /// The inbound link stream ended
    fn link_audio_flush(&mut self, _now_ms: u64) {
        self.core_mut().flush_link_in();
    }

    /// Earliest deadline among the variant's own timers; the event loop
    /// wakes no later than this. The core's timers are reported
    /// separately through `LogicCore::next_deadline`.
    fn next_deadline(&self) -> Option<u64> {
        None
    }

    /// Variant timers; the core's own `tick` runs separately
    fn tick(&mut self, _now_ms: u64) {}
}

/// One event loop iteration for a single logic: drain receiver events,
/// run variant and core handling, then pump audio and timers.
pub fn pump_logic(logic: &mut dyn Logic, now_ms: u64) {
    let events = logic.core_mut().drain_rx_events();
    for ev in events {
        if !logic.handle_rx_event(&ev, now_ms) {
            logic.core_mut().handle_rx_event(ev, now_ms);
        }
    }
    logic.tick(now_ms);
    logic.core_mut().tick(now_ms);
}

//! State events and event loop messages

use serde::Serialize;

/// A state event published by a logic, written to the state PTY as
/// `<unixSec>.<ms> <event> <msg>\n`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateEvent {
    pub unix_sec: u64,
    pub millis: u32,
    pub name: String,
    pub msg: String,
}

impl StateEvent {
    pub fn to_line(&self) -> String {
        format!(
            "{}.{:03} {} {}\n",
            self.unix_sec, self.millis, self.name, self.msg
        )
    }
}

/// Messages marshalled onto the event loop from other threads (log writer,
/// library-internal threads, spawned processes). Core state is only mutated
/// from the loop thread that drains these.
#[derive(Debug, Clone)]
pub enum LoopMessage {
    /// A DTMF digit arrived on a logic's DTMF control PTY
    PtyDtmfDigit { logic: String, digit: char },
    /// A line arrived on a logic's command PTY
    PtyCommandLine { logic: String, line: String },
    /// A line arrived on a SIP logic's control PTY
    SipCtrlLine { logic: String, line: String },
    /// A datagram arrived on a network socket owned by the named logic
    Datagram { logic: String, data: Vec<u8> },
    /// A line arrived from a serial port owned by the named logic
    SerialLine { logic: String, line: String },
    /// Orderly shutdown request
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_event_line_format() {
        let ev = StateEvent {
            unix_sec: 1700000000,
            millis: 7,
            name: "logic_online".into(),
            msg: "1".into(),
        };
        assert_eq!(ev.to_line(), "1700000000.007 logic_online 1\n");
    }
}

//! PTY command channels
//!
//! Three optional channels per logic, configured as paths to FIFOs or
//! pseudo-terminal slaves provided by the environment:
//!
//! - `DTMF_CTRL_PTY`: every byte is a DTMF digit injected as 100 ms
//! - `COMMAND_PTY`: line buffered `CFG`/`EVENT` commands
//! - `STATE_PTY`: one-way stream of timestamped state events
//!
//! Readers run on their own threads and marshal everything onto the
//! event loop channel; the loop thread remains the only mutator.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

use crossbeam_channel::Sender;

use rg_core::{LoopMessage, StateEvent};

/// A parsed COMMAND_PTY line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyCommand {
    /// `CFG <section> <tag> <value>`
    SetConfig {
        section: String,
        tag: String,
        value: String,
    },
    /// `EVENT <name> [args…]`; a name with `::` addresses an exact
    /// namespace, otherwise it is qualified with the logic name
    RaiseEvent { name: String, args: String },
}

pub fn parse_command_line(line: &str) -> Option<PtyCommand> {
    let mut words = line.split_whitespace();
    match words.next()? {
        "CFG" => {
            let section = words.next()?.to_string();
            let tag = words.next()?.to_string();
            let value = words.collect::<Vec<_>>().join(" ");
            Some(PtyCommand::SetConfig {
                section,
                tag,
                value,
            })
        }
        "EVENT" => {
            let name = words.next()?.to_string();
            let args = words.collect::<Vec<_>>().join(" ");
            Some(PtyCommand::RaiseEvent { name, args })
        }
        _ => None,
    }
}

/// Spawn the single-byte DTMF digit reader
pub fn spawn_dtmf_reader(
    path: &Path,
    logic: String,
    tx: Sender<LoopMessage>,
) -> std::io::Result<()> {
    let file = File::open(path)?;
    std::thread::Builder::new()
        .name(format!("dtmf-pty-{logic}"))
        .spawn(move || {
            let mut reader = BufReader::new(file);
            let mut byte = [0u8; 1];
            while reader.read_exact(&mut byte).is_ok() {
                let digit = byte[0] as char;
                if matches!(digit, '0'..='9' | 'A'..='F' | '*' | '#') {
                    let _ = tx.send(LoopMessage::PtyDtmfDigit {
                        logic: logic.clone(),
                        digit,
                    });
                }
            }
        })?;
    Ok(())
}

fn spawn_line_reader<F>(
    path: &Path,
    thread_name: String,
    tx: Sender<LoopMessage>,
    make: F,
) -> std::io::Result<()>
where
    F: Fn(String) -> LoopMessage + Send + 'static,
{
    let file = File::open(path)?;
    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let reader = BufReader::new(file);
            for line in reader.lines() {
                match line {
                    Ok(line) if !line.trim().is_empty() => {
                        let _ = tx.send(make(line));
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        })?;
    Ok(())
}

/// Spawn the line-buffered command reader
pub fn spawn_command_reader(
    path: &Path,
    logic: String,
    tx: Sender<LoopMessage>,
) -> std::io::Result<()> {
    let name = format!("cmd-pty-{logic}");
    spawn_line_reader(path, name, tx, move |line| LoopMessage::PtyCommandLine {
        logic: logic.clone(),
        line,
    })
}

/// Spawn the SIP control channel reader (`C#`, `CA`, `C<digits>#`)
pub fn spawn_sip_ctrl_reader(
    path: &Path,
    logic: String,
    tx: Sender<LoopMessage>,
) -> std::io::Result<()> {
    let name = format!("sip-pty-{logic}");
    spawn_line_reader(path, name, tx, move |line| LoopMessage::SipCtrlLine {
        logic: logic.clone(),
        line,
    })
}

/// Write side of the one-way state event stream
pub struct StatePty {
    file: File,
}

impl StatePty {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().write(true).open(path)?;
        Ok(Self { file })
    }

    pub fn publish(&mut self, event: &StateEvent) {
        if let Err(e) = self.file.write_all(event.to_line().as_bytes()) {
            log::warn!("state PTY write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cfg_command() {
        assert_eq!(
            parse_command_line("CFG RepeaterLogic IDLE_TIMEOUT 60"),
            Some(PtyCommand::SetConfig {
                section: "RepeaterLogic".into(),
                tag: "IDLE_TIMEOUT".into(),
                value: "60".into(),
            })
        );
    }

    #[test]
    fn test_parse_event_command() {
        assert_eq!(
            parse_command_line("EVENT repeater_up SQL"),
            Some(PtyCommand::RaiseEvent {
                name: "repeater_up".into(),
                args: "SQL".into(),
            })
        );
        assert_eq!(
            parse_command_line("EVENT RepeaterLogic::manual_identification"),
            Some(PtyCommand::RaiseEvent {
                name: "RepeaterLogic::manual_identification".into(),
                args: String::new(),
            })
        );
    }

    #[test]
    fn test_parse_garbage_rejected() {
        assert_eq!(parse_command_line("NOPE x y"), None);
        assert_eq!(parse_command_line(""), None);
        assert_eq!(parse_command_line("CFG onlysection"), None);
    }
}

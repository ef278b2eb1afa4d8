//! Log writer
//!
//! Installs as the `log` facade backend and forwards formatted lines
//! over a channel to a dedicated writer thread, keeping file and syslog
//! I/O off the event loop. Each line gets a strftime-style timestamp
//! prefix where `%f` expands to zero-padded milliseconds. The
//! destination `syslog:` switches to the system log with the severity
//! inferred from the conventional line prefixes.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::Local;
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{Level, LevelFilter, Metadata, Record};

pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%c";

enum LogDest {
    Stderr,
    File(std::fs::File),
    Syslog(std::os::unix::net::UnixDatagram),
}

/// Syslog severity inferred from the conventional message prefixes
fn severity_for(line: &str) -> u8 {
    if line.contains("*** ERROR:") {
        3 // err
    } else if line.contains("*** WARNING:") {
        4 // warning
    } else if line.contains("### ") {
        5 // notice
    } else {
        6 // info
    }
}

fn expand_timestamp(format: &str) -> String {
    let now = Local::now();
    // chrono has no %f-with-zero-padded-millis in the strftime sense the
    // configuration promises, so expand it first
    let format = format.replace("%f", &format!("{:03}", now.timestamp_subsec_millis()));
    now.format(&format).to_string()
}

struct WriterThread {
    rx: Receiver<String>,
    dest: LogDest,
    timestamp_format: String,
}

impl WriterThread {
    fn run(mut self) {
        while let Ok(line) = self.rx.recv() {
            self.write_line(&line);
        }
    }

    fn write_line(&mut self, line: &str) {
        match &mut self.dest {
            LogDest::Stderr => {
                let stamp = expand_timestamp(&self.timestamp_format);
                eprintln!("{stamp}: {line}");
            }
            LogDest::File(f) => {
                let stamp = expand_timestamp(&self.timestamp_format);
                let _ = writeln!(f, "{stamp}: {line}");
                let _ = f.flush();
            }
            LogDest::Syslog(sock) => {
                let pri = 8 + severity_for(line); // facility user(1) is 8
                let msg = format!("<{pri}>rigforged: {line}");
                let _ = sock.send(msg.as_bytes());
            }
        }
    }
}

/// The `log::Log` front end
pub struct LogWriter {
    tx: Sender<String>,
    level: LevelFilter,
}

impl LogWriter {
    /// Start the writer thread and install the logger. `destination` is
    /// a file path, `syslog:`, or None for stderr.
    pub fn install(
        destination: Option<&str>,
        timestamp_format: &str,
        level: LevelFilter,
    ) -> std::io::Result<()> {
        let dest = match destination {
            None => LogDest::Stderr,
            Some("syslog:") => {
                let sock = std::os::unix::net::UnixDatagram::unbound()?;
                sock.connect("/dev/log")?;
                LogDest::Syslog(sock)
            }
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(Path::new(path))?;
                LogDest::File(file)
            }
        };
        let (tx, rx) = unbounded();
        let thread = WriterThread {
            rx,
            dest,
            timestamp_format: timestamp_format.to_string(),
        };
        std::thread::Builder::new()
            .name("logwriter".into())
            .spawn(move || thread.run())?;

        let writer = Box::new(LogWriter { tx, level });
        log::set_boxed_logger(writer)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        log::set_max_level(level);
        Ok(())
    }
}

impl log::Log for LogWriter {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = match record.level() {
            Level::Error => format!("*** ERROR: {}", record.args()),
            Level::Warn => format!("*** WARNING: {}", record.args()),
            _ => record.args().to_string(),
        };
        let _ = self.tx.send(line);
    }

    fn flush(&self) {}
}

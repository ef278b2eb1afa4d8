//! Command line interface

use std::path::PathBuf;

use clap::Parser;

/// Multi-purpose voice services controller for amateur radio nodes
#[derive(Parser, Debug)]
#[command(name = "rigforged", version, about)]
pub struct Args {
    /// Write the process id to this file
    #[arg(long)]
    pub pidfile: Option<PathBuf>,

    /// Redirect log output to this file (`syslog:` for the system log)
    #[arg(long)]
    pub logfile: Option<String>,

    /// Drop privileges to this user after startup
    #[arg(long)]
    pub runasuser: Option<String>,

    /// Configuration file
    #[arg(long, default_value = "/etc/rigforge/rigforge.conf")]
    pub config: PathBuf,

    /// Detach from the controlling terminal
    #[arg(long)]
    pub daemon: bool,

    /// Initialize everything, then exit
    #[arg(long)]
    pub reset: bool,

    /// Only log warnings and errors
    #[arg(long)]
    pub quiet: bool,
}

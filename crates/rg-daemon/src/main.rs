//! rigforged: multi-purpose voice services controller

use std::io::Write;

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;

use rg_core::Config;

mod cli;
mod logwriter;
mod pty;
mod registry;
mod runtime;

use cli::Args;
use logwriter::{DEFAULT_TIMESTAMP_FORMAT, LogWriter};
use registry::{LogicDeps, LogicRegistry, NullSerialFactory, NullSipFactory, NullTrxFactory};
use runtime::Runtime;

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("*** ERROR: {e:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut config = Config::new();
    config
        .load_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    // CFG_DIR names a directory of extra configuration files, loaded in
    // name order on top of the main file
    if let Some(cfg_dir) = config.value("GLOBAL", "CFG_DIR").map(str::to_string) {
        let mut extra: Vec<_> = std::fs::read_dir(&cfg_dir)
            .with_context(|| format!("reading CFG_DIR {cfg_dir}"))?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        extra.sort();
        for path in extra {
            config
                .load_file(&path)
                .with_context(|| format!("loading {}", path.display()))?;
        }
    }

    let timestamp_format = config
        .value("GLOBAL", "TIMESTAMP_FORMAT")
        .unwrap_or(DEFAULT_TIMESTAMP_FORMAT)
        .to_string();
    let level = if args.quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };
    if args.logfile.is_some() {
        LogWriter::install(args.logfile.as_deref(), &timestamp_format, level)
            .context("starting the log writer")?;
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(level)
            .init();
    }

    if args.daemon || args.runasuser.is_some() {
        log::warn!(
            "process supervision (--daemon/--runasuser) is delegated to the \
             service manager in this build"
        );
    }

    if let Some(pidfile) = &args.pidfile {
        let mut f = std::fs::File::create(pidfile)
            .with_context(|| format!("creating {}", pidfile.display()))?;
        writeln!(f, "{}", std::process::id())?;
    }

    let registry = LogicRegistry::with_builtins();
    // Hardware-backed deployments swap these for real driver factories
    let deps = LogicDeps {
        trx: &NullTrxFactory,
        serial: &NullSerialFactory,
        sip: &NullSipFactory,
    };
    let mut runtime = Runtime::bootstrap(config, &registry, &deps)
        .context("startup failed")?;

    if args.reset {
        log::info!("### --reset: initialization done, exiting");
        return Ok(());
    }

    runtime.run();
    Ok(())
}

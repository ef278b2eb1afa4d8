//! Logic construction registry
//!
//! Logic types register constructors at build time; `TYPE` in a logic's
//! configuration section selects one by name. This replaces dynamic
//! library loading: out-of-tree variants register through
//! `LogicRegistry::register` before bootstrap.
//!
//! External collaborators reach the constructors through factory seams:
//! radio drivers via `TrxFactory`, modem serial ports via
//! `SerialFactory`, the VoIP stack via `SipFactory`. The Null defaults
//! keep every logic type constructible on nodes without that hardware.

use std::collections::HashMap;

use rg_core::{Config, CoreError, CoreResult, NullRx, NullTx, Receiver, Transmitter};
use rg_logic::{
    AnalogPhoneLogic, AnnounceLogic, DummyLogic, Logic, LogicCore, NullSerial, RepeaterLogic,
    SerialLine, SimplexLogic,
};
use rg_net::{
    DnsResolver, NullDnsResolver, NullSipStack, RewindLogic, SipLogic, SipStack, UsrpLogic,
};

/// Radio driver factory seam. The transceiver drivers are external
/// collaborators; deployments without radio hardware get inert drivers.
pub trait TrxFactory: Send {
    fn create_rx(&self, cfg: &Config, section: &str) -> CoreResult<Box<dyn Receiver>>;
    fn create_tx(&self, cfg: &Config, section: &str) -> CoreResult<Box<dyn Transmitter>>;
}

/// Inert drivers for network-only nodes
pub struct NullTrxFactory;

impl TrxFactory for NullTrxFactory {
    fn create_rx(&self, _cfg: &Config, _section: &str) -> CoreResult<Box<dyn Receiver>> {
        Ok(Box::new(NullRx))
    }

    fn create_tx(&self, _cfg: &Config, _section: &str) -> CoreResult<Box<dyn Transmitter>> {
        Ok(Box::new(NullTx::default()))
    }
}

/// Modem serial port factory seam
pub trait SerialFactory: Send {
    fn create_serial(&self, cfg: &Config, section: &str) -> CoreResult<Box<dyn SerialLine>>;
}

/// Discards modem commands; the phone line stays down
pub struct NullSerialFactory;

impl SerialFactory for NullSerialFactory {
    fn create_serial(&self, _cfg: &Config, _section: &str) -> CoreResult<Box<dyn SerialLine>> {
        Ok(Box::new(NullSerial))
    }
}

/// SIP stack and resolver factory seam
pub trait SipFactory: Send {
    fn create_stack(&self, cfg: &Config, section: &str) -> CoreResult<Box<dyn SipStack>>;
    fn create_resolver(&self, cfg: &Config, section: &str) -> CoreResult<Box<dyn DnsResolver>>;
}

/// Unregistered stack that refuses calls
pub struct NullSipFactory;

impl SipFactory for NullSipFactory {
    fn create_stack(&self, _cfg: &Config, _section: &str) -> CoreResult<Box<dyn SipStack>> {
        Ok(Box::new(NullSipStack))
    }

    fn create_resolver(&self, _cfg: &Config, _section: &str) -> CoreResult<Box<dyn DnsResolver>> {
        Ok(Box::new(NullDnsResolver))
    }
}

/// The external collaborator factories threaded through bootstrap and
/// into the constructors.
pub struct LogicDeps<'a> {
    pub trx: &'a dyn TrxFactory,
    pub serial: &'a dyn SerialFactory,
    pub sip: &'a dyn SipFactory,
}

/// A constructed logic, split so the event loop can reach the variant
/// surfaces (datagrams, serial lines, control PTY commands).
pub enum BuiltLogic {
    Generic(Box<dyn Logic>),
    Phone(AnalogPhoneLogic),
    Sip(SipLogic),
    Usrp(UsrpLogic),
    Rewind(RewindLogic),
}

impl BuiltLogic {
    pub fn as_logic(&self) -> &dyn Logic {
        match self {
            Self::Generic(l) => l.as_ref(),
            Self::Phone(l) => l,
            Self::Sip(l) => l,
            Self::Usrp(l) => l,
            Self::Rewind(l) => l,
        }
    }

    pub fn as_logic_mut(&mut self) -> &mut dyn Logic {
        match self {
            Self::Generic(l) => l.as_mut(),
            Self::Phone(l) => l,
            Self::Sip(l) => l,
            Self::Usrp(l) => l,
            Self::Rewind(l) => l,
        }
    }

    pub fn name(&self) -> String {
        self.as_logic().core().name().to_string()
    }
}

type LogicCtor = Box<dyn Fn(LogicCore, &LogicDeps, u64) -> CoreResult<BuiltLogic> + Send>;

pub struct LogicRegistry {
    ctors: HashMap<String, LogicCtor>,
}

impl LogicRegistry {
    /// Registry with the built-in logic types
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            ctors: HashMap::new(),
        };
        registry.register("Simplex", |core, _deps, now| {
            let mut logic = SimplexLogic::new(core);
            logic.initialize(now)?;
            Ok(BuiltLogic::Generic(Box::new(logic)))
        });
        registry.register("Repeater", |core, _deps, now| {
            let mut logic = RepeaterLogic::new(core);
            logic.initialize(now)?;
            Ok(BuiltLogic::Generic(Box::new(logic)))
        });
        registry.register("Announce", |core, _deps, now| {
            let mut logic = AnnounceLogic::new(core);
            logic.initialize(now)?;
            Ok(BuiltLogic::Generic(Box::new(logic)))
        });
        registry.register("Dummy", |core, _deps, now| {
            let mut logic = DummyLogic::new(core);
            logic.initialize(now)?;
            Ok(BuiltLogic::Generic(Box::new(logic)))
        });
        registry.register("AnalogPhone", |core, deps, now| {
            let serial = {
                let cfg = core.config().clone();
                let cfg = cfg.lock();
                let section = cfg
                    .value(core.name(), "SERIAL")
                    .unwrap_or(core.name())
                    .to_string();
                deps.serial.create_serial(&cfg, &section)?
            };
            let mut logic = AnalogPhoneLogic::new(core, serial);
            logic.initialize(now)?;
            Ok(BuiltLogic::Phone(logic))
        });
        registry.register("Sip", |core, deps, now| {
            let (stack, dns) = {
                let cfg = core.config().clone();
                let cfg = cfg.lock();
                (
                    deps.sip.create_stack(&cfg, core.name())?,
                    deps.sip.create_resolver(&cfg, core.name())?,
                )
            };
            let mut logic = SipLogic::new(core, stack, dns);
            logic.initialize(now)?;
            Ok(BuiltLogic::Sip(logic))
        });
        registry.register("Usrp", |core, _deps, now| {
            let mut logic = UsrpLogic::new(core);
            logic.initialize(now)?;
            Ok(BuiltLogic::Usrp(logic))
        });
        registry.register("Rewind", |core, _deps, now| {
            let mut logic = RewindLogic::new(core);
            logic.initialize(now)?;
            Ok(BuiltLogic::Rewind(logic))
        });
        registry
    }

    pub fn register<F>(&mut self, type_name: &str, ctor: F)
    where
        F: Fn(LogicCore, &LogicDeps, u64) -> CoreResult<BuiltLogic> + Send + 'static,
    {
        self.ctors.insert(type_name.to_string(), Box::new(ctor));
    }

    pub fn create(
        &self,
        type_name: &str,
        core: LogicCore,
        deps: &LogicDeps,
        now_ms: u64,
    ) -> CoreResult<BuiltLogic> {
        let ctor = self.ctors.get(type_name).ok_or_else(|| {
            CoreError::Config(format!("unknown logic type {type_name}"))
        })?;
        ctor(core, deps, now_ms)
    }

    pub fn known_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.ctors.keys().cloned().collect();
        types.sort();
        types
    }
}

//! rg-link: cross-connecting logics
//!
//! A link is a named group of logics whose audio may be cross-connected
//! at runtime. The manager holds the link definitions, the set of
//! established connector pairs, and the auto-disconnect timers. Logics
//! are referenced by name only; the manager never owns them.
//!
//! Audio-wise every registered logic gets a fan-out splitter (its audio
//! towards the others) and a priority selector (audio arriving from the
//! others). Connecting the ordered pair (a, b) enables the connector
//! branch from a's splitter into b's selector.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use rg_audio::{AudioSink, BranchId, Collector, Selector, Splitter, shared};
use rg_core::{Config, CoreError, CoreResult, Sample, Timer};

/// One logic's place in a link definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMember {
    pub base_cmd: String,
    pub link_label: String,
}

/// A link definition from configuration
#[derive(Debug, Clone, Default)]
pub struct LinkCfg {
    pub name: String,
    pub members: BTreeMap<String, LinkMember>,
    pub timeout_ms: u64,
    pub default_connect: bool,
    pub no_disconnect: bool,
    pub auto_connect_on: BTreeSet<String>,
}

impl LinkCfg {
    /// Parse one link section: `CONNECT_LOGICS=<logic>:<cmd>:<label>,...`
    /// plus `TIMEOUT` (seconds), `DEFAULT_CONNECT`, `NO_DISCONNECT` and
    /// `AUTOCONNECT_ON`.
    pub fn from_config(cfg: &Config, name: &str) -> CoreResult<Self> {
        let spec: String = cfg.get_required(name, "CONNECT_LOGICS")?;
        let mut members = BTreeMap::new();
        for part in spec.split(',').filter(|s| !s.is_empty()) {
            let fields: Vec<&str> = part.split(':').collect();
            if fields.len() != 3 {
                return Err(CoreError::InvalidValue(
                    format!("{name}/CONNECT_LOGICS"),
                    part.to_string(),
                ));
            }
            members.insert(
                fields[0].trim().to_string(),
                LinkMember {
                    base_cmd: fields[1].trim().to_string(),
                    link_label: fields[2].trim().to_string(),
                },
            );
        }
        if members.len() < 2 {
            return Err(CoreError::Config(format!(
                "link {name} needs at least two member logics"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            members,
            timeout_ms: cfg.get_or::<u64>(name, "TIMEOUT", 0)? * 1000,
            default_connect: cfg.get_or::<u8>(name, "DEFAULT_CONNECT", 0)? != 0,
            no_disconnect: cfg.get_or::<u8>(name, "NO_DISCONNECT", 0)? != 0,
            auto_connect_on: cfg.get_list(name, "AUTOCONNECT_ON").into_iter().collect(),
        })
    }
}

struct LinkState {
    cfg: LinkCfg,
    is_connected: bool,
    timer: Timer,
}

struct LogicPort {
    splitter: Splitter,
    branches: HashMap<String, BranchId>,
    selector: Selector,
    inbound: Arc<Mutex<Collector>>,
}

/// Events raised by link operations, addressed to a link's member logics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub link: String,
    pub event: String,
}

/// Computes and maintains the reachability matrix between logics
#[derive(Default)]
pub struct LinkManager {
    links: BTreeMap<String, LinkState>,
    ports: BTreeMap<String, LogicPort>,
    is: BTreeSet<(String, String)>,
    logics_up: BTreeSet<String>,
    pending_events: Vec<LinkEvent>,
}

impl LinkManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every link named by `LINKS` in the global section
    pub fn from_config(cfg: &Config, global_section: &str) -> CoreResult<Self> {
        let mut mgr = Self::new();
        for link_name in cfg.get_list(global_section, "LINKS") {
            let link_cfg = LinkCfg::from_config(cfg, &link_name)?;
            mgr.add_link(link_cfg);
        }
        Ok(mgr)
    }

    pub fn add_link(&mut self, cfg: LinkCfg) {
        let mut timer = Timer::one_shot(cfg.timeout_ms);
        timer.stop();
        self.links.insert(
            cfg.name.clone(),
            LinkState {
                cfg,
                is_connected: false,
                timer,
            },
        );
    }

    pub fn link_names(&self) -> Vec<String> {
        self.links.keys().cloned().collect()
    }

    pub fn link_is_connected(&self, name: &str) -> bool {
        self.links.get(name).is_some_and(|l| l.is_connected)
    }

    /// The established connector pairs
    pub fn connected_pairs(&self) -> &BTreeSet<(String, String)> {
        &self.is
    }

    /// The base command a logic uses for a link, for command registration
    pub fn base_cmd_for(&self, link: &str, logic: &str) -> Option<&str> {
        self.links
            .get(link)
            .and_then(|l| l.cfg.members.get(logic))
            .map(|m| m.base_cmd.as_str())
    }

    pub fn take_events(&mut self) -> Vec<LinkEvent> {
        std::mem::take(&mut self.pending_events)
    }

    // ------------------------------------------------------------------
    // Logic registration and audio plumbing
    // ------------------------------------------------------------------

    /// Register a logic and wire connectors to every other registered
    /// logic, disabled until a link turns them on.
    pub fn add_logic(&mut self, name: &str) {
        if self.ports.contains_key(name) {
            return;
        }
        let selector = Selector::new();
        let inbound = shared(Collector::new());
        selector.set_output(Box::new(inbound.clone()));
        let mut port = LogicPort {
            splitter: Splitter::new(),
            branches: HashMap::new(),
            selector,
            inbound,
        };

        let existing: Vec<String> = self.ports.keys().cloned().collect();
        for other in existing {
            // new → other
            if let Some(other_port) = self.ports.get_mut(&other) {
                let sel_port = other_port.selector.add_source(0, true);
                let id = port.splitter.add_sink(Box::new(sel_port));
                port.splitter.enable_sink(id, false);
                port.branches.insert(other.clone(), id);
            }
            // other → new
            let sel_port = port.selector.add_source(0, true);
            if let Some(other_port) = self.ports.get_mut(&other) {
                let id = other_port.splitter.add_sink(Box::new(sel_port));
                other_port.splitter.enable_sink(id, false);
                other_port.branches.insert(name.to_string(), id);
            }
        }
        self.ports.insert(name.to_string(), port);
    }

    /// Audio produced by a logic, fanned out to its connected peers
    pub fn write_audio(&mut self, from: &str, samples: &[Sample]) {
        if let Some(port) = self.ports.get_mut(from) {
            port.splitter.write(samples);
        }
    }

    pub fn flush_audio(&mut self, from: &str) {
        if let Some(port) = self.ports.get_mut(from) {
            port.splitter.flush();
        }
    }

    /// Drain audio destined for a logic
    pub fn take_audio_for(&mut self, logic: &str) -> Vec<Sample> {
        self.ports
            .get_mut(logic)
            .map(|p| p.inbound.lock().take_all())
            .unwrap_or_default()
    }

    /// True once the inbound stream towards a logic has ended and been
    /// fully drained
    pub fn audio_for_is_done(&self, logic: &str) -> bool {
        self.ports
            .get(logic)
            .is_some_and(|p| p.inbound.lock().stream_done())
    }

    /// Member logics of a link
    pub fn members_of(&self, link: &str) -> Vec<String> {
        self.links
            .get(link)
            .map(|l| l.cfg.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn set_connector(&mut self, src: &str, sink: &str, enable: bool) {
        if let Some(port) = self.ports.get_mut(src)
            && let Some(&branch) = port.branches.get(sink)
        {
            port.splitter.enable_sink(branch, enable);
        }
    }

    // ------------------------------------------------------------------
    // Connection algebra
    // ------------------------------------------------------------------

    /// Full cross product of the link's member logics
    fn matrix(&self, link: &str) -> BTreeSet<(String, String)> {
        let mut want = BTreeSet::new();
        if let Some(state) = self.links.get(link) {
            for a in state.cfg.members.keys() {
                for b in state.cfg.members.keys() {
                    if a != b {
                        want.insert((a.clone(), b.clone()));
                    }
                }
            }
        }
        want
    }

    /// Establish every missing connector pair of the named link
    pub fn connect_links(&mut self, name: &str, now_ms: u64) -> usize {
        let want = self.matrix(name);
        let diff: Vec<(String, String)> =
            want.difference(&self.is).cloned().collect();
        for (a, b) in &diff {
            self.set_connector(a, b, true);
            self.is.insert((a.clone(), b.clone()));
        }
        if let Some(state) = self.links.get_mut(name) {
            state.is_connected = true;
            if state.cfg.timeout_ms > 0 {
                state.timer.start(now_ms);
            }
        }
        log::info!("link {name}: connected ({} new pairs)", diff.len());
        diff.len()
    }

    /// Tear down the connector pairs of the named link that no other
    /// connected link still requires
    pub fn disconnect_links(&mut self, name: &str) -> usize {
        let mine = self.matrix(name);
        let mut still_required = BTreeSet::new();
        for (other_name, other) in &self.links {
            if other_name != name && other.is_connected {
                still_required.extend(self.matrix(other_name));
            }
        }
        let unique: Vec<(String, String)> = mine
            .difference(&still_required)
            .filter(|pair| self.is.contains(*pair))
            .cloned()
            .collect();
        for (a, b) in &unique {
            self.set_connector(a, b, false);
            self.is.remove(&(a.clone(), b.clone()));
        }
        if let Some(state) = self.links.get_mut(name) {
            state.is_connected = false;
            state.timer.stop();
        }
        log::info!("link {name}: disconnected ({} pairs torn down)", unique.len());
        unique.len()
    }

    // ------------------------------------------------------------------
    // Command and activity hooks
    // ------------------------------------------------------------------

    /// A logic received a link command; returns the event to raise in its
    /// script namespace.
    pub fn cmd_received(&mut self, logic: &str, cmd: &str, subcmd: &str, now_ms: u64) -> String {
        let found = self.links.iter().find_map(|(name, state)| {
            state
                .cfg
                .members
                .get(logic)
                .filter(|m| m.base_cmd == cmd)
                .map(|m| (name.clone(), m.link_label.clone(), state.is_connected))
        });
        let Some((name, label, connected)) = found else {
            return format!("unknown_command {cmd}{subcmd}");
        };

        match subcmd {
            "0" => {
                if !connected {
                    format!("link_not_active {label}")
                } else if self.links.get(&name).is_some_and(|l| l.cfg.no_disconnect) {
                    format!("deactivating_link_failed {label}")
                } else {
                    self.disconnect_links(&name);
                    format!("deactivating_link {label}")
                }
            }
            "1" => {
                if connected {
                    format!("link_already_active {label}")
                } else {
                    self.connect_links(&name, now_ms);
                    format!("activating_link {label}")
                }
            }
            _ => format!("unknown_command {cmd}{subcmd}"),
        }
    }

    /// A logic finished initialisation. Links whose members are all up
    /// and which are marked default-connect come up now.
    pub fn logic_is_up(&mut self, name: &str, now_ms: u64) {
        self.logics_up.insert(name.to_string());
        let candidates: Vec<String> = self
            .links
            .iter()
            .filter(|(_, state)| {
                state.cfg.default_connect
                    && !state.is_connected
                    && state
                        .cfg
                        .members
                        .keys()
                        .all(|m| self.logics_up.contains(m))
            })
            .map(|(n, _)| n.clone())
            .collect();
        for link in candidates {
            self.connect_links(&link, now_ms);
            self.pending_events.push(LinkEvent {
                link: link.clone(),
                event: format!("activating_link {link}"),
            });
        }
    }

    /// Activity in a logic restarts the disconnect timers of the links
    /// that carry it, and auto-connects links configured to follow it.
    pub fn reset_timers(&mut self, name: &str, now_ms: u64) {
        let mut to_connect = Vec::new();
        for (link_name, state) in self.links.iter_mut() {
            if !state.cfg.members.contains_key(name) {
                continue;
            }
            if state.is_connected && state.cfg.timeout_ms > 0 {
                state.timer.start(now_ms);
            }
            if !state.is_connected && state.cfg.auto_connect_on.contains(name) {
                to_connect.push(link_name.clone());
            }
        }
        for link in to_connect {
            self.connect_links(&link, now_ms);
            self.pending_events.push(LinkEvent {
                link: link.clone(),
                event: format!("activating_link {link}"),
            });
        }
    }

    /// Earliest pending auto-disconnect deadline
    pub fn next_deadline(&self) -> Option<u64> {
        self.links
            .values()
            .filter(|l| l.is_connected)
            .filter_map(|l| l.timer.deadline())
            .min()
    }

    /// Drive the auto-disconnect timers
    pub fn tick(&mut self, now_ms: u64) {
        let mut expired = Vec::new();
        for (name, state) in self.links.iter_mut() {
            if state.is_connected && state.timer.poll(now_ms) && !state.cfg.no_disconnect {
                expired.push(name.clone());
            }
        }
        for name in expired {
            self.disconnect_links(&name);
            self.pending_events.push(LinkEvent {
                link: name.clone(),
                event: format!("deactivating_link {name}"),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_logic_mgr(timeout_s: u64, default_connect: bool) -> LinkManager {
        let mut mgr = LinkManager::new();
        mgr.add_logic("A");
        mgr.add_logic("B");
        let mut members = BTreeMap::new();
        members.insert(
            "A".to_string(),
            LinkMember { base_cmd: "81".into(), link_label: "L1".into() },
        );
        members.insert(
            "B".to_string(),
            LinkMember { base_cmd: "82".into(), link_label: "L1".into() },
        );
        mgr.add_link(LinkCfg {
            name: "L1".into(),
            members,
            timeout_ms: timeout_s * 1000,
            default_connect,
            no_disconnect: false,
            auto_connect_on: BTreeSet::new(),
        });
        mgr
    }

    fn pair(a: &str, b: &str) -> (String, String) {
        (a.to_string(), b.to_string())
    }

    #[test]
    fn test_connect_builds_cross_product() {
        let mut mgr = two_logic_mgr(0, false);
        mgr.connect_links("L1", 0);
        assert!(mgr.connected_pairs().contains(&pair("A", "B")));
        assert!(mgr.connected_pairs().contains(&pair("B", "A")));
        assert_eq!(mgr.connected_pairs().len(), 2);
    }

    #[test]
    fn test_connect_then_disconnect_is_noop_on_is() {
        let mut mgr = two_logic_mgr(0, false);
        mgr.connect_links("L1", 0);
        mgr.disconnect_links("L1");
        assert!(mgr.connected_pairs().is_empty());
    }

    #[test]
    fn test_audio_flows_only_while_connected() {
        let mut mgr = two_logic_mgr(0, false);
        mgr.write_audio("A", &[1, 2, 3]);
        assert!(mgr.take_audio_for("B").is_empty());

        mgr.connect_links("L1", 0);
        mgr.write_audio("A", &[4, 5]);
        assert_eq!(mgr.take_audio_for("B"), vec![4, 5]);
        assert!(mgr.take_audio_for("A").is_empty());

        mgr.flush_audio("A");
        mgr.disconnect_links("L1");
        mgr.write_audio("A", &[6]);
        assert!(mgr.take_audio_for("B").is_empty());
    }

    #[test]
    fn test_shared_pairs_survive_other_link_disconnect() {
        let mut mgr = two_logic_mgr(0, false);
        mgr.add_logic("C");
        let mut members = BTreeMap::new();
        members.insert(
            "A".to_string(),
            LinkMember { base_cmd: "91".into(), link_label: "L2".into() },
        );
        members.insert(
            "C".to_string(),
            LinkMember { base_cmd: "92".into(), link_label: "L2".into() },
        );
        members.insert(
            "B".to_string(),
            LinkMember { base_cmd: "93".into(), link_label: "L2".into() },
        );
        mgr.add_link(LinkCfg {
            name: "L2".into(),
            members,
            timeout_ms: 0,
            default_connect: false,
            no_disconnect: false,
            auto_connect_on: BTreeSet::new(),
        });

        mgr.connect_links("L1", 0);
        mgr.connect_links("L2", 0);
        assert_eq!(mgr.connected_pairs().len(), 6);

        // L1's pairs are all contained in L2's matrix, so dropping L1
        // must tear down nothing
        mgr.disconnect_links("L1");
        assert_eq!(mgr.connected_pairs().len(), 6);

        // Dropping L2 as well leaves nothing behind
        mgr.disconnect_links("L2");
        assert!(mgr.connected_pairs().is_empty());
    }

    #[test]
    fn test_cmd_received_dispatch() {
        let mut mgr = two_logic_mgr(0, false);
        assert_eq!(mgr.cmd_received("A", "81", "1", 0), "activating_link L1");
        assert!(mgr.link_is_connected("L1"));
        assert_eq!(mgr.cmd_received("A", "81", "1", 0), "link_already_active L1");
        assert_eq!(mgr.cmd_received("B", "82", "0", 0), "deactivating_link L1");
        assert_eq!(mgr.cmd_received("B", "82", "0", 0), "link_not_active L1");
        assert!(
            mgr.cmd_received("A", "55", "1", 0)
                .starts_with("unknown_command")
        );
    }

    #[test]
    fn test_no_disconnect_link_is_sticky() {
        let mut mgr = two_logic_mgr(1, false);
        if let Some(state) = mgr.links.get_mut("L1") {
            state.cfg.no_disconnect = true;
        }
        mgr.connect_links("L1", 0);
        assert_eq!(
            mgr.cmd_received("A", "81", "0", 0),
            "deactivating_link_failed L1"
        );
        // The timeout does not tear it down either
        mgr.tick(10_000);
        assert!(mgr.link_is_connected("L1"));
    }

    #[test]
    fn test_auto_disconnect_after_timeout() {
        // Scenario: link with TIMEOUT=30 and no default connect; activity
        // keeps it alive, silence tears it down.
        let mut mgr = two_logic_mgr(30, false);
        assert_eq!(mgr.next_deadline(), None);
        assert_eq!(mgr.cmd_received("A", "81", "1", 0), "activating_link L1");
        assert_eq!(mgr.connected_pairs().len(), 2);
        assert_eq!(mgr.next_deadline(), Some(30_000));

        mgr.reset_timers("A", 10_000);
        assert_eq!(mgr.next_deadline(), Some(40_000));
        mgr.tick(30_000); // would have fired without the reset
        assert!(mgr.link_is_connected("L1"));

        mgr.tick(40_000);
        assert!(!mgr.link_is_connected("L1"));
        assert!(mgr.connected_pairs().is_empty());
        let events = mgr.take_events();
        assert_eq!(
            events,
            vec![LinkEvent { link: "L1".into(), event: "deactivating_link L1".into() }]
        );
    }

    #[test]
    fn test_default_connect_waits_for_all_members() {
        let mut mgr = two_logic_mgr(0, true);
        mgr.logic_is_up("A", 0);
        assert!(!mgr.link_is_connected("L1"));
        mgr.logic_is_up("B", 0);
        assert!(mgr.link_is_connected("L1"));
    }

    #[test]
    fn test_auto_connect_on_activity() {
        let mut mgr = two_logic_mgr(0, false);
        if let Some(state) = mgr.links.get_mut("L1") {
            state.cfg.auto_connect_on.insert("A".to_string());
        }
        mgr.reset_timers("B", 0);
        assert!(!mgr.link_is_connected("L1"));
        mgr.reset_timers("A", 0);
        assert!(mgr.link_is_connected("L1"));
    }

    #[test]
    fn test_link_cfg_from_config() {
        let mut cfg = Config::new();
        cfg.load_str(
            "[GLOBAL]\nLINKS=Main\n\
             [Main]\n\
             CONNECT_LOGICS=SimplexLogic:81:Simplex,RepeaterLogic:82:Repeater\n\
             TIMEOUT=30\nDEFAULT_CONNECT=1\nAUTOCONNECT_ON=SimplexLogic\n",
        )
        .unwrap();
        let mgr = LinkManager::from_config(&cfg, "GLOBAL").unwrap();
        assert_eq!(mgr.link_names(), vec!["Main"]);
        assert_eq!(mgr.base_cmd_for("Main", "SimplexLogic"), Some("81"));
    }

    #[test]
    fn test_single_member_link_rejected() {
        let mut cfg = Config::new();
        cfg.load_str("[Solo]\nCONNECT_LOGICS=OnlyOne:81:X\n").unwrap();
        assert!(LinkCfg::from_config(&cfg, "Solo").is_err());
    }
}

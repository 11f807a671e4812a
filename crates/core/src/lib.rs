#![forbid(unsafe_code)]

use packet_parser::{IpProtocol, PacketBuf};
use parking_lot::{Mutex, RwLock};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

mod conntrack;
mod error;
mod forge;
mod packet_log;
mod proxy;
mod rules;
mod tcp_state;
mod types;

pub use conntrack::*;
pub use error::*;
pub use forge::*;
pub use packet_log::*;
pub use proxy::*;
pub use rules::*;
pub use tcp_state::*;
pub use types::*;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct FirewallSettings {
    pub topology: Topology,
    pub proxies: Vec<ProxyRoute>,
    pub idle_timeout: u64,
    pub max_connections: usize,
    pub max_logs: usize,
    /// Verdict when no rule matches.
    pub no_match_action: Action,
}

impl Default for FirewallSettings {
    fn default() -> Self {
        FirewallSettings {
            topology: Topology::default(),
            proxies: default_routes(),
            idle_timeout: IDLE_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_logs: MAX_LOGS,
            no_match_action: Action::Accept,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FirewallCounters {
    pub accepted: u64,
    pub dropped: u64,
}

/// Decides the fate of packets at the pre-routing and local-out hooks.
///
/// The rule table, connection table and packet log each sit behind their own
/// lock; no code path holds two of them at once.
#[derive(Debug)]
pub struct Firewall {
    active: AtomicBool,
    rules: RwLock<RuleTable>,
    connections: ConnectionTable,
    log: Mutex<PacketLog>,
    classifier: ProxyClassifier,
    forger: PacketForger,
    no_match_action: Action,
    accepted: AtomicU64,
    dropped: AtomicU64,
}

impl Default for Firewall {
    fn default() -> Self {
        Firewall::new(FirewallSettings::default())
    }
}

impl Firewall {
    /// A new firewall starts inactive with no rules.
    pub fn new(settings: FirewallSettings) -> Self {
        Firewall {
            active: AtomicBool::new(false),
            rules: RwLock::new(RuleTable::default()),
            connections: ConnectionTable::with_idle_timeout(
                settings.max_connections,
                settings.idle_timeout,
            ),
            log: Mutex::new(PacketLog::new(settings.max_logs)),
            classifier: ProxyClassifier::new(settings.proxies),
            forger: PacketForger::new(settings.topology),
            no_match_action: settings.no_match_action,
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn replace_rules(&self, rules: Vec<Rule>) -> usize {
        let mut table = self.rules.write();
        table.replace(rules);
        table.len()
    }

    pub fn clear_rules(&self) {
        self.rules.write().clear();
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.rules.read().rules().to_vec()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn clear_connections(&self) -> usize {
        self.connections.clear_all()
    }

    pub fn classifier(&self) -> &ProxyClassifier {
        &self.classifier
    }

    pub fn topology(&self) -> &Topology {
        self.forger.topology()
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.log.lock().entries().to_vec()
    }

    pub fn log_count(&self) -> usize {
        self.log.lock().len()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    pub fn restore_log(&self, entries: Vec<LogEntry>) {
        self.log.lock().restore(entries);
    }

    pub fn counters(&self) -> FirewallCounters {
        FirewallCounters {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Short-circuit checks run before any table is consulted. `None` means
    /// the packet is not decided yet.
    pub fn preliminary_checks(&self, packet: &PacketBuf) -> Option<Verdict> {
        self.screen(packet).err()
    }

    pub fn evaluate_rules(
        &self,
        packet: &PacketInfo,
        in_iface: Option<&str>,
        out_iface: Option<&str>,
    ) -> Verdict {
        self.rules.read().evaluate(
            packet,
            in_iface,
            out_iface,
            self.forger.topology(),
            self.no_match_action,
        )
    }

    pub fn log_decision(&self, packet: &PacketInfo, hook: HookPoint, verdict: Verdict, now: Timestamp) {
        self.log
            .lock()
            .record(LogEntry::new(packet, hook, verdict, now));
    }

    /// Decide a packet seen at `hook`, rewriting it in place when it belongs
    /// to a proxied connection.
    pub fn process(
        &self,
        hook: HookPoint,
        packet: &mut PacketBuf,
        in_iface: Option<&str>,
        out_iface: Option<&str>,
        now: Timestamp,
    ) -> Verdict {
        let verdict = match self.screen(packet) {
            Err(verdict) => {
                if verdict.action == Action::Drop {
                    self.log_decision(&summarize(packet), hook, verdict, now);
                }
                verdict
            }
            Ok(info) => {
                let verdict = match hook {
                    HookPoint::PreRouting => self.pre_routing(packet, &info, in_iface, out_iface, now),
                    HookPoint::LocalOut => self.local_out(packet, &info, in_iface, now),
                };
                self.log_decision(&info, hook, verdict, now);
                verdict
            }
        };
        match verdict.action {
            Action::Accept => self.accepted.fetch_add(1, Ordering::Relaxed),
            Action::Drop => self.dropped.fetch_add(1, Ordering::Relaxed),
        };
        verdict
    }

    fn screen(&self, packet: &PacketBuf) -> Result<PacketInfo, Verdict> {
        if !self.is_active() {
            return Err(Verdict::accept(Reason::FirewallInactive));
        }
        if packet.version() != Some(4) {
            return Err(Verdict::accept(Reason::NotIpv4));
        }
        let info = PacketInfo::parse(packet).map_err(|err| {
            debug!(%err, "malformed packet");
            Verdict::drop(Reason::Malformed)
        })?;
        if info.is_loopback() {
            return Err(Verdict::accept(Reason::Loopback));
        }
        if info.tcp_flags.is_some_and(|flags| flags.is_xmas()) {
            return Err(Verdict::drop(Reason::ForbiddenFlags));
        }
        Ok(info)
    }

    fn pre_routing(
        &self,
        packet: &mut PacketBuf,
        info: &PacketInfo,
        in_iface: Option<&str>,
        out_iface: Option<&str>,
        now: Timestamp,
    ) -> Verdict {
        let (Some(src), Some(dst), Some(flags)) = (info.source(), info.destination(), info.tcp_flags)
        else {
            return self.evaluate_rules(info, in_iface, out_iface);
        };

        if let Some(tracked) = self
            .connections
            .track(src, dst, LookupMode::Endpoints, flags, now)
        {
            return self.apply_tracked(packet, &tracked, in_iface);
        }
        if !flags.is_bare_syn() {
            return Verdict::drop(Reason::NoConnection);
        }

        let verdict = self.evaluate_rules(info, in_iface, out_iface);
        if !verdict.is_accept() {
            return verdict;
        }
        self.open_connection(packet, src, dst, flags, in_iface, now)
            .unwrap_or(verdict)
    }

    /// Track the connection opened by an admitted SYN. Returns an overriding
    /// verdict when the SYN cannot be let through after all.
    fn open_connection(
        &self,
        packet: &mut PacketBuf,
        client: SocketAddrV4,
        server: SocketAddrV4,
        flags: packet_parser::TcpFlags,
        in_iface: Option<&str>,
        now: Timestamp,
    ) -> Option<Verdict> {
        let mut conn = Connection::new(client, server, now);
        match packet.tcp() {
            Ok(Some(tcp)) => {
                if self.classifier.is_proxied_port(&tcp)
                    && self.classifier.assign_proxy_port(&mut conn, &tcp).is_err()
                {
                    return Some(Verdict::drop(Reason::Malformed));
                }
            }
            _ => return Some(Verdict::drop(Reason::Malformed)),
        }
        conn.advance(Side::Client, flags, now);

        match self.connections.insert(conn.clone()) {
            Ok(()) => {}
            Err(ConnectionError::AlreadyTracked { .. }) => {
                // Another context created it between our lookup and insert.
                return Some(
                    match self
                        .connections
                        .track(client, server, LookupMode::Endpoints, flags, now)
                    {
                        Some(tracked) => self.apply_tracked(packet, &tracked, in_iface),
                        None => Verdict::drop(Reason::NoConnection),
                    },
                );
            }
            Err(err) => {
                warn!(%err, %client, %server, "connection not tracked, dropping syn");
                return Some(Verdict::drop(Reason::TableFull));
            }
        }

        if conn.proxied
            && let Err(err) = self.forger.forge(packet, &conn, Side::Client, in_iface)
        {
            warn!(%err, %client, %server, "forging opening syn failed");
            return Some(Verdict::drop(Reason::ForgeFailed));
        }
        None
    }

    fn local_out(
        &self,
        packet: &mut PacketBuf,
        info: &PacketInfo,
        in_iface: Option<&str>,
        now: Timestamp,
    ) -> Verdict {
        let (Some(src), Some(dst), Some(flags)) = (info.source(), info.destination(), info.tcp_flags)
        else {
            return Verdict::drop(Reason::NoConnection);
        };
        match self
            .connections
            .track(src, dst, LookupMode::ProxyPort, flags, now)
        {
            Some(tracked) => self.apply_tracked(packet, &tracked, in_iface),
            None => Verdict::drop(Reason::NoConnection),
        }
    }

    fn apply_tracked(&self, packet: &mut PacketBuf, tracked: &Tracked, in_iface: Option<&str>) -> Verdict {
        if !tracked.forgeable {
            warn!(side = ?tracked.side, client = %tracked.connection.client(), "proxy leg has no port yet, dropping");
            return Verdict::drop(Reason::ForgeFailed);
        }
        if tracked.action == Action::Drop {
            return Verdict::drop(Reason::Connection);
        }
        if tracked.connection.proxied
            && let Err(err) = self
                .forger
                .forge(packet, &tracked.connection, tracked.side, in_iface)
        {
            warn!(%err, side = ?tracked.side, client = %tracked.connection.client(), "forging tracked packet failed");
            return Verdict::drop(Reason::ForgeFailed);
        }
        Verdict::accept(Reason::Connection)
    }
}

/// Best-effort addressing for packets that failed to parse fully.
fn summarize(packet: &PacketBuf) -> PacketInfo {
    if let Ok(info) = PacketInfo::parse(packet) {
        return info;
    }
    let mut info = PacketInfo {
        src_ip: Ipv4Addr::UNSPECIFIED,
        dst_ip: Ipv4Addr::UNSPECIFIED,
        protocol: IpProtocol::Other(0),
        src_port: None,
        dst_port: None,
        tcp_flags: None,
    };
    if let Ok(ip) = packet.ipv4() {
        info.src_ip = ip.source_addr();
        info.dst_ip = ip.destination_addr();
        info.protocol = ip.protocol;
    }
    info
}

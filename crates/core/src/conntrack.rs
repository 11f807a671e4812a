#![forbid(unsafe_code)]

use crate::error::{ConnectionError, SnapshotError};
use crate::tcp_state::{Leg, TcpState};
use crate::types::{Action, Side, Timestamp};
use packet_parser::TcpFlags;
use parking_lot::Mutex;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::{debug, warn};

/// Seconds of inactivity after which a connection is reclaimed.
pub const IDLE_TIMEOUT: u64 = 25;
pub const DEFAULT_MAX_CONNECTIONS: usize = 65_535;

const LINE_FIELDS: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    /// Client/server tuple in either direction.
    Endpoints,
    /// Proxy-owned source port toward one of the original endpoints.
    ProxyPort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegKind {
    Regular,
    ProxyToClient,
    ProxyToServer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    client: SocketAddrV4,
    server: SocketAddrV4,
    pub proxy_as_server_port: Option<u16>,
    pub proxy_as_client_port: Option<u16>,
    pub proxied: bool,
    pub regular: Leg,
    pub proxy_to_client: Leg,
    pub proxy_to_server: Leg,
    pub last_activity: Timestamp,
}

impl Connection {
    pub fn new(client: SocketAddrV4, server: SocketAddrV4, now: Timestamp) -> Self {
        Connection {
            client,
            server,
            proxy_as_server_port: None,
            proxy_as_client_port: None,
            proxied: false,
            regular: Leg::new(Side::Client),
            proxy_to_client: Leg::new(Side::Client),
            proxy_to_server: Leg::new(Side::ProxyAsClient),
            last_activity: now,
        }
    }

    pub fn client(&self) -> SocketAddrV4 {
        self.client
    }

    pub fn server(&self) -> SocketAddrV4 {
        self.server
    }

    /// Whether a segment from `side` can be rewritten onto its proxy leg.
    /// Unproxied connections never need rewriting.
    pub fn can_forge(&self, side: Side) -> bool {
        if !self.proxied {
            return true;
        }
        match side {
            Side::Client => self.proxy_as_server_port.is_some(),
            Side::Server => self.proxy_as_client_port.is_some(),
            Side::ProxyAsClient | Side::ProxyAsServer => true,
            Side::Invalid => false,
        }
    }

    /// Side the packet `src -> dst` plays on this connection, if any.
    pub fn match_side(&self, src: SocketAddrV4, dst: SocketAddrV4, mode: LookupMode) -> Option<Side> {
        match mode {
            LookupMode::Endpoints => {
                if src == self.client && dst == self.server {
                    Some(Side::Client)
                } else if src == self.server && dst == self.client {
                    Some(Side::Server)
                } else {
                    None
                }
            }
            LookupMode::ProxyPort => {
                if Some(src.port()) == self.proxy_as_client_port && dst == self.server {
                    Some(Side::ProxyAsClient)
                } else if Some(src.port()) == self.proxy_as_server_port && dst == self.client {
                    Some(Side::ProxyAsServer)
                } else {
                    None
                }
            }
        }
    }

    /// Leg advanced by traffic from `side`.
    pub fn leg_kind(&self, side: Side) -> Option<LegKind> {
        if side == Side::Invalid {
            return None;
        }
        if !self.proxied {
            return Some(LegKind::Regular);
        }
        match side {
            Side::Client | Side::ProxyAsServer => Some(LegKind::ProxyToClient),
            Side::Server | Side::ProxyAsClient => Some(LegKind::ProxyToServer),
            Side::Invalid => None,
        }
    }

    pub fn leg(&self, kind: LegKind) -> &Leg {
        match kind {
            LegKind::Regular => &self.regular,
            LegKind::ProxyToClient => &self.proxy_to_client,
            LegKind::ProxyToServer => &self.proxy_to_server,
        }
    }

    pub fn leg_mut(&mut self, kind: LegKind) -> &mut Leg {
        match kind {
            LegKind::Regular => &mut self.regular,
            LegKind::ProxyToClient => &mut self.proxy_to_client,
            LegKind::ProxyToServer => &mut self.proxy_to_server,
        }
    }

    /// Feed a segment from `side` to the leg it belongs to. Accepted segments
    /// refresh `last_activity`.
    pub fn advance(&mut self, side: Side, flags: TcpFlags, now: Timestamp) -> Action {
        let Some(kind) = self.leg_kind(side) else {
            return Action::Drop;
        };
        let action = self.leg_mut(kind).advance(side, flags);
        if action == Action::Accept {
            self.last_activity = self.last_activity.max(now);
        }
        action
    }

    pub fn is_idle(&self, now: Timestamp, timeout: u64) -> bool {
        now.saturating_sub(self.last_activity) >= timeout
    }

    /// One line of whitespace-separated numbers, see [`Connection::from_line`].
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {} {} {} {} {} {} {} {} {}",
            u32::from(*self.client.ip()),
            self.client.port(),
            u32::from(*self.server.ip()),
            self.server.port(),
            self.proxy_as_server_port.unwrap_or(0),
            self.proxy_as_client_port.unwrap_or(0),
            self.regular.state.code(),
            self.proxy_to_client.state.code(),
            self.proxy_to_server.state.code(),
            self.regular.initiator.code(),
            self.proxy_to_client.initiator.code(),
            self.proxy_to_server.initiator.code(),
            self.last_activity,
        )
    }

    pub fn from_line(line: &str) -> Result<Self, SnapshotError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != LINE_FIELDS {
            return Err(SnapshotError::FieldCount {
                expected: LINE_FIELDS,
                found: fields.len(),
            });
        }
        let addr = |idx: usize, name: &'static str| -> Result<Ipv4Addr, SnapshotError> {
            fields[idx]
                .parse::<u32>()
                .map(Ipv4Addr::from)
                .map_err(|_| SnapshotError::field(name, fields[idx]))
        };
        let port = |idx: usize, name: &'static str| -> Result<u16, SnapshotError> {
            fields[idx]
                .parse::<u16>()
                .map_err(|_| SnapshotError::field(name, fields[idx]))
        };
        let state = |idx: usize| -> Result<TcpState, SnapshotError> {
            fields[idx]
                .parse::<u8>()
                .ok()
                .and_then(TcpState::from_code)
                .ok_or_else(|| SnapshotError::field("state", fields[idx]))
        };
        let side = |idx: usize| -> Result<Side, SnapshotError> {
            fields[idx]
                .parse::<u8>()
                .ok()
                .and_then(Side::from_code)
                .ok_or_else(|| SnapshotError::field("initiator", fields[idx]))
        };

        let proxy_as_server_port = Some(port(4, "proxy-as-server port")?).filter(|p| *p != 0);
        let proxy_as_client_port = Some(port(5, "proxy-as-client port")?).filter(|p| *p != 0);
        Ok(Connection {
            client: SocketAddrV4::new(addr(0, "client address")?, port(1, "client port")?),
            server: SocketAddrV4::new(addr(2, "server address")?, port(3, "server port")?),
            proxy_as_server_port,
            proxy_as_client_port,
            proxied: proxy_as_server_port.is_some(),
            regular: Leg {
                state: state(6)?,
                initiator: side(9)?,
            },
            proxy_to_client: Leg {
                state: state(7)?,
                initiator: side(10)?,
            },
            proxy_to_server: Leg {
                state: state(8)?,
                initiator: side(11)?,
            },
            last_activity: fields[12]
                .parse()
                .map_err(|_| SnapshotError::field("last activity", fields[12]))?,
        })
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.client, self.server)?;
        if self.proxied {
            write!(
                f,
                " proxied(server-port={}, client-port={}) p2c={:?}/{:?} p2s={:?}/{:?}",
                self.proxy_as_server_port.unwrap_or(0),
                self.proxy_as_client_port.unwrap_or(0),
                self.proxy_to_client.state,
                self.proxy_to_client.initiator,
                self.proxy_to_server.state,
                self.proxy_to_server.initiator,
            )?;
        } else {
            write!(f, " {:?}/{:?}", self.regular.state, self.regular.initiator)?;
        }
        write!(f, " last={}", self.last_activity)
    }
}

/// Outcome of [`ConnectionTable::track`]: the connection after the update,
/// the side the packet played and the state machine's verdict.
///
/// `forgeable` is false when the segment would have been accepted but its
/// proxy leg has no port to rewrite toward yet. The connection is then left
/// as it was and `action` is [`Action::Drop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracked {
    pub connection: Connection,
    pub side: Side,
    pub action: Action,
    pub forgeable: bool,
}

/// Bounded list of live connections behind a single lock.
///
/// Every pass over the table (lookup, track, insert, listing) first evicts
/// idle entries inside the same critical section, so a match can never land
/// on a connection that should already have been reclaimed.
#[derive(Debug)]
pub struct ConnectionTable {
    entries: Mutex<Vec<Connection>>,
    capacity: usize,
    idle_timeout: u64,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        ConnectionTable::new(DEFAULT_MAX_CONNECTIONS)
    }
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        Self::with_idle_timeout(capacity, IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(capacity: usize, idle_timeout: u64) -> Self {
        ConnectionTable {
            entries: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            idle_timeout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn idle_timeout(&self) -> u64 {
        self.idle_timeout
    }

    /// Current entry count, idle entries included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn lookup(
        &self,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        mode: LookupMode,
        now: Timestamp,
    ) -> Option<(Connection, Side)> {
        let mut entries = self.entries.lock();
        evict_locked(&mut entries, now, self.idle_timeout);
        entries
            .iter()
            .find_map(|conn| conn.match_side(src, dst, mode).map(|side| (conn.clone(), side)))
    }

    /// Lookup and state advance in one critical section. An accepted segment
    /// that could not be forged is not committed.
    pub fn track(
        &self,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        mode: LookupMode,
        flags: TcpFlags,
        now: Timestamp,
    ) -> Option<Tracked> {
        let mut entries = self.entries.lock();
        evict_locked(&mut entries, now, self.idle_timeout);
        let (conn, side) = entries
            .iter_mut()
            .find_map(|conn| conn.match_side(src, dst, mode).map(|side| (conn, side)))?;
        let mut next = conn.clone();
        let action = next.advance(side, flags, now);
        if action == Action::Accept && !next.can_forge(side) {
            debug!(client = %conn.client, server = %conn.server, ?side, ?flags, "proxy port missing, segment not tracked");
            return Some(Tracked {
                connection: conn.clone(),
                side,
                action: Action::Drop,
                forgeable: false,
            });
        }
        *conn = next;
        debug!(
            client = %conn.client,
            server = %conn.server,
            ?side,
            ?flags,
            ?action,
            "tracked segment"
        );
        Some(Tracked {
            connection: conn.clone(),
            side,
            action,
            forgeable: true,
        })
    }

    /// Track a new connection with every leg at its default.
    pub fn create(
        &self,
        client: SocketAddrV4,
        server: SocketAddrV4,
        now: Timestamp,
    ) -> Result<Connection, ConnectionError> {
        let conn = Connection::new(client, server, now);
        self.insert(conn.clone())?;
        Ok(conn)
    }

    /// Store a prepared connection. Fails when the table is full or the
    /// endpoints are already tracked in either direction.
    pub fn insert(&self, connection: Connection) -> Result<(), ConnectionError> {
        let mut entries = self.entries.lock();
        evict_locked(&mut entries, connection.last_activity, self.idle_timeout);
        if entries.iter().any(|c| {
            c.match_side(connection.client, connection.server, LookupMode::Endpoints)
                .is_some()
        }) {
            return Err(ConnectionError::AlreadyTracked {
                client: connection.client,
                server: connection.server,
            });
        }
        if entries.len() >= self.capacity {
            warn!(capacity = self.capacity, "connection table full");
            return Err(ConnectionError::TableFull {
                capacity: self.capacity,
            });
        }
        debug!(client = %connection.client, server = %connection.server, proxied = connection.proxied, "connection created");
        entries.push(connection);
        Ok(())
    }

    pub fn evict_expired(&self, now: Timestamp) -> usize {
        let mut entries = self.entries.lock();
        evict_locked(&mut entries, now, self.idle_timeout)
    }

    pub fn clear_all(&self) -> usize {
        let mut entries = self.entries.lock();
        let removed = entries.len();
        entries.clear();
        removed
    }

    /// Record the port the proxy uses toward the real server.
    pub fn assign_proxy_client_port(
        &self,
        client: SocketAddrV4,
        server: SocketAddrV4,
        port: u16,
        now: Timestamp,
    ) -> Result<(), ConnectionError> {
        let mut entries = self.entries.lock();
        evict_locked(&mut entries, now, self.idle_timeout);
        let conn = entries
            .iter_mut()
            .find(|c| c.client == client && c.server == server)
            .ok_or(ConnectionError::NotFound { client, server })?;
        if !conn.proxied {
            return Err(ConnectionError::NotProxied { client, server });
        }
        match conn.proxy_as_client_port {
            Some(existing) if existing != port => Err(ConnectionError::ProxyPortAlreadySet(existing)),
            Some(_) => Ok(()),
            None => {
                conn.proxy_as_client_port = Some(port);
                debug!(%client, %server, port, "proxy client port registered");
                Ok(())
            }
        }
    }

    /// Original server of the connection opened by `client`.
    pub fn server_for_client(&self, client: SocketAddrV4, now: Timestamp) -> Option<SocketAddrV4> {
        let mut entries = self.entries.lock();
        evict_locked(&mut entries, now, self.idle_timeout);
        entries.iter().find(|c| c.client == client).map(|c| c.server)
    }

    /// Live connections after eviction.
    pub fn snapshot(&self, now: Timestamp) -> Vec<Connection> {
        let mut entries = self.entries.lock();
        evict_locked(&mut entries, now, self.idle_timeout);
        entries.clone()
    }

    /// Replace the table contents, keeping at most `capacity` entries. A
    /// connection whose endpoints are already present, in either direction,
    /// is skipped so the first record wins.
    pub fn restore(&self, connections: Vec<Connection>) -> usize {
        let mut entries = self.entries.lock();
        entries.clear();
        for conn in connections {
            if entries.len() >= self.capacity {
                warn!(capacity = self.capacity, "connection snapshot truncated");
                break;
            }
            if entries
                .iter()
                .any(|c| c.match_side(conn.client, conn.server, LookupMode::Endpoints).is_some())
            {
                warn!(client = %conn.client, server = %conn.server, "skipping duplicate connection in snapshot");
                continue;
            }
            entries.push(conn);
        }
        entries.len()
    }
}

fn evict_locked(entries: &mut Vec<Connection>, now: Timestamp, timeout: u64) -> usize {
    let before = entries.len();
    entries.retain(|conn| {
        let keep = !conn.is_idle(now, timeout);
        if !keep {
            debug!(client = %conn.client, server = %conn.server, last = conn.last_activity, "evicting idle connection");
        }
        keep
    });
    before - entries.len()
}

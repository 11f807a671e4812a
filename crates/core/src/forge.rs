#![forbid(unsafe_code)]

use crate::conntrack::Connection;
use crate::error::ForgeError;
use crate::types::Side;
use packet_parser::{PacketBuf, ParseError};
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::{debug, error};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub struct Interface {
    pub name: String,
    pub address: Ipv4Addr,
}

/// The firewall sits between an inner and an outer network, owning one
/// address on each.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct Topology {
    pub inner: Interface,
    pub outer: Interface,
}

impl Default for Topology {
    fn default() -> Self {
        Topology {
            inner: Interface {
                name: "eth1".into(),
                address: Ipv4Addr::new(10, 1, 1, 3),
            },
            outer: Interface {
                name: "eth2".into(),
                address: Ipv4Addr::new(10, 1, 2, 3),
            },
        }
    }
}

impl Topology {
    /// Local address on the interface opposite to `arrived_on`. Anything not
    /// arriving on the inner interface is treated as coming from outside.
    pub fn opposite_address(&self, arrived_on: Option<&str>) -> Ipv4Addr {
        if arrived_on == Some(self.inner.name.as_str()) {
            self.outer.address
        } else {
            self.inner.address
        }
    }

    pub fn is_inner(&self, iface: &str) -> bool {
        self.inner.name == iface
    }

    pub fn is_outer(&self, iface: &str) -> bool {
        self.outer.name == iface
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rewrite {
    Destination(SocketAddrV4),
    Source(SocketAddrV4),
}

/// Rewrites proxied packets so the local proxy sees (and emits) them as if it
/// were the real peer.
#[derive(Debug, Clone, Default)]
pub struct PacketForger {
    topology: Topology,
}

impl PacketForger {
    pub fn new(topology: Topology) -> Self {
        PacketForger { topology }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Rewrite `packet` for a segment sent by `side` on `conn`, then recompute
    /// IPv4 and TCP checksums. On error the buffer is left untouched.
    pub fn forge(
        &self,
        packet: &mut PacketBuf,
        conn: &Connection,
        side: Side,
        in_iface: Option<&str>,
    ) -> Result<(), ForgeError> {
        let rewrite = self.plan(packet, conn, side, in_iface)?;
        match rewrite {
            Rewrite::Destination(target) => {
                packet.set_destination(*target.ip())?;
                packet.set_tcp_destination_port(target.port())?;
            }
            Rewrite::Source(target) => {
                packet.set_source(*target.ip())?;
                packet.set_tcp_source_port(target.port())?;
            }
        }
        packet.recompute_checksums()?;
        debug!(?side, ?rewrite, client = %conn.client(), "forged packet");
        Ok(())
    }

    fn plan(
        &self,
        packet: &PacketBuf,
        conn: &Connection,
        side: Side,
        in_iface: Option<&str>,
    ) -> Result<Rewrite, ForgeError> {
        if packet.tcp()?.is_none() {
            return Err(ForgeError::Packet(ParseError::Unsupported("forging non-tcp packet")));
        }
        let proxy_addr = self.topology.opposite_address(in_iface);
        match side {
            Side::Client => {
                let port = conn
                    .proxy_as_server_port
                    .ok_or(ForgeError::MissingProxyPort("proxy-as-server"))?;
                Ok(Rewrite::Destination(SocketAddrV4::new(proxy_addr, port)))
            }
            Side::Server => {
                let port = conn
                    .proxy_as_client_port
                    .ok_or(ForgeError::MissingProxyPort("proxy-as-client"))?;
                Ok(Rewrite::Destination(SocketAddrV4::new(proxy_addr, port)))
            }
            Side::ProxyAsClient => Ok(Rewrite::Source(conn.client())),
            Side::ProxyAsServer => Ok(Rewrite::Source(conn.server())),
            Side::Invalid => {
                error!(client = %conn.client(), server = %conn.server(), "refusing to forge for invalid side");
                Err(ForgeError::InvalidSide)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet_parser::TcpFlags;

    fn tcp_packet(src: SocketAddrV4, dst: SocketAddrV4, flags: TcpFlags) -> PacketBuf {
        let mut raw = vec![
            0x45, 0x00, 0x00, 0x30, 0x00, 0x01, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00,
        ];
        raw.extend_from_slice(&src.ip().octets());
        raw.extend_from_slice(&dst.ip().octets());
        raw.extend_from_slice(&src.port().to_be_bytes());
        raw.extend_from_slice(&dst.port().to_be_bytes());
        raw.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, flags.bits() as u8, 0x20, 0x00]);
        raw.extend_from_slice(&[0, 0, 0, 0]);
        raw.extend_from_slice(b"GET /\r\n\r");
        let mut packet = PacketBuf::new(raw);
        packet.recompute_checksums().unwrap();
        packet
    }

    fn conn() -> Connection {
        let mut conn = Connection::new(
            "10.1.1.7:1234".parse().unwrap(),
            "10.1.2.9:80".parse().unwrap(),
            0,
        );
        conn.proxied = true;
        conn.proxy_as_server_port = Some(8001);
        conn.proxy_as_client_port = Some(40000);
        conn
    }

    #[test]
    fn client_packet_is_redirected_to_proxy() {
        let conn = conn();
        let forger = PacketForger::default();
        let mut packet = tcp_packet(conn.client(), conn.server(), TcpFlags::SYN);
        forger.forge(&mut packet, &conn, Side::Client, Some("eth1")).unwrap();
        assert_eq!(packet.source().unwrap(), *conn.client().ip());
        assert_eq!(packet.destination().unwrap(), Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(packet.ports().unwrap(), Some((1234, 8001)));
        assert!(packet.checksums_valid());
    }

    #[test]
    fn server_packet_is_redirected_to_proxy_client_port() {
        let conn = conn();
        let forger = PacketForger::default();
        let mut packet = tcp_packet(conn.server(), conn.client(), TcpFlags::SYN | TcpFlags::ACK);
        forger.forge(&mut packet, &conn, Side::Server, Some("eth2")).unwrap();
        assert_eq!(packet.destination().unwrap(), Ipv4Addr::new(10, 1, 1, 3));
        assert_eq!(packet.ports().unwrap(), Some((80, 40000)));
        assert!(packet.checksums_valid());
    }

    #[test]
    fn proxy_packets_take_original_identity() {
        let conn = conn();
        let forger = PacketForger::default();

        let mut to_server = tcp_packet("10.1.2.3:40000".parse().unwrap(), conn.server(), TcpFlags::SYN);
        forger.forge(&mut to_server, &conn, Side::ProxyAsClient, None).unwrap();
        assert_eq!(to_server.source().unwrap(), *conn.client().ip());
        assert_eq!(to_server.ports().unwrap(), Some((1234, 80)));
        assert!(to_server.checksums_valid());

        let mut to_client = tcp_packet("10.1.1.3:8001".parse().unwrap(), conn.client(), TcpFlags::ACK);
        forger.forge(&mut to_client, &conn, Side::ProxyAsServer, None).unwrap();
        assert_eq!(to_client.source().unwrap(), *conn.server().ip());
        assert_eq!(to_client.ports().unwrap(), Some((80, 1234)));
        assert!(to_client.checksums_valid());
    }

    #[test]
    fn invalid_side_leaves_packet_untouched() {
        let conn = conn();
        let forger = PacketForger::default();
        let mut packet = tcp_packet(conn.client(), conn.server(), TcpFlags::SYN);
        let before = packet.clone();
        assert_eq!(
            forger.forge(&mut packet, &conn, Side::Invalid, Some("eth1")),
            Err(ForgeError::InvalidSide)
        );
        assert_eq!(packet, before);
    }

    #[test]
    fn missing_proxy_client_port_aborts() {
        let mut conn = conn();
        conn.proxy_as_client_port = None;
        let forger = PacketForger::default();
        let mut packet = tcp_packet(conn.server(), conn.client(), TcpFlags::ACK);
        let before = packet.clone();
        assert!(matches!(
            forger.forge(&mut packet, &conn, Side::Server, Some("eth2")),
            Err(ForgeError::MissingProxyPort(_))
        ));
        assert_eq!(packet, before);
    }

    #[test]
    fn opposite_address_defaults_to_inner() {
        let topo = Topology::default();
        assert_eq!(topo.opposite_address(Some("eth1")), Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(topo.opposite_address(Some("eth2")), Ipv4Addr::new(10, 1, 1, 3));
        assert_eq!(topo.opposite_address(None), Ipv4Addr::new(10, 1, 1, 3));
    }
}

#![forbid(unsafe_code)]

use packet_parser::{IpProtocol, PacketBuf, ParseError, TcpFlags};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Unix time in whole seconds.
pub type Timestamp = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Action {
    Drop,
    Accept,
}

impl Action {
    pub fn code(self) -> u8 {
        match self {
            Action::Drop => 0,
            Action::Accept => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Action::Drop),
            1 => Some(Action::Accept),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Drop => f.write_str("drop"),
            Action::Accept => f.write_str("accept"),
        }
    }
}

/// Why a verdict was reached. Logged as a signed code: rule hits use the rule
/// index, everything else a fixed negative value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    Rule(usize),
    FirewallInactive,
    NoMatchingRule,
    NotIpv4,
    ForbiddenFlags,
    Loopback,
    Malformed,
    Connection,
    NoConnection,
    TableFull,
    ForgeFailed,
}

impl Reason {
    pub fn code(self) -> i32 {
        match self {
            Reason::Rule(index) => index as i32,
            Reason::FirewallInactive => -1,
            Reason::NoMatchingRule => -2,
            Reason::NotIpv4 => -3,
            Reason::ForbiddenFlags => -4,
            Reason::Loopback => -5,
            Reason::Malformed => -6,
            Reason::Connection => -17,
            Reason::NoConnection => -18,
            Reason::TableFull => -19,
            Reason::ForgeFailed => -20,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            c if c >= 0 => Reason::Rule(c as usize),
            -1 => Reason::FirewallInactive,
            -2 => Reason::NoMatchingRule,
            -3 => Reason::NotIpv4,
            -4 => Reason::ForbiddenFlags,
            -5 => Reason::Loopback,
            -6 => Reason::Malformed,
            -17 => Reason::Connection,
            -18 => Reason::NoConnection,
            -19 => Reason::TableFull,
            -20 => Reason::ForgeFailed,
            _ => return None,
        })
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Rule(index) => write!(f, "rule #{index}"),
            Reason::FirewallInactive => f.write_str("firewall inactive"),
            Reason::NoMatchingRule => f.write_str("no matching rule"),
            Reason::NotIpv4 => f.write_str("not ipv4"),
            Reason::ForbiddenFlags => f.write_str("forbidden tcp flags"),
            Reason::Loopback => f.write_str("loopback"),
            Reason::Malformed => f.write_str("malformed packet"),
            Reason::Connection => f.write_str("connection state"),
            Reason::NoConnection => f.write_str("no matching connection"),
            Reason::TableFull => f.write_str("connection table full"),
            Reason::ForgeFailed => f.write_str("forge failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Verdict {
    pub action: Action,
    pub reason: Reason,
}

impl Verdict {
    pub fn accept(reason: Reason) -> Self {
        Verdict {
            action: Action::Accept,
            reason,
        }
    }

    pub fn drop(reason: Reason) -> Self {
        Verdict {
            action: Action::Drop,
            reason,
        }
    }

    pub fn is_accept(&self) -> bool {
        self.action == Action::Accept
    }
}

/// Interception points, numbered like the netfilter hooks they stand for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    PreRouting,
    LocalOut,
}

impl HookPoint {
    pub fn code(self) -> u8 {
        match self {
            HookPoint::PreRouting => 0,
            HookPoint::LocalOut => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(HookPoint::PreRouting),
            3 => Some(HookPoint::LocalOut),
            _ => None,
        }
    }
}

/// Role of a packet's sender relative to a tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
    ProxyAsClient,
    ProxyAsServer,
    Invalid,
}

impl Side {
    pub fn code(self) -> u8 {
        match self {
            Side::Client => 0,
            Side::Server => 1,
            Side::ProxyAsClient => 2,
            Side::ProxyAsServer => 3,
            Side::Invalid => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Side::Client),
            1 => Some(Side::Server),
            2 => Some(Side::ProxyAsClient),
            3 => Some(Side::ProxyAsServer),
            4 => Some(Side::Invalid),
            _ => None,
        }
    }
}

/// Addressing summary of an IPv4 packet, used for rule matching and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketInfo {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub protocol: IpProtocol,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub tcp_flags: Option<TcpFlags>,
}

impl PacketInfo {
    /// Parse the IPv4 header and, for TCP/UDP, the transport header. A packet
    /// whose transport header is truncated or invalid is an error.
    pub fn parse(packet: &PacketBuf) -> Result<Self, ParseError> {
        let ip = packet.ipv4()?;
        let mut info = PacketInfo {
            src_ip: ip.source_addr(),
            dst_ip: ip.destination_addr(),
            protocol: ip.protocol,
            src_port: None,
            dst_port: None,
            tcp_flags: None,
        };
        match ip.protocol {
            IpProtocol::Tcp => {
                let tcp = packet_parser::parse_tcp_segment(ip.payload)?;
                info.src_port = Some(tcp.source_port);
                info.dst_port = Some(tcp.destination_port);
                info.tcp_flags = Some(tcp.flags);
            }
            IpProtocol::Udp => {
                let udp = packet_parser::parse_udp_datagram(ip.payload)?;
                info.src_port = Some(udp.source_port);
                info.dst_port = Some(udp.destination_port);
            }
            IpProtocol::Icmpv4 => {
                packet_parser::parse_icmpv4_packet(ip.payload)?;
            }
            IpProtocol::Other(_) => {}
        }
        Ok(info)
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == IpProtocol::Tcp
    }

    /// Source endpoint for TCP/UDP packets.
    pub fn source(&self) -> Option<SocketAddrV4> {
        self.src_port.map(|port| SocketAddrV4::new(self.src_ip, port))
    }

    pub fn destination(&self) -> Option<SocketAddrV4> {
        self.dst_port.map(|port| SocketAddrV4::new(self.dst_ip, port))
    }

    pub fn is_loopback(&self) -> bool {
        self.src_ip.is_loopback() && self.dst_ip.is_loopback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_are_stable() {
        for reason in [
            Reason::Rule(0),
            Reason::Rule(49),
            Reason::FirewallInactive,
            Reason::NoMatchingRule,
            Reason::NotIpv4,
            Reason::ForbiddenFlags,
            Reason::Loopback,
            Reason::Malformed,
            Reason::Connection,
            Reason::NoConnection,
            Reason::TableFull,
            Reason::ForgeFailed,
        ] {
            assert_eq!(Reason::from_code(reason.code()), Some(reason));
        }
        assert_eq!(Reason::Connection.code(), -17);
        assert_eq!(Reason::ForbiddenFlags.code(), -4);
        assert_eq!(Reason::from_code(-99), None);
    }

    #[test]
    fn hook_and_side_codes() {
        assert_eq!(HookPoint::LocalOut.code(), 3);
        assert_eq!(HookPoint::from_code(1), None);
        assert_eq!(Side::from_code(Side::ProxyAsClient.code()), Some(Side::ProxyAsClient));
        assert_eq!(Side::from_code(5), None);
    }

    #[test]
    fn packet_info_rejects_truncated_tcp() {
        let mut raw = vec![
            0x45, 0x00, 0x00, 0x1c, 0x00, 0x00, 0x00, 0x00, 0x40, 0x06, 0x00, 0x00, 10, 0, 0, 1,
            10, 0, 0, 2,
        ];
        raw.extend_from_slice(&[0u8; 8]);
        let packet = PacketBuf::new(raw);
        assert!(matches!(
            PacketInfo::parse(&packet),
            Err(ParseError::Truncated(_))
        ));
    }
}

#![forbid(unsafe_code)]

use crate::error::RuleError;
use crate::forge::Topology;
use crate::types::{Action, PacketInfo, Reason, Verdict};
use packet_parser::{IpProtocol, TcpFlags};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use tracing::warn;

pub const MAX_RULES: usize = 50;
pub const MAX_RULE_NAME: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleDirection {
    /// Outer network toward inner.
    In,
    /// Inner network toward outer.
    Out,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleProtocol {
    Icmp,
    Tcp,
    Udp,
    Other,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortMatch {
    Any,
    /// Unprivileged ports, `>1023` in rule text.
    Above1023,
    Exact(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckMatch {
    No,
    Yes,
    Any,
}

/// IPv4 network prefix. Length 0 matches every address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Prefix {
    pub addr: Ipv4Addr,
    pub len: u8,
}

impl Prefix {
    pub const ANY: Prefix = Prefix {
        addr: Ipv4Addr::UNSPECIFIED,
        len: 0,
    };

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = mask_v4(self.len);
        (u32::from(self.addr) & mask) == (u32::from(ip) & mask)
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.len == 0 {
            f.write_str("any")
        } else {
            write!(f, "{}/{}", self.addr, self.len)
        }
    }
}

impl FromStr for Prefix {
    type Err = RuleError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = || RuleError::InvalidField {
            field: "prefix",
            value: input.to_string(),
        };
        if input.eq_ignore_ascii_case("any") {
            return Ok(Prefix::ANY);
        }
        let (addr, len) = match input.split_once('/') {
            Some((addr, len)) => (addr, len.parse::<u8>().map_err(|_| invalid())?),
            None => (input, 32),
        };
        if len > 32 {
            return Err(invalid());
        }
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        Ok(Prefix { addr, len })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub name: String,
    pub direction: RuleDirection,
    pub src: Prefix,
    pub dst: Prefix,
    pub protocol: RuleProtocol,
    pub src_port: PortMatch,
    pub dst_port: PortMatch,
    pub ack: AckMatch,
    pub action: Action,
}

impl Rule {
    pub fn matches(
        &self,
        packet: &PacketInfo,
        in_iface: Option<&str>,
        out_iface: Option<&str>,
        topology: &Topology,
    ) -> bool {
        if !direction_matches(self.direction, in_iface, out_iface, topology) {
            return false;
        }
        if !self.src.contains(packet.src_ip) || !self.dst.contains(packet.dst_ip) {
            return false;
        }
        if !protocol_matches(self.protocol, packet.protocol) {
            return false;
        }
        if let (Some(sport), Some(dport)) = (packet.src_port, packet.dst_port)
            && (!port_matches(self.src_port, sport) || !port_matches(self.dst_port, dport))
        {
            return false;
        }
        if let Some(flags) = packet.tcp_flags {
            let ack = flags.contains(TcpFlags::ACK);
            match self.ack {
                AckMatch::Yes if !ack => return false,
                AckMatch::No if ack => return false,
                _ => {}
            }
        }
        true
    }
}

fn direction_matches(
    direction: RuleDirection,
    in_iface: Option<&str>,
    out_iface: Option<&str>,
    topology: &Topology,
) -> bool {
    let (from, to): (fn(&Topology, &str) -> bool, fn(&Topology, &str) -> bool) = match direction {
        RuleDirection::Any => return true,
        RuleDirection::In => (Topology::is_outer, Topology::is_inner),
        RuleDirection::Out => (Topology::is_inner, Topology::is_outer),
    };
    if in_iface.is_none() && out_iface.is_none() {
        return false;
    }
    in_iface.is_none_or(|i| from(topology, i)) && out_iface.is_none_or(|o| to(topology, o))
}

fn protocol_matches(rule: RuleProtocol, packet: IpProtocol) -> bool {
    match rule {
        RuleProtocol::Any => true,
        RuleProtocol::Icmp => packet == IpProtocol::Icmpv4,
        RuleProtocol::Tcp => packet == IpProtocol::Tcp,
        RuleProtocol::Udp => packet == IpProtocol::Udp,
        RuleProtocol::Other => matches!(packet, IpProtocol::Other(_)),
    }
}

fn port_matches(rule: PortMatch, port: u16) -> bool {
    match rule {
        PortMatch::Any => true,
        PortMatch::Above1023 => port > 1023,
        PortMatch::Exact(p) => p == port,
    }
}

fn mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix.min(32))
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            RuleDirection::In => "in",
            RuleDirection::Out => "out",
            RuleDirection::Any => "any",
        };
        let protocol = match self.protocol {
            RuleProtocol::Icmp => "ICMP",
            RuleProtocol::Tcp => "TCP",
            RuleProtocol::Udp => "UDP",
            RuleProtocol::Other => "other",
            RuleProtocol::Any => "any",
        };
        let port = |p: PortMatch| match p {
            PortMatch::Any => "any".to_string(),
            PortMatch::Above1023 => ">1023".to_string(),
            PortMatch::Exact(n) => n.to_string(),
        };
        let ack = match self.ack {
            AckMatch::No => "no",
            AckMatch::Yes => "yes",
            AckMatch::Any => "any",
        };
        write!(
            f,
            "{} {} {} {} {} {} {} {} {}",
            self.name,
            direction,
            self.src,
            self.dst,
            protocol,
            port(self.src_port),
            port(self.dst_port),
            ack,
            self.action
        )
    }
}

impl FromStr for Rule {
    type Err = RuleError;

    /// `name direction src dst protocol src_port dst_port ack action`
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 9 {
            return Err(RuleError::FieldCount(fields.len()));
        }
        let invalid = |field: &'static str, value: &str| RuleError::InvalidField {
            field,
            value: value.to_string(),
        };

        let name = fields[0];
        if name.chars().count() > MAX_RULE_NAME {
            return Err(RuleError::NameTooLong {
                name: name.to_string(),
                max: MAX_RULE_NAME,
            });
        }
        let direction = match fields[1].to_ascii_lowercase().as_str() {
            "in" => RuleDirection::In,
            "out" => RuleDirection::Out,
            "any" => RuleDirection::Any,
            _ => return Err(invalid("direction", fields[1])),
        };
        let protocol = match fields[4].to_ascii_lowercase().as_str() {
            "icmp" => RuleProtocol::Icmp,
            "tcp" => RuleProtocol::Tcp,
            "udp" => RuleProtocol::Udp,
            "other" => RuleProtocol::Other,
            "any" => RuleProtocol::Any,
            _ => return Err(invalid("protocol", fields[4])),
        };
        let port = |value: &str| -> Result<PortMatch, RuleError> {
            match value {
                v if v.eq_ignore_ascii_case("any") => Ok(PortMatch::Any),
                ">1023" => Ok(PortMatch::Above1023),
                v => v
                    .parse::<u16>()
                    .map(PortMatch::Exact)
                    .map_err(|_| invalid("port", v)),
            }
        };
        let ack = match fields[7].to_ascii_lowercase().as_str() {
            "no" => AckMatch::No,
            "yes" => AckMatch::Yes,
            "any" => AckMatch::Any,
            _ => return Err(invalid("ack", fields[7])),
        };
        let action = match fields[8].to_ascii_lowercase().as_str() {
            "accept" => Action::Accept,
            "drop" => Action::Drop,
            _ => return Err(invalid("action", fields[8])),
        };

        Ok(Rule {
            name: name.to_string(),
            direction,
            src: fields[2].parse()?,
            dst: fields[3].parse()?,
            protocol,
            src_port: port(fields[5])?,
            dst_port: port(fields[6])?,
            ack,
            action,
        })
    }
}

/// Ordered rule list; the first matching rule decides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleTable {
    rules: Vec<Rule>,
}

impl RuleTable {
    pub fn new(rules: Vec<Rule>) -> Self {
        let mut table = RuleTable::default();
        table.replace(rules);
        table
    }

    /// Install a new rule set, keeping the first [`MAX_RULES`] entries.
    pub fn replace(&mut self, mut rules: Vec<Rule>) {
        if rules.len() > MAX_RULES {
            warn!(
                supplied = rules.len(),
                kept = MAX_RULES,
                "rule table full, extra rules ignored"
            );
            rules.truncate(MAX_RULES);
        }
        self.rules = rules;
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn evaluate(
        &self,
        packet: &PacketInfo,
        in_iface: Option<&str>,
        out_iface: Option<&str>,
        topology: &Topology,
        no_match: Action,
    ) -> Verdict {
        self.rules
            .iter()
            .position(|rule| rule.matches(packet, in_iface, out_iface, topology))
            .map(|index| Verdict {
                action: self.rules[index].action,
                reason: Reason::Rule(index),
            })
            .unwrap_or(Verdict {
                action: no_match,
                reason: Reason::NoMatchingRule,
            })
    }
}

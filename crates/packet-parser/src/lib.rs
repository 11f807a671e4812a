#![forbid(unsafe_code)]

mod buffer;
mod checksum;

pub use buffer::PacketBuf;
pub use checksum::{internet_checksum, ipv4_header_checksum, tcp_checksum};

use bitflags::bitflags;
use std::net::Ipv4Addr;

/// Errors that can occur during parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("invalid {0}")]
    Invalid(&'static str),
    #[error("unsupported {0}")]
    Unsupported(&'static str),
}

/// Identifies the payload protocol for IPv4 packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpProtocol {
    Icmpv4,
    Tcp,
    Udp,
    Other(u8),
}

impl IpProtocol {
    pub fn from_raw(value: u8) -> Self {
        match value {
            1 => IpProtocol::Icmpv4,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            other => IpProtocol::Other(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match *self {
            IpProtocol::Icmpv4 => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Other(v) => v,
        }
    }

    /// True for the protocols that carry 16-bit ports.
    pub fn has_ports(&self) -> bool {
        matches!(self, IpProtocol::Tcp | IpProtocol::Udp)
    }
}

bitflags! {
    /// TCP control bits as carried in the low nine bits of header word 6.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TcpFlags: u16 {
        const FIN = 0x001;
        const SYN = 0x002;
        const RST = 0x004;
        const PSH = 0x008;
        const ACK = 0x010;
        const URG = 0x020;
        const ECE = 0x040;
        const CWR = 0x080;
        const NS = 0x100;
    }
}

impl TcpFlags {
    /// SYN without ACK or RST: the only segment allowed to open a connection.
    pub fn is_bare_syn(&self) -> bool {
        self.contains(TcpFlags::SYN) && !self.intersects(TcpFlags::ACK | TcpFlags::RST)
    }

    /// FIN, PSH and URG all set at once.
    pub fn is_xmas(&self) -> bool {
        self.contains(TcpFlags::FIN | TcpFlags::PSH | TcpFlags::URG)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header<'a> {
    pub header_length: usize,
    pub dscp: u8,
    pub ecn: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags: u8,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: IpProtocol,
    pub header_checksum: u16,
    pub source: [u8; 4],
    pub destination: [u8; 4],
    pub options: &'a [u8],
    pub payload: &'a [u8],
}

impl Ipv4Header<'_> {
    pub fn source_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.source)
    }

    pub fn destination_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.destination)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader<'a> {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence_number: u32,
    pub acknowledgement_number: u32,
    pub data_offset: u8,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
    pub options: &'a [u8],
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub source_port: u16,
    pub destination_port: u16,
    pub length: u16,
    pub checksum: u16,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Icmpv4Packet<'a> {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub rest_of_header: u32,
    pub payload: &'a [u8],
}

/// IP version nibble of a raw packet, if there is at least one byte.
pub fn ip_version(data: &[u8]) -> Option<u8> {
    data.first().map(|b| b >> 4)
}

/// Parse an IPv4 packet, extracting header fields and payload slice.
pub fn parse_ipv4_packet(data: &[u8]) -> Result<Ipv4Header<'_>, ParseError> {
    if data.len() < 20 {
        return Err(ParseError::Truncated("ipv4 base header"));
    }
    let version = data[0] >> 4;
    if version != 4 {
        return Err(ParseError::Invalid("ipv4 version"));
    }
    let ihl = data[0] & 0x0F;
    let header_length = (ihl as usize) * 4;
    if header_length < 20 {
        return Err(ParseError::Invalid("ipv4 ihl too small"));
    }
    if data.len() < header_length {
        return Err(ParseError::Truncated("ipv4 header with options"));
    }
    let dscp = data[1] >> 2;
    let ecn = data[1] & 0x03;
    let total_length = read_u16(&data[2..4]);
    if total_length < header_length as u16 {
        return Err(ParseError::Invalid("ipv4 total length smaller than header"));
    }
    let total_len_usize = total_length as usize;
    if data.len() < total_len_usize {
        return Err(ParseError::Truncated("ipv4 total length"));
    }

    let identification = read_u16(&data[4..6]);
    let flags_fragment = read_u16(&data[6..8]);
    let flags = (flags_fragment >> 13) as u8;
    let fragment_offset = flags_fragment & 0x1FFF;
    // We currently do not support IPv4 fragmentation/reassembly; drop fragments early.
    if fragment_offset != 0 || (flags_fragment & 0x2000) != 0 {
        return Err(ParseError::Invalid("ipv4 fragments unsupported"));
    }
    let ttl = data[8];
    let protocol = IpProtocol::from_raw(data[9]);
    let header_checksum = read_u16(&data[10..12]);
    let source = copy_array(&data[12..16]);
    let destination = copy_array(&data[16..20]);
    let options = &data[20..header_length];
    let payload = &data[header_length..total_len_usize];

    Ok(Ipv4Header {
        header_length,
        dscp,
        ecn,
        total_length,
        identification,
        flags,
        fragment_offset,
        ttl,
        protocol,
        header_checksum,
        source,
        destination,
        options,
        payload,
    })
}

/// Parse a TCP segment.
pub fn parse_tcp_segment(data: &[u8]) -> Result<TcpHeader<'_>, ParseError> {
    if data.len() < 20 {
        return Err(ParseError::Truncated("tcp base header"));
    }
    let source_port = read_u16(&data[0..2]);
    let destination_port = read_u16(&data[2..4]);
    let sequence_number = read_u32(&data[4..8]);
    let acknowledgement_number = read_u32(&data[8..12]);
    let data_offset = data[12] >> 4;
    let header_length = (data_offset as usize) * 4;
    if header_length < 20 {
        return Err(ParseError::Invalid("tcp data offset too small"));
    }
    if data.len() < header_length {
        return Err(ParseError::Truncated("tcp header with options"));
    }
    let flags = TcpFlags::from_bits_truncate(((data[12] as u16 & 0x01) << 8) | data[13] as u16);
    let window_size = read_u16(&data[14..16]);
    let checksum = read_u16(&data[16..18]);
    let urgent_pointer = read_u16(&data[18..20]);
    let options = &data[20..header_length];
    let payload = &data[header_length..];

    Ok(TcpHeader {
        source_port,
        destination_port,
        sequence_number,
        acknowledgement_number,
        data_offset,
        flags,
        window_size,
        checksum,
        urgent_pointer,
        options,
        payload,
    })
}

/// Parse a UDP datagram.
pub fn parse_udp_datagram(data: &[u8]) -> Result<UdpDatagram<'_>, ParseError> {
    if data.len() < 8 {
        return Err(ParseError::Truncated("udp header"));
    }
    let source_port = read_u16(&data[0..2]);
    let destination_port = read_u16(&data[2..4]);
    let length = read_u16(&data[4..6]);
    if length < 8 {
        return Err(ParseError::Invalid("udp length too small"));
    }
    let expected_len = length as usize;
    if data.len() < expected_len {
        return Err(ParseError::Truncated("udp payload"));
    }
    let checksum = read_u16(&data[6..8]);
    let payload = &data[8..expected_len];
    Ok(UdpDatagram {
        source_port,
        destination_port,
        length,
        checksum,
        payload,
    })
}

/// Parse an ICMPv4 packet.
pub fn parse_icmpv4_packet(data: &[u8]) -> Result<Icmpv4Packet<'_>, ParseError> {
    if data.len() < 8 {
        return Err(ParseError::Truncated("icmpv4 header"));
    }
    let icmp_type = data[0];
    let code = data[1];
    let checksum = read_u16(&data[2..4]);
    let rest_of_header = read_u32(&data[4..8]);
    let payload = &data[8..];

    Ok(Icmpv4Packet {
        icmp_type,
        code,
        checksum,
        rest_of_header,
        payload,
    })
}

pub(crate) fn read_u16(bytes: &[u8]) -> u16 {
    let mut array = [0u8; 2];
    array.copy_from_slice(bytes);
    u16::from_be_bytes(array)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut array = [0u8; 4];
    array.copy_from_slice(bytes);
    u32::from_be_bytes(array)
}

fn copy_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_ipv4_tcp_packet() -> Vec<u8> {
        let mut buf = Vec::new();
        // IPv4 header
        buf.extend_from_slice(&[
            0x45, 0x00, 0x00, 0x28, // version/ihl, dscp/ecn, total length (40 bytes)
            0x12, 0x34, 0x40, 0x00, // identification, flags DF/fragment offset
            0x40, 0x06, 0x00, 0x00, // ttl, protocol TCP, checksum placeholder
            10, 1, 2, 7, // src
            10, 1, 1, 9, // dst
        ]);
        // TCP header (20 bytes)
        buf.extend_from_slice(&[
            0xc3, 0x50, 0x00, 0x50, // src port 50000, dst port 80
            0x00, 0x00, 0x00, 0x01, // seq
            0x00, 0x00, 0x00, 0x00, // ack
            0x50, 0x02, 0x72, 0x10, // data offset 5, flags SYN, window
            0x00, 0x00, 0x00, 0x00, // checksum, urgent
        ]);
        buf
    }

    #[test]
    fn parse_ipv4_tcp() {
        let packet = build_ipv4_tcp_packet();
        let ipv4 = parse_ipv4_packet(&packet).expect("parse ipv4");
        assert_eq!(ipv4.protocol, IpProtocol::Tcp);
        assert_eq!(ipv4.header_length, 20);
        assert_eq!(ipv4.source_addr(), Ipv4Addr::new(10, 1, 2, 7));
        assert_eq!(ipv4.destination_addr(), Ipv4Addr::new(10, 1, 1, 9));
        assert_eq!(ipv4.payload.len(), 20);
        let tcp = parse_tcp_segment(ipv4.payload).expect("parse tcp");
        assert_eq!(tcp.source_port, 50000);
        assert_eq!(tcp.destination_port, 80);
        assert_eq!(tcp.flags, TcpFlags::SYN);
        assert!(tcp.flags.is_bare_syn());
        assert!(tcp.payload.is_empty());
    }

    #[test]
    fn reject_ipv4_fragments() {
        let mut packet = build_ipv4_tcp_packet();
        // MF flag
        packet[6] = 0x20;
        packet[7] = 0x00;
        let err = parse_ipv4_packet(&packet).unwrap_err();
        assert!(matches!(err, ParseError::Invalid(_)));
    }

    #[test]
    fn tcp_flag_classification() {
        let xmas = TcpFlags::FIN | TcpFlags::PSH | TcpFlags::URG;
        assert!(xmas.is_xmas());
        assert!(!(TcpFlags::FIN | TcpFlags::PSH).is_xmas());
        assert!(!(TcpFlags::SYN | TcpFlags::ACK).is_bare_syn());
        assert!((TcpFlags::SYN | TcpFlags::ECE).is_bare_syn());
        assert!(!(TcpFlags::SYN | TcpFlags::RST).is_bare_syn());
    }

    #[test]
    fn ns_bit_is_read_from_offset_byte() {
        let mut packet = build_ipv4_tcp_packet();
        packet[20 + 12] = 0x51;
        let tcp = parse_tcp_segment(&packet[20..]).expect("parse tcp");
        assert!(tcp.flags.contains(TcpFlags::NS | TcpFlags::SYN));
    }

    #[test]
    fn udp_and_icmp_inside_ipv4() {
        let mut packet = vec![
            0x45, 0x00, 0x00, 0x24, // total length 36
            0x00, 0x01, 0x00, 0x00, //
            0x40, 0x11, 0x00, 0x00, // protocol UDP
            10, 1, 1, 5, //
            10, 1, 2, 5, //
        ];
        packet.extend_from_slice(&[
            0x00, 0x35, 0x13, 0x89, // src 53, dst 5001
            0x00, 0x10, 0x00, 0x00, // length 16, checksum
        ]);
        packet.extend_from_slice(&[8, 0, 0, 0, 0, 1, 0, 2]);
        let ipv4 = parse_ipv4_packet(&packet).expect("parse ipv4");
        assert_eq!(ipv4.protocol, IpProtocol::Udp);
        let udp = parse_udp_datagram(ipv4.payload).expect("parse udp");
        assert_eq!(udp.source_port, 53);
        let icmp = parse_icmpv4_packet(udp.payload).expect("parse icmp");
        assert_eq!(icmp.icmp_type, 8);
        assert_eq!(icmp.rest_of_header, 0x0001_0002);
    }

    #[test]
    fn detects_truncated_headers() {
        let ipv4 = [0x45u8; 10];
        assert!(matches!(
            parse_ipv4_packet(&ipv4),
            Err(ParseError::Truncated(_))
        ));

        let tcp = [0u8; 12];
        assert!(matches!(
            parse_tcp_segment(&tcp),
            Err(ParseError::Truncated(_))
        ));

        let udp = [0u8; 6];
        assert!(matches!(
            parse_udp_datagram(&udp),
            Err(ParseError::Truncated(_))
        ));
    }

    #[test]
    fn rejects_invalid_ipv4_headers() {
        let mut ipv4 = [0u8; 20];
        ipv4[0] = 0x41; // version 4, ihl=1 (invalid < 5)
        assert!(matches!(
            parse_ipv4_packet(&ipv4),
            Err(ParseError::Invalid(_))
        ));

        let mut ipv4_len = [0u8; 20];
        ipv4_len[0] = 0x45;
        // total length smaller than header
        ipv4_len[2] = 0x00;
        ipv4_len[3] = 0x10;
        assert!(matches!(
            parse_ipv4_packet(&ipv4_len),
            Err(ParseError::Invalid(_))
        ));

        let mut ipv6 = [0u8; 40];
        ipv6[0] = 0x60;
        assert!(matches!(
            parse_ipv4_packet(&ipv6),
            Err(ParseError::Invalid(_))
        ));
        assert_eq!(ip_version(&ipv6), Some(6));
        assert_eq!(ip_version(&[]), None);
    }

    #[test]
    fn rejects_udp_length_too_small() {
        let udp = [0x00, 0x50, 0x00, 0x50, 0x00, 0x07, 0x00, 0x00]; // len=7 (<8)
        assert!(matches!(
            parse_udp_datagram(&udp),
            Err(ParseError::Invalid(_))
        ));
    }

    #[test]
    fn short_icmp_header_fails() {
        let icmpv4 = [0u8; 6];
        assert!(matches!(
            parse_icmpv4_packet(&icmpv4),
            Err(ParseError::Truncated(_))
        ));
    }
}

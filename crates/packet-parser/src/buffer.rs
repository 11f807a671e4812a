use crate::checksum::{ipv4_header_checksum, tcp_checksum};
use crate::{
    IpProtocol, Ipv4Header, ParseError, TcpFlags, TcpHeader, ip_version, parse_ipv4_packet,
    parse_tcp_segment, parse_udp_datagram, read_u16,
};
use std::net::Ipv4Addr;

const IPV4_SRC: usize = 12;
const IPV4_DST: usize = 16;
const IPV4_CSUM: usize = 10;
const TCP_SRC_PORT: usize = 0;
const TCP_DST_PORT: usize = 2;
const TCP_CSUM: usize = 16;

/// An owned, contiguous packet starting at the IPv4 header.
///
/// Parsing views borrow from the buffer; mutators write network byte order in
/// place. Mutating an address or port leaves checksums stale until
/// [`PacketBuf::recompute_checksums`] runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketBuf {
    data: Vec<u8>,
}

impl PacketBuf {
    pub fn new(data: Vec<u8>) -> Self {
        PacketBuf { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn version(&self) -> Option<u8> {
        ip_version(&self.data)
    }

    pub fn ipv4(&self) -> Result<Ipv4Header<'_>, ParseError> {
        parse_ipv4_packet(&self.data)
    }

    /// TCP header view, or `None` when the packet does not carry TCP.
    pub fn tcp(&self) -> Result<Option<TcpHeader<'_>>, ParseError> {
        let ip = self.ipv4()?;
        if ip.protocol != IpProtocol::Tcp {
            return Ok(None);
        }
        parse_tcp_segment(ip.payload).map(Some)
    }

    pub fn tcp_flags(&self) -> Result<Option<TcpFlags>, ParseError> {
        Ok(self.tcp()?.map(|tcp| tcp.flags))
    }

    /// Source and destination ports for TCP and UDP.
    pub fn ports(&self) -> Result<Option<(u16, u16)>, ParseError> {
        let ip = self.ipv4()?;
        match ip.protocol {
            IpProtocol::Tcp => {
                let tcp = parse_tcp_segment(ip.payload)?;
                Ok(Some((tcp.source_port, tcp.destination_port)))
            }
            IpProtocol::Udp => {
                let udp = parse_udp_datagram(ip.payload)?;
                Ok(Some((udp.source_port, udp.destination_port)))
            }
            _ => Ok(None),
        }
    }

    pub fn source(&self) -> Result<Ipv4Addr, ParseError> {
        Ok(self.ipv4()?.source_addr())
    }

    pub fn destination(&self) -> Result<Ipv4Addr, ParseError> {
        Ok(self.ipv4()?.destination_addr())
    }

    pub fn set_source(&mut self, addr: Ipv4Addr) -> Result<(), ParseError> {
        self.ipv4()?;
        self.data[IPV4_SRC..IPV4_SRC + 4].copy_from_slice(&addr.octets());
        Ok(())
    }

    pub fn set_destination(&mut self, addr: Ipv4Addr) -> Result<(), ParseError> {
        self.ipv4()?;
        self.data[IPV4_DST..IPV4_DST + 4].copy_from_slice(&addr.octets());
        Ok(())
    }

    pub fn set_tcp_source_port(&mut self, port: u16) -> Result<(), ParseError> {
        let offset = self.tcp_offset()?;
        self.write_u16(offset + TCP_SRC_PORT, port);
        Ok(())
    }

    pub fn set_tcp_destination_port(&mut self, port: u16) -> Result<(), ParseError> {
        let offset = self.tcp_offset()?;
        self.write_u16(offset + TCP_DST_PORT, port);
        Ok(())
    }

    /// Recompute the IPv4 header checksum and, for TCP, the segment checksum
    /// over the pseudo-header.
    pub fn recompute_checksums(&mut self) -> Result<(), ParseError> {
        let (header_length, total_length, protocol, src, dst) = {
            let ip = self.ipv4()?;
            (
                ip.header_length,
                ip.total_length as usize,
                ip.protocol,
                ip.source_addr(),
                ip.destination_addr(),
            )
        };
        if protocol == IpProtocol::Tcp {
            parse_tcp_segment(&self.data[header_length..total_length])?;
            let csum = tcp_checksum(src, dst, &self.data[header_length..total_length]);
            self.write_u16(header_length + TCP_CSUM, csum);
        }
        let csum = ipv4_header_checksum(&self.data[..header_length]);
        self.write_u16(IPV4_CSUM, csum);
        Ok(())
    }

    /// True when the stored IPv4 (and TCP, if present) checksums match the
    /// packet contents.
    pub fn checksums_valid(&self) -> bool {
        let Ok(ip) = self.ipv4() else {
            return false;
        };
        if ipv4_header_checksum(&self.data[..ip.header_length]) != ip.header_checksum {
            return false;
        }
        if ip.protocol != IpProtocol::Tcp {
            return true;
        }
        let segment = ip.payload;
        if segment.len() < 20 {
            return false;
        }
        let stored = read_u16(&segment[TCP_CSUM..TCP_CSUM + 2]);
        tcp_checksum(ip.source_addr(), ip.destination_addr(), segment) == stored
    }

    fn tcp_offset(&self) -> Result<usize, ParseError> {
        let ip = self.ipv4()?;
        if ip.protocol != IpProtocol::Tcp {
            return Err(ParseError::Unsupported("not a tcp segment"));
        }
        parse_tcp_segment(ip.payload)?;
        Ok(ip.header_length)
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }
}

impl From<Vec<u8>> for PacketBuf {
    fn from(data: Vec<u8>) -> Self {
        PacketBuf::new(data)
    }
}

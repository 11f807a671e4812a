//! RFC 1071 ones-complement checksums for IPv4 headers and TCP segments.

use std::net::Ipv4Addr;

const IPV4_CHECKSUM_OFFSET: usize = 10;
const TCP_CHECKSUM_OFFSET: usize = 16;
const PROTO_TCP: u32 = 6;

fn sum_words(data: &[u8], skip: Option<usize>, mut sum: u32) -> u32 {
    for (idx, chunk) in data.chunks(2).enumerate() {
        if skip == Some(idx * 2) {
            continue;
        }
        let word = match chunk {
            [hi, lo] => ((*hi as u32) << 8) | *lo as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        };
        sum = sum.wrapping_add(word);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum over an arbitrary byte run, odd trailing byte padded with zero.
pub fn internet_checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, None, 0))
}

/// IPv4 header checksum. The stored checksum field is ignored, so the result
/// can be compared directly against it.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    fold(sum_words(header, Some(IPV4_CHECKSUM_OFFSET), 0))
}

/// TCP checksum over the pseudo-header and the whole segment, ignoring the
/// stored checksum field.
pub fn tcp_checksum(source: Ipv4Addr, destination: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut sum = sum_words(&source.octets(), None, 0);
    sum = sum_words(&destination.octets(), None, sum);
    sum = sum.wrapping_add(PROTO_TCP);
    sum = sum.wrapping_add(segment.len() as u32);
    fold(sum_words(segment, Some(TCP_CHECKSUM_OFFSET), sum))
}

//! IPv4 protocol layer.
//!
//! Option-less 20-byte headers only (RFC 791), RFC 1071 checksums, and the
//! inbound protocol fan-out to ICMP, UDP, and TCP. Fragmented packets are
//! dropped and counted: reassembly is not supported.

use core::sync::atomic::Ordering;

use crate::buffer::{PacketBuffer, L3_OFFSET, L4_OFFSET};
use crate::stack::NetStack;
use crate::{arp, icmp, tcp, udp};

/// IPv4 address type (re-export for convenience)
pub use core::net::Ipv4Addr;

/// IPv4 protocol numbers (IANA assigned)
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// IPv4 header flags, as laid out in the combined flags/fragment word
pub mod flags {
    pub const DONT_FRAGMENT: u16 = 0x4000;
    pub const MORE_FRAGMENTS: u16 = 0x2000;
    pub const FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;
}

/// Default TTL (Time To Live) value
pub const DEFAULT_TTL: u8 = 64;

/// Header size: always 20 bytes, this core never emits or accepts options
pub const HEADER_SIZE: usize = 20;

/// IPv4 error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Error {
    /// Packet is too short to contain a valid header
    PacketTooShort,
    /// Invalid IP version (not 4)
    InvalidVersion(u8),
    /// Header length other than 20 bytes (options are unsupported)
    InvalidIhl(u8),
    /// Invalid total length field
    InvalidLength,
    /// Header checksum mismatch
    ChecksumMismatch,
}

/// Option-less IPv4 header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Total packet length (header + data) in bytes
    pub total_length: u16,
    /// Identification field
    pub identification: u16,
    /// Combined flags (upper 3 bits) and fragment offset (lower 13 bits)
    pub flags_fragment: u16,
    /// Time To Live (hops)
    pub ttl: u8,
    /// Protocol number (ICMP=1, TCP=6, UDP=17)
    pub protocol: u8,
    /// Header checksum as received (recomputed on build)
    pub checksum: u16,
    /// Source IP address
    pub src_ip: Ipv4Addr,
    /// Destination IP address
    pub dest_ip: Ipv4Addr,
}

impl Ipv4Header {
    /// Create a header with this core's defaults: TTL 64, no fragmentation.
    pub fn new(src_ip: Ipv4Addr, dest_ip: Ipv4Addr, protocol: u8, payload_len: u16) -> Self {
        Self {
            total_length: HEADER_SIZE as u16 + payload_len,
            identification: 0,
            flags_fragment: 0,
            ttl: DEFAULT_TTL,
            protocol,
            checksum: 0,
            src_ip,
            dest_ip,
        }
    }

    /// Parse and validate an IPv4 header from raw bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Ipv4Error> {
        if data.len() < HEADER_SIZE {
            return Err(Ipv4Error::PacketTooShort);
        }

        let version = data[0] >> 4;
        if version != 4 {
            return Err(Ipv4Error::InvalidVersion(version));
        }

        let ihl = data[0] & 0x0F;
        if ihl != 5 {
            return Err(Ipv4Error::InvalidIhl(ihl));
        }

        let total_length = u16::from_be_bytes([data[2], data[3]]);
        if (total_length as usize) < HEADER_SIZE || total_length as usize > data.len() {
            return Err(Ipv4Error::InvalidLength);
        }

        // A valid header sums to zero with its own checksum included
        if checksum(&data[..HEADER_SIZE]) != 0 {
            return Err(Ipv4Error::ChecksumMismatch);
        }

        Ok(Self {
            total_length,
            identification: u16::from_be_bytes([data[4], data[5]]),
            flags_fragment: u16::from_be_bytes([data[6], data[7]]),
            ttl: data[8],
            protocol: data[9],
            checksum: u16::from_be_bytes([data[10], data[11]]),
            src_ip: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dest_ip: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        })
    }

    /// Serialize the header, computing and inserting the checksum.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = (4 << 4) | 5;
        bytes[1] = 0;
        bytes[2..4].copy_from_slice(&self.total_length.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.identification.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.flags_fragment.to_be_bytes());
        bytes[8] = self.ttl;
        bytes[9] = self.protocol;
        bytes[12..16].copy_from_slice(&self.src_ip.octets());
        bytes[16..20].copy_from_slice(&self.dest_ip.octets());

        let csum = checksum(&bytes);
        bytes[10..12].copy_from_slice(&csum.to_be_bytes());
        bytes
    }

    /// Check for any fragmentation: MF flag or a non-zero offset.
    pub fn is_fragmented(&self) -> bool {
        (self.flags_fragment & flags::MORE_FRAGMENTS) != 0
            || (self.flags_fragment & flags::FRAGMENT_OFFSET_MASK) != 0
    }
}

fn sum_words(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += word as u32;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// RFC 1071 internet checksum over a byte slice.
pub fn checksum(data: &[u8]) -> u16 {
    !fold(sum_words(data))
}

/// Transport checksum over the IPv4 pseudo-header plus the segment.
///
/// Verifying a received segment: the result is zero when the stored
/// checksum is valid. Generating: compute with the checksum field zeroed
/// and store the result as-is in big-endian field order.
pub fn pseudo_header_checksum(
    src_ip: Ipv4Addr,
    dest_ip: Ipv4Addr,
    protocol: u8,
    segment: &[u8],
) -> u16 {
    let mut sum = sum_words(segment);
    sum += sum_words(&src_ip.octets());
    sum += sum_words(&dest_ip.octets());
    sum += protocol as u32;
    sum += segment.len() as u32;
    !fold(sum)
}

/// Handle an IP-tagged buffer from the Ethernet demultiplexer.
pub fn handle_packet(stack: &NetStack, mut buf: PacketBuffer) {
    let header = match Ipv4Header::from_bytes(&buf.frame()[L3_OFFSET..]) {
        Ok(header) => header,
        Err(Ipv4Error::ChecksumMismatch) => {
            stack.counters.dropped_bad_checksum.fetch_add(1, Ordering::Relaxed);
            stack.pool.release(buf);
            return;
        }
        Err(err) => {
            log::debug!("ipv4: dropping malformed packet: {:?}", err);
            stack.counters.dropped_malformed.fetch_add(1, Ordering::Relaxed);
            stack.pool.release(buf);
            return;
        }
    };

    if header.is_fragmented() {
        stack.counters.dropped_fragment.fetch_add(1, Ordering::Relaxed);
        stack.pool.release(buf);
        return;
    }

    let config = stack.config();
    let for_us = header.dest_ip == config.ip_addr
        || header.dest_ip == Ipv4Addr::BROADCAST
        || config.is_subnet_broadcast(header.dest_ip)
        || !config.is_valid();
    if !for_us {
        stack.counters.dropped_not_ours.fetch_add(1, Ordering::Relaxed);
        stack.pool.release(buf);
        return;
    }

    // Trim any Ethernet padding off the tail
    buf.set_len((L3_OFFSET + header.total_length as usize).min(buf.len()));
    buf.set_l4(L4_OFFSET);
    // The transport view spans the whole segment until the protocol
    // narrows it past its own header.
    buf.set_l7(buf.len());

    match header.protocol {
        protocol::ICMP => icmp::handle_packet(stack, buf, header),
        protocol::UDP => udp::handle_datagram(stack, buf, header),
        protocol::TCP => tcp::handle_segment(stack, buf, header),
        other => {
            log::trace!("ipv4: unsupported protocol {} from {}", other, header.src_ip);
            stack.counters.dropped_unknown_protocol.fetch_add(1, Ordering::Relaxed);
            stack.pool.release(buf);
        }
    }
}

/// Fill in the IP header for an outbound buffer and hand it to the ARP
/// resolver. `l4_len` is the transport header plus payload length.
pub fn send_packet(stack: &NetStack, mut buf: PacketBuffer, dest_ip: Ipv4Addr, protocol: u8, l4_len: usize) {
    let config = stack.config();
    let mut header = Ipv4Header::new(config.ip_addr, dest_ip, protocol, l4_len as u16);
    header.identification = stack.next_ident();

    let bytes = header.to_bytes();
    buf.data_mut()[L3_OFFSET..L3_OFFSET + HEADER_SIZE].copy_from_slice(&bytes);
    buf.set_len(L3_OFFSET + HEADER_SIZE + l4_len);
    buf.set_l4(L4_OFFSET);

    arp::resolve_and_send(stack, buf, dest_ip);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = Ipv4Header::new(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            protocol::UDP,
            100,
        );
        let bytes = header.to_bytes();

        let parsed_input = {
            // from_bytes checks total_length against the slice, so extend
            // to the advertised size
            let mut v = bytes.to_vec();
            v.resize(120, 0);
            v
        };
        let parsed = Ipv4Header::from_bytes(&parsed_input).unwrap();
        assert_eq!(parsed.total_length, 120);
        assert_eq!(parsed.protocol, protocol::UDP);
        assert_eq!(parsed.ttl, DEFAULT_TTL);
        assert_eq!(parsed.src_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(parsed.dest_ip, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let header = Ipv4Header::new(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            protocol::ICMP,
            0,
        );
        let mut bytes = header.to_bytes();
        bytes[10] ^= 0xFF;
        assert_eq!(
            Ipv4Header::from_bytes(&bytes),
            Err(Ipv4Error::ChecksumMismatch)
        );
    }

    #[test]
    fn fragment_bits_detected() {
        let mut header = Ipv4Header::new(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            protocol::UDP,
            0,
        );
        assert!(!header.is_fragmented());

        header.flags_fragment = flags::MORE_FRAGMENTS;
        assert!(header.is_fragmented());

        header.flags_fragment = 0x0003; // offset only
        assert!(header.is_fragmented());

        header.flags_fragment = flags::DONT_FRAGMENT;
        assert!(!header.is_fragmented());
    }

    #[test]
    fn pseudo_header_checksum_verifies_to_zero() {
        let src = Ipv4Addr::new(192, 168, 1, 1);
        let dst = Ipv4Addr::new(192, 168, 1, 2);
        let mut segment = [0u8; 12];
        segment[0] = 0x12;
        segment[11] = 0x34;

        let csum = pseudo_header_checksum(src, dst, protocol::UDP, &segment);
        segment[6..8].copy_from_slice(&csum.to_be_bytes());
        assert_eq!(pseudo_header_checksum(src, dst, protocol::UDP, &segment), 0);
    }

    #[test]
    fn options_rejected() {
        let mut bytes = [0u8; 24];
        bytes[0] = (4 << 4) | 6; // IHL 6
        bytes[2..4].copy_from_slice(&24u16.to_be_bytes());
        assert_eq!(Ipv4Header::from_bytes(&bytes), Err(Ipv4Error::InvalidIhl(6)));
    }
}

//! ICMP (Internet Control Message Protocol) - RFC 792
//!
//! Only the echo pair is implemented. Inbound echo requests are answered
//! in place: the received buffer is rewritten as the reply and sent back,
//! so the data path never allocates.

use core::net::Ipv4Addr;
use core::sync::atomic::Ordering;

use crate::buffer::PacketBuffer;
use crate::ethernet::EthHeader;
use crate::ipv4::{self, protocol, Ipv4Header};
use crate::stack::NetStack;

/// ICMP message types
pub const ECHO_REPLY: u8 = 0;
pub const ECHO_REQUEST: u8 = 8;

/// Echo header size: type, code, checksum, identifier, sequence
pub const HEADER_SIZE: usize = 8;

/// An 8-byte ICMP echo header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence: u16,
}

impl IcmpHeader {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            icmp_type: data[0],
            code: data[1],
            checksum: u16::from_be_bytes([data[2], data[3]]),
            identifier: u16::from_be_bytes([data[4], data[5]]),
            sequence: u16::from_be_bytes([data[6], data[7]]),
        })
    }
}

/// Handle an inbound ICMP message.
///
/// The message spans `buf[l4..len]`. The sender's MAC is learned
/// opportunistically so the reply never waits on ARP.
pub fn handle_packet(stack: &NetStack, mut buf: PacketBuffer, ip_header: Ipv4Header) {
    let l4 = buf.l4();
    let header = match IcmpHeader::from_bytes(buf.transport()) {
        Some(header) => header,
        None => {
            stack.counters.dropped_malformed.fetch_add(1, Ordering::Relaxed);
            stack.pool.release(buf);
            return;
        }
    };

    if ipv4::checksum(&buf.frame()[l4..]) != 0 {
        stack.counters.dropped_bad_checksum.fetch_add(1, Ordering::Relaxed);
        stack.pool.release(buf);
        return;
    }

    buf.set_l7(l4 + HEADER_SIZE);

    if let Ok(eth) = EthHeader::from_bytes(buf.eth_header()) {
        crate::arp::learn(stack, eth.src_mac, ip_header.src_ip);
    }

    match header.icmp_type {
        ECHO_REQUEST => {
            log::trace!(
                "icmp: echo request from {} (id {}, seq {})",
                ip_header.src_ip,
                header.identifier,
                header.sequence
            );
            send_echo_reply(stack, buf, ip_header.src_ip);
        }
        ECHO_REPLY => {
            log::trace!(
                "icmp: echo reply from {} (id {}, seq {})",
                ip_header.src_ip,
                header.identifier,
                header.sequence
            );
            stack.pool.release(buf);
        }
        other => {
            log::debug!("icmp: ignoring type {} from {}", other, ip_header.src_ip);
            stack.pool.release(buf);
        }
    }
}

/// Rewrite an echo request in place as the matching reply and transmit it.
/// Identifier, sequence, and payload are preserved untouched.
fn send_echo_reply(stack: &NetStack, mut buf: PacketBuffer, dest_ip: Ipv4Addr) {
    let l4 = buf.l4();
    let message_len = buf.len() - l4;

    {
        let header = buf.transport_mut();
        header[0] = ECHO_REPLY;
        header[2] = 0;
        header[3] = 0;
    }
    // The checksum covers the header and the echoed payload.
    let checksum = ipv4::checksum(&buf.frame()[l4..]);
    buf.transport_mut()[2..4].copy_from_slice(&checksum.to_be_bytes());

    ipv4::send_packet(stack, buf, dest_ip, protocol::ICMP, message_len);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_echo_request() {
        let bytes = [8, 0, 0xf7, 0xfb, 0x00, 0x01, 0x00, 0x03];
        let header = IcmpHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.icmp_type, ECHO_REQUEST);
        assert_eq!(header.code, 0);
        assert_eq!(header.identifier, 1);
        assert_eq!(header.sequence, 3);
    }

    #[test]
    fn short_message_rejected() {
        assert!(IcmpHeader::from_bytes(&[8, 0, 0]).is_none());
    }
}

//! UDP (User Datagram Protocol) - RFC 768
//!
//! Header format: [Src Port (2)][Dest Port (2)][Length (2)][Checksum (2)]
//!
//! Delivery goes through a table of port bindings. Binding a port that is
//! already bound replaces the old handler, but dispatch still invokes every
//! binding that matches the destination port.

use alloc::vec::Vec;
use core::net::Ipv4Addr;
use core::sync::atomic::Ordering;
use spin::Mutex;

use crate::buffer::{PacketBuffer, L4_OFFSET};
use crate::ipv4::{self, protocol, Ipv4Header};
use crate::stack::NetStack;

/// UDP header size
pub const HEADER_SIZE: usize = 8;

/// An 8-byte UDP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dest_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        let header = Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dest_port: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            checksum: u16::from_be_bytes([data[6], data[7]]),
        };
        if (header.length as usize) < HEADER_SIZE {
            return None;
        }
        Some(header)
    }
}

/// Callback invoked for each datagram delivered to a bound port.
pub type UdpHandler = fn(stack: &NetStack, src_ip: Ipv4Addr, src_port: u16, payload: &[u8]);

struct UdpBinding {
    port: u16,
    handler: UdpHandler,
}

/// Port-to-handler table.
pub struct UdpTable {
    bindings: Mutex<Vec<UdpBinding>>,
}

impl UdpTable {
    pub(crate) fn new() -> Self {
        Self {
            bindings: Mutex::new(Vec::new()),
        }
    }

    /// Bind `handler` to `port`, replacing any existing binding.
    pub fn bind(&self, port: u16, handler: UdpHandler) {
        let mut bindings = self.bindings.lock();
        bindings.retain(|b| b.port != port);
        bindings.push(UdpBinding { port, handler });
    }

    /// Remove the binding for `port`, if any.
    pub fn unbind(&self, port: u16) {
        self.bindings.lock().retain(|b| b.port != port);
    }
}

/// Handle an inbound UDP datagram.
///
/// A zero checksum means the sender computed none (RFC 768) and the
/// datagram is delivered unverified; a non-zero checksum must verify.
/// Handlers run after the binding table guard drops.
pub fn handle_datagram(stack: &NetStack, mut buf: PacketBuffer, ip_header: Ipv4Header) {
    let l4 = buf.l4();
    let header = match UdpHeader::from_bytes(buf.transport()) {
        Some(header) => header,
        None => {
            stack.counters.dropped_malformed.fetch_add(1, Ordering::Relaxed);
            stack.pool.release(buf);
            return;
        }
    };

    let datagram_len = header.length as usize;
    if l4 + datagram_len > buf.len() {
        stack.counters.dropped_malformed.fetch_add(1, Ordering::Relaxed);
        stack.pool.release(buf);
        return;
    }
    buf.set_len(l4 + datagram_len);
    buf.set_l7(l4 + HEADER_SIZE);

    if header.checksum != 0 {
        let computed = ipv4::pseudo_header_checksum(
            ip_header.src_ip,
            ip_header.dest_ip,
            protocol::UDP,
            &buf.frame()[l4..],
        );
        if computed != 0 {
            stack.counters.dropped_bad_checksum.fetch_add(1, Ordering::Relaxed);
            stack.pool.release(buf);
            return;
        }
    }

    let handlers: Vec<UdpHandler> = {
        let bindings = stack.udp.bindings.lock();
        bindings
            .iter()
            .filter(|b| b.port == header.dest_port)
            .map(|b| b.handler)
            .collect()
    };

    if handlers.is_empty() {
        log::debug!(
            "udp: no binding for port {} (from {}:{})",
            header.dest_port,
            ip_header.src_ip,
            header.src_port
        );
        stack.counters.dropped_no_port.fetch_add(1, Ordering::Relaxed);
        stack.pool.release(buf);
        return;
    }

    for handler in handlers {
        handler(stack, ip_header.src_ip, header.src_port, buf.payload());
    }
    stack.pool.release(buf);
}

/// Build and send a UDP datagram. Returns `false` if no buffer was
/// available or the payload does not fit.
pub fn send_datagram(
    stack: &NetStack,
    src_port: u16,
    dest_ip: Ipv4Addr,
    dest_port: u16,
    payload: &[u8],
) -> bool {
    let datagram_len = HEADER_SIZE + payload.len();
    if L4_OFFSET + datagram_len > crate::buffer::BUFFER_SIZE {
        return false;
    }

    let Some(mut buf) = stack.pool.allocate() else {
        stack.counters.dropped_no_buffer.fetch_add(1, Ordering::Relaxed);
        return false;
    };

    buf.set_l4(L4_OFFSET);
    buf.set_l7(L4_OFFSET + HEADER_SIZE);
    buf.set_len(L4_OFFSET + datagram_len);

    let src_ip = stack.config().ip_addr;
    {
        let data = buf.data_mut();
        data[L4_OFFSET..L4_OFFSET + 2].copy_from_slice(&src_port.to_be_bytes());
        data[L4_OFFSET + 2..L4_OFFSET + 4].copy_from_slice(&dest_port.to_be_bytes());
        data[L4_OFFSET + 4..L4_OFFSET + 6].copy_from_slice(&(datagram_len as u16).to_be_bytes());
        data[L4_OFFSET + 6..L4_OFFSET + 8].copy_from_slice(&[0, 0]);
        data[L4_OFFSET + 8..L4_OFFSET + datagram_len].copy_from_slice(payload);
    }

    let mut checksum = ipv4::pseudo_header_checksum(
        src_ip,
        dest_ip,
        protocol::UDP,
        &buf.frame()[L4_OFFSET..],
    );
    // A computed zero is transmitted as all-ones; zero on the wire means
    // "no checksum".
    if checksum == 0 {
        checksum = 0xFFFF;
    }
    buf.data_mut()[L4_OFFSET + 6..L4_OFFSET + 8].copy_from_slice(&checksum.to_be_bytes());

    ipv4::send_packet(stack, buf, dest_ip, protocol::UDP, datagram_len);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_parse() {
        let bytes = [0xC0, 0x01, 0x00, 0x35, 0x00, 0x1D, 0xAB, 0xCD];
        let header = UdpHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.src_port, 0xC001);
        assert_eq!(header.dest_port, 53);
        assert_eq!(header.length, 29);
        assert_eq!(header.checksum, 0xABCD);
    }

    #[test]
    fn undersized_length_field_rejected() {
        let bytes = [0xC0, 0x01, 0x00, 0x35, 0x00, 0x07, 0xAB, 0xCD];
        assert!(UdpHeader::from_bytes(&bytes).is_none());
    }
}

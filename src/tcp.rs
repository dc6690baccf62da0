//! TCP (Transmission Control Protocol) - client side
//!
//! Header format: [Src Port (2)][Dest Port (2)][Seq Num (4)][Ack Num (4)]
//!                [Data Offset/Flags (2)][Window (2)][Checksum (2)][Urgent (2)]
//!
//! Only active opens are supported. A connection walks Closed ->
//! ConnectWait -> Connected -> FinWait -> removed; there is no listen
//! state and no retransmission. Delivery is exactly in-order: a segment
//! whose sequence number is not the expected one is acknowledged with
//! the current expectation and its payload discarded. Inbound SYNs that
//! match no connection get exactly one RST.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::Ipv4Addr;
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use spin::Mutex;

use crate::buffer::{PacketBuffer, L4_OFFSET};
use crate::ipv4::{self, protocol, Ipv4Header};
use crate::stack::NetStack;
use crate::sync::SignalSlot;

/// TCP header size (no options are ever sent)
pub const TCP_HEADER_SIZE: usize = 20;

/// First ephemeral port handed out for active opens
pub const EPHEMERAL_PORT_BASE: u16 = 49152;

/// TCP flag bits
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

/// Advertised receive window
const WINDOW_SIZE: u16 = 8192;

/// Connection states for an active open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    /// SYN sent, waiting for SYN+ACK
    ConnectWait,
    Connected,
    /// FIN sent, waiting for the peer's FIN
    FinWait,
}

/// Identifies one connection: remote endpoint plus local port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHandle {
    pub remote_addr: Ipv4Addr,
    pub remote_port: u16,
    pub local_port: u16,
}

/// Callback invoked with each in-order payload slice.
pub type RecvCallback = fn(&[u8]);

/// A parsed 20-byte TCP header
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dest_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub data_offset: u8,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
}

impl TcpHeader {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < TCP_HEADER_SIZE {
            return None;
        }
        let data_offset = data[12] >> 4;
        if data_offset < 5 {
            return None;
        }
        Some(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dest_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            data_offset,
            flags: data[13] & 0x3F,
            window: u16::from_be_bytes([data[14], data[15]]),
            checksum: u16::from_be_bytes([data[16], data[17]]),
        })
    }
}

struct TcpConnection {
    handle: TcpHandle,
    state: TcpState,
    /// Next sequence number we will send
    snd_seq: u32,
    /// Next sequence number we expect from the peer
    rcv_seq: u32,
    recv_cb: RecvCallback,
    waiter: Option<Arc<SignalSlot>>,
}

/// Active connection table.
pub struct TcpTable {
    connections: Mutex<Vec<TcpConnection>>,
    next_port: AtomicU16,
    next_isn: AtomicU32,
}

impl TcpTable {
    pub(crate) fn new() -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            next_port: AtomicU16::new(EPHEMERAL_PORT_BASE),
            next_isn: AtomicU32::new(0x1000),
        }
    }

    fn allocate_port(&self) -> u16 {
        loop {
            let port = self.next_port.fetch_add(1, Ordering::Relaxed);
            if port >= EPHEMERAL_PORT_BASE {
                return port;
            }
            // Wrapped past 65535; reset into the ephemeral range.
            self.next_port.store(EPHEMERAL_PORT_BASE, Ordering::Relaxed);
        }
    }

    /// State of the connection identified by `handle`, if it exists.
    pub fn state(&self, handle: TcpHandle) -> Option<TcpState> {
        self.connections
            .lock()
            .iter()
            .find(|c| c.handle == handle)
            .map(|c| c.state)
    }
}

/// Build and transmit a segment for `handle` with the given flags,
/// sequence numbers, and payload.
fn send_segment(
    stack: &NetStack,
    handle: TcpHandle,
    seg_flags: u8,
    seq: u32,
    ack: u32,
    payload: &[u8],
) {
    let segment_len = TCP_HEADER_SIZE + payload.len();
    if L4_OFFSET + segment_len > crate::buffer::BUFFER_SIZE {
        return;
    }

    let Some(mut buf) = stack.pool.allocate() else {
        stack.counters.dropped_no_buffer.fetch_add(1, Ordering::Relaxed);
        return;
    };

    buf.set_l4(L4_OFFSET);
    buf.set_l7(L4_OFFSET + TCP_HEADER_SIZE);
    buf.set_len(L4_OFFSET + segment_len);

    let src_ip = stack.config().ip_addr;
    {
        let data = buf.data_mut();
        let h = &mut data[L4_OFFSET..L4_OFFSET + segment_len];
        h[0..2].copy_from_slice(&handle.local_port.to_be_bytes());
        h[2..4].copy_from_slice(&handle.remote_port.to_be_bytes());
        h[4..8].copy_from_slice(&seq.to_be_bytes());
        h[8..12].copy_from_slice(&ack.to_be_bytes());
        h[12] = 5 << 4;
        h[13] = seg_flags;
        h[14..16].copy_from_slice(&WINDOW_SIZE.to_be_bytes());
        h[16..18].copy_from_slice(&[0, 0]);
        h[18..20].copy_from_slice(&[0, 0]);
        h[TCP_HEADER_SIZE..].copy_from_slice(payload);
    }

    let checksum = ipv4::pseudo_header_checksum(
        src_ip,
        handle.remote_addr,
        protocol::TCP,
        &buf.frame()[L4_OFFSET..],
    );
    buf.data_mut()[L4_OFFSET + 16..L4_OFFSET + 18].copy_from_slice(&checksum.to_be_bytes());

    ipv4::send_packet(stack, buf, handle.remote_addr, protocol::TCP, segment_len);
}

/// Actively open a connection, blocking until the handshake completes.
///
/// Blocks indefinitely if the peer never answers; only a RST-free
/// SYN+ACK acknowledging our SYN completes it. Returns `None` when no
/// ephemeral resources are available.
pub fn connect(
    stack: &NetStack,
    remote_addr: Ipv4Addr,
    remote_port: u16,
    recv_cb: RecvCallback,
) -> Option<TcpHandle> {
    let handle = TcpHandle {
        remote_addr,
        remote_port,
        local_port: stack.tcp.allocate_port(),
    };
    let isn = stack.tcp.next_isn.fetch_add(0x10000, Ordering::Relaxed);
    let slot = Arc::new(SignalSlot::new());

    {
        let mut connections = stack.tcp.connections.lock();
        connections.push(TcpConnection {
            handle,
            state: TcpState::ConnectWait,
            snd_seq: isn.wrapping_add(1),
            rcv_seq: 0,
            recv_cb,
            waiter: Some(slot.clone()),
        });
    }

    log::debug!("tcp: connecting to {}:{}", remote_addr, remote_port);
    send_segment(stack, handle, flags::SYN, isn, 0, &[]);

    if slot.wait() {
        Some(handle)
    } else {
        stack
            .tcp
            .connections
            .lock()
            .retain(|c| c.handle != handle);
        None
    }
}

/// Send `payload` on an established connection. Returns `false` if the
/// connection is missing or not in the Connected state.
pub fn send(stack: &NetStack, handle: TcpHandle, payload: &[u8]) -> bool {
    let seq_ack = {
        let mut connections = stack.tcp.connections.lock();
        let Some(conn) = connections
            .iter_mut()
            .find(|c| c.handle == handle && c.state == TcpState::Connected)
        else {
            return false;
        };
        let pair = (conn.snd_seq, conn.rcv_seq);
        conn.snd_seq = conn.snd_seq.wrapping_add(payload.len() as u32);
        pair
    };

    send_segment(
        stack,
        handle,
        flags::ACK | flags::PSH,
        seq_ack.0,
        seq_ack.1,
        payload,
    );
    true
}

/// Start an orderly close: send FIN and move to FinWait. The connection
/// is removed once the peer's FIN arrives.
pub fn close(stack: &NetStack, handle: TcpHandle) -> bool {
    let seq_ack = {
        let mut connections = stack.tcp.connections.lock();
        let Some(conn) = connections
            .iter_mut()
            .find(|c| c.handle == handle && c.state == TcpState::Connected)
        else {
            return false;
        };
        let pair = (conn.snd_seq, conn.rcv_seq);
        conn.state = TcpState::FinWait;
        conn.snd_seq = conn.snd_seq.wrapping_add(1);
        pair
    };

    send_segment(stack, handle, flags::FIN | flags::ACK, seq_ack.0, seq_ack.1, &[]);
    true
}

/// What the state machine decided to do; executed after the table guard
/// drops.
enum Reply {
    None,
    Segment {
        handle: TcpHandle,
        seg_flags: u8,
        seq: u32,
        ack: u32,
    },
    Reset {
        handle: TcpHandle,
        ack: u32,
    },
}

/// Handle an inbound TCP segment.
pub fn handle_segment(stack: &NetStack, buf: PacketBuffer, ip_header: Ipv4Header) {
    let l4 = buf.l4();
    let header = match TcpHeader::from_bytes(buf.transport()) {
        Some(header) => header,
        None => {
            stack.counters.dropped_malformed.fetch_add(1, Ordering::Relaxed);
            stack.pool.release(buf);
            return;
        }
    };

    let computed = ipv4::pseudo_header_checksum(
        ip_header.src_ip,
        ip_header.dest_ip,
        protocol::TCP,
        &buf.frame()[l4..],
    );
    if computed != 0 {
        stack.counters.dropped_bad_checksum.fetch_add(1, Ordering::Relaxed);
        stack.pool.release(buf);
        return;
    }

    let data_start = l4 + (header.data_offset as usize) * 4;
    if data_start > buf.len() {
        stack.counters.dropped_malformed.fetch_add(1, Ordering::Relaxed);
        stack.pool.release(buf);
        return;
    }
    let payload_len = buf.len() - data_start;

    let key = TcpHandle {
        remote_addr: ip_header.src_ip,
        remote_port: header.src_port,
        local_port: header.dest_port,
    };

    let mut completed: Option<(Arc<SignalSlot>, bool)> = None;
    let mut deliver: Option<RecvCallback> = None;
    let reply = {
        let mut connections = stack.tcp.connections.lock();
        match connections.iter_mut().position(|c| c.handle == key) {
            Some(idx) => {
                let conn = &mut connections[idx];
                match conn.state {
                    TcpState::ConnectWait => {
                        let expected =
                            header.flags & (flags::SYN | flags::ACK | flags::RST)
                                == flags::SYN | flags::ACK;
                        if expected && header.ack == conn.snd_seq {
                            conn.state = TcpState::Connected;
                            conn.rcv_seq = header.seq.wrapping_add(1);
                            completed = conn.waiter.take().map(|w| (w, true));
                            Reply::Segment {
                                handle: key,
                                seg_flags: flags::ACK,
                                seq: conn.snd_seq,
                                ack: conn.rcv_seq,
                            }
                        } else {
                            // Anything else, RST included, leaves the
                            // opener blocked until it gives up.
                            Reply::None
                        }
                    }
                    TcpState::Connected => {
                        if header.flags & flags::RST != 0 {
                            connections.swap_remove(idx);
                            Reply::None
                        } else if header.flags & (flags::FIN | flags::ACK)
                            == flags::FIN | flags::ACK
                        {
                            let ack = header.seq.wrapping_add(payload_len as u32).wrapping_add(1);
                            let seq = conn.snd_seq;
                            conn.snd_seq = conn.snd_seq.wrapping_add(1);
                            connections.swap_remove(idx);
                            Reply::Segment {
                                handle: key,
                                seg_flags: flags::FIN | flags::ACK,
                                seq,
                                ack,
                            }
                        } else if payload_len > 0 {
                            if header.seq == conn.rcv_seq {
                                deliver = Some(conn.recv_cb);
                                conn.rcv_seq = conn.rcv_seq.wrapping_add(payload_len as u32);
                            }
                            // Out-of-order data re-acks the expectation.
                            Reply::Segment {
                                handle: key,
                                seg_flags: flags::ACK,
                                seq: conn.snd_seq,
                                ack: conn.rcv_seq,
                            }
                        } else {
                            Reply::None
                        }
                    }
                    TcpState::FinWait => {
                        if header.flags & flags::FIN != 0
                            || header.flags & flags::RST != 0
                        {
                            let ack = header.seq.wrapping_add(1);
                            let seq = conn.snd_seq;
                            connections.swap_remove(idx);
                            if header.flags & flags::RST != 0 {
                                Reply::None
                            } else {
                                Reply::Segment {
                                    handle: key,
                                    seg_flags: flags::ACK,
                                    seq,
                                    ack,
                                }
                            }
                        } else {
                            Reply::None
                        }
                    }
                    TcpState::Closed => Reply::None,
                }
            }
            None => {
                if header.flags & (flags::SYN | flags::RST) == flags::SYN {
                    Reply::Reset {
                        handle: key,
                        ack: header.seq.wrapping_add(1),
                    }
                } else {
                    Reply::None
                }
            }
        }
    };

    if let Some(cb) = deliver {
        cb(&buf.frame()[data_start..]);
    }
    stack.pool.release(buf);

    if let Some((waiter, ok)) = completed {
        waiter.complete(ok);
    }

    match reply {
        Reply::None => {}
        Reply::Segment {
            handle,
            seg_flags,
            seq,
            ack,
        } => send_segment(stack, handle, seg_flags, seq, ack, &[]),
        Reply::Reset { handle, ack } => {
            log::debug!(
                "tcp: resetting unexpected syn from {}:{}",
                handle.remote_addr,
                handle.remote_port
            );
            stack.counters.tcp_rst_sent.fetch_add(1, Ordering::Relaxed);
            send_segment(stack, handle, flags::RST | flags::ACK, 0, ack, &[]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_parse() {
        let mut bytes = [0u8; TCP_HEADER_SIZE];
        bytes[0..2].copy_from_slice(&49152u16.to_be_bytes());
        bytes[2..4].copy_from_slice(&80u16.to_be_bytes());
        bytes[4..8].copy_from_slice(&0x1000_0001u32.to_be_bytes());
        bytes[8..12].copy_from_slice(&0x2000_0002u32.to_be_bytes());
        bytes[12] = 5 << 4;
        bytes[13] = flags::SYN | flags::ACK;
        bytes[14..16].copy_from_slice(&8192u16.to_be_bytes());

        let header = TcpHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.src_port, 49152);
        assert_eq!(header.dest_port, 80);
        assert_eq!(header.seq, 0x1000_0001);
        assert_eq!(header.ack, 0x2000_0002);
        assert_eq!(header.flags, flags::SYN | flags::ACK);
        assert_eq!(header.window, 8192);
    }

    #[test]
    fn short_data_offset_rejected() {
        let mut bytes = [0u8; TCP_HEADER_SIZE];
        bytes[12] = 4 << 4;
        assert!(TcpHeader::from_bytes(&bytes).is_none());
    }
}

//! ARP (Address Resolution Protocol) - RFC 826
//!
//! Maps IPv4 addresses to MAC addresses on the local network.
//! Packet format: [HW Type (2)][Proto Type (2)][HW Len (1)][Proto Len (1)]
//!                [Operation (2)][Sender MAC (6)][Sender IP (4)]
//!                [Target MAC (6)][Target IP (4)]
//!
//! The cache is a bounded table of slots: Free (ip 0.0.0.0), Pending
//! (request issued, outbound packets queued on the slot), or Valid. A full
//! table evicts the lowest-TTL non-permanent unicast entry. The 1 Hz tick
//! ages every non-permanent entry; an expiring Pending entry drops its
//! queued packets and fails any waiting probe.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::Ipv4Addr;
use core::sync::atomic::Ordering;
use spin::Mutex;

use crate::buffer::{PacketBuffer, L3_OFFSET};
use crate::ethernet::{self, BROADCAST_MAC, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::stack::NetStack;
use crate::sync::{Semaphore, SignalSlot};

/// ARP hardware type for Ethernet
pub const HW_TYPE_ETHERNET: u16 = 1;

/// ARP protocol type for IPv4
pub const PROTO_TYPE_IPV4: u16 = 0x0800;

/// ARP operation codes
pub const ARP_REQUEST: u16 = 1;
pub const ARP_REPLY: u16 = 2;

/// ARP message size (fixed at 28 bytes, padded to the Ethernet minimum)
pub const ARP_PACKET_SIZE: usize = 28;

/// Number of cache slots
pub const ARP_CACHE_SIZE: usize = 16;

/// TTL for an unresolved (Pending) entry
pub const PENDING_TTL_SECS: u32 = 20;

/// TTL for a resolved entry (20 minutes)
pub const VALID_TTL_SECS: u32 = 1200;

/// TTL for an entry created by a synchronous probe
pub const PROBE_TTL_SECS: u32 = 10;

/// Maximum packets queued on one unresolved entry
pub const PENDING_QUEUE_DEPTH: usize = 8;

/// Errors that can occur while parsing an ARP message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpError {
    /// Packet is too short to be valid
    PacketTooShort,
    /// Invalid hardware type (not Ethernet)
    InvalidHardwareType,
    /// Invalid protocol type (not IPv4)
    InvalidProtocolType,
    /// Invalid hardware address length
    InvalidHardwareLength,
    /// Invalid protocol address length
    InvalidProtocolLength,
    /// Unknown operation code
    UnknownOperation,
}

/// A 28-byte ARP message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpMessage {
    /// Operation (1 = request, 2 = reply)
    pub operation: u16,
    /// Sender MAC address
    pub sender_mac: [u8; 6],
    /// Sender IP address
    pub sender_ip: Ipv4Addr,
    /// Target MAC address
    pub target_mac: [u8; 6],
    /// Target IP address
    pub target_ip: Ipv4Addr,
}

impl ArpMessage {
    /// Create an ARP request for `target_ip`.
    pub fn new_request(sender_mac: [u8; 6], sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            operation: ARP_REQUEST,
            sender_mac,
            sender_ip,
            target_mac: [0; 6],
            target_ip,
        }
    }

    /// Create an ARP reply addressed to the requester.
    pub fn new_reply(
        sender_mac: [u8; 6],
        sender_ip: Ipv4Addr,
        target_mac: [u8; 6],
        target_ip: Ipv4Addr,
    ) -> Self {
        Self {
            operation: ARP_REPLY,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }

    /// Parse an ARP message from raw bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ArpError> {
        if data.len() < ARP_PACKET_SIZE {
            return Err(ArpError::PacketTooShort);
        }

        if u16::from_be_bytes([data[0], data[1]]) != HW_TYPE_ETHERNET {
            return Err(ArpError::InvalidHardwareType);
        }
        if u16::from_be_bytes([data[2], data[3]]) != PROTO_TYPE_IPV4 {
            return Err(ArpError::InvalidProtocolType);
        }
        if data[4] != 6 {
            return Err(ArpError::InvalidHardwareLength);
        }
        if data[5] != 4 {
            return Err(ArpError::InvalidProtocolLength);
        }

        let operation = u16::from_be_bytes([data[6], data[7]]);
        if operation != ARP_REQUEST && operation != ARP_REPLY {
            return Err(ArpError::UnknownOperation);
        }

        let mut sender_mac = [0u8; 6];
        sender_mac.copy_from_slice(&data[8..14]);
        let sender_ip = Ipv4Addr::new(data[14], data[15], data[16], data[17]);

        let mut target_mac = [0u8; 6];
        target_mac.copy_from_slice(&data[18..24]);
        let target_ip = Ipv4Addr::new(data[24], data[25], data[26], data[27]);

        Ok(Self {
            operation,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        })
    }

    /// Serialize into the first 28 bytes of `out`.
    pub fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&HW_TYPE_ETHERNET.to_be_bytes());
        out[2..4].copy_from_slice(&PROTO_TYPE_IPV4.to_be_bytes());
        out[4] = 6;
        out[5] = 4;
        out[6..8].copy_from_slice(&self.operation.to_be_bytes());
        out[8..14].copy_from_slice(&self.sender_mac);
        out[14..18].copy_from_slice(&self.sender_ip.octets());
        out[18..24].copy_from_slice(&self.target_mac);
        out[24..28].copy_from_slice(&self.target_ip.octets());
    }

    pub fn is_request(&self) -> bool {
        self.operation == ARP_REQUEST
    }

    pub fn is_reply(&self) -> bool {
        self.operation == ARP_REPLY
    }
}

/// Resolution state of one cache slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpState {
    Free,
    Pending,
    Valid,
}

/// One cache slot. A Free slot is marked by an ip of 0.0.0.0.
pub(crate) struct ArpEntry {
    pub(crate) ip: Ipv4Addr,
    pub(crate) mac: [u8; 6],
    pub(crate) state: ArpState,
    pub(crate) permanent: bool,
    pub(crate) ttl: u32,
    pub(crate) pending: VecDeque<PacketBuffer>,
    pub(crate) probe: Option<Arc<SignalSlot>>,
}

impl ArpEntry {
    fn free() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            mac: [0; 6],
            state: ArpState::Free,
            permanent: false,
            ttl: 0,
            pending: VecDeque::new(),
            probe: None,
        }
    }

    fn clear(&mut self) -> (VecDeque<PacketBuffer>, Option<Arc<SignalSlot>>) {
        let queued = core::mem::take(&mut self.pending);
        let probe = self.probe.take();
        *self = Self::free();
        (queued, probe)
    }
}

/// Bounded IP-to-MAC cache with pending-packet queues.
pub struct ArpTable {
    pub(crate) entries: Mutex<Vec<ArpEntry>>,
    /// Serializes synchronous probes: one ping in flight system-wide.
    /// A semaphore, not a mutex, so the holder can block on the reply
    /// without keeping a critical section.
    probe_gate: Semaphore,
}

impl ArpTable {
    pub(crate) fn new() -> Self {
        let mut entries = Vec::with_capacity(ARP_CACHE_SIZE);
        for _ in 0..ARP_CACHE_SIZE {
            entries.push(ArpEntry::free());
        }
        Self {
            entries: Mutex::new(entries),
            probe_gate: Semaphore::new(1),
        }
    }

    /// Look up a Valid mapping without touching its state.
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<[u8; 6]> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.state == ArpState::Valid && e.ip == ip)
            .map(|e| e.mac)
    }

    /// Number of non-Free slots.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.state != ArpState::Free)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pick a slot for `ip`: a Free one, or evict the lowest-TTL entry among
/// non-permanent unicast entries (linear scan, first-seen wins ties).
/// Every eviction is counted. Returns the evicted entry's queued buffers
/// and probe waiter for the caller to dispose of after the table guard
/// drops.
fn claim_slot(
    stack: &NetStack,
    entries: &mut Vec<ArpEntry>,
) -> Option<(usize, VecDeque<PacketBuffer>, Option<Arc<SignalSlot>>)> {
    if let Some(idx) = entries.iter().position(|e| e.state == ArpState::Free) {
        return Some((idx, VecDeque::new(), None));
    }

    let mut victim: Option<usize> = None;
    for (idx, entry) in entries.iter().enumerate() {
        if entry.permanent || entry.ip.is_multicast() {
            continue;
        }
        match victim {
            Some(v) if entries[v].ttl <= entry.ttl => {}
            _ => victim = Some(idx),
        }
    }

    let idx = victim?;
    stack.counters.arp_evictions.fetch_add(1, Ordering::Relaxed);
    let (queued, probe) = entries[idx].clear();
    Some((idx, queued, probe))
}

fn transmit_request(stack: &NetStack, target_ip: Ipv4Addr) {
    let Some(mut buf) = stack.pool.allocate() else {
        stack.counters.dropped_no_buffer.fetch_add(1, Ordering::Relaxed);
        return;
    };

    let config = stack.config();
    let our_mac = stack.mac_address();
    ethernet::write_header(&mut buf, BROADCAST_MAC, our_mac, ETHERTYPE_ARP);
    let request = ArpMessage::new_request(our_mac, config.ip_addr, target_ip);
    request.write(&mut buf.data_mut()[L3_OFFSET..L3_OFFSET + ARP_PACKET_SIZE]);
    buf.set_len(L3_OFFSET + ARP_PACKET_SIZE);

    log::trace!("arp: requesting {}", target_ip);
    stack.transmit(buf);
}

/// Resolve `dest_ip` and transmit `buf` (an IP frame with its Ethernet
/// header still unwritten).
///
/// Broadcast destinations go out immediately with the broadcast MAC.
/// Off-subnet destinations are redirected to the configured gateway. A
/// cache miss queues the packet on a Pending entry and issues a request;
/// joining an already-Pending entry re-issues the request.
pub fn resolve_and_send(stack: &NetStack, mut buf: PacketBuffer, dest_ip: Ipv4Addr) {
    let config = stack.config();
    let our_mac = stack.mac_address();

    if dest_ip == Ipv4Addr::BROADCAST || config.is_subnet_broadcast(dest_ip) {
        ethernet::write_header(&mut buf, BROADCAST_MAC, our_mac, ETHERTYPE_IPV4);
        stack.transmit(buf);
        return;
    }

    let next_hop = if config.is_local(dest_ip) || !config.is_valid() {
        dest_ip
    } else {
        match config.gateway {
            Some(gw) => gw,
            None => {
                stack.counters.dropped_no_route.fetch_add(1, Ordering::Relaxed);
                stack.pool.release(buf);
                return;
            }
        }
    };

    // Decide under the table lock; transmit or release after it drops.
    enum Action {
        Send(PacketBuffer, [u8; 6]),
        Request,
        Drop(PacketBuffer),
    }

    let mut evicted: VecDeque<PacketBuffer> = VecDeque::new();
    let mut failed_probe: Option<Arc<SignalSlot>> = None;

    let action = {
        let mut entries = stack.arp.entries.lock();
        match entries.iter_mut().find(|e| e.state != ArpState::Free && e.ip == next_hop) {
            Some(entry) if entry.state == ArpState::Valid => Action::Send(buf, entry.mac),
            Some(entry) => {
                // Pending: queue behind the earlier packets, re-issue
                if entry.pending.len() < PENDING_QUEUE_DEPTH {
                    entry.pending.push_back(buf);
                    Action::Request
                } else {
                    stack.counters.arp_pending_dropped.fetch_add(1, Ordering::Relaxed);
                    Action::Drop(buf)
                }
            }
            None => match claim_slot(stack, &mut entries) {
                Some((idx, queued, probe)) => {
                    evicted = queued;
                    failed_probe = probe;

                    let entry = &mut entries[idx];
                    entry.ip = next_hop;
                    entry.mac = [0; 6];
                    entry.state = ArpState::Pending;
                    entry.permanent = false;
                    entry.ttl = PENDING_TTL_SECS;
                    entry.pending.push_back(buf);
                    Action::Request
                }
                None => {
                    stack.counters.dropped_no_route.fetch_add(1, Ordering::Relaxed);
                    Action::Drop(buf)
                }
            },
        }
    };

    for dropped in evicted {
        stack.counters.arp_pending_dropped.fetch_add(1, Ordering::Relaxed);
        stack.pool.release(dropped);
    }
    if let Some(probe) = failed_probe {
        probe.complete(false);
    }

    match action {
        Action::Send(mut buf, mac) => {
            ethernet::write_header(&mut buf, mac, our_mac, ETHERTYPE_IPV4);
            stack.transmit(buf);
        }
        Action::Request => transmit_request(stack, next_hop),
        Action::Drop(buf) => stack.pool.release(buf),
    }
}

/// Record (or refresh) a mapping, waking anything waiting on it.
///
/// A Pending entry flips to Valid and its queued packets are transmitted
/// in FIFO order with the learned MAC. Unknown addresses create a fresh
/// entry, evicting if the table is full.
pub fn learn(stack: &NetStack, mac: [u8; 6], ip: Ipv4Addr) {
    if ip.is_unspecified() {
        return;
    }
    log::trace!("arp: {} is at {}", ip, ethernet::format_mac(&mac));

    let our_mac = stack.mac_address();
    let mut drained: VecDeque<PacketBuffer> = VecDeque::new();
    let mut woken_probe: Option<Arc<SignalSlot>> = None;
    let mut evicted: VecDeque<PacketBuffer> = VecDeque::new();
    let mut failed_probe: Option<Arc<SignalSlot>> = None;

    {
        let mut entries = stack.arp.entries.lock();
        match entries.iter_mut().find(|e| e.state != ArpState::Free && e.ip == ip) {
            Some(entry) => {
                entry.mac = mac;
                entry.ttl = VALID_TTL_SECS;
                if entry.state == ArpState::Pending {
                    entry.state = ArpState::Valid;
                    drained = core::mem::take(&mut entry.pending);
                    woken_probe = entry.probe.take();
                } else {
                    entry.state = ArpState::Valid;
                }
            }
            None => {
                if let Some((idx, queued, probe)) = claim_slot(stack, &mut entries) {
                    evicted = queued;
                    failed_probe = probe;

                    let entry = &mut entries[idx];
                    entry.ip = ip;
                    entry.mac = mac;
                    entry.state = ArpState::Valid;
                    entry.permanent = false;
                    entry.ttl = VALID_TTL_SECS;
                }
            }
        }
    }

    for mut buf in drained {
        ethernet::write_header(&mut buf, mac, our_mac, ETHERTYPE_IPV4);
        stack.transmit(buf);
    }
    if let Some(probe) = woken_probe {
        probe.complete(true);
    }
    for dropped in evicted {
        stack.counters.arp_pending_dropped.fetch_add(1, Ordering::Relaxed);
        stack.pool.release(dropped);
    }
    if let Some(probe) = failed_probe {
        probe.complete(false);
    }
}

/// Handle an inbound ARP frame.
///
/// Every well-formed message teaches us the sender's mapping. A request
/// for our address repurposes the received buffer as the reply.
pub fn handle_packet(stack: &NetStack, mut buf: PacketBuffer) {
    let message = match ArpMessage::from_bytes(&buf.frame()[L3_OFFSET..]) {
        Ok(message) => message,
        Err(err) => {
            log::debug!("arp: dropping malformed packet: {:?}", err);
            stack.counters.dropped_malformed.fetch_add(1, Ordering::Relaxed);
            stack.pool.release(buf);
            return;
        }
    };

    learn(stack, message.sender_mac, message.sender_ip);

    let config = stack.config();
    if message.is_request() && config.is_valid() && message.target_ip == config.ip_addr {
        let our_mac = stack.mac_address();
        ethernet::write_header(&mut buf, message.sender_mac, our_mac, ETHERTYPE_ARP);
        let reply = ArpMessage::new_reply(
            our_mac,
            config.ip_addr,
            message.sender_mac,
            message.sender_ip,
        );
        reply.write(&mut buf.data_mut()[L3_OFFSET..L3_OFFSET + ARP_PACKET_SIZE]);
        buf.set_len(L3_OFFSET + ARP_PACKET_SIZE);
        stack.transmit(buf);
        return;
    }

    stack.pool.release(buf);
}

/// 1 Hz aging pass. An expiring Pending entry drops its queued packets
/// unsent and fails any waiting probe.
pub fn tick(stack: &NetStack) {
    let mut expired: Vec<(VecDeque<PacketBuffer>, Option<Arc<SignalSlot>>)> = Vec::new();

    {
        let mut entries = stack.arp.entries.lock();
        for entry in entries.iter_mut() {
            if entry.state == ArpState::Free || entry.permanent {
                continue;
            }
            entry.ttl = entry.ttl.saturating_sub(1);
            if entry.ttl == 0 {
                expired.push(entry.clear());
            }
        }
    }

    for (queued, probe) in expired {
        for buf in queued {
            stack.counters.arp_pending_dropped.fetch_add(1, Ordering::Relaxed);
            stack.pool.release(buf);
        }
        if let Some(probe) = probe {
            probe.complete(false);
        }
    }
}

/// Synchronously resolve `ip`, blocking until a reply or expiry.
///
/// Only one probe is in flight system-wide; concurrent callers serialize.
/// Returns the resolved MAC, or `None` if the probe entry ages out.
pub fn ping(stack: &NetStack, ip: Ipv4Addr) -> Option<[u8; 6]> {
    stack.arp.probe_gate.wait();
    let result = probe(stack, ip);
    stack.arp.probe_gate.signal();
    result
}

fn probe(stack: &NetStack, ip: Ipv4Addr) -> Option<[u8; 6]> {
    let slot = Arc::new(SignalSlot::new());
    let mut evicted: VecDeque<PacketBuffer> = VecDeque::new();
    let mut failed_probe: Option<Arc<SignalSlot>> = None;

    {
        let mut entries = stack.arp.entries.lock();
        match entries.iter_mut().find(|e| e.state != ArpState::Free && e.ip == ip) {
            Some(entry) if entry.state == ArpState::Valid => return Some(entry.mac),
            Some(entry) => {
                entry.ttl = PROBE_TTL_SECS;
                entry.probe = Some(slot.clone());
            }
            None => {
                let (idx, queued, probe) = claim_slot(stack, &mut entries)?;
                evicted = queued;
                failed_probe = probe;

                let entry = &mut entries[idx];
                entry.ip = ip;
                entry.mac = [0; 6];
                entry.state = ArpState::Pending;
                entry.permanent = false;
                entry.ttl = PROBE_TTL_SECS;
                entry.probe = Some(slot.clone());
            }
        }
    }

    for dropped in evicted {
        stack.counters.arp_pending_dropped.fetch_add(1, Ordering::Relaxed);
        stack.pool.release(dropped);
    }
    if let Some(probe) = failed_probe {
        probe.complete(false);
    }

    transmit_request(stack, ip);

    if slot.wait() {
        stack.arp.lookup(ip)
    } else {
        None
    }
}

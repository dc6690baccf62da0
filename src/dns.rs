//! DNS (Domain Name System) client - RFC 1035
//!
//! Resolves hostnames to IPv4 addresses through a small bounded cache.
//! A cache slot is Free, Pending (query in flight, transaction id
//! recorded), or Valid. Lookups for a name already Pending share the
//! in-flight query's waiter instead of issuing a second one. The 1 Hz
//! tick ages entries out; an expiring Pending entry fails its waiters.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::Ipv4Addr;
use core::sync::atomic::{AtomicU16, Ordering};
use spin::Mutex;

use crate::stack::NetStack;
use crate::sync::SignalSlot;
use crate::udp;

/// Local port the resolver binds for queries
pub const DNS_CLIENT_PORT: u16 = 49153;

/// Well-known DNS server port
pub const DNS_SERVER_PORT: u16 = 53;

/// Number of cache slots
pub const DNS_CACHE_SIZE: usize = 8;

/// DNS header size
const HEADER_SIZE: usize = 12;

/// Compression-pointer jump limit while parsing names
const MAX_JUMPS: usize = 5;

/// DNS error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsError {
    /// Invalid domain name format
    InvalidDomain,
    /// Failed to parse DNS response
    ParseError,
}

/// DNS header structure (12 bytes)
#[derive(Debug, Clone, Copy)]
struct DnsHeader {
    id: u16,
    flags: u16,
    qdcount: u16,
    ancount: u16,
}

impl DnsHeader {
    /// Standard query with recursion desired
    fn new_query(id: u16) -> Self {
        Self {
            id,
            flags: 0x0100,
            qdcount: 1,
            ancount: 0,
        }
    }

    fn from_bytes(data: &[u8]) -> Result<Self, DnsError> {
        if data.len() < HEADER_SIZE {
            return Err(DnsError::ParseError);
        }
        Ok(Self {
            id: u16::from_be_bytes([data[0], data[1]]),
            flags: u16::from_be_bytes([data[2], data[3]]),
            qdcount: u16::from_be_bytes([data[4], data[5]]),
            ancount: u16::from_be_bytes([data[6], data[7]]),
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&self.qdcount.to_be_bytes());
        out.extend_from_slice(&self.ancount.to_be_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]);
    }

    /// QR bit set
    fn is_response(&self) -> bool {
        (self.flags & 0x8000) != 0
    }

    /// RCODE = 0
    fn is_success(&self) -> bool {
        (self.flags & 0x000F) == 0
    }
}

/// Encode a domain name in DNS wire format.
/// Example: "example.com" -> [7]example[3]com[0]
fn encode_domain_name(domain: &str, out: &mut Vec<u8>) -> Result<(), DnsError> {
    for label in domain.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(DnsError::InvalidDomain);
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(())
}

/// Skip a (possibly compressed) domain name, advancing `offset` past it.
fn skip_domain_name(data: &[u8], offset: &mut usize) -> Result<(), DnsError> {
    let mut jumped = false;
    let mut pos = *offset;
    let mut jumps = 0;

    loop {
        if pos >= data.len() {
            return Err(DnsError::ParseError);
        }

        let length = data[pos];

        if (length & 0xC0) == 0xC0 {
            if pos + 1 >= data.len() {
                return Err(DnsError::ParseError);
            }
            if !jumped {
                *offset = pos + 2;
            }
            pos = u16::from_be_bytes([length & 0x3F, data[pos + 1]]) as usize;
            jumped = true;
            jumps += 1;
            if jumps > MAX_JUMPS {
                return Err(DnsError::ParseError);
            }
            continue;
        }

        if length == 0 {
            if !jumped {
                *offset = pos + 1;
            }
            return Ok(());
        }

        pos += 1 + length as usize;
    }
}

/// Build an A-record query packet for `domain`.
fn build_query(domain: &str, id: u16) -> Result<Vec<u8>, DnsError> {
    let mut packet = Vec::with_capacity(HEADER_SIZE + domain.len() + 6);
    DnsHeader::new_query(id).write(&mut packet);
    encode_domain_name(domain, &mut packet)?;
    packet.extend_from_slice(&1u16.to_be_bytes()); // QTYPE = A
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS = IN
    Ok(packet)
}

/// Extract the first A record from a response, with its TTL.
fn parse_first_a_record(data: &[u8], header: &DnsHeader) -> Result<(Ipv4Addr, u32), DnsError> {
    let mut offset = HEADER_SIZE;

    for _ in 0..header.qdcount {
        skip_domain_name(data, &mut offset)?;
        offset += 4;
    }

    for _ in 0..header.ancount {
        skip_domain_name(data, &mut offset)?;
        if offset + 10 > data.len() {
            return Err(DnsError::ParseError);
        }

        let rtype = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let rclass = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
        let ttl = u32::from_be_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]);
        let rdlength = u16::from_be_bytes([data[offset + 8], data[offset + 9]]) as usize;
        offset += 10;

        if offset + rdlength > data.len() {
            return Err(DnsError::ParseError);
        }

        if rtype == 1 && rclass == 1 && rdlength == 4 {
            let addr = Ipv4Addr::new(
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            );
            return Ok((addr, ttl));
        }

        offset += rdlength;
    }

    Err(DnsError::ParseError)
}

/// Resolution state of one cache slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DnsState {
    Free,
    Pending,
    Valid,
}

struct DnsEntry {
    name: String,
    addr: Ipv4Addr,
    state: DnsState,
    permanent: bool,
    qid: u16,
    ttl: u32,
    waiter: Option<Arc<SignalSlot>>,
}

impl DnsEntry {
    fn free() -> Self {
        Self {
            name: String::new(),
            addr: Ipv4Addr::UNSPECIFIED,
            state: DnsState::Free,
            permanent: false,
            qid: 0,
            ttl: 0,
            waiter: None,
        }
    }

    fn clear(&mut self) -> Option<Arc<SignalSlot>> {
        let waiter = self.waiter.take();
        *self = Self::free();
        waiter
    }
}

/// Bounded hostname-to-address cache.
pub struct DnsTable {
    entries: Mutex<Vec<DnsEntry>>,
    next_id: AtomicU16,
}

impl DnsTable {
    pub(crate) fn new() -> Self {
        let mut entries = Vec::with_capacity(DNS_CACHE_SIZE);
        for _ in 0..DNS_CACHE_SIZE {
            entries.push(DnsEntry::free());
        }
        Self {
            entries: Mutex::new(entries),
            next_id: AtomicU16::new(1),
        }
    }

    /// Look up a Valid mapping without issuing a query.
    pub fn cached(&self, name: &str) -> Option<Ipv4Addr> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.state == DnsState::Valid && e.name == name)
            .map(|e| e.addr)
    }

    /// Pin a permanent mapping (never aged, never evicted).
    pub fn insert_permanent(&self, name: &str, addr: Ipv4Addr) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.state != DnsState::Free && e.name == name)
        {
            entry.addr = addr;
            entry.state = DnsState::Valid;
            entry.permanent = true;
            return;
        }
        if let Some((idx, waiter)) = claim_slot(&mut entries) {
            let entry = &mut entries[idx];
            entry.name = String::from(name);
            entry.addr = addr;
            entry.state = DnsState::Valid;
            entry.permanent = true;
            drop(entries);
            if let Some(waiter) = waiter {
                waiter.complete(false);
            }
        }
    }
}

/// Pick a slot: a Free one, or evict the lowest-TTL non-permanent entry.
/// Returns the evicted entry's waiter for the caller to fail after the
/// guard drops.
fn claim_slot(entries: &mut Vec<DnsEntry>) -> Option<(usize, Option<Arc<SignalSlot>>)> {
    if let Some(idx) = entries.iter().position(|e| e.state == DnsState::Free) {
        return Some((idx, None));
    }

    let mut victim: Option<usize> = None;
    for (idx, entry) in entries.iter().enumerate() {
        if entry.permanent {
            continue;
        }
        match victim {
            Some(v) if entries[v].ttl <= entry.ttl => {}
            _ => victim = Some(idx),
        }
    }

    let idx = victim?;
    let waiter = entries[idx].clear();
    Some((idx, waiter))
}

/// Resolve `name`, blocking until an answer arrives or `timeout_secs`
/// ticks elapse.
///
/// A Valid cache hit returns immediately. A lookup for a name that is
/// already Pending piggybacks on the in-flight query. Otherwise a slot
/// is claimed, a query sent to the configured server, and the caller
/// waits on the slot.
pub fn lookup(stack: &NetStack, name: &str, timeout_secs: u32) -> Option<Ipv4Addr> {
    if let Ok(addr) = name.parse::<Ipv4Addr>() {
        return Some(addr);
    }

    let qid = stack.dns.next_id.fetch_add(1, Ordering::Relaxed);
    let query = match build_query(name, qid) {
        Ok(query) => query,
        Err(err) => {
            log::debug!("dns: cannot query {:?}: {:?}", name, err);
            return None;
        }
    };

    let slot;
    {
        let mut entries = stack.dns.entries.lock();
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.state != DnsState::Free && e.name == name)
        {
            if entry.state == DnsState::Valid {
                return Some(entry.addr);
            }
            // Pending: share the in-flight query.
            let shared = match &entry.waiter {
                Some(waiter) => waiter.clone(),
                None => {
                    let fresh = Arc::new(SignalSlot::new());
                    entry.waiter = Some(fresh.clone());
                    fresh
                }
            };
            drop(entries);
            if shared.wait() {
                return stack.dns.cached(name);
            }
            return None;
        }

        let (idx, evicted_waiter) = claim_slot(&mut entries)?;
        slot = Arc::new(SignalSlot::new());
        let entry = &mut entries[idx];
        entry.name = String::from(name);
        entry.addr = Ipv4Addr::UNSPECIFIED;
        entry.state = DnsState::Pending;
        entry.permanent = false;
        entry.qid = qid;
        entry.ttl = timeout_secs.max(1);
        entry.waiter = Some(slot.clone());

        drop(entries);
        if let Some(waiter) = evicted_waiter {
            waiter.complete(false);
        }
    }

    let server = stack.config().dns_server;
    log::trace!("dns: querying {} for {:?}", server, name);
    if !udp::send_datagram(stack, DNS_CLIENT_PORT, server, DNS_SERVER_PORT, &query) {
        fail_pending(stack, name);
        return None;
    }

    if slot.wait() {
        stack.dns.cached(name)
    } else {
        None
    }
}

/// Drop a Pending entry after a send failure, failing its waiters.
fn fail_pending(stack: &NetStack, name: &str) {
    let waiter = {
        let mut entries = stack.dns.entries.lock();
        entries
            .iter_mut()
            .find(|e| e.state == DnsState::Pending && e.name == name)
            .map(|e| e.clear())
    };
    if let Some(Some(waiter)) = waiter {
        waiter.complete(false);
    }
}

/// UDP handler for the resolver port. Responses with an unknown
/// transaction id or no usable A record are ignored; the Pending entry
/// keeps waiting for its timeout.
pub fn handle_response(stack: &NetStack, src_ip: Ipv4Addr, _src_port: u16, payload: &[u8]) {
    let header = match DnsHeader::from_bytes(payload) {
        Ok(header) => header,
        Err(_) => {
            log::debug!("dns: truncated response from {}", src_ip);
            return;
        }
    };

    if !header.is_response() {
        return;
    }

    // Error responses and answers without an A record are ignored; the
    // Pending entry keeps waiting until its timeout.
    if !header.is_success() {
        log::debug!("dns: server error for id {}", header.id);
        return;
    }
    let Ok((addr, ttl)) = parse_first_a_record(payload, &header) else {
        log::debug!("dns: no usable answer for id {}", header.id);
        return;
    };

    let woken = {
        let mut entries = stack.dns.entries.lock();
        let Some(entry) = entries
            .iter_mut()
            .find(|e| e.state == DnsState::Pending && e.qid == header.id)
        else {
            return;
        };

        entry.addr = addr;
        entry.state = DnsState::Valid;
        entry.ttl = ttl.max(1);
        entry.waiter.take()
    };

    if let Some(waiter) = woken {
        log::trace!("dns: resolved response id {} to {}", header.id, addr);
        waiter.complete(true);
    }
}

/// 1 Hz aging pass. A Pending entry reaching zero counts as a timeout
/// and fails its waiters; a Valid entry is simply evicted.
pub fn tick(stack: &NetStack) {
    let mut timed_out: Vec<Arc<SignalSlot>> = Vec::new();

    {
        let mut entries = stack.dns.entries.lock();
        for entry in entries.iter_mut() {
            if entry.state == DnsState::Free || entry.permanent {
                continue;
            }
            entry.ttl = entry.ttl.saturating_sub(1);
            if entry.ttl == 0 {
                if entry.state == DnsState::Pending {
                    stack.counters.dns_timeouts.fetch_add(1, Ordering::Relaxed);
                }
                if let Some(waiter) = entry.clear() {
                    timed_out.push(waiter);
                }
            }
        }
    }

    for waiter in timed_out {
        waiter.complete(false);
    }
}

//! Network stack context
//!
//! `NetStack` owns every piece of stack state: the buffer pool, the
//! receive queue, the protocol tables, the interface configuration, and
//! the drop counters. Nothing in the crate is a global; everything
//! reaches its state through a `&NetStack`.
//!
//! The receive pipeline is split in two. `enqueue_frame` is the
//! interrupt half: it copies the wire frame into a pool buffer, pushes
//! it on a lock-free queue, and signals the worker. `rx_loop` (or
//! `poll` in tests) is the worker half that parses and dispatches.

use alloc::sync::Arc;
use core::fmt;
use core::net::Ipv4Addr;
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use crossbeam_queue::ArrayQueue;
use spin::Mutex;

use crate::arp::ArpTable;
use crate::bootp::{self, BootpState};
use crate::buffer::{BufferPool, PacketBuffer};
use crate::device::NetDevice;
use crate::dns::{self, DnsTable};
use crate::ethernet::{self, EthHeader, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::ipv4;
use crate::tcp::TcpTable;
use crate::udp::UdpTable;

/// Default buffer pool capacity
pub const DEFAULT_POOL_CAPACITY: usize = 32;

/// Default receive queue depth
pub const DEFAULT_RX_QUEUE_DEPTH: usize = 16;

/// Interface configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetConfig {
    pub ip_addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub dns_server: Ipv4Addr,
}

impl NetConfig {
    /// Placeholder configuration used before BOOTP completes.
    pub fn unconfigured() -> Self {
        Self {
            ip_addr: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            gateway: None,
            dns_server: Ipv4Addr::UNSPECIFIED,
        }
    }

    /// A static configuration with the usual /24 conventions.
    pub fn with_static(ip_addr: Ipv4Addr, netmask: Ipv4Addr, gateway: Ipv4Addr) -> Self {
        Self {
            ip_addr,
            netmask,
            gateway: Some(gateway),
            dns_server: gateway,
        }
    }

    /// Whether an address has been assigned yet.
    pub fn is_valid(&self) -> bool {
        !self.ip_addr.is_unspecified()
    }

    /// Whether `ip` is on our subnet.
    pub fn is_local(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        (u32::from(ip) & mask) == (u32::from(self.ip_addr) & mask)
    }

    /// Whether `ip` is our subnet's directed broadcast address.
    pub fn is_subnet_broadcast(&self, ip: Ipv4Addr) -> bool {
        if !self.is_valid() {
            return false;
        }
        let mask = u32::from(self.netmask);
        u32::from(ip) == (u32::from(self.ip_addr) & mask) | !mask
    }
}

/// Per-stack event counters. Incremented with relaxed atomics on the
/// data path, read as a snapshot for diagnostics.
#[derive(Default)]
pub struct NetCounters {
    pub(crate) rx_frames: AtomicU32,
    pub(crate) tx_frames: AtomicU32,
    pub(crate) dropped_no_buffer: AtomicU32,
    pub(crate) dropped_rx_queue_full: AtomicU32,
    pub(crate) dropped_unknown_ethertype: AtomicU32,
    pub(crate) dropped_malformed: AtomicU32,
    pub(crate) dropped_bad_checksum: AtomicU32,
    pub(crate) dropped_fragment: AtomicU32,
    pub(crate) dropped_not_ours: AtomicU32,
    pub(crate) dropped_unknown_protocol: AtomicU32,
    pub(crate) dropped_no_route: AtomicU32,
    pub(crate) dropped_no_port: AtomicU32,
    pub(crate) arp_evictions: AtomicU32,
    pub(crate) arp_pending_dropped: AtomicU32,
    pub(crate) dns_timeouts: AtomicU32,
    pub(crate) tcp_rst_sent: AtomicU32,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub rx_frames: u32,
    pub tx_frames: u32,
    pub dropped_no_buffer: u32,
    pub dropped_rx_queue_full: u32,
    pub dropped_unknown_ethertype: u32,
    pub dropped_malformed: u32,
    pub dropped_bad_checksum: u32,
    pub dropped_fragment: u32,
    pub dropped_not_ours: u32,
    pub dropped_unknown_protocol: u32,
    pub dropped_no_route: u32,
    pub dropped_no_port: u32,
    pub arp_evictions: u32,
    pub arp_pending_dropped: u32,
    pub dns_timeouts: u32,
    pub tcp_rst_sent: u32,
}

impl CounterSnapshot {
    /// Sum of every drop category.
    pub fn total_dropped(&self) -> u32 {
        self.dropped_no_buffer
            + self.dropped_rx_queue_full
            + self.dropped_unknown_ethertype
            + self.dropped_malformed
            + self.dropped_bad_checksum
            + self.dropped_fragment
            + self.dropped_not_ours
            + self.dropped_unknown_protocol
            + self.dropped_no_route
            + self.dropped_no_port
            + self.arp_pending_dropped
    }
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "rx frames:          {}", self.rx_frames)?;
        writeln!(f, "tx frames:          {}", self.tx_frames)?;
        writeln!(f, "dropped (total):    {}", self.total_dropped())?;
        writeln!(f, "  no buffer:        {}", self.dropped_no_buffer)?;
        writeln!(f, "  rx queue full:    {}", self.dropped_rx_queue_full)?;
        writeln!(f, "  bad ethertype:    {}", self.dropped_unknown_ethertype)?;
        writeln!(f, "  malformed:        {}", self.dropped_malformed)?;
        writeln!(f, "  bad checksum:     {}", self.dropped_bad_checksum)?;
        writeln!(f, "  fragmented:       {}", self.dropped_fragment)?;
        writeln!(f, "  not ours:         {}", self.dropped_not_ours)?;
        writeln!(f, "  bad protocol:     {}", self.dropped_unknown_protocol)?;
        writeln!(f, "  no route:         {}", self.dropped_no_route)?;
        writeln!(f, "  no port:          {}", self.dropped_no_port)?;
        writeln!(f, "  arp queue:        {}", self.arp_pending_dropped)?;
        writeln!(f, "arp evictions:      {}", self.arp_evictions)?;
        writeln!(f, "dns timeouts:       {}", self.dns_timeouts)?;
        write!(f, "tcp resets sent:    {}", self.tcp_rst_sent)
    }
}

/// The network stack. One per interface.
pub struct NetStack {
    device: Arc<dyn NetDevice>,
    config: Mutex<NetConfig>,
    pub(crate) pool: BufferPool,
    rx_queue: ArrayQueue<PacketBuffer>,
    rx_ready: crate::sync::Semaphore,
    pub arp: ArpTable,
    pub dns: DnsTable,
    pub tcp: TcpTable,
    pub udp: UdpTable,
    pub(crate) bootp: Mutex<BootpState>,
    pub(crate) counters: NetCounters,
    ip_ident: AtomicU16,
}

impl NetStack {
    /// Build a stack with default pool and queue sizes. The resolver and
    /// BOOTP client ports are bound here so their replies always have a
    /// home.
    pub fn new(device: Arc<dyn NetDevice>, config: NetConfig) -> Self {
        Self::with_capacity(device, config, DEFAULT_POOL_CAPACITY, DEFAULT_RX_QUEUE_DEPTH)
    }

    pub fn with_capacity(
        device: Arc<dyn NetDevice>,
        config: NetConfig,
        pool_capacity: usize,
        rx_queue_depth: usize,
    ) -> Self {
        let stack = Self {
            device,
            config: Mutex::new(config),
            pool: BufferPool::new(pool_capacity),
            rx_queue: ArrayQueue::new(rx_queue_depth),
            rx_ready: crate::sync::Semaphore::new(0),
            arp: ArpTable::new(),
            dns: DnsTable::new(),
            tcp: TcpTable::new(),
            udp: UdpTable::new(),
            bootp: Mutex::new(BootpState::new()),
            counters: NetCounters::default(),
            ip_ident: AtomicU16::new(1),
        };
        stack.udp.bind(dns::DNS_CLIENT_PORT, dns::handle_response);
        stack.udp.bind(bootp::CLIENT_PORT, bootp::handle_reply);
        stack
    }

    /// Current interface configuration.
    pub fn config(&self) -> NetConfig {
        *self.config.lock()
    }

    pub fn set_config(&self, config: NetConfig) {
        *self.config.lock() = config;
    }

    pub fn mac_address(&self) -> [u8; 6] {
        self.device.mac_address()
    }

    /// Snapshot the event counters.
    pub fn counters(&self) -> CounterSnapshot {
        let c = &self.counters;
        CounterSnapshot {
            rx_frames: c.rx_frames.load(Ordering::Relaxed),
            tx_frames: c.tx_frames.load(Ordering::Relaxed),
            dropped_no_buffer: c.dropped_no_buffer.load(Ordering::Relaxed),
            dropped_rx_queue_full: c.dropped_rx_queue_full.load(Ordering::Relaxed),
            dropped_unknown_ethertype: c.dropped_unknown_ethertype.load(Ordering::Relaxed),
            dropped_malformed: c.dropped_malformed.load(Ordering::Relaxed),
            dropped_bad_checksum: c.dropped_bad_checksum.load(Ordering::Relaxed),
            dropped_fragment: c.dropped_fragment.load(Ordering::Relaxed),
            dropped_not_ours: c.dropped_not_ours.load(Ordering::Relaxed),
            dropped_unknown_protocol: c.dropped_unknown_protocol.load(Ordering::Relaxed),
            dropped_no_route: c.dropped_no_route.load(Ordering::Relaxed),
            dropped_no_port: c.dropped_no_port.load(Ordering::Relaxed),
            arp_evictions: c.arp_evictions.load(Ordering::Relaxed),
            arp_pending_dropped: c.arp_pending_dropped.load(Ordering::Relaxed),
            dns_timeouts: c.dns_timeouts.load(Ordering::Relaxed),
            tcp_rst_sent: c.tcp_rst_sent.load(Ordering::Relaxed),
        }
    }

    /// Buffers currently free in the pool.
    pub fn buffers_free(&self) -> usize {
        self.pool.free_count()
    }

    pub(crate) fn next_ident(&self) -> u16 {
        self.ip_ident.fetch_add(1, Ordering::Relaxed)
    }

    /// Interrupt half of the receive path. Copies `frame` into a pool
    /// buffer and hands it to the worker. Never blocks; failures are
    /// counted drops.
    pub fn enqueue_frame(&self, frame: &[u8]) {
        let Some(mut buf) = self.pool.allocate_from_interrupt() else {
            self.counters.dropped_no_buffer.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if !buf.fill_from(frame) {
            self.counters.dropped_malformed.fetch_add(1, Ordering::Relaxed);
            self.pool.release(buf);
            return;
        }
        match self.rx_queue.push(buf) {
            Ok(()) => self.rx_ready.signal(),
            Err(buf) => {
                self.counters
                    .dropped_rx_queue_full
                    .fetch_add(1, Ordering::Relaxed);
                self.pool.release(buf);
            }
        }
    }

    /// Worker half of the receive path. Blocks on the ready semaphore
    /// and dispatches forever.
    pub fn rx_loop(&self) -> ! {
        loop {
            self.rx_ready.wait();
            if let Some(buf) = self.rx_queue.pop() {
                self.handle_frame(buf);
            }
        }
    }

    /// Drain the receive queue without blocking, returning the number of
    /// frames handled. The test-friendly alternative to `rx_loop`.
    pub fn poll(&self) -> usize {
        let mut handled = 0;
        while let Some(buf) = self.rx_queue.pop() {
            // Absorb the matching wakeup so rx_loop never spins on an
            // already-drained queue.
            self.rx_ready.try_wait();
            self.handle_frame(buf);
            handled += 1;
        }
        handled
    }

    /// Parse the Ethernet header and fan out by ethertype.
    fn handle_frame(&self, buf: PacketBuffer) {
        self.counters.rx_frames.fetch_add(1, Ordering::Relaxed);

        let header = match EthHeader::from_bytes(buf.eth_header()) {
            Ok(header) => header,
            Err(_) => {
                self.counters.dropped_malformed.fetch_add(1, Ordering::Relaxed);
                self.pool.release(buf);
                return;
            }
        };

        match header.ethertype {
            ETHERTYPE_ARP => crate::arp::handle_packet(self, buf),
            ETHERTYPE_IPV4 => ipv4::handle_packet(self, buf),
            other => {
                log::trace!("eth: ignoring ethertype {:#06x}", other);
                self.counters
                    .dropped_unknown_ethertype
                    .fetch_add(1, Ordering::Relaxed);
                self.pool.release(buf);
            }
        }
    }

    /// Transmit a fully assembled frame and return its buffer to the
    /// pool. Short frames are padded to the Ethernet minimum first.
    pub(crate) fn transmit(&self, mut buf: PacketBuffer) {
        ethernet::pad_to_minimum(&mut buf);
        match self.device.transmit(buf.frame()) {
            Ok(()) => {
                self.counters.tx_frames.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                log::warn!("net: transmit failed: {:?}", err);
            }
        }
        self.pool.release(buf);
    }

    /// 1 Hz housekeeping: ages the ARP cache, the DNS cache, and any
    /// in-flight BOOTP request. The platform timer calls this once per
    /// second.
    pub fn tick(&self) {
        crate::arp::tick(self);
        dns::tick(self);
        bootp::tick(self);
    }
}

//! Fixed-capacity packet buffer pool.
//!
//! Every frame travels through the stack inside an owned `PacketBuffer`:
//! a 2KB byte region plus per-layer offsets (link / network / transport /
//! payload) recomputed on allocation. Ownership is move-based, so a buffer
//! sits in exactly one place at a time (pool, receive queue, or an ARP
//! entry's pending list) and releasing it twice does not compile.

use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

/// Size of one packet buffer. Large enough for a full Ethernet frame.
pub const BUFFER_SIZE: usize = 2048;

/// Offset of the network header in a frame (after the Ethernet header).
pub const L3_OFFSET: usize = 14;

/// Default transport offset (Ethernet header + option-less IPv4 header).
pub const L4_OFFSET: usize = 34;

/// A single owned packet buffer with layered views.
pub struct PacketBuffer {
    data: Box<[u8; BUFFER_SIZE]>,
    len: usize,
    l4: usize,
    l7: usize,
}

impl PacketBuffer {
    fn new() -> Self {
        Self {
            data: Box::new([0u8; BUFFER_SIZE]),
            len: 0,
            l4: L4_OFFSET,
            l7: L4_OFFSET,
        }
    }

    /// Reset length and layer offsets for a fresh use.
    pub fn reset(&mut self) {
        self.len = 0;
        self.l4 = L4_OFFSET;
        self.l7 = L4_OFFSET;
    }

    /// Total frame length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the total frame length. Clamped to the buffer size.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(BUFFER_SIZE);
    }

    /// Offset of the transport header.
    pub fn l4(&self) -> usize {
        self.l4
    }

    pub fn set_l4(&mut self, offset: usize) {
        self.l4 = offset.min(BUFFER_SIZE);
    }

    /// Offset of the application payload.
    pub fn l7(&self) -> usize {
        self.l7
    }

    pub fn set_l7(&mut self, offset: usize) {
        self.l7 = offset.min(BUFFER_SIZE);
    }

    /// The complete frame as currently filled.
    pub fn frame(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn frame_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// The whole underlying region, for writing headers before the final
    /// length is known.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Ethernet header view.
    pub fn eth_header(&self) -> &[u8] {
        &self.data[..L3_OFFSET.min(self.len)]
    }

    /// Transport header view.
    pub fn transport(&self) -> &[u8] {
        &self.data[self.l4.min(self.len)..self.l7.min(self.len)]
    }

    pub fn transport_mut(&mut self) -> &mut [u8] {
        let (l4, l7) = (self.l4.min(self.len), self.l7.min(self.len));
        &mut self.data[l4..l7]
    }

    /// Application payload view.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.l7.min(self.len)..self.len]
    }

    /// Copy a received frame into the buffer. Fails if it does not fit.
    pub fn fill_from(&mut self, frame: &[u8]) -> bool {
        if frame.len() > BUFFER_SIZE {
            return false;
        }
        self.data[..frame.len()].copy_from_slice(frame);
        self.len = frame.len();
        true
    }
}

/// Fixed pool of pre-allocated packet buffers.
pub struct BufferPool {
    free: Mutex<Vec<PacketBuffer>>,
    capacity: usize,
}

impl BufferPool {
    /// Pre-allocate `capacity` buffers.
    pub fn new(capacity: usize) -> Self {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(PacketBuffer::new());
        }
        Self {
            free: Mutex::new(free),
            capacity,
        }
    }

    /// Take a buffer from the pool, or `None` on exhaustion. Never blocks;
    /// the caller drops the in-flight packet on `None`.
    pub fn allocate(&self) -> Option<PacketBuffer> {
        let mut buf = self.free.lock().pop()?;
        buf.reset();
        Some(buf)
    }

    /// Identical to [`allocate`](Self::allocate), callable while interrupts
    /// are masked: the free-list lock is only ever held for a few
    /// instructions and never across a wait.
    pub fn allocate_from_interrupt(&self) -> Option<PacketBuffer> {
        self.allocate()
    }

    /// Return a buffer to the pool.
    pub fn release(&self, buf: PacketBuffer) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buf);
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

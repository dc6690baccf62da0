//! Concurrency primitives standing in for the kernel scheduler's
//! wait/signal services.
//!
//! The core never holds one lock while acquiring another, and never holds
//! any lock across a blocking wait: blocking paths clone an
//! `Arc<SignalSlot>` out of the table they came from, drop the guard, and
//! only then wait. Interrupt-context entry points (`enqueue_frame`,
//! `allocate_from_interrupt`) touch exactly one lock, briefly.

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Counting semaphore used to wake the receive worker.
///
/// The embedding kernel normally supplies a FIFO-wake counting primitive;
/// this stand-in spins, which is equivalent for a single consumer.
pub struct Semaphore {
    permits: AtomicUsize,
}

impl Semaphore {
    pub const fn new(permits: usize) -> Self {
        Self {
            permits: AtomicUsize::new(permits),
        }
    }

    /// Add one permit. Safe from interrupt context.
    pub fn signal(&self) {
        self.permits.fetch_add(1, Ordering::Release);
    }

    /// Take one permit without blocking.
    pub fn try_wait(&self) -> bool {
        let mut current = self.permits.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.permits.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Block until a permit is available.
    pub fn wait(&self) {
        while !self.try_wait() {
            core::hint::spin_loop();
        }
    }

    pub fn permits(&self) -> usize {
        self.permits.load(Ordering::Acquire)
    }
}

const SLOT_PENDING: u8 = 0;
const SLOT_OK: u8 = 1;
const SLOT_FAILED: u8 = 2;

/// One-shot completion slot for blocking resolutions (`ping`, `lookup`,
/// `connect`).
///
/// The first `complete` wins; later calls are ignored. Multiple waiters
/// may share one slot through an `Arc` (two lookups for the same name
/// wait on the same resolution).
pub struct SignalSlot {
    state: AtomicU8,
}

impl SignalSlot {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(SLOT_PENDING),
        }
    }

    /// Resolve the slot. `true` wakes waiters with success, `false` with
    /// failure.
    pub fn complete(&self, ok: bool) {
        let outcome = if ok { SLOT_OK } else { SLOT_FAILED };
        let _ = self.state.compare_exchange(
            SLOT_PENDING,
            outcome,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Block until the slot resolves; returns the outcome.
    pub fn wait(&self) -> bool {
        loop {
            match self.state.load(Ordering::Acquire) {
                SLOT_OK => return true,
                SLOT_FAILED => return false,
                _ => core::hint::spin_loop(),
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == SLOT_PENDING
    }
}

impl Default for SignalSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semaphore_counts_signals() {
        let sem = Semaphore::new(0);
        assert!(!sem.try_wait());

        sem.signal();
        sem.signal();
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }

    #[test]
    fn signal_slot_first_completion_wins() {
        let slot = SignalSlot::new();
        assert!(slot.is_pending());

        slot.complete(false);
        slot.complete(true);
        assert!(!slot.wait());
    }
}

use atomic::{Atomic, Ordering};

use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;

/// Lock-free bump-pointer state over one contiguous chunk:
/// `start <= top <= end <= hard_end`. `end` is the soft limit, kept
/// `headroom` bytes short of the hard limit so a leftover span can always
/// receive a dead-object filler. The fast path is a pure CAS retry loop on
/// `top`; repositioning (refill, retirement) happens elsewhere under a lock
/// and simply makes the CAS loop succeed again.
pub struct AtomicBumpPointerAllocator {
    start: Atomic<Address>,
    top: Atomic<Address>,
    end: Atomic<Address>,
    hard_end: Atomic<Address>,
    headroom: usize,
}

impl AtomicBumpPointerAllocator {
    pub fn new(headroom: usize) -> Self {
        Self {
            start: Atomic::new(Address::ZERO),
            top: Atomic::new(Address::ZERO),
            end: Atomic::new(Address::ZERO),
            hard_end: Atomic::new(Address::ZERO),
            headroom,
        }
    }

    pub fn start(&self) -> Address {
        self.start.load(Ordering::Relaxed)
    }

    pub fn top(&self) -> Address {
        self.top.load(Ordering::SeqCst)
    }

    pub fn end(&self) -> Address {
        self.end.load(Ordering::SeqCst)
    }

    pub fn hard_limit(&self) -> Address {
        self.hard_end.load(Ordering::SeqCst)
    }

    pub fn headroom(&self) -> usize {
        self.headroom
    }

    /// Bytes still allocatable up to the hard limit.
    pub fn free_space(&self) -> usize {
        self.hard_limit() - self.top()
    }

    pub fn in_current_chunk(&self, addr: Address) -> bool {
        addr >= self.start() && addr < self.hard_limit()
    }

    pub fn reset(&self) {
        self.start.store(Address::ZERO, Ordering::SeqCst);
        self.top.store(Address::ZERO, Ordering::SeqCst);
        self.end.store(Address::ZERO, Ordering::SeqCst);
        self.hard_end.store(Address::ZERO, Ordering::SeqCst);
    }

    /// Install `[chunk, chunk + size)` as the current chunk. Callers hold
    /// the refill lock. The soft limit is zeroed first so every racing
    /// fast-path attempt fails while the other fields are inconsistent,
    /// and republished last.
    pub fn refill(&self, chunk: Address, size: usize) {
        debug_assert!(!chunk.is_zero());
        debug_assert!(size > self.headroom);
        debug_assert!(chunk.is_aligned_to(BYTES_IN_WORD));
        self.end.store(Address::ZERO, Ordering::SeqCst);
        let hard = chunk + size;
        self.start.store(chunk, Ordering::SeqCst);
        self.hard_end.store(hard, Ordering::SeqCst);
        self.top.store(chunk, Ordering::SeqCst);
        self.end.store(hard - self.headroom, Ordering::SeqCst);
    }

    /// One CAS attempt sequence: allocate `size` bytes if they fit below
    /// the soft limit, or return [`Address::ZERO`] so the caller can enter
    /// its slow path. Losing a race retries internally; only genuine
    /// exhaustion returns zero.
    pub fn try_allocate(&self, size: usize) -> Address {
        loop {
            let cell = self.top.load(Ordering::SeqCst);
            let new_top = cell + size;
            if new_top > self.end.load(Ordering::SeqCst) {
                return Address::ZERO;
            }
            if self
                .top
                .compare_exchange(cell, new_top, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return cell;
            }
        }
    }

    /// Push `top` to the hard limit, forcing every racing fast-path thread
    /// to the slow-path synchronization point, and return the previous top
    /// (the start of the space left). Returns the hard limit itself when
    /// another thread already pushed it there.
    pub fn set_top_to_limit(&self) -> Address {
        let hard = self.hard_limit();
        loop {
            let current = self.top.load(Ordering::SeqCst);
            if current == hard {
                return hard;
            }
            if self
                .top
                .compare_exchange(current, hard, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return current;
            }
        }
    }
}

use atomic::{Atomic, Ordering};
use std::sync::Arc;

use crate::util::constants::BYTES_IN_PAGE;
use crate::util::Address;
use crate::vm::VirtualMemory;

/// A contiguous stretch of reserved address space with a committed prefix.
/// Growth commits more of the reserve through the memory capability;
/// shrinking is not attempted (evacuation would be needed to release the
/// tail safely).
pub struct ContiguousHeapSpace {
    memory: Arc<dyn VirtualMemory>,
    start: Address,
    committed_end: Atomic<Address>,
    reserved_end: Address,
}

impl ContiguousHeapSpace {
    /// Wrap an already reserved range `[start, start + max_size)`.
    pub fn new(memory: Arc<dyn VirtualMemory>, start: Address, max_size: usize) -> Self {
        debug_assert!(start.is_aligned_to(BYTES_IN_PAGE));
        Self {
            memory,
            start,
            committed_end: Atomic::new(start),
            reserved_end: start + max_size,
        }
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn committed_end(&self) -> Address {
        self.committed_end.load(Ordering::Relaxed)
    }

    pub fn reserved_end(&self) -> Address {
        self.reserved_end
    }

    pub fn committed_size(&self) -> usize {
        self.committed_end() - self.start
    }

    pub fn capacity(&self) -> usize {
        self.reserved_end - self.start
    }

    pub fn in_committed_space(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.committed_end()
    }

    /// Clamp a growth request to the page-aligned space left in the
    /// reserve. Returns 0 when the reserve is exhausted.
    pub fn adjust_growth(&self, delta: usize) -> usize {
        let aligned = crate::util::conversions::raw_align_up(delta, BYTES_IN_PAGE);
        aligned.min(self.reserved_end - self.committed_end())
    }

    /// Commit `delta` more bytes (must fit the reserve). Returns false when
    /// the memory capability refuses.
    pub fn grow_committed_space(&self, delta: usize) -> bool {
        debug_assert!(delta % BYTES_IN_PAGE == 0);
        let from = self.committed_end();
        debug_assert!(from + delta <= self.reserved_end);
        if !self.memory.commit(from, delta) {
            return false;
        }
        self.committed_end.store(from + delta, Ordering::Relaxed);
        debug!(
            "committed {} bytes, committed space now {} bytes",
            delta,
            self.committed_size()
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::ArenaMemory;

    #[test]
    fn grow_within_reserve() {
        let memory: Arc<dyn VirtualMemory> = Arc::new(ArenaMemory::default());
        let start = memory.reserve(64 * BYTES_IN_PAGE).align_up(BYTES_IN_PAGE);
        let space = ContiguousHeapSpace::new(memory, start, 32 * BYTES_IN_PAGE);
        assert_eq!(space.committed_size(), 0);
        assert!(!space.in_committed_space(start));
        assert!(space.grow_committed_space(space.adjust_growth(5000)));
        assert_eq!(space.committed_size(), 2 * BYTES_IN_PAGE);
        assert!(space.in_committed_space(start));
        // Growth clamps to the reserve.
        let remaining = space.adjust_growth(usize::MAX / 2);
        assert_eq!(remaining, 30 * BYTES_IN_PAGE);
    }
}

use std::marker::PhantomData;
use std::sync::Mutex;

use crate::util::alloc::bump_pointer::AtomicBumpPointerAllocator;
use crate::util::alloc::refill::Refiller;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::heap::chunk::HeapFreeChunk;
use crate::util::{memory, Address};
use crate::vm::ObjectModel;

/// Bump-pointer allocator over a linear space, refilled by a pluggable
/// [`Refiller`]. Concurrent allocation is non-blocking: the fast path is a
/// CAS retry loop, and only threads that actually need a refill serialize
/// on `refill_lock` (a different lock than the CAS path, which keeps
/// racing fast-path allocations out of the refill critical section).
pub struct LinearSpaceAllocator<VM: ObjectModel, R: Refiller> {
    pub(crate) bump: AtomicBumpPointerAllocator,
    /// Requests above this are delegated to the refiller as "large" and
    /// never served from the linear space.
    size_limit: usize,
    pub(crate) refill_lock: Mutex<()>,
    pub(crate) refiller: R,
    _vm: PhantomData<VM>,
}

impl<VM: ObjectModel, R: Refiller> LinearSpaceAllocator<VM, R> {
    pub fn new(refiller: R, size_limit: usize) -> Self {
        Self {
            bump: AtomicBumpPointerAllocator::new(VM::MIN_OBJECT_SIZE),
            size_limit,
            refill_lock: Mutex::new(()),
            refiller,
            _vm: PhantomData,
        }
    }

    /// Install the initial chunk.
    pub fn initialize(&self, start: Address, size: usize) {
        self.bump.refill(start, size);
    }

    pub fn refiller(&self) -> &R {
        &self.refiller
    }

    /// An estimate of the bytes left in the current chunk.
    pub fn free_space(&self) -> usize {
        self.bump.free_space()
    }

    pub fn in_current_chunk(&self, addr: Address) -> bool {
        self.bump.in_current_chunk(addr)
    }

    fn is_large(&self, size: usize) -> bool {
        size > self.size_limit
    }

    /// Allocate `size` zeroed bytes.
    pub fn allocate_cleared(&self, size: usize) -> Address {
        let cell = self.allocate_raw(size);
        if !cell.is_zero() {
            memory::zero(cell, size);
        }
        cell
    }

    /// Allocate `size` bytes without clearing them.
    pub fn allocate_raw(&self, size: usize) -> Address {
        debug_assert!(size % BYTES_IN_WORD == 0);
        if self.is_large(size) {
            trace!("delegating large request of {} bytes", size);
            return self.refiller.allocate_large(size);
        }
        loop {
            let cell = self.bump.try_allocate(size);
            if !cell.is_zero() {
                return cell;
            }
            let cell = self.refill_or_allocate(size);
            if !cell.is_zero() {
                return cell;
            }
            // The allocator was repositioned (or we lost a race); take the
            // fast path again.
        }
    }

    /// Slow path. Returns a cell when the request was served out of band
    /// (exact fit to the hard limit, or overflow allocation), or
    /// [`Address::ZERO`] to send the caller back to the CAS loop.
    fn refill_or_allocate(&self, size: usize) -> Address {
        let _guard = self.refill_lock.lock().unwrap();
        // Serialized with other refillers only. Fast-path threads still
        // race with us for whatever is left in the allocator.
        let cell = self.bump.top();
        if cell + size <= self.bump.end() {
            // Another thread already refilled while we waited on the lock.
            return Address::ZERO;
        }
        let hard = self.bump.hard_limit();
        if cell + size == hard {
            // The request exactly consumes the space up to the hard limit,
            // headroom included. Claim it atomically; the leftover race is
            // still on.
            let start = self.bump.set_top_to_limit();
            if start == cell {
                return cell;
            }
        }
        let space_left = hard - self.bump.top();
        if self.refiller.should_refill(size, space_left) {
            // Bring every racing allocator to this synchronization point,
            // then retire the leftover and install a fresh chunk.
            let leftover = self.bump.set_top_to_limit();
            let leftover_size = hard - leftover;
            let chunk = self
                .refiller
                .allocate_refill(size, leftover, leftover_size);
            if !chunk.is_zero() {
                let chunk_size = HeapFreeChunk::size(chunk);
                trace!("refill: {} bytes at {}", chunk_size, chunk);
                self.bump.refill(chunk, chunk_size);
            }
            Address::ZERO
        } else {
            // Refill refused; the space left in the allocator keeps
            // serving the fast path while this request goes to the
            // overflow allocator.
            self.refiller.allocate_overflow(size)
        }
    }

    /// Retire the current chunk into a walkable state by filling the
    /// remaining space with dead matter. The allocator is left full; the
    /// next allocation refills it.
    pub fn make_parsable(&self) {
        let _guard = self.refill_lock.lock().unwrap();
        let hard = self.bump.hard_limit();
        let leftover = self.bump.set_top_to_limit();
        if leftover < hard {
            VM::fill_dead(leftover, hard);
        }
        self.refiller.do_before_gc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::MockVM;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Records which refiller entry points fire; refills from a fixed pool
    /// of chunks.
    struct TestRefiller {
        refill_threshold: usize,
        chunks: Mutex<Vec<(Address, usize)>>,
        refills: AtomicUsize,
        overflows: AtomicUsize,
    }

    impl TestRefiller {
        fn new(refill_threshold: usize, chunks: Vec<(Address, usize)>) -> Self {
            Self {
                refill_threshold,
                chunks: Mutex::new(chunks),
                refills: AtomicUsize::new(0),
                overflows: AtomicUsize::new(0),
            }
        }
    }

    impl Refiller for TestRefiller {
        fn should_refill(&self, _requested: usize, space_left: usize) -> bool {
            space_left < self.refill_threshold
        }
        fn allocate_refill(
            &self,
            _requested: usize,
            leftover: Address,
            leftover_size: usize,
        ) -> Address {
            crate::util::alloc::refill::retire_chunk::<MockVM>(leftover, leftover_size, 64);
            self.refills.fetch_add(1, Ordering::SeqCst);
            match self.chunks.lock().unwrap().pop() {
                Some((addr, size)) => {
                    crate::util::heap::chunk::HeapFreeChunk::format(addr, size);
                    addr
                }
                None => Address::ZERO,
            }
        }
        fn allocate_large(&self, _size: usize) -> Address {
            Address::ZERO
        }
        fn allocate_overflow(&self, _size: usize) -> Address {
            self.overflows.fetch_add(1, Ordering::SeqCst);
            // Hand out a distinctive non-null sentinel cell.
            self.chunks
                .lock()
                .unwrap()
                .first()
                .map(|(a, _)| *a)
                .unwrap_or(Address::ZERO)
        }
        fn allocate_chunk_list(
            &self,
            _size: usize,
            _leftover: Address,
            _leftover_size: usize,
        ) -> Address {
            Address::ZERO
        }
        fn min_chunk_size(&self) -> usize {
            64
        }
    }

    fn aligned_backing(bytes: usize) -> (Vec<u8>, Address) {
        let v = vec![0u8; bytes + 16];
        let a = Address::from_ptr(v.as_ptr()).align_up(16);
        (v, a)
    }

    #[test]
    fn refill_refused_above_threshold() {
        // With 64 bytes as the refill threshold, a slow-path request that
        // finds 64 or more bytes still in the allocator is served from the
        // overflow allocator; the linear space keeps its leftover.
        let (_keep, base) = aligned_backing(256);
        let (_keep2, spare) = aligned_backing(1024);
        let refiller = TestRefiller::new(64, vec![(spare, 1024)]);
        let allocator = LinearSpaceAllocator::<MockVM, _>::new(refiller, 512);
        allocator.initialize(base, 256);

        // 256-byte chunk, 16 bytes headroom: the soft limit is at 240.
        assert_eq!(allocator.allocate_cleared(96), base);
        // 160 bytes left to the hard limit; a 176-byte request misses the
        // fast path but leaves enough space that refilling would waste it.
        let overflow_cell = allocator.allocate_cleared(176);
        assert_eq!(overflow_cell, spare);
        assert_eq!(allocator.refiller().overflows.load(Ordering::SeqCst), 1);
        assert_eq!(allocator.refiller().refills.load(Ordering::SeqCst), 0);
        // The leftover still serves the fast path.
        assert_eq!(allocator.allocate_cleared(64), base + 96usize);
    }

    #[test]
    fn refill_taken_below_threshold() {
        let (_keep, base) = aligned_backing(256);
        let (_keep2, spare) = aligned_backing(1024);
        let refiller = TestRefiller::new(64, vec![(spare, 1024)]);
        let allocator = LinearSpaceAllocator::<MockVM, _>::new(refiller, 512);
        allocator.initialize(base, 256);

        assert_eq!(allocator.allocate_cleared(208), base);
        // 48 bytes left (< 64): the allocator is refilled and the CAS loop
        // picks the new chunk up.
        let cell = allocator.allocate_cleared(64);
        assert_eq!(cell, spare);
        assert_eq!(allocator.refiller().refills.load(Ordering::SeqCst), 1);
        assert_eq!(allocator.refiller().overflows.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn exact_fit_consumes_headroom() {
        let (_keep, base) = aligned_backing(256);
        let refiller = TestRefiller::new(64, vec![]);
        let allocator = LinearSpaceAllocator::<MockVM, _>::new(refiller, 1024);
        allocator.initialize(base, 256);
        assert_eq!(allocator.allocate_cleared(128), base);
        // 128 left including headroom; an exact-fit request takes it all.
        assert_eq!(allocator.allocate_cleared(128), base + 128usize);
        assert_eq!(allocator.free_space(), 0);
        assert_eq!(allocator.refiller().refills.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_allocation_with_refills_is_disjoint() {
        const CHUNK: usize = 1 << 14;
        const NUM_CHUNKS: usize = 4;
        const CELL: usize = 64;
        let mut backings = vec![];
        let mut pool = vec![];
        for _ in 0..NUM_CHUNKS {
            let (keep, base) = aligned_backing(CHUNK);
            backings.push(keep);
            pool.push((base, CHUNK));
        }
        let (first, rest) = pool.split_first().unwrap();
        let refiller = TestRefiller::new(CELL, rest.to_vec());
        let allocator = Arc::new(LinearSpaceAllocator::<MockVM, _>::new(refiller, CHUNK));
        allocator.initialize(first.0, CHUNK);

        let mut handles = vec![];
        for _ in 0..4 {
            let allocator = allocator.clone();
            handles.push(std::thread::spawn(move || {
                let mut cells = vec![];
                for _ in 0..(NUM_CHUNKS * CHUNK) / (CELL * 8) {
                    let cell = allocator.allocate_cleared(CELL);
                    if cell.is_zero() {
                        break;
                    }
                    cells.push(cell);
                }
                cells
            }));
        }
        let mut all: Vec<Address> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total, "cells must be pairwise disjoint");
        for cell in &all {
            assert!(backings.iter().any(|b| {
                let start = Address::from_ptr(b.as_ptr());
                *cell >= start && *cell + CELL <= start + b.len()
            }));
        }
    }
}

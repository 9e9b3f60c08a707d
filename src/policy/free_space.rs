//! Free heap space management over a contiguous committed space.
//!
//! Reclaimed space is recorded into a vector of free-chunk lists ("bins")
//! segregated by chunk size. Bin 0 holds chunks below the first-bin size
//! and primarily feeds TLAB allocation; the other bins serve refills and
//! large-object requests. Ordinary allocation goes through a bump-pointer
//! allocator refilled from the bins; bin operations are synchronized.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::policy::contiguous::ContiguousHeapSpace;
use crate::sweep::{AfterMarkSweepVerifier, Sweeper};
use crate::util::alloc::refill::{retire_chunk, Refiller};
use crate::util::alloc::MultiChunkTlabAllocator;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::heap::chunk::HeapFreeChunk;
use crate::util::Address;
use crate::vm::{GcCallback, ObjectModel, VirtualMemory};

/// Index of the last bin. Chunks of size in `[2^(i-1+log2_first_bin),
/// 2^(i+log2_first_bin))` land in bin `i`; everything at or above the last
/// bin threshold lands in the last bin.
pub const LAST_BIN: usize = 10;
const NUM_BINS: usize = LAST_BIN + 1;

/// Collections to attempt for one allocation before declaring the retry
/// loop stuck.
const MAX_GC_RETRIES: usize = 5;

#[derive(Clone, Copy)]
pub struct FreeSpaceOptions {
    /// Minimum size treated as a large object: requests at or above bypass
    /// the linear allocator, and the allocator is refilled with chunks of
    /// this size. Must be a power of two.
    pub min_large_object_size: usize,
    /// Minimum size worth recording as a free chunk; smaller gaps are dark
    /// matter. Also the minimum acceptable TLAB chunk.
    pub min_reclaimable_space: usize,
    /// Refill the linear allocator when less than this is left in it.
    pub refill_threshold: usize,
}

impl Default for FreeSpaceOptions {
    fn default() -> Self {
        Self {
            min_large_object_size: 64 * 1024,
            min_reclaimable_space: 256,
            refill_threshold: 64 * BYTES_IN_WORD,
        }
    }
}

/// One free-chunk list. Chunks are appended only during sweeping, so the
/// entries are ordered from low to high addresses (the sweeper discovers
/// them in address order).
struct FreeSpaceList {
    head: Address,
    last: Address,
    total_size: usize,
    total_chunks: usize,
}

impl FreeSpaceList {
    const fn new() -> Self {
        Self {
            head: Address::ZERO,
            last: Address::ZERO,
            total_size: 0,
            total_chunks: 0,
        }
    }

    fn reset(&mut self) {
        self.head = Address::ZERO;
        self.last = Address::ZERO;
        self.total_size = 0;
        self.total_chunks = 0;
    }

    fn append_chunk(&mut self, chunk: Address, size: usize) {
        if self.last.is_zero() {
            self.head = chunk;
        } else {
            HeapFreeChunk::set_next(self.last, chunk);
        }
        self.last = chunk;
        self.total_size += size;
        self.total_chunks += 1;
    }

    /// Format and append a fresh chunk.
    fn append(&mut self, chunk: Address, size: usize) {
        HeapFreeChunk::format(chunk, size);
        self.append_chunk(chunk, size);
    }

    /// Append a chunk that already carries a header.
    fn append_formatted(&mut self, chunk: Address) {
        HeapFreeChunk::set_next(chunk, Address::ZERO);
        self.append_chunk(chunk, HeapFreeChunk::size(chunk));
    }

    fn remove(&mut self, prev: Address, chunk: Address) {
        self.total_chunks -= 1;
        self.total_size -= HeapFreeChunk::size(chunk);
        let next = HeapFreeChunk::next(chunk);
        if prev.is_zero() {
            self.head = next;
        } else {
            HeapFreeChunk::set_next(prev, next);
        }
        HeapFreeChunk::set_next(chunk, Address::ZERO);
        if self.last == chunk {
            self.last = prev;
        }
        if cfg!(debug_assertions) || cfg!(feature = "extreme_assertions") {
            assert!(
                self.total_chunks != 0
                    || (self.total_size == 0 && self.head.is_zero() && self.last.is_zero()),
                "inconsistent free list state"
            );
        }
    }

    fn can_fit(&self, size: usize, min_object_size: usize) -> bool {
        let space_with_headroom = size + min_object_size;
        let mut chunk = self.head;
        while !chunk.is_zero() {
            let chunk_size = HeapFreeChunk::size(chunk);
            if space_with_headroom < chunk_size || chunk_size == size {
                return true;
            }
            chunk = HeapFreeChunk::next(chunk);
        }
        false
    }

    /// Take enough chunks off the head of the list to cover `size` bytes.
    /// Imprecise: the last chunk is not split, so the result may carry
    /// more than requested. Callers check `total_size > size` first.
    fn allocate_chunks(&mut self, size: usize) -> (Address, usize) {
        debug_assert!(!self.head.is_zero());
        let mut allocated = 0;
        let mut num_chunks = 0;
        let mut last_chunk = Address::ZERO;
        let mut cursor = self.head;
        while !cursor.is_zero() {
            allocated += HeapFreeChunk::size(cursor);
            num_chunks += 1;
            last_chunk = cursor;
            if allocated >= size {
                break;
            }
            cursor = HeapFreeChunk::next(cursor);
        }
        let result = self.head;
        self.head = HeapFreeChunk::next(last_chunk);
        HeapFreeChunk::set_next(last_chunk, Address::ZERO);
        self.total_chunks -= num_chunks;
        self.total_size -= allocated;
        if self.last == last_chunk {
            debug_assert!(self.total_chunks == 0, "list tail out of sync");
            self.last = Address::ZERO;
        }
        (result, allocated)
    }

    fn make_parsable<VM: ObjectModel>(&mut self) {
        if !self.head.is_zero() {
            HeapFreeChunk::make_parsable::<VM>(self.head);
            self.reset();
        }
    }
}

/// The segregated bins plus their accounting, guarded by one mutex.
struct Bins<VM: ObjectModel> {
    lists: [FreeSpaceList; NUM_BINS],
    /// Total space in free chunks. Excludes space already handed to the
    /// linear allocator.
    total_free: usize,
    min_reclaimable: usize,
    log2_first_bin_size: u32,
    last_bin_threshold: usize,
    _vm: PhantomData<VM>,
}

impl<VM: ObjectModel> Bins<VM> {
    fn new(options: &FreeSpaceOptions) -> Self {
        debug_assert!(options.min_large_object_size.is_power_of_two());
        let log2_first_bin_size = options.min_large_object_size.trailing_zeros();
        Self {
            lists: std::array::from_fn(|_| FreeSpaceList::new()),
            total_free: 0,
            min_reclaimable: options.min_reclaimable_space,
            log2_first_bin_size,
            last_bin_threshold: 1 << (LAST_BIN as u32 + log2_first_bin_size),
            _vm: PhantomData,
        }
    }

    /// log2-based bin indexing: chunks sharing the most significant bit of
    /// `size >> log2_first_bin_size` share a bin.
    fn bin_index(&self, size: usize) -> usize {
        if size >= self.last_bin_threshold {
            return LAST_BIN;
        }
        let shifted = size >> self.log2_first_bin_size;
        if shifted == 0 {
            0
        } else {
            (usize::BITS - 1 - shifted.leading_zeros()) as usize + 1
        }
    }

    fn record(&mut self, chunk: Address, size: usize) {
        let index = self.bin_index(size);
        self.lists[index].append(chunk, size);
        self.total_free += size;
    }

    /// First-fit allocation from the list at `index`. Space left over is
    /// re-entered into the matching bin, or dismissed as dark matter when
    /// below the reclaimable minimum. With `exact_fit` false the whole
    /// chunk is returned, header intact, for allocator refills.
    fn allocate_first_fit(&mut self, index: usize, size: usize, exact_fit: bool) -> Address {
        let space_with_headroom = size + VM::MIN_OBJECT_SIZE;
        let mut prev = Address::ZERO;
        let mut chunk = self.lists[index].head;
        while !chunk.is_zero() {
            let chunk_size = HeapFreeChunk::size(chunk);
            if chunk_size >= space_with_headroom {
                let mut result = chunk;
                if !exact_fit {
                    self.total_free -= chunk_size;
                    self.lists[index].remove(prev, chunk);
                    return result;
                }
                let space_left = chunk_size - size;
                if space_left >= self.min_reclaimable {
                    // Allocate at the end of the chunk so the leftover
                    // needs no reformatting if it stays in the same bin.
                    result = chunk + space_left;
                    let new_index = self.bin_index(space_left);
                    if new_index == index {
                        HeapFreeChunk::set_size(chunk, space_left);
                        self.lists[index].total_size -= size;
                        self.total_free -= size;
                        return result;
                    }
                    self.lists[index].remove(prev, chunk);
                    HeapFreeChunk::set_size(chunk, space_left);
                    self.lists[new_index].append_formatted(chunk);
                    self.total_free -= size;
                } else {
                    // The sliver is unusable; the chunk goes out whole and
                    // the tail becomes dark matter.
                    self.total_free -= chunk_size;
                    self.lists[index].remove(prev, chunk);
                    VM::fill_dead(chunk + size, chunk + chunk_size);
                }
                return result;
            } else if chunk_size == size {
                self.total_free -= size;
                self.lists[index].remove(prev, chunk);
                return chunk;
            }
            prev = chunk;
            chunk = HeapFreeChunk::next(chunk);
        }
        Address::ZERO
    }

    /// Search from `first_index` upward. Any chunk in a higher bin is large
    /// enough to hold the request.
    fn try_allocate(&mut self, first_index: usize, size: usize, exact_fit: bool) -> Address {
        for index in first_index..NUM_BINS {
            if !self.lists[index].head.is_zero() {
                let result = self.allocate_first_fit(index, size, exact_fit);
                if !result.is_zero() {
                    self.check_accounting();
                    return result;
                }
            }
        }
        Address::ZERO
    }

    fn check_accounting(&self) {
        if cfg!(debug_assertions) || cfg!(feature = "extreme_assertions") {
            let in_lists: usize = self.lists.iter().map(|l| l.total_size).sum();
            assert!(
                in_lists == self.total_free,
                "inconsistent free space counts: bins {} vs total {}",
                in_lists,
                self.total_free
            );
        }
    }
}

/// Shared bin state plus the GC callback; the refiller and the manager
/// both point here.
struct BinSpace<VM: ObjectModel> {
    bins: Mutex<Bins<VM>>,
    /// Whether TLAB requests should be served straight from bin 0.
    use_tlab_bin: AtomicBool,
    gc: Arc<dyn GcCallback>,
    min_reclaimable: usize,
}

impl<VM: ObjectModel> BinSpace<VM> {
    fn update_use_tlab_bin(&self, bins: &Bins<VM>) {
        self.use_tlab_bin
            .store(bins.lists[0].total_size > 0, Ordering::Relaxed);
    }

    fn record_free_space(&self, chunk: Address, size: usize) {
        let mut bins = self.bins.lock().unwrap();
        bins.record(chunk, size);
    }

    fn free_chunk_space(&self) -> usize {
        self.bins.lock().unwrap().total_free
    }

    /// Allocation with collection retries. The bins lock is released
    /// around the GC callback. Exhaustion after a failed collection is an
    /// unrecoverable out-of-memory condition.
    fn bin_allocate(&self, first_index: usize, size: usize, exact_fit: bool) -> Address {
        let mut gc_count = 0;
        loop {
            {
                let mut bins = self.bins.lock().unwrap();
                let result = bins.try_allocate(first_index, size, exact_fit);
                if !result.is_zero() {
                    return result;
                }
            }
            gc_count += 1;
            debug!(
                "allocation failure: first bin {}, size {}, {} fit, gc attempt {}",
                first_index,
                size,
                if exact_fit { "exact" } else { "loose" },
                gc_count
            );
            assert!(
                gc_count <= MAX_GC_RETRIES,
                "suspicious repeating GC calls for {} bytes",
                size
            );
            if !self.gc.collect_garbage(size) {
                panic!("out of memory: no progress after GC, {} bytes requested", size);
            }
        }
    }

    /// Retire the allocator leftover, then produce a refill chunk of at
    /// least `refill_size` (loose fit, header intact).
    fn bin_refill(&self, refill_size: usize, leftover: Address, leftover_size: usize) -> Address {
        {
            let mut bins = self.bins.lock().unwrap();
            if leftover_size >= self.min_reclaimable {
                bins.record(leftover, leftover_size);
            } else if leftover_size > 0 {
                VM::fill_dead(leftover, leftover + leftover_size);
            }
            self.update_use_tlab_bin(&bins);
        }
        self.bin_allocate(1, refill_size, false)
    }

    /// Allocate a TLAB from the segregated lists, preferring bin 0, which
    /// may yield several non-contiguous chunks. `first_chunk` (if any) is
    /// an already retired chunk that becomes the head of the TLAB.
    fn bin_allocate_tlab(&self, mut size: usize, first_chunk: Address) -> Address {
        {
            let mut bins = self.bins.lock().unwrap();
            if bins.lists[0].total_size > size {
                let (result, allocated) = bins.lists[0].allocate_chunks(size);
                bins.total_free -= allocated;
                bins.check_accounting();
                self.update_use_tlab_bin(&bins);
                if first_chunk.is_zero() {
                    return result;
                }
                HeapFreeChunk::set_next(first_chunk, result);
                return first_chunk;
            }
            // Past this point a GC may run, which would invalidate
            // `first_chunk`; simplest is to return it to the pool.
            if !first_chunk.is_zero() {
                let size = HeapFreeChunk::size(first_chunk);
                bins.record(first_chunk, size);
            }
            let initial_chunks = bins.lists[0].head;
            if !initial_chunks.is_zero() {
                // Drain bin 0 entirely; TLAB allocation leaves it alone
                // until the next sweep refills it.
                let bin_total = bins.lists[0].total_size;
                debug_assert!(bin_total <= size);
                size -= bin_total;
                bins.total_free -= bin_total;
                bins.lists[0].reset();
                if size > self.min_reclaimable {
                    let additional = bins.try_allocate(1, size, true);
                    if !additional.is_zero() {
                        HeapFreeChunk::format_with_next(additional, size, initial_chunks);
                        self.update_use_tlab_bin(&bins);
                        return additional;
                    }
                }
                bins.check_accounting();
                self.use_tlab_bin.store(false, Ordering::Relaxed);
                return initial_chunks;
            }
        }
        // Bin 0 is empty; fall back to an exact-fit allocation with GC
        // retries.
        let result = self.bin_allocate(1, size, true);
        let bins = self.bins.lock().unwrap();
        self.update_use_tlab_bin(&bins);
        result
    }
}

/// Refill manager wired to the bins.
pub struct BinRefiller<VM: ObjectModel> {
    space: Arc<BinSpace<VM>>,
    refill_size: usize,
    refill_threshold: usize,
    min_chunk_size: usize,
}

impl<VM: ObjectModel> Refiller for BinRefiller<VM> {
    fn should_refill(&self, _requested: usize, space_left: usize) -> bool {
        space_left < self.refill_threshold
    }

    fn allocate_refill(
        &self,
        _requested: usize,
        leftover: Address,
        leftover_size: usize,
    ) -> Address {
        self.space.bin_refill(self.refill_size, leftover, leftover_size)
    }

    fn allocate_large(&self, size: usize) -> Address {
        let first_index = self.space.bins.lock().unwrap().bin_index(size);
        self.space.bin_allocate(first_index, size, true)
    }

    fn allocate_overflow(&self, size: usize) -> Address {
        let first_index = self.space.bins.lock().unwrap().bin_index(size);
        self.space.bin_allocate(first_index, size, true)
    }

    fn allocate_chunk_list(
        &self,
        mut size: usize,
        leftover: Address,
        leftover_size: usize,
    ) -> Address {
        let first_chunk = retire_chunk::<VM>(leftover, leftover_size, self.min_chunk_size);
        if !first_chunk.is_zero() {
            size = size.saturating_sub(leftover_size);
            if size < self.min_chunk_size {
                return first_chunk;
            }
        }
        self.space.bin_allocate_tlab(size, first_chunk)
    }

    fn min_chunk_size(&self) -> usize {
        self.min_chunk_size
    }
}

/// The free heap space manager: a contiguous committed space, a
/// TLAB-capable bump allocator, and the segregated free-chunk bins the
/// sweeper rebuilds after every collection.
pub struct FreeHeapSpaceManager<VM: ObjectModel> {
    committed: ContiguousHeapSpace,
    space: Arc<BinSpace<VM>>,
    allocator: MultiChunkTlabAllocator<VM, BinRefiller<VM>>,
    min_reclaimable: usize,
    /// End of the last live object or recorded gap; precise-sweep cursor.
    end_of_last_visited: Address,
}

impl<VM: ObjectModel> FreeHeapSpaceManager<VM> {
    pub fn new(
        memory: Arc<dyn VirtualMemory>,
        start: Address,
        init_size: usize,
        max_size: usize,
        gc: Arc<dyn GcCallback>,
        options: FreeSpaceOptions,
    ) -> Self {
        let committed = ContiguousHeapSpace::new(memory, start, max_size);
        assert!(
            committed.grow_committed_space(committed.adjust_growth(init_size)),
            "committing the initial heap space must succeed"
        );
        let space = Arc::new(BinSpace {
            bins: Mutex::new(Bins::<VM>::new(&options)),
            use_tlab_bin: AtomicBool::new(false),
            gc,
            min_reclaimable: options.min_reclaimable_space,
        });
        let refiller = BinRefiller {
            space: space.clone(),
            refill_size: options.min_large_object_size,
            refill_threshold: options.refill_threshold,
            min_chunk_size: options.min_reclaimable_space,
        };
        let allocator = MultiChunkTlabAllocator::new(refiller, options.min_large_object_size);
        allocator.initialize(start, committed.committed_size());
        Self {
            committed,
            space,
            allocator,
            min_reclaimable: options.min_reclaimable_space,
            end_of_last_visited: start,
        }
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.committed.in_committed_space(addr)
    }

    pub fn total_space(&self) -> usize {
        self.committed.committed_size()
    }

    pub fn capacity(&self) -> usize {
        self.committed.capacity()
    }

    /// Estimated free bytes: chunk space plus what is left in the linear
    /// allocator.
    pub fn free_space(&self) -> usize {
        self.space.free_chunk_space() + self.allocator.free_space()
    }

    pub fn used_space(&self) -> usize {
        self.total_space() - self.free_space()
    }

    pub fn allocate(&self, size: usize) -> Address {
        self.allocator.allocate_cleared(size)
    }

    pub fn allocate_tlab(&self, size: usize) -> Address {
        if self.space.use_tlab_bin.load(Ordering::Relaxed) {
            self.space.bin_allocate_tlab(size, Address::ZERO)
        } else {
            self.allocator.allocate_tlab(size)
        }
    }

    /// A retired TLAB is simply filled with dead matter.
    pub fn retire_tlab(&self, start: Address, size: usize) {
        VM::fill_dead(start, start + size);
    }

    pub fn can_satisfy_allocation(&self, size: usize) -> bool {
        let bins = self.space.bins.lock().unwrap();
        let first_index = bins.bin_index(size);
        (first_index..NUM_BINS)
            .any(|i| !bins.lists[i].head.is_zero() && bins.lists[i].can_fit(size, VM::MIN_OBJECT_SIZE))
    }

    /// Retire the allocator and every bin into walkable dead matter so the
    /// whole committed space can be parsed cell by cell.
    pub fn make_parsable(&self) {
        self.allocator.make_parsable();
        let mut bins = self.space.bins.lock().unwrap();
        for list in bins.lists.iter_mut() {
            list.make_parsable::<VM>();
        }
        bins.total_free = 0;
        self.space.use_tlab_bin.store(false, Ordering::Relaxed);
    }

    /// Grow the committed space, recording the growth as one free chunk.
    /// Returns the effective growth.
    pub fn increase_size(&self, delta: usize) -> usize {
        let adjusted = self.committed.adjust_growth(delta);
        if adjusted == 0 {
            return 0;
        }
        let chunk_start = self.committed.committed_end();
        assert!(
            self.committed.grow_committed_space(adjusted),
            "committing over reserved space should always succeed"
        );
        self.space.record_free_space(chunk_start, adjusted);
        adjusted
    }

    /// Shrinking needs evacuation or region support; not attempted here.
    pub fn decrease_size(&self, _delta: usize) -> usize {
        0
    }

    pub fn verify(&self, verifier: &mut AfterMarkSweepVerifier<'_, VM>) {
        verifier.visit_cells(self.committed.start(), self.committed.committed_end());
        self.verify_usage(
            verifier.free_chunks_bytes,
            verifier.dark_matter_bytes,
            verifier.live_data_bytes,
        );
    }

    fn verify_usage(&self, free_chunks: usize, dark_matter: usize, live_data: usize) {
        let total_free = self.space.free_chunk_space();
        assert!(
            free_chunks == total_free,
            "inconsistent free chunk space: walked {} vs recorded {}",
            free_chunks,
            total_free
        );
        let total = free_chunks + dark_matter + live_data;
        assert!(
            total == self.committed.committed_size(),
            "inconsistent committed space: walked {} vs committed {}",
            total,
            self.committed.committed_size()
        );
    }
}

impl<VM: ObjectModel> Sweeper for FreeHeapSpaceManager<VM> {
    fn begin_sweep(&mut self, _precise: bool) -> usize {
        let mut bins = self.space.bins.lock().unwrap();
        for list in bins.lists.iter_mut() {
            list.reset();
        }
        bins.total_free = 0;
        self.end_of_last_visited = self.committed.start();
        self.min_reclaimable
    }

    fn process_live_object(&mut self, cell: Address) -> Address {
        let dead_space = cell - self.end_of_last_visited;
        if dead_space >= self.min_reclaimable {
            self.space
                .record_free_space(self.end_of_last_visited, dead_space);
        }
        self.end_of_last_visited = cell + VM::size_of(cell);
        self.end_of_last_visited
    }

    fn process_large_gap(&mut self, left: Address, right: Address) -> Address {
        let end_of_left = left + VM::size_of(left);
        let num_dead_bytes = right - end_of_left;
        if num_dead_bytes >= self.min_reclaimable {
            self.space.record_free_space(end_of_left, num_dead_bytes);
        }
        self.end_of_last_visited = right + VM::size_of(right);
        self.end_of_last_visited
    }

    fn process_dead_space(&mut self, start: Address, size: usize) {
        self.space.record_free_space(start, size);
        self.end_of_last_visited = start + size;
    }

    fn end_sweep(&mut self) -> usize {
        let bins = self.space.bins.lock().unwrap();
        self.space.update_use_tlab_bin(&bins);
        bins.check_accounting();
        debug!(
            "sweep rebuilt {} bytes of free chunks",
            bins.total_free
        );
        bins.total_free
    }

    fn start_of_sweeping_region(&self) -> Address {
        self.committed.start()
    }

    fn end_of_sweeping_region(&self) -> Address {
        self.committed.committed_end()
    }
}

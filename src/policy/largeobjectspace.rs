//! Large-object space: block-granular segregated free lists with a
//! bump-pointer tail.
//!
//! Free space is kept in lists indexed by exact block count, plus one
//! address-ordered list of "very large" chunks. A 64-bit summary word with
//! one bit per small list answers "is there a list with at least k blocks"
//! in O(1) via shift and trailing-zeros. Splits that would leave a
//! remainder below the minimum usable block count turn that remainder into
//! dark matter, withheld from allocation until the next sweep.

use atomic::{Atomic, Ordering};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crate::sweep::Sweeper;
use crate::util::conversions::{raw_align_down, raw_align_up};
use crate::util::heap::chunk::{DLinkedHeapFreeChunk, HeapFreeChunk};
use crate::util::Address;
use crate::vm::{GcCallback, ObjectModel};

/// log2 of the allocation block. Large-object space hands out whole
/// blocks.
pub const LOG_BLOCK_SIZE: usize = 11;
/// The allocation block: 2 KB.
pub const BLOCK_SIZE: usize = 1 << LOG_BLOCK_SIZE;
/// Smallest number of blocks a chunk may have and still be allocatable.
pub const MIN_NUM_BLOCKS: usize = 2;
/// Smallest request the space accepts.
pub const MIN_LARGE_OBJECT_SIZE: usize = MIN_NUM_BLOCKS * BLOCK_SIZE;
/// Chunks of at least this many blocks live in the very-large list.
pub const VERY_LARGE_CHUNK_LIST: usize = 32;
/// Byte size threshold of the very-large list: 64 KB.
pub const VERY_LARGE_CHUNK_SIZE: usize = VERY_LARGE_CHUNK_LIST << LOG_BLOCK_SIZE;

const NUM_LISTS: usize = VERY_LARGE_CHUNK_LIST + 1;
const MAX_GC_RETRIES: usize = 5;

static_assertions::const_assert!(VERY_LARGE_CHUNK_LIST < 64);

/// Doubly linked, address-ordered chunk list. Appends happen in sweep
/// order (strictly increasing addresses), which keeps the list sorted
/// without ever re-sorting.
struct ChunkList {
    head: Address,
    last: Address,
    total_chunks: usize,
    total_size: usize,
}

impl ChunkList {
    const fn new() -> Self {
        Self {
            head: Address::ZERO,
            last: Address::ZERO,
            total_chunks: 0,
            total_size: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.head.is_zero()
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    fn append(&mut self, chunk: Address, size: usize) {
        HeapFreeChunk::format(chunk, size);
        debug_assert!(
            self.last.is_zero() || self.last < chunk,
            "append out of order"
        );
        DLinkedHeapFreeChunk::link_between(chunk, self.last, Address::ZERO);
        if self.head.is_zero() {
            self.head = chunk;
        }
        self.last = chunk;
        self.total_chunks += 1;
        self.total_size += size;
    }

    fn remove(&mut self, chunk: Address) {
        let size = HeapFreeChunk::size(chunk);
        let (prev, next) = DLinkedHeapFreeChunk::unlink(chunk);
        if self.head == chunk {
            self.head = next;
        }
        if self.last == chunk {
            self.last = prev;
        }
        self.total_chunks -= 1;
        self.total_size -= size;
    }

    fn pop_head(&mut self) -> Address {
        let head = self.head;
        if !head.is_zero() {
            self.remove(head);
        }
        head
    }
}

/// Bump-pointer tail over the unswept end of the space: `top`/`end` with a
/// `real_end` past the soft limit. `end` is rounded down to the very-large
/// granularity; the sub-granule leftover `[end, real_end)` is only
/// reclaimed when the tail is retired into the lists.
struct TailAllocator {
    top: Atomic<Address>,
    end: Atomic<Address>,
    real_end: Atomic<Address>,
}

impl TailAllocator {
    fn new() -> Self {
        Self {
            top: Atomic::new(Address::ZERO),
            end: Atomic::new(Address::ZERO),
            real_end: Atomic::new(Address::ZERO),
        }
    }

    fn install(&self, start: Address, size: usize) {
        debug_assert!(size % BLOCK_SIZE == 0);
        self.end.store(Address::ZERO, Ordering::SeqCst);
        self.top.store(start, Ordering::SeqCst);
        self.real_end.store(start + size, Ordering::SeqCst);
        self.end.store(
            start + raw_align_down(size, VERY_LARGE_CHUNK_SIZE),
            Ordering::SeqCst,
        );
    }

    fn try_allocate(&self, bytes: usize) -> Address {
        loop {
            let cell = self.top.load(Ordering::SeqCst);
            let new_top = cell + bytes;
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

    /// Claim everything left up to `real_end` and reset. Returns the
    /// leftover span.
    fn retire(&self) -> (Address, usize) {
        let real_end = self.real_end.load(Ordering::SeqCst);
        self.end.store(Address::ZERO, Ordering::SeqCst);
        let top = self.top.swap(real_end, Ordering::SeqCst);
        if top.is_zero() || top >= real_end {
            (Address::ZERO, 0)
        } else {
            (top, real_end - top)
        }
    }

    fn free_space(&self) -> usize {
        let top = self.top.load(Ordering::SeqCst);
        let real_end = self.real_end.load(Ordering::SeqCst);
        if top.is_zero() || top >= real_end {
            0
        } else {
            real_end - top
        }
    }
}

struct LosLists {
    lists: [ChunkList; NUM_LISTS],
    /// Bit `i` set when the small list holding i-block chunks is
    /// non-empty.
    summary: u64,
    /// Blocks lost to dark-matter splits since the last sweep.
    unusable_blocks: usize,
}

impl LosLists {
    fn new() -> Self {
        Self {
            lists: std::array::from_fn(|_| ChunkList::new()),
            summary: 0,
            unusable_blocks: 0,
        }
    }

    fn reset(&mut self) {
        for list in self.lists.iter_mut() {
            list.reset();
        }
        self.summary = 0;
        self.unusable_blocks = 0;
    }

    fn total_free(&self) -> usize {
        self.lists.iter().map(|l| l.total_size).sum()
    }

    fn pop_from(&mut self, index: usize) -> Address {
        let chunk = self.lists[index].pop_head();
        if !chunk.is_zero() && index < VERY_LARGE_CHUNK_LIST && self.lists[index].is_empty() {
            self.summary &= !(1u64 << index);
        }
        chunk
    }

    /// File a block-aligned chunk of `num_blocks` blocks into the matching
    /// list; runt chunks become dark matter.
    fn file_chunk<VM: ObjectModel>(&mut self, chunk: Address, num_blocks: usize) {
        debug_assert!(chunk.is_aligned_to(BLOCK_SIZE));
        if num_blocks < MIN_NUM_BLOCKS {
            if num_blocks > 0 {
                VM::fill_dead(chunk, chunk + (num_blocks << LOG_BLOCK_SIZE));
                self.unusable_blocks += num_blocks;
            }
            return;
        }
        let index = num_blocks.min(VERY_LARGE_CHUNK_LIST);
        self.lists[index].append(chunk, num_blocks << LOG_BLOCK_SIZE);
        if index < VERY_LARGE_CHUNK_LIST {
            self.summary |= 1u64 << index;
        }
    }

    /// Exact list, then a clean split of a larger small list, then a split
    /// producing dark matter.
    fn allocate_from_small_lists<VM: ObjectModel>(&mut self, num_blocks: usize) -> Address {
        if num_blocks < VERY_LARGE_CHUNK_LIST {
            let chunk = self.pop_from(num_blocks);
            if !chunk.is_zero() {
                return chunk;
            }
        }
        // Nearest larger list whose split leaves a usable remainder.
        let clean_min = num_blocks + MIN_NUM_BLOCKS;
        if clean_min < VERY_LARGE_CHUNK_LIST {
            let candidates = self.summary >> clean_min;
            if candidates != 0 {
                let donor = clean_min + candidates.trailing_zeros() as usize;
                return self.split_allocate::<VM>(donor, num_blocks);
            }
        }
        // Allow a split whose remainder is dark matter.
        if num_blocks + 1 < VERY_LARGE_CHUNK_LIST {
            let candidates = self.summary >> (num_blocks + 1);
            if candidates != 0 {
                let donor = num_blocks + 1 + candidates.trailing_zeros() as usize;
                return self.split_allocate::<VM>(donor, num_blocks);
            }
        }
        Address::ZERO
    }

    /// Remove the head of `donor`, carve off the leading `num_blocks`, and
    /// re-file the remainder.
    fn split_allocate<VM: ObjectModel>(&mut self, donor: usize, num_blocks: usize) -> Address {
        let chunk = self.pop_from(donor);
        debug_assert!(!chunk.is_zero());
        self.file_chunk::<VM>(chunk + (num_blocks << LOG_BLOCK_SIZE), donor - num_blocks);
        chunk
    }

    /// First fit over the address-ordered very-large list.
    fn allocate_from_very_large<VM: ObjectModel>(&mut self, num_blocks: usize) -> Address {
        let bytes = num_blocks << LOG_BLOCK_SIZE;
        let mut chunk = self.lists[VERY_LARGE_CHUNK_LIST].head;
        while !chunk.is_zero() {
            let chunk_size = HeapFreeChunk::size(chunk);
            if chunk_size >= bytes {
                self.lists[VERY_LARGE_CHUNK_LIST].remove(chunk);
                let remainder_blocks = (chunk_size - bytes) >> LOG_BLOCK_SIZE;
                self.file_chunk::<VM>(chunk + bytes, remainder_blocks);
                return chunk;
            }
            chunk = HeapFreeChunk::next(chunk);
        }
        Address::ZERO
    }
}

/// The large-object space over `[start, end)`.
pub struct LargeObjectSpace<VM: ObjectModel> {
    start: Address,
    end: Address,
    lists: Mutex<LosLists>,
    tail: TailAllocator,
    gc: Arc<dyn GcCallback>,
    /// Precise-sweep cursor.
    end_of_last_visited: Address,
    _vm: PhantomData<VM>,
}

impl<VM: ObjectModel> LargeObjectSpace<VM> {
    pub fn new(start: Address, size: usize, gc: Arc<dyn GcCallback>) -> Self {
        debug_assert!(start.is_aligned_to(BLOCK_SIZE));
        debug_assert!(size % BLOCK_SIZE == 0);
        let space = Self {
            start,
            end: start + size,
            lists: Mutex::new(LosLists::new()),
            tail: TailAllocator::new(),
            gc,
            end_of_last_visited: start,
            _vm: PhantomData,
        };
        space.tail.install(start, size);
        space
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn free_space(&self) -> usize {
        self.lists.lock().unwrap().total_free() + self.tail.free_space()
    }

    /// Blocks written off as dark matter since the last sweep.
    pub fn unusable_blocks(&self) -> usize {
        self.lists.lock().unwrap().unusable_blocks
    }

    /// Allocate `size` bytes (rounded up to whole blocks).
    pub fn allocate(&self, size: usize) -> Address {
        let num_blocks = (raw_align_up(size, BLOCK_SIZE) >> LOG_BLOCK_SIZE).max(MIN_NUM_BLOCKS);
        let mut gc_count = 0;
        loop {
            let cell = self.try_allocate_blocks(num_blocks);
            if !cell.is_zero() {
                trace!("large object: {} blocks at {}", num_blocks, cell);
                return cell;
            }
            gc_count += 1;
            assert!(
                gc_count <= MAX_GC_RETRIES,
                "suspicious repeating GC calls for {} blocks",
                num_blocks
            );
            if !self.gc.collect_garbage(num_blocks << LOG_BLOCK_SIZE) {
                panic!(
                    "out of memory: large object space cannot provide {} blocks",
                    num_blocks
                );
            }
        }
    }

    fn try_allocate_blocks(&self, num_blocks: usize) -> Address {
        let mut lists = self.lists.lock().unwrap();
        let cell = lists.allocate_from_small_lists::<VM>(num_blocks);
        if !cell.is_zero() {
            return cell;
        }
        // Tail allocation fast path.
        let cell = self.tail.try_allocate(num_blocks << LOG_BLOCK_SIZE);
        if !cell.is_zero() {
            return cell;
        }
        // Retire the tail (including the sub-granule end) into the lists
        // and retry, then fall back to a very-large first fit.
        let (leftover, leftover_size) = self.tail.retire();
        if leftover_size > 0 {
            lists.file_chunk::<VM>(leftover, leftover_size >> LOG_BLOCK_SIZE);
        }
        let cell = lists.allocate_from_small_lists::<VM>(num_blocks);
        if !cell.is_zero() {
            return cell;
        }
        lists.allocate_from_very_large::<VM>(num_blocks)
    }

    /// Return a block-aligned span to the free lists.
    pub fn free(&self, addr: Address, size: usize) {
        debug_assert!(self.contains(addr));
        let mut lists = self.lists.lock().unwrap();
        Self::record_gap(&mut lists, addr, addr + size);
    }

    fn record_gap(lists: &mut LosLists, from: Address, to: Address) {
        let aligned_start = from.align_up(BLOCK_SIZE);
        let aligned_end = to.align_down(BLOCK_SIZE);
        if aligned_end > aligned_start {
            let blocks = (aligned_end - aligned_start) >> LOG_BLOCK_SIZE;
            lists.file_chunk::<VM>(aligned_start, blocks);
        }
    }
}

impl<VM: ObjectModel> Sweeper for LargeObjectSpace<VM> {
    fn begin_sweep(&mut self, _precise: bool) -> usize {
        self.lists.lock().unwrap().reset();
        // The tail is rebuilt from sweep notifications like everything
        // else.
        self.tail.retire();
        self.end_of_last_visited = self.start;
        MIN_LARGE_OBJECT_SIZE
    }

    fn process_live_object(&mut self, cell: Address) -> Address {
        let mut lists = self.lists.lock().unwrap();
        Self::record_gap(&mut lists, self.end_of_last_visited, cell);
        drop(lists);
        self.end_of_last_visited = cell + VM::size_of(cell);
        self.end_of_last_visited
    }

    fn process_large_gap(&mut self, left: Address, right: Address) -> Address {
        let end_of_left = left + VM::size_of(left);
        let mut lists = self.lists.lock().unwrap();
        Self::record_gap(&mut lists, end_of_left, right);
        drop(lists);
        self.end_of_last_visited = right + VM::size_of(right);
        self.end_of_last_visited
    }

    fn process_dead_space(&mut self, start: Address, size: usize) {
        let mut lists = self.lists.lock().unwrap();
        Self::record_gap(&mut lists, start, start + size);
        self.end_of_last_visited = start + size;
    }

    fn end_sweep(&mut self) -> usize {
        let lists = self.lists.lock().unwrap();
        let reclaimed = lists.total_free();
        debug!(
            "large object sweep: {} bytes reclaimed, {} blocks unusable",
            reclaimed, lists.unusable_blocks
        );
        reclaimed
    }

    fn start_of_sweeping_region(&self) -> Address {
        self.start
    }

    fn end_of_sweeping_region(&self) -> Address {
        self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::MockVM;
    use std::sync::atomic::AtomicUsize;

    struct CountingGc(AtomicUsize);

    impl GcCallback for CountingGc {
        fn collect_garbage(&self, _requested: usize) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    fn block_backing(blocks: usize) -> (Vec<u8>, Address) {
        let v = vec![0u8; (blocks + 1) << LOG_BLOCK_SIZE];
        let a = Address::from_ptr(v.as_ptr()).align_up(BLOCK_SIZE);
        (v, a)
    }

    fn space(blocks: usize) -> (Vec<u8>, LargeObjectSpace<MockVM>, Arc<CountingGc>) {
        let (backing, start) = block_backing(blocks);
        let gc = Arc::new(CountingGc(AtomicUsize::new(0)));
        let space = LargeObjectSpace::new(start, blocks << LOG_BLOCK_SIZE, gc.clone());
        (backing, space, gc)
    }

    #[test]
    fn exact_fit_after_sweep_recorded_chunk() {
        // One 64 KB chunk recorded by a sweep: a minimum-size allocation
        // splits it, and the 60 KB remainder serves the follow-up request
        // without any GC.
        let (_keep, mut space, gc) = space(32);
        let start = space.start;
        space.begin_sweep(false);
        space.process_dead_space(start, 64 * 1024);
        space.end_sweep();
        assert_eq!(space.free_space(), 64 * 1024);

        let first = space.allocate(4096);
        assert_eq!(first, start);
        // The 30-block remainder sits in the exact list.
        let second = space.allocate(60 * 1024);
        assert_eq!(second, start + 4096usize);
        assert_eq!(gc.0.load(Ordering::SeqCst), 0);
        assert_eq!(space.free_space(), 0);
    }

    #[test]
    fn tail_serves_fresh_space() {
        let (_keep, space, gc) = space(32);
        let first = space.allocate(4096);
        assert_eq!(first, space.start);
        let second = space.allocate(60 * 1024);
        assert_eq!(second, space.start + 4096usize);
        assert_eq!(gc.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn summary_guides_clean_splits() {
        let (_keep, space, _gc) = space(64);
        let start = space.start;
        {
            let mut lists = space.lists.lock().unwrap();
            lists.file_chunk::<MockVM>(start, 5);
            lists.file_chunk::<MockVM>(start + (8usize << LOG_BLOCK_SIZE), 8);
            assert_eq!(lists.summary, (1 << 5) | (1 << 8));
        }
        // 2 blocks: the 5-block chunk is the nearest clean donor
        // (remainder 3 >= MIN_NUM_BLOCKS).
        let cell = {
            let mut lists = space.lists.lock().unwrap();
            lists.allocate_from_small_lists::<MockVM>(2)
        };
        assert_eq!(cell, start);
        let lists = space.lists.lock().unwrap();
        assert_eq!(lists.summary, (1 << 3) | (1 << 8));
        assert_eq!(lists.lists[3].head, start + (2usize << LOG_BLOCK_SIZE));
    }

    #[test]
    fn dark_matter_split_is_last_resort() {
        let (_keep, space, _gc) = space(8);
        let start = space.start;
        let cell = {
            let mut lists = space.lists.lock().unwrap();
            lists.file_chunk::<MockVM>(start, 3);
            // Only the 3-block chunk is available: splitting it for a
            // 2-block request leaves a 1-block dark-matter remainder.
            lists.allocate_from_small_lists::<MockVM>(2)
        };
        assert_eq!(cell, start);
        let lists = space.lists.lock().unwrap();
        assert_eq!(lists.unusable_blocks, 1, "1-block remainder is dark matter");
        assert!(lists.lists[3].is_empty());
        assert_eq!(lists.summary, 0);
    }

    #[test]
    fn sweep_rebuilds_in_address_order() {
        let (_keep, mut space, _gc) = space(64);
        let start = space.start;
        space.begin_sweep(false);
        // Three gaps in increasing address order.
        space.process_dead_space(start, 2 << LOG_BLOCK_SIZE);
        space.process_dead_space(start + (10usize << LOG_BLOCK_SIZE), 2 << LOG_BLOCK_SIZE);
        space.process_dead_space(start + (20usize << LOG_BLOCK_SIZE), 40 << LOG_BLOCK_SIZE);
        let reclaimed = space.end_sweep();
        assert_eq!(reclaimed, 44 << LOG_BLOCK_SIZE);
        let lists = space.lists.lock().unwrap();
        // The two 2-block chunks share a list, address ordered.
        assert_eq!(lists.lists[2].head, start);
        assert_eq!(
            HeapFreeChunk::next(lists.lists[2].head),
            start + (10usize << LOG_BLOCK_SIZE)
        );
        // The 40-block chunk is very large.
        assert_eq!(
            lists.lists[VERY_LARGE_CHUNK_LIST].head,
            start + (20usize << LOG_BLOCK_SIZE)
        );
    }
}

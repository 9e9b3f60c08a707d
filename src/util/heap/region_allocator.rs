use std::sync::Arc;
use std::sync::Mutex;

use crate::util::constants::INVALID_REGION_ID;
use crate::util::heap::region_bitset::RegionBitSet;
use crate::util::Address;
use crate::vm::VirtualMemory;

/// Allocates fixed-size regions out of a reserved contiguous address range.
/// Regions are identified by `id = (address - base) >> log2_region_bytes`.
///
/// All mutating operations serialize on a single allocator-wide lock.
/// Region-granularity events are orders of magnitude rarer than object
/// allocations, so the coarse lock is not a contention point.
pub struct FixedSizeRegionAllocator {
    base: Address,
    log2_region_bytes: usize,
    memory: Arc<dyn VirtualMemory>,
    sync: Mutex<RegionAllocatorSync>,
}

struct RegionAllocatorSync {
    /// One bit per region: allocated to some owner.
    allocated: RegionBitSet,
    /// One bit per region: backed by committed memory. Freeing a region
    /// does not uncommit it; the two states evolve independently.
    committed: RegionBitSet,
    /// Highest region id handed out so far, -1 before the first allocation.
    /// Contiguous-run allocation extends past this mark rather than
    /// fragmenting the already-churned low range.
    highest_allocated: i32,
    free_regions: usize,
}

impl FixedSizeRegionAllocator {
    pub fn new(
        base: Address,
        log2_region_bytes: usize,
        capacity: usize,
        memory: Arc<dyn VirtualMemory>,
    ) -> Self {
        debug_assert!(base.is_aligned_to(1 << log2_region_bytes));
        Self {
            base,
            log2_region_bytes,
            memory,
            sync: Mutex::new(RegionAllocatorSync {
                allocated: RegionBitSet::new(capacity),
                committed: RegionBitSet::new(capacity),
                highest_allocated: INVALID_REGION_ID,
                free_regions: capacity,
            }),
        }
    }

    pub fn base(&self) -> Address {
        self.base
    }

    /// The memory capability backing this allocator's commits.
    pub fn memory(&self) -> Arc<dyn VirtualMemory> {
        self.memory.clone()
    }

    pub fn capacity(&self) -> usize {
        self.sync.lock().unwrap().allocated.capacity()
    }

    pub fn free_region_count(&self) -> usize {
        self.sync.lock().unwrap().free_regions
    }

    pub fn region_size(&self) -> usize {
        1 << self.log2_region_bytes
    }

    pub fn region_address(&self, id: i32) -> Address {
        debug_assert!(id >= 0);
        self.base + ((id as usize) << self.log2_region_bytes)
    }

    pub fn region_id(&self, addr: Address) -> i32 {
        if !self.contains(addr) {
            return INVALID_REGION_ID;
        }
        ((addr - self.base) >> self.log2_region_bytes) as i32
    }

    pub fn contains(&self, addr: Address) -> bool {
        let capacity = self.capacity();
        addr >= self.base && addr < self.base + (capacity << self.log2_region_bytes)
    }

    /// Allocate a single region. Returns the region id, or
    /// [`INVALID_REGION_ID`](crate::util::constants::INVALID_REGION_ID)
    /// when the range is exhausted.
    pub fn allocate(&self) -> i32 {
        let mut sync = self.sync.lock().unwrap();
        let Some(id) = sync.allocated.next_clear_bit(0) else {
            return INVALID_REGION_ID;
        };
        sync.allocated.set(id);
        sync.free_regions -= 1;
        sync.highest_allocated = sync.highest_allocated.max(id as i32);
        trace!("allocated region {}", id);
        id as i32
    }

    /// Best-effort allocation of `num_regions` contiguous regions: reuse a
    /// clear run of exactly that length inside the already-allocated range,
    /// otherwise extend past the highest allocated region. Returns the
    /// first region id of the run, or
    /// [`INVALID_REGION_ID`](crate::util::constants::INVALID_REGION_ID).
    pub fn allocate_run(&self, num_regions: usize) -> i32 {
        debug_assert!(num_regions > 0);
        let mut sync = self.sync.lock().unwrap();
        let search_end = (sync.highest_allocated + 1) as usize;

        // Exact-fit search below the high-water mark first, so freed holes
        // are reused before the range grows.
        let mut cursor = 0;
        while cursor < search_end {
            match sync.allocated.next_clear_bit(cursor) {
                Some(start) if start < search_end => {
                    let run = sync.allocated.num_clear_bits_at(start);
                    if run == num_regions {
                        sync.allocated.set_range(start, num_regions);
                        sync.free_regions -= num_regions;
                        trace!("allocated region run [{}; {}] (reused)", start, num_regions);
                        return start as i32;
                    }
                    cursor = start + run;
                }
                _ => break,
            }
        }

        // Extend past the high-water mark.
        if search_end + num_regions <= sync.allocated.capacity()
            && sync.allocated.is_range_clear(search_end, num_regions)
        {
            sync.allocated.set_range(search_end, num_regions);
            sync.free_regions -= num_regions;
            sync.highest_allocated = (search_end + num_regions - 1) as i32;
            trace!("allocated region run [{}; {}]", search_end, num_regions);
            return search_end as i32;
        }
        INVALID_REGION_ID
    }

    /// Allocate a contiguous run of up to `num_regions` regions: the first
    /// clear run found, truncated to the request. Partial results occur
    /// when the range is fragmented. Returns the first id and the run
    /// length, or `(INVALID_REGION_ID, 0)`.
    pub fn allocate_less_or_equal(&self, num_regions: usize) -> (i32, usize) {
        debug_assert!(num_regions > 0);
        let mut sync = self.sync.lock().unwrap();
        let Some(start) = sync.allocated.next_clear_bit(0) else {
            return (INVALID_REGION_ID, 0);
        };
        let run = sync.allocated.num_clear_bits_at(start).min(num_regions);
        sync.allocated.set_range(start, run);
        sync.free_regions -= run;
        sync.highest_allocated = sync.highest_allocated.max((start + run - 1) as i32);
        (start as i32, run)
    }

    /// Free `num_regions` regions starting at `first`. The whole range must
    /// currently be allocated; returns false (and frees nothing) otherwise.
    /// Committed state is left untouched: freed regions may stay committed
    /// until explicitly uncommitted.
    pub fn free(&self, first: i32, num_regions: usize) -> bool {
        if first < 0 || num_regions == 0 {
            return false;
        }
        let mut sync = self.sync.lock().unwrap();
        if !sync.allocated.is_range_set(first as usize, num_regions) {
            return false;
        }
        sync.allocated.clear_range(first as usize, num_regions);
        sync.free_regions += num_regions;
        trace!("freed region run [{}; {}]", first, num_regions);
        true
    }

    /// Commit backing memory for `num_regions` regions starting at `first`.
    /// The range must be allocated and fully uncommitted; returns false
    /// otherwise, and on failure of the memory capability.
    pub fn commit(&self, first: i32, num_regions: usize) -> bool {
        if first < 0 || num_regions == 0 {
            return false;
        }
        let mut sync = self.sync.lock().unwrap();
        if !sync.allocated.is_range_set(first as usize, num_regions)
            || !sync.committed.is_range_clear(first as usize, num_regions)
        {
            return false;
        }
        let start = self.region_address(first);
        let bytes = num_regions << self.log2_region_bytes;
        if !self.memory.commit(start, bytes) {
            warn!("commit of region run [{}; {}] failed", first, num_regions);
            return false;
        }
        sync.committed.set_range(first as usize, num_regions);
        true
    }

    /// Return `num_regions` regions starting at `first` to the
    /// reserved-but-uncommitted state. The range must be fully committed;
    /// returns false otherwise. The regions need not be allocated (freed
    /// regions are routinely uncommitted to shrink the heap footprint).
    pub fn uncommit(&self, first: i32, num_regions: usize) -> bool {
        if first < 0 || num_regions == 0 {
            return false;
        }
        let mut sync = self.sync.lock().unwrap();
        if !sync.committed.is_range_set(first as usize, num_regions) {
            return false;
        }
        let start = self.region_address(first);
        let bytes = num_regions << self.log2_region_bytes;
        if !self.memory.uncommit(start, bytes) {
            warn!("uncommit of region run [{}; {}] failed", first, num_regions);
            return false;
        }
        sync.committed.clear_range(first as usize, num_regions);
        true
    }

    pub fn is_committed(&self, id: i32) -> bool {
        id >= 0 && self.sync.lock().unwrap().committed.is_set(id as usize)
    }
}

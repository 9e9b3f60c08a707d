use std::sync::{Arc, Mutex};

use crate::util::constants::INVALID_REGION_ID;
use crate::util::heap::region_allocator::FixedSizeRegionAllocator;
use crate::util::heap::region_list::{HeapRegionList, RegionLinkTable};
use crate::util::heap::region_table::RegionTable;
use crate::util::Address;
use crate::vm::VirtualMemory;

/// Shared region-management state: the fixed-size region allocator, the
/// region descriptor table and the link table backing every region list.
/// Heap accounts draw their regions from here.
pub struct RegionManager {
    allocator: FixedSizeRegionAllocator,
    table: RegionTable,
    links: Arc<RegionLinkTable>,
    sync: Mutex<RegionManagerSync>,
}

struct RegionManagerSync {
    /// Total regions promised to open accounts. Never exceeds capacity, so
    /// an allocation below an account's reserve always succeeds.
    reserved_quota: usize,
    next_account: u32,
}

impl RegionManager {
    pub fn new(
        base: Address,
        log2_region_bytes: usize,
        capacity: usize,
        memory: Arc<dyn VirtualMemory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            allocator: FixedSizeRegionAllocator::new(base, log2_region_bytes, capacity, memory),
            table: RegionTable::new(base, log2_region_bytes, capacity),
            links: RegionLinkTable::new(capacity),
            sync: Mutex::new(RegionManagerSync {
                reserved_quota: 0,
                next_account: 1,
            }),
        })
    }

    /// Reserve a fresh address range from the memory capability and build a
    /// manager over it. Returns None when reservation fails.
    pub fn reserve(
        log2_region_bytes: usize,
        capacity: usize,
        memory: Arc<dyn VirtualMemory>,
    ) -> Option<Arc<Self>> {
        let bytes = capacity << log2_region_bytes;
        // Over-reserve by one region so the range can be aligned.
        let raw = memory.reserve(bytes + (1 << log2_region_bytes));
        if raw.is_zero() {
            return None;
        }
        let base = raw.align_up(1 << log2_region_bytes);
        info!(
            "reserved {} regions of {} bytes at {}",
            capacity,
            1usize << log2_region_bytes,
            base
        );
        Some(Self::new(base, log2_region_bytes, capacity, memory))
    }

    pub fn allocator(&self) -> &FixedSizeRegionAllocator {
        &self.allocator
    }

    pub fn table(&self) -> &RegionTable {
        &self.table
    }

    pub fn links(&self) -> &Arc<RegionLinkTable> {
        &self.links
    }

    fn open_account(&self, reserve: usize) -> Option<u32> {
        let mut sync = self.sync.lock().unwrap();
        if sync.reserved_quota + reserve > self.allocator.capacity() {
            return None;
        }
        sync.reserved_quota += reserve;
        let id = sync.next_account;
        sync.next_account += 1;
        Some(id)
    }

    fn adjust_quota(&self, delta: isize) -> bool {
        let mut sync = self.sync.lock().unwrap();
        let new_quota = sync.reserved_quota as isize + delta;
        if new_quota < 0 || new_quota as usize > self.allocator.capacity() {
            return false;
        }
        sync.reserved_quota = new_quota as usize;
        true
    }
}

/// A reservation of regions for one owning heap. The reserve is a committed
/// promise: as long as the account holds fewer regions than its reserve,
/// allocation succeeds without triggering a collection. Past the reserve,
/// [`allocate`](HeapAccount::allocate) signals
/// [`INVALID_REGION_ID`](crate::util::constants::INVALID_REGION_ID) and the
/// owner decides whether to collect, expand the account, or fail.
pub struct HeapAccount {
    manager: Arc<RegionManager>,
    id: u32,
    reserve: usize,
    allocated: HeapRegionList,
}

impl HeapAccount {
    /// Open an account for `reserve` regions. Fails when the outstanding
    /// reserves of all accounts would exceed the managed capacity.
    pub fn open(manager: Arc<RegionManager>, reserve: usize) -> Option<Self> {
        let id = manager.open_account(reserve)?;
        let allocated = HeapRegionList::new(manager.links().clone());
        debug!("opened heap account {} with reserve {}", id, reserve);
        Some(Self {
            manager,
            id,
            reserve,
            allocated,
        })
    }

    pub fn account_id(&self) -> u32 {
        self.id
    }

    pub fn reserve(&self) -> usize {
        self.reserve
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.size()
    }

    pub fn allocated(&self) -> &HeapRegionList {
        &self.allocated
    }

    pub fn manager(&self) -> &Arc<RegionManager> {
        &self.manager
    }

    /// Grow the account's reserve by `additional` regions, quota
    /// permitting.
    pub fn expand(&mut self, additional: usize) -> bool {
        if !self.manager.adjust_quota(additional as isize) {
            return false;
        }
        self.reserve += additional;
        true
    }

    fn take_ownership(&self, first: i32, num_regions: usize) {
        let table = self.manager.table();
        for id in first..first + num_regions as i32 {
            let info = table.info(id);
            debug_assert!(info.is_empty(), "region {} descriptor not reset", id);
            info.set_owner(self.id);
        }
    }

    /// Allocate one region and prepend it to the account's list. The region
    /// is committed before it is handed out. Returns
    /// [`INVALID_REGION_ID`](crate::util::constants::INVALID_REGION_ID)
    /// once the reserve is exhausted or the global allocator is out of
    /// regions.
    pub fn allocate(&mut self) -> i32 {
        if self.allocated.size() >= self.reserve {
            return INVALID_REGION_ID;
        }
        let allocator = self.manager.allocator();
        let id = allocator.allocate();
        if id == INVALID_REGION_ID {
            return INVALID_REGION_ID;
        }
        // Freed regions may still be committed from a previous life.
        if !allocator.is_committed(id) && !allocator.commit(id, 1) {
            allocator.free(id, 1);
            return INVALID_REGION_ID;
        }
        self.take_ownership(id, 1);
        self.allocated.prepend(id);
        id
    }

    /// Allocate a committed contiguous run of `num_regions` within the
    /// reserve. The run is appended to the account's list in address order.
    pub fn allocate_contiguous(&mut self, num_regions: usize) -> i32 {
        if self.allocated.size() + num_regions > self.reserve {
            return INVALID_REGION_ID;
        }
        let allocator = self.manager.allocator();
        let first = allocator.allocate_run(num_regions);
        if first == INVALID_REGION_ID {
            return INVALID_REGION_ID;
        }
        for id in first..first + num_regions as i32 {
            if !allocator.is_committed(id) && !allocator.commit(id, 1) {
                // Roll back: return the whole run.
                allocator.free(first, num_regions);
                return INVALID_REGION_ID;
            }
        }
        self.take_ownership(first, num_regions);
        for id in first..first + num_regions as i32 {
            self.allocated.append(id);
        }
        first
    }

    /// Return one region to the global allocator. The descriptor is reset
    /// to empty/unowned; committed memory is retained for reuse.
    pub fn free_region(&mut self, id: i32) -> bool {
        if id < 0 || !self.allocated.contains(id) {
            return false;
        }
        debug_assert_eq!(self.manager.table().info(id).owner(), self.id);
        self.allocated.remove(id);
        self.manager.table().info(id).reset();
        self.manager.allocator().free(id, 1)
    }

    /// Return every region and the quota to the manager.
    pub fn close(&mut self) {
        loop {
            let id = self.allocated.pop_head();
            if id == INVALID_REGION_ID {
                break;
            }
            self.manager.table().info(id).reset();
            self.manager.allocator().free(id, 1);
        }
        self.manager.adjust_quota(-(self.reserve as isize));
        self.reserve = 0;
        debug!("closed heap account {}", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::NopMemory;

    fn manager(capacity: usize) -> Arc<RegionManager> {
        RegionManager::new(
            unsafe { Address::from_usize(0x8000_0000) },
            20,
            capacity,
            Arc::new(NopMemory),
        )
    }

    #[test]
    fn reserve_is_a_promise() {
        let m = manager(8);
        let mut a = HeapAccount::open(m.clone(), 5).unwrap();
        let mut b = HeapAccount::open(m.clone(), 3).unwrap();
        // A third account would overcommit the capacity.
        assert!(HeapAccount::open(m.clone(), 1).is_none());

        for _ in 0..5 {
            assert_ne!(a.allocate(), INVALID_REGION_ID);
        }
        assert_eq!(a.allocate(), INVALID_REGION_ID, "reserve exhausted");
        for _ in 0..3 {
            assert_ne!(b.allocate(), INVALID_REGION_ID);
        }
        assert_eq!(a.allocated_count(), 5);
        assert_eq!(b.allocated_count(), 3);

        a.close();
        assert!(HeapAccount::open(m, 5).is_some());
    }

    #[test]
    fn ownership_is_recorded_and_reset() {
        let m = manager(4);
        let mut a = HeapAccount::open(m.clone(), 2).unwrap();
        let id = a.allocate();
        assert_eq!(m.table().info(id).owner(), a.account_id());
        assert!(a.free_region(id));
        assert!(m.table().info(id).is_empty());
        assert!(!a.free_region(id), "double free rejected");
    }

    #[test]
    fn contiguous_within_reserve() {
        let m = manager(8);
        let mut a = HeapAccount::open(m, 4).unwrap();
        let first = a.allocate_contiguous(3);
        assert_ne!(first, INVALID_REGION_ID);
        assert_eq!(a.allocated_count(), 3);
        assert_eq!(
            a.allocate_contiguous(2),
            INVALID_REGION_ID,
            "would exceed reserve"
        );
        assert!(a.expand(2));
        assert_ne!(a.allocate_contiguous(2), INVALID_REGION_ID);
    }
}

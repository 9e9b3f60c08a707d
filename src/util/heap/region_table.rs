use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::util::constants::INVALID_REGION_ID;
use crate::util::Address;

/// Region flag bits. A zero flag word means "empty, unowned".
pub const EMPTY: u8 = 0;
/// Some allocator is currently carving objects out of the region.
pub const ALLOCATING: u8 = 1 << 0;
/// The region has no usable free space left.
pub const FULL: u8 = 1 << 1;
/// The region is walkable end to end (all gaps filled or chunk-formatted).
pub const ITERABLE: u8 = 1 << 2;
/// The region carries at least one free chunk, headed at
/// `first_free_chunk_offset`.
pub const HAS_FREE_CHUNK: u8 = 1 << 3;

/// Per-region descriptor. One lives in the [`RegionTable`] for every region
/// of the covered range, zero-filled at startup (which encodes "empty,
/// unowned" so no initialization pass is required). Descriptors are never
/// destroyed; reclaiming a region just resets its descriptor.
///
/// Fields are atomics with relaxed ordering: mutation happens either under
/// the region-allocator lock or during stop-the-world phases, so the
/// atomics only provide shared `&self` mutability, not synchronization.
pub struct HeapRegionInfo {
    flags: AtomicU8,
    /// Account id of the owning heap, 0 when unowned.
    owner: AtomicU32,
    /// Word offset from the region start to the first free chunk. Only
    /// meaningful while `HAS_FREE_CHUNK` is set.
    first_free_chunk_offset: AtomicUsize,
    num_free_chunks: AtomicU32,
    free_words: AtomicUsize,
    live_words: AtomicUsize,
}

impl HeapRegionInfo {
    const fn new() -> Self {
        Self {
            flags: AtomicU8::new(EMPTY),
            owner: AtomicU32::new(0),
            first_free_chunk_offset: AtomicUsize::new(0),
            num_free_chunks: AtomicU32::new(0),
            free_words: AtomicUsize::new(0),
            live_words: AtomicUsize::new(0),
        }
    }

    pub fn flags(&self) -> u8 {
        self.flags.load(Ordering::Relaxed)
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags() & flag != 0
    }

    pub fn set_flag(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::Relaxed);
    }

    pub fn clear_flag(&self, flag: u8) {
        self.flags.fetch_and(!flag, Ordering::Relaxed);
    }

    pub fn is_empty(&self) -> bool {
        self.flags() == EMPTY
    }

    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::Relaxed)
    }

    pub fn set_owner(&self, account: u32) {
        debug_assert_ne!(account, 0);
        self.owner.store(account, Ordering::Relaxed);
    }

    pub fn free_words(&self) -> usize {
        self.free_words.load(Ordering::Relaxed)
    }

    pub fn live_words(&self) -> usize {
        self.live_words.load(Ordering::Relaxed)
    }

    pub fn num_free_chunks(&self) -> u32 {
        self.num_free_chunks.load(Ordering::Relaxed)
    }

    pub fn first_free_chunk_offset(&self) -> usize {
        self.first_free_chunk_offset.load(Ordering::Relaxed)
    }

    /// Record the free-chunk summary a sweep produced for this region.
    pub fn set_free_chunks(&self, first_offset: usize, num_chunks: u32, free_words: usize) {
        debug_assert!(num_chunks > 0);
        self.first_free_chunk_offset
            .store(first_offset, Ordering::Relaxed);
        self.num_free_chunks.store(num_chunks, Ordering::Relaxed);
        self.free_words.store(free_words, Ordering::Relaxed);
        self.set_flag(HAS_FREE_CHUNK);
    }

    pub fn clear_free_chunks(&self) {
        self.first_free_chunk_offset.store(0, Ordering::Relaxed);
        self.num_free_chunks.store(0, Ordering::Relaxed);
        self.free_words.store(0, Ordering::Relaxed);
        self.clear_flag(HAS_FREE_CHUNK);
    }

    pub fn set_live_words(&self, words: usize) {
        self.live_words.store(words, Ordering::Relaxed);
    }

    pub fn add_live_words(&self, words: usize) {
        self.live_words.fetch_add(words, Ordering::Relaxed);
    }

    /// Reset the descriptor to the empty, unowned state.
    pub fn reset(&self) {
        self.flags.store(EMPTY, Ordering::Relaxed);
        self.owner.store(0, Ordering::Relaxed);
        self.clear_free_chunks();
        self.live_words.store(0, Ordering::Relaxed);
    }
}

/// Array of region descriptors with O(1) address-to-descriptor mapping.
/// The table covers the contiguous range `[base, base + count << log2)`.
pub struct RegionTable {
    base: Address,
    log2_region_bytes: usize,
    regions: Box<[HeapRegionInfo]>,
}

impl RegionTable {
    pub fn new(base: Address, log2_region_bytes: usize, count: usize) -> Self {
        let regions = (0..count)
            .map(|_| HeapRegionInfo::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            base,
            log2_region_bytes,
            regions,
        }
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn count(&self) -> usize {
        self.regions.len()
    }

    pub fn region_size(&self) -> usize {
        1 << self.log2_region_bytes
    }

    pub fn in_range(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.base + (self.regions.len() << self.log2_region_bytes)
    }

    /// Region id for an address, [`INVALID_REGION_ID`] when outside the
    /// covered range.
    pub fn region_id(&self, addr: Address) -> i32 {
        if !self.in_range(addr) {
            return INVALID_REGION_ID;
        }
        ((addr - self.base) >> self.log2_region_bytes) as i32
    }

    pub fn region_start(&self, id: i32) -> Address {
        debug_assert!(id >= 0 && (id as usize) < self.regions.len());
        self.base + ((id as usize) << self.log2_region_bytes)
    }

    pub fn info(&self, id: i32) -> &HeapRegionInfo {
        debug_assert!(id >= 0, "invalid region id {}", id);
        &self.regions[id as usize]
    }

    /// Descriptor for the region covering `addr`, if any.
    pub fn info_for(&self, addr: Address) -> Option<&HeapRegionInfo> {
        let id = self.region_id(addr);
        (id != INVALID_REGION_ID).then(|| self.info(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RegionTable {
        // A synthetic base; the table itself never dereferences it.
        RegionTable::new(unsafe { Address::from_usize(0x1000_0000) }, 20, 8)
    }

    #[test]
    fn address_mapping() {
        let t = table();
        let base = t.base();
        assert_eq!(t.region_id(base), 0);
        assert_eq!(t.region_id(base + ((1usize << 20) - 1)), 0);
        assert_eq!(t.region_id(base + (3usize << 20)), 3);
        assert_eq!(t.region_id(base + (8usize << 20)), INVALID_REGION_ID);
        assert_eq!(t.region_start(3), base + (3usize << 20));
    }

    #[test]
    fn zero_filled_means_empty() {
        let t = table();
        let info = t.info(5);
        assert!(info.is_empty());
        assert_eq!(info.owner(), 0);
        assert_eq!(info.num_free_chunks(), 0);
    }

    #[test]
    fn flags_and_reset() {
        let t = table();
        let info = t.info(1);
        info.set_owner(7);
        info.set_flag(ALLOCATING);
        info.set_free_chunks(16, 2, 1024);
        assert!(info.has_flag(ALLOCATING));
        assert!(info.has_flag(HAS_FREE_CHUNK));
        assert_eq!(info.first_free_chunk_offset(), 16);
        info.reset();
        assert!(info.is_empty());
        assert_eq!(info.owner(), 0);
        assert_eq!(info.free_words(), 0);
    }
}

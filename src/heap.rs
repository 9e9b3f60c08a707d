//! Heap facade: a mark-sweep heap composed of a region-backed committed
//! space, a free-space manager, and a tricolor marker. Composition is the
//! rule here: the heap owns an allocator and a sweeper rather than being
//! one.

use std::sync::Arc;

use crate::mark::{MarkerOptions, TricolorHeapMarker};
use crate::policy::free_space::{FreeHeapSpaceManager, FreeSpaceOptions};
use crate::sweep::AfterMarkSweepVerifier;
use crate::util::constants::{INVALID_REGION_ID, LOG_BYTES_IN_REGION};
use crate::util::heap::account::{HeapAccount, RegionManager};
use crate::util::Address;
use crate::vm::{GcCallback, ObjectModel, RootScanner};

#[derive(Clone, Copy)]
pub struct HeapOptions {
    pub log2_region_bytes: usize,
    /// Regions reserved for this heap's account.
    pub heap_regions: usize,
    /// Regions committed and handed to the space manager up front.
    pub initial_regions: usize,
    pub free_space: FreeSpaceOptions,
    pub marker: MarkerOptions,
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            log2_region_bytes: LOG_BYTES_IN_REGION,
            heap_regions: 16,
            initial_regions: 1,
            free_space: FreeSpaceOptions::default(),
            marker: MarkerOptions::default(),
        }
    }
}

/// A mark-sweep heap over a contiguous run of committed regions.
///
/// The binding must keep cell sizes multiples of twice the mark-bitmap
/// granule (32 bytes with the default one-bit-per-word bitmap on 64-bit),
/// so that mark colors never span a bitmap word.
pub struct MarkSweepHeap<VM: ObjectModel> {
    #[allow(dead_code)]
    account: HeapAccount,
    space: FreeHeapSpaceManager<VM>,
    marker: TricolorHeapMarker<VM>,
}

impl<VM: ObjectModel> MarkSweepHeap<VM> {
    /// Open an account on `regions`, claim the heap's contiguous run, and
    /// wire up the space manager and marker. Returns None when the account
    /// or the run cannot be reserved.
    pub fn new(
        regions: Arc<RegionManager>,
        gc: Arc<dyn GcCallback>,
        options: HeapOptions,
    ) -> Option<Self> {
        let mut account = HeapAccount::open(regions.clone(), options.heap_regions)?;
        let first = account.allocate_contiguous(options.heap_regions);
        if first == INVALID_REGION_ID {
            return None;
        }
        let start = regions.table().region_start(first);
        let max_size = options.heap_regions << options.log2_region_bytes;
        let init_size = options.initial_regions << options.log2_region_bytes;
        let space = FreeHeapSpaceManager::new(
            regions.allocator().memory(),
            start,
            init_size,
            max_size,
            gc,
            options.free_space,
        );
        let marker = TricolorHeapMarker::new(start, start + max_size, options.marker);
        info!(
            "mark-sweep heap over [{}, {}), {} committed",
            start,
            start + max_size,
            init_size
        );
        Some(Self {
            account,
            space,
            marker,
        })
    }

    pub fn allocate(&self, size: usize) -> Address {
        self.space.allocate(size)
    }

    pub fn allocate_tlab(&self, size: usize) -> Address {
        self.space.allocate_tlab(size)
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.space.contains(addr)
    }

    pub fn free_space(&self) -> usize {
        self.space.free_space()
    }

    /// Force every allocator to retire its current chunk so the heap can
    /// be walked cell by cell.
    pub fn make_parsable(&self) {
        self.space.make_parsable();
    }

    pub fn marker(&self) -> &TricolorHeapMarker<VM> {
        &self.marker
    }

    /// One stop-the-world collection: make the heap parsable, trace from
    /// the roots, sweep, and (in debug builds) verify the accounting by
    /// walking the heap. Returns the bytes reclaimed into free lists.
    pub fn collect(&mut self, roots: &mut dyn RootScanner, precise: bool) -> usize {
        self.space.make_parsable();
        self.marker.mark_all(roots);
        let reclaimed = self.marker.sweep(&mut self.space, precise);
        if cfg!(debug_assertions) || cfg!(feature = "extreme_assertions") {
            let mut verifier = AfterMarkSweepVerifier::new(&self.marker);
            self.space.verify(&mut verifier);
        }
        debug!("collection reclaimed {} bytes", reclaimed);
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_WORD;
    use crate::util::test_util::{ArenaMemory, MockVM, VecRoots};
    use crate::vm::NoGc;

    fn heap() -> MarkSweepHeap<MockVM> {
        let regions = RegionManager::reserve(18, 8, Arc::new(ArenaMemory::default())).unwrap();
        let options = HeapOptions {
            log2_region_bytes: 18,
            heap_regions: 4,
            initial_regions: 1,
            free_space: FreeSpaceOptions {
                min_large_object_size: 4096,
                min_reclaimable_space: 64,
                refill_threshold: 64,
            },
            ..Default::default()
        };
        MarkSweepHeap::new(regions, Arc::new(NoGc), options).unwrap()
    }

    /// Write a mock object header into freshly allocated space.
    fn new_object(heap: &MarkSweepHeap<MockVM>, size: usize, num_refs: usize) -> Address {
        let cell = heap.allocate(size);
        assert!(!cell.is_zero());
        unsafe {
            cell.store::<usize>(size);
            (cell + BYTES_IN_WORD).store::<usize>(num_refs);
        }
        cell
    }

    fn set_ref(cell: Address, index: usize, target: Address) {
        unsafe { (cell + (2 + index) * BYTES_IN_WORD).store::<Address>(target) };
    }

    #[test]
    fn allocate_trace_sweep_reallocate() {
        let mut heap = heap();
        // A root object keeping half of a chain alive.
        let root = new_object(&heap, 64, 2);
        let kept = new_object(&heap, 160, 0);
        set_ref(root, 0, kept);
        let mut garbage = vec![];
        for _ in 0..64 {
            garbage.push(new_object(&heap, 320, 0));
        }

        let mut roots = VecRoots(vec![root]);
        let reclaimed = heap.collect(&mut roots, false);
        assert!(reclaimed > 0);
        assert!(heap.marker().is_black_when_no_greys(root));
        assert!(heap.marker().is_black_when_no_greys(kept));

        // The reclaimed space serves new allocations.
        let fresh = new_object(&heap, 320, 0);
        assert!(heap.contains(fresh));
    }

    #[test]
    fn precise_and_imprecise_sweeps_agree_on_live_data() {
        let mut heap = heap();
        let root = new_object(&heap, 64, 1);
        let child = new_object(&heap, 64, 0);
        set_ref(root, 0, child);
        for _ in 0..32 {
            new_object(&heap, 640, 0);
        }
        let mut roots = VecRoots(vec![root]);
        let precise = heap.collect(&mut roots, true);
        // Re-tracing the same live set imprecisely reclaims no less than
        // what survived minus dark matter differences; both runs keep the
        // same objects black.
        let mut roots = VecRoots(vec![root]);
        let imprecise = heap.collect(&mut roots, false);
        assert!(heap.marker().is_black_when_no_greys(root));
        assert!(heap.marker().is_black_when_no_greys(child));
        assert!(imprecise <= precise);
    }

    #[test]
    fn tlab_allocation_round_trip() {
        let heap = heap();
        let tlab = heap.allocate_tlab(1024);
        assert!(!tlab.is_zero());
        assert!(heap.contains(tlab));
        assert_eq!(
            crate::util::heap::chunk::HeapFreeChunk::list_size(tlab),
            1024
        );
    }
}

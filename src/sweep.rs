//! The sweep protocol: space managers implement [`Sweeper`] and are driven
//! by the mark-bitmap walk (see `TricolorHeapMarker::sweep`), rebuilding
//! their free lists from the gaps between live objects.

use crate::mark::TricolorHeapMarker;
use crate::util::heap::chunk::HeapFreeChunk;
use crate::util::Address;
use crate::vm::ObjectModel;

/// Callbacks a space manager exposes to the sweep driver.
///
/// In precise mode the driver calls [`process_live_object`] for every live
/// cell; the sweeper computes the gap since the previous live object and
/// records it when reclaimable. In imprecise mode the driver only calls
/// [`process_large_gap`] when two consecutive live marks are far enough
/// apart to be worth reclaiming; small gaps become dark matter without ever
/// being visited. Boundary gaps (before the first live object, after the
/// last) arrive through [`process_dead_space`] in both modes.
///
/// [`process_live_object`]: Sweeper::process_live_object
/// [`process_large_gap`]: Sweeper::process_large_gap
/// [`process_dead_space`]: Sweeper::process_dead_space
pub trait Sweeper {
    /// Start a sweep. Returns the minimum reclaimable size: space smaller
    /// than this is dark matter and is never reported.
    fn begin_sweep(&mut self, precise: bool) -> usize;

    /// Precise mode: a live object at `cell`. Returns the address the scan
    /// should resume from (the end of the cell).
    fn process_live_object(&mut self, cell: Address) -> Address;

    /// Imprecise mode: the live objects at `left` and `right` are separated
    /// by at least the minimum reclaimable distance. Returns the address
    /// the scan should resume from (the end of the right object).
    fn process_large_gap(&mut self, left: Address, right: Address) -> Address;

    /// A gap known to be entirely dead (no live mark inside).
    fn process_dead_space(&mut self, start: Address, size: usize);

    /// Finish the sweep; returns the total bytes reclaimed.
    fn end_sweep(&mut self) -> usize;

    fn start_of_sweeping_region(&self) -> Address;
    fn end_of_sweeping_region(&self) -> Address;
}

/// Post-sweep heap checker. Walks a committed range cell by cell,
/// classifying every span as free chunk, dark matter, or live data, then
/// cross-checks the space manager's accounting. A mismatch means the mark
/// or sweep phase is broken; continuing would corrupt the heap, so the
/// check is fatal.
pub struct AfterMarkSweepVerifier<'a, VM: ObjectModel> {
    marker: &'a TricolorHeapMarker<VM>,
    pub free_chunks_bytes: usize,
    pub dark_matter_bytes: usize,
    pub live_data_bytes: usize,
}

impl<'a, VM: ObjectModel> AfterMarkSweepVerifier<'a, VM> {
    pub fn new(marker: &'a TricolorHeapMarker<VM>) -> Self {
        Self {
            marker,
            free_chunks_bytes: 0,
            dark_matter_bytes: 0,
            live_data_bytes: 0,
        }
    }

    /// Visit every cell in `[start, end)`.
    pub fn visit_cells(&mut self, start: Address, end: Address) {
        let mut cell = start;
        while cell < end {
            let size = if HeapFreeChunk::is_free_chunk(cell) {
                let size = HeapFreeChunk::size(cell);
                self.free_chunks_bytes += size;
                size
            } else {
                let size = VM::size_of(cell);
                if self.marker.is_black_when_no_greys(cell) {
                    self.live_data_bytes += size;
                } else {
                    self.dark_matter_bytes += size;
                }
                size
            };
            debug_assert!(size > 0, "unwalkable cell at {}", cell);
            cell += size;
        }
        assert_eq!(cell, end, "cell walk overran the verified range");
    }
}

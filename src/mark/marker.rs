//! Tricolor marking over a mark bitmap with a finger, a bounded marking
//! stack, and overflow recovery.
//!
//! The bitmap encodes three colors in two consecutive bits per covered
//! granule: white `00`, black `01`, grey `11` (`10` is unused). A mark is
//! identified by its leading bit, which sits at the lower bit position.
//! Cells must be aligned to two granules so a color never spans a bitmap
//! word; with that guarantee the greys of a 64-bit bitmap word are exactly
//! `w & (w >> 1)`, whose least significant set bit is the leftmost grey.
//!
//! Tracing runs in three conceptual phases. Root marking greys every root
//! blindly (nothing else is marked yet) and tracks the leftmost and
//! rightmost marks. The forward scan advances a finger left to right over
//! the bitmap: a reference to a cell after the finger is merely greyed (the
//! scan will reach it); a reference to a white cell before the finger is
//! greyed first and then pushed on the marking stack (mark-then-push, so a
//! cell is stacked at most once). A visited object is colored black once
//! its children are expanded. Stack overflow triggers recovery: the stack
//! is flushed (entries stay grey) and the window from the leftmost flushed
//! mark up to the finger is re-scanned, either linearly or constrained by
//! the rescan map; nested overflows only widen the pending window, which
//! converges because marking is monotonic.

use std::marker::PhantomData;

use crate::mark::rescan_map::RescanMap;
use crate::mark::stack::MarkingStack;
use crate::mark::{DEFAULT_LOG2_RESCAN_REGION, DEFAULT_MARKING_STACK_CAPACITY};
use crate::sweep::Sweeper;
use crate::util::constants::{BITS_IN_WORD, LOG_BITS_IN_WORD, LOG_BYTES_IN_WORD};
use crate::util::Address;
use crate::vm::{ObjectModel, RootScanner};

#[derive(Clone, Copy)]
pub struct MarkerOptions {
    /// Heap words covered by one bitmap bit. Cells must be aligned to
    /// twice this granule.
    pub words_covered_per_bit: usize,
    pub marking_stack_capacity: usize,
    /// Recover from stack overflow with the rescan map instead of a linear
    /// re-scan of the overflow window.
    pub use_rescan_map: bool,
    pub log2_rescan_region: usize,
}

impl Default for MarkerOptions {
    fn default() -> Self {
        Self {
            words_covered_per_bit: 1,
            marking_stack_capacity: DEFAULT_MARKING_STACK_CAPACITY,
            use_rescan_map: false,
            log2_rescan_region: DEFAULT_LOG2_RESCAN_REGION,
        }
    }
}

pub struct TricolorHeapMarker<VM: ObjectModel> {
    covered_start: Address,
    covered_end: Address,
    log2_bytes_covered_per_bit: usize,
    color_map: Vec<u64>,
    marking_stack: MarkingStack,
    rescan_map: Option<RescanMap>,
    /// Current position of the scan: the leftmost cell whose children may
    /// not all be discovered yet.
    finger: Address,
    /// Rightmost marked cell.
    rightmost: Address,
    /// Leftmost cell marked during root marking.
    leftmost: Address,
    recovering: bool,
    /// Lower bound of the next overflow re-scan; narrowed by nested
    /// overflows.
    start_of_next_overflow_scan: Address,
    /// Finger position at the time recovery started; cells at or past it
    /// are left to the forward scan.
    overflow_scan_bound: Address,
    overflow_count: usize,
    _vm: PhantomData<VM>,
}

impl<VM: ObjectModel> TricolorHeapMarker<VM> {
    pub fn new(covered_start: Address, covered_end: Address, options: MarkerOptions) -> Self {
        debug_assert!(options.words_covered_per_bit.is_power_of_two());
        let log2_bytes_covered_per_bit =
            LOG_BYTES_IN_WORD as usize + options.words_covered_per_bit.trailing_zeros() as usize;
        let covered_size = covered_end - covered_start;
        debug_assert!(covered_start.is_aligned_to(2 << log2_bytes_covered_per_bit));
        let num_bits = covered_size >> log2_bytes_covered_per_bit;
        // One extra word terminates bitmap scans past the last covered bit.
        let num_words = (num_bits + BITS_IN_WORD - 1) / BITS_IN_WORD + 1;
        Self {
            covered_start,
            covered_end,
            log2_bytes_covered_per_bit,
            color_map: vec![0; num_words],
            marking_stack: MarkingStack::new(options.marking_stack_capacity),
            rescan_map: options.use_rescan_map.then(|| {
                RescanMap::new(covered_start, covered_size, options.log2_rescan_region)
            }),
            finger: covered_start,
            rightmost: covered_start,
            leftmost: covered_end,
            recovering: false,
            start_of_next_overflow_scan: covered_start,
            overflow_scan_bound: covered_start,
            overflow_count: 0,
            _vm: PhantomData,
        }
    }

    pub fn covered(&self, addr: Address) -> bool {
        addr >= self.covered_start && addr < self.covered_end
    }

    pub fn covered_start(&self) -> Address {
        self.covered_start
    }

    pub fn covered_end(&self) -> Address {
        self.covered_end
    }

    /// Number of marking-stack overflows the last trace went through.
    pub fn overflow_count(&self) -> usize {
        self.overflow_count
    }

    pub fn rightmost_marked(&self) -> Address {
        self.rightmost
    }

    // Address / bitmap index arithmetic.

    fn bit_index_of(&self, cell: Address) -> usize {
        debug_assert!(self.covered(cell), "cell {} outside covered area", cell);
        let bit = (cell - self.covered_start) >> self.log2_bytes_covered_per_bit;
        debug_assert!(bit & 1 == 0, "cell {} not color aligned", cell);
        bit
    }

    /// Bit position for an arbitrary address (no alignment requirement);
    /// used for distance arithmetic during sweeps.
    fn bit_position_of(&self, addr: Address) -> usize {
        (addr - self.covered_start) >> self.log2_bytes_covered_per_bit
    }

    fn address_of(&self, bit: usize) -> Address {
        self.covered_start + (bit << self.log2_bytes_covered_per_bit)
    }

    fn bitmap_word_index(&self, bit: usize) -> usize {
        bit >> LOG_BITS_IN_WORD
    }

    fn bitmap_word_index_of(&self, addr: Address) -> usize {
        self.bitmap_word_index(self.bit_position_of(addr))
    }

    /// First address covered by the bitmap word after `wi`.
    fn frontier_address(&self, wi: usize) -> Address {
        self.address_of((wi + 1) << LOG_BITS_IN_WORD)
            .min(self.covered_end)
    }

    // Color map operations. Colors never span a bitmap word (cells are
    // aligned to two granules), so every update touches one word.

    fn is_white(&self, bit: usize) -> bool {
        self.color_map[self.bitmap_word_index(bit)] & (1u64 << (bit & (BITS_IN_WORD - 1))) == 0
    }

    fn is_grey(&self, bit: usize) -> bool {
        let grey_bit = bit + 1;
        self.color_map[self.bitmap_word_index(grey_bit)] & (1u64 << (grey_bit & (BITS_IN_WORD - 1)))
            != 0
    }

    fn mark_grey(&mut self, bit: usize) {
        debug_assert!(bit & (BITS_IN_WORD - 1) != BITS_IN_WORD - 1);
        let word_index = self.bitmap_word_index(bit);
        self.color_map[word_index] |= 0b11u64 << (bit & (BITS_IN_WORD - 1));
    }

    fn mark_black_from_grey(&mut self, bit: usize) {
        let grey_bit = bit + 1;
        let word_index = self.bitmap_word_index(grey_bit);
        self.color_map[word_index] &= !(1u64 << (grey_bit & (BITS_IN_WORD - 1)));
    }

    fn mark_grey_if_white(&mut self, cell: Address) -> bool {
        let bit = self.bit_index_of(cell);
        if self.is_white(bit) {
            self.mark_grey(bit);
            return true;
        }
        false
    }

    /// True when the mark is black, filtering out grey. Used to skip cells
    /// that were stacked but already visited through the bitmap scan.
    fn is_black_when_not_white(&self, bit: usize) -> bool {
        !self.is_grey(bit)
    }

    /// Only valid once tracing completed (no greys left).
    pub fn is_black_when_no_greys(&self, cell: Address) -> bool {
        let bit = self.bit_index_of(cell);
        debug_assert!(!self.is_grey(bit), "grey mark after trace at {}", cell);
        !self.is_white(bit)
    }

    pub fn is_white_cell(&self, cell: Address) -> bool {
        self.is_white(self.bit_index_of(cell))
    }

    pub fn is_grey_cell(&self, cell: Address) -> bool {
        self.is_grey(self.bit_index_of(cell))
    }

    pub fn clear_color_map(&mut self) {
        self.color_map.fill(0);
    }

    // Root marking.

    /// Mark a root reference grey. Roots are marked blindly: nothing else
    /// is marked yet, so no white check is needed.
    fn mark_root_grey(&mut self, cell: Address) {
        if !self.covered(cell) {
            return;
        }
        let bit = self.bit_index_of(cell);
        self.mark_grey(bit);
        if cell < self.leftmost {
            self.leftmost = cell;
        }
        if cell > self.rightmost {
            self.rightmost = cell;
        }
    }

    // Forward scan.

    /// Mark the object at `cell` grey, routing by position relative to the
    /// finger: after the finger it will be reached by the scan; before the
    /// finger it has been passed already and must be stacked (mark first,
    /// then push, so a cell enters the stack at most once).
    fn mark_object_grey(&mut self, cell: Address) {
        if cell > self.finger {
            if self.covered(cell) && self.mark_grey_if_white(cell) {
                if cell > self.rightmost {
                    self.rightmost = cell;
                } else if self.recovering && cell < self.overflow_scan_bound {
                    // Grey placed inside the pending overflow window but
                    // past the current re-scan interval: make sure the
                    // rescan map does not lose it.
                    if let Some(map) = self.rescan_map.as_mut() {
                        map.record(cell);
                    }
                }
            }
        } else if cell >= self.covered_start && self.mark_grey_if_white(cell) {
            if self.marking_stack.push(cell) {
                self.recover_from_overflow();
            }
        }
    }

    fn visit_grey_cell(&mut self, cell: Address) -> Address {
        VM::scan_object(cell, |reference| self.mark_object_grey(reference));
        cell + VM::size_of(cell)
    }

    fn mark_and_visit_cell(&mut self, cell: Address) -> Address {
        self.finger = cell;
        let end = self.visit_grey_cell(cell);
        self.mark_black_from_grey(self.bit_index_of(cell));
        end
    }

    fn visit_popped_cell(&mut self, cell: Address) {
        let bit = self.bit_index_of(cell);
        // The bitmap scan may overtake stacked cells; they pop black and
        // are filtered here.
        if self.is_black_when_not_white(bit) {
            return;
        }
        self.visit_grey_cell(cell);
        self.mark_black_from_grey(bit);
    }

    fn drain_marking_stack(&mut self) {
        while let Some(cell) = self.marking_stack.pop() {
            self.visit_popped_cell(cell);
        }
    }

    /// Scan bitmap words `[wi, limit_wi]` visiting every grey below
    /// `upper`. The scan resumes after each visited object at the word
    /// covering its end, so greys planted ahead by the visit are picked up
    /// by the same sweep.
    fn scan_grey_range(&mut self, mut wi: usize, limit_wi: usize, upper: Address) {
        while wi <= limit_wi {
            let word = self.color_map[wi];
            if word != 0 {
                let greys = word & (word >> 1);
                if greys != 0 {
                    let bit = (wi << LOG_BITS_IN_WORD) + greys.trailing_zeros() as usize;
                    let cell = self.address_of(bit);
                    if cell >= upper {
                        return;
                    }
                    let end = self.mark_and_visit_cell(cell);
                    wi = self.bitmap_word_index_of(end);
                    continue;
                }
            }
            wi += 1;
        }
    }

    fn rightmost_bitmap_word_index(&self) -> usize {
        self.bitmap_word_index_of(self.rightmost + VM::size_of(self.rightmost))
    }

    /// Drive the forward scan to a fixpoint: scan up to the rightmost
    /// mark, drain the stack, and loop whenever either moved the rightmost
    /// bound further right.
    fn visit_grey_objects(&mut self) {
        let mut rightmost_wi = self.rightmost_bitmap_word_index();
        loop {
            let start_wi = self.bitmap_word_index_of(self.finger);
            self.scan_grey_range(start_wi, rightmost_wi, self.covered_end);
            // Anything discovered while draining now lies either before
            // the frontier (stacked, drained below) or past it (caught by
            // the rightmost re-check).
            self.finger = self.frontier_address(rightmost_wi);
            self.drain_marking_stack();
            let new_rightmost_wi = self.rightmost_bitmap_word_index();
            if new_rightmost_wi <= rightmost_wi {
                return;
            }
            rightmost_wi = new_rightmost_wi;
        }
    }

    /// Re-scan `[start, bound)` for greys after an overflow flush. `bound`
    /// is the forward finger at overflow time; greys at or past it are the
    /// forward scan's business.
    fn visit_grey_objects_bounded(&mut self, start: Address, bound: Address) {
        let start_wi = self.bitmap_word_index_of(start);
        let bound_wi = self.bitmap_word_index_of(bound);
        self.scan_grey_range(start_wi, bound_wi, bound);
        self.finger = bound;
        self.drain_marking_stack();
    }

    // Overflow recovery.

    /// Flush the marking stack. Entries were greyed before being pushed,
    /// so their marks are already in the bitmap; only the leftmost
    /// position matters.
    fn flush_marking_stack(&mut self) -> Address {
        let mut leftmost = self.finger;
        for cell in self.marking_stack.flush() {
            if cell < leftmost {
                leftmost = cell;
            }
        }
        leftmost
    }

    fn recover_from_overflow(&mut self) {
        self.overflow_count += 1;
        debug!(
            "marking stack overflow #{} at finger {}",
            self.overflow_count, self.finger
        );
        if self.rescan_map.is_some() {
            self.recover_with_rescan_map();
        } else {
            self.recover_with_linear_rescan();
        }
    }

    fn recover_with_linear_rescan(&mut self) {
        let leftmost_flushed = self.flush_marking_stack();
        if self.recovering {
            // Nested overflow: widen the pending window, the outer
            // recovery loop picks it up.
            if leftmost_flushed < self.start_of_next_overflow_scan {
                self.start_of_next_overflow_scan = leftmost_flushed;
            }
            return;
        }
        self.recovering = true;
        let bound = self.finger;
        self.overflow_scan_bound = bound;
        self.start_of_next_overflow_scan = leftmost_flushed;
        while self.start_of_next_overflow_scan < bound {
            let start = self.start_of_next_overflow_scan;
            self.start_of_next_overflow_scan = bound;
            self.visit_grey_objects_bounded(start, bound);
        }
        self.finger = bound;
        self.recovering = false;
    }

    fn recover_with_rescan_map(&mut self) {
        let flushed = self.marking_stack.flush();
        {
            let map = self.rescan_map.as_mut().unwrap();
            for cell in flushed {
                map.record(cell);
            }
        }
        if self.recovering {
            return;
        }
        self.recovering = true;
        let bound = self.finger;
        self.overflow_scan_bound = bound;
        let granule: usize = 1 << self.log2_bytes_covered_per_bit;
        loop {
            let Some((lo, hi)) = self.rescan_map.as_mut().unwrap().pop_lowest() else {
                break;
            };
            if lo >= bound {
                // Recorded past the forward finger (cannot happen for
                // flushed cells, which all precede it); leave it to the
                // forward scan.
                continue;
            }
            let interval_end = (hi + granule).min(bound);
            self.visit_grey_objects_bounded(lo, interval_end);
        }
        self.finger = bound;
        self.recovering = false;
    }

    // Entry point.

    /// Trace the heap: clear the color map, grey all roots, then scan
    /// forward until the finger passes the rightmost mark with an empty
    /// stack. On return every reachable cell is black and everything else
    /// is white.
    pub fn mark_all(&mut self, roots: &mut dyn RootScanner) {
        assert!(self.marking_stack.is_empty(), "marking stack must be empty");
        self.clear_color_map();
        if let Some(map) = self.rescan_map.as_mut() {
            map.clear();
        }
        self.overflow_count = 0;
        self.recovering = false;
        self.leftmost = self.covered_end;
        self.rightmost = self.covered_start;

        roots.scan_roots(&mut |cell| self.mark_root_grey(cell));
        if self.leftmost > self.rightmost {
            // No root points into the covered area.
            debug!("tracing found no covered roots");
            return;
        }
        debug!(
            "tracing grey objects in [{}, {}]",
            self.leftmost, self.rightmost
        );
        self.finger = self.leftmost;
        self.visit_grey_objects();
        debug_assert!(self.marking_stack.is_empty());
        #[cfg(debug_assertions)]
        self.verify_has_no_grey_marks(
            self.covered_start,
            self.rightmost + VM::size_of(self.rightmost),
        );
    }

    // Post-trace queries and verification.

    /// First grey mark in `[start, end)`, if any.
    fn first_grey_mark(&self, start: Address, end: Address) -> Option<Address> {
        let last_wi = self.bitmap_word_index_of(end);
        let mut wi = self.bitmap_word_index_of(start);
        let last_bit = self.bit_position_of(end);
        while wi <= last_wi {
            let word = self.color_map[wi];
            let greys = word & (word >> 1);
            if greys != 0 {
                let bit = (wi << LOG_BITS_IN_WORD) + greys.trailing_zeros() as usize;
                return (bit < last_bit).then(|| self.address_of(bit));
            }
            wi += 1;
        }
        None
    }

    /// Panic if a grey mark is left in `[start, end)`. Grey leaks mean the
    /// trace is broken.
    pub fn verify_has_no_grey_marks(&self, start: Address, end: Address) {
        if let Some(cell) = self.first_grey_mark(start, end) {
            panic!("grey mark found for cell {} in grey-free area", cell);
        }
    }

    /// First marked (black) bit in `[first_bit, limit_bit)`, post-trace.
    fn first_black_mark(&self, first_bit: usize, limit_bit: usize) -> Option<usize> {
        let last_wi = self.bitmap_word_index(limit_bit);
        let mut wi = self.bitmap_word_index(first_bit);
        while wi <= last_wi.min(self.color_map.len() - 1) {
            let word = self.color_map[wi];
            if word != 0 {
                let bit = (wi << LOG_BITS_IN_WORD) + word.trailing_zeros() as usize;
                return (bit < limit_bit).then_some(bit);
            }
            wi += 1;
        }
        None
    }

    // Sweeping.

    /// Drive a sweep over the mark bitmap. Precise mode reports every live
    /// object; imprecise mode only reports gaps at least the sweeper's
    /// minimum reclaimable size apart, skipping small gaps entirely.
    /// Returns the total bytes the sweeper reclaimed.
    pub fn sweep(&mut self, sweeper: &mut dyn Sweeper, precise: bool) -> usize {
        let min_reclaimable = sweeper.begin_sweep(precise);
        if precise {
            self.precise_sweep(sweeper, min_reclaimable);
        } else {
            self.imprecise_sweep(sweeper, min_reclaimable);
        }
        sweeper.end_sweep()
    }

    fn precise_sweep(&mut self, sweeper: &mut dyn Sweeper, min_reclaimable: usize) {
        let region_start = sweeper.start_of_sweeping_region();
        let region_end = sweeper.end_of_sweeping_region();
        let rightmost_bit = self.bit_position_of(self.rightmost);
        if self.first_black_mark(0, rightmost_bit + 1).is_none() {
            sweeper.process_dead_space(region_start, region_end - region_start);
            return;
        }
        let rightmost_wi = self.bitmap_word_index(rightmost_bit);
        let mut wi = 0;
        let mut last_end = region_start;
        while wi <= rightmost_wi {
            let bitmap_word = self.color_map[wi];
            if bitmap_word != 0 {
                let word_first_bit = wi << LOG_BITS_IN_WORD;
                let mut bit_in_word = 0;
                let mut w = bitmap_word;
                let mut next_wi = wi + 1;
                loop {
                    bit_in_word += w.trailing_zeros() as usize;
                    let cell = self.address_of(word_first_bit + bit_in_word);
                    last_end = sweeper.process_live_object(cell);
                    let end_wi = self.bitmap_word_index_of(last_end);
                    if end_wi > wi {
                        next_wi = end_wi;
                        break;
                    }
                    // The visited object ends inside the same mark word;
                    // shift past the processed mark and keep going.
                    bit_in_word += 2;
                    if bit_in_word >= BITS_IN_WORD {
                        break;
                    }
                    w = bitmap_word >> bit_in_word;
                    if w == 0 {
                        break;
                    }
                }
                wi = next_wi;
            } else {
                wi += 1;
            }
        }
        let tail_space = region_end - last_end;
        if tail_space >= min_reclaimable {
            sweeper.process_dead_space(last_end, tail_space);
        }
    }

    fn imprecise_sweep(&mut self, sweeper: &mut dyn Sweeper, min_reclaimable: usize) {
        let region_start = sweeper.start_of_sweeping_region();
        let region_end = sweeper.end_of_sweeping_region();
        let min_bits_between = min_reclaimable >> self.log2_bytes_covered_per_bit;
        let rightmost_bit = self.bit_position_of(self.rightmost);
        let Some(first_live) = self.first_black_mark(0, rightmost_bit + 1) else {
            sweeper.process_dead_space(region_start, region_end - region_start);
            return;
        };
        let mut last_live = first_live;
        if last_live > 0 && last_live >= min_bits_between {
            sweeper.process_dead_space(
                region_start,
                last_live << self.log2_bytes_covered_per_bit,
            );
        }
        let mut next_reclaimable = last_live + 2 + min_bits_between;
        let rightmost_wi = self.bitmap_word_index(rightmost_bit);
        let mut wi = self.bitmap_word_index(last_live + 2);
        while wi <= rightmost_wi {
            let bitmap_word = self.color_map[wi];
            if bitmap_word != 0 {
                let word_first_bit = wi << LOG_BITS_IN_WORD;
                let mut bit_in_word = 0;
                let mut w = bitmap_word;
                let mut next_wi = wi + 1;
                loop {
                    bit_in_word += w.trailing_zeros() as usize;
                    let black_bit = word_first_bit + bit_in_word;
                    if black_bit < next_reclaimable {
                        // Gap too small to be worth reporting; dark matter.
                        last_live = black_bit;
                        next_reclaimable = black_bit + min_bits_between;
                    } else {
                        let end = sweeper
                            .process_large_gap(self.address_of(last_live), self.address_of(black_bit));
                        last_live = black_bit;
                        next_reclaimable = self.bit_position_of(end) + min_bits_between;
                        let end_wi = self.bitmap_word_index_of(end);
                        if end_wi > wi {
                            next_wi = end_wi;
                            break;
                        }
                    }
                    bit_in_word += 2;
                    if bit_in_word >= BITS_IN_WORD {
                        break;
                    }
                    w = bitmap_word >> bit_in_word;
                    if w == 0 {
                        break;
                    }
                }
                wi = next_wi;
            } else {
                wi += 1;
            }
        }
        let tail = {
            let cell = self.address_of(last_live);
            cell + VM::size_of(cell)
        };
        let tail_space = region_end - tail;
        if tail_space >= min_reclaimable {
            sweeper.process_dead_space(tail, tail_space);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{MockVM, TestHeap, VecRoots};

    fn marker_for(heap: &TestHeap, options: MarkerOptions) -> TricolorHeapMarker<MockVM> {
        TricolorHeapMarker::new(heap.start, heap.end, options)
    }

    #[test]
    fn reachable_objects_end_black_unreachable_white() {
        let mut heap = TestHeap::new(1 << 14);
        let o0 = heap.alloc_object(0);
        let o1 = heap.alloc_object(1);
        let dead = heap.alloc_object(1);
        let o2 = heap.alloc_object(0);
        let root = heap.alloc_object(2);
        // root -> o1 -> o0 (both backward edges), root -> o2.
        heap.set_ref(root, 0, o1);
        heap.set_ref(root, 1, o2);
        heap.set_ref(o1, 0, o0);
        // The dead object points at a live one; that must not revive it.
        heap.set_ref(dead, 0, o0);

        let mut marker = marker_for(&heap, MarkerOptions::default());
        marker.mark_all(&mut VecRoots(vec![root]));

        for live in [root, o0, o1, o2] {
            assert!(marker.is_black_when_no_greys(live));
        }
        assert!(marker.is_white_cell(dead));
        marker.verify_has_no_grey_marks(heap.start, heap.used_end());
        assert_eq!(marker.rightmost_marked(), root);
    }

    #[test]
    fn self_and_forward_references() {
        let mut heap = TestHeap::new(1 << 14);
        let a = heap.alloc_object(2);
        let b = heap.alloc_object(1);
        let c = heap.alloc_object(1);
        heap.set_ref(a, 0, a); // self loop
        heap.set_ref(a, 1, c); // forward past b
        heap.set_ref(c, 0, b); // backward
        heap.set_ref(b, 0, a); // cycle back to the root

        let mut marker = marker_for(&heap, MarkerOptions::default());
        marker.mark_all(&mut VecRoots(vec![a]));
        for live in [a, b, c] {
            assert!(marker.is_black_when_no_greys(live));
        }
    }

    /// Build a graph that needs far more simultaneous greys than the
    /// marking stack can hold: the root (allocated last) points at many
    /// earlier objects, each chained backward to its predecessor.
    fn build_wide_backward_graph(heap: &mut TestHeap, width: usize) -> (Address, Vec<Address>) {
        let mut objects = vec![heap.alloc_object(1)];
        for i in 1..width {
            let cell = heap.alloc_object(1);
            heap.set_ref(cell, 0, objects[i - 1]);
            objects.push(cell);
        }
        // Interleave unreachable objects so the live set is sparse.
        let mut unreachable = vec![];
        for _ in 0..width / 2 {
            unreachable.push(heap.alloc_object(0));
        }
        let root = heap.alloc_object(width);
        for (i, cell) in objects.iter().enumerate() {
            heap.set_ref(root, i, *cell);
        }
        objects.push(root);
        (root, unreachable)
    }

    fn blackness(marker: &TricolorHeapMarker<MockVM>, heap: &TestHeap) -> Vec<bool> {
        let mut result = vec![];
        let mut cell = heap.start;
        while cell < heap.used_end() {
            result.push(marker.is_black_when_no_greys(cell));
            cell += MockVM::size_of(cell);
        }
        result
    }

    #[test]
    fn overflow_recovery_is_semantically_transparent() {
        let mut heap = TestHeap::new(1 << 16);
        let (root, unreachable) = build_wide_backward_graph(&mut heap, 200);

        let mut reference = marker_for(&heap, MarkerOptions::default());
        reference.mark_all(&mut VecRoots(vec![root]));
        assert_eq!(reference.overflow_count(), 0);

        let mut tiny_stack = marker_for(
            &heap,
            MarkerOptions {
                marking_stack_capacity: 8,
                ..Default::default()
            },
        );
        tiny_stack.mark_all(&mut VecRoots(vec![root]));
        assert!(tiny_stack.overflow_count() > 0, "overflow must be forced");

        assert_eq!(blackness(&reference, &heap), blackness(&tiny_stack, &heap));
        for cell in unreachable {
            assert!(tiny_stack.is_white_cell(cell));
        }
        tiny_stack.verify_has_no_grey_marks(heap.start, heap.used_end());
    }

    #[test]
    fn rescan_map_recovery_matches_linear_recovery() {
        let mut heap = TestHeap::new(1 << 16);
        let (root, _) = build_wide_backward_graph(&mut heap, 150);

        let mut linear = marker_for(
            &heap,
            MarkerOptions {
                marking_stack_capacity: 8,
                ..Default::default()
            },
        );
        linear.mark_all(&mut VecRoots(vec![root]));
        assert!(linear.overflow_count() > 0);

        let mut with_map = marker_for(
            &heap,
            MarkerOptions {
                marking_stack_capacity: 8,
                use_rescan_map: true,
                log2_rescan_region: 12,
                ..Default::default()
            },
        );
        with_map.mark_all(&mut VecRoots(vec![root]));
        assert!(with_map.overflow_count() > 0);

        assert_eq!(blackness(&linear, &heap), blackness(&with_map, &heap));
        with_map.verify_has_no_grey_marks(heap.start, heap.used_end());
    }

    /// Sweeper recording every callback for driver tests. In precise mode
    /// it computes inter-object gaps from its own cursor, the way a real
    /// space manager does.
    struct RecordingSweeper {
        start: Address,
        end: Address,
        min_reclaimable: usize,
        last_end: Address,
        live: Vec<Address>,
        gaps: Vec<(Address, usize)>,
    }

    impl RecordingSweeper {
        fn new(start: Address, end: Address, min_reclaimable: usize) -> Self {
            Self {
                start,
                end,
                min_reclaimable,
                last_end: start,
                live: vec![],
                gaps: vec![],
            }
        }
    }

    impl crate::sweep::Sweeper for RecordingSweeper {
        fn begin_sweep(&mut self, _precise: bool) -> usize {
            self.last_end = self.start;
            self.min_reclaimable
        }
        fn process_live_object(&mut self, cell: Address) -> Address {
            let gap = cell - self.last_end;
            if gap >= self.min_reclaimable {
                self.gaps.push((self.last_end, gap));
            }
            self.live.push(cell);
            self.last_end = cell + MockVM::size_of(cell);
            self.last_end
        }
        fn process_large_gap(&mut self, left: Address, right: Address) -> Address {
            let gap_start = left + MockVM::size_of(left);
            self.gaps.push((gap_start, right - gap_start));
            right + MockVM::size_of(right)
        }
        fn process_dead_space(&mut self, start: Address, size: usize) {
            self.gaps.push((start, size));
        }
        fn end_sweep(&mut self) -> usize {
            self.gaps.iter().map(|(_, size)| size).sum()
        }
        fn start_of_sweeping_region(&self) -> Address {
            self.start
        }
        fn end_of_sweeping_region(&self) -> Address {
            self.end
        }
    }

    #[test]
    fn precise_sweep_visits_every_live_object() {
        let mut heap = TestHeap::new(1 << 14);
        let cells: Vec<Address> = (0..8).map(|_| heap.alloc_object(0)).collect();
        // Keep cells 0, 3 and 7.
        let roots: Vec<Address> = vec![cells[0], cells[3], cells[7]];
        let mut marker = marker_for(&heap, MarkerOptions::default());
        marker.mark_all(&mut VecRoots(roots.clone()));

        let mut sweeper = RecordingSweeper::new(heap.start, heap.end, 16);
        let reclaimed = marker.sweep(&mut sweeper, true);
        assert_eq!(sweeper.live, roots);
        // Gaps: cells 1-2, cells 4-6, and the unused tail.
        assert_eq!(sweeper.gaps.len(), 3);
        let live_bytes: usize = roots.iter().map(|c| MockVM::size_of(*c)).sum();
        assert_eq!(reclaimed, (heap.end - heap.start) - live_bytes);
    }

    #[test]
    fn imprecise_sweep_skips_small_gaps() {
        let mut heap = TestHeap::new(1 << 14);
        // Two adjacent live objects, a small gap, a live object, then a
        // large gap to a final live object.
        let a = heap.alloc_object(0); // 16 bytes
        let b = heap.alloc_object(0);
        let _skip = heap.alloc_object(0); // 16-byte gap: below threshold
        let c = heap.alloc_object(0);
        for _ in 0..16 {
            heap.alloc_object(0); // 256 bytes of garbage
        }
        let d = heap.alloc_object(0);

        let mut marker = marker_for(&heap, MarkerOptions::default());
        marker.mark_all(&mut VecRoots(vec![a, b, c, d]));

        let mut sweeper = RecordingSweeper::new(heap.start, heap.end, 64);
        marker.sweep(&mut sweeper, false);
        assert!(sweeper.live.is_empty(), "imprecise mode reports gaps only");
        // The 16-byte gap is dark matter; the 256-byte gap and the tail
        // are reported.
        assert_eq!(sweeper.gaps.len(), 2);
        assert_eq!(sweeper.gaps[0], (c + 16usize, 256));
        assert_eq!(sweeper.gaps[1], (d + 16usize, heap.end - (d + 16usize)));
    }

    #[test]
    fn empty_trace_sweeps_whole_region() {
        let mut heap = TestHeap::new(1 << 12);
        heap.alloc_object(0);
        let mut marker = marker_for(&heap, MarkerOptions::default());
        marker.mark_all(&mut VecRoots(vec![]));
        let mut sweeper = RecordingSweeper::new(heap.start, heap.end, 16);
        let reclaimed = marker.sweep(&mut sweeper, false);
        assert_eq!(reclaimed, heap.end - heap.start);
        assert_eq!(sweeper.gaps, vec![(heap.start, heap.end - heap.start)]);
    }
}

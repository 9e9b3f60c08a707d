//! Test fixtures: memory bindings that do not need a real OS reservation,
//! and a mock object model over a simple `[size, num_refs, refs...]` cell
//! layout so marking and sweeping can be exercised on synthetic graphs.

use std::sync::Mutex;

use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;
use crate::vm::{ObjectModel, RootScanner, VirtualMemory};

/// A [`VirtualMemory`] that answers success without touching any mapping.
/// For bookkeeping-only tests operating on synthetic addresses.
pub struct NopMemory;

impl VirtualMemory for NopMemory {
    fn reserve(&self, _size: usize) -> Address {
        Address::ZERO
    }
    fn commit(&self, _start: Address, _size: usize) -> bool {
        true
    }
    fn uncommit(&self, _start: Address, _size: usize) -> bool {
        true
    }
    fn release(&self, _start: Address, _size: usize) {}
}

/// A [`VirtualMemory`] serving reservations from heap-allocated, already
/// committed arenas. Commit and uncommit are no-ops; the arenas are freed
/// when the binding drops.
#[derive(Default)]
pub struct ArenaMemory {
    arenas: Mutex<Vec<Box<[u8]>>>,
}

impl VirtualMemory for ArenaMemory {
    fn reserve(&self, size: usize) -> Address {
        let arena = vec![0u8; size].into_boxed_slice();
        let addr = Address::from_ptr(arena.as_ptr());
        self.arenas.lock().unwrap().push(arena);
        addr
    }
    fn commit(&self, _start: Address, _size: usize) -> bool {
        true
    }
    fn uncommit(&self, _start: Address, _size: usize) -> bool {
        true
    }
    fn release(&self, _start: Address, _size: usize) {}
}

/// Mock object model. Cells are laid out as
/// `[size_in_bytes, num_refs, ref0, ref1, ...]`, 16-byte aligned so a mark
/// color never spans a bitmap word.
pub struct MockVM;

pub const MOCK_CELL_ALIGN: usize = 16;

impl ObjectModel for MockVM {
    const MIN_OBJECT_SIZE: usize = 16;

    fn size_of(cell: Address) -> usize {
        unsafe { cell.load::<usize>() }
    }

    fn scan_object<F: FnMut(Address)>(cell: Address, mut f: F) {
        let num_refs = unsafe { (cell + BYTES_IN_WORD).load::<usize>() };
        for i in 0..num_refs {
            let slot = cell + (2 + i) * BYTES_IN_WORD;
            let target = unsafe { slot.load::<Address>() };
            if !target.is_zero() {
                f(target);
            }
        }
    }

    fn fill_dead(start: Address, end: Address) {
        if start == end {
            return;
        }
        let size = end - start;
        debug_assert!(size >= Self::MIN_OBJECT_SIZE, "dead gap of {} bytes", size);
        unsafe {
            start.store::<usize>(size);
            (start + BYTES_IN_WORD).store::<usize>(0);
        }
    }
}

/// A bump-allocated arena of mock objects for marker and sweeper tests.
pub struct TestHeap {
    #[allow(dead_code)]
    backing: Box<[u8]>,
    pub start: Address,
    pub end: Address,
    cursor: Address,
}

impl TestHeap {
    pub fn new(size: usize) -> Self {
        let backing = vec![0u8; size + MOCK_CELL_ALIGN].into_boxed_slice();
        let start = Address::from_ptr(backing.as_ptr()).align_up(MOCK_CELL_ALIGN);
        Self {
            backing,
            start,
            end: start + size,
            cursor: start,
        }
    }

    /// Allocate a mock object with room for `num_refs` reference slots.
    pub fn alloc_object(&mut self, num_refs: usize) -> Address {
        let size = ((2 + num_refs) * BYTES_IN_WORD).max(MockVM::MIN_OBJECT_SIZE);
        let size = crate::util::conversions::raw_align_up(size, MOCK_CELL_ALIGN);
        self.alloc_object_sized(size, num_refs)
    }

    /// Allocate a mock object of exactly `size` bytes (16-byte multiple)
    /// with `num_refs` reference slots.
    pub fn alloc_object_sized(&mut self, size: usize, num_refs: usize) -> Address {
        assert!(size % MOCK_CELL_ALIGN == 0);
        assert!(size >= (2 + num_refs) * BYTES_IN_WORD);
        let cell = self.cursor;
        assert!(cell + size <= self.end, "test heap exhausted");
        self.cursor = cell + size;
        unsafe {
            cell.store::<usize>(size);
            (cell + BYTES_IN_WORD).store::<usize>(num_refs);
        }
        cell
    }

    pub fn set_ref(&self, cell: Address, index: usize, target: Address) {
        let num_refs = unsafe { (cell + BYTES_IN_WORD).load::<usize>() };
        assert!(index < num_refs);
        unsafe { (cell + (2 + index) * BYTES_IN_WORD).store::<Address>(target) };
    }

    pub fn used_end(&self) -> Address {
        self.cursor
    }
}

/// Root scanner over a plain vector of cell addresses.
pub struct VecRoots(pub Vec<Address>);

impl RootScanner for VecRoots {
    fn scan_roots(&mut self, visitor: &mut dyn FnMut(Address)) {
        for root in &self.0 {
            visitor(*root);
        }
    }
}

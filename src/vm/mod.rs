//! External collaborators of the heap core.
//!
//! The heap core does not know how objects are encoded, how the hosting
//! runtime enumerates its roots, or how address space is materialized. It
//! consumes those services through the traits in this module; a hosting
//! runtime provides the implementations ("binding").

use crate::util::Address;

/// Object-layout services. All addresses passed in point to the first word
/// of an object ("cell"), inside an area the binding laid out.
///
/// The heap walks cells during marking, sweeping and verification, so the
/// binding must be able to answer size and reference-field queries for any
/// live object and for any dead filler it wrote via
/// [`fill_dead`](ObjectModel::fill_dead).
pub trait ObjectModel: 'static {
    /// The smallest cell the binding will ever allocate, in bytes. Must be
    /// compatible with the mark-bitmap granularity in use (see
    /// `TricolorHeapMarker`).
    const MIN_OBJECT_SIZE: usize;

    /// Size in bytes of the object whose cell is at `cell`. Word aligned.
    fn size_of(cell: Address) -> usize;

    /// Visit every outgoing reference of the object at `cell`. The visitor
    /// receives the referenced cell address; null references must not be
    /// reported.
    fn scan_object<F: FnMut(Address)>(cell: Address, f: F);

    /// Overwrite `[start, end)` with one or more dead filler objects so the
    /// range stays walkable via [`size_of`](ObjectModel::size_of).
    fn fill_dead(start: Address, end: Address);
}

/// Root enumeration service, invoked once per mark phase. Covers thread
/// stacks, globals, and any reference into the covered area from spaces the
/// collector treats as permanent.
pub trait RootScanner {
    fn scan_roots(&mut self, visitor: &mut dyn FnMut(Address));
}

/// Virtual-memory capability exposed by the operating environment:
/// reservation, commit and uncommit of address ranges. All sizes are
/// page-aligned by the callers.
pub trait VirtualMemory: Send + Sync {
    /// Reserve `size` bytes of address space without committing them.
    /// Returns [`Address::ZERO`] on failure.
    fn reserve(&self, size: usize) -> Address;
    fn commit(&self, start: Address, size: usize) -> bool;
    fn uncommit(&self, start: Address, size: usize) -> bool;
    fn release(&self, start: Address, size: usize);
}

/// Callback through which the allocation slow path requests a collection
/// when no chunk or region can satisfy a request. Returns true if the
/// collection made progress (some space may have been reclaimed), false if
/// no progress is possible, in which case the caller must treat the request
/// as out-of-memory.
///
/// The callback may run with the requesting allocator's refill lock held
/// (safepoint coordination lives outside this crate), so it must not
/// allocate from the requesting space; it typically parks the request
/// until a stop-the-world cycle has run mark and sweep.
pub trait GcCallback: Send + Sync {
    fn collect_garbage(&self, requested: usize) -> bool;
}

/// A [`GcCallback`] that never collects. Used by spaces that are sized up
/// front and by tests exercising exhaustion paths.
pub struct NoGc;

impl GcCallback for NoGc {
    fn collect_garbage(&self, _requested: usize) -> bool {
        false
    }
}

use crate::util::heap::chunk::{HeapFreeChunk, MIN_CHUNK_SIZE};
use crate::util::Address;
use crate::vm::ObjectModel;

/// Refill policy behind a bump-pointer allocator. The allocator's CAS fast
/// path never calls in here; only the slow path does, under the allocator's
/// refill lock.
///
/// Refilling is cooperative: `allocate_refill` repositions the allocator
/// and the requesting thread retries its CAS loop against the new state, so
/// a refill never returns a cell to its requester directly. The other entry
/// points (`allocate_large`, `allocate_overflow`, `allocate_chunk_list`) do
/// return memory, bypassing the linear space entirely.
pub trait Refiller {
    /// Whether refilling now is worthwhile. Policies refuse when
    /// `space_left` is still large enough that dumping it would waste more
    /// than the configured threshold.
    fn should_refill(&self, requested: usize, space_left: usize) -> bool;

    /// Retire the leftover `[leftover, leftover + leftover_size)` (as a
    /// free chunk when big enough, as dead matter otherwise) and return a
    /// formatted chunk to install as the allocator's new space, or
    /// [`Address::ZERO`] when no chunk can be produced.
    fn allocate_refill(&self, requested: usize, leftover: Address, leftover_size: usize)
        -> Address;

    /// Serve a request above the allocator's size limit.
    fn allocate_large(&self, size: usize) -> Address;

    /// Serve a request after `should_refill` declined; the linear space is
    /// left as is.
    fn allocate_overflow(&self, size: usize) -> Address;

    /// Allocate a TLAB of roughly `size` bytes as a chunk list, reusing the
    /// retired leftover as the first chunk when it is big enough. The
    /// result may thread multiple non-contiguous chunks through their
    /// `next` pointers.
    fn allocate_chunk_list(&self, size: usize, leftover: Address, leftover_size: usize)
        -> Address;

    /// Smallest chunk worth handing out (also the minimum acceptable TLAB
    /// chunk).
    fn min_chunk_size(&self) -> usize;

    /// Called while the heap is being made parsable before a collection.
    fn do_before_gc(&self) {}
}

/// Retire a leftover span: format it as a free chunk when it can carry a
/// header and meets `min_chunk_size`, otherwise fill it with dead matter.
/// Returns the chunk address, or [`Address::ZERO`] if the span was retired
/// as dead matter (or empty).
pub fn retire_chunk<VM: ObjectModel>(
    leftover: Address,
    leftover_size: usize,
    min_chunk_size: usize,
) -> Address {
    if leftover_size == 0 {
        return Address::ZERO;
    }
    if leftover_size < min_chunk_size.max(MIN_CHUNK_SIZE) {
        VM::fill_dead(leftover, leftover + leftover_size);
        return Address::ZERO;
    }
    HeapFreeChunk::format(leftover, leftover_size);
    leftover
}

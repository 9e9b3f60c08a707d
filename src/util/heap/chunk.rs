use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;
use crate::vm::ObjectModel;

/// Marker word written at the first word of every free chunk. Heap walkers
/// (sweep verifier, makeParsable) use it to tell reclaimed space apart from
/// object cells; the mutator never sees a chunk through a reference path.
pub const FREE_CHUNK_TAG: usize = 0xC4EE_F4EE;

/// In-place header of a free chunk. A chunk is a run of reclaimed
/// contiguous bytes, self-describing via this header written at its first
/// words. The view is transient: it exists only between a sweep and the
/// next allocation of the underlying memory.
#[repr(C)]
pub struct FreeChunkHeader {
    pub tag: usize,
    pub size: usize,
    pub next: Address,
    /// Only maintained by the doubly linked variant.
    pub prev: Address,
}

/// Minimum bytes needed to carry a chunk header.
pub const MIN_CHUNK_SIZE: usize = 4 * BYTES_IN_WORD;

const TAG_OFFSET: usize = 0;
const SIZE_OFFSET: usize = BYTES_IN_WORD;
const NEXT_OFFSET: usize = 2 * BYTES_IN_WORD;
const PREV_OFFSET: usize = 3 * BYTES_IN_WORD;

/// Accessors over singly linked free chunks.
pub struct HeapFreeChunk;

impl HeapFreeChunk {
    /// Write a chunk header over `[chunk, chunk + size)` with no successor.
    pub fn format(chunk: Address, size: usize) {
        Self::format_with_next(chunk, size, Address::ZERO);
    }

    pub fn format_with_next(chunk: Address, size: usize, next: Address) {
        debug_assert!(size >= MIN_CHUNK_SIZE, "chunk of {} bytes too small", size);
        debug_assert!(chunk.is_aligned_to(BYTES_IN_WORD));
        unsafe {
            (chunk + TAG_OFFSET).store::<usize>(FREE_CHUNK_TAG);
            (chunk + SIZE_OFFSET).store::<usize>(size);
            (chunk + NEXT_OFFSET).store::<Address>(next);
            (chunk + PREV_OFFSET).store::<Address>(Address::ZERO);
        }
    }

    pub fn is_free_chunk(addr: Address) -> bool {
        unsafe { (addr + TAG_OFFSET).load::<usize>() == FREE_CHUNK_TAG }
    }

    pub fn size(chunk: Address) -> usize {
        debug_assert!(Self::is_free_chunk(chunk));
        unsafe { (chunk + SIZE_OFFSET).load::<usize>() }
    }

    pub fn set_size(chunk: Address, size: usize) {
        debug_assert!(Self::is_free_chunk(chunk));
        unsafe { (chunk + SIZE_OFFSET).store::<usize>(size) }
    }

    pub fn next(chunk: Address) -> Address {
        debug_assert!(Self::is_free_chunk(chunk));
        unsafe { (chunk + NEXT_OFFSET).load::<Address>() }
    }

    pub fn set_next(chunk: Address, next: Address) {
        debug_assert!(Self::is_free_chunk(chunk));
        unsafe { (chunk + NEXT_OFFSET).store::<Address>(next) }
    }

    /// Total bytes threaded through a chunk list.
    pub fn list_size(head: Address) -> usize {
        let mut total = 0;
        let mut chunk = head;
        while !chunk.is_zero() {
            total += Self::size(chunk);
            chunk = Self::next(chunk);
        }
        total
    }

    /// Turn every chunk of a list into walkable dead matter. Used when the
    /// heap must become parsable (the chunk headers themselves are not
    /// objects).
    pub fn make_parsable<VM: ObjectModel>(head: Address) {
        let mut chunk = head;
        while !chunk.is_zero() {
            let next = Self::next(chunk);
            let size = Self::size(chunk);
            VM::fill_dead(chunk, chunk + size);
            chunk = next;
        }
    }
}

/// Accessors over doubly linked free chunks, used by the address-ordered
/// large-object lists where middle removal must be O(1).
pub struct DLinkedHeapFreeChunk;

impl DLinkedHeapFreeChunk {
    pub fn format(chunk: Address, size: usize) {
        HeapFreeChunk::format(chunk, size);
    }

    pub fn prev(chunk: Address) -> Address {
        debug_assert!(HeapFreeChunk::is_free_chunk(chunk));
        unsafe { (chunk + PREV_OFFSET).load::<Address>() }
    }

    pub fn set_prev(chunk: Address, prev: Address) {
        debug_assert!(HeapFreeChunk::is_free_chunk(chunk));
        unsafe { (chunk + PREV_OFFSET).store::<Address>(prev) }
    }

    /// Link `chunk` between `prev` and `next`; either neighbor may be zero.
    pub fn link_between(chunk: Address, prev: Address, next: Address) {
        HeapFreeChunk::set_next(chunk, next);
        Self::set_prev(chunk, prev);
        if !prev.is_zero() {
            HeapFreeChunk::set_next(prev, chunk);
        }
        if !next.is_zero() {
            Self::set_prev(next, chunk);
        }
    }

    /// Unlink `chunk` from its neighbors, returning `(prev, next)` so the
    /// owning list can fix its head and tail.
    pub fn unlink(chunk: Address) -> (Address, Address) {
        let prev = Self::prev(chunk);
        let next = HeapFreeChunk::next(chunk);
        if !prev.is_zero() {
            HeapFreeChunk::set_next(prev, next);
        }
        if !next.is_zero() {
            Self::set_prev(next, prev);
        }
        HeapFreeChunk::set_next(chunk, Address::ZERO);
        Self::set_prev(chunk, Address::ZERO);
        (prev, next)
    }
}

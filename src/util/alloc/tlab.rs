use crate::util::alloc::linear_space::LinearSpaceAllocator;
use crate::util::alloc::refill::Refiller;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::heap::chunk::HeapFreeChunk;
use crate::util::Address;
use crate::vm::ObjectModel;

/// Allocator serving both ordinary object requests (through the embedded
/// [`LinearSpaceAllocator`]) and TLAB requests. A TLAB is handed out as
/// free-chunk-formatted memory; when the linear space cannot provide a
/// single contiguous chunk, the refiller may return a TLAB made of several
/// non-contiguous chunks threaded through the free-chunk `next` pointers,
/// and callers must accept that shape.
pub struct MultiChunkTlabAllocator<VM: ObjectModel, R: Refiller> {
    linear: LinearSpaceAllocator<VM, R>,
}

impl<VM: ObjectModel, R: Refiller> MultiChunkTlabAllocator<VM, R> {
    pub fn new(refiller: R, size_limit: usize) -> Self {
        Self {
            linear: LinearSpaceAllocator::new(refiller, size_limit),
        }
    }

    pub fn initialize(&self, start: Address, size: usize) {
        self.linear.initialize(start, size);
    }

    pub fn refiller(&self) -> &R {
        self.linear.refiller()
    }

    pub fn free_space(&self) -> usize {
        self.linear.free_space()
    }

    pub fn in_current_chunk(&self, addr: Address) -> bool {
        self.linear.in_current_chunk(addr)
    }

    pub fn allocate_cleared(&self, size: usize) -> Address {
        self.linear.allocate_cleared(size)
    }

    pub fn allocate_raw(&self, size: usize) -> Address {
        self.linear.allocate_raw(size)
    }

    pub fn make_parsable(&self) {
        self.linear.make_parsable()
    }

    /// Allocate a TLAB of `size` bytes. The fast path carves a single
    /// chunk out of the linear space; the slow path may return a list of
    /// smaller chunks.
    pub fn allocate_tlab(&self, size: usize) -> Address {
        debug_assert!(size % BYTES_IN_WORD == 0);
        loop {
            let cell = self.linear.bump.try_allocate(size);
            if !cell.is_zero() {
                HeapFreeChunk::format(cell, size);
                return cell;
            }
            let cell = self.refill_or_allocate_tlab(size);
            if !cell.is_zero() {
                return cell;
            }
        }
    }

    fn refill_or_allocate_tlab(&self, size: usize) -> Address {
        let _guard = self.linear.refill_lock.lock().unwrap();
        let cell = self.linear.bump.top();
        if cell + size <= self.linear.bump.end() {
            // Raced with a refill; back to the fast path.
            return Address::ZERO;
        }
        let hard = self.linear.bump.hard_limit();
        // Force all racing allocators to this synchronization point and
        // take what is left as the TLAB's first chunk.
        let leftover = self.linear.bump.set_top_to_limit();
        let leftover_size = hard - leftover;
        if leftover_size == size {
            HeapFreeChunk::format(leftover, size);
            return leftover;
        }
        trace!(
            "TLAB slow path: {} requested, {} leftover",
            size,
            leftover_size
        );
        self.linear
            .refiller
            .allocate_chunk_list(size, leftover, leftover_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::alloc::refill::retire_chunk;
    use crate::util::test_util::MockVM;
    use std::sync::Mutex;

    /// Refiller that builds multi-chunk TLABs from a pool of fixed chunks.
    struct ChunkPoolRefiller {
        pool: Mutex<Vec<(Address, usize)>>,
        min_chunk: usize,
    }

    impl Refiller for ChunkPoolRefiller {
        fn should_refill(&self, _requested: usize, space_left: usize) -> bool {
            space_left < self.min_chunk
        }
        fn allocate_refill(
            &self,
            _requested: usize,
            leftover: Address,
            leftover_size: usize,
        ) -> Address {
            retire_chunk::<MockVM>(leftover, leftover_size, self.min_chunk);
            match self.pool.lock().unwrap().pop() {
                Some((addr, size)) => {
                    HeapFreeChunk::format(addr, size);
                    addr
                }
                None => Address::ZERO,
            }
        }
        fn allocate_large(&self, _size: usize) -> Address {
            Address::ZERO
        }
        fn allocate_overflow(&self, _size: usize) -> Address {
            Address::ZERO
        }
        fn allocate_chunk_list(
            &self,
            size: usize,
            leftover: Address,
            leftover_size: usize,
        ) -> Address {
            let first = retire_chunk::<MockVM>(leftover, leftover_size, self.min_chunk);
            let mut remaining = size;
            if !first.is_zero() {
                if leftover_size >= size {
                    return first;
                }
                remaining -= leftover_size;
            }
            // Thread pool chunks until the request is met.
            let mut head = Address::ZERO;
            let mut tail = first;
            let mut pool = self.pool.lock().unwrap();
            while remaining > 0 {
                let Some((addr, chunk_size)) = pool.pop() else {
                    break;
                };
                HeapFreeChunk::format(addr, chunk_size);
                if tail.is_zero() {
                    head = addr;
                } else {
                    HeapFreeChunk::set_next(tail, addr);
                }
                tail = addr;
                remaining = remaining.saturating_sub(chunk_size);
            }
            if !first.is_zero() {
                first
            } else {
                head
            }
        }
        fn min_chunk_size(&self) -> usize {
            self.min_chunk
        }
    }

    fn aligned_backing(bytes: usize) -> (Vec<u8>, Address) {
        let v = vec![0u8; bytes + 16];
        let a = Address::from_ptr(v.as_ptr()).align_up(16);
        (v, a)
    }

    #[test]
    fn tlab_fast_path_formats_single_chunk() {
        let (_keep, base) = aligned_backing(1024);
        let allocator = MultiChunkTlabAllocator::<MockVM, _>::new(
            ChunkPoolRefiller {
                pool: Mutex::new(vec![]),
                min_chunk: 64,
            },
            4096,
        );
        allocator.initialize(base, 1024);
        let tlab = allocator.allocate_tlab(256);
        assert_eq!(tlab, base);
        assert!(HeapFreeChunk::is_free_chunk(tlab));
        assert_eq!(HeapFreeChunk::size(tlab), 256);
        assert!(HeapFreeChunk::next(tlab).is_zero());
    }

    #[test]
    fn tlab_slow_path_may_be_multi_chunk() {
        let (_keep_a, base) = aligned_backing(256);
        let (_keep_b, extra) = aligned_backing(256);
        let allocator = MultiChunkTlabAllocator::<MockVM, _>::new(
            ChunkPoolRefiller {
                pool: Mutex::new(vec![(extra, 256)]),
                min_chunk: 64,
            },
            4096,
        );
        allocator.initialize(base, 256);
        // Consume most of the space so the TLAB request overflows it.
        assert!(!allocator.allocate_cleared(128).is_zero());
        let tlab = allocator.allocate_tlab(256);
        // First chunk is the leftover, threaded to a pool chunk.
        assert_eq!(tlab, base + 128usize);
        assert_eq!(HeapFreeChunk::size(tlab), 128);
        let second = HeapFreeChunk::next(tlab);
        assert_eq!(second, extra);
        assert_eq!(HeapFreeChunk::size(second), 256);
        assert_eq!(HeapFreeChunk::list_size(tlab), 384);
    }

    #[test]
    fn tlab_exact_leftover_is_returned_whole() {
        let (_keep, base) = aligned_backing(256);
        let allocator = MultiChunkTlabAllocator::<MockVM, _>::new(
            ChunkPoolRefiller {
                pool: Mutex::new(vec![]),
                min_chunk: 64,
            },
            4096,
        );
        allocator.initialize(base, 256);
        assert!(!allocator.allocate_cleared(128).is_zero());
        // Exactly the leftover (headroom included) is requested.
        let tlab = allocator.allocate_tlab(128);
        assert_eq!(tlab, base + 128usize);
        assert_eq!(HeapFreeChunk::size(tlab), 128);
    }
}

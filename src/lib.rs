//! regiongc is a region-based heap-management core: a fixed-size region
//! allocator with bitset tracking, bump-pointer and TLAB allocators
//! refilled from segregated free lists, a large-object space, and a
//! tricolor mark-bitmap tracing engine with finger-based scanning and
//! marking-stack overflow recovery.
//!
//! The crate does not define object encoding, root enumeration, or the
//! virtual-memory primitives; a hosting runtime supplies those through the
//! traits in [`vm`]. Mutators may allocate concurrently through the
//! lock-free fast paths; collection is stop-the-world and driven through
//! [`mark::TricolorHeapMarker`] and the [`sweep::Sweeper`] protocol.

#[macro_use]
extern crate log;

pub mod heap;
pub mod mark;
pub mod policy;
pub mod sweep;
pub mod util;
pub mod vm;

pub use heap::{HeapOptions, MarkSweepHeap};
pub use util::Address;

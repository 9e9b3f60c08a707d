pub mod bump_pointer;
pub mod linear_space;
pub mod refill;
pub mod tlab;

pub use bump_pointer::AtomicBumpPointerAllocator;
pub use linear_space::LinearSpaceAllocator;
pub use refill::Refiller;
pub use tlab::MultiChunkTlabAllocator;

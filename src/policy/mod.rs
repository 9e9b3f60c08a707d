pub mod contiguous;
pub mod free_space;
pub mod largeobjectspace;

pub use contiguous::ContiguousHeapSpace;
pub use free_space::{FreeHeapSpaceManager, FreeSpaceOptions};
pub use largeobjectspace::LargeObjectSpace;

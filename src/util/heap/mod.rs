pub mod account;
pub mod chunk;
pub mod region_allocator;
pub mod region_bitset;
pub mod region_list;
pub mod region_table;

pub use account::{HeapAccount, RegionManager};
pub use region_allocator::FixedSizeRegionAllocator;
pub use region_bitset::RegionBitSet;
pub use region_list::{HeapRegionList, RegionLinkTable};
pub use region_table::{HeapRegionInfo, RegionTable};

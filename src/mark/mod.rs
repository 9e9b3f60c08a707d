pub mod marker;
pub mod rescan_map;
pub mod stack;

pub use marker::{MarkerOptions, TricolorHeapMarker};
pub use rescan_map::{RescanMap, DEFAULT_LOG2_RESCAN_REGION};
pub use stack::{MarkingStack, DEFAULT_MARKING_STACK_CAPACITY};

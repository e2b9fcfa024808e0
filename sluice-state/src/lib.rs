//! Time-sliced window state: slices of buffered tuples, the stores that own them, the cache
//! that speeds up slice lookups and the spill files that move slices out of memory.

pub mod error;
pub mod file;
pub mod memory_controller;
pub mod metrics;
pub mod paged_vector;
pub mod slice;
pub mod slice_assigner;
pub mod slice_cache;
pub mod store;

pub use error::{Result, SliceStoreError};
pub use paged_vector::PagedVector;
pub use slice::{AggregateState, AggregationSlice, NljSlice, Slice, SliceBase};
pub use slice_assigner::SliceAssigner;
pub use slice_cache::{HitsAndMisses, SliceCache};
pub use store::{
    CreateSliceFn, DefaultTimeBasedSliceStore, FileBackedTimeBasedSliceStore, SpillOptions,
    WindowInfoState, WindowSlicesStore, WindowsToSlices,
};

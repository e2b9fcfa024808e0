use crate::error::Result;
use crate::slice::Slice;
use crate::slice_assigner::SliceAssigner;
use sluice_types::{JoinSide, Timestamp, WindowInfo, WorkerThreadId};
use std::collections::BTreeMap;
use std::sync::Arc;

mod default;
mod file_backed;

pub use default::DefaultTimeBasedSliceStore;
pub use file_backed::{FileBackedTimeBasedSliceStore, SpillOptions};

/// Builds the slice for `[start, end)`. Invoked at most once per interval.
pub type CreateSliceFn<'a, S> = &'a (dyn Fn(Timestamp, Timestamp) -> Result<Arc<S>> + Sync);

/// Slices of a window, ordered by slice start.
pub type WindowsToSlices<S> = BTreeMap<WindowInfo, Vec<Arc<S>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowInfoState {
    WaitingForSlices,
    EmittedToProbe,
}

/// The ordered set of live slices of one operator instance, plus the windows they belong to.
pub trait WindowSlicesStore<S: Slice>: Send + Sync {
    fn slice_assigner(&self) -> &SliceAssigner;

    /// Returns the slice covering `ts`, creating it through `create` if it does not exist yet.
    /// Concurrent callers for the same interval all observe the same slice; creation of
    /// different intervals proceeds in parallel.
    fn get_slices_or_create(
        &self,
        ts: Timestamp,
        create: Option<CreateSliceFn<'_, S>>,
    ) -> Result<Vec<Arc<S>>>;

    /// Every window ending at or before `watermark` that has not been emitted yet, with its
    /// slices. A watermark that does not advance past the previous one yields nothing.
    fn get_slices_and_windows_ready_for_trigger(
        &self,
        watermark: Timestamp,
    ) -> Result<WindowsToSlices<S>>;

    /// Every window that has not been emitted yet, regardless of the watermark.
    fn get_all_non_triggered_slices(&self) -> Result<WindowsToSlices<S>>;

    /// Drops emitted windows and slices that no future window can reference. Returns the
    /// removed slices.
    fn garbage_collect_slices_and_windows(&self, watermark: Timestamp) -> Result<Vec<Arc<S>>>;

    fn get_slice_by_slice_end(&self, slice_end: Timestamp) -> Option<Arc<S>>;

    fn get_number_of_slices(&self) -> usize;

    /// All live slices, ordered by slice start.
    fn get_all_slices(&self) -> Vec<Arc<S>>;

    /// Adds an already populated slice, e.g. one restored from a state file.
    fn insert_slice(&self, slice: Arc<S>) -> Result<()>;

    /// Largest watermark that triggered windows so far.
    fn last_trigger_watermark(&self) -> Timestamp;

    fn delete_state(&self) -> Result<()>;

    /// Notes that `thread` appended to `slice` on `side`.
    fn mark_altered(&self, _thread: WorkerThreadId, _side: JoinSide, _slice: &Arc<S>) {}

    /// Called at the end of every input buffer; stores may use it to move state out of memory.
    fn update_slices(&self, _thread: WorkerThreadId, _side: JoinSide) -> Result<()> {
        Ok(())
    }

    /// Brings every slice fully back into memory, e.g. before the state is written out.
    fn load_all_slices(&self) -> Result<()> {
        Ok(())
    }
}

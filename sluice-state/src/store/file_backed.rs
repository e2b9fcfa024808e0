use super::{
    CreateSliceFn, DefaultTimeBasedSliceStore, WindowSlicesStore, WindowsToSlices,
};
use crate::error::Result;
use crate::memory_controller::MemoryController;
use crate::metrics::{SPILLED_BYTES, SPILL_READS};
use crate::slice::{NljSlice, Slice};
use crate::slice_assigner::SliceAssigner;
use parking_lot::Mutex;
use sluice_types::{BufferProvider, JoinSide, Timestamp, WorkerThreadId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpillOptions {
    /// A paged vector is only written out once it holds more than this many bytes.
    pub min_write_state_size: u64,
    /// Slices ending within this distance of the last watermark are about to be triggered
    /// and stay in memory.
    pub watermark_lookahead: u64,
}

/// Join slice store that moves the paged vectors of not-yet-triggerable slices to disk after
/// every input buffer and reads them back before the slices are triggered.
pub struct FileBackedTimeBasedSliceStore {
    inner: DefaultTimeBasedSliceStore<NljSlice>,
    controller: MemoryController,
    provider: Arc<dyn BufferProvider>,
    options: SpillOptions,
    number_of_threads: u64,
    altered: Mutex<HashMap<(WorkerThreadId, JoinSide), Vec<Weak<NljSlice>>>>,
}

impl FileBackedTimeBasedSliceStore {
    pub fn new(
        assigner: SliceAssigner,
        controller: MemoryController,
        provider: Arc<dyn BufferProvider>,
        options: SpillOptions,
        number_of_threads: u64,
    ) -> Self {
        info!(
            "spilling slices to {} with {:?}",
            controller.working_dir().display(),
            options
        );
        Self {
            inner: DefaultTimeBasedSliceStore::new(assigner),
            controller,
            provider,
            options,
            number_of_threads,
            altered: Mutex::new(HashMap::new()),
        }
    }

    pub fn memory_controller(&self) -> &MemoryController {
        &self.controller
    }

    fn threads(&self) -> impl Iterator<Item = WorkerThreadId> {
        (0..self.number_of_threads).map(WorkerThreadId)
    }

    fn spill(&self, slice: &NljSlice, thread: WorkerThreadId, side: JoinSide) -> Result<()> {
        let last_watermark = self.inner.last_trigger_watermark();
        if slice.slice_end() <= last_watermark.saturating_add(self.options.watermark_lookahead) {
            return Ok(());
        }

        let mut vector = slice.get_paged_vector_ref(thread, side);
        // checked under the vector lock so a concurrent trigger cannot miss spilled tuples
        if slice.is_triggered()
            || vector.state_size_in_memory() as u64 <= self.options.min_write_state_size
        {
            return Ok(());
        }

        let provider = self.provider.as_ref();
        let mut writer = if vector.tuples_on_disk() == 0 {
            self.controller
                .create_writer(slice.slice_end(), thread, side, provider)?
        } else {
            self.controller
                .writer(slice.slice_end(), thread, side, provider)?
        };
        let written = match vector.write_to_file(&mut writer, self.controller.file_layout()) {
            Ok(written) => written,
            Err(e) => {
                // the tuples are still in memory, so the next spill must not see this attempt
                if let Err(rollback) = writer.rollback() {
                    warn!(
                        "failed to roll back spill of slice [{}, {}): {}",
                        slice.slice_start(),
                        slice.slice_end(),
                        rollback
                    );
                }
                return Err(e);
            }
        };
        SPILLED_BYTES.inc_by(written);
        debug!(
            "spilled {} bytes of slice [{}, {}) for thread {} {}",
            written,
            slice.slice_start(),
            slice.slice_end(),
            thread,
            side
        );
        Ok(())
    }

    fn read_back(&self, slice: &NljSlice) -> Result<()> {
        slice.mark_triggered();
        for thread in self.threads() {
            for side in JoinSide::BOTH {
                let mut vector = slice.get_paged_vector_ref(thread, side);
                if vector.tuples_on_disk() == 0 {
                    continue;
                }

                let mut reader =
                    self.controller
                        .reader(slice.slice_end(), thread, side, self.provider.as_ref())?;
                vector.read_from_file(
                    self.provider.as_ref(),
                    &mut reader,
                    self.controller.file_layout(),
                )?;
                drop(reader);
                self.controller
                    .delete_files(slice.slice_end(), thread, side)?;
                SPILL_READS.inc();
            }
        }
        Ok(())
    }

    fn read_back_windows(&self, windows: &WindowsToSlices<NljSlice>) -> Result<()> {
        let mut seen = HashSet::new();
        for slice in windows.values().flatten() {
            if seen.insert(slice.slice_end()) {
                self.read_back(slice)?;
            }
        }
        Ok(())
    }

    fn delete_slice_files(&self, slice: &NljSlice) -> Result<()> {
        for thread in self.threads() {
            for side in JoinSide::BOTH {
                self.controller
                    .delete_files(slice.slice_end(), thread, side)?;
            }
        }
        Ok(())
    }
}

impl WindowSlicesStore<NljSlice> for FileBackedTimeBasedSliceStore {
    fn slice_assigner(&self) -> &SliceAssigner {
        self.inner.slice_assigner()
    }

    fn get_slices_or_create(
        &self,
        ts: Timestamp,
        create: Option<CreateSliceFn<'_, NljSlice>>,
    ) -> Result<Vec<Arc<NljSlice>>> {
        self.inner.get_slices_or_create(ts, create)
    }

    fn get_slices_and_windows_ready_for_trigger(
        &self,
        watermark: Timestamp,
    ) -> Result<WindowsToSlices<NljSlice>> {
        let windows = self
            .inner
            .get_slices_and_windows_ready_for_trigger(watermark)?;
        self.read_back_windows(&windows)?;
        Ok(windows)
    }

    fn get_all_non_triggered_slices(&self) -> Result<WindowsToSlices<NljSlice>> {
        let windows = self.inner.get_all_non_triggered_slices()?;
        self.read_back_windows(&windows)?;
        Ok(windows)
    }

    fn garbage_collect_slices_and_windows(
        &self,
        watermark: Timestamp,
    ) -> Result<Vec<Arc<NljSlice>>> {
        let removed = self.inner.garbage_collect_slices_and_windows(watermark)?;
        for slice in &removed {
            self.delete_slice_files(slice)?;
        }
        self.altered
            .lock()
            .values_mut()
            .for_each(|slices| slices.retain(|s| s.strong_count() > 0));
        Ok(removed)
    }

    fn get_slice_by_slice_end(&self, slice_end: Timestamp) -> Option<Arc<NljSlice>> {
        self.inner.get_slice_by_slice_end(slice_end)
    }

    fn get_number_of_slices(&self) -> usize {
        self.inner.get_number_of_slices()
    }

    fn get_all_slices(&self) -> Vec<Arc<NljSlice>> {
        self.inner.get_all_slices()
    }

    fn insert_slice(&self, slice: Arc<NljSlice>) -> Result<()> {
        self.inner.insert_slice(slice)
    }

    fn last_trigger_watermark(&self) -> Timestamp {
        self.inner.last_trigger_watermark()
    }

    fn delete_state(&self) -> Result<()> {
        self.altered.lock().clear();
        self.inner.delete_state()?;
        self.controller.delete_all()?;
        Ok(())
    }

    fn mark_altered(&self, thread: WorkerThreadId, side: JoinSide, slice: &Arc<NljSlice>) {
        let mut altered = self.altered.lock();
        let slices = altered.entry((thread, side)).or_default();
        if !slices.iter().any(|s| s.as_ptr() == Arc::as_ptr(slice)) {
            slices.push(Arc::downgrade(slice));
        }
    }

    fn update_slices(&self, thread: WorkerThreadId, side: JoinSide) -> Result<()> {
        let slices = self
            .altered
            .lock()
            .remove(&(thread, side))
            .unwrap_or_default();

        for slice in slices.iter().filter_map(Weak::upgrade) {
            if slice.base().is_retired() {
                continue;
            }
            self.spill(&slice, thread, side)?;
        }
        Ok(())
    }

    fn load_all_slices(&self) -> Result<()> {
        for slice in self.inner.get_all_slices() {
            self.read_back(&slice)?;
        }
        Ok(())
    }
}

impl Drop for FileBackedTimeBasedSliceStore {
    fn drop(&mut self) {
        if let Err(e) = self.controller.delete_all() {
            warn!("failed to clean up spill files: {}", e);
        }
    }
}

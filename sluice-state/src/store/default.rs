use super::{CreateSliceFn, WindowInfoState, WindowSlicesStore, WindowsToSlices};
use crate::error::{Result, SliceStoreError};
use crate::metrics::{LIVE_SLICES, TRIGGERED_WINDOWS};
use crate::slice::Slice;
use crate::slice_assigner::SliceAssigner;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use sluice_types::{Timestamp, WindowInfo};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

struct SlicesAndState<S> {
    slices: Vec<Arc<S>>,
    state: WindowInfoState,
}

struct Windows<S> {
    windows: BTreeMap<WindowInfo, SlicesAndState<S>>,
    last_trigger_watermark: Timestamp,
}

/// Keeps all slices in memory, keyed by slice end.
pub struct DefaultTimeBasedSliceStore<S> {
    assigner: SliceAssigner,
    slices: RwLock<BTreeMap<Timestamp, Arc<OnceCell<Arc<S>>>>>,
    windows: RwLock<Windows<S>>,
}

impl<S: Slice> DefaultTimeBasedSliceStore<S> {
    pub fn new(assigner: SliceAssigner) -> Self {
        Self {
            assigner,
            slices: RwLock::new(BTreeMap::new()),
            windows: RwLock::new(Windows {
                windows: BTreeMap::new(),
                last_trigger_watermark: Timestamp::INITIAL,
            }),
        }
    }

    fn register_in_windows(&self, slice: &Arc<S>) {
        let mut windows = self.windows.write();
        let last_trigger_watermark = windows.last_trigger_watermark;
        for window in self
            .assigner
            .windows_for_slice(slice.slice_start(), slice.slice_end())
        {
            if window.window_end <= last_trigger_watermark {
                debug!(
                    "slice [{}, {}) arrived after window {} was triggered",
                    slice.slice_start(),
                    slice.slice_end(),
                    window
                );
                continue;
            }

            let entry = windows
                .windows
                .entry(window)
                .or_insert_with(|| SlicesAndState {
                    slices: vec![],
                    state: WindowInfoState::WaitingForSlices,
                });
            let pos = entry
                .slices
                .partition_point(|s| s.slice_start() < slice.slice_start());
            entry.slices.insert(pos, slice.clone());
        }
    }

    /// Drops the cell of a failed creation unless another caller already holds it.
    fn remove_empty_cell(&self, end: Timestamp, cell: &Arc<OnceCell<Arc<S>>>) {
        let mut slices = self.slices.write();
        let unshared = slices
            .get(&end)
            .is_some_and(|c| Arc::ptr_eq(c, cell) && Arc::strong_count(c) == 2);
        if unshared && cell.get().is_none() {
            slices.remove(&end);
        }
    }

    fn take_windows(
        &self,
        windows: &mut Windows<S>,
        ready: impl Fn(&WindowInfo) -> bool,
    ) -> WindowsToSlices<S> {
        let mut result = BTreeMap::new();
        for (window, slices_and_state) in windows.windows.iter_mut() {
            if slices_and_state.state == WindowInfoState::WaitingForSlices && ready(window) {
                slices_and_state.state = WindowInfoState::EmittedToProbe;
                result.insert(*window, slices_and_state.slices.clone());
            }
        }
        TRIGGERED_WINDOWS.inc_by(result.len() as u64);
        result
    }
}

impl<S: Slice> WindowSlicesStore<S> for DefaultTimeBasedSliceStore<S> {
    fn slice_assigner(&self) -> &SliceAssigner {
        &self.assigner
    }

    fn get_slices_or_create(
        &self,
        ts: Timestamp,
        create: Option<CreateSliceFn<'_, S>>,
    ) -> Result<Vec<Arc<S>>> {
        let start = self.assigner.slice_start(ts);
        let end = self.assigner.slice_end(ts);

        let existing = self.slices.read().get(&end).cloned();
        if let Some(slice) = existing.as_ref().and_then(|cell| cell.get()) {
            return Ok(vec![slice.clone()]);
        }

        let Some(create) = create else {
            return Err(SliceStoreError::MissingSliceCreator { timestamp: ts });
        };

        let cell = match existing {
            Some(cell) => cell,
            None => self.slices.write().entry(end).or_default().clone(),
        };

        let mut created = false;
        let slice = match cell.get_or_try_init(|| {
            created = true;
            trace!("creating slice [{}, {})", start, end);
            create(start, end)
        }) {
            Ok(slice) => slice.clone(),
            Err(e) => {
                self.remove_empty_cell(end, &cell);
                return Err(e);
            }
        };

        if created {
            LIVE_SLICES.inc();
            self.register_in_windows(&slice);
        }

        Ok(vec![slice])
    }

    fn get_slices_and_windows_ready_for_trigger(
        &self,
        watermark: Timestamp,
    ) -> Result<WindowsToSlices<S>> {
        let mut windows = self.windows.write();
        if watermark <= windows.last_trigger_watermark {
            trace!(
                "ignoring watermark {} at or below {}",
                watermark,
                windows.last_trigger_watermark
            );
            return Ok(BTreeMap::new());
        }

        let ready = self.take_windows(&mut windows, |w| w.window_end <= watermark);
        windows.last_trigger_watermark = watermark;
        Ok(ready)
    }

    fn get_all_non_triggered_slices(&self) -> Result<WindowsToSlices<S>> {
        let mut windows = self.windows.write();
        Ok(self.take_windows(&mut windows, |_| true))
    }

    fn garbage_collect_slices_and_windows(&self, watermark: Timestamp) -> Result<Vec<Arc<S>>> {
        self.windows.write().windows.retain(|window, slices_and_state| {
            !(slices_and_state.state == WindowInfoState::EmittedToProbe
                && window.window_end <= watermark)
        });

        let size = self.assigner.window_size();
        let mut removed = vec![];
        self.slices.write().retain(|end, cell| match cell.get() {
            Some(slice) if slice.slice_start().0.saturating_add(size) <= watermark.0 => {
                removed.push(slice.clone());
                false
            }
            Some(_) => true,
            None => *end > watermark || Arc::strong_count(cell) > 1,
        });

        for slice in &removed {
            slice.base().retire();
        }
        LIVE_SLICES.sub(removed.len() as i64);
        if !removed.is_empty() {
            debug!(
                "garbage collected {} slices at watermark {}",
                removed.len(),
                watermark
            );
        }
        Ok(removed)
    }

    fn get_slice_by_slice_end(&self, slice_end: Timestamp) -> Option<Arc<S>> {
        self.slices.read().get(&slice_end)?.get().cloned()
    }

    fn get_number_of_slices(&self) -> usize {
        self.slices
            .read()
            .values()
            .filter(|cell| cell.get().is_some())
            .count()
    }

    fn get_all_slices(&self) -> Vec<Arc<S>> {
        self.slices
            .read()
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect()
    }

    fn insert_slice(&self, slice: Arc<S>) -> Result<()> {
        let end = slice.slice_end();
        if self.assigner.slice_start(slice.slice_start()) != slice.slice_start()
            || self.assigner.slice_end(slice.slice_start()) != end
        {
            return Err(SliceStoreError::Precondition(format!(
                "slice [{}, {}) does not match the slicing of this store",
                slice.slice_start(),
                end
            )));
        }

        {
            let mut slices = self.slices.write();
            let cell = slices.entry(end).or_default();
            if cell.set(slice.clone()).is_err() {
                return Err(SliceStoreError::Precondition(format!(
                    "a slice ending at {end} already exists"
                )));
            }
        }

        LIVE_SLICES.inc();
        self.register_in_windows(&slice);
        Ok(())
    }

    fn last_trigger_watermark(&self) -> Timestamp {
        self.windows.read().last_trigger_watermark
    }

    fn delete_state(&self) -> Result<()> {
        let slices = std::mem::take(&mut *self.slices.write());
        let mut removed = 0;
        for slice in slices.values().filter_map(|cell| cell.get()) {
            slice.base().retire();
            removed += 1;
        }
        LIVE_SLICES.sub(removed);
        self.windows.write().windows.clear();
        Ok(())
    }
}

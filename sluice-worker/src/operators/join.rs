use super::handler::{HandlerOptions, HandlerRuntime, SliceStoreOptions, WindowHandlerCore};
use super::WindowBasedOperatorHandler;
use crate::pipeline::{EmittedNljWindowTrigger, PipelineExecutionContext, TriggerTask};
use lazy_static::lazy_static;
use prometheus::{register_int_counter, IntCounter};
use sluice_state::metrics::EMITTED_CHUNKS;
use sluice_state::{
    FileBackedTimeBasedSliceStore, NljSlice, SliceStoreError, WindowSlicesStore, WindowsToSlices,
};
use sluice_types::{ChunkNumber, MemoryLayout, SliceId, Timestamp};
use std::sync::Arc;
use tracing::debug;

lazy_static! {
    static ref TRIGGERED_SLICE_PAIRS: IntCounter = register_int_counter!(
        "sluice_join_triggered_slice_pairs",
        "Number of (left, right) slice pairs handed to the join probe"
    )
    .unwrap();
}

/// Operator handler of a windowed nested-loop join.
pub struct StreamJoinOperatorHandler {
    core: WindowHandlerCore<NljSlice>,
    left_layout: MemoryLayout,
    right_layout: MemoryLayout,
}

impl StreamJoinOperatorHandler {
    pub fn new(
        options: HandlerOptions,
        left_layout: MemoryLayout,
        right_layout: MemoryLayout,
    ) -> sluice_state::Result<Self> {
        for layout in [&left_layout, &right_layout] {
            if !layout.is_valid() {
                return Err(SliceStoreError::InvalidLayout(format!("{layout:?}")));
            }
        }

        Ok(Self {
            core: WindowHandlerCore::new(options)?,
            left_layout,
            right_layout,
        })
    }

    pub fn left_layout(&self) -> &MemoryLayout {
        &self.left_layout
    }

    pub fn right_layout(&self) -> &MemoryLayout {
        &self.right_layout
    }
}

impl WindowBasedOperatorHandler for StreamJoinOperatorHandler {
    type Slice = NljSlice;

    fn core(&self) -> &WindowHandlerCore<NljSlice> {
        &self.core
    }

    fn create_new_slice(
        &self,
        start: Timestamp,
        end: Timestamp,
        runtime: &HandlerRuntime,
    ) -> sluice_state::Result<Arc<NljSlice>> {
        Ok(Arc::new(NljSlice::new(
            start,
            end,
            SliceId(end.0),
            runtime.number_of_threads,
            self.left_layout,
            self.right_layout,
        )?))
    }

    fn create_store(
        &self,
        runtime: &HandlerRuntime,
    ) -> sluice_state::Result<Box<dyn WindowSlicesStore<NljSlice>>> {
        let options = self.core.options();
        let assigner = *self.core.slice_assigner();
        match (&options.slice_store, options.memory_controller()?) {
            (SliceStoreOptions::FileBacked { spill, .. }, Some(controller)) => {
                Ok(Box::new(FileBackedTimeBasedSliceStore::new(
                    assigner,
                    controller,
                    runtime.provider.clone(),
                    *spill,
                    runtime.number_of_threads,
                )))
            }
            _ => Ok(options.default_store(assigner)),
        }
    }

    /// Emits every ordered (left, right) pair of each window's slices, both loops in ascending
    /// slice start. Chunk numbers restart at [`ChunkNumber::INITIAL`] for every window and the
    /// final pair carries `is_last_chunk`.
    fn trigger_slices(
        &self,
        windows: WindowsToSlices<NljSlice>,
        ctx: &dyn PipelineExecutionContext,
    ) -> anyhow::Result<()> {
        for (window_info, slices) in windows {
            if slices.is_empty() {
                continue;
            }
            let sequence_number = self.core.next_sequence_number();
            let total = slices.len() * slices.len();
            debug!(
                "window {} with {} slices becomes {} chunks",
                window_info,
                slices.len(),
                total
            );

            let mut chunk_number = ChunkNumber::INITIAL;
            let mut emitted = 0;
            for slice_left in &slices {
                for slice_right in &slices {
                    emitted += 1;
                    ctx.emit(TriggerTask::Join(EmittedNljWindowTrigger {
                        window_info,
                        slice_left: slice_left.clone(),
                        slice_right: slice_right.clone(),
                        chunk_number,
                        is_last_chunk: emitted == total,
                        sequence_number,
                        origin_id: self.core.output_origin(),
                    }))?;
                    chunk_number = chunk_number.next();
                }
            }

            EMITTED_CHUNKS.inc_by(total as u64);
            TRIGGERED_SLICE_PAIRS.inc_by(total as u64);
        }
        Ok(())
    }
}

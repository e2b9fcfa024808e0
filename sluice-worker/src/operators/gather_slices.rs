use super::{ExecutableOperator, ExecutionContext, WindowBasedOperatorHandler};
use crate::time_function::TimeFunction;
use sluice_state::SliceStoreError;
use sluice_types::{Buffer, Timestamp};
use std::sync::Arc;
use tracing::trace;

const SLOT: usize = std::mem::size_of::<u64>();

/// Creates every slice a buffer will need before the buffer is built, so the build does not
/// hit the store once per slice switch.
pub struct GatherSlices<H> {
    handler: Arc<H>,
    time_function: Box<dyn TimeFunction>,
}

pub struct GatherSlicesLocalState {
    /// distinct slice starts of the current buffer, one little-endian u64 per slot
    starts: Buffer,
    len: usize,
}

impl GatherSlicesLocalState {
    fn contains(&self, start: u64) -> sluice_state::Result<bool> {
        for i in 0..self.len {
            if self.starts.read_u64(i * SLOT)? == start {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn slice_starts(&self) -> sluice_state::Result<Vec<Timestamp>> {
        (0..self.len)
            .map(|i| Ok(Timestamp(self.starts.read_u64(i * SLOT)?)))
            .collect()
    }
}

impl<H: WindowBasedOperatorHandler> GatherSlices<H> {
    pub fn new(handler: Arc<H>, time_function: Box<dyn TimeFunction>) -> Self {
        Self {
            handler,
            time_function,
        }
    }
}

impl<H: WindowBasedOperatorHandler> ExecutableOperator for GatherSlices<H> {
    type LocalState = GatherSlicesLocalState;

    fn open(&self, ctx: &ExecutionContext<'_>) -> anyhow::Result<GatherSlicesLocalState> {
        let size = SLOT * ctx.number_of_records.max(1);
        let starts = ctx
            .pipeline
            .buffer_provider()
            .get_unpooled_buffer(size)
            .ok_or(SliceStoreError::AllocationFailed { size })?;
        Ok(GatherSlicesLocalState { starts, len: 0 })
    }

    fn execute(
        &self,
        ctx: &ExecutionContext<'_>,
        local: &mut GatherSlicesLocalState,
        record: &[u8],
    ) -> anyhow::Result<()> {
        let ts = self.time_function.get_ts(ctx, record)?;
        let start = self.handler.core().slice_assigner().slice_start(ts).0;
        if !local.contains(start)? {
            local.starts.write_u64(local.len * SLOT, start)?;
            local.len += 1;
        }
        Ok(())
    }

    fn close(&self, _ctx: &ExecutionContext<'_>, local: GatherSlicesLocalState) -> anyhow::Result<()> {
        let store = self.handler.core().store()?;
        let create = self.handler.get_create_new_slices_function();
        let starts = local.slice_starts()?;
        trace!("gathered {} distinct slices", starts.len());
        for start in starts {
            store.get_slices_or_create(start, Some(&*create))?;
        }
        Ok(())
    }
}

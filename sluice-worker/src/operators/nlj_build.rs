use super::join::StreamJoinOperatorHandler;
use super::{resolve_slice, ExecutableOperator, ExecutionContext, WindowBasedOperatorHandler};
use crate::time_function::TimeFunction;
use sluice_state::{NljSlice, Slice};
use sluice_types::JoinSide;
use std::sync::Arc;
use tracing::trace;

/// Appends the records of one join side to the slices of their timestamps.
pub struct NljBuild {
    handler: Arc<StreamJoinOperatorHandler>,
    side: JoinSide,
    time_function: Box<dyn TimeFunction>,
}

/// The slice the previous record of this buffer went to.
#[derive(Default)]
pub struct NljBuildLocalState {
    current: Option<Arc<NljSlice>>,
}

impl NljBuild {
    pub fn new(
        handler: Arc<StreamJoinOperatorHandler>,
        side: JoinSide,
        time_function: Box<dyn TimeFunction>,
    ) -> Self {
        Self {
            handler,
            side,
            time_function,
        }
    }

    pub fn side(&self) -> JoinSide {
        self.side
    }
}

impl ExecutableOperator for NljBuild {
    type LocalState = NljBuildLocalState;

    fn open(&self, _ctx: &ExecutionContext<'_>) -> anyhow::Result<NljBuildLocalState> {
        self.handler.core().store()?;
        Ok(NljBuildLocalState::default())
    }

    fn execute(
        &self,
        ctx: &ExecutionContext<'_>,
        local: &mut NljBuildLocalState,
        record: &[u8],
    ) -> anyhow::Result<()> {
        let ts = self.time_function.get_ts(ctx, record)?;
        let thread = ctx.worker_thread_id;

        let covered = local
            .current
            .as_ref()
            .is_some_and(|s| s.slice_start() <= ts && ts < s.slice_end());

        if !covered {
            let store = self.handler.core().store()?;
            let slice = resolve_slice(self.handler.as_ref(), store, thread, self.side, ts)?;
            trace!(
                "thread {} {} switches to slice [{}, {})",
                thread,
                self.side,
                slice.slice_start(),
                slice.slice_end()
            );
            store.mark_altered(thread, self.side, &slice);
            local.current = Some(slice);
        }

        let Some(slice) = &local.current else {
            unreachable!("current slice was resolved above");
        };
        slice
            .get_paged_vector_ref(thread, self.side)
            .append(ctx.pipeline.buffer_provider().as_ref(), record)?;
        Ok(())
    }

    fn close(&self, ctx: &ExecutionContext<'_>, _local: NljBuildLocalState) -> anyhow::Result<()> {
        self.handler
            .core()
            .store()?
            .update_slices(ctx.worker_thread_id, self.side)?;
        self.handler.check_and_trigger_windows(ctx.meta, ctx.pipeline)
    }
}

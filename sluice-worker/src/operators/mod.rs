use crate::pipeline::{InputBuffer, PipelineExecutionContext};
use anyhow::Context;
use sluice_state::WindowSlicesStore;
use sluice_types::{BufferMetaData, JoinSide, Timestamp, WorkerThreadId};
use std::sync::Arc;

pub mod aggregation;
pub mod gather_slices;
pub mod handler;
pub mod join;
pub mod nlj_build;
pub mod nlj_probe;

pub use handler::{HandlerOptions, HandlerState, SliceStoreOptions, WindowBasedOperatorHandler};

/// Everything an operator may look at while processing one input buffer.
pub struct ExecutionContext<'a> {
    pub worker_thread_id: WorkerThreadId,
    pub meta: BufferMetaData,
    pub number_of_records: usize,
    pub pipeline: &'a dyn PipelineExecutionContext,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        worker_thread_id: WorkerThreadId,
        meta: BufferMetaData,
        number_of_records: usize,
        pipeline: &'a dyn PipelineExecutionContext,
    ) -> Self {
        Self {
            worker_thread_id,
            meta,
            number_of_records,
            pipeline,
        }
    }
}

/// A record-at-a-time operator. The local state lives for exactly one input buffer and is
/// passed explicitly through `open`, `execute` and `close`.
pub trait ExecutableOperator: Send + Sync {
    type LocalState;

    fn open(&self, ctx: &ExecutionContext<'_>) -> anyhow::Result<Self::LocalState>;

    fn execute(
        &self,
        ctx: &ExecutionContext<'_>,
        local: &mut Self::LocalState,
        record: &[u8],
    ) -> anyhow::Result<()>;

    fn close(&self, ctx: &ExecutionContext<'_>, local: Self::LocalState) -> anyhow::Result<()>;
}

/// Runs `operator` over every record of `buffer` on `thread`.
pub fn execute_buffer<O: ExecutableOperator>(
    operator: &O,
    thread: WorkerThreadId,
    pipeline: &dyn PipelineExecutionContext,
    buffer: &InputBuffer,
) -> anyhow::Result<()> {
    let ctx = ExecutionContext::new(thread, buffer.meta, buffer.number_of_records(), pipeline);
    let mut local = operator.open(&ctx)?;
    for record in buffer.records() {
        operator.execute(&ctx, &mut local, record)?;
    }
    operator
        .close(&ctx, local)
        .with_context(|| format!("closing buffer {}", buffer.meta))
}

/// Finds the slice for `ts`: first in the slice cache of the calling thread, then in the store,
/// creating it if needed. Slices resolved through the store are recorded in the cache.
pub(crate) fn resolve_slice<H: WindowBasedOperatorHandler + ?Sized>(
    handler: &H,
    store: &dyn WindowSlicesStore<H::Slice>,
    thread: WorkerThreadId,
    side: JoinSide,
    ts: Timestamp,
) -> anyhow::Result<Arc<H::Slice>> {
    let cache = handler.core().slice_cache();
    if let Some(cache) = cache {
        if let Some(slice) = cache.lookup(thread, side, ts)? {
            return Ok(slice);
        }
    }

    let create = handler.get_create_new_slices_function();
    let slice = store
        .get_slices_or_create(ts, Some(&*create))?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("slice store returned no slice for {ts}"))?;

    if let Some(cache) = cache {
        cache.record(thread, side, &slice)?;
    }
    Ok(slice)
}

use crate::task_queue::{Task, TaskQueue};
use anyhow::Context;
use bytes::Bytes;
use parking_lot::Mutex;
use sluice_state::{AggregationSlice, NljSlice, Slice};
use sluice_types::{
    BufferMetaData, BufferProvider, ChunkNumber, OriginId, SequenceNumber, WindowInfo,
    WorkerThreadId,
};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// One chunk of join work: all pairs of a left tuple of `slice_left` and a right tuple of
/// `slice_right` inside `window_info`.
#[derive(Clone)]
pub struct EmittedNljWindowTrigger {
    pub window_info: WindowInfo,
    pub slice_left: Arc<NljSlice>,
    pub slice_right: Arc<NljSlice>,
    pub chunk_number: ChunkNumber,
    pub is_last_chunk: bool,
    pub sequence_number: SequenceNumber,
    pub origin_id: OriginId,
}

impl Debug for EmittedNljWindowTrigger {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmittedNljWindowTrigger")
            .field("window_info", &self.window_info)
            .field("slice_left", &self.slice_left.slice_id())
            .field("slice_right", &self.slice_right.slice_id())
            .field("chunk_number", &self.chunk_number)
            .field("is_last_chunk", &self.is_last_chunk)
            .field("sequence_number", &self.sequence_number)
            .finish()
    }
}

#[derive(Clone)]
pub struct EmittedAggregationWindow {
    pub window_info: WindowInfo,
    pub slices: Vec<Arc<AggregationSlice>>,
    pub sequence_number: SequenceNumber,
    pub origin_id: OriginId,
}

impl Debug for EmittedAggregationWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmittedAggregationWindow")
            .field("window_info", &self.window_info)
            .field(
                "slices",
                &self.slices.iter().map(|s| s.slice_id()).collect::<Vec<_>>(),
            )
            .field("sequence_number", &self.sequence_number)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum TriggerTask {
    Join(EmittedNljWindowTrigger),
    Aggregation(EmittedAggregationWindow),
}

impl TriggerTask {
    pub fn window_info(&self) -> WindowInfo {
        match self {
            TriggerTask::Join(t) => t.window_info,
            TriggerTask::Aggregation(t) => t.window_info,
        }
    }
}

/// What a running pipeline sees of its surroundings.
pub trait PipelineExecutionContext: Send + Sync {
    fn number_of_worker_threads(&self) -> u64;

    fn buffer_provider(&self) -> Arc<dyn BufferProvider>;

    /// Hands triggered work to the downstream pipeline.
    fn emit(&self, task: TriggerTask) -> anyhow::Result<()>;
}

/// Keeps every emitted task in memory.
pub struct CollectingPipelineContext {
    number_of_threads: u64,
    provider: Arc<dyn BufferProvider>,
    emitted: Mutex<Vec<TriggerTask>>,
}

impl CollectingPipelineContext {
    pub fn new(number_of_threads: u64, provider: Arc<dyn BufferProvider>) -> Self {
        Self {
            number_of_threads,
            provider,
            emitted: Mutex::new(vec![]),
        }
    }

    pub fn take_emitted(&self) -> Vec<TriggerTask> {
        std::mem::take(&mut *self.emitted.lock())
    }
}

impl PipelineExecutionContext for CollectingPipelineContext {
    fn number_of_worker_threads(&self) -> u64 {
        self.number_of_threads
    }

    fn buffer_provider(&self) -> Arc<dyn BufferProvider> {
        self.provider.clone()
    }

    fn emit(&self, task: TriggerTask) -> anyhow::Result<()> {
        self.emitted.lock().push(task);
        Ok(())
    }
}

pub type ProbeFn = Arc<dyn Fn(WorkerThreadId, TriggerTask) -> anyhow::Result<()> + Send + Sync>;

/// Turns every emitted task into an internal task of the queue that runs `probe` on it.
pub struct TaskQueuePipelineContext {
    number_of_threads: u64,
    provider: Arc<dyn BufferProvider>,
    queue: Arc<TaskQueue>,
    probe: ProbeFn,
}

impl TaskQueuePipelineContext {
    pub fn new(
        number_of_threads: u64,
        provider: Arc<dyn BufferProvider>,
        queue: Arc<TaskQueue>,
        probe: ProbeFn,
    ) -> Self {
        Self {
            number_of_threads,
            provider,
            queue,
            probe,
        }
    }
}

impl PipelineExecutionContext for TaskQueuePipelineContext {
    fn number_of_worker_threads(&self) -> u64 {
        self.number_of_threads
    }

    fn buffer_provider(&self) -> Arc<dyn BufferProvider> {
        self.provider.clone()
    }

    fn emit(&self, task: TriggerTask) -> anyhow::Result<()> {
        let probe = self.probe.clone();
        let window = task.window_info();
        self.queue.submit_internal(Task::new(format!("probe {window}"), move |thread| {
            probe(thread, task).with_context(|| format!("probing window {window}"))
        }));
        Ok(())
    }
}

/// A batch of fixed-size records plus its metadata, as produced by a source.
#[derive(Debug, Clone)]
pub struct InputBuffer {
    pub meta: BufferMetaData,
    pub tuple_size: usize,
    pub data: Bytes,
}

impl InputBuffer {
    pub fn new(meta: BufferMetaData, tuple_size: usize, data: impl Into<Bytes>) -> Self {
        Self {
            meta,
            tuple_size,
            data: data.into(),
        }
    }

    pub fn from_records<'a>(
        meta: BufferMetaData,
        tuple_size: usize,
        records: impl IntoIterator<Item = &'a [u8]>,
    ) -> Self {
        let mut data = Vec::new();
        for record in records {
            data.extend_from_slice(record);
        }
        Self::new(meta, tuple_size, data)
    }

    pub fn number_of_records(&self) -> usize {
        if self.tuple_size == 0 {
            0
        } else {
            self.data.len() / self.tuple_size
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks_exact(self.tuple_size.max(1))
    }
}

//! Window operators on top of the slice store: the join and aggregation handlers, their
//! build and probe operators and the worker pool that runs them.

pub mod logging;
pub mod operators;
pub mod pipeline;
pub mod task_queue;
pub mod time_function;
pub mod watermark;

pub use operators::aggregation::{AggregationBuild, AggregationOperatorHandler, AggregationProbe};
pub use operators::gather_slices::GatherSlices;
pub use operators::join::StreamJoinOperatorHandler;
pub use operators::nlj_build::NljBuild;
pub use operators::nlj_probe::NljProbe;
pub use operators::{
    execute_buffer, ExecutableOperator, ExecutionContext, HandlerOptions, HandlerState,
    SliceStoreOptions, WindowBasedOperatorHandler,
};
pub use pipeline::{
    CollectingPipelineContext, EmittedAggregationWindow, EmittedNljWindowTrigger, InputBuffer,
    PipelineExecutionContext, TaskQueuePipelineContext, TriggerTask,
};
pub use task_queue::{Task, TaskQueue, WorkerPool};
pub use time_function::{EventTimeFunction, IngestionTimeFunction, TimeFunction};
pub use watermark::MultiOriginWatermarkProcessor;

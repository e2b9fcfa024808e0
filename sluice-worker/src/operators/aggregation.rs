use super::handler::{HandlerOptions, HandlerRuntime, SliceStoreOptions, WindowHandlerCore};
use super::{resolve_slice, ExecutableOperator, ExecutionContext, WindowBasedOperatorHandler};
use crate::pipeline::{EmittedAggregationWindow, PipelineExecutionContext, TriggerTask};
use crate::time_function::TimeFunction;
use sluice_state::{
    AggregateState, AggregationSlice, Slice, SliceStoreError, WindowSlicesStore, WindowsToSlices,
};
use sluice_types::{BufferMetaData, JoinSide, SliceId, Timestamp};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Operator handler of a keyed windowed aggregation.
pub struct AggregationOperatorHandler {
    core: WindowHandlerCore<AggregationSlice>,
}

impl AggregationOperatorHandler {
    pub fn new(options: HandlerOptions) -> sluice_state::Result<Self> {
        Ok(Self {
            core: WindowHandlerCore::new(options)?,
        })
    }
}

impl WindowBasedOperatorHandler for AggregationOperatorHandler {
    type Slice = AggregationSlice;

    fn core(&self) -> &WindowHandlerCore<AggregationSlice> {
        &self.core
    }

    fn create_new_slice(
        &self,
        start: Timestamp,
        end: Timestamp,
        runtime: &HandlerRuntime,
    ) -> sluice_state::Result<Arc<AggregationSlice>> {
        Ok(Arc::new(AggregationSlice::new(
            start,
            end,
            SliceId(end.0),
            runtime.number_of_threads,
        )?))
    }

    fn create_store(
        &self,
        _runtime: &HandlerRuntime,
    ) -> sluice_state::Result<Box<dyn WindowSlicesStore<AggregationSlice>>> {
        let options = self.core.options();
        if let SliceStoreOptions::FileBacked { .. } = options.slice_store {
            warn!("aggregation state is not spilled; using the in-memory slice store");
        }
        Ok(options.default_store(*self.core.slice_assigner()))
    }

    fn trigger_slices(
        &self,
        windows: WindowsToSlices<AggregationSlice>,
        ctx: &dyn PipelineExecutionContext,
    ) -> anyhow::Result<()> {
        for (window_info, slices) in windows {
            if slices.is_empty() {
                continue;
            }
            debug!("window {} aggregates {} slices", window_info, slices.len());
            ctx.emit(TriggerTask::Aggregation(EmittedAggregationWindow {
                window_info,
                slices,
                sequence_number: self.core.next_sequence_number(),
                origin_id: self.core.output_origin(),
            }))?;
        }
        Ok(())
    }
}

/// Folds records of `key: u64 | .. | value: u64 | ..` into the partial aggregate of the
/// record's slice.
pub struct AggregationBuild {
    handler: Arc<AggregationOperatorHandler>,
    value_offset: usize,
    time_function: Box<dyn TimeFunction>,
}

#[derive(Default)]
pub struct AggregationBuildLocalState {
    current: Option<Arc<AggregationSlice>>,
}

impl AggregationBuild {
    pub fn new(
        handler: Arc<AggregationOperatorHandler>,
        value_offset: usize,
        time_function: Box<dyn TimeFunction>,
    ) -> Self {
        Self {
            handler,
            value_offset,
            time_function,
        }
    }

    fn read_u64(record: &[u8], offset: usize) -> sluice_state::Result<u64> {
        let bytes = record.get(offset..offset + 8).ok_or_else(|| {
            SliceStoreError::InvalidRecord(format!(
                "record of {} bytes has no u64 at offset {}",
                record.len(),
                offset
            ))
        })?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }
}

impl ExecutableOperator for AggregationBuild {
    type LocalState = AggregationBuildLocalState;

    fn open(&self, _ctx: &ExecutionContext<'_>) -> anyhow::Result<AggregationBuildLocalState> {
        self.handler.core().store()?;
        Ok(AggregationBuildLocalState::default())
    }

    fn execute(
        &self,
        ctx: &ExecutionContext<'_>,
        local: &mut AggregationBuildLocalState,
        record: &[u8],
    ) -> anyhow::Result<()> {
        let ts = self.time_function.get_ts(ctx, record)?;
        let key = Self::read_u64(record, 0)?;
        let value = Self::read_u64(record, self.value_offset)?;

        let slice = match &local.current {
            Some(s) if s.slice_start() <= ts && ts < s.slice_end() => s.clone(),
            _ => {
                let store = self.handler.core().store()?;
                let slice = resolve_slice(
                    self.handler.as_ref(),
                    store,
                    ctx.worker_thread_id,
                    JoinSide::Left,
                    ts,
                )?;
                local.current = Some(slice.clone());
                slice
            }
        };
        slice.update(ctx.worker_thread_id, key, value);
        Ok(())
    }

    fn close(
        &self,
        ctx: &ExecutionContext<'_>,
        _local: AggregationBuildLocalState,
    ) -> anyhow::Result<()> {
        self.handler.check_and_trigger_windows(ctx.meta, ctx.pipeline)
    }
}

/// Merges the partial aggregates of all slices of a window into one result per key.
pub struct AggregationProbe {
    handler: Arc<AggregationOperatorHandler>,
}

impl AggregationProbe {
    pub fn new(handler: Arc<AggregationOperatorHandler>) -> Self {
        Self { handler }
    }

    pub fn execute_task(
        &self,
        task: &EmittedAggregationWindow,
    ) -> anyhow::Result<BTreeMap<u64, AggregateState>> {
        let mut combined = HashMap::new();
        for slice in &task.slices {
            slice.combine_into(&mut combined);
        }

        self.handler
            .garbage_collect_slices_and_windows(BufferMetaData::new(
                task.window_info.window_end,
                task.sequence_number,
                task.origin_id,
            ))?;
        Ok(combined.into_iter().collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::operators::execute_buffer;
    use crate::pipeline::{CollectingPipelineContext, InputBuffer};
    use crate::time_function::EventTimeFunction;
    use sluice_types::{
        HeapBufferProvider, OriginId, SequenceNumber, WindowInfo, WindowType, WorkerThreadId,
    };

    fn record(key: u64, ts: u64, value: u64) -> Vec<u8> {
        [key, ts, value].iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_sliding_aggregation() {
        let handler = Arc::new(
            AggregationOperatorHandler::new(HandlerOptions::new(
                WindowType::Sliding {
                    size: 20,
                    slide: 10,
                },
                vec![OriginId(1)],
                OriginId(3),
            ))
            .unwrap(),
        );
        let ctx = CollectingPipelineContext::new(2, Arc::new(HeapBufferProvider::new(64)));
        handler.start(&ctx).unwrap();

        let build = AggregationBuild::new(handler.clone(), 16, Box::new(EventTimeFunction::new(8)));
        let records = [record(1, 5, 10), record(1, 15, 4), record(2, 12, 7)];
        let buffer = InputBuffer::from_records(
            BufferMetaData::new(Timestamp(20), SequenceNumber(1), OriginId(1)),
            24,
            records.iter().map(|r| r.as_slice()),
        );
        execute_buffer(&build, WorkerThreadId(1), &ctx, &buffer).unwrap();

        let probe = AggregationProbe::new(handler.clone());
        let mut results = BTreeMap::new();
        for task in ctx.take_emitted() {
            let TriggerTask::Aggregation(task) = task else {
                panic!("unexpected join task");
            };
            results.insert(task.window_info, probe.execute_task(&task).unwrap());
        }

        // no window starts before zero, so [0, 10) only belongs to [0, 20)
        let first = &results[&WindowInfo::from(0..20)];
        assert_eq!(first[&1].count, 2);
        assert_eq!(first[&1].sum, 14);
        assert_eq!(first[&1].min, 4);
        assert_eq!(first[&2].max, 7);
        assert_eq!(results.len(), 1);
    }
}

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use sluice_types::{
    BufferMetaData, HeapBufferProvider, JoinSide, MemoryLayout, OriginId, SequenceNumber,
    Timestamp, WorkerThreadId,
};
use sluice_worker::{
    execute_buffer, CollectingPipelineContext, EventTimeFunction, GatherSlices, HandlerOptions,
    InputBuffer, NljBuild, NljProbe, StreamJoinOperatorHandler, TriggerTask,
    WindowBasedOperatorHandler,
};
use std::sync::Arc;

pub const LEFT: OriginId = OriginId(1);
pub const RIGHT: OriginId = OriginId(2);
pub const OUTPUT: OriginId = OriginId(9);

pub fn layout() -> MemoryLayout {
    MemoryLayout::new(16, 8, 128)
}

/// `key | ts`, both little-endian u64.
pub fn record(key: u64, ts: u64) -> Vec<u8> {
    let mut r = key.to_le_bytes().to_vec();
    r.extend_from_slice(&ts.to_le_bytes());
    r
}

pub fn buffer(origin: OriginId, seq: u64, watermark: u64, tuples: &[(u64, u64)]) -> InputBuffer {
    let records: Vec<_> = tuples.iter().map(|(k, ts)| record(*k, *ts)).collect();
    InputBuffer::from_records(
        BufferMetaData::new(Timestamp(watermark), SequenceNumber(seq), origin),
        16,
        records.iter().map(|r| r.as_slice()),
    )
}

/// One buffer per side and batch. Batch `b` holds timestamps in `[b * 100, (b + 1) * 100)` in
/// random order and carries watermark `(b + 1) * 100`.
pub struct Batch {
    pub left: Vec<(u64, u64)>,
    pub right: Vec<(u64, u64)>,
    pub watermark: u64,
}

pub fn random_batches(seed: u64, batches: u64, per_batch: usize) -> Vec<Batch> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..batches)
        .map(|b| {
            let side = |rng: &mut StdRng| {
                let mut tuples: Vec<_> = (0..per_batch)
                    .map(|_| (rng.gen_range(0..4), rng.gen_range(b * 100..(b + 1) * 100)))
                    .collect();
                tuples.shuffle(rng);
                tuples
            };
            Batch {
                left: side(&mut rng),
                right: side(&mut rng),
                watermark: (b + 1) * 100,
            }
        })
        .collect()
}

/// Every joined record of all windows, computed by brute force.
pub fn expected_join(batches: &[Batch], size: u64, slide: u64) -> Vec<Vec<u8>> {
    let left: Vec<_> = batches.iter().flat_map(|b| b.left.iter().copied()).collect();
    let right: Vec<_> = batches.iter().flat_map(|b| b.right.iter().copied()).collect();
    let max_ts = left.iter().chain(&right).map(|(_, ts)| *ts).max().unwrap_or(0);

    let mut out = vec![];
    for k in 0..=max_ts / slide {
        let (start, end) = (k * slide, k * slide + size);
        for (lk, lts) in &left {
            for (rk, rts) in &right {
                if lk == rk && (start..end).contains(lts) && (start..end).contains(rts) {
                    out.push(joined(start, end, (*lk, *lts), (*rk, *rts)));
                }
            }
        }
    }
    out.sort();
    out
}

pub fn joined(start: u64, end: u64, left: (u64, u64), right: (u64, u64)) -> Vec<u8> {
    let mut r = start.to_le_bytes().to_vec();
    r.extend_from_slice(&end.to_le_bytes());
    r.extend_from_slice(&record(left.0, left.1));
    r.extend_from_slice(&record(right.0, right.1));
    r
}

/// A join pipeline driven from the test thread.
pub struct JoinRig {
    pub handler: Arc<StreamJoinOperatorHandler>,
    pub ctx: CollectingPipelineContext,
    pub gather: GatherSlices<StreamJoinOperatorHandler>,
    pub left: NljBuild,
    pub right: NljBuild,
    pub probe: NljProbe,
    pub number_of_threads: u64,
    pub emitted_chunks: usize,
}

impl JoinRig {
    pub fn new(options: HandlerOptions, number_of_threads: u64) -> Self {
        let handler =
            Arc::new(StreamJoinOperatorHandler::new(options, layout(), layout()).unwrap());
        let ctx = CollectingPipelineContext::new(
            number_of_threads,
            Arc::new(HeapBufferProvider::new(4096)),
        );
        handler.start(&ctx).unwrap();

        let time = || Box::new(EventTimeFunction::new(8));
        Self {
            gather: GatherSlices::new(handler.clone(), time()),
            left: NljBuild::new(handler.clone(), JoinSide::Left, time()),
            right: NljBuild::new(handler.clone(), JoinSide::Right, time()),
            probe: NljProbe::new(
                handler.clone(),
                EventTimeFunction::new(8),
                EventTimeFunction::new(8),
            ),
            handler,
            ctx,
            number_of_threads,
            emitted_chunks: 0,
        }
    }

    pub fn build(&self, side: JoinSide, thread: u64, buffer: &InputBuffer) {
        let thread = WorkerThreadId(thread % self.number_of_threads);
        let build = match side {
            JoinSide::Left => &self.left,
            JoinSide::Right => &self.right,
        };
        execute_buffer(build, thread, &self.ctx, buffer).unwrap();
    }

    pub fn gather(&self, thread: u64, buffer: &InputBuffer) {
        let thread = WorkerThreadId(thread % self.number_of_threads);
        execute_buffer(&self.gather, thread, &self.ctx, buffer).unwrap();
    }

    /// Runs the probe over every chunk emitted so far.
    pub fn probe_all(&mut self) -> Vec<Vec<u8>> {
        let mut out = vec![];
        for task in self.ctx.take_emitted() {
            let TriggerTask::Join(task) = task else {
                panic!("join handler emitted {task:?}");
            };
            self.emitted_chunks += 1;
            out.extend(self.probe.execute_task(&task).unwrap());
        }
        out
    }
}

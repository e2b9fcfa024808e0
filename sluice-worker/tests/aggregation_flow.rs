use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use sluice_state::AggregateState;
use sluice_types::config::SliceCacheType;
use sluice_types::{
    BufferMetaData, HeapBufferProvider, OriginId, QueryTerminationType, SequenceNumber,
    Timestamp, WindowInfo, WindowType, WorkerThreadId,
};
use sluice_worker::{
    execute_buffer, AggregationBuild, AggregationOperatorHandler, AggregationProbe,
    CollectingPipelineContext, EventTimeFunction, GatherSlices, HandlerOptions, InputBuffer,
    TriggerTask, WindowBasedOperatorHandler,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use test_case::test_case;

type Results = BTreeMap<WindowInfo, BTreeMap<u64, AggregateState>>;

/// `key | ts | value`, each a little-endian u64.
fn record(key: u64, ts: u64, value: u64) -> Vec<u8> {
    [key, ts, value]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

fn expected(tuples: &[(u64, u64, u64)], size: u64, slide: u64) -> Results {
    let mut results = Results::new();
    for &(key, ts, value) in tuples {
        let first = if ts >= size { (ts - size) / slide + 1 } else { 0 };
        for k in first..=ts / slide {
            let window = WindowInfo::from(k * slide..k * slide + size);
            results
                .entry(window)
                .or_default()
                .entry(key)
                .and_modify(|s| s.add(value))
                .or_insert_with(|| AggregateState::new(value));
        }
    }
    results
}

#[test_case(WindowType::Tumbling { size: 50 }, SliceCacheType::None; "tumbling")]
#[test_case(WindowType::Sliding { size: 100, slide: 25 }, SliceCacheType::Lru; "sliding with cache")]
fn test_aggregation_matches_brute_force(window: WindowType, cache: SliceCacheType) {
    let origin = OriginId(1);
    let handler = Arc::new(
        AggregationOperatorHandler::new(
            HandlerOptions::new(window, vec![origin], OriginId(4)).with_slice_cache(cache, 2),
        )
        .unwrap(),
    );
    let ctx = CollectingPipelineContext::new(2, Arc::new(HeapBufferProvider::new(1024)));
    handler.start(&ctx).unwrap();

    let gather = GatherSlices::new(handler.clone(), Box::new(EventTimeFunction::new(8)));
    let build = AggregationBuild::new(handler.clone(), 16, Box::new(EventTimeFunction::new(8)));
    let probe = AggregationProbe::new(handler.clone());

    let mut rng = StdRng::seed_from_u64(5);
    let mut all = vec![];
    let mut results = Results::new();
    let probe_emitted = |results: &mut Results| {
        for task in ctx.take_emitted() {
            let TriggerTask::Aggregation(task) = task else {
                panic!("aggregation handler emitted a join task");
            };
            assert!(results
                .insert(task.window_info, probe.execute_task(&task).unwrap())
                .is_none());
        }
    };

    for b in 0..8u64 {
        let mut tuples: Vec<_> = (0..20)
            .map(|_| {
                (
                    rng.gen_range(0..5),
                    rng.gen_range(b * 100..(b + 1) * 100),
                    rng.gen_range(0..1000),
                )
            })
            .collect();
        tuples.shuffle(&mut rng);
        all.extend(tuples.iter().copied());

        let records: Vec<_> = tuples.iter().map(|(k, ts, v)| record(*k, *ts, *v)).collect();
        let buffer = InputBuffer::from_records(
            BufferMetaData::new(Timestamp((b + 1) * 100), SequenceNumber(b + 1), origin),
            24,
            records.iter().map(|r| r.as_slice()),
        );
        let thread = WorkerThreadId(b % 2);
        execute_buffer(&gather, thread, &ctx, &buffer).unwrap();
        execute_buffer(&build, thread, &ctx, &buffer).unwrap();
        probe_emitted(&mut results);
    }

    handler.stop(QueryTerminationType::Graceful, &ctx).unwrap();
    probe_emitted(&mut results);

    assert_eq!(results, expected(&all, window.size(), window.slide()));
}

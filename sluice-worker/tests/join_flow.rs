mod common;

use common::*;
use sluice_state::{Slice, SpillOptions};
use sluice_types::config::SliceCacheType;
use sluice_types::{
    ChunkNumber, FileLayout, JoinSide, QueryTerminationType, WindowInfo, WindowType,
};
use sluice_worker::{
    HandlerOptions, HandlerState, SliceStoreOptions, TriggerTask, WindowBasedOperatorHandler,
};
use std::collections::BTreeSet;
use test_case::test_case;

fn options(window: WindowType) -> HandlerOptions {
    HandlerOptions::new(window, vec![LEFT, RIGHT], OUTPUT)
}

fn run(rig: &mut JoinRig, batches: &[Batch]) -> Vec<Vec<u8>> {
    let mut out = vec![];
    for (i, batch) in batches.iter().enumerate() {
        let seq = i as u64 + 1;
        let left = buffer(LEFT, seq, batch.watermark, &batch.left);
        let right = buffer(RIGHT, seq, batch.watermark, &batch.right);
        rig.gather(seq, &left);
        rig.build(JoinSide::Left, seq, &left);
        rig.build(JoinSide::Right, seq + 1, &right);
        out.extend(rig.probe_all());
    }
    rig.handler
        .stop(QueryTerminationType::Graceful, &rig.ctx)
        .unwrap();
    out.extend(rig.probe_all());
    out.sort();
    out
}

#[test]
fn test_single_tumbling_window() {
    let rig = JoinRig::new(options(WindowType::Tumbling { size: 2000 }), 1);

    rig.build(JoinSide::Left, 0, &buffer(LEFT, 1, 2000, &[(7, 100), (7, 1999)]));
    assert!(rig.ctx.take_emitted().is_empty());
    rig.build(
        JoinSide::Right,
        0,
        &buffer(RIGHT, 1, 2000, &[(7, 50), (7, 1500), (7, 2500)]),
    );

    let emitted = rig.ctx.take_emitted();
    assert_eq!(emitted.len(), 1);
    let TriggerTask::Join(task) = &emitted[0] else {
        panic!("expected a join task");
    };
    assert_eq!(task.window_info, WindowInfo::from(0..2000));
    assert_eq!(task.chunk_number, ChunkNumber::INITIAL);
    assert!(task.is_last_chunk);
    assert_eq!(task.slice_left.number_of_tuples_left(), 2);
    assert_eq!(task.slice_right.number_of_tuples_right(), 2);

    let output = rig.probe.execute_task(task).unwrap();
    assert_eq!(output.len(), 4);

    // the slice of [0, 2000) is released once its only window is probed
    let store = rig.handler.core().store().unwrap();
    assert_eq!(store.get_number_of_slices(), 1);
    assert_eq!(store.get_all_slices()[0].slice_end().0, 4000);
}

#[test_case(SliceCacheType::None; "no cache")]
#[test_case(SliceCacheType::Fifo; "fifo")]
#[test_case(SliceCacheType::Lru; "lru")]
#[test_case(SliceCacheType::SecondChance; "second chance")]
fn test_cache_does_not_change_results(cache: SliceCacheType) {
    let batches = random_batches(42, 8, 12);
    let window = WindowType::Sliding {
        size: 300,
        slide: 100,
    };

    let mut rig = JoinRig::new(options(window).with_slice_cache(cache, 3), 2);
    let output = run(&mut rig, &batches);

    assert_eq!(output, expected_join(&batches, 300, 100));
    if cache != SliceCacheType::None {
        let hits = rig
            .handler
            .core()
            .slice_cache()
            .unwrap()
            .total_hits_and_misses()
            .unwrap();
        assert!(hits.misses > 0);
    }
}

#[test_case(WindowType::Tumbling { size: 100 }; "tumbling")]
#[test_case(WindowType::Sliding { size: 250, slide: 50 }; "sliding")]
fn test_every_window_is_emitted_once(window: WindowType) {
    let batches = random_batches(7, 6, 5);
    let rig = JoinRig::new(options(window), 2);

    let mut windows = vec![];
    for (i, batch) in batches.iter().enumerate() {
        let seq = i as u64 + 1;
        rig.build(JoinSide::Left, 0, &buffer(LEFT, seq, batch.watermark, &batch.left));
        rig.build(JoinSide::Right, 1, &buffer(RIGHT, seq, batch.watermark, &batch.right));
        for task in rig.ctx.take_emitted() {
            if let TriggerTask::Join(t) = &task {
                if t.is_last_chunk {
                    windows.push(t.window_info);
                }
                rig.probe.execute_task(t).unwrap();
            }
        }
    }

    let unique: BTreeSet<_> = windows.iter().copied().collect();
    assert_eq!(unique.len(), windows.len());
    assert!(windows.windows(2).all(|w| w[0].window_end <= w[1].window_end));
    assert!(windows.iter().all(|w| w.window_end.0 <= 600));
}

#[test]
fn test_regressing_watermark_is_ignored() {
    let rig = JoinRig::new(options(WindowType::Tumbling { size: 100 }), 1);
    for (seq, wm) in [(1, 500), (2, 100), (3, 300)] {
        rig.build(JoinSide::Left, 0, &buffer(LEFT, seq, wm, &[(1, 550 + seq)]));
        rig.build(JoinSide::Right, 0, &buffer(RIGHT, seq, wm, &[(1, 550 + seq)]));
    }
    rig.build(JoinSide::Left, 0, &buffer(LEFT, 4, 500, &[(1, 560)]));

    let emitted = rig.ctx.take_emitted();
    assert!(emitted.is_empty());
    assert_eq!(
        rig.handler.core().store().unwrap().last_trigger_watermark().0,
        500
    );

    rig.handler
        .stop(QueryTerminationType::Graceful, &rig.ctx)
        .unwrap();
    let windows: Vec<_> = rig
        .ctx
        .take_emitted()
        .iter()
        .map(|t| t.window_info())
        .collect();
    assert_eq!(windows, vec![WindowInfo::from(500..600)]);
    assert_eq!(rig.handler.core().state(), HandlerState::Destroyed);
}

#[test_case(FileLayout::NoSeparation; "whole tuples")]
#[test_case(FileLayout::SeparateKeys; "separate keys")]
fn test_file_backed_store_spills_and_reads_back(file_layout: FileLayout) {
    let dir = tempfile::tempdir().unwrap();
    let store = SliceStoreOptions::FileBacked {
        working_dir: dir.path().to_path_buf(),
        file_buffer_size: 64,
        file_layout,
        spill: SpillOptions::default(),
    };
    let mut rig = JoinRig::new(
        options(WindowType::Tumbling { size: 100 }).with_slice_store(store),
        1,
    );

    let spill_files = || {
        std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".dat"))
            .count()
    };

    rig.build(JoinSide::Left, 0, &buffer(LEFT, 1, 0, &[(3, 10), (3, 20), (4, 30)]));
    assert!(spill_files() > 0);
    let slice = rig
        .handler
        .core()
        .store()
        .unwrap()
        .get_slice_by_slice_end(100.into())
        .unwrap();
    assert_eq!(slice.number_of_tuples_left(), 3);
    assert_eq!(slice.state_size_in_memory(), 0);

    rig.build(JoinSide::Right, 0, &buffer(RIGHT, 1, 100, &[(3, 40)]));
    rig.build(JoinSide::Left, 0, &buffer(LEFT, 2, 100, &[]));

    let mut output = rig.probe_all();
    output.sort();
    assert_eq!(
        output,
        vec![joined(0, 100, (3, 10), (3, 40)), joined(0, 100, (3, 20), (3, 40))]
    );
    assert_eq!(spill_files(), 0);
}

#[test]
fn test_file_backed_matches_in_memory() {
    let batches = random_batches(3, 6, 10);
    let window = WindowType::Sliding {
        size: 200,
        slide: 100,
    };
    let dir = tempfile::tempdir().unwrap();
    let store = SliceStoreOptions::FileBacked {
        working_dir: dir.path().to_path_buf(),
        file_buffer_size: 0,
        file_layout: FileLayout::SeparateKeys,
        spill: SpillOptions {
            min_write_state_size: 0,
            watermark_lookahead: 50,
        },
    };

    let mut spilled = JoinRig::new(options(window).with_slice_store(store), 2);
    let mut in_memory = JoinRig::new(options(window), 2);
    assert_eq!(run(&mut spilled, &batches), run(&mut in_memory, &batches));
    assert_eq!(spilled.emitted_chunks, in_memory.emitted_chunks);
}

#[test]
fn test_state_survives_hand_over() {
    let window = WindowType::Tumbling { size: 100 };
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("join.state");

    let mut first = JoinRig::new(options(window), 2);
    first.build(JoinSide::Left, 0, &buffer(LEFT, 1, 100, &[(1, 10), (1, 110)]));
    first.build(JoinSide::Right, 1, &buffer(RIGHT, 1, 100, &[(1, 20), (1, 120), (2, 130)]));
    assert_eq!(first.probe_all(), vec![joined(0, 100, (1, 10), (1, 20))]);
    first.build(JoinSide::Left, 1, &buffer(LEFT, 2, 150, &[(2, 140)]));
    first.build(JoinSide::Right, 0, &buffer(RIGHT, 2, 150, &[]));
    assert!(first.probe_all().is_empty());

    first.handler.write_state_to_file(&path).unwrap();
    assert_eq!(first.handler.core().state(), HandlerState::Idle);
    first
        .handler
        .stop(QueryTerminationType::HardStop, &first.ctx)
        .unwrap();
    assert!(first.ctx.take_emitted().is_empty());

    let mut second = JoinRig::new(options(window), 2);
    second.handler.restore_state_from_file(&path).unwrap();
    let store = second.handler.core().store().unwrap();
    assert_eq!(store.get_number_of_slices(), 1);
    let slice = store.get_slice_by_slice_end(200.into()).unwrap();
    assert_eq!(slice.number_of_tuples_left(), 2);
    assert_eq!(slice.number_of_tuples_right(), 2);

    second.build(JoinSide::Left, 0, &buffer(LEFT, 1, 200, &[]));
    second.build(JoinSide::Right, 1, &buffer(RIGHT, 1, 200, &[]));
    let mut output = second.probe_all();
    output.sort();
    assert_eq!(
        output,
        vec![
            joined(100, 200, (1, 110), (1, 120)),
            joined(100, 200, (2, 140), (2, 130)),
        ]
    );
    assert_eq!(
        second.handler.core().store().unwrap().get_number_of_slices(),
        0
    );
}

#[test]
fn test_hard_stop_discards_pending_windows() {
    let mut rig = JoinRig::new(options(WindowType::Tumbling { size: 100 }), 1);
    rig.build(JoinSide::Left, 0, &buffer(LEFT, 1, 0, &[(1, 10)]));
    rig.build(JoinSide::Right, 0, &buffer(RIGHT, 1, 0, &[(1, 10)]));
    rig.handler
        .stop(QueryTerminationType::HardStop, &rig.ctx)
        .unwrap();
    assert!(rig.probe_all().is_empty());
    assert_eq!(
        rig.handler.core().store().unwrap().get_number_of_slices(),
        0
    );
}

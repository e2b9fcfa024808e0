use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

lazy_static! {
    pub static ref SIDE_LABEL_NAMES: Vec<&'static str> = vec!["side"];
    pub static ref SLICE_CACHE_HITS: IntCounterVec = register_int_counter_vec!(
        "sluice_slice_cache_hits",
        "Number of slice lookups answered by the slice cache",
        &SIDE_LABEL_NAMES
    )
    .unwrap();
    pub static ref SLICE_CACHE_MISSES: IntCounterVec = register_int_counter_vec!(
        "sluice_slice_cache_misses",
        "Number of slice lookups that fell back to the slice store",
        &SIDE_LABEL_NAMES
    )
    .unwrap();
    pub static ref LIVE_SLICES: IntGauge =
        register_int_gauge!("sluice_live_slices", "Number of slices held by slice stores").unwrap();
    pub static ref SPILLED_BYTES: IntCounter = register_int_counter!(
        "sluice_spilled_bytes",
        "Number of tuple bytes written to spill files"
    )
    .unwrap();
    pub static ref SPILL_READS: IntCounter = register_int_counter!(
        "sluice_spill_reads",
        "Number of paged vectors read back from spill files"
    )
    .unwrap();
    pub static ref TRIGGERED_WINDOWS: IntCounter = register_int_counter!(
        "sluice_triggered_windows",
        "Number of windows handed to the probe"
    )
    .unwrap();
    pub static ref EMITTED_CHUNKS: IntCounter = register_int_counter!(
        "sluice_emitted_chunks",
        "Number of work items emitted by triggering"
    )
    .unwrap();
}

use crate::error::{Result, SliceStoreError};
use crate::paged_vector::PagedVector;
use bincode::{Decode, Encode};
use parking_lot::{Mutex, MutexGuard};
use sluice_types::{
    BufferProvider, JoinSide, MemoryLayout, SliceId, Timestamp, WorkerThreadId,
};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

/// Bounds and lifecycle flags shared by all slice variants.
#[derive(Debug)]
pub struct SliceBase {
    start: Timestamp,
    end: Timestamp,
    id: SliceId,
    retired: AtomicBool,
}

impl SliceBase {
    pub fn new(start: Timestamp, end: Timestamp, id: SliceId) -> Result<Self> {
        if start >= end {
            return Err(SliceStoreError::Precondition(format!(
                "slice start {start} must be before its end {end}"
            )));
        }
        Ok(Self {
            start,
            end,
            id,
            retired: AtomicBool::new(false),
        })
    }

    /// Marks the slice as removed from its store. Outstanding cache entries that still point
    /// at it are treated as stale from now on.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

#[derive(Encode, Decode)]
struct SliceHeader {
    start: u64,
    end: u64,
    number_of_threads: u64,
}

impl SliceHeader {
    fn check(&self, base: &SliceBase, number_of_threads: u64) -> Result<()> {
        if self.number_of_threads != number_of_threads {
            return Err(SliceStoreError::Corrupted(format!(
                "serialized slice was written by {} threads, this slice has {}",
                self.number_of_threads, number_of_threads
            )));
        }
        if self.start != base.start.0 || self.end != base.end.0 {
            return Err(SliceStoreError::Corrupted(format!(
                "serialized slice [{}, {}) does not match [{}, {})",
                self.start, self.end, base.start, base.end
            )));
        }
        Ok(())
    }
}

pub trait Slice: Send + Sync + 'static {
    fn base(&self) -> &SliceBase;

    fn slice_start(&self) -> Timestamp {
        self.base().start
    }

    fn slice_end(&self) -> Timestamp {
        self.base().end
    }

    fn slice_id(&self) -> SliceId {
        self.base().id
    }

    /// Writes the whole content in a stable order (thread id, then side).
    fn serialize(&self, out: &mut dyn Write) -> Result<()>;

    /// Replaces the content with what a previous [`Slice::serialize`] wrote.
    fn deserialize(&self, provider: &dyn BufferProvider, input: &mut dyn Read) -> Result<()>;
}

/// Slice of a nested-loop join: one paged vector per (worker thread, join side).
pub struct NljSlice {
    base: SliceBase,
    number_of_threads: u64,
    vectors: Vec<Mutex<PagedVector>>,
    triggered: AtomicBool,
}

impl NljSlice {
    pub fn new(
        start: Timestamp,
        end: Timestamp,
        id: SliceId,
        number_of_threads: u64,
        left_layout: MemoryLayout,
        right_layout: MemoryLayout,
    ) -> Result<Self> {
        if number_of_threads == 0 {
            return Err(SliceStoreError::Precondition(
                "a slice needs at least one worker thread".into(),
            ));
        }

        let mut vectors = Vec::with_capacity(number_of_threads as usize * 2);
        for _ in 0..number_of_threads {
            vectors.push(Mutex::new(PagedVector::new(left_layout)?));
            vectors.push(Mutex::new(PagedVector::new(right_layout)?));
        }

        Ok(Self {
            base: SliceBase::new(start, end, id)?,
            number_of_threads,
            vectors,
            triggered: AtomicBool::new(false),
        })
    }

    pub fn number_of_threads(&self) -> u64 {
        self.number_of_threads
    }

    fn index(&self, thread: WorkerThreadId, side: JoinSide) -> usize {
        thread.index(self.number_of_threads) * 2 + side.index()
    }

    /// The append buffer of `thread` for `side`. Each worker only ever locks its own vectors,
    /// so this never waits for another thread while records are being built.
    pub fn get_paged_vector_ref(
        &self,
        thread: WorkerThreadId,
        side: JoinSide,
    ) -> MutexGuard<'_, PagedVector> {
        self.vectors[self.index(thread, side)].lock()
    }

    fn side_vectors(&self, side: JoinSide) -> impl Iterator<Item = &Mutex<PagedVector>> {
        self.vectors.iter().skip(side.index()).step_by(2)
    }

    fn number_of_tuples(&self, side: JoinSide) -> u64 {
        self.side_vectors(side)
            .map(|v| v.lock().total_number_of_tuples())
            .sum()
    }

    pub fn number_of_tuples_left(&self) -> u64 {
        self.number_of_tuples(JoinSide::Left)
    }

    pub fn number_of_tuples_right(&self) -> u64 {
        self.number_of_tuples(JoinSide::Right)
    }

    pub fn state_size_in_memory(&self) -> usize {
        self.vectors.iter().map(|v| v.lock().state_size_in_memory()).sum()
    }

    /// Visits every in-memory tuple of `side`, across all worker threads.
    pub fn for_each_tuple(&self, side: JoinSide, mut f: impl FnMut(&[u8])) {
        for vector in self.side_vectors(side) {
            vector.lock().iter().for_each(&mut f);
        }
    }

    pub fn collect_tuples(&self, side: JoinSide) -> Vec<Vec<u8>> {
        let mut tuples = vec![];
        self.for_each_tuple(side, |t| tuples.push(t.to_vec()));
        tuples
    }

    /// Flags the slice as handed to the trigger path; it must no longer be spilled.
    pub fn mark_triggered(&self) {
        self.triggered.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }
}

impl Slice for NljSlice {
    fn base(&self) -> &SliceBase {
        &self.base
    }

    fn serialize(&self, mut out: &mut dyn Write) -> Result<()> {
        let header = SliceHeader {
            start: self.base.start.0,
            end: self.base.end.0,
            number_of_threads: self.number_of_threads,
        };
        bincode::encode_into_std_write(header, &mut out, bincode::config::standard())?;
        for vector in &self.vectors {
            vector.lock().write_pages(out)?;
        }
        Ok(())
    }

    fn deserialize(&self, provider: &dyn BufferProvider, mut input: &mut dyn Read) -> Result<()> {
        let header: SliceHeader =
            bincode::decode_from_std_read(&mut input, bincode::config::standard())?;
        header.check(&self.base, self.number_of_threads)?;
        for vector in &self.vectors {
            vector.lock().read_pages(provider, input)?;
        }
        Ok(())
    }
}

/// Running aggregate of one key within one slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct AggregateState {
    pub count: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
}

impl AggregateState {
    pub fn new(value: u64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    pub fn add(&mut self, value: u64) {
        self.merge(&AggregateState::new(value));
    }

    pub fn merge(&mut self, other: &AggregateState) {
        self.count += other.count;
        self.sum = self.sum.wrapping_add(other.sum);
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

/// Slice of a keyed aggregation: one partial hash map per worker thread.
pub struct AggregationSlice {
    base: SliceBase,
    partials: Vec<Mutex<HashMap<u64, AggregateState>>>,
}

impl AggregationSlice {
    pub fn new(start: Timestamp, end: Timestamp, id: SliceId, number_of_threads: u64) -> Result<Self> {
        if number_of_threads == 0 {
            return Err(SliceStoreError::Precondition(
                "a slice needs at least one worker thread".into(),
            ));
        }
        Ok(Self {
            base: SliceBase::new(start, end, id)?,
            partials: (0..number_of_threads)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        })
    }

    pub fn update(&self, thread: WorkerThreadId, key: u64, value: u64) {
        let mut partial = self.partials[thread.index(self.partials.len() as u64)].lock();
        partial
            .entry(key)
            .and_modify(|s| s.add(value))
            .or_insert_with(|| AggregateState::new(value));
    }

    /// Folds the partial of every worker thread into `into`.
    pub fn combine_into(&self, into: &mut HashMap<u64, AggregateState>) {
        for partial in &self.partials {
            for (key, state) in partial.lock().iter() {
                into.entry(*key)
                    .and_modify(|s| s.merge(state))
                    .or_insert(*state);
            }
        }
    }

    pub fn number_of_keys(&self) -> usize {
        let mut combined = HashMap::new();
        self.combine_into(&mut combined);
        combined.len()
    }
}

impl Slice for AggregationSlice {
    fn base(&self) -> &SliceBase {
        &self.base
    }

    fn serialize(&self, mut out: &mut dyn Write) -> Result<()> {
        let header = SliceHeader {
            start: self.base.start.0,
            end: self.base.end.0,
            number_of_threads: self.partials.len() as u64,
        };
        bincode::encode_into_std_write(header, &mut out, bincode::config::standard())?;
        for partial in &self.partials {
            let mut entries: Vec<(u64, AggregateState)> =
                partial.lock().iter().map(|(k, v)| (*k, *v)).collect();
            entries.sort_by_key(|(k, _)| *k);
            bincode::encode_into_std_write(entries, &mut out, bincode::config::standard())?;
        }
        Ok(())
    }

    fn deserialize(&self, _provider: &dyn BufferProvider, mut input: &mut dyn Read) -> Result<()> {
        let header: SliceHeader =
            bincode::decode_from_std_read(&mut input, bincode::config::standard())?;
        header.check(&self.base, self.partials.len() as u64)?;
        for partial in &self.partials {
            let entries: Vec<(u64, AggregateState)> =
                bincode::decode_from_std_read(&mut input, bincode::config::standard())?;
            *partial.lock() = entries.into_iter().collect();
        }
        Ok(())
    }
}

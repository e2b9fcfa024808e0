//! Per (worker thread, join side) cache from timestamps to recently used slices.
//!
//! Every region is a zero-initialized byte arena obtained from the buffer provider:
//!
//! ```text
//! | hits: u64 | misses: u64 | entry 0 | entry 1 | ... |
//! entry: | slice start: u64 | slice end: u64 | policy word: u64 | padding |
//! ```
//!
//! An entry with a slice end of zero is empty. Next to the arena each region keeps a weak
//! back-reference per entry; the cache never keeps a slice alive.

use crate::error::{Result, SliceStoreError};
use crate::metrics::{SLICE_CACHE_HITS, SLICE_CACHE_MISSES};
use crate::slice::Slice;
use parking_lot::Mutex;
use sluice_types::config::SliceCacheType;
use sluice_types::{Buffer, BufferProvider, JoinSide, Timestamp, WorkerThreadId};
use std::sync::{Arc, Weak};
use tracing::trace;

pub const HITS_OFFSET: usize = 0;
pub const MISSES_OFFSET: usize = 8;
pub const HEADER_SIZE: usize = 16;

const START_OFFSET: usize = 0;
const END_OFFSET: usize = 8;
const POLICY_OFFSET: usize = 16;
pub const MIN_ENTRY_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HitsAndMisses {
    pub hits: u64,
    pub misses: u64,
}

struct SliceCacheRegion<S> {
    memory: Buffer,
    slices: Vec<Weak<S>>,
    /// logical clock for lru, insertion counter for fifo
    tick: u64,
    /// clock hand for second chance
    hand: usize,
}

impl<S: Slice> SliceCacheRegion<S> {
    fn entry_offset(&self, size_of_entry: usize, index: usize) -> usize {
        HEADER_SIZE + index * size_of_entry
    }

    fn bump(&mut self, offset: usize) -> Result<()> {
        let v = self.memory.read_u64(offset)?;
        self.memory.write_u64(offset, v + 1)?;
        Ok(())
    }

    fn clear(&mut self, entry: usize, index: usize) -> Result<()> {
        self.memory.write_u64(entry + START_OFFSET, 0)?;
        self.memory.write_u64(entry + END_OFFSET, 0)?;
        self.memory.write_u64(entry + POLICY_OFFSET, 0)?;
        self.slices[index] = Weak::new();
        Ok(())
    }
}

pub struct SliceCache<S> {
    cache_type: SliceCacheType,
    size_of_entry: usize,
    number_of_entries: usize,
    number_of_threads: u64,
    regions: Vec<Mutex<SliceCacheRegion<S>>>,
}

fn side_label(side: JoinSide) -> &'static str {
    match side {
        JoinSide::Left => "left",
        JoinSide::Right => "right",
    }
}

impl<S: Slice> SliceCache<S> {
    /// Allocates one region per (worker thread, side). Fails if the provider cannot supply
    /// the memory; there is no fallback to an uncached mode from here.
    pub fn allocate(
        cache_type: SliceCacheType,
        size_of_entry: usize,
        number_of_entries: usize,
        number_of_threads: u64,
        provider: &dyn BufferProvider,
    ) -> Result<Self> {
        if size_of_entry < MIN_ENTRY_SIZE {
            return Err(SliceStoreError::Precondition(format!(
                "slice cache entries need at least {MIN_ENTRY_SIZE} bytes, got {size_of_entry}"
            )));
        }
        if number_of_threads == 0 {
            return Err(SliceStoreError::Precondition(
                "slice cache needs at least one worker thread".into(),
            ));
        }

        let number_of_entries = if cache_type == SliceCacheType::None {
            0
        } else {
            number_of_entries
        };
        let size = HEADER_SIZE + size_of_entry * number_of_entries;

        let mut regions = Vec::with_capacity(number_of_threads as usize * 2);
        for _ in 0..number_of_threads * 2 {
            let mut memory = provider
                .get_unpooled_buffer(size)
                .ok_or(SliceStoreError::AllocationFailed { size })?;
            memory.fill_zero();
            regions.push(Mutex::new(SliceCacheRegion {
                memory,
                slices: vec![Weak::new(); number_of_entries],
                tick: 0,
                hand: 0,
            }));
        }

        Ok(Self {
            cache_type,
            size_of_entry,
            number_of_entries,
            number_of_threads,
            regions,
        })
    }

    pub fn cache_type(&self) -> SliceCacheType {
        self.cache_type
    }

    fn region(&self, thread: WorkerThreadId, side: JoinSide) -> &Mutex<SliceCacheRegion<S>> {
        &self.regions[thread.index(self.number_of_threads) * 2 + side.index()]
    }

    /// Returns the cached slice covering `ts`, if any. Entries whose slice was dropped, retired
    /// or no longer matches the cached bounds are cleared and count as a miss.
    pub fn lookup(
        &self,
        thread: WorkerThreadId,
        side: JoinSide,
        ts: Timestamp,
    ) -> Result<Option<Arc<S>>> {
        let mut region = self.region(thread, side).lock();
        region.tick += 1;
        let tick = region.tick;

        for index in 0..self.number_of_entries {
            let entry = region.entry_offset(self.size_of_entry, index);
            let start = region.memory.read_u64(entry + START_OFFSET)?;
            let end = region.memory.read_u64(entry + END_OFFSET)?;
            if end == 0 || ts.0 < start || ts.0 >= end {
                continue;
            }

            let live = region.slices[index].upgrade().filter(|slice| {
                !slice.base().is_retired()
                    && slice.slice_start().0 == start
                    && slice.slice_end().0 == end
            });

            match live {
                Some(slice) => {
                    match self.cache_type {
                        SliceCacheType::Lru => region.memory.write_u64(entry + POLICY_OFFSET, tick)?,
                        SliceCacheType::SecondChance => {
                            region.memory.write_u64(entry + POLICY_OFFSET, 1)?
                        }
                        SliceCacheType::Fifo | SliceCacheType::None => {}
                    }
                    region.bump(HITS_OFFSET)?;
                    SLICE_CACHE_HITS.with_label_values(&[side_label(side)]).inc();
                    return Ok(Some(slice));
                }
                None => {
                    trace!("dropping stale slice cache entry [{}, {})", start, end);
                    region.clear(entry, index)?;
                    break;
                }
            }
        }

        region.bump(MISSES_OFFSET)?;
        SLICE_CACHE_MISSES.with_label_values(&[side_label(side)]).inc();
        Ok(None)
    }

    /// Remembers `slice` for later lookups, replacing an entry according to the cache policy.
    pub fn record(&self, thread: WorkerThreadId, side: JoinSide, slice: &Arc<S>) -> Result<()> {
        if self.number_of_entries == 0 {
            return Ok(());
        }

        let mut region = self.region(thread, side).lock();
        region.tick += 1;
        let tick = region.tick;

        let mut victim = None;
        for index in 0..self.number_of_entries {
            let entry = region.entry_offset(self.size_of_entry, index);
            if region.memory.read_u64(entry + END_OFFSET)? == 0 {
                victim = Some(index);
                break;
            }
        }

        let index = match victim {
            Some(index) => index,
            None => self.choose_victim(&mut region)?,
        };

        let entry = region.entry_offset(self.size_of_entry, index);
        region
            .memory
            .write_u64(entry + START_OFFSET, slice.slice_start().0)?;
        region.memory.write_u64(entry + END_OFFSET, slice.slice_end().0)?;
        let policy = match self.cache_type {
            SliceCacheType::Lru | SliceCacheType::Fifo => tick,
            SliceCacheType::SecondChance => 0,
            SliceCacheType::None => 0,
        };
        region.memory.write_u64(entry + POLICY_OFFSET, policy)?;
        region.slices[index] = Arc::downgrade(slice);
        Ok(())
    }

    fn choose_victim(&self, region: &mut SliceCacheRegion<S>) -> Result<usize> {
        match self.cache_type {
            SliceCacheType::Fifo | SliceCacheType::Lru | SliceCacheType::None => {
                // fifo stores the insertion tick, lru the last access tick
                let mut oldest = (u64::MAX, 0);
                for index in 0..self.number_of_entries {
                    let entry = region.entry_offset(self.size_of_entry, index);
                    let word = region.memory.read_u64(entry + POLICY_OFFSET)?;
                    if word < oldest.0 {
                        oldest = (word, index);
                    }
                }
                Ok(oldest.1)
            }
            SliceCacheType::SecondChance => loop {
                let index = region.hand;
                region.hand = (region.hand + 1) % self.number_of_entries;
                let entry = region.entry_offset(self.size_of_entry, index);
                if region.memory.read_u64(entry + POLICY_OFFSET)? == 0 {
                    return Ok(index);
                }
                region.memory.write_u64(entry + POLICY_OFFSET, 0)?;
            },
        }
    }

    pub fn hits_and_misses(&self, thread: WorkerThreadId, side: JoinSide) -> Result<HitsAndMisses> {
        let region = self.region(thread, side).lock();
        Ok(HitsAndMisses {
            hits: region.memory.read_u64(HITS_OFFSET)?,
            misses: region.memory.read_u64(MISSES_OFFSET)?,
        })
    }

    pub fn total_hits_and_misses(&self) -> Result<HitsAndMisses> {
        let mut total = HitsAndMisses::default();
        for region in &self.regions {
            let region = region.lock();
            total.hits += region.memory.read_u64(HITS_OFFSET)?;
            total.misses += region.memory.read_u64(MISSES_OFFSET)?;
        }
        Ok(total)
    }
}

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::Range;

pub mod buffer;
pub mod config;

pub use buffer::{Buffer, BufferProvider, HeapBufferProvider};

/// A point in engine time. The unit is whatever the time function produces (usually millis);
/// there are no calendar semantics attached.
#[derive(
    Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Encode, Decode, Serialize,
    Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const INITIAL: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn saturating_add(&self, delta: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(delta))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Timestamp(value)
    }
}

#[derive(Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Copy, Clone, Encode, Decode)]
pub struct WorkerThreadId(pub u64);

impl WorkerThreadId {
    /// Maps an arbitrary worker id onto `0..number_of_threads`.
    pub fn index(&self, number_of_threads: u64) -> usize {
        (self.0 % number_of_threads.max(1)) as usize
    }
}

impl Display for WorkerThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Copy, Clone, Encode, Decode)]
pub struct OriginId(pub u64);

impl Display for OriginId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Copy, Clone, Encode, Decode)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub const INITIAL: SequenceNumber = SequenceNumber(1);
}

/// Numbers the chunks of work that are emitted for a single window.
#[derive(Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Copy, Clone, Encode, Decode)]
pub struct ChunkNumber(pub u64);

impl ChunkNumber {
    pub const INITIAL: ChunkNumber = ChunkNumber(1);

    pub fn next(&self) -> ChunkNumber {
        ChunkNumber(self.0 + 1)
    }
}

#[derive(Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Copy, Clone, Encode, Decode)]
pub struct SliceId(pub u64);

#[derive(Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Copy, Clone, Encode, Decode)]
pub enum JoinSide {
    Left,
    Right,
}

impl JoinSide {
    pub const BOTH: [JoinSide; 2] = [JoinSide::Left, JoinSide::Right];

    pub fn index(&self) -> usize {
        match self {
            JoinSide::Left => 0,
            JoinSide::Right => 1,
        }
    }
}

impl Display for JoinSide {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinSide::Left => write!(f, "left"),
            JoinSide::Right => write!(f, "right"),
        }
    }
}

#[derive(Copy, Hash, Debug, Clone, Eq, PartialEq, Encode, Decode, PartialOrd, Ord)]
pub struct WindowInfo {
    pub window_start: Timestamp,
    pub window_end: Timestamp,
}

impl WindowInfo {
    pub fn new(window_start: Timestamp, window_end: Timestamp) -> Self {
        Self {
            window_start,
            window_end,
        }
    }

    pub fn contains(&self, t: Timestamp) -> bool {
        self.window_start <= t && t < self.window_end
    }

    /// Whether `[start, end)` lies completely inside of this window.
    pub fn covers(&self, start: Timestamp, end: Timestamp) -> bool {
        self.window_start <= start && self.window_end >= end
    }
}

impl From<Range<u64>> for WindowInfo {
    fn from(value: Range<u64>) -> Self {
        Self::new(Timestamp(value.start), Timestamp(value.end))
    }
}

impl Display for WindowInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.window_start, self.window_end)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WindowType {
    Tumbling { size: u64 },
    Sliding { size: u64, slide: u64 },
}

impl WindowType {
    pub fn size(&self) -> u64 {
        match self {
            WindowType::Tumbling { size } | WindowType::Sliding { size, .. } => *size,
        }
    }

    pub fn slide(&self) -> u64 {
        match self {
            WindowType::Tumbling { size } => *size,
            WindowType::Sliding { slide, .. } => *slide,
        }
    }
}

/// Row layout of the fixed-size records stored in a paged vector. The first `key_size` bytes
/// of every record form its key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct MemoryLayout {
    pub tuple_size: usize,
    pub key_size: usize,
    pub page_size: usize,
}

impl MemoryLayout {
    pub fn new(tuple_size: usize, key_size: usize, page_size: usize) -> Self {
        Self {
            tuple_size,
            key_size,
            page_size,
        }
    }

    pub fn capacity_per_page(&self) -> usize {
        if self.tuple_size == 0 {
            0
        } else {
            self.page_size / self.tuple_size
        }
    }

    pub fn is_valid(&self) -> bool {
        self.tuple_size > 0 && self.key_size <= self.tuple_size && self.capacity_per_page() > 0
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "kebab-case")]
pub enum FileLayout {
    #[default]
    NoSeparation,
    SeparateKeys,
}

/// Metadata attached to every input buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferMetaData {
    pub watermark: Timestamp,
    pub sequence_number: SequenceNumber,
    pub origin_id: OriginId,
    /// When the buffer was filled by its source; the event time of ingestion-time windows.
    pub creation_ts: Timestamp,
}

impl BufferMetaData {
    pub fn new(watermark: Timestamp, sequence_number: SequenceNumber, origin_id: OriginId) -> Self {
        Self {
            watermark,
            sequence_number,
            origin_id,
            creation_ts: watermark,
        }
    }

    pub fn with_creation_ts(mut self, creation_ts: Timestamp) -> Self {
        self.creation_ts = creation_ts;
        self
    }
}

impl Display for BufferMetaData {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "watermark: {} seq: {} origin: {}",
            self.watermark, self.sequence_number.0, self.origin_id
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueryTerminationType {
    Graceful,
    HardStop,
    Failure,
}

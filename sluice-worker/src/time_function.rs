use crate::operators::ExecutionContext;
use sluice_state::SliceStoreError;
use sluice_types::Timestamp;

/// Extracts the timestamp that decides which slice a record belongs to.
pub trait TimeFunction: Send + Sync {
    fn get_ts(&self, ctx: &ExecutionContext<'_>, record: &[u8]) -> sluice_state::Result<Timestamp>;
}

/// Event time stored in the record as a little-endian `u64` at a fixed offset.
#[derive(Debug, Clone, Copy)]
pub struct EventTimeFunction {
    offset: usize,
}

impl EventTimeFunction {
    pub fn new(offset: usize) -> Self {
        Self { offset }
    }

    /// Reads the timestamp without an execution context, e.g. while probing.
    pub fn read(&self, record: &[u8]) -> sluice_state::Result<Timestamp> {
        let bytes = record
            .get(self.offset..self.offset + 8)
            .ok_or_else(|| {
                SliceStoreError::InvalidRecord(format!(
                    "record of {} bytes has no timestamp at offset {}",
                    record.len(),
                    self.offset
                ))
            })?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(Timestamp(u64::from_le_bytes(raw)))
    }
}

impl TimeFunction for EventTimeFunction {
    fn get_ts(&self, _ctx: &ExecutionContext<'_>, record: &[u8]) -> sluice_state::Result<Timestamp> {
        self.read(record)
    }
}

/// Assigns every record of a buffer the time the buffer was created at.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestionTimeFunction;

impl TimeFunction for IngestionTimeFunction {
    fn get_ts(&self, ctx: &ExecutionContext<'_>, _record: &[u8]) -> sluice_state::Result<Timestamp> {
        Ok(ctx.meta.creation_ts)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pipeline::CollectingPipelineContext;
    use sluice_types::{
        BufferMetaData, HeapBufferProvider, OriginId, SequenceNumber, WorkerThreadId,
    };
    use std::sync::Arc;

    #[test]
    fn test_time_functions() {
        let pipeline = CollectingPipelineContext::new(1, Arc::new(HeapBufferProvider::new(64)));
        let meta = BufferMetaData::new(Timestamp(10), SequenceNumber(1), OriginId(0))
            .with_creation_ts(Timestamp(77));
        let ctx = ExecutionContext::new(WorkerThreadId(0), meta, 1, &pipeline);

        let mut record = 5u64.to_le_bytes().to_vec();
        record.extend_from_slice(&1234u64.to_le_bytes());

        assert_eq!(
            EventTimeFunction::new(8).get_ts(&ctx, &record).unwrap(),
            Timestamp(1234)
        );
        assert!(EventTimeFunction::new(12).get_ts(&ctx, &record).is_err());
        assert_eq!(
            IngestionTimeFunction.get_ts(&ctx, &record).unwrap(),
            Timestamp(77)
        );
    }
}

use parking_lot::Mutex;
use sluice_state::{Result, SliceStoreError};
use sluice_types::{OriginId, SequenceNumber, Timestamp};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

struct OriginWatermark {
    watermark: Timestamp,
    next_sequence_number: u64,
    /// updates that arrived before one of their predecessors
    pending: BTreeMap<u64, Timestamp>,
}

struct Watermarks {
    origins: HashMap<OriginId, OriginWatermark>,
    current: Timestamp,
}

/// Combines the watermarks of several inputs. Updates of one origin are applied in sequence
/// number order; the combined watermark is the minimum across origins and never decreases.
pub struct MultiOriginWatermarkProcessor {
    state: Mutex<Watermarks>,
}

impl MultiOriginWatermarkProcessor {
    pub fn new(origins: &[OriginId]) -> Self {
        Self {
            state: Mutex::new(Watermarks {
                origins: origins
                    .iter()
                    .map(|origin| {
                        (
                            *origin,
                            OriginWatermark {
                                watermark: Timestamp::INITIAL,
                                next_sequence_number: SequenceNumber::INITIAL.0,
                                pending: BTreeMap::new(),
                            },
                        )
                    })
                    .collect(),
                current: Timestamp::INITIAL,
            }),
        }
    }

    /// Applies the update and returns the resulting combined watermark.
    pub fn update_watermark(
        &self,
        watermark: Timestamp,
        sequence_number: SequenceNumber,
        origin: OriginId,
    ) -> Result<Timestamp> {
        let mut state = self.state.lock();
        let Some(entry) = state.origins.get_mut(&origin) else {
            return Err(SliceStoreError::Precondition(format!(
                "watermark from unknown origin {origin}"
            )));
        };

        if sequence_number.0 < entry.next_sequence_number {
            trace!(
                "ignoring replayed sequence number {} from origin {}",
                sequence_number.0,
                origin
            );
        } else {
            entry.pending.insert(sequence_number.0, watermark);
            while let Some(wm) = entry.pending.remove(&entry.next_sequence_number) {
                entry.watermark = entry.watermark.max(wm);
                entry.next_sequence_number += 1;
            }
        }

        let combined = state
            .origins
            .values()
            .map(|o| o.watermark)
            .min()
            .unwrap_or(Timestamp::INITIAL);
        state.current = state.current.max(combined);
        Ok(state.current)
    }

    pub fn get_current_watermark(&self) -> Timestamp {
        self.state.lock().current
    }

    /// Continues `origin` at `next_sequence_number`, e.g. after its producer was restored from
    /// a state file. Earlier sequence numbers are treated as replays from then on.
    pub fn resume_origin(
        &self,
        origin: OriginId,
        next_sequence_number: SequenceNumber,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let Some(entry) = state.origins.get_mut(&origin) else {
            return Err(SliceStoreError::Precondition(format!(
                "cannot resume unknown origin {origin}"
            )));
        };
        entry.next_sequence_number = entry.next_sequence_number.max(next_sequence_number.0);
        let next = entry.next_sequence_number;
        entry.pending.retain(|seq, _| *seq >= next);
        while let Some(wm) = entry.pending.remove(&entry.next_sequence_number) {
            entry.watermark = entry.watermark.max(wm);
            entry.next_sequence_number += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_single_origin_in_order() {
        let processor = MultiOriginWatermarkProcessor::new(&[OriginId(1)]);
        for (seq, wm) in [(1, 5), (2, 100), (3, 50)] {
            processor
                .update_watermark(Timestamp(wm), SequenceNumber(seq), OriginId(1))
                .unwrap();
        }
        assert_eq!(processor.get_current_watermark(), Timestamp(100));
    }

    #[test]
    fn test_out_of_order_sequence_numbers() {
        let processor = MultiOriginWatermarkProcessor::new(&[OriginId(1)]);
        assert_eq!(
            processor
                .update_watermark(Timestamp(20), SequenceNumber(2), OriginId(1))
                .unwrap(),
            Timestamp(0)
        );
        assert_eq!(
            processor
                .update_watermark(Timestamp(30), SequenceNumber(3), OriginId(1))
                .unwrap(),
            Timestamp(0)
        );
        assert_eq!(
            processor
                .update_watermark(Timestamp(10), SequenceNumber(1), OriginId(1))
                .unwrap(),
            Timestamp(30)
        );
    }

    #[test]
    fn test_minimum_across_origins() {
        let processor = MultiOriginWatermarkProcessor::new(&[OriginId(1), OriginId(2)]);
        processor
            .update_watermark(Timestamp(100), SequenceNumber(1), OriginId(1))
            .unwrap();
        assert_eq!(processor.get_current_watermark(), Timestamp(0));
        processor
            .update_watermark(Timestamp(40), SequenceNumber(1), OriginId(2))
            .unwrap();
        assert_eq!(processor.get_current_watermark(), Timestamp(40));

        assert!(processor
            .update_watermark(Timestamp(1), SequenceNumber(1), OriginId(9))
            .is_err());
    }

    #[test]
    fn test_resume_origin() {
        let processor = MultiOriginWatermarkProcessor::new(&[OriginId(1)]);
        processor.resume_origin(OriginId(1), SequenceNumber(5)).unwrap();
        processor
            .update_watermark(Timestamp(70), SequenceNumber(2), OriginId(1))
            .unwrap();
        assert_eq!(processor.get_current_watermark(), Timestamp(0));
        processor
            .update_watermark(Timestamp(80), SequenceNumber(5), OriginId(1))
            .unwrap();
        assert_eq!(processor.get_current_watermark(), Timestamp(80));
        assert!(processor.resume_origin(OriginId(2), SequenceNumber(1)).is_err());
    }
}

use super::join::StreamJoinOperatorHandler;
use super::WindowBasedOperatorHandler;
use crate::pipeline::EmittedNljWindowTrigger;
use crate::time_function::EventTimeFunction;
use lazy_static::lazy_static;
use prometheus::{register_int_counter, IntCounter};
use sluice_types::{BufferMetaData, JoinSide};
use std::sync::Arc;
use tracing::{debug, trace};

lazy_static! {
    static ref JOINED_TUPLES: IntCounter = register_int_counter!(
        "sluice_join_output_tuples",
        "Number of tuples produced by the nested-loop join probe"
    )
    .unwrap();
}

type JoinPredicate = Box<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

/// Joins the tuples of one (left slice, right slice) pair of a triggered window.
///
/// Every output record is `window_start | window_end | left tuple | right tuple`, with the
/// window bounds as little-endian `u64`.
pub struct NljProbe {
    handler: Arc<StreamJoinOperatorHandler>,
    left_time: EventTimeFunction,
    right_time: EventTimeFunction,
    predicate: JoinPredicate,
}

impl NljProbe {
    /// Probe with the default predicate: the leading `key_size` bytes of both tuples are equal.
    pub fn new(
        handler: Arc<StreamJoinOperatorHandler>,
        left_time: EventTimeFunction,
        right_time: EventTimeFunction,
    ) -> Self {
        let left_key = handler.left_layout().key_size;
        let right_key = handler.right_layout().key_size;
        Self {
            handler,
            left_time,
            right_time,
            predicate: Box::new(move |left, right| left[..left_key] == right[..right_key]),
        }
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&[u8], &[u8]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Box::new(predicate);
        self
    }

    pub fn output_tuple_size(&self) -> usize {
        16 + self.handler.left_layout().tuple_size + self.handler.right_layout().tuple_size
    }

    /// Produces the join result of one chunk. The last chunk of a window also releases the
    /// window's state in the handler.
    pub fn execute_task(&self, task: &EmittedNljWindowTrigger) -> anyhow::Result<Vec<Vec<u8>>> {
        let window = task.window_info;
        let in_window = |time: &EventTimeFunction, tuples: Vec<Vec<u8>>| {
            let mut kept = Vec::with_capacity(tuples.len());
            for tuple in tuples {
                if window.contains(time.read(&tuple)?) {
                    kept.push(tuple);
                }
            }
            Ok::<_, anyhow::Error>(kept)
        };

        let left = in_window(&self.left_time, task.slice_left.collect_tuples(JoinSide::Left))?;
        let right = in_window(&self.right_time, task.slice_right.collect_tuples(JoinSide::Right))?;

        let mut output = vec![];
        for l in &left {
            for r in &right {
                if (self.predicate)(l, r) {
                    let mut record = Vec::with_capacity(self.output_tuple_size());
                    record.extend_from_slice(&window.window_start.0.to_le_bytes());
                    record.extend_from_slice(&window.window_end.0.to_le_bytes());
                    record.extend_from_slice(l);
                    record.extend_from_slice(r);
                    output.push(record);
                }
            }
        }
        trace!(
            "chunk {} of window {}: {} x {} tuples joined into {}",
            task.chunk_number.0,
            window,
            left.len(),
            right.len(),
            output.len()
        );
        JOINED_TUPLES.inc_by(output.len() as u64);

        if task.is_last_chunk {
            debug!("window {} is complete", window);
            self.handler
                .garbage_collect_slices_and_windows(BufferMetaData::new(
                    window.window_end,
                    task.sequence_number,
                    task.origin_id,
                ))?;
        }
        Ok(output)
    }
}

use crate::error::{Result, SliceStoreError};
use sluice_types::{Timestamp, WindowInfo, WindowType};

/// Maps timestamps onto slices. Slice boundaries are every window start (`k * slide`) and
/// every window end (`k * slide + size`), so each window is an exact union of slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceAssigner {
    size: u64,
    slide: u64,
}

impl SliceAssigner {
    pub fn new(size: u64, slide: u64) -> Result<Self> {
        if size == 0 || slide == 0 {
            return Err(SliceStoreError::Precondition(format!(
                "window size ({size}) and slide ({slide}) must be positive"
            )));
        }
        Ok(Self { size, slide })
    }

    pub fn for_window(window_type: WindowType) -> Result<Self> {
        Self::new(window_type.size(), window_type.slide())
    }

    pub fn window_size(&self) -> u64 {
        self.size
    }

    pub fn window_slide(&self) -> u64 {
        self.slide
    }

    pub fn slice_start(&self, ts: Timestamp) -> Timestamp {
        let ts = ts.0;
        let last_window_start = ts - ts % self.slide;
        let last_window_end = if ts < self.size {
            last_window_start
        } else {
            ts - (ts - self.size) % self.slide
        };
        Timestamp(last_window_start.max(last_window_end))
    }

    pub fn slice_end(&self, ts: Timestamp) -> Timestamp {
        let ts = ts.0;
        let next_window_start = ts.saturating_add(self.slide - ts % self.slide);
        let next_window_end = if ts < self.size {
            self.size
        } else {
            ts.saturating_add(self.slide - (ts - self.size) % self.slide)
        };
        Timestamp(next_window_start.min(next_window_end))
    }

    /// Every window `w` with `w.start <= start` and `w.end >= end`, ordered by start.
    pub fn windows_for_slice(&self, start: Timestamp, end: Timestamp) -> Vec<WindowInfo> {
        let first = if end.0 > self.size {
            (end.0 - self.size).div_ceil(self.slide)
        } else {
            0
        };
        let last = start.0 / self.slide;

        (first..=last)
            .map(|k| {
                let window_start = k * self.slide;
                WindowInfo::new(
                    Timestamp(window_start),
                    Timestamp(window_start.saturating_add(self.size)),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test_case(2000, 2000, 100, 0, 2000; "tumbling")]
    #[test_case(2000, 2000, 2500, 2000, 4000; "tumbling second window")]
    #[test_case(100, 30, 95, 90, 100; "before first window end")]
    #[test_case(100, 30, 105, 100, 120; "after window end")]
    #[test_case(100, 30, 125, 120, 130; "between start and end")]
    #[test_case(10, 30, 15, 10, 30; "gap between hopping windows")]
    fn test_slice_bounds(size: u64, slide: u64, ts: u64, start: u64, end: u64) {
        let assigner = SliceAssigner::new(size, slide).unwrap();
        assert_eq!(assigner.slice_start(Timestamp(ts)), Timestamp(start));
        assert_eq!(assigner.slice_end(Timestamp(ts)), Timestamp(end));
    }

    #[test]
    fn test_slices_partition_time() {
        let assigner = SliceAssigner::new(100, 30).unwrap();
        let mut ts = Timestamp(0);
        while ts.0 < 1000 {
            let start = assigner.slice_start(ts);
            let end = assigner.slice_end(ts);
            assert_eq!(start, ts);
            assert!(start < end);
            for t in start.0..end.0 {
                assert_eq!(assigner.slice_start(Timestamp(t)), start);
                assert_eq!(assigner.slice_end(Timestamp(t)), end);
            }
            ts = end;
        }
    }

    #[test]
    fn test_windows_for_slice() {
        let assigner = SliceAssigner::new(100, 30).unwrap();
        assert_eq!(
            assigner.windows_for_slice(Timestamp(90), Timestamp(100)),
            vec![
                WindowInfo::from(0..100),
                WindowInfo::from(30..130),
                WindowInfo::from(60..160),
                WindowInfo::from(90..190),
            ]
        );
        assert_eq!(
            assigner.windows_for_slice(Timestamp(100), Timestamp(120)),
            vec![
                WindowInfo::from(30..130),
                WindowInfo::from(60..160),
                WindowInfo::from(90..190),
            ]
        );

        let tumbling = SliceAssigner::new(50, 50).unwrap();
        assert_eq!(
            tumbling.windows_for_slice(Timestamp(50), Timestamp(100)),
            vec![WindowInfo::from(50..100)]
        );

        let hopping = SliceAssigner::new(10, 30).unwrap();
        assert!(hopping
            .windows_for_slice(Timestamp(10), Timestamp(30))
            .is_empty());
    }

    #[test]
    fn test_rejects_zero_slide() {
        assert!(SliceAssigner::new(10, 0).is_err());
    }
}

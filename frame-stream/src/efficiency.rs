//! Useful-vs-total packet accounting over a sliding window of frames.
//!
//! Each closed frame contributes one `(total, useful)` sample.  The estimate
//! is `Σ useful / Σ total` over the last [`EFFICIENCY_WINDOW`] frames, always
//! in `[0.0, 1.0]`, and `1.0` when nothing was observed.

use std::collections::VecDeque;

/// Number of frames averaged by default.
pub const EFFICIENCY_WINDOW: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sample {
    total: u64,
    useful: u64,
}

/// Sliding-window packet efficiency estimator.
#[derive(Debug, Clone)]
pub struct EfficiencyEstimator {
    window: usize,
    samples: VecDeque<Sample>,
    total: u64,
    useful: u64,
}

impl Default for EfficiencyEstimator {
    fn default() -> Self {
        Self::new(EFFICIENCY_WINDOW)
    }
}

impl EfficiencyEstimator {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            total: 0,
            useful: 0,
        }
    }

    /// Close one frame's accounting.
    ///
    /// `useful` is capped at `total`.  Frames with no packets are ignored.
    pub fn record(&mut self, total: u64, useful: u64) {
        if total == 0 {
            return;
        }
        let sample = Sample {
            total,
            useful: useful.min(total),
        };
        if self.samples.len() == self.window {
            if let Some(old) = self.samples.pop_front() {
                self.total -= old.total;
                self.useful -= old.useful;
            }
        }
        self.total += sample.total;
        self.useful += sample.useful;
        self.samples.push_back(sample);
    }

    pub fn estimate(&self) -> f32 {
        if self.total == 0 {
            return 1.0;
        }
        (self.useful as f64 / self.total as f64).clamp(0.0, 1.0) as f32
    }

    pub fn frames(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_one() {
        let est = EfficiencyEstimator::default();
        assert_eq!(est.estimate(), 1.0);
        assert_eq!(est.frames(), 0);
    }

    #[test]
    fn ratio_over_frames() {
        let mut est = EfficiencyEstimator::default();
        est.record(4, 4);
        est.record(6, 2);
        assert!((est.estimate() - 0.6).abs() < 1e-6);
    }

    #[test]
    fn useful_is_capped_and_empty_frames_ignored() {
        let mut est = EfficiencyEstimator::default();
        est.record(2, 5);
        est.record(0, 0);
        assert_eq!(est.estimate(), 1.0);
        assert_eq!(est.frames(), 1);
    }

    #[test]
    fn window_slides() {
        let mut est = EfficiencyEstimator::new(2);
        est.record(10, 0);
        est.record(1, 1);
        est.record(1, 1);
        assert_eq!(est.frames(), 2);
        assert_eq!(est.estimate(), 1.0);
    }

    #[test]
    fn always_in_unit_range() {
        let mut est = EfficiencyEstimator::new(3);
        for (t, u) in [(1, 0), (7, 3), (9, 9), (2, 1), (5, 0)] {
            est.record(t, u);
            let e = est.estimate();
            assert!((0.0..=1.0).contains(&e));
        }
    }
}

//! Time-bounded sample buffer.

use std::collections::VecDeque;

/// Timestamped samples no older than `span_s` relative to the newest one.
///
/// Timestamps are seconds on any monotonic clock. A sample older than the
/// current newest is clamped to the newest timestamp so the buffer stays
/// ordered.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    span_s: f64,
    samples: VecDeque<(f64, f64)>,
}

impl SlidingWindow {
    /// Empty window keeping `span_s` seconds of history.
    pub fn new(span_s: f64) -> Self {
        Self {
            span_s,
            samples: VecDeque::new(),
        }
    }

    /// Configured span in seconds.
    pub fn span_limit(&self) -> f64 {
        self.span_s
    }

    /// Append a sample and trim everything older than the span.
    pub fn push(&mut self, t: f64, value: f64) {
        let t = match self.samples.back() {
            Some(&(last, _)) if t < last => last,
            _ => t,
        };
        self.samples.push_back((t, value));
        while let Some(&(front, _)) = self.samples.front() {
            if t - front > self.span_s {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Drop every sample.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Number of samples held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when no samples are held.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Oldest sample.
    pub fn oldest(&self) -> Option<(f64, f64)> {
        self.samples.front().copied()
    }

    /// Newest sample.
    pub fn latest(&self) -> Option<(f64, f64)> {
        self.samples.back().copied()
    }

    /// Seconds between the oldest and newest sample (0 when fewer than two).
    pub fn covered_s(&self) -> f64 {
        match (self.oldest(), self.latest()) {
            (Some((t0, _)), Some((t1, _))) => t1 - t0,
            _ => 0.0,
        }
    }

    /// `(elapsed_s, newest - oldest)` once at least two samples are held.
    pub fn delta(&self) -> Option<(f64, f64)> {
        if self.samples.len() < 2 {
            return None;
        }
        let (t0, v0) = self.oldest()?;
        let (t1, v1) = self.latest()?;
        Some((t1 - t0, v1 - v0))
    }

    /// Samples oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &(f64, f64)> {
        self.samples.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_samples_within_span_of_latest() {
        let mut window = SlidingWindow::new(10.0);
        let samples: Vec<(f64, f64)> = (0..30).map(|i| (i as f64 * 0.7, i as f64)).collect();
        for &(t, v) in &samples {
            window.push(t, v);
        }

        let latest = samples.last().unwrap().0;
        let expected: Vec<(f64, f64)> = samples
            .iter()
            .copied()
            .filter(|(t, _)| latest - t <= 10.0)
            .collect();
        let held: Vec<(f64, f64)> = window.iter().copied().collect();
        assert_eq!(held, expected);
    }

    #[test]
    fn sample_exactly_at_span_is_kept() {
        let mut window = SlidingWindow::new(5.0);
        window.push(0.0, 1.0);
        window.push(5.0, 2.0);
        assert_eq!(window.len(), 2);
        window.push(5.5, 3.0);
        assert_eq!(window.oldest(), Some((5.0, 2.0)));
    }

    #[test]
    fn delta_needs_two_samples() {
        let mut window = SlidingWindow::new(60.0);
        assert_eq!(window.delta(), None);
        window.push(1.0, 5.0);
        assert_eq!(window.delta(), None);
        assert_eq!(window.covered_s(), 0.0);
        window.push(3.0, 4.5);
        assert_eq!(window.delta(), Some((2.0, -0.5)));
    }

    #[test]
    fn out_of_order_timestamp_is_clamped() {
        let mut window = SlidingWindow::new(60.0);
        window.push(10.0, 1.0);
        window.push(9.0, 2.0);
        assert_eq!(window.latest(), Some((10.0, 2.0)));
    }

    #[test]
    fn clear_empties() {
        let mut window = SlidingWindow::new(1.0);
        window.push(0.0, 1.0);
        window.clear();
        assert!(window.is_empty());
    }
}

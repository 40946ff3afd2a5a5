//! Bounded sample window with percentile summaries.

use std::collections::VecDeque;

/// Fixed-capacity sliding window of f64 samples.
#[derive(Debug)]
pub struct SampleWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, value: f64) {
        if value < 0.0 || !value.is_finite() {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Nearest-rank percentile over the current window; `None` when empty.
    pub fn percentile(&self, percentile: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut ordered: Vec<f64> = self.samples.iter().copied().collect();
        ordered.sort_by(|a, b| a.partial_cmp(b).expect("finite samples"));
        let index = (percentile * (ordered.len() - 1) as f64).round() as usize;
        Some(ordered[index.min(ordered.len() - 1)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_window() {
        let window = SampleWindow::new(10);
        assert!(window.is_empty());
        assert_eq!(window.percentile(0.95), None);
    }

    #[test]
    fn test_percentile_ordering() {
        let mut window = SampleWindow::new(100);
        for value in [5.0, 1.0, 3.0, 2.0, 4.0] {
            window.push(value);
        }
        assert_eq!(window.percentile(0.0), Some(1.0));
        assert_eq!(window.percentile(1.0), Some(5.0));
        assert_eq!(window.percentile(0.5), Some(3.0));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut window = SampleWindow::new(3);
        for value in [1.0, 2.0, 3.0, 4.0] {
            window.push(value);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.percentile(0.0), Some(2.0));
    }

    #[test]
    fn test_negative_and_nan_ignored() {
        let mut window = SampleWindow::new(10);
        window.push(-1.0);
        window.push(f64::NAN);
        assert!(window.is_empty());
    }
}

//! Delivery health tracking for the pending reconciler.

use crate::window::SampleWindow;
use crate::names;
use metrics::{counter, histogram};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

const WINDOW: usize = 2000;

/// Snapshot of delivery health over the recent sample window.
#[derive(Clone, Debug, Serialize)]
pub struct DeliverySnapshot {
    pub pending_age_p95: Option<f64>,
    pub pending_samples: usize,
    pub delivery_success_rate: Option<f64>,
    pub delivery_samples: usize,
}

/// In-process delivery metrics; owned by the runtime, shared by reference.
#[derive(Debug)]
pub struct DeliveryMetrics {
    pending_ages: Mutex<SampleWindow>,
    results: Mutex<VecDeque<bool>>,
}

impl Default for DeliveryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryMetrics {
    pub fn new() -> Self {
        Self {
            pending_ages: Mutex::new(SampleWindow::new(WINDOW)),
            results: Mutex::new(VecDeque::with_capacity(WINDOW)),
        }
    }

    /// Record the age of a still-pending job.
    pub fn record_pending_age(&self, age_seconds: f64) {
        if age_seconds < 0.0 {
            return;
        }
        histogram!(names::PENDING_AGE).record(age_seconds);
        self.pending_ages
            .lock()
            .expect("delivery metrics lock poisoned")
            .push(age_seconds);
    }

    /// Record the outcome of one delivery attempt.
    pub fn record_delivery_attempt(&self, success: bool) {
        counter!(
            names::DELIVERIES,
            "outcome" => if success { "delivered" } else { "failed" }
        )
        .increment(1);
        let mut results = self.results.lock().expect("delivery metrics lock poisoned");
        if results.len() == WINDOW {
            results.pop_front();
        }
        results.push_back(success);
    }

    pub fn snapshot(&self) -> DeliverySnapshot {
        let ages = self
            .pending_ages
            .lock()
            .expect("delivery metrics lock poisoned");
        let results = self.results.lock().expect("delivery metrics lock poisoned");
        let success_rate = if results.is_empty() {
            None
        } else {
            let delivered = results.iter().filter(|ok| **ok).count();
            Some(delivered as f64 / results.len() as f64)
        };
        DeliverySnapshot {
            pending_age_p95: ages.percentile(0.95),
            pending_samples: ages.len(),
            delivery_success_rate: success_rate,
            delivery_samples: results.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot() {
        let metrics = DeliveryMetrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pending_age_p95, None);
        assert_eq!(snapshot.delivery_success_rate, None);
        assert_eq!(snapshot.pending_samples, 0);
    }

    #[test]
    fn test_success_rate() {
        let metrics = DeliveryMetrics::new();
        metrics.record_delivery_attempt(true);
        metrics.record_delivery_attempt(true);
        metrics.record_delivery_attempt(false);
        metrics.record_delivery_attempt(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.delivery_samples, 4);
        assert_eq!(snapshot.delivery_success_rate, Some(0.75));
    }

    #[test]
    fn test_pending_age_negative_ignored() {
        let metrics = DeliveryMetrics::new();
        metrics.record_pending_age(-5.0);
        metrics.record_pending_age(10.0);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pending_samples, 1);
        assert_eq!(snapshot.pending_age_p95, Some(10.0));
    }
}

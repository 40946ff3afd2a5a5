//! Orphaned dedupe entry tracking with a growth alert.

use crate::names;
use metrics::gauge;
use serde::Serialize;
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Clone, Debug, Serialize)]
pub struct OrphanSnapshot {
    pub orphan_count: usize,
}

#[derive(Debug, Default)]
struct OrphanState {
    count: usize,
    last_alerted: usize,
}

/// Tracks the orphan gauge and fires an alert when the count grows past the
/// configured threshold. Alerts re-arm once the count drops below threshold.
#[derive(Debug, Default)]
pub struct OrphanMetrics {
    state: Mutex<OrphanState>,
}

impl OrphanMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_orphan_count(&self, count: usize, alert_threshold: usize) {
        gauge!(names::ORPHAN_COUNT).set(count as f64);
        let mut state = self.state.lock().expect("orphan metrics lock poisoned");
        let previous = state.count;
        state.count = count;
        info!(
            name = "dedupe_orphan_count",
            value = count,
            delta = count as i64 - previous as i64,
            "METRIC_GAUGE"
        );
        if count >= alert_threshold && count > state.last_alerted {
            let growth = count - previous.max(state.last_alerted);
            warn!(
                count,
                threshold = alert_threshold,
                growth,
                "DEDUPE_ORPHAN_GROWTH_ALERT"
            );
            state.last_alerted = count;
        } else if count < alert_threshold {
            state.last_alerted = 0;
        }
    }

    pub fn snapshot(&self) -> OrphanSnapshot {
        let state = self.state.lock().expect("orphan metrics lock poisoned");
        OrphanSnapshot {
            orphan_count: state.count,
        }
    }
}

//! Light-level normalisation, median aggregation of samples, and the
//! edge-triggered curtain detector.

use std::time::{Duration, Instant};

use tracing::info;

use crate::state::{ControlState, CurtainState};

/// Full-scale raw reading of the light sensor.
const RAW_FULL_SCALE: f32 = 65535.0;

/// Map a raw 16-bit reading onto 0–100, rounded to two decimals.
pub fn normalize(raw: u16) -> f32 {
    let pct = f32::from(raw) / RAW_FULL_SCALE * 100.0;
    (pct * 100.0).round() / 100.0
}

/// Median of `samples`; `None` when empty.
pub fn median(samples: &[f32]) -> Option<f32> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f32::total_cmp);

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Buffers light samples and flushes their median on an interval, or early
/// once `max_samples` have accumulated.
#[derive(Debug)]
pub struct Aggregator {
    buffer: Vec<f32>,
    interval: Duration,
    max_samples: Option<usize>,
    last_flush: Instant,
}

impl Aggregator {
    pub fn new(interval: Duration, max_samples: Option<usize>, now: Instant) -> Self {
        Self {
            buffer: Vec::new(),
            interval,
            max_samples,
            last_flush: now,
        }
    }

    pub fn push(&mut self, level: f32) {
        self.buffer.push(level);
    }

    /// Flush if a trigger fired. Returns the median to publish, or `None`
    /// when not due or the buffer was empty.
    pub fn poll(&mut self, now: Instant) -> Option<f32> {
        let interval_due = now.saturating_duration_since(self.last_flush) >= self.interval;
        let size_due = self
            .max_samples
            .is_some_and(|max| self.buffer.len() >= max);
        if !interval_due && !size_due {
            return None;
        }

        self.last_flush = now;
        let value = median(&self.buffer);
        self.buffer.clear();
        value
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Curtain edge detection
// ---------------------------------------------------------------------------

/// Compare the hall sensor against the last reported curtain state. On a
/// change, flip the mode and return the new state to report.
pub fn observe_curtain(state: &mut ControlState, open: bool) -> Option<CurtainState> {
    let current = if open {
        CurtainState::Open
    } else {
        CurtainState::Closed
    };
    if state.curtain == Some(current) {
        return None;
    }

    state.curtain = Some(current);
    state.mode = current.mode();
    info!(curtain = ?current, mode = ?state.mode, "curtains moved");
    state.record_system(format!("curtains {}", current.as_payload()));
    Some(current)
}

// ===========================================================================
// Tests
// ===========================================================================

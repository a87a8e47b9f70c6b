use std::collections::HashMap;

use crate::error::SampleError;

/// A counter-like time series: a monotonic aggregate, the previous committed
/// aggregate, the current delta, and per-producer sub-aggregates so several
/// readers can contribute to one channel without clobbering each other.
///
/// Two write modes are supported on the same structure:
/// - delta push (`add_delta`) for sources that report increments, and
/// - aggregate set (`set_aggregate`) for sources that report cumulative
///   values per producer.
///
/// A producer reporting a value lower than its previous one is treated as a
/// restart from zero: the stale baseline is dropped so the next commit
/// credits the full post-restart value instead of clamping to zero.
#[derive(Debug, Clone, Default)]
pub struct Channel {
    agg: u64,
    prev_agg: u64,
    curr: u64,
    producers: HashMap<String, u64>,
}

impl Channel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a freshly observed increment.
    pub fn add_delta(&mut self, v: u64) {
        self.agg = self.agg.saturating_add(v);
        self.curr = self.agg.saturating_sub(self.prev_agg);
    }

    /// Push an increment expressed as a float (energy shares, model output).
    ///
    /// Rejects non-finite values; the rejection is fatal to this write only
    /// and leaves the channel consistent.
    pub fn add_delta_f64(&mut self, v: f64) -> Result<(), SampleError> {
        if !v.is_finite() {
            return Err(SampleError::NonFinite(v));
        }
        if v < 0.0 {
            return Err(SampleError::Negative(v));
        }
        self.add_delta(v.round() as u64);
        Ok(())
    }

    /// Set or replace one producer's cumulative contribution.
    ///
    /// The channel aggregate tracks the sum over producers. A decrease for
    /// the same producer id is a counter wrap or reader restart.
    pub fn set_aggregate(&mut self, producer: &str, v: u64) {
        let prev = match self.producers.get_mut(producer) {
            Some(slot) => std::mem::replace(slot, v),
            None => {
                self.producers.insert(producer.to_string(), v);
                0
            }
        };

        if v < prev {
            // Restart from zero: forget the stale baseline.
            self.prev_agg = self.prev_agg.saturating_sub(prev);
        }

        self.agg = self.agg.saturating_sub(prev).saturating_add(v);
        self.curr = self.agg.saturating_sub(self.prev_agg);
    }

    /// Snapshot the tick: fix `curr` and advance the baseline.
    ///
    /// Called exactly once per collection interval, after all writes and
    /// before export.
    pub fn commit(&mut self) {
        self.curr = self.agg.saturating_sub(self.prev_agg);
        self.prev_agg = self.agg;
    }

    /// Remove one producer's contribution entirely (container eviction).
    /// Both the aggregate and the baseline drop together, so no delta is
    /// emitted for the removal.
    pub fn remove_producer(&mut self, producer: &str) {
        if let Some(v) = self.producers.remove(producer) {
            self.agg = self.agg.saturating_sub(v);
            self.prev_agg = self.prev_agg.saturating_sub(v);
            self.curr = self.agg.saturating_sub(self.prev_agg);
        }
    }

    /// Latest aggregate value.
    pub fn aggregate(&self) -> u64 {
        self.agg
    }

    /// Delta of the last committed interval.
    pub fn delta(&self) -> u64 {
        self.curr
    }
}

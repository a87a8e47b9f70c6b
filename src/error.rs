use thiserror::Error;
use tracing::{debug, warn};

/// A rejected sample write. Fatal to the write only; the channel it targeted
/// remains consistent.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("non-finite sample value {0}")]
    NonFinite(f64),
    #[error("negative sample value {0}")]
    Negative(f64),
}

/// Failure taxonomy for the collection pipeline.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The backing interface is missing entirely. Raised at startup probing,
    /// or by a gate after repeated transient failures.
    #[error("{origin} unavailable: {reason}")]
    Unavailable { origin: &'static str, reason: String },

    /// A read failed this tick; the source is skipped and the tick proceeds.
    #[error("{origin} read failed: {reason}")]
    Transient { origin: &'static str, reason: String },
}

impl SourceError {
    pub fn unavailable(origin: &'static str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            origin,
            reason: reason.into(),
        }
    }

    pub fn transient(origin: &'static str, reason: impl Into<String>) -> Self {
        Self::Transient {
            origin,
            reason: reason.into(),
        }
    }
}

/// Tracks consecutive transient failures for one source and demotes it to
/// unavailable once the configured limit is reached.
///
/// Logging is rate-limited: the first failure of a streak logs at `warn`,
/// repeats at `debug`, and the demotion itself at `warn`.
#[derive(Debug)]
pub struct SourceGate {
    source: &'static str,
    consecutive_failures: u32,
    max_failures: u32,
    demoted: bool,
}

impl SourceGate {
    pub fn new(source: &'static str, max_failures: u32) -> Self {
        Self {
            source,
            consecutive_failures: 0,
            max_failures,
            demoted: false,
        }
    }

    /// Whether reads should still be attempted.
    pub fn is_open(&self) -> bool {
        !self.demoted
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self, err: &SourceError) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_failures == 1 {
            warn!(source = self.source, error = %err, "source read failed, skipping this tick");
        } else {
            debug!(
                source = self.source,
                error = %err,
                consecutive = self.consecutive_failures,
                "source read failed again",
            );
        }

        if self.consecutive_failures >= self.max_failures && !self.demoted {
            self.demoted = true;
            warn!(
                source = self.source,
                failures = self.consecutive_failures,
                "source demoted to unavailable for the rest of this run",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_demotes_after_limit() {
        let mut gate = SourceGate::new("test", 3);
        let err = SourceError::transient("test", "boom");

        assert!(gate.is_open());
        gate.record_failure(&err);
        gate.record_failure(&err);
        assert!(gate.is_open());
        gate.record_failure(&err);
        assert!(!gate.is_open());
    }

    #[test]
    fn test_gate_success_resets_streak() {
        let mut gate = SourceGate::new("test", 2);
        let err = SourceError::transient("test", "boom");

        gate.record_failure(&err);
        gate.record_success();
        gate.record_failure(&err);
        assert!(gate.is_open());
        gate.record_failure(&err);
        assert!(!gate.is_open());
    }
}

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::catalog;
use crate::error::SourceError;

const SOURCE: &str = "platform-model";

/// Linear regression substituting for a missing platform meter.
///
/// Estimates whole-node power in watts from the node's per-tick usage
/// deltas; the collector converts to energy over the tick window. The
/// coefficients are trained off-node and served by the model server;
/// inference here is a dot product.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformModel {
    /// Idle platform power, watts.
    pub intercept: f64,
    /// Watts per unit of each usage resource's per-tick delta.
    pub weights: HashMap<String, f64>,
}

impl PlatformModel {
    /// Fetch trained coefficients from the model server.
    pub fn fetch(endpoint: &str) -> Result<Self, SourceError> {
        let url = format!("{}/model/node/platform", endpoint.trim_end_matches('/'));

        let model: PlatformModel = reqwest::blocking::get(&url)
            .and_then(reqwest::blocking::Response::error_for_status)
            .and_then(|r| r.json())
            .map_err(|e| SourceError::unavailable(SOURCE, format!("fetching {url}: {e}")))?;

        info!(
            endpoint,
            features = model.weights.len(),
            "platform power model loaded",
        );

        Ok(model)
    }

    /// Fallback coefficients for when no server is reachable but estimation
    /// was requested anyway: CPU-time driven with a small idle floor.
    pub fn builtin_default() -> Self {
        let mut weights = HashMap::new();
        weights.insert(catalog::CPU_TIME.to_string(), 3.0e-9);
        Self {
            intercept: 10.0,
            weights,
        }
    }

    /// Estimated platform energy for one tick, millijoules.
    pub fn estimate_mj(&self, usage_deltas: &HashMap<&'static str, u64>, window: Duration) -> u64 {
        let mut watts = self.intercept;
        for (resource, weight) in &self.weights {
            if let Some(delta) = usage_deltas.get(resource.as_str()) {
                watts += weight * (*delta as f64);
            }
        }

        if !watts.is_finite() || watts < 0.0 {
            return 0;
        }

        (watts * window.as_secs_f64() * 1_000.0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_is_intercept_plus_weighted_usage() {
        let mut weights = HashMap::new();
        weights.insert(catalog::CPU_TIME.to_string(), 2.0e-9);
        let model = PlatformModel {
            intercept: 5.0,
            weights,
        };

        let mut usage = HashMap::new();
        usage.insert(catalog::CPU_TIME, 1_000_000_000u64); // 1 s of CPU time

        // (5 W + 2 W) over 3 s = 21 J.
        let mj = model.estimate_mj(&usage, Duration::from_secs(3));
        assert_eq!(mj, 21_000);
    }

    #[test]
    fn test_estimate_ignores_unknown_resources() {
        let mut weights = HashMap::new();
        weights.insert("not_collected".to_string(), 100.0);
        let model = PlatformModel {
            intercept: 1.0,
            weights,
        };

        let usage = HashMap::new();
        assert_eq!(model.estimate_mj(&usage, Duration::from_secs(1)), 1_000);
    }

    #[test]
    fn test_pathological_weights_clamp_to_zero() {
        let mut weights = HashMap::new();
        weights.insert(catalog::CPU_TIME.to_string(), f64::NAN);
        let model = PlatformModel {
            intercept: 1.0,
            weights,
        };

        let mut usage = HashMap::new();
        usage.insert(catalog::CPU_TIME, 10u64);
        assert_eq!(model.estimate_mj(&usage, Duration::from_secs(1)), 0);
    }
}

use std::collections::HashMap;
use std::time::Duration;

use nvml_wrapper::Nvml;
use tracing::info;

use crate::error::SourceError;

use super::{AcceleratorSampler, ProcessUtilization};

const SOURCE: &str = "accelerator";

/// NVML-backed sampler. Requires libnvidia-ml at runtime.
pub struct NvmlSampler {
    nvml: Nvml,
    device_count: u32,
    /// NVML process-utilization queries take the last-seen timestamp in
    /// microseconds since epoch; zero means "everything available".
    last_seen_ts_us: HashMap<u32, u64>,
    /// Last cumulative energy reading per device, for delta computation.
    last_energy_mj: HashMap<u32, u64>,
}

impl NvmlSampler {
    pub fn init() -> Result<Self, SourceError> {
        let nvml = Nvml::init()
            .map_err(|e| SourceError::unavailable(SOURCE, format!("NVML init: {e}")))?;

        let device_count = nvml
            .device_count()
            .map_err(|e| SourceError::unavailable(SOURCE, format!("device enumeration: {e}")))?;

        info!(devices = device_count, "NVML accelerator sampler ready");

        Ok(Self {
            nvml,
            device_count,
            last_seen_ts_us: HashMap::new(),
            last_energy_mj: HashMap::new(),
        })
    }
}

impl AcceleratorSampler for NvmlSampler {
    fn devices(&self) -> Vec<u32> {
        (0..self.device_count).collect()
    }

    fn process_utilization(
        &mut self,
        device: u32,
        _window: Duration,
    ) -> Result<HashMap<u32, ProcessUtilization>, SourceError> {
        let dev = self
            .nvml
            .device_by_index(device)
            .map_err(|e| SourceError::transient(SOURCE, format!("device {device}: {e}")))?;

        let since = self.last_seen_ts_us.get(&device).copied().unwrap_or(0);
        let samples = dev
            .process_utilization_stats(since)
            .map_err(|e| SourceError::transient(SOURCE, format!("device {device} utilization: {e}")))?;

        let mut by_pid: HashMap<u32, ProcessUtilization> = HashMap::with_capacity(samples.len());
        let mut newest = since;
        for s in samples {
            newest = newest.max(s.timestamp);
            let entry = by_pid.entry(s.pid).or_default();
            entry.sm_util += u64::from(s.sm_util);
            entry.mem_util += u64::from(s.mem_util);
        }
        self.last_seen_ts_us.insert(device, newest);

        Ok(by_pid)
    }

    fn device_energy_delta_mj(&mut self, device: u32) -> Result<u64, SourceError> {
        let dev = self
            .nvml
            .device_by_index(device)
            .map_err(|e| SourceError::transient(SOURCE, format!("device {device}: {e}")))?;

        let total_mj = dev
            .total_energy_consumption()
            .map_err(|e| SourceError::transient(SOURCE, format!("device {device} energy: {e}")))?;

        let prev = self.last_energy_mj.insert(device, total_mj).unwrap_or(0);
        // Driver reload resets the counter; credit the full new value then.
        Ok(total_mj.checked_sub(prev).unwrap_or(total_mj))
    }
}

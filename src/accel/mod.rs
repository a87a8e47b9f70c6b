#[cfg(feature = "gpu")]
pub mod nvml;

use std::collections::HashMap;
use std::time::Duration;

use crate::error::SourceError;

/// Utilization of one accelerator device by one process over the sampled
/// window, in device units (percent for NVML).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessUtilization {
    pub sm_util: u64,
    pub mem_util: u64,
}

/// Samples accelerator devices: per-process utilization and per-device
/// energy.
///
/// A failing device contributes no samples for the tick; other devices
/// proceed independently.
pub trait AcceleratorSampler: Send {
    /// Device indices present on this node.
    fn devices(&self) -> Vec<u32>;

    /// Per-pid utilization on one device over the elapsed window since the
    /// previous query.
    fn process_utilization(
        &mut self,
        device: u32,
        window: Duration,
    ) -> Result<HashMap<u32, ProcessUtilization>, SourceError>;

    /// Millijoules consumed by one device since the last read.
    fn device_energy_delta_mj(&mut self, device: u32) -> Result<u64, SourceError>;
}


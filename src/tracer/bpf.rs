use std::path::{Path, PathBuf};

use aya::maps::{HashMap as BpfHashMap, Map, MapData};
use tracing::info;

use crate::error::SourceError;

use super::{ProcessSample, ReadMode, TraceReader};

const SOURCE: &str = "tracing";

/// Default pin path of the per-pid counter map exposed by the kernel
/// tracing program.
pub const DEFAULT_MAP_PIN: &str = "/sys/fs/bpf/wattscope/processes";

/// Value layout of the kernel map. Must match the tracing program.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawProcessRecord {
    pub cgroup_id: u64,
    pub cpu_time_ns: u64,
    pub cpu_cycles: u64,
    pub cpu_instructions: u64,
    pub cache_misses: u64,
}

// SAFETY: plain-old-data with a fixed C layout and no padding-dependent
// invariants, as required for values read out of a BPF map.
unsafe impl aya::Pod for RawProcessRecord {}

/// Reads the pinned per-pid hash map. The kernel program accumulates, so
/// reads are cumulative.
pub struct PinnedMapReader {
    map: BpfHashMap<MapData, u32, RawProcessRecord>,
    pin_path: PathBuf,
}

impl PinnedMapReader {
    pub fn open_default() -> Result<Self, SourceError> {
        Self::open(Path::new(DEFAULT_MAP_PIN))
    }

    pub fn open(pin_path: &Path) -> Result<Self, SourceError> {
        let data = MapData::from_pin(pin_path).map_err(|e| {
            SourceError::unavailable(SOURCE, format!("opening {}: {e}", pin_path.display()))
        })?;

        let map = BpfHashMap::try_from(Map::HashMap(data)).map_err(|e| {
            SourceError::unavailable(SOURCE, format!("map {} has wrong shape: {e}", pin_path.display()))
        })?;

        info!(pin = %pin_path.display(), "opened tracing counter map");

        Ok(Self {
            map,
            pin_path: pin_path.to_path_buf(),
        })
    }
}

impl TraceReader for PinnedMapReader {
    fn read_mode(&self) -> ReadMode {
        ReadMode::Cumulative
    }

    fn read(&mut self) -> Result<Vec<ProcessSample>, SourceError> {
        let mut samples = Vec::with_capacity(128);

        for entry in self.map.iter() {
            let (pid, record) = entry.map_err(|e| {
                SourceError::transient(
                    SOURCE,
                    format!("iterating {}: {e}", self.pin_path.display()),
                )
            })?;

            samples.push(ProcessSample {
                pid,
                cgroup_id: (record.cgroup_id != 0).then_some(record.cgroup_id),
                cpu_time_ns: record.cpu_time_ns,
                cpu_cycles: record.cpu_cycles,
                cpu_instructions: record.cpu_instructions,
                cache_misses: record.cache_misses,
            });
        }

        Ok(samples)
    }
}

#[cfg(feature = "bpf")]
pub mod bpf;

use crate::catalog::{CACHE_MISS, CPU_CYCLES, CPU_INSTRUCTIONS};
use crate::error::SourceError;

/// One process's counters sampled from the kernel tracing map.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSample {
    pub pid: u32,
    /// Cgroup id as reported by the kernel program, when it collects one.
    pub cgroup_id: Option<u64>,
    pub cpu_time_ns: u64,
    pub cpu_cycles: u64,
    pub cpu_instructions: u64,
    pub cache_misses: u64,
}

/// Declared read semantics of the tracing map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// The read zeroes the kernel-side values; each sample is an increment.
    Destructive,
    /// Values accumulate in the kernel; each sample is a running aggregate.
    Cumulative,
}

/// Reads the per-pid tracing map maintained by the kernel program.
///
/// The kernel program itself is loaded externally; this trait only consumes
/// the map it exposes.
pub trait TraceReader: Send {
    fn read_mode(&self) -> ReadMode;

    /// Read every entry currently in the map.
    fn read(&mut self) -> Result<Vec<ProcessSample>, SourceError>;

    /// Hardware counters this reader can supply, for catalog probing.
    fn available_counters(&self) -> Vec<&'static str> {
        vec![CPU_CYCLES, CPU_INSTRUCTIONS, CACHE_MISS]
    }
}

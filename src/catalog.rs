/// Channel names used across records and exposition.
///
/// Counter channels fed by the kernel tracing map.
pub const CPU_CYCLES: &str = "cpu_cycles";
pub const CPU_INSTRUCTIONS: &str = "cpu_instructions";
pub const CACHE_MISS: &str = "cache_miss";

/// CPU time is always present when tracing is; it has its own channel.
pub const CPU_TIME: &str = "cpu_time";

/// Cgroup pseudo-filesystem channels.
pub const CGROUPFS_MEMORY: &str = "cgroupfs_memory";
pub const CGROUPFS_KERNEL_MEMORY: &str = "cgroupfs_kernel_memory";
pub const CGROUPFS_TCP_MEMORY: &str = "cgroupfs_tcp_memory";
pub const CGROUPFS_CPU: &str = "cgroupfs_cpu";
pub const CGROUPFS_USER_CPU: &str = "cgroupfs_user_cpu";
pub const CGROUPFS_SYSTEM_CPU: &str = "cgroupfs_system_cpu";
pub const BYTES_READ: &str = "bytes_read";
pub const BYTES_WRITE: &str = "bytes_write";

/// Kubelet stats-summary channels.
pub const KUBELET_CONTAINER_CPU: &str = "kubelet_container_cpu";
pub const KUBELET_CONTAINER_MEMORY: &str = "kubelet_container_memory";

/// Accelerator utilization channels.
pub const ACCEL_SM_UTIL: &str = "accel_sm_util";
pub const ACCEL_MEM_UTIL: &str = "accel_mem_util";

/// The reserved bucket for samples whose container cannot be resolved.
pub const SYSTEM_PROCESS_ID: &str = "system_processes";

/// Which channels exist on this node.
///
/// Populated once at startup by probing each source for capability, then
/// threaded through constructors as shared immutable state. Channels absent
/// from the catalog are neither created nor exported.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub counters: Vec<&'static str>,
    pub cgroup: Vec<&'static str>,
    pub kubelet: Vec<&'static str>,
    pub accelerator: Vec<&'static str>,
}

impl Catalog {
    /// Catalog entries for a node where every source probed successfully.
    pub fn full() -> Self {
        Self {
            counters: vec![CPU_CYCLES, CPU_INSTRUCTIONS, CACHE_MISS],
            cgroup: vec![
                CGROUPFS_MEMORY,
                CGROUPFS_KERNEL_MEMORY,
                CGROUPFS_TCP_MEMORY,
                CGROUPFS_CPU,
                CGROUPFS_USER_CPU,
                CGROUPFS_SYSTEM_CPU,
                BYTES_READ,
                BYTES_WRITE,
            ],
            kubelet: vec![KUBELET_CONTAINER_CPU, KUBELET_CONTAINER_MEMORY],
            accelerator: vec![ACCEL_SM_UTIL, ACCEL_MEM_UTIL],
        }
    }

    /// All resource channel names the node record aggregates over.
    pub fn node_resources(&self) -> Vec<&'static str> {
        let mut names = Vec::with_capacity(
            1 + self.counters.len() + self.cgroup.len() + self.kubelet.len()
                + self.accelerator.len(),
        );
        names.push(CPU_TIME);
        names.extend_from_slice(&self.counters);
        names.extend_from_slice(&self.cgroup);
        names.extend_from_slice(&self.kubelet);
        names.extend_from_slice(&self.accelerator);
        names
    }

    pub fn has_counter(&self, name: &str) -> bool {
        self.counters.contains(&name)
    }
}

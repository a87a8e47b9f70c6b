use std::collections::HashMap;

use crate::catalog::{self, Catalog};
use crate::channel::Channel;

use super::EnergyStats;

/// All channels tracked for one workload (container, pod member, or the
/// reserved system-process bucket).
///
/// Records are created lazily on first observation of a container id and
/// persist across ticks; only channels named in the catalog are created.
#[derive(Debug, Clone)]
pub struct ContainerMetrics {
    pub container_id: String,
    pub container_name: String,
    pub pod_name: String,
    pub namespace: String,

    /// Hardware counter channels (cycles, instructions, cache misses).
    pub counters: HashMap<&'static str, Channel>,
    /// CPU time in nanoseconds from the tracing source.
    pub cpu_time: Channel,
    /// Cgroup pseudo-filesystem channels (memory and cpu sub-families).
    pub cgroup: HashMap<&'static str, Channel>,
    /// Block IO bytes from the cgroup io controller.
    pub bytes_read: Channel,
    pub bytes_write: Channel,
    /// Kubelet stats-summary channels.
    pub kubelet: HashMap<&'static str, Channel>,
    /// Accelerator utilization channels.
    pub accelerator: HashMap<&'static str, Channel>,

    /// Attributed energy per component, in millijoules.
    pub energy: EnergyStats,
}

impl ContainerMetrics {
    pub fn new(
        catalog: &Catalog,
        container_id: &str,
        container_name: &str,
        pod_name: &str,
        namespace: &str,
    ) -> Self {
        let make = |names: &[&'static str]| -> HashMap<&'static str, Channel> {
            names.iter().map(|n| (*n, Channel::new())).collect()
        };

        let cgroup_names: Vec<&'static str> = catalog
            .cgroup
            .iter()
            .copied()
            .filter(|n| *n != catalog::BYTES_READ && *n != catalog::BYTES_WRITE)
            .collect();

        Self {
            container_id: container_id.to_string(),
            container_name: container_name.to_string(),
            pod_name: pod_name.to_string(),
            namespace: namespace.to_string(),
            counters: make(&catalog.counters),
            cpu_time: Channel::new(),
            cgroup: make(&cgroup_names),
            bytes_read: Channel::new(),
            bytes_write: Channel::new(),
            kubelet: make(&catalog.kubelet),
            accelerator: make(&catalog.accelerator),
            energy: EnergyStats::default(),
        }
    }

    /// Resolve any catalog resource name to its channel.
    pub fn resource_channel(&self, name: &str) -> Option<&Channel> {
        match name {
            catalog::CPU_TIME => Some(&self.cpu_time),
            catalog::BYTES_READ => Some(&self.bytes_read),
            catalog::BYTES_WRITE => Some(&self.bytes_write),
            _ => self
                .counters
                .get(name)
                .or_else(|| self.cgroup.get(name))
                .or_else(|| self.kubelet.get(name))
                .or_else(|| self.accelerator.get(name)),
        }
    }

    /// Commit every usage channel. Energy channels are committed separately,
    /// during attribution.
    pub fn commit_usage(&mut self) {
        for ch in self.counters.values_mut() {
            ch.commit();
        }
        self.cpu_time.commit();
        for ch in self.cgroup.values_mut() {
            ch.commit();
        }
        self.bytes_read.commit();
        self.bytes_write.commit();
        for ch in self.kubelet.values_mut() {
            ch.commit();
        }
        for ch in self.accelerator.values_mut() {
            ch.commit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channels_follow_catalog() {
        let catalog = Catalog::full();
        let c = ContainerMetrics::new(&catalog, "abc", "web", "web-0", "prod");

        assert!(c.counters.contains_key(catalog::CPU_CYCLES));
        assert!(c.cgroup.contains_key(catalog::CGROUPFS_MEMORY));
        // IO bytes live in their own channels, not the cgroup map.
        assert!(!c.cgroup.contains_key(catalog::BYTES_READ));
        assert!(c.resource_channel(catalog::BYTES_READ).is_some());
        assert!(c.resource_channel(catalog::CPU_TIME).is_some());
    }

    #[test]
    fn test_empty_catalog_creates_no_optional_channels() {
        let c = ContainerMetrics::new(&Catalog::default(), "abc", "", "", "");
        assert!(c.counters.is_empty());
        assert!(c.cgroup.is_empty());
        assert!(c.kubelet.is_empty());
        assert!(c.accelerator.is_empty());
        assert!(c.resource_channel("no_such_resource").is_none());
    }

    #[test]
    fn test_commit_usage_commits_every_family() {
        let catalog = Catalog::full();
        let mut c = ContainerMetrics::new(&catalog, "abc", "web", "web-0", "prod");

        c.counters
            .get_mut(catalog::CPU_CYCLES)
            .expect("catalog channel")
            .add_delta(10);
        c.cpu_time.add_delta(7);
        c.cgroup
            .get_mut(catalog::CGROUPFS_MEMORY)
            .expect("catalog channel")
            .set_aggregate("abc", 4096);

        c.commit_usage();
        assert_eq!(c.counters[catalog::CPU_CYCLES].delta(), 10);
        assert_eq!(c.cpu_time.delta(), 7);
        assert_eq!(c.cgroup[catalog::CGROUPFS_MEMORY].delta(), 4096);
    }
}

use std::collections::HashMap;

use crate::catalog::Catalog;
use crate::channel::Channel;

use super::{Component, ContainerMetrics};

/// Per-socket component energy channels, millijoules.
#[derive(Debug, Clone, Default)]
pub struct SocketEnergy {
    pub package: Channel,
    pub core: Channel,
    pub uncore: Channel,
    pub dram: Channel,
}

impl SocketEnergy {
    pub fn commit(&mut self) {
        self.package.commit();
        self.core.commit();
        self.uncore.commit();
        self.dram.commit();
    }
}

/// Provenance of the platform energy channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformMode {
    /// Read from a hardware meter.
    Measured,
    /// Substituted by a trained regression over node usage.
    Estimated,
    /// No platform source at all.
    Absent,
}

impl PlatformMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformMode::Measured => "measured",
            PlatformMode::Estimated => "estimated",
            PlatformMode::Absent => "absent",
        }
    }
}

/// Node-wide aggregate of container usage plus node-only signals.
#[derive(Debug, Clone)]
pub struct NodeMetrics {
    /// Usage sums keyed by catalog resource name. Each channel's aggregate
    /// equals the sum of matching container aggregates at snapshot time,
    /// with one producer per container.
    pub resources: HashMap<&'static str, Channel>,

    /// Component energy per socket.
    pub sockets: HashMap<u32, SocketEnergy>,

    /// Whole-node energy from the platform meter or the model.
    pub platform: Channel,
    pub platform_mode: PlatformMode,

    /// Per-device accelerator energy.
    pub gpu: HashMap<u32, Channel>,

    /// Average CPU frequency per core, kHz. Gauge semantics, replaced whole
    /// each tick.
    pub cpu_frequency_khz: HashMap<u32, u64>,
}

impl NodeMetrics {
    pub fn new(catalog: &Catalog) -> Self {
        Self {
            resources: catalog
                .node_resources()
                .into_iter()
                .map(|n| (n, Channel::new()))
                .collect(),
            sockets: HashMap::new(),
            platform: Channel::new(),
            platform_mode: PlatformMode::Absent,
            gpu: HashMap::new(),
            cpu_frequency_khz: HashMap::new(),
        }
    }

    /// Fold current container aggregates into the node resource channels.
    /// Channel producer bookkeeping keeps multi-container sums and restarts
    /// correct without extra state here.
    pub fn roll_up_resources<'a>(
        &mut self,
        containers: impl Iterator<Item = &'a ContainerMetrics>,
    ) {
        for container in containers {
            for (name, node_ch) in self.resources.iter_mut() {
                if let Some(ch) = container.resource_channel(name) {
                    node_ch.set_aggregate(&container.container_id, ch.aggregate());
                }
            }
        }
        for ch in self.resources.values_mut() {
            ch.commit();
        }
    }

    /// Current-tick energy of one component, summed over sockets or devices.
    pub fn component_delta_mj(&self, component: Component) -> u64 {
        match component {
            Component::Package => self.sockets.values().map(|s| s.package.delta()).sum(),
            Component::Core => self.sockets.values().map(|s| s.core.delta()).sum(),
            Component::Uncore => self.sockets.values().map(|s| s.uncore.delta()).sum(),
            Component::Dram => self.sockets.values().map(|s| s.dram.delta()).sum(),
            Component::Gpu => self.gpu.values().map(Channel::delta).sum(),
            Component::Platform => self.platform.delta(),
            // Residual: platform energy not covered by the measured
            // components. Zero when no platform source exists.
            Component::Other => {
                let covered = self.component_delta_mj(Component::Package)
                    + self.component_delta_mj(Component::Dram)
                    + self.component_delta_mj(Component::Gpu);
                self.platform.delta().saturating_sub(covered)
            }
        }
    }

    /// Commit the node energy channels. Resource channels are committed by
    /// `roll_up_resources`.
    pub fn commit_energy(&mut self) {
        for socket in self.sockets.values_mut() {
            socket.commit();
        }
        self.platform.commit();
        for ch in self.gpu.values_mut() {
            ch.commit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;

    #[test]
    fn test_roll_up_matches_container_sums() {
        let cat = Catalog::full();
        let mut node = NodeMetrics::new(&cat);

        let mut a = ContainerMetrics::new(&cat, "a", "a", "", "");
        let mut b = ContainerMetrics::new(&cat, "b", "b", "", "");
        a.counters
            .get_mut(catalog::CPU_CYCLES)
            .expect("channel")
            .add_delta(10);
        b.counters
            .get_mut(catalog::CPU_CYCLES)
            .expect("channel")
            .add_delta(30);
        a.commit_usage();
        b.commit_usage();

        node.roll_up_resources([&a, &b].into_iter());

        let node_cycles = &node.resources[catalog::CPU_CYCLES];
        assert_eq!(node_cycles.aggregate(), 40);
        assert_eq!(node_cycles.delta(), 40);
    }

    #[test]
    fn test_roll_up_tracks_container_restart() {
        let cat = Catalog::full();
        let mut node = NodeMetrics::new(&cat);
        let mut a = ContainerMetrics::new(&cat, "a", "a", "", "");

        let ch = a.counters.get_mut(catalog::CPU_CYCLES).expect("channel");
        ch.set_aggregate("a", 10);
        a.commit_usage();
        node.roll_up_resources(std::iter::once(&a));
        assert_eq!(node.resources[catalog::CPU_CYCLES].delta(), 10);

        // Wrap: 10 -> 5. Node delta must equal the container delta (5).
        let ch = a.counters.get_mut(catalog::CPU_CYCLES).expect("channel");
        ch.set_aggregate("a", 5);
        a.commit_usage();
        node.roll_up_resources(std::iter::once(&a));
        assert_eq!(a.counters[catalog::CPU_CYCLES].delta(), 5);
        assert_eq!(node.resources[catalog::CPU_CYCLES].delta(), 5);
    }

    #[test]
    fn test_component_delta_sums_sockets() {
        let mut node = NodeMetrics::new(&Catalog::full());
        let mut s0 = SocketEnergy::default();
        let mut s1 = SocketEnergy::default();
        s0.package.add_delta(8);
        s1.package.add_delta(4);
        s0.commit();
        s1.commit();
        node.sockets.insert(0, s0);
        node.sockets.insert(1, s1);

        assert_eq!(node.component_delta_mj(Component::Package), 12);
        assert_eq!(node.component_delta_mj(Component::Dram), 0);
    }

    #[test]
    fn test_other_is_platform_residual() {
        let mut node = NodeMetrics::new(&Catalog::full());
        let mut s0 = SocketEnergy::default();
        s0.package.add_delta(6);
        s0.dram.add_delta(2);
        s0.commit();
        node.sockets.insert(0, s0);
        node.platform.add_delta(10);
        node.platform.commit();

        assert_eq!(node.component_delta_mj(Component::Other), 2);
    }
}

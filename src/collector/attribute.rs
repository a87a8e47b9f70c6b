use std::collections::HashMap;

use tracing::debug;

use crate::catalog::{self, Catalog};
use crate::metrics::{Component, ContainerMetrics, NodeMetrics};

/// Which usage resources apportion each energy component, with weights.
///
/// Resolved once at startup from the catalog so missing sources degrade to
/// the next available key instead of silently dropping attribution:
/// package/core/uncore use CPU cycles (CPU time when no counters exist),
/// dram uses cache misses (cgroup memory bytes as fallback), gpu uses SM
/// utilization, and platform blends the package and dram keys equally.
#[derive(Debug, Clone)]
pub struct AttributionScheme {
    cpu_key: &'static str,
    dram_keys: Vec<(&'static str, f64)>,
    gpu_keys: Vec<(&'static str, f64)>,
}

impl AttributionScheme {
    pub fn new(catalog: &Catalog) -> Self {
        let cpu_key = if catalog.has_counter(catalog::CPU_CYCLES) {
            catalog::CPU_CYCLES
        } else if catalog.cgroup.contains(&catalog::CGROUPFS_CPU) {
            catalog::CGROUPFS_CPU
        } else {
            catalog::CPU_TIME
        };

        let dram_key = if catalog.has_counter(catalog::CACHE_MISS) {
            catalog::CACHE_MISS
        } else if catalog.cgroup.contains(&catalog::CGROUPFS_MEMORY) {
            catalog::CGROUPFS_MEMORY
        } else {
            cpu_key
        };

        let gpu_keys = if catalog.accelerator.contains(&catalog::ACCEL_SM_UTIL) {
            vec![(catalog::ACCEL_SM_UTIL, 1.0)]
        } else {
            Vec::new()
        };

        debug!(cpu_key, dram_key, "attribution resource keys resolved");

        Self {
            cpu_key,
            dram_keys: vec![(dram_key, 1.0)],
            gpu_keys,
        }
    }

    /// Weighted resource keys for one component.
    pub fn keys_for(&self, component: Component) -> Vec<(&'static str, f64)> {
        match component {
            Component::Package | Component::Core | Component::Uncore => {
                vec![(self.cpu_key, 1.0)]
            }
            Component::Dram => self.dram_keys.clone(),
            Component::Gpu => self.gpu_keys.clone(),
            // Whole-node components follow a blend of compute and memory
            // pressure.
            Component::Platform | Component::Other => {
                let mut keys = vec![(self.cpu_key, 0.5)];
                for (key, weight) in &self.dram_keys {
                    keys.push((*key, weight * 0.5));
                }
                keys
            }
        }
    }
}

/// Weighted usage of one container under a key set, from committed deltas.
fn weighted_usage(container: &ContainerMetrics, keys: &[(&'static str, f64)]) -> f64 {
    keys.iter()
        .map(|(key, weight)| {
            container
                .resource_channel(key)
                .map(|ch| ch.delta() as f64 * weight)
                .unwrap_or(0.0)
        })
        .sum()
}

/// Per-container share of one component's energy. All zeros when no
/// container used the keyed resource this tick.
pub fn compute_shares(
    containers: &HashMap<String, ContainerMetrics>,
    keys: &[(&'static str, f64)],
) -> HashMap<String, f64> {
    let usages: HashMap<String, f64> = containers
        .iter()
        .map(|(id, c)| (id.clone(), weighted_usage(c, keys)))
        .collect();

    let denominator: f64 = usages.values().sum();
    if denominator <= 0.0 {
        return usages.keys().map(|id| (id.clone(), 0.0)).collect();
    }

    usages
        .into_iter()
        .map(|(id, usage)| (id, usage / denominator))
        .collect()
}

/// Split an integer energy amount by fractional shares so the parts sum
/// exactly to the whole: floor every part, then hand the remainder out by
/// largest fractional part (ties broken by id for determinism).
fn apportion_mj(energy_mj: u64, shares: &HashMap<String, f64>) -> HashMap<String, u64> {
    let mut parts: Vec<(String, u64, f64)> = shares
        .iter()
        .map(|(id, share)| {
            let exact = share * energy_mj as f64;
            let floor = exact.floor() as u64;
            (id.clone(), floor, exact - exact.floor())
        })
        .collect();

    let assigned: u64 = parts.iter().map(|(_, floor, _)| floor).sum();
    let mut remainder = energy_mj.saturating_sub(assigned);

    parts.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
    for part in parts.iter_mut() {
        if remainder == 0 {
            break;
        }
        if part.2 > 0.0 {
            part.1 += 1;
            remainder -= 1;
        }
    }

    parts.into_iter().map(|(id, mj, _)| (id, mj)).collect()
}

/// Apportion every component's per-tick energy across containers and commit
/// the container energy channels, including the derived total.
pub fn attribute_energy(
    containers: &mut HashMap<String, ContainerMetrics>,
    node: &NodeMetrics,
    scheme: &AttributionScheme,
) {
    for component in Component::ALL {
        let energy_mj = node.component_delta_mj(component);
        let shares = compute_shares(containers, &scheme.keys_for(component));
        let attributed = apportion_mj(energy_mj, &shares);

        for (id, container) in containers.iter_mut() {
            let mj = attributed.get(id).copied().unwrap_or(0);
            let channel = container.energy.channel_mut(component);
            if mj > 0 {
                channel.add_delta(mj);
            }
            channel.commit();
        }
    }

    // Total = measured components plus the platform residual; equals the
    // container's platform share whenever a platform source exists.
    for container in containers.values_mut() {
        let total = container.energy.package.delta()
            + container.energy.dram.delta()
            + container.energy.gpu.delta()
            + container.energy.other.delta();
        container.energy.total.add_delta(total);
        container.energy.total.commit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::node::SocketEnergy;

    fn container_with_cycles(catalog: &Catalog, id: &str, cycles: u64) -> ContainerMetrics {
        let mut c = ContainerMetrics::new(catalog, id, id, "", "");
        let ch = c
            .counters
            .get_mut(catalog::CPU_CYCLES)
            .expect("cycles channel");
        ch.add_delta(cycles);
        c.commit_usage();
        c
    }

    fn node_with_package_energy(catalog: &Catalog, mj: u64) -> NodeMetrics {
        let mut node = NodeMetrics::new(catalog);
        let mut socket = SocketEnergy::default();
        socket.package.add_delta(mj);
        node.sockets.insert(0, socket);
        node.commit_energy();
        node
    }

    #[test]
    fn test_equal_cycles_split_energy_evenly() {
        let catalog = Catalog::full();
        let mut containers = HashMap::new();
        containers.insert("a".into(), container_with_cycles(&catalog, "a", 10));
        containers.insert("b".into(), container_with_cycles(&catalog, "b", 10));
        let node = node_with_package_energy(&catalog, 8);

        attribute_energy(&mut containers, &node, &AttributionScheme::new(&catalog));

        assert_eq!(containers["a"].energy.package.delta(), 4);
        assert_eq!(containers["b"].energy.package.delta(), 4);
    }

    #[test]
    fn test_skewed_cycles_split_energy_proportionally() {
        let catalog = Catalog::full();
        let mut containers = HashMap::new();
        containers.insert("a".into(), container_with_cycles(&catalog, "a", 10));
        containers.insert("b".into(), container_with_cycles(&catalog, "b", 30));
        let node = node_with_package_energy(&catalog, 8);

        attribute_energy(&mut containers, &node, &AttributionScheme::new(&catalog));

        assert_eq!(containers["a"].energy.package.delta(), 2);
        assert_eq!(containers["b"].energy.package.delta(), 6);
    }

    #[test]
    fn test_zero_denominator_attributes_nothing() {
        let catalog = Catalog::full();
        let mut containers = HashMap::new();
        containers.insert("a".into(), container_with_cycles(&catalog, "a", 0));
        let node = node_with_package_energy(&catalog, 8);

        attribute_energy(&mut containers, &node, &AttributionScheme::new(&catalog));

        assert_eq!(containers["a"].energy.package.delta(), 0);
    }

    #[test]
    fn test_shares_sum_to_node_energy() {
        let catalog = Catalog::full();
        let mut containers = HashMap::new();
        containers.insert("a".into(), container_with_cycles(&catalog, "a", 7));
        containers.insert("b".into(), container_with_cycles(&catalog, "b", 13));
        containers.insert("c".into(), container_with_cycles(&catalog, "c", 20));
        let node = node_with_package_energy(&catalog, 100);

        attribute_energy(&mut containers, &node, &AttributionScheme::new(&catalog));

        let total: u64 = containers
            .values()
            .map(|c| c.energy.package.delta())
            .sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_cpu_key_falls_back_through_cgroup_to_cpu_time() {
        let with_cgroup = Catalog {
            counters: Vec::new(),
            ..Catalog::full()
        };
        let scheme = AttributionScheme::new(&with_cgroup);
        assert_eq!(
            scheme.keys_for(Component::Package),
            vec![(catalog::CGROUPFS_CPU, 1.0)],
        );

        let catalog = Catalog {
            counters: Vec::new(),
            cgroup: Vec::new(),
            ..Catalog::full()
        };
        let scheme = AttributionScheme::new(&catalog);
        assert_eq!(scheme.keys_for(Component::Package), vec![(catalog::CPU_TIME, 1.0)]);

        let mut containers = HashMap::new();
        let mut a = ContainerMetrics::new(&catalog, "a", "a", "", "");
        a.cpu_time.add_delta(50);
        a.commit_usage();
        containers.insert("a".into(), a);
        let node = node_with_package_energy(&catalog, 8);

        attribute_energy(&mut containers, &node, &scheme);
        assert_eq!(containers["a"].energy.package.delta(), 8);
    }

    #[test]
    fn test_attribution_uses_post_wrap_denominator() {
        let catalog = Catalog::full();
        let mut containers = HashMap::new();

        // Cycles wrap 10 -> 5; the committed delta (and denominator) is 5.
        let mut a = ContainerMetrics::new(&catalog, "a", "a", "", "");
        let ch = a.counters.get_mut(catalog::CPU_CYCLES).expect("channel");
        ch.set_aggregate("a", 10);
        a.commit_usage();
        let ch = a.counters.get_mut(catalog::CPU_CYCLES).expect("channel");
        ch.set_aggregate("a", 5);
        a.commit_usage();
        assert_eq!(a.counters[catalog::CPU_CYCLES].delta(), 5);
        containers.insert("a".into(), a);

        let node = node_with_package_energy(&catalog, 8);
        attribute_energy(&mut containers, &node, &AttributionScheme::new(&catalog));
        assert_eq!(containers["a"].energy.package.delta(), 8);
    }

    #[test]
    fn test_total_tracks_components_and_residual() {
        let catalog = Catalog::full();
        let mut containers = HashMap::new();
        containers.insert("a".into(), container_with_cycles(&catalog, "a", 10));

        let mut node = NodeMetrics::new(&catalog);
        let mut socket = SocketEnergy::default();
        socket.package.add_delta(6);
        socket.dram.add_delta(2);
        node.sockets.insert(0, socket);
        node.platform.add_delta(10);
        node.commit_energy();

        let mut scheme = AttributionScheme::new(&catalog);
        // Single container gets every share regardless of key mix.
        scheme.dram_keys = vec![(catalog::CPU_CYCLES, 1.0)];
        attribute_energy(&mut containers, &node, &scheme);

        let a = &containers["a"];
        assert_eq!(a.energy.package.delta(), 6);
        assert_eq!(a.energy.dram.delta(), 2);
        assert_eq!(a.energy.other.delta(), 2);
        assert_eq!(a.energy.platform.delta(), 10);
        // total = package + dram + gpu + other == platform here.
        assert_eq!(a.energy.total.delta(), 10);
    }

    #[test]
    fn test_channel_consistency_over_multiple_ticks() {
        let catalog = Catalog::full();
        let mut containers = HashMap::new();
        containers.insert("a".into(), container_with_cycles(&catalog, "a", 10));
        let scheme = AttributionScheme::new(&catalog);

        let mut cumulative = 0u64;
        for mj in [8u64, 0, 12] {
            let node = node_with_package_energy(&catalog, mj);
            // Refresh the usage delta each tick.
            let a = containers.get_mut("a").expect("container");
            a.counters
                .get_mut(catalog::CPU_CYCLES)
                .expect("channel")
                .add_delta(10);
            a.commit_usage();

            attribute_energy(&mut containers, &node, &scheme);
            cumulative += mj;
            assert_eq!(containers["a"].energy.package.delta(), mj);
            assert_eq!(containers["a"].energy.package.aggregate(), cumulative);
        }
    }

    #[test]
    fn test_gpu_keys_empty_without_accelerators() {
        let catalog = Catalog {
            accelerator: Vec::new(),
            ..Catalog::full()
        };
        let scheme = AttributionScheme::new(&catalog);
        assert!(scheme.keys_for(Component::Gpu).is_empty());

        let mut containers = HashMap::new();
        containers.insert("a".into(), container_with_cycles(&catalog, "a", 10));
        let node = node_with_package_energy(&catalog, 8);
        attribute_energy(&mut containers, &node, &scheme);
        assert_eq!(containers["a"].energy.gpu.delta(), 0);
    }

    #[test]
    fn test_missing_channel_counts_as_zero_usage() {
        let catalog = Catalog::full();
        let keys = [("no_such_resource", 1.0)];
        let c = ContainerMetrics::new(&catalog, "a", "a", "", "");
        assert_eq!(weighted_usage(&c, &keys), 0.0);
    }
}

pub mod health;

pub use health::HealthMetrics;

use anyhow::{Context, Result};
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};

use crate::catalog;
use crate::collector::Snapshot;
use crate::metrics::{Component, ContainerMetrics};

const NAMESPACE: &str = "wattscope";

const MILLIJOULES_PER_JOULE: f64 = 1_000.0;
const NANOSECONDS_PER_SECOND: f64 = 1_000_000_000.0;

/// Render the published snapshot plus the agent health registry as
/// Prometheus text exposition.
///
/// The snapshot families are rebuilt on a per-scrape registry so every
/// sample reflects exactly one committed tick; the adapter never touches
/// collector-owned state.
pub fn render(snapshot: &Snapshot, health: &HealthMetrics, expose_hw_counters: bool) -> Result<String> {
    let registry = Registry::new();

    render_container_families(&registry, snapshot, expose_hw_counters)?;
    render_node_families(&registry, snapshot)?;

    let mut families = registry.gather();
    families.extend(health.registry().gather());
    families.sort_by(|a, b| a.get_name().cmp(b.get_name()));

    let mut buffer = Vec::with_capacity(16 * 1024);
    TextEncoder::new()
        .encode(&families, &mut buffer)
        .context("encoding metric families")?;

    String::from_utf8(buffer).context("metrics text is not utf-8")
}

fn container_labels(c: &ContainerMetrics) -> [&str; 3] {
    [&c.container_id, &c.pod_name, &c.namespace]
}

fn render_container_families(
    registry: &Registry,
    snapshot: &Snapshot,
    expose_hw_counters: bool,
) -> Result<()> {
    let base_labels = ["container_id", "pod_name", "namespace"];

    // One joules family per component; platform carries its provenance.
    for component in Component::ALL {
        let name = format!("container_{}_joules_total", component.as_str());
        let help = format!(
            "Aggregated {} energy attributed to the container, joules.",
            component.as_str(),
        );

        if component == Component::Platform {
            let vec = CounterVec::new(
                Opts::new(name, help).namespace(NAMESPACE),
                &["container_id", "pod_name", "namespace", "mode"],
            )?;
            registry.register(Box::new(vec.clone()))?;
            let mode = snapshot.node.platform_mode.as_str();
            for c in &snapshot.containers {
                let [id, pod, ns] = container_labels(c);
                vec.with_label_values(&[id, pod, ns, mode])
                    .inc_by(c.energy.platform.aggregate() as f64 / MILLIJOULES_PER_JOULE);
            }
        } else {
            let vec = CounterVec::new(Opts::new(name, help).namespace(NAMESPACE), &base_labels)?;
            registry.register(Box::new(vec.clone()))?;
            for c in &snapshot.containers {
                vec.with_label_values(&container_labels(c))
                    .inc_by(c.energy.channel(component).aggregate() as f64 / MILLIJOULES_PER_JOULE);
            }
        }
    }

    let total = CounterVec::new(
        Opts::new(
            "container_joules_total",
            "Total energy attributed to the container, joules.",
        )
        .namespace(NAMESPACE),
        &base_labels,
    )?;
    registry.register(Box::new(total.clone()))?;

    let cpu_time = CounterVec::new(
        Opts::new(
            "container_cpu_seconds_total",
            "CPU time observed by the tracing source, seconds.",
        )
        .namespace(NAMESPACE),
        &base_labels,
    )?;
    registry.register(Box::new(cpu_time.clone()))?;

    let hw_counters = CounterVec::new(
        Opts::new(
            "container_hw_counter_total",
            "Hardware counter totals by counter name.",
        )
        .namespace(NAMESPACE),
        &["counter", "container_id", "pod_name", "namespace"],
    )?;
    if expose_hw_counters {
        registry.register(Box::new(hw_counters.clone()))?;
    }

    let cgroupfs = CounterVec::new(
        Opts::new(
            "container_cgroupfs_total",
            "Cgroup resource totals by resource name.",
        )
        .namespace(NAMESPACE),
        &["resource", "container_id", "pod_name", "namespace"],
    )?;
    registry.register(Box::new(cgroupfs.clone()))?;

    let blkio = CounterVec::new(
        Opts::new(
            "container_blkio_bytes_total",
            "Block IO bytes by direction.",
        )
        .namespace(NAMESPACE),
        &["direction", "container_id", "pod_name", "namespace"],
    )?;
    registry.register(Box::new(blkio.clone()))?;

    let kubelet = CounterVec::new(
        Opts::new(
            "container_kubelet_total",
            "Kubelet-reported resource totals by resource name.",
        )
        .namespace(NAMESPACE),
        &["resource", "container_id", "pod_name", "namespace"],
    )?;
    registry.register(Box::new(kubelet.clone()))?;

    let accel = CounterVec::new(
        Opts::new(
            "container_accelerator_util_total",
            "Accelerator utilization totals by kind.",
        )
        .namespace(NAMESPACE),
        &["kind", "container_id", "pod_name", "namespace"],
    )?;
    registry.register(Box::new(accel.clone()))?;

    for c in &snapshot.containers {
        let [id, pod, ns] = container_labels(c);

        total
            .with_label_values(&[id, pod, ns])
            .inc_by(c.energy.total.aggregate() as f64 / MILLIJOULES_PER_JOULE);
        cpu_time
            .with_label_values(&[id, pod, ns])
            .inc_by(c.cpu_time.aggregate() as f64 / NANOSECONDS_PER_SECOND);

        if expose_hw_counters {
            for (name, ch) in &c.counters {
                hw_counters
                    .with_label_values(&[name, id, pod, ns])
                    .inc_by(ch.aggregate() as f64);
            }
        }

        for (name, ch) in &c.cgroup {
            cgroupfs
                .with_label_values(&[name, id, pod, ns])
                .inc_by(ch.aggregate() as f64);
        }

        blkio
            .with_label_values(&["read", id, pod, ns])
            .inc_by(c.bytes_read.aggregate() as f64);
        blkio
            .with_label_values(&["write", id, pod, ns])
            .inc_by(c.bytes_write.aggregate() as f64);

        for (name, ch) in &c.kubelet {
            kubelet
                .with_label_values(&[name, id, pod, ns])
                .inc_by(ch.aggregate() as f64);
        }

        for (name, ch) in &c.accelerator {
            let kind = match *name {
                catalog::ACCEL_SM_UTIL => "sm",
                catalog::ACCEL_MEM_UTIL => "memory",
                other => other,
            };
            accel
                .with_label_values(&[kind, id, pod, ns])
                .inc_by(ch.aggregate() as f64);
        }
    }

    Ok(())
}

fn render_node_families(registry: &Registry, snapshot: &Snapshot) -> Result<()> {
    let node = &snapshot.node;

    let sockets = CounterVec::new(
        Opts::new(
            "node_component_joules_total",
            "Node component energy by socket, joules.",
        )
        .namespace(NAMESPACE),
        &["component", "socket"],
    )?;
    registry.register(Box::new(sockets.clone()))?;

    for (socket, energy) in &node.sockets {
        let socket = socket.to_string();
        for (component, channel) in [
            (Component::Package, &energy.package),
            (Component::Core, &energy.core),
            (Component::Uncore, &energy.uncore),
            (Component::Dram, &energy.dram),
        ] {
            sockets
                .with_label_values(&[component.as_str(), &socket])
                .inc_by(channel.aggregate() as f64 / MILLIJOULES_PER_JOULE);
        }
    }

    let platform = CounterVec::new(
        Opts::new(
            "node_platform_joules_total",
            "Whole-node platform energy, joules.",
        )
        .namespace(NAMESPACE),
        &["mode"],
    )?;
    registry.register(Box::new(platform.clone()))?;
    platform
        .with_label_values(&[node.platform_mode.as_str()])
        .inc_by(node.platform.aggregate() as f64 / MILLIJOULES_PER_JOULE);

    let gpu = CounterVec::new(
        Opts::new(
            "node_gpu_joules_total",
            "Accelerator device energy, joules.",
        )
        .namespace(NAMESPACE),
        &["device"],
    )?;
    registry.register(Box::new(gpu.clone()))?;
    for (device, channel) in &node.gpu {
        gpu.with_label_values(&[&device.to_string()])
            .inc_by(channel.aggregate() as f64 / MILLIJOULES_PER_JOULE);
    }

    let resources = CounterVec::new(
        Opts::new(
            "node_resource_usage_total",
            "Node usage totals by catalog resource, summed over containers.",
        )
        .namespace(NAMESPACE),
        &["resource"],
    )?;
    registry.register(Box::new(resources.clone()))?;
    for (name, channel) in &node.resources {
        resources
            .with_label_values(&[name])
            .inc_by(channel.aggregate() as f64);
    }

    let freq = GaugeVec::new(
        Opts::new(
            "node_cpu_scaling_frequency_khz",
            "Current CPU frequency per core, kHz.",
        )
        .namespace(NAMESPACE),
        &["cpu"],
    )?;
    registry.register(Box::new(freq.clone()))?;
    for (cpu, khz) in &node.cpu_frequency_khz {
        freq.with_label_values(&[&cpu.to_string()]).set(*khz as f64);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::metrics::node::SocketEnergy;
    use crate::metrics::NodeMetrics;

    fn test_snapshot() -> Snapshot {
        let catalog = Catalog::full();
        let mut container = ContainerMetrics::new(&catalog, "abc123", "web", "web-0", "prod");
        container.energy.package.add_delta(4_000);
        container.energy.package.commit();
        container.cpu_time.add_delta(2_000_000_000);
        container
            .counters
            .get_mut(catalog::CPU_CYCLES)
            .expect("channel")
            .add_delta(10);
        container.commit_usage();

        let mut node = NodeMetrics::new(&catalog);
        let mut socket = SocketEnergy::default();
        socket.package.add_delta(8_000);
        socket.commit();
        node.sockets.insert(0, socket);
        node.cpu_frequency_khz.insert(0, 2_400_000);

        Snapshot {
            sequence: 3,
            taken_at: std::time::SystemTime::now(),
            containers: vec![container],
            node,
        }
    }

    #[test]
    fn test_render_contains_expected_series() {
        let health = HealthMetrics::new().expect("health");
        let text = render(&test_snapshot(), &health, true).expect("render");

        assert!(text.contains("wattscope_container_package_joules_total"));
        assert!(text.contains("container_id=\"abc123\""));
        assert!(text.contains("pod_name=\"web-0\""));
        assert!(text.contains("namespace=\"prod\""));
        assert!(text.contains("wattscope_node_component_joules_total"));
        assert!(text.contains("socket=\"0\""));
        assert!(text.contains("wattscope_node_cpu_scaling_frequency_khz"));
        assert!(text.contains("wattscope_container_cpu_seconds_total"));
        // 4000 mJ -> 4 J.
        assert!(text.contains("4"));
        // Health families ride along.
        assert!(text.contains("wattscope_ticks_total"));
    }

    #[test]
    fn test_hw_counters_hidden_when_disabled() {
        let health = HealthMetrics::new().expect("health");
        let with = render(&test_snapshot(), &health, true).expect("render");
        let without = render(&test_snapshot(), &health, false).expect("render");

        assert!(with.contains("wattscope_container_hw_counter_total"));
        assert!(!without.contains("wattscope_container_hw_counter_total"));
    }

    #[test]
    fn test_platform_family_carries_mode_label() {
        let health = HealthMetrics::new().expect("health");
        let text = render(&test_snapshot(), &health, false).expect("render");
        assert!(text.contains("wattscope_node_platform_joules_total{mode=\"absent\"}"));
    }
}

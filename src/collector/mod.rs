pub mod attribute;
pub mod snapshot;

pub use attribute::AttributionScheme;
pub use snapshot::{Snapshot, SnapshotHandle};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accel::AcceleratorSampler;
use crate::catalog::{self, Catalog, SYSTEM_PROCESS_ID};
use crate::cgroup::CgroupSource;
use crate::config::Config;
use crate::error::{SourceError, SourceGate};
use crate::export::HealthMetrics;
use crate::kubelet::KubeletClient;
use crate::metrics::node::PlatformMode;
use crate::metrics::{ContainerMetrics, NodeMetrics};
use crate::power::platform::PlatformReading;
use crate::power::freq::CpuFreqProbe;
use crate::power::{ComponentBackend, PlatformSource};
use crate::resolve::IdentityResolver;
use crate::tracer::{ReadMode, TraceReader};

/// A container record is evicted once its cgroup is gone and it has been
/// silent for this many ticks.
const EVICTION_GRACE_TICKS: u64 = 3;

/// Everything the collector samples from. Absent sources are simply skipped;
/// the tick always publishes.
pub struct Sources {
    pub tracer: Option<Box<dyn TraceReader>>,
    pub cgroup: Option<CgroupSource>,
    pub accelerator: Option<Box<dyn AcceleratorSampler>>,
    pub components: ComponentBackend,
    pub platform: PlatformSource,
    pub freq: CpuFreqProbe,
    pub kubelet: Option<KubeletClient>,
}

struct Gates {
    tracing: SourceGate,
    accelerator: SourceGate,
    components: SourceGate,
    platform: SourceGate,
    kubelet: SourceGate,
}

impl Gates {
    fn new(max_failures: u32) -> Self {
        Self {
            tracing: SourceGate::new("tracing", max_failures),
            accelerator: SourceGate::new("accelerator", max_failures),
            components: SourceGate::new("components", max_failures),
            platform: SourceGate::new("platform", max_failures),
            kubelet: SourceGate::new("kubelet", max_failures),
        }
    }
}

/// The periodic collection pipeline. Exclusively owns the container and node
/// records; one tick runs sample, commit, attribute, roll-up, and publish in
/// that order, and always reaches publish.
pub struct Collector {
    catalog: Catalog,
    sample_period: Duration,
    containers: HashMap<String, ContainerMetrics>,
    node: NodeMetrics,
    resolver: IdentityResolver,
    sources: Sources,
    gates: Gates,
    scheme: AttributionScheme,
    snapshot: Arc<SnapshotHandle>,
    health: Arc<HealthMetrics>,
    sequence: u64,
    tick_index: u64,
    last_seen: HashMap<String, u64>,
    last_tick_at: Option<Instant>,
}

impl Collector {
    pub fn new(
        cfg: &Config,
        catalog: Catalog,
        resolver: IdentityResolver,
        sources: Sources,
        snapshot: Arc<SnapshotHandle>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        let mut node = NodeMetrics::new(&catalog);
        node.platform_mode = match &sources.platform {
            PlatformSource::Meter(_) => PlatformMode::Measured,
            PlatformSource::Model(_) => PlatformMode::Estimated,
            PlatformSource::None => PlatformMode::Absent,
        };

        let scheme = AttributionScheme::new(&catalog);

        Self {
            sample_period: cfg.sample_period,
            containers: HashMap::new(),
            node,
            resolver,
            gates: Gates::new(cfg.max_transient_failures),
            sources,
            scheme,
            snapshot,
            health,
            sequence: 0,
            tick_index: 0,
            last_seen: HashMap::new(),
            last_tick_at: None,
            catalog,
        }
    }

    /// Run the collection loop until cancelled. Probes block on pseudo-files
    /// and library calls; cancellation is honored between ticks only, so a
    /// tick's deltas are never half-committed.
    pub fn run(mut self, cancel: CancellationToken) {
        info!(
            period = ?self.sample_period,
            components = self.sources.components.name(),
            "collector started",
        );

        loop {
            let started = Instant::now();
            self.run_tick();

            loop {
                if cancel.is_cancelled() {
                    self.shutdown();
                    return;
                }
                match self.sample_period.checked_sub(started.elapsed()) {
                    Some(remaining) if !remaining.is_zero() => {
                        std::thread::sleep(remaining.min(Duration::from_millis(100)));
                    }
                    _ => break,
                }
            }
        }
    }

    fn shutdown(&mut self) {
        self.sources.components.stop();
        info!(ticks = self.tick_index, "collector stopped");
    }

    /// One full pipeline iteration.
    pub fn run_tick(&mut self) {
        let started = Instant::now();
        let window = self
            .last_tick_at
            .map(|t| t.elapsed())
            .unwrap_or(self.sample_period);
        self.last_tick_at = Some(started);

        self.tick_index += 1;
        self.resolver.begin_tick();

        // -- Sample phase: workload sources first, then node sources. --
        self.sample_tracing();
        self.sample_cgroup();
        self.sample_accelerator(window);
        self.sample_kubelet();
        self.sample_components();
        self.sample_platform(window);
        self.node.cpu_frequency_khz = self.sources.freq.read();

        self.evict_gone_containers();

        // -- Commit phase: every touched channel exactly once. --
        for container in self.containers.values_mut() {
            container.commit_usage();
        }
        self.node.commit_energy();

        // -- Attribute phase. --
        attribute::attribute_energy(&mut self.containers, &self.node, &self.scheme);

        // -- Node roll-up phase. --
        self.node.roll_up_resources(self.containers.values());

        // -- Publish phase. --
        self.sequence += 1;
        self.snapshot.publish(Snapshot {
            sequence: self.sequence,
            taken_at: SystemTime::now(),
            containers: self.containers.values().cloned().collect(),
            node: self.node.clone(),
        });

        self.health.ticks_total.inc();
        self.health.snapshot_sequence.set(self.sequence as f64);
        self.health
            .containers_tracked
            .set(self.containers.len() as f64);
        self.health
            .tick_duration
            .observe(started.elapsed().as_secs_f64());

        debug!(
            sequence = self.sequence,
            containers = self.containers.len(),
            "tick published",
        );
    }

    fn fail(gate: &mut SourceGate, health: &HealthMetrics, source: &'static str, err: &SourceError) {
        health.source_errors.with_label_values(&[source]).inc();
        gate.record_failure(err);
    }

    fn sample_tracing(&mut self) {
        let Some(tracer) = self.sources.tracer.as_mut() else {
            return;
        };
        if !self.gates.tracing.is_open() {
            return;
        }

        let mode = tracer.read_mode();
        let samples = match tracer.read() {
            Ok(samples) => {
                self.gates.tracing.record_success();
                samples
            }
            Err(e) => {
                Self::fail(&mut self.gates.tracing, &self.health, "tracing", &e);
                return;
            }
        };

        for sample in samples {
            let container_id = self.resolver.resolve(sample.pid, sample.cgroup_id);
            let record = ensure_record(
                &mut self.containers,
                &mut self.last_seen,
                &self.catalog,
                self.tick_index,
                &container_id,
            );

            let values = [
                (catalog::CPU_CYCLES, sample.cpu_cycles),
                (catalog::CPU_INSTRUCTIONS, sample.cpu_instructions),
                (catalog::CACHE_MISS, sample.cache_misses),
            ];

            match mode {
                ReadMode::Destructive => {
                    record.cpu_time.add_delta(sample.cpu_time_ns);
                    for (name, v) in values {
                        if let Some(ch) = record.counters.get_mut(name) {
                            ch.add_delta(v);
                        }
                    }
                }
                ReadMode::Cumulative => {
                    let producer = sample.pid.to_string();
                    record.cpu_time.set_aggregate(&producer, sample.cpu_time_ns);
                    for (name, v) in values {
                        if let Some(ch) = record.counters.get_mut(name) {
                            ch.set_aggregate(&producer, v);
                        }
                    }
                }
            }
        }
    }

    fn sample_cgroup(&mut self) {
        let Some(cgroup) = self.sources.cgroup.as_mut() else {
            return;
        };

        for (id, record) in self.containers.iter_mut() {
            if id == SYSTEM_PROCESS_ID {
                continue;
            }
            let Some(stats) = cgroup.read(id) else {
                continue;
            };

            let updates = [
                (catalog::CGROUPFS_MEMORY, stats.memory_bytes),
                (catalog::CGROUPFS_KERNEL_MEMORY, stats.kernel_memory_bytes),
                (catalog::CGROUPFS_TCP_MEMORY, stats.tcp_memory_bytes),
                (catalog::CGROUPFS_CPU, stats.cpu_total_ns),
                (catalog::CGROUPFS_USER_CPU, stats.cpu_user_ns),
                (catalog::CGROUPFS_SYSTEM_CPU, stats.cpu_system_ns),
            ];
            let mut touched = false;
            for (name, value) in updates {
                if let (Some(ch), Some(v)) = (record.cgroup.get_mut(name), value) {
                    ch.set_aggregate(id, v);
                    touched = true;
                }
            }
            if let Some(v) = stats.io_read_bytes {
                record.bytes_read.set_aggregate(id, v);
                touched = true;
            }
            if let Some(v) = stats.io_write_bytes {
                record.bytes_write.set_aggregate(id, v);
                touched = true;
            }

            if touched {
                self.last_seen.insert(id.clone(), self.tick_index);
            }
        }
    }

    fn sample_accelerator(&mut self, window: Duration) {
        let Some(accel) = self.sources.accelerator.as_mut() else {
            return;
        };
        if !self.gates.accelerator.is_open() {
            return;
        }

        let devices = accel.devices();
        if devices.is_empty() {
            return;
        }

        let mut failed = 0usize;
        for device in &devices {
            // A failing device skips this tick; the others proceed.
            match accel.process_utilization(*device, window) {
                Ok(by_pid) => {
                    for (pid, util) in by_pid {
                        let container_id = self.resolver.resolve(pid, None);
                        let record = ensure_record(
                            &mut self.containers,
                            &mut self.last_seen,
                            &self.catalog,
                            self.tick_index,
                            &container_id,
                        );
                        if let Some(ch) = record.accelerator.get_mut(catalog::ACCEL_SM_UTIL) {
                            ch.add_delta(util.sm_util);
                        }
                        if let Some(ch) = record.accelerator.get_mut(catalog::ACCEL_MEM_UTIL) {
                            ch.add_delta(util.mem_util);
                        }
                    }
                }
                Err(e) => {
                    warn!(device, error = %e, "accelerator device skipped this tick");
                    self.health
                        .source_errors
                        .with_label_values(&["accelerator"])
                        .inc();
                    failed += 1;
                }
            }

            match accel.device_energy_delta_mj(*device) {
                Ok(mj) => {
                    self.node.gpu.entry(*device).or_default().add_delta(mj);
                }
                Err(e) => {
                    warn!(device, error = %e, "accelerator energy read failed");
                }
            }
        }

        if failed == devices.len() {
            let err = SourceError::transient("accelerator", "all devices failed");
            self.gates.accelerator.record_failure(&err);
        } else {
            self.gates.accelerator.record_success();
        }
    }

    fn sample_kubelet(&mut self) {
        let Some(kubelet) = self.sources.kubelet.as_ref() else {
            return;
        };
        if !self.gates.kubelet.is_open() {
            return;
        }

        let infos = match kubelet.pods() {
            Ok(infos) => infos,
            Err(e) => {
                Self::fail(&mut self.gates.kubelet, &self.health, "kubelet", &e);
                return;
            }
        };

        // Pod listing doubles as the identity metadata source.
        let mut by_pod_container: HashMap<(String, String), String> =
            HashMap::with_capacity(infos.len());
        for info in infos {
            let record = ensure_record(
                &mut self.containers,
                &mut self.last_seen,
                &self.catalog,
                self.tick_index,
                &info.container_id,
            );
            record.container_name = info.container_name.clone();
            record.pod_name = info.pod_name.clone();
            record.namespace = info.namespace.clone();

            by_pod_container
                .insert((info.pod_name, info.container_name), info.container_id);
        }

        let usages = match kubelet.stats_summary() {
            Ok(usages) => {
                self.gates.kubelet.record_success();
                usages
            }
            Err(e) => {
                Self::fail(&mut self.gates.kubelet, &self.health, "kubelet", &e);
                return;
            }
        };

        for usage in usages {
            let key = (usage.pod_name.clone(), usage.container_name.clone());
            let Some(container_id) = by_pod_container.get(&key) else {
                continue;
            };
            let Some(record) = self.containers.get_mut(container_id) else {
                continue;
            };

            if let (Some(ch), Some(v)) = (
                record.kubelet.get_mut(catalog::KUBELET_CONTAINER_CPU),
                usage.cpu_ns,
            ) {
                ch.set_aggregate(container_id, v);
            }
            if let (Some(ch), Some(v)) = (
                record.kubelet.get_mut(catalog::KUBELET_CONTAINER_MEMORY),
                usage.memory_bytes,
            ) {
                ch.set_aggregate(container_id, v);
            }
        }
    }

    fn sample_components(&mut self) {
        if !self.gates.components.is_open() || !self.sources.components.is_supported() {
            return;
        }

        match self.sources.components.components_by_socket() {
            Ok(by_socket) => {
                self.gates.components.record_success();
                for (socket, energy) in by_socket {
                    let entry = self.node.sockets.entry(socket).or_default();
                    entry.package.set_aggregate("rapl", energy.package_mj);
                    entry.core.set_aggregate("rapl", energy.core_mj);
                    entry.uncore.set_aggregate("rapl", energy.uncore_mj);
                    entry.dram.set_aggregate("rapl", energy.dram_mj);
                }
            }
            Err(e) => {
                Self::fail(&mut self.gates.components, &self.health, "components", &e);
            }
        }
    }

    fn sample_platform(&mut self, window: Duration) {
        if !self.gates.platform.is_open() {
            return;
        }

        // Model inference runs over the previous tick's committed node usage.
        let usage_deltas: HashMap<&'static str, u64> = self
            .node
            .resources
            .iter()
            .map(|(name, ch)| (*name, ch.delta()))
            .collect();

        match self.sources.platform.read(window, &usage_deltas) {
            Ok(Some(PlatformReading::Aggregate(mj))) => {
                self.gates.platform.record_success();
                self.node.platform.set_aggregate("platform", mj);
            }
            Ok(Some(PlatformReading::Delta(mj))) => {
                self.gates.platform.record_success();
                self.node.platform.add_delta(mj);
            }
            Ok(None) => {}
            Err(e) => {
                Self::fail(&mut self.gates.platform, &self.health, "platform", &e);
            }
        }
    }

    /// Remove records whose cgroup directory is gone and that no source has
    /// touched for a few ticks. The system bucket is never evicted. Without
    /// a cgroup source there is no liveness authority, so records persist.
    fn evict_gone_containers(&mut self) {
        let Some(cgroup) = self.sources.cgroup.as_mut() else {
            return;
        };

        let candidates: Vec<String> = self
            .containers
            .keys()
            .filter(|id| id.as_str() != SYSTEM_PROCESS_ID)
            .cloned()
            .collect();

        for id in candidates {
            let silent_since = self.last_seen.get(&id).copied().unwrap_or(0);
            if self.tick_index.saturating_sub(silent_since) < EVICTION_GRACE_TICKS {
                continue;
            }
            if cgroup.container_exists(&id) {
                continue;
            }

            debug!(container_id = %id, "evicting gone container");
            self.containers.remove(&id);
            self.last_seen.remove(&id);
            self.resolver.forget_container(&id);
            cgroup.forget(&id);
            for ch in self.node.resources.values_mut() {
                ch.remove_producer(&id);
            }
        }
    }
}

/// Fetch or lazily create a container record.
fn ensure_record<'a>(
    containers: &'a mut HashMap<String, ContainerMetrics>,
    last_seen: &mut HashMap<String, u64>,
    catalog: &Catalog,
    tick_index: u64,
    container_id: &str,
) -> &'a mut ContainerMetrics {
    last_seen.insert(container_id.to_string(), tick_index);

    containers
        .entry(container_id.to_string())
        .or_insert_with(|| {
            // Names default to the id until the kubelet listing fills them in.
            let name = if container_id == SYSTEM_PROCESS_ID {
                SYSTEM_PROCESS_ID
            } else {
                container_id
            };
            ContainerMetrics::new(catalog, container_id, name, "", "")
        })
}

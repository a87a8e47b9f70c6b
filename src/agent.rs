use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::accel::AcceleratorSampler;
use crate::catalog::Catalog;
use crate::cgroup::{CgroupLayout, CgroupSource};
use crate::collector::{Collector, SnapshotHandle, Sources};
use crate::config::Config;
use crate::export::HealthMetrics;
use crate::kubelet::KubeletClient;
use crate::power::freq::CpuFreqProbe;
use crate::power::{ComponentBackend, PlatformSource};
use crate::resolve::IdentityResolver;
use crate::server::{self, ServerState};
use crate::tracer::TraceReader;

/// Wires configuration to sources, the collector, and the scrape server.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    snapshot: Arc<SnapshotHandle>,
    collector: Option<Collector>,
    cancel: CancellationToken,
    collector_task: Option<tokio::task::JoinHandle<()>>,
    server_task: Option<tokio::task::JoinHandle<()>>,
}

impl Agent {
    /// Probe every source and build the pipeline. Blocking (filesystem and
    /// network probes); call before entering the async runtime.
    pub fn new(cfg: Config) -> Result<Self> {
        let health = Arc::new(HealthMetrics::new().context("creating health metrics")?);

        let tracer = build_tracer();

        let layout = if cfg.cgroup_root.is_empty() {
            CgroupLayout::discover_default()
        } else {
            CgroupLayout::discover(Path::new(&cfg.cgroup_root))
        };
        let cgroup = if layout.is_present() {
            Some(CgroupSource::new(layout))
        } else {
            warn!("no cgroup tree found, cgroup channels disabled");
            None
        };

        let accelerator = build_accelerator(&cfg);
        let components = ComponentBackend::select(cfg.enable_msr);
        let platform = PlatformSource::select(&cfg.model_server_endpoint);

        let kubelet = if cfg.kubelet_endpoint.is_empty() {
            None
        } else {
            match KubeletClient::new(&cfg.kubelet_endpoint) {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!(error = %e, "kubelet client unavailable, kubelet channels disabled");
                    None
                }
            }
        };

        // The catalog reflects what actually probed successfully; channels
        // outside it are neither created nor exported.
        let full = Catalog::full();
        let catalog = Catalog {
            counters: tracer
                .as_ref()
                .map(|t| t.available_counters())
                .unwrap_or_default(),
            cgroup: if cgroup.is_some() { full.cgroup } else { Vec::new() },
            kubelet: if kubelet.is_some() {
                full.kubelet
            } else {
                Vec::new()
            },
            accelerator: if accelerator.is_some() {
                full.accelerator
            } else {
                Vec::new()
            },
        };
        info!(
            counters = catalog.counters.len(),
            cgroup = catalog.cgroup.len(),
            kubelet = catalog.kubelet.len(),
            accelerator = catalog.accelerator.len(),
            "feature catalogs probed",
        );

        let resolver = IdentityResolver::new(cfg.enable_cgroup_id);
        let snapshot = Arc::new(SnapshotHandle::new(&catalog));

        let collector = Collector::new(
            &cfg,
            catalog,
            resolver,
            Sources {
                tracer,
                cgroup,
                accelerator,
                components,
                platform,
                freq: CpuFreqProbe::new(),
                kubelet,
            },
            Arc::clone(&snapshot),
            Arc::clone(&health),
        );

        Ok(Self {
            cfg,
            health,
            snapshot,
            collector: Some(collector),
            cancel: CancellationToken::new(),
            collector_task: None,
            server_task: None,
        })
    }

    /// Start the scrape server and the collector loop.
    pub async fn start(&mut self) -> Result<()> {
        let bind: SocketAddr = self
            .cfg
            .bind_address
            .parse()
            .with_context(|| format!("invalid bind address {}", self.cfg.bind_address))?;

        let state = Arc::new(ServerState {
            snapshot: Arc::clone(&self.snapshot),
            health: Arc::clone(&self.health),
            metrics_path: self.cfg.metrics_path.clone(),
            expose_hw_counters: self.cfg.expose_hardware_counter_metrics,
        });

        let server_cancel = self.cancel.child_token();
        self.server_task = Some(tokio::spawn(async move {
            if let Err(e) = server::serve(state, bind, server_cancel).await {
                tracing::error!(error = %e, "metrics server failed");
            }
        }));

        let collector = self
            .collector
            .take()
            .context("agent started more than once")?;
        let collector_cancel = self.cancel.child_token();
        // The collector blocks on pseudo-files and library calls, so it runs
        // on the blocking pool and checks cancellation between ticks.
        self.collector_task = Some(tokio::task::spawn_blocking(move || {
            collector.run(collector_cancel);
        }));

        info!("agent fully started");
        Ok(())
    }

    /// Signal shutdown, let the collector finish its tick, and join tasks.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(task) = self.collector_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "collector task join failed");
            }
        }
        if let Some(task) = self.server_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "server task join failed");
            }
        }

        Ok(())
    }
}

#[cfg(feature = "bpf")]
fn build_tracer() -> Option<Box<dyn TraceReader>> {
    match crate::tracer::bpf::PinnedMapReader::open_default() {
        Ok(reader) => Some(Box::new(reader)),
        Err(e) => {
            warn!(error = %e, "tracing map unavailable, counter channels disabled");
            None
        }
    }
}

#[cfg(not(feature = "bpf"))]
fn build_tracer() -> Option<Box<dyn TraceReader>> {
    info!("built without the bpf feature, tracing source disabled");
    None
}

#[cfg(feature = "gpu")]
fn build_accelerator(cfg: &Config) -> Option<Box<dyn AcceleratorSampler>> {
    if !cfg.enable_gpu {
        return None;
    }

    match crate::accel::nvml::NvmlSampler::init() {
        Ok(sampler) => Some(Box::new(sampler)),
        Err(e) => {
            warn!(error = %e, "accelerator library unavailable, gpu channels disabled");
            None
        }
    }
}

#[cfg(not(feature = "gpu"))]
fn build_accelerator(cfg: &Config) -> Option<Box<dyn AcceleratorSampler>> {
    if cfg.enable_gpu {
        warn!("enable_gpu set but built without the gpu feature");
    }
    None
}

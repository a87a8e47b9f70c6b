use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::SourceError;

const SOURCE: &str = "kubelet";

/// Identity of one running container as the kubelet reports it.
#[derive(Debug, Clone)]
pub struct PodContainerInfo {
    pub container_id: String,
    pub container_name: String,
    pub pod_name: String,
    pub namespace: String,
}

/// Cumulative usage of one container from the stats summary.
#[derive(Debug, Clone)]
pub struct ContainerUsage {
    pub pod_name: String,
    pub container_name: String,
    pub cpu_ns: Option<u64>,
    pub memory_bytes: Option<u64>,
}

/// Client for the kubelet read-only API: `/pods` for identity,
/// `/stats/summary` for usage.
pub struct KubeletClient {
    base: String,
    http: reqwest::blocking::Client,
}

impl KubeletClient {
    pub fn new(endpoint: &str) -> Result<Self, SourceError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| SourceError::unavailable(SOURCE, format!("building client: {e}")))?;

        Ok(Self {
            base: endpoint.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Running containers with their pod identity, keyed by container id.
    pub fn pods(&self) -> Result<Vec<PodContainerInfo>, SourceError> {
        let url = format!("{}/pods", self.base);
        let list: PodList = self.get_json(&url)?;

        let mut infos = Vec::new();
        for pod in list.items {
            for status in pod.status.container_statuses {
                let Some(container_id) = strip_runtime_prefix(&status.container_id) else {
                    continue;
                };
                infos.push(PodContainerInfo {
                    container_id,
                    container_name: status.name,
                    pod_name: pod.metadata.name.clone(),
                    namespace: pod.metadata.namespace.clone(),
                });
            }
        }

        debug!(containers = infos.len(), "kubelet pod listing read");
        Ok(infos)
    }

    /// Per-container usage from the stats summary.
    pub fn stats_summary(&self) -> Result<Vec<ContainerUsage>, SourceError> {
        let url = format!("{}/stats/summary", self.base);
        let summary: StatsSummary = self.get_json(&url)?;

        let mut usage = Vec::new();
        for pod in summary.pods {
            for container in pod.containers {
                usage.push(ContainerUsage {
                    pod_name: pod.pod_ref.name.clone(),
                    container_name: container.name,
                    cpu_ns: container.cpu.and_then(|c| c.usage_core_nano_seconds),
                    memory_bytes: container.memory.and_then(|m| m.working_set_bytes),
                });
            }
        }

        Ok(usage)
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, SourceError> {
        self.http
            .get(url)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .and_then(|r| r.json())
            .map_err(|e| SourceError::transient(SOURCE, format!("GET {url}: {e}")))
    }
}

/// Container ids arrive as "<runtime>://<id>".
fn strip_runtime_prefix(container_id: &str) -> Option<String> {
    let id = container_id.split_once("://").map_or(container_id, |(_, id)| id);
    (!id.is_empty()).then(|| id.to_string())
}

// --- Wire types (only the fields we consume) ---

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct PodMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default, rename = "containerStatuses")]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Deserialize)]
struct ContainerStatus {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "containerID")]
    container_id: String,
}

#[derive(Debug, Deserialize)]
struct StatsSummary {
    #[serde(default)]
    pods: Vec<PodStats>,
}

#[derive(Debug, Deserialize)]
struct PodStats {
    #[serde(rename = "podRef")]
    pod_ref: PodRef,
    #[serde(default)]
    containers: Vec<ContainerStats>,
}

#[derive(Debug, Deserialize)]
struct PodRef {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ContainerStats {
    #[serde(default)]
    name: String,
    cpu: Option<CpuStats>,
    memory: Option<MemoryStats>,
}

#[derive(Debug, Deserialize)]
struct CpuStats {
    #[serde(rename = "usageCoreNanoSeconds")]
    usage_core_nano_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MemoryStats {
    #[serde(rename = "workingSetBytes")]
    working_set_bytes: Option<u64>,
}

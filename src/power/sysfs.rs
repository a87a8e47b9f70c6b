use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::SourceError;

use super::ComponentsEnergy;

const SOURCE: &str = "rapl-sysfs";

/// Default root of the power-capping framework's RAPL control type.
pub const DEFAULT_POWERCAP_ROOT: &str = "/sys/devices/virtual/powercap/intel-rapl";

const ZONE_PREFIX: &str = "intel-rapl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Domain {
    Package,
    Core,
    Uncore,
    Dram,
}

#[derive(Debug, Clone)]
struct Zone {
    socket: u32,
    domain: Domain,
    energy_path: PathBuf,
}

/// Reads per-socket component energy from the powercap sysfs tree.
///
/// Counters are cumulative microjoules; values are reported in millijoules
/// and wrap at `max_energy_range_uj` (handled by the channel layer).
pub struct PowercapReader {
    zones: Vec<Zone>,
}

impl PowercapReader {
    pub fn probe_default() -> Result<Self, SourceError> {
        Self::probe(Path::new(DEFAULT_POWERCAP_ROOT))
    }

    /// Walk the powercap tree: top-level `intel-rapl:N` zones are packages,
    /// their `intel-rapl:N:M` children are core/uncore/dram domains.
    pub fn probe(root: &Path) -> Result<Self, SourceError> {
        let entries = fs::read_dir(root).map_err(|e| {
            SourceError::unavailable(SOURCE, format!("reading {}: {e}", root.display()))
        })?;

        let mut zones = Vec::new();

        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !path.is_dir() || !name.starts_with(ZONE_PREFIX) {
                continue;
            }

            let Some(socket) = read_zone_name(&path)
                .and_then(|n| n.strip_prefix("package-").and_then(|s| s.parse().ok()))
            else {
                continue;
            };

            zones.push(Zone {
                socket,
                domain: Domain::Package,
                energy_path: path.join("energy_uj"),
            });

            for sub in fs::read_dir(&path).into_iter().flatten().flatten() {
                let sub_path = sub.path();
                let sub_name = sub.file_name();
                if !sub_path.is_dir() || !sub_name.to_string_lossy().starts_with(ZONE_PREFIX) {
                    continue;
                }

                let domain = match read_zone_name(&sub_path).as_deref() {
                    Some("core") => Domain::Core,
                    Some("uncore") => Domain::Uncore,
                    Some("dram") => Domain::Dram,
                    _ => continue,
                };

                zones.push(Zone {
                    socket,
                    domain,
                    energy_path: sub_path.join("energy_uj"),
                });
            }
        }

        if zones.is_empty() {
            return Err(SourceError::unavailable(
                SOURCE,
                format!("no package zones under {}", root.display()),
            ));
        }

        debug!(zones = zones.len(), "powercap zones discovered");
        Ok(Self { zones })
    }

    /// Cumulative millijoules per socket for every discovered domain.
    pub fn read(&self) -> Result<HashMap<u32, ComponentsEnergy>, SourceError> {
        let mut by_socket: HashMap<u32, ComponentsEnergy> = HashMap::new();

        for zone in &self.zones {
            let raw = fs::read_to_string(&zone.energy_path).map_err(|e| {
                SourceError::transient(
                    SOURCE,
                    format!("reading {}: {e}", zone.energy_path.display()),
                )
            })?;
            let uj: u64 = raw.trim().parse().map_err(|e| {
                SourceError::transient(
                    SOURCE,
                    format!("parsing {}: {e}", zone.energy_path.display()),
                )
            })?;
            let mj = uj / 1_000;

            let entry = by_socket.entry(zone.socket).or_default();
            match zone.domain {
                Domain::Package => entry.package_mj = mj,
                Domain::Core => entry.core_mj = mj,
                Domain::Uncore => entry.uncore_mj = mj,
                Domain::Dram => entry.dram_mj = mj,
            }
        }

        Ok(by_socket)
    }
}

fn read_zone_name(zone_dir: &Path) -> Option<String> {
    fs::read_to_string(zone_dir.join("name"))
        .ok()
        .map(|s| s.trim().to_string())
}

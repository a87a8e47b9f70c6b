use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::SourceError;

use super::ComponentsEnergy;

const SOURCE: &str = "rapl-msr";

// RAPL model-specific registers.
const MSR_RAPL_POWER_UNIT: u64 = 0x606;
const MSR_PKG_ENERGY_STATUS: u64 = 0x611;
const MSR_DRAM_ENERGY_STATUS: u64 = 0x619;
const MSR_PP0_ENERGY_STATUS: u64 = 0x639;
const MSR_PP1_ENERGY_STATUS: u64 = 0x641;

/// Sibling energy source reading the RAPL model-specific registers directly.
///
/// Used only when explicitly enabled and the sysfs counters are absent
/// (the registers are unreliable under some hypervisors). Register values
/// are 32-bit counters in hardware energy units; reported in cumulative
/// millijoules, wraps handled by the channel layer.
pub struct MsrReader {
    /// One representative CPU's msr device per package.
    packages: Vec<(u32, PathBuf)>,
    /// Joules per raw energy unit, from MSR_RAPL_POWER_UNIT.
    joules_per_unit: f64,
}

impl MsrReader {
    pub fn probe_default() -> Result<Self, SourceError> {
        Self::probe(Path::new("/dev/cpu"), Path::new("/sys/devices/system/cpu"))
    }

    pub fn probe(dev_cpu: &Path, sys_cpu: &Path) -> Result<Self, SourceError> {
        let packages = discover_packages(dev_cpu, sys_cpu)?;

        let (_, first) = packages
            .first()
            .ok_or_else(|| SourceError::unavailable(SOURCE, "no msr devices"))?;

        let unit_raw = read_msr(first, MSR_RAPL_POWER_UNIT)?;
        let energy_unit_shift = (unit_raw >> 8) & 0x1f;
        let joules_per_unit = 1.0 / f64::from(1u32 << energy_unit_shift);

        debug!(
            packages = packages.len(),
            joules_per_unit, "msr energy source ready",
        );

        Ok(Self {
            packages,
            joules_per_unit,
        })
    }

    pub fn read(&self) -> Result<HashMap<u32, ComponentsEnergy>, SourceError> {
        let mut by_socket = HashMap::with_capacity(self.packages.len());

        for (socket, path) in &self.packages {
            let package_mj = self.read_energy_mj(path, MSR_PKG_ENERGY_STATUS)?;
            // Sub-domains may be unimplemented on a given model; absent
            // registers read as zero rather than failing the socket.
            let core_mj = self.read_energy_mj(path, MSR_PP0_ENERGY_STATUS).unwrap_or(0);
            let uncore_mj = self.read_energy_mj(path, MSR_PP1_ENERGY_STATUS).unwrap_or(0);
            let dram_mj = self.read_energy_mj(path, MSR_DRAM_ENERGY_STATUS).unwrap_or(0);

            by_socket.insert(
                *socket,
                ComponentsEnergy {
                    package_mj,
                    core_mj,
                    uncore_mj,
                    dram_mj,
                },
            );
        }

        Ok(by_socket)
    }

    fn read_energy_mj(&self, path: &Path, register: u64) -> Result<u64, SourceError> {
        let raw = read_msr(path, register)?;
        let units = raw & 0xffff_ffff;
        Ok((units as f64 * self.joules_per_unit * 1_000.0) as u64)
    }
}

/// Pick one CPU's msr device per physical package.
fn discover_packages(dev_cpu: &Path, sys_cpu: &Path) -> Result<Vec<(u32, PathBuf)>, SourceError> {
    let entries = fs::read_dir(sys_cpu).map_err(|e| {
        SourceError::unavailable(SOURCE, format!("reading {}: {e}", sys_cpu.display()))
    })?;

    let mut by_package: HashMap<u32, PathBuf> = HashMap::new();

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(cpu) = name
            .strip_prefix("cpu")
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };

        let topo = entry.path().join("topology/physical_package_id");
        let Some(package) = fs::read_to_string(topo)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
        else {
            continue;
        };

        let msr = dev_cpu.join(cpu.to_string()).join("msr");
        if msr.exists() {
            by_package.entry(package).or_insert(msr);
        }
    }

    if by_package.is_empty() {
        return Err(SourceError::unavailable(SOURCE, "no readable msr devices"));
    }

    let mut packages: Vec<(u32, PathBuf)> = by_package.into_iter().collect();
    packages.sort_by_key(|(socket, _)| *socket);
    Ok(packages)
}

fn read_msr(path: &Path, register: u64) -> Result<u64, SourceError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;

        let file = File::open(path).map_err(|e| {
            SourceError::transient(SOURCE, format!("opening {}: {e}", path.display()))
        })?;

        let mut buf = [0u8; 8];
        file.read_exact_at(&mut buf, register).map_err(|e| {
            SourceError::transient(
                SOURCE,
                format!("reading msr {register:#x} from {}: {e}", path.display()),
            )
        })?;

        Ok(u64::from_le_bytes(buf))
    }
    #[cfg(not(unix))]
    {
        let _ = (path, register);
        Err(SourceError::unavailable(SOURCE, "msr requires unix"))
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::SourceError;

const SOURCE: &str = "platform-meter";

const DEFAULT_HWMON_ROOT: &str = "/sys/class/hwmon";

/// Sensor names accepted as a whole-node power meter (ACPI class).
const METER_NAMES: &[&str] = &["power_meter", "acpi_power_meter"];

/// How the meter reports.
#[derive(Debug, Clone, Copy)]
enum MeterKind {
    /// `energy1_input`: cumulative microjoules.
    Energy,
    /// `power1_average`: instantaneous microwatts; energy is power × window.
    Power,
}

/// Whole-node energy from a hwmon power meter.
pub struct PlatformMeter {
    kind: MeterKind,
    sensor_path: PathBuf,
}

impl PlatformMeter {
    pub fn probe_default() -> Result<Self, SourceError> {
        Self::probe(Path::new(DEFAULT_HWMON_ROOT))
    }

    pub fn probe(hwmon_root: &Path) -> Result<Self, SourceError> {
        let entries = fs::read_dir(hwmon_root).map_err(|e| {
            SourceError::unavailable(SOURCE, format!("reading {}: {e}", hwmon_root.display()))
        })?;

        for entry in entries.flatten() {
            let dir = entry.path();
            let Some(name) = fs::read_to_string(dir.join("name"))
                .ok()
                .map(|s| s.trim().to_string())
            else {
                continue;
            };

            if !METER_NAMES.contains(&name.as_str()) {
                continue;
            }

            let energy = dir.join("energy1_input");
            if energy.exists() {
                debug!(sensor = %energy.display(), "platform meter found (energy)");
                return Ok(Self {
                    kind: MeterKind::Energy,
                    sensor_path: energy,
                });
            }

            let power = dir.join("device").join("power1_average");
            let power = if power.exists() {
                power
            } else {
                dir.join("power1_average")
            };
            if power.exists() {
                debug!(sensor = %power.display(), "platform meter found (power)");
                return Ok(Self {
                    kind: MeterKind::Power,
                    sensor_path: power,
                });
            }
        }

        Err(SourceError::unavailable(
            SOURCE,
            format!("no power meter under {}", hwmon_root.display()),
        ))
    }

    /// One platform reading for the elapsed window.
    pub fn read(&self, window: Duration) -> Result<PlatformReading, SourceError> {
        let raw = fs::read_to_string(&self.sensor_path).map_err(|e| {
            SourceError::transient(
                SOURCE,
                format!("reading {}: {e}", self.sensor_path.display()),
            )
        })?;
        let value: u64 = raw.trim().parse().map_err(|e| {
            SourceError::transient(
                SOURCE,
                format!("parsing {}: {e}", self.sensor_path.display()),
            )
        })?;

        Ok(match self.kind {
            // Cumulative µJ -> cumulative mJ.
            MeterKind::Energy => PlatformReading::Aggregate(value / 1_000),
            // µW × s -> mJ for this window.
            MeterKind::Power => {
                PlatformReading::Delta((value as f64 * window.as_secs_f64() / 1_000.0) as u64)
            }
        })
    }
}

/// A platform energy observation, in millijoules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformReading {
    /// Cumulative counter value; feed through aggregate-set.
    Aggregate(u64),
    /// Energy of this window only; feed through delta-push.
    Delta(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_hwmon(root: &Path, idx: u32, name: &str) -> PathBuf {
        let dir = root.join(format!("hwmon{idx}"));
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("name"), format!("{name}\n")).expect("write");
        dir
    }

    #[test]
    fn test_probe_prefers_energy_sensor() {
        let tmp = tempfile::tempdir().expect("tempdir");
        make_hwmon(tmp.path(), 0, "coretemp");
        let meter = make_hwmon(tmp.path(), 1, "power_meter");
        fs::write(meter.join("energy1_input"), "5000000\n").expect("write");

        let probe = PlatformMeter::probe(tmp.path()).expect("probe succeeds");
        let reading = probe.read(Duration::from_secs(3)).expect("read succeeds");
        assert_eq!(reading, PlatformReading::Aggregate(5_000));
    }

    #[test]
    fn test_power_sensor_integrates_over_window() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let meter = make_hwmon(tmp.path(), 0, "power_meter");
        // 2 W average over a 3 s window -> 6000 mJ.
        fs::write(meter.join("power1_average"), "2000000\n").expect("write");

        let probe = PlatformMeter::probe(tmp.path()).expect("probe succeeds");
        let reading = probe.read(Duration::from_secs(3)).expect("read succeeds");
        assert_eq!(reading, PlatformReading::Delta(6_000));
    }

    #[test]
    fn test_probe_without_meter_is_unavailable() {
        let tmp = tempfile::tempdir().expect("tempdir");
        make_hwmon(tmp.path(), 0, "coretemp");
        assert!(matches!(
            PlatformMeter::probe(tmp.path()),
            Err(SourceError::Unavailable { .. }),
        ));
    }
}

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Per-core CPU frequency from the cpufreq sysfs interface.
pub struct CpuFreqProbe {
    sys_cpu: PathBuf,
}

impl CpuFreqProbe {
    pub fn new() -> Self {
        Self::with_root(Path::new("/sys/devices/system/cpu"))
    }

    pub fn with_root(sys_cpu: &Path) -> Self {
        Self {
            sys_cpu: sys_cpu.to_path_buf(),
        }
    }

    /// Current frequency per core in kHz. Cores without a cpufreq policy are
    /// omitted; an empty map means the interface is absent.
    pub fn read(&self) -> HashMap<u32, u64> {
        let mut freqs = HashMap::new();

        let Ok(entries) = fs::read_dir(&self.sys_cpu) else {
            return freqs;
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(core) = name
                .strip_prefix("cpu")
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };

            let path = entry.path().join("cpufreq/scaling_cur_freq");
            if let Some(khz) = fs::read_to_string(path)
                .ok()
                .and_then(|s| s.trim().parse().ok())
            {
                freqs.insert(core, khz);
            }
        }

        freqs
    }
}

impl Default for CpuFreqProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_reads_per_core_frequency() {
        let tmp = tempfile::tempdir().expect("tempdir");
        for (core, khz) in [(0u32, 2_400_000u64), (1, 3_000_000)] {
            let dir = tmp.path().join(format!("cpu{core}/cpufreq"));
            fs::create_dir_all(&dir).expect("mkdir");
            fs::write(dir.join("scaling_cur_freq"), format!("{khz}\n")).expect("write");
        }
        // Directories that are not cpuN must be skipped.
        fs::create_dir_all(tmp.path().join("cpufreq")).expect("mkdir");

        let probe = CpuFreqProbe::with_root(tmp.path());
        let freqs = probe.read();
        assert_eq!(freqs.len(), 2);
        assert_eq!(freqs[&0], 2_400_000);
        assert_eq!(freqs[&1], 3_000_000);
    }

    #[test]
    fn test_missing_interface_yields_empty_map() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let probe = CpuFreqProbe::with_root(&tmp.path().join("nope"));
        assert!(probe.read().is_empty());
    }
}

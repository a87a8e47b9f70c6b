use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

const SCOPE_SUFFIX: &str = ".scope";
const SLICE_SUFFIX: &str = ".slice";

const DEFAULT_BASE: &str = "/sys/fs/cgroup";
const KUBEPODS_SLICE: &str = "kubepods.slice";
const SYSTEM_SLICE: &str = "system.slice";

/// Where container control groups live on this node.
///
/// Discovered once at startup by probing candidates in order: the kube-pods
/// slice, the system slice, then the legacy per-controller tree. The first
/// candidate that exists wins; the layout is not rediscovered mid-run.
#[derive(Debug, Clone)]
pub struct CgroupLayout {
    pub cpu_root: PathBuf,
    pub memory_root: PathBuf,
    pub io_root: PathBuf,
}

impl CgroupLayout {
    pub fn discover(base: &Path) -> Self {
        let kubepods = base.join(KUBEPODS_SLICE);
        if kubepods.is_dir() {
            debug!(root = %kubepods.display(), "using kube-pods cgroup slice");
            return Self::unified(kubepods);
        }

        let system = base.join(SYSTEM_SLICE);
        if system.is_dir() {
            debug!(root = %system.display(), "using system cgroup slice");
            return Self::unified(system);
        }

        debug!(base = %base.display(), "falling back to legacy per-controller cgroup tree");
        Self {
            cpu_root: base.join("cpu"),
            memory_root: base.join("memory"),
            io_root: base.join("blkio"),
        }
    }

    pub fn discover_default() -> Self {
        Self::discover(Path::new(DEFAULT_BASE))
    }

    fn unified(root: PathBuf) -> Self {
        Self {
            cpu_root: root.clone(),
            memory_root: root.clone(),
            io_root: root,
        }
    }

    /// Whether any cgroup root actually exists on this node.
    pub fn is_present(&self) -> bool {
        self.cpu_root.is_dir() || self.memory_root.is_dir()
    }
}

/// Extract the container id from a `.scope` directory name, e.g.
/// `crio-12b270d3b4ec.scope` or `docker-abcdef.scope`.
pub fn container_id_from_scope_name(name: &str) -> Option<&str> {
    let stem = name.strip_suffix(SCOPE_SUFFIX)?;
    Some(stem.rsplit('-').next().unwrap_or(stem))
}

/// Recursively search a cgroup tree for the `.scope` directory belonging to
/// a container id.
pub fn find_container_dir(root: &Path, container_id: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(root).ok()?;

    let mut slices = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if name.ends_with(SCOPE_SUFFIX) {
            if container_id_from_scope_name(&name) == Some(container_id) {
                return Some(path);
            }
        } else if name.ends_with(SLICE_SUFFIX) {
            slices.push(path);
        }
    }

    for slice in slices {
        if let Some(found) = find_container_dir(&slice, container_id) {
            return Some(found);
        }
    }

    None
}

/// Scalar values read from one container's control groups. `None` means the
/// file was missing; a missing file is an absent update, not an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct CgroupStats {
    pub memory_bytes: Option<u64>,
    pub kernel_memory_bytes: Option<u64>,
    pub tcp_memory_bytes: Option<u64>,
    pub cpu_total_ns: Option<u64>,
    pub cpu_user_ns: Option<u64>,
    pub cpu_system_ns: Option<u64>,
    pub io_read_bytes: Option<u64>,
    pub io_write_bytes: Option<u64>,
}

/// Reads per-container scalars from the cgroup pseudo-filesystem, caching
/// the resolved container directories.
pub struct CgroupSource {
    layout: CgroupLayout,
    paths: HashMap<String, Option<ContainerPaths>>,
}

#[derive(Debug, Clone)]
struct ContainerPaths {
    cpu: PathBuf,
    memory: PathBuf,
    io: PathBuf,
}

impl CgroupSource {
    pub fn new(layout: CgroupLayout) -> Self {
        Self {
            layout,
            paths: HashMap::new(),
        }
    }

    pub fn layout(&self) -> &CgroupLayout {
        &self.layout
    }

    /// Whether the container's cgroup directory still exists. Used by the
    /// collector to evict records for gone containers.
    pub fn container_exists(&mut self, container_id: &str) -> bool {
        match self.resolve_paths(container_id) {
            Some(paths) => paths.cpu.is_dir() || paths.memory.is_dir(),
            None => false,
        }
    }

    /// Drop the cached path for a container (after eviction).
    pub fn forget(&mut self, container_id: &str) {
        self.paths.remove(container_id);
    }

    /// Read all scalars for one container. Returns `None` when its cgroup
    /// directory cannot be located at all.
    pub fn read(&mut self, container_id: &str) -> Option<CgroupStats> {
        let paths = self.resolve_paths(container_id)?.clone();

        let mut stats = CgroupStats {
            memory_bytes: read_scalar(&paths.memory.join("memory.current"))
                .or_else(|| read_scalar(&paths.memory.join("memory.usage_in_bytes"))),
            kernel_memory_bytes: read_memory_stat(&paths.memory, "kernel")
                .or_else(|| read_scalar(&paths.memory.join("memory.kmem.usage_in_bytes"))),
            tcp_memory_bytes: read_memory_stat(&paths.memory, "sock")
                .or_else(|| read_scalar(&paths.memory.join("memory.kmem.tcp.usage_in_bytes"))),
            ..Default::default()
        };

        if let Some((total, user, system)) = read_cpu_stat(&paths.cpu) {
            stats.cpu_total_ns = Some(total);
            stats.cpu_user_ns = user;
            stats.cpu_system_ns = system;
        } else {
            stats.cpu_total_ns = read_scalar(&paths.cpu.join("cpuacct.usage"));
            stats.cpu_user_ns = read_scalar(&paths.cpu.join("cpuacct.usage_user"));
            stats.cpu_system_ns = read_scalar(&paths.cpu.join("cpuacct.usage_sys"));
        }

        if let Some((read_bytes, write_bytes)) = read_io_stat(&paths.io) {
            stats.io_read_bytes = Some(read_bytes);
            stats.io_write_bytes = Some(write_bytes);
        }

        Some(stats)
    }

    fn resolve_paths(&mut self, container_id: &str) -> Option<&ContainerPaths> {
        if !self.paths.contains_key(container_id) {
            let resolved = find_container_dir(&self.layout.cpu_root, container_id).map(|cpu| {
                let relative = cpu
                    .strip_prefix(&self.layout.cpu_root)
                    .unwrap_or(&cpu)
                    .to_path_buf();
                ContainerPaths {
                    memory: self.layout.memory_root.join(&relative),
                    io: self.layout.io_root.join(&relative),
                    cpu,
                }
            });

            if resolved.is_none() {
                warn!(container_id, "no cgroup directory found for container");
            }
            self.paths.insert(container_id.to_string(), resolved);
        }

        self.paths.get(container_id).and_then(Option::as_ref)
    }
}

/// Read a single-integer pseudo-file.
fn read_scalar(path: &Path) -> Option<u64> {
    let raw = fs::read_to_string(path).ok()?;
    raw.trim().parse().ok()
}

/// Read one key from cgroup v2 `memory.stat`.
fn read_memory_stat(memory_dir: &Path, key: &str) -> Option<u64> {
    let raw = fs::read_to_string(memory_dir.join("memory.stat")).ok()?;
    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some(key) {
            return parts.next()?.parse().ok();
        }
    }
    None
}

/// Read cgroup v2 `cpu.stat` (microseconds) into nanoseconds.
fn read_cpu_stat(cpu_dir: &Path) -> Option<(u64, Option<u64>, Option<u64>)> {
    let raw = fs::read_to_string(cpu_dir.join("cpu.stat")).ok()?;

    let mut usage = None;
    let mut user = None;
    let mut system = None;
    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("usage_usec"), Some(v)) => usage = v.parse::<u64>().ok(),
            (Some("user_usec"), Some(v)) => user = v.parse::<u64>().ok(),
            (Some("system_usec"), Some(v)) => system = v.parse::<u64>().ok(),
            _ => {}
        }
    }

    usage.map(|u| {
        (
            u.saturating_mul(1_000),
            user.map(|v| v.saturating_mul(1_000)),
            system.map(|v| v.saturating_mul(1_000)),
        )
    })
}

/// Read cgroup v2 `io.stat`, summing rbytes/wbytes across devices.
fn read_io_stat(io_dir: &Path) -> Option<(u64, u64)> {
    let raw = fs::read_to_string(io_dir.join("io.stat")).ok()?;

    let mut read_bytes = 0u64;
    let mut write_bytes = 0u64;
    let mut seen = false;
    for line in raw.lines() {
        for field in line.split_whitespace() {
            if let Some(v) = field.strip_prefix("rbytes=") {
                read_bytes = read_bytes.saturating_add(v.parse().unwrap_or(0));
                seen = true;
            } else if let Some(v) = field.strip_prefix("wbytes=") {
                write_bytes = write_bytes.saturating_add(v.parse().unwrap_or(0));
                seen = true;
            }
        }
    }

    seen.then_some((read_bytes, write_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_container(root: &Path, scope: &str) -> PathBuf {
        let dir = root.join("kubepods-besteffort.slice").join(scope);
        fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    #[test]
    fn test_container_id_from_scope_name() {
        assert_eq!(
            container_id_from_scope_name("crio-12b270d3b4ec.scope"),
            Some("12b270d3b4ec"),
        );
        assert_eq!(container_id_from_scope_name("abc.scope"), Some("abc"));
        assert_eq!(container_id_from_scope_name("not-a-scope"), None);
    }

    #[test]
    fn test_discover_prefers_kubepods() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join(KUBEPODS_SLICE)).expect("mkdir");
        fs::create_dir_all(tmp.path().join(SYSTEM_SLICE)).expect("mkdir");

        let layout = CgroupLayout::discover(tmp.path());
        assert!(layout.cpu_root.ends_with(KUBEPODS_SLICE));
        assert_eq!(layout.cpu_root, layout.memory_root);
    }

    #[test]
    fn test_discover_falls_back_to_system_then_legacy() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join(SYSTEM_SLICE)).expect("mkdir");
        let layout = CgroupLayout::discover(tmp.path());
        assert!(layout.cpu_root.ends_with(SYSTEM_SLICE));

        let empty = tempfile::tempdir().expect("tempdir");
        let layout = CgroupLayout::discover(empty.path());
        assert!(layout.cpu_root.ends_with("cpu"));
        assert!(layout.io_root.ends_with("blkio"));
    }

    #[test]
    fn test_find_container_dir_walks_nested_slices() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = make_container(tmp.path(), "crio-deadbeef.scope");

        assert_eq!(
            find_container_dir(tmp.path(), "deadbeef"),
            Some(dir.clone()),
        );
        assert_eq!(find_container_dir(tmp.path(), "feedface"), None);
    }

    #[test]
    fn test_read_cgroup_v2_stats() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = make_container(tmp.path(), "crio-deadbeef.scope");

        fs::write(dir.join("memory.current"), "4096\n").expect("write");
        fs::write(dir.join("memory.stat"), "anon 100\nkernel 256\nsock 32\n").expect("write");
        fs::write(
            dir.join("cpu.stat"),
            "usage_usec 5000\nuser_usec 3000\nsystem_usec 2000\n",
        )
        .expect("write");
        fs::write(
            dir.join("io.stat"),
            "259:0 rbytes=1024 wbytes=512 rios=3 wios=2\n8:0 rbytes=1000 wbytes=500\n",
        )
        .expect("write");

        let mut source = CgroupSource::new(CgroupLayout {
            cpu_root: tmp.path().to_path_buf(),
            memory_root: tmp.path().to_path_buf(),
            io_root: tmp.path().to_path_buf(),
        });

        let stats = source.read("deadbeef").expect("container resolves");
        assert_eq!(stats.memory_bytes, Some(4096));
        assert_eq!(stats.kernel_memory_bytes, Some(256));
        assert_eq!(stats.tcp_memory_bytes, Some(32));
        assert_eq!(stats.cpu_total_ns, Some(5_000_000));
        assert_eq!(stats.cpu_user_ns, Some(3_000_000));
        assert_eq!(stats.cpu_system_ns, Some(2_000_000));
        assert_eq!(stats.io_read_bytes, Some(2024));
        assert_eq!(stats.io_write_bytes, Some(1012));
    }

    #[test]
    fn test_missing_files_are_absent_updates() {
        let tmp = tempfile::tempdir().expect("tempdir");
        make_container(tmp.path(), "crio-deadbeef.scope");

        let mut source = CgroupSource::new(CgroupLayout {
            cpu_root: tmp.path().to_path_buf(),
            memory_root: tmp.path().to_path_buf(),
            io_root: tmp.path().to_path_buf(),
        });

        let stats = source.read("deadbeef").expect("container resolves");
        assert_eq!(stats.memory_bytes, None);
        assert_eq!(stats.cpu_total_ns, None);
        assert_eq!(stats.io_read_bytes, None);
    }

    #[test]
    fn test_unknown_container_reports_gone() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut source = CgroupSource::new(CgroupLayout {
            cpu_root: tmp.path().to_path_buf(),
            memory_root: tmp.path().to_path_buf(),
            io_root: tmp.path().to_path_buf(),
        });

        assert!(!source.container_exists("nope"));
        assert!(source.read("nope").is_none());
    }
}

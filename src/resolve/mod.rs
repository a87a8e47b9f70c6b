use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::catalog::SYSTEM_PROCESS_ID;
use crate::cgroup::container_id_from_scope_name;

/// Maps kernel process ids to container ids.
///
/// Lookups are side-effect-free against the cache; on a miss the cache may be
/// refreshed from /proc at most once per tick. Anything still unresolved is
/// attributed to the reserved system-process bucket.
pub struct IdentityResolver {
    by_pid: HashMap<u32, String>,
    by_cgroup_id: HashMap<u64, String>,
    use_cgroup_id: bool,
    refreshed_this_tick: bool,
    proc_root: PathBuf,
    cgroup_base: PathBuf,
}

impl IdentityResolver {
    pub fn new(use_cgroup_id: bool) -> Self {
        Self::with_roots(
            use_cgroup_id,
            Path::new("/proc"),
            Path::new("/sys/fs/cgroup"),
        )
    }

    pub fn with_roots(use_cgroup_id: bool, proc_root: &Path, cgroup_base: &Path) -> Self {
        Self {
            by_pid: HashMap::new(),
            by_cgroup_id: HashMap::new(),
            use_cgroup_id,
            refreshed_this_tick: false,
            proc_root: proc_root.to_path_buf(),
            cgroup_base: cgroup_base.to_path_buf(),
        }
    }

    /// Reset the per-tick refresh budget. Called by the collector at the
    /// start of every tick.
    pub fn begin_tick(&mut self) {
        self.refreshed_this_tick = false;
    }

    /// Resolve a pid (and optional tracing-reported cgroup id) to a container
    /// id. Falls back to the system-process bucket.
    pub fn resolve(&mut self, pid: u32, cgroup_id: Option<u64>) -> String {
        if self.use_cgroup_id {
            if let Some(id) = cgroup_id.and_then(|cg| self.by_cgroup_id.get(&cg)) {
                return id.clone();
            }
        }

        if let Some(id) = self.by_pid.get(&pid) {
            return id.clone();
        }

        if !self.refreshed_this_tick {
            self.refresh();
            if let Some(id) = self.by_pid.get(&pid) {
                return id.clone();
            }
        }

        SYSTEM_PROCESS_ID.to_string()
    }

    /// Drop cache entries pointing at an evicted container.
    pub fn forget_container(&mut self, container_id: &str) {
        self.by_pid.retain(|_, id| id != container_id);
        self.by_cgroup_id.retain(|_, id| id != container_id);
    }

    /// Rescan /proc once, rebuilding the pid and cgroup-id caches.
    fn refresh(&mut self) {
        self.refreshed_this_tick = true;

        let entries = match fs::read_dir(&self.proc_root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "proc scan failed during identity refresh");
                return;
            }
        };

        self.by_pid.clear();
        self.by_cgroup_id.clear();

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
                continue;
            };

            let Some((container_id, cgroup_rel)) = self.lookup_proc_cgroup(pid) else {
                continue;
            };

            if self.use_cgroup_id {
                if let Some(inode) = cgroup_inode(&self.cgroup_base, &cgroup_rel) {
                    self.by_cgroup_id.insert(inode, container_id.clone());
                }
            }
            self.by_pid.insert(pid, container_id);
        }

        debug!(pids = self.by_pid.len(), "identity cache refreshed");
    }

    /// Parse /proc/<pid>/cgroup and extract the container id from the scope
    /// segment, returning the id and the cgroup-relative path.
    fn lookup_proc_cgroup(&self, pid: u32) -> Option<(String, String)> {
        let path = self.proc_root.join(pid.to_string()).join("cgroup");
        let raw = fs::read_to_string(path).ok()?;

        for line in raw.lines() {
            // Lines look like "0::/kubepods.slice/.../crio-<id>.scope" on the
            // unified hierarchy, or "4:cpu:/..." on legacy ones.
            let rel = line.splitn(3, ':').nth(2)?;
            let scope = rel.rsplit('/').next()?;
            if let Some(id) = container_id_from_scope_name(scope) {
                return Some((id.to_string(), rel.trim_start_matches('/').to_string()));
            }
        }

        None
    }
}

/// Inode of a cgroup directory; this is what the kernel reports as the
/// cgroup id in tracing records.
fn cgroup_inode(base: &Path, relative: &str) -> Option<u64> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        fs::metadata(base.join(relative)).ok().map(|m| m.ino())
    }
    #[cfg(not(unix))]
    {
        let _ = (base, relative);
        None
    }
}

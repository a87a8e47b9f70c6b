use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;

use crate::catalog::Catalog;
use crate::metrics::{ContainerMetrics, NodeMetrics};

/// The committed, published state of one tick.
///
/// Snapshots are immutable once published; the exposition adapter reads
/// whatever snapshot was current when the scrape started, so a scrape never
/// mixes channels from two ticks.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Strictly monotonic across ticks.
    pub sequence: u64,
    pub taken_at: SystemTime,
    pub containers: Vec<ContainerMetrics>,
    pub node: NodeMetrics,
}

impl Snapshot {
    pub fn empty(catalog: &Catalog) -> Self {
        Self {
            sequence: 0,
            taken_at: SystemTime::UNIX_EPOCH,
            containers: Vec::new(),
            node: NodeMetrics::new(catalog),
        }
    }
}

/// Single-pointer publication: the collector swaps in a new snapshot at the
/// end of every tick, scrapes hold the previous one until they finish.
pub struct SnapshotHandle {
    inner: ArcSwap<Snapshot>,
}

impl SnapshotHandle {
    pub fn new(catalog: &Catalog) -> Self {
        Self {
            inner: ArcSwap::from_pointee(Snapshot::empty(catalog)),
        }
    }

    pub fn publish(&self, snapshot: Snapshot) {
        self.inner.store(Arc::new(snapshot));
    }

    pub fn load(&self) -> Arc<Snapshot> {
        self.inner.load_full()
    }
}

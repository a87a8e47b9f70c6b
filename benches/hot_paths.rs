use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use wattscope::catalog::{self, Catalog};
use wattscope::channel::Channel;
use wattscope::collector::attribute::{attribute_energy, AttributionScheme};
use wattscope::export::{self, HealthMetrics};
use wattscope::collector::Snapshot;
use wattscope::metrics::node::SocketEnergy;
use wattscope::metrics::{ContainerMetrics, NodeMetrics};

fn containers_with_usage(catalog: &Catalog, n: usize) -> HashMap<String, ContainerMetrics> {
    let mut containers = HashMap::with_capacity(n);
    for i in 0..n {
        let id = format!("container-{i:04}");
        let mut c = ContainerMetrics::new(catalog, &id, &id, "pod", "ns");
        c.counters
            .get_mut(catalog::CPU_CYCLES)
            .expect("channel")
            .add_delta(1_000 + i as u64);
        c.cpu_time.add_delta(5_000_000);
        c.commit_usage();
        containers.insert(id, c);
    }
    containers
}

fn node_with_energy(catalog: &Catalog) -> NodeMetrics {
    let mut node = NodeMetrics::new(catalog);
    let mut socket = SocketEnergy::default();
    socket.package.add_delta(24_000);
    socket.dram.add_delta(6_000);
    socket.commit();
    node.sockets.insert(0, socket);
    node
}

fn bench_channel_writes(c: &mut Criterion) {
    c.bench_function("channel_add_delta_commit", |b| {
        let mut ch = Channel::new();
        b.iter(|| {
            ch.add_delta(black_box(17));
            ch.commit();
            black_box(ch.delta());
        });
    });

    c.bench_function("channel_set_aggregate_64_producers", |b| {
        let mut ch = Channel::new();
        let producers: Vec<String> = (0..64).map(|i| format!("pid-{i}")).collect();
        let mut v = 0u64;
        b.iter(|| {
            v += 100;
            for p in &producers {
                ch.set_aggregate(p, black_box(v));
            }
            ch.commit();
        });
    });
}

fn bench_attribution(c: &mut Criterion) {
    let catalog = Catalog::full();

    for n in [16usize, 128] {
        c.bench_function(&format!("attribute_energy_{n}_containers"), |b| {
            let mut containers = containers_with_usage(&catalog, n);
            let node = node_with_energy(&catalog);
            let scheme = AttributionScheme::new(&catalog);
            b.iter(|| {
                attribute_energy(black_box(&mut containers), &node, &scheme);
            });
        });
    }
}

fn bench_exposition(c: &mut Criterion) {
    let catalog = Catalog::full();
    let containers = containers_with_usage(&catalog, 64);
    let snapshot = Snapshot {
        sequence: 1,
        taken_at: std::time::SystemTime::UNIX_EPOCH,
        containers: containers.into_values().collect(),
        node: node_with_energy(&catalog),
    };
    let health = HealthMetrics::new().expect("health");

    c.bench_function("render_snapshot_64_containers", |b| {
        b.iter(|| {
            let text = export::render(black_box(&snapshot), &health, true).expect("render");
            black_box(text.len());
        });
    });
}

criterion_group!(
    benches,
    bench_channel_writes,
    bench_attribution,
    bench_exposition,
);
criterion_main!(benches);

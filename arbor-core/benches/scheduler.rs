use std::collections::HashSet;

use arbor_core::graph::{Node, NodeId, UpdateScheduler};
use arbor_core::tree::ResourceId;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// `layers` layers of `width` nodes. The first layer reads one resource each;
/// every other node reads two nodes of the previous layer.
fn layered(layers: usize, width: usize) -> (UpdateScheduler, Vec<ResourceId>) {
    let mut scheduler = UpdateScheduler::new();
    let mut previous: Vec<NodeId> = Vec::new();
    let mut resources = Vec::new();

    for layer in 0..layers {
        let mut current = Vec::with_capacity(width);
        for i in 0..width {
            let id = scheduler.add_node(Node::new(NodeId::new(), format!("{layer}:{i}")));
            if layer == 0 {
                let resource = ResourceId::new(i as u64);
                resources.push(resource);
                scheduler.set_reads(id, HashSet::from([resource]), HashSet::new());
            } else {
                let upstream = HashSet::from([previous[i], previous[(i + 1) % width]]);
                scheduler.set_reads(id, HashSet::new(), upstream);
            }
            current.push(id);
        }
        previous = current;
    }

    (scheduler, resources)
}

fn bench_mark_changed(c: &mut Criterion) {
    let mut group = c.benchmark_group("mark_changed");
    for (layers, width) in [(4, 16), (16, 64), (32, 128)] {
        let (scheduler, resources) = layered(layers, width);
        group.bench_with_input(
            BenchmarkId::new("single_resource", format!("{layers}x{width}")),
            &resources,
            |b, resources| {
                b.iter(|| scheduler.mark_changed(black_box(&resources[..1]), std::iter::empty()))
            },
        );
        group.bench_with_input(
            BenchmarkId::new("all_resources", format!("{layers}x{width}")),
            &resources,
            |b, resources| {
                b.iter(|| scheduler.mark_changed(black_box(resources.iter()), std::iter::empty()))
            },
        );
    }
    group.finish();
}

fn bench_all_nodes(c: &mut Criterion) {
    let (scheduler, _) = layered(32, 128);
    c.bench_function("all_nodes_32x128", |b| b.iter(|| black_box(scheduler.all_nodes())));
}

criterion_group!(benches, bench_mark_changed, bench_all_nodes);
criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use irgauge::daemon::queue::CommandQueue;
use irgauge::Packet;

fn filled_queue(entries: u32) -> CommandQueue {
    let mut queue = CommandQueue::new();
    for raw in 1..=entries {
        queue.add(Packet::from_raw(raw), 14, 33_000, 18);
    }
    queue
}

fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_tick");
    // Real deployments hold tens of entries
    for size in [10u32, 50, 200] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &n| {
            b.iter_batched(
                || filled_queue(n),
                |mut queue| black_box(queue.tick()),
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_replace(c: &mut Criterion) {
    c.bench_function("queue_remove_then_add", |b| {
        b.iter_batched(
            || filled_queue(50),
            |mut queue| {
                queue.remove(Packet::from_raw(25));
                queue.add(Packet::from_raw(1_000), 14, 33_000, 18);
                queue
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_tick, bench_replace);
criterion_main!(benches);

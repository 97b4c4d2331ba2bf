use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pulse_core::Registry;

fn primitives(c: &mut Criterion) {
    let registry = Registry::new();
    let counter = registry.counter("bench_total", "Benchmark counter").unwrap();
    let gauge = registry.gauge("bench_depth", "Benchmark gauge").unwrap();
    let histogram = registry
        .histogram("bench_seconds", "Benchmark histogram", &[])
        .unwrap();

    c.bench_function("counter_inc", |b| b.iter(|| counter.inc()));
    c.bench_function("gauge_add", |b| b.iter(|| gauge.add(black_box(1.5))));
    c.bench_function("histogram_observe", |b| {
        b.iter(|| histogram.observe(black_box(0.42)))
    });
    c.bench_function("gather", |b| b.iter(|| black_box(registry.gather())));
}

criterion_group!(benches, primitives);
criterion_main!(benches);

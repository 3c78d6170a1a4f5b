
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use groupseg::models::{ModelType, ModelTypeKind, Row};
use groupseg::{ingest_group, ingest_groups, DiscardingSink, IngestConfig, ValueDataPoint};

use std::sync::Arc;

fn make_config(error_bound: f32, dynamic_split_fraction: f32) -> IngestConfig {
    IngestConfig {
        error_bound,
        dynamic_split_fraction,
        ..IngestConfig::default()
    }
}

fn bench_ingest_fixed_dataset(c: &mut Criterion) {
    let dataset = datasets::generate_group(datasets::DEFAULT_SEED, 5_000, 8, 250, 200);

    let mut group = c.benchmark_group("ingest");
    group.throughput(Throughput::Elements(dataset.points() as u64));

    for (name, error_bound, fraction) in [
        ("lossless_static", 0.0, 0.0),
        ("lossless_dynamic", 0.0, 1.0),
        ("bound5_dynamic", 5.0, 1.0),
    ] {
        let config = make_config(error_bound, fraction);
        group.bench_function(format!("ingest_5k_rows_8_series_{}", name), |b| {
            b.iter_batched(
                || dataset.to_group(1),
                |g| {
                    ingest_group(black_box(&config), g, Arc::new(DiscardingSink))
                        .expect("ingest");
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_ingest_parallel_groups(c: &mut Criterion) {
    let datasets: Vec<_> = (0..8)
        .map(|i| datasets::generate_group(datasets::DEFAULT_SEED + i, 2_000, 4, 100, 0))
        .collect();
    let config = make_config(1.0, 1.0);

    let mut group = c.benchmark_group("ingest_parallel");
    group.bench_function("ingest_8_groups", |b| {
        b.iter_batched(
            || {
                datasets
                    .iter()
                    .enumerate()
                    .map(|(i, d)| d.to_group(i as i32 + 1))
                    .collect::<Vec<_>>()
            },
            |groups| {
                let results =
                    ingest_groups(black_box(&config), groups, Arc::new(DiscardingSink))
                        .expect("ingest");
                assert!(results.iter().all(|(_, r)| r.is_ok()));
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn bench_model_append(c: &mut Criterion) {
    let rows: Vec<Row> = (0..50)
        .map(|r| {
            (0..8)
                .map(|tid| ValueDataPoint::new(tid, (r + 1) * 100, 20.0 + r as f32 * 0.01, 100))
                .collect()
        })
        .collect();

    let mut group = c.benchmark_group("model_append");
    for kind in [
        ModelTypeKind::PmcMean,
        ModelTypeKind::Swing,
        ModelTypeKind::Gorilla,
    ] {
        let mut model: Box<dyn ModelType> = kind.build(2, 1.0, 50).expect("model");
        group.bench_function(format!("initialize_50x8_{}", kind), |b| {
            b.iter(|| {
                model.initialize(black_box(&rows));
                black_box(model.length())
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_ingest_fixed_dataset,
    bench_ingest_parallel_groups,
    bench_model_append
);
criterion_main!(benches);

// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Hot-path benchmarks: the fused synchronous pipeline, the relay path
//! and the merge drain loop.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rill_flow::Flow;
use std::time::Duration;

fn fused_pipeline(c: &mut Criterion) {
    c.bench_function("range_map_filter_reduce_10k", |b| {
        b.iter(|| {
            let total = Flow::range(0, 10_000)
                .map(|x| x * 3)
                .filter(|x| x % 2 == 0)
                .reduce(0i64, |acc, x| acc + x)
                .block(Duration::from_secs(5))
                .unwrap();
            black_box(total)
        });
    });
}

fn relay_pipeline(c: &mut Criterion) {
    c.bench_function("hidden_range_map_10k", |b| {
        b.iter(|| {
            // hide() pins the chain to relay mode: no fusion.
            let total = Flow::range(0, 10_000)
                .hide()
                .map(|x| x + 1)
                .count()
                .block(Duration::from_secs(5))
                .unwrap();
            black_box(total)
        });
    });
}

fn merge_drain(c: &mut Criterion) {
    c.bench_function("merge_4x1k", |b| {
        b.iter(|| {
            let total = Flow::merge(vec![
                Flow::range(0, 1_000),
                Flow::range(1_000, 1_000),
                Flow::range(2_000, 1_000),
                Flow::range(3_000, 1_000),
            ])
            .count()
            .block(Duration::from_secs(5))
            .unwrap();
            black_box(total)
        });
    });
}

criterion_group!(benches, fused_pipeline, relay_pipeline, merge_drain);
criterion_main!(benches);

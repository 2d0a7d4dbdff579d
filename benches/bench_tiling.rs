//! Tiling pipeline benchmarks.
//!
//! Scenarios:
//!   - split search: CoreSplitSearch::decide alone
//!   - full pipeline: tile_conv end to end
//!   - batch: TilingEngine::tile_many over a network's layers (cold cache)

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use conv_tiling::tiling::ConvProblem;
use conv_tiling::{
    tile_conv, AttrInfo, ConvDesc, CoreSplitSearch, PlatformInfo, TilingEngine, TilingRequest,
};

// ─── Shapes ───

/// (name, NCHW input, [co, kh, kw], stride, pad)
const LAYERS: &[(&str, [u64; 4], [u64; 3], u64, u64)] = &[
    ("stem_7x7", [8, 3, 224, 224], [64, 7, 7], 2, 3),
    ("res2_3x3", [8, 64, 56, 56], [64, 3, 3], 1, 1),
    ("res3_1x1", [8, 256, 28, 28], [512, 1, 1], 2, 0),
    ("res4_3x3", [8, 256, 14, 14], [256, 3, 3], 1, 1),
    ("res5_3x3", [8, 512, 7, 7], [512, 3, 3], 1, 1),
];

fn requests() -> Vec<(&'static str, TilingRequest)> {
    LAYERS
        .iter()
        .map(|&(name, input, kernel, stride, pad)| {
            let attr = AttrInfo::conv2d(stride, pad, 1);
            let req = TilingRequest::conv2d(input, kernel, attr, ConvDesc::default())
                .expect("benchmark shape is valid");
            (name, req)
        })
        .collect()
}

// ─── Benchmarks ───

fn bench_split_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("tiling/split_search");
    group.measurement_time(Duration::from_secs(3));
    let plat = PlatformInfo::default();

    for (name, req) in requests() {
        let problem = ConvProblem::new(req.shape, req.attr, req.desc).expect("valid problem");
        group.bench_with_input(BenchmarkId::new("decide", name), &problem, |b, p| {
            b.iter(|| black_box(CoreSplitSearch::new(p, &plat).decide()))
        });
    }
    group.finish();
}

fn bench_full_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("tiling/tile_conv");
    group.measurement_time(Duration::from_secs(3));

    for cores in [8u64, 32] {
        let plat = PlatformInfo::with_core_num(cores);
        for (name, req) in requests() {
            group.bench_with_input(
                BenchmarkId::new(format!("{cores}c"), name),
                &req,
                |b, r| b.iter(|| black_box(tile_conv(r, &plat))),
            );
        }
    }
    group.finish();
}

fn bench_tile_many(c: &mut Criterion) {
    let mut group = c.benchmark_group("tiling/tile_many");
    group.sample_size(20);
    let reqs: Vec<TilingRequest> = requests().into_iter().map(|(_, r)| r).collect();
    group.throughput(Throughput::Elements(reqs.len() as u64));

    group.bench_function("cold_cache", |b| {
        b.iter(|| {
            let mut engine =
                TilingEngine::with_platform(PlatformInfo::default()).expect("default platform");
            black_box(engine.tile_many(&reqs))
        })
    });
    group.finish();
}

criterion_group!(benches, bench_split_search, bench_full_pipeline, bench_tile_many);
criterion_main!(benches);

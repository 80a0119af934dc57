use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pixelwall_core::{EngineConfig, ManualClock, PlacementEngine, Timestamp};
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn bench_place_cell(c: &mut Criterion) {
    let rt = runtime();
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
    let engine = PlacementEngine::new(EngineConfig::default()).with_clock(clock.clone());
    let id = rt.block_on(engine.issue_identity()).unwrap();
    let mut i = 0i64;

    c.bench_function("place_cell_committed", |b| {
        b.iter(|| {
            clock.advance(Duration::from_millis(5_000));
            i = (i + 1) % 1024;
            black_box(rt.block_on(engine.place(id, i, i, i % 16)).unwrap());
        })
    });
}

fn bench_rate_limited(c: &mut Criterion) {
    let rt = runtime();
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
    let engine = PlacementEngine::new(EngineConfig::default()).with_clock(clock);
    let id = rt.block_on(engine.issue_identity()).unwrap();
    rt.block_on(engine.place(id, 0, 0, 0)).unwrap();

    c.bench_function("place_cell_rate_limited", |b| {
        b.iter(|| black_box(rt.block_on(engine.place(id, 1, 1, 1)).unwrap()))
    });
}

fn bench_get_cells(c: &mut Criterion) {
    let rt = runtime();
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
    let engine = PlacementEngine::new(EngineConfig::default()).with_clock(clock.clone());
    let id = rt.block_on(engine.issue_identity()).unwrap();
    for i in 0..10_000i64 {
        clock.advance(Duration::from_millis(5_000));
        rt.block_on(engine.place(id, i % 1024, i / 1024, i % 16)).unwrap();
    }

    c.bench_function("get_cells_snapshot_10k", |b| {
        b.iter(|| black_box(engine.get_cells(None).unwrap()))
    });
    c.bench_function("get_cells_since_recent", |b| {
        let since = clock_since(&engine);
        b.iter(|| black_box(engine.get_cells(Some(&since)).unwrap()))
    });
}

fn clock_since(engine: &PlacementEngine) -> String {
    engine
        .changes_since(engine.latest_sequence().saturating_sub(100))
        .and_then(|records| records.first().map(|r| r.placed_at.as_millis().to_string()))
        .unwrap_or_else(|| "0".to_string())
}

criterion_group!(benches, bench_place_cell, bench_rate_limited, bench_get_cells);
criterion_main!(benches);

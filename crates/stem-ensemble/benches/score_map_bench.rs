//! Criterion benchmarks for stem-ensemble: footprint generation and tiled score mapping.

use criterion::{Criterion, criterion_group, criterion_main};

use stem_ensemble::{Bounds, GeoTransform, GridConfig, RasterExtent, ScoreMapConfig, ScoredFootprint};

fn footprints(extent: &Bounds) -> Vec<ScoredFootprint> {
    GridConfig::new((1500.0, 1500.0), (4500.0, 4500.0), 4, 1)
        .unwrap()
        .with_seed(42)
        .generate(extent)
        .unwrap()
        .into_iter()
        .map(|s| ScoredFootprint {
            set_id: s.id,
            bounds: s.bounds,
            value: (s.id.get() % 17) as f64 / 17.0,
        })
        .collect()
}

fn raster() -> RasterExtent {
    let transform = GeoTransform {
        origin_x: 0.0,
        pixel_width: 30.0,
        origin_y: 30_000.0,
        pixel_height: -30.0,
    };
    RasterExtent::new(1000, 1000, transform, None).unwrap()
}

fn bench_generate(c: &mut Criterion) {
    let extent = raster().bounds();
    let grid = GridConfig::new((1500.0, 1500.0), (4500.0, 4500.0), 4, 1)
        .unwrap()
        .with_seed(42);
    c.bench_function("grid_generate_20x20_cells", |b| {
        b.iter(|| grid.generate(&extent).unwrap());
    });
}

fn bench_score_map(c: &mut Criterion) {
    let extent = raster();
    let fps = footprints(&extent.bounds());
    let mask: Vec<bool> = (0..extent.n_pixels()).map(|i| i % 11 != 0).collect();
    let config = ScoreMapConfig::new();
    c.bench_function("score_map_1000x1000_1600_sets", |b| {
        b.iter(|| config.map(&extent, &mask, &fps).unwrap());
    });
}

criterion_group!(benches, bench_generate, bench_score_map);
criterion_main!(benches);

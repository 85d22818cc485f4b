use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use w2x_core::{
    BackendFactory, ConvertOptions, CpuBackendFactory, Layer, Model, Plane, TileBudget,
    WgpuBackendFactory, convert, run_pipeline,
};
use w2x_utils::gpu::{GpuAvailability, GpuContext, GpuContextOptions};

/// vgg_7-shaped stack: 1 -> 32 -> 32 -> 64 -> 64 -> 128 -> 128 -> 1.
fn vgg7_model() -> Model {
    let widths = [1, 32, 32, 64, 64, 128, 128, 1];
    let layers = widths
        .windows(2)
        .map(|pair| {
            let (n_in, n_out) = (pair[0], pair[1]);
            let weights = (0..n_in * n_out)
                .map(|n| Plane::from_fn(3, 3, |x, y| ((n + x + y) % 7) as f32 * 0.001))
                .collect();
            Layer::new(n_in, n_out, 3, weights, vec![0.01; n_out]).expect("layer")
        })
        .collect();
    Model::from_layers(layers).expect("model")
}

fn benchmark_cpu_pipeline(c: &mut Criterion) {
    let model = vgg7_model();
    let factory = CpuBackendFactory::default();
    let mut group = c.benchmark_group("cpu_pipeline");
    group.sample_size(10);

    for edge in [32usize, 64] {
        let input = Plane::filled(edge, edge, 0.5);
        group.bench_with_input(BenchmarkId::new("single_tile", edge), &input, |b, input| {
            let mut backend = factory.create().expect("backend");
            b.iter(|| run_pipeline(&mut backend, black_box(&model), black_box(input)).expect("run"))
        });
    }

    let input = Plane::filled(96, 96, 0.5);
    let options = ConvertOptions {
        tile_budget: TileBudget::square(48),
        use_tiling: true,
        jobs: 4,
    };
    group.bench_function("tiled_96", |b| {
        b.iter(|| convert(black_box(&input), &model, &options, &factory).expect("convert"))
    });
    group.finish();
}

fn benchmark_gpu_pipeline(c: &mut Criterion) {
    let ctx = match GpuContext::init_with_fallback(&GpuContextOptions::default()) {
        GpuAvailability::Available(ctx) => ctx,
        _ => {
            eprintln!("Skipping GPU benchmark (no adapter available)");
            return;
        }
    };
    let model = vgg7_model();
    let factory = WgpuBackendFactory::with_default_planes(ctx);
    let mut backend = factory.create().expect("backend");
    let input = Plane::filled(128, 128, 0.5);
    c.bench_function("gpu_pipeline_128", |b| {
        b.iter(|| run_pipeline(&mut backend, black_box(&model), black_box(&input)).expect("run"))
    });
}

criterion_group!(benches, benchmark_cpu_pipeline, benchmark_gpu_pipeline);
criterion_main!(benches);

use std::sync::Arc;

use anyhow::{Context, anyhow};
use log::{debug, info};
use w2x_utils::gpu::GpuContext;

use super::{
    conv2d::{ConvolvePipeline, LayerWeights},
    memory::GpuBufferPool,
    tensor::GpuPlaneStack,
};
use crate::{
    backend::{BackendFactory, ComputeBackend, DEFAULT_MAX_PLANES},
    error::{ConvertError, Result},
    model::{Layer, Model, ModelId},
    plane::Plane,
};

/// [`ComputeBackend`] running each layer as one WGSL compute dispatch.
///
/// Weights are uploaded once per model and reused for every tile the
/// backend processes.
#[derive(Debug)]
pub struct WgpuBackend {
    context: Arc<GpuContext>,
    pipeline: Arc<ConvolvePipeline>,
    pool: Arc<GpuBufferPool>,
    max_planes: usize,
    prepared: Option<(ModelId, Vec<LayerWeights>)>,
}

impl WgpuBackend {
    /// Standalone backend with its own pipeline and buffer pool.
    pub fn new(context: Arc<GpuContext>, max_planes: usize) -> Self {
        let pipeline = Arc::new(ConvolvePipeline::new(context.device()));
        let pool = Arc::new(GpuBufferPool::new(context.clone()));
        Self::from_parts(context, pipeline, pool, max_planes)
    }

    fn from_parts(
        context: Arc<GpuContext>,
        pipeline: Arc<ConvolvePipeline>,
        pool: Arc<GpuBufferPool>,
        max_planes: usize,
    ) -> Self {
        Self {
            context,
            pipeline,
            pool,
            max_planes: max_planes.max(1),
            prepared: None,
        }
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }

    fn layer_weights(&self, layer_index: usize) -> Result<&LayerWeights> {
        self.prepared
            .as_ref()
            .and_then(|(_, layers)| layers.get(layer_index))
            .ok_or_else(|| {
                ConvertError::backend(anyhow!(
                    "layer {layer_index} has no uploaded weights; prepare() was not called"
                ))
            })
    }
}

impl ComputeBackend for WgpuBackend {
    type Slot = GpuPlaneStack;

    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn max_planes(&self) -> usize {
        self.max_planes
    }

    fn prepare(&mut self, model: &Model) -> Result<()> {
        if matches!(&self.prepared, Some((id, _)) if *id == model.id()) {
            return Ok(());
        }
        let device = self.context.device();
        let layers = model
            .layers()
            .iter()
            .enumerate()
            .map(|(index, layer)| LayerWeights::upload(device, index, layer))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(ConvertError::Backend)?;
        debug!(
            target: "w2x::gpu",
            "uploaded weights for {} layers",
            layers.len()
        );
        self.prepared = Some((model.id(), layers));
        Ok(())
    }

    fn allocate(&mut self, width: usize, height: usize, planes: usize) -> Result<GpuPlaneStack> {
        if planes > self.max_planes {
            return Err(ConvertError::backend(anyhow!(
                "slot of {planes} planes exceeds the GPU bound of {}",
                self.max_planes
            )));
        }
        let fits = self.context.planes_per_binding(width, height);
        if planes > fits {
            return Err(ConvertError::backend(anyhow!(
                "{planes} planes of {width}x{height} exceed the storage binding limit \
                 ({fits} planes); use a smaller tile budget"
            )));
        }
        GpuPlaneStack::allocate(
            self.context.clone(),
            self.pool.clone(),
            width,
            height,
            planes,
            Some("w2x_activation_slot"),
        )
        .with_context(|| format!("allocating {planes} planes of {width}x{height}"))
        .map_err(ConvertError::Backend)
    }

    fn upload(&mut self, slot: &mut GpuPlaneStack, planes: &[Plane]) -> Result<()> {
        slot.write_planes(planes).map_err(ConvertError::Backend)
    }

    fn convolve(
        &mut self,
        layer_index: usize,
        _layer: &Layer,
        input: &GpuPlaneStack,
        output: &mut GpuPlaneStack,
    ) -> Result<()> {
        let weights = self.layer_weights(layer_index)?;
        self.pipeline
            .execute(&self.context, weights, input, output)
            .with_context(|| format!("dispatching layer {layer_index}"))
            .map_err(ConvertError::Backend)
    }

    fn download(&mut self, slot: &GpuPlaneStack) -> Result<Plane> {
        slot.read_plane(0).map_err(ConvertError::Backend)
    }
}

/// Builds [`WgpuBackend`]s that share one device, compiled pipeline and buffer pool.
#[derive(Debug, Clone)]
pub struct WgpuBackendFactory {
    context: Arc<GpuContext>,
    pipeline: Arc<ConvolvePipeline>,
    pool: Arc<GpuBufferPool>,
    max_planes: usize,
}

impl WgpuBackendFactory {
    pub fn new(context: Arc<GpuContext>, max_planes: usize) -> Self {
        let pipeline = Arc::new(ConvolvePipeline::new(context.device()));
        let pool = Arc::new(GpuBufferPool::new(context.clone()));
        let info = context.adapter_info();
        info!(
            target: "w2x::gpu",
            "wgpu backend on '{}' ({:?}), up to {max_planes} planes per slot",
            info.name,
            info.backend
        );
        Self {
            context,
            pipeline,
            pool,
            max_planes,
        }
    }

    pub fn with_default_planes(context: Arc<GpuContext>) -> Self {
        Self::new(context, DEFAULT_MAX_PLANES)
    }

    pub fn buffer_pool(&self) -> &Arc<GpuBufferPool> {
        &self.pool
    }
}

impl BackendFactory for WgpuBackendFactory {
    type Backend = WgpuBackend;

    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn create(&self) -> Result<WgpuBackend> {
        Ok(WgpuBackend::from_parts(
            self.context.clone(),
            self.pipeline.clone(),
            self.pool.clone(),
            self.max_planes,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::CpuBackendFactory,
        converter::{ConvertOptions, convert},
        pipeline::run_pipeline,
        tiling::TileBudget,
    };
    use w2x_utils::gpu::{GpuAvailability, GpuContextOptions};

    fn gpu_factory() -> Option<WgpuBackendFactory> {
        match GpuContext::init_with_fallback(&GpuContextOptions::default()) {
            GpuAvailability::Available(ctx) => Some(WgpuBackendFactory::with_default_planes(ctx)),
            _ => None,
        }
    }

    fn sample_model() -> Model {
        let first = Layer::new(
            1,
            4,
            3,
            (0..4)
                .map(|o| Plane::from_fn(3, 3, |x, y| ((x + 2 * y + o) % 5) as f32 * 0.1 - 0.2))
                .collect(),
            vec![0.1, -0.2, 0.0, 0.3],
        )
        .expect("first layer");
        let second = Layer::new(
            4,
            1,
            3,
            (0..4)
                .map(|i| Plane::from_fn(3, 3, |x, y| ((x * y + i) % 3) as f32 * 0.05))
                .collect(),
            vec![-0.05],
        )
        .expect("second layer");
        Model::from_layers(vec![first, second]).expect("model")
    }

    #[test]
    fn gpu_matches_cpu_reference() {
        let Some(factory) = gpu_factory() else {
            eprintln!("Skipping gpu_matches_cpu_reference (no adapter)");
            return;
        };
        let model = sample_model();
        let input = Plane::from_fn(29, 17, |x, y| ((x * 31 + y * 7) % 23) as f32 / 23.0);

        let mut gpu = factory.create().expect("gpu backend");
        let mut cpu = CpuBackendFactory::default().create().expect("cpu backend");
        let gpu_out = run_pipeline(&mut gpu, &model, &input).expect("gpu run");
        let cpu_out = run_pipeline(&mut cpu, &model, &input).expect("cpu run");

        let diff = gpu_out.max_abs_diff(&cpu_out).expect("same size");
        assert!(diff < 1e-4, "GPU drifted from CPU by {diff}");
    }

    #[test]
    fn tiled_gpu_conversion_matches_untiled() {
        let Some(factory) = gpu_factory() else {
            eprintln!("Skipping tiled_gpu_conversion_matches_untiled (no adapter)");
            return;
        };
        let model = sample_model();
        let input = Plane::from_fn(70, 45, |x, y| ((x ^ y) % 11) as f32 / 11.0);
        let untiled = convert(
            &input,
            &model,
            &ConvertOptions {
                use_tiling: false,
                ..ConvertOptions::default()
            },
            &factory,
        )
        .expect("untiled");
        let tiled = convert(
            &input,
            &model,
            &ConvertOptions {
                tile_budget: TileBudget::new(24, 20),
                use_tiling: true,
                jobs: 2,
            },
            &factory,
        )
        .expect("tiled");
        let diff = tiled.max_abs_diff(&untiled).expect("same size");
        assert!(diff < 1e-5, "tiled GPU output drifted by {diff}");
    }

    #[test]
    fn convolve_without_prepare_is_a_backend_error() {
        let Some(factory) = gpu_factory() else {
            return;
        };
        let model = sample_model();
        let mut backend = factory.create().expect("backend");
        let input = backend.allocate(4, 4, 4).expect("input");
        let mut output = backend.allocate(4, 4, 4).expect("output");
        let err = backend
            .convolve(0, &model.layers()[0], &input, &mut output)
            .unwrap_err();
        assert!(matches!(err, ConvertError::Backend(_)));
    }
}

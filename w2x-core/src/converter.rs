//! Conversion entry points: the one-shot [`convert`] and the reusable [`Converter`].

use std::{fmt, num::NonZeroUsize, path::Path};

use log::{Level, info};
use w2x_utils::{config::ConversionSettings, telemetry::timing_guard};

use crate::{
    backend::{BackendFactory, BackendPool},
    error::{ConvertError, Result},
    model::Model,
    plane::Plane,
    tiling::{TileBudget, TileGrid, run_tiled, should_split},
};

/// Default number of tiles converted concurrently.
pub const DEFAULT_JOBS: usize = 4;

/// Per-call conversion options. Passed explicitly; there is no global configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertOptions {
    /// Largest tile, padding border included.
    pub tile_budget: TileBudget,
    /// Split images larger than the budget. When `false` the image runs as one tile.
    pub use_tiling: bool,
    /// Tiles processed concurrently; values below one are treated as one.
    pub jobs: usize,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            tile_budget: TileBudget::default(),
            use_tiling: true,
            jobs: DEFAULT_JOBS,
        }
    }
}

impl From<&ConversionSettings> for ConvertOptions {
    fn from(settings: &ConversionSettings) -> Self {
        Self {
            tile_budget: TileBudget::new(
                settings.block_width as usize,
                settings.block_height as usize,
            ),
            use_tiling: settings.tiling,
            jobs: settings.jobs.max(1),
        }
    }
}

/// Convert a single plane with `model`.
///
/// The plane is padded by the model's border, split into tiles when
/// `use_tiling` is set and the image exceeds the tile budget, run through
/// every layer on backends from `backends`, and stitched back together.
/// Backends are created for this call only; use [`Converter`] to keep them
/// (and their uploaded weights) across images.
///
/// # Arguments
///
/// * `input` - Plane to convert; it must be non-empty.
/// * `model` - Validated layer stack consuming one plane and producing one plane.
/// * `options` - Tile budget, tiling switch and concurrency.
/// * `backends` - Factory producing one compute backend per concurrent tile worker.
pub fn convert<F>(
    input: &Plane,
    model: &Model,
    options: &ConvertOptions,
    backends: &F,
) -> Result<Plane>
where
    F: BackendFactory + ?Sized,
{
    let _guard = timing_guard("w2x_core::convert", Level::Debug);
    let grid = plan_grid(input, model, options, backends.name())?;
    let pool = BackendPool::new(backends, worker_count(options.jobs.min(grid.len())))?;
    run_tiled(input, model, &grid, &pool)
}

fn plan_grid(
    input: &Plane,
    model: &Model,
    options: &ConvertOptions,
    backend: &str,
) -> Result<TileGrid> {
    let (width, height) = input.dims();
    if input.is_empty() {
        return Err(ConvertError::InvalidPlane(format!(
            "cannot convert an empty {width}x{height} plane"
        )));
    }

    let border = model.border();
    let grid = if options.use_tiling && should_split(width, height, options.tile_budget) {
        TileGrid::plan(width, height, options.tile_budget, border)?
    } else {
        TileGrid::single(width, height, border)
    };

    info!(
        target: "w2x::core",
        "Converting {width}x{height} plane: {} layers, border {border}, {} tile(s) on {backend}",
        model.len(),
        grid.len()
    );
    Ok(grid)
}

fn worker_count(jobs: usize) -> NonZeroUsize {
    NonZeroUsize::new(jobs).unwrap_or(NonZeroUsize::MIN)
}

/// Couples a loaded model with conversion options and a pool of backends
/// that lives as long as the converter, so per-model backend state such as
/// uploaded GPU weights is prepared once per worker rather than per image.
pub struct Converter<F: BackendFactory> {
    model: Model,
    factory: F,
    options: ConvertOptions,
    pool: BackendPool<F::Backend>,
}

impl<F: BackendFactory> Converter<F> {
    /// Load the model at `model_path` (JSON or binary, by extension).
    pub fn new<P: AsRef<Path>>(model_path: P, factory: F, options: ConvertOptions) -> Result<Self> {
        let model = Model::load(model_path)?;
        Self::with_model(model, factory, options)
    }

    /// Build the converter and its `options.jobs` backends.
    pub fn with_model(model: Model, factory: F, options: ConvertOptions) -> Result<Self> {
        let pool = BackendPool::new(&factory, worker_count(options.jobs))?;
        Ok(Self {
            model,
            factory,
            options,
            pool,
        })
    }

    pub fn convert(&self, input: &Plane) -> Result<Plane> {
        let _guard = timing_guard("w2x_core::Converter::convert", Level::Debug);
        let grid = plan_grid(input, &self.model, &self.options, self.factory.name())?;
        run_tiled(input, &self.model, &grid, &self.pool)
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn options(&self) -> &ConvertOptions {
        &self.options
    }

    /// Name of the backend family doing the work.
    pub fn backend_name(&self) -> &'static str {
        self.factory.name()
    }
}

impl<F: BackendFactory + fmt::Debug> fmt::Debug for Converter<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converter")
            .field("model", &self.model)
            .field("factory", &self.factory)
            .field("options", &self.options)
            .field("pool", &self.pool)
            .finish()
    }
}

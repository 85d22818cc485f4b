//! Tile orchestration: split decision, tile geometry, parallel execution and
//! seam-free stitching.
//!
//! The input is padded once by the model's border (edge replication). Tiles
//! are cut from the padded plane with `border` pixels of context on every
//! side, run through the pipeline, cropped back by `border`, and copied into
//! disjoint regions of the output. Adjacent tiles overlap by `2 * border`
//! pixels of input, so every output pixel is computed with full context.

use anyhow::anyhow;
use log::{Level, debug, info};
use rayon::prelude::*;
use w2x_utils::telemetry::timing_guard;

use crate::{
    backend::{BackendPool, ComputeBackend},
    error::{ConvertError, Result},
    model::Model,
    pipeline::run_pipeline,
    plane::{Plane, Rect},
};

/// Default tile edge in pixels (padding included).
pub const DEFAULT_TILE_EDGE: usize = 512;

/// Maximum tile extent in pixels, including the padding border.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileBudget {
    pub width: usize,
    pub height: usize,
}

impl Default for TileBudget {
    fn default() -> Self {
        Self::square(DEFAULT_TILE_EDGE)
    }
}

impl TileBudget {
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub const fn square(edge: usize) -> Self {
        Self::new(edge, edge)
    }

    /// Square budget of edge `2^exp`; `None` when the edge would overflow.
    pub fn from_exp2(exp: u32) -> Option<Self> {
        1usize.checked_shl(exp).map(Self::square)
    }

    /// Pixel count, widened so no `usize` budget can overflow.
    pub const fn area(&self) -> u128 {
        self.width as u128 * self.height as u128
    }

    /// Output pixels each tile contributes per axis once `border` is removed from both sides.
    pub fn usable(&self, border: usize) -> Result<(usize, usize)> {
        let margin = 2 * border;
        if self.width <= margin || self.height <= margin {
            return Err(ConvertError::InvalidTileBudget {
                width: self.width,
                height: self.height,
                border,
            });
        }
        Ok((self.width - margin, self.height - margin))
    }
}

/// `true` when an image of `width × height` has more pixels than the budget allows.
pub fn should_split(width: usize, height: usize, budget: TileBudget) -> bool {
    width as u128 * height as u128 > budget.area()
}

/// Number of tiles needed along one axis: `ceil(extent / (budget_edge - 2 * border))`.
pub fn split_count(extent: usize, budget_edge: usize, border: usize) -> Result<usize> {
    let usable = budget_edge
        .checked_sub(2 * border)
        .filter(|&u| u > 0)
        .ok_or(ConvertError::InvalidTileBudget {
            width: budget_edge,
            height: budget_edge,
            border,
        })?;
    Ok(extent.div_ceil(usable))
}

/// One tile: where it is read from in the padded input and where its
/// cropped output lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub row: usize,
    pub column: usize,
    /// Region of the padded input, border included.
    pub source: Rect,
    /// Region of the output the cropped result covers.
    pub destination: Rect,
}

/// Tile layout for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    rows: usize,
    columns: usize,
    border: usize,
    width: usize,
    height: usize,
    tiles: Vec<Tile>,
}

impl TileGrid {
    /// Plan tiles for an unpadded `width × height` image.
    ///
    /// Tiles step by the usable budget; the last row and column stretch to
    /// the padded edge.
    pub fn plan(width: usize, height: usize, budget: TileBudget, border: usize) -> Result<Self> {
        let (step_x, step_y) = budget.usable(border)?;
        let columns = width.div_ceil(step_x);
        let rows = height.div_ceil(step_y);

        let mut tiles = Vec::with_capacity(rows * columns);
        for row in 0..rows {
            let y = row * step_y;
            let out_h = if row + 1 == rows { height - y } else { step_y };
            for column in 0..columns {
                let x = column * step_x;
                let out_w = if column + 1 == columns { width - x } else { step_x };
                tiles.push(Tile {
                    row,
                    column,
                    source: Rect::new(x, y, out_w + 2 * border, out_h + 2 * border),
                    destination: Rect::new(x, y, out_w, out_h),
                });
            }
        }

        Ok(Self {
            rows,
            columns,
            border,
            width,
            height,
            tiles,
        })
    }

    /// A single tile covering the whole padded image.
    pub fn single(width: usize, height: usize, border: usize) -> Self {
        Self {
            rows: 1,
            columns: 1,
            border,
            width,
            height,
            tiles: vec![Tile {
                row: 0,
                column: 0,
                source: Rect::new(0, 0, width + 2 * border, height + 2 * border),
                destination: Rect::new(0, 0, width, height),
            }],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn border(&self) -> usize {
        self.border
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Output dimensions `(width, height)`.
    pub fn output_dims(&self) -> (usize, usize) {
        (self.width, self.height)
    }
}

/// Run `model` over `input` tile by tile and stitch the results.
///
/// Up to `pool.capacity()` tiles run concurrently, each on a backend
/// borrowed from `pool`. The first failing tile fails the call.
pub fn run_tiled<B>(
    input: &Plane,
    model: &Model,
    grid: &TileGrid,
    pool: &BackendPool<B>,
) -> Result<Plane>
where
    B: ComputeBackend + Send,
{
    if input.dims() != grid.output_dims() {
        return Err(ConvertError::InvalidPlane(format!(
            "input is {}x{} but the tile grid was planned for {}x{}",
            input.width(),
            input.height(),
            grid.width,
            grid.height
        )));
    }
    let border = grid.border();
    let padded = input.pad_replicate(border);
    let (width, height) = input.dims();

    if grid.len() == 1 {
        let tile = grid.tiles()[0];
        let mut backend = pool.acquire()?;
        let result = run_pipeline(&mut *backend, model, &padded.crop(tile.source))?;
        return Ok(result.crop(Rect::new(border, border, width, height)));
    }

    let workers = pool.capacity().clamp(1, grid.len());
    info!(
        target: "w2x::core",
        "Splitting {width}x{height} into {} x {} tiles on {workers} workers",
        grid.rows(),
        grid.columns()
    );

    let threads = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|index| format!("w2x-tile-{index}"))
        .build()
        .map_err(|e| ConvertError::backend(anyhow!(e).context("failed to start tile workers")))?;

    let outputs: Vec<(Rect, Plane)> = threads.install(|| {
        grid.tiles()
            .par_iter()
            .map(|tile| -> Result<(Rect, Plane)> {
                let _guard = timing_guard(
                    format!("tile ({}, {})", tile.row, tile.column),
                    Level::Debug,
                );
                let mut backend = pool.acquire()?;
                let result = run_pipeline(&mut *backend, model, &padded.crop(tile.source))?;
                debug!(
                    target: "w2x::core",
                    "tile ({}, {}) done: {}x{} at ({}, {})",
                    tile.row,
                    tile.column,
                    tile.destination.width,
                    tile.destination.height,
                    tile.destination.x,
                    tile.destination.y
                );
                let inner = Rect::new(
                    border,
                    border,
                    tile.destination.width,
                    tile.destination.height,
                );
                Ok((tile.destination, result.crop(inner)))
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut output = Plane::new(width, height);
    for (destination, plane) in &outputs {
        output.blit(plane, destination.x, destination.y);
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::CpuBackendFactory,
        converter::{ConvertOptions, convert},
        model::Layer,
    };

    #[test]
    fn split_decision_uses_area() {
        let budget = TileBudget::new(10, 10);
        assert!(!should_split(10, 10, budget));
        assert!(!should_split(20, 5, budget));
        assert!(should_split(11, 10, budget));
    }

    #[test]
    fn huge_budget_never_splits() {
        let budget = TileBudget::from_exp2(40).expect("budget");
        assert_eq!(budget.area(), 1u128 << 80);
        assert!(!should_split(usize::MAX, 2, budget));
        assert!(should_split(usize::MAX, usize::MAX, TileBudget::square(1 << 20)));

        let layer = Layer::new(1, 1, 3, vec![Plane::filled(3, 3, 1.0 / 9.0)], vec![0.0])
            .expect("layer");
        let model = Model::from_layers(vec![layer]).expect("model");
        let options = ConvertOptions {
            tile_budget: budget,
            use_tiling: true,
            jobs: 1,
        };
        let output = convert(
            &Plane::filled(8, 8, 1.0),
            &model,
            &options,
            &CpuBackendFactory::default(),
        )
        .expect("convert");
        assert_eq!(output.dims(), (8, 8));
        assert!(output.data().iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn split_count_example() {
        assert_eq!(split_count(1000, 300, 7).expect("count"), 4);
        assert_eq!(split_count(286, 300, 7).expect("count"), 1);
        assert_eq!(split_count(287, 300, 7).expect("count"), 2);
        assert!(matches!(
            split_count(100, 14, 7),
            Err(ConvertError::InvalidTileBudget { border: 7, .. })
        ));
    }

    #[test]
    fn exp2_budget() {
        assert_eq!(TileBudget::from_exp2(9), Some(TileBudget::square(512)));
        assert_eq!(TileBudget::from_exp2(200), None);
    }

    #[test]
    fn tiles_cover_every_output_pixel_once() {
        let (width, height, border) = (1000, 333, 7);
        let grid = TileGrid::plan(width, height, TileBudget::new(300, 128), border).expect("plan");
        assert_eq!(grid.columns(), split_count(width, 300, border).expect("cols"));
        assert_eq!(grid.rows(), split_count(height, 128, border).expect("rows"));

        let mut hits = vec![0u8; width * height];
        for tile in grid.tiles() {
            let d = tile.destination;
            assert_eq!(tile.source.width, d.width + 2 * border);
            assert_eq!(tile.source.height, d.height + 2 * border);
            assert!(tile.source.right() <= width + 2 * border);
            assert!(tile.source.bottom() <= height + 2 * border);
            for y in d.y..d.bottom() {
                for x in d.x..d.right() {
                    hits[y * width + x] += 1;
                }
            }
        }
        assert!(hits.iter().all(|&h| h == 1));
    }

    #[test]
    fn last_tiles_reach_the_padded_edge() {
        let border = 3;
        let grid = TileGrid::plan(50, 20, TileBudget::new(16, 16), border).expect("plan");
        let last = grid.tiles().last().expect("tiles");
        assert_eq!(last.source.right(), 50 + 2 * border);
        assert_eq!(last.source.bottom(), 20 + 2 * border);
        assert!(grid.tiles().iter().all(|t| t.source.width <= 16));
    }

    #[test]
    fn budget_without_usable_area_is_rejected() {
        let err = TileGrid::plan(64, 64, TileBudget::new(14, 100), 7).unwrap_err();
        assert!(matches!(
            err,
            ConvertError::InvalidTileBudget {
                width: 14,
                height: 100,
                border: 7
            }
        ));
    }
}

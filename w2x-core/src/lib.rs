//! Tiled convolutional super-resolution engine.
//!
//! A [`Model`] is a stack of small convolution layers with leaky ReLU
//! activations. [`convert`] runs one plane through it: the plane is padded,
//! split into overlapping tiles that each fit a [`TileBudget`], pushed
//! through the layers on a [`ComputeBackend`] (CPU or wgpu), and stitched
//! back together without seams.

/// Compute backend contract, CPU reference backend and backend pool.
pub mod backend;
/// Conversion entry point and options.
pub mod converter;
/// Error kinds returned by every fallible engine call.
pub mod error;
/// wgpu compute backend.
pub mod gpu;
/// Layer and model formats (JSON, binary).
pub mod model;
/// Per-tile layer executor with double-buffered activations.
pub mod pipeline;
/// Row-major `f32` planes and rectangle helpers.
pub mod plane;
/// Tile planning and parallel tile execution.
pub mod tiling;

pub use backend::{
    BackendFactory, BackendGuard, BackendPool, ComputeBackend, CpuBackend, CpuBackendFactory,
    DEFAULT_MAX_PLANES, NEGATIVE_SLOPE, leaky_relu,
};
pub use converter::{ConvertOptions, Converter, convert};
pub use error::{ConvertError, Result};
pub use gpu::{WgpuBackend, WgpuBackendFactory};
pub use model::{Layer, Model, ModelId};
pub use pipeline::{ActivationBuffers, run_pipeline, run_planes};
pub use plane::{Plane, Rect};
pub use tiling::{TileBudget, TileGrid, should_split, split_count};

/// Returns the crate version for diagnostics.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

//! wgpu realization of the compute backend.
//!
//! Each layer is a single WGSL dispatch over a plane-major storage buffer.
//! Activation slots come from a best-fit buffer pool shared by every backend
//! a [`WgpuBackendFactory`] creates.

pub mod conv2d;
pub mod memory;
pub mod runtime;
pub mod tensor;
mod utils;

pub use conv2d::{ConvolvePipeline, LayerWeights};
pub use memory::{BufferKind, DEFAULT_IDLE_BUDGET, GpuBufferPool};
pub use runtime::{WgpuBackend, WgpuBackendFactory};
pub use tensor::GpuPlaneStack;

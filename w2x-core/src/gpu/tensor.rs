use anyhow::{Context, Result};
use bytemuck::cast_slice;
use std::{fmt, sync::Arc};
use w2x_utils::gpu::GpuContext;

use super::{
    memory::{BufferKind, GpuBufferPool},
    utils::read_buffer,
};
use crate::plane::Plane;

/// A stack of equally sized `f32` planes in one GPU storage buffer,
/// plane-major (`plane * width * height + y * width + x`).
///
/// The buffer goes back to its pool when the stack is dropped.
pub struct GpuPlaneStack {
    context: Arc<GpuContext>,
    pool: Arc<GpuBufferPool>,
    buffer: wgpu::Buffer,
    width: usize,
    height: usize,
    planes: usize,
    size_bytes: u64,
}

impl GpuPlaneStack {
    /// Allocate storage for `planes` planes; contents are undefined.
    pub fn allocate(
        context: Arc<GpuContext>,
        pool: Arc<GpuBufferPool>,
        width: usize,
        height: usize,
        planes: usize,
        label: Option<&str>,
    ) -> Result<Self> {
        anyhow::ensure!(
            width > 0 && height > 0 && planes > 0,
            "plane stack must be non-empty (got {planes} x {width}x{height})"
        );
        let elements = width
            .checked_mul(height)
            .and_then(|n| n.checked_mul(planes))
            .context("plane stack size overflows usize")?;
        let size_bytes = (elements * std::mem::size_of::<f32>()) as u64;
        let buffer = pool.acquire(size_bytes, BufferKind::Activation, label)?;
        Ok(Self {
            context,
            pool,
            buffer,
            width,
            height,
            planes,
            size_bytes,
        })
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Number of planes the stack can hold.
    pub fn capacity(&self) -> usize {
        self.planes
    }

    fn plane_bytes(&self) -> u64 {
        (self.width * self.height * std::mem::size_of::<f32>()) as u64
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// Upload `planes` into the first `planes.len()` entries.
    pub fn write_planes(&self, planes: &[Plane]) -> Result<()> {
        anyhow::ensure!(
            planes.len() <= self.planes,
            "cannot write {} planes into a stack of {}",
            planes.len(),
            self.planes
        );
        let queue = self.context.queue();
        for (index, plane) in planes.iter().enumerate() {
            anyhow::ensure!(
                plane.dims() == self.dims(),
                "plane {index} is {}x{}, stack is {}x{}",
                plane.width(),
                plane.height(),
                self.width,
                self.height
            );
            let offset = index as u64 * self.plane_bytes();
            queue.write_buffer(self.buffer(), offset, cast_slice(plane.data()));
        }
        Ok(())
    }

    /// Copy plane `index` back to the host.
    pub fn read_plane(&self, index: usize) -> Result<Plane> {
        anyhow::ensure!(
            index < self.planes,
            "plane {index} out of range for a stack of {}",
            self.planes
        );
        let device = self.context.device();
        let plane_bytes = self.plane_bytes();
        let readback =
            self.pool
                .acquire(plane_bytes, BufferKind::Readback, Some("w2x_plane_readback"))?;

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("w2x_plane_readback_encoder"),
        });
        encoder.copy_buffer_to_buffer(
            self.buffer(),
            index as u64 * plane_bytes,
            &readback,
            0,
            plane_bytes,
        );
        self.context.queue().submit(Some(encoder.finish()));

        let result = read_buffer(
            device,
            &readback,
            self.width * self.height,
            "plane readback",
        );
        self.pool.recycle(readback, plane_bytes, BufferKind::Readback);

        Plane::from_vec(self.width, self.height, result?).map_err(anyhow::Error::from)
    }
}

impl Drop for GpuPlaneStack {
    fn drop(&mut self) {
        self.pool
            .recycle(self.buffer.clone(), self.size_bytes, BufferKind::Activation);
    }
}

impl fmt::Debug for GpuPlaneStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuPlaneStack")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("planes", &self.planes)
            .finish()
    }
}

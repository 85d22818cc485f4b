//! Compute backend contract, the CPU reference backend, and the worker pool
//! that hands exclusive backends to tile workers.

use std::{
    fmt,
    num::NonZeroUsize,
    ops::{Deref, DerefMut},
};

use anyhow::anyhow;
use async_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use log::debug;
use rayon::prelude::*;

use crate::{
    error::{ConvertError, Result},
    model::{Layer, Model},
    plane::Plane,
};

/// Slope applied to negative activations.
pub const NEGATIVE_SLOPE: f32 = 0.1;
/// Plane bound of the shipped backends.
pub const DEFAULT_MAX_PLANES: usize = 128;

/// Leaky rectified linear unit with [`NEGATIVE_SLOPE`].
#[inline]
pub fn leaky_relu(value: f32) -> f32 {
    if value >= 0.0 {
        value
    } else {
        NEGATIVE_SLOPE * value
    }
}

/// Executes convolution layers over stacks of equally sized planes.
///
/// A backend owns its slots; each worker drives its own backend so no
/// synchronization happens inside an implementation.
pub trait ComputeBackend {
    /// Storage for a stack of planes (host memory, GPU buffer, ...).
    type Slot;

    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Largest number of planes a slot may hold.
    fn max_planes(&self) -> usize;

    /// Make per-model state (uploaded weights) ready. Called before every run.
    fn prepare(&mut self, _model: &Model) -> Result<()> {
        Ok(())
    }

    /// Allocate a slot for `planes` planes of `width × height`.
    fn allocate(&mut self, width: usize, height: usize, planes: usize) -> Result<Self::Slot>;

    /// Copy `planes` into the first `planes.len()` entries of `slot`.
    fn upload(&mut self, slot: &mut Self::Slot, planes: &[Plane]) -> Result<()>;

    /// Run one layer (correlation, bias, leaky ReLU) from `input` into `output`.
    ///
    /// Taps that fall outside the plane are clamped to its edge.
    fn convolve(
        &mut self,
        layer_index: usize,
        layer: &Layer,
        input: &Self::Slot,
        output: &mut Self::Slot,
    ) -> Result<()>;

    /// Read plane 0 of `slot` back to the host.
    fn download(&mut self, slot: &Self::Slot) -> Result<Plane>;
}

/// Creates fresh backends for worker threads.
pub trait BackendFactory: Send + Sync {
    type Backend: ComputeBackend + Send;

    fn name(&self) -> &'static str;

    fn create(&self) -> Result<Self::Backend>;
}

/// Host-memory plane stack used by [`CpuBackend`].
#[derive(Debug, Clone)]
pub struct CpuSlot {
    width: usize,
    height: usize,
    planes: Vec<Plane>,
}

impl CpuSlot {
    pub fn dims(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn capacity(&self) -> usize {
        self.planes.len()
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }
}

/// Reference backend: straightforward loops, parallel over output planes with rayon.
#[derive(Debug, Clone)]
pub struct CpuBackend {
    max_planes: usize,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PLANES)
    }
}

impl CpuBackend {
    pub fn new(max_planes: usize) -> Self {
        Self {
            max_planes: max_planes.max(1),
        }
    }
}

impl ComputeBackend for CpuBackend {
    type Slot = CpuSlot;

    fn name(&self) -> &'static str {
        "cpu"
    }

    fn max_planes(&self) -> usize {
        self.max_planes
    }

    fn allocate(&mut self, width: usize, height: usize, planes: usize) -> Result<CpuSlot> {
        if planes > self.max_planes {
            return Err(ConvertError::backend(anyhow!(
                "slot of {planes} planes exceeds the CPU bound of {}",
                self.max_planes
            )));
        }
        Ok(CpuSlot {
            width,
            height,
            planes: vec![Plane::new(width, height); planes],
        })
    }

    fn upload(&mut self, slot: &mut CpuSlot, planes: &[Plane]) -> Result<()> {
        if planes.len() > slot.planes.len() {
            return Err(ConvertError::backend(anyhow!(
                "cannot upload {} planes into a slot of {}",
                planes.len(),
                slot.planes.len()
            )));
        }
        for (dst, src) in slot.planes.iter_mut().zip(planes) {
            if src.dims() != (slot.width, slot.height) {
                return Err(ConvertError::InvalidPlane(format!(
                    "plane is {}x{}, slot is {}x{}",
                    src.width(),
                    src.height(),
                    slot.width,
                    slot.height
                )));
            }
            dst.data_mut().copy_from_slice(src.data());
        }
        Ok(())
    }

    fn convolve(
        &mut self,
        layer_index: usize,
        layer: &Layer,
        input: &CpuSlot,
        output: &mut CpuSlot,
    ) -> Result<()> {
        let n_in = layer.n_input_planes();
        let n_out = layer.n_output_planes();
        if n_in > input.planes.len() || n_out > output.planes.len() {
            return Err(ConvertError::backend(anyhow!(
                "layer {layer_index} ({n_in} -> {n_out}) does not fit slots of {} and {}",
                input.planes.len(),
                output.planes.len()
            )));
        }
        if input.dims() != output.dims() {
            return Err(ConvertError::backend(anyhow!(
                "layer {layer_index}: input slot {:?} and output slot {:?} differ",
                input.dims(),
                output.dims()
            )));
        }

        let sources = &input.planes[..n_in];
        output.planes[..n_out]
            .par_iter_mut()
            .enumerate()
            .for_each(|(o, dst)| convolve_plane(layer, o, sources, dst));
        Ok(())
    }

    fn download(&mut self, slot: &CpuSlot) -> Result<Plane> {
        slot.planes
            .first()
            .cloned()
            .ok_or_else(|| ConvertError::backend(anyhow!("cannot download from an empty slot")))
    }
}

fn convolve_plane(layer: &Layer, output: usize, sources: &[Plane], dst: &mut Plane) {
    let (width, height) = dst.dims();
    let k = layer.kernel_size();
    let radius = layer.radius() as isize;
    let bias = layer.biases()[output] as f32;
    let max_x = width as isize - 1;
    let max_y = height as isize - 1;

    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.0f32;
            for (input, src) in sources.iter().enumerate() {
                let kernel = layer.weight(output, input);
                for ky in 0..k {
                    let sy = (y as isize + ky as isize - radius).clamp(0, max_y) as usize;
                    let row = src.row(sy);
                    let taps = kernel.row(ky);
                    for (kx, tap) in taps.iter().enumerate() {
                        let sx = (x as isize + kx as isize - radius).clamp(0, max_x) as usize;
                        acc += tap * row[sx];
                    }
                }
            }
            dst.set(x, y, leaky_relu(acc + bias));
        }
    }
}

/// Builds [`CpuBackend`]s with a shared plane bound.
#[derive(Debug, Clone)]
pub struct CpuBackendFactory {
    max_planes: usize,
}

impl Default for CpuBackendFactory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PLANES)
    }
}

impl CpuBackendFactory {
    pub fn new(max_planes: usize) -> Self {
        Self { max_planes }
    }
}

impl BackendFactory for CpuBackendFactory {
    type Backend = CpuBackend;

    fn name(&self) -> &'static str {
        "cpu"
    }

    fn create(&self) -> Result<CpuBackend> {
        Ok(CpuBackend::new(self.max_planes))
    }
}

/// Bounded pool of backends shared by tile workers.
///
/// Each acquisition hands out exclusive ownership of one backend; the guard
/// returns it when dropped.
pub struct BackendPool<B> {
    size: NonZeroUsize,
    sender: Sender<B>,
    receiver: Receiver<B>,
}

impl<B: ComputeBackend + Send> BackendPool<B> {
    /// Create `size` backends up front.
    pub fn new<F>(factory: &F, size: NonZeroUsize) -> Result<Self>
    where
        F: BackendFactory<Backend = B> + ?Sized,
    {
        let (sender, receiver) = bounded(size.get());
        for _ in 0..size.get() {
            sender
                .try_send(factory.create()?)
                .map_err(|_| pool_closed())?;
        }
        debug!(
            target: "w2x::core",
            "Backend pool ready: {} x {}",
            size,
            factory.name()
        );
        Ok(Self {
            size,
            sender,
            receiver,
        })
    }

    /// Block until a backend is free.
    pub fn acquire(&self) -> Result<BackendGuard<B>> {
        let backend = self.receiver.recv_blocking().map_err(|_| pool_closed())?;
        Ok(BackendGuard::new(backend, &self.sender))
    }

    /// `None` when every backend is currently borrowed.
    pub fn try_acquire(&self) -> Result<Option<BackendGuard<B>>> {
        match self.receiver.try_recv() {
            Ok(backend) => Ok(Some(BackendGuard::new(backend, &self.sender))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Closed) => Err(pool_closed()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.size.get()
    }

    /// Backends currently idle in the pool.
    pub fn available(&self) -> usize {
        self.receiver.len()
    }
}

impl<B> fmt::Debug for BackendPool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendPool")
            .field("capacity", &self.size.get())
            .field("available", &self.receiver.len())
            .finish()
    }
}

fn pool_closed() -> ConvertError {
    ConvertError::backend(anyhow!("backend pool has been closed"))
}

/// RAII guard for a backend borrowed from a [`BackendPool`].
pub struct BackendGuard<B> {
    backend: Option<B>,
    sender: Sender<B>,
}

impl<B> BackendGuard<B> {
    fn new(backend: B, sender: &Sender<B>) -> Self {
        Self {
            backend: Some(backend),
            sender: sender.clone(),
        }
    }
}

impl<B> Deref for BackendGuard<B> {
    type Target = B;

    fn deref(&self) -> &B {
        self.backend
            .as_ref()
            .expect("backend guard should always hold a backend")
    }
}

impl<B> DerefMut for BackendGuard<B> {
    fn deref_mut(&mut self) -> &mut B {
        self.backend
            .as_mut()
            .expect("backend guard should always hold a backend")
    }
}

impl<B> Drop for BackendGuard<B> {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.take()
            && let Err(err) = self.sender.try_send(backend)
        {
            match err {
                TrySendError::Full(backend) => {
                    if self.sender.send_blocking(backend).is_err() {
                        debug!(target: "w2x::core", "Backend pool closed while returning guard.");
                    }
                }
                TrySendError::Closed(_) => {
                    debug!(target: "w2x::core", "Backend pool closed; dropping backend.")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_layer(kernel: Vec<f32>, k: usize, bias: f64) -> Layer {
        let weights = vec![Plane::from_vec(k, k, kernel).expect("kernel")];
        Layer::new(1, 1, k, weights, vec![bias]).expect("layer")
    }

    fn run_layer(layer: &Layer, input: &Plane) -> Plane {
        let mut backend = CpuBackend::default();
        let (w, h) = input.dims();
        let mut src = backend
            .allocate(w, h, layer.n_input_planes())
            .expect("src");
        let mut dst = backend
            .allocate(w, h, layer.n_output_planes())
            .expect("dst");
        backend
            .upload(&mut src, std::slice::from_ref(input))
            .expect("upload");
        backend.convolve(0, layer, &src, &mut dst).expect("convolve");
        backend.download(&dst).expect("download")
    }

    #[test]
    fn leaky_relu_boundaries() {
        assert_eq!(leaky_relu(0.0), 0.0);
        assert_eq!(leaky_relu(-1.0), -0.1);
        assert_eq!(leaky_relu(2.0), 2.0);
    }

    #[test]
    fn box_filter_clamps_at_edges() {
        let layer = single_layer(vec![1.0; 9], 3, 0.0);
        let input = Plane::from_fn(3, 3, |x, y| (y * 3 + x) as f32);
        let out = run_layer(&layer, &input);

        // Corner (0,0) reads rows and columns {0, 0, 1} after clamping.
        assert_eq!(out.get(0, 0), 1.0 + 1.0 + 10.0);
        assert_eq!(out.get(1, 1), 36.0);
    }

    #[test]
    fn kernel_is_correlation_not_convolution() {
        // Only the right-hand tap is set: output(x) = input(x + 1).
        let mut kernel = vec![0.0; 9];
        kernel[5] = 1.0;
        let layer = single_layer(kernel, 3, 0.0);
        let input = Plane::from_fn(4, 1, |x, _| x as f32);
        let out = run_layer(&layer, &input);
        assert_eq!(out.data(), &[1.0, 2.0, 3.0, 3.0]);
    }

    #[test]
    fn bias_and_activation_are_applied() {
        let layer = single_layer(vec![1.0], 1, -3.0);
        let input = Plane::from_vec(2, 1, vec![1.0, 5.0]).expect("plane");
        let out = run_layer(&layer, &input);
        assert!((out.get(0, 0) - (-0.2)).abs() < 1e-6);
        assert_eq!(out.get(1, 0), 2.0);
    }

    #[test]
    fn allocation_above_bound_fails() {
        let mut backend = CpuBackend::new(4);
        let slot = backend.allocate(3, 2, 4).expect("slot");
        assert_eq!(slot.capacity(), 4);
        assert_eq!(slot.dims(), (3, 2));
        assert!(slot.planes().iter().all(|p| p.data().iter().all(|&v| v == 0.0)));
        assert!(matches!(
            backend.allocate(2, 2, 5),
            Err(ConvertError::Backend(_))
        ));
    }

    #[test]
    fn pool_returns_backends_on_drop() {
        let pool = BackendPool::new(
            &CpuBackendFactory::default(),
            NonZeroUsize::new(2).expect("non-zero"),
        )
        .expect("pool");
        assert_eq!(pool.capacity(), 2);
        {
            let first = pool.acquire().expect("first");
            let _second = pool.acquire().expect("second");
            assert_eq!(first.name(), "cpu");
            assert_eq!(pool.available(), 0);
            assert!(pool.try_acquire().expect("try").is_none());
        }
        assert_eq!(pool.available(), 2);
    }
}

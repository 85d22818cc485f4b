//! Layer pipeline executor: drives one tile through the whole model.
//!
//! Activations ping-pong between two slots regardless of depth: layer `i`
//! reads slot `i % 2` and writes slot `(i + 1) % 2`.

use anyhow::anyhow;
use log::{Level, trace};
use w2x_utils::telemetry::timing_guard;

use crate::{
    backend::ComputeBackend,
    error::{ConvertError, Result},
    model::Model,
    plane::Plane,
};

/// Two interchangeable activation slots indexed by layer parity.
#[derive(Debug)]
pub struct ActivationBuffers<T> {
    slots: [T; 2],
}

impl<T> ActivationBuffers<T> {
    pub fn new(first: T, second: T) -> Self {
        Self {
            slots: [first, second],
        }
    }

    /// Slot read by layer `layer_index`, or holding the result after `layer_index` layers.
    pub fn slot(&self, layer_index: usize) -> &T {
        &self.slots[layer_index % 2]
    }

    pub fn slot_mut(&mut self, layer_index: usize) -> &mut T {
        &mut self.slots[layer_index % 2]
    }

    /// `(source, destination)` for layer `layer_index`.
    pub fn split(&mut self, layer_index: usize) -> (&T, &mut T) {
        let [even, odd] = &mut self.slots;
        if layer_index % 2 == 0 {
            (&*even, odd)
        } else {
            (&*odd, even)
        }
    }
}

/// Run a single-plane input through every layer of `model`.
pub fn run_pipeline<B>(backend: &mut B, model: &Model, input: &Plane) -> Result<Plane>
where
    B: ComputeBackend + ?Sized,
{
    run_planes(backend, model, std::slice::from_ref(input))
}

/// Run a stack of input planes through every layer of `model`.
///
/// Plane counts and backend bounds are checked before anything is allocated
/// or dispatched.
pub fn run_planes<B>(backend: &mut B, model: &Model, inputs: &[Plane]) -> Result<Plane>
where
    B: ComputeBackend + ?Sized,
{
    check_plane_counts(model, inputs.len())?;
    let Some(first) = inputs.first() else {
        return Err(ConvertError::InvalidPlane("no input planes".into()));
    };
    let (width, height) = first.dims();
    if first.is_empty() {
        return Err(ConvertError::InvalidPlane(format!(
            "input plane is empty ({width}x{height})"
        )));
    }
    if let Some(other) = inputs.iter().find(|p| p.dims() != (width, height)) {
        return Err(ConvertError::InvalidPlane(format!(
            "input planes differ in size: {width}x{height} vs {}x{}",
            other.width(),
            other.height()
        )));
    }

    let bound = backend.max_planes();
    for (index, layer) in model.layers().iter().enumerate() {
        let widest = layer.n_input_planes().max(layer.n_output_planes());
        if widest > bound {
            return Err(ConvertError::backend(anyhow!(
                "layer {index} needs {widest} planes but the {} backend holds at most {bound}",
                backend.name()
            )));
        }
    }

    backend.prepare(model)?;
    let planes = model.max_planes();
    let mut buffers = ActivationBuffers::new(
        backend.allocate(width, height, planes)?,
        backend.allocate(width, height, planes)?,
    );
    backend.upload(buffers.slot_mut(0), inputs)?;

    for (index, layer) in model.layers().iter().enumerate() {
        let _guard = timing_guard(format!("layer {index}"), Level::Trace);
        trace!(
            target: "w2x::core",
            "layer {index}: {} -> {} planes on {width}x{height}",
            layer.n_input_planes(),
            layer.n_output_planes()
        );
        let (source, destination) = buffers.split(index);
        backend.convolve(index, layer, source, destination)?;
    }

    backend.download(buffers.slot(model.len()))
}

fn check_plane_counts(model: &Model, supplied: usize) -> Result<()> {
    let expected = model.input_planes();
    if supplied != expected {
        return Err(ConvertError::PlaneCountMismatch {
            expected,
            actual: supplied,
        });
    }
    let produced = model.output_planes();
    if produced != 1 {
        return Err(ConvertError::PlaneCountMismatch {
            expected: 1,
            actual: produced,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{CpuBackend, CpuSlot},
        model::Layer,
    };

    fn identity_layer(n_in: usize, n_out: usize) -> Layer {
        let weights = (0..n_in * n_out)
            .map(|n| {
                let (o, i) = (n / n_in, n % n_in);
                Plane::filled(1, 1, if o == i { 1.0 } else { 0.0 })
            })
            .collect();
        Layer::new(n_in, n_out, 1, weights, vec![0.0; n_out]).expect("layer")
    }

    #[test]
    fn split_alternates_by_parity() {
        let mut buffers = ActivationBuffers::new('a', 'b');
        assert_eq!(buffers.split(0), (&'a', &mut 'b'));
        assert_eq!(buffers.split(1), (&'b', &mut 'a'));
        assert_eq!(buffers.split(4), (&'a', &mut 'b'));
        assert_eq!(*buffers.slot(3), 'b');
    }

    #[test]
    fn three_identity_layers_preserve_constant_plane() {
        let model = Model::from_layers(vec![identity_layer(1, 1); 3]).expect("model");
        let input = Plane::filled(4, 4, 5.0);
        let output = run_pipeline(&mut CpuBackend::default(), &model, &input).expect("run");
        assert_eq!(output, input);
    }

    #[test]
    fn wide_intermediate_layers_round_trip() {
        let model =
            Model::from_layers(vec![identity_layer(1, 4), identity_layer(4, 4), identity_layer(4, 1)])
                .expect("model");
        let input = Plane::from_fn(5, 3, |x, y| (x + y) as f32);
        let output = run_pipeline(&mut CpuBackend::default(), &model, &input).expect("run");
        assert_eq!(output, input);
    }

    #[test]
    fn plane_count_mismatches_are_reported() {
        let model = Model::from_layers(vec![identity_layer(2, 1)]).expect("model");
        let err = run_pipeline(&mut CpuBackend::default(), &model, &Plane::new(2, 2)).unwrap_err();
        assert!(matches!(
            err,
            ConvertError::PlaneCountMismatch {
                expected: 2,
                actual: 1
            }
        ));

        let model = Model::from_layers(vec![identity_layer(1, 2)]).expect("model");
        let err = run_pipeline(&mut CpuBackend::default(), &model, &Plane::new(2, 2)).unwrap_err();
        assert!(matches!(
            err,
            ConvertError::PlaneCountMismatch {
                expected: 1,
                actual: 2
            }
        ));
    }

    /// Counts dispatches so the bound check can be shown to run first.
    struct CountingBackend {
        inner: CpuBackend,
        dispatches: usize,
    }

    impl ComputeBackend for CountingBackend {
        type Slot = CpuSlot;

        fn name(&self) -> &'static str {
            "counting"
        }

        fn max_planes(&self) -> usize {
            self.inner.max_planes()
        }

        fn allocate(&mut self, width: usize, height: usize, planes: usize) -> Result<CpuSlot> {
            self.inner.allocate(width, height, planes)
        }

        fn upload(&mut self, slot: &mut CpuSlot, planes: &[Plane]) -> Result<()> {
            self.inner.upload(slot, planes)
        }

        fn convolve(
            &mut self,
            layer_index: usize,
            layer: &Layer,
            input: &CpuSlot,
            output: &mut CpuSlot,
        ) -> Result<()> {
            self.dispatches += 1;
            self.inner.convolve(layer_index, layer, input, output)
        }

        fn download(&mut self, slot: &CpuSlot) -> Result<Plane> {
            self.inner.download(slot)
        }
    }

    #[test]
    fn oversized_layer_fails_before_dispatch() {
        let model =
            Model::from_layers(vec![identity_layer(1, 8), identity_layer(8, 1)]).expect("model");
        let mut backend = CountingBackend {
            inner: CpuBackend::new(4),
            dispatches: 0,
        };
        let err = run_pipeline(&mut backend, &model, &Plane::new(3, 3)).unwrap_err();
        assert!(matches!(err, ConvertError::Backend(_)));
        assert_eq!(backend.dispatches, 0);
    }
}

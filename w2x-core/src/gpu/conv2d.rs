use super::tensor::GpuPlaneStack;
use super::utils::{bind_buffers, compute_layout_entries, init_buffer, workgroups};
use crate::{backend::NEGATIVE_SLOPE, model::Layer};

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable, bytes_of, cast_slice};
use w2x_utils::gpu::GpuContext;

const CONV2D_WGSL: &str = include_str!("conv2d.wgsl");
const CONV_WORKGROUP_X: u32 = 8;
const CONV_WORKGROUP_Y: u32 = 8;
/// src, weights, biases (read-only) and dst (read-write); params follow as a uniform.
const STORAGE_BINDINGS: [bool; 4] = [true, true, true, false];

/// Compiled convolution + bias + leaky ReLU shader, shared by every backend on a device.
#[derive(Debug)]
pub struct ConvolvePipeline {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

impl ConvolvePipeline {
    pub fn new(device: &wgpu::Device) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("w2x_conv2d_shader"),
            source: wgpu::ShaderSource::Wgsl(CONV2D_WGSL.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("w2x_conv2d_bgl"),
            entries: &compute_layout_entries(&STORAGE_BINDINGS),
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("w2x_conv2d_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("w2x_conv2d_pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        Self {
            pipeline,
            bind_group_layout,
        }
    }

    /// Record and submit one layer from `input` into `output`.
    pub fn execute(
        &self,
        context: &GpuContext,
        weights: &LayerWeights,
        input: &GpuPlaneStack,
        output: &GpuPlaneStack,
    ) -> Result<()> {
        anyhow::ensure!(
            input.dims() == output.dims(),
            "input stack {:?} and output stack {:?} differ",
            input.dims(),
            output.dims()
        );
        anyhow::ensure!(
            weights.input_planes as usize <= input.capacity()
                && weights.output_planes as usize <= output.capacity(),
            "layer {} -> {} does not fit stacks of {} and {}",
            weights.input_planes,
            weights.output_planes,
            input.capacity(),
            output.capacity()
        );
        let max_z = context.limits().max_compute_workgroups_per_dimension;
        anyhow::ensure!(
            weights.output_planes <= max_z,
            "{} output planes exceed the dispatch limit of {max_z}",
            weights.output_planes
        );

        let (width, height) = input.dims();
        let uniforms = ConvolveUniforms {
            width: u32::try_from(width).context("tile width exceeds u32")?,
            height: u32::try_from(height).context("tile height exceeds u32")?,
            input_planes: weights.input_planes,
            output_planes: weights.output_planes,
            kernel_size: weights.kernel_size,
            negative_slope: NEGATIVE_SLOPE,
            _pad: [0; 2],
        };

        let device = context.device();
        let uniform_buffer = init_buffer(
            device,
            "w2x_conv2d_uniforms",
            bytes_of(&uniforms),
            wgpu::BufferUsages::UNIFORM,
        );
        let bind_group = bind_buffers(
            device,
            &self.bind_group_layout,
            "w2x_conv2d_bg",
            &[
                input.buffer(),
                &weights.weights,
                &weights.biases,
                output.buffer(),
                &uniform_buffer,
            ],
        );

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("w2x_conv2d_encoder"),
        });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("w2x_conv2d_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                workgroups(uniforms.width, CONV_WORKGROUP_X),
                workgroups(uniforms.height, CONV_WORKGROUP_Y),
                weights.output_planes,
            );
        }

        context.queue().submit(Some(encoder.finish()));
        Ok(())
    }
}

/// One layer's kernels and biases resident on the device.
#[derive(Debug)]
pub struct LayerWeights {
    weights: wgpu::Buffer,
    biases: wgpu::Buffer,
    input_planes: u32,
    output_planes: u32,
    kernel_size: u32,
}

impl LayerWeights {
    /// Upload kernels (output-major, row-major taps) and biases narrowed to `f32`.
    pub fn upload(device: &wgpu::Device, index: usize, layer: &Layer) -> Result<Self> {
        let taps: Vec<f32> = layer
            .weights()
            .iter()
            .flat_map(|kernel| kernel.data().iter().copied())
            .collect();
        let biases: Vec<f32> = layer.biases().iter().map(|&b| b as f32).collect();
        let storage = |name: &str, data: &[f32]| {
            init_buffer(
                device,
                &format!("w2x_layer{index}_{name}"),
                cast_slice(data),
                wgpu::BufferUsages::STORAGE,
            )
        };
        Ok(Self {
            weights: storage("weights", &taps),
            biases: storage("biases", &biases),
            input_planes: u32::try_from(layer.n_input_planes())?,
            output_planes: u32::try_from(layer.n_output_planes())?,
            kernel_size: u32::try_from(layer.kernel_size())?,
        })
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ConvolveUniforms {
    width: u32,
    height: u32,
    input_planes: u32,
    output_planes: u32,
    kernel_size: u32,
    negative_slope: f32,
    _pad: [u32; 2],
}

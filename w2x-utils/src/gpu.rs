//! GPU context management on top of `wgpu`.
//!
//! Device creation lives here so the CLI and the core tests share one code
//! path, and so a missing adapter degrades to the CPU backend instead of
//! failing the conversion.

use std::sync::Arc;

use log::{debug, info, warn};
use pollster::block_on;
use thiserror::Error;
use wgpu::{
    AdapterInfo, Backends, Device, DeviceDescriptor, ExperimentalFeatures, Features,
    Instance, InstanceDescriptor, InstanceFlags, Limits, MemoryHints, PowerPreference, Queue,
    RequestAdapterError, RequestAdapterOptions, RequestDeviceError, Trace,
};

/// Options used when creating a [`GpuContext`].
#[derive(Clone, Debug)]
pub struct GpuContextOptions {
    /// Whether GPU support is enabled at all.
    pub enabled: bool,
    /// Let `WGPU_BACKEND` and friends override the defaults below.
    pub respect_env: bool,
    /// Backends considered during adapter selection.
    pub backends: Backends,
    /// Instance flags (debug/validation toggles).
    pub flags: InstanceFlags,
    pub power_preference: PowerPreference,
    /// Force wgpu's software fallback adapter.
    pub force_fallback_adapter: bool,
    /// Limits to request. Defaults to the adapter's own limits, which is what
    /// lets large plane stacks fit in one storage binding.
    pub required_limits: Option<Limits>,
    /// Debug label for the logical device.
    pub label: Option<String>,
}

impl Default for GpuContextOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            respect_env: true,
            backends: Backends::PRIMARY,
            flags: InstanceFlags::from_build_config(),
            power_preference: PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            required_limits: None,
            label: Some("w2x GPU context".to_string()),
        }
    }
}

impl GpuContextOptions {
    /// Options that skip GPU setup entirely.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Outcome of [`GpuContext::init_with_fallback`].
#[derive(Debug)]
pub enum GpuAvailability {
    Available(Arc<GpuContext>),
    /// Turned off by configuration (`--no-gpu`, settings file).
    Disabled { reason: String },
    /// Initialization failed; callers should use the CPU backend.
    Unavailable { error: GpuInitError },
}

impl GpuAvailability {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    pub fn context(&self) -> Option<&Arc<GpuContext>> {
        match self {
            Self::Available(ctx) => Some(ctx),
            _ => None,
        }
    }
}

/// Device, queue and the adapter metadata they came from.
#[derive(Debug)]
pub struct GpuContext {
    device: Device,
    queue: Queue,
    adapter: AdapterInfo,
    limits: Limits,
}

impl GpuContext {
    /// Create a device on the best matching adapter.
    pub fn initialize(options: &GpuContextOptions) -> Result<Self, GpuInitError> {
        if !options.enabled {
            return Err(GpuInitError::Disabled);
        }

        let descriptor = instance_descriptor(options);
        let backends = descriptor.backends;
        let instance = Instance::new(&descriptor);
        let adapter = block_on(instance.request_adapter(&RequestAdapterOptions {
            power_preference: options.power_preference,
            force_fallback_adapter: options.force_fallback_adapter,
            compatible_surface: None,
        }))
        .map_err(|source| GpuInitError::Adapter { backends, source })?;

        let limits = match &options.required_limits {
            Some(limits) => limits.clone(),
            None => adapter.limits(),
        };
        let (device, queue) = block_on(adapter.request_device(&DeviceDescriptor {
            label: options.label.as_deref(),
            required_features: Features::empty(),
            required_limits: limits.clone(),
            experimental_features: ExperimentalFeatures::default(),
            memory_hints: MemoryHints::Performance,
            trace: Trace::default(),
        }))?;

        let context = Self {
            device,
            queue,
            adapter: adapter.get_info(),
            limits,
        };
        info!(
            target: "w2x::gpu",
            "Using GPU adapter '{}' ({:?}/{:?})",
            context.adapter.name, context.adapter.backend, context.adapter.device_type
        );
        debug!(
            target: "w2x::gpu",
            "storage binding limit {} bytes: {} planes of 512x512 per slot",
            context.limits.max_storage_buffer_binding_size,
            context.planes_per_binding(512, 512)
        );
        Ok(context)
    }

    /// Create a context, reporting instead of failing when no GPU is usable.
    pub fn init_with_fallback(options: &GpuContextOptions) -> GpuAvailability {
        match Self::initialize(options) {
            Ok(context) => GpuAvailability::Available(Arc::new(context)),
            Err(GpuInitError::Disabled) => GpuAvailability::Disabled {
                reason: "GPU acceleration disabled via configuration".to_string(),
            },
            Err(error) => {
                warn!(
                    target: "w2x::gpu",
                    "GPU initialization failed ({error}); falling back to CPU."
                );
                GpuAvailability::Unavailable { error }
            }
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn adapter_info(&self) -> &AdapterInfo {
        &self.adapter
    }

    /// Limits negotiated for this device.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Number of `width`×`height` `f32` planes one storage binding can hold.
    pub fn planes_per_binding(&self, width: usize, height: usize) -> usize {
        let plane_bytes = (width * height * std::mem::size_of::<f32>()).max(1) as u64;
        (u64::from(self.limits.max_storage_buffer_binding_size) / plane_bytes) as usize
    }
}

fn instance_descriptor(options: &GpuContextOptions) -> InstanceDescriptor {
    if options.respect_env {
        let mut descriptor = InstanceDescriptor::from_env_or_default();
        descriptor.backends = options.backends.with_env();
        descriptor.flags = options.flags.with_env();
        descriptor
    } else {
        InstanceDescriptor {
            backends: options.backends,
            flags: options.flags,
            ..InstanceDescriptor::default()
        }
    }
}

/// Reasons GPU setup did not produce a context.
#[derive(Debug, Error)]
pub enum GpuInitError {
    #[error("GPU adapter request failed for {backends:?}: {source}")]
    Adapter {
        backends: Backends,
        #[source]
        source: RequestAdapterError,
    },
    #[error("GPU device creation failed: {0}")]
    Device(#[from] RequestDeviceError),
    #[error("GPU acceleration disabled")]
    Disabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_options_skip_gpu_setup() {
        let options = GpuContextOptions::disabled();
        match GpuContext::init_with_fallback(&options) {
            GpuAvailability::Disabled { .. } => {}
            other => panic!("expected GPU to be disabled, got {other:?}"),
        }
    }

    #[test]
    fn initialize_rejects_disabled_options() {
        let err = GpuContext::initialize(&GpuContextOptions::disabled()).unwrap_err();
        assert!(matches!(err, GpuInitError::Disabled));
    }
}

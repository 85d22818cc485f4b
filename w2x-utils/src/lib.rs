//! Common helpers shared across the w2x crates.

/// YUV/RGB conversion between 8-bit images and float planes.
pub mod color;
/// Application configuration and settings management.
pub mod config;
/// Shared GPU context initialization.
pub mod gpu;
/// Image loading, resizing, and saving.
pub mod image_utils;
/// Instrumentation helpers for optional performance tracing.
pub mod telemetry;

use std::path::{Path, PathBuf};

use anyhow::Result;
use log::LevelFilter;

pub use color::{YuvPlanes, merge_yuv, split_yuv};
pub use config::{
    AppSettings, ConversionSettings, GpuSettings, TelemetryLevel, TelemetrySettings,
};
pub use gpu::{GpuAvailability, GpuContext, GpuContextOptions, GpuInitError};
pub use image_utils::{is_supported_image, load_image, save_image, upscale_image};
pub use telemetry::{
    TimingGuard, configure as configure_telemetry, telemetry_allows, telemetry_enabled,
    timing_guard, timing_guard_if,
};

/// Initialize logging once for the CLI and for tests.
///
/// `RUST_LOG` takes precedence when set; otherwise `default_filter` applies,
/// with the chattier wgpu internals capped at `warn`. Calling this again after
/// a logger is installed is a no-op.
pub fn init_logging(default_filter: LevelFilter) -> Result<()> {
    let env = env_logger::Env::default().default_filter_or(default_filter.as_str());
    let mut builder = env_logger::Builder::from_env(env);
    if std::env::var_os("RUST_LOG").is_none() {
        for noisy in ["wgpu_core", "wgpu_hal", "naga"] {
            builder.filter_module(noisy, default_filter.min(LevelFilter::Warn));
        }
    }
    builder.filter_module("w2x::telemetry", LevelFilter::Trace);
    let _ = builder.try_init();
    Ok(())
}

/// Validate that a path exists and resolve it to an absolute path.
pub fn normalize_path<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
    let path = path.as_ref();
    anyhow::ensure!(path.exists(), "path does not exist: {}", path.display());
    Ok(path.canonicalize()?)
}

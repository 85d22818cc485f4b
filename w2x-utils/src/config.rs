//! Settings shared by the w2x front end and the conversion engine.
//!
//! Everything here is plain data that round-trips through JSON. Nothing is
//! process-global: callers load an [`AppSettings`], adjust it, and hand the
//! relevant pieces to the engine explicitly.

use crate::gpu::GpuContextOptions;

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{
    env,
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
    str::FromStr,
};

/// Default block edge used when splitting large images.
pub const DEFAULT_BLOCK_EDGE: u32 = 512;
/// Default number of tiles converted concurrently.
pub const DEFAULT_JOBS: usize = 4;
/// Largest exponent accepted by [`ConversionSettings::set_block_size_exp2`].
pub const MAX_BLOCK_EXP2: u32 = 15;

/// How images are split and scheduled during conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionSettings {
    /// Number of tiles processed concurrently. Advisory; clamped to at least 1.
    pub jobs: usize,
    /// Tile budget width in pixels, including the per-tile padding border.
    pub block_width: u32,
    /// Tile budget height in pixels, including the per-tile padding border.
    pub block_height: u32,
    /// Allow splitting images larger than the block area.
    pub tiling: bool,
    /// Upscaling factor applied before the network runs (1 = denoise only).
    pub scale: u32,
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            jobs: DEFAULT_JOBS,
            block_width: DEFAULT_BLOCK_EDGE,
            block_height: DEFAULT_BLOCK_EDGE,
            tiling: true,
            scale: 2,
        }
    }
}

impl ConversionSettings {
    /// Set a rectangular block size. Zero edges are rejected.
    pub fn set_block_size(&mut self, width: u32, height: u32) -> Result<()> {
        anyhow::ensure!(
            width > 0 && height > 0,
            "block size must be positive (got {width}x{height})"
        );
        self.block_width = width;
        self.block_height = height;
        Ok(())
    }

    /// Set a square block of edge `2^exp`.
    pub fn set_block_size_exp2(&mut self, exp: u32) -> Result<()> {
        anyhow::ensure!(
            exp <= MAX_BLOCK_EXP2,
            "block size exponent {exp} exceeds the maximum of {MAX_BLOCK_EXP2}"
        );
        let edge = 1u32 << exp;
        self.set_block_size(edge, edge)
    }

    /// Set the job count; values below one are rejected.
    pub fn set_jobs(&mut self, jobs: usize) -> Result<()> {
        anyhow::ensure!(jobs >= 1, "number of jobs must be at least 1");
        self.jobs = jobs;
        Ok(())
    }

    /// Clamp values a hand-edited settings file may have broken.
    pub fn sanitize(&mut self) {
        self.jobs = self.jobs.max(1);
        if self.block_width == 0 {
            self.block_width = DEFAULT_BLOCK_EDGE;
        }
        if self.block_height == 0 {
            self.block_height = DEFAULT_BLOCK_EDGE;
        }
        self.scale = self.scale.max(1);
    }
}

/// Verbosity of telemetry timing records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryLevel {
    Off,
    Error,
    #[serde(alias = "warning")]
    Warn,
    Info,
    #[default]
    Debug,
    Trace,
}

impl From<TelemetryLevel> for LevelFilter {
    fn from(level: TelemetryLevel) -> Self {
        match level {
            TelemetryLevel::Off => LevelFilter::Off,
            TelemetryLevel::Error => LevelFilter::Error,
            TelemetryLevel::Warn => LevelFilter::Warn,
            TelemetryLevel::Info => LevelFilter::Info,
            TelemetryLevel::Debug => LevelFilter::Debug,
            TelemetryLevel::Trace => LevelFilter::Trace,
        }
    }
}

impl FromStr for TelemetryLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let level = LevelFilter::from_str(value.trim())
            .map_err(|_| format!("unknown telemetry level '{value}'"))?;
        Ok(match level {
            LevelFilter::Off => Self::Off,
            LevelFilter::Error => Self::Error,
            LevelFilter::Warn => Self::Warn,
            LevelFilter::Info => Self::Info,
            LevelFilter::Debug => Self::Debug,
            LevelFilter::Trace => Self::Trace,
        })
    }
}

/// Optional timing logs around model load, conversion, tiles and layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub enabled: bool,
    pub level: TelemetryLevel,
}

impl TelemetrySettings {
    pub fn level_filter(&self) -> LevelFilter {
        self.level.into()
    }
}

/// GPU runtime preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuSettings {
    /// Try the GPU backend before falling back to the CPU.
    pub enabled: bool,
    /// Respect `WGPU_*` environment overrides.
    pub respect_env: bool,
    /// Upper bound on planes held in one activation slot.
    pub max_planes: usize,
}

impl Default for GpuSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            respect_env: true,
            max_planes: 128,
        }
    }
}

impl From<&GpuSettings> for GpuContextOptions {
    fn from(settings: &GpuSettings) -> Self {
        GpuContextOptions {
            enabled: settings.enabled,
            respect_env: settings.respect_env,
            ..Default::default()
        }
    }
}

impl From<GpuSettings> for GpuContextOptions {
    fn from(settings: GpuSettings) -> Self {
        (&settings).into()
    }
}

/// Persistent settings consumed by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Model file (binary `.bin` or JSON `.json`).
    pub model_path: Option<String>,
    pub conversion: ConversionSettings,
    pub telemetry: TelemetrySettings,
    pub gpu: GpuSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            model_path: Some(default_model_path().to_string()),
            conversion: ConversionSettings::default(),
            telemetry: TelemetrySettings::default(),
            gpu: GpuSettings::default(),
        }
    }
}

impl AppSettings {
    /// Load settings from a JSON file, filling omitted fields with defaults
    /// and clamping conversion values that would be rejected later.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open settings file {}", path.display()))?;
        let mut settings: AppSettings = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("invalid settings JSON in {}", path.display()))?;

        settings
            .model_path
            .get_or_insert_with(|| default_model_path().to_string());
        settings.conversion.sanitize();
        Ok(settings)
    }

    /// Write settings as pretty-printed JSON, creating parent directories.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        let file = File::create(path)
            .with_context(|| format!("failed to create settings file {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .with_context(|| format!("failed to write settings to {}", path.display()))
    }
}

fn default_model_path() -> &'static str {
    "models/scale2.0x_model.bin"
}

/// Default location of persisted settings (`config/w2x_settings.json`).
pub fn default_settings_path() -> PathBuf {
    env::current_dir()
        .map(|dir| dir.join("config/w2x_settings.json"))
        .unwrap_or_else(|_| PathBuf::from("config/w2x_settings.json"))
}

//! Command-line front end for the w2x super-resolution engine.

mod args;
mod convert;

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use w2x_core::{
    BackendFactory, ConvertOptions, Converter, CpuBackendFactory, Model, WgpuBackendFactory,
};
use w2x_utils::{
    config::{AppSettings, default_settings_path},
    gpu::{GpuAvailability, GpuContext, GpuContextOptions},
    init_logging, normalize_path,
    telemetry::{configure as configure_telemetry, timing_guard},
};

use crate::{
    args::{Cli, Command, ConvertArgs, ExportModelArgs, parse_block_size},
    convert::{ConversionRecord, ImageJob, convert_all, plan_jobs},
};

fn main() -> Result<()> {
    init_logging(log::LevelFilter::Info)?;
    let cli = Cli::parse();

    match cli.command {
        Command::Convert(args) => run_convert(&args),
        Command::ExportModel(args) => run_export_model(&args),
    }
}

fn run_convert(args: &ConvertArgs) -> Result<()> {
    let input_path = normalize_path(&args.input)?;

    let mut settings = load_settings(args.config.as_ref())?;
    apply_cli_overrides(&mut settings, args)?;
    configure_telemetry(
        settings.telemetry.enabled,
        settings.telemetry.level_filter(),
    );

    let model_path = settings
        .model_path
        .as_deref()
        .map(PathBuf::from)
        .context("no model path configured")?;
    let model_path = normalize_path(&model_path)
        .with_context(|| format!("model file not found: {}", model_path.display()))?;

    let model = {
        let _guard = timing_guard("w2x-cli load model", log::Level::Info);
        Model::load(&model_path)
            .with_context(|| format!("failed to load model {}", model_path.display()))?
    };
    info!(
        "Loaded {} layer(s) from {} (border {}px)",
        model.len(),
        model_path.display(),
        model.border()
    );

    let jobs = plan_jobs(&input_path, &args.output)?;
    if jobs.is_empty() {
        anyhow::bail!(
            "no images found at {} (supported extensions: png, jpg, jpeg, bmp, webp)",
            input_path.display()
        );
    }

    let options = ConvertOptions::from(&settings.conversion);
    let scale = settings.conversion.scale;
    info!(
        "Processing {} image(s) at {scale}x, tile budget {}x{}, {} job(s), tiling {}",
        jobs.len(),
        options.tile_budget.width,
        options.tile_budget.height,
        options.jobs,
        if options.use_tiling { "on" } else { "off" }
    );

    let gpu_options = GpuContextOptions::from(&settings.gpu);
    let records = match GpuContext::init_with_fallback(&gpu_options) {
        GpuAvailability::Available(context) => {
            let factory = WgpuBackendFactory::new(context, settings.gpu.max_planes);
            run_jobs(model, factory, options, &jobs, scale)
        }
        GpuAvailability::Disabled { reason } => {
            info!("{reason}; using the CPU backend");
            let factory = CpuBackendFactory::new(settings.gpu.max_planes);
            run_jobs(model, factory, options, &jobs, scale)
        }
        GpuAvailability::Unavailable { error } => {
            warn!("GPU unavailable ({error}); using the CPU backend");
            let factory = CpuBackendFactory::new(settings.gpu.max_planes);
            run_jobs(model, factory, options, &jobs, scale)
        }
    }?;

    if records.is_empty() {
        anyhow::bail!("all conversions failed; no output was produced");
    }
    if records.len() < jobs.len() {
        warn!(
            "{} of {} image(s) failed to convert",
            jobs.len() - records.len(),
            jobs.len()
        );
    }

    if let Some(report_path) = args.report.as_ref() {
        write_report(report_path, &records)?;
    }
    Ok(())
}

fn run_jobs<F: BackendFactory>(
    model: Model,
    factory: F,
    options: ConvertOptions,
    jobs: &[ImageJob],
    scale: u32,
) -> Result<Vec<ConversionRecord>> {
    let converter = Converter::with_model(model, factory, options)
        .context("failed to start conversion backends")?;
    info!("Using the {} backend", converter.backend_name());
    let _guard = timing_guard("w2x-cli convert all", log::Level::Info);
    Ok(convert_all(&converter, jobs, scale))
}

fn run_export_model(args: &ExportModelArgs) -> Result<()> {
    let input_path = normalize_path(&args.input)?;
    let model = Model::load_json(&input_path)
        .with_context(|| format!("failed to read JSON model {}", input_path.display()))?;
    if let Some(parent) = args.output.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    model
        .save_binary(&args.output)
        .with_context(|| format!("failed to write binary model {}", args.output.display()))?;
    info!(
        "Exported {} layer(s) from {} to {}",
        model.len(),
        input_path.display(),
        args.output.display()
    );
    Ok(())
}

fn write_report(path: &Path, records: &[ConversionRecord]) -> Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, records)
        .with_context(|| format!("failed to write conversion report to {}", path.display()))?;
    info!("Wrote conversion report to {}", path.display());
    Ok(())
}

fn load_settings(config_path: Option<&PathBuf>) -> Result<AppSettings> {
    if let Some(path) = config_path {
        let resolved = normalize_path(path)?;
        AppSettings::load_from_path(&resolved)
    } else {
        let fallback = default_settings_path();
        if fallback.is_file() {
            debug!("Using settings from {}", fallback.display());
            AppSettings::load_from_path(&fallback)
        } else {
            Ok(AppSettings::default())
        }
    }
}

fn apply_cli_overrides(settings: &mut AppSettings, args: &ConvertArgs) -> Result<()> {
    if let Some(model) = args.model.as_ref() {
        settings.model_path = Some(model.display().to_string());
    }
    if let Some(scale) = args.scale {
        settings.conversion.scale = scale;
    }
    if let Some(size) = args.block_size.as_deref() {
        let (width, height) = parse_block_size(size)?;
        settings.conversion.set_block_size(width, height)?;
    }
    if let Some(exp) = args.block_exp {
        settings.conversion.set_block_size_exp2(exp)?;
    }
    if args.no_tiling {
        settings.conversion.tiling = false;
    }
    if let Some(jobs) = args.jobs {
        settings.conversion.set_jobs(jobs)?;
    }
    if args.no_gpu {
        settings.gpu.enabled = false;
    }
    if let Some(mode) = args.gpu_env {
        settings.gpu.respect_env = mode.respects_env();
    }
    if args.telemetry {
        settings.telemetry.enabled = true;
    }
    if let Some(level) = args.telemetry_level {
        settings.telemetry.level = level;
    }
    Ok(())
}

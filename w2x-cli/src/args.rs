//! Command-line argument definitions for the `w2x` binary.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use w2x_utils::TelemetryLevel;

/// Upscale and denoise images with a convolutional super-resolution model.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Convert an image, or every image in a directory.
    Convert(ConvertArgs),
    /// Convert a JSON model description into the binary model format.
    ExportModel(ExportModelArgs),
}

#[derive(Debug, Args)]
pub struct ConvertArgs {
    /// Path to an image file or a directory containing images.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output image file, or output directory when the input is a directory.
    #[arg(short, long)]
    pub output: PathBuf,

    /// Model file (`.bin` binary or `.json` description). Defaults to the settings file.
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Optional settings JSON. Defaults to `config/w2x_settings.json` when present, otherwise built-in parameters.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Integer upscaling factor applied before the network (1 = denoise only).
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=16))]
    pub scale: Option<u32>,

    /// Tile budget, either `WIDTHxHEIGHT` or a single edge length.
    #[arg(long, value_name = "SIZE", conflicts_with = "block_exp")]
    pub block_size: Option<String>,

    /// Tile budget as a power of two: the block edge becomes `2^EXP`.
    #[arg(long, value_name = "EXP")]
    pub block_exp: Option<u32>,

    /// Run each image as a single tile regardless of its size.
    #[arg(long = "no-tiling", action = ArgAction::SetTrue)]
    pub no_tiling: bool,

    /// Number of tiles converted concurrently.
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Disable GPU acceleration entirely, even if supported.
    #[arg(long = "no-gpu", action = ArgAction::SetTrue)]
    pub no_gpu: bool,

    /// Control whether `WGPU_*` env vars influence GPU selection (`auto` or `ignore`).
    #[arg(long = "gpu-env", value_enum)]
    pub gpu_env: Option<GpuEnvMode>,

    /// Write a JSON report of the converted images to this path.
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Enable telemetry timing logs (defaults to settings file).
    #[arg(long, action = ArgAction::SetTrue)]
    pub telemetry: bool,

    /// Override telemetry logging level (error, warn, info, debug, trace).
    #[arg(long, value_name = "LEVEL")]
    pub telemetry_level: Option<TelemetryLevel>,
}

#[derive(Debug, Args)]
pub struct ExportModelArgs {
    /// JSON model description.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Destination of the binary model.
    #[arg(short, long)]
    pub output: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GpuEnvMode {
    /// Respect environment overrides such as `WGPU_BACKEND`.
    Auto,
    /// Ignore environment overrides and rely solely on CLI/config.
    Ignore,
}

impl GpuEnvMode {
    pub fn respects_env(self) -> bool {
        matches!(self, GpuEnvMode::Auto)
    }
}

/// Parse `--block-size`: `WIDTHxHEIGHT` or a single edge for a square block.
pub fn parse_block_size(value: &str) -> anyhow::Result<(u32, u32)> {
    let value = value.trim();
    let parse_edge = |edge: &str| -> anyhow::Result<u32> {
        edge.trim()
            .parse::<u32>()
            .map_err(|err| anyhow::anyhow!("invalid block edge '{edge}': {err}"))
    };
    match value.split_once(['x', 'X']) {
        Some((width, height)) => Ok((parse_edge(width)?, parse_edge(height)?)),
        None => {
            let edge = parse_edge(value)?;
            Ok((edge, edge))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_convert_flags() {
        let cli = Cli::try_parse_from([
            "w2x",
            "convert",
            "-i",
            "in.png",
            "-o",
            "out.png",
            "--block-size",
            "256x128",
            "--jobs",
            "2",
            "--no-gpu",
            "--telemetry-level",
            "trace",
        ])
        .expect("parse");
        let Command::Convert(args) = cli.command else {
            panic!("expected convert subcommand");
        };
        assert_eq!(args.block_size.as_deref(), Some("256x128"));
        assert_eq!(args.jobs, Some(2));
        assert!(args.no_gpu);
        assert!(!args.no_tiling);
        assert_eq!(args.telemetry_level, Some(TelemetryLevel::Trace));
    }

    #[test]
    fn block_size_and_exponent_conflict() {
        let result = Cli::try_parse_from([
            "w2x",
            "convert",
            "-i",
            "a.png",
            "-o",
            "b.png",
            "--block-size",
            "64",
            "--block-exp",
            "7",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn block_size_forms() {
        assert_eq!(parse_block_size("256x128").expect("rect"), (256, 128));
        assert_eq!(parse_block_size("64").expect("square"), (64, 64));
        assert_eq!(parse_block_size(" 32X48 ").expect("upper"), (32, 48));
        assert!(parse_block_size("x12").is_err());
        assert!(parse_block_size("wide").is_err());
    }
}

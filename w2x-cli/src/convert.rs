//! Image-level conversion: decode, split into YUV, run the engine on luminance, encode.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{Context, Result};
use image::{GenericImageView, imageops::FilterType};
use log::{debug, info, warn};
use serde::Serialize;
use w2x_core::{BackendFactory, Converter, Plane};
use w2x_utils::{YuvPlanes, load_image, merge_yuv, save_image, split_yuv, upscale_image};

/// One converted image, as written to the `--report` JSON.
#[derive(Debug, Serialize)]
pub struct ConversionRecord {
    pub input: String,
    pub output: String,
    pub source_size: [u32; 2],
    pub output_size: [u32; 2],
    pub backend: &'static str,
    pub elapsed_ms: u128,
}

/// Source image and where its converted counterpart goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageJob {
    pub input: PathBuf,
    pub output: PathBuf,
}

/// Convert one image file with `converter`, upscaling by `scale` first.
///
/// Luminance is upscaled with nearest-neighbour sampling and refined by the
/// model; chroma is upscaled with Catmull-Rom and merged back untouched.
pub fn convert_image<F: BackendFactory>(
    converter: &Converter<F>,
    job: &ImageJob,
    scale: u32,
) -> Result<ConversionRecord> {
    let started = Instant::now();
    let image = load_image(&job.input)?;
    let (width, height) = image.dimensions();

    let luma_source = split_yuv(&upscale_image(&image, scale, FilterType::Nearest)?);
    let chroma_source = if scale == 1 {
        None
    } else {
        Some(split_yuv(&upscale_image(
            &image,
            scale,
            FilterType::CatmullRom,
        )?))
    };
    let (out_width, out_height) = (luma_source.width, luma_source.height);
    debug!(
        "{}: {width}x{height} -> {out_width}x{out_height}",
        job.input.display()
    );

    let luma = Plane::from_vec(out_width as usize, out_height as usize, luma_source.y)
        .context("luminance plane does not match the image size")?;
    let converted = converter
        .convert(&luma)
        .with_context(|| format!("failed to convert {}", job.input.display()))?;

    let (u, v) = match chroma_source {
        Some(chroma) => (chroma.u, chroma.v),
        None => (luma_source.u, luma_source.v),
    };
    let merged = merge_yuv(&YuvPlanes {
        width: out_width,
        height: out_height,
        y: converted.into_vec(),
        u,
        v,
    });

    if let Some(parent) = job.output.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    save_image(&merged, &job.output)?;

    let elapsed = started.elapsed();
    info!(
        "{} -> {} ({out_width}x{out_height}, {:.2?})",
        job.input.display(),
        job.output.display(),
        elapsed
    );
    Ok(ConversionRecord {
        input: job.input.display().to_string(),
        output: job.output.display().to_string(),
        source_size: [width, height],
        output_size: [out_width, out_height],
        backend: converter.backend_name(),
        elapsed_ms: elapsed.as_millis(),
    })
}

/// Run every job, logging failures and returning the records of those that succeeded.
pub fn convert_all<F: BackendFactory>(
    converter: &Converter<F>,
    jobs: &[ImageJob],
    scale: u32,
) -> Vec<ConversionRecord> {
    let mut records = Vec::with_capacity(jobs.len());
    for job in jobs {
        match convert_image(converter, job, scale) {
            Ok(record) => records.push(record),
            Err(err) => warn!("Failed to process {}: {err:#}", job.input.display()),
        }
    }
    records
}

/// Pair each source image with its destination.
///
/// A file input maps to `output`, or to `output/<file name>` when `output` is
/// an existing directory. A directory input is walked recursively and its
/// relative layout is mirrored under `output`.
pub fn plan_jobs(input: &Path, output: &Path) -> Result<Vec<ImageJob>> {
    if input.is_file() {
        let destination = if output.is_dir() {
            let name = input
                .file_name()
                .with_context(|| format!("input has no file name: {}", input.display()))?;
            output.join(name)
        } else {
            output.to_path_buf()
        };
        return Ok(vec![ImageJob {
            input: input.to_path_buf(),
            output: destination,
        }]);
    }

    if !input.is_dir() {
        anyhow::bail!(
            "input path is neither file nor directory: {}",
            input.display()
        );
    }

    let mut jobs = Vec::new();
    for entry in walkdir::WalkDir::new(input)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        if !w2x_utils::is_supported_image(path) {
            debug!("Skipping non-image file {}", path.display());
            continue;
        }
        let relative = path
            .strip_prefix(input)
            .with_context(|| format!("{} escaped the input directory", path.display()))?;
        jobs.push(ImageJob {
            input: path.to_path_buf(),
            output: output.join(relative),
        });
    }
    jobs.sort_by(|a, b| a.input.cmp(&b.input));
    Ok(jobs)
}

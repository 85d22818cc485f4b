use std::path::Path;

use anyhow::{Context, Result};
use image::{DynamicImage, RgbImage, imageops::FilterType};

const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "webp"];

/// Load an image from disk into memory.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path_ref = path.as_ref();
    image::open(path_ref).with_context(|| format!("failed to open image {}", path_ref.display()))
}

/// Encode an RGB image, picking the format from the file extension.
pub fn save_image<P: AsRef<Path>>(image: &RgbImage, path: P) -> Result<()> {
    let path_ref = path.as_ref();
    image
        .save(path_ref)
        .with_context(|| format!("failed to write image {}", path_ref.display()))
}

/// Scale an image by an integer factor with the given filter.
///
/// A factor of one returns the image converted to RGB without resampling.
pub fn upscale_image(image: &DynamicImage, factor: u32, filter: FilterType) -> Result<RgbImage> {
    anyhow::ensure!(factor > 0, "scale factor must be at least 1");
    if factor == 1 {
        return Ok(image.to_rgb8());
    }
    let width = image
        .width()
        .checked_mul(factor)
        .context("scaled width overflows u32")?;
    let height = image
        .height()
        .checked_mul(factor)
        .context("scaled height overflows u32")?;
    Ok(image.resize_exact(width, height, filter).to_rgb8())
}

/// Whether the path has an extension the front end knows how to decode.
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            SUPPORTED_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

//! RGB ↔ YUV conversion for feeding luminance to the network.
//!
//! Coefficients follow the analog YUV definition used by OpenCV's float
//! `RGB2YUV` (chroma offset by 0.5 so every channel lives in `[0, 1]`).

use image::{Rgb, RgbImage};

const WR: f32 = 0.299;
const WG: f32 = 0.587;
const WB: f32 = 0.114;
const U_SCALE: f32 = 0.492;
const V_SCALE: f32 = 0.877;

/// Three row-major planes of equal size, values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct YuvPlanes {
    pub width: u32,
    pub height: u32,
    pub y: Vec<f32>,
    pub u: Vec<f32>,
    pub v: Vec<f32>,
}

/// Split an RGB image into Y, U and V planes.
pub fn split_yuv(image: &RgbImage) -> YuvPlanes {
    let (width, height) = image.dimensions();
    let len = width as usize * height as usize;
    let mut planes = YuvPlanes {
        width,
        height,
        y: Vec::with_capacity(len),
        u: Vec::with_capacity(len),
        v: Vec::with_capacity(len),
    };
    for pixel in image.pixels() {
        let [r, g, b] = pixel.0.map(|c| c as f32 / 255.0);
        let y = WR * r + WG * g + WB * b;
        planes.y.push(y);
        planes.u.push((b - y) * U_SCALE + 0.5);
        planes.v.push((r - y) * V_SCALE + 0.5);
    }
    planes
}

/// Rebuild an RGB image from planes, clamping to the 8-bit range.
pub fn merge_yuv(planes: &YuvPlanes) -> RgbImage {
    let mut image = RgbImage::new(planes.width, planes.height);
    for (index, pixel) in image.pixels_mut().enumerate() {
        let y = planes.y[index];
        let u = planes.u[index] - 0.5;
        let v = planes.v[index] - 0.5;
        let r = y + v / V_SCALE;
        let b = y + u / U_SCALE;
        let g = (y - WR * r - WB * b) / WG;
        *pixel = Rgb([to_u8(r), to_u8(g), to_u8(b)]);
    }
    image
}

fn to_u8(value: f32) -> u8 {
    (value * 255.0).round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gray_pixels_have_neutral_chroma() {
        let image = RgbImage::from_pixel(2, 1, Rgb([128, 128, 128]));
        let planes = split_yuv(&image);
        assert!((planes.y[0] - 128.0 / 255.0).abs() < 1e-6);
        assert!((planes.u[1] - 0.5).abs() < 1e-6);
        assert!((planes.v[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn split_then_merge_restores_colors() {
        let image = RgbImage::from_fn(4, 3, |x, y| {
            Rgb([(x * 60) as u8, (y * 90) as u8, 255 - (x * 40) as u8])
        });
        let restored = merge_yuv(&split_yuv(&image));
        for (a, b) in image.pixels().zip(restored.pixels()) {
            for channel in 0..3 {
                let delta = (a[channel] as i32 - b[channel] as i32).abs();
                assert!(delta <= 1, "channel drift {delta} between {a:?} and {b:?}");
            }
        }
    }
}

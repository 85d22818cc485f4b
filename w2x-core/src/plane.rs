//! Owned single-channel `f32` planes in row-major layout.
//!
//! Planes are the unit of data moving between the orchestrator, the layer
//! pipeline and the compute backends. Geometry helpers here (edge-replicating
//! padding, cropping, blitting) are all the tiling code needs.

use crate::error::{ConvertError, Result};

/// Axis-aligned rectangle in plane coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Rect {
    pub const fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn right(&self) -> usize {
        self.x + self.width
    }

    pub const fn bottom(&self) -> usize {
        self.y + self.height
    }

    pub const fn area(&self) -> usize {
        self.width * self.height
    }
}

/// 2D grid of `f32` samples, `data.len() == width * height`.
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Plane {
    /// Zero-initialized plane of `width × height`.
    pub fn new(width: usize, height: usize) -> Self {
        Self::filled(width, height, 0.0)
    }

    pub fn filled(width: usize, height: usize, value: f32) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }

    /// Wrap row-major samples, checking the length against the dimensions.
    pub fn from_vec(width: usize, height: usize, data: Vec<f32>) -> Result<Self> {
        let expected = width.checked_mul(height).ok_or_else(|| {
            ConvertError::InvalidPlane(format!("{width}x{height} overflows usize"))
        })?;
        if data.len() != expected {
            return Err(ConvertError::InvalidPlane(format!(
                "{width}x{height} plane needs {expected} samples, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Build a plane by evaluating `f(x, y)` for every sample.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// `(width, height)`
    #[inline]
    pub fn dims(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        self.data[y * self.width + x] = value;
    }

    #[inline]
    pub fn row(&self, y: usize) -> &[f32] {
        let start = y * self.width;
        &self.data[start..start + self.width]
    }

    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [f32] {
        let start = y * self.width;
        &mut self.data[start..start + self.width]
    }

    /// Sample with coordinates clamped to the plane edge; `None` for an empty plane.
    #[inline]
    pub fn get_clamped(&self, x: isize, y: isize) -> Option<f32> {
        if self.is_empty() {
            return None;
        }
        let cx = x.clamp(0, self.width as isize - 1) as usize;
        let cy = y.clamp(0, self.height as isize - 1) as usize;
        Some(self.get(cx, cy))
    }

    /// Grow the plane by `border` on every side, replicating edge samples.
    ///
    /// An empty plane has nothing to replicate and is returned unchanged.
    pub fn pad_replicate(&self, border: usize) -> Plane {
        if border == 0 || self.is_empty() {
            return self.clone();
        }
        let width = self.width + 2 * border;
        let height = self.height + 2 * border;
        let mut padded = Plane::new(width, height);
        let last_x = self.width - 1;
        let last_y = self.height - 1;
        for y in 0..height {
            let src = self.row(y.saturating_sub(border).min(last_y));
            let dst = padded.row_mut(y);
            dst[..border].fill(src[0]);
            dst[border..border + self.width].copy_from_slice(src);
            dst[border + self.width..].fill(src[last_x]);
        }
        padded
    }

    /// Copy out the samples inside `rect`, which must lie within the plane.
    pub fn crop(&self, rect: Rect) -> Plane {
        debug_assert!(rect.right() <= self.width && rect.bottom() <= self.height);
        let mut out = Plane::new(rect.width, rect.height);
        for y in 0..rect.height {
            let src = &self.row(rect.y + y)[rect.x..rect.right()];
            out.row_mut(y).copy_from_slice(src);
        }
        out
    }

    /// Copy `src` into this plane with its top-left corner at `(x, y)`.
    pub fn blit(&mut self, src: &Plane, x: usize, y: usize) {
        debug_assert!(x + src.width <= self.width && y + src.height <= self.height);
        for row in 0..src.height {
            self.row_mut(y + row)[x..x + src.width].copy_from_slice(src.row(row));
        }
    }

    /// Largest absolute difference between two planes of equal size.
    pub fn max_abs_diff(&self, other: &Plane) -> Option<f32> {
        if self.dims() != other.dims() {
            return None;
        }
        Some(
            self.data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0f32, f32::max),
        )
    }
}

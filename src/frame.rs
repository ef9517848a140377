//! Texture geometry, pixel formats and row-level pixel helpers.

use crate::error::{Result, ShareError};
use serde::{Deserialize, Serialize};

/// Pixel formats a texture may carry.
///
/// Only the 8-bit four-channel formats can back a shared surface; the others
/// exist so backends can report what they were handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// RGBA with 8 bits per channel (32 bits per pixel)
    Rgba8Unorm,
    /// BGRA with 8 bits per channel (32 bits per pixel) - native surface order on macOS
    Bgra8Unorm,
    /// Single 8-bit channel
    R8Unorm,
    /// RGBA with 16-bit float channels
    Rgba16Float,
    /// Anything the backend could not map
    Unknown,
}

impl PixelFormat {
    /// Returns the number of bytes per pixel.
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgba8Unorm | PixelFormat::Bgra8Unorm => 4,
            PixelFormat::R8Unorm => 1,
            PixelFormat::Rgba16Float => 8,
            PixelFormat::Unknown => 0,
        }
    }

    /// Whether a shared surface can be exported in this format.
    pub fn is_shareable(&self) -> bool {
        matches!(self, PixelFormat::Rgba8Unorm | PixelFormat::Bgra8Unorm)
    }

    /// Fails with `UnsupportedFormat` unless the format is shareable.
    pub fn ensure_shareable(self) -> Result<Self> {
        if self.is_shareable() {
            Ok(self)
        } else {
            Err(ShareError::UnsupportedFormat(self))
        }
    }
}

/// Texture addressing layout on the legacy-immediate backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TextureTarget {
    /// Normalized-coordinate 2D texture
    #[serde(rename = "texture_2d")]
    Texture2D,
    /// Rectangle texture addressed in pixels (the layout shared surfaces use natively)
    #[default]
    #[serde(rename = "rectangle")]
    Rectangle,
}

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Number of bytes for a tightly packed image of this size.
    pub fn byte_len(&self, format: PixelFormat) -> usize {
        self.pixel_count() * format.bytes_per_pixel()
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Integer pixel rectangle `(x, y, width, height)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Region {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// The region covering a whole texture of `size`.
    pub fn full(size: Size) -> Self {
        Self::new(0, 0, size.width as i32, size.height as i32)
    }

    /// Extent of the region. Only meaningful after `validate_within`.
    pub fn size(&self) -> Size {
        Size::new(self.width.max(0) as u32, self.height.max(0) as u32)
    }

    /// Checks the region is non-empty and lies inside `bounds`.
    pub fn validate_within(&self, bounds: Size) -> Result<()> {
        if self.width <= 0 || self.height <= 0 {
            return Err(ShareError::InvalidRegion(format!(
                "{}x{} has a non-positive extent",
                self.width, self.height
            )));
        }
        let right = self.x as i64 + self.width as i64;
        let bottom = self.y as i64 + self.height as i64;
        if self.x < 0 || self.y < 0 || right > bounds.width as i64 || bottom > bounds.height as i64 {
            return Err(ShareError::InvalidRegion(format!(
                "({}, {}, {}, {}) lies outside a {}x{} texture",
                self.x, self.y, self.width, self.height, bounds.width, bounds.height
            )));
        }
        Ok(())
    }

    /// Resolves an optional region/size pair against a texture.
    ///
    /// A missing size is taken from `texture_size`, a missing region covers the
    /// whole size. The result is validated.
    pub fn resolve(
        region: Option<Region>,
        size: Option<Size>,
        texture_size: impl FnOnce() -> Result<Size>,
    ) -> Result<(Region, Size)> {
        let size = match size {
            Some(size) => size,
            None => texture_size()?,
        };
        if size.is_empty() {
            return Err(ShareError::InvalidRegion(format!(
                "texture size {}x{} is empty",
                size.width, size.height
            )));
        }
        let region = region.unwrap_or_else(|| Region::full(size));
        region.validate_within(size)?;
        Ok((region, size))
    }
}

/// Size and format of a texture as reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureInfo {
    pub size: Size,
    pub format: PixelFormat,
}

/// Copies `region` of a tightly packed `src` image into a tightly packed `dst`.
///
/// With `flipped` the rows land in `dst` bottom-up. `region` must already be
/// validated against `src_size` and `dst` must hold exactly the region.
pub fn copy_region(
    src: &[u8],
    src_size: Size,
    bytes_per_pixel: usize,
    region: Region,
    flipped: bool,
    dst: &mut [u8],
) -> Result<()> {
    let src_expected = src_size.pixel_count() * bytes_per_pixel;
    if src.len() != src_expected {
        return Err(ShareError::BufferSizeMismatch { expected: src_expected, actual: src.len() });
    }
    let out_size = region.size();
    let row_len = out_size.width as usize * bytes_per_pixel;
    let dst_expected = row_len * out_size.height as usize;
    if dst.len() != dst_expected {
        return Err(ShareError::BufferSizeMismatch { expected: dst_expected, actual: dst.len() });
    }

    let src_stride = src_size.width as usize * bytes_per_pixel;
    let x_offset = region.x as usize * bytes_per_pixel;
    let rows = out_size.height as usize;
    for row in 0..rows {
        let src_row = region.y as usize + row;
        let dst_row = if flipped { rows - 1 - row } else { row };
        let src_start = src_row * src_stride + x_offset;
        let dst_start = dst_row * row_len;
        dst[dst_start..dst_start + row_len].copy_from_slice(&src[src_start..src_start + row_len]);
    }
    Ok(())
}

/// Writes a tightly packed `src` image into `region` of a tightly packed `dst`.
pub fn write_region(
    dst: &mut [u8],
    dst_size: Size,
    bytes_per_pixel: usize,
    region: Region,
    src: &[u8],
) -> Result<()> {
    let dst_expected = dst_size.pixel_count() * bytes_per_pixel;
    if dst.len() != dst_expected {
        return Err(ShareError::BufferSizeMismatch { expected: dst_expected, actual: dst.len() });
    }
    let row_len = region.size().width as usize * bytes_per_pixel;
    let src_expected = row_len * region.size().height as usize;
    if src.len() != src_expected {
        return Err(ShareError::BufferSizeMismatch { expected: src_expected, actual: src.len() });
    }

    let dst_stride = dst_size.width as usize * bytes_per_pixel;
    let x_offset = region.x as usize * bytes_per_pixel;
    for (row, chunk) in src.chunks_exact(row_len).enumerate() {
        let start = (region.y as usize + row) * dst_stride + x_offset;
        dst[start..start + row_len].copy_from_slice(chunk);
    }
    Ok(())
}

/// Swaps the red and blue channels of packed 4-byte pixels in place.
///
/// Converts between RGBA and BGRA in either direction. Buffers holding a
/// partial pixel are rejected untouched.
pub fn swap_red_blue(data: &mut [u8]) -> Result<()> {
    let len = data.len();
    let pixels: &mut [[u8; 4]] = bytemuck::try_cast_slice_mut(data)
        .map_err(|_| ShareError::BufferSizeMismatch { expected: len - len % 4, actual: len })?;
    for pixel in pixels {
        pixel.swap(0, 2);
    }
    Ok(())
}

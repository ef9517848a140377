//! Pixel marshalling between CPU buffers, images and backend textures.
//!
//! Only 8-bit RGBA and BGRA textures are handled. Buffers are tightly packed
//! rows in the texture's own channel order. Every helper checks shapes before
//! it touches the GPU, so a bad buffer never leads to a partial copy.

use crate::backend::{BackendContext, NativeTexture};
use crate::error::{Result, ShareError};
use crate::frame::{swap_red_blue, PixelFormat, Region, Size, TextureInfo};
use image::RgbaImage;

fn shareable_info(backend: &BackendContext, texture: &NativeTexture) -> Result<TextureInfo> {
    let info = backend.texture_info(texture, None)?;
    info.format.ensure_shareable()?;
    Ok(info)
}

fn check_len(info: &TextureInfo, len: usize) -> Result<()> {
    let expected = info.size.byte_len(info.format);
    if len != expected {
        return Err(ShareError::BufferSizeMismatch { expected, actual: len });
    }
    Ok(())
}

/// Create an empty texture suitable for publishing.
pub fn create_texture(backend: &BackendContext, size: Size, format: PixelFormat) -> Result<NativeTexture> {
    format.ensure_shareable()?;
    match backend {
        BackendContext::Explicit(device) => device.create_texture(size, format),
        BackendContext::Immediate { context, target } => {
            Ok(NativeTexture::from_name(context.create_texture(*target, size, format)?))
        }
    }
}

/// Upload `bytes` into the whole texture.
pub fn copy_bytes_to_texture(backend: &BackendContext, bytes: &[u8], texture: &NativeTexture) -> Result<()> {
    let info = shareable_info(backend, texture)?;
    check_len(&info, bytes.len())?;
    let region = Region::full(info.size);
    match backend {
        BackendContext::Explicit(device) => device.replace_region(texture, region, bytes),
        BackendContext::Immediate { context, target } => {
            let name = texture.name().ok_or(ShareError::ForeignTexture("texture handle"))?;
            context.write_pixels(name, *target, region, bytes)
        }
    }
}

/// Read the whole texture into `out`, which must hold width * height * 4 bytes.
pub fn copy_texture_into(backend: &BackendContext, texture: &NativeTexture, out: &mut [u8]) -> Result<()> {
    let info = shareable_info(backend, texture)?;
    check_len(&info, out.len())?;
    read_into(backend, texture, &info, out)
}

/// Read the whole texture into a new buffer.
pub fn copy_texture_to_bytes(backend: &BackendContext, texture: &NativeTexture) -> Result<Vec<u8>> {
    let info = shareable_info(backend, texture)?;
    let mut out = vec![0; info.size.byte_len(info.format)];
    read_into(backend, texture, &info, &mut out)?;
    Ok(out)
}

fn read_into(backend: &BackendContext, texture: &NativeTexture, info: &TextureInfo, out: &mut [u8]) -> Result<()> {
    let region = Region::full(info.size);
    match backend {
        BackendContext::Explicit(device) => device.read_region(texture, region, out),
        BackendContext::Immediate { context, target } => {
            let name = texture.name().ok_or(ShareError::ForeignTexture("texture handle"))?;
            context.read_pixels(name, *target, region, out)
        }
    }
}

/// Upload an RGBA image, swizzling for BGRA textures.
pub fn copy_image_to_texture(backend: &BackendContext, image: &RgbaImage, texture: &NativeTexture) -> Result<()> {
    let info = shareable_info(backend, texture)?;
    if info.size != Size::new(image.width(), image.height()) {
        return Err(ShareError::BufferSizeMismatch {
            expected: info.size.byte_len(info.format),
            actual: image.as_raw().len(),
        });
    }
    match info.format {
        PixelFormat::Bgra8Unorm => {
            let mut bgra = image.as_raw().clone();
            swap_red_blue(&mut bgra)?;
            copy_bytes_to_texture(backend, &bgra, texture)
        }
        _ => copy_bytes_to_texture(backend, image.as_raw(), texture),
    }
}

/// Create an RGBA texture holding `image`.
pub fn texture_from_image(backend: &BackendContext, image: &RgbaImage) -> Result<NativeTexture> {
    let texture = create_texture(backend, Size::new(image.width(), image.height()), PixelFormat::Rgba8Unorm)?;
    copy_image_to_texture(backend, image, &texture)?;
    Ok(texture)
}

/// Download a texture as an RGBA image.
pub fn copy_texture_to_image(backend: &BackendContext, texture: &NativeTexture) -> Result<RgbaImage> {
    let info = shareable_info(backend, texture)?;
    let mut pixels = copy_texture_to_bytes(backend, texture)?;
    if info.format == PixelFormat::Bgra8Unorm {
        swap_red_blue(&mut pixels)?;
    }
    let actual = pixels.len();
    RgbaImage::from_raw(info.size.width, info.size.height, pixels).ok_or(ShareError::BufferSizeMismatch {
        expected: info.size.byte_len(info.format),
        actual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::TextureTarget;
    use crate::gpu::{SoftDevice, SoftGlContext};
    use std::sync::Arc;

    fn explicit() -> BackendContext {
        BackendContext::explicit(Arc::new(SoftDevice::new("test").unwrap()))
    }

    #[test]
    fn test_wrong_buffer_length_fails_without_copying() {
        let backend = explicit();
        let texture = create_texture(&backend, Size::new(2, 2), PixelFormat::Rgba8Unorm).unwrap();
        copy_bytes_to_texture(&backend, &[5u8; 16], &texture).unwrap();

        let result = copy_bytes_to_texture(&backend, &[9u8; 15], &texture);
        assert!(matches!(result, Err(ShareError::BufferSizeMismatch { expected: 16, actual: 15 })));

        let mut short = [0u8; 12];
        let result = copy_texture_into(&backend, &texture, &mut short);
        assert!(matches!(result, Err(ShareError::BufferSizeMismatch { expected: 16, actual: 12 })));
        assert_eq!(short, [0u8; 12]);
        assert_eq!(copy_texture_to_bytes(&backend, &texture).unwrap(), vec![5u8; 16]);
    }

    #[test]
    fn test_only_eight_bit_rgba_textures_are_marshalled() {
        let backend = explicit();
        assert!(matches!(
            create_texture(&backend, Size::new(2, 2), PixelFormat::R8Unorm),
            Err(ShareError::UnsupportedFormat(PixelFormat::R8Unorm))
        ));
    }

    #[test]
    fn test_images_are_swizzled_for_bgra_textures() {
        let backend = explicit();
        let texture = create_texture(&backend, Size::new(1, 1), PixelFormat::Bgra8Unorm).unwrap();
        let image = RgbaImage::from_pixel(1, 1, image::Rgba([255, 0, 10, 255]));
        copy_image_to_texture(&backend, &image, &texture).unwrap();

        assert_eq!(copy_texture_to_bytes(&backend, &texture).unwrap(), vec![10, 0, 255, 255]);
        assert_eq!(copy_texture_to_image(&backend, &texture).unwrap(), image);
    }

    #[test]
    fn test_image_size_must_match_the_texture() {
        let backend = explicit();
        let texture = create_texture(&backend, Size::new(2, 2), PixelFormat::Rgba8Unorm).unwrap();
        let image = RgbaImage::new(3, 2);
        assert!(matches!(
            copy_image_to_texture(&backend, &image, &texture),
            Err(ShareError::BufferSizeMismatch { expected: 16, actual: 24 })
        ));
    }

    #[test]
    fn test_immediate_round_trip() {
        let context = Arc::new(SoftGlContext::new());
        context.make_current();
        let backend = BackendContext::immediate(context, TextureTarget::Rectangle);
        let image = RgbaImage::from_fn(3, 2, |x, y| image::Rgba([x as u8, y as u8, 7, 255]));
        let texture = texture_from_image(&backend, &image).unwrap();
        assert_eq!(copy_texture_to_image(&backend, &texture).unwrap(), image);
    }
}

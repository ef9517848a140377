//! Concrete GPU backends.
//!
//! `soft` and `soft_gl` emulate an explicit device and an immediate context on
//! the CPU; `wgpu_device` drives real hardware.

pub mod soft;
pub mod soft_gl;
pub mod wgpu_device;

pub use soft::{SoftDevice, SoftTexture};
pub use soft_gl::SoftGlContext;
pub use wgpu_device::{WgpuDevice, WgpuTexture};

use crate::backend::CommandBufferStatus;
use crate::error::{Result, ShareError};
use crate::frame::{PixelFormat, Region, Size};
use crate::transport::SharedSurface;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

/// Pixel storage of a software texture.
///
/// Imported textures alias the shared surface instead of copying it.
pub(crate) enum TextureStorage {
    Owned(RwLock<Vec<u8>>),
    Surface(Arc<SharedSurface>),
}

impl TextureStorage {
    pub(crate) fn zeroed(size: Size, format: PixelFormat) -> Result<Self> {
        if format.bytes_per_pixel() == 0 {
            return Err(ShareError::UnsupportedFormat(format));
        }
        Ok(TextureStorage::Owned(RwLock::new(vec![0; size.byte_len(format)])))
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        match self {
            TextureStorage::Owned(pixels) => pixels.read(),
            TextureStorage::Surface(surface) => surface.read(),
        }
    }

    /// Imported textures are read-only: the surface behind them is shared with
    /// the server and every other client.
    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<u8>>> {
        match self {
            TextureStorage::Owned(pixels) => Ok(pixels.write()),
            TextureStorage::Surface(surface) => Err(ShareError::Gpu(format!(
                "texture imported from {} is read-only",
                surface.id()
            ))),
        }
    }

    pub(crate) fn surface(&self) -> Option<&Arc<SharedSurface>> {
        match self {
            TextureStorage::Owned(_) => None,
            TextureStorage::Surface(surface) => Some(surface),
        }
    }
}

/// Checks that `surface` can take a `format` copy of `region`.
pub(crate) fn check_export_target(surface: &SharedSurface, region: Region, format: PixelFormat) -> Result<()> {
    if surface.size() != region.size() || surface.format() != format {
        return Err(ShareError::Gpu(format!(
            "{} ({}x{} {:?}) cannot hold a {:?} copy of {}x{}",
            surface.id(),
            surface.size().width,
            surface.size().height,
            surface.format(),
            format,
            region.width,
            region.height
        )));
    }
    Ok(())
}

/// Completion signal of one command buffer.
pub(crate) struct Completion {
    status: Mutex<CommandBufferStatus>,
    signal: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self { status: Mutex::new(CommandBufferStatus::NotCommitted), signal: Condvar::new() })
    }

    pub(crate) fn status(&self) -> CommandBufferStatus {
        self.status.lock().clone()
    }

    pub(crate) fn set(&self, status: CommandBufferStatus) {
        *self.status.lock() = status;
        self.signal.notify_all();
    }

    pub(crate) fn is_finished(&self) -> bool {
        matches!(*self.status.lock(), CommandBufferStatus::Completed | CommandBufferStatus::Error(_))
    }

    /// Block until the buffer completed or failed.
    pub(crate) fn wait(&self) -> Result<()> {
        let mut status = self.status.lock();
        loop {
            match status.clone() {
                CommandBufferStatus::NotCommitted => {
                    return Err(ShareError::Gpu("command buffer was never committed".to_string()))
                }
                CommandBufferStatus::Committed => self.signal.wait(&mut status),
                CommandBufferStatus::Completed => return Ok(()),
                CommandBufferStatus::Error(message) => return Err(ShareError::Gpu(message)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SurfaceId;

    fn surface(size: Size) -> Arc<SharedSurface> {
        Arc::new(SharedSurface::new(SurfaceId(1), size, PixelFormat::Rgba8Unorm).unwrap())
    }

    #[test]
    fn test_export_target_must_match_region_and_format() {
        let target = surface(Size::new(2, 2));
        check_export_target(&target, Region::new(1, 1, 2, 2), PixelFormat::Rgba8Unorm).unwrap();
        assert!(matches!(
            check_export_target(&target, Region::new(0, 0, 4, 4), PixelFormat::Rgba8Unorm),
            Err(ShareError::Gpu(_))
        ));
        assert!(matches!(
            check_export_target(&target, Region::new(0, 0, 2, 2), PixelFormat::Bgra8Unorm),
            Err(ShareError::Gpu(_))
        ));
    }

    #[test]
    fn test_surface_storage_refuses_writes() {
        let shared = surface(Size::new(1, 1));
        shared.lock().copy_from_slice(&[1, 2, 3, 4]);
        let storage = TextureStorage::Surface(shared.clone());
        assert!(matches!(storage.write(), Err(ShareError::Gpu(_))));
        assert_eq!(*storage.read(), vec![1, 2, 3, 4]);

        let owned = TextureStorage::zeroed(Size::new(1, 1), PixelFormat::Rgba8Unorm).unwrap();
        owned.write().unwrap().copy_from_slice(&[5, 6, 7, 8]);
        assert_eq!(*owned.read(), vec![5, 6, 7, 8]);
    }
}

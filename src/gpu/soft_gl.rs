//! Software immediate-mode context.
//!
//! Mimics the parts of a legacy GL context the sharing layer touches: integer
//! texture names, one binding per target, and a context that is current on at
//! most one thread at a time. Commands execute synchronously, so the implicit
//! ordering of a real driver holds trivially.

use super::TextureStorage;
use crate::backend::ImmediateContext;
use crate::error::{Result, ShareError};
use crate::frame::{copy_region, write_region, PixelFormat, Region, Size, TextureTarget};
use crate::transport::SharedSurface;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::debug;

struct GlTexture {
    target: TextureTarget,
    size: Size,
    format: PixelFormat,
    storage: TextureStorage,
}

#[derive(Default)]
struct GlState {
    textures: HashMap<u32, GlTexture>,
    bindings: HashMap<TextureTarget, u32>,
    next_name: u32,
}

impl GlState {
    fn texture(&self, name: u32, target: TextureTarget) -> Result<&GlTexture> {
        let texture = self
            .textures
            .get(&name)
            .ok_or_else(|| ShareError::Gpu(format!("texture {} does not exist", name)))?;
        if texture.target != target {
            return Err(ShareError::Gpu(format!(
                "texture {} is a {:?} texture, not {:?}",
                name, texture.target, target
            )));
        }
        Ok(texture)
    }

    fn insert(&mut self, texture: GlTexture) -> u32 {
        self.next_name += 1;
        let name = self.next_name;
        self.textures.insert(name, texture);
        name
    }
}

/// CPU-emulated immediate-mode context.
#[derive(Default)]
pub struct SoftGlContext {
    state: Mutex<GlState>,
    owner: Mutex<Option<ThreadId>>,
}

impl SoftGlContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the context current on the calling thread, taking it from any
    /// other thread.
    pub fn make_current(&self) {
        *self.owner.lock() = Some(thread::current().id());
    }

    /// Release the context if the calling thread holds it.
    pub fn clear_current(&self) {
        let mut owner = self.owner.lock();
        if *owner == Some(thread::current().id()) {
            *owner = None;
        }
    }

    /// Name bound to `target`, 0 if none.
    pub fn bound_texture(&self, target: TextureTarget) -> u32 {
        self.state.lock().bindings.get(&target).copied().unwrap_or(0)
    }

    pub fn texture_count(&self) -> usize {
        self.state.lock().textures.len()
    }

    fn ensure_current(&self) -> Result<()> {
        if self.is_current() {
            Ok(())
        } else {
            Err(ShareError::ContextNotCurrent)
        }
    }
}

impl ImmediateContext for SoftGlContext {
    fn is_current(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    /// Binding name 0 clears the target.
    fn bind_texture(&self, target: TextureTarget, name: u32) -> Result<()> {
        self.ensure_current()?;
        let mut state = self.state.lock();
        if name == 0 {
            state.bindings.remove(&target);
            return Ok(());
        }
        state.texture(name, target)?;
        state.bindings.insert(target, name);
        Ok(())
    }

    /// Zero when nothing is bound, like a real driver.
    fn bound_texture_size(&self, target: TextureTarget) -> Result<Size> {
        self.ensure_current()?;
        let state = self.state.lock();
        match state.bindings.get(&target) {
            Some(&name) => Ok(state.texture(name, target)?.size),
            None => Ok(Size::new(0, 0)),
        }
    }

    fn texture_format(&self, name: u32) -> Result<PixelFormat> {
        self.ensure_current()?;
        self.state
            .lock()
            .textures
            .get(&name)
            .map(|texture| texture.format)
            .ok_or_else(|| ShareError::Gpu(format!("texture {} does not exist", name)))
    }

    /// The new texture is left bound to `target`.
    fn create_texture(&self, target: TextureTarget, size: Size, format: PixelFormat) -> Result<u32> {
        self.ensure_current()?;
        if size.is_empty() {
            return Err(ShareError::InvalidRegion(format!("cannot create a {}x{} texture", size.width, size.height)));
        }
        let storage = TextureStorage::zeroed(size, format)?;
        let mut state = self.state.lock();
        let name = state.insert(GlTexture { target, size, format, storage });
        state.bindings.insert(target, name);
        Ok(name)
    }

    /// Works from any thread so subscribers can release on drop.
    fn delete_texture(&self, name: u32) {
        let mut state = self.state.lock();
        if state.textures.remove(&name).is_some() {
            state.bindings.retain(|_, bound| *bound != name);
            debug!("Deleted texture {}", name);
        }
    }

    fn write_pixels(&self, name: u32, target: TextureTarget, region: Region, bytes: &[u8]) -> Result<()> {
        self.ensure_current()?;
        let state = self.state.lock();
        let texture = state.texture(name, target)?;
        region.validate_within(texture.size)?;
        let mut pixels = texture.storage.write()?;
        write_region(&mut pixels, texture.size, texture.format.bytes_per_pixel(), region, bytes)
    }

    fn read_pixels(&self, name: u32, target: TextureTarget, region: Region, out: &mut [u8]) -> Result<()> {
        self.ensure_current()?;
        let state = self.state.lock();
        let texture = state.texture(name, target)?;
        region.validate_within(texture.size)?;
        let pixels = texture.storage.read();
        copy_region(&pixels, texture.size, texture.format.bytes_per_pixel(), region, false, out)
    }

    fn export_to_surface(
        &self,
        name: u32,
        target: TextureTarget,
        region: Region,
        flipped: bool,
        surface: &SharedSurface,
    ) -> Result<()> {
        self.ensure_current()?;
        let state = self.state.lock();
        let texture = state.texture(name, target)?;
        region.validate_within(texture.size)?;
        if surface.format() != texture.format {
            return Err(ShareError::UnsupportedFormat(texture.format));
        }
        let pixels = texture.storage.read();
        let mut out = surface.lock();
        copy_region(&pixels, texture.size, texture.format.bytes_per_pixel(), region, flipped, &mut out)
    }

    fn import_surface(&self, surface: Arc<SharedSurface>, target: TextureTarget) -> Result<u32> {
        self.ensure_current()?;
        let format = surface.format().ensure_shareable()?;
        let size = surface.size();
        let name = self.state.lock().insert(GlTexture {
            target,
            size,
            format,
            storage: TextureStorage::Surface(surface),
        });
        debug!("Imported {}x{} surface as texture {}", size.width, size.height, name);
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SurfaceId;

    #[test]
    fn test_calls_require_a_current_context() {
        let context = SoftGlContext::new();
        assert!(!context.is_current());
        assert!(matches!(
            context.create_texture(TextureTarget::Rectangle, Size::new(1, 1), PixelFormat::Rgba8Unorm),
            Err(ShareError::ContextNotCurrent)
        ));
        context.make_current();
        assert!(context.is_current());
        context.clear_current();
        assert!(!context.is_current());
    }

    #[test]
    fn test_context_is_current_on_one_thread_only() {
        let context = Arc::new(SoftGlContext::new());
        context.make_current();
        let other = context.clone();
        let elsewhere = thread::spawn(move || other.is_current()).join().unwrap();
        assert!(!elsewhere);
        assert!(context.is_current());
    }

    #[test]
    fn test_bound_size_follows_the_binding() {
        let context = SoftGlContext::new();
        context.make_current();
        let small = context.create_texture(TextureTarget::Texture2D, Size::new(2, 2), PixelFormat::Rgba8Unorm).unwrap();
        let large = context.create_texture(TextureTarget::Texture2D, Size::new(8, 4), PixelFormat::Rgba8Unorm).unwrap();
        assert_eq!(context.bound_texture_size(TextureTarget::Texture2D).unwrap(), Size::new(8, 4));

        context.bind_texture(TextureTarget::Texture2D, small).unwrap();
        assert_eq!(context.bound_texture_size(TextureTarget::Texture2D).unwrap(), Size::new(2, 2));
        assert_eq!(context.bound_texture_size(TextureTarget::Rectangle).unwrap(), Size::new(0, 0));

        context.delete_texture(small);
        assert_eq!(context.bound_texture(TextureTarget::Texture2D), 0);
        assert!(context.bind_texture(TextureTarget::Rectangle, large).is_err());
    }

    #[test]
    fn test_export_and_import_share_pixels() {
        let context = SoftGlContext::new();
        context.make_current();
        let name = context.create_texture(TextureTarget::Rectangle, Size::new(1, 2), PixelFormat::Rgba8Unorm).unwrap();
        context
            .write_pixels(name, TextureTarget::Rectangle, Region::new(0, 0, 1, 2), &[1, 1, 1, 1, 2, 2, 2, 2])
            .unwrap();

        let surface = Arc::new(SharedSurface::new(SurfaceId(1), Size::new(1, 2), PixelFormat::Rgba8Unorm).unwrap());
        context
            .export_to_surface(name, TextureTarget::Rectangle, Region::new(0, 0, 1, 2), true, &surface)
            .unwrap();
        assert_eq!(*surface.read(), vec![2, 2, 2, 2, 1, 1, 1, 1]);

        let imported = context.import_surface(surface, TextureTarget::Texture2D).unwrap();
        let mut out = [0u8; 4];
        context
            .read_pixels(imported, TextureTarget::Texture2D, Region::new(0, 0, 1, 1), &mut out)
            .unwrap();
        assert_eq!(out, [2, 2, 2, 2]);
    }
}

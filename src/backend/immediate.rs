//! Adapter for immediate-mode contexts.
//!
//! There is no command buffer to wait on: the copy into the surface is ordered
//! after earlier drawing by the context itself, and `export_to_surface`
//! flushes before the surface is presented.
//!
//! Precondition for every call: the context is current on the calling thread.
//! When a publish omits its size, the texture bound to the publish target
//! must be the texture being published.

use super::{ImmediateContext, NativeTexture};
use crate::error::{Result, ShareError};
use crate::frame::{Region, Size, TextureTarget};
use crate::server::PublishOptions;
use crate::transport::{FrameChannel, SharedSurface, SurfaceExchange};
use std::sync::Arc;
use tracing::{debug, warn};

fn texture_name(texture: &NativeTexture) -> Result<u32> {
    texture.name().ok_or(ShareError::ForeignTexture("texture handle"))
}

fn ensure_current(context: &dyn ImmediateContext) -> Result<()> {
    if context.is_current() {
        Ok(())
    } else {
        Err(ShareError::ContextNotCurrent)
    }
}

pub(crate) struct ImmediateServer {
    context: Arc<dyn ImmediateContext>,
    target: TextureTarget,
    surfaces: Arc<dyn SurfaceExchange>,
    channel: Arc<FrameChannel>,
}

impl ImmediateServer {
    pub(crate) fn new(
        context: Arc<dyn ImmediateContext>,
        target: TextureTarget,
        surfaces: Arc<dyn SurfaceExchange>,
        channel: Arc<FrameChannel>,
    ) -> Result<Self> {
        ensure_current(context.as_ref())?;
        Ok(Self { context, target, surfaces, channel })
    }

    pub(crate) fn channel(&self) -> &Arc<FrameChannel> {
        &self.channel
    }

    /// Level-0 size of whatever texture is bound to `target`.
    pub(crate) fn texture_size(&self, target: Option<TextureTarget>) -> Result<Size> {
        ensure_current(self.context.as_ref())?;
        self.context.bound_texture_size(target.unwrap_or(self.target))
    }

    pub(crate) fn publish(&self, texture: &NativeTexture, options: PublishOptions<'_>) -> Result<()> {
        ensure_current(self.context.as_ref())?;
        if options.command_buffer.is_some() {
            return Err(ShareError::ForeignTexture("command buffer"));
        }
        let name = texture_name(texture)?;
        let target = options.target.unwrap_or(self.target);
        let format = self.context.texture_format(name)?.ensure_shareable()?;
        let (region, _) = Region::resolve(options.region, options.size, || {
            self.context.bound_texture_size(target)
        })?;

        let surface = self.surfaces.export_surface(region.size(), format)?;
        self.context
            .export_to_surface(name, target, region, options.flipped, &surface)?;
        match self.channel.present(surface) {
            Some(sequence) => debug!("Texture {} published as frame {}", name, sequence),
            None => warn!("Server {} stopped while publishing texture {}", self.channel.server(), name),
        }
        Ok(())
    }
}

pub(crate) struct ImmediateClient {
    context: Arc<dyn ImmediateContext>,
    target: TextureTarget,
}

impl ImmediateClient {
    pub(crate) fn new(context: Arc<dyn ImmediateContext>, target: TextureTarget) -> Self {
        Self { context, target }
    }

    pub(crate) fn target(&self) -> TextureTarget {
        self.target
    }

    pub(crate) fn import(&self, surface: Arc<SharedSurface>) -> Result<NativeTexture> {
        ensure_current(self.context.as_ref())?;
        let name = self.context.import_surface(surface, self.target)?;
        Ok(NativeTexture::from_name(name))
    }

    pub(crate) fn release(&self, texture: &NativeTexture) {
        if let Some(name) = texture.name() {
            self.context.delete_texture(name);
        }
    }
}

//! GPU backend adaptation.
//!
//! Two incompatible command models sit behind one capability set: export a
//! local texture as the current frame, wrap a shared surface as a local
//! texture, and report texture sizes. The model is picked once, from the
//! [`BackendContext`] a publisher or subscriber is constructed with.

pub mod explicit;
pub mod immediate;

use crate::error::{Result, ShareError};
use crate::frame::{PixelFormat, Region, Size, TextureInfo, TextureTarget};
use crate::server::PublishOptions;
use crate::transport::{FrameChannel, SharedSurface, SurfaceExchange};
use explicit::{ExplicitClient, ExplicitServer};
use immediate::{ImmediateClient, ImmediateServer};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque handle to a texture owned by some backend.
///
/// Explicit devices wrap their texture objects; immediate contexts use the
/// integer texture name. Only the backend that produced a handle interprets it.
#[derive(Clone)]
pub struct NativeTexture(Handle);

#[derive(Clone)]
enum Handle {
    Object(Arc<dyn Any + Send + Sync>),
    Name(u32),
}

impl NativeTexture {
    /// Wrap a backend texture object.
    pub fn from_object<T: Any + Send + Sync>(object: T) -> Self {
        Self(Handle::Object(Arc::new(object)))
    }

    /// Wrap an integer texture name of an immediate context.
    pub fn from_name(name: u32) -> Self {
        Self(Handle::Name(name))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match &self.0 {
            Handle::Object(object) => object.downcast_ref::<T>(),
            Handle::Name(_) => None,
        }
    }

    pub fn name(&self) -> Option<u32> {
        match self.0 {
            Handle::Name(name) => Some(name),
            Handle::Object(_) => None,
        }
    }

    /// Whether both handles refer to the same texture.
    pub fn same_texture(&self, other: &NativeTexture) -> bool {
        match (&self.0, &other.0) {
            (Handle::Object(a), Handle::Object(b)) => Arc::ptr_eq(a, b),
            (Handle::Name(a), Handle::Name(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for NativeTexture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Handle::Object(object) => write!(f, "NativeTexture::Object({:p})", Arc::as_ptr(object)),
            Handle::Name(name) => write!(f, "NativeTexture::Name({})", name),
        }
    }
}

/// Execution state of a command buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBufferStatus {
    NotCommitted,
    Committed,
    Completed,
    Error(String),
}

/// Runs once the GPU has finished a command buffer (or failed it).
pub type CompletionHandler = Box<dyn FnOnce(&CommandBufferStatus) + Send>;

/// A recorded batch of GPU work on an explicit device.
///
/// Completion handlers run before `wait_until_completed` returns.
pub trait CommandBuffer: Send {
    fn add_completed_handler(&mut self, handler: CompletionHandler);

    /// Submit the recorded work. A buffer commits at most once.
    fn commit(&mut self) -> Result<()>;

    /// Block until the GPU has finished the committed work.
    fn wait_until_completed(&mut self) -> Result<()>;

    fn status(&self) -> CommandBufferStatus;

    /// Lets the device that created the buffer recover its concrete type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A GPU with an explicit command-buffer model (device + queue).
pub trait ExplicitDevice: Send + Sync {
    fn name(&self) -> String;

    /// A fresh command buffer from the device's own queue.
    fn new_command_buffer(&self) -> Box<dyn CommandBuffer>;

    fn texture_info(&self, texture: &NativeTexture) -> Result<TextureInfo>;

    /// Record a copy of `region` of `texture` into `surface`, row order
    /// reversed when `flipped`. The copy happens when the buffer executes.
    fn encode_export(
        &self,
        command_buffer: &mut dyn CommandBuffer,
        texture: &NativeTexture,
        region: Region,
        flipped: bool,
        surface: Arc<SharedSurface>,
    ) -> Result<()>;

    /// Wrap a shared surface as a texture usable on this device.
    fn import_surface(&self, surface: Arc<SharedSurface>) -> Result<NativeTexture>;

    fn create_texture(&self, size: Size, format: PixelFormat) -> Result<NativeTexture>;

    /// Upload tightly packed pixels into `region`. Completes before returning.
    fn replace_region(&self, texture: &NativeTexture, region: Region, bytes: &[u8]) -> Result<()>;

    /// Read `region` back as tightly packed pixels. Completes before returning.
    fn read_region(&self, texture: &NativeTexture, region: Region, out: &mut [u8]) -> Result<()>;
}

/// A GPU with an immediate-mode model: integer texture names in a context
/// that must be current on the calling thread.
///
/// Ordering between calls relies on the driver's implicit ordering within
/// the context. Every call below requires the context to be current on the
/// calling thread.
pub trait ImmediateContext: Send + Sync {
    /// Whether the context is current on the calling thread.
    fn is_current(&self) -> bool;

    fn bind_texture(&self, target: TextureTarget, name: u32) -> Result<()>;

    /// Level-0 size of the texture currently bound to `target`.
    fn bound_texture_size(&self, target: TextureTarget) -> Result<Size>;

    fn texture_format(&self, name: u32) -> Result<PixelFormat>;

    fn create_texture(&self, target: TextureTarget, size: Size, format: PixelFormat) -> Result<u32>;

    fn delete_texture(&self, name: u32);

    fn write_pixels(&self, name: u32, target: TextureTarget, region: Region, bytes: &[u8]) -> Result<()>;

    fn read_pixels(&self, name: u32, target: TextureTarget, region: Region, out: &mut [u8]) -> Result<()>;

    /// Copy `region` of a texture into `surface` and flush.
    fn export_to_surface(
        &self,
        name: u32,
        target: TextureTarget,
        region: Region,
        flipped: bool,
        surface: &SharedSurface,
    ) -> Result<()>;

    /// Create a texture name backed by `surface`.
    fn import_surface(&self, surface: Arc<SharedSurface>, target: TextureTarget) -> Result<u32>;
}

/// The GPU context a publisher or subscriber works in.
#[derive(Clone)]
pub enum BackendContext {
    Explicit(Arc<dyn ExplicitDevice>),
    Immediate {
        context: Arc<dyn ImmediateContext>,
        /// Layout used when a call does not name one
        target: TextureTarget,
    },
}

impl BackendContext {
    pub fn explicit(device: Arc<dyn ExplicitDevice>) -> Self {
        BackendContext::Explicit(device)
    }

    pub fn immediate(context: Arc<dyn ImmediateContext>, target: TextureTarget) -> Self {
        BackendContext::Immediate { context, target }
    }

    /// The system's default GPU through wgpu.
    pub fn system_default() -> Result<Self> {
        let device = crate::gpu::WgpuDevice::system_default()?;
        Ok(BackendContext::Explicit(Arc::new(device)))
    }

    /// The same backend with `target` as its default texture layout.
    /// Explicit backends have no layouts and come back unchanged.
    pub fn with_target(&self, target: Option<TextureTarget>) -> Self {
        match (self, target) {
            (BackendContext::Immediate { context, .. }, Some(target)) => {
                BackendContext::Immediate { context: context.clone(), target }
            }
            _ => self.clone(),
        }
    }

    /// Size and format of a texture.
    ///
    /// On the immediate backend this binds `texture` to `target` (or the
    /// default target) and must run on the thread the context is current on.
    pub fn texture_info(&self, texture: &NativeTexture, target: Option<TextureTarget>) -> Result<TextureInfo> {
        match self {
            BackendContext::Explicit(device) => device.texture_info(texture),
            BackendContext::Immediate { context, target: default_target } => {
                let name = texture.name().ok_or(ShareError::ForeignTexture("texture handle"))?;
                let target = target.unwrap_or(*default_target);
                context.bind_texture(target, name)?;
                let size = context.bound_texture_size(target)?;
                Ok(TextureInfo { size, format: context.texture_format(name)? })
            }
        }
    }
}

impl fmt::Debug for BackendContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendContext::Explicit(device) => write!(f, "BackendContext::Explicit({})", device.name()),
            BackendContext::Immediate { target, .. } => write!(f, "BackendContext::Immediate({:?})", target),
        }
    }
}

/// Server half of a backend, chosen once at construction.
pub(crate) enum ServerAdapter {
    Explicit(ExplicitServer),
    Immediate(ImmediateServer),
}

impl ServerAdapter {
    pub(crate) fn new(
        backend: BackendContext,
        surfaces: Arc<dyn SurfaceExchange>,
        channel: Arc<FrameChannel>,
    ) -> Result<Self> {
        Ok(match backend {
            BackendContext::Explicit(device) => {
                ServerAdapter::Explicit(ExplicitServer::new(device, surfaces, channel))
            }
            BackendContext::Immediate { context, target } => {
                ServerAdapter::Immediate(ImmediateServer::new(context, target, surfaces, channel)?)
            }
        })
    }

    pub(crate) fn publish(&self, texture: &NativeTexture, options: PublishOptions<'_>) -> Result<()> {
        match self {
            ServerAdapter::Explicit(server) => server.publish(texture, options),
            ServerAdapter::Immediate(server) => server.publish(texture, options),
        }
    }

    pub(crate) fn texture_size(&self, texture: &NativeTexture, target: Option<TextureTarget>) -> Result<Size> {
        match self {
            ServerAdapter::Explicit(server) => server.texture_size(texture),
            ServerAdapter::Immediate(server) => server.texture_size(target),
        }
    }

    pub(crate) fn has_clients(&self) -> bool {
        self.channel().client_count() > 0
    }

    pub(crate) fn channel(&self) -> &Arc<FrameChannel> {
        match self {
            ServerAdapter::Explicit(server) => server.channel(),
            ServerAdapter::Immediate(server) => server.channel(),
        }
    }
}

/// Client half of a backend, chosen once at construction.
pub(crate) enum ClientAdapter {
    Explicit(ExplicitClient),
    Immediate(ImmediateClient),
}

impl ClientAdapter {
    pub(crate) fn new(backend: BackendContext, import_target: TextureTarget) -> Self {
        match backend {
            BackendContext::Explicit(device) => ClientAdapter::Explicit(ExplicitClient::new(device)),
            BackendContext::Immediate { context, .. } => {
                ClientAdapter::Immediate(ImmediateClient::new(context, import_target))
            }
        }
    }

    pub(crate) fn import(&self, surface: Arc<SharedSurface>) -> Result<NativeTexture> {
        match self {
            ClientAdapter::Explicit(client) => client.import(surface),
            ClientAdapter::Immediate(client) => client.import(surface),
        }
    }

    pub(crate) fn release(&self, texture: &NativeTexture) {
        match self {
            ClientAdapter::Explicit(_) => {}
            ClientAdapter::Immediate(client) => client.release(texture),
        }
    }

    /// Layout imported textures have, if the backend distinguishes layouts.
    pub(crate) fn import_target(&self) -> Option<TextureTarget> {
        match self {
            ClientAdapter::Explicit(_) => None,
            ClientAdapter::Immediate(client) => Some(client.target()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_texture_identity() {
        let a = NativeTexture::from_object(7u64);
        let b = a.clone();
        let c = NativeTexture::from_object(7u64);
        assert!(a.same_texture(&b));
        assert!(!a.same_texture(&c));
        assert_eq!(a.downcast_ref::<u64>(), Some(&7));
        assert!(a.downcast_ref::<u32>().is_none());
        assert_eq!(a.name(), None);

        let named = NativeTexture::from_name(3);
        assert_eq!(named.name(), Some(3));
        assert!(named.same_texture(&NativeTexture::from_name(3)));
        assert!(!named.same_texture(&a));
    }
}

//! Publisher: announces a texture source and publishes frames to it.

use crate::backend::{BackendContext, CommandBuffer, NativeTexture, ServerAdapter};
use crate::directory::{ServerDescription, ServerIcon, ServerId};
use crate::error::{Result, ShareError};
use crate::frame::{Region, Size, TextureTarget};
use crate::transport::{FrameChannel, Notification, NotificationCenter, ObserverId, SurfaceExchange, Topic, Transport};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Optional parameters of [`Publisher::publish_frame_texture`].
///
/// Everything defaults: the whole texture, not flipped, the backend's default
/// target, an internal command buffer, and waiting for GPU completion unless
/// the configuration says otherwise.
#[derive(Default)]
pub struct PublishOptions<'a> {
    /// Part of the texture to publish
    pub region: Option<Region>,
    /// Texture size, queried from the backend when absent
    pub size: Option<Size>,
    /// Reverse the row order of the exported copy
    pub flipped: bool,
    /// Texture layout (immediate backend only)
    pub target: Option<TextureTarget>,
    /// Record into this buffer instead of an internal one (explicit backend only)
    pub command_buffer: Option<&'a mut dyn CommandBuffer>,
    /// Commit and wait for completion before returning
    pub auto_commit: Option<bool>,
}

impl<'a> PublishOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn region(mut self, region: Region) -> Self {
        self.region = Some(region);
        self
    }

    pub fn size(mut self, size: Size) -> Self {
        self.size = Some(size);
        self
    }

    pub fn flipped(mut self, flipped: bool) -> Self {
        self.flipped = flipped;
        self
    }

    pub fn target(mut self, target: TextureTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn command_buffer(mut self, command_buffer: &'a mut dyn CommandBuffer) -> Self {
        self.command_buffer = Some(command_buffer);
        self
    }

    pub fn auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = Some(auto_commit);
        self
    }
}

/// Lifecycle of a publisher. Construction announces, so a publisher is
/// running as soon as it exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Running,
    Stopped,
}

/// Source side of the protocol.
///
/// Publishing a frame exports a fresh shared surface and makes it the
/// server's current frame; subscribers that imported an earlier frame keep it.
pub struct Publisher {
    description: Arc<Mutex<ServerDescription>>,
    notifications: Arc<dyn NotificationCenter>,
    surfaces: Arc<dyn SurfaceExchange>,
    adapter: ServerAdapter,
    request_observer: Option<ObserverId>,
    default_auto_commit: bool,
    state: PublisherState,
}

impl Publisher {
    /// Announce a new server named `name`.
    ///
    /// Without a backend the system's default GPU is used. On the immediate
    /// backend the context must be current on the calling thread.
    pub fn new(name: &str, transport: &Transport, backend: Option<BackendContext>) -> Result<Self> {
        let config = transport.config();
        let backend = match backend {
            Some(backend) => backend,
            None => BackendContext::system_default()?,
        };
        let icon = config.icon.as_deref().and_then(|path| match ServerIcon::load(path) {
            Ok(icon) => Some(Arc::new(icon)),
            Err(e) => {
                warn!("Ignoring server icon: {:#}", e);
                None
            }
        });
        let description = ServerDescription {
            id: ServerId::new(),
            name: name.to_string(),
            app_name: config.resolved_app_name(),
            icon,
        };

        let notifications = transport.notifications().clone();
        let surfaces = transport.surfaces().clone();
        let channel = surfaces.open_channel(description.id)?;
        let adapter = match ServerAdapter::new(backend, surfaces.clone(), channel) {
            Ok(adapter) => adapter,
            Err(e) => {
                surfaces.close_channel(description.id);
                return Err(e);
            }
        };

        let mut publisher = Self {
            description: Arc::new(Mutex::new(description)),
            notifications,
            surfaces,
            adapter,
            request_observer: None,
            default_auto_commit: config.auto_commit,
            state: PublisherState::Running,
        };
        // On failure the publisher drops, which retires and closes what was set up.
        publisher.request_observer = Some(publisher.observe_requests()?);
        publisher.post(Topic::Announce)?;
        info!("Announced server '{}' ({})", publisher.name(), publisher.id());
        Ok(publisher)
    }

    /// Re-announce whenever a directory asks for live servers.
    fn observe_requests(&self) -> Result<ObserverId> {
        let description = self.description.clone();
        let center: Weak<dyn NotificationCenter> = Arc::downgrade(&self.notifications);
        self.notifications.add_observer(
            Topic::Request,
            Arc::new(move |_: &Notification| {
                let Some(center) = center.upgrade() else {
                    return;
                };
                let announcement = Notification::server(Topic::Announce, description.lock().clone());
                if let Err(e) = center.post(announcement) {
                    warn!("Failed to re-announce server: {}", e);
                }
            }),
        )
    }

    fn post(&self, topic: Topic) -> Result<()> {
        let description = self.description.lock().clone();
        self.notifications.post(Notification::server(topic, description))
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state {
            PublisherState::Running => Ok(()),
            PublisherState::Stopped => Err(ShareError::AlreadyStopped("publisher")),
        }
    }

    /// Publish `texture` (or a region of it) as the new current frame.
    ///
    /// With auto-commit (the default) this returns once the exported surface
    /// is fully written and visible to subscribers. The texture may be reused
    /// for the next frame after that.
    pub fn publish_frame_texture(&mut self, texture: &NativeTexture, mut options: PublishOptions<'_>) -> Result<()> {
        self.ensure_running()?;
        options.auto_commit = Some(options.auto_commit.unwrap_or(self.default_auto_commit));
        self.adapter.publish(texture, options)?;
        debug!("Server '{}' published {:?}", self.name(), texture);
        Ok(())
    }

    /// Signal the current frame again without exporting a new surface.
    /// Does nothing before the first publish.
    pub fn publish(&mut self) -> Result<()> {
        self.ensure_running()?;
        if self.channel().republish().is_none() {
            debug!("Server '{}' has no frame to republish", self.name());
        }
        Ok(())
    }

    /// Size the backend reports for `texture`. On the immediate backend this
    /// is the size of the texture bound to `target`.
    pub fn texture_size(&self, texture: &NativeTexture, target: Option<TextureTarget>) -> Result<Size> {
        self.ensure_running()?;
        self.adapter.texture_size(texture, target)
    }

    /// Whether at least one subscriber is bound. Always false once stopped.
    pub fn has_clients(&self) -> bool {
        self.state == PublisherState::Running && self.adapter.has_clients()
    }

    /// Rename the server and tell the directory.
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        self.ensure_running()?;
        self.description.lock().name = name.to_string();
        self.post(Topic::Update)
    }

    pub fn description(&self) -> ServerDescription {
        self.description.lock().clone()
    }

    pub fn name(&self) -> String {
        self.description.lock().name.clone()
    }

    pub fn id(&self) -> ServerId {
        self.description.lock().id
    }

    pub fn state(&self) -> PublisherState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == PublisherState::Running
    }

    fn channel(&self) -> &Arc<FrameChannel> {
        self.adapter.channel()
    }

    /// Retire the server. Subscribers see their source go away; frames they
    /// already imported stay valid. Stopping twice is a no-op.
    pub fn stop(&mut self) {
        if self.state == PublisherState::Stopped {
            return;
        }
        self.state = PublisherState::Stopped;
        if let Some(id) = self.request_observer.take() {
            self.notifications.remove_observer(id);
        }
        if let Err(e) = self.post(Topic::Retire) {
            warn!("Failed to retire server '{}': {}", self.name(), e);
        }
        self.surfaces.close_channel(self.id());
        info!("Stopped server '{}' ({})", self.name(), self.id());
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("description", &*self.description.lock())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ExplicitDevice, ImmediateContext};
    use crate::config::ShareConfig;
    use crate::directory::ServerDirectory;
    use crate::frame::PixelFormat;
    use crate::gpu::{SoftDevice, SoftGlContext};
    use crate::transport::LocalNotificationCenter;
    use crate::transport::LocalSurfaceExchange;

    fn transport() -> Transport {
        Transport::local_with_config(ShareConfig {
            app_name: Some("Tests".into()),
            run_loop_interval_ms: 10,
            ..Default::default()
        })
    }

    fn soft_backend() -> (Arc<SoftDevice>, BackendContext) {
        let device = Arc::new(SoftDevice::new("test").unwrap());
        (device.clone(), BackendContext::explicit(device))
    }

    #[test]
    fn test_publisher_announces_and_answers_directory_requests() {
        let transport = transport();
        let (_, backend) = soft_backend();
        let publisher = Publisher::new("Main", &transport, Some(backend)).unwrap();

        // Created after the announcement went out; its request triggers a re-announce.
        let directory = ServerDirectory::new(&transport).unwrap();
        let listed = directory.list().unwrap();
        assert_eq!(listed, vec![publisher.description()]);
        assert_eq!(listed[0].app_name, "Tests");
    }

    #[test]
    fn test_set_name_posts_an_update() {
        let transport = transport();
        let directory = ServerDirectory::new(&transport).unwrap();
        let (_, backend) = soft_backend();
        let mut publisher = Publisher::new("Main", &transport, Some(backend)).unwrap();
        publisher.set_name("Renamed").unwrap();
        let listed = directory.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "Renamed");
    }

    #[test]
    fn test_publish_presents_a_frame_and_republish_reuses_it() {
        let transport = transport();
        let (device, backend) = soft_backend();
        let mut publisher = Publisher::new("Main", &transport, Some(backend)).unwrap();
        let texture = device.create_texture(Size::new(4, 4), PixelFormat::Rgba8Unorm).unwrap();

        publisher.publish_frame_texture(&texture, PublishOptions::new()).unwrap();
        let first = publisher.channel().latest().unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.surface.size(), Size::new(4, 4));

        publisher.publish().unwrap();
        let again = publisher.channel().latest().unwrap();
        assert_eq!(again.sequence, 2);
        assert!(Arc::ptr_eq(&first.surface, &again.surface));
    }

    #[test]
    fn test_unsupported_format_is_rejected_before_export() {
        let transport = transport();
        let (device, backend) = soft_backend();
        let mut publisher = Publisher::new("Main", &transport, Some(backend)).unwrap();
        let texture = device.create_texture(Size::new(2, 2), PixelFormat::Rgba16Float).unwrap();
        assert!(matches!(
            publisher.publish_frame_texture(&texture, PublishOptions::new()),
            Err(ShareError::UnsupportedFormat(PixelFormat::Rgba16Float))
        ));
        assert!(publisher.channel().latest().is_none());
    }

    #[test]
    fn test_deferred_command_buffer_presents_on_caller_commit() {
        let transport = transport();
        let (device, backend) = soft_backend();
        let mut publisher = Publisher::new("Main", &transport, Some(backend)).unwrap();
        let texture = device.create_texture(Size::new(2, 2), PixelFormat::Rgba8Unorm).unwrap();

        let mut command_buffer = device.new_command_buffer();
        publisher
            .publish_frame_texture(
                &texture,
                PublishOptions::new().command_buffer(command_buffer.as_mut()).auto_commit(false),
            )
            .unwrap();
        assert_eq!(publisher.channel().sequence(), 0);

        command_buffer.commit().unwrap();
        command_buffer.wait_until_completed().unwrap();
        assert_eq!(publisher.channel().sequence(), 1);
    }

    #[test]
    fn test_immediate_publish_requires_the_context_on_this_thread() {
        let transport = transport();
        let context = Arc::new(SoftGlContext::new());
        let backend = BackendContext::immediate(context.clone(), TextureTarget::Rectangle);
        assert!(matches!(
            Publisher::new("Main", &transport, Some(backend.clone())),
            Err(ShareError::ContextNotCurrent)
        ));

        context.make_current();
        let mut publisher = Publisher::new("Main", &transport, Some(backend)).unwrap();
        let name = context.create_texture(TextureTarget::Rectangle, Size::new(3, 2), PixelFormat::Bgra8Unorm).unwrap();
        let texture = NativeTexture::from_name(name);
        assert_eq!(publisher.texture_size(&texture, None).unwrap(), Size::new(3, 2));

        context.clear_current();
        assert!(matches!(
            publisher.publish_frame_texture(&texture, PublishOptions::new()),
            Err(ShareError::ContextNotCurrent)
        ));
        context.make_current();
        publisher.publish_frame_texture(&texture, PublishOptions::new()).unwrap();
        let frame = publisher.channel().latest().unwrap();
        assert_eq!(frame.surface.format(), PixelFormat::Bgra8Unorm);
        assert_eq!(frame.surface.size(), Size::new(3, 2));
    }

    #[test]
    fn test_failed_announce_leaves_nothing_behind() {
        let center = Arc::new(LocalNotificationCenter::new());
        let transport = Transport::new(center.clone(), Arc::new(LocalSurfaceExchange::new()), ShareConfig::default());
        center.shutdown();
        let (_, backend) = soft_backend();
        assert!(matches!(
            Publisher::new("Main", &transport, Some(backend)),
            Err(ShareError::RegistryUnavailable(_))
        ));
        assert_eq!(center.observer_count(), 0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let transport = transport();
        let (_, backend) = soft_backend();
        let mut publisher = Publisher::new("Main", &transport, Some(backend)).unwrap();
        publisher.stop();
        publisher.stop();
        assert_eq!(publisher.state(), PublisherState::Stopped);
        assert!(!publisher.has_clients());
        assert!(matches!(publisher.publish(), Err(ShareError::AlreadyStopped("publisher"))));
        assert!(matches!(publisher.set_name("Other"), Err(ShareError::AlreadyStopped(_))));
    }
}

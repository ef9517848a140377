//! Inter-process plumbing: directory notifications and shared surfaces.

pub mod notify;
pub mod surface;

pub use notify::{
    LocalNotificationCenter, Notification, NotificationCenter, NotificationHandler, ObserverId, Topic,
};
pub use surface::{
    FrameChannel, FrameListener, ListenerId, LocalSurfaceExchange, PresentedFrame, SharedSurface,
    SurfaceExchange, SurfaceId,
};

use crate::config::ShareConfig;
use std::sync::Arc;

/// Everything a directory, publisher or subscriber needs to reach its peers.
///
/// Cheap to clone; components keep their own copy. There is no global
/// instance, so tests and applications can run isolated transports side by side.
#[derive(Clone)]
pub struct Transport {
    notifications: Arc<dyn NotificationCenter>,
    surfaces: Arc<dyn SurfaceExchange>,
    config: ShareConfig,
}

impl Transport {
    pub fn new(
        notifications: Arc<dyn NotificationCenter>,
        surfaces: Arc<dyn SurfaceExchange>,
        config: ShareConfig,
    ) -> Self {
        Self { notifications, surfaces, config }
    }

    /// A process-local transport with default settings.
    pub fn local() -> Self {
        Self::local_with_config(ShareConfig::default())
    }

    /// A process-local transport.
    pub fn local_with_config(config: ShareConfig) -> Self {
        Self::new(
            Arc::new(LocalNotificationCenter::new()),
            Arc::new(LocalSurfaceExchange::new()),
            config,
        )
    }

    pub fn notifications(&self) -> &Arc<dyn NotificationCenter> {
        &self.notifications
    }

    pub fn surfaces(&self) -> &Arc<dyn SurfaceExchange> {
        &self.surfaces
    }

    pub fn config(&self) -> &ShareConfig {
        &self.config
    }
}

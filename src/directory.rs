//! Server directory: discovery of the texture sources running on this machine.

use crate::error::Result;
use crate::transport::{Notification, NotificationCenter, ObserverId, Topic, Transport};
use anyhow::Context;
use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Unique identifier of a server, stable for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerId(Uuid);

impl ServerId {
    /// A fresh random identifier.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Icon announced with a server, as tightly packed RGBA8 pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIcon {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl ServerIcon {
    pub fn from_image(image: &image::RgbaImage) -> Self {
        Self { width: image.width(), height: image.height(), rgba: image.as_raw().clone() }
    }

    /// Decode an icon from an image file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let image = image::open(path).with_context(|| format!("Failed to open icon {:?}", path))?;
        Ok(Self::from_image(&image.to_rgba8()))
    }
}

/// What the directory knows about one server.
///
/// The `id` doubles as the handle clients connect with; the description is
/// all a subscriber needs to bind to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescription {
    pub id: ServerId,
    pub name: String,
    pub app_name: String,
    pub icon: Option<Arc<ServerIcon>>,
}

/// Directory events callers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerNotification {
    /// A server was announced
    Announced,
    /// A server changed its description
    Updated,
    /// A server was retired
    Retired,
}

impl ServerNotification {
    fn topic(self) -> Topic {
        match self {
            ServerNotification::Announced => Topic::Announce,
            ServerNotification::Updated => Topic::Update,
            ServerNotification::Retired => Topic::Retire,
        }
    }
}

/// How the fields of a [`ServerQuery`] combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// A server matches if any given field matches
    #[default]
    Any,
    /// A server matches only if every given field matches
    All,
}

/// Exact-match filter over the directory listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerQuery {
    pub name: Option<String>,
    pub app_name: Option<String>,
    pub mode: MatchMode,
}

impl ServerQuery {
    pub fn matches(&self, server: &ServerDescription) -> bool {
        let name = self.name.as_ref().map(|name| *name == server.name);
        let app_name = self.app_name.as_ref().map(|app| *app == server.app_name);
        let checks = [name, app_name];
        let mut given = checks.iter().flatten().peekable();
        if given.peek().is_none() {
            return false;
        }
        match self.mode {
            MatchMode::Any => given.any(|matched| *matched),
            MatchMode::All => given.all(|matched| *matched),
        }
    }
}

/// Catalog of announced servers.
///
/// The catalog is maintained from announce/update/retire notifications and
/// only changes while the notification loop is pumped, which `list` does once
/// per call. A directory is meant to be used from one thread at a time.
pub struct ServerDirectory {
    notifications: Arc<dyn NotificationCenter>,
    servers: Arc<Mutex<Vec<ServerDescription>>>,
    observers: Vec<ObserverId>,
    subscriptions: Vec<ObserverId>,
    run_loop_interval: Duration,
}

impl ServerDirectory {
    /// Create a directory and ask running servers to announce themselves.
    pub fn new(transport: &Transport) -> Result<Self> {
        let notifications = transport.notifications().clone();
        let servers: Arc<Mutex<Vec<ServerDescription>>> = Arc::new(Mutex::new(Vec::new()));

        let mut observers = Vec::new();
        for topic in [Topic::Announce, Topic::Update, Topic::Retire] {
            let catalog = servers.clone();
            let id = notifications.add_observer(
                topic,
                Arc::new(move |notification: &Notification| {
                    if let Some(description) = &notification.description {
                        Self::apply(&mut catalog.lock(), topic, description);
                    }
                }),
            )?;
            observers.push(id);
        }

        let directory = Self {
            notifications,
            servers,
            observers,
            subscriptions: Vec::new(),
            run_loop_interval: transport.config().run_loop_interval(),
        };
        directory.notifications.post(Notification::request())?;
        info!("Server directory created (run loop interval {:?})", directory.run_loop_interval);
        Ok(directory)
    }

    fn apply(catalog: &mut Vec<ServerDescription>, topic: Topic, description: &ServerDescription) {
        match topic {
            Topic::Announce | Topic::Update => {
                if let Some(existing) = catalog.iter_mut().find(|server| server.id == description.id) {
                    *existing = description.clone();
                } else {
                    debug!("Directory learned of '{}' ({})", description.name, description.id);
                    catalog.push(description.clone());
                }
            }
            Topic::Retire => {
                catalog.retain(|server| server.id != description.id);
                debug!("Directory dropped '{}' ({})", description.name, description.id);
            }
            Topic::Request => {}
        }
    }

    /// All currently announced servers, after one pump of the notification loop.
    pub fn list(&self) -> Result<Vec<ServerDescription>> {
        self.update_run_loop()?;
        Ok(self.servers.lock().clone())
    }

    /// Alias of [`list`](Self::list).
    pub fn servers(&self) -> Result<Vec<ServerDescription>> {
        self.list()
    }

    /// Pump the notification loop once, blocking at most one run loop interval.
    pub fn update_run_loop(&self) -> Result<usize> {
        self.notifications.run_loop(self.run_loop_interval)
    }

    /// Servers whose name or application name equals the given value.
    ///
    /// Matches when *either* given field matches (`MatchMode::Any`); use
    /// [`find_with`](Self::find_with) for a strict match on both. With no
    /// field given nothing matches.
    pub fn find(&self, name: Option<&str>, app_name: Option<&str>) -> Result<Vec<ServerDescription>> {
        self.find_with(&ServerQuery {
            name: name.map(str::to_string),
            app_name: app_name.map(str::to_string),
            mode: MatchMode::Any,
        })
    }

    pub fn find_with(&self, query: &ServerQuery) -> Result<Vec<ServerDescription>> {
        Ok(self.list()?.into_iter().filter(|server| query.matches(server)).collect())
    }

    /// Call `handler` for every matching event delivered while the loop is pumped.
    pub fn subscribe<F>(&mut self, notification: ServerNotification, handler: F) -> Result<ObserverId>
    where
        F: Fn(&ServerDescription) + Send + Sync + 'static,
    {
        let id = self.notifications.add_observer(
            notification.topic(),
            Arc::new(move |notification: &Notification| {
                if let Some(description) = &notification.description {
                    handler(description);
                }
            }),
        )?;
        self.subscriptions.push(id);
        Ok(id)
    }

    pub fn unsubscribe(&mut self, id: ObserverId) {
        self.notifications.remove_observer(id);
        self.subscriptions.retain(|subscription| *subscription != id);
    }

    pub fn run_loop_interval(&self) -> Duration {
        self.run_loop_interval
    }

    pub fn set_run_loop_interval(&mut self, interval: Duration) {
        self.run_loop_interval = interval;
    }
}

impl Drop for ServerDirectory {
    fn drop(&mut self) {
        for id in self.observers.drain(..).chain(self.subscriptions.drain(..)) {
            self.notifications.remove_observer(id);
        }
    }
}

impl fmt::Debug for ServerDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerDirectory")
            .field("servers", &self.servers.lock().len())
            .field("run_loop_interval", &self.run_loop_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShareConfig;
    use crate::error::ShareError;
    use crate::transport::LocalNotificationCenter;
    use crate::transport::LocalSurfaceExchange;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn description(name: &str, app_name: &str) -> ServerDescription {
        ServerDescription { id: ServerId::new(), name: name.into(), app_name: app_name.into(), icon: None }
    }

    fn transport() -> Transport {
        Transport::local_with_config(ShareConfig { run_loop_interval_ms: 10, ..Default::default() })
    }

    #[test]
    fn test_catalog_follows_announce_update_retire() {
        let transport = transport();
        let directory = ServerDirectory::new(&transport).unwrap();
        let center = transport.notifications();

        let mut server = description("Main", "Mixer");
        center.post(Notification::server(Topic::Announce, server.clone())).unwrap();
        assert_eq!(directory.list().unwrap(), vec![server.clone()]);

        server.name = "Renamed".into();
        center.post(Notification::server(Topic::Update, server.clone())).unwrap();
        assert_eq!(directory.list().unwrap()[0].name, "Renamed");

        center.post(Notification::server(Topic::Retire, server)).unwrap();
        assert!(directory.list().unwrap().is_empty());
    }

    #[test]
    fn test_find_uses_any_semantics_and_find_with_can_require_all() {
        let transport = transport();
        let directory = ServerDirectory::new(&transport).unwrap();
        let center = transport.notifications();
        let a = description("Main", "Mixer");
        let b = description("Preview", "Mixer");
        let c = description("Main", "Player");
        for server in [&a, &b, &c] {
            center.post(Notification::server(Topic::Announce, server.clone())).unwrap();
        }

        let any = directory.find(Some("Main"), Some("Mixer")).unwrap();
        assert_eq!(any.len(), 3);

        let all = directory
            .find_with(&ServerQuery {
                name: Some("Main".into()),
                app_name: Some("Mixer".into()),
                mode: MatchMode::All,
            })
            .unwrap();
        assert_eq!(all, vec![a]);

        assert_eq!(directory.find(None, Some("Player")).unwrap(), vec![c]);
        assert!(directory.find(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_subscribers_only_hear_their_topic() {
        let transport = transport();
        let mut directory = ServerDirectory::new(&transport).unwrap();
        let retired = Arc::new(AtomicUsize::new(0));
        let counter = retired.clone();
        let id = directory
            .subscribe(ServerNotification::Retired, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let server = description("Main", "Mixer");
        let center = transport.notifications();
        center.post(Notification::server(Topic::Announce, server.clone())).unwrap();
        center.post(Notification::server(Topic::Retire, server.clone())).unwrap();
        directory.update_run_loop().unwrap();
        assert_eq!(retired.load(Ordering::SeqCst), 1);

        directory.unsubscribe(id);
        center.post(Notification::server(Topic::Retire, server)).unwrap();
        directory.update_run_loop().unwrap();
        assert_eq!(retired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unavailable_transport_is_reported() {
        let center = Arc::new(LocalNotificationCenter::new());
        let transport = Transport::new(center.clone(), Arc::new(LocalSurfaceExchange::new()), ShareConfig::default());
        center.shutdown();
        assert!(matches!(ServerDirectory::new(&transport), Err(ShareError::RegistryUnavailable(_))));
    }

    #[test]
    fn test_list_fails_when_transport_goes_away() {
        let center = Arc::new(LocalNotificationCenter::new());
        let transport = Transport::new(center.clone(), Arc::new(LocalSurfaceExchange::new()), ShareConfig::default());
        let directory = ServerDirectory::new(&transport).unwrap();
        center.shutdown();
        assert!(matches!(directory.list(), Err(ShareError::RegistryUnavailable(_))));
    }

    #[test]
    fn test_dropping_the_directory_unregisters_its_observers() {
        let center = Arc::new(LocalNotificationCenter::new());
        let transport = Transport::new(center.clone(), Arc::new(LocalSurfaceExchange::new()), ShareConfig::default());
        let mut directory = ServerDirectory::new(&transport).unwrap();
        directory.subscribe(ServerNotification::Announced, |_| {}).unwrap();
        assert_eq!(center.observer_count(), 4);
        drop(directory);
        assert_eq!(center.observer_count(), 0);
    }
}

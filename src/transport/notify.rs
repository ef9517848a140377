//! Directory notification transport.
//!
//! Publishers announce, update and retire themselves by posting
//! notifications; directories observe them. Delivery happens only while some
//! thread pumps the loop with [`NotificationCenter::run_loop`].

use crate::directory::ServerDescription;
use crate::error::{Result, ShareError};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Notification topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A server came up
    Announce,
    /// A server changed its description
    Update,
    /// A server went away
    Retire,
    /// A directory asks every live server to announce itself again
    Request,
}

impl Topic {
    /// Wire name of the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Announce => "texshare.server.announce",
            Topic::Update => "texshare.server.update",
            Topic::Retire => "texshare.server.retire",
            Topic::Request => "texshare.directory.request",
        }
    }
}

/// One posted notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub topic: Topic,
    /// Present for server topics, absent for `Request`
    pub description: Option<ServerDescription>,
}

impl Notification {
    pub fn server(topic: Topic, description: ServerDescription) -> Self {
        Self { topic, description: Some(description) }
    }

    pub fn request() -> Self {
        Self { topic: Topic::Request, description: None }
    }
}

/// Token identifying a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Callback invoked for each delivered notification.
pub type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Register-by-topic, receive-by-topic notification transport.
pub trait NotificationCenter: Send + Sync {
    /// Queue a notification for delivery. Topics nobody observes are dropped.
    fn post(&self, notification: Notification) -> Result<()>;

    /// Register `handler` for every notification posted on `topic`.
    fn add_observer(&self, topic: Topic, handler: NotificationHandler) -> Result<ObserverId>;

    /// Unregister an observer. Unknown ids are ignored.
    fn remove_observer(&self, id: ObserverId);

    /// Deliver pending notifications on the calling thread.
    ///
    /// Blocks up to `timeout` while nothing is pending, then drains the queue
    /// (including anything handlers post meanwhile) and returns the number of
    /// notifications delivered.
    fn run_loop(&self, timeout: Duration) -> Result<usize>;
}

struct Observer {
    id: ObserverId,
    topic: Topic,
    handler: NotificationHandler,
}

#[derive(Default)]
struct CenterState {
    queue: VecDeque<Notification>,
    observers: Vec<Observer>,
    next_observer: u64,
    closed: bool,
}

/// Process-local notification center.
#[derive(Default)]
pub struct LocalNotificationCenter {
    state: Mutex<CenterState>,
    pending: Condvar,
}

impl LocalNotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the center down. Every later call fails with `RegistryUnavailable`
    /// and blocked `run_loop` calls return.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.queue.clear();
        state.observers.clear();
        self.pending.notify_all();
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    /// Number of notifications waiting for a pump.
    pub fn pending_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn unavailable() -> ShareError {
        ShareError::RegistryUnavailable("notification center has shut down".to_string())
    }
}

impl NotificationCenter for LocalNotificationCenter {
    fn post(&self, notification: Notification) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Self::unavailable());
        }
        if !state.observers.iter().any(|observer| observer.topic == notification.topic) {
            debug!("Dropping {}: no observers", notification.topic.as_str());
            return Ok(());
        }
        debug!("Posting {}", notification.topic.as_str());
        state.queue.push_back(notification);
        self.pending.notify_all();
        Ok(())
    }

    fn add_observer(&self, topic: Topic, handler: NotificationHandler) -> Result<ObserverId> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Self::unavailable());
        }
        state.next_observer += 1;
        let id = ObserverId(state.next_observer);
        state.observers.push(Observer { id, topic, handler });
        Ok(id)
    }

    fn remove_observer(&self, id: ObserverId) {
        self.state.lock().observers.retain(|observer| observer.id != id);
    }

    fn run_loop(&self, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.queue.is_empty() && !state.closed {
            if self.pending.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.closed {
            return Err(Self::unavailable());
        }

        let mut delivered = 0;
        while let Some(notification) = state.queue.pop_front() {
            let handlers: Vec<NotificationHandler> = state
                .observers
                .iter()
                .filter(|observer| observer.topic == notification.topic)
                .map(|observer| observer.handler.clone())
                .collect();

            // Handlers may post or (un)register, so they run unlocked.
            drop(state);
            for handler in &handlers {
                handler(&notification);
            }
            delivered += 1;
            state = self.state.lock();
        }
        Ok(delivered)
    }
}

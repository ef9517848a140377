//! Shared-surface primitive and per-server frame channels.
//!
//! A [`SharedSurface`] stands in for the platform's cross-process GPU surface:
//! a fixed-size pixel store that every holder references through an `Arc`.
//! Publishers never write into a surface a subscriber may already hold; each
//! published frame goes into a freshly exported one.

use crate::directory::ServerId;
use crate::error::{Result, ShareError};
use crate::frame::{PixelFormat, Size};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Global identifier of a shared surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u32);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

/// A cross-process pixel surface.
pub struct SharedSurface {
    id: SurfaceId,
    size: Size,
    format: PixelFormat,
    pixels: RwLock<Vec<u8>>,
}

impl SharedSurface {
    /// Allocate a zeroed surface. Only 8-bit RGBA/BGRA surfaces exist.
    pub fn new(id: SurfaceId, size: Size, format: PixelFormat) -> Result<Self> {
        format.ensure_shareable()?;
        if size.is_empty() {
            return Err(ShareError::InvalidRegion(format!(
                "cannot export an empty {}x{} surface",
                size.width, size.height
            )));
        }
        Ok(Self { id, size, format, pixels: RwLock::new(vec![0; size.byte_len(format)]) })
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn bytes_per_row(&self) -> usize {
        self.size.width as usize * self.format.bytes_per_pixel()
    }

    /// Shared access to the pixels (tightly packed rows).
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.pixels.read()
    }

    /// Exclusive access for the GPU backend filling a freshly exported surface.
    pub fn lock(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.pixels.write()
    }
}

impl fmt::Debug for SharedSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSurface")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("format", &self.format)
            .finish()
    }
}

/// The frame a server currently offers.
#[derive(Debug, Clone)]
pub struct PresentedFrame {
    /// Monotonic per-server frame counter, starting at 1
    pub sequence: u64,
    pub surface: Arc<SharedSurface>,
}

/// Callback run whenever a server presents a frame. Receives the new sequence.
pub type FrameListener = Arc<dyn Fn(u64) + Send + Sync>;

/// Token identifying a frame listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct ChannelState {
    current: Option<PresentedFrame>,
    sequence: u64,
    listeners: Vec<(ListenerId, FrameListener)>,
    next_listener: u64,
}

/// Connection point between one server and its clients.
///
/// Holds the server's current surface, a frame sequence clients compare
/// against to detect new frames, and the number of connected clients.
pub struct FrameChannel {
    server: ServerId,
    state: Mutex<ChannelState>,
    open: AtomicBool,
    clients: AtomicUsize,
}

impl FrameChannel {
    pub fn new(server: ServerId) -> Self {
        Self {
            server,
            state: Mutex::new(ChannelState::default()),
            open: AtomicBool::new(true),
            clients: AtomicUsize::new(0),
        }
    }

    pub fn server(&self) -> ServerId {
        self.server
    }

    /// Make `surface` the current frame. Returns the new sequence, or `None`
    /// once the channel is closed.
    pub fn present(&self, surface: Arc<SharedSurface>) -> Option<u64> {
        let (sequence, listeners) = {
            let mut state = self.state.lock();
            if !self.is_open() {
                return None;
            }
            state.sequence += 1;
            let sequence = state.sequence;
            debug!("Server {} presents {} as frame {}", self.server, surface.id(), sequence);
            state.current = Some(PresentedFrame { sequence, surface });
            (sequence, Self::listeners(&state))
        };
        for listener in listeners {
            listener(sequence);
        }
        Some(sequence)
    }

    /// Signal the current surface again as a new frame.
    pub fn republish(&self) -> Option<u64> {
        let surface = self.state.lock().current.as_ref()?.surface.clone();
        self.present(surface)
    }

    /// The current frame, if any has been presented.
    pub fn latest(&self) -> Option<PresentedFrame> {
        self.state.lock().current.clone()
    }

    /// The current frame, read under the same lock `close` takes, so a closed
    /// channel is never mistaken for one that has not presented yet.
    pub fn current(&self) -> Result<Option<PresentedFrame>> {
        let state = self.state.lock();
        if !self.is_open() {
            return Err(ShareError::SourceGone(self.server.to_string()));
        }
        Ok(state.current.clone())
    }

    /// Sequence of the most recent frame (0 before the first).
    pub fn sequence(&self) -> u64 {
        self.state.lock().sequence
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Close the channel and drop the server's reference to its current surface.
    /// Clients that imported that surface keep their own reference.
    pub fn close(&self) {
        let mut state = self.state.lock();
        self.open.store(false, Ordering::SeqCst);
        state.current = None;
        state.listeners.clear();
    }

    pub fn attach_client(&self) -> usize {
        self.clients.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn detach_client(&self) -> usize {
        let previous = self
            .clients
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| Some(count.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    pub fn add_listener(&self, listener: FrameListener) -> ListenerId {
        let mut state = self.state.lock();
        state.next_listener += 1;
        let id = ListenerId(state.next_listener);
        state.listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.state.lock().listeners.retain(|(listener, _)| *listener != id);
    }

    fn listeners(state: &ChannelState) -> Vec<FrameListener> {
        state.listeners.iter().map(|(_, listener)| listener.clone()).collect()
    }
}

/// Export surfaces and connect servers with their clients.
pub trait SurfaceExchange: Send + Sync {
    /// Allocate a new shared surface ("export").
    fn export_surface(&self, size: Size, format: PixelFormat) -> Result<Arc<SharedSurface>>;

    /// Open the frame channel of a newly announced server.
    fn open_channel(&self, server: ServerId) -> Result<Arc<FrameChannel>>;

    /// Connect a client to a server's channel. Fails with `SourceGone` if the
    /// server has no open channel.
    fn connect(&self, server: ServerId) -> Result<Arc<FrameChannel>>;

    /// Close and forget a server's channel.
    fn close_channel(&self, server: ServerId);
}

/// Process-local surface exchange.
#[derive(Default)]
pub struct LocalSurfaceExchange {
    next_surface: AtomicU32,
    channels: Mutex<HashMap<ServerId, Arc<FrameChannel>>>,
    surfaces: Mutex<Vec<Weak<SharedSurface>>>,
}

impl LocalSurfaceExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of exported surfaces somebody still references.
    pub fn live_surfaces(&self) -> usize {
        let mut surfaces = self.surfaces.lock();
        surfaces.retain(|surface| surface.strong_count() > 0);
        surfaces.len()
    }
}

impl SurfaceExchange for LocalSurfaceExchange {
    fn export_surface(&self, size: Size, format: PixelFormat) -> Result<Arc<SharedSurface>> {
        let id = SurfaceId(self.next_surface.fetch_add(1, Ordering::SeqCst) + 1);
        let surface = Arc::new(SharedSurface::new(id, size, format)?);
        let mut surfaces = self.surfaces.lock();
        surfaces.retain(|surface| surface.strong_count() > 0);
        surfaces.push(Arc::downgrade(&surface));
        Ok(surface)
    }

    fn open_channel(&self, server: ServerId) -> Result<Arc<FrameChannel>> {
        let channel = Arc::new(FrameChannel::new(server));
        if let Some(previous) = self.channels.lock().insert(server, channel.clone()) {
            previous.close();
        }
        info!("Opened frame channel for server {}", server);
        Ok(channel)
    }

    fn connect(&self, server: ServerId) -> Result<Arc<FrameChannel>> {
        self.channels
            .lock()
            .get(&server)
            .filter(|channel| channel.is_open())
            .cloned()
            .ok_or_else(|| ShareError::SourceGone(server.to_string()))
    }

    fn close_channel(&self, server: ServerId) {
        if let Some(channel) = self.channels.lock().remove(&server) {
            channel.close();
            info!("Closed frame channel for server {}", server);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_rejects_unsupported_formats_and_empty_sizes() {
        let exchange = LocalSurfaceExchange::new();
        assert!(matches!(
            exchange.export_surface(Size::new(4, 4), PixelFormat::Rgba16Float),
            Err(ShareError::UnsupportedFormat(PixelFormat::Rgba16Float))
        ));
        assert!(matches!(
            exchange.export_surface(Size::new(0, 4), PixelFormat::Rgba8Unorm),
            Err(ShareError::InvalidRegion(_))
        ));
        let surface = exchange.export_surface(Size::new(4, 2), PixelFormat::Bgra8Unorm).unwrap();
        assert_eq!(surface.read().len(), 32);
        assert_eq!(surface.bytes_per_row(), 16);
    }

    #[test]
    fn test_surfaces_are_released_when_the_last_holder_drops() {
        let exchange = LocalSurfaceExchange::new();
        let channel = exchange.open_channel(ServerId::new()).unwrap();

        let first = exchange.export_surface(Size::new(2, 2), PixelFormat::Rgba8Unorm).unwrap();
        channel.present(first.clone());
        let imported = first.clone();
        drop(first);

        let second = exchange.export_surface(Size::new(2, 2), PixelFormat::Rgba8Unorm).unwrap();
        channel.present(second);
        // The replaced surface survives while the importer holds it.
        assert_eq!(exchange.live_surfaces(), 2);
        drop(imported);
        assert_eq!(exchange.live_surfaces(), 1);
    }

    #[test]
    fn test_present_bumps_the_sequence_and_notifies_listeners() {
        let channel = FrameChannel::new(ServerId::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = channel.add_listener(Arc::new(move |sequence| sink.lock().push(sequence)));

        let surface = Arc::new(SharedSurface::new(SurfaceId(1), Size::new(1, 1), PixelFormat::Rgba8Unorm).unwrap());
        assert_eq!(channel.present(surface), Some(1));
        assert_eq!(channel.republish(), Some(2));
        channel.remove_listener(listener);
        assert_eq!(channel.republish(), Some(3));
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_closed_channel_ignores_frames_and_refuses_clients() {
        let exchange = LocalSurfaceExchange::new();
        let server = ServerId::new();
        let channel = exchange.open_channel(server).unwrap();
        assert_eq!(exchange.connect(server).unwrap().attach_client(), 1);

        exchange.close_channel(server);
        assert!(!channel.is_open());
        let surface = exchange.export_surface(Size::new(1, 1), PixelFormat::Rgba8Unorm).unwrap();
        assert_eq!(channel.present(surface), None);
        assert!(channel.latest().is_none());
        assert!(matches!(channel.current(), Err(ShareError::SourceGone(_))));
        assert!(matches!(exchange.connect(server), Err(ShareError::SourceGone(_))));
    }

    #[test]
    fn test_current_distinguishes_closed_from_empty() {
        let channel = FrameChannel::new(ServerId::new());
        assert!(channel.current().unwrap().is_none());

        let surface = Arc::new(SharedSurface::new(SurfaceId(1), Size::new(1, 1), PixelFormat::Rgba8Unorm).unwrap());
        channel.present(surface);
        assert_eq!(channel.current().unwrap().map(|frame| frame.sequence), Some(1));

        channel.close();
        assert!(matches!(channel.current(), Err(ShareError::SourceGone(_))));
    }

    #[test]
    fn test_detach_never_underflows() {
        let channel = FrameChannel::new(ServerId::new());
        channel.attach_client();
        assert_eq!(channel.detach_client(), 0);
        assert_eq!(channel.detach_client(), 0);
        assert_eq!(channel.client_count(), 0);
    }
}

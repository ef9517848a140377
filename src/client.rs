//! Subscriber: binds to one announced server and imports its frames.

use crate::backend::{BackendContext, ClientAdapter, NativeTexture};
use crate::directory::ServerDescription;
use crate::error::{Result, ShareError};
use crate::frame::{PixelFormat, Size, TextureTarget};
use crate::transport::{FrameChannel, ListenerId, SurfaceId, Transport};
use std::sync::Arc;
use tracing::{debug, info};

/// A server frame imported as a local texture.
#[derive(Debug, Clone)]
pub struct ClientFrame {
    pub texture: NativeTexture,
    pub size: Size,
    pub format: PixelFormat,
    /// Server frame counter this texture was acquired at
    pub sequence: u64,
    /// Texture layout on the immediate backend
    pub target: Option<TextureTarget>,
}

/// Sink side of the protocol.
///
/// The new-frame flag is edge-triggered: it is raised by each publish and
/// lowered by `acquire_frame`, and querying it has no effect.
pub struct Subscriber {
    description: ServerDescription,
    channel: Arc<FrameChannel>,
    adapter: ClientAdapter,
    last_sequence: u64,
    frame: Option<ClientFrame>,
    frame_surface: Option<SurfaceId>,
    listener: Option<ListenerId>,
    stopped: bool,
}

impl Subscriber {
    /// Bind to the server `description` was announced for.
    ///
    /// Fails with `SourceGone` if that server has already retired. Without a
    /// backend the system's default GPU is used.
    pub fn new(description: &ServerDescription, transport: &Transport, backend: Option<BackendContext>) -> Result<Self> {
        let backend = match backend {
            Some(backend) => backend,
            None => BackendContext::system_default()?,
        };
        let channel = transport
            .surfaces()
            .connect(description.id)
            .map_err(|_| ShareError::SourceGone(description.name.clone()))?;
        let clients = channel.attach_client();
        info!(
            "Connected to server '{}' from '{}' ({} client(s))",
            description.name, description.app_name, clients
        );
        Ok(Self {
            description: description.clone(),
            channel,
            adapter: ClientAdapter::new(backend, transport.config().client_target),
            last_sequence: 0,
            frame: None,
            frame_surface: None,
            listener: None,
            stopped: false,
        })
    }

    /// Like [`new`](Self::new), with `handler` installed before any frame can
    /// arrive. See [`set_frame_handler`](Self::set_frame_handler).
    pub fn with_frame_handler<F>(
        description: &ServerDescription,
        transport: &Transport,
        backend: Option<BackendContext>,
        handler: F,
    ) -> Result<Self>
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        let mut subscriber = Self::new(description, transport, backend)?;
        subscriber.set_frame_handler(handler)?;
        Ok(subscriber)
    }

    pub fn description(&self) -> &ServerDescription {
        &self.description
    }

    /// Whether the server has published since the last `acquire_frame`.
    pub fn has_new_frame(&self) -> bool {
        self.is_valid() && self.channel.sequence() > self.last_sequence
    }

    /// Whether the server is still alive. False once either side stopped.
    pub fn is_valid(&self) -> bool {
        !self.stopped && self.channel.is_open()
    }

    /// The server's current frame as a local texture, or `None` before its
    /// first publish.
    ///
    /// Clears the new-frame flag. Without a publish in between, repeated calls
    /// return the same texture. Never blocks on the server.
    pub fn acquire_frame(&mut self) -> Result<Option<ClientFrame>> {
        if self.stopped {
            return Err(ShareError::AlreadyStopped("subscriber"));
        }
        let current = self
            .channel
            .current()
            .map_err(|_| ShareError::SourceGone(self.description.name.clone()))?;
        let Some(latest) = current else {
            return Ok(None);
        };
        if latest.sequence == self.last_sequence {
            return Ok(self.frame.clone());
        }

        if self.frame_surface == Some(latest.surface.id()) {
            // A republish of the surface already imported.
            if let Some(frame) = &mut self.frame {
                frame.sequence = latest.sequence;
            }
        } else {
            let size = latest.surface.size();
            let format = latest.surface.format();
            let surface_id = latest.surface.id();
            let texture = self.adapter.import(latest.surface)?;
            let replaced = self.frame.replace(ClientFrame {
                texture,
                size,
                format,
                sequence: latest.sequence,
                target: self.adapter.import_target(),
            });
            if let Some(replaced) = replaced {
                self.adapter.release(&replaced.texture);
            }
            self.frame_surface = Some(surface_id);
            debug!("Imported {} from '{}' as frame {}", surface_id, self.description.name, latest.sequence);
        }
        self.last_sequence = latest.sequence;
        Ok(self.frame.clone())
    }

    /// Call `handler` with the frame sequence each time the server publishes.
    ///
    /// The handler runs on whichever thread completes the publish, possibly a
    /// GPU completion thread, so it should only signal the thread that owns
    /// this subscriber. Replaces any previous handler.
    pub fn set_frame_handler<F>(&mut self, handler: F) -> Result<()>
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        if self.stopped {
            return Err(ShareError::AlreadyStopped("subscriber"));
        }
        self.clear_frame_handler();
        self.listener = Some(self.channel.add_listener(Arc::new(handler)));
        Ok(())
    }

    pub fn clear_frame_handler(&mut self) {
        if let Some(id) = self.listener.take() {
            self.channel.remove_listener(id);
        }
    }

    /// Unbind from the server and release the imported texture. Stopping
    /// twice is a no-op.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.clear_frame_handler();
        self.channel.detach_client();
        if let Some(frame) = self.frame.take() {
            self.adapter.release(&frame.texture);
        }
        self.frame_surface = None;
        info!("Disconnected from server '{}'", self.description.name);
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("server", &self.description.name)
            .field("last_sequence", &self.last_sequence)
            .field("stopped", &self.stopped)
            .finish()
    }
}

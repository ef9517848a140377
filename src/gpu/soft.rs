//! Software explicit device.
//!
//! Command buffers record closures; committing hands them to a queue thread
//! that runs them in submission order, runs the completion handlers and then
//! releases waiters. The queue can be paused to hold work "on the GPU".

use super::{check_export_target, Completion, TextureStorage};
use crate::backend::{CommandBuffer, CommandBufferStatus, CompletionHandler, ExplicitDevice, NativeTexture};
use crate::error::{Result, ShareError};
use crate::frame::{copy_region, write_region, PixelFormat, Region, Size, TextureInfo};
use crate::transport::SharedSurface;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

type Command = Box<dyn FnOnce() -> Result<()> + Send>;

struct Submission {
    label: u64,
    commands: Vec<Command>,
    handlers: Vec<CompletionHandler>,
    completion: Arc<Completion>,
}

/// Holds the queue thread while paused.
#[derive(Default)]
struct QueueGate {
    paused: Mutex<bool>,
    changed: Condvar,
}

impl QueueGate {
    fn set_paused(&self, paused: bool) {
        *self.paused.lock() = paused;
        self.changed.notify_all();
    }

    fn wait_open(&self) {
        let mut paused = self.paused.lock();
        while *paused {
            self.changed.wait(&mut paused);
        }
    }
}

/// A texture living on a [`SoftDevice`].
pub struct SoftTexture {
    id: u64,
    size: Size,
    format: PixelFormat,
    storage: TextureStorage,
}

impl SoftTexture {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// The shared surface backing an imported texture.
    pub fn surface(&self) -> Option<&Arc<SharedSurface>> {
        self.storage.surface()
    }
}

fn soft_texture(texture: &NativeTexture) -> Result<&SoftTexture> {
    texture
        .downcast_ref::<SoftTexture>()
        .ok_or(ShareError::ForeignTexture("texture handle"))
}

/// CPU-emulated explicit device with its own command queue.
pub struct SoftDevice {
    name: String,
    queue: Sender<Submission>,
    gate: Arc<QueueGate>,
    next_id: AtomicU64,
}

impl SoftDevice {
    pub fn new(name: &str) -> Result<Self> {
        let (queue, submissions) = mpsc::channel();
        let gate = Arc::new(QueueGate::default());
        let worker_gate = gate.clone();
        thread::Builder::new()
            .name(format!("{}-queue", name))
            .spawn(move || run_queue(submissions, worker_gate))
            .map_err(|e| ShareError::Gpu(format!("failed to start command queue: {}", e)))?;
        debug!("Software device '{}' ready", name);
        Ok(Self { name: name.to_string(), queue, gate, next_id: AtomicU64::new(0) })
    }

    /// Hold committed work on the queue until [`resume_queue`](Self::resume_queue).
    pub fn pause_queue(&self) {
        self.gate.set_paused(true);
    }

    pub fn resume_queue(&self) {
        self.gate.set_paused(false);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Drop for SoftDevice {
    fn drop(&mut self) {
        // Outstanding buffers keep the queue thread alive; never leave it parked.
        self.gate.set_paused(false);
    }
}

fn run_queue(submissions: Receiver<Submission>, gate: Arc<QueueGate>) {
    for submission in submissions {
        gate.wait_open();
        let mut status = CommandBufferStatus::Completed;
        for command in submission.commands {
            if let Err(e) = command() {
                warn!("Command buffer {} failed: {}", submission.label, e);
                status = CommandBufferStatus::Error(e.to_string());
                break;
            }
        }
        for handler in submission.handlers {
            handler(&status);
        }
        submission.completion.set(status);
    }
}

/// Command buffer of a [`SoftDevice`].
pub struct SoftCommandBuffer {
    label: u64,
    queue: Sender<Submission>,
    commands: Vec<Command>,
    handlers: Vec<CompletionHandler>,
    completion: Arc<Completion>,
}

impl SoftCommandBuffer {
    fn push(&mut self, command: Command) -> Result<()> {
        if self.completion.status() != CommandBufferStatus::NotCommitted {
            return Err(ShareError::Gpu(format!("command buffer {} is already committed", self.label)));
        }
        self.commands.push(command);
        Ok(())
    }
}

impl CommandBuffer for SoftCommandBuffer {
    fn add_completed_handler(&mut self, handler: CompletionHandler) {
        if self.completion.status() != CommandBufferStatus::NotCommitted {
            warn!("Ignoring completion handler added to committed command buffer {}", self.label);
            return;
        }
        self.handlers.push(handler);
    }

    fn commit(&mut self) -> Result<()> {
        if self.completion.status() != CommandBufferStatus::NotCommitted {
            return Err(ShareError::Gpu(format!("command buffer {} is already committed", self.label)));
        }
        self.completion.set(CommandBufferStatus::Committed);
        let submission = Submission {
            label: self.label,
            commands: std::mem::take(&mut self.commands),
            handlers: std::mem::take(&mut self.handlers),
            completion: self.completion.clone(),
        };
        self.queue.send(submission).map_err(|_| {
            self.completion.set(CommandBufferStatus::Error("command queue has shut down".to_string()));
            ShareError::Gpu("command queue has shut down".to_string())
        })
    }

    fn wait_until_completed(&mut self) -> Result<()> {
        self.completion.wait()
    }

    fn status(&self) -> CommandBufferStatus {
        self.completion.status()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl ExplicitDevice for SoftDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn new_command_buffer(&self) -> Box<dyn CommandBuffer> {
        Box::new(SoftCommandBuffer {
            label: self.next_id(),
            queue: self.queue.clone(),
            commands: Vec::new(),
            handlers: Vec::new(),
            completion: Completion::new(),
        })
    }

    fn texture_info(&self, texture: &NativeTexture) -> Result<TextureInfo> {
        let texture = soft_texture(texture)?;
        Ok(TextureInfo { size: texture.size, format: texture.format })
    }

    fn encode_export(
        &self,
        command_buffer: &mut dyn CommandBuffer,
        texture: &NativeTexture,
        region: Region,
        flipped: bool,
        surface: Arc<SharedSurface>,
    ) -> Result<()> {
        let command_buffer = command_buffer
            .as_any_mut()
            .downcast_mut::<SoftCommandBuffer>()
            .ok_or(ShareError::ForeignTexture("command buffer"))?;
        let source = soft_texture(texture)?;
        region.validate_within(source.size)?;
        check_export_target(&surface, region, source.format)?;

        let texture = texture.clone();
        command_buffer.push(Box::new(move || {
            let source = soft_texture(&texture)?;
            let pixels = source.storage.read();
            let mut out = surface.lock();
            copy_region(&pixels, source.size, source.format.bytes_per_pixel(), region, flipped, &mut out)
        }))
    }

    fn import_surface(&self, surface: Arc<SharedSurface>) -> Result<NativeTexture> {
        Ok(NativeTexture::from_object(SoftTexture {
            id: self.next_id(),
            size: surface.size(),
            format: surface.format().ensure_shareable()?,
            storage: TextureStorage::Surface(surface),
        }))
    }

    fn create_texture(&self, size: Size, format: PixelFormat) -> Result<NativeTexture> {
        if size.is_empty() {
            return Err(ShareError::InvalidRegion(format!("cannot create a {}x{} texture", size.width, size.height)));
        }
        Ok(NativeTexture::from_object(SoftTexture {
            id: self.next_id(),
            size,
            format,
            storage: TextureStorage::zeroed(size, format)?,
        }))
    }

    fn replace_region(&self, texture: &NativeTexture, region: Region, bytes: &[u8]) -> Result<()> {
        let texture = soft_texture(texture)?;
        region.validate_within(texture.size)?;
        let mut pixels = texture.storage.write()?;
        write_region(&mut pixels, texture.size, texture.format.bytes_per_pixel(), region, bytes)
    }

    fn read_region(&self, texture: &NativeTexture, region: Region, out: &mut [u8]) -> Result<()> {
        let texture = soft_texture(texture)?;
        region.validate_within(texture.size)?;
        let pixels = texture.storage.read();
        copy_region(&pixels, texture.size, texture.format.bytes_per_pixel(), region, false, out)
    }
}

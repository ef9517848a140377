//! Explicit device backed by wgpu.
//!
//! Exports copy the texture region into a mappable buffer; once the mapping
//! resolves the rows are written into the shared surface and the completion
//! handlers run. Portable wgpu has no way to alias foreign memory as a
//! texture, so imports upload the surface contents into a new texture.

use super::{check_export_target, Completion};
use crate::backend::{CommandBuffer, CommandBufferStatus, CompletionHandler, ExplicitDevice, NativeTexture};
use crate::error::{Result, ShareError};
use crate::frame::{PixelFormat, Region, Size, TextureInfo};
use crate::transport::SharedSurface;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

const USAGE: wgpu::TextureUsages = wgpu::TextureUsages::TEXTURE_BINDING
    .union(wgpu::TextureUsages::RENDER_ATTACHMENT)
    .union(wgpu::TextureUsages::COPY_SRC)
    .union(wgpu::TextureUsages::COPY_DST);

fn to_wgpu_format(format: PixelFormat) -> Result<wgpu::TextureFormat> {
    match format {
        PixelFormat::Rgba8Unorm => Ok(wgpu::TextureFormat::Rgba8Unorm),
        PixelFormat::Bgra8Unorm => Ok(wgpu::TextureFormat::Bgra8Unorm),
        PixelFormat::R8Unorm => Ok(wgpu::TextureFormat::R8Unorm),
        PixelFormat::Rgba16Float => Ok(wgpu::TextureFormat::Rgba16Float),
        PixelFormat::Unknown => Err(ShareError::UnsupportedFormat(format)),
    }
}

fn from_wgpu_format(format: wgpu::TextureFormat) -> PixelFormat {
    match format {
        wgpu::TextureFormat::Rgba8Unorm => PixelFormat::Rgba8Unorm,
        wgpu::TextureFormat::Bgra8Unorm => PixelFormat::Bgra8Unorm,
        wgpu::TextureFormat::R8Unorm => PixelFormat::R8Unorm,
        wgpu::TextureFormat::Rgba16Float => PixelFormat::Rgba16Float,
        _ => PixelFormat::Unknown,
    }
}

/// Row pitch satisfying the buffer-copy alignment.
fn padded_bytes_per_row(width: u32, bytes_per_pixel: usize) -> u32 {
    let unpadded = width * bytes_per_pixel as u32;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

/// Copies padded rows into a tightly packed destination.
fn unpad_rows(padded: &[u8], padded_row: usize, row_len: usize, rows: usize, flipped: bool, out: &mut [u8]) {
    for row in 0..rows {
        let dst_row = if flipped { rows - 1 - row } else { row };
        let src = &padded[row * padded_row..row * padded_row + row_len];
        out[dst_row * row_len..(dst_row + 1) * row_len].copy_from_slice(src);
    }
}

/// A texture living on a [`WgpuDevice`].
pub struct WgpuTexture {
    pub texture: wgpu::Texture,
}

fn wgpu_texture(texture: &NativeTexture) -> Result<&WgpuTexture> {
    texture
        .downcast_ref::<WgpuTexture>()
        .ok_or(ShareError::ForeignTexture("texture handle"))
}

fn origin(region: Region) -> wgpu::Origin3d {
    wgpu::Origin3d { x: region.x as u32, y: region.y as u32, z: 0 }
}

fn extent(size: Size) -> wgpu::Extent3d {
    wgpu::Extent3d { width: size.width, height: size.height, depth_or_array_layers: 1 }
}

/// wgpu device and queue.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
}

impl WgpuDevice {
    /// Open the default adapter without a surface.
    pub fn system_default() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| ShareError::Gpu(format!("failed to obtain GPU adapter: {}", e)))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("texshare device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))
        .map_err(|e| ShareError::Gpu(format!("failed to open GPU device: {}", e)))?;

        let adapter_name = adapter.get_info().name;
        info!("Using GPU adapter {}", adapter_name);
        Ok(Self::from_parts(device, queue, adapter_name))
    }

    /// Wrap a device the application already owns.
    pub fn from_parts(device: wgpu::Device, queue: wgpu::Queue, adapter_name: String) -> Self {
        Self { device, queue, adapter_name }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Drive pending completions. Buffers committed without waiting only
    /// present their frame once the device is polled.
    pub fn poll(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Poll)
            .map(|_| ())
            .map_err(|e| ShareError::Gpu(e.to_string()))
    }

    fn wait_idle(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait { submission_index: None, timeout: None })
            .map(|_| ())
            .map_err(|e| ShareError::Gpu(e.to_string()))
    }
}

struct Readback {
    buffer: wgpu::Buffer,
    padded_row: usize,
    size: Size,
    flipped: bool,
    surface: Arc<SharedSurface>,
}

impl Readback {
    fn land(&self) {
        let data = self.buffer.slice(..).get_mapped_range();
        let row_len = self.surface.bytes_per_row();
        let mut out = self.surface.lock();
        unpad_rows(&data, self.padded_row, row_len, self.size.height as usize, self.flipped, &mut out);
        drop(data);
        self.buffer.unmap();
    }
}

/// Finishes a submission once every readback has landed.
struct Finisher {
    remaining: AtomicUsize,
    error: Mutex<Option<String>>,
    handlers: Mutex<Vec<CompletionHandler>>,
    completion: Arc<Completion>,
}

impl Finisher {
    fn fail(&self, message: String) {
        self.error.lock().get_or_insert(message);
    }

    fn arrive(&self) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let status = match self.error.lock().take() {
            Some(message) => CommandBufferStatus::Error(message),
            None => CommandBufferStatus::Completed,
        };
        let handlers = std::mem::take(&mut *self.handlers.lock());
        for handler in handlers {
            handler(&status);
        }
        self.completion.set(status);
    }
}

/// Command buffer of a [`WgpuDevice`].
pub struct WgpuCommandBuffer {
    device: wgpu::Device,
    queue: wgpu::Queue,
    encoder: Option<wgpu::CommandEncoder>,
    readbacks: Vec<Readback>,
    handlers: Vec<CompletionHandler>,
    completion: Arc<Completion>,
    submission: Option<wgpu::SubmissionIndex>,
}

impl WgpuCommandBuffer {
    fn encoder(&mut self) -> Result<&mut wgpu::CommandEncoder> {
        self.encoder
            .as_mut()
            .ok_or_else(|| ShareError::Gpu("command buffer is already committed".to_string()))
    }
}

impl CommandBuffer for WgpuCommandBuffer {
    fn add_completed_handler(&mut self, handler: CompletionHandler) {
        if self.encoder.is_none() {
            warn!("Ignoring completion handler added to a committed command buffer");
            return;
        }
        self.handlers.push(handler);
    }

    fn commit(&mut self) -> Result<()> {
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| ShareError::Gpu("command buffer is already committed".to_string()))?;
        self.completion.set(CommandBufferStatus::Committed);
        self.submission = Some(self.queue.submit(std::iter::once(encoder.finish())));

        let readbacks = std::mem::take(&mut self.readbacks);
        let finisher = Arc::new(Finisher {
            remaining: AtomicUsize::new(readbacks.len().max(1)),
            error: Mutex::new(None),
            handlers: Mutex::new(std::mem::take(&mut self.handlers)),
            completion: self.completion.clone(),
        });

        if readbacks.is_empty() {
            self.queue.on_submitted_work_done(move || finisher.arrive());
            return Ok(());
        }
        for readback in readbacks {
            let finisher = finisher.clone();
            let buffer = readback.buffer.clone();
            buffer.slice(..).map_async(wgpu::MapMode::Read, move |result| {
                match result {
                    Ok(()) => readback.land(),
                    Err(e) => finisher.fail(format!("readback failed: {}", e)),
                }
                finisher.arrive();
            });
        }
        Ok(())
    }

    fn wait_until_completed(&mut self) -> Result<()> {
        let Some(submission) = self.submission.clone() else {
            return Err(ShareError::Gpu("command buffer was never committed".to_string()));
        };
        if !self.completion.is_finished() {
            self.device
                .poll(wgpu::PollType::Wait { submission_index: Some(submission), timeout: None })
                .map_err(|e| ShareError::Gpu(e.to_string()))?;
        }
        if !self.completion.is_finished() {
            // Callbacks fire inside poll; one more pass covers work queued by them.
            self.device
                .poll(wgpu::PollType::Wait { submission_index: None, timeout: None })
                .map_err(|e| ShareError::Gpu(e.to_string()))?;
        }
        if !self.completion.is_finished() {
            return Err(ShareError::Gpu("submission finished without signalling completion".to_string()));
        }
        self.completion.wait()
    }

    fn status(&self) -> CommandBufferStatus {
        self.completion.status()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl ExplicitDevice for WgpuDevice {
    fn name(&self) -> String {
        self.adapter_name.clone()
    }

    fn new_command_buffer(&self) -> Box<dyn CommandBuffer> {
        let encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("texshare export"),
        });
        Box::new(WgpuCommandBuffer {
            device: self.device.clone(),
            queue: self.queue.clone(),
            encoder: Some(encoder),
            readbacks: Vec::new(),
            handlers: Vec::new(),
            completion: Completion::new(),
            submission: None,
        })
    }

    fn texture_info(&self, texture: &NativeTexture) -> Result<TextureInfo> {
        let texture = &wgpu_texture(texture)?.texture;
        let size = texture.size();
        Ok(TextureInfo {
            size: Size::new(size.width, size.height),
            format: from_wgpu_format(texture.format()),
        })
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
            .downcast_mut::<WgpuCommandBuffer>()
            .ok_or(ShareError::ForeignTexture("command buffer"))?;
        let info = self.texture_info(texture)?;
        region.validate_within(info.size)?;
        check_export_target(&surface, region, info.format)?;
        let source = &wgpu_texture(texture)?.texture;

        let size = region.size();
        let padded_row = padded_bytes_per_row(size.width, info.format.bytes_per_pixel());
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texshare readback"),
            size: padded_row as wgpu::BufferAddress * size.height as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        command_buffer.encoder()?.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo { texture: source, mip_level: 0, origin: origin(region), aspect: wgpu::TextureAspect::All },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout { offset: 0, bytes_per_row: Some(padded_row), rows_per_image: Some(size.height) },
            },
            extent(size),
        );
        command_buffer.readbacks.push(Readback { buffer, padded_row: padded_row as usize, size, flipped, surface });
        Ok(())
    }

    fn import_surface(&self, surface: Arc<SharedSurface>) -> Result<NativeTexture> {
        let texture = self.create_texture(surface.size(), surface.format().ensure_shareable()?)?;
        self.replace_region(&texture, Region::full(surface.size()), &surface.read())?;
        Ok(texture)
    }

    fn create_texture(&self, size: Size, format: PixelFormat) -> Result<NativeTexture> {
        if size.is_empty() {
            return Err(ShareError::InvalidRegion(format!("cannot create a {}x{} texture", size.width, size.height)));
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("texshare texture"),
            size: extent(size),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: to_wgpu_format(format)?,
            usage: USAGE,
            view_formats: &[],
        });
        Ok(NativeTexture::from_object(WgpuTexture { texture }))
    }

    fn replace_region(&self, texture: &NativeTexture, region: Region, bytes: &[u8]) -> Result<()> {
        let info = self.texture_info(texture)?;
        region.validate_within(info.size)?;
        let size = region.size();
        let row_len = size.width * info.format.bytes_per_pixel() as u32;
        let expected = row_len as usize * size.height as usize;
        if bytes.len() != expected {
            return Err(ShareError::BufferSizeMismatch { expected, actual: bytes.len() });
        }
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &wgpu_texture(texture)?.texture,
                mip_level: 0,
                origin: origin(region),
                aspect: wgpu::TextureAspect::All,
            },
            bytes,
            wgpu::TexelCopyBufferLayout { offset: 0, bytes_per_row: Some(row_len), rows_per_image: Some(size.height) },
            extent(size),
        );
        self.queue.submit(std::iter::empty());
        self.wait_idle()
    }

    fn read_region(&self, texture: &NativeTexture, region: Region, out: &mut [u8]) -> Result<()> {
        let info = self.texture_info(texture)?;
        region.validate_within(info.size)?;
        let size = region.size();
        let bytes_per_pixel = info.format.bytes_per_pixel();
        let row_len = size.width as usize * bytes_per_pixel;
        let expected = row_len * size.height as usize;
        if out.len() != expected {
            return Err(ShareError::BufferSizeMismatch { expected, actual: out.len() });
        }

        let padded_row = padded_bytes_per_row(size.width, bytes_per_pixel);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texshare read"),
            size: padded_row as wgpu::BufferAddress * size.height as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("texshare read"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &wgpu_texture(texture)?.texture,
                mip_level: 0,
                origin: origin(region),
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout { offset: 0, bytes_per_row: Some(padded_row), rows_per_image: Some(size.height) },
            },
            extent(size),
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.wait_idle()?;
        receiver
            .recv()
            .map_err(|_| ShareError::Gpu("readback was never resolved".to_string()))?
            .map_err(|e| ShareError::Gpu(format!("readback failed: {}", e)))?;

        let data = slice.get_mapped_range();
        unpad_rows(&data, padded_row as usize, row_len, size.height as usize, false, out);
        drop(data);
        buffer.unmap();
        Ok(())
    }
}

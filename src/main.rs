//! texshare demo CLI: publishes an animated gradient and receives it again.

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use texshare::gpu::{SoftDevice, SoftGlContext};
use texshare::{
    marshal, BackendContext, PixelFormat, PublishOptions, Publisher, ServerDirectory, ShareConfig, Size,
    Subscriber, TextureTarget, Transport,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// GPU backend the demo runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DemoBackend {
    /// CPU-emulated command-buffer device
    Soft,
    /// CPU-emulated immediate-mode context
    Gl,
    /// The system GPU through wgpu
    Wgpu,
}

/// Share GPU textures between a publisher and a subscriber.
#[derive(Parser, Debug)]
#[command(name = "texshare")]
#[command(about = "Publish an animated texture and receive it through the server directory")]
struct Args {
    /// Server name to announce
    #[arg(short, long, default_value = "Demo")]
    name: String,

    /// Frame width
    #[arg(long, default_value = "640")]
    width: u32,

    /// Frame height
    #[arg(long, default_value = "360")]
    height: u32,

    /// Target frames per second
    #[arg(long, default_value = "30")]
    fps: u32,

    /// Stop after this many frames (runs until Ctrl-C otherwise)
    #[arg(long)]
    frames: Option<u64>,

    /// GPU backend
    #[arg(long, value_enum, default_value = "soft")]
    backend: DemoBackend,

    /// YAML share config
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Logs how often `tick` is called, once per second.
struct RateMeter {
    label: &'static str,
    ticks: u32,
    window_start: Instant,
}

impl RateMeter {
    fn new(label: &'static str) -> Self {
        Self { label, ticks: 0, window_start: Instant::now() }
    }

    fn tick(&mut self) {
        self.ticks += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            info!("{}: {:.2} frames/s", self.label, self.ticks as f32 / elapsed.as_secs_f32());
            self.ticks = 0;
            self.window_start = Instant::now();
        }
    }
}

/// RGBA gradient that scrolls with `frame`.
fn gradient(size: Size, frame: u64) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(size.byte_len(PixelFormat::Rgba8Unorm));
    for y in 0..size.height {
        for x in 0..size.width {
            let r = ((x as u64 + frame) % 256) as u8;
            let g = ((y as u64 * 255) / size.height.max(1) as u64) as u8;
            pixels.extend_from_slice(&[r, g, 128, 255]);
        }
    }
    pixels
}

fn open_backend(kind: DemoBackend) -> Result<BackendContext> {
    Ok(match kind {
        DemoBackend::Soft => BackendContext::explicit(Arc::new(SoftDevice::new("texshare-soft")?)),
        DemoBackend::Gl => {
            let context = Arc::new(SoftGlContext::new());
            context.make_current();
            BackendContext::immediate(context, TextureTarget::Texture2D)
        }
        DemoBackend::Wgpu => BackendContext::system_default()?,
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ShareConfig::load(path)?,
        None => ShareConfig::default(),
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let transport = Transport::local_with_config(config);
    let backend = open_backend(args.backend)?;
    info!("Starting texshare demo on {:?}", backend);

    let directory = ServerDirectory::new(&transport)?;
    let mut publisher = Publisher::new(&args.name, &transport, Some(backend.clone()))?;
    let source = directory
        .find(Some(args.name.as_str()), None)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("server '{}' did not show up in the directory", args.name))?;
    info!("Found server '{}' from '{}'", source.name, source.app_name);
    let mut subscriber = Subscriber::new(&source, &transport, Some(backend.clone()))?;

    let size = Size::new(args.width, args.height);
    let texture = marshal::create_texture(&backend, size, PixelFormat::Rgba8Unorm)?;
    let frame_duration = Duration::from_secs_f64(1.0 / args.fps.max(1) as f64);
    let mut published = RateMeter::new("Published");
    let mut received = RateMeter::new("Received");
    let mut frame = 0u64;

    info!("Publishing {}x{} frames at {} fps", size.width, size.height, args.fps);
    while running.load(Ordering::SeqCst) && args.frames.map_or(true, |limit| frame < limit) {
        let frame_start = Instant::now();

        marshal::copy_bytes_to_texture(&backend, &gradient(size, frame), &texture)?;
        publisher.publish_frame_texture(&texture, PublishOptions::new())?;
        published.tick();

        if subscriber.has_new_frame() {
            if let Some(acquired) = subscriber.acquire_frame()? {
                received.tick();
                if acquired.sequence % 60 == 1 {
                    let frame_backend = backend.with_target(acquired.target);
                    let pixels = marshal::copy_texture_to_bytes(&frame_backend, &acquired.texture)?;
                    debug!("Frame {} starts with {:?}", acquired.sequence, &pixels[..4]);
                }
            }
        }

        frame += 1;
        let elapsed = frame_start.elapsed();
        if elapsed < frame_duration {
            thread::sleep(frame_duration - elapsed);
        }
    }

    publisher.stop();
    if subscriber.is_valid() {
        warn!("Subscriber still sees the stopped server");
    }
    subscriber.stop();
    info!("Servers still announced: {}", directory.list()?.len());
    info!("Sent {} frames", frame);
    Ok(())
}

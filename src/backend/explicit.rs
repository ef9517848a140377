//! Adapter for explicit command-buffer devices.
//!
//! A publish records the copy into a command buffer and presents the surface
//! from the buffer's completion handler, so a frame becomes visible only once
//! the GPU has actually written it.

use super::{CommandBuffer, CommandBufferStatus, ExplicitDevice, NativeTexture};
use crate::error::Result;
use crate::frame::{Region, Size};
use crate::server::PublishOptions;
use crate::transport::{FrameChannel, SharedSurface, SurfaceExchange};
use std::sync::Arc;
use tracing::{debug, warn};

/// What to do with the command buffer once the export is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Submit {
    /// Commit and block until the GPU is done
    CommitAndWait,
    /// Commit and return immediately
    Commit,
    /// Leave the buffer for the caller to commit
    Defer,
}

pub(crate) struct ExplicitServer {
    device: Arc<dyn ExplicitDevice>,
    surfaces: Arc<dyn SurfaceExchange>,
    channel: Arc<FrameChannel>,
}

impl ExplicitServer {
    pub(crate) fn new(
        device: Arc<dyn ExplicitDevice>,
        surfaces: Arc<dyn SurfaceExchange>,
        channel: Arc<FrameChannel>,
    ) -> Self {
        Self { device, surfaces, channel }
    }

    pub(crate) fn channel(&self) -> &Arc<FrameChannel> {
        &self.channel
    }

    pub(crate) fn texture_size(&self, texture: &NativeTexture) -> Result<Size> {
        Ok(self.device.texture_info(texture)?.size)
    }

    pub(crate) fn publish(&self, texture: &NativeTexture, options: PublishOptions<'_>) -> Result<()> {
        let info = self.device.texture_info(texture)?;
        let format = info.format.ensure_shareable()?;
        let (region, _) = Region::resolve(options.region, options.size, || Ok(info.size))?;
        // A caller-supplied size may claim more than the texture holds.
        region.validate_within(info.size)?;

        let surface = self.surfaces.export_surface(region.size(), format)?;
        let auto_commit = options.auto_commit.unwrap_or(true);
        match options.command_buffer {
            Some(command_buffer) => {
                let submit = if auto_commit { Submit::CommitAndWait } else { Submit::Defer };
                self.encode(command_buffer, texture, region, options.flipped, surface, submit)
            }
            None => {
                let mut command_buffer = self.device.new_command_buffer();
                let submit = if auto_commit { Submit::CommitAndWait } else { Submit::Commit };
                self.encode(command_buffer.as_mut(), texture, region, options.flipped, surface, submit)
            }
        }
    }

    fn encode(
        &self,
        command_buffer: &mut dyn CommandBuffer,
        texture: &NativeTexture,
        region: Region,
        flipped: bool,
        surface: Arc<SharedSurface>,
        submit: Submit,
    ) -> Result<()> {
        self.device
            .encode_export(command_buffer, texture, region, flipped, surface.clone())?;

        let channel = self.channel.clone();
        command_buffer.add_completed_handler(Box::new(move |status: &CommandBufferStatus| match status {
            CommandBufferStatus::Completed => {
                if channel.present(surface).is_none() {
                    debug!("Dropping frame completed after server {} stopped", channel.server());
                }
            }
            other => warn!("Export for server {} did not complete: {:?}", channel.server(), other),
        }));

        match submit {
            Submit::CommitAndWait => {
                command_buffer.commit()?;
                command_buffer.wait_until_completed()
            }
            Submit::Commit => command_buffer.commit(),
            Submit::Defer => Ok(()),
        }
    }
}

pub(crate) struct ExplicitClient {
    device: Arc<dyn ExplicitDevice>,
}

impl ExplicitClient {
    pub(crate) fn new(device: Arc<dyn ExplicitDevice>) -> Self {
        Self { device }
    }

    pub(crate) fn import(&self, surface: Arc<SharedSurface>) -> Result<NativeTexture> {
        self.device.import_surface(surface)
    }
}

//! Error types shared by every texshare component.

use crate::frame::PixelFormat;
use thiserror::Error;

/// Errors surfaced by the directory, publishers, subscribers and helpers.
///
/// Every variant is a local, recoverable condition. Nothing in the crate
/// retries on its own; callers decide whether to re-poll or re-publish.
#[derive(Debug, Error)]
pub enum ShareError {
    /// The discovery transport is not running (or has been shut down).
    #[error("server directory unavailable: {0}")]
    RegistryUnavailable(String),

    /// The texture format cannot back a shared surface.
    #[error("pixel format {0:?} is not supported for shared surfaces (expected Rgba8Unorm or Bgra8Unorm)")]
    UnsupportedFormat(PixelFormat),

    /// The source a subscriber is bound to has retired.
    #[error("source '{0}' is gone")]
    SourceGone(String),

    /// The publisher or subscriber was stopped.
    #[error("{0} already stopped")]
    AlreadyStopped(&'static str),

    /// Non-positive extent or a rectangle outside the texture bounds.
    #[error("invalid region: {0}")]
    InvalidRegion(String),

    /// A caller-supplied byte buffer has the wrong length for the copy.
    #[error("buffer size mismatch (expected: {expected}, actual: {actual})")]
    BufferSizeMismatch { expected: usize, actual: usize },

    /// No rendering context is current on the calling thread.
    #[error("no rendering context is current on this thread")]
    ContextNotCurrent,

    /// A texture or command buffer handed to a backend it does not belong to.
    #[error("{0} does not belong to this backend")]
    ForeignTexture(&'static str),

    /// Driver-level failure.
    #[error("gpu error: {0}")]
    Gpu(String),
}

pub type Result<T> = std::result::Result<T, ShareError>;

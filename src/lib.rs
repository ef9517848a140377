//! texshare: zero-copy GPU texture sharing between processes
//!
//! Publishers announce named texture sources through a server directory and
//! publish frames as shared surfaces; subscribers discover them, bind, and
//! import each new frame as a local texture.

pub mod backend;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod marshal;
pub mod server;
pub mod transport;

pub use backend::{BackendContext, NativeTexture};
pub use client::{ClientFrame, Subscriber};
pub use config::ShareConfig;
pub use directory::{MatchMode, ServerDescription, ServerDirectory, ServerId, ServerNotification, ServerQuery};
pub use error::{Result, ShareError};
pub use frame::{PixelFormat, Region, Size, TextureTarget};
pub use server::{PublishOptions, Publisher};
pub use transport::Transport;

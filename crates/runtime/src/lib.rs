//! Waterwall Runtime
//!
//! Hosts one tunnel between two TCP faces on tokio. A single engine task owns
//! the tunnel and runs every callback; socket reads, writes, dials and timers
//! run in their own tasks and post events back to it.

mod build;
mod driver;
mod socket;

pub use build::build_tunnel;
pub use driver::{Driver, Running};

use std::time::Duration;

use thiserror::Error;
use waterwall_mux::MuxError;
use waterwall_reverse::ReverseError;
use waterwall_settings::SettingsError;

/// Bytes requested per socket read.
pub const READ_CHUNK: usize = 16 * 1024;

/// Queued write bytes above which the tunnel is paused for that line.
pub const WRITE_PAUSE_THRESHOLD: usize = 256 * 1024;

/// Queued write bytes below which a paused line is resumed.
pub const WRITE_RESUME_THRESHOLD: usize = 64 * 1024;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Mux error: {0}")]
    Mux(#[from] MuxError),

    #[error("Reverse error: {0}")]
    Reverse(#[from] ReverseError),

    #[error("Failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

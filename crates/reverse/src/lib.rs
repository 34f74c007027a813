//! Waterwall Reverse
//!
//! Connection pairing for reverse tunnels. Both legs dial out: the
//! `ReverseClient` keeps a pool of idle connections to the server, and the
//! `ReverseServer` matches each of them with a user connection.

mod client;
mod handshake;
mod idle;
mod server;
mod waiting;

pub use client::ReverseClient;
pub use handshake::{preamble, HandshakeReader};
pub use idle::{IdleItem, IdleTable};
pub use server::ReverseServer;
pub use waiting::{Role, WaitingBox};

use std::time::Duration;

use thiserror::Error;
use waterwall_core::CoreError;

/// Leading byte of the handshake preamble and of the pairing signal.
pub const HANDSHAKE_BYTE: u8 = 0xFF;
pub const HANDSHAKE_LEN: usize = 640;

/// Bytes an unpaired connection may buffer while it waits.
pub const MAX_BUFFERING: usize = 65535;

pub const PRECONNECT_DELAY_SHORT: Duration = Duration::from_millis(10);
pub const PRECONNECT_DELAY_LONG: Duration = Duration::from_millis(750);
pub const STARVATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Upper bound on the idle pool kept per worker.
pub const MAX_MIN_UNUSED: u32 = 128;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReverseError {
    #[error("Handshake rejected: first byte was {0:#04x}")]
    HandshakeRejected(u8),

    #[error("Buffer overflow: {0} bytes waiting for a peer")]
    BufferOverflow(usize),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

pub type Result<T> = std::result::Result<T, ReverseError>;

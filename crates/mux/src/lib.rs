//! Waterwall Mux
//!
//! Stream multiplexing over one physical connection:
//! - `frame`: the 8-byte frame header and the incremental frame reader
//! - `registry`: parents and their intrusive child lists
//! - `admission`: when a parent may take another child
//! - `MuxClient` / `MuxServer`: the two engine roles

mod admission;
mod client;
mod frame;
mod registry;
mod server;
mod session;

pub use admission::Concurrency;
pub use client::MuxClient;
pub use frame::{
    decode_header, encode_header, Frame, FrameFlag, FrameHeader, FrameReader, FRAME_HEADER_LEN,
    MAX_FRAME_PAYLOAD, MAX_MAIN_CHANNEL_BUFFER,
};
pub use registry::{ChildId, ParentId, Registry};
pub use server::MuxServer;

use thiserror::Error;
use waterwall_core::CoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    #[error("Unknown frame flag: {0}")]
    UnknownFlag(u8),

    #[error("Read stream overflow: {0} bytes buffered, limit is {1}")]
    ReadOverflow(usize, usize),

    #[error("Payload too large for one frame: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

pub type Result<T> = std::result::Result<T, MuxError>;

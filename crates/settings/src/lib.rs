//! Waterwall Settings
//!
//! Node file parsing for the `waterwall` binary.
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use waterwall_settings::{NodeKind, Settings};
//!
//! let settings = Settings::load_from(Path::new("node.json"))?;
//! assert_eq!(settings.node.kind, NodeKind::MuxClient);
//! # Ok::<(), waterwall_settings::SettingsError>(())
//! ```

mod config;

pub use config::{Face, LogSettings, NodeKind, NodeOptions, NodeSettings, Settings};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    Read(std::io::Error),

    #[error("Failed to write settings: {0}")]
    Write(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    Parse(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

//! Configuration types

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;
use waterwall_logging::LogLevel;

use crate::{Result, SettingsError};

/// A node file: one tunnel between two faces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Worker lanes
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub log: LogSettings,

    pub node: NodeSettings,

    /// Side the tunnel's upstream traffic comes from
    pub prev: Face,

    /// Side the tunnel's downstream traffic comes from
    pub next: Face,
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

impl Settings {
    /// Parse and validate a node file's contents.
    pub fn from_json(content: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(content).map_err(SettingsError::Parse)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a node file. Unlike most config files there are no
    /// useful defaults, so a missing file is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(SettingsError::Read)?;
        let settings = Self::from_json(&content)?;
        info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDir)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(SettingsError::Parse)?;
        std::fs::write(path, content).map_err(SettingsError::Write)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }

    /// Checks that need more than one field. Mode parameters are checked
    /// again when the tunnel is built.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(SettingsError::Invalid("workers must be at least 1".into()));
        }
        if self.workers > usize::from(u16::MAX) + 1 {
            return Err(SettingsError::Invalid(format!("too many workers: {}", self.workers)));
        }
        if self.prev.address().is_empty() || self.next.address().is_empty() {
            return Err(SettingsError::Invalid("face address is empty".into()));
        }
        if self.node.kind == NodeKind::MuxClient && self.node.settings.mode.is_none() {
            return Err(SettingsError::Invalid("MuxClient requires settings.mode".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LogSettings {
    #[serde(default)]
    pub level: LogLevel,
}

/// Where a side of the tunnel gets its sockets from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Face {
    /// Accept connections on this address
    Listen(String),
    /// Dial this address whenever the tunnel opens a line towards it
    Connect(String),
}

impl Face {
    pub fn address(&self) -> &str {
        match self {
            Self::Listen(addr) | Self::Connect(addr) => addr,
        }
    }
}

impl fmt::Display for Face {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listen(addr) => write!(f, "listen {}", addr),
            Self::Connect(addr) => write!(f, "connect {}", addr),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    MuxClient,
    MuxServer,
    ReverseClient,
    ReverseServer,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MuxClient => "MuxClient",
            Self::MuxServer => "MuxServer",
            Self::ReverseClient => "ReverseClient",
            Self::ReverseServer => "ReverseServer",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSettings {
    #[serde(rename = "type")]
    pub kind: NodeKind,

    #[serde(default)]
    pub settings: NodeOptions,
}

/// Per-node options. Each node kind reads only its own keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct NodeOptions {
    /// MuxClient: "timer" or "counter"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    /// MuxClient timer mode, milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_duration: Option<u64>,

    /// MuxClient counter mode, children per parent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_capacity: Option<u32>,

    /// ReverseClient idle pool floor per worker
    #[serde(default)]
    pub minimum_unused: u32,
}

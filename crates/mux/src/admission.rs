use std::time::{Duration, Instant};

use tracing::warn;

use crate::{MuxError, Result};

/// How long a parent keeps accepting children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// Accept children while the parent is younger than the duration.
    Timer(Duration),
    /// Accept children while fewer than this many are joined.
    Counter(u32),
}

impl Concurrency {
    /// Build from the `mode` name and its parameter.
    ///
    /// A zero parameter is valid and means every child gets its own parent.
    pub fn parse(mode: &str, duration_ms: Option<u64>, capacity: Option<u32>) -> Result<Self> {
        match mode {
            "timer" => {
                let ms = duration_ms.ok_or_else(|| {
                    MuxError::InvalidSettings("\"connection-duration\" is required in timer mode".to_string())
                })?;
                if (1..=60).contains(&ms) {
                    warn!("MuxClient: connection-duration is in milliseconds, {} looks too small", ms);
                }
                Ok(Concurrency::Timer(Duration::from_millis(ms)))
            }
            "counter" => {
                let cap = capacity.ok_or_else(|| {
                    MuxError::InvalidSettings("\"connection-capacity\" is required in counter mode".to_string())
                })?;
                Ok(Concurrency::Counter(cap))
            }
            other => Err(MuxError::InvalidSettings(format!(
                "unknown mode {:?}, expected \"timer\" or \"counter\"",
                other
            ))),
        }
    }

    /// Whether a parent created at `creation` with `children` joined can
    /// take no more children at `now`.
    pub fn is_exhausted(&self, now: Instant, creation: Instant, children: usize) -> bool {
        match *self {
            Concurrency::Timer(limit) => now.saturating_duration_since(creation) >= limit,
            Concurrency::Counter(cap) => children >= cap as usize,
        }
    }
}

//! Line identities and the signals carried along a chain.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;

/// Index of the worker lane a line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct WorkerId(pub u16);

impl WorkerId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Identity of one logical connection through the chain.
///
/// A line is bound to the worker that created it for its whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineId {
    pub wid: WorkerId,
    pub serial: u64,
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.wid, self.serial)
    }
}

/// Allocator for line identities, shared by every stage of a chain.
#[derive(Debug, Default)]
pub struct LineIds {
    next: AtomicU64,
}

impl LineIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh line bound to `wid`.
    pub fn allocate(&self, wid: WorkerId) -> LineId {
        let serial = self.next.fetch_add(1, Ordering::Relaxed);
        LineId { wid, serial }
    }
}

/// A lifecycle or data event travelling between adjacent stages.
///
/// `Pause` sent towards a stage asks that stage to stop sending to the
/// sender; `Resume` lifts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Init,
    Est,
    Finish,
    Payload(BytesMut),
    Pause,
    Resume,
}

impl Signal {
    pub fn payload(data: impl AsRef<[u8]>) -> Self {
        Signal::Payload(BytesMut::from(data.as_ref()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Signal::Init => "init",
            Signal::Est => "est",
            Signal::Finish => "finish",
            Signal::Payload(_) => "payload",
            Signal::Pause => "pause",
            Signal::Resume => "resume",
        }
    }
}

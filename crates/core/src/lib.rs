//! Waterwall Core
//!
//! Shared plumbing for every tunnel in a chain: line identities, the signals
//! that travel between stages, the `Tunnel` callback contract, and the
//! index-linked arena lists the engines keep their connection state in.

mod arena;
mod chain;
mod error;
mod line;
mod tunnel;
mod workers;

pub use arena::{Arena, Handle, Linked, Links, List, ListIter};
pub use chain::{Chain, Emit, Route, TimerRequest};
pub use error::*;
pub use line::{LineId, LineIds, Signal, WorkerId};
pub use tunnel::{ApiResult, Tunnel};
pub use workers::WorkerSlots;

//! The outbox a tunnel writes into while handling a callback.
//!
//! Tunnels never call their neighbours directly. Everything a callback wants
//! to happen next (signals towards the previous or next stage, new lines,
//! timers) is recorded on the [`Chain`] and delivered by the driver once the
//! callback has returned. This keeps callbacks free of re-entrancy: a tunnel
//! never observes its own state half-updated by a nested call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::line::{LineId, LineIds, Signal, WorkerId};

/// Which neighbour a signal is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Towards the stage after this one (upstream direction).
    Next,
    /// Towards the stage before this one (downstream direction).
    Prev,
}

/// One signal recorded by a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emit {
    pub route: Route,
    pub line: LineId,
    pub signal: Signal,
}

impl Route {
    pub fn opposite(self) -> Route {
        match self {
            Route::Next => Route::Prev,
            Route::Prev => Route::Next,
        }
    }
}

/// A request to call `on_timer(wid, token)` after `delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub wid: WorkerId,
    pub delay: Duration,
    pub token: u64,
}

/// Per-callback context handed to tunnels.
#[derive(Debug)]
pub struct Chain {
    ids: Arc<LineIds>,
    now: Instant,
    emitted: Vec<Emit>,
    timers: Vec<TimerRequest>,
}

impl Default for Chain {
    fn default() -> Self {
        Self::new(Arc::new(LineIds::new()))
    }
}

impl Chain {
    pub fn new(ids: Arc<LineIds>) -> Self {
        Self {
            ids,
            now: Instant::now(),
            emitted: Vec::new(),
            timers: Vec::new(),
        }
    }

    /// Queue `signal` for the next stage on `line`.
    pub fn send_next(&mut self, line: LineId, signal: Signal) {
        self.emitted.push(Emit { route: Route::Next, line, signal });
    }

    /// Queue `signal` for the previous stage on `line`.
    pub fn send_prev(&mut self, line: LineId, signal: Signal) {
        self.emitted.push(Emit { route: Route::Prev, line, signal });
    }

    pub fn send(&mut self, route: Route, line: LineId, signal: Signal) {
        self.emitted.push(Emit { route, line, signal });
    }

    /// Allocate a new line on worker `wid`.
    pub fn create_line(&mut self, wid: WorkerId) -> LineId {
        self.ids.allocate(wid)
    }

    pub fn ids(&self) -> &Arc<LineIds> {
        &self.ids
    }

    /// Clock reading for the current callback.
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn set_now(&mut self, now: Instant) {
        self.now = now;
    }

    pub fn schedule(&mut self, wid: WorkerId, delay: Duration, token: u64) {
        self.timers.push(TimerRequest { wid, delay, token });
    }

    pub fn emitted(&self) -> &[Emit] {
        &self.emitted
    }

    pub fn take_emitted(&mut self) -> Vec<Emit> {
        std::mem::take(&mut self.emitted)
    }

    pub fn take_timers(&mut self) -> Vec<TimerRequest> {
        std::mem::take(&mut self.timers)
    }
}

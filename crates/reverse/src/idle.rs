//! Idle table for connected but unclaimed reverse connections.
//!
//! Unlike the per-worker waiting queues this table is reachable from every
//! worker, so it carries its own lock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use waterwall_core::{LineId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleItem {
    pub wid: WorkerId,
    pub line: LineId,
    pub expires: Instant,
}

#[derive(Debug)]
pub struct IdleTable {
    timeout: Duration,
    items: Mutex<HashMap<LineId, IdleItem>>,
}

impl IdleTable {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, items: Mutex::new(HashMap::new()) }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<LineId, IdleItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `line` as idle from `now`. Returns its expiry.
    pub fn insert(&self, line: LineId, now: Instant) -> Instant {
        let expires = now + self.timeout;
        self.lock().insert(line, IdleItem { wid: line.wid, line, expires });
        expires
    }

    /// Claim `line`, removing it from the table.
    pub fn remove(&self, line: LineId) -> Option<IdleItem> {
        self.lock().remove(&line)
    }

    /// Remove `line` only if it has expired at `now`.
    pub fn take_expired(&self, line: LineId, now: Instant) -> Option<IdleItem> {
        let mut items = self.lock();
        match items.get(&line) {
            Some(item) if item.expires <= now => items.remove(&line),
            _ => None,
        }
    }

    pub fn get(&self, line: LineId) -> Option<IdleItem> {
        self.lock().get(&line).copied()
    }

    pub fn contains(&self, line: LineId) -> bool {
        self.lock().contains_key(&line)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_on(&self, wid: WorkerId) -> usize {
        self.lock().values().filter(|item| item.wid == wid).count()
    }
}

//! Per-worker queues of connections waiting for a counterpart.

use waterwall_core::{Arena, Handle, Linked, List};

/// Which queue a waiting connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// User connection arriving from the next stage.
    Upload,
    /// Peer connection from a reverse client, arriving from the previous stage.
    Download,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Upload => Role::Download,
            Role::Download => Role::Upload,
        }
    }
}

/// Uploads and downloads of one worker that have not been paired yet.
///
/// A connection sits in at most one queue, and leaves it when paired or
/// closed. Queues are FIFO: the oldest waiter is paired first.
#[derive(Debug, Default)]
pub struct WaitingBox {
    uploads: List,
    downloads: List,
}

impl WaitingBox {
    pub fn new() -> Self {
        Self::default()
    }

    fn list_mut(&mut self, role: Role) -> &mut List {
        match role {
            Role::Upload => &mut self.uploads,
            Role::Download => &mut self.downloads,
        }
    }

    pub fn count(&self, role: Role) -> usize {
        match role {
            Role::Upload => self.uploads.len(),
            Role::Download => self.downloads.len(),
        }
    }

    pub fn push<T: Linked>(&mut self, arena: &mut Arena<T>, role: Role, handle: Handle) {
        self.list_mut(role).push_back(arena, handle);
    }

    pub fn remove<T: Linked>(&mut self, arena: &mut Arena<T>, role: Role, handle: Handle) {
        self.list_mut(role).remove(arena, handle);
    }

    /// Take the oldest waiter of `role`.
    pub fn pop<T: Linked>(&mut self, arena: &mut Arena<T>, role: Role) -> Option<Handle> {
        self.list_mut(role).pop_front(arena)
    }
}

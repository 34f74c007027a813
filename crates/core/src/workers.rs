use std::ops::{Index, IndexMut};

use crate::error::{CoreError, Result};
use crate::line::WorkerId;

/// One value per worker lane, indexed by [`WorkerId`].
#[derive(Debug, Clone)]
pub struct WorkerSlots<T> {
    slots: Vec<T>,
}

impl<T> WorkerSlots<T> {
    pub const MAX_WORKERS: usize = u16::MAX as usize + 1;

    pub fn new(count: usize, mut init: impl FnMut(WorkerId) -> T) -> Result<Self> {
        if count == 0 {
            return Err(CoreError::NoWorkers);
        }
        if count > Self::MAX_WORKERS {
            return Err(CoreError::TooManyWorkers(count));
        }
        let slots = (0..count).map(|i| init(WorkerId(i as u16))).collect();
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (WorkerId, &T)> {
        self.slots.iter().enumerate().map(|(i, v)| (WorkerId(i as u16), v))
    }

    pub fn get(&self, wid: WorkerId) -> Option<&T> {
        self.slots.get(wid.index())
    }

    pub fn get_mut(&mut self, wid: WorkerId) -> Option<&mut T> {
        self.slots.get_mut(wid.index())
    }
}

impl<T> Index<WorkerId> for WorkerSlots<T> {
    type Output = T;

    fn index(&self, wid: WorkerId) -> &T {
        &self.slots[wid.index()]
    }
}

impl<T> IndexMut<WorkerId> for WorkerSlots<T> {
    fn index_mut(&mut self, wid: WorkerId) -> &mut T {
        &mut self.slots[wid.index()]
    }
}

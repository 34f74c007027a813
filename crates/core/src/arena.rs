//! Generational arena plus intrusive doubly linked lists over its slots.
//!
//! Connection state in the engines lives in an [`Arena`]; membership in a
//! parent's child list or a waiting queue is expressed with [`Links`] stored
//! inside the node and a [`List`] holding head, tail and length. Handles are
//! plain indices, so a node can sit in a list while other code holds its
//! handle, and a removed node's handle goes stale instead of dangling.

use std::ops::{Index, IndexMut};

/// Reference to a slot in an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free_head: None, len: 0 }
    }

    pub fn insert(&mut self, value: T) -> Handle {
        self.len += 1;
        match self.free_head {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let (generation, next_free) = match slot {
                    Slot::Vacant { generation, next_free } => (*generation, *next_free),
                    Slot::Occupied { .. } => unreachable!("free list points at occupied slot"),
                };
                self.free_head = next_free;
                *slot = Slot::Occupied { generation, value };
                Handle { index, generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::Occupied { generation: 0, value });
                Handle { index, generation: 0 }
            }
        }
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => {
                let vacant = Slot::Vacant {
                    generation: generation.wrapping_add(1),
                    next_free: self.free_head,
                };
                let old = std::mem::replace(slot, vacant);
                self.free_head = Some(handle.index);
                self.len -= 1;
                match old {
                    Slot::Occupied { value, .. } => Some(value),
                    Slot::Vacant { .. } => None,
                }
            }
            _ => None,
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handles of every live slot, in slot order.
    pub fn handles(&self) -> Vec<Handle> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Occupied { generation, .. } => Some(Handle { index: i as u32, generation: *generation }),
                Slot::Vacant { .. } => None,
            })
            .collect()
    }
}

impl<T> Index<Handle> for Arena<T> {
    type Output = T;

    fn index(&self, handle: Handle) -> &T {
        self.get(handle).expect("stale arena handle")
    }
}

impl<T> IndexMut<Handle> for Arena<T> {
    fn index_mut(&mut self, handle: Handle) -> &mut T {
        self.get_mut(handle).expect("stale arena handle")
    }
}

/// Intrusive list pointers embedded in a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Links {
    prev: Option<Handle>,
    next: Option<Handle>,
    linked: bool,
}

impl Links {
    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

/// A node that can be a member of one [`List`] at a time.
pub trait Linked {
    fn links(&self) -> &Links;
    fn links_mut(&mut self) -> &mut Links;
}

/// Head/tail/length of an intrusive list whose nodes live in an arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct List {
    head: Option<Handle>,
    tail: Option<Handle>,
    len: usize,
}

impl List {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn front(&self) -> Option<Handle> {
        self.head
    }

    pub fn push_front<T: Linked>(&mut self, arena: &mut Arena<T>, handle: Handle) {
        let old_head = self.head;
        {
            let links = arena[handle].links_mut();
            assert!(!links.linked, "node is already in a list");
            *links = Links { prev: None, next: old_head, linked: true };
        }
        match old_head {
            Some(h) => arena[h].links_mut().prev = Some(handle),
            None => self.tail = Some(handle),
        }
        self.head = Some(handle);
        self.len += 1;
    }

    pub fn push_back<T: Linked>(&mut self, arena: &mut Arena<T>, handle: Handle) {
        let old_tail = self.tail;
        {
            let links = arena[handle].links_mut();
            assert!(!links.linked, "node is already in a list");
            *links = Links { prev: old_tail, next: None, linked: true };
        }
        match old_tail {
            Some(t) => arena[t].links_mut().next = Some(handle),
            None => self.head = Some(handle),
        }
        self.tail = Some(handle);
        self.len += 1;
    }

    /// Unlink `handle`, which must currently be a member of this list.
    pub fn remove<T: Linked>(&mut self, arena: &mut Arena<T>, handle: Handle) {
        let Links { prev, next, linked } = *arena[handle].links();
        assert!(linked, "node is not in a list");
        match prev {
            Some(p) => arena[p].links_mut().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => arena[n].links_mut().prev = prev,
            None => self.tail = prev,
        }
        *arena[handle].links_mut() = Links::default();
        self.len -= 1;
    }

    pub fn pop_front<T: Linked>(&mut self, arena: &mut Arena<T>) -> Option<Handle> {
        let head = self.head?;
        self.remove(arena, head);
        Some(head)
    }

    pub fn iter<'a, T: Linked>(&self, arena: &'a Arena<T>) -> ListIter<'a, T> {
        ListIter { arena, cursor: self.head }
    }
}

/// Front-to-back iterator over the handles of a [`List`].
pub struct ListIter<'a, T> {
    arena: &'a Arena<T>,
    cursor: Option<Handle>,
}

impl<'a, T: Linked> Iterator for ListIter<'a, T> {
    type Item = Handle;

    fn next(&mut self) -> Option<Handle> {
        let current = self.cursor?;
        self.cursor = self.arena.get(current).and_then(|n| n.links().next);
        Some(current)
    }
}

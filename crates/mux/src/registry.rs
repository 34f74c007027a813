//! Parents and their children.
//!
//! Each parent owns an intrusive list of the children multiplexed over it;
//! each child records which parent (if any) it has joined. Misuse (joining
//! twice, leaving without a parent, dropping a parent that still has
//! children) is a bug in the caller and panics.

use waterwall_core::{Arena, Handle, Linked, Links, List};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParentId(Handle);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildId(Handle);

#[derive(Debug)]
struct ParentNode<P> {
    children: List,
    value: P,
}

#[derive(Debug)]
struct ChildNode<C> {
    parent: Option<ParentId>,
    links: Links,
    value: C,
}

impl<C> Linked for ChildNode<C> {
    fn links(&self) -> &Links {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

#[derive(Debug)]
pub struct Registry<P, C> {
    parents: Arena<ParentNode<P>>,
    children: Arena<ChildNode<C>>,
}

impl<P, C> Default for Registry<P, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P, C> Registry<P, C> {
    pub fn new() -> Self {
        Self { parents: Arena::new(), children: Arena::new() }
    }

    pub fn insert_parent(&mut self, value: P) -> ParentId {
        ParentId(self.parents.insert(ParentNode { children: List::new(), value }))
    }

    pub fn insert_child(&mut self, value: C) -> ChildId {
        ChildId(self.children.insert(ChildNode { parent: None, links: Links::default(), value }))
    }

    /// Put `child` at the head of `parent`'s child list.
    pub fn join(&mut self, parent: ParentId, child: ChildId) {
        let node = &mut self.children[child.0];
        assert!(node.parent.is_none(), "child already joined a parent");
        node.parent = Some(parent);
        self.parents[parent.0].children.push_front(&mut self.children, child.0);
    }

    /// Unlink `child` from its parent and return that parent.
    pub fn leave(&mut self, child: ChildId) -> ParentId {
        let parent = self.children[child.0].parent.take().expect("leave on a child without parent");
        self.parents[parent.0].children.remove(&mut self.children, child.0);
        parent
    }

    pub fn parent_of(&self, child: ChildId) -> Option<ParentId> {
        self.children.get(child.0).and_then(|n| n.parent)
    }

    /// Children of `parent`, newest first.
    pub fn children(&self, parent: ParentId) -> impl Iterator<Item = ChildId> + '_ {
        let list = self.parents.get(parent.0).map(|p| p.children).unwrap_or_default();
        list.iter(&self.children).map(ChildId)
    }

    pub fn children_count(&self, parent: ParentId) -> usize {
        self.parents.get(parent.0).map_or(0, |p| p.children.len())
    }

    pub fn parent(&self, id: ParentId) -> Option<&P> {
        self.parents.get(id.0).map(|p| &p.value)
    }

    pub fn parent_mut(&mut self, id: ParentId) -> Option<&mut P> {
        self.parents.get_mut(id.0).map(|p| &mut p.value)
    }

    pub fn child(&self, id: ChildId) -> Option<&C> {
        self.children.get(id.0).map(|c| &c.value)
    }

    pub fn child_mut(&mut self, id: ChildId) -> Option<&mut C> {
        self.children.get_mut(id.0).map(|c| &mut c.value)
    }

    /// Drop a parent. It must have no children left.
    pub fn remove_parent(&mut self, id: ParentId) -> Option<P> {
        if let Some(node) = self.parents.get(id.0) {
            assert!(node.children.is_empty(), "parent removed while children are joined");
        }
        self.parents.remove(id.0).map(|p| p.value)
    }

    /// Drop a child. It must have left its parent.
    pub fn remove_child(&mut self, id: ChildId) -> Option<C> {
        if let Some(node) = self.children.get(id.0) {
            assert!(node.parent.is_none(), "child removed while joined");
        }
        self.children.remove(id.0).map(|c| c.value)
    }

    pub fn parent_ids(&self) -> Vec<ParentId> {
        self.parents.handles().into_iter().map(ParentId).collect()
    }

    pub fn parents_len(&self) -> usize {
        self.parents.len()
    }

    pub fn children_len(&self) -> usize {
        self.children.len()
    }
}

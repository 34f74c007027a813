//! State shared by both mux roles: parent and child records, the line
//! lookup table, frame output with deferral, and cascade teardown.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::BytesMut;
use tracing::debug;
use waterwall_core::{Chain, LineId, Route, Signal};

use crate::frame::{control_frame, data_frame, Frame, FrameFlag, FrameReader, MAX_FRAME_PAYLOAD, MAX_MAIN_CHANNEL_BUFFER};
use crate::registry::{ChildId, ParentId, Registry};
use crate::Result;

/// Frames waiting for a parent that cannot be written to yet.
#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    frames: VecDeque<BytesMut>,
    queued: usize,
    established: bool,
    paused: bool,
    throttled: Vec<ChildId>,
}

impl WriteQueue {
    fn new(established: bool) -> Self {
        Self { established, ..Default::default() }
    }

    fn is_open(&self) -> bool {
        self.established && !self.paused
    }

    pub(crate) fn queued_bytes(&self) -> usize {
        self.queued
    }
}

#[derive(Debug)]
pub(crate) struct Parent {
    pub line: LineId,
    pub creation: Instant,
    pub cids: HashMap<u32, ChildId>,
    reader: FrameReader,
    last_cid: u32,
    outbox: WriteQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildPhase {
    /// Parent is not established yet.
    Pending,
    Established,
}

#[derive(Debug)]
pub(crate) struct Child {
    pub line: LineId,
    pub cid: u32,
    pub phase: ChildPhase,
    /// Peer asked us to stop feeding this child.
    paused: bool,
    /// Paused by us because the parent's queue is over its cap.
    throttled: bool,
}

impl Child {
    /// The child's line stays paused while either source holds it.
    fn is_held(&self) -> bool {
        self.paused || self.throttled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Parent(ParentId),
    Child(ChildId),
}

#[derive(Debug)]
pub(crate) struct Session {
    name: &'static str,
    parent_route: Route,
    pub registry: Registry<Parent, Child>,
    lines: HashMap<LineId, Role>,
}

impl Session {
    /// `parent_route` is the direction physical connections lie in.
    pub fn new(name: &'static str, parent_route: Route) -> Self {
        Self { name, parent_route, registry: Registry::new(), lines: HashMap::new() }
    }

    pub fn parent_route(&self) -> Route {
        self.parent_route
    }

    pub fn child_route(&self) -> Route {
        self.parent_route.opposite()
    }

    pub fn role(&self, line: LineId) -> Option<Role> {
        self.lines.get(&line).copied()
    }

    pub fn parent(&self, p: ParentId) -> Option<&Parent> {
        self.registry.parent(p)
    }

    pub fn child(&self, c: ChildId) -> Option<&Child> {
        self.registry.child(c)
    }

    pub fn child_mut(&mut self, c: ChildId) -> Option<&mut Child> {
        self.registry.child_mut(c)
    }

    pub fn children_count(&self, p: ParentId) -> usize {
        self.registry.children_count(p)
    }

    pub fn open_parent(&mut self, line: LineId, now: Instant, established: bool) -> ParentId {
        let p = self.registry.insert_parent(Parent {
            line,
            creation: now,
            cids: HashMap::new(),
            reader: FrameReader::default(),
            last_cid: 0,
            outbox: WriteQueue::new(established),
        });
        self.lines.insert(line, Role::Parent(p));
        p
    }

    pub fn open_child(&mut self, p: ParentId, line: LineId, cid: u32, phase: ChildPhase) -> ChildId {
        let c = self.registry.insert_child(Child { line, cid, phase, paused: false, throttled: false });
        self.registry.join(p, c);
        if let Some(parent) = self.registry.parent_mut(p) {
            parent.cids.insert(cid, c);
        }
        self.lines.insert(line, Role::Child(c));
        c
    }

    /// Next unused connection id on `p`. Ids start at 1 and wrap, skipping
    /// ids still held by live children.
    pub fn allocate_cid(&mut self, p: ParentId) -> u32 {
        let Some(parent) = self.registry.parent_mut(p) else {
            return 0;
        };
        loop {
            parent.last_cid = parent.last_cid.wrapping_add(1);
            if parent.last_cid != 0 && !parent.cids.contains_key(&parent.last_cid) {
                return parent.last_cid;
            }
        }
    }

    pub fn find_child(&self, p: ParentId, cid: u32) -> Option<ChildId> {
        self.registry.parent(p).and_then(|parent| parent.cids.get(&cid).copied())
    }

    /// Detach and drop one child. Returns its former parent and state.
    pub fn close_child(&mut self, c: ChildId) -> Option<(ParentId, Child)> {
        self.registry.parent_of(c)?;
        let p = self.registry.leave(c);
        let child = self.registry.remove_child(c)?;
        if let Some(parent) = self.registry.parent_mut(p) {
            parent.cids.remove(&child.cid);
        }
        self.lines.remove(&child.line);
        Some((p, child))
    }

    /// Drop a parent after detaching every child. Children are returned
    /// newest first.
    pub fn close_parent(&mut self, p: ParentId) -> Option<(Parent, Vec<Child>)> {
        let ids: Vec<ChildId> = self.registry.children(p).collect();
        let mut children = Vec::with_capacity(ids.len());
        for c in ids {
            if let Some((_, child)) = self.close_child(c) {
                children.push(child);
            }
        }
        let parent = self.registry.remove_parent(p)?;
        self.lines.remove(&parent.line);
        Some((parent, children))
    }

    /// Tear down `p` and finish every child. The physical line is finished
    /// too when `finish_transport` is set.
    pub fn teardown_parent(&mut self, chain: &mut Chain, p: ParentId, finish_transport: bool) {
        let child_route = self.child_route();
        let Some((parent, children)) = self.close_parent(p) else {
            return;
        };
        debug!("{}: closing parent {} with {} children", self.name, parent.line, children.len());
        for child in children {
            chain.send(child_route, child.line, Signal::Finish);
        }
        if finish_transport {
            chain.send(self.parent_route, parent.line, Signal::Finish);
        }
    }

    pub fn push_input(&mut self, p: ParentId, data: BytesMut) -> Result<()> {
        match self.registry.parent_mut(p) {
            Some(parent) => parent.reader.push(data),
            None => Ok(()),
        }
    }

    pub fn next_frame(&mut self, p: ParentId) -> Result<Option<Frame>> {
        match self.registry.parent_mut(p) {
            Some(parent) => parent.reader.next_frame(),
            None => Ok(None),
        }
    }

    /// Send a frame on `p`, or queue it while the parent is not writable.
    /// `origin` is paused once the queue grows past its cap.
    pub fn write(&mut self, chain: &mut Chain, p: ParentId, frame: BytesMut, origin: Option<ChildId>) {
        let parent_route = self.parent_route;
        let child_route = self.child_route();
        let over_cap = {
            let Some(parent) = self.registry.parent_mut(p) else {
                return;
            };
            if parent.outbox.is_open() && parent.outbox.frames.is_empty() {
                chain.send(parent_route, parent.line, Signal::Payload(frame));
                return;
            }
            parent.outbox.queued += frame.len();
            parent.outbox.frames.push_back(frame);
            parent.outbox.queued > MAX_MAIN_CHANNEL_BUFFER
        };
        if !over_cap {
            return;
        }
        let Some(c) = origin else {
            return;
        };
        let Some(child) = self.registry.child_mut(c) else {
            return;
        };
        if child.throttled {
            return;
        }
        let was_held = child.is_held();
        child.throttled = true;
        debug!("{}: queue for parent is full, pausing child {}", self.name, child.line);
        if !was_held {
            chain.send(child_route, child.line, Signal::Pause);
        }
        if let Some(parent) = self.registry.parent_mut(p) {
            parent.outbox.throttled.push(c);
        }
    }

    /// Apply a FlowPause/FlowResume from the peer to child `c`. Pause is
    /// signalled when the child first becomes held and Resume only once
    /// neither the peer nor the queue cap holds it.
    pub fn set_peer_paused(&mut self, chain: &mut Chain, c: ChildId, paused: bool) {
        let child_route = self.child_route();
        let Some(child) = self.registry.child_mut(c) else {
            return;
        };
        if child.paused == paused {
            return;
        }
        let was_held = child.is_held();
        child.paused = paused;
        match (was_held, child.is_held()) {
            (false, true) => chain.send(child_route, child.line, Signal::Pause),
            (true, false) => chain.send(child_route, child.line, Signal::Resume),
            _ => {}
        }
    }

    pub fn write_control(&mut self, chain: &mut Chain, c: ChildId, flag: FrameFlag) {
        let Some(p) = self.registry.parent_of(c) else {
            return;
        };
        let Some(cid) = self.registry.child(c).map(|child| child.cid) else {
            return;
        };
        self.write(chain, p, control_frame(cid, flag), Some(c));
    }

    /// Frame `payload` as one or more Data frames for child `c`.
    pub fn write_data(&mut self, chain: &mut Chain, c: ChildId, mut payload: BytesMut) {
        let Some(p) = self.registry.parent_of(c) else {
            return;
        };
        let Some(cid) = self.registry.child(c).map(|child| child.cid) else {
            return;
        };
        while !payload.is_empty() {
            let chunk = payload.split_to(payload.len().min(MAX_FRAME_PAYLOAD));
            self.write(chain, p, data_frame(cid, &chunk), Some(c));
        }
    }

    /// Mark the parent established and flush what was queued for it.
    pub fn establish(&mut self, chain: &mut Chain, p: ParentId) {
        if let Some(parent) = self.registry.parent_mut(p) {
            parent.outbox.established = true;
        }
        self.flush(chain, p);
    }

    pub fn set_transport_paused(&mut self, chain: &mut Chain, p: ParentId, paused: bool) {
        if let Some(parent) = self.registry.parent_mut(p) {
            parent.outbox.paused = paused;
        }
        if !paused {
            self.flush(chain, p);
        }
    }

    fn flush(&mut self, chain: &mut Chain, p: ParentId) {
        let parent_route = self.parent_route;
        let child_route = self.child_route();
        let (line, frames, throttled) = {
            let Some(parent) = self.registry.parent_mut(p) else {
                return;
            };
            if !parent.outbox.is_open() {
                return;
            }
            parent.outbox.queued = 0;
            (
                parent.line,
                std::mem::take(&mut parent.outbox.frames),
                std::mem::take(&mut parent.outbox.throttled),
            )
        };
        for frame in frames {
            chain.send(parent_route, line, Signal::Payload(frame));
        }
        for c in throttled {
            if let Some(child) = self.registry.child_mut(c) {
                if child.throttled {
                    child.throttled = false;
                    if !child.is_held() {
                        chain.send(child_route, child.line, Signal::Resume);
                    }
                }
            }
        }
    }

    pub fn is_established(&self, p: ParentId) -> bool {
        self.registry.parent(p).is_some_and(|parent| parent.outbox.established)
    }

    pub fn queued_bytes(&self, p: ParentId) -> usize {
        self.registry.parent(p).map_or(0, |parent| parent.outbox.queued_bytes())
    }

    pub fn status(&self) -> String {
        let queued: usize = self.registry.parent_ids().into_iter().map(|p| self.queued_bytes(p)).sum();
        format!(
            "{}: parents={} children={} queued_bytes={}",
            self.name,
            self.registry.parents_len(),
            self.registry.children_len(),
            queued
        )
    }
}

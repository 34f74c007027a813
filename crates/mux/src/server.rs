//! MuxServer
//!
//! Physical connections arrive from the previous stage. Open frames on
//! them create child lines towards the next stage; Close, flow and Data
//! frames are routed to the child named by the frame's cid.

use bytes::BytesMut;
use tracing::{debug, info, warn};
use waterwall_core::{ApiResult, Chain, LineId, Route, Signal, Tunnel};

use crate::frame::{Frame, FrameFlag};
use crate::registry::{ChildId, ParentId};
use crate::session::{ChildPhase, Role, Session};

pub struct MuxServer {
    session: Session,
}

impl Default for MuxServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MuxServer {
    pub fn new() -> Self {
        Self { session: Session::new("MuxServer", Route::Prev) }
    }

    pub fn parents(&self) -> usize {
        self.session.registry.parents_len()
    }

    pub fn children(&self) -> usize {
        self.session.registry.children_len()
    }

    fn child_of(&self, line: LineId) -> Option<ChildId> {
        match self.session.role(line) {
            Some(Role::Child(c)) => Some(c),
            _ => None,
        }
    }

    fn parent_of(&self, line: LineId) -> Option<ParentId> {
        match self.session.role(line) {
            Some(Role::Parent(p)) => Some(p),
            _ => None,
        }
    }

    fn open_stream(&mut self, chain: &mut Chain, p: ParentId, cid: u32) {
        if self.session.find_child(p, cid).is_some() {
            debug!("MuxServer: duplicate Open for live cid {}, ignoring", cid);
            return;
        }
        let Some(wid) = self.session.parent(p).map(|parent| parent.line.wid) else {
            return;
        };
        let line = chain.create_line(wid);
        self.session.open_child(p, line, cid, ChildPhase::Established);
        debug!("MuxServer: Open frame received, cid: {} -> line {}", cid, line);
        chain.send_next(line, Signal::Init);
    }

    fn dispatch(&mut self, chain: &mut Chain, p: ParentId, frame: Frame) {
        if frame.flag == FrameFlag::Open {
            self.open_stream(chain, p, frame.cid);
            return;
        }
        let Some(c) = self.session.find_child(p, frame.cid) else {
            return;
        };
        match frame.flag {
            FrameFlag::Close => {
                debug!("MuxServer: Close frame received, cid: {}", frame.cid);
                if let Some((_, child)) = self.session.close_child(c) {
                    chain.send_next(child.line, Signal::Finish);
                }
            }
            FrameFlag::FlowPause | FrameFlag::FlowResume => {
                self.session.set_peer_paused(chain, c, frame.flag == FrameFlag::FlowPause);
            }
            FrameFlag::Data => {
                if let Some(child) = self.session.child(c) {
                    if !frame.payload.is_empty() {
                        chain.send_next(child.line, Signal::Payload(frame.payload));
                    }
                }
            }
            FrameFlag::Open => {}
        }
    }
}

impl Tunnel for MuxServer {
    fn name(&self) -> &'static str {
        "MuxServer"
    }

    fn on_start(&mut self, _chain: &mut Chain) {
        info!("MuxServer: started");
    }

    fn upstream_init(&mut self, chain: &mut Chain, line: LineId) {
        if self.session.role(line).is_some() {
            return;
        }
        self.session.open_parent(line, chain.now(), true);
        debug!("MuxServer: new parent {}", line);
        chain.send_prev(line, Signal::Est);
    }

    fn upstream_est(&mut self, _chain: &mut Chain, line: LineId) {
        debug!("MuxServer: ignoring est from previous stage on {}", line);
    }

    fn upstream_finish(&mut self, chain: &mut Chain, line: LineId) {
        if let Some(p) = self.parent_of(line) {
            debug!("MuxServer: parent {} finished", line);
            self.session.teardown_parent(chain, p, false);
        }
    }

    fn upstream_payload(&mut self, chain: &mut Chain, line: LineId, payload: BytesMut) {
        let Some(p) = self.parent_of(line) else {
            return;
        };
        if let Err(e) = self.session.push_input(p, payload) {
            warn!("MuxServer: {} on parent {}", e, line);
            self.session.teardown_parent(chain, p, true);
            return;
        }
        loop {
            match self.session.next_frame(p) {
                Ok(Some(frame)) => self.dispatch(chain, p, frame),
                Ok(None) => break,
                Err(e) => {
                    warn!("MuxServer: {} on parent {}, closing it", e, line);
                    self.session.teardown_parent(chain, p, true);
                    return;
                }
            }
        }
    }

    fn upstream_pause(&mut self, chain: &mut Chain, line: LineId) {
        if let Some(p) = self.parent_of(line) {
            self.session.set_transport_paused(chain, p, true);
        }
    }

    fn upstream_resume(&mut self, chain: &mut Chain, line: LineId) {
        if let Some(p) = self.parent_of(line) {
            self.session.set_transport_paused(chain, p, false);
        }
    }

    fn downstream_init(&mut self, chain: &mut Chain, line: LineId) {
        warn!("MuxServer: next stage tried to open line {}, refusing", line);
        chain.send_next(line, Signal::Finish);
    }

    fn downstream_est(&mut self, _chain: &mut Chain, line: LineId) {
        debug!("MuxServer: child {} established", line);
    }

    fn downstream_finish(&mut self, chain: &mut Chain, line: LineId) {
        let Some(c) = self.child_of(line) else {
            return;
        };
        self.session.write_control(chain, c, FrameFlag::Close);
        if let Some((_, child)) = self.session.close_child(c) {
            debug!("MuxServer: child {} (cid {}) finished", line, child.cid);
        }
    }

    fn downstream_payload(&mut self, chain: &mut Chain, line: LineId, payload: BytesMut) {
        if let Some(c) = self.child_of(line) {
            self.session.write_data(chain, c, payload);
        }
    }

    fn downstream_pause(&mut self, chain: &mut Chain, line: LineId) {
        if let Some(c) = self.child_of(line) {
            self.session.write_control(chain, c, FrameFlag::FlowPause);
        }
    }

    fn downstream_resume(&mut self, chain: &mut Chain, line: LineId) {
        if let Some(c) = self.child_of(line) {
            self.session.write_control(chain, c, FrameFlag::FlowResume);
        }
    }

    fn api(&mut self, request: &[u8]) -> ApiResult {
        match request {
            b"" | b"status" => ApiResult::Ok(self.session.status()),
            _ => ApiResult::Error(format!("MuxServer: unknown request {:?}", String::from_utf8_lossy(request))),
        }
    }
}

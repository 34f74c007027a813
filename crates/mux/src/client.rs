//! MuxClient
//!
//! Lines arriving from the previous stage become children multiplexed over
//! parent lines opened towards the next stage. Each worker keeps one parent
//! that is still accepting children; once the admission policy says it is
//! exhausted, the next child opens a fresh parent.

use bytes::BytesMut;
use tracing::{debug, info, warn};
use waterwall_core::{ApiResult, Chain, LineId, Route, Signal, Tunnel, WorkerId, WorkerSlots};

use crate::admission::Concurrency;
use crate::frame::{Frame, FrameFlag};
use crate::registry::ParentId;
use crate::session::{ChildPhase, Role, Session};
use crate::Result;

pub struct MuxClient {
    concurrency: Concurrency,
    /// Parent per worker that new children join while it has room.
    unsatisfied: WorkerSlots<Option<ParentId>>,
    session: Session,
}

impl MuxClient {
    pub fn new(workers: usize, concurrency: Concurrency) -> Result<Self> {
        Ok(Self {
            concurrency,
            unsatisfied: WorkerSlots::new(workers, |_| None)?,
            session: Session::new("MuxClient", Route::Next),
        })
    }

    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    pub fn parents(&self) -> usize {
        self.session.registry.parents_len()
    }

    pub fn children(&self) -> usize {
        self.session.registry.children_len()
    }

    fn is_exhausted(&self, chain: &Chain, p: ParentId) -> bool {
        match self.session.parent(p) {
            Some(parent) => {
                self.concurrency
                    .is_exhausted(chain.now(), parent.creation, self.session.children_count(p))
            }
            None => true,
        }
    }

    fn clear_slot(&mut self, wid: WorkerId, p: ParentId) {
        if let Some(slot) = self.unsatisfied.get_mut(wid) {
            if *slot == Some(p) {
                *slot = None;
            }
        }
    }

    /// Close `p` if it has no children and will not get any more.
    /// Returns whether it was closed.
    fn retire_if_idle(&mut self, chain: &mut Chain, p: ParentId) -> bool {
        let Some(parent) = self.session.parent(p) else {
            return true;
        };
        if self.session.children_count(p) != 0 {
            return false;
        }
        let wid = parent.line.wid;
        let in_slot = self.unsatisfied.get(wid) == Some(&Some(p));
        if in_slot && !self.is_exhausted(chain, p) {
            return false;
        }
        self.clear_slot(wid, p);
        self.session.teardown_parent(chain, p, true);
        true
    }

    fn abort_parent(&mut self, chain: &mut Chain, p: ParentId) {
        if let Some(parent) = self.session.parent(p) {
            let wid = parent.line.wid;
            self.clear_slot(wid, p);
        }
        self.session.teardown_parent(chain, p, true);
    }

    /// Handle one inbound frame. Returns false once the parent is gone.
    fn dispatch(&mut self, chain: &mut Chain, p: ParentId, frame: Frame) -> bool {
        if frame.flag == FrameFlag::Open {
            warn!("MuxClient: Open frame received for cid {}, peers never open towards a client", frame.cid);
            return true;
        }
        let Some(c) = self.session.find_child(p, frame.cid) else {
            return true;
        };
        match frame.flag {
            FrameFlag::Close => {
                debug!("MuxClient: Close frame received, cid: {}", frame.cid);
                if let Some((_, child)) = self.session.close_child(c) {
                    chain.send_prev(child.line, Signal::Finish);
                }
                return !self.retire_if_idle(chain, p);
            }
            FrameFlag::FlowPause | FrameFlag::FlowResume => {
                self.session.set_peer_paused(chain, c, frame.flag == FrameFlag::FlowPause);
            }
            FrameFlag::Data => {
                if let Some(child) = self.session.child(c) {
                    if !frame.payload.is_empty() {
                        chain.send_prev(child.line, Signal::Payload(frame.payload));
                    }
                }
            }
            FrameFlag::Open => {}
        }
        true
    }

    fn child_of(&self, line: LineId) -> Option<crate::registry::ChildId> {
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
}

impl Tunnel for MuxClient {
    fn name(&self) -> &'static str {
        "MuxClient"
    }

    fn on_start(&mut self, _chain: &mut Chain) {
        info!("MuxClient: started with {:?} on {} workers", self.concurrency, self.unsatisfied.len());
    }

    fn upstream_init(&mut self, chain: &mut Chain, line: LineId) {
        let wid = line.wid;
        let Some(slot) = self.unsatisfied.get(wid).copied() else {
            warn!("MuxClient: line {} is on unknown worker {}", line, wid);
            chain.send_prev(line, Signal::Finish);
            return;
        };

        let p = match slot {
            Some(p) if !self.is_exhausted(chain, p) => p,
            previous => {
                let parent_line = chain.create_line(wid);
                let p = self.session.open_parent(parent_line, chain.now(), false);
                self.unsatisfied[wid] = Some(p);
                chain.send_next(parent_line, Signal::Init);
                debug!("MuxClient: opening parent {} on {}", parent_line, wid);
                if let Some(old) = previous {
                    self.retire_if_idle(chain, old);
                }
                p
            }
        };

        let phase = if self.session.is_established(p) {
            chain.send_prev(line, Signal::Est);
            ChildPhase::Established
        } else {
            ChildPhase::Pending
        };
        let cid = self.session.allocate_cid(p);
        let c = self.session.open_child(p, line, cid, phase);
        self.session.write_control(chain, c, FrameFlag::Open);
        debug!("MuxClient: child {} joined with cid {}", line, cid);
    }

    fn upstream_est(&mut self, _chain: &mut Chain, line: LineId) {
        debug!("MuxClient: ignoring est from previous stage on {}", line);
    }

    fn upstream_finish(&mut self, chain: &mut Chain, line: LineId) {
        let Some(c) = self.child_of(line) else {
            return;
        };
        self.session.write_control(chain, c, FrameFlag::Close);
        if let Some((p, child)) = self.session.close_child(c) {
            debug!("MuxClient: child {} (cid {}) finished", line, child.cid);
            self.retire_if_idle(chain, p);
        }
    }

    fn upstream_payload(&mut self, chain: &mut Chain, line: LineId, payload: BytesMut) {
        if let Some(c) = self.child_of(line) {
            self.session.write_data(chain, c, payload);
        }
    }

    fn upstream_pause(&mut self, chain: &mut Chain, line: LineId) {
        if let Some(c) = self.child_of(line) {
            self.session.write_control(chain, c, FrameFlag::FlowPause);
        }
    }

    fn upstream_resume(&mut self, chain: &mut Chain, line: LineId) {
        if let Some(c) = self.child_of(line) {
            self.session.write_control(chain, c, FrameFlag::FlowResume);
        }
    }

    fn downstream_init(&mut self, chain: &mut Chain, line: LineId) {
        warn!("MuxClient: next stage tried to open line {}, refusing", line);
        chain.send_next(line, Signal::Finish);
    }

    fn downstream_est(&mut self, chain: &mut Chain, line: LineId) {
        let Some(p) = self.parent_of(line) else {
            return;
        };
        debug!("MuxClient: parent {} established", line);
        self.session.establish(chain, p);

        let mut pending: Vec<_> = self.session.registry.children(p).collect();
        pending.reverse();
        for c in pending {
            if let Some(child) = self.session.child_mut(c) {
                if child.phase == ChildPhase::Pending {
                    child.phase = ChildPhase::Established;
                    chain.send_prev(child.line, Signal::Est);
                }
            }
        }
    }

    fn downstream_finish(&mut self, chain: &mut Chain, line: LineId) {
        let Some(p) = self.parent_of(line) else {
            return;
        };
        debug!("MuxClient: parent {} finished by transport", line);
        self.clear_slot(line.wid, p);
        self.session.teardown_parent(chain, p, false);
    }

    fn downstream_payload(&mut self, chain: &mut Chain, line: LineId, payload: BytesMut) {
        let Some(p) = self.parent_of(line) else {
            return;
        };
        if let Err(e) = self.session.push_input(p, payload) {
            warn!("MuxClient: {} on parent {}", e, line);
            self.abort_parent(chain, p);
            return;
        }
        loop {
            match self.session.next_frame(p) {
                Ok(Some(frame)) => {
                    if !self.dispatch(chain, p, frame) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("MuxClient: {} on parent {}, closing it", e, line);
                    self.abort_parent(chain, p);
                    return;
                }
            }
        }
    }

    fn downstream_pause(&mut self, chain: &mut Chain, line: LineId) {
        if let Some(p) = self.parent_of(line) {
            self.session.set_transport_paused(chain, p, true);
        }
    }

    fn downstream_resume(&mut self, chain: &mut Chain, line: LineId) {
        if let Some(p) = self.parent_of(line) {
            self.session.set_transport_paused(chain, p, false);
        }
    }

    fn api(&mut self, request: &[u8]) -> ApiResult {
        match request {
            b"" | b"status" => ApiResult::Ok(self.session.status()),
            _ => ApiResult::Error(format!("MuxClient: unknown request {:?}", String::from_utf8_lossy(request))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameReader;
    use std::time::Duration;
    use waterwall_core::Emit;

    fn client(concurrency: Concurrency) -> (MuxClient, Chain) {
        (MuxClient::new(2, concurrency).unwrap(), Chain::default())
    }

    /// Decode every frame written to `line` towards the next stage.
    fn frames_on(out: &[Emit], line: LineId) -> Vec<Frame> {
        let mut reader = FrameReader::default();
        for e in out.iter().filter(|e| e.route == Route::Next && e.line == line) {
            if let Signal::Payload(b) = &e.signal {
                reader.push(b.clone()).unwrap();
            }
        }
        std::iter::from_fn(|| reader.next_frame().unwrap()).collect()
    }

    fn inits(out: &[Emit]) -> Vec<LineId> {
        out.iter()
            .filter(|e| e.route == Route::Next && e.signal == Signal::Init)
            .map(|e| e.line)
            .collect()
    }

    fn signals_to_prev(out: &[Emit], line: LineId) -> Vec<Signal> {
        out.iter()
            .filter(|e| e.route == Route::Prev && e.line == line)
            .map(|e| e.signal.clone())
            .collect()
    }

    fn wire(frames: &[Frame]) -> BytesMut {
        let mut out = BytesMut::new();
        for f in frames {
            out.extend_from_slice(&f.encode().unwrap());
        }
        out
    }

    #[test]
    fn test_counter_capacity_two_with_three_children() {
        let (mut mux, mut chain) = client(Concurrency::Counter(2));
        let users: Vec<_> = (0..3).map(|_| chain.create_line(WorkerId(0))).collect();
        for u in &users {
            mux.upstream_init(&mut chain, *u);
        }
        let out = chain.take_emitted();
        let parents = inits(&out);
        assert_eq!(parents.len(), 2);
        let (p1, p2) = (parents[0], parents[1]);

        // Nothing is written before the transport is established.
        assert!(frames_on(&out, p1).is_empty());

        mux.downstream_est(&mut chain, p1);
        mux.downstream_est(&mut chain, p2);
        let out = chain.take_emitted();
        assert_eq!(
            frames_on(&out, p1),
            vec![Frame::control(FrameFlag::Open, 1), Frame::control(FrameFlag::Open, 2)]
        );
        assert_eq!(frames_on(&out, p2), vec![Frame::control(FrameFlag::Open, 1)]);
        for u in &users {
            assert_eq!(signals_to_prev(&out, *u), vec![Signal::Est]);
        }

        // Closing the first user leaves the others alone.
        mux.upstream_finish(&mut chain, users[0]);
        let out = chain.take_emitted();
        assert_eq!(frames_on(&out, p1), vec![Frame::control(FrameFlag::Close, 1)]);
        assert!(out.iter().all(|e| e.route == Route::Next));

        // Losing P1 finishes only the second user.
        mux.downstream_finish(&mut chain, p1);
        let out = chain.take_emitted();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].line, users[1]);
        assert_eq!(out[0].signal, Signal::Finish);
        assert_eq!(mux.parents(), 1);
        assert_eq!(mux.children(), 1);
    }

    #[test]
    fn test_child_joining_established_parent_gets_est_immediately() {
        let (mut mux, mut chain) = client(Concurrency::Counter(4));
        let a = chain.create_line(WorkerId(1));
        mux.upstream_init(&mut chain, a);
        let p = inits(&chain.take_emitted())[0];
        assert_eq!(p.wid, WorkerId(1));
        mux.downstream_est(&mut chain, p);
        chain.take_emitted();

        let b = chain.create_line(WorkerId(1));
        mux.upstream_init(&mut chain, b);
        let out = chain.take_emitted();
        assert_eq!(signals_to_prev(&out, b), vec![Signal::Est]);
        assert_eq!(frames_on(&out, p), vec![Frame::control(FrameFlag::Open, 2)]);
    }

    #[test]
    fn test_zero_capacity_never_shares() {
        let (mut mux, mut chain) = client(Concurrency::Counter(0));
        let a = chain.create_line(WorkerId(0));
        let b = chain.create_line(WorkerId(0));
        mux.upstream_init(&mut chain, a);
        mux.upstream_init(&mut chain, b);
        let out = chain.take_emitted();
        let parents = inits(&out);
        assert_eq!(parents.len(), 2);

        mux.downstream_est(&mut chain, parents[0]);
        chain.take_emitted();
        mux.upstream_finish(&mut chain, a);
        let out = chain.take_emitted();
        assert_eq!(frames_on(&out, parents[0]), vec![Frame::control(FrameFlag::Close, 1)]);
        assert_eq!(out.last().unwrap().signal, Signal::Finish);
        assert_eq!(out.last().unwrap().line, parents[0]);
        assert_eq!(mux.parents(), 1);
    }

    #[test]
    fn test_timer_mode_opens_new_parent_after_duration() {
        let (mut mux, mut chain) = client(Concurrency::Timer(Duration::from_millis(100)));
        let start = chain.now();
        for _ in 0..3 {
            let l = chain.create_line(WorkerId(0));
            mux.upstream_init(&mut chain, l);
        }
        assert_eq!(inits(&chain.take_emitted()).len(), 1);

        chain.set_now(start + Duration::from_millis(100));
        let l = chain.create_line(WorkerId(0));
        mux.upstream_init(&mut chain, l);
        assert_eq!(inits(&chain.take_emitted()).len(), 1);
        assert_eq!(mux.parents(), 2);
    }

    #[test]
    fn test_downstream_frames_reach_children() {
        let (mut mux, mut chain) = client(Concurrency::Counter(8));
        let a = chain.create_line(WorkerId(0));
        let b = chain.create_line(WorkerId(0));
        mux.upstream_init(&mut chain, a);
        mux.upstream_init(&mut chain, b);
        let p = inits(&chain.take_emitted())[0];
        mux.downstream_est(&mut chain, p);
        chain.take_emitted();

        let bytes = wire(&[
            Frame::data(2, b"to-b"),
            Frame::control(FrameFlag::FlowPause, 1),
            Frame::data(1, b"to-a"),
            Frame::data(99, b"stale"),
            Frame::control(FrameFlag::FlowResume, 1),
            Frame::control(FrameFlag::Close, 2),
        ]);
        let (first, second) = bytes.split_at(13);
        mux.downstream_payload(&mut chain, p, BytesMut::from(first));
        mux.downstream_payload(&mut chain, p, BytesMut::from(second));

        let out = chain.take_emitted();
        assert_eq!(
            signals_to_prev(&out, a),
            vec![Signal::Pause, Signal::payload(b"to-a"), Signal::Resume]
        );
        assert_eq!(signals_to_prev(&out, b), vec![Signal::payload(b"to-b"), Signal::Finish]);
        assert_eq!(mux.children(), 1);
    }

    #[test]
    fn test_unknown_flag_tears_down_parent() {
        let (mut mux, mut chain) = client(Concurrency::Counter(8));
        let users: Vec<_> = (0..3).map(|_| chain.create_line(WorkerId(0))).collect();
        for u in &users {
            mux.upstream_init(&mut chain, *u);
        }
        let p = inits(&chain.take_emitted())[0];
        mux.downstream_est(&mut chain, p);
        chain.take_emitted();

        let mut raw = crate::frame::FrameHeader::new(1, FrameFlag::Close, 0).to_bytes();
        raw[2] = 9;
        mux.downstream_payload(&mut chain, p, BytesMut::from(&raw[..]));

        let out = chain.take_emitted();
        for u in &users {
            assert_eq!(signals_to_prev(&out, *u), vec![Signal::Finish]);
        }
        assert_eq!(out.last().unwrap().line, p);
        assert_eq!(out.last().unwrap().signal, Signal::Finish);
        assert_eq!(mux.parents(), 0);
        assert_eq!(mux.children(), 0);

        // The worker slot was cleared, so a new user opens a new parent.
        let u = chain.create_line(WorkerId(0));
        mux.upstream_init(&mut chain, u);
        assert_eq!(inits(&chain.take_emitted()).len(), 1);
    }

    #[test]
    fn test_transport_failure_before_est_finishes_pending_children() {
        let (mut mux, mut chain) = client(Concurrency::Counter(8));
        let a = chain.create_line(WorkerId(0));
        mux.upstream_init(&mut chain, a);
        let p = inits(&chain.take_emitted())[0];

        mux.downstream_finish(&mut chain, p);
        let out = chain.take_emitted();
        assert_eq!(signals_to_prev(&out, a), vec![Signal::Finish]);
        assert!(out.iter().all(|e| e.route == Route::Prev));
    }

    #[test]
    fn test_close_frame_retires_exhausted_empty_parent() {
        let (mut mux, mut chain) = client(Concurrency::Timer(Duration::from_millis(50)));
        let a = chain.create_line(WorkerId(0));
        mux.upstream_init(&mut chain, a);
        let p = inits(&chain.take_emitted())[0];
        mux.downstream_est(&mut chain, p);
        chain.take_emitted();

        let later = chain.now() + Duration::from_millis(50);
        chain.set_now(later);
        mux.downstream_payload(&mut chain, p, wire(&[Frame::control(FrameFlag::Close, 1)]));
        let out = chain.take_emitted();
        assert_eq!(signals_to_prev(&out, a), vec![Signal::Finish]);
        assert_eq!(out.last().unwrap().line, p);
        assert_eq!(out.last().unwrap().signal, Signal::Finish);
        assert_eq!(mux.parents(), 0);
    }

    #[test]
    fn test_child_pause_sends_flow_frames() {
        let (mut mux, mut chain) = client(Concurrency::Counter(8));
        let a = chain.create_line(WorkerId(0));
        mux.upstream_init(&mut chain, a);
        let p = inits(&chain.take_emitted())[0];
        mux.downstream_est(&mut chain, p);
        chain.take_emitted();

        mux.upstream_pause(&mut chain, a);
        mux.upstream_payload(&mut chain, a, BytesMut::from(&b"xyz"[..]));
        mux.upstream_resume(&mut chain, a);
        let out = chain.take_emitted();
        assert_eq!(
            frames_on(&out, p),
            vec![
                Frame::control(FrameFlag::FlowPause, 1),
                Frame::data(1, b"xyz"),
                Frame::control(FrameFlag::FlowResume, 1),
            ]
        );
    }

    /// One child on an established parent whose transport is write-paused.
    fn paused_transport() -> (MuxClient, Chain, LineId, LineId) {
        let (mut mux, mut chain) = client(Concurrency::Counter(8));
        let a = chain.create_line(WorkerId(0));
        mux.upstream_init(&mut chain, a);
        let p = inits(&chain.take_emitted())[0];
        mux.downstream_est(&mut chain, p);
        mux.downstream_pause(&mut chain, p);
        chain.take_emitted();
        (mux, chain, a, p)
    }

    fn fill_queue(mux: &mut MuxClient, chain: &mut Chain, a: LineId, writes: usize) {
        for _ in 0..writes {
            mux.upstream_payload(chain, a, BytesMut::zeroed(crate::frame::MAX_FRAME_PAYLOAD));
        }
    }

    fn flow(signals: &[Signal]) -> Vec<Signal> {
        signals.iter().filter(|s| matches!(s, Signal::Pause | Signal::Resume)).cloned().collect()
    }

    #[test]
    fn test_peer_resume_keeps_throttled_child_paused() {
        let (mut mux, mut chain, a, p) = paused_transport();
        fill_queue(&mut mux, &mut chain, a, 17);
        assert_eq!(signals_to_prev(&chain.take_emitted(), a), vec![Signal::Pause]);

        // The queue is still over its cap, so the peer cannot lift the pause.
        let flow_frames = wire(&[
            Frame::control(FrameFlag::FlowPause, 1),
            Frame::control(FrameFlag::FlowResume, 1),
        ]);
        mux.downstream_payload(&mut chain, p, flow_frames);
        assert!(signals_to_prev(&chain.take_emitted(), a).is_empty());

        mux.downstream_resume(&mut chain, p);
        let out = chain.take_emitted();
        assert_eq!(signals_to_prev(&out, a), vec![Signal::Resume]);
        assert_eq!(mux.session.queued_bytes(mux.parent_of(p).unwrap()), 0);

        // A later overflow pauses the child again.
        mux.downstream_pause(&mut chain, p);
        fill_queue(&mut mux, &mut chain, a, 17);
        assert_eq!(signals_to_prev(&chain.take_emitted(), a), vec![Signal::Pause]);
    }

    #[test]
    fn test_flush_keeps_peer_pause() {
        let (mut mux, mut chain, a, p) = paused_transport();
        mux.downstream_payload(&mut chain, p, wire(&[Frame::control(FrameFlag::FlowPause, 1)]));
        assert_eq!(signals_to_prev(&chain.take_emitted(), a), vec![Signal::Pause]);

        fill_queue(&mut mux, &mut chain, a, 17);
        assert!(signals_to_prev(&chain.take_emitted(), a).is_empty());

        mux.downstream_resume(&mut chain, p);
        let out = chain.take_emitted();
        assert!(flow(&signals_to_prev(&out, a)).is_empty());
        assert_eq!(frames_on(&out, p).len(), 17);

        mux.downstream_payload(&mut chain, p, wire(&[Frame::control(FrameFlag::FlowResume, 1)]));
        assert_eq!(signals_to_prev(&chain.take_emitted(), a), vec![Signal::Resume]);
    }

    #[test]
    fn test_api_status() {
        let (mut mux, _) = client(Concurrency::Counter(2));
        assert!(matches!(mux.api(b"status"), ApiResult::Ok(s) if s.starts_with("MuxClient")));
        assert!(matches!(mux.api(b"reset"), ApiResult::Error(_)));
    }
}

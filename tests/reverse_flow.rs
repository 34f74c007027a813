//! Integration tests for reverse tunnel pairing
//!
//! A ReverseClient dials a ReverseServer in memory. The client's next stage
//! is the server's previous stage; users arrive at the server from its next
//! stage and the client's previous stage is the local service.
//!
//! 1. The client fills its idle pool and a user gets paired with it
//! 2. Bytes a user sends before any peer exists are delivered on pairing
//! 3. Closing either end of a pair closes the other
//! 4. Pause and resume cross the pair

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use waterwall_core::{Chain, Emit, LineId, LineIds, Route, Signal, TimerRequest, Tunnel, WorkerId};
use waterwall_reverse::{ReverseClient, ReverseServer, Role};

// =============================================================================
// HELPERS
// =============================================================================

struct Pairing {
    ids: Arc<LineIds>,
    rc: ReverseClient,
    rs: ReverseServer,
    cc: Chain,
    sc: Chain,
    /// Client timers not fired yet
    timers: Vec<TimerRequest>,
    /// Server output towards users
    users: Vec<Emit>,
    /// Client output towards the local service
    local: Vec<Emit>,
}

impl Pairing {
    fn new() -> Self {
        let ids = Arc::new(LineIds::new());
        Self {
            rc: ReverseClient::new(1, 0).unwrap(),
            rs: ReverseServer::new(1).unwrap(),
            cc: Chain::new(ids.clone()),
            sc: Chain::new(ids.clone()),
            ids,
            timers: Vec::new(),
            users: Vec::new(),
            local: Vec::new(),
        }
    }

    fn pump(&mut self) {
        loop {
            let from_client = self.cc.take_emitted();
            let from_server = self.sc.take_emitted();
            self.timers.extend(self.cc.take_timers());
            if from_client.is_empty() && from_server.is_empty() {
                break;
            }
            for e in from_client {
                match e.route {
                    Route::Prev => self.local.push(e),
                    Route::Next => self.to_server(e.line, e.signal),
                }
            }
            for e in from_server {
                match e.route {
                    Route::Next => self.users.push(e),
                    Route::Prev => self.rc.downstream(&mut self.cc, e.line, e.signal),
                }
            }
        }
    }

    fn to_server(&mut self, line: LineId, signal: Signal) {
        match signal {
            // The dial succeeds at once.
            Signal::Init => {
                self.rs.upstream_init(&mut self.sc, line);
                self.rc.downstream_est(&mut self.cc, line);
            }
            other => self.rs.upstream(&mut self.sc, line, other),
        }
    }

    /// Fire connect timers until the pool stops changing.
    fn settle(&mut self) {
        loop {
            self.pump();
            let (due, later): (Vec<_>, Vec<_>) =
                self.timers.drain(..).partition(|t| t.delay < Duration::from_secs(1));
            self.timers = later;
            if due.is_empty() {
                break;
            }
            for t in due {
                self.rc.on_timer(&mut self.cc, t.wid, t.token);
            }
        }
    }

    fn start(&mut self) {
        self.rc.on_start(&mut self.cc);
        self.settle();
    }

    fn user_arrives(&mut self) -> LineId {
        let line = self.ids.allocate(WorkerId(0));
        self.rs.downstream_init(&mut self.sc, line);
        self.settle();
        line
    }

    /// Lines the client opened towards the local service.
    fn local_lines(&self) -> Vec<LineId> {
        self.local
            .iter()
            .filter(|e| e.signal == Signal::Init)
            .map(|e| e.line)
            .collect()
    }

    fn received(out: &[Emit], line: LineId) -> Vec<u8> {
        out.iter()
            .filter(|e| e.line == line)
            .filter_map(|e| match &e.signal {
                Signal::Payload(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn signals(out: &[Emit], line: LineId) -> Vec<Signal> {
        out.iter()
            .filter(|e| e.line == line && !matches!(e.signal, Signal::Payload(_)))
            .map(|e| e.signal.clone())
            .collect()
    }
}

// =============================================================================
// 1. Pool and pairing
// =============================================================================

#[test]
fn test_pool_fills_and_user_is_paired() {
    let mut p = Pairing::new();
    p.start();

    assert_eq!(p.rc.min_unused(), 2);
    assert_eq!(p.rc.unused(WorkerId(0)), 2);
    assert_eq!(p.rs.waiting(WorkerId(0), Role::Download), 2);
    assert_eq!(p.rc.idle_table().len(), 2);

    let user = p.user_arrives();
    let local = p.local_lines();
    assert_eq!(local.len(), 1);
    assert_eq!(p.rs.paired(), 1);
    assert_eq!(p.rc.active(), 1);
    // The consumed connection was replaced.
    assert_eq!(p.rs.waiting(WorkerId(0), Role::Download), 2);
    assert_eq!(p.rc.unused(WorkerId(0)), 2);

    p.rs.downstream_payload(&mut p.sc, user, BytesMut::from(&b"GET / HTTP/1.1\r\n\r\n"[..]));
    p.pump();
    assert_eq!(Pairing::received(&p.local, local[0]), b"GET / HTTP/1.1\r\n\r\n");

    p.rc.upstream_payload(&mut p.cc, local[0], BytesMut::from(&b"HTTP/1.1 200 OK\r\n\r\n"[..]));
    p.pump();
    assert_eq!(Pairing::received(&p.users, user), b"HTTP/1.1 200 OK\r\n\r\n");
}

#[test]
fn test_users_are_paired_in_arrival_order() {
    let mut p = Pairing::new();
    p.start();
    let first = p.user_arrives();
    let second = p.user_arrives();
    let local = p.local_lines();
    assert_eq!(local.len(), 2);

    p.rs.downstream_payload(&mut p.sc, second, BytesMut::from(&b"two"[..]));
    p.rs.downstream_payload(&mut p.sc, first, BytesMut::from(&b"one"[..]));
    p.pump();
    assert_eq!(Pairing::received(&p.local, local[0]), b"one");
    assert_eq!(Pairing::received(&p.local, local[1]), b"two");
}

// =============================================================================
// 2. Early data
// =============================================================================

#[test]
fn test_user_bytes_before_pairing_are_delivered() {
    let mut p = Pairing::new();
    let user = p.user_arrives();
    p.rs.downstream_payload(&mut p.sc, user, BytesMut::from(&b"early"[..]));
    p.rs.downstream_payload(&mut p.sc, user, BytesMut::from(&b" bird"[..]));
    assert_eq!(p.rs.waiting(WorkerId(0), Role::Upload), 1);

    p.start();
    let local = p.local_lines();
    assert_eq!(local.len(), 1);
    assert_eq!(Pairing::signals(&p.local, local[0]), vec![Signal::Init]);
    assert_eq!(Pairing::received(&p.local, local[0]), b"early bird");
    assert_eq!(p.rs.waiting(WorkerId(0), Role::Upload), 0);
}

// =============================================================================
// 3. Close
// =============================================================================

#[test]
fn test_user_close_reaches_local_service() {
    let mut p = Pairing::new();
    p.start();
    let user = p.user_arrives();
    let local = p.local_lines()[0];

    p.rs.downstream_finish(&mut p.sc, user);
    p.settle();
    assert_eq!(Pairing::signals(&p.local, local), vec![Signal::Init, Signal::Finish]);
    assert_eq!(p.rc.active(), 0);
    assert_eq!(p.rs.paired(), 0);
}

#[test]
fn test_local_close_reaches_user() {
    let mut p = Pairing::new();
    p.start();
    let user = p.user_arrives();
    let local = p.local_lines()[0];

    p.rc.upstream_finish(&mut p.cc, local);
    p.settle();
    assert_eq!(Pairing::signals(&p.users, user), vec![Signal::Finish]);
    assert_eq!(p.rc.active(), 0);
    assert_eq!(p.rs.paired(), 0);
    // The pool is still full.
    assert_eq!(p.rs.waiting(WorkerId(0), Role::Download), 2);
}

// =============================================================================
// 4. Flow control
// =============================================================================

#[test]
fn test_pause_and_resume_cross_the_pair() {
    let mut p = Pairing::new();
    p.start();
    let user = p.user_arrives();
    let local = p.local_lines()[0];

    p.rs.downstream_pause(&mut p.sc, user);
    p.pump();
    assert_eq!(Pairing::signals(&p.local, local), vec![Signal::Init, Signal::Pause]);

    p.rc.upstream_pause(&mut p.cc, local);
    p.rc.upstream_resume(&mut p.cc, local);
    p.pump();
    assert_eq!(Pairing::signals(&p.users, user), vec![Signal::Pause, Signal::Resume]);
}

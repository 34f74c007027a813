//! ReverseServer
//!
//! Peer connections from reverse clients arrive from the previous stage and
//! must open with the handshake preamble. User connections arrive from the
//! next stage. Each side waits in its worker's queue until a counterpart
//! shows up; the pair then relays in both directions.
//!
//! A socket with no counterpart on its own worker is paired with one queued
//! on another worker. The two lines keep their own `WorkerId`s; this is safe
//! because the runtime serialises every callback on one engine task.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};
use tracing::{debug, info, warn};
use waterwall_core::{
    ApiResult, Arena, Chain, Handle, LineId, Linked, Links, Route, Signal, Tunnel, WorkerId, WorkerSlots,
};

use crate::handshake::HandshakeReader;
use crate::waiting::{Role, WaitingBox};
use crate::{Result, ReverseError, HANDSHAKE_BYTE, MAX_BUFFERING};

#[derive(Debug)]
enum Phase {
    Handshaking(HandshakeReader),
    Waiting(BytesMut),
    Paired(LineId),
}

#[derive(Debug)]
struct Socket {
    line: LineId,
    role: Role,
    links: Links,
    phase: Phase,
}

impl Linked for Socket {
    fn links(&self) -> &Links {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

/// Stage a connection of `role` lives on.
fn side(role: Role) -> Route {
    match role {
        Role::Upload => Route::Next,
        Role::Download => Route::Prev,
    }
}

pub struct ReverseServer {
    sockets: Arena<Socket>,
    lines: HashMap<LineId, Handle>,
    boxes: WorkerSlots<WaitingBox>,
}

impl ReverseServer {
    pub fn new(workers: usize) -> Result<Self> {
        Ok(Self {
            sockets: Arena::new(),
            lines: HashMap::new(),
            boxes: WorkerSlots::new(workers, |_| WaitingBox::new())?,
        })
    }

    /// Connections of `role` waiting on worker `wid`.
    pub fn waiting(&self, wid: WorkerId, role: Role) -> usize {
        self.boxes.get(wid).map_or(0, |b| b.count(role))
    }

    pub fn paired(&self) -> usize {
        self.lines
            .values()
            .filter(|h| matches!(self.sockets.get(**h).map(|s| &s.phase), Some(Phase::Paired(_))))
            .count()
            / 2
    }

    fn accept(&mut self, chain: &mut Chain, line: LineId, role: Role) {
        if self.lines.contains_key(&line) {
            return;
        }
        if self.boxes.get(line.wid).is_none() {
            warn!("ReverseServer: line {} is on unknown worker {}", line, line.wid);
            chain.send(side(role), line, Signal::Finish);
            return;
        }
        let phase = match role {
            Role::Download => Phase::Handshaking(HandshakeReader::new()),
            Role::Upload => Phase::Waiting(BytesMut::new()),
        };
        let h = self.sockets.insert(Socket { line, role, links: Links::default(), phase });
        self.lines.insert(line, h);
        if role == Role::Upload {
            self.arrive(chain, h);
        }
    }

    /// `h` just entered the waiting state: pair it or queue it.
    fn arrive(&mut self, chain: &mut Chain, h: Handle) {
        let Socket { line, role, .. } = self.sockets[h];
        let wanted = role.opposite();

        let mut partner = self.boxes[line.wid].pop(&mut self.sockets, wanted);
        if partner.is_none() {
            for i in 0..self.boxes.len() {
                let wid = WorkerId(i as u16);
                if wid == line.wid {
                    continue;
                }
                partner = self.boxes[wid].pop(&mut self.sockets, wanted);
                if partner.is_some() {
                    break;
                }
            }
        }

        match partner {
            Some(other) => self.pair(chain, h, other),
            None => {
                self.boxes[line.wid].push(&mut self.sockets, role, h);
                debug!(
                    "ReverseServer: {:?} {} waiting on {} ({} queued)",
                    role,
                    line,
                    line.wid,
                    self.waiting(line.wid, role)
                );
            }
        }
    }

    fn pair(&mut self, chain: &mut Chain, a: Handle, b: Handle) {
        let (u, d) = if self.sockets[a].role == Role::Upload { (a, b) } else { (b, a) };
        let u_line = self.sockets[u].line;
        let d_line = self.sockets[d].line;

        let ubuf = take_buffer(&mut self.sockets[u].phase);
        let dbuf = take_buffer(&mut self.sockets[d].phase);
        self.sockets[u].phase = Phase::Paired(d_line);
        self.sockets[d].phase = Phase::Paired(u_line);

        info!("ReverseServer: paired user {} with peer {}", u_line, d_line);

        let mut first = BytesMut::with_capacity(1 + ubuf.len());
        first.put_u8(HANDSHAKE_BYTE);
        first.extend_from_slice(&ubuf);
        chain.send_prev(d_line, Signal::Payload(first));
        if !dbuf.is_empty() {
            chain.send_next(u_line, Signal::Payload(dbuf));
        }
    }

    /// Append to a waiting connection's buffer, failing once it holds more
    /// than [`MAX_BUFFERING`] bytes.
    fn buffer(&mut self, h: Handle, data: BytesMut) -> Result<()> {
        match &mut self.sockets[h].phase {
            Phase::Waiting(buf) => {
                buf.extend_from_slice(&data);
                if buf.len() > MAX_BUFFERING {
                    return Err(ReverseError::BufferOverflow(buf.len()));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Drop `h` after a protocol failure and finish its line.
    fn reject(&mut self, chain: &mut Chain, h: Handle, err: ReverseError) {
        if let Some(socket) = self.remove_socket(h) {
            warn!("ReverseServer: {} on {}, dropping connection", err, socket.line);
            chain.send(side(socket.role), socket.line, Signal::Finish);
        }
    }

    fn remove_socket(&mut self, h: Handle) -> Option<Socket> {
        let (wid, role, queued) = {
            let s = self.sockets.get(h)?;
            (s.line.wid, s.role, s.links.is_linked())
        };
        if queued {
            if let Some(b) = self.boxes.get_mut(wid) {
                b.remove(&mut self.sockets, role, h);
            }
        }
        let socket = self.sockets.remove(h)?;
        self.lines.remove(&socket.line);
        Some(socket)
    }

    fn payload(&mut self, chain: &mut Chain, line: LineId, data: BytesMut) {
        let Some(&h) = self.lines.get(&line) else {
            return;
        };
        let role = self.sockets[h].role;
        if let Phase::Paired(other) = self.sockets[h].phase {
            chain.send(side(role.opposite()), other, Signal::Payload(data));
            return;
        }
        if matches!(self.sockets[h].phase, Phase::Waiting(_)) {
            if let Err(e) = self.buffer(h, data) {
                self.reject(chain, h, e);
            }
            return;
        }

        let fed = match &mut self.sockets[h].phase {
            Phase::Handshaking(reader) => reader.feed(data),
            _ => return,
        };
        match fed {
            Ok(None) => {}
            Ok(Some(rest)) => {
                debug!("ReverseServer: handshake done on {}", line);
                self.sockets[h].phase = Phase::Waiting(BytesMut::new());
                match self.buffer(h, rest) {
                    Ok(()) => self.arrive(chain, h),
                    Err(e) => self.reject(chain, h, e),
                }
            }
            Err(e) => self.reject(chain, h, e),
        }
    }

    fn finish(&mut self, chain: &mut Chain, line: LineId) {
        let Some(&h) = self.lines.get(&line) else {
            return;
        };
        let Some(socket) = self.remove_socket(h) else {
            return;
        };
        if let Phase::Paired(other) = socket.phase {
            if let Some(&oh) = self.lines.get(&other) {
                self.remove_socket(oh);
            }
            debug!("ReverseServer: {} closed, closing its pair {}", line, other);
            chain.send(side(socket.role.opposite()), other, Signal::Finish);
        }
    }

    /// Forward a flow signal to the paired counterpart, if any.
    fn relay(&mut self, chain: &mut Chain, line: LineId, signal: Signal) {
        let Some(&h) = self.lines.get(&line) else {
            return;
        };
        let socket = &self.sockets[h];
        if let Phase::Paired(other) = socket.phase {
            chain.send(side(socket.role.opposite()), other, signal);
        }
    }
}

fn take_buffer(phase: &mut Phase) -> BytesMut {
    match phase {
        Phase::Waiting(buf) => std::mem::take(buf),
        _ => BytesMut::new(),
    }
}

impl Tunnel for ReverseServer {
    fn name(&self) -> &'static str {
        "ReverseServer"
    }

    fn on_start(&mut self, _chain: &mut Chain) {
        info!("ReverseServer: started on {} workers", self.boxes.len());
    }

    fn upstream_init(&mut self, chain: &mut Chain, line: LineId) {
        self.accept(chain, line, Role::Download);
    }

    fn upstream_est(&mut self, _chain: &mut Chain, _line: LineId) {}

    fn upstream_finish(&mut self, chain: &mut Chain, line: LineId) {
        self.finish(chain, line);
    }

    fn upstream_payload(&mut self, chain: &mut Chain, line: LineId, payload: BytesMut) {
        self.payload(chain, line, payload);
    }

    fn upstream_pause(&mut self, chain: &mut Chain, line: LineId) {
        self.relay(chain, line, Signal::Pause);
    }

    fn upstream_resume(&mut self, chain: &mut Chain, line: LineId) {
        self.relay(chain, line, Signal::Resume);
    }

    fn downstream_init(&mut self, chain: &mut Chain, line: LineId) {
        self.accept(chain, line, Role::Upload);
    }

    fn downstream_est(&mut self, _chain: &mut Chain, _line: LineId) {}

    fn downstream_finish(&mut self, chain: &mut Chain, line: LineId) {
        self.finish(chain, line);
    }

    fn downstream_payload(&mut self, chain: &mut Chain, line: LineId, payload: BytesMut) {
        self.payload(chain, line, payload);
    }

    fn downstream_pause(&mut self, chain: &mut Chain, line: LineId) {
        self.relay(chain, line, Signal::Pause);
    }

    fn downstream_resume(&mut self, chain: &mut Chain, line: LineId) {
        self.relay(chain, line, Signal::Resume);
    }

    fn api(&mut self, request: &[u8]) -> ApiResult {
        match request {
            b"" | b"status" => {
                let (mut uploads, mut downloads) = (0, 0);
                for (_, b) in self.boxes.iter() {
                    uploads += b.count(Role::Upload);
                    downloads += b.count(Role::Download);
                }
                ApiResult::Ok(format!(
                    "ReverseServer: waiting_uploads={} waiting_downloads={} paired={}",
                    uploads,
                    downloads,
                    self.paired()
                ))
            }
            _ => ApiResult::Error(format!("ReverseServer: unknown request {:?}", String::from_utf8_lossy(request))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::preamble;
    use crate::HANDSHAKE_LEN;
    use waterwall_core::Emit;

    fn server(workers: usize) -> (ReverseServer, Chain) {
        (ReverseServer::new(workers).unwrap(), Chain::default())
    }

    fn peer(rs: &mut ReverseServer, chain: &mut Chain, wid: u16) -> LineId {
        let d = chain.create_line(WorkerId(wid));
        rs.upstream_init(chain, d);
        rs.upstream_payload(chain, d, preamble());
        d
    }

    fn to(out: &[Emit], route: Route, line: LineId) -> Vec<Signal> {
        out.iter()
            .filter(|e| e.route == route && e.line == line)
            .map(|e| e.signal.clone())
            .collect()
    }

    fn with_signal(data: &[u8]) -> Signal {
        let mut b = vec![HANDSHAKE_BYTE];
        b.extend_from_slice(data);
        Signal::payload(b)
    }

    #[test]
    fn test_fifo_pairing() {
        let (mut rs, mut chain) = server(1);
        let users: Vec<_> = (0..3u8)
            .map(|i| {
                let u = chain.create_line(WorkerId(0));
                rs.downstream_init(&mut chain, u);
                rs.downstream_payload(&mut chain, u, BytesMut::from(&[b'a' + i][..]));
                u
            })
            .collect();
        assert_eq!(rs.waiting(WorkerId(0), Role::Upload), 3);
        assert!(chain.take_emitted().is_empty());

        let peers: Vec<_> = (0..3).map(|_| peer(&mut rs, &mut chain, 0)).collect();
        let out = chain.take_emitted();
        for (i, d) in peers.iter().enumerate() {
            assert_eq!(to(&out, Route::Prev, *d), vec![with_signal(&[b'a' + i as u8])]);
        }
        assert_eq!(rs.waiting(WorkerId(0), Role::Upload), 0);
        assert_eq!(rs.paired(), 3);

        // Live relay follows the pairing.
        rs.downstream_payload(&mut chain, users[1], BytesMut::from(&b"more"[..]));
        rs.upstream_payload(&mut chain, peers[2], BytesMut::from(&b"back"[..]));
        let out = chain.take_emitted();
        assert_eq!(to(&out, Route::Prev, peers[1]), vec![Signal::payload(b"more")]);
        assert_eq!(to(&out, Route::Next, users[2]), vec![Signal::payload(b"back")]);
    }

    #[test]
    fn test_peer_waits_and_flushes_its_buffer() {
        let (mut rs, mut chain) = server(1);
        let d = chain.create_line(WorkerId(0));
        rs.upstream_init(&mut chain, d);
        let mut data = preamble();
        data.put_slice(b"early");
        rs.upstream_payload(&mut chain, d, data);
        assert_eq!(rs.waiting(WorkerId(0), Role::Download), 1);

        let u = chain.create_line(WorkerId(0));
        rs.downstream_init(&mut chain, u);
        let out = chain.take_emitted();
        assert_eq!(to(&out, Route::Prev, d), vec![with_signal(b"")]);
        assert_eq!(to(&out, Route::Next, u), vec![Signal::payload(b"early")]);
    }

    #[test]
    fn test_handshake_accepts_ff_and_arbitrary_filler() {
        let (mut rs, mut chain) = server(1);
        let d = chain.create_line(WorkerId(0));
        rs.upstream_init(&mut chain, d);
        let mut data = BytesMut::new();
        data.put_u8(HANDSHAKE_BYTE);
        data.put_bytes(0x11, HANDSHAKE_LEN - 1);
        rs.upstream_payload(&mut chain, d, data);

        assert_eq!(rs.waiting(WorkerId(0), Role::Download), 1);
        assert!(chain.take_emitted().is_empty());
    }

    #[test]
    fn test_handshake_rejects_other_first_byte() {
        let (mut rs, mut chain) = server(1);
        let d = chain.create_line(WorkerId(0));
        rs.upstream_init(&mut chain, d);
        rs.upstream_payload(&mut chain, d, BytesMut::from(&b"\x00hello"[..]));

        let out = chain.take_emitted();
        assert_eq!(to(&out, Route::Prev, d), vec![Signal::Finish]);
        assert_eq!(rs.waiting(WorkerId(0), Role::Download), 0);

        // Later bytes on the dropped line are ignored.
        rs.upstream_payload(&mut chain, d, preamble());
        assert_eq!(rs.waiting(WorkerId(0), Role::Download), 0);
    }

    #[test]
    fn test_buffer_limit_closes_user() {
        let (mut rs, mut chain) = server(1);
        let u = chain.create_line(WorkerId(0));
        rs.downstream_init(&mut chain, u);
        rs.downstream_payload(&mut chain, u, BytesMut::from(&vec![0u8; MAX_BUFFERING][..]));
        assert!(chain.take_emitted().is_empty());

        rs.downstream_payload(&mut chain, u, BytesMut::from(&b"!"[..]));
        let out = chain.take_emitted();
        assert_eq!(to(&out, Route::Next, u), vec![Signal::Finish]);
        assert_eq!(rs.waiting(WorkerId(0), Role::Upload), 0);
    }

    #[test]
    fn test_buffer_reports_overflow() {
        let (mut rs, mut chain) = server(1);
        let u = chain.create_line(WorkerId(0));
        rs.downstream_init(&mut chain, u);
        let h = rs.lines[&u];
        assert_eq!(rs.buffer(h, BytesMut::from(&vec![1u8; MAX_BUFFERING][..])), Ok(()));
        assert_eq!(
            rs.buffer(h, BytesMut::from(&b"ab"[..])),
            Err(ReverseError::BufferOverflow(MAX_BUFFERING + 2))
        );
    }

    #[test]
    fn test_finish_while_waiting_leaves_queue() {
        let (mut rs, mut chain) = server(1);
        let u1 = chain.create_line(WorkerId(0));
        let u2 = chain.create_line(WorkerId(0));
        rs.downstream_init(&mut chain, u1);
        rs.downstream_init(&mut chain, u2);
        rs.downstream_finish(&mut chain, u1);
        assert_eq!(rs.waiting(WorkerId(0), Role::Upload), 1);

        let d = peer(&mut rs, &mut chain, 0);
        rs.upstream_payload(&mut chain, d, BytesMut::from(&b"hi"[..]));
        let out = chain.take_emitted();
        assert_eq!(to(&out, Route::Next, u2), vec![Signal::payload(b"hi")]);
        assert!(to(&out, Route::Next, u1).is_empty());
    }

    #[test]
    fn test_pair_finish_and_flow_relay() {
        let (mut rs, mut chain) = server(1);
        let u = chain.create_line(WorkerId(0));
        rs.downstream_init(&mut chain, u);
        let d = peer(&mut rs, &mut chain, 0);
        chain.take_emitted();

        rs.upstream_pause(&mut chain, d);
        rs.downstream_resume(&mut chain, u);
        let out = chain.take_emitted();
        assert_eq!(to(&out, Route::Next, u), vec![Signal::Pause]);
        assert_eq!(to(&out, Route::Prev, d), vec![Signal::Resume]);

        rs.upstream_finish(&mut chain, d);
        let out = chain.take_emitted();
        assert_eq!(to(&out, Route::Next, u), vec![Signal::Finish]);
        assert_eq!(rs.paired(), 0);

        rs.downstream_finish(&mut chain, u);
        assert!(chain.take_emitted().is_empty());
    }

    #[test]
    fn test_pairs_across_workers_when_local_queue_is_empty() {
        let (mut rs, mut chain) = server(2);
        let d = peer(&mut rs, &mut chain, 1);
        let u = chain.create_line(WorkerId(0));
        rs.downstream_init(&mut chain, u);
        let out = chain.take_emitted();
        assert_eq!(to(&out, Route::Prev, d), vec![with_signal(b"")]);
        assert_eq!(rs.waiting(WorkerId(1), Role::Download), 0);
    }

    #[test]
    fn test_api_status() {
        let (mut rs, mut chain) = server(1);
        let u = chain.create_line(WorkerId(0));
        rs.downstream_init(&mut chain, u);
        match rs.api(b"status") {
            ApiResult::Ok(s) => assert!(s.contains("waiting_uploads=1")),
            other => panic!("unexpected {:?}", other),
        }
    }
}

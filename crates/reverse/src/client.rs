//! ReverseClient
//!
//! Keeps a pool of connections dialled out to the reverse server, each sent
//! the handshake preamble and then left idle. When the server pairs one with
//! a user it sends the pairing byte; the client then opens a line to the
//! previous stage and relays. Idle connections that stay unclaimed for too
//! long are closed and replaced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tracing::{debug, info, warn};
use waterwall_core::{ApiResult, Chain, LineId, Signal, Tunnel, WorkerId, WorkerSlots};

use crate::handshake::preamble;
use crate::idle::IdleTable;
use crate::{
    Result, HANDSHAKE_BYTE, MAX_MIN_UNUSED, PRECONNECT_DELAY_LONG, PRECONNECT_DELAY_SHORT, STARVATION_TIMEOUT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Idle,
    Paired,
}

#[derive(Debug)]
struct Conn {
    /// Line towards the reverse server.
    up: LineId,
    /// Line towards the previous stage, opened once paired.
    down: LineId,
    phase: Phase,
}

#[derive(Debug, Default, Clone, Copy)]
struct Pool {
    unused: u32,
    connecting: u32,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Connect,
    Starvation(LineId),
}

pub struct ReverseClient {
    min_unused: u32,
    pools: WorkerSlots<Pool>,
    reverse_cons: AtomicU32,
    round_index: AtomicU32,
    idle: Arc<IdleTable>,
    conns: HashMap<LineId, Conn>,
    downs: HashMap<LineId, LineId>,
    timers: HashMap<u64, TimerKind>,
    next_token: u64,
}

impl ReverseClient {
    /// `minimum_unused` is raised to twice the worker count and capped.
    pub fn new(workers: usize, minimum_unused: u32) -> Result<Self> {
        let pools = WorkerSlots::new(workers, |_| Pool::default())?;
        let floor = u32::try_from(workers.saturating_mul(2)).unwrap_or(u32::MAX);
        Ok(Self {
            min_unused: floor.max(minimum_unused).min(MAX_MIN_UNUSED),
            pools,
            reverse_cons: AtomicU32::new(0),
            round_index: AtomicU32::new(0),
            idle: Arc::new(IdleTable::new(STARVATION_TIMEOUT)),
            conns: HashMap::new(),
            downs: HashMap::new(),
            timers: HashMap::new(),
            next_token: 0,
        })
    }

    pub fn min_unused(&self) -> u32 {
        self.min_unused
    }

    pub fn unused(&self, wid: WorkerId) -> u32 {
        self.pools.get(wid).map_or(0, |p| p.unused)
    }

    pub fn connecting(&self, wid: WorkerId) -> u32 {
        self.pools.get(wid).map_or(0, |p| p.connecting)
    }

    /// Paired connections currently relaying.
    pub fn active(&self) -> u32 {
        self.reverse_cons.load(Ordering::Relaxed)
    }

    pub fn idle_table(&self) -> &Arc<IdleTable> {
        &self.idle
    }

    fn next_worker(&self) -> WorkerId {
        let i = self.round_index.fetch_add(1, Ordering::Relaxed) as usize;
        WorkerId((i % self.pools.len()) as u16)
    }

    fn schedule(&mut self, chain: &mut Chain, wid: WorkerId, delay: Duration, kind: TimerKind) {
        let token = self.next_token;
        self.next_token += 1;
        self.timers.insert(token, kind);
        chain.schedule(wid, delay, token);
    }

    /// Queue one more outbound connection on `wid` if its pool is short.
    fn initiate_connect(&mut self, chain: &mut Chain, wid: WorkerId, backoff: bool) {
        let min_unused = self.min_unused;
        let Some(pool) = self.pools.get_mut(wid) else {
            return;
        };
        if pool.unused + pool.connecting >= min_unused {
            return;
        }
        pool.connecting += 1;
        let delay = if backoff { PRECONNECT_DELAY_LONG } else { PRECONNECT_DELAY_SHORT };
        self.schedule(chain, wid, delay, TimerKind::Connect);
    }

    fn connect(&mut self, chain: &mut Chain, wid: WorkerId) {
        let up = chain.create_line(wid);
        let down = chain.create_line(wid);
        self.conns.insert(up, Conn { up, down, phase: Phase::Connecting });
        self.downs.insert(down, up);
        debug!("ReverseClient: connecting {} on {}", up, wid);
        chain.send_next(up, Signal::Init);
    }

    fn forget(&mut self, up: LineId) -> Option<Conn> {
        let conn = self.conns.remove(&up)?;
        self.downs.remove(&conn.down);
        Some(conn)
    }

    fn starve(&mut self, chain: &mut Chain, up: LineId) {
        let now = chain.now();
        let Some(item) = self.idle.get(up) else {
            return;
        };
        if self.idle.take_expired(up, now).is_none() {
            // Timer fired early; wait out the remainder.
            let remaining = item.expires.saturating_duration_since(now);
            self.schedule(chain, up.wid, remaining, TimerKind::Starvation(up));
            return;
        }
        if self.forget(up).is_none() {
            return;
        }
        if let Some(pool) = self.pools.get_mut(up.wid) {
            pool.unused = pool.unused.saturating_sub(1);
        }
        warn!("ReverseClient: idle connection {} was never claimed, closing it", up);
        chain.send_next(up, Signal::Finish);
        self.initiate_connect(chain, up.wid, false);
    }

    /// The server paired `up` with a user; open the local side.
    fn pair(&mut self, chain: &mut Chain, up: LineId, rest: BytesMut) {
        let Some(conn) = self.conns.get_mut(&up) else {
            return;
        };
        conn.phase = Phase::Paired;
        let down = conn.down;
        self.idle.remove(up);
        if let Some(pool) = self.pools.get_mut(up.wid) {
            pool.unused = pool.unused.saturating_sub(1);
        }
        let active = self.reverse_cons.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "ReverseClient: paired {} on {}, unused: {} active: {}",
            up,
            up.wid,
            self.unused(up.wid),
            active
        );

        chain.send_prev(down, Signal::Init);
        if !rest.is_empty() {
            chain.send_prev(down, Signal::Payload(rest));
        }
        self.initiate_connect(chain, up.wid, false);
    }

    /// Close an idle connection that sent something other than the pairing byte.
    fn reject(&mut self, chain: &mut Chain, up: LineId) {
        warn!("ReverseClient: {} sent a malformed pairing signal, closing it", up);
        self.idle.remove(up);
        self.forget(up);
        if let Some(pool) = self.pools.get_mut(up.wid) {
            pool.unused = pool.unused.saturating_sub(1);
        }
        chain.send_next(up, Signal::Finish);
        self.initiate_connect(chain, up.wid, false);
    }

    fn close_pair(&mut self, up: LineId) {
        self.forget(up);
        let active = self.reverse_cons.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        debug!(
            "ReverseClient: disconnected {} on {}, unused: {} active: {}",
            up,
            up.wid,
            self.unused(up.wid),
            active
        );
    }

    fn paired_down(&self, up: LineId) -> Option<LineId> {
        self.conns.get(&up).filter(|c| c.phase == Phase::Paired).map(|c| c.down)
    }

    fn paired_up(&self, down: LineId) -> Option<LineId> {
        let up = *self.downs.get(&down)?;
        self.conns.get(&up).filter(|c| c.phase == Phase::Paired).map(|c| c.up)
    }
}

impl Tunnel for ReverseClient {
    fn name(&self) -> &'static str {
        "ReverseClient"
    }

    fn on_start(&mut self, chain: &mut Chain) {
        info!(
            "ReverseClient: starting, keeping {} idle connections per worker on {} workers",
            self.min_unused,
            self.pools.len()
        );
        let attempts = self.min_unused as usize * self.pools.len();
        for _ in 0..attempts {
            let wid = self.next_worker();
            self.initiate_connect(chain, wid, false);
        }
    }

    fn on_timer(&mut self, chain: &mut Chain, wid: WorkerId, token: u64) {
        match self.timers.remove(&token) {
            Some(TimerKind::Connect) => self.connect(chain, wid),
            Some(TimerKind::Starvation(up)) => self.starve(chain, up),
            None => {}
        }
    }

    fn upstream_init(&mut self, chain: &mut Chain, line: LineId) {
        warn!("ReverseClient: previous stage tried to open line {}, refusing", line);
        chain.send_prev(line, Signal::Finish);
    }

    fn upstream_est(&mut self, _chain: &mut Chain, line: LineId) {
        debug!("ReverseClient: local side {} established", line);
    }

    fn upstream_finish(&mut self, chain: &mut Chain, line: LineId) {
        let Some(up) = self.paired_up(line) else {
            return;
        };
        self.close_pair(up);
        chain.send_next(up, Signal::Finish);
        self.initiate_connect(chain, up.wid, false);
    }

    fn upstream_payload(&mut self, chain: &mut Chain, line: LineId, payload: BytesMut) {
        if let Some(up) = self.paired_up(line) {
            chain.send_next(up, Signal::Payload(payload));
        }
    }

    fn upstream_pause(&mut self, chain: &mut Chain, line: LineId) {
        if let Some(up) = self.paired_up(line) {
            chain.send_next(up, Signal::Pause);
        }
    }

    fn upstream_resume(&mut self, chain: &mut Chain, line: LineId) {
        if let Some(up) = self.paired_up(line) {
            chain.send_next(up, Signal::Resume);
        }
    }

    fn downstream_init(&mut self, chain: &mut Chain, line: LineId) {
        warn!("ReverseClient: next stage tried to open line {}, refusing", line);
        chain.send_next(line, Signal::Finish);
    }

    fn downstream_est(&mut self, chain: &mut Chain, line: LineId) {
        let Some(conn) = self.conns.get_mut(&line) else {
            return;
        };
        if conn.phase != Phase::Connecting {
            return;
        }
        conn.phase = Phase::Idle;
        if let Some(pool) = self.pools.get_mut(line.wid) {
            pool.connecting = pool.connecting.saturating_sub(1);
            pool.unused += 1;
        }
        chain.send_next(line, Signal::Payload(preamble()));
        self.idle.insert(line, chain.now());
        self.schedule(chain, line.wid, STARVATION_TIMEOUT, TimerKind::Starvation(line));
        info!(
            "ReverseClient: connected {} on {}, unused: {} active: {}",
            line,
            line.wid,
            self.unused(line.wid),
            self.active()
        );
    }

    fn downstream_finish(&mut self, chain: &mut Chain, line: LineId) {
        let Some(phase) = self.conns.get(&line).map(|c| c.phase) else {
            return;
        };
        match phase {
            Phase::Paired => {
                let down = self.conns[&line].down;
                self.close_pair(line);
                chain.send_prev(down, Signal::Finish);
                self.initiate_connect(chain, line.wid, false);
            }
            Phase::Idle => {
                self.idle.remove(line);
                self.forget(line);
                if let Some(pool) = self.pools.get_mut(line.wid) {
                    pool.unused = pool.unused.saturating_sub(1);
                }
                debug!("ReverseClient: idle connection {} closed by server", line);
                self.initiate_connect(chain, line.wid, false);
            }
            Phase::Connecting => {
                self.forget(line);
                if let Some(pool) = self.pools.get_mut(line.wid) {
                    pool.connecting = pool.connecting.saturating_sub(1);
                }
                debug!("ReverseClient: connect attempt {} failed", line);
                self.initiate_connect(chain, line.wid, true);
            }
        }
    }

    fn downstream_payload(&mut self, chain: &mut Chain, line: LineId, mut payload: BytesMut) {
        let Some(phase) = self.conns.get(&line).map(|c| c.phase) else {
            return;
        };
        match phase {
            Phase::Paired => {
                if let Some(down) = self.paired_down(line) {
                    chain.send_prev(down, Signal::Payload(payload));
                }
            }
            Phase::Idle => match payload.first() {
                None => {}
                Some(&HANDSHAKE_BYTE) => {
                    payload.advance(1);
                    self.pair(chain, line, payload);
                }
                Some(_) => self.reject(chain, line),
            },
            Phase::Connecting => {
                debug!("ReverseClient: dropping {} bytes received before est on {}", payload.len(), line);
            }
        }
    }

    fn downstream_pause(&mut self, chain: &mut Chain, line: LineId) {
        if let Some(down) = self.paired_down(line) {
            chain.send_prev(down, Signal::Pause);
        }
    }

    fn downstream_resume(&mut self, chain: &mut Chain, line: LineId) {
        if let Some(down) = self.paired_down(line) {
            chain.send_prev(down, Signal::Resume);
        }
    }

    fn api(&mut self, request: &[u8]) -> ApiResult {
        match request {
            b"" | b"status" => {
                let (mut unused, mut connecting) = (0, 0);
                for (_, pool) in self.pools.iter() {
                    unused += pool.unused;
                    connecting += pool.connecting;
                }
                ApiResult::Ok(format!(
                    "ReverseClient: unused={} connecting={} active={} idle={}",
                    unused,
                    connecting,
                    self.active(),
                    self.idle.len()
                ))
            }
            _ => ApiResult::Error(format!("ReverseClient: unknown request {:?}", String::from_utf8_lossy(request))),
        }
    }
}

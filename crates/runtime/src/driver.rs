//! Engine loop: turns socket and timer events into tunnel callbacks, and the
//! tunnel's emitted signals into socket operations.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use waterwall_core::{ApiResult, Chain, Emit, LineId, Route, Signal, TimerRequest, Tunnel, WorkerId};
use waterwall_settings::{Face, Settings};

use crate::build::build_tunnel;
use crate::socket::SocketHandle;
use crate::{Result, RuntimeError, CONNECT_TIMEOUT};

/// Everything the engine reacts to. `route` names the face the socket
/// belongs to.
pub(crate) enum Event {
    Accepted { route: Route, stream: TcpStream },
    Connected { route: Route, line: LineId, stream: TcpStream },
    ConnectFailed { route: Route, line: LineId, reason: String },
    Read { route: Route, line: LineId, data: BytesMut },
    Closed { route: Route, line: LineId },
    Drained { route: Route, line: LineId },
    Timer { wid: WorkerId, token: u64 },
    Api { request: Vec<u8>, reply: oneshot::Sender<ApiResult> },
    Shutdown,
}

fn side(route: Route) -> &'static str {
    match route {
        Route::Prev => "prev",
        Route::Next => "next",
    }
}

/// A tunnel and the two faces it sits between.
pub struct Driver {
    tunnel: Box<dyn Tunnel>,
    workers: usize,
    prev: Face,
    next: Face,
}

impl Driver {
    pub fn new(tunnel: Box<dyn Tunnel>, workers: usize, prev: Face, next: Face) -> Self {
        Self { tunnel, workers: workers.max(1), prev, next }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let tunnel = build_tunnel(settings)?;
        Ok(Self::new(tunnel, settings.workers, settings.prev.clone(), settings.next.clone()))
    }

    /// Bind the listening faces and start the engine task.
    pub async fn start(self) -> Result<Running> {
        let (events, rx) = mpsc::unbounded_channel();
        let mut acceptors = Vec::new();
        let prev_addr = bind(&self.prev, Route::Prev, &events, &mut acceptors).await?;
        let next_addr = bind(&self.next, Route::Next, &events, &mut acceptors).await?;

        let engine = Engine {
            tunnel: self.tunnel,
            chain: Chain::default(),
            workers: self.workers,
            lane: 0,
            prev: self.prev,
            next: self.next,
            sockets: HashMap::new(),
            events: events.clone(),
        };
        let engine = tokio::spawn(engine.run(rx));

        Ok(Running { prev_addr, next_addr, events, engine, acceptors })
    }
}

async fn bind(
    face: &Face,
    route: Route,
    events: &mpsc::UnboundedSender<Event>,
    acceptors: &mut Vec<JoinHandle<()>>,
) -> Result<Option<SocketAddr>> {
    let Face::Listen(addr) = face else {
        return Ok(None);
    };
    let listener = TcpListener::bind(addr.as_str())
        .await
        .map_err(|e| RuntimeError::Bind(addr.clone(), e))?;
    let local = listener.local_addr()?;
    info!("Listening on {} for the {} face", local, side(route));
    acceptors.push(tokio::spawn(accept_loop(listener, route, events.clone())));
    Ok(Some(local))
}

async fn accept_loop(listener: TcpListener, route: Route, events: mpsc::UnboundedSender<Event>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Accepted {} on the {} face", peer, side(route));
                if events.send(Event::Accepted { route, stream }).is_err() {
                    return;
                }
            }
            Err(e) => {
                error!("Accept error on the {} face: {}", side(route), e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Handle to a started driver.
pub struct Running {
    prev_addr: Option<SocketAddr>,
    next_addr: Option<SocketAddr>,
    events: mpsc::UnboundedSender<Event>,
    engine: JoinHandle<()>,
    acceptors: Vec<JoinHandle<()>>,
}

impl Running {
    /// Bound address of the previous face, if it listens.
    pub fn prev_addr(&self) -> Option<SocketAddr> {
        self.prev_addr
    }

    pub fn next_addr(&self) -> Option<SocketAddr> {
        self.next_addr
    }

    /// Forward a control request to the tunnel. `None` once stopped.
    pub async fn api(&self, request: &[u8]) -> Option<ApiResult> {
        let (reply, rx) = oneshot::channel();
        self.events.send(Event::Api { request: request.to_vec(), reply }).ok()?;
        rx.await.ok()
    }

    /// Stop accepting, close every socket and wait for the engine to exit.
    pub async fn shutdown(self) {
        for acceptor in &self.acceptors {
            acceptor.abort();
        }
        let _ = self.events.send(Event::Shutdown);
        if let Err(e) = self.engine.await {
            error!("Engine task failed: {}", e);
        }
    }
}

struct Engine {
    tunnel: Box<dyn Tunnel>,
    chain: Chain,
    workers: usize,
    lane: usize,
    prev: Face,
    next: Face,
    sockets: HashMap<(Route, LineId), SocketHandle>,
    events: mpsc::UnboundedSender<Event>,
}

impl Engine {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        info!("{} running on {} workers: prev {}, next {}", self.tunnel.name(), self.workers, self.prev, self.next);
        self.callback(|tunnel, chain| tunnel.on_start(chain));

        while let Some(event) = rx.recv().await {
            if !self.handle(event) {
                break;
            }
        }

        let open = self.sockets.len();
        self.sockets.clear();
        info!("{} stopped, closed {} sockets", self.tunnel.name(), open);
    }

    fn face(&self, route: Route) -> &Face {
        match route {
            Route::Prev => &self.prev,
            Route::Next => &self.next,
        }
    }

    fn next_lane(&mut self) -> WorkerId {
        let wid = WorkerId((self.lane % self.workers) as u16);
        self.lane = self.lane.wrapping_add(1);
        wid
    }

    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Accepted { route, stream } => {
                let wid = self.next_lane();
                let line = self.chain.create_line(wid);
                let mut socket = SocketHandle::new();
                socket.attach(stream, route, line, self.events.clone());
                self.sockets.insert((route, line), socket);
                self.deliver(route, line, Signal::Init);
            }
            Event::Connected { route, line, stream } => match self.sockets.get_mut(&(route, line)) {
                Some(socket) => {
                    socket.attach(stream, route, line, self.events.clone());
                    debug!("Connected {} on the {} face", line, side(route));
                    self.deliver(route, line, Signal::Est);
                }
                None => debug!("Dropping late connection for closed line {}", line),
            },
            Event::ConnectFailed { route, line, reason } => {
                if self.sockets.remove(&(route, line)).is_some() {
                    warn!("Connecting {} on the {} face failed: {}", line, side(route), reason);
                    self.deliver(route, line, Signal::Finish);
                }
            }
            Event::Read { route, line, data } => {
                if self.sockets.contains_key(&(route, line)) {
                    self.deliver(route, line, Signal::Payload(data));
                }
            }
            Event::Closed { route, line } => {
                if self.sockets.remove(&(route, line)).is_some() {
                    debug!("Socket {} on the {} face closed", line, side(route));
                    self.deliver(route, line, Signal::Finish);
                }
            }
            Event::Drained { route, line } => {
                if self.sockets.contains_key(&(route, line)) {
                    self.deliver(route, line, Signal::Resume);
                }
            }
            Event::Timer { wid, token } => {
                self.callback(|tunnel, chain| tunnel.on_timer(chain, wid, token));
            }
            Event::Api { request, reply } => {
                let _ = reply.send(self.tunnel.api(&request));
            }
            Event::Shutdown => return false,
        }
        true
    }

    /// Deliver a signal that arrived on the `route` face.
    fn deliver(&mut self, route: Route, line: LineId, signal: Signal) {
        self.callback(move |tunnel, chain| match route {
            Route::Prev => tunnel.upstream(chain, line, signal),
            Route::Next => tunnel.downstream(chain, line, signal),
        });
    }

    /// Run one tunnel callback, then everything it causes, until quiet.
    fn callback(&mut self, f: impl FnOnce(&mut dyn Tunnel, &mut Chain)) {
        self.chain.set_now(Instant::now());
        f(self.tunnel.as_mut(), &mut self.chain);

        let mut queue = VecDeque::new();
        self.apply_outputs(&mut queue);
        while let Some((route, line, signal)) = queue.pop_front() {
            self.chain.set_now(Instant::now());
            match route {
                Route::Prev => self.tunnel.upstream(&mut self.chain, line, signal),
                Route::Next => self.tunnel.downstream(&mut self.chain, line, signal),
            }
            self.apply_outputs(&mut queue);
        }
    }

    fn apply_outputs(&mut self, queue: &mut VecDeque<(Route, LineId, Signal)>) {
        for TimerRequest { wid, delay, token } in self.chain.take_timers() {
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(Event::Timer { wid, token });
            });
        }
        for emit in self.chain.take_emitted() {
            self.apply(emit, queue);
        }
    }

    /// Carry out one emitted signal. Signals the driver itself must answer
    /// are pushed onto `queue`.
    fn apply(&mut self, emit: Emit, queue: &mut VecDeque<(Route, LineId, Signal)>) {
        let Emit { route, line, signal } = emit;
        let key = (route, line);
        match signal {
            Signal::Init => self.open(route, line, queue),
            // Accepted sockets are connected already.
            Signal::Est => {}
            Signal::Finish => {
                if self.sockets.remove(&key).is_some() {
                    debug!("Closing {} on the {} face", line, side(route));
                }
            }
            Signal::Payload(data) => {
                if let Some(socket) = self.sockets.get(&key) {
                    if socket.write(data) {
                        debug!("{} queued {} bytes on the {} face, pausing", line, socket.queued(), side(route));
                        queue.push_back((route, line, Signal::Pause));
                    }
                }
            }
            Signal::Pause => {
                if let Some(socket) = self.sockets.get(&key) {
                    socket.set_reading_paused(true);
                }
            }
            Signal::Resume => {
                if let Some(socket) = self.sockets.get(&key) {
                    socket.set_reading_paused(false);
                }
            }
        }
    }

    fn open(&mut self, route: Route, line: LineId, queue: &mut VecDeque<(Route, LineId, Signal)>) {
        if self.sockets.contains_key(&(route, line)) {
            warn!("{} opened twice on the {} face", line, side(route));
            return;
        }
        let addr = match self.face(route) {
            Face::Connect(addr) => addr.clone(),
            Face::Listen(_) => {
                warn!("Cannot open {} towards the listening {} face", line, side(route));
                queue.push_back((route, line, Signal::Finish));
                return;
            }
        };
        self.sockets.insert((route, line), SocketHandle::new());

        let events = self.events.clone();
        tokio::spawn(async move {
            let event = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr.as_str())).await {
                Ok(Ok(stream)) => Event::Connected { route, line, stream },
                Ok(Err(e)) => Event::ConnectFailed { route, line, reason: format!("{}: {}", addr, e) },
                Err(_) => Event::ConnectFailed { route, line, reason: format!("{}: timed out", addr) },
            };
            let _ = events.send(event);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Forwards every signal to the other face and counts fired timers.
    #[derive(Default)]
    struct Relay {
        timers: u32,
    }

    impl Tunnel for Relay {
        fn name(&self) -> &'static str {
            "Relay"
        }
        fn on_start(&mut self, c: &mut Chain) {
            c.schedule(WorkerId(0), Duration::from_millis(10), 7);
        }
        fn on_timer(&mut self, _c: &mut Chain, _wid: WorkerId, token: u64) {
            assert_eq!(token, 7);
            self.timers += 1;
        }
        fn upstream_init(&mut self, c: &mut Chain, l: LineId) {
            c.send_next(l, Signal::Init)
        }
        fn upstream_est(&mut self, c: &mut Chain, l: LineId) {
            c.send_next(l, Signal::Est)
        }
        fn upstream_finish(&mut self, c: &mut Chain, l: LineId) {
            c.send_next(l, Signal::Finish)
        }
        fn upstream_payload(&mut self, c: &mut Chain, l: LineId, p: BytesMut) {
            c.send_next(l, Signal::Payload(p))
        }
        fn upstream_pause(&mut self, c: &mut Chain, l: LineId) {
            c.send_next(l, Signal::Pause)
        }
        fn upstream_resume(&mut self, c: &mut Chain, l: LineId) {
            c.send_next(l, Signal::Resume)
        }
        fn downstream_init(&mut self, c: &mut Chain, l: LineId) {
            c.send_prev(l, Signal::Init)
        }
        fn downstream_est(&mut self, c: &mut Chain, l: LineId) {
            c.send_prev(l, Signal::Est)
        }
        fn downstream_finish(&mut self, c: &mut Chain, l: LineId) {
            c.send_prev(l, Signal::Finish)
        }
        fn downstream_payload(&mut self, c: &mut Chain, l: LineId, p: BytesMut) {
            c.send_prev(l, Signal::Payload(p))
        }
        fn downstream_pause(&mut self, c: &mut Chain, l: LineId) {
            c.send_prev(l, Signal::Pause)
        }
        fn downstream_resume(&mut self, c: &mut Chain, l: LineId) {
            c.send_prev(l, Signal::Resume)
        }
        fn api(&mut self, _request: &[u8]) -> ApiResult {
            ApiResult::Ok(format!("timers={}", self.timers))
        }
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn start_relay(next: Face) -> Running {
        Driver::new(Box::new(Relay::default()), 2, Face::Listen("127.0.0.1:0".into()), next)
            .start()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_relays_through_connect_face() {
        let echo = echo_server().await;
        let running = start_relay(Face::Connect(echo.to_string())).await;
        assert!(running.next_addr().is_none());

        let mut client = TcpStream::connect(running.prev_addr().unwrap()).await.unwrap();
        client.write_all(b"hello waterwall").await.unwrap();
        let mut buf = [0u8; 15];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello waterwall");

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_dial_closes_accepted_socket() {
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let running = start_relay(Face::Connect(closed.to_string())).await;

        let mut client = TcpStream::connect(running.prev_addr().unwrap()).await.unwrap();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_timers_and_api() {
        let running = start_relay(Face::Connect("127.0.0.1:9".into())).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(running.api(b"status").await, Some(ApiResult::Ok("timers=1".into())));
        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let result = Driver::new(Box::new(Relay::default()), 1, Face::Listen(addr), Face::Connect("127.0.0.1:9".into()))
            .start()
            .await;
        assert!(matches!(result, Err(RuntimeError::Bind(_, _))));
    }
}

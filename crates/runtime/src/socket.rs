//! Per-socket reader and writer tasks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use waterwall_core::{LineId, Route};

use crate::driver::Event;
use crate::{READ_CHUNK, WRITE_PAUSE_THRESHOLD, WRITE_RESUME_THRESHOLD};

/// The engine's side of one TCP socket.
///
/// Writes are accepted before the socket exists (a dial in progress); they
/// wait in the channel until [`SocketHandle::attach`]. Dropping the handle
/// stops reading, lets the writer drain, then shuts the socket down.
pub(crate) struct SocketHandle {
    tx: mpsc::UnboundedSender<BytesMut>,
    rx: Option<mpsc::UnboundedReceiver<BytesMut>>,
    reading_paused: watch::Sender<bool>,
    queued: Arc<AtomicUsize>,
    write_paused: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SocketHandle {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (reading_paused, _) = watch::channel(false);
        Self {
            tx,
            rx: Some(rx),
            reading_paused,
            queued: Arc::new(AtomicUsize::new(0)),
            write_paused: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    /// Start the I/O tasks on `stream`. No-op if already attached.
    pub fn attach(&mut self, stream: TcpStream, route: Route, line: LineId, events: mpsc::UnboundedSender<Event>) {
        let Some(rx) = self.rx.take() else {
            return;
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed on {}: {}", line, e);
        }
        let (read_half, write_half) = stream.into_split();
        self.reader = Some(tokio::spawn(read_loop(
            read_half,
            self.reading_paused.subscribe(),
            route,
            line,
            events.clone(),
        )));
        tokio::spawn(write_loop(
            write_half,
            rx,
            self.queued.clone(),
            self.write_paused.clone(),
            route,
            line,
            events,
        ));
    }

    /// Queue `data` for writing. Returns true when this write pushed the
    /// queue over the pause threshold.
    pub fn write(&self, data: BytesMut) -> bool {
        let len = data.len();
        let total = self.queued.fetch_add(len, Ordering::AcqRel) + len;
        if self.tx.send(data).is_err() {
            self.queued.fetch_sub(len, Ordering::AcqRel);
            return false;
        }
        total > WRITE_PAUSE_THRESHOLD && !self.write_paused.swap(true, Ordering::AcqRel)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn set_reading_paused(&self, paused: bool) {
        self.reading_paused.send_replace(paused);
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    mut paused: watch::Receiver<bool>,
    route: Route,
    line: LineId,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        loop {
            let is_paused = *paused.borrow_and_update();
            if !is_paused {
                break;
            }
            if paused.changed().await.is_err() {
                return;
            }
        }
        buf.reserve(READ_CHUNK);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = events.send(Event::Closed { route, line });
                return;
            }
            Ok(_) => {
                let data = buf.split();
                if events.send(Event::Read { route, line, data }).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("Read error on {}: {}", line, e);
                let _ = events.send(Event::Closed { route, line });
                return;
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<BytesMut>,
    queued: Arc<AtomicUsize>,
    write_paused: Arc<AtomicBool>,
    route: Route,
    line: LineId,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(buf) = rx.recv().await {
        let len = buf.len();
        if let Err(e) = writer.write_all(&buf).await {
            debug!("Write error on {}: {}", line, e);
            let _ = events.send(Event::Closed { route, line });
            return;
        }
        let left = queued.fetch_sub(len, Ordering::AcqRel).saturating_sub(len);
        if left < WRITE_RESUME_THRESHOLD && write_paused.swap(false, Ordering::AcqRel) {
            let _ = events.send(Event::Drained { route, line });
        }
    }
    let _ = writer.shutdown().await;
}

//! Plain TCP transport driven by tokio tasks.
//!
//! `connect` spawns one task that connects and then reads, and one writer task
//! fed through an unbounded queue. Everything the transport observes comes back
//! to the owner as [`TransportEvent`]s on the receiver returned by
//! [`TcpTransport::new`].

use std::sync::{
    atomic::{AtomicU8, AtomicUsize, Ordering},
    Arc,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    runtime::Handle,
    sync::{mpsc, Notify},
};
use tracing::{debug, trace};

use crate::{
    constants::{TCP_EVENT_QUEUE, TCP_READ_CHUNK},
    error::{Result, RfbError},
    transport::{CloseReason, ReadyState, Transport, TransportEvent},
};

const STATE_CONNECTING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

#[derive(Debug)]
pub struct TcpTransport {
    events: mpsc::Sender<TransportEvent>,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    outstanding: Arc<AtomicUsize>,
    state: Arc<AtomicU8>,
    shutdown: Arc<Notify>,
}

impl TcpTransport {
    pub fn new() -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(TCP_EVENT_QUEUE);
        let transport = Self {
            events,
            outbound: None,
            outstanding: Arc::new(AtomicUsize::new(0)),
            state: Arc::new(AtomicU8::new(STATE_CONNECTING)),
            shutdown: Arc::new(Notify::new()),
        };
        (transport, rx)
    }
}

/// Accepts `tcp://host:port` as well as a bare `host:port`.
fn parse_addr(uri: &str) -> Result<String> {
    let addr = uri.strip_prefix("tcp://").unwrap_or(uri);
    let addr = addr.trim_end_matches('/');
    if addr.is_empty() || !addr.contains(':') {
        return Err(RfbError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("expected host:port, got {uri:?}"),
        )));
    }
    Ok(addr.to_string())
}

impl Transport for TcpTransport {
    fn connect(&mut self, uri: &str) -> Result<()> {
        if self.outbound.is_some() {
            return Err(RfbError::AlreadyOpen);
        }
        let addr = parse_addr(uri)?;
        let runtime = Handle::try_current().map_err(std::io::Error::other)?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound = Some(tx);
        self.state.store(STATE_CONNECTING, Ordering::SeqCst);

        let events = self.events.clone();
        let outstanding = self.outstanding.clone();
        let state = self.state.clone();
        let shutdown = self.shutdown.clone();

        runtime.spawn(async move {
            let stream = match TcpStream::connect(&addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(%addr, error = %e, "connect failed");
                    state.store(STATE_CLOSED, Ordering::SeqCst);
                    let _ = events.send(TransportEvent::Error(e.to_string())).await;
                    let _ = events
                        .send(TransportEvent::Close(CloseReason::abnormal(e.to_string())))
                        .await;
                    return;
                }
            };
            let _ = stream.set_nodelay(true);

            if state
                .compare_exchange(
                    STATE_CONNECTING,
                    STATE_OPEN,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
                && events.send(TransportEvent::Open).await.is_err()
            {
                return;
            }

            let (mut reader, writer) = stream.into_split();
            tokio::spawn(write_loop(writer, rx, outstanding, events.clone()));

            let mut buf = vec![0u8; TCP_READ_CHUNK];
            let reason = loop {
                tokio::select! {
                    _ = shutdown.notified() => break CloseReason::clean("closed locally"),
                    read = reader.read(&mut buf) => match read {
                        Ok(0) => break CloseReason::clean("closed by peer"),
                        Ok(n) => {
                            trace!(n, "read chunk");
                            let chunk = Bytes::copy_from_slice(&buf[..n]);
                            if events.send(TransportEvent::Chunk(chunk)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = events.send(TransportEvent::Error(e.to_string())).await;
                            break CloseReason::abnormal(e.to_string());
                        }
                    }
                }
            };

            state.store(STATE_CLOSED, Ordering::SeqCst);
            let _ = events.send(TransportEvent::Close(reason)).await;
        });

        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.ready_state() != ReadyState::Open {
            return Err(RfbError::NotOpen);
        }
        let outbound = self.outbound.as_ref().ok_or(RfbError::NotOpen)?;

        self.outstanding.fetch_add(data.len(), Ordering::SeqCst);
        if outbound.send(Bytes::copy_from_slice(data)).is_err() {
            self.outstanding.fetch_sub(data.len(), Ordering::SeqCst);
            return Err(RfbError::NotOpen);
        }
        Ok(())
    }

    fn close(&mut self) {
        let previous = self.state.swap(STATE_CLOSING, Ordering::SeqCst);
        if previous == STATE_CLOSED {
            self.state.store(STATE_CLOSED, Ordering::SeqCst);
            return;
        }
        // dropping the queue lets the writer drain and shut down its half
        self.outbound = None;
        self.shutdown.notify_one();
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    fn ready_state(&self) -> ReadyState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CONNECTING => ReadyState::Connecting,
            STATE_OPEN => ReadyState::Open,
            STATE_CLOSING => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

async fn write_loop(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    outstanding: Arc<AtomicUsize>,
    events: mpsc::Sender<TransportEvent>,
) {
    while let Some(data) = rx.recv().await {
        let result = writer.write_all(&data).await;
        outstanding.fetch_sub(data.len(), Ordering::SeqCst);
        if let Err(e) = result {
            let _ = events.send(TransportEvent::Error(e.to_string())).await;
            return;
        }
    }
    let _ = writer.shutdown().await;
}

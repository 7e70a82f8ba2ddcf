//! In-process transport.
//!
//! [`MemoryConnector`] hands out connections whose streams are served by a
//! [`Server`] in the same process. Each stream direction is an unbounded
//! queue gated by a [`FlowWindow`], so data sends suspend until the reader
//! has consumed earlier frames. A stream shares a cancellation token with its
//! connection: resetting the stream or dropping the connection fails both
//! halves immediately.
//!
//! The connector also exposes fault hooks for tests and demos: refusing the
//! next connects, holding connects until released, dropping the live
//! connection and swallowing keepalive pings.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::flowcontrol::{FlowWindow, DEFAULT_WINDOW_SIZE};
use crate::server::Server;
use crate::transport::{
    Connection, ConnectionDescriptor, Connector, ResetReason, StreamFrame, StreamId, StreamPair,
    StreamReceiver, StreamSender,
};

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicU64,
    streams_opened: AtomicU64,
    client_resets: AtomicU64,
    pings: AtomicU64,
}

#[derive(Debug)]
struct ConnectorState {
    server: Arc<Server>,
    window_size: AtomicUsize,
    max_streams: AtomicUsize,
    fail_next: AtomicUsize,
    held: watch::Sender<bool>,
    drop_pings: AtomicBool,
    current: Mutex<Option<Weak<MemoryConnection>>>,
    counters: Counters,
}

/// Connector producing in-process connections to a [`Server`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    state: Arc<ConnectorState>,
}

impl MemoryConnector {
    /// Connector whose streams are served by `server`.
    pub fn new(server: Arc<Server>) -> Self {
        let (held, _) = watch::channel(false);
        Self {
            state: Arc::new(ConnectorState {
                server,
                window_size: AtomicUsize::new(DEFAULT_WINDOW_SIZE),
                max_streams: AtomicUsize::new(0),
                fail_next: AtomicUsize::new(0),
                held,
                drop_pings: AtomicBool::new(false),
                current: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// Sets the per-direction flow-control window for streams opened later.
    pub fn set_stream_window(&self, bytes: usize) {
        self.state.window_size.store(bytes.max(1), Ordering::Release);
    }

    /// Limits concurrently open streams per connection. `None` removes the limit.
    pub fn set_max_streams(&self, max: Option<usize>) {
        self.state.max_streams.store(max.unwrap_or(0), Ordering::Release);
    }

    /// Refuses the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: usize) {
        self.state.fail_next.store(n, Ordering::Release);
    }

    /// Makes connect attempts wait until [`release_connects`](Self::release_connects).
    pub fn hold_connects(&self) {
        self.state.held.send_replace(true);
    }

    /// Lets held connect attempts proceed.
    pub fn release_connects(&self) {
        self.state.held.send_replace(false);
    }

    /// Makes pings on current and future connections hang until the connection closes.
    pub fn drop_pings(&self, drop: bool) {
        self.state.drop_pings.store(drop, Ordering::Release);
    }

    /// Kills the most recent connection. Returns false if there was none.
    pub fn drop_connection(&self) -> bool {
        let conn = self
            .state
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .and_then(|weak| weak.upgrade());
        match conn {
            Some(conn) => {
                conn.shutdown("connection dropped");
                true
            }
            None => false,
        }
    }

    /// Connect attempts seen, including refused and held ones.
    pub fn connects(&self) -> u64 {
        self.state.counters.connects.load(Ordering::Acquire)
    }

    /// Streams opened across all connections.
    pub fn streams_opened(&self) -> u64 {
        self.state.counters.streams_opened.load(Ordering::Acquire)
    }

    /// Streams reset by the client side.
    pub fn client_resets(&self) -> u64 {
        self.state.counters.client_resets.load(Ordering::Acquire)
    }

    /// Pings received.
    pub fn pings(&self) -> u64 {
        self.state.counters.pings.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        self.state.counters.connects.fetch_add(1, Ordering::AcqRel);
        let mut held = self.state.held.subscribe();
        let released = held.wait_for(|held| !*held).await.is_ok();
        if !released {
            return Err(TransportError::Closed);
        }

        let refused = self
            .state
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            debug!(peer = %descriptor.target, "refusing connection");
            return Err(TransportError::ConnectionRefused {
                target: descriptor.target.clone(),
            });
        }

        let conn = Arc::new(MemoryConnection {
            state: self.state.clone(),
            token: CancellationToken::new(),
            reason: Mutex::new(None),
            next_stream_id: AtomicU64::new(1),
            active_streams: Arc::new(AtomicUsize::new(0)),
        });
        *self
            .state
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(&conn));
        debug!(peer = %descriptor.target, "memory connection established");
        Ok(conn)
    }
}

/// One in-process connection.
#[derive(Debug)]
pub struct MemoryConnection {
    state: Arc<ConnectorState>,
    token: CancellationToken,
    reason: Mutex<Option<String>>,
    next_stream_id: AtomicU64,
    active_streams: Arc<AtomicUsize>,
}

impl MemoryConnection {
    fn shutdown(&self, reason: &str) {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(|| reason.to_string());
        self.token.cancel();
    }

    fn lost(&self) -> TransportError {
        let reason = self
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| "connection closed".to_string());
        TransportError::ConnectionLost { reason }
    }

    /// Streams currently open on this connection.
    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_stream(&self) -> Result<StreamPair, TransportError> {
        if self.token.is_cancelled() {
            return Err(self.lost());
        }
        let max = self.state.max_streams.load(Ordering::Acquire);
        if max > 0 && self.active_streams.load(Ordering::Acquire) >= max {
            return Err(TransportError::StreamLimit { max });
        }
        self.active_streams.fetch_add(1, Ordering::AcqRel);
        self.state.counters.streams_opened.fetch_add(1, Ordering::AcqRel);

        let id = self.next_stream_id.fetch_add(2, Ordering::AcqRel);
        let shared = Arc::new(StreamShared {
            id,
            token: self.token.child_token(),
            reset: Mutex::new(None),
            active: self.active_streams.clone(),
            state: self.state.clone(),
        });
        let window = self.state.window_size.load(Ordering::Acquire);
        let (c2s_tx, c2s_rx) = mpsc::unbounded_channel();
        let (s2c_tx, s2c_rx) = mpsc::unbounded_channel();
        let c2s_window = FlowWindow::new(window);
        let s2c_window = FlowWindow::new(window);

        let client = StreamPair {
            sender: Arc::new(MemorySender {
                shared: shared.clone(),
                tx: c2s_tx,
                window: c2s_window.clone(),
                client: true,
            }),
            receiver: Box::new(MemoryReceiver {
                shared: shared.clone(),
                rx: s2c_rx,
                window: s2c_window.clone(),
            }),
        };
        let server = StreamPair {
            sender: Arc::new(MemorySender {
                shared: shared.clone(),
                tx: s2c_tx,
                window: s2c_window,
                client: false,
            }),
            receiver: Box::new(MemoryReceiver {
                shared,
                rx: c2s_rx,
                window: c2s_window,
            }),
        };
        trace!(stream_id = id, "memory stream opened");
        tokio::spawn(self.state.server.clone().serve_stream(server));
        Ok(client)
    }

    async fn ping(&self) -> Result<(), TransportError> {
        if self.token.is_cancelled() {
            return Err(self.lost());
        }
        self.state.counters.pings.fetch_add(1, Ordering::AcqRel);
        if self.state.drop_pings.load(Ordering::Acquire) {
            self.token.cancelled().await;
            return Err(self.lost());
        }
        Ok(())
    }

    async fn closed(&self) -> TransportError {
        self.token.cancelled().await;
        self.lost()
    }

    fn close(&self) {
        self.shutdown("closed locally");
    }
}

#[derive(Debug)]
struct StreamShared {
    id: StreamId,
    token: CancellationToken,
    reset: Mutex<Option<ResetReason>>,
    active: Arc<AtomicUsize>,
    state: Arc<ConnectorState>,
}

impl StreamShared {
    fn error(&self) -> TransportError {
        match *self.reset.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(reason) => TransportError::StreamReset {
                stream_id: self.id,
                reason,
            },
            None => TransportError::ConnectionLost {
                reason: "connection closed".to_string(),
            },
        }
    }
}

impl Drop for StreamShared {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

struct MemorySender {
    shared: Arc<StreamShared>,
    tx: mpsc::UnboundedSender<(StreamFrame, usize)>,
    window: FlowWindow,
    client: bool,
}

#[async_trait]
impl StreamSender for MemorySender {
    fn id(&self) -> StreamId {
        self.shared.id
    }

    async fn send(&self, frame: StreamFrame) -> Result<(), TransportError> {
        if self.shared.token.is_cancelled() {
            return Err(self.shared.error());
        }
        let credit = tokio::select! {
            biased;
            _ = self.shared.token.cancelled() => return Err(self.shared.error()),
            credit = self.window.acquire(frame.flow_controlled_len()) => credit?,
        };
        self.tx.send((frame, credit)).map_err(|_| {
            self.window.release(credit);
            TransportError::Closed
        })
    }

    fn reset(&self, reason: ResetReason) {
        {
            let mut slot = self
                .shared
                .reset
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() || self.shared.token.is_cancelled() {
                return;
            }
            *slot = Some(reason);
        }
        if self.client {
            self.shared
                .state
                .counters
                .client_resets
                .fetch_add(1, Ordering::AcqRel);
        }
        debug!(stream_id = self.shared.id, client = self.client, %reason, "stream reset");
        self.shared.token.cancel();
    }
}

struct MemoryReceiver {
    shared: Arc<StreamShared>,
    rx: mpsc::UnboundedReceiver<(StreamFrame, usize)>,
    window: FlowWindow,
}

#[async_trait]
impl StreamReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Result<Option<StreamFrame>, TransportError> {
        tokio::select! {
            biased;
            _ = self.shared.token.cancelled() => Err(self.shared.error()),
            item = self.rx.recv() => match item {
                Some((frame, credit)) => {
                    self.window.release(credit);
                    Ok(Some(frame))
                }
                None => Ok(None),
            },
        }
    }
}

impl Drop for MemoryReceiver {
    fn drop(&mut self) {
        self.window.close();
    }
}

//! Channel: call creation over one managed connection.
//!
//! The channel owns the connectivity state machine, the live connection and
//! the pending call queue, all behind one lock. Message I/O of dispatched
//! calls never takes that lock: each call attempt holds a [`StreamGrant`]
//! (the connection plus a concurrency slot) and talks to its own stream.
//!
//! Calls that find the channel not ready, or the concurrency limit reached,
//! are queued and dispatched in FIFO order once a connection is ready and a
//! slot frees up.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::call::{completed_call, new_call, Call, CallLimits, CallOptions, CallPhase, MethodDescriptor};
use crate::compress::{Compressor, CompressorRegistry};
use crate::config::ChannelConfig;
use crate::connection;
use crate::connectivity::{ConnectivityEvent, ConnectivityState, ConnectivityStateMachine};
use crate::driver::CallDriver;
use crate::error::{Result, RpcError};
use crate::interceptor::{CallContext, Interceptor, InterceptorPipeline};
use crate::retry::{RetryCoordinator, RetryThrottle};
use crate::transport::{Connection, ConnectionDescriptor, Connector};

/// Builder for [`Channel`].
pub struct ChannelBuilder {
    target: String,
    connector: Arc<dyn Connector>,
    config: ChannelConfig,
    interceptors: Vec<Arc<dyn Interceptor>>,
    compressors: CompressorRegistry,
}

impl ChannelBuilder {
    /// Replaces the configuration.
    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Appends an interceptor. Outbound hooks run in the order added.
    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Appends an already shared interceptor.
    pub fn shared_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Replaces the compressor registry.
    pub fn compressors(mut self, compressors: CompressorRegistry) -> Self {
        self.compressors = compressors;
        self
    }

    /// Creates the channel in `Idle`. No connection is attempted until the
    /// first call.
    pub fn build(self) -> Result<Channel> {
        let send_compressor = match self.config.send_compression.as_deref() {
            None => None,
            Some(name) => {
                if self.compressors.get(name).is_none() {
                    return Err(RpcError::Compression {
                        reason: format!("unknown send encoding {name:?}"),
                    });
                }
                self.compressors.for_send(Some(name))
            }
        };
        let descriptor = ConnectionDescriptor::new(self.target, &self.config);
        let throttle = self
            .config
            .retry_throttle
            .as_ref()
            .map(|cfg| Arc::new(RetryThrottle::new(cfg)));
        let (state_tx, _) = watch::channel(ConnectivityState::Idle);

        Ok(Channel {
            inner: Arc::new(ChannelInner {
                config: self.config,
                descriptor,
                connector: self.connector,
                pipeline: InterceptorPipeline::new(self.interceptors),
                compressors: self.compressors,
                send_compressor,
                throttle,
                shutdown: CancellationToken::new(),
                core: Mutex::new(ChannelCore::default()),
                state_tx,
                next_call_id: AtomicU64::new(1),
            }),
        })
    }
}

/// Handle to a channel. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.inner.descriptor.target)
            .field("state", &self.connectivity_state())
            .finish()
    }
}

impl Channel {
    /// Starts building a channel to `target` using `connector`.
    pub fn builder(target: impl Into<String>, connector: impl Connector) -> ChannelBuilder {
        ChannelBuilder {
            target: target.into(),
            connector: Arc::new(connector),
            config: ChannelConfig::default(),
            interceptors: Vec::new(),
            compressors: CompressorRegistry::default(),
        }
    }

    /// Starts a call.
    ///
    /// Never waits: if no stream can be opened right now the call is queued
    /// and its sends suspend until it is dispatched. Fails with
    /// [`RpcError::ChannelShutdown`] after [`close`](Self::close) and with
    /// [`RpcError::ResourceExhausted`] when the pending queue is full. An
    /// interceptor that rejects the call yields an already completed call.
    ///
    /// Must be called within a tokio runtime.
    pub fn make_call(&self, method: &MethodDescriptor, options: CallOptions) -> Result<Call> {
        let inner = &self.inner;
        if inner.state() == ConnectivityState::Shutdown {
            return Err(RpcError::ChannelShutdown);
        }

        let now = Instant::now();
        let deadline = options
            .deadline
            .or_else(|| inner.config.default_deadline().map(|d| now + d));
        let ctx = CallContext {
            call_id: inner.next_call_id.fetch_add(1, Ordering::Relaxed),
            method: method.path.clone(),
            call_type: method.call_type,
            deadline,
            started: now,
        };

        let mut metadata = options.metadata;
        if let Err(status) = inner.pipeline.on_start(&ctx, &mut metadata) {
            debug!(call_id = ctx.call_id, code = %status.code(), "call rejected by interceptor");
            return Ok(completed_call(ctx, inner.pipeline.clone(), status));
        }

        let reservation = inner.reserve()?;
        let policy = options
            .policy
            .unwrap_or_else(|| inner.config.policy_for(&method.path).clone());
        let coordinator = RetryCoordinator::new(policy, inner.throttle.clone());
        let limits = CallLimits {
            max_message_size: inner.config.max_message_size,
            retry_buffer_size: inner.config.retry_buffer_size,
            inbound_buffer: inner.config.inbound_buffer,
        };
        let call_id = ctx.call_id;
        let (call, shared, inbound) = new_call(
            ctx,
            inner.pipeline.clone(),
            inner.send_compressor.clone(),
            limits,
        );
        if matches!(reservation, Reservation::Queued(_)) {
            shared.set_phase(CallPhase::Queued);
            trace!(call_id, method = %method.path, "call queued");
        }

        let driver = CallDriver::new(
            inner.clone(),
            shared,
            inbound,
            metadata,
            coordinator,
            deadline,
        );
        tokio::spawn(driver.run(reservation));
        Ok(call)
    }

    /// Shuts the channel down. Queued calls fail with `ChannelShutdown` and
    /// calls in flight end with `Unavailable` once the connection closes.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Current connectivity state.
    pub fn connectivity_state(&self) -> ConnectivityState {
        self.inner.state()
    }

    /// Receiver of connectivity state changes. Only the latest state is kept,
    /// so a slow reader never holds up the channel.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.state_tx.subscribe()
    }

    /// Waits until the channel reaches `state`, or returns the terminal
    /// `Shutdown` state if the channel closes first.
    pub async fn wait_for_state(&self, state: ConnectivityState) -> ConnectivityState {
        let mut rx = self.subscribe();
        let seen = rx
            .wait_for(|s| *s == state || s.is_terminal())
            .await
            .map(|s| *s);
        seen.unwrap_or(ConnectivityState::Shutdown)
    }

    /// Calls waiting in the pending queue.
    pub fn queued_calls(&self) -> usize {
        self.inner.lock_core().pending.len()
    }

    /// Stream slots currently held by call attempts.
    pub fn active_calls(&self) -> usize {
        self.inner.lock_core().active_streams
    }

    /// Channel configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Target address.
    pub fn target(&self) -> &str {
        &self.inner.descriptor.target
    }
}

struct PendingCall {
    ticket: u64,
    tx: oneshot::Sender<StreamGrant>,
}

#[derive(Default)]
struct ChannelCore {
    machine: ConnectivityStateMachine,
    connection: Option<Arc<dyn Connection>>,
    pending: VecDeque<PendingCall>,
    active_streams: usize,
    next_ticket: u64,
}

pub(crate) struct ChannelInner {
    pub(crate) config: ChannelConfig,
    pub(crate) descriptor: ConnectionDescriptor,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) pipeline: InterceptorPipeline,
    pub(crate) compressors: CompressorRegistry,
    send_compressor: Option<Arc<dyn Compressor>>,
    throttle: Option<Arc<RetryThrottle>>,
    pub(crate) shutdown: CancellationToken,
    core: Mutex<ChannelCore>,
    state_tx: watch::Sender<ConnectivityState>,
    next_call_id: AtomicU64,
}

/// A connection plus one concurrency slot. The slot is returned on drop.
pub(crate) struct StreamGrant {
    connection: Arc<dyn Connection>,
    permit: StreamPermit,
}

impl StreamGrant {
    pub(crate) fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }
}

struct StreamPermit {
    channel: Weak<ChannelInner>,
    armed: bool,
}

impl Drop for StreamPermit {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(channel) = self.channel.upgrade() {
            channel.release_slot();
        }
    }
}

/// Outcome of asking for a stream slot.
pub(crate) enum Reservation {
    Ready(StreamGrant),
    Queued(QueuedCall),
}

/// A place in the pending queue. Resolves once dispatched; dropping it
/// leaves the queue.
pub(crate) struct QueuedCall {
    ticket: u64,
    rx: oneshot::Receiver<StreamGrant>,
    channel: Weak<ChannelInner>,
}

impl Future for QueuedCall {
    type Output = Result<StreamGrant>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.map_err(|_| RpcError::ChannelShutdown))
    }
}

impl Drop for QueuedCall {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            let mut core = channel.lock_core();
            core.pending.retain(|p| p.ticket != self.ticket);
        }
    }
}

impl ChannelInner {
    fn lock_core(&self) -> MutexGuard<'_, ChannelCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ConnectivityState {
        *self.state_tx.borrow()
    }

    /// Applies an event and publishes the new state. False if the machine
    /// rejected the event.
    fn transition(&self, core: &mut ChannelCore, event: ConnectivityEvent) -> bool {
        let from = core.machine.state();
        match core.machine.handle(event) {
            Ok(to) => {
                info!(peer = %self.descriptor.target, %from, state = %to, "connectivity changed");
                self.state_tx.send_replace(to);
                true
            }
            Err(e) => {
                trace!(peer = %self.descriptor.target, error = %e, "connectivity event ignored");
                false
            }
        }
    }

    fn has_free_slot(&self, core: &ChannelCore) -> bool {
        self.config
            .max_concurrent_calls
            .map_or(true, |max| core.active_streams < max)
    }

    fn grant(self: &Arc<Self>, connection: Arc<dyn Connection>) -> StreamGrant {
        StreamGrant {
            connection,
            permit: StreamPermit {
                channel: Arc::downgrade(self),
                armed: true,
            },
        }
    }

    /// Takes a stream slot now, or joins the pending queue.
    pub(crate) fn reserve(self: &Arc<Self>) -> Result<Reservation> {
        let mut core = self.lock_core();
        let state = core.machine.state();
        if state == ConnectivityState::Shutdown {
            return Err(RpcError::ChannelShutdown);
        }
        if state == ConnectivityState::Ready && core.pending.is_empty() && self.has_free_slot(&core) {
            if let Some(connection) = core.connection.clone() {
                core.active_streams += 1;
                return Ok(Reservation::Ready(self.grant(connection)));
            }
        }
        if let Some(max) = self.config.max_queue_depth {
            if core.pending.len() >= max {
                return Err(RpcError::ResourceExhausted {
                    depth: core.pending.len(),
                });
            }
        }

        let ticket = core.next_ticket;
        core.next_ticket += 1;
        let (tx, rx) = oneshot::channel();
        core.pending.push_back(PendingCall { ticket, tx });
        let start_manager =
            state == ConnectivityState::Idle && self.transition(&mut core, ConnectivityEvent::CallRequested);
        drop(core);

        if start_manager {
            connection::spawn_manager(self);
        }
        Ok(Reservation::Queued(QueuedCall {
            ticket,
            rx,
            channel: Arc::downgrade(self),
        }))
    }

    /// Hands free slots to queued calls in FIFO order.
    fn dispatch(self: &Arc<Self>, core: &mut ChannelCore) {
        if core.machine.state() != ConnectivityState::Ready {
            return;
        }
        let Some(connection) = core.connection.clone() else {
            return;
        };
        while self.has_free_slot(core) {
            let Some(pending) = core.pending.pop_front() else {
                break;
            };
            core.active_streams += 1;
            if let Err(mut grant) = pending.tx.send(self.grant(connection.clone())) {
                // The waiter is gone; take the slot back without re-entering the lock.
                grant.permit.armed = false;
                core.active_streams -= 1;
            }
        }
    }

    fn release_slot(self: &Arc<Self>) {
        let mut core = self.lock_core();
        core.active_streams = core.active_streams.saturating_sub(1);
        self.dispatch(&mut core);
    }

    pub(crate) fn on_connected(self: &Arc<Self>, connection: Arc<dyn Connection>) -> bool {
        let mut core = self.lock_core();
        if !self.transition(&mut core, ConnectivityEvent::HandshakeSucceeded) {
            return false;
        }
        core.connection = Some(connection);
        let queued = core.pending.len();
        self.dispatch(&mut core);
        debug!(
            peer = %self.descriptor.target,
            queued,
            dispatched = queued - core.pending.len(),
            "pending calls flushed"
        );
        true
    }

    pub(crate) fn on_connect_failed(&self) -> bool {
        let mut core = self.lock_core();
        self.transition(&mut core, ConnectivityEvent::HandshakeFailed)
    }

    pub(crate) fn on_connection_lost(&self) -> bool {
        let mut core = self.lock_core();
        core.connection = None;
        self.transition(&mut core, ConnectivityEvent::ConnectionLost)
    }

    pub(crate) fn on_backoff_elapsed(&self) -> bool {
        let mut core = self.lock_core();
        self.transition(&mut core, ConnectivityEvent::BackoffElapsed)
    }

    fn close(&self) {
        let mut core = self.lock_core();
        if !self.transition(&mut core, ConnectivityEvent::CloseRequested) {
            return;
        }
        let connection = core.connection.take();
        let pending = std::mem::take(&mut core.pending);
        drop(core);

        self.shutdown.cancel();
        if let Some(connection) = connection {
            connection.close();
        }
        info!(
            peer = %self.descriptor.target,
            failed_queued = pending.len(),
            "channel closed"
        );
        drop(pending);
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(connection) = core.connection.take() {
            connection.close();
        }
    }
}

//! Client call handle and per-call shared state.
//!
//! A call moves through these phases:
//!
//! ```text
//! created -> [queued] -> stream_opened -> sending_initial_metadata
//!   -> sending_messages <-> awaiting_flow_control_credit
//!   -> half_closed_local -> receiving_messages -> half_closed_remote
//!   -> completed(status)
//! ```
//!
//! The terminal status lives in a single-assignment slot: the first writer
//! wins and every later attempt to complete the call is ignored. Once the
//! status is set, sends fail fast with it and receives drain what the peer
//! already delivered (or nothing, after a local cancel or deadline) before
//! reporting it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::compress::Compressor;
use crate::framing::encode_message;
use crate::interceptor::{CallContext, InterceptorPipeline};
use crate::metadata::Metadata;
use crate::retry::CallPolicy;
use crate::status::{Code, Status};
use crate::transport::{StreamFrame, StreamSender};

/// Streaming shape of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    /// One request, one response.
    Unary,
    /// Many requests, one response.
    ClientStreaming,
    /// One request, many responses.
    ServerStreaming,
    /// Many requests, many responses.
    BidiStreaming,
}

impl CallType {
    /// Whether the client may send more than one message.
    pub fn client_streams(self) -> bool {
        matches!(self, CallType::ClientStreaming | CallType::BidiStreaming)
    }

    /// Whether the server may send more than one message.
    pub fn server_streams(self) -> bool {
        matches!(self, CallType::ServerStreaming | CallType::BidiStreaming)
    }
}

/// A method path together with its streaming shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    /// Full path, e.g. `/echo.Echo/Say`.
    pub path: String,
    /// Streaming shape.
    pub call_type: CallType,
}

impl MethodDescriptor {
    /// Creates a descriptor.
    pub fn new(path: impl Into<String>, call_type: CallType) -> Self {
        Self {
            path: path.into(),
            call_type,
        }
    }

    /// Unary method.
    pub fn unary(path: impl Into<String>) -> Self {
        Self::new(path, CallType::Unary)
    }

    /// Client-streaming method.
    pub fn client_streaming(path: impl Into<String>) -> Self {
        Self::new(path, CallType::ClientStreaming)
    }

    /// Server-streaming method.
    pub fn server_streaming(path: impl Into<String>) -> Self {
        Self::new(path, CallType::ServerStreaming)
    }

    /// Bidirectional-streaming method.
    pub fn bidi_streaming(path: impl Into<String>) -> Self {
        Self::new(path, CallType::BidiStreaming)
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Absolute deadline. Falls back to the channel's default deadline.
    pub deadline: Option<Instant>,
    /// Request metadata.
    pub metadata: Metadata,
    /// Overrides the channel's policy for this method.
    pub policy: Option<CallPolicy>,
}

impl CallOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the deadline to `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Sets an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the request metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Sets the retry or hedging policy.
    pub fn with_policy(mut self, policy: CallPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// Observable phase of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CallPhase {
    /// Interceptors have not finished yet.
    Created = 0,
    /// Waiting for a ready connection or a free stream slot.
    Queued = 1,
    /// A stream was opened for the current attempt.
    StreamOpened = 2,
    /// Request headers are being sent.
    SendingInitialMetadata = 3,
    /// Messages may be sent.
    SendingMessages = 4,
    /// A send is suspended waiting for flow-control credit.
    AwaitingFlowControlCredit = 5,
    /// The client finished sending.
    HalfClosedLocal = 6,
    /// Response messages are arriving.
    ReceivingMessages = 7,
    /// The server finished sending.
    HalfClosedRemote = 8,
    /// A terminal status has been set.
    Completed = 9,
}

impl CallPhase {
    fn from_u8(value: u8) -> CallPhase {
        match value {
            0 => CallPhase::Created,
            1 => CallPhase::Queued,
            2 => CallPhase::StreamOpened,
            3 => CallPhase::SendingInitialMetadata,
            4 => CallPhase::SendingMessages,
            5 => CallPhase::AwaitingFlowControlCredit,
            6 => CallPhase::HalfClosedLocal,
            7 => CallPhase::ReceivingMessages,
            8 => CallPhase::HalfClosedRemote,
            _ => CallPhase::Completed,
        }
    }
}

struct LaneFrame {
    frame: StreamFrame,
    sent: Option<oneshot::Sender<()>>,
}

/// Ordered frame queue for one attempt's stream, written by its own task so
/// that a stream without flow-control credit never holds up the others.
struct SendLane {
    attempt: u32,
    tx: mpsc::UnboundedSender<LaneFrame>,
}

impl SendLane {
    fn spawn(call_id: u64, attempt: u32, sender: Arc<dyn StreamSender>, done: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LaneFrame>();
        tokio::spawn(async move {
            while let Some(LaneFrame { frame, sent }) = rx.recv().await {
                let res = tokio::select! {
                    biased;
                    _ = done.cancelled() => return,
                    res = sender.send(frame) => res,
                };
                match res {
                    Ok(()) => {
                        if let Some(sent) = sent {
                            let _ = sent.send(());
                        }
                    }
                    Err(e) => {
                        trace!(call_id, attempt, stream_id = sender.id(), error = %e, "send lane closed");
                        return;
                    }
                }
            }
        });
        Self { attempt, tx }
    }

    /// Queues a frame without waiting. The receiver resolves once the frame
    /// is written, or errors if the lane closed first.
    fn push(&self, frame: StreamFrame) -> Option<oneshot::Receiver<()>> {
        let (sent, rx) = oneshot::channel();
        self.tx
            .send(LaneFrame {
                frame,
                sent: Some(sent),
            })
            .ok()
            .map(|()| rx)
    }

    fn replay(&self, frame: StreamFrame) {
        let _ = self.tx.send(LaneFrame { frame, sent: None });
    }
}

/// Outbound state shared by the application's sends and the driver's attempts.
/// The lock is only held while frames are queued, never across a send.
#[derive(Default)]
pub(crate) struct Outbound {
    buffer: Vec<Bytes>,
    buffered_bytes: usize,
    half_closed: bool,
    lanes: Vec<SendLane>,
}

/// State shared between the call handle and its driver task.
pub(crate) struct CallShared {
    pub(crate) ctx: CallContext,
    pub(crate) pipeline: InterceptorPipeline,
    pub(crate) compressor: Option<Arc<dyn Compressor>>,
    pub(crate) max_message_size: usize,
    retry_buffer_size: usize,
    phase: AtomicU8,
    claimed: AtomicBool,
    discard_inbound: AtomicBool,
    committed: AtomicBool,
    overflowed: AtomicBool,
    messages_sent: AtomicU64,
    retired: AtomicU32,
    status: watch::Sender<Option<Status>>,
    headers: watch::Sender<Option<Metadata>>,
    attached: watch::Sender<bool>,
    pub(crate) done: CancellationToken,
    outbound: Mutex<Outbound>,
}

/// Sizing inputs for a new call.
pub(crate) struct CallLimits {
    pub(crate) max_message_size: usize,
    pub(crate) retry_buffer_size: usize,
    pub(crate) inbound_buffer: usize,
}

fn attempt_bit(attempt: u32) -> u32 {
    1u32.checked_shl(attempt).unwrap_or(0)
}

/// Creates a call handle plus the pieces its driver needs.
pub(crate) fn new_call(
    ctx: CallContext,
    pipeline: InterceptorPipeline,
    compressor: Option<Arc<dyn Compressor>>,
    limits: CallLimits,
) -> (Call, Arc<CallShared>, mpsc::Sender<Bytes>) {
    let (status, _) = watch::channel(None);
    let (headers, _) = watch::channel(None);
    let (attached, _) = watch::channel(false);
    let shared = Arc::new(CallShared {
        ctx,
        pipeline,
        compressor,
        max_message_size: limits.max_message_size,
        retry_buffer_size: limits.retry_buffer_size,
        phase: AtomicU8::new(CallPhase::Created as u8),
        claimed: AtomicBool::new(false),
        discard_inbound: AtomicBool::new(false),
        committed: AtomicBool::new(false),
        overflowed: AtomicBool::new(false),
        messages_sent: AtomicU64::new(0),
        retired: AtomicU32::new(0),
        status,
        headers,
        attached,
        done: CancellationToken::new(),
        outbound: Mutex::new(Outbound::default()),
    });
    let (tx, rx) = mpsc::channel(limits.inbound_buffer.max(1));
    let call = Call {
        sender: CallSender {
            shared: shared.clone(),
            sent_single: false,
        },
        receiver: CallReceiver {
            shared: shared.clone(),
            inbound: rx,
        },
    };
    (call, shared, tx)
}

impl CallShared {
    pub(crate) fn phase(&self) -> CallPhase {
        CallPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Records a phase change. `Completed` is never left.
    pub(crate) fn set_phase(&self, phase: CallPhase) {
        let _ = self
            .phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != CallPhase::Completed as u8).then_some(phase as u8)
            });
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Sets the terminal status. Returns false if one was already set.
    ///
    /// `local` marks statuses synthesized on this side (cancel, deadline,
    /// interceptor short-circuit); inbound messages not yet consumed are then
    /// discarded.
    pub(crate) fn complete(&self, mut status: Status, local: bool) -> bool {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.pipeline.on_status(&self.ctx, &mut status);
        if local {
            self.discard_inbound.store(true, Ordering::Release);
        }
        self.phase.store(CallPhase::Completed as u8, Ordering::Release);
        debug!(call_id = self.ctx.call_id, code = %status.code(), local, "call completed");
        self.status.send_replace(Some(status));
        self.done.cancel();
        true
    }

    pub(crate) fn try_status(&self) -> Option<Status> {
        self.status.borrow().clone()
    }

    /// The terminal status, or `Cancelled` if called before completion.
    fn resolved_status(&self) -> Status {
        self.try_status()
            .unwrap_or_else(|| Status::cancelled("call is being cancelled"))
    }

    pub(crate) async fn wait_status(&self) -> Status {
        let mut rx = self.status.subscribe();
        let status = rx.wait_for(Option::is_some).await.map(|s| s.clone());
        match status {
            Ok(Some(status)) => status,
            _ => Status::unknown("call status unavailable"),
        }
    }

    fn discards_inbound(&self) -> bool {
        self.discard_inbound.load(Ordering::Acquire)
    }

    pub(crate) fn publish_headers(&self, metadata: Metadata) {
        self.headers.send_replace(Some(metadata));
    }

    /// Whether a new attempt could replay every message sent so far.
    pub(crate) fn replayable(&self) -> bool {
        !self.overflowed.load(Ordering::Acquire) && !self.committed.load(Ordering::Acquire)
    }

    pub(crate) fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Acquire)
    }

    /// Stops buffering for replay once the call is bound to one attempt.
    pub(crate) fn commit(&self) {
        self.committed.store(true, Ordering::Release);
    }

    /// Stops sending to an attempt's stream. Does not wait for in-flight sends.
    pub(crate) fn retire(&self, attempt: u32) {
        self.retired.fetch_or(attempt_bit(attempt), Ordering::AcqRel);
    }

    fn is_retired(&self, attempt: u32) -> bool {
        self.retired.load(Ordering::Acquire) & attempt_bit(attempt) != 0
    }

    /// Binds a freshly opened attempt stream: queues the buffered messages
    /// and a pending half-close for replay, then adds it to the send lanes.
    pub(crate) async fn attach(&self, attempt: u32, sender: Arc<dyn StreamSender>) {
        let mut out = self.outbound.lock().await;
        let lane = SendLane::spawn(self.ctx.call_id, attempt, sender, self.done.clone());
        for frame in &out.buffer {
            lane.replay(StreamFrame::Data(frame.clone()));
        }
        if out.half_closed {
            lane.replay(StreamFrame::EndStream);
        }
        out.lanes.retain(|l| !self.is_retired(l.attempt) && !l.tx.is_closed());
        out.lanes.push(lane);
        self.set_phase(if out.half_closed {
            CallPhase::HalfClosedLocal
        } else {
            CallPhase::SendingMessages
        });
        drop(out);
        self.attached.send_replace(true);
    }

    /// Queues `frame` on every live lane. Returns one receiver per lane.
    fn queue(&self, out: &mut Outbound, frame: &StreamFrame) -> Vec<oneshot::Receiver<()>> {
        let mut sent = Vec::with_capacity(out.lanes.len());
        out.lanes.retain(|lane| {
            if self.is_retired(lane.attempt) {
                return false;
            }
            match lane.push(frame.clone()) {
                Some(rx) => {
                    sent.push(rx);
                    true
                }
                None => false,
            }
        });
        sent
    }

    /// Waits until every lane wrote its copy or closed. False if the call
    /// ended first.
    async fn flushed(&self, sent: Vec<oneshot::Receiver<()>>) -> bool {
        tokio::select! {
            biased;
            _ = self.done.cancelled() => false,
            _ = join_all(sent) => true,
        }
    }

    /// Waits until the first attempt is attached. False if the call ended first.
    async fn wait_attached(&self) -> bool {
        let mut rx = self.attached.subscribe();
        tokio::select! {
            biased;
            attached = async { rx.wait_for(|a| *a).await.is_ok() } => attached && !self.is_complete(),
            _ = self.done.cancelled() => false,
        }
    }

    async fn send_message(&self, mut message: Bytes) -> Result<(), Status> {
        if let Some(status) = self.try_status() {
            return Err(status);
        }
        if let Err(status) = self.pipeline.on_send_message(&self.ctx, &mut message) {
            self.complete(status.clone(), true);
            return Err(status);
        }
        let wire = match encode_message(message, self.compressor.as_deref(), self.max_message_size) {
            Ok(wire) => wire,
            Err(e) => {
                let status = Status::from(e);
                self.complete(status.clone(), true);
                return Err(status);
            }
        };
        if !self.wait_attached().await {
            return Err(self.resolved_status());
        }

        let mut out = tokio::select! {
            biased;
            _ = self.done.cancelled() => return Err(self.resolved_status()),
            out = self.outbound.lock() => out,
        };
        if out.half_closed {
            return Err(Status::new(Code::FailedPrecondition, "send after close_send"));
        }
        self.messages_sent.fetch_add(1, Ordering::AcqRel);
        if self.committed.load(Ordering::Acquire) {
            out.buffer.clear();
            out.buffered_bytes = 0;
        } else if !self.overflowed.load(Ordering::Acquire) {
            if out.buffered_bytes + wire.len() > self.retry_buffer_size {
                trace!(call_id = self.ctx.call_id, "retry buffer overflowed");
                self.overflowed.store(true, Ordering::Release);
                out.buffer.clear();
                out.buffered_bytes = 0;
            } else {
                out.buffered_bytes += wire.len();
                out.buffer.push(wire.clone());
            }
        }

        let sent = self.queue(&mut out, &StreamFrame::Data(wire));
        drop(out);

        self.set_phase(CallPhase::AwaitingFlowControlCredit);
        if !self.flushed(sent).await {
            return Err(self.resolved_status());
        }
        self.set_phase(CallPhase::SendingMessages);
        Ok(())
    }

    async fn close_send(&self) -> Result<(), Status> {
        if self.is_complete() {
            return Ok(());
        }
        let mut out = tokio::select! {
            biased;
            _ = self.done.cancelled() => return Ok(()),
            out = self.outbound.lock() => out,
        };
        if out.half_closed {
            return Ok(());
        }
        out.half_closed = true;
        let sent = self.queue(&mut out, &StreamFrame::EndStream);
        drop(out);
        self.set_phase(CallPhase::HalfClosedLocal);
        self.flushed(sent).await;
        Ok(())
    }

    fn cancel(&self, message: &str) {
        self.complete(Status::cancelled(message), true);
    }
}

/// A live call: a sending half and a receiving half.
pub struct Call {
    sender: CallSender,
    receiver: CallReceiver,
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("call_id", &self.id())
            .field("phase", &self.phase())
            .finish()
    }
}

impl Call {
    /// Channel-unique call identifier.
    pub fn id(&self) -> u64 {
        self.receiver.shared.ctx.call_id
    }

    /// Method path.
    pub fn method(&self) -> &str {
        &self.receiver.shared.ctx.method
    }

    /// Current phase.
    pub fn phase(&self) -> CallPhase {
        self.receiver.shared.phase()
    }

    /// Sends one request message. See [`CallSender::send_message`].
    pub async fn send_message(&mut self, message: Bytes) -> Result<(), Status> {
        self.sender.send_message(message).await
    }

    /// Half-closes the request side.
    pub async fn close_send(&mut self) -> Result<(), Status> {
        self.sender.close_send().await
    }

    /// Next response message. See [`CallReceiver::recv_message`].
    pub async fn recv_message(&mut self) -> Result<Option<Bytes>, Status> {
        self.receiver.recv_message().await
    }

    /// Response headers, or `None` if the call ended without any.
    pub async fn response_headers(&mut self) -> Option<Metadata> {
        self.receiver.response_headers().await
    }

    /// Waits for the terminal status.
    pub async fn status(&self) -> Status {
        self.receiver.shared.wait_status().await
    }

    /// The terminal status if already resolved.
    pub fn try_status(&self) -> Option<Status> {
        self.receiver.shared.try_status()
    }

    /// Cancels the call. The status is `Cancelled` unless already resolved.
    pub fn cancel(&self) {
        self.receiver.shared.cancel("call cancelled by caller");
    }

    /// A handle that can cancel the call from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: self.receiver.shared.clone(),
        }
    }

    /// Splits into independently owned halves.
    pub fn split(self) -> (CallSender, CallReceiver) {
        (self.sender, self.receiver)
    }
}

/// Cancels a call from any task.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<CallShared>,
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("call_id", &self.shared.ctx.call_id)
            .finish()
    }
}

impl CancelHandle {
    /// Cancels the call.
    pub fn cancel(&self) {
        self.shared.cancel("call cancelled by caller");
    }

    /// Whether the call has a terminal status.
    pub fn is_complete(&self) -> bool {
        self.shared.is_complete()
    }
}

/// Sending half of a call.
pub struct CallSender {
    shared: Arc<CallShared>,
    sent_single: bool,
}

impl fmt::Debug for CallSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSender")
            .field("call_id", &self.shared.ctx.call_id)
            .finish()
    }
}

impl CallSender {
    /// Sends one request message.
    ///
    /// Suspends while the call is still queued and while the stream has no
    /// flow-control credit. For unary and server-streaming calls the request
    /// side is half-closed right after the single message. After completion
    /// this returns the terminal status.
    pub async fn send_message(&mut self, message: Bytes) -> Result<(), Status> {
        let single = !self.shared.ctx.call_type.client_streams();
        if single && self.sent_single {
            return Err(Status::new(
                Code::FailedPrecondition,
                "call type allows a single request message",
            ));
        }
        self.shared.send_message(message).await?;
        if single {
            self.sent_single = true;
            self.shared.close_send().await?;
        }
        Ok(())
    }

    /// Half-closes the request side. A no-op once closed or completed.
    pub async fn close_send(&mut self) -> Result<(), Status> {
        self.shared.close_send().await
    }

    /// Cancels the call.
    pub fn cancel(&self) {
        self.shared.cancel("call cancelled by caller");
    }
}

impl Drop for CallSender {
    fn drop(&mut self) {
        if self.shared.is_complete() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = self.shared.clone();
            handle.spawn(async move {
                let _ = shared.close_send().await;
            });
        }
    }
}

/// Receiving half of a call.
pub struct CallReceiver {
    shared: Arc<CallShared>,
    inbound: mpsc::Receiver<Bytes>,
}

impl fmt::Debug for CallReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallReceiver")
            .field("call_id", &self.shared.ctx.call_id)
            .finish()
    }
}

impl CallReceiver {
    /// Next response message.
    ///
    /// `Ok(None)` once the server finished with an OK status; `Err(status)`
    /// for any other terminal status. After a local cancel or deadline no
    /// further messages are returned.
    pub async fn recv_message(&mut self) -> Result<Option<Bytes>, Status> {
        if self.shared.discards_inbound() {
            return Err(self.shared.resolved_status());
        }
        let next = tokio::select! {
            biased;
            msg = self.inbound.recv() => msg,
            _ = self.shared.done.cancelled() => {
                if self.shared.discards_inbound() {
                    return Err(self.shared.resolved_status());
                }
                self.inbound.recv().await
            }
        };
        if self.shared.discards_inbound() {
            return Err(self.shared.resolved_status());
        }
        match next {
            Some(message) => Ok(Some(message)),
            None => {
                let status = self.shared.wait_status().await;
                if status.is_ok() {
                    Ok(None)
                } else {
                    Err(status)
                }
            }
        }
    }

    /// Response headers, or `None` if the call ended without any.
    pub async fn response_headers(&mut self) -> Option<Metadata> {
        let mut rx = self.shared.headers.subscribe();
        tokio::select! {
            biased;
            headers = async { rx.wait_for(Option::is_some).await.ok().and_then(|h| h.clone()) } => headers,
            _ = self.shared.done.cancelled() => self.shared.headers.borrow().clone(),
        }
    }

    /// Waits for the terminal status.
    pub async fn status(&self) -> Status {
        self.shared.wait_status().await
    }

    /// Cancels the call.
    pub fn cancel(&self) {
        self.shared.cancel("call cancelled by caller");
    }
}

impl Drop for CallReceiver {
    fn drop(&mut self) {
        if !self.shared.is_complete() {
            self.shared.cancel("response stream dropped");
        }
    }
}

/// Builds a call that already failed, used when an interceptor short-circuits.
pub(crate) fn completed_call(
    ctx: CallContext,
    pipeline: InterceptorPipeline,
    status: Status,
) -> Call {
    let limits = CallLimits {
        max_message_size: 0,
        retry_buffer_size: 0,
        inbound_buffer: 1,
    };
    let (call, shared, tx) = new_call(ctx, pipeline, None, limits);
    drop(tx);
    shared.complete(status, true);
    call
}

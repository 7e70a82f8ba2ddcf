//! Per-call driver task.
//!
//! The driver owns every attempt of one call. It opens attempt streams as
//! grants arrive from the channel, feeds inbound frames to the application,
//! enforces the deadline and asks the [`RetryCoordinator`] what to do when an
//! attempt fails. The first attempt to deliver response headers or data
//! commits the call; all other attempts are reset and no further attempts
//! start.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, SelectAll, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::call::{CallPhase, CallShared};
use crate::channel::{ChannelInner, QueuedCall, Reservation, StreamGrant};
use crate::compress::Compressor;
use crate::error::{RpcError, TransportError};
use crate::framing::{decode_message, FrameDecoder};
use crate::metadata::{
    encode_timeout, Metadata, MetadataError, ACCEPT_ENCODING_KEY, ENCODING_KEY, PATH_KEY,
    TIMEOUT_KEY,
};
use crate::retry::{AttemptOutcome, RetryCoordinator, RetryDecision, PREVIOUS_ATTEMPTS_KEY};
use crate::status::{Code, Status};
use crate::transport::{ResetReason, StreamFrame, StreamPair, StreamReceiver, StreamSender};

enum AttemptEvent {
    Frame(StreamFrame),
    Closed,
    Failed(TransportError),
}

type AttemptEvents = Pin<Box<dyn Stream<Item = (u32, AttemptEvent)> + Send>>;

/// Turns a stream receiver into events tagged with the attempt number. The
/// stream ends after trailers, a clean close or an error.
fn attempt_events(attempt: u32, receiver: Box<dyn StreamReceiver>) -> AttemptEvents {
    Box::pin(stream::unfold(Some(receiver), move |receiver| async move {
        let mut receiver = receiver?;
        match receiver.recv().await {
            Ok(Some(frame)) => {
                let terminal = matches!(frame, StreamFrame::Trailers(_));
                let next = (!terminal).then_some(receiver);
                Some(((attempt, AttemptEvent::Frame(frame)), next))
            }
            Ok(None) => Some(((attempt, AttemptEvent::Closed), None)),
            Err(e) => Some(((attempt, AttemptEvent::Failed(e)), None)),
        }
    }))
}

struct Attempt {
    sender: Arc<dyn StreamSender>,
    decoder: FrameDecoder,
    decompressor: Option<Arc<dyn Compressor>>,
    _grant: StreamGrant,
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn wait_grant(pending: &mut Option<QueuedCall>) -> Result<StreamGrant, RpcError> {
    match pending {
        Some(queued) => queued.await,
        None => std::future::pending().await,
    }
}

pub(crate) struct CallDriver {
    channel: Arc<ChannelInner>,
    call: Arc<CallShared>,
    inbound: mpsc::Sender<Bytes>,
    metadata: Metadata,
    coordinator: RetryCoordinator,
    attempts: HashMap<u32, Attempt>,
    events: SelectAll<AttemptEvents>,
    pending: Option<QueuedCall>,
    next_attempt_at: Option<Instant>,
    started: u32,
    committed: Option<u32>,
    deadline: Option<Instant>,
    last_status: Option<Status>,
}

impl CallDriver {
    pub(crate) fn new(
        channel: Arc<ChannelInner>,
        call: Arc<CallShared>,
        inbound: mpsc::Sender<Bytes>,
        metadata: Metadata,
        coordinator: RetryCoordinator,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            channel,
            call,
            inbound,
            metadata,
            coordinator,
            attempts: HashMap::new(),
            events: SelectAll::new(),
            pending: None,
            next_attempt_at: None,
            started: 0,
            committed: None,
            deadline,
            last_status: None,
        }
    }

    fn call_id(&self) -> u64 {
        self.call.ctx.call_id
    }

    pub(crate) async fn run(mut self, reservation: Reservation) {
        match reservation {
            Reservation::Ready(grant) => self.start_attempt(grant).await,
            Reservation::Queued(queued) => self.pending = Some(queued),
        }

        while !self.call.is_complete() {
            let has_events = !self.events.is_empty();
            tokio::select! {
                biased;
                _ = self.call.done.cancelled() => {}
                _ = sleep_until_opt(self.deadline) => {
                    self.call.complete(Status::deadline_exceeded("deadline exceeded"), true);
                }
                _ = self.channel.shutdown.cancelled() => {
                    let status = self
                        .last_status
                        .take()
                        .unwrap_or_else(|| Status::from(RpcError::ChannelShutdown));
                    self.call.complete(status, false);
                }
                grant = wait_grant(&mut self.pending) => {
                    self.pending = None;
                    match grant {
                        Ok(grant) => self.start_attempt(grant).await,
                        Err(e) => self.setup_failed(Status::from(e)),
                    }
                }
                _ = sleep_until_opt(self.next_attempt_at) => {
                    self.next_attempt_at = None;
                    self.request_attempt().await;
                }
                Some((attempt, event)) = self.events.next(), if has_events => {
                    self.on_event(attempt, event).await;
                }
            }

            if !self.call.is_complete()
                && self.attempts.is_empty()
                && self.pending.is_none()
                && self.next_attempt_at.is_none()
            {
                let status = self
                    .last_status
                    .take()
                    .unwrap_or_else(|| Status::internal("no attempt in flight"));
                self.call.complete(status, false);
            }
        }
        self.finish();
    }

    /// Resets attempts still open after the call completed.
    fn finish(&mut self) {
        let reason = match self.call.try_status().map(|s| s.code()) {
            Some(Code::DeadlineExceeded) => ResetReason::DeadlineExceeded,
            _ => ResetReason::Cancelled,
        };
        for (number, attempt) in self.attempts.drain() {
            self.call.retire(number);
            attempt.sender.reset(reason);
            trace!(call_id = self.call.ctx.call_id, attempt = number, %reason, "attempt reset");
        }
        self.pending = None;
        self.next_attempt_at = None;
    }

    /// Asks the channel for another stream slot.
    async fn request_attempt(&mut self) {
        if self.committed.is_some() || self.pending.is_some() {
            return;
        }
        if self.started >= self.coordinator.max_attempts() {
            return;
        }
        if self.coordinator.hedging_delay().is_some()
            && !self.attempts.is_empty()
            && !self.coordinator.may_hedge(self.started)
        {
            return;
        }
        match self.channel.reserve() {
            Ok(Reservation::Ready(grant)) => self.start_attempt(grant).await,
            Ok(Reservation::Queued(queued)) => {
                if self.attempts.is_empty() {
                    self.call.set_phase(CallPhase::Queued);
                }
                self.pending = Some(queued);
            }
            Err(e) => self.setup_failed(Status::from(e)),
        }
    }

    /// An attempt could not be set up. Fatal only when nothing else is running.
    fn setup_failed(&mut self, status: Status) {
        if self.attempts.is_empty() && self.next_attempt_at.is_none() {
            self.call.complete(status, false);
        } else {
            debug!(call_id = self.call_id(), code = %status.code(), "additional attempt not started");
        }
    }

    fn attempt_headers(&self, attempt: u32, now: Instant) -> Result<Metadata, MetadataError> {
        let mut md = self.metadata.clone();
        md.insert(PATH_KEY, &self.call.ctx.method)?;
        if let Some(deadline) = self.deadline {
            md.insert(TIMEOUT_KEY, &encode_timeout(deadline.saturating_duration_since(now)))?;
        }
        if let Some(compressor) = &self.call.compressor {
            md.insert(ENCODING_KEY, compressor.name())?;
        }
        md.insert(ACCEPT_ENCODING_KEY, &self.channel.compressors.accept_encoding())?;
        if attempt > 1 {
            md.insert(PREVIOUS_ATTEMPTS_KEY, &(attempt - 1).to_string())?;
        }
        Ok(md)
    }

    async fn start_attempt(&mut self, grant: StreamGrant) {
        let now = Instant::now();
        if self.deadline.is_some_and(|d| now >= d) {
            self.call.complete(Status::deadline_exceeded("deadline exceeded"), true);
            return;
        }
        self.started += 1;
        let number = self.started;
        let headers = match self.attempt_headers(number, now) {
            Ok(headers) => headers,
            Err(e) => {
                self.call.complete(Status::from(RpcError::from(e)), true);
                return;
            }
        };

        let StreamPair { sender, receiver } = match grant.connection().open_stream().await {
            Ok(pair) => pair,
            Err(e) => {
                drop(grant);
                debug!(call_id = self.call_id(), attempt = number, error = %e, "stream open failed");
                self.conclude_attempt(number, Status::from(&e));
                return;
            }
        };
        self.call.set_phase(CallPhase::StreamOpened);
        trace!(call_id = self.call_id(), attempt = number, stream_id = sender.id(), "attempt stream opened");

        let call = self.call.clone();
        let setup = async {
            call.set_phase(CallPhase::SendingInitialMetadata);
            sender.send(StreamFrame::Headers(headers)).await?;
            call.attach(number, sender.clone()).await;
            Ok::<(), TransportError>(())
        };
        let outcome = tokio::select! {
            biased;
            _ = self.call.done.cancelled() => None,
            _ = sleep_until_opt(self.deadline) => {
                self.call.complete(Status::deadline_exceeded("deadline exceeded"), true);
                None
            }
            res = setup => Some(res),
        };
        match outcome {
            None => {
                let reason = match self.call.try_status().map(|s| s.code()) {
                    Some(Code::DeadlineExceeded) => ResetReason::DeadlineExceeded,
                    _ => ResetReason::Cancelled,
                };
                self.call.retire(number);
                sender.reset(reason);
            }
            Some(Err(e)) => {
                self.call.retire(number);
                self.conclude_attempt(number, Status::from(&e));
            }
            Some(Ok(())) => {
                self.events.push(attempt_events(number, receiver));
                self.attempts.insert(
                    number,
                    Attempt {
                        sender,
                        decoder: FrameDecoder::new(self.call.max_message_size),
                        decompressor: None,
                        _grant: grant,
                    },
                );
                if let Some(delay) = self.coordinator.hedging_delay() {
                    if self.coordinator.may_hedge(self.started) {
                        self.next_attempt_at = Some(Instant::now() + delay);
                    }
                }
            }
        }
    }

    async fn on_event(&mut self, number: u32, event: AttemptEvent) {
        if !self.attempts.contains_key(&number) {
            return;
        }
        match event {
            AttemptEvent::Frame(StreamFrame::Headers(md)) => self.on_headers(number, md),
            AttemptEvent::Frame(StreamFrame::Data(chunk)) => self.on_data(number, chunk).await,
            AttemptEvent::Frame(StreamFrame::EndStream) => {
                if !self.check_frame_boundary(number) {
                    return;
                }
                if self.committed == Some(number) {
                    self.call.set_phase(CallPhase::HalfClosedRemote);
                }
            }
            AttemptEvent::Frame(StreamFrame::Trailers(status)) => {
                if self.check_frame_boundary(number) {
                    self.conclude_attempt(number, status)
                }
            }
            AttemptEvent::Closed => {
                if self.check_frame_boundary(number) {
                    self.conclude_attempt(number, Status::internal("stream closed without status"))
                }
            }
            AttemptEvent::Failed(e) => self.conclude_attempt(number, Status::from(&e)),
        }
    }

    /// The response side ended: a partially received message fails the call.
    fn check_frame_boundary(&mut self, number: u32) -> bool {
        let Some(attempt) = self.attempts.get(&number) else {
            return false;
        };
        match attempt.decoder.finish() {
            Ok(()) => true,
            Err(e) => {
                self.abort_malformed(number, e);
                false
            }
        }
    }

    fn abort_malformed(&mut self, number: u32, e: RpcError) {
        warn!(call_id = self.call_id(), attempt = number, error = %e, "malformed response");
        if let Some(attempt) = self.attempts.remove(&number) {
            self.call.retire(number);
            attempt.sender.reset(ResetReason::ProtocolError);
        }
        self.call.complete(Status::from(e), false);
    }

    fn on_headers(&mut self, number: u32, mut md: Metadata) {
        let decompressor = match md.get(ENCODING_KEY) {
            None => None,
            Some(name) => match self.channel.compressors.get(name) {
                Some(c) => Some(c),
                None => {
                    let status = Status::internal(format!("unsupported response encoding {name}"));
                    if let Some(attempt) = self.attempts.get(&number) {
                        attempt.sender.reset(ResetReason::Internal);
                    }
                    self.conclude_attempt(number, status);
                    return;
                }
            },
        };
        if let Some(attempt) = self.attempts.get_mut(&number) {
            attempt.decompressor = decompressor;
        }
        self.commit(number);
        self.call.pipeline.on_response_headers(&self.call.ctx, &mut md);
        self.call.publish_headers(md);
    }

    /// Binds the call to one attempt and drops every other one.
    fn commit(&mut self, number: u32) {
        if self.committed.is_some() {
            return;
        }
        self.committed = Some(number);
        self.call.commit();
        let losers: Vec<u32> = self
            .attempts
            .keys()
            .copied()
            .filter(|n| *n != number)
            .collect();
        for loser in losers {
            if let Some(attempt) = self.attempts.remove(&loser) {
                self.call.retire(loser);
                attempt.sender.reset(ResetReason::Cancelled);
            }
        }
        self.pending = None;
        self.next_attempt_at = None;
        debug!(call_id = self.call_id(), attempt = number, "call committed");
    }

    async fn on_data(&mut self, number: u32, chunk: Bytes) {
        self.commit(number);
        let max = self.call.max_message_size;
        let Some(attempt) = self.attempts.get_mut(&number) else {
            return;
        };
        attempt.decoder.push(&chunk);

        let mut messages = Vec::new();
        let failure = loop {
            match attempt.decoder.next_frame() {
                Ok(Some(frame)) => match decode_message(frame, attempt.decompressor.as_deref(), max) {
                    Ok(message) => messages.push(message),
                    Err(e) => break Some(e),
                },
                Ok(None) => break None,
                Err(e) => break Some(e),
            }
        };

        for mut message in messages {
            self.call.pipeline.on_receive_message(&self.call.ctx, &mut message);
            self.call.set_phase(CallPhase::ReceivingMessages);
            if !self.deliver(message).await {
                return;
            }
        }
        if let Some(e) = failure {
            self.abort_malformed(number, e);
        }
    }

    /// Hands a message to the application. False once the call is over.
    async fn deliver(&mut self, message: Bytes) -> bool {
        tokio::select! {
            biased;
            _ = self.call.done.cancelled() => false,
            _ = sleep_until_opt(self.deadline) => {
                self.call.complete(Status::deadline_exceeded("deadline exceeded"), true);
                false
            }
            sent = self.inbound.send(message) => {
                if sent.is_err() {
                    self.call.complete(Status::cancelled("response stream dropped"), true);
                }
                sent.is_ok()
            }
        }
    }

    /// Records the end of an attempt and applies the policy.
    fn conclude_attempt(&mut self, number: u32, status: Status) {
        if let Some(attempt) = self.attempts.remove(&number) {
            drop(attempt);
        }
        self.call.retire(number);
        self.call
            .pipeline
            .on_attempt_complete(&self.call.ctx, number, &status);
        self.coordinator.record(&status);

        if status.is_ok() || self.committed == Some(number) {
            self.call.complete(status, false);
            return;
        }

        let live_attempts = self.attempts.len() + usize::from(self.pending.is_some());
        let decision = self.coordinator.on_attempt_failed(AttemptOutcome {
            status: &status,
            attempts_started: self.started,
            live_attempts,
            committed: self.committed.is_some(),
            replayable: self.call.replayable(),
            messages_sent: self.call.messages_sent() > 0,
        });
        match decision {
            RetryDecision::RetryAfter(delay) => {
                let at = Instant::now() + delay;
                self.next_attempt_at = Some(self.next_attempt_at.map_or(at, |t| t.min(at)));
                debug!(
                    call_id = self.call_id(),
                    attempt = number,
                    code = %status.code(),
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed, retrying"
                );
                self.last_status = Some(status);
            }
            RetryDecision::Wait => {
                trace!(call_id = self.call_id(), attempt = number, "hedged attempt failed");
                self.last_status = Some(status);
            }
            RetryDecision::Finish => {
                self.call.complete(status, false);
            }
        }
    }
}

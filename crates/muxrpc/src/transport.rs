//! Transport collaborator contract.
//!
//! The engine consumes a multiplexed, ordered, bidirectional stream transport
//! through these traits. A [`Connector`] establishes a [`Connection`]; each
//! call opens its own stream on it and talks through a [`StreamSender`] and a
//! [`StreamReceiver`]. Streams are independently flow-controlled and
//! independently resettable.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{ChannelConfig, KeepaliveConfig, SecurityConfig};
use crate::error::TransportError;
use crate::metadata::Metadata;
use crate::status::Status;

/// Identifier of a stream within one connection.
pub type StreamId = u64;

/// Why a stream was reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetReason {
    /// The call was cancelled.
    Cancelled,
    /// The call deadline expired.
    DeadlineExceeded,
    /// The peer refused to process the stream.
    RefusedStream,
    /// The peer violated the framing protocol.
    ProtocolError,
    /// Internal failure on the resetting side.
    Internal,
}

impl ResetReason {
    /// Status observed by a party whose stream was reset for this reason.
    pub fn to_status(self) -> Status {
        match self {
            ResetReason::Cancelled => Status::cancelled("stream reset: cancelled"),
            ResetReason::DeadlineExceeded => Status::deadline_exceeded("stream reset: deadline exceeded"),
            ResetReason::RefusedStream => Status::unavailable("stream reset: refused"),
            ResetReason::ProtocolError => Status::internal("stream reset: protocol error"),
            ResetReason::Internal => Status::internal("stream reset: internal error"),
        }
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResetReason::Cancelled => "cancelled",
            ResetReason::DeadlineExceeded => "deadline exceeded",
            ResetReason::RefusedStream => "refused",
            ResetReason::ProtocolError => "protocol error",
            ResetReason::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// A frame on one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// Initial metadata. Sent once, first, by each side that sends anything.
    Headers(Metadata),
    /// A chunk of framed message bytes. Chunks carry no message boundaries.
    Data(Bytes),
    /// The sender will send nothing further.
    EndStream,
    /// Terminal status from the server, ending the stream.
    Trailers(Status),
}

impl StreamFrame {
    /// Bytes of flow-control credit the frame consumes.
    pub fn flow_controlled_len(&self) -> usize {
        match self {
            StreamFrame::Data(bytes) => bytes.len(),
            _ => 0,
        }
    }
}

/// Sending half of a stream.
#[async_trait]
pub trait StreamSender: Send + Sync {
    /// Stream identifier.
    fn id(&self) -> StreamId;

    /// Sends a frame, suspending while the stream has no flow-control credit.
    async fn send(&self, frame: StreamFrame) -> Result<(), TransportError>;

    /// Requests a reset. Does not wait for the peer to observe it.
    fn reset(&self, reason: ResetReason);
}

/// Receiving half of a stream.
#[async_trait]
pub trait StreamReceiver: Send {
    /// Next frame, `Ok(None)` once the peer is done with the stream.
    async fn recv(&mut self) -> Result<Option<StreamFrame>, TransportError>;
}

/// Both halves of a freshly opened stream.
pub struct StreamPair {
    /// Shared so several tasks can send or reset.
    pub sender: Arc<dyn StreamSender>,
    /// Owned by the single reader.
    pub receiver: Box<dyn StreamReceiver>,
}

impl fmt::Debug for StreamPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPair")
            .field("id", &self.sender.id())
            .finish()
    }
}

/// An established connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens a new multiplexed stream.
    async fn open_stream(&self) -> Result<StreamPair, TransportError>;

    /// Round-trips a keepalive ping.
    async fn ping(&self) -> Result<(), TransportError>;

    /// Resolves once the connection is gone, with the reason.
    async fn closed(&self) -> TransportError;

    /// Closes the connection, failing every open stream.
    fn close(&self);
}

/// Establishes connections to a target.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connects and completes the handshake.
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

/// Immutable description of the connection a channel manages.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionDescriptor {
    /// Target address.
    pub target: String,
    /// Security settings handed to the transport.
    pub security: SecurityConfig,
    /// Idle timeout handed to the transport.
    pub idle_timeout: Duration,
    /// Keepalive parameters.
    pub keepalive: KeepaliveConfig,
}

impl ConnectionDescriptor {
    /// Derives the descriptor for `target` from a channel configuration.
    pub fn new(target: impl Into<String>, config: &ChannelConfig) -> Self {
        Self {
            target: target.into(),
            security: config.security.clone(),
            idle_timeout: config.idle_timeout(),
            keepalive: config.keepalive.clone(),
        }
    }
}

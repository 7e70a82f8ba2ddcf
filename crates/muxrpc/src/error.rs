use thiserror::Error;

use crate::codec::CodecError;
use crate::metadata::MetadataError;
use crate::status::{Code, Status};
use crate::transport::{ResetReason, StreamId};

/// Failures reported by the transport collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused to {target}")]
    ConnectionRefused { target: String },

    #[error("connect to {target} timed out after {timeout_ms}ms")]
    ConnectTimeout { target: String, timeout_ms: u64 },

    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("stream {stream_id} reset: {reason}")]
    StreamReset { stream_id: StreamId, reason: ResetReason },

    #[error("stream limit reached ({max} concurrent streams)")]
    StreamLimit { max: usize },

    #[error("transport closed")]
    Closed,
}

/// Errors produced by the RPC engine.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("channel is shut down")]
    ChannelShutdown,

    #[error("pending call queue is full ({depth} calls queued)")]
    ResourceExhausted { depth: usize },

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },

    #[error("compression error: {reason}")]
    Compression { reason: String },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Status(Status),
}

pub type Result<T> = std::result::Result<T, RpcError>;

impl From<&TransportError> for Status {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::StreamReset { reason, .. } => reason.to_status(),
            _ => Status::unavailable(err.to_string()),
        }
    }
}

impl From<&RpcError> for Status {
    fn from(err: &RpcError) -> Self {
        match err {
            RpcError::ChannelShutdown => Status::unavailable(err.to_string()),
            RpcError::ResourceExhausted { .. } | RpcError::MessageTooLarge { .. } => {
                Status::resource_exhausted(err.to_string())
            }
            RpcError::InvalidFrame { .. } | RpcError::Compression { .. } | RpcError::Codec(_) => {
                Status::internal(err.to_string())
            }
            RpcError::Metadata(_) => Status::new(Code::InvalidArgument, err.to_string()),
            RpcError::Transport(t) => Status::from(t),
            RpcError::Status(s) => s.clone(),
        }
    }
}

impl From<RpcError> for Status {
    fn from(err: RpcError) -> Self {
        Status::from(&err)
    }
}

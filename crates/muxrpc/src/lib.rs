#![warn(missing_docs)]

//! muxrpc: multiplexed streaming RPC calls over a single managed connection.
//!
//! A [`Channel`] owns one logical connection and its connectivity state
//! machine, queues calls while the connection is not ready and dispatches
//! them in FIFO order. Each [`Call`] runs on its own multiplexed stream with
//! per-stream flow control, a deadline, cancellation, an interceptor pipeline
//! and an optional retry or hedging policy. The transport is pluggable
//! through the [`Connector`] traits; [`MemoryConnector`] serves calls from an
//! in-process [`Server`].

pub mod backoff;
pub mod call;
pub mod channel;
pub mod client;
pub mod codec;
pub mod compress;
pub mod config;
mod connection;
pub mod connectivity;
mod driver;
pub mod error;
pub mod flowcontrol;
pub mod framing;
pub mod interceptor;
pub mod mem;
pub mod metadata;
pub mod retry;
pub mod server;
pub mod stats;
pub mod status;
pub mod transport;

pub use backoff::{Backoff, BackoffConfig, JitterMode};
pub use call::{
    Call, CallOptions, CallPhase, CallReceiver, CallSender, CallType, CancelHandle,
    MethodDescriptor,
};
pub use channel::{Channel, ChannelBuilder};
pub use client::{Client, RequestSink, Response, Streaming};
pub use codec::{BincodeCodec, BytesCodec, Codec, CodecError};
pub use compress::{Compressor, CompressorRegistry, IdentityCompressor, Lz4Compressor};
pub use config::{ChannelConfig, KeepaliveConfig, SecurityConfig};
pub use connectivity::{ConnectivityEvent, ConnectivityState, ConnectivityStateMachine};
pub use error::{Result, RpcError, TransportError};
pub use flowcontrol::FlowWindow;
pub use framing::{FrameDecoder, MessageFrame};
pub use interceptor::{
    CallContext, Interceptor, InterceptorPipeline, LoggingInterceptor, MetadataInterceptor,
    StatsInterceptor,
};
pub use mem::MemoryConnector;
pub use metadata::{Metadata, MetadataValue};
pub use retry::{CallPolicy, HedgingPolicy, RetryPolicy, RetryThrottle, RetryThrottleConfig};
pub use server::{service_fn, Server, ServerCall, ServiceHandler};
pub use stats::{CallStats, StatsSnapshot};
pub use status::{Code, Status};
pub use transport::{Connection, ConnectionDescriptor, Connector, StreamFrame};

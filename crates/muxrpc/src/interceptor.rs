//! Interceptor pipeline.
//!
//! Interceptors run in registration order for outbound events (call start,
//! sent messages) and in reverse order for inbound events (response headers,
//! received messages, attempt and call completion). An outbound hook may
//! short-circuit the call by returning a status; the call then completes with
//! that status and performs no further transport I/O.
//!
//! One interceptor instance is shared by every call on a channel, so hooks
//! take `&self` and must be safe to run concurrently.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::call::CallType;
use crate::metadata::{Metadata, MetadataError};
use crate::stats::CallStats;
use crate::status::Status;

/// Per-call information handed to every hook.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Channel-unique call identifier.
    pub call_id: u64,
    /// Full method path, e.g. `/echo.Echo/Say`.
    pub method: String,
    /// Streaming shape of the call.
    pub call_type: CallType,
    /// Absolute deadline, if any.
    pub deadline: Option<Instant>,
    /// When the call was created.
    pub started: Instant,
}

/// Hooks around one call. Every hook has a no-op default.
pub trait Interceptor: Send + Sync + 'static {
    /// Runs before any transport I/O. May edit the request metadata.
    fn on_start(&self, ctx: &CallContext, metadata: &mut Metadata) -> Result<(), Status> {
        let _ = (ctx, metadata);
        Ok(())
    }

    /// Runs for each outbound message before it is framed.
    fn on_send_message(&self, ctx: &CallContext, message: &mut Bytes) -> Result<(), Status> {
        let _ = (ctx, message);
        Ok(())
    }

    /// Runs when response headers arrive.
    fn on_response_headers(&self, ctx: &CallContext, metadata: &mut Metadata) {
        let _ = (ctx, metadata);
    }

    /// Runs for each inbound message before the application sees it.
    fn on_receive_message(&self, ctx: &CallContext, message: &mut Bytes) {
        let _ = (ctx, message);
    }

    /// Runs when a single attempt of the call ends, including retried ones.
    fn on_attempt_complete(&self, ctx: &CallContext, attempt: u32, status: &Status) {
        let _ = (ctx, attempt, status);
    }

    /// Runs once, when the call reaches its terminal status.
    fn on_status(&self, ctx: &CallContext, status: &mut Status) {
        let _ = (ctx, status);
    }
}

/// Ordered, immutable list of interceptors shared by all calls of a channel.
#[derive(Clone)]
pub struct InterceptorPipeline {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
}

impl Default for InterceptorPipeline {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl fmt::Debug for InterceptorPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorPipeline")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

impl InterceptorPipeline {
    /// Builds a pipeline in registration order.
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            interceptors: Arc::from(interceptors),
        }
    }

    /// Number of interceptors.
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Returns true if there are none.
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub(crate) fn on_start(&self, ctx: &CallContext, metadata: &mut Metadata) -> Result<(), Status> {
        self.interceptors
            .iter()
            .try_for_each(|i| i.on_start(ctx, metadata))
    }

    pub(crate) fn on_send_message(&self, ctx: &CallContext, message: &mut Bytes) -> Result<(), Status> {
        self.interceptors
            .iter()
            .try_for_each(|i| i.on_send_message(ctx, message))
    }

    pub(crate) fn on_response_headers(&self, ctx: &CallContext, metadata: &mut Metadata) {
        for i in self.interceptors.iter().rev() {
            i.on_response_headers(ctx, metadata);
        }
    }

    pub(crate) fn on_receive_message(&self, ctx: &CallContext, message: &mut Bytes) {
        for i in self.interceptors.iter().rev() {
            i.on_receive_message(ctx, message);
        }
    }

    pub(crate) fn on_attempt_complete(&self, ctx: &CallContext, attempt: u32, status: &Status) {
        for i in self.interceptors.iter().rev() {
            i.on_attempt_complete(ctx, attempt, status);
        }
    }

    pub(crate) fn on_status(&self, ctx: &CallContext, status: &mut Status) {
        for i in self.interceptors.iter().rev() {
            i.on_status(ctx, status);
        }
    }
}

/// Adds a fixed set of headers to every call.
#[derive(Debug, Clone, Default)]
pub struct MetadataInterceptor {
    headers: Metadata,
}

impl MetadataInterceptor {
    /// Creates an interceptor with no headers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an ASCII header.
    pub fn with_header(mut self, key: &str, value: &str) -> Result<Self, MetadataError> {
        self.headers.append(key, value)?;
        Ok(self)
    }
}

impl Interceptor for MetadataInterceptor {
    fn on_start(&self, _ctx: &CallContext, metadata: &mut Metadata) -> Result<(), Status> {
        metadata.merge(self.headers.clone());
        Ok(())
    }
}

/// Logs call starts, retried attempts and terminal statuses.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn on_start(&self, ctx: &CallContext, _metadata: &mut Metadata) -> Result<(), Status> {
        debug!(call_id = ctx.call_id, method = %ctx.method, call_type = ?ctx.call_type, "call started");
        Ok(())
    }

    fn on_attempt_complete(&self, ctx: &CallContext, attempt: u32, status: &Status) {
        if !status.is_ok() {
            debug!(call_id = ctx.call_id, attempt, code = %status.code(), "attempt failed");
        }
    }

    fn on_status(&self, ctx: &CallContext, status: &mut Status) {
        let elapsed_ms = ctx.started.elapsed().as_millis() as u64;
        if status.is_ok() {
            info!(call_id = ctx.call_id, method = %ctx.method, elapsed_ms, "call completed");
        } else {
            warn!(
                call_id = ctx.call_id,
                method = %ctx.method,
                elapsed_ms,
                code = %status.code(),
                message = status.message(),
                "call failed"
            );
        }
    }
}

/// Records every terminal status into a shared [`CallStats`].
#[derive(Debug, Clone)]
pub struct StatsInterceptor {
    stats: Arc<CallStats>,
}

impl StatsInterceptor {
    /// Records into `stats`.
    pub fn new(stats: Arc<CallStats>) -> Self {
        Self { stats }
    }
}

impl Interceptor for StatsInterceptor {
    fn on_status(&self, ctx: &CallContext, status: &mut Status) {
        self.stats.record(status.code(), ctx.started.elapsed());
    }
}

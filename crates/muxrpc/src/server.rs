//! Server side: routes incoming streams to method handlers.
//!
//! A stream starts with a `Headers` frame naming the method in `:path`. The
//! handler reads and writes messages through a [`ServerCall`]; the status it
//! returns is sent as the stream's trailers.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::compress::{Compressor, CompressorRegistry};
use crate::framing::{decode_message, encode_message, FrameDecoder, DEFAULT_MAX_MESSAGE_SIZE};
use crate::metadata::{
    parse_timeout, Metadata, ACCEPT_ENCODING_KEY, ENCODING_KEY, PATH_KEY, TIMEOUT_KEY,
};
use crate::status::Status;
use crate::transport::{ResetReason, StreamFrame, StreamPair, StreamReceiver, StreamSender};

/// Handles calls to one method.
#[async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    /// Serves one call and returns its terminal status.
    async fn handle(&self, call: ServerCall) -> Status;
}

/// Handler built from a closure. See [`service_fn`].
pub struct ServiceFn<F> {
    f: F,
}

/// Wraps an async closure as a [`ServiceHandler`].
pub fn service_fn<F, Fut>(f: F) -> ServiceFn<F>
where
    F: Fn(ServerCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Status> + Send + 'static,
{
    ServiceFn { f }
}

#[async_trait]
impl<F, Fut> ServiceHandler for ServiceFn<F>
where
    F: Fn(ServerCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Status> + Send + 'static,
{
    async fn handle(&self, call: ServerCall) -> Status {
        (self.f)(call).await
    }
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    routes: HashMap<String, Arc<dyn ServiceHandler>>,
    compressors: CompressorRegistry,
    max_message_size: usize,
}

impl ServerBuilder {
    /// Registers a handler for a full method path such as `/echo.Echo/Say`.
    pub fn route(mut self, path: impl Into<String>, handler: impl ServiceHandler) -> Self {
        self.routes.insert(path.into(), Arc::new(handler));
        self
    }

    /// Largest message accepted or sent.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Replaces the compressor registry.
    pub fn compressors(mut self, compressors: CompressorRegistry) -> Self {
        self.compressors = compressors;
        self
    }

    /// Finishes the server.
    pub fn build(self) -> Arc<Server> {
        Arc::new(Server {
            routes: self.routes,
            compressors: self.compressors,
            max_message_size: self.max_message_size,
        })
    }
}

/// Method router serving streams handed over by a transport.
pub struct Server {
    routes: HashMap<String, Arc<dyn ServiceHandler>>,
    compressors: CompressorRegistry,
    max_message_size: usize,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut paths: Vec<_> = self.routes.keys().collect();
        paths.sort();
        f.debug_struct("Server").field("routes", &paths).finish()
    }
}

impl Server {
    /// Starts building a server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            routes: HashMap::new(),
            compressors: CompressorRegistry::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Serves one stream to completion.
    pub async fn serve_stream(self: Arc<Self>, stream: StreamPair) {
        let StreamPair {
            sender,
            mut receiver,
        } = stream;
        let stream_id = sender.id();

        let metadata = match receiver.recv().await {
            Ok(Some(StreamFrame::Headers(md))) => md,
            Ok(Some(other)) => {
                warn!(stream_id, frame = ?other, "stream did not start with headers");
                sender.reset(ResetReason::ProtocolError);
                return;
            }
            Ok(None) | Err(_) => return,
        };

        let Some(path) = metadata.get(PATH_KEY).map(str::to_string) else {
            let _ = sender
                .send(StreamFrame::Trailers(Status::internal("missing :path header")))
                .await;
            return;
        };
        trace!(stream_id, path = %path, "serving stream");

        let Some(handler) = self.routes.get(&path).cloned() else {
            debug!(stream_id, path = %path, "unknown method");
            let _ = sender
                .send(StreamFrame::Trailers(Status::unimplemented(format!(
                    "unknown method {path}"
                ))))
                .await;
            return;
        };

        let encoding = metadata.get(ENCODING_KEY).map(str::to_string);
        let decompressor = match encoding.as_deref() {
            None => None,
            Some(name) => match self.compressors.get(name) {
                Some(c) => Some(c),
                None => {
                    let _ = sender
                        .send(StreamFrame::Trailers(Status::unimplemented(format!(
                            "unsupported encoding {name}"
                        ))))
                        .await;
                    return;
                }
            },
        };
        let compressor = self.compressors.for_send(encoding.as_deref());
        let deadline = metadata
            .get(TIMEOUT_KEY)
            .and_then(parse_timeout)
            .map(|t| Instant::now() + t);

        let call = ServerCall {
            path,
            metadata,
            deadline,
            sender: sender.clone(),
            receiver,
            decoder: FrameDecoder::new(self.max_message_size),
            inbound_done: false,
            decompressor,
            compressor,
            accept_encoding: self.compressors.accept_encoding(),
            headers_sent: false,
            max_message_size: self.max_message_size,
        };

        let status = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, handler.handle(call)).await {
                Ok(status) => status,
                Err(_) => Status::deadline_exceeded("server deadline exceeded"),
            },
            None => handler.handle(call).await,
        };
        if let Err(e) = sender.send(StreamFrame::Trailers(status)).await {
            trace!(stream_id, error = %e, "trailers not delivered");
        }
    }
}

/// Server-side view of one call.
pub struct ServerCall {
    path: String,
    metadata: Metadata,
    deadline: Option<Instant>,
    sender: Arc<dyn StreamSender>,
    receiver: Box<dyn StreamReceiver>,
    decoder: FrameDecoder,
    inbound_done: bool,
    decompressor: Option<Arc<dyn Compressor>>,
    compressor: Option<Arc<dyn Compressor>>,
    accept_encoding: String,
    headers_sent: bool,
    max_message_size: usize,
}

impl fmt::Debug for ServerCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCall")
            .field("path", &self.path)
            .field("stream_id", &self.sender.id())
            .finish()
    }
}

impl ServerCall {
    /// Method path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Request metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Deadline propagated by the client, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Next request message, `Ok(None)` once the client half-closed.
    ///
    /// A client reset surfaces as the matching status, usually `Cancelled`.
    pub async fn recv_message(&mut self) -> Result<Option<Bytes>, Status> {
        loop {
            if let Some(frame) = self.decoder.next_frame().map_err(Status::from)? {
                return decode_message(frame, self.decompressor.as_deref(), self.max_message_size)
                    .map(Some)
                    .map_err(Status::from);
            }
            if self.inbound_done {
                self.decoder.finish().map_err(Status::from)?;
                return Ok(None);
            }
            match self.receiver.recv().await {
                Ok(Some(StreamFrame::Data(chunk))) => self.decoder.push(&chunk),
                Ok(Some(StreamFrame::EndStream)) | Ok(None) => self.inbound_done = true,
                Ok(Some(other)) => {
                    return Err(Status::internal(format!("unexpected frame from client: {other:?}")))
                }
                Err(e) => return Err(Status::from(&e)),
            }
        }
    }

    /// Sends response headers. Later calls are no-ops.
    pub async fn send_headers(&mut self, mut metadata: Metadata) -> Result<(), Status> {
        if self.headers_sent {
            return Ok(());
        }
        self.headers_sent = true;
        if let Some(c) = &self.compressor {
            metadata.insert(ENCODING_KEY, c.name()).map_err(|e| Status::internal(e.to_string()))?;
        }
        metadata
            .insert(ACCEPT_ENCODING_KEY, &self.accept_encoding)
            .map_err(|e| Status::internal(e.to_string()))?;
        self.sender
            .send(StreamFrame::Headers(metadata))
            .await
            .map_err(|e| Status::from(&e))
    }

    /// Sends one response message, sending empty headers first if needed.
    pub async fn send_message(&mut self, message: Bytes) -> Result<(), Status> {
        if !self.headers_sent {
            self.send_headers(Metadata::new()).await?;
        }
        let wire = encode_message(message, self.compressor.as_deref(), self.max_message_size)
            .map_err(Status::from)?;
        self.sender
            .send(StreamFrame::Data(wire))
            .await
            .map_err(|e| Status::from(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::framing::MessageFrame;
    use crate::status::Code;
    use crate::transport::StreamId;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct RecordingSender {
        sent: Mutex<Vec<StreamFrame>>,
    }

    #[async_trait]
    impl StreamSender for RecordingSender {
        fn id(&self) -> StreamId {
            1
        }

        async fn send(&self, frame: StreamFrame) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        fn reset(&self, _reason: ResetReason) {}
    }

    struct ChannelReceiver(mpsc::UnboundedReceiver<StreamFrame>);

    #[async_trait]
    impl StreamReceiver for ChannelReceiver {
        async fn recv(&mut self) -> Result<Option<StreamFrame>, TransportError> {
            Ok(self.0.recv().await)
        }
    }

    fn echo_server() -> Arc<Server> {
        Server::builder()
            .route(
                "/echo.Echo/Say",
                service_fn(|mut call: ServerCall| async move {
                    while let Ok(Some(msg)) = call.recv_message().await {
                        if call.send_message(msg).await.is_err() {
                            break;
                        }
                    }
                    Status::ok()
                }),
            )
            .build()
    }

    async fn run(server: Arc<Server>, frames: Vec<StreamFrame>) -> Vec<StreamFrame> {
        let sender = Arc::new(RecordingSender {
            sent: Mutex::new(Vec::new()),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        for f in frames {
            tx.send(f).unwrap();
        }
        drop(tx);
        server
            .serve_stream(StreamPair {
                sender: sender.clone(),
                receiver: Box::new(ChannelReceiver(rx)),
            })
            .await;
        let sent = sender.sent.lock().unwrap().clone();
        sent
    }

    fn headers(path: &str) -> StreamFrame {
        let mut md = Metadata::new();
        md.insert(PATH_KEY, path).unwrap();
        StreamFrame::Headers(md)
    }

    #[tokio::test]
    async fn test_echo_stream() {
        let data = MessageFrame::new(Bytes::from_static(b"ping"), false).to_bytes();
        let sent = run(
            echo_server(),
            vec![headers("/echo.Echo/Say"), StreamFrame::Data(data.clone()), StreamFrame::EndStream],
        )
        .await;

        assert_eq!(sent.len(), 3);
        assert!(matches!(sent[0], StreamFrame::Headers(_)));
        assert_eq!(sent[1], StreamFrame::Data(data));
        match &sent[2] {
            StreamFrame::Trailers(status) => assert!(status.is_ok()),
            other => panic!("expected trailers, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let sent = run(echo_server(), vec![headers("/nope.Svc/Missing"), StreamFrame::EndStream]).await;
        match sent.as_slice() {
            [StreamFrame::Trailers(status)] => assert_eq!(status.code(), Code::Unimplemented),
            other => panic!("unexpected frames {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_encoding() {
        let mut md = Metadata::new();
        md.insert(PATH_KEY, "/echo.Echo/Say").unwrap();
        md.insert(ENCODING_KEY, "snappy").unwrap();
        let sent = run(echo_server(), vec![StreamFrame::Headers(md)]).await;
        match sent.as_slice() {
            [StreamFrame::Trailers(status)] => assert_eq!(status.code(), Code::Unimplemented),
            other => panic!("unexpected frames {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_truncated_request_is_internal() {
        let server = Server::builder()
            .route(
                "/t.T/Read",
                service_fn(|mut call: ServerCall| async move {
                    match call.recv_message().await {
                        Err(status) => status,
                        Ok(_) => Status::ok(),
                    }
                }),
            )
            .build();
        let sent = run(
            server,
            vec![
                headers("/t.T/Read"),
                StreamFrame::Data(Bytes::from_static(&[0, 0, 0, 0, 9, 1])),
                StreamFrame::EndStream,
            ],
        )
        .await;
        match sent.last() {
            Some(StreamFrame::Trailers(status)) => assert_eq!(status.code(), Code::Internal),
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

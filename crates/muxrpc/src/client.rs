//! Typed client on top of [`Channel`].
//!
//! [`Client`] pairs a channel with a [`Codec`] and exposes the four call
//! shapes with typed requests and responses. Failures of any kind surface as
//! a [`Status`].

use std::fmt;
use std::marker::PhantomData;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};

use crate::call::{CallOptions, CallReceiver, CallSender, MethodDescriptor};
use crate::channel::Channel;
use crate::codec::Codec;
use crate::error::RpcError;
use crate::metadata::Metadata;
use crate::status::Status;

fn encode<T, C: Codec<T>>(codec: &C, value: &T) -> Result<Bytes, Status> {
    codec.encode(value).map_err(|e| Status::from(RpcError::from(e)))
}

fn decode<T, C: Codec<T>>(codec: &C, bytes: &[u8]) -> Result<T, Status> {
    codec.decode(bytes).map_err(|e| Status::from(RpcError::from(e)))
}

/// A single response with its metadata.
#[derive(Debug, Clone)]
pub struct Response<T> {
    metadata: Metadata,
    message: T,
    trailers: Metadata,
}

impl<T> Response<T> {
    /// Response headers.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Trailing metadata sent with the OK status.
    pub fn trailers(&self) -> &Metadata {
        &self.trailers
    }

    /// The response message.
    pub fn get_ref(&self) -> &T {
        &self.message
    }

    /// Consumes the response, returning the message.
    pub fn into_inner(self) -> T {
        self.message
    }
}

/// Typed client.
#[derive(Clone)]
pub struct Client<C> {
    channel: Channel,
    codec: C,
}

impl<C> fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("target", &self.channel.target())
            .finish()
    }
}

impl<C: Clone + Send + Sync + 'static> Client<C> {
    /// Wraps a channel.
    pub fn new(channel: Channel, codec: C) -> Self {
        Self { channel, codec }
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// One request, one response.
    pub async fn unary<Req, Resp>(
        &self,
        path: &str,
        request: &Req,
        options: CallOptions,
    ) -> Result<Response<Resp>, Status>
    where
        C: Codec<Req> + Codec<Resp>,
    {
        let mut call = self
            .channel
            .make_call(&MethodDescriptor::unary(path), options)?;
        call.send_message(encode(&self.codec, request)?).await?;
        let metadata = call.response_headers().await.unwrap_or_default();
        let Some(bytes) = call.recv_message().await? else {
            return Err(Status::internal("response ended without a message"));
        };
        let message = decode(&self.codec, &bytes)?;
        let status = call.status().await;
        if !status.is_ok() {
            return Err(status);
        }
        Ok(Response {
            metadata,
            message,
            trailers: status.trailers().clone(),
        })
    }

    /// One request, a stream of responses.
    pub async fn server_streaming<Req, Resp>(
        &self,
        path: &str,
        request: &Req,
        options: CallOptions,
    ) -> Result<Streaming<Resp, C>, Status>
    where
        C: Codec<Req> + Codec<Resp>,
    {
        let call = self
            .channel
            .make_call(&MethodDescriptor::server_streaming(path), options)?;
        let (mut sender, receiver) = call.split();
        sender.send_message(encode(&self.codec, request)?).await?;
        Ok(Streaming::new(receiver, self.codec.clone()))
    }

    /// A stream of requests, one response.
    pub async fn client_streaming<Req, Resp, S>(
        &self,
        path: &str,
        requests: S,
        options: CallOptions,
    ) -> Result<Response<Resp>, Status>
    where
        C: Codec<Req> + Codec<Resp>,
        S: Stream<Item = Req> + Send,
    {
        let call = self
            .channel
            .make_call(&MethodDescriptor::client_streaming(path), options)?;
        let (mut sender, receiver) = call.split();
        let mut requests = std::pin::pin!(requests);
        while let Some(request) = requests.next().await {
            sender.send_message(encode(&self.codec, &request)?).await?;
        }
        sender.close_send().await?;

        let mut responses = Streaming::<Resp, C>::new(receiver, self.codec.clone());
        let metadata = responses.headers().await.unwrap_or_default();
        let Some(message) = responses.message().await? else {
            return Err(Status::internal("response ended without a message"));
        };
        let status = responses.status().await;
        if !status.is_ok() {
            return Err(status);
        }
        Ok(Response {
            metadata,
            message,
            trailers: status.trailers().clone(),
        })
    }

    /// Independent request and response streams.
    pub fn bidi_streaming<Req, Resp>(
        &self,
        path: &str,
        options: CallOptions,
    ) -> Result<(RequestSink<Req, C>, Streaming<Resp, C>), Status>
    where
        C: Codec<Req> + Codec<Resp>,
    {
        let call = self
            .channel
            .make_call(&MethodDescriptor::bidi_streaming(path), options)?;
        let (sender, receiver) = call.split();
        Ok((
            RequestSink {
                sender,
                codec: self.codec.clone(),
                _marker: PhantomData,
            },
            Streaming::new(receiver, self.codec.clone()),
        ))
    }
}

/// Typed sending half of a streaming call.
pub struct RequestSink<T, C> {
    sender: CallSender,
    codec: C,
    _marker: PhantomData<fn(T)>,
}

impl<T, C> fmt::Debug for RequestSink<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSink").field("sender", &self.sender).finish()
    }
}

impl<T, C: Codec<T>> RequestSink<T, C> {
    /// Sends one request.
    pub async fn send(&mut self, request: &T) -> Result<(), Status> {
        self.sender.send_message(encode(&self.codec, request)?).await
    }

    /// Half-closes the request stream.
    pub async fn close(&mut self) -> Result<(), Status> {
        self.sender.close_send().await
    }

    /// Cancels the whole call.
    pub fn cancel(&self) {
        self.sender.cancel();
    }
}

/// Typed stream of response messages.
pub struct Streaming<T, C> {
    receiver: CallReceiver,
    codec: C,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C> fmt::Debug for Streaming<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Streaming")
            .field("receiver", &self.receiver)
            .finish()
    }
}

impl<T, C: Codec<T>> Streaming<T, C> {
    fn new(receiver: CallReceiver, codec: C) -> Self {
        Self {
            receiver,
            codec,
            _marker: PhantomData,
        }
    }

    /// Next message, `Ok(None)` after an OK end of stream.
    pub async fn message(&mut self) -> Result<Option<T>, Status> {
        match self.receiver.recv_message().await? {
            Some(bytes) => decode(&self.codec, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Response headers, or `None` if the call ended without any.
    pub async fn headers(&mut self) -> Option<Metadata> {
        self.receiver.response_headers().await
    }

    /// Waits for the terminal status.
    pub async fn status(&self) -> Status {
        self.receiver.status().await
    }

    /// Cancels the call.
    pub fn cancel(&self) {
        self.receiver.cancel();
    }

    /// Adapts into a [`Stream`]. A non-OK status is yielded once as the last
    /// item.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, Status>> + Send
    where
        T: Send + 'static,
    {
        stream::unfold(Some(self), |state| async move {
            let mut this = state?;
            match this.message().await {
                Ok(Some(message)) => Some((Ok(message), Some(this))),
                Ok(None) => None,
                Err(status) => Some((Err(status), None)),
            }
        })
    }
}

//! Calls against a transport that replays a fixed response script.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use muxrpc::transport::{ResetReason, StreamPair, StreamReceiver, StreamSender};
use muxrpc::{
    CallOptions, Channel, Code, Connection, ConnectionDescriptor, Connector, Metadata,
    MethodDescriptor, Status, StreamFrame, TransportError,
};

#[derive(Clone)]
struct ScriptedConnector {
    script: Vec<StreamFrame>,
    resets: Arc<Mutex<Vec<ResetReason>>>,
}

impl ScriptedConnector {
    fn new(script: Vec<StreamFrame>) -> Self {
        Self {
            script,
            resets: Arc::default(),
        }
    }

    fn resets(&self) -> Vec<ResetReason> {
        self.resets.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _descriptor: &ConnectionDescriptor) -> Result<Arc<dyn Connection>, TransportError> {
        Ok(Arc::new(ScriptedConnection(self.clone())))
    }
}

struct ScriptedConnection(ScriptedConnector);

#[async_trait]
impl Connection for ScriptedConnection {
    async fn open_stream(&self) -> Result<StreamPair, TransportError> {
        Ok(StreamPair {
            sender: Arc::new(ScriptedSender {
                resets: self.0.resets.clone(),
            }),
            receiver: Box::new(ScriptedReceiver {
                frames: self.0.script.iter().cloned().collect(),
            }),
        })
    }

    async fn ping(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn closed(&self) -> TransportError {
        std::future::pending().await
    }

    fn close(&self) {}
}

struct ScriptedSender {
    resets: Arc<Mutex<Vec<ResetReason>>>,
}

#[async_trait]
impl StreamSender for ScriptedSender {
    fn id(&self) -> u64 {
        1
    }

    async fn send(&self, _frame: StreamFrame) -> Result<(), TransportError> {
        Ok(())
    }

    fn reset(&self, reason: ResetReason) {
        self.resets.lock().unwrap().push(reason);
    }
}

struct ScriptedReceiver {
    frames: VecDeque<StreamFrame>,
}

#[async_trait]
impl StreamReceiver for ScriptedReceiver {
    async fn recv(&mut self) -> Result<Option<StreamFrame>, TransportError> {
        Ok(self.frames.pop_front())
    }
}

fn channel(connector: &ScriptedConnector) -> Channel {
    Channel::builder("scripted://responses", connector.clone())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_response_cut_inside_frame_is_internal() {
    let connector = ScriptedConnector::new(vec![
        StreamFrame::Headers(Metadata::new()),
        StreamFrame::Data(Bytes::from_static(&[0, 0, 0, 0, 10, b'a', b'b'])),
        StreamFrame::Trailers(Status::ok()),
    ]);
    let channel = channel(&connector);
    let mut call = channel
        .make_call(&MethodDescriptor::server_streaming("/test.Echo/Count"), CallOptions::new())
        .unwrap();
    // The script may finish before the request is written.
    let _ = call.send_message(Bytes::from_static(&[1])).await;

    assert_eq!(call.recv_message().await.unwrap_err().code(), Code::Internal);
    let status = call.status().await;
    assert_eq!(status.code(), Code::Internal);
    assert!(status.message().contains("left over"), "{}", status.message());
    assert_eq!(connector.resets(), vec![ResetReason::ProtocolError]);
}

#[tokio::test]
async fn test_response_ending_on_frame_boundary_is_ok() {
    let connector = ScriptedConnector::new(vec![
        StreamFrame::Headers(Metadata::new()),
        StreamFrame::Data(Bytes::from_static(&[0, 0, 0, 0, 2, b'a', b'b'])),
        StreamFrame::EndStream,
        StreamFrame::Trailers(Status::ok()),
    ]);
    let channel = channel(&connector);
    let mut call = channel
        .make_call(&MethodDescriptor::server_streaming("/test.Echo/Count"), CallOptions::new())
        .unwrap();
    let _ = call.send_message(Bytes::from_static(&[1])).await;

    assert_eq!(call.recv_message().await.unwrap(), Some(Bytes::from_static(b"ab")));
    assert_eq!(call.recv_message().await.unwrap(), None);
    assert_eq!(call.status().await.code(), Code::Ok);
    assert!(connector.resets().is_empty());
}

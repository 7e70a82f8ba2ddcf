//! End-to-end call scenarios over the in-memory transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use muxrpc::backoff::{BackoffConfig, JitterMode};
use muxrpc::interceptor::{CallContext, Interceptor, StatsInterceptor};
use muxrpc::metadata::{Metadata, ENCODING_KEY};
use muxrpc::retry::{CallPolicy, HedgingPolicy, RetryPolicy, PREVIOUS_ATTEMPTS_KEY, PUSHBACK_KEY};
use muxrpc::{
    service_fn, CallOptions, CallPhase, CallStats, Channel, ChannelConfig, Code, ConnectivityState,
    KeepaliveConfig, MemoryConnector, MethodDescriptor, RpcError, Server, ServerCall, Status,
};
use tokio::time::Instant;

const ECHO: &str = "/test.Echo/Say";
const CHAT: &str = "/test.Echo/Chat";
const FLAKY: &str = "/test.Echo/Flaky";
const STOP: &str = "/test.Echo/Stop";
const HANG: &str = "/test.Echo/Hang";
const HEDGE: &str = "/test.Echo/Hedge";
const COUNT: &str = "/test.Echo/Count";
const ORDER: &str = "/test.Echo/Order";
const DEADLINE: &str = "/test.Echo/Deadline";
const STALL: &str = "/test.Echo/Stall";

#[derive(Clone, Default)]
struct Recorder {
    hits: Arc<AtomicUsize>,
    order: Arc<Mutex<Vec<u8>>>,
}

async fn echo_all(mut call: ServerCall) -> Status {
    loop {
        match call.recv_message().await {
            Ok(Some(message)) => {
                if let Err(status) = call.send_message(message).await {
                    return status;
                }
            }
            Ok(None) => return Status::ok(),
            Err(status) => return status,
        }
    }
}

fn previous_attempts(call: &ServerCall) -> u32 {
    call.metadata()
        .get(PREVIOUS_ATTEMPTS_KEY)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn server(recorder: &Recorder) -> Arc<Server> {
    let flaky_hits = recorder.hits.clone();
    let order = recorder.order.clone();
    Server::builder()
        .route(ECHO, service_fn(echo_all))
        .route(CHAT, service_fn(echo_all))
        .route(
            FLAKY,
            service_fn(move |call: ServerCall| {
                let hits = flaky_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    if previous_attempts(&call) < 2 {
                        return Status::unavailable("warming up");
                    }
                    echo_all(call).await
                }
            }),
        )
        .route(
            STOP,
            service_fn(|_call: ServerCall| async move {
                let mut trailers = Metadata::new();
                trailers.insert(PUSHBACK_KEY, "-1").unwrap();
                Status::unavailable("overloaded").with_trailers(trailers)
            }),
        )
        .route(
            HANG,
            service_fn(|mut call: ServerCall| async move {
                let _ = call.recv_message().await;
                std::future::pending::<Status>().await
            }),
        )
        .route(
            HEDGE,
            service_fn(|mut call: ServerCall| async move {
                if previous_attempts(&call) == 0 {
                    let _ = call.recv_message().await;
                    return std::future::pending::<Status>().await;
                }
                echo_all(call).await
            }),
        )
        .route(
            STALL,
            service_fn(|call: ServerCall| async move {
                if previous_attempts(&call) == 0 {
                    return std::future::pending::<Status>().await;
                }
                echo_all(call).await
            }),
        )
        .route(
            COUNT,
            service_fn(|mut call: ServerCall| async move {
                let n = match call.recv_message().await {
                    Ok(Some(m)) if m.len() == 1 => m[0],
                    _ => return Status::invalid_argument("expected one count byte"),
                };
                for i in 0..n {
                    if let Err(status) = call.send_message(Bytes::from(vec![i])).await {
                        return status;
                    }
                }
                Status::ok()
            }),
        )
        .route(
            ORDER,
            service_fn(move |mut call: ServerCall| {
                let order = order.clone();
                async move {
                    let Ok(Some(m)) = call.recv_message().await else {
                        return Status::invalid_argument("missing request");
                    };
                    order.lock().unwrap().push(m[0]);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    match call.send_message(m).await {
                        Ok(()) => Status::ok(),
                        Err(status) => status,
                    }
                }
            }),
        )
        .route(
            DEADLINE,
            service_fn(|mut call: ServerCall| async move {
                let _ = call.recv_message().await;
                let reply: &'static [u8] = if call.deadline().is_some() { b"bounded" } else { b"unbounded" };
                match call.send_message(Bytes::from_static(reply)).await {
                    Ok(()) => Status::ok(),
                    Err(status) => status,
                }
            }),
        )
        .build()
}

fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        initial_backoff_ms: 100,
        max_backoff_ms: 1_000,
        multiplier: 2.0,
        jitter: 0.0,
        jitter_mode: JitterMode::None,
        seed: Some(3),
    }
}

fn base_config() -> ChannelConfig {
    ChannelConfig {
        reconnect_backoff: fast_backoff(),
        ..ChannelConfig::default()
    }
}

struct Harness {
    channel: Channel,
    connector: MemoryConnector,
    recorder: Recorder,
}

fn harness(config: ChannelConfig) -> Harness {
    harness_with(config, Vec::new())
}

fn harness_with(config: ChannelConfig, interceptors: Vec<Arc<dyn Interceptor>>) -> Harness {
    let recorder = Recorder::default();
    let connector = MemoryConnector::new(server(&recorder));
    let mut builder = Channel::builder("mem://scenarios", connector.clone()).config(config);
    for interceptor in interceptors {
        builder = builder.shared_interceptor(interceptor);
    }
    Harness {
        channel: builder.build().unwrap(),
        connector,
        recorder,
    }
}

async fn unary(channel: &Channel, path: &str, payload: &[u8], options: CallOptions) -> Result<Bytes, Status> {
    let mut call = channel
        .make_call(&MethodDescriptor::unary(path), options)
        .map_err(Status::from)?;
    call.send_message(Bytes::copy_from_slice(payload)).await?;
    let reply = call.recv_message().await?;
    let status = call.status().await;
    if !status.is_ok() {
        return Err(status);
    }
    reply.ok_or_else(|| Status::internal("no reply"))
}

#[derive(Default)]
struct AttemptLog {
    attempts: Mutex<Vec<(u32, Code)>>,
}

impl Interceptor for AttemptLog {
    fn on_attempt_complete(&self, _ctx: &CallContext, attempt: u32, status: &Status) {
        self.attempts.lock().unwrap().push((attempt, status.code()));
    }
}

struct Deny;

impl Interceptor for Deny {
    fn on_start(&self, _ctx: &CallContext, _metadata: &mut Metadata) -> Result<(), Status> {
        Err(Status::new(Code::PermissionDenied, "denied by policy"))
    }
}

#[tokio::test]
async fn test_queued_call_dispatches_once_ready() {
    let h = harness(base_config());
    h.connector.hold_connects();

    let mut call = h
        .channel
        .make_call(&MethodDescriptor::unary(ECHO), CallOptions::new())
        .unwrap();
    assert_eq!(h.channel.queued_calls(), 1);
    assert_eq!(h.channel.connectivity_state(), ConnectivityState::Connecting);
    assert_eq!(call.phase(), CallPhase::Queued);

    let task = tokio::spawn(async move {
        call.send_message(Bytes::from_static(b"hello")).await?;
        let reply = call.recv_message().await?;
        let status = call.status().await;
        if status.is_ok() {
            Ok(reply)
        } else {
            Err(status)
        }
    });
    h.connector.release_connects();
    let reply = task.await.unwrap().unwrap();
    assert_eq!(reply, Some(Bytes::from_static(b"hello")));
    assert_eq!(h.channel.connectivity_state(), ConnectivityState::Ready);
    assert_eq!(h.channel.queued_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retries_until_success() {
    let mut config = base_config();
    config.method_policies.insert(
        FLAKY.to_string(),
        CallPolicy::Retry(RetryPolicy {
            max_attempts: 3,
            backoff: BackoffConfig {
                initial_backoff_ms: 10,
                max_backoff_ms: 100,
                multiplier: 2.0,
                jitter: 0.0,
                jitter_mode: JitterMode::None,
                seed: Some(1),
            },
            retryable_codes: vec![Code::Unavailable],
            replay_sent_messages: true,
        }),
    );
    let log = Arc::new(AttemptLog::default());
    let h = harness_with(config, vec![log.clone()]);

    let reply = unary(&h.channel, FLAKY, b"retry me", CallOptions::new()).await.unwrap();
    assert_eq!(reply, Bytes::from_static(b"retry me"));
    assert_eq!(h.connector.streams_opened(), 3);
    assert_eq!(h.recorder.hits.load(Ordering::SeqCst), 3);
    assert_eq!(
        *log.attempts.lock().unwrap(),
        vec![(1, Code::Unavailable), (2, Code::Unavailable), (3, Code::Ok)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_report_last_status() {
    let mut config = base_config();
    config.default_policy = CallPolicy::Retry(RetryPolicy {
        max_attempts: 2,
        backoff: fast_backoff(),
        ..RetryPolicy::default()
    });
    let h = harness(config);
    let err = unary(&h.channel, FLAKY, b"x", CallOptions::new()).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(err.message(), "warming up");
    assert_eq!(h.connector.streams_opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_pushback_stops_retries() {
    let mut config = base_config();
    config.default_policy = CallPolicy::Retry(RetryPolicy::default());
    let h = harness(config);
    let err = unary(&h.channel, STOP, b"x", CallOptions::new()).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(h.connector.streams_opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_status_is_returned_verbatim() {
    let mut config = base_config();
    config.default_policy = CallPolicy::Retry(RetryPolicy::default());
    let h = harness(config);
    let mut call = h
        .channel
        .make_call(&MethodDescriptor::server_streaming(COUNT), CallOptions::new())
        .unwrap();
    call.send_message(Bytes::from_static(b"too long")).await.unwrap();
    let status = call.status().await;
    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(status.message(), "expected one count byte");
    assert_eq!(h.connector.streams_opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_expires_and_resets_stream() {
    let h = harness(base_config());
    let start = Instant::now();
    let err = unary(
        &h.channel,
        HANG,
        b"anyone?",
        CallOptions::new().with_timeout(Duration::from_millis(100)),
    )
    .await
    .unwrap_err();
    let elapsed = start.elapsed();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(150), "{elapsed:?}");

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(h.connector.client_resets() >= 1);
    assert_eq!(h.channel.active_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_while_queued() {
    let h = harness(base_config());
    h.connector.hold_connects();
    let mut call = h
        .channel
        .make_call(
            &MethodDescriptor::unary(ECHO),
            CallOptions::new().with_timeout(Duration::from_millis(100)),
        )
        .unwrap();
    assert_eq!(h.channel.queued_calls(), 1);
    let err = call.send_message(Bytes::from_static(b"late")).await.unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(h.channel.queued_calls(), 0);
    assert_eq!(h.connector.streams_opened(), 0);
}

#[tokio::test]
async fn test_timeout_is_propagated_to_server() {
    let mut config = base_config();
    config.default_deadline_ms = Some(5_000);
    let h = harness(config);
    let reply = unary(&h.channel, DEADLINE, b"?", CallOptions::new()).await.unwrap();
    assert_eq!(reply, Bytes::from_static(b"bounded"));

    let h = harness(base_config());
    let reply = unary(&h.channel, DEADLINE, b"?", CallOptions::new()).await.unwrap();
    assert_eq!(reply, Bytes::from_static(b"unbounded"));
}

#[tokio::test]
async fn test_bidi_cancel_stops_delivery() {
    let h = harness(base_config());
    let mut call = h
        .channel
        .make_call(&MethodDescriptor::bidi_streaming(CHAT), CallOptions::new())
        .unwrap();
    call.send_message(Bytes::from_static(b"one")).await.unwrap();
    assert_eq!(call.recv_message().await.unwrap(), Some(Bytes::from_static(b"one")));
    call.send_message(Bytes::from_static(b"two")).await.unwrap();

    call.cancel();
    assert_eq!(call.recv_message().await.unwrap_err().code(), Code::Cancelled);
    assert_eq!(call.recv_message().await.unwrap_err().code(), Code::Cancelled);
    assert_eq!(call.status().await.code(), Code::Cancelled);
    assert_eq!(
        call.send_message(Bytes::from_static(b"three")).await.unwrap_err().code(),
        Code::Cancelled
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.connector.client_resets(), 1);
    assert_eq!(h.channel.active_calls(), 0);
}

#[tokio::test]
async fn test_close_fails_queued_and_in_flight_calls() {
    let h = harness(base_config());
    let mut live = h
        .channel
        .make_call(&MethodDescriptor::bidi_streaming(CHAT), CallOptions::new())
        .unwrap();
    live.send_message(Bytes::from_static(b"ping")).await.unwrap();
    assert!(live.recv_message().await.unwrap().is_some());

    h.channel.close();
    let status = live.status().await;
    assert_eq!(status.code(), Code::Unavailable);

    let err = h
        .channel
        .make_call(&MethodDescriptor::unary(ECHO), CallOptions::new())
        .unwrap_err();
    assert!(matches!(err, RpcError::ChannelShutdown));
    assert_eq!(h.channel.connectivity_state(), ConnectivityState::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn test_close_interrupts_retry_backoff() {
    let mut config = base_config();
    config.method_policies.insert(
        FLAKY.to_string(),
        CallPolicy::Retry(RetryPolicy {
            max_attempts: 3,
            backoff: BackoffConfig {
                initial_backoff_ms: 10_000,
                max_backoff_ms: 60_000,
                ..fast_backoff()
            },
            retryable_codes: vec![Code::Unavailable],
            replay_sent_messages: true,
        }),
    );
    let h = harness(config);
    let mut call = h
        .channel
        .make_call(&MethodDescriptor::unary(FLAKY), CallOptions::new())
        .unwrap();
    call.send_message(Bytes::from_static(b"x")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.connector.streams_opened(), 1);

    let start = Instant::now();
    h.channel.close();
    let status = tokio::time::timeout(Duration::from_secs(1), call.status())
        .await
        .unwrap();
    assert_eq!(status.code(), Code::Unavailable);
    assert_eq!(status.message(), "warming up");
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(h.connector.streams_opened(), 1);
}

#[tokio::test]
async fn test_close_fails_queued_calls() {
    let h = harness(base_config());
    h.connector.hold_connects();
    let queued = h
        .channel
        .make_call(&MethodDescriptor::unary(ECHO), CallOptions::new())
        .unwrap();
    h.channel.close();
    let status = queued.status().await;
    assert_eq!(status.code(), Code::Unavailable);
    assert_eq!(status.message(), "channel is shut down");
    assert_eq!(h.connector.streams_opened(), 0);
}

#[tokio::test]
async fn test_queue_overflow_is_resource_exhausted() {
    let mut config = base_config();
    config.max_queue_depth = Some(2);
    let h = harness(config);
    h.connector.hold_connects();
    let _a = h.channel.make_call(&MethodDescriptor::unary(ECHO), CallOptions::new()).unwrap();
    let _b = h.channel.make_call(&MethodDescriptor::unary(ECHO), CallOptions::new()).unwrap();
    let err = h
        .channel
        .make_call(&MethodDescriptor::unary(ECHO), CallOptions::new())
        .unwrap_err();
    assert!(matches!(err, RpcError::ResourceExhausted { depth: 2 }));
    assert_eq!(Status::from(err).code(), Code::ResourceExhausted);
}

#[tokio::test(start_paused = true)]
async fn test_hedged_attempt_wins() {
    let mut config = base_config();
    config.method_policies.insert(
        HEDGE.to_string(),
        CallPolicy::Hedging(HedgingPolicy {
            max_attempts: 3,
            hedging_delay_ms: 50,
            non_fatal_codes: vec![Code::Unavailable],
        }),
    );
    let h = harness(config);
    let start = Instant::now();
    let reply = unary(&h.channel, HEDGE, b"race", CallOptions::new()).await.unwrap();
    assert_eq!(reply, Bytes::from_static(b"race"));
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(h.connector.streams_opened(), 2);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.connector.client_resets(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hedge_streams_past_attempt_without_credit() {
    let mut config = base_config();
    config.method_policies.insert(
        STALL.to_string(),
        CallPolicy::Hedging(HedgingPolicy {
            max_attempts: 2,
            hedging_delay_ms: 50,
            non_fatal_codes: vec![Code::Unavailable],
        }),
    );
    let h = harness(config);
    h.connector.set_stream_window(8);
    let mut call = h
        .channel
        .make_call(
            &MethodDescriptor::bidi_streaming(STALL),
            CallOptions::new().with_timeout(Duration::from_secs(2)),
        )
        .unwrap();

    call.send_message(Bytes::from_static(b"aaaa")).await.unwrap();
    call.send_message(Bytes::from_static(b"bbbb")).await.unwrap();
    call.close_send().await.unwrap();
    assert_eq!(call.recv_message().await.unwrap(), Some(Bytes::from_static(b"aaaa")));
    assert_eq!(call.recv_message().await.unwrap(), Some(Bytes::from_static(b"bbbb")));
    assert_eq!(call.recv_message().await.unwrap(), None);
    assert_eq!(call.status().await.code(), Code::Ok);
    assert_eq!(h.connector.streams_opened(), 2);
    assert_eq!(h.connector.client_resets(), 1);
}

#[tokio::test]
async fn test_interceptor_short_circuit_skips_transport() {
    let stats = Arc::new(CallStats::new());
    let h = harness_with(
        base_config(),
        vec![Arc::new(Deny), Arc::new(StatsInterceptor::new(stats.clone()))],
    );
    let mut call = h
        .channel
        .make_call(&MethodDescriptor::unary(ECHO), CallOptions::new())
        .unwrap();
    assert_eq!(call.status().await.code(), Code::PermissionDenied);
    assert_eq!(
        call.send_message(Bytes::new()).await.unwrap_err().code(),
        Code::PermissionDenied
    );
    assert_eq!(h.connector.connects(), 0);
    assert_eq!(h.channel.connectivity_state(), ConnectivityState::Idle);
    assert_eq!(stats.snapshot().count(Code::PermissionDenied), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_fails_calls_and_reconnects() {
    let h = harness(base_config());
    let mut call = h
        .channel
        .make_call(&MethodDescriptor::bidi_streaming(CHAT), CallOptions::new())
        .unwrap();
    call.send_message(Bytes::from_static(b"a")).await.unwrap();
    assert!(call.recv_message().await.unwrap().is_some());

    assert!(h.connector.drop_connection());
    assert_eq!(call.recv_message().await.unwrap_err().code(), Code::Unavailable);
    assert_eq!(
        h.channel.wait_for_state(ConnectivityState::TransientFailure).await,
        ConnectivityState::TransientFailure
    );
    assert_eq!(
        h.channel.wait_for_state(ConnectivityState::Ready).await,
        ConnectivityState::Ready
    );

    let reply = unary(&h.channel, ECHO, b"again", CallOptions::new()).await.unwrap();
    assert_eq!(reply, Bytes::from_static(b"again"));
    assert_eq!(h.connector.connects(), 2);
}

#[tokio::test]
async fn test_concurrency_limit_dispatches_in_fifo_order() {
    let mut config = base_config();
    config.max_concurrent_calls = Some(1);
    let h = harness(config);
    h.connector.hold_connects();

    let mut tasks = Vec::new();
    for i in 0..4u8 {
        let mut call = h
            .channel
            .make_call(&MethodDescriptor::unary(ORDER), CallOptions::new())
            .unwrap();
        tasks.push(tokio::spawn(async move {
            call.send_message(Bytes::from(vec![i])).await?;
            let reply = call.recv_message().await?;
            let status = call.status().await;
            if status.is_ok() {
                Ok(reply)
            } else {
                Err(status)
            }
        }));
    }
    assert_eq!(h.channel.queued_calls(), 4);
    h.connector.release_connects();

    for (i, task) in tasks.into_iter().enumerate() {
        let reply = task.await.unwrap().unwrap();
        assert_eq!(reply, Some(Bytes::from(vec![i as u8])));
    }
    assert_eq!(*h.recorder.order.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_server_streaming_delivers_in_order() {
    let h = harness(base_config());
    let mut call = h
        .channel
        .make_call(&MethodDescriptor::server_streaming(COUNT), CallOptions::new())
        .unwrap();
    call.send_message(Bytes::from_static(&[5])).await.unwrap();
    let mut seen = Vec::new();
    while let Some(m) = call.recv_message().await.unwrap() {
        seen.push(m[0]);
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    assert!(call.status().await.is_ok());
    assert!(call.response_headers().await.is_some());
}

#[tokio::test]
async fn test_lz4_compressed_round_trip() {
    let mut config = base_config();
    config.send_compression = Some("lz4".to_string());
    let h = harness(config);
    let payload = b"compressible ".repeat(500);

    let mut call = h
        .channel
        .make_call(&MethodDescriptor::unary(ECHO), CallOptions::new())
        .unwrap();
    call.send_message(Bytes::from(payload.clone())).await.unwrap();
    let headers = call.response_headers().await.unwrap();
    assert_eq!(headers.get(ENCODING_KEY), Some("lz4"));
    assert_eq!(call.recv_message().await.unwrap(), Some(Bytes::from(payload)));
    assert!(call.status().await.is_ok());
}

#[tokio::test]
async fn test_small_flow_control_window() {
    let h = harness(base_config());
    h.connector.set_stream_window(64);
    let mut call = h
        .channel
        .make_call(&MethodDescriptor::bidi_streaming(CHAT), CallOptions::new())
        .unwrap();
    for i in 0..20u8 {
        let message = Bytes::from(vec![i; 300]);
        call.send_message(message.clone()).await.unwrap();
        assert_eq!(call.recv_message().await.unwrap(), Some(message));
    }
    call.close_send().await.unwrap();
    assert_eq!(call.recv_message().await.unwrap(), None);
    assert!(call.status().await.is_ok());
}

#[tokio::test]
async fn test_oversized_message_is_rejected() {
    let mut config = base_config();
    config.max_message_size = 1024;
    let h = harness(config);
    let mut call = h
        .channel
        .make_call(&MethodDescriptor::unary(ECHO), CallOptions::new())
        .unwrap();
    let err = call
        .send_message(Bytes::from(vec![0u8; 4096]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);
    assert_eq!(call.status().await.code(), Code::ResourceExhausted);
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_failure_fails_in_flight_calls() {
    let mut config = base_config();
    config.keepalive = KeepaliveConfig {
        enabled: true,
        interval_ms: 1_000,
        timeout_ms: 200,
    };
    let h = harness(config);
    let mut call = h
        .channel
        .make_call(&MethodDescriptor::bidi_streaming(CHAT), CallOptions::new())
        .unwrap();
    call.send_message(Bytes::from_static(b"hi")).await.unwrap();
    assert!(call.recv_message().await.unwrap().is_some());

    h.connector.drop_pings(true);
    let start = Instant::now();
    assert_eq!(call.recv_message().await.unwrap_err().code(), Code::Unavailable);
    assert!(start.elapsed() <= Duration::from_millis(1_200));
    assert_ne!(h.channel.connectivity_state(), ConnectivityState::Ready);
}

#[tokio::test]
async fn test_stats_aggregate_across_calls() {
    let stats = Arc::new(CallStats::new());
    let h = harness_with(base_config(), vec![Arc::new(StatsInterceptor::new(stats.clone()))]);
    for _ in 0..3 {
        unary(&h.channel, ECHO, b"x", CallOptions::new()).await.unwrap();
    }
    let err = unary(&h.channel, "/test.Echo/Missing", b"x", CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.calls, 4);
    assert_eq!(snapshot.count(Code::Ok), 3);
    assert_eq!(snapshot.count(Code::Unimplemented), 1);
    assert!(snapshot.latency_mean.is_some());
}

#![warn(missing_docs)]

//! `muxrpc-echo`: drives echo calls through a channel over the in-memory
//! transport and prints the resulting call statistics.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use futures::stream::{self, StreamExt};
use muxrpc::{
    service_fn, CallOptions, CallStats, Channel, ChannelConfig, LoggingInterceptor, MemoryConnector,
    MethodDescriptor, Server, ServerCall, StatsInterceptor, Status,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const ECHO_PATH: &str = "/echo.Echo/Say";

#[derive(Parser)]
#[command(name = "muxrpc-echo")]
#[command(about = "Run echo calls over an in-process muxrpc channel", long_about = None)]
struct Cli {
    /// Channel configuration file (.toml or .json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of calls to make.
    #[arg(short = 'n', long, default_value = "100")]
    calls: usize,

    /// Calls in flight at once.
    #[arg(short = 'j', long, default_value = "8")]
    concurrency: usize,

    /// Payload size in bytes.
    #[arg(short, long, default_value = "64")]
    payload: usize,
}

fn echo_server() -> Arc<Server> {
    Server::builder()
        .route(
            ECHO_PATH,
            service_fn(|mut call: ServerCall| async move {
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
            }),
        )
        .build()
}

async fn echo(channel: &Channel, payload: Bytes) -> Result<(), Status> {
    let mut call = channel.make_call(&MethodDescriptor::unary(ECHO_PATH), CallOptions::new())?;
    call.send_message(payload.clone()).await?;
    match call.recv_message().await? {
        Some(reply) if reply == payload => {}
        Some(_) => return Err(Status::internal("echo mismatch")),
        None => return Err(Status::internal("no echo")),
    }
    let status = call.status().await;
    if status.is_ok() {
        Ok(())
    } else {
        Err(status)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ChannelConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ChannelConfig::default(),
    };

    let stats = Arc::new(CallStats::new());
    let channel = Channel::builder("mem://echo", MemoryConnector::new(echo_server()))
        .config(config)
        .interceptor(LoggingInterceptor)
        .interceptor(StatsInterceptor::new(stats.clone()))
        .build()?;
    tracing::info!(calls = cli.calls, concurrency = cli.concurrency, "starting echo run");

    let payload = Bytes::from(vec![0x5a; cli.payload]);
    let failures = stream::iter(0..cli.calls)
        .map(|_| echo(&channel, payload.clone()))
        .buffer_unordered(cli.concurrency.max(1))
        .filter(|res| std::future::ready(res.is_err()))
        .count()
        .await;
    channel.close();

    let snapshot = stats.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    if failures > 0 {
        anyhow::bail!("{failures} of {} calls failed", cli.calls);
    }
    Ok(())
}

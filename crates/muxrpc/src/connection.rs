//! Connection manager task.
//!
//! One task per channel drives the connectivity state machine: it connects,
//! supervises the live connection (including keepalive pings), and after a
//! failure sleeps for the reconnect backoff before trying again. The task
//! holds only a weak reference to the channel and exits once the channel is
//! closed or dropped.

use std::sync::{Arc, Weak};

use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::backoff::Backoff;
use crate::channel::ChannelInner;
use crate::config::KeepaliveConfig;
use crate::error::TransportError;
use crate::transport::{Connection, ConnectionDescriptor, Connector};

/// Spawns the manager for `channel`. Called on the first `idle -> connecting`
/// transition.
pub(crate) fn spawn_manager(channel: &Arc<ChannelInner>) {
    let manager = ConnectionManager {
        channel: Arc::downgrade(channel),
        connector: channel.connector.clone(),
        descriptor: channel.descriptor.clone(),
        backoff: Backoff::new(channel.config.reconnect_backoff.clone()),
        connect_timeout: channel.config.connect_timeout(),
        shutdown: channel.shutdown.clone(),
    };
    tokio::spawn(manager.run());
}

struct ConnectionManager {
    channel: Weak<ChannelInner>,
    connector: Arc<dyn Connector>,
    descriptor: ConnectionDescriptor,
    backoff: Backoff,
    connect_timeout: std::time::Duration,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    async fn run(mut self) {
        loop {
            let connected = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                res = timeout(self.connect_timeout, self.connector.connect(&self.descriptor)) => {
                    res.unwrap_or_else(|_| {
                        Err(TransportError::ConnectTimeout {
                            target: self.descriptor.target.clone(),
                            timeout_ms: self.connect_timeout.as_millis() as u64,
                        })
                    })
                }
            };

            match connected {
                Ok(conn) => {
                    let Some(channel) = self.channel.upgrade() else {
                        conn.close();
                        return;
                    };
                    if !channel.on_connected(conn.clone()) {
                        conn.close();
                        return;
                    }
                    drop(channel);
                    self.backoff.reset();

                    let Some(err) = supervise(&conn, &self.descriptor.keepalive, &self.shutdown).await else {
                        conn.close();
                        return;
                    };
                    warn!(peer = %self.descriptor.target, error = %err, "connection lost");
                    conn.close();
                    match self.channel.upgrade() {
                        Some(channel) if channel.on_connection_lost() => {}
                        _ => return,
                    }
                }
                Err(err) => {
                    warn!(peer = %self.descriptor.target, error = %err, "connect failed");
                    match self.channel.upgrade() {
                        Some(channel) if channel.on_connect_failed() => {}
                        _ => return,
                    }
                }
            }

            let delay = self.backoff.next_delay();
            debug!(
                peer = %self.descriptor.target,
                attempt = self.backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "reconnect scheduled"
            );
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.channel.upgrade() {
                Some(channel) if channel.on_backoff_elapsed() => {}
                _ => return,
            }
        }
    }
}

/// Watches a live connection. Returns the reason it was lost, or `None` when
/// the channel shut down.
async fn supervise(
    conn: &Arc<dyn Connection>,
    keepalive: &KeepaliveConfig,
    shutdown: &CancellationToken,
) -> Option<TransportError> {
    let mut ticker = keepalive.enabled.then(|| {
        let mut ticker = interval_at(Instant::now() + keepalive.interval(), keepalive.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let tick = async {
            match ticker.as_mut() {
                Some(ticker) => {
                    ticker.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return None,
            err = conn.closed() => return Some(err),
            _ = tick => {
                match timeout(keepalive.timeout(), conn.ping()).await {
                    Ok(Ok(())) => trace!("keepalive ping acknowledged"),
                    Ok(Err(err)) => return Some(err),
                    Err(_) => {
                        return Some(TransportError::ConnectionLost {
                            reason: "keepalive timeout".to_string(),
                        })
                    }
                }
            }
        }
    }
}

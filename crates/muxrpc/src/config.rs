//! Channel configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;
use crate::framing::DEFAULT_MAX_MESSAGE_SIZE;
use crate::retry::{CallPolicy, RetryThrottleConfig};

/// Keepalive ping settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Whether pings are sent at all.
    pub enabled: bool,
    /// Interval between pings, in milliseconds.
    pub interval_ms: u64,
    /// How long to wait for a ping to complete, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 30_000,
            timeout_ms: 20_000,
        }
    }
}

impl KeepaliveConfig {
    /// Ping interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// Ping timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Transport security settings. Passed through to the connector untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Whether the connector should negotiate TLS.
    pub tls: bool,
    /// Expected server name, if different from the target host.
    pub server_name: Option<String>,
    /// Path to a PEM bundle of trusted roots.
    pub ca_cert: Option<String>,
}

/// Configuration for a [`Channel`](crate::channel::Channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Time allowed for connect plus handshake.
    pub connect_timeout_ms: u64,
    /// Idle timeout handed to the transport.
    pub idle_timeout_ms: u64,
    /// Keepalive settings.
    pub keepalive: KeepaliveConfig,
    /// Security settings.
    pub security: SecurityConfig,
    /// Limit on concurrently open calls; further calls queue.
    pub max_concurrent_calls: Option<usize>,
    /// Limit on queued calls; beyond it new calls fail with `ResourceExhausted`.
    pub max_queue_depth: Option<usize>,
    /// Deadline applied to calls that do not set one.
    pub default_deadline_ms: Option<u64>,
    /// Backoff between reconnect attempts.
    pub reconnect_backoff: BackoffConfig,
    /// Policy for methods without an entry in `method_policies`.
    pub default_policy: CallPolicy,
    /// Per-method policies keyed by full method path.
    pub method_policies: HashMap<String, CallPolicy>,
    /// Channel-wide retry throttle.
    pub retry_throttle: Option<RetryThrottleConfig>,
    /// Bytes of sent messages kept per call for replay on retry.
    pub retry_buffer_size: usize,
    /// Largest message accepted or sent, in bytes.
    pub max_message_size: usize,
    /// Encoding used for outbound messages (`identity`, `lz4`).
    pub send_compression: Option<String>,
    /// Inbound messages buffered per call ahead of the application.
    pub inbound_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 20_000,
            idle_timeout_ms: 30 * 60 * 1000,
            keepalive: KeepaliveConfig::default(),
            security: SecurityConfig::default(),
            max_concurrent_calls: None,
            max_queue_depth: None,
            default_deadline_ms: None,
            reconnect_backoff: BackoffConfig::default(),
            default_policy: CallPolicy::None,
            method_policies: HashMap::new(),
            retry_throttle: None,
            retry_buffer_size: 256 * 1024,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            send_compression: None,
            inbound_buffer: 32,
        }
    }
}

impl ChannelConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("unsupported config file extension: {:?}", ext),
        }
    }

    /// Connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Default call deadline, if any.
    pub fn default_deadline(&self) -> Option<Duration> {
        self.default_deadline_ms.map(Duration::from_millis)
    }

    /// Policy for a method path.
    pub fn policy_for(&self, path: &str) -> &CallPolicy {
        self.method_policies
            .get(path)
            .unwrap_or(&self.default_policy)
    }
}

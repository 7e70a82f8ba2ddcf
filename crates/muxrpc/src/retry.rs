//! Retry and hedging policies and the per-call coordinator that applies them.
//!
//! A retry policy starts a new attempt only after the previous one failed with
//! a retryable code. A hedging policy starts further attempts on a fixed timer
//! without waiting, and the first attempt to commit wins. Both stop once the
//! call has committed to an attempt (response headers or data received).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::{Backoff, BackoffConfig};
use crate::status::{Code, Status};

/// Trailer a server uses to override or veto the next retry.
pub const PUSHBACK_KEY: &str = "grpc-retry-pushback-ms";

/// Header carrying the number of earlier attempts of the same call.
pub const PREVIOUS_ATTEMPTS_KEY: &str = "grpc-previous-rpc-attempts";

/// Hard cap on attempts regardless of configuration.
pub const MAX_ATTEMPTS_CAP: u32 = 5;

/// How failed attempts of a call are handled.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallPolicy {
    /// One attempt only.
    #[default]
    None,
    /// Sequential retries after a backoff.
    Retry(RetryPolicy),
    /// Parallel attempts started on a timer.
    Hedging(HedgingPolicy),
}

impl CallPolicy {
    /// Attempts allowed by the policy, capped at [`MAX_ATTEMPTS_CAP`].
    pub fn max_attempts(&self) -> u32 {
        let configured = match self {
            CallPolicy::None => 1,
            CallPolicy::Retry(p) => p.max_attempts,
            CallPolicy::Hedging(p) => p.max_attempts,
        };
        configured.clamp(1, MAX_ATTEMPTS_CAP)
    }
}

/// Sequential retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff: BackoffConfig,
    /// Codes that trigger another attempt.
    pub retryable_codes: Vec<Code>,
    /// Whether messages already sent may be replayed on a new attempt. When
    /// false, a call is only retried if it has not sent any message yet.
    pub replay_sent_messages: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig {
                initial_backoff_ms: 100,
                max_backoff_ms: 10_000,
                multiplier: 2.0,
                jitter: 0.2,
                ..BackoffConfig::default()
            },
            retryable_codes: vec![Code::Unavailable],
            replay_sent_messages: true,
        }
    }
}

/// Hedging policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HedgingPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay between starting consecutive attempts.
    pub hedging_delay_ms: u64,
    /// Codes that do not end the call while other attempts may still succeed.
    pub non_fatal_codes: Vec<Code>,
}

impl Default for HedgingPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            hedging_delay_ms: 50,
            non_fatal_codes: vec![Code::Unavailable],
        }
    }
}

impl HedgingPolicy {
    /// Hedging delay as a duration.
    pub fn hedging_delay(&self) -> Duration {
        Duration::from_millis(self.hedging_delay_ms)
    }
}

/// Server pushback parsed from trailers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushback {
    /// Wait exactly this long before the next attempt.
    Delay(Duration),
    /// Do not start further attempts.
    Stop,
}

impl Pushback {
    /// Reads the pushback trailer from a status, if present.
    pub fn from_status(status: &Status) -> Option<Pushback> {
        let raw = status.trailers().get(PUSHBACK_KEY)?;
        match raw.trim().parse::<i64>() {
            Ok(ms) if ms >= 0 => Some(Pushback::Delay(Duration::from_millis(ms as u64))),
            _ => Some(Pushback::Stop),
        }
    }
}

/// Retry throttle parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryThrottleConfig {
    /// Bucket capacity.
    pub max_tokens: u32,
    /// Tokens returned per successful call.
    pub token_ratio: f64,
}

impl Default for RetryThrottleConfig {
    fn default() -> Self {
        Self {
            max_tokens: 10,
            token_ratio: 0.1,
        }
    }
}

/// Channel-wide token bucket limiting retries and hedges.
///
/// Each failed attempt removes one token and each success returns
/// `token_ratio`. Further attempts are allowed only while more than half of
/// the bucket remains. Tokens are tracked in thousandths.
#[derive(Debug)]
pub struct RetryThrottle {
    max_milli: u64,
    ratio_milli: u64,
    tokens_milli: AtomicU64,
}

impl RetryThrottle {
    /// Creates a full bucket.
    pub fn new(config: &RetryThrottleConfig) -> Self {
        let max_milli = u64::from(config.max_tokens) * 1000;
        Self {
            max_milli,
            ratio_milli: (config.token_ratio.max(0.0) * 1000.0) as u64,
            tokens_milli: AtomicU64::new(max_milli),
        }
    }

    /// Records a failed attempt.
    pub fn on_failure(&self) {
        let _ = self
            .tokens_milli
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                Some(t.saturating_sub(1000))
            });
    }

    /// Records a successful attempt.
    pub fn on_success(&self) {
        let max = self.max_milli;
        let ratio = self.ratio_milli;
        let _ = self
            .tokens_milli
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                Some(t.saturating_add(ratio).min(max))
            });
    }

    /// Whether another attempt may start.
    pub fn allows_retry(&self) -> bool {
        self.tokens_milli.load(Ordering::Acquire) * 2 > self.max_milli
    }

    /// Current token count.
    pub fn tokens(&self) -> f64 {
        self.tokens_milli.load(Ordering::Acquire) as f64 / 1000.0
    }
}

/// What the coordinator knows about a finished attempt.
#[derive(Debug, Clone, Copy)]
pub struct AttemptOutcome<'a> {
    /// Terminal status of the attempt.
    pub status: &'a Status,
    /// Attempts started so far, including this one.
    pub attempts_started: u32,
    /// Attempts still in flight.
    pub live_attempts: usize,
    /// Whether the call already committed to an attempt.
    pub committed: bool,
    /// Whether a new attempt could replay everything sent so far.
    pub replayable: bool,
    /// Whether the application has sent any message.
    pub messages_sent: bool,
}

/// Decision after an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Start another attempt after the delay.
    RetryAfter(Duration),
    /// Other hedged attempts are still running; wait for them.
    Wait,
    /// Deliver this status to the application.
    Finish,
}

/// Applies a [`CallPolicy`] to the attempts of one call.
#[derive(Debug)]
pub struct RetryCoordinator {
    policy: CallPolicy,
    backoff: Option<Backoff>,
    throttle: Option<Arc<RetryThrottle>>,
    stopped: bool,
}

impl RetryCoordinator {
    /// Creates a coordinator for one call.
    pub fn new(policy: CallPolicy, throttle: Option<Arc<RetryThrottle>>) -> Self {
        let backoff = match &policy {
            CallPolicy::Retry(p) => Some(Backoff::new(p.backoff.clone())),
            _ => None,
        };
        Self {
            policy,
            backoff,
            throttle,
            stopped: false,
        }
    }

    /// The policy being applied.
    pub fn policy(&self) -> &CallPolicy {
        &self.policy
    }

    /// Attempts allowed for this call.
    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts()
    }

    /// Delay before the next hedged attempt, if hedging applies.
    pub fn hedging_delay(&self) -> Option<Duration> {
        match &self.policy {
            CallPolicy::Hedging(p) => Some(p.hedging_delay()),
            _ => None,
        }
    }

    /// Whether the hedging timer may start another attempt now.
    pub fn may_hedge(&self, attempts_started: u32) -> bool {
        matches!(self.policy, CallPolicy::Hedging(_))
            && !self.stopped
            && attempts_started < self.max_attempts()
            && self.throttle_allows()
    }

    /// Feeds an attempt's terminal status into the throttle.
    pub fn record(&self, status: &Status) {
        let Some(throttle) = &self.throttle else {
            return;
        };
        if status.is_ok() {
            throttle.on_success();
        } else if self.is_retryable_code(status.code()) {
            throttle.on_failure();
        }
    }

    fn throttle_allows(&self) -> bool {
        self.throttle.as_ref().map_or(true, |t| t.allows_retry())
    }

    fn is_retryable_code(&self, code: Code) -> bool {
        match &self.policy {
            CallPolicy::None => false,
            CallPolicy::Retry(p) => p.retryable_codes.contains(&code),
            CallPolicy::Hedging(p) => p.non_fatal_codes.contains(&code),
        }
    }

    /// Decides what follows a failed attempt.
    pub fn on_attempt_failed(&mut self, outcome: AttemptOutcome<'_>) -> RetryDecision {
        if outcome.status.is_ok() || outcome.committed {
            return RetryDecision::Finish;
        }
        if !self.is_retryable_code(outcome.status.code()) {
            return RetryDecision::Finish;
        }
        let pushback = Pushback::from_status(outcome.status);
        if pushback == Some(Pushback::Stop) {
            self.stopped = true;
        }

        match &self.policy {
            CallPolicy::None => RetryDecision::Finish,
            CallPolicy::Retry(policy) => {
                let exhausted = outcome.attempts_started >= self.max_attempts();
                let unsafe_replay = !outcome.replayable
                    || (!policy.replay_sent_messages && outcome.messages_sent);
                if self.stopped || exhausted || unsafe_replay || !self.throttle_allows() {
                    return RetryDecision::Finish;
                }
                let delay = match pushback {
                    Some(Pushback::Delay(d)) => d,
                    _ => match self.backoff.as_mut() {
                        Some(b) => b.next_delay(),
                        None => Duration::ZERO,
                    },
                };
                RetryDecision::RetryAfter(delay)
            }
            CallPolicy::Hedging(_) => {
                if outcome.live_attempts > 0 {
                    return RetryDecision::Wait;
                }
                if !outcome.replayable || !self.may_hedge(outcome.attempts_started) {
                    return RetryDecision::Finish;
                }
                let delay = match pushback {
                    Some(Pushback::Delay(d)) => d,
                    _ => Duration::ZERO,
                };
                RetryDecision::RetryAfter(delay)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::JitterMode;
    use crate::metadata::Metadata;

    fn retry_policy(max_attempts: u32) -> CallPolicy {
        CallPolicy::Retry(RetryPolicy {
            max_attempts,
            backoff: BackoffConfig {
                initial_backoff_ms: 10,
                max_backoff_ms: 1_000,
                multiplier: 2.0,
                jitter: 0.0,
                jitter_mode: JitterMode::None,
                seed: Some(1),
            },
            ..RetryPolicy::default()
        })
    }

    fn outcome(status: &Status, started: u32) -> AttemptOutcome<'_> {
        AttemptOutcome {
            status,
            attempts_started: started,
            live_attempts: 0,
            committed: false,
            replayable: true,
            messages_sent: true,
        }
    }

    fn with_pushback(value: &str) -> Status {
        let mut trailers = Metadata::new();
        trailers.insert(PUSHBACK_KEY, value).unwrap();
        Status::unavailable("busy").with_trailers(trailers)
    }

    #[test]
    fn test_retry_until_max_attempts() {
        let mut coordinator = RetryCoordinator::new(retry_policy(3), None);
        let status = Status::unavailable("down");
        assert_eq!(
            coordinator.on_attempt_failed(outcome(&status, 1)),
            RetryDecision::RetryAfter(Duration::from_millis(10))
        );
        assert_eq!(
            coordinator.on_attempt_failed(outcome(&status, 2)),
            RetryDecision::RetryAfter(Duration::from_millis(20))
        );
        assert_eq!(
            coordinator.on_attempt_failed(outcome(&status, 3)),
            RetryDecision::Finish
        );
    }

    #[test]
    fn test_non_retryable_code_finishes() {
        let mut coordinator = RetryCoordinator::new(retry_policy(3), None);
        let status = Status::invalid_argument("bad");
        assert_eq!(
            coordinator.on_attempt_failed(outcome(&status, 1)),
            RetryDecision::Finish
        );
    }

    #[test]
    fn test_committed_call_is_not_retried() {
        let mut coordinator = RetryCoordinator::new(retry_policy(3), None);
        let status = Status::unavailable("down");
        let mut o = outcome(&status, 1);
        o.committed = true;
        assert_eq!(coordinator.on_attempt_failed(o), RetryDecision::Finish);
    }

    #[test]
    fn test_replay_restrictions() {
        let status = Status::unavailable("down");

        let mut coordinator = RetryCoordinator::new(retry_policy(3), None);
        let mut o = outcome(&status, 1);
        o.replayable = false;
        assert_eq!(coordinator.on_attempt_failed(o), RetryDecision::Finish);

        let mut no_replay = RetryPolicy::default();
        no_replay.replay_sent_messages = false;
        let mut coordinator = RetryCoordinator::new(CallPolicy::Retry(no_replay), None);
        assert_eq!(
            coordinator.on_attempt_failed(outcome(&status, 1)),
            RetryDecision::Finish
        );
        let mut o = outcome(&status, 1);
        o.messages_sent = false;
        assert!(matches!(
            coordinator.on_attempt_failed(o),
            RetryDecision::RetryAfter(_)
        ));
    }

    #[test]
    fn test_pushback() {
        let mut coordinator = RetryCoordinator::new(retry_policy(5), None);
        let status = with_pushback("250");
        assert_eq!(
            coordinator.on_attempt_failed(outcome(&status, 1)),
            RetryDecision::RetryAfter(Duration::from_millis(250))
        );
        let status = with_pushback("-1");
        assert_eq!(
            coordinator.on_attempt_failed(outcome(&status, 2)),
            RetryDecision::Finish
        );
        assert_eq!(Pushback::from_status(&with_pushback("soon")), Some(Pushback::Stop));
        assert_eq!(Pushback::from_status(&Status::unavailable("x")), None);
    }

    #[test]
    fn test_hedging_waits_for_live_attempts() {
        let mut coordinator = RetryCoordinator::new(CallPolicy::Hedging(HedgingPolicy::default()), None);
        let status = Status::unavailable("down");
        let mut o = outcome(&status, 2);
        o.live_attempts = 1;
        assert_eq!(coordinator.on_attempt_failed(o), RetryDecision::Wait);
        assert_eq!(
            coordinator.on_attempt_failed(outcome(&status, 2)),
            RetryDecision::RetryAfter(Duration::ZERO)
        );
        assert_eq!(
            coordinator.on_attempt_failed(outcome(&status, 3)),
            RetryDecision::Finish
        );
        assert!(coordinator.may_hedge(1));
        assert!(!coordinator.may_hedge(3));
        assert_eq!(coordinator.hedging_delay(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_max_attempts_capped() {
        let policy = CallPolicy::Retry(RetryPolicy {
            max_attempts: 40,
            ..RetryPolicy::default()
        });
        assert_eq!(policy.max_attempts(), MAX_ATTEMPTS_CAP);
        assert_eq!(CallPolicy::None.max_attempts(), 1);
    }

    #[test]
    fn test_throttle_blocks_retries() {
        let throttle = Arc::new(RetryThrottle::new(&RetryThrottleConfig {
            max_tokens: 4,
            token_ratio: 0.5,
        }));
        let mut coordinator = RetryCoordinator::new(retry_policy(5), Some(throttle.clone()));
        let status = Status::unavailable("down");

        coordinator.record(&status);
        assert_eq!(throttle.tokens(), 3.0);
        assert!(matches!(
            coordinator.on_attempt_failed(outcome(&status, 1)),
            RetryDecision::RetryAfter(_)
        ));

        coordinator.record(&status);
        assert_eq!(throttle.tokens(), 2.0);
        assert!(!throttle.allows_retry());
        assert_eq!(
            coordinator.on_attempt_failed(outcome(&status, 2)),
            RetryDecision::Finish
        );

        coordinator.record(&Status::ok());
        assert_eq!(throttle.tokens(), 2.5);
        assert!(throttle.allows_retry());
    }

    #[test]
    fn test_policy_serde() {
        let json = r#"{"kind":"retry","max_attempts":4,"retryable_codes":["Unavailable","Aborted"]}"#;
        let policy: CallPolicy = serde_json::from_str(json).unwrap();
        match policy {
            CallPolicy::Retry(p) => {
                assert_eq!(p.max_attempts, 4);
                assert_eq!(p.retryable_codes, vec![Code::Unavailable, Code::Aborted]);
                assert!(p.replay_sent_messages);
            }
            other => panic!("unexpected policy {other:?}"),
        }
        let none: CallPolicy = serde_json::from_str(r#"{"kind":"none"}"#).unwrap();
        assert_eq!(none, CallPolicy::None);
    }
}

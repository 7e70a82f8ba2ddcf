//! Call statistics aggregator.
//!
//! Owned by whoever creates it and passed explicitly (usually wrapped in a
//! [`StatsInterceptor`](crate::interceptor::StatsInterceptor)). All updates go
//! through one lock.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::status::Code;

#[derive(Debug, Default)]
struct StatsInner {
    calls: u64,
    by_code: BTreeMap<Code, u64>,
    ok_latency_total: Duration,
    ok_latency_min: Option<Duration>,
    ok_latency_max: Option<Duration>,
}

/// Lock-guarded counters of completed calls.
#[derive(Debug, Default)]
pub struct CallStats {
    inner: Mutex<StatsInner>,
}

/// Point-in-time copy of [`CallStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Completed calls.
    pub calls: u64,
    /// Completed calls per status code.
    pub by_code: BTreeMap<Code, u64>,
    /// Fastest successful call.
    pub latency_min: Option<Duration>,
    /// Slowest successful call.
    pub latency_max: Option<Duration>,
    /// Mean latency of successful calls.
    pub latency_mean: Option<Duration>,
}

impl StatsSnapshot {
    /// Calls that completed with `code`.
    pub fn count(&self, code: Code) -> u64 {
        self.by_code.get(&code).copied().unwrap_or(0)
    }

    /// Calls that completed with a non-OK code.
    pub fn failures(&self) -> u64 {
        self.calls - self.count(Code::Ok)
    }
}

impl CallStats {
    /// Empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one completed call. Latency is only tracked for `Ok` calls.
    pub fn record(&self, code: Code, latency: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.calls += 1;
        *inner.by_code.entry(code).or_insert(0) += 1;
        if code == Code::Ok {
            inner.ok_latency_total += latency;
            inner.ok_latency_min = Some(inner.ok_latency_min.map_or(latency, |m| m.min(latency)));
            inner.ok_latency_max = Some(inner.ok_latency_max.map_or(latency, |m| m.max(latency)));
        }
    }

    /// Copies the current counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let ok = inner.by_code.get(&Code::Ok).copied().unwrap_or(0);
        let latency_mean = (ok > 0).then(|| {
            let nanos = inner.ok_latency_total.as_nanos() / u128::from(ok);
            Duration::from_nanos(nanos.min(u128::from(u64::MAX)) as u64)
        });
        StatsSnapshot {
            calls: inner.calls,
            by_code: inner.by_code.clone(),
            latency_min: inner.ok_latency_min,
            latency_max: inner.ok_latency_max,
            latency_mean,
        }
    }

    /// Clears all counters.
    pub fn reset(&self) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = StatsInner::default();
    }
}

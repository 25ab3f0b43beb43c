//! C5 (circuit breaker) — the Closed/Open/HalfOpen state machine from
//! spec.md §4.5.
//!
//! No precedent in the teacher or the rest of the corpus beyond Cargo.toml
//! dependency comments naming "circuit breaking" as an abstract feature
//! category, so this is built fresh — but in the teacher's idiom: a snafu
//! error enum and `Arc<RwLock<_>>`-guarded shared state, the same shape
//! `context.rs`/`execution_handle.rs` use for concurrently-read mutable
//! state.

use chrono::{DateTime, Utc};
use snafu::prelude::*;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::workflow::CircuitBreakerSpec;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("circuit breaker is open; retry after {retry_after_ms}ms"))]
    Open { retry_after_ms: i64 },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: State,
    opened_at: Option<DateTime<Utc>>,
    /// Timestamps of failures within the sampling window.
    failures: VecDeque<DateTime<Utc>>,
    half_open_successes: u32,
    half_open_in_flight: u32,
}

/// A circuit breaker scoped to one task id, shared across concurrent
/// invocations of that task (e.g. under `forEach`).
pub struct CircuitBreaker {
    spec: CircuitBreakerSpec,
    inner: Arc<RwLock<Inner>>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(spec: CircuitBreakerSpec) -> Self {
        Self {
            spec,
            inner: Arc::new(RwLock::new(Inner {
                state: State::Closed,
                opened_at: None,
                failures: VecDeque::new(),
                half_open_successes: 0,
                half_open_in_flight: 0,
            })),
        }
    }

    /// Call before attempting execution. Transitions Open -> HalfOpen once
    /// `break_duration` has elapsed, and bounds concurrent half-open probes
    /// to `half_open_requests`.
    ///
    /// # Errors
    /// Returns [`Error::Open`] if the breaker is (still) open.
    pub async fn before_call(&self) -> Result<()> {
        let break_duration = parse_duration(&self.spec.break_duration);
        let mut inner = self.inner.write().await;

        if inner.state == State::Open {
            let opened_at = inner.opened_at.unwrap_or_else(Utc::now);
            let elapsed = Utc::now() - opened_at;
            if elapsed >= chrono::Duration::from_std(break_duration).unwrap_or_default() {
                inner.state = State::HalfOpen;
                inner.half_open_successes = 0;
                inner.half_open_in_flight = 0;
            } else {
                let retry_after_ms = (chrono::Duration::from_std(break_duration).unwrap_or_default() - elapsed)
                    .num_milliseconds()
                    .max(0);
                return Err(Error::Open { retry_after_ms });
            }
        }

        if inner.state == State::HalfOpen {
            if inner.half_open_in_flight >= self.spec.half_open_requests {
                return Err(Error::Open { retry_after_ms: 0 });
            }
            inner.half_open_in_flight += 1;
        }

        Ok(())
    }

    /// Record a successful call. In `HalfOpen`, enough successes close the
    /// breaker; in `Closed`, clears the failure window.
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            State::HalfOpen => {
                inner.half_open_successes += 1;
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                if inner.half_open_successes >= self.spec.half_open_requests {
                    inner.state = State::Closed;
                    inner.failures.clear();
                    inner.opened_at = None;
                }
            }
            State::Closed => {
                inner.failures.clear();
            }
            State::Open => {}
        }
    }

    /// Record a failed call. In `HalfOpen`, any failure reopens the
    /// breaker. In `Closed`, `failure_threshold` failures within
    /// `sampling_duration` opens it.
    pub async fn record_failure(&self) {
        let sampling_duration = parse_duration(&self.spec.sampling_duration);
        let mut inner = self.inner.write().await;

        match inner.state {
            State::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.state = State::Open;
                inner.opened_at = Some(Utc::now());
            }
            State::Closed => {
                let now = Utc::now();
                inner.failures.push_back(now);
                let window = chrono::Duration::from_std(sampling_duration).unwrap_or_default();
                while let Some(&front) = inner.failures.front() {
                    if now - front > window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures.len() as u32 >= self.spec.failure_threshold {
                    inner.state = State::Open;
                    inner.opened_at = Some(now);
                }
            }
            State::Open => {}
        }
    }

    pub async fn state(&self) -> State {
        self.inner.read().await.state
    }
}

fn parse_duration(s: &str) -> std::time::Duration {
    crate::config::parse_duration(s).unwrap_or(std::time::Duration::from_secs(30))
}

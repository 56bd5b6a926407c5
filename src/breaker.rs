use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::{event, Level};

/// Breaker state as exposed in health checks and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    /// Set while the single half-open probe is in flight.
    probe_in_flight: bool,
}

/// Gates outbound refresh and log-upload calls. After `failure_threshold`
/// consecutive failures the breaker opens and short-circuits callers without
/// touching the transport; after `reset_timeout` it admits exactly one probe
/// and closes again only if that probe succeeds.
///
/// All transitions happen under one mutex, so no two threads can disagree
/// about the state they observed when deciding to transition.
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
    pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Whether a gated call may proceed. Moves open to half-open once the
    /// reset timeout has elapsed; in half-open only one caller is granted
    /// the probe, everyone else is refused until the probe reports.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock should not be poisoned");
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner.last_failure.map(|t| t.elapsed());
                match elapsed {
                    Some(elapsed) if elapsed >= self.reset_timeout => {
                        inner.state = BreakerState::HalfOpen;
                        inner.probe_in_flight = true;
                        event!(Level::INFO, "circuit breaker half-open, probing");
                        true
                    }
                    _ => false,
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Reports a successful gated call. Closes the breaker and resets the
    /// failure counter when called from half-open.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock should not be poisoned");
        inner.probe_in_flight = false;
        inner.failure_count = 0;
        if inner.state != BreakerState::Closed {
            inner.state = BreakerState::Closed;
            event!(Level::INFO, "circuit breaker closed after successful call");
        }
    }

    /// Reports a failed gated call. Opens the breaker once the consecutive
    /// failure count reaches the threshold, or immediately on a failed
    /// half-open probe.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock should not be poisoned");
        inner.probe_in_flight = false;
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        let should_open = match inner.state {
            BreakerState::HalfOpen => true,
            _ => inner.failure_count >= self.failure_threshold,
        };
        if should_open && inner.state != BreakerState::Open {
            inner.state = BreakerState::Open;
            event!(
                Level::WARN,
                "circuit breaker opened after {} consecutive failures",
                inner.failure_count
            );
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner
            .lock()
            .expect("breaker lock should not be poisoned")
            .state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner
            .lock()
            .expect("breaker lock should not be poisoned")
            .failure_count
    }
}

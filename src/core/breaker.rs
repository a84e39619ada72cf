//! Per-backend circuit breaker.
//!
//! Classic three-state machine (closed → open → half-open → closed) over a
//! rolling 10-second window of request outcomes. One [`Breaker`] exists per
//! `(route, backend URL)` and its identity survives config reloads, so a
//! half-open circuit stays half-open across a reload.
use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

use thiserror::Error;

use crate::config::CircuitBreakerConfig;

/// Returned by [`Breaker::allow`] while the circuit is fast-failing.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("circuit breaker is open")]
pub struct CircuitOpen;

/// Horizon of the closed-state outcome window.
const ROLLING_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

impl State {
    fn as_str(self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        }
    }
}

struct Inner {
    cfg: CircuitBreakerConfig,
    state: State,
    opened_at: Instant,
    // (timestamp, success) observations, oldest first.
    window: VecDeque<(Instant, bool)>,
    probe_total: u32,
    probe_failures: u32,
}

/// A single circuit breaker gating one upstream backend.
///
/// `allow` and `record_*` linearise under one mutex, so concurrent
/// admit/record pairs observe a consistent state. While the circuit is open,
/// outcome records are ignored: a probe that was admitted in half-open but
/// completes after the circuit re-opened records as a no-op.
pub struct Breaker {
    inner: Mutex<Inner>,
}

impl Breaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                cfg,
                state: State::Closed,
                opened_at: Instant::now(),
                window: VecDeque::new(),
                probe_total: 0,
                probe_failures: 0,
            }),
        }
    }

    /// Adopt new parameters on reload without losing state.
    pub fn reconfigure(&self, cfg: CircuitBreakerConfig) {
        self.inner.lock().expect("breaker lock poisoned").cfg = cfg;
    }

    /// Should this request be admitted?
    pub fn allow(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            State::Closed => Ok(()),
            State::Open => {
                if inner.opened_at.elapsed() > inner.cfg.open_duration() {
                    inner.transition(State::HalfOpen);
                    Ok(())
                } else {
                    Err(CircuitOpen)
                }
            }
            State::HalfOpen => {
                if inner.probe_total < inner.cfg.half_open_requests {
                    inner.probe_total += 1;
                    Ok(())
                } else {
                    Err(CircuitOpen)
                }
            }
        }
    }

    /// Record a successful upstream outcome.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            State::Closed => inner.observe(true),
            State::HalfOpen => {
                if inner.probe_total - inner.probe_failures >= inner.cfg.half_open_requests {
                    inner.transition(State::Closed);
                }
            }
            State::Open => {}
        }
    }

    /// Record a failed upstream outcome (5xx or transport error).
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            State::Closed => {
                inner.observe(false);
                inner.maybe_trip();
            }
            State::HalfOpen => {
                inner.probe_failures += 1;
                inner.transition(State::Open);
            }
            State::Open => {}
        }
    }

    /// Human-readable state, as exposed on the admin surface.
    pub fn state(&self) -> &'static str {
        self.inner
            .lock()
            .expect("breaker lock poisoned")
            .state
            .as_str()
    }
}

impl Inner {
    fn observe(&mut self, success: bool) {
        let now = Instant::now();
        self.window.push_back((now, success));
        while let Some((at, _)) = self.window.front() {
            if now.duration_since(*at) > ROLLING_WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn maybe_trip(&mut self) {
        let total = self.window.len();
        if total < self.cfg.min_requests {
            return;
        }
        let failures = self.window.iter().filter(|(_, ok)| !ok).count();
        if failures * 100 / total >= self.cfg.failure_threshold as usize {
            self.transition(State::Open);
        }
    }

    fn transition(&mut self, to: State) {
        tracing::debug!(from = self.state.as_str(), to = to.as_str(), "circuit breaker transition");
        self.state = to;
        match to {
            State::Open => {
                self.opened_at = Instant::now();
                self.window.clear();
            }
            State::HalfOpen => {
                self.probe_total = 0;
                self.probe_failures = 0;
            }
            State::Closed => {
                self.window.clear();
            }
        }
    }
}

//! Admission circuit breaker.
//!
//! Protects the GPU from more work than it can drain. The breaker trips on
//! either of two signals: the queue is at its ceiling, or too many recent
//! job outcomes were failures. After a cooldown it lets a few probe
//! submissions through; the next job outcome decides whether it closes.
//! A half-open admission whose job ends without a verdict (cancelled,
//! rejected as bad input) hands its slot back, and a slot nobody reports on
//! within one cooldown is reclaimed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use strum::Display;

use crate::clock::{to_delta, Clock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Queue depth at which new submissions are refused.
    pub queue_ceiling: usize,
    /// Failure fraction in the window above which the breaker opens.
    pub failure_rate_threshold: f64,
    /// Outcomes required in the window before the failure rate counts.
    pub min_samples: usize,
    pub window: Duration,
    pub cooldown: Duration,
    /// Submissions admitted while half-open.
    pub half_open_probes: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            queue_ceiling: 100,
            failure_rate_threshold: 0.5,
            min_samples: 10,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            half_open_probes: 1,
        }
    }
}

/// Why a submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("queue is full ({depth} of {ceiling} jobs waiting)")]
    QueueFull { depth: usize, ceiling: usize },

    #[error("too many recent inference failures, retry after {retry_after_secs}s")]
    CircuitOpen { retry_after_secs: u64 },

    #[error("service is recovering, probe capacity in use")]
    ProbesExhausted,
}

impl Rejection {
    fn reason(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "queue_full",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ProbesExhausted => "probes_exhausted",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    opened_at: Option<DateTime<Utc>>,
    probes_admitted: usize,
    last_probe_at: Option<DateTime<Utc>>,
    outcomes: VecDeque<(DateTime<Utc>, bool)>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                opened_at: None,
                probes_admitted: 0,
                last_probe_at: None,
                outcomes: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether one more submission may enter a queue of `queue_depth`.
    pub fn admit(&self, queue_depth: usize) -> Result<(), Rejection> {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.prune(&mut inner, now);

        let verdict = self.evaluate(&mut inner, queue_depth, now);
        if let Err(rejection) = &verdict {
            metrics::counter!("admission_rejected_total", "reason" => rejection.reason())
                .increment(1);
        }
        verdict
    }

    fn evaluate(
        &self,
        inner: &mut BreakerInner,
        queue_depth: usize,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        let queue_full = Rejection::QueueFull {
            depth: queue_depth,
            ceiling: self.config.queue_ceiling,
        };

        if inner.state == BreakerState::Open {
            let reopen_at = inner.opened_at.unwrap_or(now) + to_delta(self.config.cooldown);
            if now < reopen_at {
                let retry_after_secs = (reopen_at - now).num_seconds().max(1) as u64;
                return Err(Rejection::CircuitOpen { retry_after_secs });
            }
            self.transition(inner, BreakerState::HalfOpen, now);
        }

        match inner.state {
            BreakerState::Closed => {
                if queue_depth >= self.config.queue_ceiling {
                    self.transition(inner, BreakerState::Open, now);
                    return Err(queue_full);
                }
                if self.failure_rate_breached(inner) {
                    self.transition(inner, BreakerState::Open, now);
                    return Err(Rejection::CircuitOpen {
                        retry_after_secs: self.config.cooldown.as_secs().max(1),
                    });
                }
                Ok(())
            }
            BreakerState::HalfOpen => {
                if queue_depth >= self.config.queue_ceiling {
                    self.transition(inner, BreakerState::Open, now);
                    return Err(queue_full);
                }
                if inner.probes_admitted >= self.config.half_open_probes {
                    let reclaim_at =
                        inner.last_probe_at.unwrap_or(now) + to_delta(self.config.cooldown);
                    if now < reclaim_at {
                        return Err(Rejection::ProbesExhausted);
                    }
                    tracing::warn!(
                        admitted = inner.probes_admitted,
                        "No half-open outcome within cooldown, reclaiming slots"
                    );
                    inner.probes_admitted = 0;
                }
                inner.probes_admitted += 1;
                inner.last_probe_at = Some(now);
                Ok(())
            }
            BreakerState::Open => Err(Rejection::CircuitOpen {
                retry_after_secs: self.config.cooldown.as_secs().max(1),
            }),
        }
    }

    /// Feed a finished job's outcome into the failure window.
    pub fn record_outcome(&self, success: bool) {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.prune(&mut inner, now);

        match inner.state {
            BreakerState::HalfOpen if success => {
                inner.outcomes.clear();
                self.transition(&mut inner, BreakerState::Closed, now);
            }
            BreakerState::HalfOpen => {
                inner.outcomes.push_back((now, false));
                self.transition(&mut inner, BreakerState::Open, now);
            }
            BreakerState::Closed => {
                inner.outcomes.push_back((now, success));
                if self.failure_rate_breached(&inner) {
                    self.transition(&mut inner, BreakerState::Open, now);
                }
            }
            BreakerState::Open => inner.outcomes.push_back((now, success)),
        }
    }

    /// A job finished without saying anything about service health. While
    /// half-open this frees the admission slot it may have held.
    pub fn release_slot(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.probes_admitted = inner.probes_admitted.saturating_sub(1);
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Failure fraction over the current window; 0 when empty.
    pub fn failure_rate(&self) -> f64 {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.prune(&mut inner, now);
        Self::rate(&inner)
    }

    fn rate(inner: &BreakerInner) -> f64 {
        if inner.outcomes.is_empty() {
            return 0.0;
        }
        let failures = inner.outcomes.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / inner.outcomes.len() as f64
    }

    fn failure_rate_breached(&self, inner: &BreakerInner) -> bool {
        inner.outcomes.len() >= self.config.min_samples
            && Self::rate(inner) > self.config.failure_rate_threshold
    }

    fn prune(&self, inner: &mut BreakerInner, now: DateTime<Utc>) {
        let horizon = now - to_delta(self.config.window);
        while inner
            .outcomes
            .front()
            .is_some_and(|(at, _)| *at < horizon)
        {
            inner.outcomes.pop_front();
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState, now: DateTime<Utc>) {
        if inner.state == to {
            return;
        }
        tracing::warn!(from = %inner.state, to = %to, "Admission breaker changed state");
        inner.state = to;
        inner.probes_admitted = 0;
        inner.last_probe_at = None;
        inner.opened_at = (to == BreakerState::Open).then_some(now);
    }
}

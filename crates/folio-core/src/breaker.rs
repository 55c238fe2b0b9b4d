//! Per-job circuit breaker.
//!
//! One breaker per job name, never shared, so a failing source cannot
//! block unrelated jobs. Transitions are pure functions over an immutable
//! [`BreakerState`]: the job's call path and the self-healer can both
//! read/restore state without racing on in-place mutation. The state is
//! persisted into the job's checkpoint row after every recorded call and
//! restored before the first call on process start, so restarts do not
//! reset backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::defaults;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected without I/O until the backoff window elapses.
    Open,
    /// Exactly one trial call is in flight.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Outcome of a wrapped source call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

/// Tuning for one job's breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Base recovery timeout, scaled by the backoff multiplier.
    pub recovery_timeout: Duration,
    /// Cap on the power-of-two backoff multiplier.
    pub max_backoff_multiplier: u32,
    /// Optional error-rate mode: open when the failure rate over the
    /// last [`defaults::BREAKER_ERROR_RATE_WINDOW`] calls exceeds this,
    /// even below the consecutive-failure count.
    pub error_rate_threshold: Option<f64>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::BREAKER_FAILURE_THRESHOLD,
            recovery_timeout: Duration::from_secs(defaults::BREAKER_RECOVERY_TIMEOUT_SECS),
            max_backoff_multiplier: defaults::BREAKER_MAX_BACKOFF_MULTIPLIER,
            error_rate_threshold: None,
        }
    }
}

impl BreakerConfig {
    /// Lenient preset for best-effort matching jobs: tolerates more
    /// consecutive failures, no error-rate tripwire.
    pub fn lenient() -> Self {
        Self {
            failure_threshold: defaults::BREAKER_FAILURE_THRESHOLD * 2,
            ..Self::default()
        }
    }

    /// Strict preset for quota-critical sync jobs: error-rate mode on.
    pub fn strict() -> Self {
        Self {
            error_rate_threshold: Some(defaults::BREAKER_ERROR_RATE_THRESHOLD),
            ..Self::default()
        }
    }

    pub fn with_failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n.max(1);
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_max_backoff_multiplier(mut self, cap: u32) -> Self {
        self.max_backoff_multiplier = cap.max(1);
        self
    }

    pub fn with_error_rate_threshold(mut self, threshold: Option<f64>) -> Self {
        self.error_rate_threshold = threshold;
        self
    }
}

/// Persisted breaker state, embedded in the checkpoint row as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub backoff_multiplier: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Rolling window of recent call outcomes (true = success), newest
    /// last, bounded at [`defaults::BREAKER_ERROR_RATE_WINDOW`].
    #[serde(default)]
    pub recent_outcomes: Vec<bool>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            backoff_multiplier: 1,
            opened_at: None,
            last_failure_at: None,
            recent_outcomes: Vec::new(),
        }
    }
}

/// Gate decision for a prospective call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The call may proceed. `trial` marks the single half-open probe.
    Permit { trial: bool },
    /// The call is rejected without I/O.
    Reject { retry_after: Duration },
}

/// A state change worth auditing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionEvent {
    pub from: CircuitState,
    pub to: CircuitState,
    pub consecutive_failures: u32,
    /// How long callers should wait before the next admission, when the
    /// new state is open.
    pub retry_after: Option<Duration>,
}

fn backoff_window(config: &BreakerConfig, multiplier: u32) -> Duration {
    config.recovery_timeout.saturating_mul(multiplier.max(1))
}

/// Gate a prospective call.
///
/// Pure: returns the (possibly advanced) state alongside the decision.
/// An open breaker whose backoff window has elapsed advances to
/// half-open and admits exactly one trial; further checks while the
/// trial is in flight are rejected.
pub fn check(
    state: &BreakerState,
    config: &BreakerConfig,
    now: DateTime<Utc>,
) -> (BreakerState, Decision) {
    match state.state {
        CircuitState::Closed => (state.clone(), Decision::Permit { trial: false }),
        CircuitState::HalfOpen => (
            state.clone(),
            Decision::Reject {
                retry_after: config.recovery_timeout,
            },
        ),
        CircuitState::Open => {
            let window = backoff_window(config, state.backoff_multiplier);
            let reopen_at = state
                .opened_at
                .unwrap_or(now)
                .checked_add_signed(
                    chrono::Duration::from_std(window)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
                )
                .unwrap_or(now);

            if now >= reopen_at {
                let mut next = state.clone();
                next.state = CircuitState::HalfOpen;
                (next, Decision::Permit { trial: true })
            } else {
                let remaining = (reopen_at - now)
                    .to_std()
                    .unwrap_or(config.recovery_timeout);
                (
                    state.clone(),
                    Decision::Reject {
                        retry_after: remaining,
                    },
                )
            }
        }
    }
}

/// Record a call outcome.
///
/// Pure: returns the next state and, when the state changed, an event
/// for the audit trail.
pub fn transition(
    state: &BreakerState,
    config: &BreakerConfig,
    outcome: CallOutcome,
    now: DateTime<Utc>,
) -> (BreakerState, Option<TransitionEvent>) {
    let mut next = state.clone();
    next.recent_outcomes.push(outcome == CallOutcome::Success);
    let excess = next
        .recent_outcomes
        .len()
        .saturating_sub(defaults::BREAKER_ERROR_RATE_WINDOW);
    if excess > 0 {
        next.recent_outcomes.drain(..excess);
    }

    match (state.state, outcome) {
        (CircuitState::Closed, CallOutcome::Success) => {
            next.consecutive_failures = 0;
            (next, None)
        }
        (CircuitState::Closed, CallOutcome::Failure) => {
            next.consecutive_failures = state.consecutive_failures + 1;
            next.last_failure_at = Some(now);

            let tripped_consecutive = next.consecutive_failures >= config.failure_threshold;
            let tripped_rate = config
                .error_rate_threshold
                .map(|threshold| {
                    next.recent_outcomes.len() >= defaults::BREAKER_ERROR_RATE_WINDOW
                        && error_rate(&next.recent_outcomes) > threshold
                })
                .unwrap_or(false);

            if tripped_consecutive || tripped_rate {
                next.state = CircuitState::Open;
                next.opened_at = Some(now);
                next.backoff_multiplier = state.backoff_multiplier.max(1);
                let retry_after = backoff_window(config, next.backoff_multiplier);
                let event = TransitionEvent {
                    from: CircuitState::Closed,
                    to: CircuitState::Open,
                    consecutive_failures: next.consecutive_failures,
                    retry_after: Some(retry_after),
                };
                (next, Some(event))
            } else {
                (next, None)
            }
        }
        (CircuitState::HalfOpen, CallOutcome::Success) => {
            next.state = CircuitState::Closed;
            next.consecutive_failures = 0;
            next.backoff_multiplier = 1;
            next.opened_at = None;
            let event = TransitionEvent {
                from: CircuitState::HalfOpen,
                to: CircuitState::Closed,
                consecutive_failures: 0,
                retry_after: None,
            };
            (next, Some(event))
        }
        (CircuitState::HalfOpen, CallOutcome::Failure) => {
            next.state = CircuitState::Open;
            next.consecutive_failures = state.consecutive_failures + 1;
            next.last_failure_at = Some(now);
            next.opened_at = Some(now);
            next.backoff_multiplier = state
                .backoff_multiplier
                .saturating_mul(2)
                .min(config.max_backoff_multiplier);
            let retry_after = backoff_window(config, next.backoff_multiplier);
            let event = TransitionEvent {
                from: CircuitState::HalfOpen,
                to: CircuitState::Open,
                consecutive_failures: next.consecutive_failures,
                retry_after: Some(retry_after),
            };
            (next, Some(event))
        }
        // An outcome reported against an already-open breaker carries no
        // admission to act on; keep the bookkeeping only.
        (CircuitState::Open, CallOutcome::Success) => (next, None),
        (CircuitState::Open, CallOutcome::Failure) => {
            next.consecutive_failures = state.consecutive_failures + 1;
            next.last_failure_at = Some(now);
            (next, None)
        }
    }
}

fn error_rate(outcomes: &[bool]) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }
    let failures = outcomes.iter().filter(|ok| !**ok).count();
    failures as f64 / outcomes.len() as f64
}

/// Owned breaker a runner holds for the duration of one job invocation.
///
/// Thin stateful shell over the pure `check`/`transition` functions.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    job_name: String,
    config: BreakerConfig,
    state: BreakerState,
}

impl CircuitBreaker {
    /// Restore a breaker from its persisted snapshot, or start fresh.
    pub fn restore(
        job_name: impl Into<String>,
        config: BreakerConfig,
        snapshot: Option<BreakerState>,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            config,
            state: snapshot.unwrap_or_default(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn state(&self) -> &BreakerState {
        &self.state
    }

    /// Snapshot for persistence into the checkpoint row.
    pub fn snapshot(&self) -> BreakerState {
        self.state.clone()
    }

    /// Gate a prospective call, advancing open → half-open when due.
    pub fn check(&mut self, now: DateTime<Utc>) -> Decision {
        let (next, decision) = check(&self.state, &self.config, now);
        self.state = next;
        decision
    }

    /// Record a call outcome, returning any transition for the audit trail.
    pub fn record(&mut self, outcome: CallOutcome, now: DateTime<Utc>) -> Option<TransitionEvent> {
        let (next, event) = transition(&self.state, &self.config, outcome, now);
        self.state = next;
        event
    }
}

//! Rolling error-rate breaker guarding the remote classifier.
//!
//! Counts requests and errors in a window that restarts once it is older than `window`.
//! After every recorded outcome, if at least `min_requests` were seen and the error ratio
//! exceeds `error_ratio`, the breaker opens for `cooldown`.
//!
//! Recovery is time-based only: there is no half-open probe. Once the cooldown has passed
//! the next call is an ordinary call and its outcome is counted into the (possibly already
//! reset) window like any other.

use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub window: Duration,
    pub min_requests: u32,
    pub error_ratio: f64,
    pub cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            min_requests: 4,
            error_ratio: 0.5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Copy of the breaker's accounting, for metrics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerState {
    #[serde(skip)]
    pub window_started_at: Instant,
    pub total_requests: u32,
    pub total_errors: u32,
    #[serde(skip)]
    pub open_until: Option<Instant>,
}

impl BreakerState {
    fn fresh(now: Instant) -> Self {
        Self {
            window_started_at: now,
            total_requests: 0,
            total_errors: 0,
            open_until: None,
        }
    }

    pub fn error_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            f64::from(self.total_errors) / f64::from(self.total_requests)
        }
    }
}

/// One breaker per guarded operation class. State is created on first use.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    state: Mutex<Option<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            state: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Option<BreakerState>> {
        // Accounting stays usable even if a holder panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current<'a>(&self, slot: &'a mut Option<BreakerState>, now: Instant) -> &'a mut BreakerState {
        let state = slot.get_or_insert_with(|| BreakerState::fresh(now));
        if now.saturating_duration_since(state.window_started_at) >= self.settings.window {
            *state = BreakerState::fresh(now);
        }
        state
    }

    pub fn is_open(&self) -> bool {
        self.is_open_at(Instant::now())
    }

    pub fn is_open_at(&self, now: Instant) -> bool {
        let mut slot = self.lock();
        let state = self.current(&mut slot, now);
        state.open_until.is_some_and(|until| now < until)
    }

    pub fn record_outcome(&self, success: bool) {
        self.record_outcome_at(success, Instant::now());
    }

    pub fn record_outcome_at(&self, success: bool, now: Instant) {
        let mut slot = self.lock();
        let state = self.current(&mut slot, now);
        let was_open = state.open_until.is_some_and(|until| now < until);

        state.total_requests += 1;
        if !success {
            state.total_errors += 1;
        }

        if state.total_requests >= self.settings.min_requests
            && state.error_ratio() > self.settings.error_ratio
        {
            state.open_until = Some(now + self.settings.cooldown);
            if !was_open {
                tracing::warn!(
                    breaker = %self.name,
                    total_requests = state.total_requests,
                    total_errors = state.total_errors,
                    cooldown_secs = self.settings.cooldown.as_secs(),
                    "circuit breaker opened"
                );
            }
        }
    }

    pub fn snapshot(&self) -> Option<BreakerState> {
        *self.lock()
    }
}

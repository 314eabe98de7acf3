use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{HttpConfig, UdpConfig};

use super::clock::{elapsed_between, Clock};

/// Minimum spacing the remote service tolerates between two requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrottlePolicy {
    pub short_delay: Duration,
    pub long_delay: Duration,
    /// Continuous activity after which `long_delay` applies.
    pub short_term_period: Duration,
    /// Idle gap that resets the activity window.
    pub reset_after: Duration,
}

impl ThrottlePolicy {
    pub fn flat(interval: Duration) -> Self {
        Self {
            short_delay: interval,
            long_delay: interval,
            short_term_period: Duration::MAX,
            reset_after: Duration::MAX,
        }
    }

    pub fn from_udp_config(config: &UdpConfig) -> Self {
        Self {
            short_delay: Duration::from_millis(config.short_delay_ms),
            long_delay: Duration::from_millis(config.long_delay_ms),
            short_term_period: Duration::from_secs(config.short_term_period_minutes * 60),
            reset_after: Duration::from_secs(config.throttle_reset_minutes * 60),
        }
    }

    pub fn from_http_config(config: &HttpConfig) -> Self {
        Self::flat(Duration::from_millis(config.min_interval_ms))
    }
}

#[derive(Debug, Default)]
struct ThrottleState {
    last_request_at: Option<DateTime<Utc>>,
    active_since: Option<DateTime<Utc>>,
}

pub struct RequestThrottle {
    policy: ThrottlePolicy,
    clock: Arc<dyn Clock>,
    state: Mutex<ThrottleState>,
}

impl RequestThrottle {
    pub fn new(policy: ThrottlePolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            state: Mutex::new(ThrottleState::default()),
        }
    }

    pub fn policy(&self) -> ThrottlePolicy {
        self.policy
    }

    /// How long the next request has to wait at `now`.
    pub fn delay_before_next(&self, now: DateTime<Utc>) -> Duration {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.delay_from(&state, now)
    }

    pub fn record_request(&self, at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.record_into(&mut state, at);
    }

    /// Sleeps until the next request is allowed and claims the slot. The state
    /// lock is held throughout, so concurrent callers are spaced one by one.
    pub fn wait_turn(&self) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let delay = self.delay_from(&state, self.clock.now());
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.record_into(&mut state, self.clock.now());
        delay
    }

    fn delay_from(&self, state: &ThrottleState, now: DateTime<Utc>) -> Duration {
        let Some(last_request_at) = state.last_request_at else {
            return Duration::ZERO;
        };

        let idle = elapsed_between(last_request_at, now);
        if idle >= self.policy.reset_after {
            return Duration::ZERO;
        }

        let active_for = state
            .active_since
            .map(|since| elapsed_between(since, now))
            .unwrap_or_default();
        let interval = if active_for >= self.policy.short_term_period {
            self.policy.long_delay
        } else {
            self.policy.short_delay
        };
        interval.saturating_sub(idle)
    }

    fn record_into(&self, state: &mut ThrottleState, at: DateTime<Utc>) {
        let window_expired = state
            .last_request_at
            .map(|last| elapsed_between(last, at) >= self.policy.reset_after)
            .unwrap_or(true);
        if window_expired {
            state.active_since = Some(at);
        }
        state.last_request_at = Some(at);
    }
}

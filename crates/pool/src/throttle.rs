// Copyright 2025 cloudpool contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A cool-down window that widens on observed rate-limit errors and narrows
//! back on success, plus a log-rate-limiter so repeated throttle messages
//! don't flood the log.

use std::{
    sync::Mutex,
    time::{Duration, SystemTime},
};

use cloudpool_cloud::CloudError;
use tracing::warn;

use crate::clock::SharedClock;

const MIN_HOLD: Duration = Duration::from_secs(1);
const MAX_HOLD: Duration = Duration::from_secs(10 * 60);
const LOG_RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(10);

struct State {
    hold_until: Option<SystemTime>,
    hold: Duration,
    last_logged: Option<SystemTime>,
}

/// Rate-limits an operation class (e.g. "create", "list") against a cloud
/// provider. Call [`Throttle::check_rate_limit_error`] after every attempt;
/// call [`Throttle::error`] before the next attempt to see whether the
/// operation should be skipped.
pub struct Throttle {
    clock: SharedClock,
    state: Mutex<State>,
}

impl Throttle {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self { clock, state: Mutex::new(State { hold_until: None, hold: MIN_HOLD, last_logged: None }) }
    }

    /// `Some(message)` if the throttle is currently open (a rate-limit error
    /// was recently observed and the cool-down window has not elapsed).
    #[must_use]
    pub fn error(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        let until = state.hold_until?;
        if self.clock.now() < until { Some(format!("throttled until {until:?}")) } else { None }
    }

    /// Inspect `err`. If it reports rate limiting, widen the hold window
    /// (capped at [`MAX_HOLD`]) and call `notify` once the window elapses
    /// (via the caller's own scheduling, not a timer owned by this type).
    /// Any other error narrows the window back toward [`MIN_HOLD`] on the
    /// assumption that non-rate-limit failures don't indicate we're going
    /// too fast.
    pub fn check_rate_limit_error(&self, err: &CloudError, op: &str) {
        let mut state = self.state.lock().unwrap();
        if err.is_rate_limit_error() {
            state.hold = (state.hold * 2).min(MAX_HOLD);
            state.hold_until = Some(self.clock.now() + state.hold);
            let now = self.clock.now();
            let should_log = state.last_logged.is_none_or(|t| now.duration_since(t).unwrap_or_default() >= LOG_RATE_LIMIT_INTERVAL);
            if should_log {
                state.last_logged = Some(now);
                warn!(operation = op, hold = ?state.hold, "rate limited, widening throttle window");
            }
        } else {
            state.hold = MIN_HOLD;
        }
    }

    /// Narrow the window after a successful operation.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.hold = MIN_HOLD;
        state.hold_until = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cloudpool_cloud::error::RateLimitSnafu;
    use snafu::Snafu as _;

    use super::Throttle;
    use crate::clock::FakeClock;

    #[test]
    fn rate_limit_error_opens_window() {
        let clock = Arc::new(FakeClock::default());
        let throttle = Throttle::new(clock.clone());
        assert!(throttle.error().is_none());

        let err = RateLimitSnafu { message: "too fast" }.build();
        throttle.check_rate_limit_error(&err, "create");
        assert!(throttle.error().is_some());

        clock.advance(std::time::Duration::from_secs(2));
        assert!(throttle.error().is_none());
    }

    #[test]
    fn success_narrows_window() {
        let clock = Arc::new(FakeClock::default());
        let throttle = Throttle::new(clock);
        let err = RateLimitSnafu { message: "too fast" }.build();
        throttle.check_rate_limit_error(&err, "create");
        throttle.record_success();
        assert!(throttle.error().is_none());
    }
}

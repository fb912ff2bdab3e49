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

//! A monotonic time source the pool reads through, so tests can advance time
//! without real sleeps.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

/// Anything that can report "now". Every timeout in this crate (booting,
/// idle, probe, shutdown) is computed against a `Clock` rather than
/// `SystemTime::now()` directly.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> SystemTime;
}

/// The real wall clock. Used everywhere outside tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime { SystemTime::now() }
}

/// A clock tests can advance deterministically.
#[derive(Debug, Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
}

impl Default for FakeClock {
    fn default() -> Self { Self { now: Arc::new(Mutex::new(SystemTime::now())) } }
}

impl FakeClock {
    #[must_use]
    pub fn new(start: SystemTime) -> Self { Self { now: Arc::new(Mutex::new(start)) } }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime { *self.now.lock().unwrap() }
}

pub type SharedClock = Arc<dyn Clock>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Clock, FakeClock};

    #[test]
    fn advance_moves_now_forward() {
        let clock = FakeClock::default();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), t0 + Duration::from_secs(5));
    }
}

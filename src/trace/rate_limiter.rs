// Copyright Starmesh Contributors 2025
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Token-based cap on sampled traces per second.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Bounds sampled traces to a fixed budget per second.
///
/// Gives a hard ceiling on sampling overhead independent of request rate, at
/// the cost of under-sampling during bursts.
#[derive(Debug)]
pub struct RateLimiter {
    traces_per_second: f64,
    state: Mutex<LimiterState>,
}

#[derive(Debug)]
struct LimiterState {
    available: f64,
    last_reset: Instant,
}

impl RateLimiter {
    /// Creates a limiter with a full token pool.
    pub fn new(traces_per_second: f64) -> Self {
        Self {
            traces_per_second,
            state: Mutex::new(LimiterState {
                available: traces_per_second,
                last_reset: Instant::now(),
            }),
        }
    }

    /// The configured budget.
    pub fn traces_per_second(&self) -> f64 {
        self.traces_per_second
    }

    /// Consumes one token if available. The pool resets to the full budget
    /// once per elapsed second.
    pub fn check(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if now.duration_since(state.last_reset) >= Duration::from_secs(1) {
            state.available = self.traces_per_second;
            state.last_reset = now;
        }
        if state.available >= 1.0 {
            state.available -= 1.0;
            true
        } else {
            false
        }
    }
}

//! Outbound request rate limiting
//!
//! Keeps the timestamps of recent requests and blocks the caller once
//! `max_requests` have been issued inside the trailing window.

use crate::config::RateLimitConfig;
use std::collections::VecDeque;
use tokio::time::{sleep, Duration, Instant};
use tracing::info;

/// Sliding-window request limiter with full-window reset on saturation
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    requests: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            requests: VecDeque::with_capacity(max_requests),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, Duration::from_secs(config.window_secs))
    }

    /// Wait until one more request fits in the window, then record it.
    ///
    /// When the window is saturated this sleeps until the oldest request
    /// leaves the window and then forgets the whole history, not just the
    /// expired slot.
    pub async fn wait_if_needed(&mut self) {
        let now = Instant::now();
        while let Some(oldest) = self.requests.front() {
            if now.duration_since(*oldest) >= self.window {
                self.requests.pop_front();
            } else {
                break;
            }
        }

        if self.requests.len() >= self.max_requests {
            if let Some(oldest) = self.requests.front() {
                let wait = self.window.saturating_sub(now.duration_since(*oldest));
                info!(
                    wait_ms = wait.as_millis() as u64,
                    max_requests = self.max_requests,
                    "Rate limit reached, waiting for window to clear"
                );
                sleep(wait).await;
            }
            self.requests.clear();
        }

        self.requests.push_back(Instant::now());
    }

    /// Requests currently counted against the window
    pub fn in_window(&self) -> usize {
        self.requests.len()
    }
}

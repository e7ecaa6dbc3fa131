// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Sliding-window rate limiter for interactive upstream calls.
//!
//! The limiter blocks rather than errors: an interactive caller always
//! completes, possibly delayed.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Default interactive budget: 200 calls per 60 seconds.
    pub fn default_interactive() -> Self {
        Self::new(200, Duration::from_secs(60))
    }

    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls,
            window,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one call, sleeping first if the window is saturated.
    pub async fn wait_if_needed(&self) {
        loop {
            let sleep_for = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                while let Some(front) = calls.front() {
                    if now.duration_since(*front) >= self.window {
                        calls.pop_front();
                    } else {
                        break;
                    }
                }
                if calls.len() < self.max_calls {
                    calls.push_back(now);
                    return;
                }
                // Oldest call ages out first; wait for that moment.
                let oldest = *calls.front().unwrap_or(&now);
                self.window.saturating_sub(now.duration_since(oldest))
            };
            tokio::time::sleep(sleep_for.max(Duration::from_millis(10))).await;
        }
    }

    /// Calls currently inside the window.
    pub async fn in_flight(&self) -> usize {
        let mut calls = self.calls.lock().await;
        let now = Instant::now();
        while let Some(front) = calls.front() {
            if now.duration_since(*front) >= self.window {
                calls.pop_front();
            } else {
                break;
            }
        }
        calls.len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn under_limit_never_blocks() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        let start = std::time::Instant::now();
        for _ in 0..5 {
            limiter.wait_if_needed().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(limiter.in_flight().await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_window_blocks_until_oldest_expires() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        limiter.wait_if_needed().await;
        limiter.wait_if_needed().await;

        let start = Instant::now();
        limiter.wait_if_needed().await; // must wait ~10s of virtual time
        assert!(start.elapsed() >= Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_entries_out() {
        let limiter = RateLimiter::new(3, Duration::from_secs(10));
        limiter.wait_if_needed().await;
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(limiter.in_flight().await, 0);
    }
}

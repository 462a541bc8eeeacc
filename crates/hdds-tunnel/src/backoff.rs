// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Exponential reconnect delay.
//!
//! Doubles from `min` up to `max` on every failed attempt. The supervisor
//! resets it once a connection has stayed up for the stable period, so a
//! link that flaps right after connecting keeps backing off.

use std::time::Duration;

/// Growth factor between consecutive attempts.
const BACKOFF_FACTOR: u32 = 2;

/// Reconnect delay generator.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt; grows the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(BACKOFF_FACTOR)
            .map_or(self.max, |d| d.min(self.max));
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Back to the minimum delay.
    pub fn reset(&mut self) {
        self.current = self.min;
        self.attempts = 0;
    }

    /// Attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

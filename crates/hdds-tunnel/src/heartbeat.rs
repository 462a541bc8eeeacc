// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Heartbeat liveness and latency monitor.
//!
//! The monitor is a synchronous state machine; it performs no I/O and never
//! sleeps. The connection tasks drive it:
//!
//! - the ticker calls [`HeartbeatMonitor::on_tick`] every interval and writes
//!   the returned Ping;
//! - the reader calls [`HeartbeatMonitor::on_ping`] / [`HeartbeatMonitor::on_pong`]
//!   for inbound control frames.
//!
//! Only the initiator detects liveness failure. A responder never treats the
//! absence of pings as a failure since the initiator's period may jitter.

use crate::codec::Frame;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Heartbeat role of one endpoint, fixed for the monitor's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatRole {
    /// Sends pings and detects liveness failure.
    Initiator,
    /// Echoes pings, never probes.
    Responder,
    /// No heartbeat traffic at all.
    Disabled,
}

impl std::fmt::Display for HeartbeatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HeartbeatRole::Initiator => "initiator",
            HeartbeatRole::Responder => "responder",
            HeartbeatRole::Disabled => "disabled",
        };
        write!(f, "{}", s)
    }
}

/// One matched ping/pong round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSample {
    pub sequence: u64,
    pub rtt: Duration,
    pub observed_at: Instant,
}

/// Result of one ticker step.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Ping to write, if the monitor probes.
    pub ping: Option<Frame>,
    /// Set on the tick where the missed streak first reaches the threshold.
    pub liveness_failed: bool,
}

/// Result of an inbound Pong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PongOutcome {
    /// Matched an outstanding ping.
    Matched {
        sample: HeartbeatSample,
        /// A previously reported liveness failure is over.
        restored: bool,
    },
    /// Already matched, older than the last match, or never sent.
    Stale,
}

/// Read-only view for health reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatStats {
    pub role: HeartbeatRole,
    pub next_sequence: u64,
    pub samples: usize,
    pub last_rtt: Option<Duration>,
    pub mean_rtt: Option<Duration>,
    pub min_rtt: Option<Duration>,
    pub max_rtt: Option<Duration>,
    pub missed_streak: u32,
    pub liveness_failed: bool,
    pub stale_pongs: u64,
}

/// Per-connection heartbeat state.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    role: HeartbeatRole,
    miss_threshold: u32,
    history_len: usize,

    next_sequence: u64,
    /// Pings sent and not yet matched, oldest first
    outstanding: VecDeque<(u64, Instant)>,
    highest_matched: Option<u64>,
    missed_streak: u32,
    liveness_failed: bool,
    history: VecDeque<HeartbeatSample>,
    stale_pongs: u64,
}

impl HeartbeatMonitor {
    pub fn new(role: HeartbeatRole, miss_threshold: u32, history_len: usize) -> Self {
        Self {
            role,
            miss_threshold: miss_threshold.max(1),
            history_len: history_len.max(1),
            next_sequence: 0,
            outstanding: VecDeque::new(),
            highest_matched: None,
            missed_streak: 0,
            liveness_failed: false,
            history: VecDeque::new(),
            stale_pongs: 0,
        }
    }

    pub fn role(&self) -> HeartbeatRole {
        self.role
    }

    /// Whether this monitor needs a ticker task.
    pub fn probes(&self) -> bool {
        self.role == HeartbeatRole::Initiator
    }

    /// Forget everything about the previous physical connection.
    pub fn reset(&mut self) {
        self.next_sequence = 0;
        self.outstanding.clear();
        self.highest_matched = None;
        self.missed_streak = 0;
        self.liveness_failed = false;
        self.history.clear();
        self.stale_pongs = 0;
    }

    /// Advance one heartbeat period.
    pub fn on_tick(&mut self, now: Instant) -> TickOutcome {
        if !self.probes() {
            return TickOutcome::default();
        }

        let mut outcome = TickOutcome::default();

        // The previous ping had a full period to be answered
        if self.last_sent_unanswered() {
            self.missed_streak += 1;
            if self.missed_streak >= self.miss_threshold && !self.liveness_failed {
                self.liveness_failed = true;
                outcome.liveness_failed = true;
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.outstanding.push_back((sequence, now));
        // Unanswered pings beyond the window can no longer influence the streak
        let window = (self.miss_threshold as usize * 4).max(16);
        while self.outstanding.len() > window {
            self.outstanding.pop_front();
        }

        outcome.ping = Some(Frame::Ping { sequence });
        outcome
    }

    /// Handle an inbound Ping; returns the Pong to send, if any.
    pub fn on_ping(&mut self, sequence: u64) -> Option<Frame> {
        match self.role {
            HeartbeatRole::Responder => Some(Frame::Pong { sequence }),
            HeartbeatRole::Initiator | HeartbeatRole::Disabled => None,
        }
    }

    /// Handle an inbound Pong.
    pub fn on_pong(&mut self, sequence: u64, now: Instant) -> PongOutcome {
        if !self.probes() || self.highest_matched.is_some_and(|h| sequence <= h) {
            self.stale_pongs += 1;
            return PongOutcome::Stale;
        }
        let Some(idx) = self.outstanding.iter().position(|(s, _)| *s == sequence) else {
            self.stale_pongs += 1;
            return PongOutcome::Stale;
        };

        let (_, sent_at) = self.outstanding[idx];
        // Older pings are superseded by this reply
        self.outstanding.drain(..=idx);
        self.highest_matched = Some(sequence);
        self.missed_streak = 0;

        let sample = HeartbeatSample {
            sequence,
            rtt: now.saturating_duration_since(sent_at),
            observed_at: now,
        };
        if self.history.len() == self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(sample);

        let restored = std::mem::replace(&mut self.liveness_failed, false);
        PongOutcome::Matched { sample, restored }
    }

    pub fn missed_streak(&self) -> u32 {
        self.missed_streak
    }

    pub fn liveness_failed(&self) -> bool {
        self.liveness_failed
    }

    /// Samples, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &HeartbeatSample> {
        self.history.iter()
    }

    /// Mean RTT over the retained history.
    pub fn rolling_latency(&self) -> Option<Duration> {
        if self.history.is_empty() {
            return None;
        }
        let total: Duration = self.history.iter().map(|s| s.rtt).sum();
        Some(total / self.history.len() as u32)
    }

    pub fn snapshot(&self) -> HeartbeatStats {
        HeartbeatStats {
            role: self.role,
            next_sequence: self.next_sequence,
            samples: self.history.len(),
            last_rtt: self.history.back().map(|s| s.rtt),
            mean_rtt: self.rolling_latency(),
            min_rtt: self.history.iter().map(|s| s.rtt).min(),
            max_rtt: self.history.iter().map(|s| s.rtt).max(),
            missed_streak: self.missed_streak,
            liveness_failed: self.liveness_failed,
            stale_pongs: self.stale_pongs,
        }
    }

    fn last_sent_unanswered(&self) -> bool {
        match (self.next_sequence.checked_sub(1), self.highest_matched) {
            (None, _) => false,
            (Some(last), Some(matched)) => last > matched,
            (Some(_), None) => true,
        }
    }
}

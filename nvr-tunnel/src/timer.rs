//! Per-client timer set
//!
//! A small, tick-driven set of one-shot and bounded repeating timers keyed by
//! [`TimerEvent`]. Expiries are delivered back through the connection state
//! machine, the same entry point used for inbound messages.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use std::time::{Duration, Instant};

/// Timer identity; at most one timer per event is armed at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerEvent {
    /// Re-check hole-punch attempts while waiting for Handshake-Req
    HandshakeResend,
    /// Wait for Handshake-Ack
    HandshakeAckWait,
    /// Wait for the login request
    LoginWait,
    /// Wait for the next Heartbeat-Req
    HeartbeatWait,
    /// Retry a Heartbeat-Resp that could not be sent
    HeartbeatResend,
    /// Resend Hold-Resp to keep the NAT binding open
    HoldAck,
    /// Refresh the relay allocation
    RelayRefresh,
}

/// How often a timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Once,
    /// Fires every interval, at most this many times
    Times(u32),
}

/// A timer that fired during [`TimerSet::expire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    pub event: TimerEvent,
    /// 1-based count of fires so far
    pub fire_count: u32,
    /// The timer has fired for the last time and is no longer armed
    pub exhausted: bool,
}

#[derive(Debug, Clone)]
struct TimerEntry {
    event: TimerEvent,
    deadline: Instant,
    interval: Duration,
    max_fires: u32,
    fired: u32,
}

/// Timers of one client, kept sorted by deadline
#[derive(Debug, Default)]
pub struct TimerSet {
    entries: Vec<TimerEntry>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) a timer; any timer for the same event is replaced
    pub fn arm(&mut self, event: TimerEvent, now: Instant, interval: Duration, repeat: Repeat) {
        self.cancel(event);
        let max_fires = match repeat {
            Repeat::Once => 1,
            Repeat::Times(n) => n.max(1),
        };
        self.insert(TimerEntry {
            event,
            deadline: now + interval,
            interval,
            max_fires,
            fired: 0,
        });
    }

    /// Disarm a timer; no-op when it is not armed
    pub fn cancel(&mut self, event: TimerEvent) {
        self.entries.retain(|entry| entry.event != event);
    }

    pub fn cancel_all(&mut self) {
        self.entries.clear();
    }

    pub fn is_armed(&self, event: TimerEvent) -> bool {
        self.entries.iter().any(|entry| entry.event == event)
    }

    /// Number of armed timers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|entry| entry.deadline)
    }

    /// Deadline of a specific timer
    pub fn deadline(&self, event: TimerEvent) -> Option<Instant> {
        self.entries
            .iter()
            .find(|entry| entry.event == event)
            .map(|entry| entry.deadline)
    }

    /// Collect every timer whose deadline has passed
    ///
    /// Repeating timers are re-armed one interval later until they reach
    /// their fire limit. Each timer fires at most once per call, so a long
    /// stall does not produce a burst of catch-up expiries.
    pub fn expire(&mut self, now: Instant) -> Vec<Expiry> {
        let mut fired = Vec::new();
        let mut rearm = Vec::new();

        while let Some(entry) = self.entries.first() {
            if entry.deadline > now {
                break;
            }
            let mut entry = self.entries.remove(0);
            entry.fired += 1;
            let exhausted = entry.fired >= entry.max_fires;
            fired.push(Expiry {
                event: entry.event,
                fire_count: entry.fired,
                exhausted,
            });
            if !exhausted {
                entry.deadline = now + entry.interval;
                rearm.push(entry);
            }
        }

        for entry in rearm {
            self.insert(entry);
        }
        fired
    }

    fn insert(&mut self, entry: TimerEntry) {
        let pos = self
            .entries
            .iter()
            .position(|e| e.deadline > entry.deadline)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_one_shot_fires_once() {
        let start = Instant::now();
        let mut timers = TimerSet::new();
        timers.arm(TimerEvent::LoginWait, start, 100 * MS, Repeat::Once);

        assert!(timers.expire(start + 99 * MS).is_empty());
        let fired = timers.expire(start + 100 * MS);
        assert_eq!(
            fired,
            vec![Expiry {
                event: TimerEvent::LoginWait,
                fire_count: 1,
                exhausted: true
            }]
        );
        assert!(timers.is_empty());
        assert!(timers.expire(start + 500 * MS).is_empty());
    }

    #[test]
    fn test_repeating_timer_is_bounded() {
        let start = Instant::now();
        let mut timers = TimerSet::new();
        timers.arm(TimerEvent::HoldAck, start, 10 * MS, Repeat::Times(3));

        let mut now = start;
        let mut fires = Vec::new();
        for _ in 0..10 {
            now += 10 * MS;
            fires.extend(timers.expire(now));
        }
        assert_eq!(fires.len(), 3);
        assert!(!fires[0].exhausted);
        assert!(!fires[1].exhausted);
        assert!(fires[2].exhausted);
        assert_eq!(fires[2].fire_count, 3);
        assert!(!timers.is_armed(TimerEvent::HoldAck));
    }

    #[test]
    fn test_rearm_replaces_existing() {
        let start = Instant::now();
        let mut timers = TimerSet::new();
        timers.arm(TimerEvent::HeartbeatWait, start, 100 * MS, Repeat::Once);
        timers.arm(TimerEvent::HeartbeatWait, start + 50 * MS, 100 * MS, Repeat::Once);

        assert_eq!(timers.len(), 1);
        assert!(timers.expire(start + 120 * MS).is_empty());
        assert_eq!(timers.expire(start + 150 * MS).len(), 1);
    }

    #[test]
    fn test_deadline_order() {
        let start = Instant::now();
        let mut timers = TimerSet::new();
        timers.arm(TimerEvent::HeartbeatWait, start, 300 * MS, Repeat::Once);
        timers.arm(TimerEvent::RelayRefresh, start, 100 * MS, Repeat::Once);
        timers.arm(TimerEvent::HoldAck, start, 200 * MS, Repeat::Once);

        assert_eq!(timers.next_deadline(), Some(start + 100 * MS));
        let fired: Vec<_> = timers
            .expire(start + 300 * MS)
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(
            fired,
            vec![TimerEvent::RelayRefresh, TimerEvent::HoldAck, TimerEvent::HeartbeatWait]
        );
    }

    #[test]
    fn test_cancel() {
        let start = Instant::now();
        let mut timers = TimerSet::new();
        timers.arm(TimerEvent::HandshakeAckWait, start, 10 * MS, Repeat::Once);
        timers.cancel(TimerEvent::HandshakeAckWait);
        timers.cancel(TimerEvent::HandshakeAckWait);
        assert!(timers.expire(start + 20 * MS).is_empty());
    }
}

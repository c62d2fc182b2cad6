//! Time and deferred work
//!
//! Routing changes never sleep. Mute sequencing describes what it did as a
//! [`MuteSchedule`] and hands the caller a [`Settle`] token: the time after
//! which the change is audible. Hardware commands that must land later carry
//! their delay to the hardware client instead.

use crate::domain::audio::IoHandle;
use crate::domain::strategy::Strategy;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Milliseconds a caller should wait for a routing change to settle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[must_use]
pub struct Settle {
    pub wait_ms: u32,
}

impl Settle {
    pub const NONE: Settle = Settle { wait_ms: 0 };

    pub fn after(wait_ms: u32) -> Self {
        Self { wait_ms }
    }

    /// Two waits running concurrently settle when the longer one does
    pub fn join(self, other: Settle) -> Settle {
        Settle {
            wait_ms: self.wait_ms.max(other.wait_ms),
        }
    }

    pub fn is_immediate(&self) -> bool {
        self.wait_ms == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MuteAction {
    Mute,
    Unmute,
}

/// A strategy mute change on one output, taking effect after `delay_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduledAction {
    pub delay_ms: u32,
    pub output: IoHandle,
    pub strategy: Strategy,
    pub action: MuteAction,
}

/// Mutes asserted around a device switch and the wait they impose
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MuteSchedule {
    pub actions: Vec<ScheduledAction>,
    /// Time the muted audio needs to drain before the switch
    pub wait_ms: u32,
}

impl MuteSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: ScheduledAction) {
        self.actions.push(action);
    }

    pub fn wait_at_least(&mut self, wait_ms: u32) {
        self.wait_ms = self.wait_ms.max(wait_ms);
    }

    /// Residual wait once `delay_ms` has already been granted to the switch
    pub fn residual(&self, delay_ms: u32) -> Settle {
        Settle::after(self.wait_ms.saturating_sub(delay_ms))
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.wait_ms == 0
    }
}

/// Monotonic millisecond time source
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock measured from construction
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        // starts at 1 so that "stopped at 0" never reads as recent
        self.origin.elapsed().as_millis() as u64 + 1
    }
}

/// Clock advanced by hand, shared between a test and the manager
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settle_join_takes_longest() {
        let a = Settle::after(40);
        let b = Settle::after(120);
        assert_eq!(a.join(b), b);
        assert!(Settle::NONE.is_immediate());
    }

    #[test]
    fn test_mute_schedule_residual() {
        let mut schedule = MuteSchedule::new();
        schedule.wait_at_least(80);
        schedule.wait_at_least(40);
        assert_eq!(schedule.wait_ms, 80);
        assert_eq!(schedule.residual(30), Settle::after(50));
        assert_eq!(schedule.residual(100), Settle::NONE);
    }

    #[test]
    fn test_manual_clock_is_shared() {
        let clock = ManualClock::new(1000);
        let handle = clock.clone();
        handle.advance(250);
        assert_eq!(clock.now_ms(), 1250);
        clock.set(10);
        assert_eq!(handle.now_ms(), 10);
    }
}

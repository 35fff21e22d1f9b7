//! Commit cadence and one-shot timers.
//!
//! Timers are polled from the tick loop with an injected clock (ms). A
//! [`TimerSlot`] holds at most one deadline, so rearming replaces rather than
//! stacks and a double fire cannot be expressed.

use serde::{Deserialize, Serialize};

use crate::logging::{log, obj, Domain, Level};
use serde_json::json;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimerSlot {
    deadline: Option<u64>,
    /// Times this slot has been armed
    generation: u64,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel whatever is pending, then arm for `at`.
    pub fn arm(&mut self, at: u64) {
        self.cancel();
        self.deadline = Some(at);
        self.generation += 1;
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Consume the deadline if it is due.
    pub fn fire(&mut self, now: u64) -> bool {
        match self.deadline {
            Some(at) if now >= at => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Fires commit requests every `interval_ms`, independent of sample rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceScheduler {
    interval_ms: u64,
    timer: TimerSlot,
    /// Fires skipped by fast-forwarding after a stall
    skipped: u64,
}

impl CadenceScheduler {
    pub fn new(interval_ms: u64) -> Self {
        Self { interval_ms: interval_ms.max(1), timer: TimerSlot::new(), skipped: 0 }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn next_fire_at(&self) -> Option<u64> {
        self.timer.deadline()
    }

    pub fn is_suspended(&self) -> bool {
        !self.timer.is_armed()
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Re-anchor to `now + interval`.
    pub fn resume(&mut self, now: u64) {
        self.timer.arm(now + self.interval_ms);
    }

    pub fn suspend(&mut self) {
        self.timer.cancel();
    }

    /// Fire at most once. After a fire the next deadline is advanced by whole
    /// intervals to the first slot strictly after `now`, so a stall costs one
    /// commit, not a burst.
    pub fn poll(&mut self, now: u64) -> bool {
        let Some(due) = self.timer.deadline() else {
            return false;
        };
        if !self.timer.fire(now) {
            return false;
        }
        let behind = (now - due) / self.interval_ms;
        let next = due + (behind + 1) * self.interval_ms;
        if behind > 0 {
            self.skipped += behind;
            log(
                Level::Debug,
                Domain::Cadence,
                "fast_forward",
                obj(&[("behind", json!(behind)), ("next_fire_at", json!(next)), ("now", json!(now))]),
            );
        }
        self.timer.arm(next);
        true
    }

    /// Fraction of the current interval elapsed, 0 when suspended.
    pub fn progress(&self, now: u64) -> f64 {
        match self.timer.deadline() {
            Some(at) => {
                let start = at.saturating_sub(self.interval_ms);
                (now.saturating_sub(start) as f64 / self.interval_ms as f64).clamp(0.0, 1.0)
            }
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_slot_rearm_replaces() {
        let mut t = TimerSlot::new();
        t.arm(100);
        t.arm(500);
        assert!(!t.fire(100));
        assert!(t.fire(500));
        assert!(!t.fire(600));
        assert_eq!(t.generation(), 2);
    }

    #[test]
    fn test_fires_on_cadence() {
        let mut s = CadenceScheduler::new(1000);
        s.resume(0);
        let fires: Vec<u64> = (0..=3000).step_by(16).filter(|&now| s.poll(now)).collect();
        assert_eq!(fires.len(), 2);
        assert!(fires[0] >= 1000 && fires[0] < 1016);
    }

    #[test]
    fn test_stall_fires_once_and_fast_forwards() {
        let mut s = CadenceScheduler::new(1000);
        s.resume(0);
        assert_eq!(s.next_fire_at(), Some(1000));

        // tab stalled until t=5000
        assert!(s.poll(5000));
        assert!(!s.poll(5000));
        assert_eq!(s.next_fire_at(), Some(6000));
        assert_eq!(s.skipped(), 4);

        let mut s = CadenceScheduler::new(1000);
        s.resume(0);
        assert!(s.poll(5500));
        assert!(!s.poll(5999));
        assert_eq!(s.next_fire_at(), Some(6000));
    }

    #[test]
    fn test_suspend_and_resume_reanchor() {
        let mut s = CadenceScheduler::new(1000);
        s.resume(0);
        s.suspend();
        assert!(s.is_suspended());
        assert!(!s.poll(10_000));
        s.resume(10_250);
        assert_eq!(s.next_fire_at(), Some(11_250));
        assert_eq!(s.progress(10_250), 0.0);
        assert!((s.progress(10_750) - 0.5).abs() < 1e-9);
    }
}

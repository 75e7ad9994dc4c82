//! Timer settings and the per-buffer retransmission timer state.
//!
//! Every buffer the engine may have to resend (a branch request, a local CANCEL,
//! or the transaction's upstream reply) owns one [`RetrTimer`]. It carries two
//! independent deadlines:
//!
//! - **Retransmit deadline**: resend the buffer, then back off
//!   `T1, 2*T1, 4*T1, ...` capped at `T2` (RFC 3261 Timers A, E and G).
//! - **Final deadline**: fires once (RFC 3261 Timers B, F and H).
//!
//! Disabling a deadline only clears a flag. The matching wheel entry is dropped
//! when the sweep next visits it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::time::Duration;

use super::ticks::Ticks;

/// Timer durations used by one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerSettings {
    /// Initial retransmission interval (RFC 3261 T1).
    #[serde(with = "crate::config::duration_ms")]
    pub t1: Duration,
    /// Retransmission interval ceiling (RFC 3261 T2).
    #[serde(with = "crate::config::duration_ms")]
    pub t2: Duration,
    /// Final response deadline for non-INVITE branches, and for INVITE
    /// branches until a provisional reply arrives.
    #[serde(with = "crate::config::duration_ms")]
    pub fr_timeout: Duration,
    /// Final response deadline for INVITE branches after a provisional reply.
    #[serde(with = "crate::config::duration_ms")]
    pub fr_inv_timeout: Duration,
    /// How long a completed transaction stays in the table to absorb retransmissions.
    #[serde(with = "crate::config::duration_ms")]
    pub wait_timeout: Duration,
    /// Interval of the check that waits for the last handle to be released.
    #[serde(with = "crate::config::duration_ms")]
    pub delete_timeout: Duration,
    /// Resolution of the timer sweep.
    #[serde(with = "crate::config::duration_ms")]
    pub tick: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            fr_timeout: Duration::from_secs(30),
            fr_inv_timeout: Duration::from_secs(120),
            wait_timeout: Duration::from_secs(5),
            delete_timeout: Duration::from_millis(200),
            tick: Duration::from_millis(50),
        }
    }
}

const RETR_ACTIVE: u8 = 0x01;
const FR_ACTIVE: u8 = 0x02;
const FR_FIRED: u8 = 0x04;

/// Which deadline of a [`RetrTimer`] a wheel entry stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Retransmit,
    Final,
}

/// Retransmission state of one buffer.
///
/// All fields are atomics so the sweep and the reply path can touch the timer
/// without the reply lock. Each (re)arm bumps a generation counter; wheel
/// entries carrying an older generation are stale and get dropped.
#[derive(Debug, Default)]
pub struct RetrTimer {
    flags: AtomicU8,
    retr_gen: AtomicU32,
    fr_gen: AtomicU32,
    retr_interval: AtomicU32,
    retr_expire: AtomicU32,
    fr_expire: AtomicU32,
}

impl RetrTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms both deadlines. `retr_interval` is `None` on reliable transports.
    ///
    /// Returns the wheel entries to schedule as `(deadline, expire, generation)`.
    pub fn start(&self, now: Ticks, retr_interval: Option<u32>, fr_ticks: u32) -> Vec<(Deadline, Ticks, u32)> {
        let mut armed = Vec::with_capacity(2);
        let fr_expire = now.after(fr_ticks);
        self.fr_expire.store(fr_expire.0, Ordering::Relaxed);
        let fr_gen = self.fr_gen.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let mut flags = FR_ACTIVE;
        if let Some(interval) = retr_interval {
            let retr_expire = now.after(interval);
            if !fr_expire.is_before(retr_expire) {
                self.retr_interval.store(interval, Ordering::Relaxed);
                self.retr_expire.store(retr_expire.0, Ordering::Relaxed);
                let retr_gen = self.retr_gen.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
                flags |= RETR_ACTIVE;
                armed.push((Deadline::Retransmit, retr_expire, retr_gen));
            }
        }
        self.flags.store(flags, Ordering::Release);
        armed.push((Deadline::Final, fr_expire, fr_gen));
        armed
    }

    /// Moves the final deadline to `now + fr_ticks`, keeping retransmission state.
    pub fn restart_final(&self, now: Ticks, fr_ticks: u32) -> Option<(Deadline, Ticks, u32)> {
        if self.flags.load(Ordering::Acquire) & FR_FIRED != 0 {
            return None;
        }
        let fr_expire = now.after(fr_ticks);
        self.fr_expire.store(fr_expire.0, Ordering::Relaxed);
        let fr_gen = self.fr_gen.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        self.flags.fetch_or(FR_ACTIVE, Ordering::AcqRel);
        Some((Deadline::Final, fr_expire, fr_gen))
    }

    /// Restarts retransmission at a fixed interval, e.g. `T2` for a non-INVITE
    /// request that already got a provisional reply.
    pub fn restart_retransmit(&self, now: Ticks, interval: u32) -> Option<(Deadline, Ticks, u32)> {
        if self.flags.load(Ordering::Acquire) & FR_ACTIVE == 0 {
            return None;
        }
        let retr_expire = now.after(interval);
        if Ticks(self.fr_expire.load(Ordering::Relaxed)).is_before(retr_expire) {
            self.stop_retransmit();
            return None;
        }
        self.retr_interval.store(interval, Ordering::Relaxed);
        self.retr_expire.store(retr_expire.0, Ordering::Relaxed);
        let retr_gen = self.retr_gen.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        self.flags.fetch_or(RETR_ACTIVE, Ordering::AcqRel);
        Some((Deadline::Retransmit, retr_expire, retr_gen))
    }

    /// Called after a retransmission: doubles the interval up to `t2` and
    /// returns the next wheel entry, or `None` when it would pass the final deadline.
    pub fn backoff(&self, now: Ticks, t2: u32) -> Option<(Deadline, Ticks, u32)> {
        let current = self.retr_interval.load(Ordering::Relaxed);
        let next = next_backoff_interval(current, t2);
        let retr_expire = now.after(next);
        if Ticks(self.fr_expire.load(Ordering::Relaxed)).is_before(retr_expire) {
            self.stop_retransmit();
            return None;
        }
        self.retr_interval.store(next, Ordering::Relaxed);
        self.retr_expire.store(retr_expire.0, Ordering::Relaxed);
        let retr_gen = self.retr_gen.load(Ordering::Acquire);
        Some((Deadline::Retransmit, retr_expire, retr_gen))
    }

    pub fn stop_retransmit(&self) {
        self.flags.fetch_and(!RETR_ACTIVE, Ordering::AcqRel);
    }

    pub fn stop_final(&self) {
        self.flags.fetch_and(!FR_ACTIVE, Ordering::AcqRel);
    }

    /// Disables both deadlines.
    pub fn stop(&self) {
        self.flags.fetch_and(!(RETR_ACTIVE | FR_ACTIVE), Ordering::AcqRel);
    }

    /// Whether a wheel entry for `deadline` with `generation` may still fire.
    pub fn is_live(&self, deadline: Deadline, generation: u32) -> bool {
        let flags = self.flags.load(Ordering::Acquire);
        match deadline {
            Deadline::Retransmit => {
                flags & RETR_ACTIVE != 0 && self.retr_gen.load(Ordering::Acquire) == generation
            }
            Deadline::Final => {
                flags & FR_ACTIVE != 0 && self.fr_gen.load(Ordering::Acquire) == generation
            }
        }
    }

    /// Claims the final deadline. Returns `true` exactly once per arm.
    pub fn fire_final(&self, generation: u32) -> bool {
        if self.fr_gen.load(Ordering::Acquire) != generation {
            return false;
        }
        let prev = self.flags.fetch_and(!(RETR_ACTIVE | FR_ACTIVE), Ordering::AcqRel);
        if prev & FR_ACTIVE == 0 {
            return false;
        }
        self.flags.fetch_or(FR_FIRED, Ordering::AcqRel);
        true
    }

    pub fn is_retransmitting(&self) -> bool {
        self.flags.load(Ordering::Acquire) & RETR_ACTIVE != 0
    }

    pub fn is_armed(&self) -> bool {
        self.flags.load(Ordering::Acquire) & (RETR_ACTIVE | FR_ACTIVE) != 0
    }

    pub fn final_fired(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FR_FIRED != 0
    }

    /// Current retransmission interval in ticks.
    pub fn interval(&self) -> u32 {
        self.retr_interval.load(Ordering::Relaxed)
    }
}

/// Next retransmission interval: doubled, capped at `max`.
pub fn next_backoff_interval(current: u32, max: u32) -> u32 {
    current.saturating_mul(2).min(max).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence_never_exceeds_t2() {
        let t1 = 10;
        let t2 = 80;
        let mut interval = t1;
        let mut seen = vec![interval];
        for _ in 0..8 {
            interval = next_backoff_interval(interval, t2);
            seen.push(interval);
        }
        assert_eq!(seen, vec![10, 20, 40, 80, 80, 80, 80, 80, 80]);
    }

    #[test]
    fn test_start_clamps_retransmit_to_final_deadline() {
        let timer = RetrTimer::new();
        let armed = timer.start(Ticks(0), Some(50), 20);
        assert_eq!(armed.len(), 1);
        assert_eq!(armed[0].0, Deadline::Final);
        assert!(!timer.is_retransmitting());
    }

    #[test]
    fn test_stale_generation_is_not_live() {
        let timer = RetrTimer::new();
        let first = timer.start(Ticks(0), Some(10), 100);
        let (_, _, fr_gen) = first[1];
        let (_, _, new_gen) = timer.restart_final(Ticks(5), 200).unwrap();
        assert!(!timer.is_live(Deadline::Final, fr_gen));
        assert!(timer.is_live(Deadline::Final, new_gen));
    }

    #[test]
    fn test_fire_final_once() {
        let timer = RetrTimer::new();
        let armed = timer.start(Ticks(0), Some(10), 100);
        let (_, _, fr_gen) = armed[1];
        assert!(timer.fire_final(fr_gen));
        assert!(!timer.fire_final(fr_gen));
        assert!(timer.final_fired());
        assert!(!timer.is_retransmitting());
    }

    #[test]
    fn test_backoff_stops_at_final_deadline() {
        let timer = RetrTimer::new();
        timer.start(Ticks(0), Some(10), 35);
        assert!(timer.backoff(Ticks(10), 80).is_some());
        assert_eq!(timer.interval(), 20);
        assert!(timer.backoff(Ticks(30), 80).is_none());
        assert!(!timer.is_retransmitting());
    }
}

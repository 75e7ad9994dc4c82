//! Wraparound-safe tick counts.
//!
//! Deadlines are 32-bit tick counts that are allowed to wrap. Two ticks are
//! always compared through signed subtraction, which stays correct as long as
//! they are less than 2^31 ticks apart.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// A point on the timer wheel's tick axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ticks(pub u32);

impl Ticks {
    /// `self` is strictly earlier than `other`.
    pub fn is_before(self, other: Ticks) -> bool {
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    /// `self` is at or before `other`.
    pub fn reached_by(self, other: Ticks) -> bool {
        (other.0.wrapping_sub(self.0) as i32) >= 0
    }

    pub fn after(self, ticks: u32) -> Ticks {
        Ticks(self.0.wrapping_add(ticks))
    }

    /// Number of ticks from `earlier` to `self`, zero if `earlier` is later.
    pub fn since(self, earlier: Ticks) -> u32 {
        let d = self.0.wrapping_sub(earlier.0) as i32;
        d.max(0) as u32
    }
}

impl fmt::Display for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Source of the current tick.
///
/// `Monotonic` follows `tokio::time::Instant`, so it also obeys a paused test
/// runtime. `Manual` only moves when [`TickClock::advance`] is called.
#[derive(Debug)]
pub enum TickClock {
    Monotonic {
        start: Instant,
        offset: u32,
        tick: Duration,
    },
    Manual {
        now: AtomicU32,
        tick: Duration,
    },
}

impl TickClock {
    pub fn monotonic(tick: Duration) -> Self {
        TickClock::Monotonic { start: Instant::now(), offset: 0, tick }
    }

    /// A manual clock starting at `start`. Useful to exercise wraparound.
    pub fn manual(tick: Duration, start: u32) -> Self {
        TickClock::Manual { now: AtomicU32::new(start), tick }
    }

    pub fn now(&self) -> Ticks {
        match self {
            TickClock::Monotonic { start, offset, tick } => {
                let elapsed = start.elapsed().as_nanos() / tick.as_nanos().max(1);
                Ticks(offset.wrapping_add(elapsed as u32))
            }
            TickClock::Manual { now, .. } => Ticks(now.load(Ordering::Acquire)),
        }
    }

    pub fn tick(&self) -> Duration {
        match self {
            TickClock::Monotonic { tick, .. } | TickClock::Manual { tick, .. } => *tick,
        }
    }

    /// Duration to whole ticks, rounded up and at least one. Capped at half
    /// the tick range so the deadline still compares after `now`.
    pub fn ticks_for(&self, d: Duration) -> u32 {
        let n = d.as_nanos().div_ceil(self.tick().as_nanos().max(1));
        n.clamp(1, u128::from(u32::MAX / 2)) as u32
    }

    /// Moves a manual clock forward. Has no effect on a monotonic clock.
    pub fn advance(&self, d: Duration) {
        if let TickClock::Manual { now, tick } = self {
            let n = d.as_nanos().div_ceil(tick.as_nanos().max(1)) as u32;
            now.fetch_add(n, Ordering::AcqRel);
        }
    }
}

/// Remembers the last tick the sweep processed.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SweepCursor(Option<Ticks>);

impl SweepCursor {
    pub(crate) fn new() -> Self {
        Self(None)
    }

    /// A cursor that already processed `tick`.
    pub(crate) fn at(tick: Ticks) -> Self {
        Self(Some(tick))
    }

    pub(crate) fn last(&self) -> Option<Ticks> {
        self.0
    }

    /// Returns the ticks to visit up to `now`, oldest first, and records `now`.
    /// A gap wider than `max_span` is collapsed to the last `max_span` ticks.
    pub(crate) fn advance_to(&mut self, now: Ticks, max_span: u32) -> Vec<Ticks> {
        let from = match self.0 {
            Some(prev) if prev.is_before(now) => prev.after(1),
            Some(_) => return Vec::new(),
            None => now,
        };
        self.0 = Some(now);
        let span = now.since(from).saturating_add(1);
        let span = span.min(max_span);
        let first = Ticks(now.0.wrapping_sub(span - 1));
        (0..span).map(|i| first.after(i)).collect()
    }
}

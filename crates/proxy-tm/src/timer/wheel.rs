//! Hashed timer wheel driven by an external sweep.
//!
//! Entries are bucketed by `expire % slots`. Each sweep visits the slots of
//! every tick elapsed since the previous sweep, fires the entries whose expiry
//! has been reached and keeps those belonging to a later round. Entries the
//! caller reports as dead are unlinked during the same visit, so disabling a
//! timer never has to touch the wheel.
//!
//! The cursor lock is held while an entry is bucketed and for a whole sweep,
//! so an entry can never land behind a sweep in progress.

use parking_lot::Mutex;

use super::ticks::{SweepCursor, Ticks};

const DEFAULT_SLOTS: usize = 512;

#[derive(Debug)]
struct WheelEntry<T> {
    expire: Ticks,
    generation: u32,
    payload: T,
}

/// An entry removed from the wheel because its expiry was reached.
#[derive(Debug)]
pub struct Expired<T> {
    pub expire: Ticks,
    pub generation: u32,
    pub payload: T,
}

#[derive(Debug)]
pub struct TimerWheel<T> {
    slots: Box<[Mutex<Vec<WheelEntry<T>>>]>,
    cursor: Mutex<SweepCursor>,
}

impl<T> TimerWheel<T> {
    pub fn new() -> Self {
        Self::with_slots(DEFAULT_SLOTS)
    }

    pub fn with_slots(slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            slots: (0..slots).map(|_| Mutex::new(Vec::new())).collect(),
            cursor: Mutex::new(SweepCursor::new()),
        }
    }

    /// A wheel whose first sweep continues right after `now`, so entries
    /// scheduled before that sweep are not skipped.
    pub fn starting_at(now: Ticks) -> Self {
        Self {
            slots: (0..DEFAULT_SLOTS).map(|_| Mutex::new(Vec::new())).collect(),
            cursor: Mutex::new(SweepCursor::at(now)),
        }
    }

    fn slot_of(&self, tick: Ticks) -> usize {
        tick.0 as usize % self.slots.len()
    }

    /// Schedules `payload` to fire once `expire` is reached.
    pub fn schedule(&self, expire: Ticks, generation: u32, payload: T) {
        let cursor = self.cursor.lock();
        // Ticks the sweep already passed are parked on the next tick it will visit.
        let bucket = match cursor.last() {
            Some(last) if expire.reached_by(last) => last.after(1),
            _ => expire,
        };
        let idx = self.slot_of(bucket);
        self.slots[idx].lock().push(WheelEntry { expire, generation, payload });
    }

    /// Visits every slot elapsed up to `now`.
    ///
    /// `live` is asked about every visited entry; entries it rejects are dropped
    /// whether or not they are due.
    pub fn sweep<F>(&self, now: Ticks, mut live: F) -> Vec<Expired<T>>
    where
        F: FnMut(&T, u32) -> bool,
    {
        let mut fired = Vec::new();
        let mut cursor = self.cursor.lock();
        for tick in cursor.advance_to(now, self.slots.len() as u32) {
            let idx = self.slot_of(tick);
            let mut slot = self.slots[idx].lock();
            let mut keep = Vec::with_capacity(slot.len());
            for entry in slot.drain(..) {
                if !live(&entry.payload, entry.generation) {
                    continue;
                }
                if entry.expire.reached_by(now) {
                    fired.push(Expired {
                        expire: entry.expire,
                        generation: entry.generation,
                        payload: entry.payload,
                    });
                } else {
                    keep.push(entry);
                }
            }
            *slot = keep;
        }
        drop(cursor);
        fired.sort_by(|a, b| {
            if a.expire == b.expire {
                std::cmp::Ordering::Equal
            } else if a.expire.is_before(b.expire) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        });
        fired
    }

    /// Number of linked entries, including stale ones not yet visited.
    pub fn len(&self) -> usize {
        self.slots.iter().map(|s| s.lock().len()).sum()
    }
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

//! Timer subsystem of the transaction engine.
//!
//! - [`ticks`]: wraparound-safe tick arithmetic and the clock the sweep reads.
//! - [`types`]: [`TimerSettings`] and the per-buffer [`RetrTimer`].
//! - [`wheel`]: the hashed [`TimerWheel`] the sweep drains.
//!
//! The handlers that act on expired entries live with the manager, which owns
//! the transport and the reply state machine they feed.

pub mod ticks;
pub mod types;
pub mod wheel;

pub use ticks::{TickClock, Ticks};
pub use types::{next_backoff_interval, Deadline, RetrTimer, TimerSettings};
pub use wheel::{Expired, TimerWheel};

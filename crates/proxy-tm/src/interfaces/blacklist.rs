use std::fmt;
use std::time::Duration;

use crate::message::Destination;

/// Why a destination is being blacklisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistReason {
    SendFailed,
    Timeout,
    /// The destination answered 503.
    Unavailable,
}

/// Check/notify interface of the destination blacklist store.
pub trait Blacklist: Send + Sync + fmt::Debug {
    fn is_blacklisted(&self, destination: &Destination) -> bool;

    fn add(&self, destination: &Destination, reason: BlacklistReason, ttl: Duration);
}

/// A blacklist that never blocks anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBlacklist;

impl Blacklist for NoBlacklist {
    fn is_blacklisted(&self, _destination: &Destination) -> bool {
        false
    }

    fn add(&self, _destination: &Destination, _reason: BlacklistReason, _ttl: Duration) {}
}

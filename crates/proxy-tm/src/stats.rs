use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide counters.
#[derive(Debug, Default)]
pub struct TmStats {
    created: AtomicU64,
    completed: AtomicU64,
    freed: AtomicU64,
    relayed: [AtomicU64; 6],
    local_replies: AtomicU64,
    retransmissions: AtomicU64,
    failovers: AtomicU64,
    canceled_branches: AtomicU64,
    branch_timeouts: AtomicU64,
}

/// Point-in-time copy of [`TmStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub created: u64,
    pub completed: u64,
    pub freed: u64,
    /// Relayed final replies, indexed by class (`[1xx, 2xx, ..., 6xx]`).
    pub relayed: [u64; 6],
    pub local_replies: u64,
    pub retransmissions: u64,
    pub failovers: u64,
    pub canceled_branches: u64,
    pub branch_timeouts: u64,
}

impl TmStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn transaction_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transaction_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transaction_freed(&self) {
        self.freed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reply_relayed(&self, code: u16) {
        let class = usize::from(code / 100);
        if (1..=6).contains(&class) {
            self.relayed[class - 1].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn local_reply(&self) {
        self.local_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retransmission(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn branch_canceled(&self) {
        self.canceled_branches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn branch_timeout(&self) {
        self.branch_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            created: load(&self.created),
            completed: load(&self.completed),
            freed: load(&self.freed),
            relayed: [
                load(&self.relayed[0]),
                load(&self.relayed[1]),
                load(&self.relayed[2]),
                load(&self.relayed[3]),
                load(&self.relayed[4]),
                load(&self.relayed[5]),
            ],
            local_replies: load(&self.local_replies),
            retransmissions: load(&self.retransmissions),
            failovers: load(&self.failovers),
            canceled_branches: load(&self.canceled_branches),
            branch_timeouts: load(&self.branch_timeouts),
        }
    }
}

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::transaction::TransactionKey;

/// Notifications about what the engine did with a transaction.
///
/// Events are informational: the engine never waits for a subscriber and
/// drops events for subscribers whose channel is full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEvent {
    Created {
        transaction_id: TransactionKey,
    },
    ProvisionalRelayed {
        transaction_id: TransactionKey,
        branch: usize,
        status: u16,
    },
    /// A final reply went upstream. `late` marks a 2xx pushed after completion.
    FinalReplied {
        transaction_id: TransactionKey,
        branch: Option<usize>,
        status: u16,
        local: bool,
        late: bool,
    },
    BranchTimedOut {
        transaction_id: TransactionKey,
        branch: usize,
    },
    BranchFailedOver {
        transaction_id: TransactionKey,
        from: usize,
        to: usize,
    },
    BranchCanceled {
        transaction_id: TransactionKey,
        branch: usize,
    },
    Terminated {
        transaction_id: TransactionKey,
    },
}

#[derive(Debug, Default)]
pub(crate) struct EventHub {
    subscribers: Mutex<Vec<mpsc::Sender<TransactionEvent>>>,
}

impl EventHub {
    pub(crate) fn subscribe(&self, capacity: usize) -> mpsc::Receiver<TransactionEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.lock().push(tx);
        debug!("New subscription to transaction events created");
        rx
    }

    pub(crate) fn emit(&self, event: TransactionEvent) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|s| !s.is_closed());
        for subscriber in subscribers.iter() {
            if let Err(e) = subscriber.try_send(event.clone()) {
                trace!(error = %e, "dropping transaction event");
            }
        }
    }
}

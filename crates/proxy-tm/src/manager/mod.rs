//! # Transaction Manager for a Stateful Proxy
//!
//! The [`TransactionManager`] owns the transaction table, the timer wheel and
//! the collaborators (transport, resolver, message builder, blacklist and
//! route hooks). Everything the proxy does with a transaction goes through it:
//!
//! ```text
//!   upstream request ──► relay / new_transaction ──► forward ──► branches ──► transport
//!                                                                   │
//!   upstream reply   ◄── reply relay ◄── pick_branch ◄── reply_received ◄──┘
//!                           │
//!                           └─► failure route ──► new branches (serial forking)
//! ```
//!
//! ## Concurrency
//!
//! The manager is `Clone` and meant to be shared across tasks. Replies for the
//! same transaction may be processed concurrently: every branch state change,
//! the upstream reply and the stored replies are guarded by the transaction's
//! reply lock, which is never held across an `.await`. Sends, CANCELs and
//! retransmissions are decided under the lock and performed after it is
//! released.
//!
//! ## Timers
//!
//! Timers live on a hashed wheel swept by [`TransactionManager::run_timers`].
//! [`TransactionManager::start_timer_task`] drives the sweep from a tokio
//! interval; tests call `run_timers` directly on a manual clock.

mod cancel;
mod events;
mod failover;
mod forward;
mod reply;
mod timers;

pub use events::TransactionEvent;

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{ConfigHandle, TmConfig};
use crate::error::{Error, Result};
use crate::interfaces::Collaborators;
use crate::message::{reason_phrase, Destination, Method, SipRequest};
use crate::stats::{StatsSnapshot, TmStats};
use crate::timer::{TickClock, TimerWheel};
use crate::transaction::key::dialog_hash;
use crate::transaction::{
    cell::flags, BranchTarget, Transaction, TransactionHandle, TransactionKey, TransactionOptions,
    TransactionTable,
};

use events::EventHub;
use reply::ReplyDecision;
use timers::TimerTarget;

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Result of [`TransactionManager::relay`].
#[derive(Debug, Clone)]
pub enum RelayOutcome {
    /// A new transaction was created and forwarded.
    Forwarded(TransactionHandle),
    /// The request retransmitted an existing transaction; the last upstream
    /// reply, if any, was resent.
    Retransmission(TransactionHandle),
    /// A hop-by-hop ACK for a negative reply, consumed here.
    AckAbsorbed,
    /// An ACK matching no negative reply; the caller forwards it statelessly.
    AckNotMatched,
    /// The request was a CANCEL.
    Cancel(CancelOutcome),
}

/// Result of [`TransactionManager::reply_received`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    Handled,
    /// No branch of any transaction matches; the caller may forward the
    /// reply statelessly.
    Unmatched,
}

/// Result of [`TransactionManager::cancel_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The matching INVITE was canceled and the CANCEL answered.
    Handled,
    /// No INVITE transaction matches; the caller forwards the CANCEL statelessly.
    NoSuchTransaction,
}

pub(crate) struct Inner {
    pub(crate) config: ConfigHandle,
    pub(crate) collab: Collaborators,
    pub(crate) table: TransactionTable,
    pub(crate) wheel: TimerWheel<TimerTarget>,
    pub(crate) clock: TickClock,
    pub(crate) stats: TmStats,
    pub(crate) events: EventHub,
    timer_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// The stateful forwarding engine.
#[derive(Clone)]
pub struct TransactionManager {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("transactions", &self.inner.table.len())
            .field("timers", &self.inner.wheel.len())
            .finish()
    }
}

impl TransactionManager {
    /// Creates a manager driven by the monotonic clock.
    pub fn new(config: TmConfig, collaborators: Collaborators) -> Result<Self> {
        let clock = TickClock::monotonic(config.timers.tick);
        Self::with_clock(config, collaborators, clock)
    }

    /// Creates a manager on an explicit clock, e.g. [`TickClock::manual`] in tests.
    pub fn with_clock(config: TmConfig, collaborators: Collaborators, clock: TickClock) -> Result<Self> {
        config.validate()?;
        info!(
            max_branches = config.max_branches,
            cancel_mode = ?config.cancel_mode,
            "Creating transaction manager"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config: ConfigHandle::new(config),
                collab: collaborators,
                table: TransactionTable::new(),
                wheel: TimerWheel::starting_at(clock.now()),
                clock,
                stats: TmStats::new(),
                events: EventHub::default(),
                timer_task: parking_lot::Mutex::new(None),
            }),
        })
    }

    /// Configuration new transactions will be created with.
    pub fn config(&self) -> Arc<TmConfig> {
        self.inner.config.snapshot()
    }

    /// Replaces the configuration. Live transactions keep their snapshot.
    pub fn update_config(&self, config: TmConfig) -> Result<()> {
        self.inner.config.update(config)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn clock(&self) -> &TickClock {
        &self.inner.clock
    }

    /// Subscribes to transaction events.
    pub fn subscribe(&self) -> mpsc::Receiver<TransactionEvent> {
        self.inner.events.subscribe(EVENT_CHANNEL_CAPACITY)
    }

    /// Number of transactions still in the table.
    pub fn transaction_count(&self) -> usize {
        self.inner.table.len()
    }

    pub fn find_transaction(&self, key: &TransactionKey) -> Option<TransactionHandle> {
        self.inner.table.get(key)
    }

    /// Finds the transaction an incoming request belongs to. ACK matches the
    /// INVITE it acknowledges.
    pub fn lookup_request(&self, request: &SipRequest) -> Option<TransactionHandle> {
        self.inner.table.get(&TransactionKey::from_request(request))
    }

    /// Creates a transaction for `request` and links it into the table.
    ///
    /// INVITEs are answered with a local 100 Trying right away unless disabled
    /// by configuration.
    pub async fn new_transaction(
        &self,
        request: SipRequest,
        options: TransactionOptions,
    ) -> Result<TransactionHandle> {
        if request.method == Method::Ack {
            return Err(Error::InvariantViolation("ACK never creates a transaction".to_string()));
        }
        let config = self.inner.config.snapshot();
        let key = TransactionKey::from_request(&request);
        let hash = dialog_hash(&request);
        let label = self.inner.table.next_label();
        let tx = Arc::new(Transaction::new(key.clone(), label, hash, request, config.clone(), &options));
        self.inner.table.insert(tx.clone())?;
        self.inner.stats.transaction_created();
        debug!(transaction_id = %key, label, "Created transaction");
        self.inner.events.emit(TransactionEvent::Created { transaction_id: key });

        if tx.is_invite() && config.auto_inv_100 {
            if let Err(e) = self.reply(&tx, 100, reason_phrase(100)).await {
                warn!(transaction_id = %tx.key(), error = %e, "Failed to send 100 Trying");
            }
        }
        Ok(tx)
    }

    /// Statefully relays `request`: absorbs retransmissions, handles ACK and
    /// CANCEL, otherwise creates a transaction and forwards it to the request
    /// URI plus `targets`.
    ///
    /// When forwarding fails before any branch went out, the transaction is
    /// answered locally with the status derived from the error, and the error
    /// is returned.
    pub async fn relay(
        &self,
        request: SipRequest,
        options: TransactionOptions,
        proxy: Option<Destination>,
        targets: Vec<BranchTarget>,
    ) -> Result<RelayOutcome> {
        match request.method {
            Method::Ack => {
                return Ok(if self.ack_received(&request) {
                    RelayOutcome::AckAbsorbed
                } else {
                    RelayOutcome::AckNotMatched
                });
            }
            Method::Cancel => return Ok(RelayOutcome::Cancel(self.cancel_request(&request).await?)),
            _ => {}
        }

        if let Some(tx) = self.lookup_request(&request) {
            trace!(transaction_id = %tx.key(), "Request retransmission");
            self.retransmit_last_reply(&tx).await?;
            return Ok(RelayOutcome::Retransmission(tx));
        }

        let tx = match self.new_transaction(request, options).await {
            Ok(tx) => tx,
            Err(Error::TransactionExists(key)) => {
                // lost the insert race against a retransmission
                let tx = self.find_transaction(&key).ok_or_else(|| Error::TransactionNotFound(key.to_string()))?;
                self.retransmit_last_reply(&tx).await?;
                return Ok(RelayOutcome::Retransmission(tx));
            }
            Err(e) => return Err(e),
        };

        match self.forward(&tx, proxy, targets).await {
            Ok(_) => Ok(RelayOutcome::Forwarded(tx)),
            Err(e) => {
                let (code, reason) = e.reply_code();
                debug!(transaction_id = %tx.key(), error = %e, code, "Forwarding failed");
                match self.reply(&tx, code, reason).await {
                    Ok(()) | Err(Error::AlreadyCompleted) => {}
                    Err(reply_err) => {
                        warn!(transaction_id = %tx.key(), error = %reply_err, "Failed to reply after forwarding error")
                    }
                }
                Err(e)
            }
        }
    }

    /// Sends a locally generated reply upstream.
    ///
    /// Provisional replies are refused once a final reply went out, and a
    /// second final reply is refused with [`Error::AlreadyCompleted`]. A
    /// local final reply cancels the branches still pending.
    pub async fn reply(&self, tx: &TransactionHandle, code: u16, reason: &str) -> Result<()> {
        if !(100..700).contains(&code) {
            return Err(Error::InvariantViolation(format!("invalid status code {}", code)));
        }
        let decision = {
            let mut state = tx.replies.lock();
            if state.uas.is_final() {
                return Err(Error::AlreadyCompleted);
            }
            if code < 200 {
                let buffer = self.build_local(tx, code, reason);
                state.uas.status = code;
                state.uas.buffer = buffer.clone();
                state.uas.local = true;
                ReplyDecision::Provisional { branch: None, status: code, buffer }
            } else {
                let cancel = if tx.is_invite() {
                    tx.prepare_cancel(Default::default(), true)
                } else {
                    Default::default()
                };
                ReplyDecision::Completed(self.complete_local_locked(tx, &mut state, code, reason, cancel))
            }
        };
        self.apply_decision(tx.clone(), decision).await;
        Ok(())
    }

    /// Resends the last reply sent upstream. Returns whether anything was sent.
    pub async fn retransmit_last_reply(&self, tx: &TransactionHandle) -> Result<bool> {
        let buffer = tx.replies.lock().uas.buffer.clone();
        let Some(buffer) = buffer else {
            return Ok(false);
        };
        self.inner.collab.transport.send(tx.upstream(), buffer).await?;
        self.inner.stats.retransmission();
        Ok(true)
    }

    /// Absorbs a hop-by-hop ACK for a negative (or locally generated 2xx)
    /// INVITE reply: stops the upstream retransmissions and starts the wait
    /// timer. Returns `false` when the ACK belongs to a relayed 2xx and must be
    /// forwarded end-to-end.
    pub fn ack_received(&self, ack: &SipRequest) -> bool {
        let Some(tx) = self.lookup_request(ack) else {
            return false;
        };
        let (status, local) = {
            let state = tx.replies.lock();
            (state.uas.status, state.uas.local)
        };
        let absorb = status >= 300 || ((200..300).contains(&status) && local);
        if !absorb {
            return false;
        }
        if !tx.set_flag(flags::ACKED) {
            debug!(transaction_id = %tx.key(), status, "ACK received");
            tx.uas_timer.stop();
            self.put_on_wait(&tx);
        }
        true
    }

    /// Builds a local reply to the transaction's request.
    pub(crate) fn build_local(&self, tx: &Transaction, code: u16, reason: &str) -> Option<Bytes> {
        match self.inner.collab.builder.build_local_reply(tx.request(), code, reason) {
            Ok(buffer) => Some(buffer),
            Err(e) => {
                warn!(transaction_id = %tx.key(), code, error = %e, "Failed to build local reply");
                None
            }
        }
    }

    /// Sends `buffer` to the upstream client, logging failures.
    pub(crate) async fn send_upstream(&self, tx: &Transaction, buffer: Bytes) {
        if let Err(e) = self.inner.collab.transport.send(tx.upstream(), buffer).await {
            warn!(transaction_id = %tx.key(), error = %e, "Failed to send reply upstream");
        }
    }
}


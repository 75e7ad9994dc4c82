//! Timer wheel targets and their handlers.
//!
//! Wheel entries hold weak references only: a transaction that was freed
//! simply makes its pending entries stale. Rearming a [`RetrTimer`] bumps its
//! generation, so entries scheduled for an earlier arm are skipped by the
//! sweep without having to unlink them.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::events::TransactionEvent;
use super::TransactionManager;
use crate::interfaces::BlacklistReason;
use crate::timer::{Deadline, Expired, RetrTimer, Ticks};
use crate::transaction::branch::flags as branch_flags;
use crate::transaction::cell::flags;
use crate::transaction::{Transaction, TransactionHandle};

/// Warn every this many delete attempts on a transaction still referenced.
const DELETE_WARN_EVERY: u32 = 16;

/// What a wheel entry fires.
#[derive(Debug)]
pub(crate) enum TimerTarget {
    /// Retransmission or final deadline of a branch request.
    Request { tx: Weak<Transaction>, branch: usize, deadline: Deadline },
    /// Retransmission or final deadline of a CANCEL sent on a branch.
    Cancel { tx: Weak<Transaction>, branch: usize, deadline: Deadline },
    /// Retransmission or final deadline of the upstream final reply.
    Reply { tx: Weak<Transaction>, deadline: Deadline },
    /// End of the wait period; unlinks the transaction.
    Wait { tx: Weak<Transaction> },
    /// Checks that an unlinked transaction was released.
    Delete { tx: Weak<Transaction>, attempts: u32 },
}

impl TimerTarget {
    /// Whether the entry still refers to the current arm of its timer.
    fn is_live(&self, generation: u32) -> bool {
        match self {
            TimerTarget::Request { tx, .. } | TimerTarget::Cancel { tx, .. } | TimerTarget::Reply { tx, .. } => {
                let Some(tx) = tx.upgrade() else {
                    return false;
                };
                Self::with_timer(&tx, self, |deadline, timer| timer.is_live(deadline, generation))
            }
            TimerTarget::Wait { .. } | TimerTarget::Delete { .. } => true,
        }
    }

    fn with_timer<R: Default>(tx: &Transaction, target: &TimerTarget, f: impl FnOnce(Deadline, &RetrTimer) -> R) -> R {
        match target {
            TimerTarget::Request { branch, deadline, .. } => f(*deadline, &tx.slots[*branch].request_timer),
            TimerTarget::Cancel { branch, deadline, .. } => f(*deadline, &tx.slots[*branch].cancel_timer),
            TimerTarget::Reply { deadline, .. } => f(*deadline, &tx.uas_timer),
            _ => R::default(),
        }
    }
}

impl TransactionManager {
    /// Fires every timer that expired by now. Returns the number fired.
    pub async fn run_timers(&self) -> usize {
        let now = self.inner.clock.now();
        let expired = self.inner.wheel.sweep(now, |target, generation| target.is_live(generation));
        let fired = expired.len();
        for entry in expired {
            self.fire(entry, now).await;
        }
        fired
    }

    /// Spawns a task sweeping the wheel every tick. Does nothing if one runs.
    pub fn start_timer_task(&self) {
        let mut task = self.inner.timer_task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let tick = self.inner.clock.tick();
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                TransactionManager { inner }.run_timers().await;
            }
            debug!("Timer task stopped");
        }));
        debug!(?tick, "Timer task started");
    }

    /// Stops the task started by [`TransactionManager::start_timer_task`].
    pub fn stop_timer_task(&self) {
        if let Some(task) = self.inner.timer_task.lock().take() {
            task.abort();
        }
    }

    async fn fire(&self, entry: Expired<TimerTarget>, now: Ticks) {
        let generation = entry.generation;
        match entry.payload {
            TimerTarget::Request { tx, branch, deadline } => {
                let Some(tx) = tx.upgrade() else { return };
                match deadline {
                    Deadline::Retransmit => self.retransmit_request(&tx, branch, generation, now).await,
                    Deadline::Final => {
                        if tx.slots[branch].request_timer.fire_final(generation) {
                            self.branch_timeout(&tx, branch).await;
                        }
                    }
                }
            }
            TimerTarget::Cancel { tx, branch, deadline } => {
                let Some(tx) = tx.upgrade() else { return };
                let timer = &tx.slots[branch].cancel_timer;
                match deadline {
                    Deadline::Retransmit => {
                        if !timer.is_live(Deadline::Retransmit, generation) {
                            return;
                        }
                        if let Some(buffer) = tx.slots[branch].local_cancel().cloned() {
                            self.resend_downstream(&tx, branch, buffer).await;
                        }
                        let t2 = self.inner.clock.ticks_for(tx.config().timers.t2);
                        if let Some(entry) = timer.backoff(now, t2) {
                            self.arm_cancel(&tx, branch, entry);
                        }
                    }
                    Deadline::Final => {
                        if timer.fire_final(generation) {
                            debug!(transaction_id = %tx.key(), branch, "CANCEL got no final reply");
                        }
                    }
                }
            }
            TimerTarget::Reply { tx, deadline } => {
                let Some(tx) = tx.upgrade() else { return };
                match deadline {
                    Deadline::Retransmit => {
                        if !tx.uas_timer.is_live(Deadline::Retransmit, generation) {
                            return;
                        }
                        let buffer = tx.replies.lock().uas.buffer.clone();
                        if let Some(buffer) = buffer {
                            self.send_upstream(&tx, buffer).await;
                            self.inner.stats.retransmission();
                        }
                        let t2 = self.inner.clock.ticks_for(tx.config().timers.t2);
                        if let Some(entry) = tx.uas_timer.backoff(now, t2) {
                            self.arm_reply(&tx, entry);
                        }
                    }
                    Deadline::Final => {
                        if tx.uas_timer.fire_final(generation) {
                            debug!(transaction_id = %tx.key(), "No ACK for final reply");
                            self.put_on_wait(&tx);
                        }
                    }
                }
            }
            TimerTarget::Wait { tx } => {
                if let Some(tx) = tx.upgrade() {
                    self.wait_expired(&tx);
                }
            }
            TimerTarget::Delete { tx, attempts } => self.delete_check(tx, attempts),
        }
    }

    async fn retransmit_request(&self, tx: &TransactionHandle, branch: usize, generation: u32, now: Ticks) {
        let slot = &tx.slots[branch];
        if !slot.request_timer.is_live(Deadline::Retransmit, generation) || slot.is_final() {
            return;
        }
        let Some(buffer) = slot.outbound().and_then(|o| o.buffer.clone()) else {
            return;
        };
        trace!(transaction_id = %tx.key(), branch, interval = slot.request_timer.interval(), "Retransmitting request");
        self.resend_downstream(tx, branch, buffer).await;
        let t2 = self.inner.clock.ticks_for(tx.config().timers.t2);
        if let Some(entry) = slot.request_timer.backoff(now, t2) {
            self.arm_request(tx, branch, entry);
        }
    }

    async fn resend_downstream(&self, tx: &Transaction, branch: usize, buffer: bytes::Bytes) {
        let Some(out) = tx.slots[branch].outbound() else { return };
        match self.inner.collab.transport.send(&out.destination, buffer).await {
            Ok(()) => self.inner.stats.retransmission(),
            Err(e) => debug!(transaction_id = %tx.key(), branch, error = %e, "Retransmission failed"),
        }
    }

    /// The final deadline of a branch fired without a final reply.
    async fn branch_timeout(&self, tx: &TransactionHandle, branch: usize) {
        let slot = &tx.slots[branch];
        if slot.is_final() {
            return;
        }
        slot.set_flag(branch_flags::FR_TIMEOUT);
        self.inner.stats.branch_timeout();
        self.inner.events.emit(TransactionEvent::BranchTimedOut { transaction_id: tx.key().clone(), branch });

        let config = tx.config();
        let silent = tx.is_invite()
            && !config.noisy_ctimer
            && !tx.has_flag(flags::NOISY_FINAL_TIMER)
            && tx.branch_count() == 1
            && tx.routes().failure_route().is_none()
            && slot.last_received() == 0;
        if silent {
            debug!(transaction_id = %tx.key(), branch, "Silent final timeout");
            {
                let _state = tx.replies.lock();
                slot.set_last_received(408);
            }
            self.put_on_wait(tx);
            return;
        }

        debug!(transaction_id = %tx.key(), branch, last = slot.last_received(), "Branch timed out");
        if slot.last_received() == 0 && config.use_blacklist {
            if let Some(out) = slot.outbound().filter(|o| o.buffer.is_some()) {
                self.inner.collab.blacklist.add(&out.destination, BlacklistReason::Timeout, config.blacklist_ttl);
            }
        }
        self.fake_reply(tx, branch, 408).await;
    }

    /// Starts the request timer of a branch that was just sent.
    pub(crate) fn start_request_timer(&self, tx: &TransactionHandle, branch: usize) {
        let slot = &tx.slots[branch];
        let Some(out) = slot.outbound() else { return };
        let timers = &tx.config().timers;
        let retransmit = (out.buffer.is_some() && !out.destination.protocol.is_reliable())
            .then(|| self.inner.clock.ticks_for(timers.t1));
        let now = self.inner.clock.now();
        for entry in slot.request_timer.start(now, retransmit, self.inner.clock.ticks_for(timers.fr_timeout)) {
            self.arm_request(tx, branch, entry);
        }
        // a reply may have raced the send
        let last = slot.last_received();
        if last >= 200 {
            slot.request_timer.stop();
        } else if last >= 100 && tx.is_invite() {
            slot.request_timer.stop_retransmit();
            let fr_inv = self.inner.clock.ticks_for(timers.fr_inv_timeout);
            if let Some(entry) = slot.request_timer.restart_final(now, fr_inv) {
                self.arm_request(tx, branch, entry);
            }
        }
    }

    /// Starts the CANCEL timer of a branch.
    pub(crate) fn start_cancel_timer(&self, tx: &TransactionHandle, branch: usize) {
        let slot = &tx.slots[branch];
        let Some(out) = slot.outbound() else { return };
        let timers = &tx.config().timers;
        let retransmit = (!out.destination.protocol.is_reliable()).then(|| self.inner.clock.ticks_for(timers.t1));
        let now = self.inner.clock.now();
        for entry in slot.cancel_timer.start(now, retransmit, self.inner.clock.ticks_for(timers.fr_timeout)) {
            self.arm_cancel(tx, branch, entry);
        }
    }

    /// Arms the timer that follows a final reply sent upstream.
    ///
    /// Negative INVITE replies and local 2xx are retransmitted until the ACK
    /// arrives or the final deadline passes. Everything else goes straight to
    /// the wait state.
    pub(crate) fn set_final_timer(&self, tx: &TransactionHandle, status: u16, local: bool) {
        let awaits_ack = tx.is_invite() && (status >= 300 || local) && !tx.has_flag(flags::ACKED);
        if !awaits_ack {
            self.put_on_wait(tx);
            return;
        }
        let timers = &tx.config().timers;
        let retransmit = (!tx.upstream().protocol.is_reliable()).then(|| self.inner.clock.ticks_for(timers.t1));
        let now = self.inner.clock.now();
        for entry in tx.uas_timer.start(now, retransmit, self.inner.clock.ticks_for(timers.fr_timeout)) {
            self.arm_reply(tx, entry);
        }
    }

    /// Starts the wait period once. The transaction is unlinked when it ends.
    pub(crate) fn put_on_wait(&self, tx: &TransactionHandle) {
        if tx.set_flag(flags::ON_WAIT) {
            return;
        }
        let expire = self.inner.clock.now().after(self.inner.clock.ticks_for(tx.config().timers.wait_timeout));
        trace!(transaction_id = %tx.key(), %expire, "Put on wait");
        self.inner.wheel.schedule(expire, 0, TimerTarget::Wait { tx: Arc::downgrade(tx) });
    }

    fn wait_expired(&self, tx: &TransactionHandle) {
        tx.uas_timer.stop();
        for slot in tx.slots.iter() {
            slot.request_timer.stop();
            slot.cancel_timer.stop();
        }
        self.inner.table.remove(tx);
        tx.set_flag(flags::DELETED);
        debug!(transaction_id = %tx.key(), status = tx.uas_status(), "Transaction terminated");
        self.inner.events.emit(TransactionEvent::Terminated { transaction_id: tx.key().clone() });
        self.schedule_delete(Arc::downgrade(tx), 0, tx.config().timers.delete_timeout);
    }

    fn schedule_delete(&self, tx: Weak<Transaction>, attempts: u32, after: Duration) {
        let expire = self.inner.clock.now().after(self.inner.clock.ticks_for(after));
        self.inner.wheel.schedule(expire, 0, TimerTarget::Delete { tx, attempts });
    }

    fn delete_check(&self, tx: Weak<Transaction>, attempts: u32) {
        if tx.strong_count() == 0 {
            self.inner.stats.transaction_freed();
            trace!(attempts, "Transaction released");
            return;
        }
        if attempts % DELETE_WARN_EVERY == DELETE_WARN_EVERY - 1 {
            warn!(attempts, refs = tx.strong_count(), "Terminated transaction still referenced");
        }
        let delay = self.inner.config.snapshot().timers.delete_timeout;
        self.schedule_delete(tx, attempts + 1, delay);
    }

    pub(crate) fn arm_request(&self, tx: &TransactionHandle, branch: usize, entry: (Deadline, Ticks, u32)) {
        let (deadline, expire, generation) = entry;
        self.inner.wheel.schedule(
            expire,
            generation,
            TimerTarget::Request { tx: Arc::downgrade(tx), branch, deadline },
        );
    }

    fn arm_cancel(&self, tx: &TransactionHandle, branch: usize, entry: (Deadline, Ticks, u32)) {
        let (deadline, expire, generation) = entry;
        self.inner.wheel.schedule(
            expire,
            generation,
            TimerTarget::Cancel { tx: Arc::downgrade(tx), branch, deadline },
        );
    }

    fn arm_reply(&self, tx: &TransactionHandle, entry: (Deadline, Ticks, u32)) {
        let (deadline, expire, generation) = entry;
        self.inner.wheel.schedule(expire, generation, TimerTarget::Reply { tx: Arc::downgrade(tx), deadline });
    }
}

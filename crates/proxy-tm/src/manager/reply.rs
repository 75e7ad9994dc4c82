//! Reply processing: matching, the per-branch state machine, branch
//! selection and relaying upstream.
//!
//! Every reply, real or faked, goes through [`TransactionManager::decide_reply`]
//! under the reply lock. The decision it returns is carried out by
//! [`TransactionManager::apply_decision`] once the lock is released.

use std::sync::atomic::{fence, Ordering};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, trace, warn};

use super::events::TransactionEvent;
use super::{ReplyOutcome, TransactionManager};
use crate::interfaces::{BlacklistReason, HookVerdict};
use crate::message::{reason_phrase, Method, SipResponse};
use crate::transaction::branch::flags as branch_flags;
use crate::transaction::cell::flags;
use crate::transaction::{
    pick_branch, BranchBitmap, CancelFlags, CancelInfo, CancelReason, Pick, ReplyState, StoredReply,
    Transaction, TransactionHandle,
};

/// A reply as seen by the state machine.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ReplyInput<'a> {
    Received(&'a SipResponse),
    /// Generated locally on timeout, cancel or send failure.
    Faked,
}

impl ReplyInput<'_> {
    fn is_received(&self) -> bool {
        matches!(self, ReplyInput::Received(_))
    }
}

/// A final reply that went (or goes) upstream.
#[derive(Debug)]
pub(crate) struct Completion {
    pub status: u16,
    pub buffer: Option<Bytes>,
    pub branch: Option<usize>,
    pub local: bool,
    /// A 2xx relayed after the transaction already completed.
    pub late: bool,
    pub cancel: CancelInfo,
}

/// What to do once the reply lock is released.
#[derive(Debug)]
pub(crate) enum ReplyDecision {
    Discard,
    /// The reply was stored; nothing goes upstream yet.
    Store { cancel: CancelInfo },
    Provisional { branch: Option<usize>, status: u16, buffer: Option<Bytes> },
    Completed(Completion),
    /// All branches are final and a failure route is armed.
    FailureRoute { branch: usize, code: u16, snapshot: usize, cancel: CancelInfo },
    /// A new branch replaced a failed one.
    Failover { from: usize, to: usize, cancel: CancelInfo },
}

impl TransactionManager {
    /// Processes a reply received from downstream.
    pub async fn reply_received(&self, reply: SipResponse) -> ReplyOutcome {
        let Some((tx, branch)) = reply
            .top_via_branch
            .as_deref()
            .and_then(|id| self.inner.table.lookup_reply(id))
        else {
            trace!(status = reply.status, "Reply matches no transaction");
            return ReplyOutcome::Unmatched;
        };
        let code = reply.status;
        if !(100..700).contains(&code) {
            warn!(transaction_id = %tx.key(), code, "Discarding reply with invalid status");
            return ReplyOutcome::Handled;
        }
        let slot = &tx.slots[branch];

        // reply to a CANCEL this proxy sent
        if reply.cseq_method == Method::Cancel && tx.request().method != Method::Cancel {
            if reply.is_final() {
                slot.cancel_timer.stop();
            } else {
                slot.cancel_timer.stop_retransmit();
            }
            trace!(transaction_id = %tx.key(), branch, code, "Reply to local CANCEL");
            return ReplyOutcome::Handled;
        }

        slot.set_flag(branch_flags::REPLIED);
        if let Some(route) = tx.routes().reply_route() {
            if self.inner.collab.hooks.on_reply(route, &tx, branch, &reply) == HookVerdict::Drop
                && reply.is_provisional()
            {
                debug!(transaction_id = %tx.key(), branch, code, "Provisional reply dropped by reply route");
                return ReplyOutcome::Handled;
            }
        }

        let config = tx.config();
        if code == 503 && config.blacklist_503 {
            if let Some(out) = slot.outbound() {
                let ttl = config.blacklist_503_ttl(reply.retry_after);
                if !ttl.is_zero() {
                    self.inner.collab.blacklist.add(&out.destination, BlacklistReason::Unavailable, ttl);
                }
            }
        }

        self.update_branch_timers(&tx, branch, code);

        if tx.is_invite() && code >= 300 {
            self.send_ack(&tx, branch, &reply).await;
        }

        let decision = {
            let mut state = tx.replies.lock();
            self.decide_reply(&tx, &mut state, branch, code, ReplyInput::Received(&reply))
        };

        // a branch canceled before it answered gets its CANCEL now, unless
        // its canceler still holds the claim and will see this reply itself
        fence(Ordering::SeqCst);
        if reply.is_provisional()
            && tx.is_invite()
            && slot.has_flag(branch_flags::TO_CANCEL)
            && slot.claim_late_cancel()
        {
            slot.take_flag(branch_flags::TO_CANCEL);
            if let Err(e) = self.send_cancel(&tx, branch, None).await {
                debug!(transaction_id = %tx.key(), branch, error = %e, "Late CANCEL failed");
            }
            slot.finish_cancel();
        }

        self.apply_decision(tx, decision).await;
        ReplyOutcome::Handled
    }

    /// Injects a locally generated final reply on `branch`.
    ///
    /// The decision is taken under the reply lock; a CANCEL for a branch that
    /// already answered provisionally is sent after the lock is released.
    pub(crate) async fn fake_reply(&self, tx: &TransactionHandle, branch: usize, code: u16) {
        let slot = &tx.slots[branch];
        slot.request_timer.stop();
        let needs_cancel = tx.is_invite()
            && code >= 300
            && (100..200).contains(&slot.last_received())
            && slot.claim_late_cancel();
        let decision = {
            let mut state = tx.replies.lock();
            self.decide_reply(tx, &mut state, branch, code, ReplyInput::Faked)
        };
        trace!(transaction_id = %tx.key(), branch, code, ?decision, "Faked reply");
        if needs_cancel {
            if let Err(e) = self.send_cancel(tx, branch, None).await {
                debug!(transaction_id = %tx.key(), branch, error = %e, "CANCEL after faked reply failed");
            }
            slot.finish_cancel();
        }
        self.apply_decision(tx.clone(), decision).await;
    }

    /// Re-runs branch selection, e.g. after branches failed to send.
    ///
    /// `cause` supplies the local reply when no branch holds a reply.
    pub(crate) async fn reevaluate(&self, tx: &TransactionHandle, cause: Option<(u16, &str)>) {
        let decision = {
            let mut state = tx.replies.lock();
            if state.uas.is_final() {
                ReplyDecision::Discard
            } else {
                let fallback = cause.unwrap_or((500, reason_phrase(500)));
                self.conclude_locked(tx, &mut state, CancelInfo::default(), fallback, true)
            }
        };
        self.apply_decision(tx.clone(), decision).await;
    }

    /// Branch state machine. Must be called with the reply lock held.
    pub(crate) fn decide_reply(
        &self,
        tx: &Transaction,
        state: &mut ReplyState,
        branch: usize,
        code: u16,
        input: ReplyInput<'_>,
    ) -> ReplyDecision {
        let slot = &tx.slots[branch];
        let last = slot.last_received();
        let late_2xx = (200..300).contains(&code) && tx.is_invite() && !state.uas.relayed_2xx && input.is_received();

        if last >= 200 {
            if late_2xx {
                if state.uas.is_final() {
                    return self.push_after_completion(tx, state, branch, code, input);
                }
                // canceled branch answered 200 while others are pending
                return self.relay_2xx(tx, state, branch, code, input);
            }
            if last == code || code < 200 {
                trace!(transaction_id = %tx.key(), branch, last, code, "Reply after final");
            } else if last == 408 && code == 487 {
                trace!(transaction_id = %tx.key(), branch, "487 after local timeout");
            } else {
                warn!(transaction_id = %tx.key(), branch, last, code, "Discarding reply after final");
            }
            return ReplyDecision::Discard;
        }

        if state.uas.is_final() {
            if late_2xx && state.uas.status >= 300 {
                return self.push_after_completion(tx, state, branch, code, input);
            }
            if code >= 200 {
                slot.set_last_received(code);
            }
            return ReplyDecision::Discard;
        }

        if code >= 300 {
            return self.store_negative(tx, state, branch, code, input);
        }
        if code >= 200 {
            return self.relay_2xx(tx, state, branch, code, input);
        }

        // provisional
        slot.set_last_received(code);
        if code == 100 {
            return ReplyDecision::Discard;
        }
        let ReplyInput::Received(reply) = input else {
            return ReplyDecision::Discard;
        };
        let buffer = self.build_relayed(tx, reply, None);
        state.uas.status = code;
        state.uas.buffer = buffer.clone();
        state.uas.local = false;
        state.uas.branch = Some(branch);
        ReplyDecision::Provisional { branch: Some(branch), status: code, buffer }
    }

    fn store_negative(
        &self,
        tx: &Transaction,
        state: &mut ReplyState,
        branch: usize,
        code: u16,
        input: ReplyInput<'_>,
    ) -> ReplyDecision {
        let slot = &tx.slots[branch];
        let config = tx.config();
        slot.set_last_received(code);
        state.branches[branch].reply = Some(match input {
            ReplyInput::Received(reply) => StoredReply::Received(reply.clone()),
            ReplyInput::Faked => StoredReply::Faked,
        });

        let mut cancel = CancelInfo::default();
        if code >= 600 {
            tx.set_flag(flags::SIX_XX_SEEN);
            if tx.is_invite() {
                cancel = tx.prepare_cancel(BranchBitmap::only(branch), true);
            }
        }

        let failover = config.failover
            && !tx.has_flag(flags::DONT_FORK)
            && !tx.has_flag(flags::SIX_XX_SEEN)
            && !tx.is_canceled()
            && !slot.has_flag(branch_flags::CANCELED)
            && match input {
                ReplyInput::Received(_) => code == 503,
                ReplyInput::Faked => {
                    code == 408 && config.failover_on_timeout && !slot.has_flag(branch_flags::REPLIED)
                }
            };
        if failover {
            match self.failover_locked(tx, state, branch) {
                Ok(to) => return ReplyDecision::Failover { from: branch, to, cancel },
                Err(e) => trace!(transaction_id = %tx.key(), branch, error = %e, "No failover"),
            }
        }

        self.conclude_locked(tx, state, cancel, (code, reason_phrase(code)), true)
    }

    fn relay_2xx(
        &self,
        tx: &Transaction,
        state: &mut ReplyState,
        branch: usize,
        code: u16,
        input: ReplyInput<'_>,
    ) -> ReplyDecision {
        let slot = &tx.slots[branch];
        if !slot.is_final() {
            slot.set_last_received(code);
        }
        let cancel = if tx.is_invite() {
            tx.prepare_cancel_with_reason(
                BranchBitmap::only(branch),
                true,
                Some(CancelReason::completed_elsewhere()),
            )
        } else {
            CancelInfo::default()
        };
        let completion = match input {
            ReplyInput::Received(reply) => {
                let buffer = self.build_relayed(tx, reply, None);
                Self::publish_uas(state, code, buffer, Some(branch), false, false, cancel)
            }
            ReplyInput::Faked => {
                let buffer = self.build_local(tx, code, reason_phrase(code));
                Self::publish_uas(state, code, buffer, Some(branch), true, false, cancel)
            }
        };
        ReplyDecision::Completed(completion)
    }

    fn push_after_completion(
        &self,
        tx: &Transaction,
        state: &mut ReplyState,
        branch: usize,
        code: u16,
        input: ReplyInput<'_>,
    ) -> ReplyDecision {
        let ReplyInput::Received(reply) = input else {
            return ReplyDecision::Discard;
        };
        let slot = &tx.slots[branch];
        if !slot.is_final() {
            slot.set_last_received(code);
        }
        debug!(transaction_id = %tx.key(), branch, code, previous = state.uas.status, "Relaying 2xx after completion");
        let cancel = tx.prepare_cancel_with_reason(
            BranchBitmap::only(branch),
            true,
            Some(CancelReason::completed_elsewhere()),
        );
        let buffer = self.build_relayed(tx, reply, None);
        ReplyDecision::Completed(Self::publish_uas(state, code, buffer, Some(branch), false, true, cancel))
    }

    /// Picks the winning branch once the current reply is stored.
    ///
    /// With `run_failure_route` set an armed failure route takes precedence
    /// over relaying the winner.
    pub(crate) fn conclude_locked(
        &self,
        tx: &Transaction,
        state: &mut ReplyState,
        cancel: CancelInfo,
        fallback: (u16, &str),
        run_failure_route: bool,
    ) -> ReplyDecision {
        match pick_branch(&tx.slots, &state.branches, tx.config().faked_reply_prio) {
            Pick::Pending => ReplyDecision::Store { cancel },
            Pick::NoCandidate => {
                let (code, reason) = fallback;
                ReplyDecision::Completed(self.complete_local_locked(tx, state, code, reason, cancel))
            }
            Pick::Branch { index, code } => {
                if run_failure_route && tx.routes().failure_route().is_some() {
                    ReplyDecision::FailureRoute { branch: index, code, snapshot: state.branches.len(), cancel }
                } else {
                    ReplyDecision::Completed(self.complete_with_branch(tx, state, index, cancel))
                }
            }
        }
    }

    /// Publishes the stored reply of `index` as the upstream final reply.
    fn complete_with_branch(
        &self,
        tx: &Transaction,
        state: &mut ReplyState,
        index: usize,
        cancel: CancelInfo,
    ) -> Completion {
        let code = tx.slots[index].last_received();
        let stored = state.branches[index].reply.clone();
        match stored {
            Some(StoredReply::Received(reply)) => {
                let remap = (code == 503 && tx.config().remap_503_500).then(|| (500, reason_phrase(500)));
                let status = remap.map_or(code, |(c, _)| c);
                match self.inner.collab.builder.build_relayed_reply(&reply, remap) {
                    Ok(buffer) => Self::publish_uas(state, status, Some(buffer), Some(index), false, false, cancel),
                    Err(e) => {
                        warn!(transaction_id = %tx.key(), branch = index, error = %e, "Failed to build relayed reply");
                        self.complete_local_locked(tx, state, 500, reason_phrase(500), cancel)
                    }
                }
            }
            _ => {
                let mut completion = self.complete_local_locked(tx, state, code, reason_phrase(code), cancel);
                completion.branch = Some(index);
                state.uas.branch = Some(index);
                completion
            }
        }
    }

    /// Publishes a locally generated final reply.
    pub(crate) fn complete_local_locked(
        &self,
        tx: &Transaction,
        state: &mut ReplyState,
        code: u16,
        reason: &str,
        cancel: CancelInfo,
    ) -> Completion {
        let mut status = code;
        let mut buffer = self.build_local(tx, code, reason);
        if buffer.is_none() && code != 500 {
            status = 500;
            buffer = self.build_local(tx, 500, reason_phrase(500));
        }
        Self::publish_uas(state, status, buffer, None, true, false, cancel)
    }

    fn publish_uas(
        state: &mut ReplyState,
        status: u16,
        buffer: Option<Bytes>,
        branch: Option<usize>,
        local: bool,
        late: bool,
        cancel: CancelInfo,
    ) -> Completion {
        state.uas.status = status;
        state.uas.buffer = buffer.clone();
        state.uas.local = local;
        state.uas.branch = branch;
        if (200..300).contains(&status) {
            state.uas.relayed_2xx = true;
        }
        Completion { status, buffer, branch, local, late, cancel }
    }

    fn build_relayed(&self, tx: &Transaction, reply: &SipResponse, status: Option<(u16, &str)>) -> Option<Bytes> {
        match self.inner.collab.builder.build_relayed_reply(reply, status) {
            Ok(buffer) => Some(buffer),
            Err(e) => {
                warn!(transaction_id = %tx.key(), status = reply.status, error = %e, "Failed to build relayed reply");
                None
            }
        }
    }

    /// Carries out a decision taken under the reply lock.
    pub(crate) fn apply_decision(&self, tx: TransactionHandle, decision: ReplyDecision) -> BoxFuture<'_, ()> {
        async move {
            match decision {
                ReplyDecision::Discard => {}
                ReplyDecision::Store { cancel } => {
                    self.cancel_pending(&tx, cancel, self.default_cancel_flags(&tx)).await;
                }
                ReplyDecision::Provisional { branch, status, buffer } => {
                    if let Some(buffer) = buffer {
                        self.send_upstream(&tx, buffer).await;
                    }
                    if let Some(branch) = branch {
                        self.inner.stats.reply_relayed(status);
                        self.inner.events.emit(TransactionEvent::ProvisionalRelayed {
                            transaction_id: tx.key().clone(),
                            branch,
                            status,
                        });
                    }
                }
                ReplyDecision::Completed(completion) => self.finish(&tx, completion).await,
                ReplyDecision::FailureRoute { branch, code, snapshot, cancel } => {
                    self.cancel_pending(&tx, cancel, self.default_cancel_flags(&tx)).await;
                    self.run_failure_route(&tx, branch, code, snapshot).await;
                }
                ReplyDecision::Failover { from, to, cancel } => {
                    self.note_failover(&tx, from, to);
                    self.cancel_pending(&tx, cancel, self.default_cancel_flags(&tx)).await;
                    if let Err(e) = self.send_branch(&tx, to).await {
                        let (code, reason) = e.reply_code();
                        self.reevaluate(&tx, Some((code, reason))).await;
                    }
                }
            }
        }
        .boxed()
    }

    async fn finish(&self, tx: &TransactionHandle, completion: Completion) {
        let Completion { status, buffer, branch, local, late, cancel } = completion;
        debug!(transaction_id = %tx.key(), status, ?branch, local, late, "Final reply");
        if let Some(buffer) = buffer {
            self.send_upstream(tx, buffer).await;
        }
        if local {
            self.inner.stats.local_reply();
        } else {
            self.inner.stats.reply_relayed(status);
        }
        if !late {
            self.inner.stats.transaction_completed();
        }
        self.inner.events.emit(TransactionEvent::FinalReplied {
            transaction_id: tx.key().clone(),
            branch,
            status,
            local,
            late,
        });

        // branches still pending are canceled below; the rest stop here
        for index in 0..tx.branch_count() {
            if !cancel.branches.contains(index) {
                tx.slots[index].request_timer.stop_retransmit();
            }
        }
        if !cancel.is_empty() {
            let flags = self.default_cancel_flags(tx);
            self.cancel_pending(tx, cancel, CancelFlags { fake_reply: false, ..flags }).await;
        }

        if late {
            tx.uas_timer.stop();
            self.put_on_wait(tx);
        } else {
            self.set_final_timer(tx, status, local);
        }
    }

    /// Adjusts the request timer of `branch` for a reply with `code`.
    fn update_branch_timers(&self, tx: &TransactionHandle, branch: usize, code: u16) {
        let slot = &tx.slots[branch];
        let timer = &slot.request_timer;
        if code >= 200 {
            timer.stop();
            return;
        }
        if slot.is_final() {
            return;
        }
        let timers = &tx.config().timers;
        let now = self.inner.clock.now();
        if tx.is_invite() {
            timer.stop_retransmit();
            let first = slot.last_received() < 100;
            if first || tx.config().restart_fr_on_each_reply {
                if let Some(entry) = timer.restart_final(now, self.inner.clock.ticks_for(timers.fr_inv_timeout)) {
                    self.arm_request(tx, branch, entry);
                }
            }
        } else if timer.is_retransmitting() {
            if let Some(entry) = timer.restart_retransmit(now, self.inner.clock.ticks_for(timers.t2)) {
                self.arm_request(tx, branch, entry);
            }
        }
    }

    async fn send_ack(&self, tx: &Transaction, branch: usize, reply: &SipResponse) {
        let Some(out) = tx.slots[branch].outbound() else {
            return;
        };
        match self.inner.collab.builder.build_ack(tx.request(), &out.context(), reply) {
            Ok(ack) => {
                if let Err(e) = self.inner.collab.transport.send(&out.destination, ack).await {
                    debug!(transaction_id = %tx.key(), branch, error = %e, "Failed to send ACK");
                }
            }
            Err(e) => warn!(transaction_id = %tx.key(), branch, error = %e, "Failed to build ACK"),
        }
    }

    pub(crate) fn default_cancel_flags(&self, tx: &Transaction) -> CancelFlags {
        use crate::config::CancelMode;
        match tx.config().cancel_mode {
            CancelMode::FakeReply => CancelFlags { fake_reply: true, force_send: false },
            CancelMode::StopRetransmission => CancelFlags { fake_reply: false, force_send: false },
            CancelMode::SendCancel => CancelFlags { fake_reply: false, force_send: true },
        }
    }
}

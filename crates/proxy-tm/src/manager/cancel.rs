//! Upstream (end-to-end) CANCEL and hop-by-hop branch cancellation.
//!
//! Whoever wins the per-branch cancel claim in
//! [`Transaction::prepare_cancel`](crate::transaction::Transaction::prepare_cancel)
//! is the only caller allowed to cancel that branch, so a branch is never
//! canceled twice even when an upstream CANCEL, a 2xx and a timeout race.

use std::sync::atomic::{fence, Ordering};

use tracing::{debug, trace, warn};

use super::events::TransactionEvent;
use super::{CancelOutcome, TransactionManager};
use crate::error::{Error, Result};
use crate::message::{reason_phrase, Method, SipRequest};
use crate::transaction::branch::flags as branch_flags;
use crate::transaction::cell::flags;
use crate::transaction::{
    BranchBitmap, CancelFlags, CancelInfo, CancelReason, CancelWhich, TransactionHandle, TransactionKey,
};

impl TransactionManager {
    /// Handles a CANCEL received from upstream.
    ///
    /// The matching INVITE is marked canceled and its pending branches are
    /// canceled according to the configured [`CancelMode`](crate::config::CancelMode).
    /// The CANCEL itself is answered 200, or 500 when a branch could not be
    /// canceled. An INVITE with no branch yet is answered 487 directly.
    pub async fn cancel_request(&self, cancel: &SipRequest) -> Result<CancelOutcome> {
        if cancel.method != Method::Cancel {
            return Err(Error::InvariantViolation(format!("{} is not a CANCEL", cancel.method)));
        }
        let key = TransactionKey::from_request(cancel).with_method(Method::Invite);
        let Some(tx) = self.inner.table.get(&key) else {
            trace!(transaction_id = %key, "CANCEL matches no INVITE");
            return Ok(CancelOutcome::NoSuchTransaction);
        };

        tx.set_flag(flags::CANCELED);
        let mut code = 200;
        if tx.is_completed() {
            debug!(transaction_id = %tx.key(), "CANCEL for a completed transaction");
        } else if tx.branch_count() == 0 {
            match self.reply(&tx, 487, reason_phrase(487)).await {
                Ok(()) | Err(Error::AlreadyCompleted) => {}
                Err(e) => warn!(transaction_id = %tx.key(), error = %e, "Failed to reply 487"),
            }
        } else {
            let reason = cancel.reason.clone().map(CancelReason::Upstream);
            let info = tx.prepare_cancel_with_reason(BranchBitmap::empty(), true, reason);
            debug!(transaction_id = %tx.key(), branches = info.branches.len(), "Canceling branches");
            if let Err(e) = self.cancel_uacs(&tx, info, self.default_cancel_flags(&tx)).await {
                warn!(transaction_id = %tx.key(), error = %e, "Failed to cancel branches");
                code = 500;
            }
        }

        match self.inner.collab.builder.build_local_reply(cancel, code, reason_phrase(code)) {
            Ok(reply) => {
                if let Err(e) = self.inner.collab.transport.send(&cancel.source, reply).await {
                    warn!(transaction_id = %tx.key(), error = %e, "Failed to answer CANCEL");
                }
            }
            Err(e) => warn!(transaction_id = %tx.key(), error = %e, "Failed to build CANCEL reply"),
        }
        Ok(CancelOutcome::Handled)
    }

    /// Cancels a selection of branches on behalf of the routing logic.
    /// Returns how many branches this call took ownership of, or
    /// [`Error::InvariantViolation`] when `which` names a branch that does
    /// not exist.
    pub async fn cancel_branches(&self, tx: &TransactionHandle, which: CancelWhich) -> Result<usize> {
        if let CancelWhich::Others(branch) | CancelWhich::This(branch) = which {
            if branch >= tx.branch_count() {
                return Err(Error::InvariantViolation(format!("no branch {}", branch)));
            }
        }
        let skip = match which {
            CancelWhich::All => BranchBitmap::empty(),
            CancelWhich::Others(branch) => BranchBitmap::only(branch),
            CancelWhich::This(branch) => BranchBitmap(!BranchBitmap::only(branch).0),
        };
        let info = tx.prepare_cancel(skip, true);
        let claimed = info.branches.len();
        self.cancel_uacs(tx, info, self.default_cancel_flags(tx)).await?;
        Ok(claimed)
    }

    /// Cancels every branch in `info`. The caller must own their claims.
    pub async fn cancel_uacs(&self, tx: &TransactionHandle, info: CancelInfo, flags: CancelFlags) -> Result<()> {
        let mut last_err = None;
        for branch in info.branches.iter() {
            if let Err(e) = self.cancel_branch(tx, branch, info.reason.as_ref(), flags).await {
                debug!(transaction_id = %tx.key(), branch, error = %e, "Branch cancel failed");
                last_err = Some(e);
            }
        }
        last_err.map_or(Ok(()), Err)
    }

    /// [`TransactionManager::cancel_uacs`] for internal callers that have no
    /// one to report a failure to.
    pub(crate) async fn cancel_pending(&self, tx: &TransactionHandle, info: CancelInfo, flags: CancelFlags) {
        if info.is_empty() {
            return;
        }
        if let Err(e) = self.cancel_uacs(tx, info, flags).await {
            debug!(transaction_id = %tx.key(), error = %e, "Canceling pending branches failed");
        }
    }

    /// Cancels one claimed branch.
    ///
    /// A branch with a provisional reply (or any branch when `force_send` is
    /// set) gets a CANCEL. A branch that never answered is either faked a 487
    /// or left silent; in both cases its request retransmission stops and a
    /// provisional arriving later still triggers the CANCEL.
    pub async fn cancel_branch(
        &self,
        tx: &TransactionHandle,
        branch: usize,
        reason: Option<&CancelReason>,
        flags: CancelFlags,
    ) -> Result<()> {
        let slot = tx.slot(branch).ok_or_else(|| Error::InvariantViolation(format!("no branch {}", branch)))?;
        slot.set_flag(branch_flags::CANCELED);
        self.inner.stats.branch_canceled();
        self.inner.events.emit(TransactionEvent::BranchCanceled { transaction_id: tx.key().clone(), branch });

        let last = slot.last_received();
        if last >= 200 {
            slot.finish_cancel();
            return Ok(());
        }
        slot.request_timer.stop_retransmit();

        let replied = last >= 100;
        if tx.is_invite() && (replied || flags.force_send) && !slot.has_flag(branch_flags::BLIND) {
            let result = self.send_cancel(tx, branch, reason).await;
            slot.finish_cancel();
            return result;
        }
        // the CANCEL waits for a provisional; one that already slipped in
        // is caught by the re-check below or by fake_reply
        slot.set_flag(branch_flags::TO_CANCEL);
        slot.defer_cancel();
        // pairs with the fence in reply_received
        fence(Ordering::SeqCst);
        if flags.fake_reply {
            self.fake_reply(tx, branch, 487).await;
        } else if tx.is_invite() && (100..200).contains(&slot.last_received()) && slot.claim_late_cancel() {
            slot.take_flag(branch_flags::TO_CANCEL);
            let result = self.send_cancel(tx, branch, reason).await;
            slot.finish_cancel();
            return result;
        } else {
            trace!(transaction_id = %tx.key(), branch, "Silent cancel, CANCEL deferred to first provisional");
        }
        Ok(())
    }

    /// Builds and sends the hop-by-hop CANCEL of a branch, once.
    pub(crate) async fn send_cancel(
        &self,
        tx: &TransactionHandle,
        branch: usize,
        reason: Option<&CancelReason>,
    ) -> Result<()> {
        let slot = &tx.slots[branch];
        let Some(out) = slot.outbound() else {
            return Err(Error::InvariantViolation(format!("branch {} not built", branch)));
        };
        if out.buffer.is_none() || slot.local_cancel().is_some() {
            return Ok(());
        }
        let buffer = self.inner.collab.builder.build_cancel(tx.request(), &out.context(), reason)?;
        if slot.set_local_cancel(buffer.clone()).is_err() {
            return Ok(());
        }
        debug!(transaction_id = %tx.key(), branch, destination = %out.destination, "Sending CANCEL");
        self.inner.collab.transport.send(&out.destination, buffer).await?;
        self.start_cancel_timer(tx, branch);
        Ok(())
    }
}

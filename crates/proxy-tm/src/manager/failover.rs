//! Destination failover and the failure route (serial forking).

use tracing::{debug, trace};

use super::events::TransactionEvent;
use super::forward::ResolvedTarget;
use super::reply::ReplyDecision;
use super::TransactionManager;
use crate::error::{Error, Result};
use crate::interfaces::FailureContext;
use crate::message::reason_phrase;
use crate::transaction::cell::flags;
use crate::transaction::{CancelInfo, ReplyState, Transaction, TransactionHandle};

impl TransactionManager {
    /// Takes over the resolver cursor of failed branch `from` and adds a
    /// branch for its next candidate, in the same fork group.
    pub(crate) fn retry_next_destination(&self, tx: &Transaction, from: usize) -> Result<usize> {
        if !tx.config().failover || tx.has_flag(flags::DONT_FORK) || tx.is_canceled() {
            return Err(Error::NoMoreCandidates);
        }
        let mut state = tx.replies.lock();
        self.failover_locked(tx, &mut state, from)
    }

    /// Same as [`TransactionManager::retry_next_destination`] with the reply
    /// lock already held.
    pub(crate) fn failover_locked(&self, tx: &Transaction, state: &mut ReplyState, from: usize) -> Result<usize> {
        if state.uas.is_final() {
            return Err(Error::NoMoreCandidates);
        }
        let Some(mut cursor) = state.branches[from].cursor.take() else {
            return Err(Error::NoMoreCandidates);
        };
        let Some(destination) = self.inner.collab.resolver.next(&mut cursor) else {
            return Err(Error::NoMoreCandidates);
        };
        let uri = tx.slots[from]
            .outbound()
            .map(|o| o.uri.clone())
            .unwrap_or_else(|| tx.request().request_uri.clone());
        let group = state.branches[from].fork_group;
        let target = ResolvedTarget { uri, destination, cursor: Some(cursor) };
        self.insert_branch_locked(tx, state, target, group)
    }

    pub(crate) fn note_failover(&self, tx: &Transaction, from: usize, to: usize) {
        debug!(transaction_id = %tx.key(), from, to, "Failing over to next destination");
        self.inner.stats.failover();
        self.inner.events.emit(TransactionEvent::BranchFailedOver { transaction_id: tx.key().clone(), from, to });
    }

    /// Runs the armed failure route for a transaction whose branches are all
    /// final, then either sends the branches it added or relays the best
    /// stored reply.
    ///
    /// `snapshot` is the branch count when the route was triggered; it bounds
    /// which stored replies a drop policy may release.
    pub(crate) async fn run_failure_route(&self, tx: &TransactionHandle, branch: usize, code: u16, snapshot: usize) {
        let Some(route) = tx.routes().take_failure_route() else {
            self.relay_best(tx, code).await;
            return;
        };
        let reply = {
            let state = tx.replies.lock();
            state.branches[branch].reply.as_ref().and_then(|r| r.response().cloned())
        };
        let ctx = FailureContext { transaction: tx.clone(), branch, code, reply };
        debug!(transaction_id = %tx.key(), route, branch, code, "Running failure route");
        let action = self.inner.collab.hooks.on_failure(route, &ctx).await;
        drop(ctx);

        if let Some(next) = action.next_failure_route {
            tx.routes().set_failure_route(next);
        }

        let can_fork = !tx.is_canceled() && !tx.has_flag(flags::SIX_XX_SEEN) && !tx.has_flag(flags::DONT_FORK);
        let mut resolved = Vec::new();
        let mut last_err = None;
        if can_fork {
            for target in &action.targets {
                match self.resolve_target(tx, target).await {
                    Ok(r) => resolved.push(r),
                    Err(e) => last_err = Some(Error::most_specific(last_err, e)),
                }
            }
        } else if !action.targets.is_empty() {
            debug!(transaction_id = %tx.key(), "Not forking from failure route");
        }

        let policy = action.drop_policy.unwrap_or(tx.config().default_drop_policy);
        let (decision, added) = {
            let mut state = tx.replies.lock();
            if state.uas.is_final() {
                (ReplyDecision::Discard, Vec::new())
            } else {
                let released = state.drop_stored_replies(policy, snapshot);
                if released > 0 {
                    trace!(transaction_id = %tx.key(), released, ?policy, "Dropped stored replies");
                }
                if let Some((code, reason)) = &action.reply {
                    let completion = self.complete_local_locked(tx, &mut state, *code, reason, CancelInfo::default());
                    (ReplyDecision::Completed(completion), Vec::new())
                } else {
                    let mut added = Vec::new();
                    if !resolved.is_empty() {
                        let group = state.open_fork_group();
                        for target in resolved {
                            match self.insert_branch_locked(tx, &mut state, target, group) {
                                Ok(index) => added.push(index),
                                Err(e) => last_err = Some(Error::most_specific(last_err, e)),
                            }
                        }
                    }
                    if added.is_empty() {
                        let fallback = last_err.as_ref().map_or((code, reason_phrase(code)), Error::reply_code);
                        (self.conclude_locked(tx, &mut state, CancelInfo::default(), fallback, false), added)
                    } else {
                        (ReplyDecision::Discard, added)
                    }
                }
            }
        };

        self.apply_decision(tx.clone(), decision).await;
        if added.is_empty() {
            return;
        }
        debug!(transaction_id = %tx.key(), branches = added.len(), "Serial fork");
        let (sent, failed) = self.send_branches(tx, &added).await;
        if let Some(e) = failed {
            let (code, reason) = e.reply_code();
            trace!(transaction_id = %tx.key(), sent, error = %e, "Failure route branches failed");
            self.reevaluate(tx, Some((code, reason))).await;
        }
    }

    /// Relays the best stored reply without running a failure route.
    async fn relay_best(&self, tx: &TransactionHandle, code: u16) {
        let decision = {
            let mut state = tx.replies.lock();
            if state.uas.is_final() {
                ReplyDecision::Discard
            } else {
                self.conclude_locked(tx, &mut state, CancelInfo::default(), (code, reason_phrase(code)), false)
            }
        };
        self.apply_decision(tx.clone(), decision).await;
    }
}

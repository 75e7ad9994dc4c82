//! Branch creation and sending.

use tracing::{debug, trace, warn};

use super::TransactionManager;
use crate::error::{Error, Result};
use crate::interfaces::{BlacklistReason, BranchContext, HookVerdict, OutgoingBranch, ResolveFlags, ResolverCursor};
use crate::message::{Destination, Method};
use crate::transaction::branch::flags as branch_flags;
use crate::transaction::cell::flags;
use crate::transaction::{Branch, BranchTarget, OutboundRequest, ReplyState, Transaction, TransactionHandle};

/// A target whose destination is known.
#[derive(Debug)]
pub(crate) struct ResolvedTarget {
    pub uri: String,
    pub destination: Destination,
    pub cursor: Option<ResolverCursor>,
}

impl TransactionManager {
    /// Forwards the transaction's request.
    ///
    /// The request URI becomes the first branch unless an earlier call already
    /// used it; every entry of `targets` adds one more branch. `proxy`, when
    /// given, overrides the destination of every target that has none.
    ///
    /// Branches are built first and sent afterwards. The call succeeds when at
    /// least one branch went out; branches that failed to send become losing
    /// candidates. Otherwise the most specific error is returned and nothing
    /// was sent.
    ///
    /// Forwarding a CANCEL cancels the matching INVITE instead.
    pub async fn forward(
        &self,
        tx: &TransactionHandle,
        proxy: Option<Destination>,
        targets: Vec<BranchTarget>,
    ) -> Result<usize> {
        if tx.request().method == Method::Cancel {
            let request = tx.request().clone();
            return match self.cancel_request(&request).await? {
                super::CancelOutcome::Handled => Ok(0),
                super::CancelOutcome::NoSuchTransaction => Err(Error::TransactionNotFound(tx.key().to_string())),
            };
        }
        if tx.is_canceled() || tx.has_flag(flags::SIX_XX_SEEN) {
            return Err(Error::Canceled);
        }

        let mut pending = Vec::with_capacity(targets.len() + 1);
        if !tx.set_flag(flags::PRIMARY_CONSUMED) {
            let request = tx.request();
            let mut primary = BranchTarget::uri(request.request_uri.clone());
            primary.next_hop = request.next_hop.clone();
            pending.push(primary);
        }
        pending.extend(targets);
        if let Some(proxy) = proxy {
            for target in pending.iter_mut().filter(|t| t.destination.is_none()) {
                target.destination = Some(proxy.clone());
            }
        }
        if pending.is_empty() {
            return Err(Error::BadAddress("no branch targets".to_string()));
        }

        let mut last_err = None;
        let mut resolved = Vec::with_capacity(pending.len());
        for target in &pending {
            if tx.is_canceled() {
                return Err(Error::Canceled);
            }
            match self.resolve_target(tx, target).await {
                Ok(r) => resolved.push(r),
                Err(e) => {
                    debug!(transaction_id = %tx.key(), uri = %target.uri, error = %e, "Target not resolved");
                    last_err = Some(Error::most_specific(last_err, e));
                }
            }
        }

        let added = {
            let mut state = tx.replies.lock();
            if state.uas.is_final() {
                return Err(Error::AlreadyCompleted);
            }
            if tx.is_canceled() {
                return Err(Error::Canceled);
            }
            let group = state.open_fork_group();
            let mut added = Vec::with_capacity(resolved.len());
            for target in resolved {
                match self.insert_branch_locked(tx, &mut state, target, group) {
                    Ok(index) => added.push(index),
                    Err(e) => last_err = Some(Error::most_specific(last_err, e)),
                }
            }
            added
        };
        if added.is_empty() {
            return Err(last_err.unwrap_or_else(|| Error::BadAddress("no branch created".to_string())));
        }

        let (sent, failed) = self.send_branches(tx, &added).await;
        if sent == 0 {
            return Err(failed.unwrap_or(Error::SendFailure("no branch sent".to_string())));
        }
        if failed.is_some() {
            self.reevaluate(tx, None).await;
        }
        debug!(transaction_id = %tx.key(), sent, branches = tx.branch_count(), "Forwarded");
        Ok(sent)
    }

    /// Resolves and adds one branch without sending it.
    pub async fn add_branch(&self, tx: &TransactionHandle, target: BranchTarget) -> Result<usize> {
        let resolved = self.resolve_target(tx, &target).await?;
        let mut state = tx.replies.lock();
        if state.uas.is_final() {
            return Err(Error::AlreadyCompleted);
        }
        let group = match state.fork_groups.len() {
            0 => state.open_fork_group(),
            n => n - 1,
        };
        self.insert_branch_locked(tx, &mut state, resolved, group)
    }

    /// Adds a blind branch: nothing is sent, but it keeps the transaction
    /// alive until its final deadline or until a reply is injected on it.
    pub fn add_blind_branch(&self, tx: &TransactionHandle) -> Result<usize> {
        let index = {
            let mut state = tx.replies.lock();
            if state.uas.is_final() {
                return Err(Error::AlreadyCompleted);
            }
            let index = state.branches.len();
            if index >= tx.max_branches() {
                return Err(Error::TooManyBranches { max: tx.max_branches() });
            }
            let slot = &tx.slots[index];
            slot.publish(OutboundRequest {
                branch_id: tx.branch_id(index),
                uri: tx.request().request_uri.clone(),
                destination: tx.upstream().clone(),
                extra_headers: Vec::new(),
                buffer: None,
            })?;
            slot.set_flag(branch_flags::BLIND);
            let group = state.fork_groups.len().saturating_sub(1);
            state.branches.push(Branch::new(index, group, None));
            tx.publish_branch_count(index + 1);
            index
        };
        self.start_request_timer(tx, index);
        debug!(transaction_id = %tx.key(), branch = index, "Added blind branch");
        Ok(index)
    }

    pub(crate) async fn resolve_target(&self, tx: &Transaction, target: &BranchTarget) -> Result<ResolvedTarget> {
        if let Some(destination) = &target.destination {
            return Ok(ResolvedTarget { uri: target.uri.clone(), destination: destination.clone(), cursor: None });
        }
        let flags = ResolveFlags {
            no_failover: tx.has_flag(flags::DONT_FORK) || !tx.config().failover,
            ..Default::default()
        };
        let resolver = &self.inner.collab.resolver;
        let mut cursor = resolver.resolve(target.lookup_name(), None, flags).await?;
        let destination = resolver
            .next(&mut cursor)
            .ok_or_else(|| Error::BadAddress(target.lookup_name().to_string()))?;
        Ok(ResolvedTarget { uri: target.uri.clone(), destination, cursor: Some(cursor) })
    }

    /// Builds and publishes a branch. Must be called with the reply lock held.
    ///
    /// The request buffer and destination are written before the branch count
    /// is bumped, so lock-free readers never see a half-built branch.
    pub(crate) fn insert_branch_locked(
        &self,
        tx: &Transaction,
        state: &mut ReplyState,
        target: ResolvedTarget,
        fork_group: usize,
    ) -> Result<usize> {
        let index = state.branches.len();
        if index >= tx.max_branches() {
            return Err(Error::TooManyBranches { max: tx.max_branches() });
        }
        let collab = &self.inner.collab;
        let mut destination = target.destination;
        if destination.socket.is_none() {
            destination.socket = Some(
                collab
                    .transport
                    .local_socket_for(&destination)
                    .ok_or_else(|| Error::NoTransport(destination.to_string()))?,
            );
        }

        let mut outgoing = OutgoingBranch { index, uri: target.uri, destination, extra_headers: Vec::new() };
        if let Some(route) = tx.routes().branch_route() {
            if collab.hooks.on_branch(route, tx, &mut outgoing) == HookVerdict::Drop {
                return Err(Error::BranchDropped(index));
            }
            if outgoing.destination.socket.is_none() {
                outgoing.destination.socket = Some(
                    collab
                        .transport
                        .local_socket_for(&outgoing.destination)
                        .ok_or_else(|| Error::NoTransport(outgoing.destination.to_string()))?,
                );
            }
        }

        let branch_id = tx.branch_id(index);
        let buffer = collab.builder.build_branch_request(
            tx.request(),
            &BranchContext {
                branch_id: &branch_id,
                uri: &outgoing.uri,
                destination: &outgoing.destination,
                extra_headers: &outgoing.extra_headers,
            },
        )?;
        tx.slots[index].publish(OutboundRequest {
            branch_id,
            uri: outgoing.uri,
            destination: outgoing.destination,
            extra_headers: outgoing.extra_headers,
            buffer: Some(buffer),
        })?;
        state.branches.push(Branch::new(index, fork_group, target.cursor));
        tx.publish_branch_count(index + 1);
        trace!(transaction_id = %tx.key(), branch = index, fork_group, "Branch added");
        Ok(index)
    }

    /// Sends `branches` in order, stopping early when the transaction gets
    /// canceled. Returns the number sent and the most specific failure.
    pub(crate) async fn send_branches(&self, tx: &TransactionHandle, branches: &[usize]) -> (usize, Option<Error>) {
        let mut sent = 0;
        let mut failed = None;
        for (n, index) in branches.iter().copied().enumerate() {
            if tx.is_canceled() {
                debug!(transaction_id = %tx.key(), unsent = branches.len() - n, "Canceled while forwarding");
                for unsent in &branches[n..] {
                    self.fake_reply(tx, *unsent, 487).await;
                }
                failed = Some(Error::most_specific(failed, Error::Canceled));
                break;
            }
            match self.send_branch(tx, index).await {
                Ok(_) => sent += 1,
                Err(e) => failed = Some(Error::most_specific(failed, e)),
            }
        }
        (sent, failed)
    }

    /// Sends one branch, failing over to further resolver candidates while
    /// sends fail. Returns the index of the branch that actually went out.
    pub(crate) async fn send_branch(&self, tx: &TransactionHandle, index: usize) -> Result<usize> {
        let mut current = index;
        loop {
            let err = match self.try_send(tx, current).await {
                Ok(()) => return Ok(current),
                Err(e) => e,
            };
            self.mark_send_failed(tx, current);
            match self.retry_next_destination(tx, current) {
                Ok(next) => {
                    self.note_failover(tx, current, next);
                    current = next;
                }
                Err(retry_err) => {
                    trace!(
                        transaction_id = %tx.key(),
                        branch = current,
                        error = %retry_err,
                        "No failover after send failure"
                    );
                    return Err(err);
                }
            }
        }
    }

    async fn try_send(&self, tx: &TransactionHandle, index: usize) -> Result<()> {
        let out = tx.slots[index]
            .outbound()
            .ok_or_else(|| Error::InvariantViolation(format!("branch {} not built", index)))?;
        let Some(buffer) = out.buffer.clone() else {
            return Ok(());
        };
        let collab = &self.inner.collab;
        if collab.hooks.on_send(tx, index, &out.destination, &buffer) == HookVerdict::Drop {
            return Err(Error::BranchDropped(index));
        }
        let config = tx.config();
        if config.use_blacklist && collab.blacklist.is_blacklisted(&out.destination) {
            return Err(Error::SendFailure(format!("{} is blacklisted", out.destination)));
        }
        match collab.transport.send(&out.destination, buffer).await {
            Ok(()) => {
                trace!(transaction_id = %tx.key(), branch = index, destination = %out.destination, "Branch sent");
                self.start_request_timer(tx, index);
                Ok(())
            }
            Err(e) => {
                warn!(
                    transaction_id = %tx.key(),
                    branch = index,
                    destination = %out.destination,
                    error = %e,
                    "Send failed"
                );
                if config.use_blacklist {
                    collab.blacklist.add(&out.destination, BlacklistReason::SendFailed, config.blacklist_ttl);
                }
                Err(e.into())
            }
        }
    }

    /// Marks a branch final without a reply so it never wins selection.
    fn mark_send_failed(&self, tx: &Transaction, index: usize) {
        let mut state = tx.replies.lock();
        let slot = &tx.slots[index];
        slot.set_flag(branch_flags::SEND_FAILED);
        if !slot.is_final() {
            slot.set_last_received(408);
            state.branches[index].reply = None;
        }
    }
}

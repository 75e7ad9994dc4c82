use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

use crate::config::DropPolicy;
use crate::message::{Destination, SipResponse};
use crate::transaction::{BranchTarget, Transaction};

/// Identifier of a script route. Zero means "no route".
pub type RouteId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookVerdict {
    Continue,
    Drop,
}

/// The mutable part of a branch seen by [`RouteHooks::on_branch`].
#[derive(Debug, Clone)]
pub struct OutgoingBranch {
    pub index: usize,
    pub uri: String,
    pub destination: Destination,
    pub extra_headers: Vec<(String, String)>,
}

/// What the failure route saw.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub transaction: Arc<Transaction>,
    /// Branch whose reply currently wins.
    pub branch: usize,
    pub code: u16,
    /// The winning reply, `None` when it was faked locally.
    pub reply: Option<SipResponse>,
}

impl FailureContext {
    pub fn is_faked(&self) -> bool {
        self.reply.is_none()
    }
}

/// What the failure route wants done. The default does nothing, so the
/// winning reply is relayed.
#[derive(Debug, Clone, Default)]
pub struct FailureAction {
    /// New branches to fork (serial forking).
    pub targets: Vec<BranchTarget>,
    /// Replies to forget before new branches are compared.
    pub drop_policy: Option<DropPolicy>,
    /// Reply locally instead of relaying a branch reply.
    pub reply: Option<(u16, String)>,
    /// Failure route armed for the next negative outcome.
    pub next_failure_route: Option<RouteId>,
}

impl FailureAction {
    pub fn fork(targets: Vec<BranchTarget>) -> Self {
        Self { targets, ..Default::default() }
    }

    pub fn reply(code: u16, reason: impl Into<String>) -> Self {
        Self { reply: Some((code, reason.into())), ..Default::default() }
    }

    pub fn with_drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = Some(policy);
        self
    }

    pub fn with_next_failure_route(mut self, route: RouteId) -> Self {
        self.next_failure_route = Some(route);
        self
    }
}

/// Script callbacks selected per transaction through
/// [`TransactionOptions`](crate::transaction::TransactionOptions).
///
/// The synchronous hooks run while a branch is built or sent and must return
/// quickly. `on_failure` runs with the reply lock released and the transaction
/// pinned by the handle in its context.
#[async_trait]
pub trait RouteHooks: Send + Sync + fmt::Debug {
    /// Called for every new branch when a branch route is selected.
    fn on_branch(&self, _route: RouteId, _tx: &Transaction, _branch: &mut OutgoingBranch) -> HookVerdict {
        HookVerdict::Continue
    }

    /// Called right before a branch request goes out.
    fn on_send(&self, _tx: &Transaction, _branch: usize, _destination: &Destination, _data: &Bytes) -> HookVerdict {
        HookVerdict::Continue
    }

    /// Called for every matched reply when a reply route is selected. A
    /// `Drop` verdict only applies to provisional replies.
    fn on_reply(&self, _route: RouteId, _tx: &Transaction, _branch: usize, _reply: &SipResponse) -> HookVerdict {
        HookVerdict::Continue
    }

    /// Called when every branch has a final reply and the best one is negative.
    async fn on_failure(&self, _route: RouteId, _ctx: &FailureContext) -> FailureAction {
        FailureAction::default()
    }
}

/// Hooks that never intervene.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

#[async_trait]
impl RouteHooks for NoHooks {}

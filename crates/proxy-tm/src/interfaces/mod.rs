//! Contracts of the collaborators the engine drives but does not implement.

pub mod blacklist;
pub mod builder;
pub mod hooks;
pub mod resolver;
pub mod transport;

use std::sync::Arc;

pub use blacklist::{Blacklist, BlacklistReason, NoBlacklist};
pub use builder::{BranchContext, MessageBuilder};
pub use hooks::{FailureAction, FailureContext, HookVerdict, NoHooks, OutgoingBranch, RouteHooks, RouteId};
pub use resolver::{ResolveFlags, Resolver, ResolverCursor};
pub use transport::Transport;

/// The set of collaborators handed to a
/// [`TransactionManager`](crate::manager::TransactionManager).
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub resolver: Arc<dyn Resolver>,
    pub builder: Arc<dyn MessageBuilder>,
    pub blacklist: Arc<dyn Blacklist>,
    pub hooks: Arc<dyn RouteHooks>,
}

impl Collaborators {
    /// Collaborators with no blacklist and no route hooks.
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn Resolver>,
        builder: Arc<dyn MessageBuilder>,
    ) -> Self {
        Self {
            transport,
            resolver,
            builder,
            blacklist: Arc::new(NoBlacklist),
            hooks: Arc::new(NoHooks),
        }
    }

    pub fn with_blacklist(mut self, blacklist: Arc<dyn Blacklist>) -> Self {
        self.blacklist = blacklist;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn RouteHooks>) -> Self {
        self.hooks = hooks;
        self
    }
}

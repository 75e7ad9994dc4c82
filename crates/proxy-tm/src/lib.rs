//! Stateful SIP proxy transaction engine for the rvoip stack
//!
//! This crate forwards a SIP request to one or more destinations (branches),
//! collects their replies, picks the best final reply to relay upstream,
//! drives retransmission and timeout timers, and propagates CANCEL.
//!
//! Parsing, serialization, DNS and sockets are left to collaborators the
//! caller plugs in through [`interfaces::Collaborators`].
//!
//! ## Example
//!
//! ```rust,no_run
//! # use rvoip_proxy_tm::prelude::*;
//! # async fn example(collaborators: Collaborators, request: SipRequest) -> Result<()> {
//! let manager = TransactionManager::new(TmConfig::default(), collaborators)?;
//! manager.start_timer_task();
//!
//! let outcome = manager
//!     .relay(request, TransactionOptions::default(), None, vec![BranchTarget::uri("sip:alice@192.0.2.10")])
//!     .await?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod interfaces;
pub mod logging;
pub mod manager;
pub mod message;
pub mod serial;
pub mod stats;
pub mod timer;
pub mod transaction;

pub use config::{CancelMode, ConfigHandle, DropPolicy, TmConfig};
pub use error::{Error, Result};
pub use manager::{CancelOutcome, RelayOutcome, ReplyOutcome, TransactionEvent, TransactionManager};
pub use stats::StatsSnapshot;
pub use transaction::{BranchTarget, Transaction, TransactionHandle, TransactionKey, TransactionOptions};

/// Commonly used types.
pub mod prelude {
    pub use crate::config::{CancelMode, DropPolicy, TmConfig};
    pub use crate::error::{BuildError, Error, ResolveError, Result, TransportError};
    pub use crate::interfaces::{
        Blacklist, BlacklistReason, BranchContext, Collaborators, FailureAction, FailureContext, HookVerdict,
        MessageBuilder, OutgoingBranch, ResolveFlags, Resolver, ResolverCursor, RouteHooks, RouteId, Transport,
    };
    pub use crate::manager::{CancelOutcome, RelayOutcome, ReplyOutcome, TransactionEvent, TransactionManager};
    pub use crate::message::{Destination, LocalSocket, Method, Protocol, SipRequest, SipResponse, Via};
    pub use crate::serial::{Contact, ContactSet};
    pub use crate::timer::{TickClock, TimerSettings};
    pub use crate::transaction::{
        BranchTarget, CancelFlags, CancelReason, CancelWhich, Pick, Transaction, TransactionHandle, TransactionKey,
        TransactionOptions,
    };
}

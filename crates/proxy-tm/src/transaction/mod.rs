//! Transaction and branch data model.

pub mod branch;
pub mod cancel;
pub mod cell;
pub mod key;
pub mod priority;
pub mod table;

pub use branch::{Branch, BranchSlot, BranchTarget, OutboundRequest, StoredReply};
pub use cancel::{BranchBitmap, CancelFlags, CancelInfo, CancelReason, CancelState, CancelWhich};
pub use cell::{ReplyState, RouteSelectors, Transaction, TransactionOptions, UasReply};
pub use key::{BranchLabel, TransactionKey, MAGIC_COOKIE};
pub use priority::{pick_branch, reply_priority, Pick};
pub use table::TransactionTable;

/// Shared handle to a transaction.
pub type TransactionHandle = std::sync::Arc<Transaction>;

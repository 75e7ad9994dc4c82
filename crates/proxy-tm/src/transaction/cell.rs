//! The transaction cell.
//!
//! ```text
//!                 Arc<Transaction>
//!   ┌──────────────────────────────────────────────────┐
//!   │ key, label, request, config snapshot  (immutable)│
//!   │ flags, branch_count, routes           (atomics)  │
//!   │ slots[0..max]   BranchSlot            (lock-free)│
//!   │ replies: Mutex<ReplyState>           (reply lock)│
//!   │   ├─ branches: Vec<Branch>                       │
//!   │   ├─ uas: UasReply                               │
//!   │   └─ fork_groups                                 │
//!   │ uas_timer: RetrTimer                             │
//!   └──────────────────────────────────────────────────┘
//! ```
//!
//! The reply lock guards exactly branch state transitions, publication of the
//! upstream reply and the stored replies. Everything else is either immutable
//! or atomic. No code path holds the lock of two transactions at once, and no
//! I/O is performed while it is held.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::branch::{flags as branch_flags, Branch, BranchSlot};
use super::cancel::{BranchBitmap, CancelInfo, CancelReason};
use super::key::{BranchLabel, TransactionKey};
use super::priority::{pick_branch, Pick};
use crate::config::{DropPolicy, TmConfig};
use crate::interfaces::RouteId;
use crate::message::{Destination, SipRequest};
use crate::timer::RetrTimer;

/// Transaction flags.
pub mod flags {
    /// An upstream CANCEL (or script) canceled the transaction.
    pub const CANCELED: u32 = 0x01;
    /// Never fork or fail over.
    pub const DONT_FORK: u32 = 0x02;
    /// A 6xx was received on some branch.
    pub const SIX_XX_SEEN: u32 = 0x04;
    /// Reply 408 on a silent INVITE timeout too.
    pub const NOISY_FINAL_TIMER: u32 = 0x08;
    /// The request URI has been used for a branch.
    pub const PRIMARY_CONSUMED: u32 = 0x10;
    /// The wait timer is armed.
    pub const ON_WAIT: u32 = 0x20;
    /// Removed from the transaction table.
    pub const DELETED: u32 = 0x40;
    /// Upstream ACK seen for a negative INVITE reply.
    pub const ACKED: u32 = 0x80;
}

/// Per-transaction options chosen by the routing logic when the transaction
/// is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    pub on_branch: Option<RouteId>,
    pub on_failure: Option<RouteId>,
    pub on_reply: Option<RouteId>,
    pub dont_fork: bool,
    pub noisy_ctimer: bool,
}

impl TransactionOptions {
    pub fn with_failure_route(mut self, route: RouteId) -> Self {
        self.on_failure = Some(route);
        self
    }

    pub fn with_branch_route(mut self, route: RouteId) -> Self {
        self.on_branch = Some(route);
        self
    }

    pub fn with_reply_route(mut self, route: RouteId) -> Self {
        self.on_reply = Some(route);
        self
    }

    pub fn dont_fork(mut self) -> Self {
        self.dont_fork = true;
        self
    }

    pub fn noisy(mut self) -> Self {
        self.noisy_ctimer = true;
        self
    }
}

/// Route selectors stored on the transaction; 0 means none.
#[derive(Debug, Default)]
pub struct RouteSelectors {
    on_branch: AtomicU32,
    on_failure: AtomicU32,
    on_reply: AtomicU32,
}

impl RouteSelectors {
    fn from_options(options: &TransactionOptions) -> Self {
        Self {
            on_branch: AtomicU32::new(options.on_branch.unwrap_or(0)),
            on_failure: AtomicU32::new(options.on_failure.unwrap_or(0)),
            on_reply: AtomicU32::new(options.on_reply.unwrap_or(0)),
        }
    }

    fn get(cell: &AtomicU32) -> Option<RouteId> {
        match cell.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn branch_route(&self) -> Option<RouteId> {
        Self::get(&self.on_branch)
    }

    pub fn reply_route(&self) -> Option<RouteId> {
        Self::get(&self.on_reply)
    }

    pub fn failure_route(&self) -> Option<RouteId> {
        Self::get(&self.on_failure)
    }

    /// Takes the failure route so it runs at most once unless re-armed.
    pub(crate) fn take_failure_route(&self) -> Option<RouteId> {
        match self.on_failure.swap(0, Ordering::AcqRel) {
            0 => None,
            id => Some(id),
        }
    }

    pub(crate) fn set_failure_route(&self, route: RouteId) {
        self.on_failure.store(route, Ordering::Release);
    }
}

/// The upstream-facing reply slot.
#[derive(Debug, Default, Clone)]
pub struct UasReply {
    /// Last status sent upstream, 0 if none.
    pub status: u16,
    /// Serialized copy, kept for retransmission.
    pub buffer: Option<Bytes>,
    /// The reply was generated locally rather than relayed.
    pub local: bool,
    /// Branch the reply was relayed from.
    pub branch: Option<usize>,
    /// A 2xx has been sent upstream.
    pub relayed_2xx: bool,
}

impl UasReply {
    pub fn is_final(&self) -> bool {
        self.status >= 200
    }
}

/// State guarded by the reply lock.
#[derive(Debug, Default)]
pub struct ReplyState {
    pub branches: Vec<Branch>,
    pub uas: UasReply,
    /// First branch index of every fork step, in creation order.
    pub fork_groups: Vec<usize>,
}

impl ReplyState {
    /// Opens a new fork step starting at the next branch index.
    pub(crate) fn open_fork_group(&mut self) -> usize {
        let start = self.branches.len();
        if self.fork_groups.last() != Some(&start) {
            self.fork_groups.push(start);
        }
        self.fork_groups.len() - 1
    }

    /// Releases stored replies of branches below `upto` according to `policy`.
    /// Returns the number of replies released.
    pub fn drop_stored_replies(&mut self, policy: DropPolicy, upto: usize) -> usize {
        let from = match policy {
            DropPolicy::KeepAll => return 0,
            DropPolicy::DropAll => 0,
            DropPolicy::DropLastForkGroup => self
                .fork_groups
                .iter()
                .rev()
                .copied()
                .find(|start| *start < upto)
                .unwrap_or(0),
        };
        let mut released = 0;
        for branch in self.branches.iter_mut().take(upto).skip(from) {
            if branch.reply.take().is_some() {
                released += 1;
            }
        }
        released
    }
}

/// A stateful transaction: one upstream request and all of its branches.
pub struct Transaction {
    key: TransactionKey,
    label: u64,
    hash: u32,
    request: SipRequest,
    config: Arc<TmConfig>,
    flags: AtomicU32,
    branch_count: AtomicUsize,
    pub(crate) slots: Box<[BranchSlot]>,
    pub(crate) replies: Mutex<ReplyState>,
    pub(crate) uas_timer: RetrTimer,
    routes: RouteSelectors,
}

impl Transaction {
    pub(crate) fn new(
        key: TransactionKey,
        label: u64,
        hash: u32,
        request: SipRequest,
        config: Arc<TmConfig>,
        options: &TransactionOptions,
    ) -> Self {
        let mut initial = 0;
        if options.dont_fork {
            initial |= flags::DONT_FORK;
        }
        if options.noisy_ctimer {
            initial |= flags::NOISY_FINAL_TIMER;
        }
        let slots = (0..config.max_branches).map(|_| BranchSlot::new()).collect();
        Self {
            key,
            label,
            hash,
            request,
            config,
            flags: AtomicU32::new(initial),
            branch_count: AtomicUsize::new(0),
            slots,
            replies: Mutex::new(ReplyState::default()),
            uas_timer: RetrTimer::new(),
            routes: RouteSelectors::from_options(options),
        }
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub fn label(&self) -> u64 {
        self.label
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn request(&self) -> &SipRequest {
        &self.request
    }

    pub fn config(&self) -> &TmConfig {
        &self.config
    }

    pub fn routes(&self) -> &RouteSelectors {
        &self.routes
    }

    pub fn is_invite(&self) -> bool {
        self.request.is_invite()
    }

    /// Where replies to the upstream request are sent.
    pub fn upstream(&self) -> &Destination {
        &self.request.source
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    /// Sets `flag`, returning whether it was already set.
    pub(crate) fn set_flag(&self, flag: u32) -> bool {
        self.flags.fetch_or(flag, Ordering::AcqRel) & flag != 0
    }

    pub fn is_canceled(&self) -> bool {
        self.has_flag(flags::CANCELED)
    }

    /// Number of published branches. Every slot below it is fully built.
    pub fn branch_count(&self) -> usize {
        self.branch_count.load(Ordering::Acquire)
    }

    pub(crate) fn publish_branch_count(&self, count: usize) {
        self.branch_count.store(count, Ordering::Release);
    }

    pub fn max_branches(&self) -> usize {
        self.slots.len()
    }

    /// Lock-free view of a published branch.
    pub fn slot(&self, index: usize) -> Option<&BranchSlot> {
        if index < self.branch_count() { self.slots.get(index) } else { None }
    }

    /// Via branch id for branch `index`.
    pub fn branch_id(&self, index: usize) -> String {
        BranchLabel::new(self.hash, self.label, index).encode()
    }

    /// Status of the reply last sent upstream, 0 if none.
    pub fn uas_status(&self) -> u16 {
        self.replies.lock().uas.status
    }

    pub fn is_completed(&self) -> bool {
        self.uas_status() >= 200
    }

    /// Last status of every published branch.
    pub fn branch_statuses(&self) -> Vec<u16> {
        (0..self.branch_count()).map(|i| self.slots[i].last_received()).collect()
    }

    /// Selects the branch whose reply should win right now.
    pub fn pick_branch(&self) -> Pick {
        let state = self.replies.lock();
        pick_branch(&self.slots, &state.branches, self.config.faked_reply_prio)
    }

    /// Releases stored replies of the branches created so far.
    pub fn drop_stored_replies(&self, policy: DropPolicy) -> usize {
        let mut state = self.replies.lock();
        let upto = state.branches.len();
        state.drop_stored_replies(policy, upto)
    }

    /// Marks cancel-eligible branches and claims their cancel ownership.
    ///
    /// A branch is eligible when it is not in `skip`, has no final reply and
    /// nobody claimed it before. Branches with a provisional reply are always
    /// claimed. Branches with no reply at all are flagged `TO_CANCEL` and only
    /// claimed when `include_unreplied` is set. The claim is a single
    /// compare-and-swap, so concurrent callers never get the same branch.
    pub fn prepare_cancel(&self, skip: BranchBitmap, include_unreplied: bool) -> CancelInfo {
        let mut info = CancelInfo::default();
        for index in 0..self.branch_count() {
            if skip.contains(index) {
                continue;
            }
            let slot = &self.slots[index];
            let last = slot.last_received();
            if (100..200).contains(&last) {
                if slot.claim_cancel() {
                    info.branches.insert(index);
                }
            } else if last == 0 && !slot.has_flag(branch_flags::BLIND) {
                // claimed before flagged, so a racing provisional cannot
                // take the branch from this caller
                if include_unreplied && slot.claim_cancel() {
                    info.branches.insert(index);
                }
                slot.set_flag(branch_flags::TO_CANCEL);
            }
        }
        info
    }

    /// Same as [`Transaction::prepare_cancel`] with a reason attached.
    pub fn prepare_cancel_with_reason(
        &self,
        skip: BranchBitmap,
        include_unreplied: bool,
        reason: Option<CancelReason>,
    ) -> CancelInfo {
        let mut info = self.prepare_cancel(skip, include_unreplied);
        info.reason = reason;
        info
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("key", &self.key)
            .field("label", &self.label)
            .field("method", &self.request.method)
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .field("branches", &self.branch_count())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        tracing::trace!(key = %self.key, label = self.label, "transaction freed");
    }
}

//! Branch (UAC side) state.
//!
//! A branch is split in two halves:
//!
//! - [`BranchSlot`]: fields read without the reply lock (request buffer,
//!   destination, last status, flags, cancel owner, timers). The request
//!   buffer and destination are write-once and published before the
//!   transaction's branch count is incremented.
//! - [`Branch`]: fields only touched under the reply lock (stored reply,
//!   resolver cursor, fork group).

use bytes::Bytes;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, AtomicU16, Ordering};

use super::cancel::CancelState;
use crate::error::{Error, Result};
use crate::interfaces::{BranchContext, ResolverCursor};
use crate::message::{Destination, SipResponse};
use crate::timer::RetrTimer;

/// A forwarding target: a URI, optionally with an explicit next hop or an
/// already resolved destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchTarget {
    /// Request-URI of the branch.
    pub uri: String,
    /// URI to resolve instead of `uri` (outbound proxy / Route).
    pub next_hop: Option<String>,
    /// Pre-resolved destination; skips the resolver.
    pub destination: Option<Destination>,
}

impl BranchTarget {
    pub fn uri(uri: impl Into<String>) -> Self {
        Self { uri: uri.into(), next_hop: None, destination: None }
    }

    pub fn with_next_hop(mut self, next_hop: impl Into<String>) -> Self {
        self.next_hop = Some(next_hop.into());
        self
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    /// The name handed to the resolver.
    pub fn lookup_name(&self) -> &str {
        self.next_hop.as_deref().unwrap_or(&self.uri)
    }
}

/// Branch flags.
pub mod flags {
    /// The branch was canceled.
    pub const CANCELED: u8 = 0x01;
    /// The final deadline fired on this branch.
    pub const FR_TIMEOUT: u8 = 0x02;
    /// At least one reply was received on the wire.
    pub const REPLIED: u8 = 0x04;
    /// Canceled before any reply; a late provisional must trigger the CANCEL.
    pub const TO_CANCEL: u8 = 0x08;
    /// The request could not be sent.
    pub const SEND_FAILED: u8 = 0x10;
    /// Blind branch: no request buffer, never blocks selection.
    pub const BLIND: u8 = 0x20;
}

/// The serialized request of a branch and where it goes.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub branch_id: String,
    pub uri: String,
    pub destination: Destination,
    pub extra_headers: Vec<(String, String)>,
    /// `None` for a blind branch.
    pub buffer: Option<Bytes>,
}

impl OutboundRequest {
    pub fn context(&self) -> BranchContext<'_> {
        BranchContext {
            branch_id: &self.branch_id,
            uri: &self.uri,
            destination: &self.destination,
            extra_headers: &self.extra_headers,
        }
    }
}

/// Lock-free half of a branch.
#[derive(Debug, Default)]
pub struct BranchSlot {
    last_received: AtomicU16,
    flags: AtomicU8,
    cancel: AtomicU8,
    outbound: OnceLock<OutboundRequest>,
    local_cancel: OnceLock<Bytes>,
    pub(crate) request_timer: RetrTimer,
    pub(crate) cancel_timer: RetrTimer,
}

impl BranchSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last status received or faked on the branch, 0 if none.
    pub fn last_received(&self) -> u16 {
        self.last_received.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_received(&self, code: u16) {
        self.last_received.store(code, Ordering::Release);
    }

    pub fn is_final(&self) -> bool {
        self.last_received() >= 200
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    pub(crate) fn set_flag(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    /// Clears `flag`, returning whether it was set.
    pub(crate) fn take_flag(&self, flag: u8) -> bool {
        self.flags.fetch_and(!flag, Ordering::AcqRel) & flag != 0
    }

    pub fn cancel_state(&self) -> CancelState {
        CancelState::from_u8(self.cancel.load(Ordering::Acquire))
    }

    /// Becomes the single owner allowed to cancel this branch.
    pub(crate) fn claim_cancel(&self) -> bool {
        self.cancel
            .compare_exchange(
                CancelState::NotNeeded as u8,
                CancelState::InProgress as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn finish_cancel(&self) {
        self.cancel.store(CancelState::Done as u8, Ordering::Release);
    }

    /// Parks an owned claim until the branch answers provisionally.
    pub(crate) fn defer_cancel(&self) {
        self.cancel.store(CancelState::Deferred as u8, Ordering::Release);
    }

    /// Takes the claim for a CANCEL that has to go out now: either nobody
    /// owns the branch yet or its owner deferred the CANCEL.
    pub(crate) fn claim_late_cancel(&self) -> bool {
        self.claim_cancel()
            || self
                .cancel
                .compare_exchange(
                    CancelState::Deferred as u8,
                    CancelState::InProgress as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
    }

    pub fn outbound(&self) -> Option<&OutboundRequest> {
        self.outbound.get()
    }

    pub(crate) fn publish(&self, outbound: OutboundRequest) -> Result<()> {
        self.outbound
            .set(outbound)
            .map_err(|o| Error::InvariantViolation(format!("branch buffer {} already set", o.branch_id)))
    }

    pub fn local_cancel(&self) -> Option<&Bytes> {
        self.local_cancel.get()
    }

    pub(crate) fn set_local_cancel(&self, buffer: Bytes) -> Result<()> {
        self.local_cancel
            .set(buffer)
            .map_err(|_| Error::InvariantViolation("local CANCEL buffer already set".to_string()))
    }
}

/// A reply kept for branch comparison.
#[derive(Debug, Clone)]
pub enum StoredReply {
    /// Private copy of a reply received on the wire.
    Received(SipResponse),
    /// Status only, the reply was generated locally.
    Faked,
}

impl StoredReply {
    pub fn is_faked(&self) -> bool {
        matches!(self, StoredReply::Faked)
    }

    pub fn response(&self) -> Option<&SipResponse> {
        match self {
            StoredReply::Received(r) => Some(r),
            StoredReply::Faked => None,
        }
    }
}

/// Locked half of a branch.
#[derive(Debug)]
pub struct Branch {
    pub index: usize,
    pub reply: Option<StoredReply>,
    pub cursor: Option<ResolverCursor>,
    /// Index of the fork step this branch was created in.
    pub fork_group: usize,
}

impl Branch {
    pub fn new(index: usize, fork_group: usize, cursor: Option<ResolverCursor>) -> Self {
        Self { index, reply: None, cursor, fork_group }
    }
}

use bytes::Bytes;
use std::fmt;

use crate::error::BuildError;
use crate::message::{Destination, SipRequest, SipResponse};
use crate::transaction::CancelReason;

/// Per-branch data the builder needs to serialize an outgoing message.
#[derive(Debug, Clone, Copy)]
pub struct BranchContext<'a> {
    /// Value of the `branch` parameter of the Via this proxy adds.
    pub branch_id: &'a str,
    /// Request-URI of the branch.
    pub uri: &'a str,
    pub destination: &'a Destination,
    /// Headers added by the branch route hook.
    pub extra_headers: &'a [(String, String)],
}

/// Serializes the messages the engine sends.
///
/// The builder owns header syntax (Via insertion and removal, Route handling,
/// Max-Forwards, To-tags). Every method is called with the reply lock of the
/// transaction possibly held and must not block.
pub trait MessageBuilder: Send + Sync + fmt::Debug {
    /// The request forwarded on one branch.
    fn build_branch_request(&self, request: &SipRequest, ctx: &BranchContext<'_>) -> Result<Bytes, BuildError>;

    /// A hop-by-hop CANCEL for a branch of an INVITE.
    fn build_cancel(
        &self,
        request: &SipRequest,
        ctx: &BranchContext<'_>,
        reason: Option<&CancelReason>,
    ) -> Result<Bytes, BuildError>;

    /// The hop-by-hop ACK for a negative final reply received on a branch.
    fn build_ack(
        &self,
        request: &SipRequest,
        ctx: &BranchContext<'_>,
        reply: &SipResponse,
    ) -> Result<Bytes, BuildError>;

    /// A received reply prepared for relaying upstream (own Via removed).
    /// `status` replaces the status line when set.
    fn build_relayed_reply(&self, reply: &SipResponse, status: Option<(u16, &str)>) -> Result<Bytes, BuildError>;

    /// A reply generated by this proxy.
    fn build_local_reply(&self, request: &SipRequest, code: u16, reason: &str) -> Result<Bytes, BuildError>;
}

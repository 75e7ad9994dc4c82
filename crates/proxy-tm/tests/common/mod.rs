//! Shared mocks for the integration tests.
//!
//! The builder renders every message as a single text line so tests can
//! assert on what went over the "wire" without a SIP parser.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rvoip_proxy_tm::prelude::*;

pub const UPSTREAM: &str = "192.0.2.1:5060";
pub const LOCAL: &str = "192.0.2.254:5060";

pub fn addr(s: &str) -> SocketAddr {
    s.parse().expect("valid socket address")
}

/// Transport that records every send and fails for selected addresses.
#[derive(Debug, Default)]
pub struct MockTransport {
    sent: Mutex<Vec<(Destination, String)>>,
    failing: Mutex<HashSet<SocketAddr>>,
}

impl MockTransport {
    pub fn fail_to(&self, addr: SocketAddr) {
        self.failing.lock().insert(addr);
    }

    pub fn sent(&self) -> Vec<(Destination, String)> {
        self.sent.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Lines sent to `addr`, in order.
    pub fn sent_to(&self, addr: SocketAddr) -> Vec<String> {
        self.sent.lock().iter().filter(|(d, _)| d.addr == addr).map(|(_, m)| m.clone()).collect()
    }

    /// Number of sent lines starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.sent.lock().iter().filter(|(_, m)| m.starts_with(prefix)).count()
    }

    /// Status codes of the replies sent upstream to the INVITE (not the CANCEL).
    pub fn upstream_statuses(&self) -> Vec<u16> {
        self.sent_to(addr(UPSTREAM))
            .iter()
            .filter(|m| !m.ends_with("(CANCEL)"))
            .filter_map(|m| status_of(m))
            .collect()
    }

    /// Final status codes sent upstream to the INVITE.
    pub fn upstream_finals(&self) -> Vec<u16> {
        self.upstream_statuses().into_iter().filter(|s| *s >= 200).collect()
    }
}

pub fn status_of(line: &str) -> Option<u16> {
    line.strip_prefix("SIP/2.0 ")?.get(..3)?.parse().ok()
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, destination: &Destination, data: Bytes) -> std::result::Result<(), TransportError> {
        if self.failing.lock().contains(&destination.addr) {
            return Err(TransportError::SendFailed(format!("{} unreachable", destination.addr)));
        }
        let line = String::from_utf8_lossy(&data).into_owned();
        self.sent.lock().push((destination.clone(), line));
        Ok(())
    }

    fn local_socket_for(&self, destination: &Destination) -> Option<LocalSocket> {
        Some(LocalSocket { addr: addr(LOCAL), protocol: destination.protocol })
    }
}

/// Resolver backed by a fixed table.
#[derive(Debug, Default)]
pub struct StaticResolver {
    names: Mutex<HashMap<String, Vec<Destination>>>,
}

impl StaticResolver {
    pub fn insert(&self, name: &str, candidates: Vec<Destination>) {
        self.names.lock().insert(name.to_string(), candidates);
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(
        &self,
        name: &str,
        _protocol: Option<Protocol>,
        flags: ResolveFlags,
    ) -> std::result::Result<ResolverCursor, ResolveError> {
        let mut candidates = self
            .names
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(name.to_string()))?;
        if flags.no_failover {
            candidates.truncate(1);
        }
        Ok(ResolverCursor::new(name, candidates))
    }
}

/// Blacklist that records additions and blocks selected addresses.
#[derive(Debug, Default)]
pub struct RecordingBlacklist {
    pub added: Mutex<Vec<(SocketAddr, BlacklistReason, Duration)>>,
    blocked: Mutex<HashSet<SocketAddr>>,
}

impl RecordingBlacklist {
    pub fn block(&self, addr: SocketAddr) {
        self.blocked.lock().insert(addr);
    }

    pub fn reasons_for(&self, addr: SocketAddr) -> Vec<BlacklistReason> {
        self.added.lock().iter().filter(|(a, _, _)| *a == addr).map(|(_, r, _)| *r).collect()
    }
}

impl Blacklist for RecordingBlacklist {
    fn is_blacklisted(&self, destination: &Destination) -> bool {
        self.blocked.lock().contains(&destination.addr)
    }

    fn add(&self, destination: &Destination, reason: BlacklistReason, ttl: Duration) {
        self.added.lock().push((destination.addr, reason, ttl));
    }
}

/// Renders messages as one-line text.
#[derive(Debug, Default)]
pub struct TextBuilder;

impl MessageBuilder for TextBuilder {
    fn build_branch_request(
        &self,
        request: &SipRequest,
        ctx: &BranchContext<'_>,
    ) -> std::result::Result<Bytes, BuildError> {
        let headers: Vec<String> = ctx.extra_headers.iter().map(|(n, v)| format!("{}={}", n, v)).collect();
        Ok(Bytes::from(format!(
            "{} {} branch={} {}",
            request.method,
            ctx.uri,
            ctx.branch_id,
            headers.join(",")
        )))
    }

    fn build_cancel(
        &self,
        _request: &SipRequest,
        ctx: &BranchContext<'_>,
        reason: Option<&CancelReason>,
    ) -> std::result::Result<Bytes, BuildError> {
        let reason = reason.map(|r| r.to_string()).unwrap_or_default();
        Ok(Bytes::from(format!("CANCEL {} branch={} reason={}", ctx.uri, ctx.branch_id, reason)))
    }

    fn build_ack(
        &self,
        _request: &SipRequest,
        ctx: &BranchContext<'_>,
        reply: &SipResponse,
    ) -> std::result::Result<Bytes, BuildError> {
        Ok(Bytes::from(format!("ACK {} branch={} status={}", ctx.uri, ctx.branch_id, reply.status)))
    }

    fn build_relayed_reply(
        &self,
        reply: &SipResponse,
        status: Option<(u16, &str)>,
    ) -> std::result::Result<Bytes, BuildError> {
        let (code, reason) = status.unwrap_or((reply.status, reply.reason.as_str()));
        Ok(Bytes::from(format!("SIP/2.0 {} {} relayed ({})", code, reason, reply.cseq_method)))
    }

    fn build_local_reply(
        &self,
        request: &SipRequest,
        code: u16,
        reason: &str,
    ) -> std::result::Result<Bytes, BuildError> {
        Ok(Bytes::from(format!("SIP/2.0 {} {} local ({})", code, reason, request.method)))
    }
}

/// Route hooks driven by closures set per test.
#[derive(Default)]
pub struct ScriptedHooks {
    pub failure: Mutex<Vec<FailureAction>>,
    pub failures_seen: Mutex<Vec<(RouteId, usize, u16, bool)>>,
    pub drop_provisionals: Mutex<bool>,
    pub veto_send_to: Mutex<HashSet<SocketAddr>>,
    pub extra_header: Mutex<Option<(String, String)>>,
}

impl std::fmt::Debug for ScriptedHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedHooks").finish()
    }
}

impl ScriptedHooks {
    /// Queues the action returned by the next failure route run.
    pub fn on_next_failure(&self, action: FailureAction) {
        self.failure.lock().push(action);
    }
}

#[async_trait]
impl RouteHooks for ScriptedHooks {
    fn on_branch(&self, _route: RouteId, _tx: &Transaction, branch: &mut OutgoingBranch) -> HookVerdict {
        if let Some(header) = self.extra_header.lock().clone() {
            branch.extra_headers.push(header);
        }
        HookVerdict::Continue
    }

    fn on_send(
        &self,
        _tx: &Transaction,
        _branch: usize,
        destination: &Destination,
        _data: &Bytes,
    ) -> HookVerdict {
        if self.veto_send_to.lock().contains(&destination.addr) {
            HookVerdict::Drop
        } else {
            HookVerdict::Continue
        }
    }

    fn on_reply(
        &self,
        _route: RouteId,
        _tx: &Transaction,
        _branch: usize,
        _reply: &SipResponse,
    ) -> HookVerdict {
        if *self.drop_provisionals.lock() {
            HookVerdict::Drop
        } else {
            HookVerdict::Continue
        }
    }

    async fn on_failure(&self, route: RouteId, ctx: &FailureContext) -> FailureAction {
        self.failures_seen.lock().push((route, ctx.branch, ctx.code, ctx.is_faked()));
        let mut queue = self.failure.lock();
        if queue.is_empty() {
            FailureAction::default()
        } else {
            queue.remove(0)
        }
    }
}

pub fn request(method: Method, call_id: &str) -> SipRequest {
    SipRequest {
        method,
        request_uri: BOB.to_string(),
        next_hop: None,
        call_id: call_id.to_string(),
        cseq: 1,
        from_tag: Some("alice-tag".to_string()),
        top_via: Via { branch: Some(format!("z9hG4bK-{}", call_id)), sent_by: UPSTREAM.to_string() },
        reason: None,
        source: Destination::udp(addr(UPSTREAM)),
        raw: Bytes::new(),
    }
}

pub fn invite(call_id: &str) -> SipRequest {
    request(Method::Invite, call_id)
}

pub fn cancel_for(invite: &SipRequest) -> SipRequest {
    SipRequest { method: Method::Cancel, raw: Bytes::new(), ..invite.clone() }
}

pub fn ack_for(invite: &SipRequest) -> SipRequest {
    SipRequest { method: Method::Ack, raw: Bytes::new(), ..invite.clone() }
}

/// A downstream reply to branch `branch` of `tx`.
pub fn reply(tx: &Transaction, branch: usize, status: u16) -> SipResponse {
    SipResponse {
        status,
        reason: rvoip_proxy_tm::message::reason_phrase(status).to_string(),
        cseq_method: tx.request().method.clone(),
        top_via_branch: Some(tx.branch_id(branch)),
        retry_after: None,
        source: tx.slot(branch).expect("published branch").outbound().expect("built").destination.clone(),
        raw: Bytes::new(),
    }
}

/// A downstream reply to the CANCEL sent on `branch`.
pub fn cancel_reply(tx: &Transaction, branch: usize, status: u16) -> SipResponse {
    SipResponse { cseq_method: Method::Cancel, ..reply(tx, branch, status) }
}

pub fn udp(s: &str) -> Destination {
    Destination::udp(addr(s))
}

pub fn tcp(s: &str) -> Destination {
    Destination::tcp(addr(s))
}

/// A manager on a manual clock plus handles to its mocks.
pub struct Harness {
    pub manager: TransactionManager,
    pub transport: Arc<MockTransport>,
    pub resolver: Arc<StaticResolver>,
    pub blacklist: Arc<RecordingBlacklist>,
    pub hooks: Arc<ScriptedHooks>,
}

impl Harness {
    pub fn new(config: TmConfig) -> Self {
        Self::starting_at(config, 0)
    }

    /// Harness whose clock starts at tick `start`.
    pub fn starting_at(config: TmConfig, start: u32) -> Self {
        let clock = TickClock::manual(config.timers.tick, start);
        Self::with_clock(config, clock)
    }

    pub fn with_clock(config: TmConfig, clock: TickClock) -> Self {
        let transport = Arc::new(MockTransport::default());
        let resolver = Arc::new(StaticResolver::default());
        let blacklist = Arc::new(RecordingBlacklist::default());
        let hooks = Arc::new(ScriptedHooks::default());
        let collaborators = Collaborators::new(transport.clone(), resolver.clone(), Arc::new(TextBuilder))
            .with_blacklist(blacklist.clone())
            .with_hooks(hooks.clone());
        let manager = TransactionManager::with_clock(config, collaborators, clock).expect("valid config");
        Self { manager, transport, resolver, blacklist, hooks }
    }

    /// Moves the clock forward one tick at a time, firing timers on the way.
    pub async fn advance(&self, d: Duration) {
        let tick = self.manager.clock().tick();
        let steps = d.as_nanos().div_ceil(tick.as_nanos());
        for _ in 0..steps {
            self.manager.clock().advance(tick);
            self.manager.run_timers().await;
        }
    }

    /// Creates an INVITE transaction and forks it: the request URI goes to
    /// `targets[0]`, every further address gets a branch of its own.
    pub async fn fork_invite(&self, call_id: &str, options: TransactionOptions, targets: &[&str]) -> TransactionHandle {
        let tx = self.manager.new_transaction(invite(call_id), options).await.expect("transaction");
        self.resolver.insert(BOB, vec![udp(targets[0])]);
        let extra = targets[1..].iter().map(|t| target(t)).collect();
        self.manager.forward(&tx, None, extra).await.expect("forwarded");
        tx
    }

    /// Delivers a downstream reply on `branch`.
    pub async fn answer(&self, tx: &Transaction, branch: usize, status: u16) -> ReplyOutcome {
        self.manager.reply_received(reply(tx, branch, status)).await
    }
}

pub const BOB: &str = "sip:bob@example.com";

/// A branch target with a fixed UDP destination.
pub fn target(addr: &str) -> BranchTarget {
    BranchTarget::uri(format!("sip:bob@{}", addr)).with_destination(udp(addr))
}

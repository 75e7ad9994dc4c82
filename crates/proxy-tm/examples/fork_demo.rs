//! Forks an INVITE to two in-memory user agents and prints what goes upstream.
//!
//! The first UA rings and then reports busy, the second one answers. Run with
//! `RUST_LOG=rvoip_proxy_tm=debug` to follow the engine.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, Level};

use rvoip_proxy_tm::logging::{setup_logging, LoggingConfig};
use rvoip_proxy_tm::message::reason_phrase;
use rvoip_proxy_tm::prelude::*;

const UPSTREAM: &str = "192.0.2.1:5060";
const LOCAL: &str = "192.0.2.254:5060";
const ALICE: &str = "198.51.100.10:5060";
const CAROL: &str = "198.51.100.11:5060";

/// Delivers every message to a channel, tagged with its destination.
#[derive(Debug)]
struct ChannelTransport {
    tx: mpsc::UnboundedSender<(SocketAddr, String)>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, destination: &Destination, data: Bytes) -> std::result::Result<(), TransportError> {
        let line = String::from_utf8_lossy(&data).into_owned();
        self.tx.send((destination.addr, line)).map_err(|_| TransportError::Closed)
    }

    fn local_socket_for(&self, destination: &Destination) -> Option<LocalSocket> {
        Some(LocalSocket { addr: LOCAL.parse().ok()?, protocol: destination.protocol })
    }
}

#[derive(Debug)]
struct NoDns;

#[async_trait]
impl Resolver for NoDns {
    async fn resolve(
        &self,
        name: &str,
        _: Option<Protocol>,
        _: ResolveFlags,
    ) -> std::result::Result<ResolverCursor, ResolveError> {
        Err(ResolveError::NotFound(name.to_string()))
    }
}

/// One-line text rendering, `<METHOD> <uri> <branch-id>` for requests.
#[derive(Debug)]
struct LineBuilder;

impl MessageBuilder for LineBuilder {
    fn build_branch_request(
        &self,
        request: &SipRequest,
        ctx: &BranchContext<'_>,
    ) -> std::result::Result<Bytes, BuildError> {
        Ok(Bytes::from(format!("{} {} {}", request.method, ctx.uri, ctx.branch_id)))
    }

    fn build_cancel(
        &self,
        _request: &SipRequest,
        ctx: &BranchContext<'_>,
        _reason: Option<&CancelReason>,
    ) -> std::result::Result<Bytes, BuildError> {
        Ok(Bytes::from(format!("CANCEL {} {}", ctx.uri, ctx.branch_id)))
    }

    fn build_ack(
        &self,
        _request: &SipRequest,
        ctx: &BranchContext<'_>,
        _reply: &SipResponse,
    ) -> std::result::Result<Bytes, BuildError> {
        Ok(Bytes::from(format!("ACK {} {}", ctx.uri, ctx.branch_id)))
    }

    fn build_relayed_reply(
        &self,
        reply: &SipResponse,
        status: Option<(u16, &str)>,
    ) -> std::result::Result<Bytes, BuildError> {
        let (code, reason) = status.unwrap_or((reply.status, reply.reason.as_str()));
        Ok(Bytes::from(format!("SIP/2.0 {} {}", code, reason)))
    }

    fn build_local_reply(
        &self,
        _request: &SipRequest,
        code: u16,
        reason: &str,
    ) -> std::result::Result<Bytes, BuildError> {
        Ok(Bytes::from(format!("SIP/2.0 {} {} (local)", code, reason)))
    }
}

fn response(status: u16, branch_id: &str, from: SocketAddr) -> SipResponse {
    SipResponse {
        status,
        reason: reason_phrase(status).to_string(),
        cseq_method: Method::Invite,
        top_via_branch: Some(branch_id.to_string()),
        retry_after: None,
        source: Destination::udp(from),
        raw: Bytes::new(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging(&LoggingConfig::new(Level::INFO, "fork-demo"))?;

    let (wire_tx, mut wire_rx) = mpsc::unbounded_channel();
    let collaborators = Collaborators::new(
        Arc::new(ChannelTransport { tx: wire_tx }),
        Arc::new(NoDns),
        Arc::new(LineBuilder),
    );
    let manager = TransactionManager::new(TmConfig::default(), collaborators)?;
    manager.start_timer_task();

    let upstream: SocketAddr = UPSTREAM.parse().map_err(|e| Error::Config(format!("{}", e)))?;
    let request = SipRequest {
        method: Method::Invite,
        request_uri: "sip:bob@example.com".to_string(),
        next_hop: None,
        call_id: "fork-demo@192.0.2.1".to_string(),
        cseq: 1,
        from_tag: Some("1928301774".to_string()),
        top_via: Via { branch: Some("z9hG4bK776asdhds".to_string()), sent_by: UPSTREAM.to_string() },
        reason: None,
        source: Destination::udp(upstream),
        raw: Bytes::new(),
    };

    let alice: SocketAddr = ALICE.parse().map_err(|e| Error::Config(format!("{}", e)))?;
    let carol: SocketAddr = CAROL.parse().map_err(|e| Error::Config(format!("{}", e)))?;
    let targets = vec![
        BranchTarget::uri("sip:bob@alice.example.com").with_destination(Destination::udp(alice)),
        BranchTarget::uri("sip:bob@carol.example.com").with_destination(Destination::udp(carol)),
    ];
    // the request URI itself has no route in this demo, so only the targets fork
    let tx = manager.new_transaction(request, TransactionOptions::default()).await?;
    let _ = manager.forward(&tx, None, targets).await?;

    // play the two downstream user agents
    let ua = manager.clone();
    tokio::spawn(async move {
        while let Some((to, line)) = wire_rx.recv().await {
            info!(%to, "wire: {}", line);
            let mut words = line.split_whitespace();
            if words.next() != Some("INVITE") {
                continue;
            }
            let Some(branch_id) = words.nth(1) else { continue };
            if to == alice {
                ua.reply_received(response(180, branch_id, alice)).await;
                tokio::time::sleep(Duration::from_millis(200)).await;
                ua.reply_received(response(486, branch_id, alice)).await;
            } else if to == carol {
                tokio::time::sleep(Duration::from_millis(100)).await;
                ua.reply_received(response(200, branch_id, carol)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    info!(status = tx.uas_status(), branches = ?tx.branch_statuses(), "Done");
    info!(stats = ?manager.stats(), "Statistics");
    manager.stop_timer_task();
    Ok(())
}

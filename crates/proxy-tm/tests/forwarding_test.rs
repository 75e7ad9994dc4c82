//! Forwarding, destination failover and request matching.

mod common;

use common::*;
use rvoip_proxy_tm::prelude::*;
use rvoip_proxy_tm::transaction::branch::flags as branch_flags;

/// The request URI resolves to three candidates; the first two refuse the
/// send, so the request ends up on the third.
#[tokio::test]
async fn test_send_failure_fails_over_to_next_candidate() {
    let h = Harness::new(TmConfig::default());
    h.resolver.insert(BOB, vec![udp("10.0.0.1:5060"), udp("10.0.0.2:5060"), udp("10.0.0.3:5060")]);
    h.transport.fail_to(addr("10.0.0.1:5060"));
    h.transport.fail_to(addr("10.0.0.2:5060"));

    let outcome = h.manager.relay(invite("failover"), TransactionOptions::default(), None, Vec::new()).await.unwrap();
    let RelayOutcome::Forwarded(tx) = outcome else {
        panic!("expected a forwarded transaction, got {:?}", outcome);
    };

    assert_eq!(tx.branch_count(), 3);
    assert_eq!(h.transport.sent_to(addr("10.0.0.3:5060")).len(), 1);
    assert!(tx.slot(0).unwrap().has_flag(branch_flags::SEND_FAILED));
    assert_eq!(h.blacklist.reasons_for(addr("10.0.0.1:5060")), vec![BlacklistReason::SendFailed]);
    assert_eq!(h.manager.stats().failovers, 2);

    // the branches that never went out do not block the 200
    h.answer(&tx, 2, 200).await;
    assert_eq!(h.transport.upstream_finals(), vec![200]);
}

/// A blacklisted candidate is skipped without being sent to.
#[tokio::test]
async fn test_blacklisted_destination_is_skipped() {
    let h = Harness::new(TmConfig::default());
    h.resolver.insert(BOB, vec![udp("10.0.0.1:5060"), udp("10.0.0.2:5060")]);
    h.blacklist.block(addr("10.0.0.1:5060"));

    h.manager.relay(invite("blacklisted"), TransactionOptions::default(), None, Vec::new()).await.unwrap();

    assert!(h.transport.sent_to(addr("10.0.0.1:5060")).is_empty());
    assert_eq!(h.transport.sent_to(addr("10.0.0.2:5060")).len(), 1);
}

/// With every destination failing the transaction is answered locally and
/// the error is returned to the caller.
#[tokio::test]
async fn test_all_sends_failing_replies_locally() {
    let h = Harness::new(TmConfig::default());
    h.resolver.insert(BOB, vec![udp("10.0.0.1:5060")]);
    h.transport.fail_to(addr("10.0.0.1:5060"));

    let result = h.manager.relay(invite("unreachable"), TransactionOptions::default(), None, Vec::new()).await;
    assert!(matches!(result, Err(Error::SendFailure(_))), "got {:?}", result);

    let finals = h.transport.upstream_finals();
    assert_eq!(finals, vec![503]);
}

/// An unresolvable request URI is answered 478.
#[tokio::test]
async fn test_unresolvable_target_replies_478() {
    let h = Harness::new(TmConfig::default());

    let result = h.manager.relay(invite("nowhere"), TransactionOptions::default(), None, Vec::new()).await;
    assert!(result.is_err());
    assert_eq!(h.transport.upstream_finals(), vec![478]);
}

/// Parallel forking creates one branch per target, each with its own Via branch.
#[tokio::test]
async fn test_parallel_fork_sends_every_branch() {
    let h = Harness::new(TmConfig::default());
    let tx = h
        .fork_invite("fork", TransactionOptions::default(), &["10.0.0.1:5060", "10.0.0.2:5060", "10.0.0.3:5060"])
        .await;

    assert_eq!(tx.branch_count(), 3);
    for (i, a) in ["10.0.0.1:5060", "10.0.0.2:5060", "10.0.0.3:5060"].iter().enumerate() {
        let sent = h.transport.sent_to(addr(a));
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains(&tx.branch_id(i)));
    }
    // 100 Trying went upstream right away
    assert_eq!(h.transport.upstream_statuses(), vec![100]);
}

/// The outbound proxy override applies to targets without a destination.
#[tokio::test]
async fn test_proxy_override() {
    let h = Harness::new(TmConfig::default());
    let proxy = udp("10.9.9.9:5060");
    h.manager
        .relay(invite("proxied"), TransactionOptions::default(), Some(proxy), vec![target("10.0.0.2:5060")])
        .await
        .unwrap();

    let to_proxy = h.transport.sent_to(addr("10.9.9.9:5060"));
    assert_eq!(to_proxy.len(), 1);
    assert!(to_proxy[0].starts_with("INVITE sip:bob@example.com"));
    assert_eq!(h.transport.sent_to(addr("10.0.0.2:5060")).len(), 1);
}

/// A retransmitted request is absorbed and gets the last reply again.
#[tokio::test]
async fn test_request_retransmission_resends_last_reply() {
    let h = Harness::new(TmConfig::default());
    h.resolver.insert(BOB, vec![udp("10.0.0.1:5060")]);
    let request = invite("retrans");

    h.manager.relay(request.clone(), TransactionOptions::default(), None, Vec::new()).await.unwrap();
    let outcome = h.manager.relay(request, TransactionOptions::default(), None, Vec::new()).await.unwrap();

    assert!(matches!(outcome, RelayOutcome::Retransmission(_)));
    assert_eq!(h.transport.sent_to(addr("10.0.0.1:5060")).len(), 1);
    assert_eq!(h.transport.upstream_statuses(), vec![100, 100]);
    assert_eq!(h.manager.transaction_count(), 1);
}

/// The branch route can add headers to every branch.
#[tokio::test]
async fn test_branch_route_adds_headers() {
    let h = Harness::new(TmConfig::default());
    *h.hooks.extra_header.lock() = Some(("X-Branch".to_string(), "yes".to_string()));
    h.fork_invite("hdr", TransactionOptions::default().with_branch_route(3), &["10.0.0.1:5060"]).await;

    let sent = h.transport.sent_to(addr("10.0.0.1:5060"));
    assert!(sent[0].ends_with("X-Branch=yes"));
}

/// The branch limit of the configuration is enforced.
#[tokio::test]
async fn test_too_many_branches() {
    let h = Harness::new(TmConfig::default().with_max_branches(2));
    let tx = h.manager.new_transaction(invite("limit"), TransactionOptions::default()).await.unwrap();
    h.resolver.insert(BOB, vec![udp("10.0.0.1:5060")]);

    h.manager.forward(&tx, None, vec![target("10.0.0.2:5060"), target("10.0.0.3:5060")]).await.unwrap();
    assert_eq!(tx.branch_count(), 2);

    let err = h.manager.add_branch(&tx, target("10.0.0.4:5060")).await.unwrap_err();
    assert!(matches!(err, Error::TooManyBranches { max: 2 }));
}

/// A non-INVITE request is forwarded without a 100 Trying.
#[tokio::test]
async fn test_non_invite_has_no_trying() {
    let h = Harness::new(TmConfig::default());
    h.resolver.insert(BOB, vec![udp("10.0.0.1:5060")]);
    let outcome = h
        .manager
        .relay(request(Method::Options, "options"), TransactionOptions::default(), None, Vec::new())
        .await
        .unwrap();
    let RelayOutcome::Forwarded(tx) = outcome else { panic!("not forwarded") };

    assert!(h.transport.upstream_statuses().is_empty());
    h.answer(&tx, 0, 200).await;
    assert_eq!(h.transport.upstream_statuses(), vec![200]);
}

/// ACK never creates a transaction.
#[tokio::test]
async fn test_ack_without_transaction_is_not_matched() {
    let h = Harness::new(TmConfig::default());
    let outcome = h.manager.relay(ack_for(&invite("stray")), TransactionOptions::default(), None, Vec::new()).await;
    assert!(matches!(outcome, Ok(RelayOutcome::AckNotMatched)));
    assert_eq!(h.manager.transaction_count(), 0);
}

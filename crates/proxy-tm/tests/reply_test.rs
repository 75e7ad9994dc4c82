//! Reply selection and relaying.

mod common;

use common::*;
use rvoip_proxy_tm::prelude::*;

const A: &str = "10.0.0.1:5060";
const B: &str = "10.0.0.2:5060";
const C: &str = "10.0.0.3:5060";

/// A negative reply waits for the other branches; the 2xx that follows wins.
#[tokio::test]
async fn test_2xx_beats_stored_negative() {
    let h = Harness::new(TmConfig::default());
    let tx = h.fork_invite("best", TransactionOptions::default(), &[A, B]).await;

    h.answer(&tx, 0, 404).await;
    assert!(h.transport.upstream_finals().is_empty());
    assert!(!tx.is_completed());

    h.answer(&tx, 1, 200).await;
    assert_eq!(h.transport.upstream_finals(), vec![200]);
    assert_eq!(tx.uas_status(), 200);
}

/// When every branch fails the best negative reply is relayed, once.
#[tokio::test]
async fn test_best_negative_is_relayed_once() {
    let h = Harness::new(TmConfig::default());
    let tx = h.fork_invite("negatives", TransactionOptions::default(), &[A, B, C]).await;

    h.answer(&tx, 0, 486).await;
    h.answer(&tx, 1, 302).await;
    h.answer(&tx, 2, 500).await;

    assert_eq!(h.transport.upstream_finals(), vec![302]);
    // every negative INVITE reply is acknowledged hop by hop
    assert_eq!(h.transport.count("ACK"), 3);

    // a retransmitted final changes nothing
    h.answer(&tx, 1, 302).await;
    assert_eq!(h.transport.upstream_finals(), vec![302]);
}

/// Provisional replies are relayed as they come, except 100.
#[tokio::test]
async fn test_provisionals_are_relayed() {
    let h = Harness::new(TmConfig::default());
    let tx = h.fork_invite("ringing", TransactionOptions::default(), &[A, B]).await;

    h.answer(&tx, 0, 100).await;
    h.answer(&tx, 0, 180).await;
    h.answer(&tx, 1, 183).await;

    assert_eq!(h.transport.upstream_statuses(), vec![100, 180, 183]);
    assert_eq!(tx.branch_statuses(), vec![180, 183]);
}

/// A 2xx completes the transaction and cancels the branches still ringing.
#[tokio::test]
async fn test_2xx_cancels_other_branches() {
    let h = Harness::new(TmConfig::default());
    let tx = h.fork_invite("answered", TransactionOptions::default(), &[A, B]).await;

    h.answer(&tx, 1, 180).await;
    h.answer(&tx, 0, 200).await;

    let cancels = h.transport.sent_to(addr(B)).into_iter().filter(|m| m.starts_with("CANCEL")).collect::<Vec<_>>();
    assert_eq!(cancels.len(), 1);
    assert!(cancels[0].contains("cause=200"));

    // the 487 of the canceled branch is absorbed
    h.answer(&tx, 1, 487).await;
    assert_eq!(h.transport.upstream_finals(), vec![200]);
}

/// A 2xx arriving after a negative reply went upstream is still relayed.
#[tokio::test]
async fn test_late_2xx_is_pushed_upstream() {
    let h = Harness::new(TmConfig::default());
    let mut events = h.manager.subscribe();
    let tx = h.fork_invite("late", TransactionOptions::default(), &[A, B]).await;

    h.answer(&tx, 0, 404).await;
    h.answer(&tx, 1, 486).await;
    assert_eq!(h.transport.upstream_finals(), vec![404]);

    h.answer(&tx, 1, 200).await;
    assert_eq!(h.transport.upstream_finals(), vec![404, 200]);

    // only the first 2xx is pushed
    h.answer(&tx, 0, 200).await;
    assert_eq!(h.transport.upstream_finals(), vec![404, 200]);

    let mut late = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let TransactionEvent::FinalReplied { status, late: is_late, .. } = event {
            late.push((status, is_late));
        }
    }
    assert_eq!(late, vec![(404, false), (200, true)]);
}

/// A 6xx ends the search: other branches are canceled and the 6xx wins
/// over their replies.
#[tokio::test]
async fn test_6xx_cancels_and_wins() {
    let h = Harness::new(TmConfig::default());
    let tx = h.fork_invite("decline", TransactionOptions::default(), &[A, B, C]).await;

    h.answer(&tx, 1, 180).await;
    h.answer(&tx, 0, 603).await;
    assert!(h.transport.upstream_finals().is_empty());
    assert_eq!(h.transport.sent_to(addr(B)).iter().filter(|m| m.starts_with("CANCEL")).count(), 1);
    // the silent branch was given up on locally
    assert!(h.transport.sent_to(addr(C)).iter().all(|m| !m.starts_with("CANCEL")));

    h.answer(&tx, 1, 487).await;
    assert_eq!(h.transport.upstream_finals(), vec![603]);
}

/// A winning 503 goes upstream as 500 unless the remap is disabled.
#[tokio::test]
async fn test_503_is_remapped() {
    let h = Harness::new(TmConfig::default());
    let tx = h.fork_invite("remap", TransactionOptions::default(), &[A]).await;
    h.answer(&tx, 0, 503).await;
    assert_eq!(h.transport.upstream_finals(), vec![500]);

    let config = TmConfig { remap_503_500: false, ..Default::default() };
    let h = Harness::new(config);
    let tx = h.fork_invite("no-remap", TransactionOptions::default(), &[A]).await;
    h.answer(&tx, 0, 503).await;
    assert_eq!(h.transport.upstream_finals(), vec![503]);
}

/// A 503 moves the request to the next resolver candidate.
#[tokio::test]
async fn test_503_fails_over() {
    let h = Harness::new(TmConfig::default());
    let tx = h.manager.new_transaction(invite("busy-node"), TransactionOptions::default()).await.unwrap();
    h.resolver.insert(BOB, vec![udp(A), udp(B)]);
    h.manager.forward(&tx, None, Vec::new()).await.unwrap();

    h.answer(&tx, 0, 503).await;
    assert_eq!(tx.branch_count(), 2);
    assert_eq!(h.transport.sent_to(addr(B)).len(), 1);
    assert!(h.transport.upstream_finals().is_empty());

    h.answer(&tx, 1, 200).await;
    assert_eq!(h.transport.upstream_finals(), vec![200]);
}

/// A 503 with Retry-After blacklists its source for that long.
#[tokio::test]
async fn test_503_blacklists_source() {
    let h = Harness::new(TmConfig::default().with_blacklist_503(true));
    let tx = h.fork_invite("retry-after", TransactionOptions::default(), &[A]).await;

    let mut reply = reply(&tx, 0, 503);
    reply.retry_after = Some(30);
    h.manager.reply_received(reply).await;

    let added = h.blacklist.added.lock().clone();
    assert_eq!(added, vec![(addr(A), BlacklistReason::Unavailable, std::time::Duration::from_secs(30))]);
}

/// The reply route can drop provisional replies but not final ones.
#[tokio::test]
async fn test_reply_route_drops_provisionals() {
    let h = Harness::new(TmConfig::default());
    *h.hooks.drop_provisionals.lock() = true;
    let tx = h.fork_invite("filtered", TransactionOptions::default().with_reply_route(2), &[A]).await;

    h.answer(&tx, 0, 180).await;
    assert_eq!(h.transport.upstream_statuses(), vec![100]);

    h.answer(&tx, 0, 200).await;
    assert_eq!(h.transport.upstream_finals(), vec![200]);
}

/// Replies that match no branch are handed back to the caller.
#[tokio::test]
async fn test_unmatched_reply() {
    let h = Harness::new(TmConfig::default());
    let tx = h.fork_invite("unmatched", TransactionOptions::default(), &[A]).await;

    let mut stray = reply(&tx, 0, 200);
    stray.top_via_branch = Some("z9hG4bKdeadbeef".to_string());
    assert_eq!(h.manager.reply_received(stray).await, ReplyOutcome::Unmatched);

    let mut no_via = reply(&tx, 0, 200);
    no_via.top_via_branch = None;
    assert_eq!(h.manager.reply_received(no_via).await, ReplyOutcome::Unmatched);
    assert!(!tx.is_completed());
}

/// A local final reply is sent once; a second one is refused.
#[tokio::test]
async fn test_local_reply_completes_once() {
    let h = Harness::new(TmConfig::default());
    let tx = h.fork_invite("local", TransactionOptions::default(), &[A]).await;

    h.manager.reply(&tx, 486, "Busy Here").await.unwrap();
    let err = h.manager.reply(&tx, 480, "Temporarily Unavailable").await.unwrap_err();
    assert!(matches!(err, Error::AlreadyCompleted));
    assert_eq!(h.transport.upstream_finals(), vec![486]);
    assert!(h.manager.reply(&tx, 99, "Bogus").await.is_err());
}

/// Events follow the life of a transaction.
#[tokio::test]
async fn test_events() {
    let h = Harness::new(TmConfig::default());
    let mut events = h.manager.subscribe();
    let tx = h.fork_invite("events", TransactionOptions::default(), &[A]).await;
    h.answer(&tx, 0, 180).await;
    h.answer(&tx, 0, 200).await;

    let id = tx.key().clone();
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            TransactionEvent::Created { transaction_id: id.clone() },
            TransactionEvent::ProvisionalRelayed { transaction_id: id.clone(), branch: 0, status: 180 },
            TransactionEvent::FinalReplied {
                transaction_id: id,
                branch: Some(0),
                status: 200,
                local: false,
                late: false,
            },
        ]
    );
    let stats = h.manager.stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.relayed[1], 1);
}

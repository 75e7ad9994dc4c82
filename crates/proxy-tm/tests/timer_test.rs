//! Retransmission, final response and wait timers.

mod common;

use std::time::Duration;

use common::*;
use rvoip_proxy_tm::prelude::*;

const A: &str = "10.0.0.1:5060";

fn invites_to(h: &Harness, a: &str) -> usize {
    h.transport.sent_to(addr(a)).iter().filter(|m| m.starts_with("INVITE")).count()
}

/// An unanswered INVITE over UDP is retransmitted with doubling intervals
/// capped at T2 until the final deadline, which ends it with a 408.
#[tokio::test]
async fn test_unanswered_invite_times_out_with_408() {
    let h = Harness::new(TmConfig::default());
    let tx = h.fork_invite("timeout", TransactionOptions::default(), &[A]).await;

    // T1 = 500ms: retransmissions at 0.5, 1.5, 3.5, 7.5 then every 4s
    h.advance(Duration::from_millis(3600)).await;
    assert_eq!(invites_to(&h, A), 4);
    h.advance(Duration::from_millis(4000)).await;
    assert_eq!(invites_to(&h, A), 5);

    h.advance(Duration::from_millis(30_000 - 7600)).await;
    // ... 11.5, 15.5, 19.5, 23.5, 27.5; the next one would pass the deadline
    assert_eq!(invites_to(&h, A), 10);
    assert_eq!(h.transport.upstream_finals(), vec![408]);
    assert_eq!(tx.branch_statuses(), vec![408]);
    assert_eq!(h.blacklist.reasons_for(addr(A)), vec![BlacklistReason::Timeout]);
    assert_eq!(h.manager.stats().branch_timeouts, 1);
}

/// A negative final reply is retransmitted upstream until the ACK arrives,
/// then the transaction waits and is removed.
#[tokio::test]
async fn test_negative_reply_retransmitted_until_ack() {
    let h = Harness::new(TmConfig::default());
    let request = invite("busy");
    let tx = h.manager.new_transaction(request.clone(), TransactionOptions::default()).await.unwrap();
    h.resolver.insert(BOB, vec![udp(A)]);
    h.manager.forward(&tx, None, Vec::new()).await.unwrap();

    h.answer(&tx, 0, 486).await;
    h.advance(Duration::from_millis(1600)).await;
    assert_eq!(h.transport.upstream_finals(), vec![486, 486, 486]);

    let outcome = h.manager.relay(ack_for(&request), TransactionOptions::default(), None, Vec::new()).await;
    assert!(matches!(outcome, Ok(RelayOutcome::AckAbsorbed)));

    h.advance(Duration::from_secs(6)).await;
    assert_eq!(h.transport.upstream_finals().len(), 3);
    assert_eq!(h.manager.transaction_count(), 0);
}

/// The ACK for a relayed 2xx is end-to-end and not absorbed.
#[tokio::test]
async fn test_ack_for_relayed_2xx_is_not_absorbed() {
    let h = Harness::new(TmConfig::default());
    let request = invite("ok");
    let tx = h.manager.new_transaction(request.clone(), TransactionOptions::default()).await.unwrap();
    h.resolver.insert(BOB, vec![udp(A)]);
    h.manager.forward(&tx, None, Vec::new()).await.unwrap();
    h.answer(&tx, 0, 200).await;

    assert!(!h.manager.ack_received(&ack_for(&request)));
}

/// Without a noisy timer, an INVITE with one silent branch and no failure
/// route times out without replying upstream.
#[tokio::test]
async fn test_silent_timeout() {
    let h = Harness::new(TmConfig::default().with_noisy_ctimer(false));
    let tx = h.fork_invite("silent", TransactionOptions::default(), &[A]).await;

    h.advance(Duration::from_secs(30)).await;
    assert!(h.transport.upstream_finals().is_empty());
    assert_eq!(tx.branch_statuses(), vec![408]);

    h.advance(Duration::from_secs(5)).await;
    assert_eq!(h.manager.transaction_count(), 0);
}

/// The per-transaction noisy option overrides a quiet configuration.
#[tokio::test]
async fn test_noisy_option_replies_408() {
    let h = Harness::new(TmConfig::default().with_noisy_ctimer(false));
    h.fork_invite("noisy", TransactionOptions::default().noisy(), &[A]).await;

    h.advance(Duration::from_secs(30)).await;
    assert_eq!(h.transport.upstream_finals(), vec![408]);
}

/// After a provisional reply the INVITE branch waits for fr_inv_timeout and
/// is canceled when it expires.
#[tokio::test]
async fn test_ringing_branch_uses_fr_inv_timeout() {
    let h = Harness::new(TmConfig::default());
    let tx = h.fork_invite("ringing", TransactionOptions::default(), &[A]).await;
    h.answer(&tx, 0, 180).await;

    h.advance(Duration::from_secs(60)).await;
    assert!(h.transport.upstream_finals().is_empty());
    // no retransmission once a provisional arrived
    assert_eq!(invites_to(&h, A), 1);

    h.advance(Duration::from_secs(60)).await;
    assert_eq!(h.transport.upstream_finals(), vec![408]);
    assert_eq!(h.transport.sent_to(addr(A)).iter().filter(|m| m.starts_with("CANCEL")).count(), 1);
}

/// A provisional reply to a non-INVITE slows retransmission down to T2.
#[tokio::test]
async fn test_non_invite_provisional_retransmits_at_t2() {
    let h = Harness::new(TmConfig::default());
    let tx = h.manager.new_transaction(request(Method::Options, "slow"), TransactionOptions::default()).await.unwrap();
    h.resolver.insert(BOB, vec![udp(A)]);
    h.manager.forward(&tx, None, Vec::new()).await.unwrap();
    h.answer(&tx, 0, 100).await;

    let options_to_a = || h.transport.sent_to(addr(A)).iter().filter(|m| m.starts_with("OPTIONS")).count();
    h.advance(Duration::from_millis(3900)).await;
    assert_eq!(options_to_a(), 1);
    h.advance(Duration::from_millis(200)).await;
    assert_eq!(options_to_a(), 2);
}

/// Reliable transports retransmit nothing themselves.
#[tokio::test]
async fn test_no_retransmission_over_tcp() {
    let h = Harness::new(TmConfig::default());
    let tx = h.manager.new_transaction(invite("tcp"), TransactionOptions::default()).await.unwrap();
    h.resolver.insert(BOB, vec![tcp(A)]);
    h.manager.forward(&tx, None, Vec::new()).await.unwrap();

    h.advance(Duration::from_secs(10)).await;
    assert_eq!(invites_to(&h, A), 1);
}

/// A completed transaction is unlinked after the wait period and released
/// once the last handle is gone.
#[tokio::test]
async fn test_wait_then_delete() {
    let h = Harness::new(TmConfig::default());
    let mut events = h.manager.subscribe();
    let tx = h.fork_invite("done", TransactionOptions::default(), &[A]).await;
    h.answer(&tx, 0, 200).await;
    let id = tx.key().clone();
    drop(tx);

    h.advance(Duration::from_secs(4)).await;
    assert_eq!(h.manager.transaction_count(), 1);
    h.advance(Duration::from_secs(2)).await;
    assert_eq!(h.manager.transaction_count(), 0);
    assert!(h.manager.find_transaction(&id).is_none());

    h.advance(Duration::from_secs(1)).await;
    assert_eq!(h.manager.stats().freed, 1);

    let mut terminated = false;
    while let Ok(event) = events.try_recv() {
        terminated |= event == TransactionEvent::Terminated { transaction_id: id.clone() };
    }
    assert!(terminated);
}

/// A blind branch sends nothing and ends in a local 408.
#[tokio::test]
async fn test_blind_branch_times_out() {
    let h = Harness::new(TmConfig::default());
    let tx = h.manager.new_transaction(invite("blind"), TransactionOptions::default()).await.unwrap();
    h.manager.add_blind_branch(&tx).unwrap();

    h.advance(Duration::from_secs(30)).await;
    assert!(h.transport.sent().iter().all(|(_, m)| !m.starts_with("INVITE")));
    assert_eq!(h.transport.upstream_finals(), vec![408]);
}

/// Deadlines survive the tick counter wrapping around.
#[tokio::test]
async fn test_timeout_across_tick_wraparound() {
    let h = Harness::starting_at(TmConfig::default(), u32::MAX - 100);
    h.fork_invite("wrap", TransactionOptions::default(), &[A]).await;

    h.advance(Duration::from_secs(29)).await;
    assert!(h.transport.upstream_finals().is_empty());
    h.advance(Duration::from_secs(1)).await;
    assert_eq!(h.transport.upstream_finals(), vec![408]);
}

/// The background task drives the timers on tokio time.
#[tokio::test(start_paused = true)]
async fn test_timer_task_drives_timeouts() {
    let config = TmConfig::default();
    let clock = TickClock::monotonic(config.timers.tick);
    let h = Harness::with_clock(config, clock);
    h.manager.start_timer_task();
    h.fork_invite("task", TransactionOptions::default(), &[A]).await;

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(h.transport.upstream_finals().first(), Some(&408));
    h.manager.stop_timer_task();
}

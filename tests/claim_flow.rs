use std::sync::Arc;
use std::time::Duration;

use claim_tracker::{
    Address, Amount, ClaimTracker, EntryState, InMemoryLedger, QueryKind, QueryResult,
    TrackedAccount, TrackerConfig, TrackerError, TxPhase,
};

fn addr(byte: u8) -> Address {
    Address::from([byte; 20])
}

fn tokens(n: u64) -> Amount {
    Amount::from(n) * Amount::from(10u64).pow(Amount::from(18u64))
}

/// A holds 100 claimable, B holds nothing, C is the accumulator
fn setup() -> (Arc<InMemoryLedger>, ClaimTracker) {
    let ledger = InMemoryLedger::new().into_shared();
    ledger.set_claimable(addr(0xa), tokens(100));
    ledger.set_claimable(addr(0xb), Amount::ZERO);
    ledger.connect(Some(addr(0xa)));

    let tracker = ClaimTracker::new(ledger.clone(), &TrackerConfig::default(), None);
    tracker.track(vec![
        TrackedAccount::new(addr(0xa), Some("A".to_string())),
        TrackedAccount::new(addr(0xb), None),
        TrackedAccount::new(addr(0xc), Some("Accumulator".to_string())),
    ]);
    (ledger, tracker)
}

async fn wait_until(
    tracker: &ClaimTracker,
    kind: QueryKind,
    check: impl Fn(&[QueryResult]) -> bool,
) -> Vec<QueryResult> {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let results = tracker.query_results(kind);
            if check(&results) {
                return results;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

fn ready(results: &[QueryResult], index: usize, value: Amount) -> bool {
    results[index].state == EntryState::Ready && results[index].data == Some(value)
}

#[tokio::test]
async fn test_totals_sum_ready_claimable_amounts() {
    let (_ledger, tracker) = setup();
    tracker.refresh().await;

    let totals = tracker.totals(QueryKind::ClaimableAmount);
    assert_eq!(totals.total, tokens(100));
    assert_eq!(totals.ready, 3);
    assert!(totals.is_complete());
}

#[tokio::test]
async fn test_confirmed_claim_replaces_cached_values() {
    let (ledger, tracker) = setup();
    tracker.refresh().await;

    let status = tracker.submit_claim().unwrap().wait().await;
    assert_eq!(status.phase, TxPhase::Confirmed);

    let claimable = wait_until(&tracker, QueryKind::ClaimableAmount, |r| {
        ready(r, 0, Amount::ZERO)
    })
    .await;
    assert_eq!(claimable[0].data, Some(Amount::ZERO));

    wait_until(&tracker, QueryKind::TokenBalance, |r| ready(r, 0, tokens(100))).await;
    assert_eq!(tracker.totals(QueryKind::ClaimableAmount).total, Amount::ZERO);

    // Only the claimer was reconciled.
    assert_eq!(ledger.read_count(QueryKind::ClaimableAmount, &addr(0xb)), 1);
}

#[tokio::test]
async fn test_transfer_reconciles_sender_and_target_only() {
    let (ledger, tracker) = setup();
    tracker.refresh().await;

    tracker.submit_claim().unwrap().wait().await;
    wait_until(&tracker, QueryKind::TokenBalance, |r| ready(r, 0, tokens(100))).await;

    let b_reads = ledger.read_count(QueryKind::TokenBalance, &addr(0xb));
    let c_reads = ledger.read_count(QueryKind::TokenBalance, &addr(0xc));

    tracker.select_target(addr(0xc));
    let status = tracker.submit_transfer_to_target().unwrap().wait().await;
    assert_eq!(status.phase, TxPhase::Confirmed);

    let balances = wait_until(&tracker, QueryKind::TokenBalance, |r| {
        ready(r, 0, Amount::ZERO) && ready(r, 2, tokens(100))
    })
    .await;
    assert_eq!(balances[1].data, Some(Amount::ZERO));

    assert_eq!(ledger.read_count(QueryKind::TokenBalance, &addr(0xb)), b_reads);
    assert!(ledger.read_count(QueryKind::TokenBalance, &addr(0xc)) > c_reads);
}

#[tokio::test]
async fn test_concurrent_refreshes_share_one_read() {
    let ledger = InMemoryLedger::new().into_shared();
    ledger.set_read_latency(Duration::from_millis(20));
    let tracker = ClaimTracker::new(ledger.clone(), &TrackerConfig::default(), None);
    tracker.track(vec![TrackedAccount::new(addr(1), None)]);

    futures::future::join_all((0..10).map(|_| tracker.refresh())).await;

    assert_eq!(ledger.read_count(QueryKind::ClaimableAmount, &addr(1)), 1);
    assert_eq!(ledger.read_count(QueryKind::TokenBalance, &addr(1)), 1);
}

#[tokio::test]
async fn test_readding_within_ttl_skips_the_network() {
    let (ledger, tracker) = setup();
    tracker.refresh().await;

    assert!(tracker.remove_account(&addr(0xb)));
    assert!(tracker.add_account(TrackedAccount::new(addr(0xb), None)));
    tracker.refresh().await;

    let results = tracker.query_results(QueryKind::ClaimableAmount);
    assert_eq!(results.last().map(|r| r.address), Some(addr(0xb)));
    assert_eq!(ledger.read_count(QueryKind::ClaimableAmount, &addr(0xb)), 1);
}

#[tokio::test]
async fn test_claim_rejected_without_claimable_amount() {
    let ledger = InMemoryLedger::new().into_shared();
    ledger.connect(Some(addr(0xb)));
    let tracker = ClaimTracker::new(ledger, &TrackerConfig::default(), None);
    tracker.track(vec![TrackedAccount::new(addr(0xb), None)]);
    tracker.refresh().await;

    assert!(matches!(
        tracker.submit_claim(),
        Err(TrackerError::WriteRejected(_))
    ));
    assert_eq!(tracker.coordinator().phase(), TxPhase::Idle);
}

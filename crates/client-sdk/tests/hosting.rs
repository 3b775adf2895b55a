mod common;

use common::{MockLedger, MockTransfer};
use hostvault_sdk::config::HostingConfig;
use hostvault_sdk::{CancellationToken, HostLoop, Identity, StoreRegistry, TrackingStore, VaultError};
use std::sync::Arc;
use std::time::Duration;

const ME: &str = "0xhost";

struct Fixture {
    dir: tempfile::TempDir,
    ledger: Arc<MockLedger>,
    transfer: Arc<MockTransfer>,
    store: Arc<TrackingStore>,
    host: HostLoop,
}

fn fixture() -> Fixture {
    fixture_with(MockTransfer::default())
}

fn fixture_with(transfer: MockTransfer) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = StoreRegistry::new(dir.path().join("db"))
        .open(&Identity::new(ME))
        .expect("store");
    let ledger = Arc::new(MockLedger::new("0xsender", &[ME]));
    let transfer = Arc::new(transfer);
    let host = HostLoop::new(
        ledger.clone(),
        transfer.clone(),
        store.clone(),
        dir.path().join("hosted"),
        Duration::from_secs(5),
        HostingConfig {
            fetch_concurrency: 2,
            refresh_interval_secs: 1,
        },
    );
    Fixture {
        dir,
        ledger,
        transfer,
        store,
        host,
    }
}

#[tokio::test]
async fn second_pass_without_new_assignments_fetches_nothing() {
    let fx = fixture();
    for body in [&b"first block"[..], &b"second block"[..], &b"third block"[..]] {
        let address = fx.transfer.put(body);
        fx.ledger.assign_block(ME, &address, body.len() as u64, 5);
    }
    let cancel = CancellationToken::new();

    let first = fx.host.run_once(&cancel).await.expect("first pass");
    assert_eq!(first.discovered, 3);
    assert_eq!(first.fetched, 3);
    assert_eq!(fx.transfer.fetch_count(), 3);

    let second = fx.host.run_once(&cancel).await.expect("second pass");
    assert_eq!(second.discovered, 0);
    assert_eq!(second.already_known, 3);
    assert_eq!(second.fetched, 0);
    assert_eq!(fx.transfer.fetch_count(), 3);

    for record in fx.store.find_hosts(None).expect("hosts") {
        assert!(record.hosted);
        let path = record.path.expect("hosted path");
        assert!(std::path::Path::new(&path).starts_with(fx.dir.path().join("hosted")));
        assert!(record.hosted_at_ms.is_some());
    }
}

#[tokio::test]
async fn duplicate_assignment_notice_keeps_one_record() {
    let fx = fixture();
    let address = fx.transfer.put(b"block");
    fx.ledger.assign_block(ME, &address, 5, 1);
    fx.ledger.assign_block(ME, &address, 5, 1);

    let (discovered, known) = fx.host.refresh_info().await.expect("refresh");
    assert_eq!((discovered, known), (1, 1));
    assert_eq!(fx.store.find_hosts(None).expect("hosts").len(), 1);
}

#[tokio::test]
async fn pin_failure_still_marks_block_hosted() {
    let fx = fixture();
    let address = fx.transfer.put(b"unpinnable");
    fx.ledger.assign_block(ME, &address, 10, 1);
    fx.transfer.fail_pins(true);

    fx.host.run_once(&CancellationToken::new()).await.expect("pass");
    let record = fx.store.find_host(&address).expect("find").expect("tracked");
    assert!(record.hosted);
    assert!(!fx.transfer.is_pinned(&address));
}

#[tokio::test]
async fn failed_fetch_is_reported_and_retried_next_pass() {
    let fx = fixture();
    let good = fx.transfer.put(b"good");
    let bad = fx.transfer.put(b"bad");
    fx.ledger.assign_block(ME, &good, 4, 1);
    fx.ledger.assign_block(ME, &bad, 3, 1);
    fx.transfer.hide(&bad);

    let err = fx
        .host
        .run_once(&CancellationToken::new())
        .await
        .expect_err("one fetch fails");
    match err {
        VaultError::PartialBatch { succeeded, failed } => {
            assert_eq!(succeeded, 1);
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].0, bad);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(fx.store.find_host(&good).expect("find").expect("good").hosted);
    assert!(!fx.store.find_host(&bad).expect("find").expect("bad").hosted);

    fx.transfer.unhide(&bad);
    let report = fx.host.run_once(&CancellationToken::new()).await.expect("retry");
    assert_eq!(report.fetched, 1);
    assert!(fx.store.find_host(&bad).expect("find").expect("bad").hosted);
}

#[tokio::test]
async fn payments_are_counted_while_another_fetch_keeps_failing() {
    let fx = fixture();
    let good = fx.transfer.put(b"good");
    let stuck = fx.transfer.put(b"stuck");
    fx.ledger.assign_block(ME, &good, 4, 1);
    fx.ledger.assign_block(ME, &stuck, 5, 1);
    fx.transfer.hide(&stuck);
    fx.ledger.record_payment(ME, &good, 4);

    for _ in 0..3 {
        let err = fx
            .host
            .run_once(&CancellationToken::new())
            .await
            .expect_err("stuck block never fetches");
        assert!(matches!(err, VaultError::PartialBatch { .. }));
    }
    let record = fx.store.find_host(&good).expect("find").expect("good");
    assert!(record.hosted);
    assert_eq!(record.times_paid, 1);
    assert_eq!(record.amount_paid, 4);
}

#[tokio::test]
async fn fetches_overlap_up_to_the_concurrency_limit() {
    let fx = fixture_with(MockTransfer::with_fetch_delay(Duration::from_millis(30)));
    for i in 0..6u8 {
        let body = [b'b', b'l', b'o', b'c', b'k', i];
        let address = fx.transfer.put(&body);
        fx.ledger.assign_block(ME, &address, body.len() as u64, 1);
    }

    let report = fx.host.run_once(&CancellationToken::new()).await.expect("pass");
    assert_eq!(report.fetched, 6);
    assert!(fx.transfer.max_in_flight() > 1);
    assert!(fx.transfer.max_in_flight() <= 2);
}

#[tokio::test]
async fn paid_events_update_counters() {
    let fx = fixture();
    let address = fx.transfer.put(b"paid block");
    fx.ledger.assign_block(ME, &address, 10, 2);
    fx.host.refresh_info().await.expect("refresh");

    fx.ledger.record_payment(ME, &address, 20);
    fx.ledger.record_payment(ME, &address, 20);
    fx.ledger.record_payment("0xsomeone-else", &address, 99);

    assert_eq!(fx.host.refresh_payments().await.expect("payments"), 1);
    let record = fx.store.find_host(&address).expect("find").expect("tracked");
    assert_eq!(record.times_paid, 2);
    assert_eq!(record.amount_paid, 40);

    assert_eq!(fx.host.refresh_payments().await.expect("unchanged"), 0);
}

#[tokio::test]
async fn remove_unpins_and_deletes_local_bytes() {
    let fx = fixture();
    let address = fx.transfer.put(b"to be removed");
    fx.ledger.assign_block(ME, &address, 13, 1);
    fx.host.run_once(&CancellationToken::new()).await.expect("pass");

    let path = fx
        .store
        .find_host(&address)
        .expect("find")
        .and_then(|r| r.path)
        .expect("hosted path");
    assert!(fx.transfer.is_pinned(&address));

    assert!(fx.host.remove(&address).await.expect("remove"));
    assert!(!fx.transfer.is_pinned(&address));
    assert!(!std::path::Path::new(&path).exists());
    assert!(fx.store.find_host(&address).expect("find").is_none());
    assert!(!fx.host.remove(&address).await.expect("remove again"));
}

#[tokio::test]
async fn run_stops_on_cancellation() {
    let fx = fixture();
    let address = fx.transfer.put(b"looped");
    fx.ledger.assign_block(ME, &address, 6, 1);

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        stopper.cancel();
    });
    tokio::time::timeout(Duration::from_secs(5), fx.host.run(cancel))
        .await
        .expect("loop exits after cancel");
    assert!(fx.store.find_host(&address).expect("find").expect("tracked").hosted);
}

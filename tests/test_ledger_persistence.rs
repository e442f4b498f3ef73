//! Snapshot durability across restarts and failed commits.

mod common;

use common::*;
use ethers::types::U256;
use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use fee_oracle::error::{OracleError, Result};
use fee_oracle::ledger_state::{
    CounterId, FileSnapshotStore, LedgerSide, LedgerSnapshot, SnapshotStore, SNAPSHOT_VERSION,
};
use fee_oracle::reconciliation::ReconciliationEngine;
use fee_oracle::scheduler::{Service, StepStatus, TickStep};

fn l1_balances(sequencer: u64, proposer: u64) -> BTreeMap<CounterId, U256> {
    [
        (CounterId::Sequencer, u(sequencer)),
        (CounterId::Proposer, u(proposer)),
        (CounterId::Relayer, U256::zero()),
        (CounterId::FastRelayer, U256::zero()),
    ]
    .into_iter()
    .collect()
}

#[tokio::test]
async fn test_restart_resumes_from_committed_counters() {
    let dir = tempfile::tempdir().unwrap();
    let a = accounts();

    let first = Harness::with_store(Arc::new(FileSnapshotStore::new(dir.path())));
    first.l1.set_balance(a.sequencer, u(10_000));
    first.l2.set_balance(a.sequencer_fee_vault, u(500));
    let mut control = first.control_loop(Duration::from_secs(60));
    control.init().await.unwrap();
    control.tick().await;
    first.l1.set_balance(a.sequencer, u(9_000));
    control.tick().await;
    assert_eq!(control.billing().cumulative(CounterId::Sequencer), u(1_500));
    drop(control);

    // Same balances after restart: nothing new accrues and nothing is re-seeded
    let second = Harness::with_store(Arc::new(FileSnapshotStore::new(dir.path())));
    second.l1.set_balance(a.sequencer, u(9_000));
    second.l2.set_balance(a.sequencer_fee_vault, u(800));
    let mut control = second.control_loop(Duration::from_secs(60));
    control.init().await.unwrap();
    assert_eq!(control.billing().cumulative(CounterId::Sequencer), u(1_500));

    control.tick().await;
    assert_eq!(control.billing().cumulative(CounterId::Sequencer), u(1_500));
    assert_eq!(control.billing().cumulative(CounterId::SequencerFeeVault), u(800));
}

#[tokio::test]
async fn test_failed_commit_does_not_advance_baseline() {
    let store = Arc::new(MemoryStore::default());
    let h = Harness::with_store(store.clone());
    let a = accounts();
    h.l1.set_balance(a.sequencer, u(10_000));

    let mut control = h.control_loop(Duration::from_secs(60));
    control.init().await.unwrap();
    control.tick().await;

    store.fail_commits.store(true, Ordering::SeqCst);
    h.l1.set_balance(a.sequencer, u(9_500));
    let report = control.tick().await;
    assert!(matches!(
        report.status(TickStep::ReconcileL1),
        Some(StepStatus::Failed { kind: "io", .. })
    ));
    // Parameter steps are independent of persistence
    assert_eq!(report.status(TickStep::PriceRatio), Some(&StepStatus::Completed));
    assert_eq!(control.billing().cumulative(CounterId::Sequencer), U256::zero());

    // The 500 is counted once the write goes through, and only once
    store.fail_commits.store(false, Ordering::SeqCst);
    control.tick().await;
    assert_eq!(control.billing().cumulative(CounterId::Sequencer), u(500));
    control.tick().await;
    assert_eq!(control.billing().cumulative(CounterId::Sequencer), u(500));
    assert_eq!(
        store.load(LedgerSide::L1).unwrap().unwrap().cumulative(CounterId::Sequencer),
        u(500)
    );
}

#[tokio::test]
async fn test_reconcile_ledger_commits_before_returning() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileSnapshotStore::new(dir.path()));
    let engine = ReconciliationEngine::new(store.clone());

    let seeded = engine
        .reconcile_ledger(LedgerSide::L1, None, &l1_balances(1_000, 200), &BTreeMap::new())
        .await
        .unwrap();
    let update = engine
        .reconcile_ledger(LedgerSide::L1, Some(&seeded.snapshot), &l1_balances(600, 250), &BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(update.accrued[&CounterId::Sequencer], u(400));
    assert_eq!(update.accrued[&CounterId::Proposer], U256::zero());
    let on_disk = store.load(LedgerSide::L1).unwrap().unwrap();
    assert_eq!(on_disk.counters, update.snapshot.counters);
    assert!(!store.path(LedgerSide::L1).with_extension("json.tmp").exists());
}

/// Commits only after another task on the runtime opens the gate.
struct GatedStore {
    inner: MemoryStore,
    gate: Mutex<mpsc::Receiver<()>>,
}

impl SnapshotStore for GatedStore {
    fn load(&self, side: LedgerSide) -> Result<Option<LedgerSnapshot>> {
        self.inner.load(side)
    }

    fn commit(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        self.gate
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(2))
            .map_err(|_| OracleError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "gate never opened")))?;
        self.inner.commit(snapshot)
    }
}

// Single-threaded runtime: a commit on the worker thread would starve the opener
#[tokio::test(flavor = "current_thread")]
async fn test_commit_does_not_block_the_runtime() {
    let (open, gate) = mpsc::channel();
    let store = Arc::new(GatedStore {
        inner: MemoryStore::default(),
        gate: Mutex::new(gate),
    });
    let engine = ReconciliationEngine::new(store.clone());

    let opener = tokio::spawn(async move {
        open.send(()).unwrap();
    });
    let update = engine
        .reconcile_ledger(LedgerSide::L1, None, &l1_balances(1_000, 200), &BTreeMap::new())
        .await
        .unwrap();
    opener.await.unwrap();

    assert_eq!(*store.inner.commits.lock().unwrap(), 1);
    assert_eq!(store.load(LedgerSide::L1).unwrap().unwrap().counters, update.snapshot.counters);
}

#[tokio::test]
async fn test_tampered_snapshot_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSnapshotStore::new(dir.path());
    let engine = ReconciliationEngine::new(Arc::new(FileSnapshotStore::new(dir.path())));
    engine
        .reconcile_ledger(LedgerSide::L1, None, &l1_balances(1_000, 0), &BTreeMap::new())
        .await
        .unwrap();

    let path = store.path(LedgerSide::L1);
    let mut file: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    file["counters"]["sequencer"]["cumulative"] = serde_json::Value::String("999999".to_string());
    fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();

    match store.load(LedgerSide::L1) {
        Err(OracleError::CorruptSnapshot { reason, .. }) => assert!(reason.contains("checksum")),
        other => panic!("expected corrupt snapshot, got {other:?}"),
    }
}

#[test]
fn test_unknown_snapshot_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSnapshotStore::new(dir.path());
    fs::write(
        store.path(LedgerSide::L2),
        format!(r#"{{"version": {}, "side": "l2", "counters": {{}}}}"#, SNAPSHOT_VERSION + 1),
    )
    .unwrap();

    match store.load(LedgerSide::L2) {
        Err(OracleError::UnsupportedSnapshotVersion { found, expected, .. }) => {
            assert_eq!(found, SNAPSHOT_VERSION + 1);
            assert_eq!(expected, SNAPSHOT_VERSION);
        }
        other => panic!("expected version error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_init_fails_on_corrupt_history() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("l1_history.json"), b"{ not json").unwrap();

    let h = Harness::with_store(Arc::new(FileSnapshotStore::new(dir.path())));
    let mut control = h.control_loop(Duration::from_secs(60));
    let err = control.init().await.unwrap_err();
    assert_eq!(err.kind(), "corrupt_snapshot");
}

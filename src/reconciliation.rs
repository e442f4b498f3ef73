//! # Reconciliation Engine
//!
//! Turns raw balance observations into monotonic cumulative counters and commits
//! them before anyone else sees the result.
//!
//! - **Outflow** counters (L1 submitter wallets) accrue balance *decreases*; a top-up
//!   only moves the baseline.
//! - **Inflow** counters (L2 fee vaults) accrue balance *increases*; a withdrawal only
//!   moves the baseline.
//!
//! A candidate snapshot is adopted by the caller only after
//! [`SnapshotStore::commit`] succeeded, so a failed write leaves the previous
//! committed baseline in place and the same delta is counted again next tick
//! instead of twice.

use chrono::Utc;
use ethers::types::U256;
use log::{error, warn};
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use crate::error::{OracleError, Result};
use crate::ledger_state::{CounterId, CounterSnapshot, Flow, LedgerSide, LedgerSnapshot, SnapshotStore};
use crate::metrics;
use crate::types::conversions::wei_to_f64;

/// Outflow step: returns the new snapshot and the amount accrued this observation.
pub fn reconcile(current: U256, previous: Option<&CounterSnapshot>, baseline: U256) -> (CounterSnapshot, U256) {
    match previous {
        None => (
            CounterSnapshot {
                observed_balance: current,
                cumulative: baseline,
            },
            U256::zero(),
        ),
        Some(prev) => {
            let accrued = prev.observed_balance.saturating_sub(current);
            (
                CounterSnapshot {
                    observed_balance: current,
                    cumulative: prev.cumulative.saturating_add(accrued),
                },
                accrued,
            )
        }
    }
}

/// Inflow step: mirror of [`reconcile`] counting increases.
pub fn reconcile_inflow(current: U256, previous: Option<&CounterSnapshot>, baseline: U256) -> (CounterSnapshot, U256) {
    match previous {
        None => (
            CounterSnapshot {
                observed_balance: current,
                cumulative: baseline,
            },
            U256::zero(),
        ),
        Some(prev) => {
            let accrued = current.saturating_sub(prev.observed_balance);
            (
                CounterSnapshot {
                    observed_balance: current,
                    cumulative: prev.cumulative.saturating_add(accrued),
                },
                accrued,
            )
        }
    }
}

/// Result of reconciling one ledger side; already committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerUpdate {
    pub snapshot: LedgerSnapshot,
    pub accrued: BTreeMap<CounterId, U256>,
    /// Inflow counters whose cumulative was raised to the current balance
    pub repaired: Vec<CounterId>,
}

pub struct ReconciliationEngine {
    store: Arc<dyn SnapshotStore>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self { store }
    }

    pub fn load(&self, side: LedgerSide) -> Result<Option<LedgerSnapshot>> {
        self.store.load(side)
    }

    /// Reconciles every counter in `balances` against `committed` and commits the result.
    ///
    /// `baselines` seeds counters seen for the first time (missing entries seed zero).
    /// Counters without a balance this tick are carried over unchanged. The commit runs
    /// on the blocking pool.
    pub async fn reconcile_ledger(
        &self,
        side: LedgerSide,
        committed: Option<&LedgerSnapshot>,
        balances: &BTreeMap<CounterId, U256>,
        baselines: &BTreeMap<CounterId, U256>,
    ) -> Result<LedgerUpdate> {
        let mut counters = committed.map(|s| s.counters.clone()).unwrap_or_default();
        let mut accrued = BTreeMap::new();
        let mut repaired = Vec::new();

        for (&id, &current) in balances.iter().filter(|(id, _)| id.side() == side) {
            let previous = committed.and_then(|s| s.get(id));
            let baseline = baselines.get(&id).copied().unwrap_or_default();

            let (mut next, delta) = match id.flow() {
                Flow::Outflow => reconcile(current, previous, baseline),
                Flow::Inflow => reconcile_inflow(current, previous, baseline),
            };

            // A vault can never hold more than it has ever collected
            if id.flow() == Flow::Inflow && next.cumulative < current {
                warn!(
                    "counter={} cumulative={} below balance={}, raising",
                    id.as_str(),
                    next.cumulative,
                    current
                );
                next.cumulative = current;
                repaired.push(id);
            }

            counters.insert(id, next);
            accrued.insert(id, delta);
        }

        let candidate = LedgerSnapshot {
            side,
            counters,
            updated_at: Utc::now(),
        };

        if let Err(e) = self.commit(candidate.clone()).await {
            error!("snapshot commit failed side={} error={}", side.as_str(), e);
            metrics::increment_snapshot_commit(side.as_str(), "error");
            return Err(e);
        }
        metrics::increment_snapshot_commit(side.as_str(), "ok");
        for (id, counter) in &candidate.counters {
            metrics::set_counter_cumulative(id.as_str(), wei_to_f64(counter.cumulative));
        }

        Ok(LedgerUpdate {
            snapshot: candidate,
            accrued,
            repaired,
        })
    }

    async fn commit(&self, candidate: LedgerSnapshot) -> Result<()> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.commit(&candidate))
            .await
            .map_err(|e| {
                OracleError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    format!("snapshot commit task failed: {e}"),
                ))
            })?
    }
}

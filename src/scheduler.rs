//! # Control Loop Scheduler
//!
//! Drives the oracle: every `polling_interval` it refreshes prices, reconciles both
//! ledgers and then lets the [`ParameterController`] adjust each fee parameter.
//!
//! ## Tick steps
//!
//! | # | Step              | Writes on-chain |
//! |---|-------------------|-----------------|
//! | 1 | refresh prices    | no              |
//! | 2 | reconcile L1      | no (snapshot)   |
//! | 3 | reconcile L2      | no (snapshot)   |
//! | 4 | price ratio       | yes             |
//! | 5 | overhead          | yes             |
//! | 6 | L1 base fee       | yes             |
//!
//! Steps are isolated: a failing step is logged, counted and reported in the
//! [`TickReport`], and the tick moves on. Once shutdown is requested the remaining
//! write steps are reported as cancelled.

use async_trait::async_trait;
use ethers::types::{Address, U256};
use futures::future::try_join_all;
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

use crate::billing::BillingState;
use crate::chain_reader::ChainReader;
use crate::error::{OracleError, Result};
use crate::ledger_state::{CounterId, LedgerSide};
use crate::metrics;
use crate::parameter_controller::{ParameterController, ParameterOutcome};
use crate::price_feeds::PriceFeedReader;
use crate::reconciliation::ReconciliationEngine;
use crate::shutdown::ShutdownSignal;

/// Long-running lifecycle: `init` once, `run` until shutdown, then `shutdown`.
#[async_trait]
pub trait Service: Send {
    async fn init(&mut self) -> Result<()>;

    async fn run(&mut self) -> Result<()>;

    async fn shutdown(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TickStep {
    RefreshPrices,
    ReconcileL1,
    ReconcileL2,
    PriceRatio,
    Overhead,
    L1BaseFee,
}

impl TickStep {
    pub const ALL: [TickStep; 6] = [
        TickStep::RefreshPrices,
        TickStep::ReconcileL1,
        TickStep::ReconcileL2,
        TickStep::PriceRatio,
        TickStep::Overhead,
        TickStep::L1BaseFee,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TickStep::RefreshPrices => "refresh_prices",
            TickStep::ReconcileL1 => "reconcile_l1",
            TickStep::ReconcileL2 => "reconcile_l2",
            TickStep::PriceRatio => "price_ratio",
            TickStep::Overhead => "overhead",
            TickStep::L1BaseFee => "l1_base_fee",
        }
    }

    pub fn writes_on_chain(&self) -> bool {
        matches!(self, TickStep::PriceRatio | TickStep::Overhead | TickStep::L1BaseFee)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Completed,
    Failed { kind: &'static str, message: String },
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub tick: u64,
    pub steps: Vec<(TickStep, StepStatus)>,
    pub parameters: Vec<ParameterOutcome>,
    pub duration: Duration,
}

impl TickReport {
    pub fn status(&self, step: TickStep) -> Option<&StepStatus> {
        self.steps.iter().find(|(s, _)| *s == step).map(|(_, status)| status)
    }

    pub fn failed_steps(&self) -> Vec<TickStep> {
        self.steps
            .iter()
            .filter(|(_, status)| matches!(status, StepStatus::Failed { .. }))
            .map(|(step, _)| *step)
            .collect()
    }

    pub fn all_completed(&self) -> bool {
        self.steps.iter().all(|(_, status)| *status == StepStatus::Completed)
    }
}

/// Every address whose balance feeds a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitoredAccounts {
    pub sequencer: Address,
    pub proposer: Address,
    pub relayer: Address,
    pub fast_relayer: Address,
    pub sequencer_fee_vault: Address,
    pub secondary_fee_token: Address,
    /// Holder of the secondary fee token revenue (the fee token oracle)
    pub secondary_fee_token_vault: Address,
    pub billing_contract: Address,
}

pub struct ControlLoop {
    prices: PriceFeedReader,
    l1: Arc<dyn ChainReader>,
    l2: Arc<dyn ChainReader>,
    engine: ReconciliationEngine,
    controller: ParameterController,
    accounts: MonitoredAccounts,
    polling_interval: Duration,
    shutdown: ShutdownSignal,
    billing: BillingState,
    ticks: u64,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prices: PriceFeedReader,
        l1: Arc<dyn ChainReader>,
        l2: Arc<dyn ChainReader>,
        engine: ReconciliationEngine,
        controller: ParameterController,
        accounts: MonitoredAccounts,
        polling_interval: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            prices,
            l1,
            l2,
            engine,
            controller,
            accounts,
            polling_interval,
            shutdown,
            billing: BillingState::new(None, None),
            ticks: 0,
        }
    }

    pub fn billing(&self) -> &BillingState {
        &self.billing
    }

    pub fn prices(&self) -> &PriceFeedReader {
        &self.prices
    }

    /// Runs the six steps once.
    pub async fn tick(&mut self) -> TickReport {
        self.ticks += 1;
        let tick = self.ticks;
        let span = tracing::info_span!("tick", tick = tick);
        self.run_steps(tick).instrument(span).await
    }

    async fn run_steps(&mut self, tick: u64) -> TickReport {
        let start = Instant::now();
        metrics::increment_tick();
        let mut report = TickReport {
            tick,
            ..TickReport::default()
        };

        for step in TickStep::ALL {
            if step.writes_on_chain() && self.shutdown.is_requested() {
                report.steps.push((step, StepStatus::Cancelled));
                continue;
            }

            let result = match step {
                TickStep::RefreshPrices => self.prices.refresh().await,
                TickStep::ReconcileL1 => self.reconcile_l1().await,
                TickStep::ReconcileL2 => self.reconcile_l2().await,
                TickStep::PriceRatio => {
                    let outcome = self.controller.update_price_ratio(self.prices.book()).await;
                    outcome.map(|o| report.parameters.push(o))
                }
                TickStep::Overhead => self.controller.update_overhead().await.map(|o| report.parameters.push(o)),
                TickStep::L1BaseFee => self.controller.update_l1_base_fee().await.map(|o| report.parameters.push(o)),
            };

            let status = match result {
                Ok(()) => StepStatus::Completed,
                Err(OracleError::Shutdown) => StepStatus::Cancelled,
                Err(e) => {
                    error!("tick={} step={} failed kind={}: {}", tick, step.as_str(), e.kind(), e);
                    metrics::increment_step_failure(step.as_str(), e.kind());
                    StepStatus::Failed {
                        kind: e.kind(),
                        message: e.to_string(),
                    }
                }
            };
            report.steps.push((step, status));
        }

        report.duration = start.elapsed();
        metrics::record_tick_duration(report.duration);
        info!(
            "tick={} finished in {:?} failed={:?} updates={}",
            tick,
            report.duration,
            report.failed_steps().iter().map(|s| s.as_str()).collect::<Vec<_>>(),
            report.parameters.iter().filter(|p| p.confirmation.is_some()).count()
        );
        report
    }

    async fn reconcile_l1(&mut self) -> Result<()> {
        let accounts = [
            (CounterId::Sequencer, self.accounts.sequencer),
            (CounterId::Proposer, self.accounts.proposer),
            (CounterId::Relayer, self.accounts.relayer),
            (CounterId::FastRelayer, self.accounts.fast_relayer),
        ];
        let l1 = Arc::clone(&self.l1);
        let fetched = try_join_all(accounts.iter().map(|(_, account)| l1.get_balance(*account))).await?;
        let balances: BTreeMap<CounterId, U256> = accounts.iter().map(|(id, _)| *id).zip(fetched).collect();

        // L1 spend starts aligned with what L2 has already collected
        let mut baselines = BTreeMap::new();
        let seeded = self
            .billing
            .committed(LedgerSide::L1)
            .map_or(false, |s| s.get(CounterId::Sequencer).is_some());
        if !seeded {
            let vault = self.l2.get_balance(self.accounts.sequencer_fee_vault).await?;
            info!("seeding counter=sequencer baseline={} from L2 fee vault", vault);
            baselines.insert(CounterId::Sequencer, vault);
        }

        let update = self
            .engine
            .reconcile_ledger(LedgerSide::L1, self.billing.committed(LedgerSide::L1), &balances, &baselines)
            .await?;
        for (id, accrued) in update.accrued.iter().filter(|(_, a)| !a.is_zero()) {
            info!("counter={} accrued={}", id.as_str(), accrued);
        }
        self.billing.apply(update);
        Ok(())
    }

    async fn reconcile_l2(&mut self) -> Result<()> {
        let (vault, secondary, billing) = futures::try_join!(
            self.l2.get_balance(self.accounts.sequencer_fee_vault),
            self.l2
                .token_balance(self.accounts.secondary_fee_token, self.accounts.secondary_fee_token_vault),
            self.l2.get_balance(self.accounts.billing_contract),
        )?;
        let balances: BTreeMap<CounterId, U256> = [
            (CounterId::SequencerFeeVault, vault),
            (CounterId::SecondaryFeeTokenVault, secondary),
            (CounterId::BillingContract, billing),
        ]
        .into_iter()
        .collect();
        // Vault counters start from what they already hold
        let baselines = balances.clone();

        let update = self
            .engine
            .reconcile_ledger(LedgerSide::L2, self.billing.committed(LedgerSide::L2), &balances, &baselines)
            .await?;
        if !update.repaired.is_empty() {
            warn!(
                "raised {} inflow counter(s) to their current balance",
                update.repaired.len()
            );
        }
        self.billing.apply(update);
        self.billing.summary(self.prices.book()).log();
        Ok(())
    }
}

#[async_trait]
impl Service for ControlLoop {
    async fn init(&mut self) -> Result<()> {
        let l1 = self.engine.load(LedgerSide::L1)?;
        let l2 = self.engine.load(LedgerSide::L2)?;
        match (&l1, &l2) {
            (None, None) => warn!("No ledger history found, counters will be seeded on the first tick"),
            _ => info!(
                "Loaded ledger history l1_counters={} l2_counters={}",
                l1.as_ref().map_or(0, |s| s.counters.len()),
                l2.as_ref().map_or(0, |s| s.counters.len())
            ),
        }
        self.billing = BillingState::new(l1, l2);

        metrics::set_up();
        info!(
            "Control loop ready polling_interval={:?} l1={} l2={} accounts={:?}",
            self.polling_interval,
            self.l1.name(),
            self.l2.name(),
            self.accounts
        );
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.polling_interval) => {}
                _ = shutdown.requested() => break,
            }
            let report = self.tick().await;
            if !report.all_completed() {
                warn!("tick={} finished with failed or cancelled steps", report.tick);
            }
            if self.shutdown.is_requested() {
                break;
            }
        }
        info!("Control loop stopped after {} ticks", self.ticks);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        info!("Final billing summary");
        self.billing.summary(self.prices.book()).log();
        Ok(())
    }
}

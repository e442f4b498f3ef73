// src/billing.rs

use ethers::types::U256;
use log::info;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::ledger_state::{CounterId, Denomination, LedgerSide, LedgerSnapshot};
use crate::price_feeds::{PriceBook, PricePair};
use crate::reconciliation::LedgerUpdate;
use crate::types::conversions::{truncate_to_cents, u256_to_decimal};

const TOKEN_DECIMALS: u8 = 18;

/// Committed counters for both ledgers plus what the last tick added.
#[derive(Debug, Clone)]
pub struct BillingState {
    l1: LedgerSnapshot,
    l2: LedgerSnapshot,
    last_accrued: BTreeMap<CounterId, U256>,
}

impl BillingState {
    pub fn new(l1: Option<LedgerSnapshot>, l2: Option<LedgerSnapshot>) -> Self {
        Self {
            l1: l1.unwrap_or_else(|| LedgerSnapshot::empty(LedgerSide::L1)),
            l2: l2.unwrap_or_else(|| LedgerSnapshot::empty(LedgerSide::L2)),
            last_accrued: BTreeMap::new(),
        }
    }

    pub fn snapshot(&self, side: LedgerSide) -> &LedgerSnapshot {
        match side {
            LedgerSide::L1 => &self.l1,
            LedgerSide::L2 => &self.l2,
        }
    }

    /// `None` until the side has been reconciled (or loaded) at least once.
    pub fn committed(&self, side: LedgerSide) -> Option<&LedgerSnapshot> {
        let snapshot = self.snapshot(side);
        (!snapshot.counters.is_empty()).then_some(snapshot)
    }

    /// Adopts a committed update.
    pub fn apply(&mut self, update: LedgerUpdate) {
        self.last_accrued.extend(update.accrued);
        match update.snapshot.side {
            LedgerSide::L1 => self.l1 = update.snapshot,
            LedgerSide::L2 => self.l2 = update.snapshot,
        }
    }

    pub fn cumulative(&self, id: CounterId) -> U256 {
        self.snapshot(id.side()).cumulative(id)
    }

    pub fn last_accrued(&self, id: CounterId) -> U256 {
        self.last_accrued.get(&id).copied().unwrap_or_default()
    }

    pub fn total_l1_cost(&self) -> U256 {
        LedgerSide::L1
            .counters()
            .iter()
            .fold(U256::zero(), |acc, id| acc.saturating_add(self.cumulative(*id)))
    }

    pub fn relayer_cost(&self) -> U256 {
        self.cumulative(CounterId::Relayer)
            .saturating_add(self.cumulative(CounterId::FastRelayer))
    }

    /// USD value of a counter at the latest known price, truncated to cents.
    pub fn usd_value(&self, id: CounterId, prices: &PriceBook) -> Option<Decimal> {
        usd(self.cumulative(id), id.denomination(), prices)
    }

    pub fn summary(&self, prices: &PriceBook) -> BillingSummary {
        let total_l1 = self.total_l1_cost();
        let relayer = self.relayer_cost();
        BillingSummary {
            total_l1_cost: tokens(total_l1),
            total_l1_cost_usd: usd(total_l1, Denomination::Secondary, prices),
            relayer_cost: tokens(relayer),
            relayer_cost_usd: usd(relayer, Denomination::Secondary, prices),
            counters: LedgerSide::L1
                .counters()
                .iter()
                .chain(LedgerSide::L2.counters())
                .map(|&id| CounterLine {
                    id,
                    cumulative: tokens(self.cumulative(id)),
                    last_accrued: tokens(self.last_accrued(id)),
                    usd: self.usd_value(id, prices),
                })
                .collect(),
        }
    }
}

fn tokens(value: U256) -> Option<Decimal> {
    u256_to_decimal(value, TOKEN_DECIMALS).ok()
}

fn usd(value: U256, denomination: Denomination, prices: &PriceBook) -> Option<Decimal> {
    let pair = match denomination {
        Denomination::Native => PricePair::NativeUsd,
        Denomination::Secondary => PricePair::SecondaryUsd,
    };
    let price = prices.value(pair)?;
    let amount = tokens(value)?;
    amount.checked_mul(price).map(truncate_to_cents)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CounterLine {
    pub id: CounterId,
    pub cumulative: Option<Decimal>,
    pub last_accrued: Option<Decimal>,
    pub usd: Option<Decimal>,
}

/// Token amounts are whole tokens; `None` means unknown (no price, or too large).
#[derive(Debug, Clone, PartialEq)]
pub struct BillingSummary {
    pub total_l1_cost: Option<Decimal>,
    pub total_l1_cost_usd: Option<Decimal>,
    pub relayer_cost: Option<Decimal>,
    pub relayer_cost_usd: Option<Decimal>,
    pub counters: Vec<CounterLine>,
}

impl BillingSummary {
    pub fn log(&self) {
        info!(
            "billing total_l1_cost={} total_l1_cost_usd={} relayer_cost={} relayer_cost_usd={}",
            show(self.total_l1_cost),
            show(self.total_l1_cost_usd),
            show(self.relayer_cost),
            show(self.relayer_cost_usd)
        );
        for line in &self.counters {
            info!(
                "billing counter={} cumulative={} last_accrued={} usd={}",
                line.id.as_str(),
                show(line.cumulative),
                show(line.last_accrued),
                show(line.usd)
            );
        }
    }
}

fn show(value: Option<Decimal>) -> String {
    value.map_or_else(|| "unknown".to_string(), |v| v.round_dp(6).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger_state::CounterSnapshot;
    use crate::price_feeds::PriceObservation;
    use chrono::Utc;
    use std::str::FromStr;

    fn ether(n: u64) -> U256 {
        U256::exp10(18) * U256::from(n)
    }

    fn l1_snapshot() -> LedgerSnapshot {
        let mut snapshot = LedgerSnapshot::empty(LedgerSide::L1);
        for (id, cumulative) in [
            (CounterId::Sequencer, ether(3)),
            (CounterId::Proposer, ether(1)),
            (CounterId::Relayer, ether(2)),
            (CounterId::FastRelayer, ether(4)),
        ] {
            snapshot.counters.insert(
                id,
                CounterSnapshot {
                    observed_balance: U256::zero(),
                    cumulative,
                },
            );
        }
        snapshot
    }

    #[test]
    fn test_derived_totals() {
        let state = BillingState::new(Some(l1_snapshot()), None);
        assert_eq!(state.total_l1_cost(), ether(10));
        assert_eq!(state.relayer_cost(), ether(6));
        assert!(state.committed(LedgerSide::L2).is_none());
    }

    #[test]
    fn test_usd_values_need_a_price() {
        let state = BillingState::new(Some(l1_snapshot()), None);
        let mut prices = PriceBook::default();
        assert_eq!(state.usd_value(CounterId::Relayer, &prices), None);

        prices.record(PriceObservation {
            pair: PricePair::SecondaryUsd,
            value: Decimal::from_str("1800.50").unwrap(),
            observed_at: Utc::now(),
        });
        let summary = state.summary(&prices);
        assert_eq!(summary.total_l1_cost_usd, Some(Decimal::from_str("18005.00").unwrap()));
        assert_eq!(summary.relayer_cost, Some(Decimal::from(6)));
        assert_eq!(summary.counters.len(), 7);
    }
}

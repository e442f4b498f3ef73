//! # Parameter Controller
//!
//! Decides whether each fee parameter should move and, if so, writes it.
//!
//! All three parameters go through [`decide`]:
//!
//! 1. a target outside `[hard_floor, hard_ceiling]` is never written;
//! 2. a target equal to (or within `min_step` of) the current value is a no-op;
//! 3. otherwise the move is clamped to `max_delta_fraction` of the current value,
//!    and a clamp that rounds down to zero units is a no-op;
//! 4. the clamped value is checked against the hard bounds again.
//!
//! Writes are serialized and each one waits for its receipt, racing a
//! confirmation timeout and the shutdown signal.

use ethers::types::{H256, U256};
use futures::future::try_join_all;
use log::{info, warn};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::chain_reader::{BatchAppendedEvent, BatchKind, BatchLogSource, ChainReader};
use crate::error::{OracleError, Result};
use crate::metrics;
use crate::oracle_contract::{Confirmation, FeeOracle, OracleParameter, ParameterUpdate};
use crate::price_feeds::{PriceBook, PricePair};
use crate::settings::Oracle;
use crate::shutdown::ShutdownSignal;
use crate::types::conversions::decimal_to_u256_floor;

const PPM: u64 = 1_000_000;

/// Safety rails for one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterBounds {
    /// Largest relative move per update, e.g. 0.05; `None` disables the rate clamp
    pub max_delta_fraction: Option<Decimal>,
    pub min_step: U256,
    pub hard_floor: U256,
    pub hard_ceiling: U256,
}

impl ParameterBounds {
    pub fn contains(&self, value: U256) -> bool {
        value >= self.hard_floor && value <= self.hard_ceiling
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AtTarget,
    BelowMinStep,
    OutOfBounds,
    MissingPrice,
    InsufficientData,
    InvalidTarget,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::AtTarget => "at_target",
            SkipReason::BelowMinStep => "below_min_step",
            SkipReason::OutOfBounds => "out_of_bounds",
            SkipReason::MissingPrice => "missing_price",
            SkipReason::InsufficientData => "insufficient_data",
            SkipReason::InvalidTarget => "invalid_target",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    NoOp(SkipReason),
    SetTo(U256),
}

pub fn decide(target: U256, current: U256, bounds: &ParameterBounds) -> Action {
    if !bounds.contains(target) {
        return Action::NoOp(SkipReason::OutOfBounds);
    }
    if target == current {
        return Action::NoOp(SkipReason::AtTarget);
    }
    let distance = if target > current { target - current } else { current - target };
    if distance < bounds.min_step {
        return Action::NoOp(SkipReason::BelowMinStep);
    }

    let next = match bounds.max_delta_fraction {
        Some(fraction) if !current.is_zero() => match clamp_move(target, current, fraction) {
            Some(next) => next,
            None => return Action::NoOp(SkipReason::BelowMinStep),
        },
        _ => target,
    };

    if !bounds.contains(next) {
        warn!(
            "clamped value={} outside [{}, {}] (target={} current={})",
            next, bounds.hard_floor, bounds.hard_ceiling, target, current
        );
        return Action::NoOp(SkipReason::OutOfBounds);
    }
    Action::SetTo(next)
}

/// Moves `current` toward `target` by at most `fraction` of `current`.
///
/// Returns `None` when `floor(current * fraction)` is zero: the allowed move is
/// smaller than one unit, so the value stays put.
fn clamp_move(target: U256, current: U256, fraction: Decimal) -> Option<U256> {
    let fraction_ppm = U256::from((fraction * Decimal::from(PPM)).floor().to_u64().unwrap_or(PPM));
    let scaled = current.saturating_mul(fraction_ppm);
    let ppm = U256::from(PPM);

    let step = scaled / ppm;
    if step.is_zero() {
        return None;
    }
    if target > current {
        // floor(current * (1 + f))
        Some(target.min(current.saturating_add(step)))
    } else {
        // floor(current * (1 - f)) == current - ceil(current * f)
        let step = scaled.saturating_add(ppm - U256::one()) / ppm;
        Some(target.max(current.saturating_sub(step)))
    }
}

/// The L1 base fee follows the gas price exactly; only the inclusive band applies.
pub fn decide_l1_base_fee(target: U256, current: U256, bounds: &ParameterBounds) -> Action {
    let band = ParameterBounds {
        max_delta_fraction: None,
        min_step: U256::one(),
        ..*bounds
    };
    decide(target, current, &band)
}

/// Target and market price ratio: `floor(A / B * 10^decimals * multiplier / 100)` and
/// `floor(A / B * 10^decimals)`.
pub fn price_ratio_target(
    native_usd: Option<Decimal>,
    secondary_usd: Option<Decimal>,
    decimals: u32,
    multiplier_100x: u64,
) -> std::result::Result<(U256, U256), SkipReason> {
    let (a, b) = match (native_usd, secondary_usd) {
        (Some(a), Some(b)) if !b.is_zero() => (a, b),
        _ => return Err(SkipReason::MissingPrice),
    };
    let scale = 10u128
        .checked_pow(decimals)
        .and_then(|s| Decimal::try_from_i128_with_scale(i128::try_from(s).ok()?, 0).ok())
        .ok_or(SkipReason::InvalidTarget)?;

    let market = a
        .checked_div(b)
        .and_then(|ratio| ratio.checked_mul(scale))
        .ok_or(SkipReason::InvalidTarget)?;
    let target = market
        .checked_mul(Decimal::from(multiplier_100x))
        .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
        .ok_or(SkipReason::InvalidTarget)?;

    let target = decimal_to_u256_floor(target).map_err(|_| SkipReason::InvalidTarget)?;
    let market = decimal_to_u256_floor(market).map_err(|_| SkipReason::InvalidTarget)?;
    Ok((target, market))
}

/// Transaction hashes in first-seen order without duplicates.
pub fn unique_tx_hashes(events: &[BatchAppendedEvent]) -> Vec<H256> {
    let mut hashes: Vec<H256> = Vec::with_capacity(events.len());
    for event in events {
        if !hashes.contains(&event.tx_hash) {
            hashes.push(event.tx_hash);
        }
    }
    hashes
}

/// Total `_batchSize` over state batches.
pub fn total_batch_size(events: &[BatchAppendedEvent]) -> U256 {
    events
        .iter()
        .filter(|e| e.kind == BatchKind::StateBatch)
        .fold(U256::zero(), |acc, e| acc.saturating_add(e.batch_size))
}

/// Per-element L1 gas cost scaled by `ratio_1000x / 1000`.
pub fn overhead_target(total_gas_used: U256, batch_size: U256, ratio_1000x: u64) -> std::result::Result<U256, SkipReason> {
    if batch_size.is_zero() {
        return Err(SkipReason::InsufficientData);
    }
    let per_element = total_gas_used / batch_size;
    per_element
        .checked_mul(U256::from(ratio_1000x))
        .map(|v| v / U256::from(1000u64))
        .ok_or(SkipReason::InvalidTarget)
}

/// Knobs the controller needs from configuration.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub price_ratio: ParameterBounds,
    pub overhead: ParameterBounds,
    pub l1_base_fee: ParameterBounds,
    pub price_ratio_multiplier_100x: u64,
    pub overhead_ratio_1000x: u64,
    pub overhead_window_blocks: u64,
    pub confirmation_timeout: Duration,
}

impl From<&Oracle> for ControllerSettings {
    fn from(oracle: &Oracle) -> Self {
        Self {
            price_ratio: oracle.price_ratio_bounds(),
            overhead: oracle.overhead_bounds(),
            l1_base_fee: oracle.l1_base_fee_bounds(),
            price_ratio_multiplier_100x: oracle.price_ratio_multiplier_100x,
            overhead_ratio_1000x: oracle.overhead_ratio_1000x,
            overhead_window_blocks: oracle.overhead_window_blocks,
            confirmation_timeout: oracle.confirmation_timeout(),
        }
    }
}

/// What happened to one parameter on one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterOutcome {
    pub parameter: OracleParameter,
    pub current: U256,
    pub target: Option<U256>,
    pub action: Action,
    pub confirmation: Option<Confirmation>,
}

pub struct ParameterController {
    oracle: Arc<dyn FeeOracle>,
    l1: Arc<dyn ChainReader>,
    batch_logs: Arc<dyn BatchLogSource>,
    settings: ControllerSettings,
    shutdown: ShutdownSignal,
    write_lock: Mutex<()>,
}

impl ParameterController {
    pub fn new(
        oracle: Arc<dyn FeeOracle>,
        l1: Arc<dyn ChainReader>,
        batch_logs: Arc<dyn BatchLogSource>,
        settings: ControllerSettings,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            oracle,
            l1,
            batch_logs,
            settings,
            shutdown,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn update_price_ratio(&self, prices: &PriceBook) -> Result<ParameterOutcome> {
        let parameter = OracleParameter::PriceRatio;
        let (current, decimals) = futures::try_join!(self.oracle.price_ratio(), self.oracle.price_ratio_decimals())?;
        metrics::set_parameter_value(parameter.as_str(), u256_gauge(current));

        let native = prices.value(PricePair::NativeUsd);
        let secondary = prices.value(PricePair::SecondaryUsd);
        let (target, market_ratio) =
            match price_ratio_target(native, secondary, decimals, self.settings.price_ratio_multiplier_100x) {
                Ok(pair) => pair,
                Err(reason) => return Ok(self.skipped(parameter, current, None, reason)),
            };
        info!(
            "parameter=price_ratio current={} target={} market_ratio={} native_usd={:?} secondary_usd={:?} decimals={}",
            current, target, market_ratio, native, secondary, decimals
        );

        match decide(target, current, &self.settings.price_ratio) {
            Action::NoOp(reason) => Ok(self.skipped(parameter, current, Some(target), reason)),
            Action::SetTo(ratio) => {
                let confirmation = self.apply(ParameterUpdate::PriceRatio { ratio, market_ratio }).await?;
                Ok(self.updated(parameter, current, target, ratio, confirmation))
            }
        }
    }

    pub async fn update_overhead(&self) -> Result<ParameterOutcome> {
        let parameter = OracleParameter::Overhead;
        let current = self.oracle.overhead().await?;
        metrics::set_parameter_value(parameter.as_str(), u256_gauge(current));

        let latest = self.l1.get_block_number().await?;
        let from = latest.saturating_sub(self.settings.overhead_window_blocks);
        let events = self.batch_logs.batch_events(from, latest).await?;
        if events.is_empty() {
            info!("parameter=overhead no batch events in blocks {}..={}", from, latest);
            return Ok(self.skipped(parameter, current, None, SkipReason::InsufficientData));
        }

        let hashes = unique_tx_hashes(&events);
        let receipts = try_join_all(hashes.iter().map(|hash| self.l1.get_transaction_receipt(*hash))).await?;
        let mut total_gas_used = U256::zero();
        for (hash, receipt) in hashes.iter().zip(receipts) {
            let receipt = receipt.ok_or_else(|| OracleError::Rpc {
                call: "eth_getTransactionReceipt",
                message: format!("no receipt for batch transaction {hash:?}"),
            })?;
            total_gas_used = total_gas_used.saturating_add(receipt.gas_used);
        }

        let batch_size = total_batch_size(&events);
        let target = match overhead_target(total_gas_used, batch_size, self.settings.overhead_ratio_1000x) {
            Ok(target) => target,
            Err(reason) => return Ok(self.skipped(parameter, current, None, reason)),
        };
        info!(
            "parameter=overhead current={} target={} gas_used={} batch_size={} transactions={} blocks={}..={}",
            current,
            target,
            total_gas_used,
            batch_size,
            hashes.len(),
            from,
            latest
        );

        match decide(target, current, &self.settings.overhead) {
            Action::NoOp(reason) => Ok(self.skipped(parameter, current, Some(target), reason)),
            Action::SetTo(value) => {
                let confirmation = self.apply(ParameterUpdate::Overhead(value)).await?;
                Ok(self.updated(parameter, current, target, value, confirmation))
            }
        }
    }

    pub async fn update_l1_base_fee(&self) -> Result<ParameterOutcome> {
        let parameter = OracleParameter::L1BaseFee;
        let (target, current) = futures::try_join!(self.l1.get_gas_price(), self.oracle.l1_base_fee())?;
        metrics::set_parameter_value(parameter.as_str(), u256_gauge(current));
        info!("parameter=l1_base_fee current={} target={}", current, target);

        match decide_l1_base_fee(target, current, &self.settings.l1_base_fee) {
            Action::NoOp(reason) => Ok(self.skipped(parameter, current, Some(target), reason)),
            Action::SetTo(value) => {
                let confirmation = self.apply(ParameterUpdate::L1BaseFee(value)).await?;
                Ok(self.updated(parameter, current, target, value, confirmation))
            }
        }
    }

    /// Submits one update and waits for it to be mined.
    pub async fn apply(&self, update: ParameterUpdate) -> Result<Confirmation> {
        let _guard = self.write_lock.lock().await;
        let parameter = update.parameter();
        if self.shutdown.is_requested() {
            return Err(OracleError::Shutdown);
        }

        let tx_hash = self.oracle.submit(update).await?;
        info!("parameter={} submitted value={} tx={:?}", parameter, update.value(), tx_hash);

        let timeout = self.settings.confirmation_timeout;
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            confirmed = tokio::time::timeout(timeout, self.oracle.await_confirmation(parameter, tx_hash)) => {
                match confirmed {
                    Ok(result) => result,
                    Err(_) => Err(OracleError::ConfirmationTimeout { tx_hash, timeout }),
                }
            }
            _ = shutdown.requested() => {
                warn!("parameter={} tx={:?} left unconfirmed on shutdown", parameter, tx_hash);
                Err(OracleError::Shutdown)
            }
        }
    }

    fn skipped(&self, parameter: OracleParameter, current: U256, target: Option<U256>, reason: SkipReason) -> ParameterOutcome {
        let log_line = format!(
            "parameter={} action=noop reason={} current={} target={}",
            parameter,
            reason.as_str(),
            current,
            target.map_or_else(|| "none".to_string(), |t| t.to_string())
        );
        match reason {
            SkipReason::OutOfBounds | SkipReason::MissingPrice | SkipReason::InvalidTarget => warn!("{}", log_line),
            _ => info!("{}", log_line),
        }
        metrics::increment_parameter_skip(parameter.as_str(), reason.as_str());
        if let Some(target) = target {
            metrics::set_parameter_target(parameter.as_str(), u256_gauge(target));
        }
        ParameterOutcome {
            parameter,
            current,
            target,
            action: Action::NoOp(reason),
            confirmation: None,
        }
    }

    fn updated(
        &self,
        parameter: OracleParameter,
        current: U256,
        target: U256,
        written: U256,
        confirmation: Confirmation,
    ) -> ParameterOutcome {
        info!(
            "parameter={} action=set previous={} value={} target={} tx={:?} block={:?}",
            parameter, current, written, target, confirmation.tx_hash, confirmation.block_number
        );
        metrics::increment_parameter_update(parameter.as_str());
        metrics::set_parameter_target(parameter.as_str(), u256_gauge(target));
        metrics::set_parameter_value(parameter.as_str(), u256_gauge(written));
        ParameterOutcome {
            parameter,
            current,
            target: Some(target),
            action: Action::SetTo(written),
            confirmation: Some(confirmation),
        }
    }
}

fn u256_gauge(value: U256) -> f64 {
    if value > U256::from(u128::MAX) {
        f64::INFINITY
    } else {
        value.as_u128() as f64
    }
}

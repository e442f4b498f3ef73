//! On-chain fee parameters and the transactions that change them.
//!
//! [`FeeOracle`] is the only write path in the crate. The ethers adapter owns the
//! signer; callers hand it a [`ParameterUpdate`] and get a transaction hash back.

use async_trait::async_trait;
use ethers::contract::ContractError;
use ethers::prelude::*;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::contracts::{FeeTokenGasPriceOracle, OvmGasPriceOracle};
use crate::error::{OracleError, Result};
use crate::rpc::timed_contract_call;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OracleParameter {
    PriceRatio,
    Overhead,
    L1BaseFee,
}

impl OracleParameter {
    pub fn as_str(&self) -> &'static str {
        match self {
            OracleParameter::PriceRatio => "price_ratio",
            OracleParameter::Overhead => "overhead",
            OracleParameter::L1BaseFee => "l1_base_fee",
        }
    }
}

impl std::fmt::Display for OracleParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterUpdate {
    /// Rate-limited ratio plus the unclamped market ratio
    PriceRatio { ratio: U256, market_ratio: U256 },
    Overhead(U256),
    L1BaseFee(U256),
}

impl ParameterUpdate {
    pub fn parameter(&self) -> OracleParameter {
        match self {
            ParameterUpdate::PriceRatio { .. } => OracleParameter::PriceRatio,
            ParameterUpdate::Overhead(_) => OracleParameter::Overhead,
            ParameterUpdate::L1BaseFee(_) => OracleParameter::L1BaseFee,
        }
    }

    pub fn value(&self) -> U256 {
        match self {
            ParameterUpdate::PriceRatio { ratio, .. } => *ratio,
            ParameterUpdate::Overhead(v) | ParameterUpdate::L1BaseFee(v) => *v,
        }
    }
}

/// Outcome of waiting for an update transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    pub gas_used: Option<U256>,
}

#[async_trait]
pub trait FeeOracle: Send + Sync {
    async fn price_ratio(&self) -> Result<U256>;

    /// Fixed-point decimals of the price ratio (`decimals()` on the fee token oracle).
    async fn price_ratio_decimals(&self) -> Result<u32>;

    async fn overhead(&self) -> Result<U256>;

    async fn l1_base_fee(&self) -> Result<U256>;

    /// Signs and broadcasts exactly one transaction.
    async fn submit(&self, update: ParameterUpdate) -> Result<H256>;

    /// Resolves once `tx_hash` is mined. A status-0 receipt is [`OracleError::Reverted`].
    ///
    /// No timeout is applied here; the controller races this against its own.
    async fn await_confirmation(&self, parameter: OracleParameter, tx_hash: H256) -> Result<Confirmation>;
}

/// [`FeeOracle`] backed by the L2 predeploy and the fee token oracle, signing through `M`.
pub struct EthersFeeOracle<M> {
    client: Arc<M>,
    gas_price_oracle: OvmGasPriceOracle<M>,
    fee_token_oracle: FeeTokenGasPriceOracle<M>,
    gas_price_override: Option<U256>,
    timeout: Duration,
    poll_interval: Duration,
}

impl<M: Middleware + 'static> EthersFeeOracle<M> {
    pub fn new(
        client: Arc<M>,
        gas_price_oracle: Address,
        fee_token_oracle: Address,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            gas_price_oracle: OvmGasPriceOracle::new(gas_price_oracle, Arc::clone(&client)),
            fee_token_oracle: FeeTokenGasPriceOracle::new(fee_token_oracle, Arc::clone(&client)),
            client,
            gas_price_override: None,
            timeout,
            poll_interval,
        }
    }

    /// Sends updates as legacy transactions at a fixed gas price.
    pub fn with_gas_price(mut self, gas_price: Option<U256>) -> Self {
        self.gas_price_override = gas_price;
        self
    }

    async fn send(&self, parameter: OracleParameter, call: ContractCall<M, ()>) -> Result<H256> {
        let call = match self.gas_price_override {
            Some(price) => call.legacy().gas_price(price),
            None => call,
        };

        let sent = tokio::time::timeout(self.timeout, call.send()).await;
        match sent {
            Ok(Ok(pending)) => Ok(*pending),
            Ok(Err(e)) => Err(OracleError::SubmissionFailed {
                parameter: parameter.as_str(),
                reason: describe_contract_error(&e),
            }),
            Err(_) => Err(OracleError::Timeout {
                call: "eth_sendRawTransaction",
                timeout: self.timeout,
            }),
        }
    }
}

/// Prefers the decoded `Error(string)` revert reason over the raw provider message.
fn describe_contract_error<M: Middleware>(err: &ContractError<M>) -> String {
    match err.decode_revert::<String>() {
        Some(reason) => format!("execution reverted: {reason}"),
        None => err.to_string(),
    }
}

#[async_trait]
impl<M: Middleware + 'static> FeeOracle for EthersFeeOracle<M> {
    async fn price_ratio(&self) -> Result<U256> {
        timed_contract_call("priceRatio", self.timeout, self.fee_token_oracle.price_ratio().call()).await
    }

    async fn price_ratio_decimals(&self) -> Result<u32> {
        let decimals = timed_contract_call("decimals", self.timeout, self.fee_token_oracle.decimals().call()).await?;
        if decimals > U256::from(38u8) {
            return Err(OracleError::Contract {
                call: "decimals",
                message: format!("unsupported price ratio decimals {decimals}"),
            });
        }
        Ok(decimals.as_u32())
    }

    async fn overhead(&self) -> Result<U256> {
        timed_contract_call("overhead", self.timeout, self.gas_price_oracle.overhead().call()).await
    }

    async fn l1_base_fee(&self) -> Result<U256> {
        timed_contract_call("l1BaseFee", self.timeout, self.gas_price_oracle.l_1_base_fee().call()).await
    }

    async fn submit(&self, update: ParameterUpdate) -> Result<H256> {
        let parameter = update.parameter();
        let call = match update {
            ParameterUpdate::PriceRatio { ratio, market_ratio } => {
                self.fee_token_oracle.update_price_ratio(ratio, market_ratio)
            }
            ParameterUpdate::Overhead(value) => self.gas_price_oracle.set_overhead(value),
            ParameterUpdate::L1BaseFee(value) => self.gas_price_oracle.set_l1_base_fee(value),
        };
        let tx_hash = self.send(parameter, call).await?;
        debug!("submitted parameter={} tx={:?}", parameter, tx_hash);
        Ok(tx_hash)
    }

    async fn await_confirmation(&self, parameter: OracleParameter, tx_hash: H256) -> Result<Confirmation> {
        let pending = PendingTransaction::new(tx_hash, self.client.provider()).interval(self.poll_interval);
        let receipt = pending
            .await
            .map_err(|e| OracleError::Rpc {
                call: "eth_getTransactionReceipt",
                message: e.to_string(),
            })?
            .ok_or(OracleError::Dropped(tx_hash))?;

        if receipt.status.map_or(false, |s| s.as_u64() == 0) {
            warn!("parameter={} tx={:?} reverted", parameter, tx_hash);
            return Err(OracleError::Reverted {
                parameter: parameter.as_str(),
                tx_hash,
            });
        }

        Ok(Confirmation {
            tx_hash,
            block_number: receipt.block_number.map(|b| b.as_u64()),
            gas_used: receipt.gas_used,
        })
    }
}

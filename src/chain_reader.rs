//! # Chain Reader
//!
//! Read-only access to both ledgers. The control loop only ever sees the
//! [`ChainReader`] and [`BatchLogSource`] traits, so ledgers can be replaced by
//! in-memory doubles in tests.
//!
//! Every call goes through [`crate::rpc::timed_call`], so a slow node turns into a
//! [`crate::error::OracleError::Timeout`] instead of stalling the loop.

use async_trait::async_trait;
use ethers::prelude::*;
use log::debug;
use std::sync::Arc;
use std::time::Duration;

use crate::contracts::{CanonicalTransactionChain, Erc20, SequencerBatchAppendedFilter, StateBatchAppendedFilter, StateCommitmentChain};
use crate::error::{OracleError, Result};
use crate::rpc::{timed_call, timed_contract_call};

/// What the loop needs from a transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptSummary {
    pub tx_hash: H256,
    pub gas_used: U256,
    pub success: bool,
    pub block_number: Option<u64>,
}

impl ReceiptSummary {
    fn from_receipt(receipt: TransactionReceipt) -> Self {
        Self {
            tx_hash: receipt.transaction_hash,
            gas_used: receipt.gas_used.unwrap_or_default(),
            // Pre-byzantium receipts carry no status; treat them as successful
            success: receipt.status.map_or(true, |s| s.as_u64() == 1),
            block_number: receipt.block_number.map(|b| b.as_u64()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    /// `SequencerBatchAppended` on the canonical transaction chain
    TransactionBatch,
    /// `StateBatchAppended` on the state commitment chain
    StateBatch,
}

/// One batch submission event observed on L1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchAppendedEvent {
    pub tx_hash: H256,
    pub block_number: u64,
    pub kind: BatchKind,
    /// Number of L2 elements committed; only state batches carry it
    pub batch_size: U256,
}

#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Short name used in logs ("l1" / "l2").
    fn name(&self) -> &'static str;

    async fn get_balance(&self, account: Address) -> Result<U256>;

    async fn get_block_number(&self) -> Result<u64>;

    async fn get_gas_price(&self) -> Result<U256>;

    /// `None` when the node does not know the transaction (yet).
    async fn get_transaction_receipt(&self, tx_hash: H256) -> Result<Option<ReceiptSummary>>;

    /// ERC-20 `balanceOf(holder)` view.
    async fn token_balance(&self, token: Address, holder: Address) -> Result<U256>;
}

/// Source of batch submission events for the overhead estimate.
#[async_trait]
pub trait BatchLogSource: Send + Sync {
    /// Events in `[from_block, to_block]`, both chains merged, newest block first.
    async fn batch_events(&self, from_block: u64, to_block: u64) -> Result<Vec<BatchAppendedEvent>>;
}

/// [`ChainReader`] over any ethers middleware.
pub struct EthersChainReader<M> {
    name: &'static str,
    client: Arc<M>,
    timeout: Duration,
}

impl<M: Middleware + 'static> EthersChainReader<M> {
    pub fn new(name: &'static str, client: Arc<M>, timeout: Duration) -> Self {
        Self { name, client, timeout }
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainReader for EthersChainReader<M> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn get_balance(&self, account: Address) -> Result<U256> {
        timed_call("eth_getBalance", self.timeout, self.client.get_balance(account, None)).await
    }

    async fn get_block_number(&self) -> Result<u64> {
        let block = timed_call("eth_blockNumber", self.timeout, self.client.get_block_number()).await?;
        Ok(block.as_u64())
    }

    async fn get_gas_price(&self) -> Result<U256> {
        timed_call("eth_gasPrice", self.timeout, self.client.get_gas_price()).await
    }

    async fn get_transaction_receipt(&self, tx_hash: H256) -> Result<Option<ReceiptSummary>> {
        let receipt = timed_call(
            "eth_getTransactionReceipt",
            self.timeout,
            self.client.get_transaction_receipt(tx_hash),
        )
        .await?;
        Ok(receipt.map(ReceiptSummary::from_receipt))
    }

    async fn token_balance(&self, token: Address, holder: Address) -> Result<U256> {
        let erc20 = Erc20::new(token, Arc::clone(&self.client));
        timed_contract_call("balanceOf", self.timeout, erc20.balance_of(holder).call()).await
    }
}

/// [`BatchLogSource`] reading the CTC and SCC on L1.
pub struct EthersBatchLogs<M> {
    ctc: CanonicalTransactionChain<M>,
    scc: StateCommitmentChain<M>,
    timeout: Duration,
}

impl<M: Middleware + 'static> EthersBatchLogs<M> {
    pub fn new(client: Arc<M>, ctc: Address, scc: Address, timeout: Duration) -> Self {
        Self {
            ctc: CanonicalTransactionChain::new(ctc, Arc::clone(&client)),
            scc: StateCommitmentChain::new(scc, client),
            timeout,
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> BatchLogSource for EthersBatchLogs<M> {
    async fn batch_events(&self, from_block: u64, to_block: u64) -> Result<Vec<BatchAppendedEvent>> {
        if from_block > to_block {
            return Err(OracleError::Rpc {
                call: "eth_getLogs",
                message: format!("invalid block range {from_block}..{to_block}"),
            });
        }

        let ctc_query = self
            .ctc
            .event::<SequencerBatchAppendedFilter>()
            .from_block(from_block)
            .to_block(to_block);
        let scc_query = self
            .scc
            .event::<StateBatchAppendedFilter>()
            .from_block(from_block)
            .to_block(to_block);

        let (ctc_logs, scc_logs) = futures::try_join!(
            timed_contract_call("SequencerBatchAppended", self.timeout, ctc_query.query_with_meta()),
            timed_contract_call("StateBatchAppended", self.timeout, scc_query.query_with_meta()),
        )?;

        let mut events: Vec<BatchAppendedEvent> = ctc_logs
            .into_iter()
            .map(|(_, meta)| BatchAppendedEvent {
                tx_hash: meta.transaction_hash,
                block_number: meta.block_number.as_u64(),
                kind: BatchKind::TransactionBatch,
                batch_size: U256::zero(),
            })
            .chain(scc_logs.into_iter().map(|(event, meta)| BatchAppendedEvent {
                tx_hash: meta.transaction_hash,
                block_number: meta.block_number.as_u64(),
                kind: BatchKind::StateBatch,
                batch_size: event.batch_size,
            }))
            .collect();
        events.sort_by(|a, b| b.block_number.cmp(&a.block_number));

        debug!(
            "batch_events from={} to={} count={}",
            from_block,
            to_block,
            events.len()
        );
        Ok(events)
    }
}

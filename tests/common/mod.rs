//! In-memory doubles for the chain, feed, oracle and storage seams.

#![allow(dead_code)]

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fee_oracle::chain_reader::{BatchAppendedEvent, BatchKind, BatchLogSource, ChainReader, ReceiptSummary};
use fee_oracle::error::{OracleError, Result};
use fee_oracle::ledger_state::{LedgerSide, LedgerSnapshot, SnapshotStore};
use fee_oracle::oracle_contract::{Confirmation, FeeOracle, OracleParameter, ParameterUpdate};
use fee_oracle::parameter_controller::{ControllerSettings, ParameterBounds, ParameterController};
use fee_oracle::price_feeds::{PriceFeedReader, PriceSource, RawPrice};
use fee_oracle::reconciliation::ReconciliationEngine;
use fee_oracle::scheduler::{ControlLoop, MonitoredAccounts};
use fee_oracle::shutdown::{self, ShutdownHandle};

pub fn u(v: u64) -> U256 {
    U256::from(v)
}

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

pub fn rpc_down(call: &'static str) -> OracleError {
    OracleError::Rpc {
        call,
        message: "connection refused".to_string(),
    }
}

#[derive(Default)]
pub struct MockChain {
    pub balances: Mutex<HashMap<Address, U256>>,
    pub token_balances: Mutex<HashMap<(Address, Address), U256>>,
    pub block_number: Mutex<u64>,
    pub gas_price: Mutex<U256>,
    pub receipts: Mutex<HashMap<H256, ReceiptSummary>>,
    pub fail_balances: AtomicBool,
}

impl MockChain {
    pub fn set_balance(&self, account: Address, value: U256) {
        self.balances.lock().unwrap().insert(account, value);
    }

    pub fn set_token_balance(&self, token: Address, holder: Address, value: U256) {
        self.token_balances.lock().unwrap().insert((token, holder), value);
    }

    pub fn add_receipt(&self, tx_hash: H256, gas_used: u64) {
        self.receipts.lock().unwrap().insert(
            tx_hash,
            ReceiptSummary {
                tx_hash,
                gas_used: u(gas_used),
                success: true,
                block_number: Some(1),
            },
        );
    }
}

#[async_trait]
impl ChainReader for MockChain {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn get_balance(&self, account: Address) -> Result<U256> {
        if self.fail_balances.load(Ordering::SeqCst) {
            return Err(rpc_down("eth_getBalance"));
        }
        Ok(self.balances.lock().unwrap().get(&account).copied().unwrap_or_default())
    }

    async fn get_block_number(&self) -> Result<u64> {
        Ok(*self.block_number.lock().unwrap())
    }

    async fn get_gas_price(&self) -> Result<U256> {
        Ok(*self.gas_price.lock().unwrap())
    }

    async fn get_transaction_receipt(&self, tx_hash: H256) -> Result<Option<ReceiptSummary>> {
        Ok(self.receipts.lock().unwrap().get(&tx_hash).cloned())
    }

    async fn token_balance(&self, token: Address, holder: Address) -> Result<U256> {
        Ok(self
            .token_balances
            .lock()
            .unwrap()
            .get(&(token, holder))
            .copied()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct MockBatchLogs {
    pub events: Mutex<Vec<BatchAppendedEvent>>,
    pub queried: Mutex<Vec<(u64, u64)>>,
}

impl MockBatchLogs {
    pub fn push(&self, tx_hash: H256, kind: BatchKind, batch_size: u64) {
        self.events.lock().unwrap().push(BatchAppendedEvent {
            tx_hash,
            block_number: 100,
            kind,
            batch_size: u(batch_size),
        });
    }
}

#[async_trait]
impl BatchLogSource for MockBatchLogs {
    async fn batch_events(&self, from_block: u64, to_block: u64) -> Result<Vec<BatchAppendedEvent>> {
        self.queried.lock().unwrap().push((from_block, to_block));
        Ok(self.events.lock().unwrap().clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmBehavior {
    Mined,
    Revert,
    Hang,
}

pub struct MockFeeOracle {
    pub price_ratio: Mutex<U256>,
    pub decimals: u32,
    pub overhead: Mutex<U256>,
    pub l1_base_fee: Mutex<U256>,
    pub submitted: Mutex<Vec<ParameterUpdate>>,
    pub confirm: Mutex<ConfirmBehavior>,
}

impl MockFeeOracle {
    pub fn new(price_ratio: u64, decimals: u32, overhead: u64, l1_base_fee: u64) -> Self {
        Self {
            price_ratio: Mutex::new(u(price_ratio)),
            decimals,
            overhead: Mutex::new(u(overhead)),
            l1_base_fee: Mutex::new(u(l1_base_fee)),
            submitted: Mutex::new(Vec::new()),
            confirm: Mutex::new(ConfirmBehavior::Mined),
        }
    }

    pub fn submitted(&self) -> Vec<ParameterUpdate> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeeOracle for MockFeeOracle {
    async fn price_ratio(&self) -> Result<U256> {
        Ok(*self.price_ratio.lock().unwrap())
    }

    async fn price_ratio_decimals(&self) -> Result<u32> {
        Ok(self.decimals)
    }

    async fn overhead(&self) -> Result<U256> {
        Ok(*self.overhead.lock().unwrap())
    }

    async fn l1_base_fee(&self) -> Result<U256> {
        Ok(*self.l1_base_fee.lock().unwrap())
    }

    async fn submit(&self, update: ParameterUpdate) -> Result<H256> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(update);
        Ok(H256::from_low_u64_be(submitted.len() as u64))
    }

    async fn await_confirmation(&self, parameter: OracleParameter, tx_hash: H256) -> Result<Confirmation> {
        let behavior = *self.confirm.lock().unwrap();
        match behavior {
            ConfirmBehavior::Mined => {
                let last = self.submitted.lock().unwrap().last().copied();
                match last {
                    Some(ParameterUpdate::PriceRatio { ratio, .. }) => *self.price_ratio.lock().unwrap() = ratio,
                    Some(ParameterUpdate::Overhead(v)) => *self.overhead.lock().unwrap() = v,
                    Some(ParameterUpdate::L1BaseFee(v)) => *self.l1_base_fee.lock().unwrap() = v,
                    None => {}
                }
                Ok(Confirmation {
                    tx_hash,
                    block_number: Some(1),
                    gas_used: Some(u(50_000)),
                })
            }
            ConfirmBehavior::Revert => Err(OracleError::Reverted {
                parameter: parameter.as_str(),
                tx_hash,
            }),
            ConfirmBehavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// Price source whose answer can be swapped between ticks.
pub struct StaticPrice {
    pub answer: Mutex<Option<RawPrice>>,
}

impl StaticPrice {
    pub fn new(answer: u64, decimals: u8) -> Arc<Self> {
        Arc::new(Self {
            answer: Mutex::new(Some(RawPrice {
                answer: u(answer),
                decimals,
            })),
        })
    }

    pub fn down() -> Arc<Self> {
        Arc::new(Self {
            answer: Mutex::new(None),
        })
    }
}

#[async_trait]
impl PriceSource for StaticPrice {
    async fn latest_answer(&self) -> Result<RawPrice> {
        self.answer.lock().unwrap().ok_or_else(|| rpc_down("latestAnswer"))
    }
}

/// Forwards to a shared [`StaticPrice`] so tests keep a handle after boxing.
pub struct SharedPrice(pub Arc<StaticPrice>);

#[async_trait]
impl PriceSource for SharedPrice {
    async fn latest_answer(&self) -> Result<RawPrice> {
        self.0.latest_answer().await
    }
}

/// Snapshot store in memory that can be told to fail commits.
#[derive(Default)]
pub struct MemoryStore {
    pub snapshots: Mutex<BTreeMap<LedgerSide, LedgerSnapshot>>,
    pub fail_commits: AtomicBool,
    pub commits: Mutex<usize>,
}

impl SnapshotStore for MemoryStore {
    fn load(&self, side: LedgerSide) -> Result<Option<LedgerSnapshot>> {
        Ok(self.snapshots.lock().unwrap().get(&side).cloned())
    }

    fn commit(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(OracleError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")));
        }
        *self.commits.lock().unwrap() += 1;
        self.snapshots.lock().unwrap().insert(snapshot.side, snapshot.clone());
        Ok(())
    }
}

pub fn accounts() -> MonitoredAccounts {
    MonitoredAccounts {
        sequencer: Address::repeat_byte(0x11),
        proposer: Address::repeat_byte(0x22),
        relayer: Address::repeat_byte(0x33),
        fast_relayer: Address::repeat_byte(0x44),
        sequencer_fee_vault: Address::repeat_byte(0x55),
        secondary_fee_token: Address::repeat_byte(0x66),
        secondary_fee_token_vault: Address::repeat_byte(0x77),
        billing_contract: Address::repeat_byte(0x88),
    }
}

pub fn controller_settings() -> ControllerSettings {
    ControllerSettings {
        price_ratio: ParameterBounds {
            max_delta_fraction: Some(dec("0.2")),
            min_step: U256::one(),
            hard_floor: U256::one(),
            hard_ceiling: u(1_000_000),
        },
        overhead: ParameterBounds {
            max_delta_fraction: Some(dec("0.1")),
            min_step: U256::one(),
            hard_floor: u(2_000),
            hard_ceiling: u(500_000),
        },
        l1_base_fee: ParameterBounds {
            max_delta_fraction: None,
            min_step: U256::one(),
            hard_floor: u(1_000_000_000),
            hard_ceiling: u(500_000_000_000),
        },
        price_ratio_multiplier_100x: 100,
        overhead_ratio_1000x: 1000,
        overhead_window_blocks: 1000,
        confirmation_timeout: Duration::from_secs(5),
    }
}

/// Everything a [`ControlLoop`] talks to, kept around for assertions.
pub struct Harness {
    pub l1: Arc<MockChain>,
    pub l2: Arc<MockChain>,
    pub batch_logs: Arc<MockBatchLogs>,
    pub oracle: Arc<MockFeeOracle>,
    pub native: Arc<StaticPrice>,
    pub secondary: Arc<StaticPrice>,
    pub store: Arc<dyn SnapshotStore>,
    pub settings: ControllerSettings,
    pub shutdown: ShutdownHandle,
}

impl Harness {
    /// A=1.50 USD, B=0.75 USD, price ratio 180 with 2 decimals, base fee in band.
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::default()))
    }

    pub fn with_store(store: Arc<dyn SnapshotStore>) -> Self {
        let (shutdown, _) = shutdown::channel();
        let l1 = Arc::new(MockChain::default());
        *l1.gas_price.lock().unwrap() = u(20_000_000_000);
        *l1.block_number.lock().unwrap() = 5_000;
        Self {
            l1,
            l2: Arc::new(MockChain::default()),
            batch_logs: Arc::new(MockBatchLogs::default()),
            oracle: Arc::new(MockFeeOracle::new(180, 2, 2_500, 20_000_000_000)),
            native: StaticPrice::new(150_000_000, 8),
            secondary: StaticPrice::new(750_000, 6),
            store,
            settings: controller_settings(),
            shutdown,
        }
    }

    pub fn control_loop(&self, polling_interval: Duration) -> ControlLoop {
        let signal = self.shutdown.subscribe();
        let controller = ParameterController::new(
            self.oracle.clone(),
            self.l1.clone(),
            self.batch_logs.clone(),
            self.settings.clone(),
            signal.clone(),
        );
        ControlLoop::new(
            PriceFeedReader::new(
                Box::new(SharedPrice(self.native.clone())),
                Box::new(SharedPrice(self.secondary.clone())),
            ),
            self.l1.clone(),
            self.l2.clone(),
            ReconciliationEngine::new(self.store.clone()),
            controller,
            accounts(),
            polling_interval,
            signal,
        )
    }
}

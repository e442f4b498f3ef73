use config::{Config, ConfigError, File, FileFormat};
use ethers::types::{Address, U256};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::parameter_controller::ParameterBounds;
use crate::price_feeds::MAX_FEED_DECIMALS;

#[derive(Debug, Deserialize, Clone)]
pub struct Rpc {
    pub l1_http_url: String,
    pub l2_http_url: String,
    /// Upper bound for any single read or send call
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Receipt polling interval while waiting for a parameter update to land
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Rpc {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Names looked up in `Lib_AddressManager` at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct RegistryNames {
    #[serde(default = "default_ctc_name")]
    pub canonical_transaction_chain: String,
    #[serde(default = "default_scc_name")]
    pub state_commitment_chain: String,
    #[serde(default = "default_fee_token_oracle_name")]
    pub fee_token_gas_price_oracle: String,
    #[serde(default = "default_secondary_fee_token_name")]
    pub secondary_fee_token: String,
    #[serde(default = "default_billing_contract_name")]
    pub billing_contract: String,
}

fn default_ctc_name() -> String {
    "CanonicalTransactionChain".to_string()
}
fn default_scc_name() -> String {
    "StateCommitmentChain".to_string()
}
fn default_fee_token_oracle_name() -> String {
    "Proxy__Boba_GasPriceOracle".to_string()
}
fn default_secondary_fee_token_name() -> String {
    "L2_L1NativeToken".to_string()
}
fn default_billing_contract_name() -> String {
    "Proxy__BobaBillingContract".to_string()
}

impl Default for RegistryNames {
    fn default() -> Self {
        Self {
            canonical_transaction_chain: default_ctc_name(),
            state_commitment_chain: default_scc_name(),
            fee_token_gas_price_oracle: default_fee_token_oracle_name(),
            secondary_fee_token: default_secondary_fee_token_name(),
            billing_contract: default_billing_contract_name(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Contracts {
    /// `Lib_AddressManager` on L1
    pub address_manager: String,
    #[serde(default = "default_gas_price_oracle")]
    pub gas_price_oracle: String,
    #[serde(default = "default_sequencer_fee_vault")]
    pub sequencer_fee_vault: String,
    #[serde(default)]
    pub registry: RegistryNames,
}

// L2 predeploys
fn default_gas_price_oracle() -> String {
    "0x420000000000000000000000000000000000000F".to_string()
}
fn default_sequencer_fee_vault() -> String {
    "0x4200000000000000000000000000000000000011".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct Accounts {
    pub sequencer: String,
    pub proposer: String,
    pub relayer: String,
    pub fast_relayer: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    /// `latestAnswer()` + `decimals()` (FluxAggregator / Chainlink style)
    Aggregator,
    /// `lastPrice()` with fixed decimals from configuration
    LastPrice,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedSettings {
    pub rpc_url: String,
    pub address: String,
    pub kind: FeedKind,
    /// Required for `last_price` feeds, ignored otherwise
    #[serde(default)]
    pub decimals: Option<u8>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PriceFeeds {
    /// Native fee token priced in USD (pair A)
    pub native: FeedSettings,
    /// Secondary fee token priced in USD (pair B)
    pub secondary: FeedSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Oracle {
    #[serde(default = "default_polling_interval_seconds")]
    pub polling_interval_seconds: u64,

    /// 100 means the target ratio equals the market ratio
    #[serde(default = "default_price_ratio_multiplier_100x")]
    pub price_ratio_multiplier_100x: u64,
    #[serde(default = "default_price_ratio_max_percent_change")]
    pub price_ratio_max_percent_change: Decimal,
    #[serde(default = "default_one")]
    pub price_ratio_min_step: u64,
    #[serde(default = "default_one")]
    pub min_price_ratio: u64,
    #[serde(default = "default_max_price_ratio")]
    pub max_price_ratio: u64,

    /// 1000 means the target overhead equals the observed per-item cost
    #[serde(default = "default_overhead_ratio_1000x")]
    pub overhead_ratio_1000x: u64,
    #[serde(default = "default_overhead_max_percent_change")]
    pub overhead_max_percent_change: Decimal,
    #[serde(default = "default_one")]
    pub overhead_min_step: u64,
    #[serde(default = "default_min_overhead")]
    pub min_overhead: u64,
    #[serde(default = "default_max_overhead")]
    pub max_overhead: u64,
    #[serde(default = "default_overhead_window_blocks")]
    pub overhead_window_blocks: u64,

    #[serde(default = "default_min_l1_base_fee")]
    pub min_l1_base_fee: u64,
    #[serde(default = "default_max_l1_base_fee")]
    pub max_l1_base_fee: u64,

    #[serde(default = "default_confirmation_timeout_seconds")]
    pub confirmation_timeout_seconds: u64,
    /// Legacy gas price used for update transactions (0 on fee-exempt L2 owners)
    #[serde(default)]
    pub update_gas_price_wei: Option<u64>,
}

fn default_polling_interval_seconds() -> u64 {
    60
}
fn default_price_ratio_multiplier_100x() -> u64 {
    100
}
fn default_price_ratio_max_percent_change() -> Decimal {
    Decimal::new(5, 2) // 5%
}
fn default_one() -> u64 {
    1
}
fn default_max_price_ratio() -> u64 {
    1_000_000_000
}
fn default_overhead_ratio_1000x() -> u64 {
    1000
}
fn default_overhead_max_percent_change() -> Decimal {
    Decimal::new(10, 2) // 10%
}
fn default_min_overhead() -> u64 {
    2_000
}
fn default_max_overhead() -> u64 {
    500_000
}
fn default_overhead_window_blocks() -> u64 {
    1_000
}
fn default_min_l1_base_fee() -> u64 {
    1_000_000_000 // 1 gwei
}
fn default_max_l1_base_fee() -> u64 {
    500_000_000_000 // 500 gwei
}
fn default_confirmation_timeout_seconds() -> u64 {
    120
}

impl Oracle {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_seconds)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_seconds)
    }

    pub fn price_ratio_bounds(&self) -> ParameterBounds {
        ParameterBounds {
            max_delta_fraction: Some(self.price_ratio_max_percent_change),
            min_step: U256::from(self.price_ratio_min_step),
            hard_floor: U256::from(self.min_price_ratio),
            hard_ceiling: U256::from(self.max_price_ratio),
        }
    }

    pub fn overhead_bounds(&self) -> ParameterBounds {
        ParameterBounds {
            max_delta_fraction: Some(self.overhead_max_percent_change),
            min_step: U256::from(self.overhead_min_step),
            hard_floor: U256::from(self.min_overhead),
            hard_ceiling: U256::from(self.max_overhead),
        }
    }

    /// The base fee band is inclusive and has no rate limit.
    pub fn l1_base_fee_bounds(&self) -> ParameterBounds {
        ParameterBounds {
            max_delta_fraction: None,
            min_step: U256::one(),
            hard_floor: U256::from(self.min_l1_base_fee),
            hard_ceiling: U256::from(self.max_l1_base_fee),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct State {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String {
    "data".to_string()
}

impl Default for State {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl State {
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Signer {
    /// Name of the env var holding the oracle owner's private key
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
}

fn default_private_key_env() -> String {
    "ORACLE_OWNER_PRIVATE_KEY".to_string()
}

impl Default for Signer {
    fn default() -> Self {
        Self {
            private_key_env: default_private_key_env(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Metrics {
    /// e.g. "0.0.0.0:9100"; only used with the `observability` feature
    #[serde(default)]
    pub listen_addr: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub rpc: Rpc,
    pub contracts: Contracts,
    pub accounts: Accounts,
    pub price_feeds: PriceFeeds,
    pub oracle: Oracle,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub signer: Signer,
    #[serde(default)]
    pub metrics: Metrics,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_path("Config.toml")
    }

    pub fn from_path(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .build()?;
        Self::finish(s.try_deserialize()?)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?;
        Self::finish(s.try_deserialize()?)
    }

    fn finish(mut settings: Self) -> Result<Self, ConfigError> {
        apply_env_overrides(&mut settings);
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let o = &self.oracle;
        check_fraction("oracle.price_ratio_max_percent_change", o.price_ratio_max_percent_change)?;
        check_fraction("oracle.overhead_max_percent_change", o.overhead_max_percent_change)?;
        check_range("oracle.min_price_ratio", o.min_price_ratio, "oracle.max_price_ratio", o.max_price_ratio)?;
        check_range("oracle.min_overhead", o.min_overhead, "oracle.max_overhead", o.max_overhead)?;
        check_range("oracle.min_l1_base_fee", o.min_l1_base_fee, "oracle.max_l1_base_fee", o.max_l1_base_fee)?;

        if o.polling_interval_seconds == 0 {
            return Err(ConfigError::Message("oracle.polling_interval_seconds must be > 0".into()));
        }
        if o.price_ratio_multiplier_100x == 0 || o.overhead_ratio_1000x == 0 {
            return Err(ConfigError::Message("oracle ratio multipliers must be > 0".into()));
        }
        if o.overhead_window_blocks == 0 {
            return Err(ConfigError::Message("oracle.overhead_window_blocks must be > 0".into()));
        }
        let missing_decimals = |feed: &FeedSettings| feed.kind == FeedKind::LastPrice && feed.decimals.is_none();
        if missing_decimals(&self.price_feeds.native) || missing_decimals(&self.price_feeds.secondary) {
            return Err(ConfigError::Message("last_price feeds require `decimals`".into()));
        }
        let feeds = [
            ("price_feeds.native", &self.price_feeds.native),
            ("price_feeds.secondary", &self.price_feeds.secondary),
        ];
        for (key, feed) in feeds {
            if feed.decimals.map_or(false, |d| d > MAX_FEED_DECIMALS) {
                return Err(ConfigError::Message(format!(
                    "{key}.decimals must be at most {MAX_FEED_DECIMALS}"
                )));
            }
        }

        for (key, value) in self.address_fields() {
            parse_address(key, value)?;
        }
        Ok(())
    }

    fn address_fields(&self) -> [(&'static str, &str); 9] {
        [
            ("contracts.address_manager", self.contracts.address_manager.as_str()),
            ("contracts.gas_price_oracle", self.contracts.gas_price_oracle.as_str()),
            ("contracts.sequencer_fee_vault", self.contracts.sequencer_fee_vault.as_str()),
            ("accounts.sequencer", self.accounts.sequencer.as_str()),
            ("accounts.proposer", self.accounts.proposer.as_str()),
            ("accounts.relayer", self.accounts.relayer.as_str()),
            ("accounts.fast_relayer", self.accounts.fast_relayer.as_str()),
            ("price_feeds.native.address", self.price_feeds.native.address.as_str()),
            ("price_feeds.secondary.address", self.price_feeds.secondary.address.as_str()),
        ]
    }
}

/// Parses a configured address, naming the offending key on failure.
pub fn parse_address(key: &str, value: &str) -> Result<Address, ConfigError> {
    Address::from_str(value.trim())
        .map_err(|e| ConfigError::Message(format!("{key}: invalid address `{value}`: {e}")))
}

fn check_fraction(key: &str, value: Decimal) -> Result<(), ConfigError> {
    if value <= Decimal::ZERO || value >= Decimal::ONE {
        return Err(ConfigError::Message(format!(
            "{key} must be a fraction in (0, 1), got {value}"
        )));
    }
    Ok(())
}

fn check_range(min_key: &str, min: u64, max_key: &str, max: u64) -> Result<(), ConfigError> {
    if min > max {
        return Err(ConfigError::Message(format!(
            "{min_key} ({min}) must not exceed {max_key} ({max})"
        )));
    }
    Ok(())
}

fn apply_env_overrides(settings: &mut Settings) {
    if let Some(url) = non_empty_env("ORACLE_L1_RPC_URL") {
        settings.rpc.l1_http_url = url;
    }
    if let Some(url) = non_empty_env("ORACLE_L2_RPC_URL") {
        settings.rpc.l2_http_url = url;
    }
    if let Some(dir) = non_empty_env("ORACLE_DATA_DIR") {
        settings.state.data_dir = dir;
    }
    if let Some(raw) = non_empty_env("ORACLE_POLLING_INTERVAL_SECONDS") {
        match raw.parse::<u64>() {
            Ok(secs) => settings.oracle.polling_interval_seconds = secs,
            Err(e) => log::warn!("Ignoring ORACLE_POLLING_INTERVAL_SECONDS={raw}: {e}"),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

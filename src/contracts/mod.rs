// Contracts Module - ABIs used by the oracle

pub mod canonical_transaction_chain;
pub mod erc20;
pub mod fee_token_gas_price_oracle;
pub mod flux_aggregator;
pub mod last_price_feed;
pub mod lib_address_manager;
pub mod ovm_gas_price_oracle;
pub mod state_commitment_chain;

// Public exports
pub use canonical_transaction_chain::{CanonicalTransactionChain, SequencerBatchAppendedFilter};
pub use erc20::Erc20;
pub use fee_token_gas_price_oracle::FeeTokenGasPriceOracle;
pub use flux_aggregator::FluxAggregator;
pub use last_price_feed::LastPriceFeed;
pub use lib_address_manager::LibAddressManager;
pub use ovm_gas_price_oracle::OvmGasPriceOracle;
pub use state_commitment_chain::{StateBatchAppendedFilter, StateCommitmentChain};

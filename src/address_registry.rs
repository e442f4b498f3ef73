// src/address_registry.rs

use async_trait::async_trait;
use ethers::prelude::{Address, Middleware};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::contracts::LibAddressManager;
use crate::error::{OracleError, Result};
use crate::rpc::timed_contract_call;
use crate::settings::RegistryNames;

// Delays of 500ms, 1s, 2s, 4s before jitter
const RESOLVE_BACKOFF_BASE: u64 = 2;
const RESOLVE_BACKOFF_FACTOR_MS: u64 = 250;
const RESOLVE_MAX_DELAY: Duration = Duration::from_secs(10);
const RESOLVE_MAX_ATTEMPTS: usize = 5;

/// Name → address lookup (`Lib_AddressManager.getAddress`).
#[async_trait]
pub trait AddressRegistry: Send + Sync {
    async fn get_address(&self, name: &str) -> Result<Address>;
}

pub struct EthersAddressRegistry<M> {
    manager: LibAddressManager<M>,
    timeout: Duration,
}

impl<M: Middleware + 'static> EthersAddressRegistry<M> {
    pub fn new(address_manager: Address, client: Arc<M>, timeout: Duration) -> Self {
        Self {
            manager: LibAddressManager::new(address_manager, client),
            timeout,
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> AddressRegistry for EthersAddressRegistry<M> {
    async fn get_address(&self, name: &str) -> Result<Address> {
        timed_contract_call("getAddress", self.timeout, self.manager.get_address(name.to_string()).call()).await
    }
}

/// Addresses looked up once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedContracts {
    pub canonical_transaction_chain: Address,
    pub state_commitment_chain: Address,
    pub fee_token_gas_price_oracle: Address,
    pub secondary_fee_token: Address,
    pub billing_contract: Address,
}

/// Resolves one name with jittered exponential backoff.
///
/// Transport errors are retried; a zero address means the name is not registered
/// and is returned immediately as [`OracleError::UnresolvedAddress`].
pub async fn resolve<R: AddressRegistry + ?Sized>(registry: &R, name: &str) -> Result<Address> {
    let strategy = ExponentialBackoff::from_millis(RESOLVE_BACKOFF_BASE)
        .factor(RESOLVE_BACKOFF_FACTOR_MS)
        .max_delay(RESOLVE_MAX_DELAY)
        .map(jitter)
        .take(RESOLVE_MAX_ATTEMPTS - 1);

    let address = Retry::spawn(strategy, || async move {
        registry.get_address(name).await.map_err(|e| {
            warn!("registry lookup name={} failed: {}", name, e);
            e
        })
    })
    .await?;

    if address == Address::zero() {
        return Err(OracleError::UnresolvedAddress(name.to_string()));
    }
    info!("registry name={} address={:?}", name, address);
    Ok(address)
}

pub async fn resolve_all<R: AddressRegistry + ?Sized>(registry: &R, names: &RegistryNames) -> Result<ResolvedContracts> {
    Ok(ResolvedContracts {
        canonical_transaction_chain: resolve(registry, &names.canonical_transaction_chain).await?,
        state_commitment_chain: resolve(registry, &names.state_commitment_chain).await?,
        fee_token_gas_price_oracle: resolve(registry, &names.fee_token_gas_price_oracle).await?,
        secondary_fee_token: resolve(registry, &names.secondary_fee_token).await?,
        billing_contract: resolve(registry, &names.billing_contract).await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyRegistry {
        entries: HashMap<String, Address>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl AddressRegistry for FlakyRegistry {
        async fn get_address(&self, name: &str) -> Result<Address> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(OracleError::Rpc {
                    call: "getAddress",
                    message: "connection reset".to_string(),
                });
            }
            Ok(self.entries.get(name).copied().unwrap_or_else(Address::zero))
        }
    }

    fn registry(failures: usize) -> FlakyRegistry {
        let names = RegistryNames::default();
        let entries = [
            (names.canonical_transaction_chain, Address::repeat_byte(1)),
            (names.state_commitment_chain, Address::repeat_byte(2)),
            (names.fee_token_gas_price_oracle, Address::repeat_byte(3)),
            (names.secondary_fee_token, Address::repeat_byte(4)),
            (names.billing_contract, Address::repeat_byte(5)),
        ]
        .into_iter()
        .collect();
        FlakyRegistry {
            entries,
            failures_left: AtomicUsize::new(failures),
        }
    }

    #[tokio::test]
    async fn test_resolve_all_retries_transient_failures() {
        let registry = registry(2);
        let resolved = resolve_all(&registry, &RegistryNames::default()).await.unwrap();
        assert_eq!(resolved.state_commitment_chain, Address::repeat_byte(2));
        assert_eq!(resolved.billing_contract, Address::repeat_byte(5));
    }

    #[tokio::test]
    async fn test_resolve_rejects_unregistered_name() {
        let registry = registry(0);
        let err = resolve(&registry, "Proxy__Missing").await.unwrap_err();
        assert!(matches!(err, OracleError::UnresolvedAddress(name) if name == "Proxy__Missing"));
    }
}

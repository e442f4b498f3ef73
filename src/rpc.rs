// src/rpc.rs

use crate::error::{OracleError, Result};
use crate::metrics;
use ethers::prelude::{Http, Provider};
use log::debug;
use std::future::Future;
use std::time::{Duration, Instant};

/// Builds an HTTP provider for `url`, polling at `poll_interval` for pending transactions.
pub fn http_provider(url: &str, poll_interval: Duration) -> Result<Provider<Http>> {
    let provider = Provider::<Http>::try_from(url).map_err(|e| OracleError::Rpc {
        call: "connect",
        message: format!("{url}: {e}"),
    })?;
    Ok(provider.interval(poll_interval))
}

/// Runs one RPC future under `timeout`, recording latency and outcome.
///
/// A timed-out call is reported as [`OracleError::Timeout`]; the caller treats it as a
/// failed step and the next tick retries it.
pub async fn timed_call<T, E, F>(call: &'static str, timeout: Duration, fut: F) -> Result<T>
where
    E: std::fmt::Display,
    F: Future<Output = std::result::Result<T, E>>,
{
    let start = Instant::now();
    let outcome = tokio::time::timeout(timeout, fut).await;
    let duration = start.elapsed();

    let result = match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(OracleError::Rpc {
            call,
            message: e.to_string(),
        }),
        Err(_) => Err(OracleError::Timeout { call, timeout }),
    };

    metrics::record_rpc_call(call, result.is_ok(), duration);
    debug!("[RPC_TRACE] {} -> ok={} duration={:?}", call, result.is_ok(), duration);
    result
}

/// Same as [`timed_call`] but reports failures as contract-call errors.
pub async fn timed_contract_call<T, E, F>(call: &'static str, timeout: Duration, fut: F) -> Result<T>
where
    E: std::fmt::Display,
    F: Future<Output = std::result::Result<T, E>>,
{
    match timed_call(call, timeout, fut).await {
        Err(OracleError::Rpc { call, message }) => Err(OracleError::Contract { call, message }),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timed_call_passes_value_through() {
        let value = timed_call("eth_blockNumber", Duration::from_millis(50), async {
            Ok::<_, std::io::Error>(7u64)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_timed_call_maps_timeout() {
        let err = timed_call("eth_getBalance", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<u64, std::io::Error>(1)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, OracleError::Timeout { call: "eth_getBalance", .. }));
    }

    #[tokio::test]
    async fn test_timed_contract_call_maps_errors() {
        let err = timed_contract_call("overhead", Duration::from_millis(50), async {
            Err::<u64, _>(std::io::Error::new(std::io::ErrorKind::Other, "execution reverted"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, OracleError::Contract { call: "overhead", .. }));
    }

    #[test]
    fn test_http_provider_rejects_bad_url() {
        assert!(http_provider("not a url", Duration::from_millis(100)).is_err());
    }
}

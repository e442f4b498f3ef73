// src/price_feeds.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::prelude::{Address, Middleware};
use ethers::types::{I256, U256};
use log::{info, warn};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::contracts::{FluxAggregator, LastPriceFeed};
use crate::error::{OracleError, Result};
use crate::metrics;
use crate::rpc::timed_contract_call;
use crate::types::conversions::{truncate_to_cents, u256_to_decimal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PricePair {
    /// Native fee token / USD (price A)
    NativeUsd,
    /// Secondary fee token / USD (price B)
    SecondaryUsd,
}

impl PricePair {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricePair::NativeUsd => "native_usd",
            PricePair::SecondaryUsd => "secondary_usd",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceObservation {
    pub pair: PricePair,
    pub value: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// Latest known-good price per pair. A failed fetch never clears an entry.
#[derive(Debug, Clone, Default)]
pub struct PriceBook {
    native: Option<PriceObservation>,
    secondary: Option<PriceObservation>,
}

impl PriceBook {
    pub fn get(&self, pair: PricePair) -> Option<&PriceObservation> {
        match pair {
            PricePair::NativeUsd => self.native.as_ref(),
            PricePair::SecondaryUsd => self.secondary.as_ref(),
        }
    }

    pub fn value(&self, pair: PricePair) -> Option<Decimal> {
        self.get(pair).map(|o| o.value)
    }

    pub fn record(&mut self, observation: PriceObservation) {
        let slot = match observation.pair {
            PricePair::NativeUsd => &mut self.native,
            PricePair::SecondaryUsd => &mut self.secondary,
        };
        *slot = Some(observation);
    }
}

/// Raw fixed-point answer as reported by a feed contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPrice {
    pub answer: U256,
    pub decimals: u8,
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn latest_answer(&self) -> Result<RawPrice>;
}

/// FluxAggregator / Chainlink style feed: `latestAnswer()` scaled by `decimals()`.
pub struct AggregatorFeed<M> {
    aggregator: FluxAggregator<M>,
    // decimals never change for a deployed aggregator
    decimals: OnceCell<u8>,
    timeout: Duration,
}

impl<M: Middleware + 'static> AggregatorFeed<M> {
    pub fn new(address: Address, client: Arc<M>, timeout: Duration) -> Self {
        Self {
            aggregator: FluxAggregator::new(address, client),
            decimals: OnceCell::new(),
            timeout,
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> PriceSource for AggregatorFeed<M> {
    async fn latest_answer(&self) -> Result<RawPrice> {
        let decimals = *self
            .decimals
            .get_or_try_init(|| async {
                let call = self.aggregator.decimals();
                timed_contract_call("decimals", self.timeout, call.call()).await
            })
            .await?;
        let answer = timed_contract_call("latestAnswer", self.timeout, self.aggregator.latest_answer().call()).await?;
        Ok(RawPrice {
            answer: positive_answer(answer)?,
            decimals,
        })
    }
}

/// Aggregators report `int256`; anything not strictly positive is not a price.
fn positive_answer(answer: I256) -> Result<U256> {
    if answer <= I256::zero() {
        return Err(OracleError::Contract {
            call: "latestAnswer",
            message: format!("non-positive answer {answer}"),
        });
    }
    Ok(answer.into_raw())
}

/// `lastPrice()` feed; it exposes no decimals, so they come from configuration.
pub struct LastPriceSource<M> {
    feed: LastPriceFeed<M>,
    decimals: u8,
    timeout: Duration,
}

impl<M: Middleware + 'static> LastPriceSource<M> {
    pub fn new(address: Address, client: Arc<M>, decimals: u8, timeout: Duration) -> Self {
        Self {
            feed: LastPriceFeed::new(address, client),
            decimals,
            timeout,
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> PriceSource for LastPriceSource<M> {
    async fn latest_answer(&self) -> Result<RawPrice> {
        let answer = timed_contract_call("lastPrice", self.timeout, self.feed.last_price().call()).await?;
        Ok(RawPrice {
            answer,
            decimals: self.decimals,
        })
    }
}

/// Largest `decimals` a configured feed may declare.
pub const MAX_FEED_DECIMALS: u8 = 36;

/// Scales a raw answer and keeps two decimal places.
pub fn normalize(raw: RawPrice) -> Result<Decimal> {
    let value = u256_to_decimal(raw.answer, raw.decimals)?;
    Ok(truncate_to_cents(value))
}

/// Refreshes both USD prices into a [`PriceBook`].
pub struct PriceFeedReader {
    native: Box<dyn PriceSource>,
    secondary: Box<dyn PriceSource>,
    book: PriceBook,
}

impl PriceFeedReader {
    pub fn new(native: Box<dyn PriceSource>, secondary: Box<dyn PriceSource>) -> Self {
        Self {
            native,
            secondary,
            book: PriceBook::default(),
        }
    }

    pub fn book(&self) -> &PriceBook {
        &self.book
    }

    /// Fetches both pairs concurrently and records whichever succeeded.
    ///
    /// Returns the first failure after recording the successes, so a stale pair keeps
    /// its previous value while the other one still moves.
    pub async fn refresh(&mut self) -> Result<()> {
        let (native, secondary) = futures::join!(self.native.latest_answer(), self.secondary.latest_answer());
        let now = Utc::now();

        let mut first_error = None;
        for (pair, fetched) in [(PricePair::NativeUsd, native), (PricePair::SecondaryUsd, secondary)] {
            match fetched.and_then(normalize) {
                Ok(value) => {
                    metrics::set_price(pair.as_str(), value.to_f64().unwrap_or(f64::NAN));
                    self.book.record(PriceObservation {
                        pair,
                        value,
                        observed_at: now,
                    });
                }
                Err(e) => {
                    match self.book.get(pair) {
                        Some(stale) => warn!(
                            "price pair={} fetch failed, keeping value={} from {}: {}",
                            pair.as_str(),
                            stale.value,
                            stale.observed_at,
                            e
                        ),
                        None => warn!("price pair={} fetch failed and no prior value: {}", pair.as_str(), e),
                    }
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(
            "prices native_usd={} secondary_usd={}",
            fmt_price(self.book.value(PricePair::NativeUsd)),
            fmt_price(self.book.value(PricePair::SecondaryUsd))
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn fmt_price(value: Option<Decimal>) -> String {
    value.map_or_else(|| "unknown".to_string(), |v| v.to_string())
}

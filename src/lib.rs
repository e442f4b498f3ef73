//! # Fee Oracle
//!
//! A long-running reconciliation service for a two-layer rollup. It watches what the
//! L1 submitter wallets spend and what the L2 fee vaults collect, keeps durable
//! running totals of both, and nudges the L2 fee parameters so fees track costs.
//!
//! ## Overview
//!
//! Every tick the service:
//!
//! - **Prices**: reads the native and secondary fee token USD prices
//! - **Reconciles**: folds L1 and L2 balance movements into monotonic counters and
//!   commits them to disk
//! - **Controls**: recomputes the price ratio, the batch overhead and the L1 base fee
//!   and writes whichever moved, within dead-band and rate limits
//!
//! ## Architecture
//!
//! ### Observation Layer
//! [`chain_reader`] and [`price_feeds`] read both ledgers and the price feeds behind
//! traits, so the loop can run against in-memory doubles.
//!
//! ### State Layer
//! [`ledger_state`] owns the snapshot format; [`reconciliation`] is the only code that
//! advances it; [`billing`] derives totals for reporting.
//!
//! ### Control Layer
//! [`parameter_controller`] decides and applies parameter updates through the
//! [`oracle_contract::FeeOracle`] write seam; [`scheduler`] sequences everything.

// Observation Layer
/// L1/L2 read traits and their ethers adapters
pub mod chain_reader;
/// USD price feeds with last-known-good fallback
pub mod price_feeds;
/// Startup lookup of contract addresses by name
pub mod address_registry;

// State Layer
/// Persisted counters and the snapshot file format
pub mod ledger_state;
/// Balance-to-counter accounting
pub mod reconciliation;
/// Derived cost and revenue totals
pub mod billing;

// Control Layer
/// Parameter decisions and update submission
pub mod parameter_controller;
/// On-chain fee parameters (read + write)
pub mod oracle_contract;
/// Tick sequencing and service lifecycle
pub mod scheduler;
/// Shutdown signalling
pub mod shutdown;

// Infrastructure
/// RPC helpers: provider construction and timed calls
pub mod rpc;
/// Error types
pub mod error;
/// Prometheus metrics (no-ops without the `observability` feature)
pub mod metrics;
/// Common conversions
pub mod types;

// Contract ABIs
pub mod contracts;

// Configuration
pub mod settings;

pub use error::{OracleError, Result};
pub use scheduler::{ControlLoop, Service};
pub use settings::Settings;

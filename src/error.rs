//! Error taxonomy for the oracle service.
//!
//! Everything a single tick step can hit is represented here so the scheduler can
//! log it and move on. Only startup paths (settings, registry, snapshot loading)
//! turn these into process failures.

use crate::types::conversions::ConversionError;
use ethers::types::H256;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("RPC call `{call}` failed: {message}")]
    Rpc { call: &'static str, message: String },

    #[error("RPC call `{call}` timed out after {timeout:?}")]
    Timeout { call: &'static str, timeout: Duration },

    #[error("Contract call `{call}` failed: {message}")]
    Contract { call: &'static str, message: String },

    #[error("Failed to submit {parameter} update: {reason}")]
    SubmissionFailed { parameter: &'static str, reason: String },

    #[error("{parameter} update {tx_hash:?} reverted")]
    Reverted { parameter: &'static str, tx_hash: H256 },

    #[error("Transaction {0:?} was dropped from the mempool")]
    Dropped(H256),

    #[error("Transaction {tx_hash:?} not confirmed within {timeout:?}")]
    ConfirmationTimeout { tx_hash: H256, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt snapshot {}: {reason}", .path.display())]
    CorruptSnapshot { path: PathBuf, reason: String },

    #[error("Unsupported snapshot version {found} in {} (expected {expected})", .path.display())]
    UnsupportedSnapshotVersion { path: PathBuf, found: u32, expected: u32 },

    #[error("Address registry has no entry for {0}")]
    UnresolvedAddress(String),

    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Shutdown requested")]
    Shutdown,
}

impl OracleError {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            OracleError::Rpc { .. } => "rpc",
            OracleError::Timeout { .. } => "timeout",
            OracleError::Contract { .. } => "contract",
            OracleError::SubmissionFailed { .. } => "submission_failed",
            OracleError::Reverted { .. } => "reverted",
            OracleError::Dropped(_) => "dropped",
            OracleError::ConfirmationTimeout { .. } => "confirmation_timeout",
            OracleError::Io(_) => "io",
            OracleError::Json(_) => "json",
            OracleError::CorruptSnapshot { .. } => "corrupt_snapshot",
            OracleError::UnsupportedSnapshotVersion { .. } => "snapshot_version",
            OracleError::UnresolvedAddress(_) => "unresolved_address",
            OracleError::Conversion(_) => "conversion",
            OracleError::Shutdown => "shutdown",
        }
    }
}

pub type Result<T> = std::result::Result<T, OracleError>;

//! # Persistent Ledger State
//!
//! Running fee and cost counters for both ledgers, persisted as one JSON file per side.
//!
//! ## File format
//!
//! ```json
//! {
//!   "version": 1,
//!   "side": "l1",
//!   "updated_at": "2024-05-01T12:00:00Z",
//!   "counters": {
//!     "sequencer": { "observed_balance": "123", "cumulative": "456" }
//!   },
//!   "checksum": "0x…"
//! }
//! ```
//!
//! Big integers are decimal strings. `checksum` is the keccak256 of the compact JSON
//! encoding of `counters`; a mismatch is reported as a corrupt snapshot and never
//! silently reseeded.
//!
//! Writes go to a temp file in the same directory, are fsynced, then renamed over
//! the previous snapshot.

use chrono::{DateTime, Utc};
use ethers::types::{H256, U256};
use ethers::utils::keccak256;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{OracleError, Result};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerSide {
    L1,
    L2,
}

impl LedgerSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerSide::L1 => "l1",
            LedgerSide::L2 => "l2",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            LedgerSide::L1 => "l1_history.json",
            LedgerSide::L2 => "l2_history.json",
        }
    }

    pub fn counters(&self) -> &'static [CounterId] {
        match self {
            LedgerSide::L1 => &L1_COUNTERS,
            LedgerSide::L2 => &L2_COUNTERS,
        }
    }
}

/// How a counter's balance movement turns into cumulative value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Wallets that pay for L1 submissions; spending shows up as balance decreases.
    Outflow,
    /// Vaults that collect fees; withdrawals reset the balance.
    Inflow,
}

/// Token a counter is denominated in, for USD reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denomination {
    Native,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterId {
    Sequencer,
    Proposer,
    Relayer,
    FastRelayer,
    SequencerFeeVault,
    SecondaryFeeTokenVault,
    BillingContract,
}

const L1_COUNTERS: [CounterId; 4] = [
    CounterId::Sequencer,
    CounterId::Proposer,
    CounterId::Relayer,
    CounterId::FastRelayer,
];

const L2_COUNTERS: [CounterId; 3] = [
    CounterId::SequencerFeeVault,
    CounterId::SecondaryFeeTokenVault,
    CounterId::BillingContract,
];

impl CounterId {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterId::Sequencer => "sequencer",
            CounterId::Proposer => "proposer",
            CounterId::Relayer => "relayer",
            CounterId::FastRelayer => "fast_relayer",
            CounterId::SequencerFeeVault => "sequencer_fee_vault",
            CounterId::SecondaryFeeTokenVault => "secondary_fee_token_vault",
            CounterId::BillingContract => "billing_contract",
        }
    }

    pub fn side(&self) -> LedgerSide {
        match self {
            CounterId::Sequencer | CounterId::Proposer | CounterId::Relayer | CounterId::FastRelayer => LedgerSide::L1,
            _ => LedgerSide::L2,
        }
    }

    pub fn flow(&self) -> Flow {
        match self.side() {
            LedgerSide::L1 => Flow::Outflow,
            LedgerSide::L2 => Flow::Inflow,
        }
    }

    pub fn denomination(&self) -> Denomination {
        match self {
            CounterId::SequencerFeeVault | CounterId::BillingContract => Denomination::Native,
            _ => Denomination::Secondary,
        }
    }
}

/// Persisted state of one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    #[serde(with = "u256_decimal")]
    pub observed_balance: U256,
    #[serde(with = "u256_decimal")]
    pub cumulative: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub side: LedgerSide,
    pub counters: BTreeMap<CounterId, CounterSnapshot>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerSnapshot {
    pub fn empty(side: LedgerSide) -> Self {
        Self {
            side,
            counters: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn get(&self, id: CounterId) -> Option<&CounterSnapshot> {
        self.counters.get(&id)
    }

    pub fn cumulative(&self, id: CounterId) -> U256 {
        self.get(id).map(|c| c.cumulative).unwrap_or_default()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    side: LedgerSide,
    updated_at: DateTime<Utc>,
    counters: BTreeMap<CounterId, CounterSnapshot>,
    checksum: String,
}

fn checksum(counters: &BTreeMap<CounterId, CounterSnapshot>) -> Result<String> {
    let canonical = serde_json::to_vec(counters)?;
    Ok(format!("{:?}", H256::from(keccak256(canonical))))
}

mod u256_decimal {
    use ethers::types::U256;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        U256::from_dec_str(&raw).map_err(|e| D::Error::custom(format!("invalid integer `{raw}`: {e}")))
    }
}

/// Durable storage for ledger snapshots.
pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` when nothing has been committed yet for `side`.
    fn load(&self, side: LedgerSide) -> Result<Option<LedgerSnapshot>>;

    /// Replaces the committed snapshot. On error the previous one is still intact.
    fn commit(&self, snapshot: &LedgerSnapshot) -> Result<()>;
}

pub struct FileSnapshotStore {
    data_dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn path(&self, side: LedgerSide) -> PathBuf {
        self.data_dir.join(side.file_name())
    }

    fn corrupt(path: &Path, reason: impl Into<String>) -> OracleError {
        OracleError::CorruptSnapshot {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self, side: LedgerSide) -> Result<Option<LedgerSnapshot>> {
        let path = self.path(side);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Version first, so files from a newer format are reported as such
        let value: serde_json::Value =
            serde_json::from_slice(&raw).map_err(|e| Self::corrupt(&path, e.to_string()))?;
        let found = value
            .get("version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Self::corrupt(&path, "missing version"))?;
        if found != u64::from(SNAPSHOT_VERSION) {
            return Err(OracleError::UnsupportedSnapshotVersion {
                path,
                found: u32::try_from(found).unwrap_or(u32::MAX),
                expected: SNAPSHOT_VERSION,
            });
        }

        let file: SnapshotFile = serde_json::from_value(value).map_err(|e| Self::corrupt(&path, e.to_string()))?;
        if file.side != side {
            return Err(Self::corrupt(&path, format!("expected side {}, found {}", side.as_str(), file.side.as_str())));
        }
        if let Some(stray) = file.counters.keys().find(|id| id.side() != side) {
            return Err(Self::corrupt(&path, format!("counter {} does not belong here", stray.as_str())));
        }
        if checksum(&file.counters)? != file.checksum {
            return Err(Self::corrupt(&path, "checksum mismatch"));
        }

        debug!("loaded snapshot side={} counters={}", side.as_str(), file.counters.len());
        Ok(Some(LedgerSnapshot {
            side,
            counters: file.counters,
            updated_at: file.updated_at,
        }))
    }

    fn commit(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;

        let file = SnapshotFile {
            version: SNAPSHOT_VERSION,
            side: snapshot.side,
            updated_at: snapshot.updated_at,
            checksum: checksum(&snapshot.counters)?,
            counters: snapshot.counters.clone(),
        };
        let encoded = serde_json::to_vec_pretty(&file)?;

        let path = self.path(snapshot.side);
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(&encoded)?;
            tmp.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        // Persist the rename itself
        #[cfg(unix)]
        fs::File::open(&self.data_dir)?.sync_all()?;

        debug!("committed snapshot side={} path={}", snapshot.side.as_str(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> LedgerSnapshot {
        let mut snapshot = LedgerSnapshot::empty(LedgerSide::L2);
        snapshot.counters.insert(
            CounterId::SequencerFeeVault,
            CounterSnapshot {
                observed_balance: U256::from(10u64),
                // larger than u128 to exercise the string encoding
                cumulative: U256::MAX - U256::from(1u64),
            },
        );
        snapshot
    }

    #[test]
    fn test_commit_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        let committed = snapshot();

        store.commit(&committed).unwrap();
        let loaded = store.load(LedgerSide::L2).unwrap().unwrap();
        assert_eq!(loaded.counters, committed.counters);
        assert!(store.load(LedgerSide::L1).unwrap().is_none());
        assert!(!store.path(LedgerSide::L2).with_extension("json.tmp").exists());
    }

    #[test]
    fn test_failed_rename_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        // A non-empty directory where the snapshot file belongs makes the rename fail
        let target = store.path(LedgerSide::L2);
        fs::create_dir_all(target.join("occupied")).unwrap();

        assert!(store.commit(&snapshot()).is_err());
        assert!(!target.with_extension("json.tmp").exists());
        assert!(target.is_dir());
    }

    #[test]
    fn test_big_integers_are_decimal_strings() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        store.commit(&snapshot()).unwrap();

        let raw = fs::read_to_string(store.path(LedgerSide::L2)).unwrap();
        assert!(raw.contains("\"observed_balance\": \"10\""), "unexpected encoding: {raw}");
    }

    #[test]
    fn test_counter_classification() {
        assert_eq!(CounterId::FastRelayer.flow(), Flow::Outflow);
        assert_eq!(CounterId::BillingContract.flow(), Flow::Inflow);
        assert_eq!(CounterId::SequencerFeeVault.denomination(), Denomination::Native);
        assert_eq!(CounterId::Sequencer.denomination(), Denomination::Secondary);
        assert!(LedgerSide::L1.counters().iter().all(|c| c.side() == LedgerSide::L1));
    }
}

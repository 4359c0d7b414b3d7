//! Local cache
//!
//! Disposable per-user snapshot plus the queue of reward triggers that have
//! not reached the remote store yet. Records are versioned and carry a blake3
//! checksum of their payload; anything that fails to open is reported as
//! [`EconomyError::CacheCorruption`] and the caller rehydrates from the
//! remote store.

use chrono::{DateTime, Utc};
use orebit_core::{EconomyError, LedgerDelta, LedgerKey, Result, UserId, UserProgressionState};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Current record layout version
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Reward trigger waiting to be pushed through the ledger
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTrigger {
    pub key: LedgerKey,
    pub delta: LedgerDelta,
    pub queued_at: DateTime<Utc>,
}

/// Cached payload
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedState {
    pub snapshot: UserProgressionState,

    #[serde(default)]
    pub pending: Vec<PendingTrigger>,
    pub saved_at: DateTime<Utc>,
}

impl CachedState {
    pub fn new(snapshot: UserProgressionState, saved_at: DateTime<Utc>) -> Self {
        Self {
            snapshot,
            pending: Vec::new(),
            saved_at,
        }
    }
}

/// On-disk envelope
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheRecord {
    pub version: u32,

    /// Hex blake3 of `payload`
    pub checksum: String,

    /// Serialized [`CachedState`], kept as the exact bytes that were hashed
    pub payload: String,
}

impl CacheRecord {
    pub fn seal(state: &CachedState, version: u32) -> Result<Vec<u8>> {
        let payload =
            serde_json::to_string(state).map_err(|e| EconomyError::Serialization(e.to_string()))?;
        let record = Self {
            version,
            checksum: checksum(&payload),
            payload,
        };
        serde_json::to_vec(&record).map_err(|e| EconomyError::Serialization(e.to_string()))
    }

    /// Decode and verify `bytes` as the record of `user`
    pub fn open(bytes: &[u8], user: &UserId, version: u32) -> Result<CachedState> {
        let record: CacheRecord = serde_json::from_slice(bytes)
            .map_err(|e| EconomyError::CacheCorruption(format!("unreadable record: {e}")))?;

        if record.version != version {
            return Err(EconomyError::CacheCorruption(format!(
                "version {} does not match {}",
                record.version, version
            )));
        }
        if checksum(&record.payload) != record.checksum {
            return Err(EconomyError::CacheCorruption("checksum mismatch".into()));
        }

        let state: CachedState = serde_json::from_str(&record.payload)
            .map_err(|e| EconomyError::CacheCorruption(format!("unexpected shape: {e}")))?;

        if &state.snapshot.user_id != user {
            return Err(EconomyError::CacheCorruption(format!(
                "record belongs to {}",
                state.snapshot.user_id
            )));
        }
        if state.pending.iter().any(|t| &t.key.user_id != user) {
            return Err(EconomyError::CacheCorruption(
                "pending trigger for another user".into(),
            ));
        }
        Ok(state)
    }
}

fn checksum(payload: &str) -> String {
    hex::encode(blake3::hash(payload.as_bytes()).as_bytes())
}

/// Per-user byte storage with versioned, checksummed records on top
pub trait LocalCache: Send + Sync {
    /// Record layout version this cache writes and accepts
    fn version(&self) -> u32;

    fn read_raw(&self, user: &UserId) -> Result<Option<Vec<u8>>>;

    fn write_raw(&self, user: &UserId, bytes: Vec<u8>) -> Result<()>;

    fn discard(&self, user: &UserId) -> Result<()>;

    /// `Ok(None)` when nothing is cached, `CacheCorruption` when unusable
    fn load(&self, user: &UserId) -> Result<Option<CachedState>> {
        match self.read_raw(user)? {
            Some(bytes) => CacheRecord::open(&bytes, user, self.version()).map(Some),
            None => Ok(None),
        }
    }

    fn store(&self, user: &UserId, state: &CachedState) -> Result<()> {
        let bytes = CacheRecord::seal(state, self.version())?;
        self.write_raw(user, bytes)
    }
}

/// In-process cache
pub struct MemoryCache {
    version: u32,
    records: RwLock<HashMap<UserId, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_version(CACHE_FORMAT_VERSION)
    }

    pub fn with_version(version: u32) -> Self {
        Self {
            version,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.records.read().contains_key(user)
    }

    /// Overwrite the raw bytes, e.g. to simulate a damaged record
    pub fn put_raw(&self, user: &UserId, bytes: Vec<u8>) {
        self.records.write().insert(user.clone(), bytes);
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCache for MemoryCache {
    fn version(&self) -> u32 {
        self.version
    }

    fn read_raw(&self, user: &UserId) -> Result<Option<Vec<u8>>> {
        Ok(self.records.read().get(user).cloned())
    }

    fn write_raw(&self, user: &UserId, bytes: Vec<u8>) -> Result<()> {
        self.records.write().insert(user.clone(), bytes);
        Ok(())
    }

    fn discard(&self, user: &UserId) -> Result<()> {
        self.records.write().remove(user);
        Ok(())
    }
}

/// One JSON file per user under a directory
pub struct FileCache {
    dir: PathBuf,
    version: u32,
}

impl FileCache {
    pub fn open(dir: impl AsRef<Path>, version: u32) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, version })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File names are hashed so arbitrary user ids stay path-safe
    pub fn path_for(&self, user: &UserId) -> PathBuf {
        let name = hex::encode(&user.seed_bytes()[..16]);
        self.dir.join(format!("{name}.json"))
    }
}

impl LocalCache for FileCache {
    fn version(&self) -> u32 {
        self.version
    }

    fn read_raw(&self, user: &UserId) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(user)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_raw(&self, user: &UserId, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(user);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        debug!(user = %user, path = %path.display(), "Cache record written");
        Ok(())
    }

    fn discard(&self, user: &UserId) -> Result<()> {
        match fs::remove_file(self.path_for(user)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

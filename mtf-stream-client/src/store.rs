//! Persistence of the last applied `seq` per `(symbol, timeframe, epoch)` so a restarted client
//! resumes gap detection where it left off.

use crate::error::ClientError;
use fnv::FnvHashMap;
use mtf_data::Timeframe;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateKey {
    pub symbol: SmolStr,
    pub timeframe: Timeframe,
    pub epoch_id: SmolStr,
}

impl StateKey {
    pub fn new(symbol: &str, timeframe: Timeframe, epoch_id: &str) -> Self {
        Self {
            symbol: SmolStr::new(symbol),
            timeframe,
            epoch_id: SmolStr::new(epoch_id),
        }
    }
}

pub trait StateStore: Send + Sync {
    fn load(&self, key: &StateKey) -> Option<u64>;

    fn save(&self, key: &StateKey, last_seq: u64) -> Result<(), ClientError>;
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Mutex<FnvHashMap<StateKey, u64>>,
}

impl StateStore for MemoryStateStore {
    fn load(&self, key: &StateKey) -> Option<u64> {
        self.entries.lock().get(key).copied()
    }

    fn save(&self, key: &StateKey, last_seq: u64) -> Result<(), ClientError> {
        self.entries.lock().insert(key.clone(), last_seq);
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredEntry {
    #[serde(flatten)]
    key: StateKey,
    last_seq: u64,
}

/// JSON file backed [`StateStore`]. Entries from other epochs are dropped on every save since
/// their seq space can never be resumed.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    entries: Mutex<FnvHashMap<StateKey, u64>>,
}

impl FileStateStore {
    /// Open the store at `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<Vec<StoredEntry>>(&bytes)?
                .into_iter()
                .map(|entry| (entry.key, entry.last_seq))
                .collect(),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => FnvHashMap::default(),
            Err(error) => return Err(error.into()),
        };

        debug!(path = %path.display(), entries = entries.len(), "opened stream state store");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn load(&self, key: &StateKey) -> Option<u64> {
        self.entries.lock().get(key).copied()
    }

    fn save(&self, key: &StateKey, last_seq: u64) -> Result<(), ClientError> {
        let mut entries = self.entries.lock();
        entries.retain(|stored, _| stored.epoch_id == key.epoch_id);
        entries.insert(key.clone(), last_seq);

        let stored = entries
            .iter()
            .map(|(key, last_seq)| StoredEntry {
                key: key.clone(),
                last_seq: *last_seq,
            })
            .collect::<Vec<_>>();
        let bytes = serde_json::to_vec_pretty(&stored)?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(symbol: &str, epoch_id: &str) -> StateKey {
        StateKey::new(symbol, Timeframe::from_minutes(5).unwrap(), epoch_id)
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStateStore::default();
        assert_eq!(store.load(&key("SPY", "e1")), None);

        store.save(&key("SPY", "e1"), 7).unwrap();

        assert_eq!(store.load(&key("SPY", "e1")), Some(7));
        assert_eq!(store.load(&key("SPY", "e2")), None);
    }

    #[test]
    fn test_file_store_survives_reopen_and_drops_old_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream-state.json");

        let store = FileStateStore::open(&path).unwrap();
        store.save(&key("SPY", "e1"), 7).unwrap();
        store.save(&key("QQQ", "e1"), 3).unwrap();
        drop(store);

        let reopened = FileStateStore::open(&path).unwrap();
        assert_eq!(reopened.load(&key("SPY", "e1")), Some(7));
        assert_eq!(reopened.load(&key("QQQ", "e1")), Some(3));

        reopened.save(&key("SPY", "e2"), 1).unwrap();
        let reopened = FileStateStore::open(&path).unwrap();
        assert_eq!(reopened.load(&key("SPY", "e1")), None);
        assert_eq!(reopened.load(&key("SPY", "e2")), Some(1));
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"not json").unwrap();

        assert!(matches!(
            FileStateStore::open(file.path()),
            Err(ClientError::Decode(_))
        ));
    }
}

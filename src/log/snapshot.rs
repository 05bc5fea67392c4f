// Snapshot Storage
//
// Snapshots capture the serialized state machine together with the
// membership and the identity of the last covered log entry. They live in
// the durable "snapshots" map keyed by creation timestamp; the highest key
// is the current snapshot.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::log::entry::{LogIndex, Membership, Term};
use crate::storage::TreeMap;

/// Immutable checkpoint of the state machine at a known log position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Index of the last log entry covered by this snapshot
    pub last_log_entry_index: LogIndex,

    /// Term of the last log entry covered by this snapshot
    pub last_log_entry_term: Term,

    /// Serialized state machine contents
    pub state: Vec<u8>,

    /// Membership at the time the snapshot was taken
    pub membership: Membership,
}

impl Snapshot {
    /// True when this snapshot subsumes the given log position.
    pub fn covers(&self, index: LogIndex, term: Term) -> bool {
        self.last_log_entry_index >= index && self.last_log_entry_term >= term
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (snapshot, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(snapshot)
    }
}

/// Snapshot store over the durable "snapshots" map. Last entry wins on
/// read.
pub struct SnapshotStore {
    map: Arc<dyn TreeMap>,
    retained: usize,
}

impl SnapshotStore {
    pub fn new(map: Arc<dyn TreeMap>, retained: usize) -> Self {
        Self {
            map,
            retained: retained.max(1),
        }
    }

    /// Persists a snapshot keyed by a monotonic millisecond timestamp and
    /// returns the key. Clock ties and regressions bump past the last key.
    pub fn save(&self, snapshot: &Snapshot) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let key = match self.map.last_key() {
            Some(last) if now <= last => last + 1,
            _ => now,
        };
        self.map.put(key, snapshot.encode()?)?;
        Ok(key)
    }

    /// Latest snapshot by timestamp, if any.
    pub fn latest(&self) -> Result<Option<Snapshot>> {
        match self.map.last_entry()? {
            Some((_, bytes)) => Ok(Some(Snapshot::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Removes a stored snapshot. Used to back out a failed install.
    pub fn remove(&self, key: i64) -> Result<()> {
        self.map.remove(key)
    }

    /// Drops all but the newest retained snapshots.
    pub fn prune(&self) -> Result<()> {
        let keys = self.map.keys();
        if keys.len() <= self.retained {
            return Ok(());
        }
        let cutoff = keys.len() - self.retained;
        for key in keys.into_iter().take(cutoff) {
            tracing::debug!(key, "dropping superseded snapshot");
            self.map.remove(key)?;
        }
        Ok(())
    }
}

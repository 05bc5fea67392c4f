// Log Entry Data Model
//
// Entries are identified by (index, term) and immutable once created.
// Commands are a tagged union dispatched exhaustively by the log core.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Raft term number (logical clock)
pub type Term = i64;

/// Log index type
pub type LogIndex = i64;

/// Node identifier within the cluster
pub type NodeId = String;

/// Sentinel index carried by AppendEntries when there is no previous entry.
pub const NO_PREVIOUS_INDEX: LogIndex = -1;

/// Sentinel term paired with `NO_PREVIOUS_INDEX`.
pub const NO_PREVIOUS_TERM: Term = -1;

/// Cluster membership bindings carried by configuration-change commands
/// and snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub bindings: Vec<NodeId>,
}

impl Membership {
    pub fn new(bindings: Vec<NodeId>) -> Self {
        Self { bindings }
    }
}

/// Command carried by a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Opaque user payload applied to the state machine on commit
    Write(Vec<u8>),

    /// Opaque user payload evaluated against the state machine without
    /// touching the commit index
    Read(Vec<u8>),

    /// Barrier entry with no state machine effect
    NoOp,

    /// First phase of a joint-consensus membership change, carrying the
    /// new bindings
    EnterJointConsensus(Membership),

    /// Second phase, leaving the joint configuration
    LeaveJointConsensus,

    /// Placeholder for an entry subsumed by a snapshot
    Compacted,
}

/// Entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term when the entry was received by the leader
    pub term: Term,

    /// Index of this entry in the log
    pub index: LogIndex,

    /// Command to apply to the state machine
    pub command: Command,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: Command) -> Self {
        Self {
            term,
            index,
            command,
        }
    }

    /// Synthetic entry standing in for a log position covered by a snapshot.
    pub fn compacted(term: Term, index: LogIndex) -> Self {
        Self {
            term,
            index,
            command: Command::Compacted,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (entry, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(entry)
    }
}

/// AppendEntries request carrying replicated entries and the leader's
/// commit index. Also used as heartbeat when `entries` is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntries {
    /// Leader's term
    pub term: Term,

    /// Leader's node ID
    pub leader_id: NodeId,

    /// Index of the log entry immediately preceding the new ones
    pub prev_log_index: LogIndex,

    /// Term of the `prev_log_index` entry
    pub prev_log_term: Term,

    /// Log entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,

    /// Leader's commit index
    pub commit_index: LogIndex,
}

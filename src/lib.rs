// RustyRaft - Raft replicated log core
// Consensus log subsystem shared by clustered deployments

pub mod cluster;
pub mod config;
pub mod error;
pub mod log;
pub mod state_machine;
pub mod storage;

pub use cluster::Cluster;
pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use log::entry::{
    AppendEntries, Command, LogEntry, LogIndex, Membership, NodeId, Term, NO_PREVIOUS_INDEX,
    NO_PREVIOUS_TERM,
};
pub use log::snapshot::Snapshot;
pub use log::ReplicatedLog;
pub use state_machine::StateMachine;
pub use storage::{DurableCounter, InMemoryStore, KvStore, TreeMap};

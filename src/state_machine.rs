// State Machine Collaborator Interface

use async_trait::async_trait;

use crate::error::Result;
use crate::log::entry::Command;

/// User-supplied state machine fed by the replicated log.
///
/// `apply` must be deterministic: it is invoked in commit order, and the
/// same sequence of commands is replayed after a restart until the durable
/// commit index is reached again.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Applies a command and returns its opaque response payload.
    async fn apply(&mut self, command: &Command) -> Result<Vec<u8>>;

    /// Serializes the full state for snapshotting.
    fn serialize(&self) -> Result<Vec<u8>>;

    /// Replaces the state from a serialized snapshot.
    fn deserialize(&mut self, bytes: &[u8]) -> Result<()>;
}

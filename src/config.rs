// Replicated Log Configuration

use serde::{Deserialize, Serialize};

/// Configuration for the replicated log and its compaction policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Number of log entries kept before a snapshot is taken
    pub log_compaction_threshold: u64,

    /// Number of snapshots retained after compaction
    pub snapshots_retained: usize,

    /// Depth of the compaction hand-off queue; submissions beyond it are
    /// rejected and retried on the next append
    pub compaction_queue_depth: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            log_compaction_threshold: 10_000,
            snapshots_retained: 3,
            compaction_queue_depth: 2,
        }
    }
}

// Replicated Log Core
//
// Owns the ordered sequence of replicated commands and enforces the Raft
// log rules:
// - Append with the previous-entry consistency check and idempotent inserts
// - Commit advancement feeding the state machine in index order
// - Snapshot install and startup replay
// - Fixed-size log compaction
//
// Reference: https://raft.github.io/raft.pdf

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::Instrument;

use crate::cluster::Cluster;
use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::state_machine::StateMachine;
use crate::storage::{
    DurableCounter, KvStore, TreeMap, COMMIT_INDEX_COUNTER, ENTRIES_MAP, SNAPSHOTS_MAP,
};

pub mod compaction;
pub mod entry;
pub mod snapshot;

use self::compaction::{compaction_worker, FixedSizeCompaction};
use self::entry::{
    AppendEntries, Command, LogEntry, LogIndex, Term, NO_PREVIOUS_INDEX, NO_PREVIOUS_TERM,
};
use self::snapshot::{Snapshot, SnapshotStore};

/// The replicated log: ordered commands agreed by the cluster, the durable
/// commit index, and the snapshots compacting them.
///
/// Lock discipline: every operation takes the gate in shared mode; only
/// `install_snapshot` takes it exclusively, so no reader can observe a
/// partially installed snapshot. Conflict handling on append truncates a
/// range of keys, which the store's per-key atomicity cannot make safe on
/// its own, so appends additionally serialize against each other (and
/// against compaction pruning) through the append mutex. The mutex is only
/// held across synchronous map mutation, never across an await.
pub struct ReplicatedLog {
    cluster: Arc<dyn Cluster>,
    entries: Arc<dyn TreeMap>,
    commit_index: Arc<dyn DurableCounter>,
    snapshots: SnapshotStore,
    state_machine: Mutex<Box<dyn StateMachine>>,
    gate: RwLock<()>,
    append_lock: parking_lot::Mutex<()>,
    last_log: AtomicI64,
    compaction: FixedSizeCompaction,
}

impl ReplicatedLog {
    /// Opens the log over the durable store, replays committed entries past
    /// the latest snapshot, and starts the compaction worker.
    pub async fn open(
        cluster: Arc<dyn Cluster>,
        store: Arc<dyn KvStore>,
        state_machine: Box<dyn StateMachine>,
        config: &RaftConfig,
    ) -> Result<Arc<Self>> {
        let (queue_tx, queue_rx) = mpsc::channel(config.compaction_queue_depth.max(1));
        let log = Arc::new(Self {
            cluster,
            entries: store.tree_map(ENTRIES_MAP),
            commit_index: store.counter(COMMIT_INDEX_COUNTER),
            snapshots: SnapshotStore::new(
                store.tree_map(SNAPSHOTS_MAP),
                config.snapshots_retained,
            ),
            state_machine: Mutex::new(state_machine),
            gate: RwLock::new(()),
            append_lock: parking_lot::Mutex::new(()),
            last_log: AtomicI64::new(0),
            compaction: FixedSizeCompaction::new(config.log_compaction_threshold, queue_tx),
        });

        log.restore().await?;
        log.last_log
            .store(log.find_last_log_index()?, Ordering::SeqCst);
        tokio::spawn(
            compaction_worker(Arc::downgrade(&log), queue_rx)
                .instrument(tracing::info_span!("compaction")),
        );
        Ok(log)
    }

    /// Follower-side append driven by an AppendEntries request.
    ///
    /// Returns true when the request's previous index and term pass the
    /// consistency check (directly, via the no-previous-entry sentinel, or
    /// via snapshot coverage). Accepted entries are inserted idempotently,
    /// the commit index advances up to the leader's, and compaction is
    /// re-evaluated off the request path.
    pub async fn try_append(&self, request: AppendEntries) -> Result<bool> {
        {
            let _shared = self.gate.read().await;
            if !self.contains_entry(request.prev_log_index, request.prev_log_term)? {
                tracing::debug!(
                    prev_log_index = request.prev_log_index,
                    prev_log_term = request.prev_log_term,
                    "previous entry check failed, rejecting append"
                );
                return Ok(false);
            }
            for entry in self.insert_all(&request.entries)? {
                self.after_append(&entry);
            }
            self.commit_entries_until(request.commit_index, false)
                .await?;
        }
        self.compaction.evaluate(self.entries.len());
        Ok(true)
    }

    /// Leader-side local append. Does not move the commit index.
    pub async fn append(&self, entries: &[LogEntry]) -> Result<()> {
        {
            let _shared = self.gate.read().await;
            for entry in self.insert_all(entries)? {
                self.after_append(&entry);
            }
        }
        self.compaction.evaluate(self.entries.len());
        Ok(())
    }

    /// Commits the given entry and everything before it.
    ///
    /// Only valid for an entry of the current local term: a stale-term
    /// commit is refused, and a missing entry is a hole in the log and
    /// fatal.
    pub async fn commit(&self, entry: &LogEntry) -> Result<()> {
        let _shared = self.gate.read().await;
        if entry.index <= self.commit_index.get() {
            tracing::debug!(index = entry.index, "commit request for committed entry");
            return Ok(());
        }
        let stored = self
            .log_entry(entry.index)?
            .ok_or(RaftError::MissingLogEntry(entry.index))?;
        let local_term = self.cluster.local_term();
        if stored.term != local_term {
            tracing::warn!(
                index = stored.index,
                term = stored.term,
                local_term,
                "refusing to commit entry from a stale term"
            );
            return Ok(());
        }
        self.commit_entries_until(entry.index, false).await
    }

    /// Evaluates a read command against the state machine. Reads do not
    /// advance the commit index.
    pub async fn execute_read(&self, command: &Command) -> Result<Vec<u8>> {
        let _shared = self.gate.read().await;
        let mut state_machine = self.state_machine.lock().await;
        state_machine.apply(command).await
    }

    /// True when the log has an entry with the given index and term, the
    /// pair is the no-previous-entry sentinel, or the current snapshot
    /// covers the pair.
    pub fn contains_entry(&self, index: LogIndex, term: Term) -> Result<bool> {
        if index == NO_PREVIOUS_INDEX && term == NO_PREVIOUS_TERM {
            return Ok(true);
        }
        if let Some(entry) = self.log_entry(index)? {
            if entry.term == term {
                return Ok(true);
            }
        }
        match self.snapshots.latest()? {
            Some(snapshot) => Ok(snapshot.covers(index, term)),
            None => Ok(false),
        }
    }

    /// Raw entry lookup against the durable map.
    pub fn log_entry(&self, index: LogIndex) -> Result<Option<LogEntry>> {
        match self.entries.get(index)? {
            Some(bytes) => Ok(Some(LogEntry::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Entry immediately preceding the given one. Positions covered by the
    /// snapshot are reported through a synthetic compacted entry.
    pub fn previous_log_entry(&self, entry: &LogEntry) -> Result<Option<LogEntry>> {
        self.log_entry_or_compacted(entry.index - 1)
    }

    /// Last entry in the log. When the true maximum is covered by the
    /// snapshot, a synthetic compacted entry at the snapshot boundary is
    /// returned instead.
    pub fn last_log_entry(&self) -> Result<Option<LogEntry>> {
        let last = self.last_log.load(Ordering::SeqCst);
        if last > 0 {
            if let Some(entry) = self.log_entry(last)? {
                return Ok(Some(entry));
            }
        }
        match self.snapshots.latest()? {
            Some(snapshot) => Ok(Some(LogEntry::compacted(
                snapshot.last_log_entry_term,
                snapshot.last_log_entry_index,
            ))),
            None => Ok(None),
        }
    }

    /// Atomically allocates the next log index.
    pub fn next_log_index(&self) -> LogIndex {
        self.last_log.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Highest index present in the entries map, falling back to the
    /// snapshot boundary when every entry up to it has been pruned. Used at
    /// init and after snapshot install.
    pub fn find_last_log_index(&self) -> Result<LogIndex> {
        let last = self.entries.last_key().unwrap_or(0);
        match self.snapshots.latest()? {
            Some(snapshot) => Ok(last.max(snapshot.last_log_entry_index)),
            None => Ok(last),
        }
    }

    /// Number of entries currently held in the durable map.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Current commit index.
    pub fn commit_index(&self) -> LogIndex {
        self.commit_index.get()
    }

    /// Latest snapshot, if any has been taken or installed.
    pub fn latest_snapshot(&self) -> Result<Option<Snapshot>> {
        self.snapshots.latest()
    }

    /// Atomically replaces state machine contents, commit index, and
    /// membership from a received snapshot. Runs under the exclusive gate
    /// so no concurrent operation observes a partial install; a failed
    /// install leaves the previous snapshot and commit index intact.
    ///
    /// Entries covered by the snapshot are pruned and `last_log` is moved
    /// up to the snapshot boundary, so a follower that was behind keeps
    /// allocating indices past the installed state instead of reusing the
    /// ones the snapshot subsumed.
    pub async fn install_snapshot(&self, snapshot: Snapshot) -> Result<bool> {
        let _exclusive = self.gate.write().await;
        let key = self.snapshots.save(&snapshot)?;
        {
            let mut state_machine = self.state_machine.lock().await;
            if let Err(e) = state_machine.deserialize(&snapshot.state) {
                self.snapshots.remove(key)?;
                return Err(e);
            }
        }
        self.commit_index.set(snapshot.last_log_entry_index)?;
        self.cluster.restore_membership(snapshot.membership.clone());
        for key in self.entries.keys() {
            if key <= snapshot.last_log_entry_index {
                self.entries.remove(key)?;
            }
        }
        self.last_log
            .fetch_max(snapshot.last_log_entry_index, Ordering::SeqCst);
        tracing::info!(
            last_index = snapshot.last_log_entry_index,
            last_term = snapshot.last_log_entry_term,
            "installed snapshot"
        );
        Ok(true)
    }

    /// Inserts a batch of entries under the append mutex and returns the
    /// ones actually stored. Conflict truncation touches a range of keys,
    /// so concurrent appends must not interleave with it.
    fn insert_all(&self, entries: &[LogEntry]) -> Result<Vec<LogEntry>> {
        let _append = self.append_lock.lock();
        let mut inserted = Vec::new();
        for entry in entries {
            if self.insert(entry)? {
                inserted.push(entry.clone());
            }
        }
        Ok(inserted)
    }

    /// Idempotent insertion. Returns true when the entry was actually
    /// stored: a second append at the same (index, term) is a no-op, and an
    /// entry at the same index with a different term truncates the
    /// conflicting suffix before the insert.
    fn insert(&self, entry: &LogEntry) -> Result<bool> {
        match self.log_entry(entry.index)? {
            Some(existing) if existing.term == entry.term => {
                tracing::warn!(
                    index = entry.index,
                    term = entry.term,
                    "discarding append of already present entry"
                );
                return Ok(false);
            }
            Some(existing) => {
                tracing::warn!(
                    index = entry.index,
                    existing_term = existing.term,
                    term = entry.term,
                    "conflicting entry, truncating log suffix"
                );
                self.truncate_from(entry.index)?;
            }
            None => {}
        }
        self.entries.put(entry.index, entry.encode()?)?;
        self.last_log.fetch_max(entry.index, Ordering::SeqCst);
        Ok(true)
    }

    /// Removes every entry at `index` and beyond. Callers hold the append
    /// mutex.
    fn truncate_from(&self, index: LogIndex) -> Result<()> {
        for key in self.entries.keys() {
            if key >= index {
                self.entries.remove(key)?;
            }
        }
        self.last_log
            .store(self.find_last_log_index()?, Ordering::SeqCst);
        Ok(())
    }

    /// Joint-consensus commands activate the new configuration as soon as
    /// the entry is appended, not when it commits. Idempotent insertion
    /// keeps this to exactly once per (index, term).
    fn after_append(&self, entry: &LogEntry) {
        match &entry.command {
            Command::EnterJointConsensus(_) | Command::LeaveJointConsensus => {
                tracing::info!(index = entry.index, "activating configuration change");
                self.cluster.activate_membership(&entry.command);
            }
            Command::Write(_) | Command::Read(_) | Command::NoOp | Command::Compacted => {}
        }
    }

    /// Walks the uncommitted range up to `target` (`exclusive` drops the
    /// target itself), committing every entry present. Holes are tolerated:
    /// the commit index only advances through entries the log actually
    /// holds, and the cluster supplies the rest via later appends.
    async fn commit_entries_until(&self, target: LogIndex, exclusive: bool) -> Result<()> {
        let bound = if exclusive { target - 1 } else { target };
        let mut index = self.commit_index.get() + 1;
        while index <= bound {
            if let Some(entry) = self.log_entry(index)? {
                self.safe_commit(&entry).await?;
            }
            index += 1;
        }
        Ok(())
    }

    /// Advances the commit index to the entry and executes its command.
    /// Duplicate and stale requests are logged and ignored. The state
    /// machine mutex serializes commit execution in index order.
    async fn safe_commit(&self, entry: &LogEntry) -> Result<()> {
        let mut state_machine = self.state_machine.lock().await;
        if entry.index <= self.commit_index.get() {
            tracing::debug!(index = entry.index, "entry already committed");
            return Ok(());
        }
        self.commit_index.set(entry.index)?;
        tracing::debug!(index = entry.index, term = entry.term, "committing entry");
        self.execute(state_machine.as_mut(), &entry.command).await
    }

    /// Exhaustive command dispatch on commit.
    async fn execute(
        &self,
        state_machine: &mut (dyn StateMachine + '_),
        command: &Command,
    ) -> Result<()> {
        match command {
            Command::EnterJointConsensus(membership) => {
                let cluster = Arc::clone(&self.cluster);
                let bindings = membership.clone();
                tokio::spawn(
                    async move {
                        if let Err(e) = cluster.reach_majority_joint_consensus(bindings).await {
                            tracing::warn!(
                                error = %e,
                                "joint consensus round did not reach majority"
                            );
                        }
                    }
                    .instrument(tracing::debug_span!("joint_consensus")),
                );
                Ok(())
            }
            Command::LeaveJointConsensus | Command::NoOp | Command::Compacted => Ok(()),
            Command::Write(_) | Command::Read(_) => {
                state_machine.apply(command).await?;
                Ok(())
            }
        }
    }

    /// Produces a snapshot at the current commit index and prunes the
    /// entries it covers. Invoked only by the compaction worker.
    async fn compact(&self) -> Result<()> {
        let _shared = self.gate.read().await;
        let state_machine = self.state_machine.lock().await;
        let commit = self.commit_index.get();
        if commit == 0 {
            return Ok(());
        }
        let term = match self.log_entry(commit)? {
            Some(entry) => entry.term,
            None => match self.snapshots.latest()? {
                // Everything committed is already covered.
                Some(snapshot) if snapshot.last_log_entry_index >= commit => return Ok(()),
                _ => return Err(RaftError::MissingLogEntry(commit)),
            },
        };
        let state = state_machine.serialize()?;
        drop(state_machine);

        let snapshot = Snapshot {
            last_log_entry_index: commit,
            last_log_entry_term: term,
            state,
            membership: self.cluster.membership(),
        };
        self.snapshots.save(&snapshot)?;

        let mut pruned = 0usize;
        {
            let _append = self.append_lock.lock();
            for key in self.entries.keys() {
                if key <= commit {
                    self.entries.remove(key)?;
                    pruned += 1;
                }
            }
        }
        self.snapshots.prune()?;
        tracing::info!(last_index = commit, pruned, "log compacted");
        Ok(())
    }

    /// Reloads the latest snapshot and re-applies committed entries past
    /// it. Idempotent: repeated crashes during replay converge to the same
    /// state machine contents once the commit index is reached.
    async fn restore(&self) -> Result<()> {
        let first = match self.snapshots.latest()? {
            Some(snapshot) => {
                let mut state_machine = self.state_machine.lock().await;
                state_machine.deserialize(&snapshot.state)?;
                self.cluster.restore_membership(snapshot.membership.clone());
                tracing::info!(
                    last_index = snapshot.last_log_entry_index,
                    last_term = snapshot.last_log_entry_term,
                    "restored state machine from snapshot"
                );
                snapshot.last_log_entry_index + 1
            }
            None => 1,
        };

        let target = self.commit_index.get();
        if first > target {
            return Ok(());
        }

        tracing::info!(from = first, to = target, "replaying committed entries");
        let mut state_machine = self.state_machine.lock().await;
        for index in first..=target {
            let entry = self
                .log_entry(index)?
                .ok_or(RaftError::MissingLogEntry(index))?;
            self.after_append(&entry);
            self.execute(state_machine.as_mut(), &entry.command).await?;
        }
        Ok(())
    }

    /// Entry lookup reporting snapshot-covered positions through a
    /// synthetic compacted entry at the snapshot boundary.
    fn log_entry_or_compacted(&self, index: LogIndex) -> Result<Option<LogEntry>> {
        if let Some(entry) = self.log_entry(index)? {
            return Ok(Some(entry));
        }
        match self.snapshots.latest()? {
            Some(snapshot) if snapshot.last_log_entry_index >= index => Ok(Some(
                LogEntry::compacted(snapshot.last_log_entry_term, snapshot.last_log_entry_index),
            )),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::entry::Membership;
    use super::*;
    use crate::storage::InMemoryStore;

    struct StaticCluster {
        term: AtomicI64,
        membership: parking_lot::Mutex<Membership>,
        activations: AtomicUsize,
    }

    impl StaticCluster {
        fn new(term: Term) -> Arc<Self> {
            Arc::new(Self {
                term: AtomicI64::new(term),
                membership: parking_lot::Mutex::new(Membership::default()),
                activations: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Cluster for StaticCluster {
        fn local_term(&self) -> Term {
            self.term.load(Ordering::SeqCst)
        }

        fn activate_membership(&self, _command: &Command) {
            self.activations.fetch_add(1, Ordering::SeqCst);
        }

        async fn reach_majority_joint_consensus(&self, _bindings: Membership) -> Result<()> {
            Ok(())
        }

        fn membership(&self) -> Membership {
            self.membership.lock().clone()
        }

        fn restore_membership(&self, membership: Membership) {
            *self.membership.lock() = membership;
        }
    }

    #[derive(Default)]
    struct RecordingStateMachine {
        applied: Vec<Command>,
    }

    #[async_trait]
    impl StateMachine for RecordingStateMachine {
        async fn apply(&mut self, command: &Command) -> Result<Vec<u8>> {
            self.applied.push(command.clone());
            Ok(Vec::new())
        }

        fn serialize(&self) -> Result<Vec<u8>> {
            Ok(serde_json::to_vec(&self.applied)?)
        }

        fn deserialize(&mut self, bytes: &[u8]) -> Result<()> {
            self.applied = serde_json::from_slice(bytes)?;
            Ok(())
        }
    }

    async fn open_log(cluster: Arc<StaticCluster>) -> Arc<ReplicatedLog> {
        let store = Arc::new(InMemoryStore::new());
        ReplicatedLog::open(
            cluster,
            store,
            Box::new(RecordingStateMachine::default()),
            &RaftConfig::default(),
        )
        .await
        .unwrap()
    }

    fn empty_state() -> Vec<u8> {
        serde_json::to_vec(&Vec::<Command>::new()).unwrap()
    }

    #[tokio::test]
    async fn test_contains_entry() {
        let log = open_log(StaticCluster::new(1)).await;

        assert!(log.contains_entry(-1, -1).unwrap());
        assert!(!log.contains_entry(1, 1).unwrap());

        log.append(&[LogEntry::new(1, 1, Command::NoOp)])
            .await
            .unwrap();

        assert!(log.contains_entry(1, 1).unwrap());
        assert!(!log.contains_entry(1, 2).unwrap());
        assert!(!log.contains_entry(2, 1).unwrap());
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let log = open_log(StaticCluster::new(1)).await;
        let entry = LogEntry::new(1, 1, Command::Write(vec![1]));

        log.append(&[entry.clone()]).await.unwrap();
        log.append(&[entry]).await.unwrap();

        assert_eq!(log.size(), 1);
        assert_eq!(log.find_last_log_index().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_term_truncates_suffix() {
        let log = open_log(StaticCluster::new(2)).await;
        log.append(&[
            LogEntry::new(1, 1, Command::NoOp),
            LogEntry::new(1, 2, Command::Write(vec![2])),
            LogEntry::new(1, 3, Command::Write(vec![3])),
        ])
        .await
        .unwrap();

        log.append(&[LogEntry::new(2, 2, Command::Write(vec![9]))])
            .await
            .unwrap();

        assert_eq!(log.size(), 2);
        assert!(log.log_entry(3).unwrap().is_none());
        let last = log.last_log_entry().unwrap().unwrap();
        assert_eq!((last.index, last.term), (2, 2));
    }

    #[tokio::test]
    async fn test_next_log_index_is_dense() {
        let log = open_log(StaticCluster::new(1)).await;

        assert_eq!(log.next_log_index(), 1);
        assert_eq!(log.next_log_index(), 2);
        assert_eq!(log.next_log_index(), 3);
    }

    #[tokio::test]
    async fn test_install_snapshot_supersedes_empty_log() {
        let cluster = StaticCluster::new(3);
        let log = open_log(cluster.clone()).await;

        let installed = log
            .install_snapshot(Snapshot {
                last_log_entry_index: 10,
                last_log_entry_term: 3,
                state: empty_state(),
                membership: Membership::new(vec!["a".into(), "b".into()]),
            })
            .await
            .unwrap();

        assert!(installed);
        assert_eq!(log.commit_index(), 10);
        assert_eq!(cluster.membership().bindings, vec!["a", "b"]);

        let last = log.last_log_entry().unwrap().unwrap();
        assert_eq!((last.term, last.index), (3, 10));
        assert_eq!(last.command, Command::Compacted);
        assert!(log.contains_entry(5, 2).unwrap());
    }

    #[tokio::test]
    async fn test_install_snapshot_resyncs_index_allocation() {
        let cluster = StaticCluster::new(3);
        let log = open_log(cluster.clone()).await;

        // A follower that is genuinely behind the snapshot boundary.
        log.append(&[
            LogEntry::new(1, 1, Command::NoOp),
            LogEntry::new(1, 2, Command::Write(vec![2])),
            LogEntry::new(1, 3, Command::Write(vec![3])),
        ])
        .await
        .unwrap();
        assert_eq!(log.find_last_log_index().unwrap(), 3);

        log.install_snapshot(Snapshot {
            last_log_entry_index: 10,
            last_log_entry_term: 3,
            state: empty_state(),
            membership: Membership::default(),
        })
        .await
        .unwrap();

        assert_eq!(log.commit_index(), 10);
        assert_eq!(log.find_last_log_index().unwrap(), 10);
        // Covered entries are pruned rather than left below the boundary.
        assert_eq!(log.size(), 0);
        // Local allocation continues past the installed state instead of
        // reusing subsumed indices.
        assert_eq!(log.next_log_index(), 11);
        assert_eq!(log.next_log_index(), 12);
    }

    #[tokio::test]
    async fn test_joint_consensus_activates_on_append() {
        let cluster = StaticCluster::new(1);
        let log = open_log(cluster.clone()).await;

        let change = LogEntry::new(
            1,
            1,
            Command::EnterJointConsensus(Membership::new(vec!["a".into()])),
        );
        log.append(&[change.clone()]).await.unwrap();
        assert_eq!(cluster.activations.load(Ordering::SeqCst), 1);

        // Re-appending the same entry must not re-activate.
        log.append(&[change]).await.unwrap();
        assert_eq!(cluster.activations.load(Ordering::SeqCst), 1);
    }
}

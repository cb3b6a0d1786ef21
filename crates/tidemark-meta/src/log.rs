//! The replicated command log.
//!
//! Appends are serialized: each one takes the next index, is shipped to every
//! replica concurrently and only becomes committed once the write quorum
//! (the local copy counts as one) has acknowledged it. Committed indices are
//! published on a watch channel that apply loops subscribe to.
//!
//! The log remembers how far each replica has acknowledged committed entries.
//! A replica that missed appends gets the missing suffix resent with the next
//! one, overwriting any entry it holds from an append that failed quorum.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::command::{Command, LogEntry};
use crate::config::CommandLogConfig;
use crate::error::MetaError;
use crate::kvstore::KvStore;
use crate::log_store::EntryStore;
use crate::types::{decode, encode, LogIndex};

const LOG_PREFIX: &[u8] = b"cmdlog/";
const KEY_COMMITTED: &[u8] = b"cmdlog/committed";

/// A remote copy of the command log.
///
/// Entries a replica holds past `committed` may belong to an append that never
/// reached quorum; the leader overwrites them on a later call.
#[async_trait]
pub trait LogReplica: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Durably stores `entries`, replacing anything held at or after the first
    /// of them, and records that the leader has committed through `committed`.
    /// Returning `Ok` acknowledges every entry in the batch.
    async fn replicate(&self, entries: &[LogEntry], committed: LogIndex) -> Result<(), MetaError>;
}

/// A replica that persists entries into its own KV store.
pub struct KvReplica {
    name: String,
    kv: Arc<dyn KvStore>,
    store: EntryStore,
}

impl KvReplica {
    /// Creates a replica named `name` persisting into `kv`.
    pub fn new(name: impl Into<String>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            name: name.into(),
            store: EntryStore::new(kv.clone(), LOG_PREFIX),
            kv,
        }
    }

    /// Highest index this replica knows to be committed.
    pub fn committed_index(&self) -> Result<LogIndex, MetaError> {
        match self.kv.get(KEY_COMMITTED)? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Ok(LogIndex::ZERO),
        }
    }

    /// Committed entries held by this replica starting at `start`.
    ///
    /// Lags the leader by one call: the commit of the newest entry is only
    /// learned with the next replication.
    pub fn entries_from(&self, start: LogIndex) -> Result<Vec<LogEntry>, MetaError> {
        let committed = self.committed_index()?;
        let mut entries = self.store.entries_from(start)?;
        entries.retain(|e| e.index <= committed);
        Ok(entries)
    }
}

#[async_trait]
impl LogReplica for KvReplica {
    fn name(&self) -> &str {
        &self.name
    }

    async fn replicate(&self, entries: &[LogEntry], committed: LogIndex) -> Result<(), MetaError> {
        self.store.replace_from(entries)?;
        let held = entries.last().map(|e| e.index).unwrap_or(committed);
        let committed = committed.min(held).max(self.committed_index()?);
        self.kv.put(KEY_COMMITTED.to_vec(), encode(&committed)?)
    }
}

/// Ordered, durable, replicated sequence of metadata commands.
pub struct CommandLog {
    store: EntryStore,
    replicas: Vec<Arc<dyn LogReplica>>,
    write_quorum: usize,
    replica_timeout: Duration,
    /// Highest committed index each replica is known to hold. Also serializes
    /// appends and compaction.
    matched: Mutex<Vec<LogIndex>>,
    committed: watch::Sender<LogIndex>,
}

impl CommandLog {
    /// Opens the log persisted in `kv` with no replicas.
    pub fn open(kv: Arc<dyn KvStore>, config: &CommandLogConfig) -> Result<Self, MetaError> {
        Self::with_replicas(kv, Vec::new(), config)
    }

    /// Opens the log persisted in `kv`, replicating to `replicas`.
    ///
    /// The write quorum defaults to a majority of the local copy plus replicas
    /// and must not exceed that count. Replicas are assumed to hold the
    /// committed log at open time.
    pub fn with_replicas(
        kv: Arc<dyn KvStore>,
        replicas: Vec<Arc<dyn LogReplica>>,
        config: &CommandLogConfig,
    ) -> Result<Self, MetaError> {
        let members = replicas.len() + 1;
        let write_quorum = config.write_quorum.unwrap_or(members / 2 + 1);
        if write_quorum == 0 || write_quorum > members {
            return Err(MetaError::InvalidArgument(format!(
                "write quorum {} must be between 1 and {}",
                write_quorum, members
            )));
        }

        let store = EntryStore::new(kv, LOG_PREFIX);
        let last = store.last_index()?;
        let (committed, _) = watch::channel(last);
        info!(
            last_index = %last,
            replicas = replicas.len(),
            write_quorum,
            "command log opened"
        );

        Ok(Self {
            store,
            matched: Mutex::new(vec![last; replicas.len()]),
            replicas,
            write_quorum,
            replica_timeout: Duration::from_millis(config.replica_timeout_ms),
            committed,
        })
    }

    /// Appends `command` and returns its committed index.
    ///
    /// Fails with `Unavailable` when fewer than the write quorum acknowledge;
    /// in that case no index is consumed and the next append reuses it.
    pub async fn append(&self, command: Command) -> Result<LogIndex, MetaError> {
        command.validate()?;
        let mut matched = self.matched.lock().await;

        let committed = self.last_index();
        let index = committed.next();
        let entry = LogEntry { index, command };
        encode(&entry)?;

        let acked = self.replicate(&matched, &entry, committed).await?;
        let acks = 1 + acked.iter().filter(|a| **a).count();
        let reached = acks >= self.write_quorum;
        for (m, ok) in matched.iter_mut().zip(&acked) {
            if *ok {
                // An entry that missed quorum does not count as held.
                *m = if reached { index } else { committed };
            }
        }
        if !reached {
            warn!(
                index = %index,
                acks,
                write_quorum = self.write_quorum,
                "command log append failed to reach quorum"
            );
            return Err(MetaError::Unavailable(format!(
                "{} of {} required acknowledgements",
                acks, self.write_quorum
            )));
        }

        self.store.append_entry(&entry)?;
        self.committed.send_replace(index);
        debug!(index = %index, command = entry.command.name(), acks, "command committed");
        Ok(index)
    }

    /// Ships each replica everything it is missing plus `entry`. Returns which
    /// replicas acknowledged.
    async fn replicate(
        &self,
        matched: &[LogIndex],
        entry: &LogEntry,
        committed: LogIndex,
    ) -> Result<Vec<bool>, MetaError> {
        let first = self.first_index()?;
        let mut batches = Vec::with_capacity(self.replicas.len());
        for m in matched {
            let mut batch = self.store.entries_from(m.next().max(first))?;
            batch.push(entry.clone());
            batches.push(batch);
        }

        let timeout = self.replica_timeout;
        let sends = self.replicas.iter().zip(&batches).map(|(replica, batch)| async move {
            match tokio::time::timeout(timeout, replica.replicate(batch, committed)).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(replica = replica.name(), index = %entry.index, error = %e, "replication failed");
                    false
                }
                Err(_) => {
                    warn!(replica = replica.name(), index = %entry.index, "replication timed out");
                    false
                }
            }
        });
        Ok(futures::future::join_all(sends).await)
    }

    /// Highest committed index.
    pub fn last_index(&self) -> LogIndex {
        *self.committed.borrow()
    }

    /// Lowest index still retained.
    pub fn first_index(&self) -> Result<LogIndex, MetaError> {
        Ok(self.store.compacted_index()?.next())
    }

    /// Committed entries with index >= `start`.
    pub fn entries_from(&self, start: LogIndex) -> Result<Vec<LogEntry>, MetaError> {
        let first = self.first_index()?;
        if start < first {
            return Err(MetaError::LogCompacted {
                requested: start,
                first,
            });
        }
        self.store.entries_from(start)
    }

    /// Number of entries still retained.
    pub fn retained_entries(&self) -> Result<usize, MetaError> {
        self.store.entry_count()
    }

    /// Watch channel carrying the highest committed index.
    pub fn subscribe(&self) -> watch::Receiver<LogIndex> {
        self.committed.subscribe()
    }

    /// Drops entries with index <= `through`. Callers must make sure every
    /// node has applied them first.
    pub async fn compact_through(&self, through: LogIndex) -> Result<(), MetaError> {
        let _guard = self.matched.lock().await;
        let through = through.min(self.last_index());
        if through < self.first_index()? {
            return Ok(());
        }
        self.store.remove_through(through)?;
        info!(through = %through, "command log compacted");
        Ok(())
    }
}

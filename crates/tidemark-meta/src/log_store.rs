//! Persistent storage for log entries and state snapshots.
//!
//! This module wraps a KvStore to persist command log entries under a key
//! prefix, plus the node-local snapshot of the state machine that lets a
//! restart skip replaying entries it has already folded in.

use std::sync::Arc;

use crate::command::LogEntry;
use crate::data::MetaData;
use crate::error::MetaError;
use crate::kvstore::{BatchOp, KvStore};
use crate::types::{decode, encode, LogIndex};

const ENTRY_SEGMENT: &[u8] = b"entry/";
const KEY_COMPACTED: &[u8] = b"compacted";
const KEY_SNAPSHOT: &[u8] = b"snapshot";

fn u64_from_be_bytes(bytes: &[u8]) -> Result<u64, MetaError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| MetaError::Storage("invalid index encoding".to_string()))?;
    Ok(u64::from_be_bytes(arr))
}

/// Ordered log entries stored under a key prefix.
///
/// Keys are `<prefix>entry/<index as big-endian u64>` so a prefix scan returns
/// entries in index order. The highest index removed by compaction is kept
/// under `<prefix>compacted` so the log still knows where it ends after every
/// entry has been folded into a snapshot.
pub struct EntryStore {
    kv: Arc<dyn KvStore>,
    prefix: Vec<u8>,
}

impl EntryStore {
    /// Creates an entry store over `kv` using `prefix` for all its keys.
    pub fn new(kv: Arc<dyn KvStore>, prefix: &[u8]) -> Self {
        Self {
            kv,
            prefix: prefix.to_vec(),
        }
    }

    fn entries_prefix(&self) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(ENTRY_SEGMENT);
        key
    }

    fn entry_key(&self, index: LogIndex) -> Vec<u8> {
        let mut key = self.entries_prefix();
        key.extend_from_slice(&index.as_u64().to_be_bytes());
        key
    }

    fn meta_key(&self, name: &[u8]) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(name);
        key
    }

    /// Appends one entry.
    pub fn append_entry(&self, entry: &LogEntry) -> Result<(), MetaError> {
        self.kv.put(self.entry_key(entry.index), encode(entry)?)
    }

    /// Appends multiple entries atomically.
    pub fn append_entries(&self, entries: &[LogEntry]) -> Result<(), MetaError> {
        if entries.is_empty() {
            return Ok(());
        }
        let ops = entries
            .iter()
            .map(|entry| {
                Ok(BatchOp::Put {
                    key: self.entry_key(entry.index),
                    value: encode(entry)?,
                })
            })
            .collect::<Result<Vec<_>, MetaError>>()?;
        self.kv.write_batch(ops)
    }

    /// Replaces everything at or after the first of `entries` with `entries`,
    /// in one batch. `entries` must be contiguous.
    pub fn replace_from(&self, entries: &[LogEntry]) -> Result<(), MetaError> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let mut end_key = self.entries_prefix();
        end_key.extend_from_slice(&[0xff; 9]);
        let mut ops: Vec<BatchOp> = self
            .kv
            .scan_range(&self.entry_key(first.index), &end_key)?
            .into_iter()
            .map(|(key, _)| BatchOp::Delete { key })
            .collect();
        for entry in entries {
            ops.push(BatchOp::Put {
                key: self.entry_key(entry.index),
                value: encode(entry)?,
            });
        }
        self.kv.write_batch(ops)
    }

    /// Gets an entry by index.
    pub fn get_entry(&self, index: LogIndex) -> Result<Option<LogEntry>, MetaError> {
        match self.kv.get(&self.entry_key(index))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All retained entries with index >= `start`, in index order.
    pub fn entries_from(&self, start: LogIndex) -> Result<Vec<LogEntry>, MetaError> {
        let start_key = self.entry_key(start);
        let mut end_key = self.entries_prefix();
        end_key.extend_from_slice(&[0xff; 9]);
        self.kv
            .scan_range(&start_key, &end_key)?
            .into_iter()
            .map(|(_, value)| decode(&value))
            .collect()
    }

    /// Highest index removed by [`EntryStore::remove_through`].
    pub fn compacted_index(&self) -> Result<LogIndex, MetaError> {
        match self.kv.get(&self.meta_key(KEY_COMPACTED))? {
            Some(bytes) => Ok(LogIndex::new(u64_from_be_bytes(&bytes)?)),
            None => Ok(LogIndex::ZERO),
        }
    }

    /// Last index ever stored, counting compacted entries.
    pub fn last_index(&self) -> Result<LogIndex, MetaError> {
        let entries = self.kv.scan_prefix(&self.entries_prefix())?;
        let last = match entries.last() {
            Some((key, _)) => LogIndex::new(u64_from_be_bytes(&key[key.len() - 8..])?),
            None => LogIndex::ZERO,
        };
        Ok(last.max(self.compacted_index()?))
    }

    /// Number of retained entries.
    pub fn entry_count(&self) -> Result<usize, MetaError> {
        Ok(self.kv.scan_prefix(&self.entries_prefix())?.len())
    }

    fn removal_ops(&self, through: LogIndex) -> Result<Vec<BatchOp>, MetaError> {
        let start_key = self.entries_prefix();
        let end_key = self.entry_key(through.next());
        let mut ops: Vec<BatchOp> = self
            .kv
            .scan_range(&start_key, &end_key)?
            .into_iter()
            .map(|(key, _)| BatchOp::Delete { key })
            .collect();
        if through > self.compacted_index()? {
            ops.push(BatchOp::Put {
                key: self.meta_key(KEY_COMPACTED),
                value: through.as_u64().to_be_bytes().to_vec(),
            });
        }
        Ok(ops)
    }

    /// Removes every entry with index <= `through`.
    pub fn remove_through(&self, through: LogIndex) -> Result<(), MetaError> {
        let ops = self.removal_ops(through)?;
        if ops.is_empty() {
            return Ok(());
        }
        self.kv.write_batch(ops)
    }
}

/// A node's durable applied state: the last snapshot plus the entries applied
/// since it was taken.
pub struct LocalLog {
    kv: Arc<dyn KvStore>,
    entries: EntryStore,
    snapshot_key: Vec<u8>,
}

impl LocalLog {
    /// Creates the local log over `kv` under `prefix`.
    pub fn new(kv: Arc<dyn KvStore>, prefix: &[u8]) -> Self {
        let mut snapshot_key = prefix.to_vec();
        snapshot_key.extend_from_slice(KEY_SNAPSHOT);
        Self {
            entries: EntryStore::new(kv.clone(), prefix),
            kv,
            snapshot_key,
        }
    }

    /// Records an applied entry.
    pub fn append(&self, entry: &LogEntry) -> Result<(), MetaError> {
        self.entries.append_entry(entry)
    }

    /// Rebuilds the state: snapshot first, then every trailing entry in order.
    pub fn load(&self) -> Result<MetaData, MetaError> {
        let mut data = match self.kv.get(&self.snapshot_key)? {
            Some(bytes) => decode(&bytes)?,
            None => MetaData::new(),
        };
        for entry in self.entries.entries_from(data.index.next())? {
            // Outcomes were already reported when the entry was first applied.
            let _ = data.apply(entry.index, &entry.command);
        }
        Ok(data)
    }

    /// Writes `data` as the new snapshot and drops the entries it covers in
    /// the same batch, then compacts the underlying store.
    pub fn save_snapshot(&self, data: &MetaData) -> Result<(), MetaError> {
        let mut ops = self.entries.removal_ops(data.index)?;
        ops.push(BatchOp::Put {
            key: self.snapshot_key.clone(),
            value: encode(data)?,
        });
        self.kv.write_batch(ops)?;
        self.kv.compact()
    }

    /// Number of entries applied since the last snapshot.
    pub fn trailing_entries(&self) -> Result<usize, MetaError> {
        self.entries.entry_count()
    }
}

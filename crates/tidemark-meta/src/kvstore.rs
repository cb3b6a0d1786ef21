//! Embedded key-value store for metadata persistence.
//!
//! [`MemoryKvStore`] keeps everything in a `BTreeMap` and is used by tests and
//! by nodes configured without a data directory. [`FileKvStore`] keeps the same
//! map in memory and makes every batch durable in an append-only file that is
//! replayed on open.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, error, warn};

use crate::error::MetaError;
use crate::types::{decode, encode};

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Key-value store trait for metadata persistence.
///
/// The command log, the local applied log and the state snapshot are all
/// stored through this trait, so a node can run fully in memory or on disk.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError>;

    /// Scan all keys with the given prefix, returning (key, value) pairs in sorted order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError>;

    /// Scan a range of keys [start, end), returning (key, value) pairs in sorted order.
    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>, MetaError>;

    /// Atomically write a batch of operations (puts and deletes).
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Key, value: Value) -> Result<(), MetaError> {
        self.write_batch(vec![BatchOp::Put { key, value }])
    }

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &[u8]) -> Result<(), MetaError> {
        self.write_batch(vec![BatchOp::Delete { key: key.to_vec() }])
    }

    /// Returns true if the key exists.
    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError> {
        Ok(self.get(key)?.is_some())
    }

    /// Reclaims space held by overwritten and deleted keys.
    fn compact(&self) -> Result<(), MetaError> {
        Ok(())
    }
}

/// A single operation in a write batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: Vec<u8>,
        /// The value to store.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: Vec<u8>,
    },
}

type Tree = BTreeMap<Vec<u8>, Vec<u8>>;

fn lock_err<E: std::fmt::Display>(e: E) -> MetaError {
    MetaError::Storage(e.to_string())
}

fn tree_scan_prefix(tree: &Tree, prefix: &[u8]) -> Vec<KvPair> {
    tree.range::<Vec<u8>, _>(prefix.to_vec()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn tree_scan_range(tree: &Tree, start: &[u8], end: &[u8]) -> Vec<KvPair> {
    if start >= end {
        return Vec::new();
    }
    tree.range::<Vec<u8>, _>((Bound::Included(start.to_vec()), Bound::Excluded(end.to_vec())))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn tree_apply(tree: &mut Tree, ops: Vec<BatchOp>) {
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                tree.insert(key, value);
            }
            BatchOp::Delete { key } => {
                tree.remove(&key);
            }
        }
    }
}

/// In-memory KV store backed by a BTreeMap. Thread-safe via RwLock.
///
/// Clones share the same map, which lets tests hand one store to a node,
/// close the node and reopen it over the same data.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    data: Arc<RwLock<Tree>>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError> {
        let data = self.data.read().map_err(lock_err)?;
        Ok(data.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let data = self.data.read().map_err(lock_err)?;
        Ok(tree_scan_prefix(&data, prefix))
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let data = self.data.read().map_err(lock_err)?;
        Ok(tree_scan_range(&data, start, end))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError> {
        let mut data = self.data.write().map_err(lock_err)?;
        tree_apply(&mut data, ops);
        Ok(())
    }
}

const FRAME_HEADER_LEN: usize = 4 + 32;
const KV_FILE_NAME: &str = "kv.log";

fn frame(payload: &[u8]) -> Result<Vec<u8>, MetaError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| MetaError::Storage("write batch too large".to_string()))?;
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(blake3::hash(payload).as_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Replays frames from `bytes`, returning the rebuilt map and the length of
/// the valid prefix. Anything after the first torn or corrupt frame is ignored.
fn replay(bytes: &[u8]) -> (Tree, usize) {
    let mut tree = Tree::new();
    let mut pos = 0usize;
    while bytes.len() - pos >= FRAME_HEADER_LEN {
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&bytes[pos..pos + 4]);
        let len = u32::from_le_bytes(len_buf) as usize;
        let body_start = pos + FRAME_HEADER_LEN;
        if bytes.len() - body_start < len {
            break;
        }
        let payload = &bytes[body_start..body_start + len];
        if blake3::hash(payload).as_bytes()[..] != bytes[pos + 4..body_start] {
            break;
        }
        match decode::<Vec<BatchOp>>(payload) {
            Ok(ops) => tree_apply(&mut tree, ops),
            Err(_) => break,
        }
        pos = body_start + len;
    }
    (tree, pos)
}

/// The append-only file behind a [`FileKvStore`].
trait BatchFile: Write {
    fn len(&self) -> std::io::Result<u64>;
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
    fn sync(&mut self) -> std::io::Result<()>;
}

impl BatchFile for File {
    fn len(&self) -> std::io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data()
    }
}

/// Appends one frame and syncs it. On failure the file is cut back to its
/// previous length so a partial frame never sits in front of later ones.
fn append_frame(file: &mut impl BatchFile, buf: &[u8]) -> Result<(), MetaError> {
    let len = file.len()?;
    if let Err(e) = file.write_all(buf).and_then(|()| file.sync()) {
        if let Err(trunc) = file.truncate(len) {
            error!(error = %trunc, len, "failed to drop partial frame");
        }
        return Err(e.into());
    }
    Ok(())
}

/// Durable KV store: an in-memory map plus an append-only batch file.
///
/// Each batch is written as `[len u32][blake3 32 bytes][bincode ops]` and
/// fsynced before it becomes visible. On open, frames are replayed and a torn
/// or corrupt tail is truncated away.
pub struct FileKvStore {
    path: PathBuf,
    data: RwLock<Tree>,
    file: Mutex<File>,
}

impl FileKvStore {
    /// Opens (or creates) the store in `dir`.
    pub fn open(dir: &Path) -> Result<Self, MetaError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(KV_FILE_NAME);

        let mut bytes = Vec::new();
        if path.exists() {
            File::open(&path)?.read_to_end(&mut bytes)?;
        }
        let (tree, valid) = replay(&bytes);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if valid < bytes.len() {
            warn!(
                path = %path.display(),
                discarded = bytes.len() - valid,
                "truncating torn tail of kv log"
            );
            file.set_len(valid as u64)?;
            file.sync_all()?;
        }
        debug!(path = %path.display(), keys = tree.len(), "opened kv store");

        Ok(Self {
            path,
            data: RwLock::new(tree),
            file: Mutex::new(file),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError> {
        let data = self.data.read().map_err(lock_err)?;
        Ok(data.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let data = self.data.read().map_err(lock_err)?;
        Ok(tree_scan_prefix(&data, prefix))
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let data = self.data.read().map_err(lock_err)?;
        Ok(tree_scan_range(&data, start, end))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError> {
        if ops.is_empty() {
            return Ok(());
        }
        let buf = frame(&encode(&ops)?)?;
        let mut file = self.file.lock().map_err(lock_err)?;
        append_frame(&mut *file, &buf)?;
        let mut data = self.data.write().map_err(lock_err)?;
        tree_apply(&mut data, ops);
        Ok(())
    }

    fn compact(&self) -> Result<(), MetaError> {
        let mut file = self.file.lock().map_err(lock_err)?;
        let live: Vec<BatchOp> = {
            let data = self.data.read().map_err(lock_err)?;
            data.iter()
                .map(|(k, v)| BatchOp::Put {
                    key: k.clone(),
                    value: v.clone(),
                })
                .collect()
        };

        let tmp = self.path.with_extension("log.tmp");
        {
            let mut out = File::create(&tmp)?;
            if !live.is_empty() {
                out.write_all(&frame(&encode(&live)?)?)?;
            }
            out.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        *file = OpenOptions::new().append(true).open(&self.path)?;
        debug!(path = %self.path.display(), keys = live.len(), "compacted kv store");
        Ok(())
    }
}

#![warn(missing_docs)]

//! Tidemark metadata subsystem: replicated command log, deterministic meta store,
//! retention and shard group lifecycle, users, query authorization and normalization
//!
//! Write path: Command → CommandLog (quorum append) → apply loop → MetaData → Sync waiters
//! Read path:  MetaStore → read lock → MetaData

pub mod authorize;
pub mod command;
pub mod config;
pub mod data;
pub mod error;
pub mod info;
pub mod kvstore;
pub mod log;
pub mod log_store;
pub mod normalize;
pub mod password;
pub mod retention;
pub mod store;
pub mod sync;
pub mod types;

pub use authorize::authorize;
pub use command::{Command, LogEntry};
pub use config::{CommandLogConfig, MetaConfig};
pub use data::{AppliedEffect, MetaData};
pub use error::{ErrorKind, MetaError};
pub use info::{
    shard_group_duration, ContinuousQueryInfo, DatabaseInfo, NodeInfo, RetentionPolicyInfo,
    RetentionPolicyUpdate, ShardGroupInfo, ShardInfo, UserInfo,
};
pub use kvstore::{BatchOp, FileKvStore, KvStore, MemoryKvStore};
pub use log::{CommandLog, KvReplica, LogReplica};
pub use log_store::{EntryStore, LocalLog};
pub use normalize::{normalize_measurement, normalize_query, normalize_statement};
pub use password::{hash_password, verify_password};
pub use retention::{expired_shard_groups, shard_groups_to_precreate, PeriodicTask};
pub use store::{MetaStore, DEFAULT_RETENTION_POLICY_NAME};
pub use sync::AppliedIndex;
pub use types::{LogIndex, NodeId, MIN_RETENTION_POLICY_DURATION};

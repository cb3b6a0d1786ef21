//! Error types for the metadata store.

use thiserror::Error;

use crate::types::LogIndex;

/// Stable category of a [`MetaError`]. Callers branch on the kind, never on the variant.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A required field was empty or out of range.
    InvalidArgument,
    /// The entity being created already exists.
    AlreadyExists,
    /// The entity being referenced does not exist.
    NotFound,
    /// Failed privilege or authentication check.
    Unauthorized,
    /// The command log could not reach its write quorum.
    Unavailable,
    /// A wait did not complete within its deadline.
    Timeout,
    /// The store is not in the right lifecycle state for the call.
    FailedPrecondition,
    /// Serialization failure or on-disk corruption.
    Internal,
}

/// Errors returned by the metadata store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetaError {
    /// The store is already open.
    #[error("server already open")]
    ServerOpen,

    /// The store is closed.
    #[error("server closed")]
    ServerClosed,

    /// A node with the same URL is already registered.
    #[error("node already exists")]
    NodeExists,

    /// No node with the given id.
    #[error("node not found: {0}")]
    NodeNotFound(u64),

    /// Shard placement needs at least one registered node.
    #[error("no data nodes available")]
    NoDataNodes,

    /// Database name is empty.
    #[error("database name required")]
    DatabaseNameRequired,

    /// Database already exists.
    #[error("database exists")]
    DatabaseExists,

    /// Database does not exist.
    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    /// Retention policy name is empty.
    #[error("retention policy name required")]
    RetentionPolicyNameRequired,

    /// Retention policy already exists on the database.
    #[error("retention policy exists")]
    RetentionPolicyExists,

    /// Retention policy does not exist on the database.
    #[error("retention policy does not exist: {database}.{name}")]
    RetentionPolicyNotFound {
        /// Owning database
        database: String,
        /// Policy that was not found
        name: String,
    },

    /// Retention duration is non-zero but below the minimum.
    #[error("retention policy duration must be at least 1h")]
    RetentionPolicyDurationTooLow,

    /// Replication factor below one.
    #[error("replication factor must be at least 1")]
    ReplicationFactorTooLow,

    /// Measurement normalization needed a default policy but none is set.
    #[error("default retention policy not set for: {0}")]
    DefaultRetentionPolicyNotSet(String),

    /// User name is empty.
    #[error("username required")]
    UsernameRequired,

    /// User already exists.
    #[error("user exists")]
    UserExists,

    /// User does not exist.
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// Authentication failed. Deliberately does not say why.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Privilege check failed.
    #[error("authorize: {reason}")]
    Unauthorized {
        /// Human-readable explanation
        reason: String,
    },

    /// Measurement reference had no name.
    #[error("invalid measurement")]
    InvalidMeasurement,

    /// Continuous query name is empty.
    #[error("continuous query name required")]
    ContinuousQueryNameRequired,

    /// Continuous query already exists on the database.
    #[error("continuous query exists")]
    ContinuousQueryExists,

    /// Continuous query does not exist on the database.
    #[error("continuous query not found")]
    ContinuousQueryNotFound,

    /// Any other malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The command log could not durably accept an entry.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Sync did not observe the index before its deadline.
    #[error("timed out waiting for index {index} to be applied")]
    SyncTimeout {
        /// Index that was being waited on
        index: LogIndex,
    },

    /// Requested log entries were compacted into a snapshot.
    #[error("log entries before {first} were compacted (requested {requested})")]
    LogCompacted {
        /// First index that was requested
        requested: LogIndex,
        /// First index still retained
        first: LogIndex,
    },

    /// Encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The KV store or an on-disk file failed or is corrupt.
    #[error("storage error: {0}")]
    Storage(String),
}

impl MetaError {
    /// Returns the stable category of this error.
    pub fn kind(&self) -> ErrorKind {
        use MetaError::*;
        match self {
            DatabaseNameRequired
            | RetentionPolicyNameRequired
            | RetentionPolicyDurationTooLow
            | ReplicationFactorTooLow
            | UsernameRequired
            | InvalidMeasurement
            | ContinuousQueryNameRequired
            | InvalidArgument(_) => ErrorKind::InvalidArgument,
            NodeExists | DatabaseExists | RetentionPolicyExists | UserExists
            | ContinuousQueryExists => ErrorKind::AlreadyExists,
            NodeNotFound(_)
            | DatabaseNotFound(_)
            | RetentionPolicyNotFound { .. }
            | DefaultRetentionPolicyNotSet(_)
            | UserNotFound(_)
            | ContinuousQueryNotFound => ErrorKind::NotFound,
            AuthenticationFailed | Unauthorized { .. } => ErrorKind::Unauthorized,
            Unavailable(_) | NoDataNodes => ErrorKind::Unavailable,
            SyncTimeout { .. } => ErrorKind::Timeout,
            ServerOpen | ServerClosed | LogCompacted { .. } => ErrorKind::FailedPrecondition,
            Serialization(_) | Storage(_) => ErrorKind::Internal,
        }
    }
}

impl From<std::io::Error> for MetaError {
    fn from(e: std::io::Error) -> Self {
        MetaError::Storage(e.to_string())
    }
}

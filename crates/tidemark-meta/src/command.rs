//! Mutation commands carried by the command log.
//!
//! Commands are validated structurally (empty names, out of range values)
//! before they are appended. Checks that depend on the current state are made
//! when the command is applied, see [`crate::data::MetaData::apply`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tidemark_ql::Privilege;

use crate::error::MetaError;
use crate::info::{RetentionPolicyInfo, RetentionPolicyUpdate};
use crate::types::{LogIndex, NodeId, MIN_RETENTION_POLICY_DURATION};

/// A metadata mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Register a node reachable at `url`.
    CreateNode {
        /// Node URL.
        url: String,
    },
    /// Remove a node.
    DeleteNode {
        /// Node to remove.
        id: NodeId,
    },
    /// Create a database, optionally with an initial default policy.
    CreateDatabase {
        /// Database name.
        name: String,
        /// Policy created and set as default together with the database.
        default_policy: Option<RetentionPolicyInfo>,
    },
    /// Drop a database and everything it owns.
    DropDatabase {
        /// Database name.
        name: String,
    },
    /// Add a retention policy to a database.
    CreateRetentionPolicy {
        /// Owning database.
        database: String,
        /// Policy to create. Shard groups are ignored.
        policy: RetentionPolicyInfo,
    },
    /// Change fields of an existing policy.
    UpdateRetentionPolicy {
        /// Owning database.
        database: String,
        /// Current policy name.
        name: String,
        /// Fields to change.
        update: RetentionPolicyUpdate,
    },
    /// Remove a policy and its shard groups.
    DropRetentionPolicy {
        /// Owning database.
        database: String,
        /// Policy name.
        name: String,
    },
    /// Mark a policy as the database default.
    SetDefaultRetentionPolicy {
        /// Owning database.
        database: String,
        /// Policy name.
        name: String,
    },
    /// Create the shard group covering `timestamp` unless one already does.
    CreateShardGroupIfNotExists {
        /// Owning database.
        database: String,
        /// Owning policy.
        policy: String,
        /// Any instant inside the wanted bucket.
        timestamp: DateTime<Utc>,
    },
    /// Remove a shard group. Removing an absent group is a no-op.
    DeleteShardGroup {
        /// Owning database.
        database: String,
        /// Owning policy.
        policy: String,
        /// Shard group id.
        id: u64,
    },
    /// Create a user with an already-hashed password.
    CreateUser {
        /// User name.
        name: String,
        /// Encoded password hash.
        hash: String,
        /// Cluster administrator.
        admin: bool,
    },
    /// Replace a user's password hash.
    UpdateUser {
        /// User name.
        name: String,
        /// Encoded password hash.
        hash: String,
    },
    /// Remove a user.
    DropUser {
        /// User name.
        name: String,
    },
    /// Set (or with `NoPrivileges`, clear) a user's privilege on a database.
    SetUserPrivilege {
        /// User name.
        name: String,
        /// Database the grant applies to.
        database: String,
        /// New level.
        privilege: Privilege,
    },
    /// Grant or revoke cluster admin.
    SetAdminPrivilege {
        /// User name.
        name: String,
        /// New admin flag.
        admin: bool,
    },
    /// Register a continuous query on a database.
    CreateContinuousQuery {
        /// Owning database.
        database: String,
        /// Query name.
        name: String,
        /// Canonical query text.
        query: String,
    },
    /// Remove a continuous query.
    DropContinuousQuery {
        /// Owning database.
        database: String,
        /// Query name.
        name: String,
    },
}

fn require(value: &str, err: MetaError) -> Result<(), MetaError> {
    if value.is_empty() {
        Err(err)
    } else {
        Ok(())
    }
}

fn validate_duration(d: std::time::Duration) -> Result<(), MetaError> {
    if !d.is_zero() && d < MIN_RETENTION_POLICY_DURATION {
        return Err(MetaError::RetentionPolicyDurationTooLow);
    }
    Ok(())
}

fn validate_policy(policy: &RetentionPolicyInfo) -> Result<(), MetaError> {
    require(&policy.name, MetaError::RetentionPolicyNameRequired)?;
    validate_duration(policy.duration)
}

impl Command {
    /// Structural checks that need nothing but the command itself.
    pub fn validate(&self) -> Result<(), MetaError> {
        use Command::*;
        match self {
            CreateNode { url } => {
                require(url, MetaError::InvalidArgument("node url required".to_string()))
            }
            DeleteNode { .. } => Ok(()),
            CreateDatabase {
                name,
                default_policy,
            } => {
                require(name, MetaError::DatabaseNameRequired)?;
                match default_policy {
                    Some(policy) => validate_policy(policy),
                    None => Ok(()),
                }
            }
            DropDatabase { name } => require(name, MetaError::DatabaseNameRequired),
            CreateRetentionPolicy { database, policy } => {
                require(database, MetaError::DatabaseNameRequired)?;
                validate_policy(policy)
            }
            UpdateRetentionPolicy {
                database,
                name,
                update,
            } => {
                require(database, MetaError::DatabaseNameRequired)?;
                require(name, MetaError::RetentionPolicyNameRequired)?;
                if let Some(new_name) = &update.name {
                    require(new_name, MetaError::RetentionPolicyNameRequired)?;
                }
                if let Some(d) = update.duration {
                    validate_duration(d)?;
                }
                if update.replica_n == Some(0) {
                    return Err(MetaError::ReplicationFactorTooLow);
                }
                Ok(())
            }
            DropRetentionPolicy { database, name } | SetDefaultRetentionPolicy { database, name } => {
                require(database, MetaError::DatabaseNameRequired)?;
                require(name, MetaError::RetentionPolicyNameRequired)
            }
            CreateShardGroupIfNotExists {
                database, policy, ..
            }
            | DeleteShardGroup {
                database, policy, ..
            } => {
                require(database, MetaError::DatabaseNameRequired)?;
                require(policy, MetaError::RetentionPolicyNameRequired)
            }
            CreateUser { name, hash, .. } | UpdateUser { name, hash } => {
                require(name, MetaError::UsernameRequired)?;
                require(hash, MetaError::InvalidArgument("password hash required".to_string()))
            }
            DropUser { name } | SetAdminPrivilege { name, .. } => {
                require(name, MetaError::UsernameRequired)
            }
            SetUserPrivilege { name, database, .. } => {
                require(name, MetaError::UsernameRequired)?;
                require(database, MetaError::DatabaseNameRequired)
            }
            CreateContinuousQuery {
                database,
                name,
                query,
            } => {
                require(database, MetaError::DatabaseNameRequired)?;
                require(name, MetaError::ContinuousQueryNameRequired)?;
                require(query, MetaError::InvalidArgument("continuous query text required".to_string()))
            }
            DropContinuousQuery { database, name } => {
                require(database, MetaError::DatabaseNameRequired)?;
                require(name, MetaError::ContinuousQueryNameRequired)
            }
        }
    }

    /// Stable label used in logs.
    pub fn name(&self) -> &'static str {
        use Command::*;
        match self {
            CreateNode { .. } => "create_node",
            DeleteNode { .. } => "delete_node",
            CreateDatabase { .. } => "create_database",
            DropDatabase { .. } => "drop_database",
            CreateRetentionPolicy { .. } => "create_retention_policy",
            UpdateRetentionPolicy { .. } => "update_retention_policy",
            DropRetentionPolicy { .. } => "drop_retention_policy",
            SetDefaultRetentionPolicy { .. } => "set_default_retention_policy",
            CreateShardGroupIfNotExists { .. } => "create_shard_group",
            DeleteShardGroup { .. } => "delete_shard_group",
            CreateUser { .. } => "create_user",
            UpdateUser { .. } => "update_user",
            DropUser { .. } => "drop_user",
            SetUserPrivilege { .. } => "set_user_privilege",
            SetAdminPrivilege { .. } => "set_admin_privilege",
            CreateContinuousQuery { .. } => "create_continuous_query",
            DropContinuousQuery { .. } => "drop_continuous_query",
        }
    }
}

/// A committed command and its position in the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log, starting at 1.
    pub index: LogIndex,
    /// The mutation.
    pub command: Command,
}

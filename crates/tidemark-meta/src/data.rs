//! The deterministic metadata state machine.
//!
//! [`MetaData::apply`] is a pure function of the current state and a command:
//! every node that applies the same entries in the same order reaches the same
//! state and the same per-entry outcome. Handlers check everything they need
//! before touching state, so a failed command leaves the state unchanged.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tidemark_ql::Privilege;

use crate::command::Command;
use crate::error::MetaError;
use crate::info::{
    shard_group_duration, ContinuousQueryInfo, DatabaseInfo, NodeInfo, RetentionPolicyInfo,
    RetentionPolicyUpdate, ShardGroupInfo, ShardInfo, UserInfo,
};
use crate::types::{add_duration, floor_timestamp, LogIndex, NodeId};

/// Outcome of successfully applying a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppliedEffect {
    /// State changed.
    Applied,
    /// Command was a deterministic no-op (already present, already absent,
    /// or a redelivered entry).
    Unchanged,
    /// A node was registered.
    NodeCreated(NodeInfo),
    /// A shard group was created with this id.
    ShardGroupCreated(u64),
}

/// Full metadata state of the cluster as of [`MetaData::index`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaData {
    /// Index of the last applied log entry.
    pub index: LogIndex,
    nodes: Vec<NodeInfo>,
    databases: BTreeMap<String, DatabaseInfo>,
    users: BTreeMap<String, UserInfo>,
    max_node_id: u64,
    max_shard_group_id: u64,
    max_shard_id: u64,
}

impl MetaData {
    /// Empty state at index zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the entry at `index`.
    ///
    /// Entries at or below the current index have already been applied and are
    /// ignored. Errors are deterministic outcomes: the index still advances.
    pub fn apply(&mut self, index: LogIndex, command: &Command) -> Result<AppliedEffect, MetaError> {
        if index <= self.index {
            return Ok(AppliedEffect::Unchanged);
        }
        let result = command.validate().and_then(|_| self.apply_command(command));
        self.index = index;
        result
    }

    fn apply_command(&mut self, command: &Command) -> Result<AppliedEffect, MetaError> {
        use Command::*;
        match command {
            CreateNode { url } => self.create_node(url),
            DeleteNode { id } => self.delete_node(*id),
            CreateDatabase {
                name,
                default_policy,
            } => self.create_database(name, default_policy.as_ref()),
            DropDatabase { name } => self.drop_database(name),
            CreateRetentionPolicy { database, policy } => {
                self.create_retention_policy(database, policy)
            }
            UpdateRetentionPolicy {
                database,
                name,
                update,
            } => self.update_retention_policy(database, name, update),
            DropRetentionPolicy { database, name } => self.drop_retention_policy(database, name),
            SetDefaultRetentionPolicy { database, name } => {
                self.set_default_retention_policy(database, name)
            }
            CreateShardGroupIfNotExists {
                database,
                policy,
                timestamp,
            } => self.create_shard_group(database, policy, *timestamp),
            DeleteShardGroup {
                database,
                policy,
                id,
            } => self.delete_shard_group(database, policy, *id),
            CreateUser { name, hash, admin } => self.create_user(name, hash, *admin),
            UpdateUser { name, hash } => {
                self.user_mut(name)?.hash = hash.clone();
                Ok(AppliedEffect::Applied)
            }
            DropUser { name } => {
                self.users
                    .remove(name)
                    .ok_or_else(|| MetaError::UserNotFound(name.clone()))?;
                Ok(AppliedEffect::Applied)
            }
            SetUserPrivilege {
                name,
                database,
                privilege,
            } => self.set_user_privilege(name, database, *privilege),
            SetAdminPrivilege { name, admin } => {
                self.user_mut(name)?.admin = *admin;
                Ok(AppliedEffect::Applied)
            }
            CreateContinuousQuery {
                database,
                name,
                query,
            } => self.create_continuous_query(database, name, query),
            DropContinuousQuery { database, name } => self.drop_continuous_query(database, name),
        }
    }

    fn create_node(&mut self, url: &str) -> Result<AppliedEffect, MetaError> {
        if self.nodes.iter().any(|n| n.url == url) {
            return Err(MetaError::NodeExists);
        }
        self.max_node_id += 1;
        let node = NodeInfo {
            id: NodeId::new(self.max_node_id),
            url: url.to_string(),
        };
        self.nodes.push(node.clone());
        Ok(AppliedEffect::NodeCreated(node))
    }

    fn delete_node(&mut self, id: NodeId) -> Result<AppliedEffect, MetaError> {
        let pos = self
            .nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or(MetaError::NodeNotFound(id.as_u64()))?;
        self.nodes.remove(pos);
        Ok(AppliedEffect::Applied)
    }

    fn create_database(
        &mut self,
        name: &str,
        default_policy: Option<&RetentionPolicyInfo>,
    ) -> Result<AppliedEffect, MetaError> {
        if self.databases.contains_key(name) {
            return Err(MetaError::DatabaseExists);
        }
        let mut db = DatabaseInfo::new(name);
        if let Some(policy) = default_policy {
            db.default_retention_policy = Some(policy.name.clone());
            db.retention_policies.push(normalize_policy(policy));
        }
        self.databases.insert(name.to_string(), db);
        Ok(AppliedEffect::Applied)
    }

    fn drop_database(&mut self, name: &str) -> Result<AppliedEffect, MetaError> {
        self.databases
            .remove(name)
            .ok_or_else(|| MetaError::DatabaseNotFound(name.to_string()))?;
        Ok(AppliedEffect::Applied)
    }

    fn create_retention_policy(
        &mut self,
        database: &str,
        policy: &RetentionPolicyInfo,
    ) -> Result<AppliedEffect, MetaError> {
        let db = self.database_mut(database)?;
        if db.retention_policy(&policy.name).is_some() {
            return Err(MetaError::RetentionPolicyExists);
        }
        db.retention_policies.push(normalize_policy(policy));
        Ok(AppliedEffect::Applied)
    }

    fn update_retention_policy(
        &mut self,
        database: &str,
        name: &str,
        update: &RetentionPolicyUpdate,
    ) -> Result<AppliedEffect, MetaError> {
        let db = self.database_mut(database)?;
        if db.retention_policy(name).is_none() {
            return Err(rp_not_found(database, name));
        }
        if let Some(new_name) = update.name.as_deref() {
            if new_name != name && db.retention_policy(new_name).is_some() {
                return Err(MetaError::RetentionPolicyExists);
            }
        }

        let renamed_default = db.default_retention_policy.as_deref() == Some(name);
        let rp = db
            .retention_policy_mut(name)
            .ok_or_else(|| rp_not_found(database, name))?;
        if let Some(d) = update.duration {
            rp.duration = d;
        }
        if let Some(n) = update.replica_n {
            rp.replica_n = n;
        }
        if let Some(sgd) = update.shard_group_duration {
            rp.shard_group_duration = if sgd.is_zero() {
                shard_group_duration(rp.duration)
            } else {
                sgd
            };
        }
        if let Some(new_name) = &update.name {
            rp.name = new_name.clone();
            if renamed_default {
                db.default_retention_policy = Some(new_name.clone());
            }
        }
        Ok(AppliedEffect::Applied)
    }

    fn drop_retention_policy(&mut self, database: &str, name: &str) -> Result<AppliedEffect, MetaError> {
        let db = self.database_mut(database)?;
        let pos = db
            .retention_policies
            .iter()
            .position(|rp| rp.name == name)
            .ok_or_else(|| rp_not_found(database, name))?;
        db.retention_policies.remove(pos);
        if db.default_retention_policy.as_deref() == Some(name) {
            db.default_retention_policy = None;
        }
        Ok(AppliedEffect::Applied)
    }

    fn set_default_retention_policy(
        &mut self,
        database: &str,
        name: &str,
    ) -> Result<AppliedEffect, MetaError> {
        let db = self.database_mut(database)?;
        if db.retention_policy(name).is_none() {
            return Err(rp_not_found(database, name));
        }
        if db.default_retention_policy.as_deref() == Some(name) {
            return Ok(AppliedEffect::Unchanged);
        }
        db.default_retention_policy = Some(name.to_string());
        Ok(AppliedEffect::Applied)
    }

    fn create_shard_group(
        &mut self,
        database: &str,
        policy: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<AppliedEffect, MetaError> {
        let node_ids: Vec<NodeId> = self.nodes.iter().map(|n| n.id).collect();
        let group_id = self.max_shard_group_id + 1;
        let first_shard_id = self.max_shard_id + 1;

        let db = self
            .databases
            .get_mut(database)
            .ok_or_else(|| MetaError::DatabaseNotFound(database.to_string()))?;
        let rp = db
            .retention_policy_mut(policy)
            .ok_or_else(|| rp_not_found(database, policy))?;
        if rp.shard_group_by_timestamp(timestamp).is_some() {
            return Ok(AppliedEffect::Unchanged);
        }
        if node_ids.is_empty() {
            return Err(MetaError::NoDataNodes);
        }

        // Groups never overlap, even after the policy's group width changes:
        // the new bucket is clipped to the gap between its neighbours, which
        // always contains `timestamp` since no group covers it.
        let mut start_time = floor_timestamp(timestamp, rp.shard_group_duration)?;
        let mut end_time = add_duration(start_time, rp.shard_group_duration)?;
        if let Some(prev_end) = rp
            .shard_groups
            .iter()
            .map(|g| g.end_time)
            .filter(|end| *end <= timestamp)
            .max()
        {
            start_time = start_time.max(prev_end);
        }
        if let Some(next_start) = rp
            .shard_groups
            .iter()
            .map(|g| g.start_time)
            .filter(|start| *start > timestamp)
            .min()
        {
            end_time = end_time.min(next_start);
        }
        let shards = assign_shards(&node_ids, rp.replica_n, group_id, first_shard_id);

        self.max_shard_id += shards.len() as u64;
        self.max_shard_group_id = group_id;
        rp.shard_groups.push(ShardGroupInfo {
            id: group_id,
            start_time,
            end_time,
            shards,
        });
        rp.shard_groups.sort_by_key(|g| g.start_time);
        Ok(AppliedEffect::ShardGroupCreated(group_id))
    }

    fn delete_shard_group(
        &mut self,
        database: &str,
        policy: &str,
        id: u64,
    ) -> Result<AppliedEffect, MetaError> {
        let db = self.database_mut(database)?;
        let rp = db
            .retention_policy_mut(policy)
            .ok_or_else(|| rp_not_found(database, policy))?;
        match rp.shard_groups.iter().position(|g| g.id == id) {
            Some(pos) => {
                rp.shard_groups.remove(pos);
                Ok(AppliedEffect::Applied)
            }
            None => Ok(AppliedEffect::Unchanged),
        }
    }

    fn create_user(&mut self, name: &str, hash: &str, admin: bool) -> Result<AppliedEffect, MetaError> {
        if self.users.contains_key(name) {
            return Err(MetaError::UserExists);
        }
        self.users.insert(
            name.to_string(),
            UserInfo {
                name: name.to_string(),
                hash: hash.to_string(),
                admin,
                privileges: BTreeMap::new(),
            },
        );
        Ok(AppliedEffect::Applied)
    }

    fn set_user_privilege(
        &mut self,
        name: &str,
        database: &str,
        privilege: Privilege,
    ) -> Result<AppliedEffect, MetaError> {
        if !self.databases.contains_key(database) {
            return Err(MetaError::DatabaseNotFound(database.to_string()));
        }
        let user = self.user_mut(name)?;
        if privilege == Privilege::NoPrivileges {
            user.privileges.remove(database);
        } else {
            user.privileges.insert(database.to_string(), privilege);
        }
        Ok(AppliedEffect::Applied)
    }

    fn create_continuous_query(
        &mut self,
        database: &str,
        name: &str,
        query: &str,
    ) -> Result<AppliedEffect, MetaError> {
        let db = self.database_mut(database)?;
        if db.continuous_query(name).is_some() {
            return Err(MetaError::ContinuousQueryExists);
        }
        db.continuous_queries.push(ContinuousQueryInfo {
            name: name.to_string(),
            query: query.to_string(),
        });
        Ok(AppliedEffect::Applied)
    }

    fn drop_continuous_query(&mut self, database: &str, name: &str) -> Result<AppliedEffect, MetaError> {
        let db = self.database_mut(database)?;
        let pos = db
            .continuous_queries
            .iter()
            .position(|cq| cq.name == name)
            .ok_or(MetaError::ContinuousQueryNotFound)?;
        db.continuous_queries.remove(pos);
        Ok(AppliedEffect::Applied)
    }

    fn database_mut(&mut self, name: &str) -> Result<&mut DatabaseInfo, MetaError> {
        self.databases
            .get_mut(name)
            .ok_or_else(|| MetaError::DatabaseNotFound(name.to_string()))
    }

    fn user_mut(&mut self, name: &str) -> Result<&mut UserInfo, MetaError> {
        self.users
            .get_mut(name)
            .ok_or_else(|| MetaError::UserNotFound(name.to_string()))
    }

    /// Returns the node with the given id.
    pub fn node(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Returns the node registered under `url`.
    pub fn node_by_url(&self, url: &str) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.url == url)
    }

    /// All nodes ordered by id.
    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    /// Returns the database with the given name.
    pub fn database(&self, name: &str) -> Option<&DatabaseInfo> {
        self.databases.get(name)
    }

    /// Database names in sorted order.
    pub fn database_names(&self) -> Vec<String> {
        self.databases.keys().cloned().collect()
    }

    /// All databases in name order.
    pub fn databases(&self) -> impl Iterator<Item = &DatabaseInfo> {
        self.databases.values()
    }

    /// Looks up a retention policy. Fails if the database does not exist.
    pub fn retention_policy(
        &self,
        database: &str,
        name: &str,
    ) -> Result<Option<&RetentionPolicyInfo>, MetaError> {
        let db = self
            .database(database)
            .ok_or_else(|| MetaError::DatabaseNotFound(database.to_string()))?;
        Ok(db.retention_policy(name))
    }

    /// Returns the user with the given name.
    pub fn user(&self, name: &str) -> Option<&UserInfo> {
        self.users.get(name)
    }

    /// All users in name order.
    pub fn users(&self) -> impl Iterator<Item = &UserInfo> {
        self.users.values()
    }

    /// Returns true if at least one admin user exists.
    pub fn admin_user_exists(&self) -> bool {
        self.users.values().any(|u| u.admin)
    }
}

fn rp_not_found(database: &str, name: &str) -> MetaError {
    MetaError::RetentionPolicyNotFound {
        database: database.to_string(),
        name: name.to_string(),
    }
}

fn normalize_policy(policy: &RetentionPolicyInfo) -> RetentionPolicyInfo {
    let mut rp = policy.clone();
    rp.shard_groups.clear();
    if rp.replica_n == 0 {
        rp.replica_n = 1;
    }
    if rp.shard_group_duration.is_zero() {
        rp.shard_group_duration = shard_group_duration(rp.duration);
    }
    rp
}

/// Spreads shards of a new group across `node_ids`.
///
/// The replication factor is capped at the node count. The group gets
/// `nodes / replica_n` shards (at least one) and owners are taken round robin,
/// starting at an offset derived from the group id so consecutive groups land
/// on different nodes.
fn assign_shards(node_ids: &[NodeId], replica_n: u32, group_id: u64, first_shard_id: u64) -> Vec<ShardInfo> {
    let n = node_ids.len();
    let replica_n = (replica_n as usize).clamp(1, n);
    let shard_n = (n / replica_n).max(1);
    let offset = (group_id % n as u64) as usize;
    (0..shard_n)
        .map(|i| ShardInfo {
            id: first_shard_id + i as u64,
            owners: (0..replica_n)
                .map(|j| node_ids[(offset + i * replica_n + j) % n])
                .collect(),
        })
        .collect()
}

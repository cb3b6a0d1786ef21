//! Metadata entities held by the state machine.
//!
//! Entities reference each other by name or id only, so every structure here
//! serializes independently and a snapshot is just the owning [`crate::data::MetaData`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use tidemark_ql::Privilege;

use crate::types::NodeId;

const HOUR: Duration = Duration::from_secs(3_600);
const DAY: Duration = Duration::from_secs(86_400);

/// Default shard group width for a retention policy of duration `d`.
///
/// Infinite or very long policies (>= 180 days) get weekly groups, policies of
/// two days or more get daily groups and anything shorter gets hourly groups.
pub fn shard_group_duration(d: Duration) -> Duration {
    if d.is_zero() || d >= DAY * 180 {
        DAY * 7
    } else if d >= DAY * 2 {
        DAY
    } else {
        HOUR
    }
}

/// A registered cluster node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique, monotonically assigned id.
    pub id: NodeId,
    /// URL the node is reachable at, unique across nodes.
    pub url: String,
}

/// A single shard and the nodes that hold its replicas.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Cluster-unique shard id.
    pub id: u64,
    /// Replica owners; length equals the policy's effective replication factor.
    pub owners: Vec<NodeId>,
}

/// A time bucket of a retention policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGroupInfo {
    /// Cluster-unique shard group id.
    pub id: u64,
    /// Inclusive bucket start.
    pub start_time: DateTime<Utc>,
    /// Exclusive bucket end.
    pub end_time: DateTime<Utc>,
    /// Shards in the group.
    pub shards: Vec<ShardInfo>,
}

impl ShardGroupInfo {
    /// Returns true if `ts` falls inside `[start_time, end_time)`.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start_time <= ts && ts < self.end_time
    }

    /// Returns true if the group intersects `[min, max]`.
    pub fn overlaps(&self, min: DateTime<Utc>, max: DateTime<Utc>) -> bool {
        self.start_time <= max && self.end_time > min
    }
}

/// Retention and replication configuration of a database.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicyInfo {
    /// Name, unique within the database.
    pub name: String,
    /// How long data is kept; zero is infinite.
    pub duration: Duration,
    /// Width of each shard group bucket; zero means derive from `duration`.
    pub shard_group_duration: Duration,
    /// Replication factor.
    pub replica_n: u32,
    /// Shard groups ordered by start time.
    pub shard_groups: Vec<ShardGroupInfo>,
}

impl RetentionPolicyInfo {
    /// Policy with infinite duration, a single replica and derived group width.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            duration: Duration::ZERO,
            shard_group_duration: Duration::ZERO,
            replica_n: 1,
            shard_groups: Vec::new(),
        }
    }

    /// Sets the retention duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Sets the replication factor.
    pub fn with_replica_n(mut self, replica_n: u32) -> Self {
        self.replica_n = replica_n;
        self
    }

    /// Returns the group covering `ts`, if any.
    pub fn shard_group_by_timestamp(&self, ts: DateTime<Utc>) -> Option<&ShardGroupInfo> {
        self.shard_groups.iter().find(|g| g.contains(ts))
    }

    /// Returns the shard group with the given id.
    pub fn shard_group(&self, id: u64) -> Option<&ShardGroupInfo> {
        self.shard_groups.iter().find(|g| g.id == id)
    }
}

/// Partial update applied by `UpdateRetentionPolicy`. Unset fields are left unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicyUpdate {
    /// New name.
    pub name: Option<String>,
    /// New retention duration.
    pub duration: Option<Duration>,
    /// New replication factor.
    pub replica_n: Option<u32>,
    /// New shard group width.
    pub shard_group_duration: Option<Duration>,
}

impl RetentionPolicyUpdate {
    /// Returns true if the update changes nothing.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.duration.is_none()
            && self.replica_n.is_none()
            && self.shard_group_duration.is_none()
    }
}

/// A registered continuous query. Execution happens elsewhere.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuousQueryInfo {
    /// Name, unique within the database.
    pub name: String,
    /// Canonical query text.
    pub query: String,
}

/// A database and everything it owns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    /// Unique database name.
    pub name: String,
    /// Name of the default retention policy, if one is set.
    pub default_retention_policy: Option<String>,
    /// Retention policies in creation order.
    pub retention_policies: Vec<RetentionPolicyInfo>,
    /// Continuous queries in creation order.
    pub continuous_queries: Vec<ContinuousQueryInfo>,
}

impl DatabaseInfo {
    /// Empty database named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_retention_policy: None,
            retention_policies: Vec::new(),
            continuous_queries: Vec::new(),
        }
    }

    /// Looks up a retention policy by name.
    pub fn retention_policy(&self, name: &str) -> Option<&RetentionPolicyInfo> {
        self.retention_policies.iter().find(|rp| rp.name == name)
    }

    pub(crate) fn retention_policy_mut(&mut self, name: &str) -> Option<&mut RetentionPolicyInfo> {
        self.retention_policies.iter_mut().find(|rp| rp.name == name)
    }

    /// Returns the default retention policy, if one is set and exists.
    pub fn default_policy(&self) -> Option<&RetentionPolicyInfo> {
        self.default_retention_policy
            .as_deref()
            .and_then(|name| self.retention_policy(name))
    }

    /// Looks up a continuous query by name.
    pub fn continuous_query(&self, name: &str) -> Option<&ContinuousQueryInfo> {
        self.continuous_queries.iter().find(|cq| cq.name == name)
    }
}

/// A user account. The password is only ever stored as a salted hash.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Unique user name.
    pub name: String,
    /// Encoded password hash (see [`crate::password`]).
    pub hash: String,
    /// Cluster administrator.
    pub admin: bool,
    /// Explicit per-database grants.
    pub privileges: BTreeMap<String, Privilege>,
}

impl UserInfo {
    /// Returns true if the user holds at least `privilege` on `database`.
    /// Admins hold every privilege on every database.
    pub fn authorize(&self, privilege: Privilege, database: &str) -> bool {
        if self.admin {
            return true;
        }
        self.privileges
            .get(database)
            .is_some_and(|held| held.satisfies(privilege))
    }
}

impl std::fmt::Debug for UserInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserInfo")
            .field("name", &self.name)
            .field("hash", &"<redacted>")
            .field("admin", &self.admin)
            .field("privileges", &self.privileges)
            .finish()
    }
}

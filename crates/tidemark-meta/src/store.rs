//! The metadata store: one node's view of the replicated metadata.
//!
//! Mutations are proposed to the [`CommandLog`], and the caller then waits
//! until the local apply loop has reached the returned index before collecting
//! the entry's outcome. Reads are served from the in-memory [`MetaData`] under
//! a read lock, so they never observe a half-applied command.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tidemark_ql::{ContinuousQueryStatement, Measurement, Privilege, Query, Statement};

use crate::authorize::authorize;
use crate::command::{Command, LogEntry};
use crate::config::MetaConfig;
use crate::data::{AppliedEffect, MetaData};
use crate::error::MetaError;
use crate::info::{
    ContinuousQueryInfo, DatabaseInfo, NodeInfo, RetentionPolicyInfo, RetentionPolicyUpdate,
    ShardGroupInfo, UserInfo,
};
use crate::kvstore::KvStore;
use crate::log::CommandLog;
use crate::log_store::LocalLog;
use crate::normalize;
use crate::password::{dummy_hash, hash_password, verify_password};
use crate::retention::{expired_shard_groups, shard_groups_to_precreate, PeriodicTask};
use crate::sync::AppliedIndex;
use crate::types::{LogIndex, NodeId};

/// Name of the retention policy created together with a database when
/// auto-creation is enabled.
pub const DEFAULT_RETENTION_POLICY_NAME: &str = "default";

const LOCAL_PREFIX: &[u8] = b"local/";
const RETENTION_TASK: &str = "retention enforcement";
const PRECREATE_TASK: &str = "shard group precreation";

type Outcome = Result<AppliedEffect, MetaError>;

/// Apply outcomes waiting to be collected by their submitters.
///
/// Bounded: once full, the oldest outcomes are dropped. Entries proposed by
/// other nodes are recorded too and simply age out.
struct Outcomes {
    capacity: usize,
    pending: BTreeMap<LogIndex, Outcome>,
}

impl Outcomes {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pending: BTreeMap::new(),
        }
    }

    fn record(&mut self, index: LogIndex, outcome: Outcome) {
        self.pending.insert(index, outcome);
        while self.pending.len() > self.capacity {
            self.pending.pop_first();
        }
    }

    fn take(&mut self, index: LogIndex) -> Option<Outcome> {
        self.pending.remove(&index)
    }
}

#[derive(Default)]
struct Lifecycle {
    open: bool,
    shutdown: Option<watch::Sender<bool>>,
    apply_task: Option<JoinHandle<()>>,
    tasks: Vec<PeriodicTask>,
}

struct Shared {
    config: MetaConfig,
    log: Arc<CommandLog>,
    local: LocalLog,
    state: RwLock<MetaData>,
    applied: AppliedIndex,
    /// Index of the latest local snapshot.
    snapshot_index: AtomicU64,
    outcomes: Mutex<Outcomes>,
    authentication_enabled: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

impl Shared {
    fn read<T>(&self, f: impl FnOnce(&MetaData) -> T) -> T {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        f(&state)
    }

    fn is_open(&self) -> bool {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()).open
    }

    /// Applies every committed entry past the local watermark.
    fn catch_up(&self) -> Result<usize, MetaError> {
        let entries = self.log.entries_from(self.applied.current().next())?;
        let count = entries.len();
        for entry in &entries {
            self.apply_entry(entry)?;
        }
        Ok(count)
    }

    fn apply_entry(&self, entry: &LogEntry) -> Result<(), MetaError> {
        self.local.append(entry)?;
        let outcome = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.apply(entry.index, &entry.command)
        };
        match &outcome {
            Ok(effect) => {
                debug!(index = %entry.index, command = entry.command.name(), ?effect, "applied")
            }
            Err(e) => {
                debug!(index = %entry.index, command = entry.command.name(), error = %e, "apply rejected")
            }
        }
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(entry.index, outcome);
        self.applied.advance(entry.index);

        if entry.index.as_u64() % self.config.snapshot_interval == 0 {
            self.save_snapshot()?;
        }
        Ok(())
    }

    fn save_snapshot(&self) -> Result<(), MetaError> {
        let data = self.read(|d| d.clone());
        self.local.save_snapshot(&data)?;
        self.snapshot_index.store(data.index.as_u64(), Ordering::SeqCst);
        info!(index = %data.index, "local snapshot saved");
        Ok(())
    }

    /// Drops command log entries more than `retain_entries` behind the local
    /// snapshot.
    async fn compact_log(&self) -> Result<(), MetaError> {
        let snapshot = self.snapshot_index.load(Ordering::SeqCst);
        let through = LogIndex::new(snapshot.saturating_sub(self.config.command_log.retain_entries));
        if through < self.log.first_index()? {
            return Ok(());
        }
        self.log.compact_through(through).await
    }

    fn take_outcome(&self, index: LogIndex) -> Outcome {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take(index)
            .unwrap_or_else(|| {
                warn!(index = %index, "apply outcome no longer available");
                Err(MetaError::Unavailable(format!(
                    "outcome of entry {} is no longer available",
                    index
                )))
            })
    }
}

async fn run_apply_loop(
    shared: Weak<Shared>,
    mut committed: watch::Receiver<LogIndex>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let _ = committed.borrow_and_update();
        {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            if let Err(e) = shared.catch_up() {
                error!(error = %e, applied = %shared.applied.current(), "apply loop failed");
            }
            if let Err(e) = shared.compact_log().await {
                warn!(error = %e, "command log compaction failed");
            }
        }
        tokio::select! {
            changed = committed.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("apply loop stopped");
}

/// A node's metadata store.
///
/// Cheap to clone; clones share the same state. Background tasks hold only a
/// weak reference, so dropping every clone releases the store.
#[derive(Clone)]
pub struct MetaStore {
    shared: Arc<Shared>,
}

impl MetaStore {
    /// Creates a closed store that applies entries from `log` and keeps its
    /// local snapshot and applied entries in `kv`.
    pub fn new(config: MetaConfig, log: Arc<CommandLog>, kv: Arc<dyn KvStore>) -> Self {
        let outcomes = Outcomes::new(config.outcome_capacity);
        let authentication_enabled = AtomicBool::new(config.authentication_enabled);
        Self {
            shared: Arc::new(Shared {
                config,
                log,
                local: LocalLog::new(kv, LOCAL_PREFIX),
                state: RwLock::new(MetaData::new()),
                applied: AppliedIndex::new(),
                snapshot_index: AtomicU64::new(0),
                outcomes: Mutex::new(outcomes),
                authentication_enabled,
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    /// The configuration the store was created with.
    pub fn config(&self) -> &MetaConfig {
        &self.shared.config
    }

    /// Loads the local snapshot, replays the entries applied since, catches up
    /// with the command log and starts the apply loop.
    pub fn open(&self) -> Result<(), MetaError> {
        self.shared
            .config
            .validate()
            .map_err(|e| MetaError::InvalidArgument(e.to_string()))?;
        let mut lifecycle = self.shared.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if lifecycle.open {
            return Err(MetaError::ServerOpen);
        }

        let data = self.shared.local.load()?;
        let loaded = data.index;
        self.shared.snapshot_index.store(loaded.as_u64(), Ordering::SeqCst);
        *self.shared.state.write().unwrap_or_else(|e| e.into_inner()) = data;
        self.shared.applied.reset(loaded);
        let caught_up = self.shared.catch_up()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let apply_task = tokio::spawn(run_apply_loop(
            Arc::downgrade(&self.shared),
            self.shared.log.subscribe(),
            shutdown_rx,
        ));
        lifecycle.open = true;
        lifecycle.shutdown = Some(shutdown);
        lifecycle.apply_task = Some(apply_task);

        info!(
            url = %self.shared.config.bind_url,
            snapshot_index = %loaded,
            applied_index = %self.shared.applied.current(),
            caught_up,
            "meta store opened"
        );
        Ok(())
    }

    /// Stops background tasks and the apply loop, releases Sync waiters and
    /// saves a local snapshot. Closing a closed store is a no-op.
    pub async fn close(&self) -> Result<(), MetaError> {
        let (shutdown, apply_task, tasks) = {
            let mut lifecycle = self.shared.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            if !lifecycle.open {
                return Ok(());
            }
            lifecycle.open = false;
            (
                lifecycle.shutdown.take(),
                lifecycle.apply_task.take(),
                std::mem::take(&mut lifecycle.tasks),
            )
        };

        for task in tasks {
            task.stop().await;
        }
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(apply_task) = apply_task {
            let _ = apply_task.await;
        }
        self.shared.applied.close();
        self.shared.save_snapshot()?;
        self.shared.compact_log().await?;
        info!(url = %self.shared.config.bind_url, "meta store closed");
        Ok(())
    }

    /// Returns true between [`MetaStore::open`] and [`MetaStore::close`].
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    fn ensure_open(&self) -> Result<(), MetaError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(MetaError::ServerClosed)
        }
    }

    /// Appends `command`, waits for it to be applied locally and returns its
    /// index together with the apply outcome.
    async fn submit(&self, command: Command) -> Result<(LogIndex, Outcome), MetaError> {
        self.ensure_open()?;
        let index = self.shared.log.append(command).await?;
        self.shared
            .applied
            .wait(index, self.shared.config.sync_timeout())
            .await?;
        Ok((index, self.shared.take_outcome(index)))
    }

    async fn propose(&self, command: Command) -> Result<(LogIndex, AppliedEffect), MetaError> {
        let (index, outcome) = self.submit(command).await?;
        Ok((index, outcome?))
    }

    async fn execute(&self, command: Command) -> Result<LogIndex, MetaError> {
        Ok(self.propose(command).await?.0)
    }

    // Consistency

    /// Highest index applied to local state.
    pub fn applied_index(&self) -> LogIndex {
        self.shared.applied.current()
    }

    /// Waits until the entry at `index` has been applied locally.
    pub async fn sync(&self, index: LogIndex, timeout: Duration) -> Result<(), MetaError> {
        self.shared.applied.wait(index, timeout).await
    }

    // Nodes

    /// Registers this node under its configured URL if it is not already known.
    pub async fn initialize(&self) -> Result<NodeInfo, MetaError> {
        let url = self.shared.config.bind_url.clone();
        if let Some(node) = self.node_by_url(&url) {
            return Ok(node);
        }
        match self.create_node(&url).await {
            Err(MetaError::NodeExists) => self.node_by_url(&url).ok_or(MetaError::NodeExists),
            result => result,
        }
    }

    /// Id of this node, once [`MetaStore::initialize`] has registered it.
    pub fn node_id(&self) -> Option<NodeId> {
        self.node_by_url(&self.shared.config.bind_url).map(|n| n.id)
    }

    /// Registers a node reachable at `url`.
    pub async fn create_node(&self, url: &str) -> Result<NodeInfo, MetaError> {
        let command = Command::CreateNode {
            url: url.to_string(),
        };
        match self.propose(command).await? {
            (_, AppliedEffect::NodeCreated(node)) => Ok(node),
            (index, effect) => {
                warn!(index = %index, ?effect, "unexpected create node outcome");
                self.node_by_url(url)
                    .ok_or_else(|| MetaError::Unavailable(format!("node {} not registered", url)))
            }
        }
    }

    /// Removes a node.
    pub async fn delete_node(&self, id: NodeId) -> Result<LogIndex, MetaError> {
        self.execute(Command::DeleteNode { id }).await
    }

    /// Returns the node with the given id.
    pub fn node(&self, id: NodeId) -> Option<NodeInfo> {
        self.shared.read(|d| d.node(id).cloned())
    }

    /// Returns the node registered under `url`.
    pub fn node_by_url(&self, url: &str) -> Option<NodeInfo> {
        self.shared.read(|d| d.node_by_url(url).cloned())
    }

    /// All nodes, ordered by id.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.shared.read(|d| d.nodes().to_vec())
    }

    // Databases

    /// Creates a database. With auto-creation enabled it also gets a
    /// `default` retention policy of infinite duration.
    pub async fn create_database(&self, name: &str) -> Result<LogIndex, MetaError> {
        let default_policy = self
            .shared
            .config
            .retention_auto_create
            .then(|| RetentionPolicyInfo::new(DEFAULT_RETENTION_POLICY_NAME));
        self.execute(Command::CreateDatabase {
            name: name.to_string(),
            default_policy,
        })
        .await
    }

    /// Creates a database unless it already exists.
    pub async fn create_database_if_not_exists(&self, name: &str) -> Result<LogIndex, MetaError> {
        if self.database_exists(name) {
            return Ok(self.applied_index());
        }
        match self.create_database(name).await {
            Err(MetaError::DatabaseExists) => Ok(self.applied_index()),
            result => result,
        }
    }

    /// Drops a database with its policies, shard groups and continuous queries.
    pub async fn drop_database(&self, name: &str) -> Result<LogIndex, MetaError> {
        self.execute(Command::DropDatabase {
            name: name.to_string(),
        })
        .await
    }

    /// Database names in sorted order.
    pub fn databases(&self) -> Vec<String> {
        self.shared.read(|d| d.database_names())
    }

    /// Returns the database with the given name.
    pub fn database(&self, name: &str) -> Option<DatabaseInfo> {
        self.shared.read(|d| d.database(name).cloned())
    }

    /// Returns true if the database exists.
    pub fn database_exists(&self, name: &str) -> bool {
        self.shared.read(|d| d.database(name).is_some())
    }

    // Retention policies

    /// Adds a retention policy to a database.
    pub async fn create_retention_policy(
        &self,
        database: &str,
        policy: RetentionPolicyInfo,
    ) -> Result<LogIndex, MetaError> {
        self.execute(Command::CreateRetentionPolicy {
            database: database.to_string(),
            policy,
        })
        .await
    }

    /// Changes the fields set in `update`.
    pub async fn update_retention_policy(
        &self,
        database: &str,
        name: &str,
        update: RetentionPolicyUpdate,
    ) -> Result<LogIndex, MetaError> {
        self.execute(Command::UpdateRetentionPolicy {
            database: database.to_string(),
            name: name.to_string(),
            update,
        })
        .await
    }

    /// Removes a policy and its shard groups.
    pub async fn drop_retention_policy(&self, database: &str, name: &str) -> Result<LogIndex, MetaError> {
        self.execute(Command::DropRetentionPolicy {
            database: database.to_string(),
            name: name.to_string(),
        })
        .await
    }

    /// Marks a policy as the database default.
    pub async fn set_default_retention_policy(
        &self,
        database: &str,
        name: &str,
    ) -> Result<LogIndex, MetaError> {
        self.execute(Command::SetDefaultRetentionPolicy {
            database: database.to_string(),
            name: name.to_string(),
        })
        .await
    }

    /// Looks up a policy. Fails with `DatabaseNotFound` if the database is missing.
    pub fn retention_policy(
        &self,
        database: &str,
        name: &str,
    ) -> Result<Option<RetentionPolicyInfo>, MetaError> {
        self.shared
            .read(|d| d.retention_policy(database, name).map(|rp| rp.cloned()))
    }

    /// The database's default policy, if one is set.
    pub fn default_retention_policy(&self, database: &str) -> Result<Option<RetentionPolicyInfo>, MetaError> {
        self.with_database(database, |db| db.default_policy().cloned())
    }

    /// Every policy of a database.
    pub fn retention_policies(&self, database: &str) -> Result<Vec<RetentionPolicyInfo>, MetaError> {
        self.with_database(database, |db| db.retention_policies.clone())
    }

    fn with_database<T>(&self, database: &str, f: impl FnOnce(&DatabaseInfo) -> T) -> Result<T, MetaError> {
        self.shared.read(|d| {
            d.database(database)
                .map(f)
                .ok_or_else(|| MetaError::DatabaseNotFound(database.to_string()))
        })
    }

    // Shard groups

    /// Creates the shard group covering `timestamp` unless one already exists.
    pub async fn create_shard_group_if_not_exists(
        &self,
        database: &str,
        policy: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<LogIndex, MetaError> {
        self.execute(Command::CreateShardGroupIfNotExists {
            database: database.to_string(),
            policy: policy.to_string(),
            timestamp,
        })
        .await
    }

    /// Removes a shard group. Removing a missing group is a no-op.
    pub async fn delete_shard_group(&self, database: &str, policy: &str, id: u64) -> Result<LogIndex, MetaError> {
        self.execute(Command::DeleteShardGroup {
            database: database.to_string(),
            policy: policy.to_string(),
            id,
        })
        .await
    }

    /// Every shard group of every policy in a database.
    pub fn shard_groups(&self, database: &str) -> Result<Vec<ShardGroupInfo>, MetaError> {
        self.with_database(database, |db| {
            db.retention_policies
                .iter()
                .flat_map(|rp| rp.shard_groups.iter().cloned())
                .collect()
        })
    }

    /// Shard groups of one policy that intersect `[min, max]`, ordered by start time.
    pub fn shard_groups_by_time_range(
        &self,
        database: &str,
        policy: &str,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Result<Vec<ShardGroupInfo>, MetaError> {
        let rp = self.retention_policy(database, policy)?.ok_or_else(|| {
            MetaError::RetentionPolicyNotFound {
                database: database.to_string(),
                name: policy.to_string(),
            }
        })?;
        Ok(rp
            .shard_groups
            .into_iter()
            .filter(|g| g.overlaps(min, max))
            .collect())
    }

    /// Deletes every shard group that has aged out as of `now`. Returns the
    /// number of groups removed.
    pub async fn enforce_retention_policies(&self, now: DateTime<Utc>) -> Result<usize, MetaError> {
        let commands = self.shared.read(|d| expired_shard_groups(d, now));
        let deleted = self
            .propose_each(RETENTION_TASK, commands)
            .await?
            .iter()
            .filter(|effect| **effect == AppliedEffect::Applied)
            .count();
        if deleted > 0 {
            info!(deleted, "expired shard groups deleted");
        }
        Ok(deleted)
    }

    /// Creates the next shard group of every policy whose latest group ends
    /// within `advance` of `now`. Returns the number of groups created.
    pub async fn precreate_shard_groups(
        &self,
        now: DateTime<Utc>,
        advance: Duration,
    ) -> Result<usize, MetaError> {
        let commands = self.shared.read(|d| shard_groups_to_precreate(d, now, advance))?;
        let created = self
            .propose_each(PRECREATE_TASK, commands)
            .await?
            .iter()
            .filter(|effect| matches!(effect, AppliedEffect::ShardGroupCreated(_)))
            .count();
        if created > 0 {
            info!(created, "shard groups precreated");
        }
        Ok(created)
    }

    /// Proposes each of a maintenance pass's commands and returns the effects
    /// of those that applied. A rejected command is logged and skipped; only a
    /// closed store ends the pass early.
    async fn propose_each(
        &self,
        task: &str,
        commands: Vec<Command>,
    ) -> Result<Vec<AppliedEffect>, MetaError> {
        let mut effects = Vec::with_capacity(commands.len());
        for command in commands {
            let name = command.name();
            match self.propose(command).await {
                Ok((_, effect)) => effects.push(effect),
                Err(MetaError::ServerClosed) => return Err(MetaError::ServerClosed),
                Err(e) => warn!(task, command = name, error = %e, "maintenance command failed"),
            }
        }
        Ok(effects)
    }

    /// Runs retention enforcement every `interval` until the store closes.
    /// Replaces an enforcement task that is already running.
    pub fn start_retention_policy_enforcement(&self, interval: Duration) -> Result<(), MetaError> {
        let weak = Arc::downgrade(&self.shared);
        let task = PeriodicTask::spawn(RETENTION_TASK, interval, move || {
            let weak = weak.clone();
            async move {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let store = MetaStore { shared };
                if let Err(e) = store.enforce_retention_policies(Utc::now()).await {
                    warn!(error = %e, "retention enforcement failed");
                }
            }
        })?;
        self.register_task(task)
    }

    /// Runs shard group precreation every `check_interval` until the store
    /// closes. Replaces a precreation task that is already running.
    pub fn start_shard_group_precreation(
        &self,
        check_interval: Duration,
        advance: Duration,
    ) -> Result<(), MetaError> {
        let weak = Arc::downgrade(&self.shared);
        let task = PeriodicTask::spawn(PRECREATE_TASK, check_interval, move || {
            let weak = weak.clone();
            async move {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let store = MetaStore { shared };
                if let Err(e) = store.precreate_shard_groups(Utc::now(), advance).await {
                    warn!(error = %e, "shard group precreation failed");
                }
            }
        })?;
        self.register_task(task)
    }

    fn register_task(&self, task: PeriodicTask) -> Result<(), MetaError> {
        let mut lifecycle = self.shared.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if !lifecycle.open {
            task.cancel();
            return Err(MetaError::ServerClosed);
        }
        if let Some(pos) = lifecycle.tasks.iter().position(|t| t.name() == task.name()) {
            lifecycle.tasks.swap_remove(pos).cancel();
        }
        info!(task = task.name(), "background task started");
        lifecycle.tasks.push(task);
        Ok(())
    }

    // Users

    /// Creates a user, storing only a salted hash of the password.
    pub async fn create_user(&self, name: &str, password: &str, admin: bool) -> Result<LogIndex, MetaError> {
        if name.is_empty() {
            return Err(MetaError::UsernameRequired);
        }
        let hash = hash_password(password, self.shared.config.password_hash_iterations)?;
        self.execute(Command::CreateUser {
            name: name.to_string(),
            hash,
            admin,
        })
        .await
    }

    /// Replaces a user's password.
    pub async fn update_user(&self, name: &str, password: &str) -> Result<LogIndex, MetaError> {
        if name.is_empty() {
            return Err(MetaError::UsernameRequired);
        }
        let hash = hash_password(password, self.shared.config.password_hash_iterations)?;
        self.execute(Command::UpdateUser {
            name: name.to_string(),
            hash,
        })
        .await
    }

    /// Removes a user.
    pub async fn drop_user(&self, name: &str) -> Result<LogIndex, MetaError> {
        self.execute(Command::DropUser {
            name: name.to_string(),
        })
        .await
    }

    /// Grants `privilege` on `database`; `NoPrivileges` revokes.
    pub async fn set_user_privilege(
        &self,
        name: &str,
        database: &str,
        privilege: Privilege,
    ) -> Result<LogIndex, MetaError> {
        self.execute(Command::SetUserPrivilege {
            name: name.to_string(),
            database: database.to_string(),
            privilege,
        })
        .await
    }

    /// Grants or revokes cluster admin.
    pub async fn set_admin_privilege(&self, name: &str, admin: bool) -> Result<LogIndex, MetaError> {
        self.execute(Command::SetAdminPrivilege {
            name: name.to_string(),
            admin,
        })
        .await
    }

    /// Returns the user with the given name.
    pub fn user(&self, name: &str) -> Option<UserInfo> {
        self.shared.read(|d| d.user(name).cloned())
    }

    /// All users, ordered by name.
    pub fn users(&self) -> Vec<UserInfo> {
        self.shared.read(|d| d.users().cloned().collect())
    }

    /// Returns true if at least one admin user exists.
    pub fn admin_user_exists(&self) -> bool {
        self.shared.read(|d| d.admin_user_exists())
    }

    /// Checks a password. Unknown users and wrong passwords fail identically.
    pub fn authenticate(&self, name: &str, password: &str) -> Result<UserInfo, MetaError> {
        let user = self.user(name);
        let hash = match &user {
            Some(u) => u.hash.clone(),
            None => dummy_hash(self.shared.config.password_hash_iterations),
        };
        let verified = verify_password(password, &hash);
        match user {
            Some(user) if verified => Ok(user),
            _ => {
                debug!(user = name, "authentication failed");
                Err(MetaError::AuthenticationFailed)
            }
        }
    }

    // Continuous queries

    /// Stores a continuous query under its database.
    ///
    /// Every measurement the query reads or writes is normalized against the
    /// query's database first, so unknown databases and policies are rejected
    /// and the stored text is fully qualified.
    pub async fn create_continuous_query(&self, stmt: &ContinuousQueryStatement) -> Result<LogIndex, MetaError> {
        let mut normalized = Statement::CreateContinuousQuery(stmt.clone());
        self.normalize_statement(&mut normalized, &stmt.database)?;
        self.execute(Command::CreateContinuousQuery {
            database: stmt.database.clone(),
            name: stmt.name.clone(),
            query: normalized.to_string(),
        })
        .await
    }

    /// Removes a continuous query.
    pub async fn drop_continuous_query(&self, database: &str, name: &str) -> Result<LogIndex, MetaError> {
        self.execute(Command::DropContinuousQuery {
            database: database.to_string(),
            name: name.to_string(),
        })
        .await
    }

    /// Continuous queries of a database.
    pub fn continuous_queries(&self, database: &str) -> Result<Vec<ContinuousQueryInfo>, MetaError> {
        self.with_database(database, |db| db.continuous_queries.clone())
    }

    // Queries

    /// Returns true if anonymous queries are rejected.
    pub fn authentication_enabled(&self) -> bool {
        self.shared.authentication_enabled.load(Ordering::Acquire)
    }

    /// Turns authentication on or off for this node.
    pub fn set_authentication_enabled(&self, enabled: bool) {
        self.shared
            .authentication_enabled
            .store(enabled, Ordering::Release);
    }

    /// Checks that `user` may run every statement of `query`.
    pub fn authorize(
        &self,
        user: Option<&UserInfo>,
        query: &Query,
        default_database: &str,
    ) -> Result<(), MetaError> {
        authorize(user, query, default_database, self.authentication_enabled())
    }

    /// Fully qualifies a measurement reference.
    pub fn normalize_measurement(
        &self,
        measurement: &mut Measurement,
        default_database: &str,
    ) -> Result<(), MetaError> {
        self.shared
            .read(|d| normalize::normalize_measurement(d, measurement, default_database))
    }

    /// Fully qualifies every measurement reference in a statement.
    pub fn normalize_statement(
        &self,
        statement: &mut Statement,
        default_database: &str,
    ) -> Result<(), MetaError> {
        self.shared
            .read(|d| normalize::normalize_statement(d, statement, default_database))
    }

    /// Fully qualifies every measurement reference in a query.
    pub fn normalize_query(&self, query: &mut Query, default_database: &str) -> Result<(), MetaError> {
        self.shared
            .read(|d| normalize::normalize_query(d, query, default_database))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandLogConfig;
    use crate::kvstore::MemoryKvStore;

    fn store(config: MetaConfig) -> MetaStore {
        let log = CommandLog::open(Arc::new(MemoryKvStore::new()), &CommandLogConfig::default()).unwrap();
        MetaStore::new(config, Arc::new(log), Arc::new(MemoryKvStore::new()))
    }

    #[test]
    fn test_outcomes_bounded() {
        let mut outcomes = Outcomes::new(2);
        for i in 1..=3 {
            outcomes.record(LogIndex::new(i), Ok(AppliedEffect::Applied));
        }
        assert!(outcomes.take(LogIndex::new(1)).is_none());
        assert_eq!(outcomes.take(LogIndex::new(3)), Some(Ok(AppliedEffect::Applied)));
        assert!(outcomes.take(LogIndex::new(3)).is_none());
    }

    #[tokio::test]
    async fn test_open_twice_fails() {
        let store = store(MetaConfig::default());
        store.open().unwrap();
        assert_eq!(store.open(), Err(MetaError::ServerOpen));
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(!store.is_open());
    }

    #[tokio::test]
    async fn test_mutation_on_closed_store() {
        let store = store(MetaConfig::default());
        assert_eq!(
            store.create_database("foo").await,
            Err(MetaError::ServerClosed)
        );
    }

    #[tokio::test]
    async fn test_submitter_receives_apply_error() {
        let store = store(MetaConfig::default());
        store.open().unwrap();
        let first = store.create_database("foo").await.unwrap();
        assert_eq!(store.create_database("foo").await, Err(MetaError::DatabaseExists));
        // The rejected command still consumed an index.
        assert_eq!(store.applied_index(), first.next());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_created_default_policy() {
        let store = store(MetaConfig::default());
        store.open().unwrap();
        store.create_database("foo").await.unwrap();
        let rp = store.default_retention_policy("foo").unwrap().unwrap();
        assert_eq!(rp.name, DEFAULT_RETENTION_POLICY_NAME);
        assert_eq!(rp.duration, Duration::ZERO);
        assert_eq!(rp.replica_n, 1);
        store.close().await.unwrap();
    }

    #[test]
    fn test_open_rejects_zero_snapshot_interval() {
        let store = store(MetaConfig {
            snapshot_interval: 0,
            ..MetaConfig::default()
        });
        let err = store.open().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
        assert!(!store.is_open());
    }

    #[tokio::test]
    async fn test_log_compacted_behind_snapshot() {
        let log_kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let state_kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let config = MetaConfig {
            snapshot_interval: 2,
            command_log: CommandLogConfig {
                retain_entries: 2,
                ..CommandLogConfig::default()
            },
            ..MetaConfig::default()
        };
        let open = || {
            let log = Arc::new(CommandLog::open(log_kv.clone(), &config.command_log).unwrap());
            let store = MetaStore::new(config.clone(), log.clone(), state_kv.clone());
            store.open().unwrap();
            (log, store)
        };

        let (log, store) = open();
        for i in 0..20 {
            store.create_database(&format!("db{:02}", i)).await.unwrap();
        }
        store.close().await.unwrap();
        assert_eq!(log.first_index().unwrap(), LogIndex::new(19));
        assert_eq!(log.retained_entries().unwrap(), 2);

        let (log, store) = open();
        assert_eq!(log.last_index(), LogIndex::new(20));
        assert_eq!(store.databases().len(), 20);
        assert_eq!(store.applied_index(), LogIndex::new(20));
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_maintenance_pass_skips_rejected_command() {
        let store = store(MetaConfig::default());
        let commands = vec![
            Command::DeleteShardGroup {
                database: "gone".into(),
                policy: "default".into(),
                id: 1,
            },
            Command::CreateDatabase {
                name: "foo".into(),
                default_policy: None,
            },
        ];
        assert_eq!(
            store.propose_each(RETENTION_TASK, commands.clone()).await,
            Err(MetaError::ServerClosed)
        );

        store.open().unwrap();
        let effects = store.propose_each(RETENTION_TASK, commands).await.unwrap();
        assert_eq!(effects, vec![AppliedEffect::Applied]);
        assert_eq!(store.databases(), vec!["foo".to_string()]);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_background_task_requires_open_store() {
        let store = store(MetaConfig::default());
        assert_eq!(
            store.start_retention_policy_enforcement(Duration::from_secs(1)),
            Err(MetaError::ServerClosed)
        );
    }
}

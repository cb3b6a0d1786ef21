//! Retention enforcement, shard group pre-creation and the periodic task
//! runner that drives them.
//!
//! Selection is a pure read of [`MetaData`]; the resulting commands go through
//! the command log like any client mutation.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::command::Command;
use crate::data::MetaData;
use crate::error::MetaError;
use crate::types::add_duration;

/// `DeleteShardGroup` commands for every group whose data has aged out of a
/// finite retention policy, i.e. `end_time + duration < now`.
pub fn expired_shard_groups(data: &MetaData, now: DateTime<Utc>) -> Vec<Command> {
    let mut commands = Vec::new();
    for db in data.databases() {
        for rp in db.retention_policies.iter().filter(|rp| !rp.duration.is_zero()) {
            for group in &rp.shard_groups {
                // Unrepresentable expiry times lie far in the future.
                let expired = add_duration(group.end_time, rp.duration)
                    .map(|expiry| expiry < now)
                    .unwrap_or(false);
                if expired {
                    commands.push(Command::DeleteShardGroup {
                        database: db.name.clone(),
                        policy: rp.name.clone(),
                        id: group.id,
                    });
                }
            }
        }
    }
    commands
}

/// `CreateShardGroupIfNotExists` commands for the successor of every policy's
/// latest shard group when that group ends within `(now, now + advance]`.
pub fn shard_groups_to_precreate(
    data: &MetaData,
    now: DateTime<Utc>,
    advance: Duration,
) -> Result<Vec<Command>, MetaError> {
    let cutoff = add_duration(now, advance)?;
    let mut commands = Vec::new();
    for db in data.databases() {
        for rp in &db.retention_policies {
            let Some(latest) = rp.shard_groups.iter().max_by_key(|g| g.end_time) else {
                continue;
            };
            if latest.end_time <= now || latest.end_time > cutoff {
                continue;
            }
            if rp.shard_group_by_timestamp(latest.end_time).is_some() {
                continue;
            }
            commands.push(Command::CreateShardGroupIfNotExists {
                database: db.name.clone(),
                policy: rp.name.clone(),
                timestamp: latest.end_time,
            });
        }
    }
    Ok(commands)
}

/// A cancellable task that runs a closure on a fixed interval.
///
/// The first run happens one interval after spawning. Ticks missed while a run
/// is still in progress are skipped rather than bunched up.
pub struct PeriodicTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawns `run` every `interval` on the current tokio runtime.
    ///
    /// A zero interval is rejected.
    pub fn spawn<F, Fut>(name: &'static str, interval: Duration, mut run: F) -> Result<Self, MetaError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if interval.is_zero() {
            return Err(MetaError::InvalidArgument(format!(
                "{} check interval must be greater than zero",
                name
            )));
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => run().await,
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(task = name, "periodic task stopped");
        });

        debug!(task = name, interval_ms = interval.as_millis() as u64, "periodic task started");
        Ok(Self {
            name,
            shutdown,
            handle,
        })
    }

    /// Task name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns true until the task has exited.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signals the task to exit without waiting for it.
    pub fn cancel(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signals the task and waits for it to exit. A run in progress completes first.
    pub async fn stop(self) {
        self.cancel();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::RetentionPolicyInfo;
    use crate::types::LogIndex;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const HOUR: Duration = Duration::from_secs(3_600);

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, 0, 0).unwrap()
    }

    fn fixture(duration: Duration, groups_at: &[DateTime<Utc>]) -> MetaData {
        let mut commands = vec![
            Command::CreateNode {
                url: "http://node0:8088".into(),
            },
            Command::CreateDatabase {
                name: "foo".into(),
                default_policy: None,
            },
            Command::CreateRetentionPolicy {
                database: "foo".into(),
                policy: RetentionPolicyInfo::new("mypolicy").with_duration(duration),
            },
        ];
        for ts in groups_at {
            commands.push(Command::CreateShardGroupIfNotExists {
                database: "foo".into(),
                policy: "mypolicy".into(),
                timestamp: *ts,
            });
        }
        let mut data = MetaData::new();
        for (i, cmd) in commands.iter().enumerate() {
            data.apply(LogIndex::new(i as u64 + 1), cmd).unwrap();
        }
        data
    }

    #[test]
    fn test_expired_groups_selected() {
        // Hourly groups [08:00, 09:00) and [12:00, 13:00) under a one hour policy.
        let data = fixture(HOUR, &[at(8), at(12)]);
        let expired = expired_shard_groups(&data, at(11));
        assert_eq!(expired.len(), 1);
        let rp = data.retention_policy("foo", "mypolicy").unwrap().unwrap();
        assert_eq!(
            expired[0],
            Command::DeleteShardGroup {
                database: "foo".into(),
                policy: "mypolicy".into(),
                id: rp.shard_groups[0].id,
            }
        );
    }

    #[test]
    fn test_expiry_boundary_is_strict() {
        let data = fixture(HOUR, &[at(8)]);
        // end 09:00 + 1h == 10:00 is not yet expired.
        assert!(expired_shard_groups(&data, at(10)).is_empty());
    }

    #[test]
    fn test_infinite_policy_never_expires() {
        let data = fixture(Duration::ZERO, &[at(0)]);
        let far = Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap();
        assert!(expired_shard_groups(&data, far).is_empty());
    }

    #[test]
    fn test_precreate_successor() {
        let data = fixture(HOUR, &[at(8)]);
        let now = at(8) + chrono::Duration::minutes(40);
        let commands = shard_groups_to_precreate(&data, now, Duration::from_secs(1_800)).unwrap();
        assert_eq!(
            commands,
            vec![Command::CreateShardGroupIfNotExists {
                database: "foo".into(),
                policy: "mypolicy".into(),
                timestamp: at(9),
            }]
        );
    }

    #[test]
    fn test_precreate_skips_outside_window() {
        let data = fixture(HOUR, &[at(8)]);
        // Too early: group ends more than `advance` from now.
        assert!(shard_groups_to_precreate(&data, at(8), Duration::from_secs(600))
            .unwrap()
            .is_empty());
        // Too late: group has already ended.
        assert!(shard_groups_to_precreate(&data, at(10), HOUR).unwrap().is_empty());
    }

    #[test]
    fn test_precreate_skips_existing_successor() {
        let data = fixture(HOUR, &[at(8), at(9)]);
        let now = at(9) + chrono::Duration::minutes(10);
        assert!(shard_groups_to_precreate(&data, now, Duration::from_secs(600))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let result = PeriodicTask::spawn("retention", Duration::ZERO, || async {});
        assert!(matches!(result, Err(MetaError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_periodic_task_runs_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let task = {
            let runs = runs.clone();
            PeriodicTask::spawn("counter", Duration::from_millis(10), move || {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap()
        };
        assert_eq!(task.name(), "counter");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(task.is_running());
        task.stop().await;

        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }
}

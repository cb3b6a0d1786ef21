//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tidemark_meta::{CommandLog, CommandLogConfig, FileKvStore, KvStore, MetaConfig, MetaStore};

/// Test configuration with sensible defaults for fast testing
pub fn test_config() -> MetaConfig {
    MetaConfig {
        bind_url: "http://localhost:8086".to_string(),
        retention_auto_create: false,
        sync_timeout_ms: 5_000,
        password_hash_iterations: 64, // Cheap hashes keep user tests fast
        ..Default::default()
    }
}

/// A single meta store persisted in a temporary directory.
///
/// Derefs to the open [`MetaStore`]; `restart` closes it and reopens a fresh
/// store over the same files.
pub struct TestServer {
    dir: TempDir,
    config: MetaConfig,
    store: MetaStore,
}

impl TestServer {
    /// Opens and initializes a server with [`test_config`].
    pub async fn open() -> Self {
        Self::open_with(test_config()).await
    }

    /// Opens and initializes a server with the given configuration.
    pub async fn open_with(config: MetaConfig) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let store = Self::start(&dir, &config).await;
        Self { dir, config, store }
    }

    async fn start(dir: &TempDir, config: &MetaConfig) -> MetaStore {
        let open_kv = |name: &str| -> Arc<dyn KvStore> {
            Arc::new(FileKvStore::open(&dir.path().join(name)).expect("open kv store"))
        };
        let log = CommandLog::open(open_kv("log"), &config.command_log).expect("open command log");
        let store = MetaStore::new(config.clone(), Arc::new(log), open_kv("state"));
        store.open().expect("open meta store");
        store.initialize().await.expect("register node");
        store
    }

    /// Closes the store and reopens it from disk.
    pub async fn restart(&mut self) {
        self.store.close().await.expect("close meta store");
        self.store = Self::start(&self.dir, &self.config).await;
    }

    /// Closes the store.
    pub async fn close(self) {
        self.store.close().await.expect("close meta store");
    }
}

impl Deref for TestServer {
    type Target = MetaStore;

    fn deref(&self) -> &MetaStore {
        &self.store
    }
}

/// Two stores applying the same command log, as two nodes of one cluster would.
pub struct TestCluster {
    pub log: Arc<CommandLog>,
    pub nodes: Vec<MetaStore>,
}

impl TestCluster {
    /// Opens `n` in-memory stores over one shared log.
    pub async fn new(n: usize) -> Self {
        let log_kv: Arc<dyn KvStore> = Arc::new(tidemark_meta::MemoryKvStore::new());
        let log = Arc::new(
            CommandLog::open(log_kv, &CommandLogConfig::default()).expect("open command log"),
        );
        let mut nodes = Vec::with_capacity(n);
        for i in 0..n {
            let config = MetaConfig {
                bind_url: format!("http://node{}:8086", i),
                ..test_config()
            };
            let store = MetaStore::new(config, log.clone(), Arc::new(tidemark_meta::MemoryKvStore::new()));
            store.open().expect("open meta store");
            store.initialize().await.expect("register node");
            nodes.push(store);
        }
        Self { log, nodes }
    }

    /// Waits until every node has applied the whole log.
    pub async fn sync_all(&self) {
        let last = self.log.last_index();
        for node in &self.nodes {
            node.sync(last, Duration::from_secs(5)).await.expect("sync");
        }
    }

    /// Closes every node.
    pub async fn close(self) {
        for node in &self.nodes {
            node.close().await.expect("close meta store");
        }
    }
}

//! Shared application state and the live configuration snapshot.
//!
//! The only mutable field in [`AppState`] is the snapshot pointer. A reload
//! builds the whole new snapshot first, transfers runtime state from the
//! old one where entity names are unchanged, then publishes it with a
//! single pointer swap. Requests capture the snapshot once at entry and
//! keep using that immutable view for their whole lifetime, so a reload
//! never disturbs an in-flight request.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::info;

use crate::background;
use crate::cache::FileCache;
use crate::limits::ProxyUser;
use crate::metrics::Metrics;
use crate::topology::Cluster;
use common::Config;

/// An immutable, atomically published view of the configuration.
pub struct Snapshot {
    pub clusters: HashMap<String, Arc<Cluster>>,
    pub users: HashMap<String, Arc<ProxyUser>>,
    pub caches: HashMap<String, Arc<FileCache>>,
    pub param_groups: HashMap<String, Vec<(String, String)>>,
    retire_tx: watch::Sender<bool>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            clusters: HashMap::new(),
            users: HashMap::new(),
            caches: HashMap::new(),
            param_groups: HashMap::new(),
            retire_tx: watch::channel(false).0,
        }
    }

    /// Builds a snapshot from validated configuration, carrying over
    /// runtime state from `prev`:
    /// - hosts with unchanged addresses keep their alive flag and
    ///   in-flight counter;
    /// - caches with unchanged (name, dir) keep their directory and
    ///   in-flight producer table, picking up any new size or expiry
    ///   settings;
    /// - users with unchanged configuration keep their whole runtime
    ///   object (counters, rate windows).
    ///
    /// Everything else starts fresh; requests admitted under the old
    /// snapshot drain against the old objects.
    pub fn build(cfg: &Config, prev: &Snapshot) -> anyhow::Result<Self> {
        let clusters: HashMap<String, Arc<Cluster>> = cfg
            .clusters
            .iter()
            .map(|c| {
                let prev_cluster = prev.clusters.get(&c.name).map(|a| a.as_ref());
                (c.name.clone(), Arc::new(Cluster::from_config(c, prev_cluster)))
            })
            .collect();

        let users: HashMap<String, Arc<ProxyUser>> = cfg
            .users
            .iter()
            .map(|u| {
                let reused = prev
                    .users
                    .get(&u.name)
                    .filter(|prev_user| prev_user.cfg == *u)
                    .cloned();
                let user = reused.unwrap_or_else(|| Arc::new(ProxyUser::from_config(u)));
                (u.name.clone(), user)
            })
            .collect();

        let mut caches = HashMap::new();
        for c in &cfg.caches {
            // Reuse is keyed on (name, dir), like hosts are keyed on their
            // address: a cache whose directory is unchanged keeps its
            // in-flight producer table across the reload, even when sizes
            // or expiry changed. A changed directory starts fresh.
            let prev_cache = prev
                .caches
                .get(&c.name)
                .filter(|prev_cache| prev_cache.cfg.dir == c.dir);
            let cache = match prev_cache {
                Some(existing) if existing.cfg == *c => existing.clone(),
                _ => Arc::new(
                    FileCache::from_config(c, prev_cache.map(|a| a.as_ref()))
                        .with_context(|| format!("cannot create cache {:?} in {:?}", c.name, c.dir))?,
                ),
            };
            caches.insert(c.name.clone(), cache);
        }

        let param_groups = cfg
            .param_groups
            .iter()
            .map(|pg| {
                (
                    pg.name.clone(),
                    pg.params
                        .iter()
                        .map(|p| (p.key.clone(), p.value.clone()))
                        .collect(),
                )
            })
            .collect();

        Ok(Self {
            clusters,
            users,
            caches,
            param_groups,
            retire_tx: watch::channel(false).0,
        })
    }

    /// Signal observed by this snapshot's background tasks.
    pub fn retired(&self) -> watch::Receiver<bool> {
        self.retire_tx.subscribe()
    }

    /// Stops this snapshot's heartbeat and sweeper loops.
    pub fn retire(&self) {
        let _ = self.retire_tx.send(true);
    }
}

/// Process-wide state shared by all handlers and background tasks.
pub struct AppState {
    pub config_path: PathBuf,
    snapshot: RwLock<Arc<Snapshot>>,
    pub http_client: reqwest::Client,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config_path: PathBuf, http_client: reqwest::Client, metrics: Metrics) -> Self {
        Self {
            config_path,
            snapshot: RwLock::new(Arc::new(Snapshot::empty())),
            http_client,
            metrics,
        }
    }

    /// The current snapshot, captured by value. Callers keep the returned
    /// `Arc` for the whole request.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    /// Builds and publishes a new snapshot, then retires the old one. The
    /// old snapshot stays live until this function swaps the pointer, so a
    /// failed build changes nothing.
    pub fn apply_config(self: &Arc<Self>, cfg: &Config) -> anyhow::Result<()> {
        let old = self.snapshot();
        let new = Arc::new(Snapshot::build(cfg, &old)?);
        background::spawn_snapshot_tasks(self, &new);
        *self.snapshot.write() = new.clone();
        old.retire();
        info!(
            clusters = new.clusters.len(),
            users = new.users.len(),
            caches = new.caches.len(),
            "configuration applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(
            PathBuf::from("unused.yml"),
            reqwest::Client::new(),
            Metrics::new(),
        ))
    }

    fn minimal_config(dir: &std::path::Path) -> Config {
        Config::parse(&format!(
            r#"
server:
  http:
    listen_addr: ":8080"

caches:
  - name: shortterm
    dir: {dir}
    max_size: 1M
    expire: 10s

clusters:
  - name: cluster
    nodes: ["127.0.0.1:8123"]
    users:
      - name: default

users:
  - name: default
    to_cluster: cluster
    to_user: default
    cache: shortterm
"#,
            dir = dir.display()
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_apply_config_publishes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let app = state();
        app.apply_config(&minimal_config(dir.path())).unwrap();

        let snap = app.snapshot();
        assert!(snap.clusters.contains_key("cluster"));
        assert!(snap.users.contains_key("default"));
        assert!(snap.caches.contains_key("shortterm"));
    }

    #[tokio::test]
    async fn test_reload_preserves_unchanged_entities() {
        let dir = tempfile::tempdir().unwrap();
        let app = state();
        let cfg = minimal_config(dir.path());
        app.apply_config(&cfg).unwrap();

        let before = app.snapshot();
        // Mark a host alive so we can observe state transfer.
        before.clusters["cluster"].replicas()[0].hosts[0].set_alive(true);

        app.apply_config(&cfg).unwrap();
        let after = app.snapshot();

        assert!(!Arc::ptr_eq(&before, &after));
        // Unchanged user and cache objects are shared, hosts keep state.
        assert!(Arc::ptr_eq(&before.users["default"], &after.users["default"]));
        assert!(Arc::ptr_eq(
            &before.caches["shortterm"],
            &after.caches["shortterm"]
        ));
        assert!(after.clusters["cluster"].replicas()[0].hosts[0].is_alive());
    }

    #[tokio::test]
    async fn test_reload_with_changed_cache_settings_keeps_in_flight_table() {
        use crate::cache::{EntryHeader, StartWrite};

        let dir = tempfile::tempdir().unwrap();
        let app = state();
        let cfg = minimal_config(dir.path());
        app.apply_config(&cfg).unwrap();

        let old_cache = app.snapshot().caches["shortterm"].clone();
        let entry = EntryHeader {
            status: 200,
            content_type: None,
            content_encoding: None,
        };
        let StartWrite::Producer(writer) =
            old_cache.start_write("fp", entry.clone()).await.unwrap()
        else {
            panic!("expected producer role");
        };

        // Same name and dir, different size: a new cache object that must
        // still see the old object's in-flight producer.
        let mut changed = cfg.clone();
        changed.caches[0].max_size = common::ByteSize(2_000_000);
        app.apply_config(&changed).unwrap();

        let new_cache = app.snapshot().caches["shortterm"].clone();
        assert!(!Arc::ptr_eq(&old_cache, &new_cache));
        match new_cache.start_write("fp", entry).await.unwrap() {
            StartWrite::Wait(_) => {}
            StartWrite::Producer(_) => panic!("second producer for an in-flight fingerprint"),
        }
        writer.abort().await;
    }

    #[tokio::test]
    async fn test_reload_replaces_changed_user() {
        let dir = tempfile::tempdir().unwrap();
        let app = state();
        let cfg = minimal_config(dir.path());
        app.apply_config(&cfg).unwrap();
        let before = app.snapshot();

        let mut changed = cfg.clone();
        changed.users[0].max_concurrent_queries = 7;
        app.apply_config(&changed).unwrap();
        let after = app.snapshot();

        assert!(!Arc::ptr_eq(&before.users["default"], &after.users["default"]));
    }

    #[tokio::test]
    async fn test_retire_signals_background_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let app = state();
        app.apply_config(&minimal_config(dir.path())).unwrap();

        let snap = app.snapshot();
        let mut retired = snap.retired();
        assert!(!*retired.borrow());
        snap.retire();
        retired.changed().await.unwrap();
        assert!(*retired.borrow());
    }
}

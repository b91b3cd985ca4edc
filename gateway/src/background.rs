//! Background task loops: per-cluster heartbeats and per-cache sweepers.
//!
//! Each snapshot owns its loops. Applying a new configuration spawns a
//! fresh set against the new snapshot and retires the old set through the
//! snapshot's watch signal, so loops never outlive the topology they probe.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::FileCache;
use crate::config::HEARTBEAT_TIMEOUT;
use crate::state::{AppState, Snapshot};
use crate::topology::{Cluster, Host};

/// Spawns the heartbeat loop for every cluster and the sweeper loop for
/// every cache of the given snapshot.
pub fn spawn_snapshot_tasks(state: &Arc<AppState>, snapshot: &Arc<Snapshot>) {
    for cluster in snapshot.clusters.values() {
        let state = state.clone();
        let cluster = cluster.clone();
        let retired = snapshot.retired();
        tokio::spawn(async move {
            heartbeat_loop(state, cluster, retired).await;
        });
    }
    for cache in snapshot.caches.values() {
        let cache = cache.clone();
        let retired = snapshot.retired();
        tokio::spawn(async move {
            sweeper_loop(cache, retired).await;
        });
    }
}

/// Probes every host of one cluster on the configured interval until the
/// owning snapshot is retired. The first round runs immediately so fresh
/// hosts become eligible right after startup.
async fn heartbeat_loop(state: Arc<AppState>, cluster: Arc<Cluster>, mut retired: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(cluster.heartbeat_interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => check_cluster(&state, &cluster).await,
            _ = retired.changed() => {
                debug!(cluster = %cluster.name(), "heartbeat loop stopped");
                return;
            }
        }
    }
}

/// Probes all hosts concurrently; a slow or failing host never delays the
/// others.
async fn check_cluster(state: &Arc<AppState>, cluster: &Arc<Cluster>) {
    let checks = cluster
        .replicas()
        .iter()
        .flat_map(|r| r.hosts.iter())
        .map(|host| check_host(state, cluster, host));
    futures::future::join_all(checks).await;
}

async fn check_host(state: &Arc<AppState>, cluster: &Arc<Cluster>, host: &Arc<Host>) {
    let url = format!("http://{}/", host.addr());
    let result = state
        .http_client
        .get(&url)
        .query(&[("query", "SELECT 1")])
        .timeout(HEARTBEAT_TIMEOUT)
        .send()
        .await;

    let alive = match result {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            debug!(host = %host.addr(), error = %e, "heartbeat failed");
            false
        }
    };
    host.set_alive(alive);
    state
        .metrics
        .host_alive
        .get_or_create(&[
            ("cluster".to_string(), cluster.name().to_string()),
            ("host".to_string(), host.addr().to_string()),
        ])
        .set(alive as i64);
}

/// Periodically enforces the cache's expiry and size bounds until the
/// owning snapshot is retired.
async fn sweeper_loop(cache: Arc<FileCache>, mut retired: watch::Receiver<bool>) {
    info!(cache = %cache.name(), interval = ?cache.sweep_interval(), "cache sweeper started");
    let mut ticker = tokio::time::interval(cache.sweep_interval());
    // The immediate first tick would sweep a directory we just created.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = cache.sweep_once().await {
                    warn!(cache = %cache.name(), error = %e, "cache sweep failed");
                }
            }
            _ = retired.changed() => {
                debug!(cache = %cache.name(), "cache sweeper stopped");
                return;
            }
        }
    }
}

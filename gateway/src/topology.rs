//! Runtime cluster topology: nodes, replicas and host selection.
//!
//! Hosts carry two pieces of runtime state: an alive flag flipped only by
//! the heartbeat loop, and an in-flight counter incremented on selection
//! and decremented when the checked-out guard drops. Both survive config
//! reloads for hosts whose address is unchanged.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tracing::{info, warn};

use crate::limits::BackendUser;
use common::config;

/// A single backend endpoint.
pub struct Host {
    addr: String,
    alive: AtomicBool,
    load: AtomicU32,
}

impl Host {
    pub fn new(addr: String) -> Self {
        // New hosts start dead; the first heartbeat promotes them.
        Self {
            addr,
            alive: AtomicBool::new(false),
            load: AtomicU32::new(0),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Updates the alive flag, logging only on state changes.
    pub fn set_alive(&self, alive: bool) {
        let was = self.alive.swap(alive, Ordering::AcqRel);
        if was != alive {
            if alive {
                info!(host = %self.addr, "host is alive");
            } else {
                warn!(host = %self.addr, "host is dead");
            }
        }
    }

    pub fn load(&self) -> u32 {
        self.load.load(Ordering::Acquire)
    }
}

/// A checked-out host. Dropping the guard releases the in-flight slot.
pub struct HostGuard {
    host: Arc<Host>,
}

impl HostGuard {
    pub fn addr(&self) -> &str {
        self.host.addr()
    }
}

impl Drop for HostGuard {
    fn drop(&mut self) {
        self.host.load.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An ordered group of hosts load-balanced as a unit.
pub struct Replica {
    pub name: String,
    pub hosts: Vec<Arc<Host>>,
}

impl Replica {
    /// Sum of in-flight counters over alive hosts, or `None` when every
    /// host in the replica is dead.
    fn alive_load(&self) -> Option<u64> {
        let mut sum = 0u64;
        let mut any_alive = false;
        for h in &self.hosts {
            if h.is_alive() {
                any_alive = true;
                sum += h.load() as u64;
            }
        }
        any_alive.then_some(sum)
    }

    fn least_loaded_alive(&self) -> Option<&Arc<Host>> {
        let mut best: Option<&Arc<Host>> = None;
        let mut best_load = u32::MAX;
        for h in &self.hosts {
            if h.is_alive() && h.load() < best_load {
                best_load = h.load();
                best = Some(h);
            }
        }
        best
    }
}

/// Credentials used for the detached KILL QUERY request.
#[derive(Clone)]
pub struct KillQueryUser {
    pub name: String,
    pub password: String,
}

impl Default for KillQueryUser {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            password: String::new(),
        }
    }
}

/// Runtime view of one configured cluster.
pub struct Cluster {
    name: String,
    replicas: Vec<Replica>,
    users: HashMap<String, Arc<BackendUser>>,
    kill_query_user: KillQueryUser,
    heartbeat_interval: std::time::Duration,
}

impl Cluster {
    /// Builds the runtime cluster, carrying over host and backend-user
    /// state from `prev` where names and addresses are unchanged.
    pub fn from_config(cfg: &config::Cluster, prev: Option<&Cluster>) -> Self {
        let reuse_host = |addr: &str| -> Arc<Host> {
            prev.and_then(|p| p.find_host(addr))
                .unwrap_or_else(|| Arc::new(Host::new(addr.to_string())))
        };

        let replicas = if cfg.replicas.is_empty() {
            // A flat node list behaves as a single implicit replica.
            vec![Replica {
                name: "default".to_string(),
                hosts: cfg.nodes.iter().map(|n| reuse_host(n)).collect(),
            }]
        } else {
            cfg.replicas
                .iter()
                .map(|r| Replica {
                    name: r.name.clone(),
                    hosts: r.nodes.iter().map(|n| reuse_host(n)).collect(),
                })
                .collect()
        };

        let users = cfg
            .cluster_users
            .iter()
            .map(|cu| {
                let reused = prev
                    .and_then(|p| p.users.get(&cu.name))
                    .filter(|prev_user| prev_user.cfg == *cu)
                    .cloned();
                let user = reused.unwrap_or_else(|| Arc::new(BackendUser::from_config(cu)));
                (cu.name.clone(), user)
            })
            .collect();

        Self {
            name: cfg.name.clone(),
            replicas,
            users,
            kill_query_user: cfg
                .kill_query_user
                .as_ref()
                .map(|k| KillQueryUser {
                    name: k.name.clone(),
                    password: k.password.clone(),
                })
                .unwrap_or_default(),
            heartbeat_interval: cfg.heartbeat_interval.as_std(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    pub fn user(&self, name: &str) -> Option<&Arc<BackendUser>> {
        self.users.get(name)
    }

    pub fn kill_query_user(&self) -> &KillQueryUser {
        &self.kill_query_user
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        self.heartbeat_interval
    }

    fn find_host(&self, addr: &str) -> Option<Arc<Host>> {
        self.replicas
            .iter()
            .flat_map(|r| r.hosts.iter())
            .find(|h| h.addr() == addr)
            .cloned()
    }

    /// Picks the least-loaded alive host, spreading load across replicas
    /// before hosts within a replica. Ties break by definition order.
    /// Returns `None` when no host in the cluster is alive.
    pub fn pick_host(&self) -> Option<HostGuard> {
        let mut best: Option<&Replica> = None;
        let mut best_load = u64::MAX;
        for r in &self.replicas {
            if let Some(load) = r.alive_load() {
                if load < best_load {
                    best_load = load;
                    best = Some(r);
                }
            }
        }
        let host = best?.least_loaded_alive()?;
        host.load.fetch_add(1, Ordering::AcqRel);
        Some(HostGuard { host: host.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(nodes: &[&str]) -> Cluster {
        let cfg = config::Cluster {
            name: "test".to_string(),
            nodes: nodes.iter().map(|s| s.to_string()).collect(),
            cluster_users: vec![config::ClusterUser {
                name: "default".to_string(),
                ..Default::default()
            }],
            heartbeat_interval: common::Duration::from_secs(5),
            ..Default::default()
        };
        Cluster::from_config(&cfg, None)
    }

    fn replicated_cluster() -> Cluster {
        let cfg = config::Cluster {
            name: "test".to_string(),
            replicas: vec![
                config::Replica {
                    name: "r1".to_string(),
                    nodes: vec!["a:8123".to_string(), "b:8123".to_string()],
                },
                config::Replica {
                    name: "r2".to_string(),
                    nodes: vec!["c:8123".to_string(), "d:8123".to_string()],
                },
            ],
            cluster_users: vec![config::ClusterUser {
                name: "default".to_string(),
                ..Default::default()
            }],
            heartbeat_interval: common::Duration::from_secs(5),
            ..Default::default()
        };
        Cluster::from_config(&cfg, None)
    }

    fn mark_all_alive(c: &Cluster) {
        for r in c.replicas() {
            for h in &r.hosts {
                h.set_alive(true);
            }
        }
    }

    #[test]
    fn test_pick_host_none_alive() {
        let c = cluster(&["a:8123", "b:8123"]);
        assert!(c.pick_host().is_none());
    }

    #[test]
    fn test_pick_host_skips_dead() {
        let c = cluster(&["a:8123", "b:8123"]);
        c.replicas()[0].hosts[1].set_alive(true);
        let g = c.pick_host().unwrap();
        assert_eq!(g.addr(), "b:8123");
    }

    #[test]
    fn test_pick_host_least_loaded_with_order_tiebreak() {
        let c = cluster(&["a:8123", "b:8123"]);
        mark_all_alive(&c);

        // Tie: definition order wins.
        let g1 = c.pick_host().unwrap();
        assert_eq!(g1.addr(), "a:8123");

        // a now has one in-flight request, so b is least loaded.
        let g2 = c.pick_host().unwrap();
        assert_eq!(g2.addr(), "b:8123");

        // Releasing a makes it preferred again.
        drop(g1);
        let g3 = c.pick_host().unwrap();
        assert_eq!(g3.addr(), "a:8123");
        drop(g2);
        drop(g3);
        assert_eq!(c.replicas()[0].hosts[0].load(), 0);
        assert_eq!(c.replicas()[0].hosts[1].load(), 0);
    }

    #[test]
    fn test_pick_host_spreads_across_replicas_first() {
        let c = replicated_cluster();
        mark_all_alive(&c);

        let g1 = c.pick_host().unwrap();
        assert_eq!(g1.addr(), "a:8123");
        // r1 now carries load 1, so r2 is preferred even though b is idle.
        let g2 = c.pick_host().unwrap();
        assert_eq!(g2.addr(), "c:8123");
        // Both replicas at load 1: back to r1, least-loaded host within it.
        let g3 = c.pick_host().unwrap();
        assert_eq!(g3.addr(), "b:8123");
    }

    #[test]
    fn test_pick_host_ignores_dead_replica() {
        let c = replicated_cluster();
        for h in &c.replicas()[1].hosts {
            h.set_alive(true);
        }
        let g = c.pick_host().unwrap();
        assert_eq!(g.addr(), "c:8123");
    }

    #[test]
    fn test_reload_preserves_host_state() {
        let cfg = config::Cluster {
            name: "test".to_string(),
            nodes: vec!["a:8123".to_string(), "b:8123".to_string()],
            cluster_users: vec![config::ClusterUser {
                name: "default".to_string(),
                ..Default::default()
            }],
            heartbeat_interval: common::Duration::from_secs(5),
            ..Default::default()
        };
        let old = Cluster::from_config(&cfg, None);
        mark_all_alive(&old);
        let _guard = old.pick_host().unwrap();

        let new = Cluster::from_config(&cfg, Some(&old));
        // Same address, same runtime state.
        assert!(new.replicas()[0].hosts[0].is_alive());
        assert_eq!(new.replicas()[0].hosts[0].load(), 1);

        // A renamed host starts fresh.
        let mut renamed = cfg.clone();
        renamed.nodes[0] = "z:8123".to_string();
        let fresh = Cluster::from_config(&renamed, Some(&old));
        assert!(!fresh.replicas()[0].hosts[0].is_alive());
        assert_eq!(fresh.replicas()[0].hosts[0].load(), 0);
    }
}

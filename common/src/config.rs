//! Configuration model for the gateway.
//!
//! Configuration is loaded from a YAML file and validated in full before it
//! is handed to the running service, so a bad reload can never take down a
//! healthy instance. Every struct rejects unknown keys, which catches typos
//! like `max_concurent_queries` at load time instead of silently ignoring
//! them.
//!
//! # Sections
//!
//! | Section | Purpose |
//! |---------|---------|
//! | `server` | Listen addresses and connection timeouts |
//! | `clusters` | Backend ClickHouse clusters, their nodes and users |
//! | `users` | Gateway-side users, routing and limits |
//! | `caches` | On-disk response cache definitions |
//! | `param_groups` | Named URL parameter sets merged into queries |
//!
//! # Example
//!
//! ```yaml
//! server:
//!   http:
//!     listen_addr: ":9090"
//!
//! clusters:
//!   - name: analytics
//!     nodes: ["127.0.0.1:8123"]
//!     users:
//!       - name: default
//!
//! users:
//!   - name: default
//!     to_cluster: analytics
//!     to_user: default
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::units::{ByteSize, Duration};

/// Heartbeat interval used when a cluster does not configure one.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration(std::time::Duration::from_secs(5));

/// Default read timeout for the HTTP listener.
const DEFAULT_READ_TIMEOUT: Duration = Duration(std::time::Duration::from_secs(60));

/// Default idle timeout for the HTTP listener.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration(std::time::Duration::from_secs(600));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path:?}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("{0}")]
    Validation(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

/// Root configuration: server settings, access rules and proxy topology.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: Server,

    /// Backend clusters requests are proxied to.
    pub clusters: Vec<Cluster>,

    /// Gateway-side users allowed to send queries.
    pub users: Vec<User>,

    /// Whether to enable debug logs.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub log_debug: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caches: Vec<CacheConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub param_groups: Vec<ParamGroup>,
}

impl Config {
    /// Loads and validates configuration from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Parses and validates configuration from YAML text.
    pub fn parse(contents: &str) -> Result<Config, ConfigError> {
        let mut cfg: Config = serde_yaml::from_str(contents)?;
        cfg.apply_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_defaults(&mut self) {
        for c in &mut self.clusters {
            if c.heartbeat_interval.is_zero() {
                c.heartbeat_interval = DEFAULT_HEARTBEAT_INTERVAL;
            }
        }
        let max_response_time = self.max_response_time();
        let http = &mut self.server.http;
        if http.read_timeout.is_zero() {
            http.read_timeout = DEFAULT_READ_TIMEOUT;
        }
        if http.idle_timeout.is_zero() {
            http.idle_timeout = DEFAULT_IDLE_TIMEOUT;
        }
        if http.write_timeout.is_zero() {
            http.write_timeout = max_response_time;
        }
    }

    /// The largest `max_execution_time + max_queue_time` over all users and
    /// cluster users, plus one minute so a slow response body can still be
    /// written out.
    fn max_response_time(&self) -> Duration {
        let mut max = std::time::Duration::ZERO;
        for c in &self.clusters {
            for u in &c.cluster_users {
                max = max.max(u.max_execution_time.as_std() + u.max_queue_time.as_std());
            }
        }
        for u in &self.users {
            max = max.max(u.max_execution_time.as_std() + u.max_queue_time.as_std());
        }
        Duration(max + std::time::Duration::from_secs(60))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.users.is_empty() {
            return Err(invalid("`users` must contain at least 1 user"));
        }
        if self.clusters.is_empty() {
            return Err(invalid("`clusters` must contain at least 1 cluster"));
        }
        if self.server.http.listen_addr.is_empty() {
            return Err(invalid("HTTP is not configured"));
        }
        if let Some(https) = &self.server.https {
            https.validate()?;
        }

        let mut cluster_names = std::collections::HashSet::new();
        for c in &self.clusters {
            c.validate()?;
            if !cluster_names.insert(c.name.as_str()) {
                return Err(invalid(format!("duplicate config for cluster {:?}", c.name)));
            }
        }

        let mut cache_names = std::collections::HashSet::new();
        for cache in &self.caches {
            cache.validate()?;
            if !cache_names.insert(cache.name.as_str()) {
                return Err(invalid(format!(
                    "duplicate config for cache {:?}",
                    cache.name
                )));
            }
        }

        let mut group_names = std::collections::HashSet::new();
        for pg in &self.param_groups {
            pg.validate()?;
            if !group_names.insert(pg.name.as_str()) {
                return Err(invalid(format!(
                    "duplicate config for param_group {:?}",
                    pg.name
                )));
            }
        }

        let mut user_names = std::collections::HashSet::new();
        for u in &self.users {
            u.validate()?;
            if !user_names.insert(u.name.as_str()) {
                return Err(invalid(format!("duplicate config for user {:?}", u.name)));
            }
            let cluster = self
                .clusters
                .iter()
                .find(|c| c.name == u.to_cluster)
                .ok_or_else(|| {
                    invalid(format!(
                        "`user.to_cluster` {:?} is not found for user {:?}",
                        u.to_cluster, u.name
                    ))
                })?;
            if !cluster.cluster_users.iter().any(|cu| cu.name == u.to_user) {
                return Err(invalid(format!(
                    "`user.to_user` {:?} is not found in cluster {:?} for user {:?}",
                    u.to_user, u.to_cluster, u.name
                )));
            }
            if let Some(cache) = &u.cache {
                if !cache_names.contains(cache.as_str()) {
                    return Err(invalid(format!(
                        "`user.cache` {:?} is not found for user {:?}",
                        cache, u.name
                    )));
                }
            }
            if let Some(params) = &u.params {
                if !group_names.contains(params.as_str()) {
                    return Err(invalid(format!(
                        "`user.params` {:?} is not found for user {:?}",
                        params, u.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Listener configuration. These settings cannot be hot-reloaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Server {
    #[serde(default)]
    pub http: Http,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https: Option<Https>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Http {
    /// TCP address to listen to for plain HTTP.
    #[serde(default)]
    pub listen_addr: String,

    /// Maximum duration for reading the entire request. Defaults to 1m.
    #[serde(default, skip_serializing_if = "Duration::is_zero")]
    pub read_timeout: Duration,

    /// Maximum duration before timing out a response write. Defaults to the
    /// largest `max_execution_time + max_queue_time` over all users, plus 1m.
    #[serde(default, skip_serializing_if = "Duration::is_zero")]
    pub write_timeout: Duration,

    /// Keep-alive idle timeout. Defaults to 10m.
    #[serde(default, skip_serializing_if = "Duration::is_zero")]
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Https {
    pub listen_addr: String,
    pub cert_file: String,
    pub key_file: String,
}

impl Https {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.is_empty() {
            return Err(invalid("`https.listen_addr` cannot be empty"));
        }
        if self.cert_file.is_empty() || self.key_file.is_empty() {
            return Err(invalid(
                "`https.cert_file` and `https.key_file` must be specified",
            ));
        }
        Ok(())
    }
}

/// A backend ClickHouse cluster: a set of equivalent nodes, optionally
/// grouped into replicas, plus the backend users queries run under.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Cluster {
    pub name: String,

    /// Flat node list. Either `nodes` or `replicas` must be set, not both.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replicas: Vec<Replica>,

    /// Backend users available in this cluster.
    #[serde(rename = "users")]
    pub cluster_users: Vec<ClusterUser>,

    /// Credentials used for killing timed-out queries. Defaults to the
    /// `default` user with an empty password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_query_user: Option<KillQueryUser>,

    /// Interval between node availability checks. Defaults to 5s.
    #[serde(default, skip_serializing_if = "Duration::is_zero")]
    pub heartbeat_interval: Duration,
}

impl Cluster {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(invalid("`cluster.name` cannot be empty"));
        }
        if self.nodes.is_empty() && self.replicas.is_empty() {
            return Err(invalid(format!(
                "either `cluster.nodes` or `cluster.replicas` must be set for {:?}",
                self.name
            )));
        }
        if !self.nodes.is_empty() && !self.replicas.is_empty() {
            return Err(invalid(format!(
                "`cluster.nodes` cannot be simultaneously set with `cluster.replicas` for {:?}",
                self.name
            )));
        }
        for r in &self.replicas {
            r.validate()?;
        }
        if self.cluster_users.is_empty() {
            return Err(invalid(format!(
                "`cluster.users` must contain at least 1 user for {:?}",
                self.name
            )));
        }
        let mut names = std::collections::HashSet::new();
        for cu in &self.cluster_users {
            cu.validate()?;
            if !names.insert(cu.name.as_str()) {
                return Err(invalid(format!(
                    "duplicate config for cluster user {:?} in cluster {:?}",
                    cu.name, self.name
                )));
            }
        }
        if let Some(k) = &self.kill_query_user {
            if k.name.is_empty() {
                return Err(invalid("`cluster.kill_query_user.name` must be specified"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Replica {
    pub name: String,
    pub nodes: Vec<String>,
}

impl Replica {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(invalid("`replica.name` cannot be empty"));
        }
        if self.nodes.is_empty() {
            return Err(invalid(format!(
                "`replica.nodes` cannot be empty for {:?}",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KillQueryUser {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

/// A backend ClickHouse user with its own limits, independent of the
/// gateway-side user limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterUser {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,

    /// Maximum number of concurrently running queries. Zero means unlimited.
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub max_concurrent_queries: u32,

    /// Maximum query execution duration. Zero means unlimited.
    #[serde(default, skip_serializing_if = "Duration::is_zero")]
    pub max_execution_time: Duration,

    /// Maximum number of requests per minute. Zero means unlimited.
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub requests_per_minute: u32,

    /// Maximum number of queries waiting for execution. Zero means queries
    /// are rejected instead of queued.
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub max_queue_size: u32,

    /// Maximum duration a query may wait in the queue. Defaults to 10s when
    /// a queue is configured.
    #[serde(default, skip_serializing_if = "Duration::is_zero")]
    pub max_queue_time: Duration,
}

impl ClusterUser {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(invalid("`cluster.user.name` cannot be empty"));
        }
        if !self.max_queue_time.is_zero() && self.max_queue_size == 0 {
            return Err(invalid(format!(
                "`max_queue_size` must be set if `max_queue_time` is set for {:?}",
                self.name
            )));
        }
        Ok(())
    }
}

/// A gateway-side user: who may connect, where their queries go, and under
/// which limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct User {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,

    /// Name of the cluster queries are proxied to.
    pub to_cluster: String,

    /// Name of the cluster user whose credentials are used upstream.
    pub to_user: String,

    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub max_concurrent_queries: u32,

    #[serde(default, skip_serializing_if = "Duration::is_zero")]
    pub max_execution_time: Duration,

    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub requests_per_minute: u32,

    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub max_queue_size: u32,

    #[serde(default, skip_serializing_if = "Duration::is_zero")]
    pub max_queue_time: Duration,

    /// Whether to deny plain-HTTP connections for this user.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deny_http: bool,

    /// Whether to deny HTTPS connections for this user.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deny_https: bool,

    /// Whether responses for this user carry CORS headers.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allow_cors: bool,

    /// Name of the cache used for this user's responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<String>,

    /// Name of the param group merged into this user's queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,
}

impl User {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(invalid("`user.name` cannot be empty"));
        }
        if self.to_user.is_empty() {
            return Err(invalid(format!(
                "`user.to_user` cannot be empty for {:?}",
                self.name
            )));
        }
        if self.to_cluster.is_empty() {
            return Err(invalid(format!(
                "`user.to_cluster` cannot be empty for {:?}",
                self.name
            )));
        }
        if self.deny_http && self.deny_https {
            return Err(invalid(format!(
                "`deny_http` and `deny_https` cannot be simultaneously set to `true` for {:?}",
                self.name
            )));
        }
        if !self.max_queue_time.is_zero() && self.max_queue_size == 0 {
            return Err(invalid(format!(
                "`max_queue_size` must be set if `max_queue_time` is set for {:?}",
                self.name
            )));
        }
        Ok(())
    }
}

/// On-disk response cache definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    pub name: String,

    /// Directory cached responses are stored in.
    pub dir: String,

    /// Maximum total size of cached files. The oldest files are evicted once
    /// the total exceeds this.
    pub max_size: ByteSize,

    /// Expiration period for cached responses. Zero means entries never
    /// expire.
    #[serde(default, skip_serializing_if = "Duration::is_zero")]
    pub expire: Duration,

    /// Grace period after expiry during which a stale entry may still be
    /// served while a fresh one is being produced.
    #[serde(default, skip_serializing_if = "Duration::is_zero")]
    pub grace_time: Duration,
}

impl CacheConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(invalid("`cache.name` must be specified"));
        }
        if self.dir.is_empty() {
            return Err(invalid(format!(
                "`cache.dir` must be specified for {:?}",
                self.name
            )));
        }
        if self.max_size.as_u64() == 0 {
            return Err(invalid(format!(
                "`cache.max_size` must be specified for {:?}",
                self.name
            )));
        }
        Ok(())
    }
}

/// Named group of URL params sent with each query of the users that
/// reference it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamGroup {
    pub name: String,
    pub params: Vec<Param>,
}

impl ParamGroup {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(invalid("`param_group.name` must be specified"));
        }
        if self.params.is_empty() {
            return Err(invalid("`param_group.params` must contain at least one param"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Param {
    pub key: String,
    pub value: String,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
server:
  http:
    listen_addr: ":8080"

clusters:
  - name: cluster
    nodes: ["127.0.0.1:8123"]
    users:
      - name: default

users:
  - name: default
    to_cluster: cluster
    to_user: default
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let cfg = Config::parse(MINIMAL).unwrap();
        assert_eq!(cfg.server.http.listen_addr, ":8080");
        assert_eq!(cfg.server.http.read_timeout, Duration::from_secs(60));
        assert_eq!(cfg.server.http.write_timeout, Duration::from_secs(60));
        assert_eq!(cfg.server.http.idle_timeout, Duration::from_secs(600));
        assert_eq!(
            cfg.clusters[0].heartbeat_interval,
            DEFAULT_HEARTBEAT_INTERVAL
        );
    }

    #[test]
    fn test_full_config() {
        let cfg = Config::parse(
            r#"
server:
  http:
    listen_addr: ":9090"
    read_timeout: 5m
    write_timeout: 10m
    idle_timeout: 20m

log_debug: true

caches:
  - name: longterm
    dir: /path/to/longterm/cachedir
    max_size: 100G
    expire: 1h
    grace_time: 20s
  - name: shortterm
    dir: /path/to/shortterm/cachedir
    max_size: 100M
    expire: 10s

param_groups:
  - name: cron-job
    params:
      - key: max_memory_usage
        value: "40000000000"
  - name: web
    params:
      - key: max_columns_to_read
        value: "30"

clusters:
  - name: first cluster
    nodes: ["127.0.0.1:8123", "shard2:8123"]
    kill_query_user:
      name: default
      password: "***"
    users:
      - name: web
        password: password
        max_concurrent_queries: 4
        max_execution_time: 1m
    heartbeat_interval: 1m
  - name: second cluster
    replicas:
      - name: replica1
        nodes: ["127.0.1.1:8443", "127.0.1.2:8443"]
      - name: replica2
        nodes: ["127.0.2.1:8443", "127.0.2.2:8443"]
    users:
      - name: default
        max_concurrent_queries: 4
        max_execution_time: 1m
      - name: web
        requests_per_minute: 10
        max_concurrent_queries: 4
        max_execution_time: 10s
        max_queue_size: 50
        max_queue_time: 70s

users:
  - name: web
    password: "****"
    to_cluster: first cluster
    to_user: web
    deny_http: true
    allow_cors: true
    requests_per_minute: 4
    max_queue_size: 100
    max_queue_time: 35s
    cache: longterm
    params: web
  - name: default
    to_cluster: second cluster
    to_user: default
    max_concurrent_queries: 4
    max_execution_time: 1m
"#,
        )
        .unwrap();

        assert_eq!(cfg.caches.len(), 2);
        assert_eq!(cfg.caches[0].max_size, ByteSize(100_000_000_000));
        assert_eq!(cfg.clusters.len(), 2);
        assert_eq!(cfg.clusters[0].heartbeat_interval, Duration::from_secs(60));
        assert_eq!(cfg.clusters[1].heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.clusters[1].replicas.len(), 2);
        assert_eq!(cfg.users[0].cache.as_deref(), Some("longterm"));
        assert!(cfg.users[0].deny_http);
        // Explicitly configured, so no derived value.
        assert_eq!(cfg.server.http.write_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_write_timeout_computed() {
        let cfg = Config::parse(
            r#"
server:
  http:
    listen_addr: ":8080"

clusters:
  - name: cluster
    nodes: ["127.0.0.1:8123"]
    users:
      - name: default
        max_execution_time: 10m

users:
  - name: default
    to_cluster: cluster
    to_user: default
"#,
        )
        .unwrap();
        // 10m + 1m grace.
        assert_eq!(cfg.server.http.write_timeout, Duration::from_secs(660));
    }

    #[test]
    fn test_round_trip_is_equivalent() {
        let cfg = Config::parse(MINIMAL).unwrap();
        let marshalled = serde_yaml::to_string(&cfg).unwrap();
        let again = Config::parse(&marshalled).unwrap();
        assert_eq!(cfg, again);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = Config::parse(
            r#"
server:
  http:
    listen_addr: ":8080"

clusters:
  - name: cluster
    nodes: ["127.0.0.1:8123"]
    unknown_field: 1
    users:
      - name: default

users:
  - name: default
    to_cluster: cluster
    to_user: default
"#,
        )
        .unwrap_err();
        assert!(
            err.to_string().contains("unknown_field"),
            "unexpected error: {err}"
        );
    }

    fn check_invalid(contents: &str, expected: &str) {
        match Config::parse(contents) {
            Err(ConfigError::Validation(msg)) => assert_eq!(msg, expected),
            other => panic!("expected validation error {expected:?}, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_users() {
        check_invalid(
            r#"
server:
  http:
    listen_addr: ":8080"
clusters:
  - name: cluster
    nodes: ["127.0.0.1:8123"]
    users:
      - name: default
users: []
"#,
            "`users` must contain at least 1 user",
        );
    }

    #[test]
    fn test_missing_listen_addr() {
        check_invalid(
            r#"
clusters:
  - name: cluster
    nodes: ["127.0.0.1:8123"]
    users:
      - name: default
users:
  - name: default
    to_cluster: cluster
    to_user: default
"#,
            "HTTP is not configured",
        );
    }

    #[test]
    fn test_nodes_and_replicas_conflict() {
        check_invalid(
            r#"
server:
  http:
    listen_addr: ":8080"
clusters:
  - name: second cluster
    nodes: ["127.0.0.1:8123"]
    replicas:
      - name: replica1
        nodes: ["127.0.0.2:8123"]
    users:
      - name: default
users:
  - name: default
    to_cluster: second cluster
    to_user: default
"#,
            "`cluster.nodes` cannot be simultaneously set with `cluster.replicas` for \"second cluster\"",
        );
    }

    #[test]
    fn test_empty_replica_nodes() {
        check_invalid(
            r#"
server:
  http:
    listen_addr: ":8080"
clusters:
  - name: cluster
    replicas:
      - name: bar
        nodes: []
    users:
      - name: default
users:
  - name: default
    to_cluster: cluster
    to_user: default
"#,
            "`replica.nodes` cannot be empty for \"bar\"",
        );
    }

    #[test]
    fn test_queue_time_without_queue_size() {
        check_invalid(
            r#"
server:
  http:
    listen_addr: ":8080"
clusters:
  - name: cluster
    nodes: ["127.0.0.1:8123"]
    users:
      - name: default
users:
  - name: default
    to_cluster: cluster
    to_user: default
    max_queue_time: 10s
"#,
            "`max_queue_size` must be set if `max_queue_time` is set for \"default\"",
        );
    }

    #[test]
    fn test_deny_both_schemes() {
        check_invalid(
            r#"
server:
  http:
    listen_addr: ":8080"
clusters:
  - name: cluster
    nodes: ["127.0.0.1:8123"]
    users:
      - name: default
users:
  - name: default
    to_cluster: cluster
    to_user: default
    deny_http: true
    deny_https: true
"#,
            "`deny_http` and `deny_https` cannot be simultaneously set to `true` for \"default\"",
        );
    }

    #[test]
    fn test_unresolved_to_cluster() {
        check_invalid(
            r#"
server:
  http:
    listen_addr: ":8080"
clusters:
  - name: cluster
    nodes: ["127.0.0.1:8123"]
    users:
      - name: default
users:
  - name: default
    to_cluster: nosuch
    to_user: default
"#,
            "`user.to_cluster` \"nosuch\" is not found for user \"default\"",
        );
    }

    #[test]
    fn test_unresolved_cache() {
        check_invalid(
            r#"
server:
  http:
    listen_addr: ":8080"
clusters:
  - name: cluster
    nodes: ["127.0.0.1:8123"]
    users:
      - name: default
users:
  - name: default
    to_cluster: cluster
    to_user: default
    cache: nosuch
"#,
            "`user.cache` \"nosuch\" is not found for user \"default\"",
        );
    }

    #[test]
    fn test_negative_cache_size_rejected() {
        let err = Config::parse(
            r#"
server:
  http:
    listen_addr: ":8080"
caches:
  - name: bad
    dir: /tmp/bad
    max_size: -10B
clusters:
  - name: cluster
    nodes: ["127.0.0.1:8123"]
    users:
      - name: default
users:
  - name: default
    to_cluster: cluster
    to_user: default
"#,
        )
        .unwrap_err();
        assert!(
            err.to_string().contains("cannot parse byte size \"-10B\""),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_empty_param_group_params() {
        check_invalid(
            r#"
server:
  http:
    listen_addr: ":8080"
param_groups:
  - name: group
    params: []
clusters:
  - name: cluster
    nodes: ["127.0.0.1:8123"]
    users:
      - name: default
users:
  - name: default
    to_cluster: cluster
    to_user: default
"#,
            "`param_group.params` must contain at least one param",
        );
    }
}

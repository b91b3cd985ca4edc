//! Property-based tests for configuration loading.
//!
//! Tests the following invariant: loading a configuration, marshalling it
//! back to YAML and loading it again yields an equivalent configuration.
//! Defaults (heartbeat interval, listener timeouts) are applied on the
//! first load, so the marshalled form is already fully resolved.

#![allow(unused_imports)]
use crate::strategies::*;
use common::Config;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_config_round_trip(
        cluster in name_strategy(),
        user in name_strategy(),
        nodes in prop::collection::vec(node_strategy(), 1..4),
        max_concurrent in 0u32..100,
        exec_secs in 0u64..3600,
        queue_size in 0u32..50,
        requests_per_minute in 0u32..1000,
        heartbeat_secs in 1u64..120,
    ) {
        let nodes_yaml = nodes
            .iter()
            .map(|n| format!("\"{n}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let yaml = format!(
            r#"
server:
  http:
    listen_addr: ":9090"

clusters:
  - name: "{cluster}"
    nodes: [{nodes_yaml}]
    heartbeat_interval: {heartbeat_secs}s
    users:
      - name: "{user}"
        max_concurrent_queries: {max_concurrent}
        max_execution_time: {exec_secs}s
        requests_per_minute: {requests_per_minute}
        max_queue_size: {queue_size}

users:
  - name: "{user}"
    to_cluster: "{cluster}"
    to_user: "{user}"
    max_concurrent_queries: {max_concurrent}
    max_execution_time: {exec_secs}s
"#
        );

        let cfg = Config::parse(&yaml).expect("generated config must be valid");
        let marshalled = serde_yaml::to_string(&cfg).expect("config must serialize");
        let reloaded = Config::parse(&marshalled).expect("marshalled config must reload");

        prop_assert_eq!(cfg, reloaded);
    }

    /// Replica-based clusters round-trip the same way.
    #[test]
    fn prop_replica_config_round_trip(
        cluster in name_strategy(),
        replica_nodes in prop::collection::vec(
            prop::collection::vec(node_strategy(), 1..3),
            1..3,
        ),
    ) {
        let replicas_yaml = replica_nodes
            .iter()
            .enumerate()
            .map(|(i, nodes)| {
                let nodes = nodes
                    .iter()
                    .map(|n| format!("\"{n}\""))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("      - name: \"replica{i}\"\n        nodes: [{nodes}]")
            })
            .collect::<Vec<_>>()
            .join("\n");
        let yaml = format!(
            r#"
server:
  http:
    listen_addr: ":9090"

clusters:
  - name: "{cluster}"
    replicas:
{replicas_yaml}
    users:
      - name: default

users:
  - name: default
    to_cluster: "{cluster}"
    to_user: default
"#
        );

        let cfg = Config::parse(&yaml).expect("generated config must be valid");
        let marshalled = serde_yaml::to_string(&cfg).expect("config must serialize");
        let reloaded = Config::parse(&marshalled).expect("marshalled config must reload");

        prop_assert_eq!(cfg, reloaded);
    }
}

//! Property-based tests for the cache fingerprint.
//!
//! Tests the following invariants:
//! - identical requests always produce identical fingerprints
//! - any change to the query or user produces a different fingerprint
//! - client-side param ordering never affects the fingerprint
//! - field boundaries cannot be confused across components

#![allow(unused_imports)]
use crate::strategies::*;
use common::CacheKey;
use proptest::prelude::*;

fn fingerprint(query: &[u8], user: &str, params: &[(String, String)], gzip: bool) -> String {
    CacheKey {
        query,
        user,
        params,
        accept_gzip: gzip,
        format: None,
    }
    .fingerprint()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_fingerprint_is_deterministic(
        query in prop::collection::vec(any::<u8>(), 0..256),
        user in name_strategy(),
        gzip in any::<bool>(),
    ) {
        prop_assert_eq!(
            fingerprint(&query, &user, &[], gzip),
            fingerprint(&query, &user, &[], gzip)
        );
    }

    #[test]
    fn prop_fingerprint_distinguishes_queries(
        query_a in prop::collection::vec(any::<u8>(), 0..256),
        query_b in prop::collection::vec(any::<u8>(), 0..256),
        user in name_strategy(),
    ) {
        prop_assume!(query_a != query_b);
        prop_assert_ne!(
            fingerprint(&query_a, &user, &[], false),
            fingerprint(&query_b, &user, &[], false)
        );
    }

    #[test]
    fn prop_fingerprint_distinguishes_users(
        query in prop::collection::vec(any::<u8>(), 0..256),
        user_a in name_strategy(),
        user_b in name_strategy(),
    ) {
        prop_assume!(user_a != user_b);
        prop_assert_ne!(
            fingerprint(&query, &user_a, &[], false),
            fingerprint(&query, &user_b, &[], false)
        );
    }

    #[test]
    fn prop_fingerprint_ignores_param_order(
        query in prop::collection::vec(any::<u8>(), 0..64),
        user in name_strategy(),
        params in prop::collection::vec((name_strategy(), name_strategy()), 0..6),
        seed in any::<u64>(),
    ) {
        let mut shuffled = params.clone();
        // Cheap deterministic shuffle driven by the seed.
        if shuffled.len() > 1 {
            let len = shuffled.len();
            for i in 0..len {
                shuffled.swap(i, (seed as usize + i * 7) % len);
            }
        }
        prop_assert_eq!(
            fingerprint(&query, &user, &params, false),
            fingerprint(&query, &user, &shuffled, false)
        );
    }

    #[test]
    fn prop_fingerprint_gzip_preference_matters(
        query in prop::collection::vec(any::<u8>(), 0..256),
        user in name_strategy(),
    ) {
        prop_assert_ne!(
            fingerprint(&query, &user, &[], false),
            fingerprint(&query, &user, &[], true)
        );
    }
}

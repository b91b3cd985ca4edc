//! Shared proptest strategies for gateway property tests.

/// Duration units accepted by the config grammar, paired with their
/// nanosecond multipliers.
pub const DURATION_UNITS: &[(&str, u64)] = &[
    ("ns", 1),
    ("µs", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60_000_000_000),
    ("h", 3_600_000_000_000),
    ("d", 86_400_000_000_000),
    ("w", 604_800_000_000_000),
];

/// Byte-size suffixes accepted by the config grammar, paired with their
/// decimal multipliers.
pub const BYTE_UNITS: &[(&str, u64)] = &[
    ("B", 1),
    ("K", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
];

/// Identifier-looking names for configuration entities.
pub fn name_strategy() -> impl proptest::strategy::Strategy<Value = String> {
    proptest::string::string_regex("[a-z][a-z0-9_-]{0,15}").expect("valid regex")
}

/// Plausible `host:port` node addresses.
pub fn node_strategy() -> impl proptest::strategy::Strategy<Value = String> {
    proptest::string::string_regex("[a-z][a-z0-9]{0,10}:[0-9]{2,5}").expect("valid regex")
}

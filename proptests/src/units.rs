//! Property-based tests for the duration and byte-size grammars.
//!
//! Tests the following invariants:
//! - parse -> format -> parse is the identity for both grammars
//! - formatting always produces a string the parser accepts
//! - rejected inputs never round-trip by accident

#![allow(unused_imports)]
use crate::strategies::*;
use common::{ByteSize, Duration};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// Duration parse -> format -> parse is the identity.
    #[test]
    fn prop_duration_round_trip(
        value in 1u64..10_000,
        unit_idx in 0usize..DURATION_UNITS.len(),
    ) {
        let (unit, _) = DURATION_UNITS[unit_idx];
        let input = format!("{value}{unit}");
        let parsed: Duration = input.parse().expect("grammar-conforming input");
        let formatted = parsed.to_string();
        let reparsed: Duration = formatted.parse().expect("formatted output must parse");

        prop_assert_eq!(parsed, reparsed, "{} -> {} must round-trip", input, formatted);
    }

    /// Formatting never loses precision: the formatted string denotes the
    /// same number of nanoseconds as the original input.
    #[test]
    fn prop_duration_format_is_exact(
        value in 1u64..10_000,
        unit_idx in 0usize..DURATION_UNITS.len(),
    ) {
        let (unit, mult) = DURATION_UNITS[unit_idx];
        let parsed: Duration = format!("{value}{unit}").parse().unwrap();

        prop_assert_eq!(parsed.as_std().as_nanos(), (value as u128) * (mult as u128));
    }

    /// Strings without a unit suffix are always rejected.
    #[test]
    fn prop_duration_rejects_bare_numbers(value in 0u64..1_000_000) {
        prop_assert!(value.to_string().parse::<Duration>().is_err());
    }

    /// Byte-size parse -> format -> parse is the identity.
    #[test]
    fn prop_byte_size_round_trip(
        value in 1u64..100_000,
        unit_idx in 0usize..BYTE_UNITS.len(),
    ) {
        let (unit, _) = BYTE_UNITS[unit_idx];
        let input = format!("{value}{unit}");
        let parsed: ByteSize = input.parse().expect("grammar-conforming input");
        let formatted = parsed.to_string();
        let reparsed: ByteSize = formatted.parse().expect("formatted output must parse");

        prop_assert_eq!(parsed, reparsed, "{} -> {} must round-trip", input, formatted);
    }

    /// Parsing applies the decimal multiplier exactly.
    #[test]
    fn prop_byte_size_multiplier(
        value in 1u64..100_000,
        unit_idx in 0usize..BYTE_UNITS.len(),
    ) {
        let (unit, mult) = BYTE_UNITS[unit_idx];
        let parsed: ByteSize = format!("{value}{unit}").parse().unwrap();

        prop_assert_eq!(parsed.as_u64(), value * mult);
    }

    /// Negative numbers are rejected regardless of suffix.
    #[test]
    fn prop_byte_size_rejects_negative(
        value in 1u64..100_000,
        unit_idx in 0usize..BYTE_UNITS.len(),
    ) {
        let (unit, _) = BYTE_UNITS[unit_idx];
        let negative = format!("-{}{}", value, unit);
        prop_assert!(negative.parse::<ByteSize>().is_err());
    }
}

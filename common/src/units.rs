//! Duration and byte-size primitives used by the configuration model.
//!
//! Both types deserialize from the compact string forms used in config files
//! (`10s`, `5m`, `100G`) and serialize back to the canonical spelling, so a
//! loaded configuration can be marshalled and reloaded without drift.
//!
//! The duration grammar is deliberately narrow: a positive integer followed
//! by exactly one unit out of `ns`, `µs`, `ms`, `s`, `m`, `h`, `d`, `w`.
//! No fractions, no composite values like `1h30m`.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Units accepted by [`Duration`], largest first. Display picks the largest
/// unit that divides the value evenly, which makes parse/format round-trip.
const DURATION_UNITS: &[(&str, u128)] = &[
    ("w", 7 * 24 * 3_600_000_000_000),
    ("d", 24 * 3_600_000_000_000),
    ("h", 3_600_000_000_000),
    ("m", 60_000_000_000),
    ("s", 1_000_000_000),
    ("ms", 1_000_000),
    ("µs", 1_000),
    ("ns", 1),
];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("not a valid duration string: {0:?}")]
pub struct ParseDurationError(pub String);

/// Wall-clock duration with the constrained config grammar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(pub std::time::Duration);

impl Duration {
    pub const ZERO: Duration = Duration(std::time::Duration::ZERO);

    pub fn from_secs(secs: u64) -> Self {
        Duration(std::time::Duration::from_secs(secs))
    }

    pub fn from_millis(millis: u64) -> Self {
        Duration(std::time::Duration::from_millis(millis))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_std(&self) -> std::time::Duration {
        self.0
    }
}

impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> Self {
        d.0
    }
}

impl FromStr for Duration {
    type Err = ParseDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseDurationError(s.to_string());
        let digits_end = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(err)?;
        let (digits, unit) = s.split_at(digits_end);
        if digits.is_empty() {
            return Err(err());
        }
        let value: u64 = digits.parse().map_err(|_| err())?;
        let mult = DURATION_UNITS
            .iter()
            .find(|(u, _)| *u == unit)
            .map(|(_, m)| *m)
            .ok_or_else(err)?;
        let nanos = (value as u128).checked_mul(mult).ok_or_else(err)?;
        if nanos > u64::MAX as u128 {
            return Err(err());
        }
        Ok(Duration(std::time::Duration::from_nanos(nanos as u64)))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nanos = self.0.as_nanos();
        if nanos == 0 {
            return write!(f, "0s");
        }
        for (unit, mult) in DURATION_UNITS {
            if nanos % mult == 0 {
                return write!(f, "{}{}", nanos / mult, unit);
            }
        }
        unreachable!("ns unit always divides")
    }
}

impl Serialize for Duration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Byte-size suffixes with decimal multipliers, largest first.
const BYTE_UNITS: &[(&str, u64)] = &[
    ("T", 1_000_000_000_000),
    ("G", 1_000_000_000),
    ("M", 1_000_000),
    ("K", 1_000),
];

#[derive(Debug, Error, PartialEq, Eq)]
#[error(
    "cannot parse byte size {0:?}: it must be positive float followed by optional units. For example, 1.5Gb, 3T"
)]
pub struct ParseByteSizeError(pub String);

/// Total size in bytes, parsed from `<positive float><B|K|M|G|T>`.
/// A trailing `b`/`B` after the prefix letter is tolerated (`1.5Gb`, `3T`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = ParseByteSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseByteSizeError(s.to_string());
        let digits_end = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(digits_end);
        let mult: u64 = match suffix.to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "K" | "KB" => 1_000,
            "M" | "MB" => 1_000_000,
            "G" | "GB" => 1_000_000_000,
            "T" | "TB" => 1_000_000_000_000,
            _ => return Err(err()),
        };
        // Whole numbers are multiplied exactly; the float path exists only
        // for fractional values like "1.5G".
        if let Ok(int_value) = number.parse::<u64>() {
            if int_value == 0 {
                return Err(err());
            }
            return int_value.checked_mul(mult).map(ByteSize).ok_or_else(err);
        }
        let value: f64 = number.parse().map_err(|_| err())?;
        if !value.is_finite() || value <= 0.0 {
            return Err(err());
        }
        Ok(ByteSize((value * mult as f64) as u64))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (unit, mult) in BYTE_UNITS {
            if self.0 > 0 && self.0 % mult == 0 {
                return write!(f, "{}{}", self.0 / mult, unit);
            }
        }
        write!(f, "{}B", self.0)
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

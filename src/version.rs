//! Two-part schema version encoded as `major * 10000 + minor`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of integer slots reserved for the minor component.
pub const MINOR_SPACE: i64 = 10_000;

/// Errors raised when building or parsing a [`Version`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("minor version {minor} does not fit the encoding (must be < {MINOR_SPACE})")]
    MinorOverflow { minor: u32 },

    #[error("invalid version {0:?}: expected an integer such as 10001")]
    InvalidInteger(String),

    #[error("invalid version {0:?}: expected \"major.minor\"")]
    InvalidDotted(String),
}

/// A schema version.
///
/// Major is bumped only for backward-incompatible schema changes, minor for
/// compatible ones. Ordering is lexicographic on `(major, minor)`, which is
/// what the derived `Ord` gives us thanks to field order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version {
    major: u32,
    minor: u32,
}

impl Version {
    /// `{0, 0}`: nothing has been applied yet.
    pub const ZERO: Version = Version { major: 0, minor: 0 };

    /// Builds a version, rejecting minors the integer encoding cannot hold.
    pub fn new(major: u32, minor: u32) -> Result<Self, VersionError> {
        if i64::from(minor) >= MINOR_SPACE {
            return Err(VersionError::MinorOverflow { minor });
        }
        Ok(Self { major, minor })
    }

    /// Decomposes an encoded integer. Zero and negative values map to
    /// [`Version::ZERO`]; majors beyond `u32::MAX` saturate.
    pub const fn from_int(value: i64) -> Self {
        if value <= 0 {
            return Self::ZERO;
        }
        let major = value / MINOR_SPACE;
        let major = if major > u32::MAX as i64 {
            u32::MAX
        } else {
            major as u32
        };
        Self {
            major,
            minor: (value % MINOR_SPACE) as u32,
        }
    }

    /// Parses the integer form stored in history rows and file names.
    pub fn parse_int(value: &str) -> Result<Self, VersionError> {
        value
            .trim()
            .parse::<i64>()
            .map(Self::from_int)
            .map_err(|_| VersionError::InvalidInteger(value.to_string()))
    }

    pub const fn to_int(self) -> i64 {
        self.major as i64 * MINOR_SPACE + self.minor as i64
    }

    pub const fn major(self) -> u32 {
        self.major
    }

    pub const fn minor(self) -> u32 {
        self.minor
    }

    pub const fn is_zero(self) -> bool {
        self.major == 0 && self.minor == 0
    }

    /// Strict ordering: bigger major, or equal major and bigger minor.
    pub fn bigger_than(&self, other: &Version) -> bool {
        self > other
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Parses the dotted `"major.minor"` display form.
impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| VersionError::InvalidDotted(s.to_string()))?;
        let major = major
            .parse()
            .map_err(|_| VersionError::InvalidDotted(s.to_string()))?;
        let minor = minor
            .parse()
            .map_err(|_| VersionError::InvalidDotted(s.to_string()))?;
        Self::new(major, minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_from_int_decomposes() {
        let v = Version::from_int(10002);
        assert_eq!(v.major(), 1);
        assert_eq!(v.minor(), 2);
        assert_eq!(v.to_string(), "1.2");
    }

    #[test]
    fn test_non_positive_is_zero() {
        assert_eq!(Version::from_int(0), Version::ZERO);
        assert_eq!(Version::from_int(-42), Version::ZERO);
        assert!(Version::from_int(-1).is_zero());
    }

    #[test]
    fn test_minor_overflow_rejected() {
        assert_eq!(
            Version::new(1, 10_000),
            Err(VersionError::MinorOverflow { minor: 10_000 })
        );
        assert!(Version::new(1, 9_999).is_ok());
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(Version::parse_int("20001").unwrap(), Version::new(2, 1).unwrap());
        assert!(Version::parse_int("2.1").is_err());
        assert_eq!("3.14".parse::<Version>().unwrap().to_int(), 30014);
        assert!("3".parse::<Version>().is_err());
    }

    #[test]
    fn test_bigger_than() {
        let a = Version::new(1, 9).unwrap();
        let b = Version::new(2, 0).unwrap();
        assert!(b.bigger_than(&a));
        assert!(!a.bigger_than(&b));
        assert!(!a.bigger_than(&a));
    }

    fn version() -> impl Strategy<Value = Version> {
        (0u32..1000, 0u32..10_000).prop_map(|(major, minor)| Version::new(major, minor).unwrap())
    }

    proptest! {
        #[test]
        fn prop_int_round_trip(v in 0i64..100_000_000) {
            prop_assert_eq!(Version::from_int(v).to_int(), v);
        }

        #[test]
        fn prop_exactly_one_relation(a in version(), b in version()) {
            let relations = [a.bigger_than(&b), b.bigger_than(&a), a == b];
            prop_assert_eq!(relations.iter().filter(|r| **r).count(), 1);
        }

        #[test]
        fn prop_transitive(a in version(), b in version(), c in version()) {
            if a.bigger_than(&b) && b.bigger_than(&c) {
                prop_assert!(a.bigger_than(&c));
            }
        }

        #[test]
        fn prop_order_matches_encoding(a in version(), b in version()) {
            prop_assert_eq!(a.bigger_than(&b), a.to_int() > b.to_int());
        }
    }
}

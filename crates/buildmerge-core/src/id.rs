//! Resource identifiers.
//!
//! Build requests, buildsets and sourcestamp sets are identified by the
//! monotonic integer keys the store assigns on insert.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

/// Identifier of a build request. Ordering follows submission order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct BuildRequestId(i64);

impl BuildRequestId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<BuildRequestId> for i64 {
    fn from(id: BuildRequestId) -> Self {
        id.0
    }
}

/// Identifier of a buildset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct BuildsetId(i64);

impl BuildsetId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<BuildsetId> for i64 {
    fn from(id: BuildsetId) -> Self {
        id.0
    }
}

/// Identifier of a set of sourcestamps (one per codebase).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct SourceStampSetId(i64);

impl SourceStampSetId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<SourceStampSetId> for i64 {
    fn from(id: SourceStampSetId) -> Self {
        id.0
    }
}

impl std::str::FromStr for BuildRequestId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl std::str::FromStr for SourceStampSetId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_order_by_value() {
        assert!(BuildRequestId::new(11) < BuildRequestId::new(13));
        assert_eq!(BuildRequestId::from(7).get(), 7);
    }

    #[test]
    fn test_id_parse_and_display() {
        let id: BuildRequestId = "42".parse().unwrap();
        assert_eq!(id, BuildRequestId::new(42));
        assert_eq!(id.to_string(), "42");
        assert!("abc".parse::<SourceStampSetId>().is_err());
    }
}

//! Tier placement of a collection and its persisted bookkeeping row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::ids::{CollectionId, SnapshotId};

/// Storage tier of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Documents resident in RAM.
    Hot,
    /// Full snapshot on local disk.
    Warm,
    /// Full snapshot in the object store.
    Cold,
}

impl Tier {
    /// Returns the canonical lowercase string stored in SQLite.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
        }
    }
}

impl FromStr for Tier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hot" => Ok(Self::Hot),
            "warm" => Ok(Self::Warm),
            "cold" => Ok(Self::Cold),
            _ => Err(CoreError::invalid_state(format!("invalid tier: {s}"))),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted tier bookkeeping for one collection.
///
/// `snapshot_id` names the snapshot backing a Warm or Cold collection;
/// `warm_file_path` is set only while Warm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierState {
    pub collection_id: CollectionId,
    pub tier: Tier,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u32,
    pub access_window_start: DateTime<Utc>,
    pub pinned: bool,
    pub snapshot_id: Option<SnapshotId>,
    pub warm_file_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TierState {
    /// Fresh Hot, unpinned state with an access window starting now.
    #[must_use]
    pub fn new(collection_id: CollectionId) -> Self {
        let now = Utc::now();
        Self {
            collection_id,
            tier: Tier::Hot,
            last_accessed_at: now,
            access_count: 0,
            access_window_start: now,
            pinned: false,
            snapshot_id: None,
            warm_file_path: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_string_roundtrip() {
        for tier in [Tier::Hot, Tier::Warm, Tier::Cold] {
            assert_eq!(tier.as_str().parse::<Tier>().unwrap(), tier);
        }
        assert!("lukewarm".parse::<Tier>().is_err());
    }
}

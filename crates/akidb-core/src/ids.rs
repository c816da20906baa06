use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates an identifier from an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the inner UUID value.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Returns the raw 16-byte representation suitable for SQLite blobs.
            #[must_use]
            pub const fn to_bytes(self) -> [u8; 16] {
                self.0.into_bytes()
            }

            /// Creates an identifier from raw bytes.
            ///
            /// # Errors
            ///
            /// Returns `uuid::Error` when the bytes do not form a valid UUID.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, uuid::Error> {
                Uuid::from_slice(bytes).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

/// Adds a time-ordered `new()` constructor to identifiers that the engine
/// is allowed to mint on its own.
macro_rules! generated_id {
    ($name:ident) => {
        impl $name {
            /// Generates a new identifier using UUID v7.
            #[must_use]
            #[allow(clippy::new_without_default)]
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }
    };
}

define_id!(
    CollectionId,
    "Identifier of a logical vector collection.\n\nHas no `new()` or `Default`. Ids come from the \
     catalog (`from_uuid`, `FromStr`) or are minted once at creation time via `allocate`."
);
define_id!(
    DocumentId,
    "Unique identifier for a vector document within a collection."
);
define_id!(
    SnapshotId,
    "Identifier of a full collection snapshot (warm file, cold object or compaction baseline)."
);

generated_id!(DocumentId);
generated_id!(SnapshotId);

impl CollectionId {
    /// Mints the id of a brand-new collection.
    ///
    /// Only collection creation may call this; every other component receives
    /// the id it operates on from its caller.
    #[must_use]
    pub fn allocate() -> Self {
        Self(Uuid::now_v7())
    }
}

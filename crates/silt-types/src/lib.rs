#![forbid(unsafe_code)]

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Maximum number of object-name bytes that participate in cache keys.
/// Longer names are truncated; equality is byte-exact over the kept prefix.
pub const OBJECT_NAME_MAX: usize = 50;

/// Default number of hash buckets in the chunk cache.
pub const DEFAULT_HASHSIZE: u32 = 32;
/// Smallest permitted bucket count.
pub const MIN_HASHSIZE: u32 = 1;
/// Largest permitted bucket count.
pub const MAX_HASHSIZE: u32 = 1024;

/// Identifier of a backing object within a named file.
///
/// Local and remote objects are uniquely identified by the pair of the file
/// name and this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

/// Index of a worker thread in the replay harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

/// Validated chunk-cache bucket count (in `MIN_HASHSIZE..=MAX_HASHSIZE`).
///
/// `Deserialize` goes through [`HashSize::new`], so out-of-range values
/// cannot be smuggled in through a config file either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct HashSize(u32);

impl<'de> Deserialize<'de> for HashSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u32::deserialize(deserializer)?;
        Self::new(value).map_err(serde::de::Error::custom)
    }
}

impl HashSize {
    /// Create a `HashSize` if `value` lies in the permitted range.
    pub fn new(value: u32) -> Result<Self, UnitError> {
        if !(MIN_HASHSIZE..=MAX_HASHSIZE).contains(&value) {
            return Err(UnitError::OutOfRange {
                unit: "hashsize",
                value: u64::from(value),
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for HashSize {
    fn default() -> Self {
        Self(DEFAULT_HASHSIZE)
    }
}

/// Validated lane count (a power of two).
///
/// A timestamp's lane is its low `k` bits, so the count must be `2^k`.
/// `Deserialize` goes through [`LaneCount::new`], as for [`HashSize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LaneCount(u32);

impl<'de> Deserialize<'de> for LaneCount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u32::deserialize(deserializer)?;
        Self::new(value).map_err(serde::de::Error::custom)
    }
}

impl LaneCount {
    /// Create a `LaneCount` if `value` is a non-zero power of two.
    pub fn new(value: u32) -> Result<Self, UnitError> {
        if value == 0 || !value.is_power_of_two() {
            return Err(UnitError::NotPowerOfTwo {
                unit: "lane_count",
                value: u64::from(value),
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Bit mask selecting the lane number out of a timestamp.
    #[must_use]
    pub fn mask(self) -> u64 {
        u64::from(self.0) - 1
    }

    /// Lane number of a timestamp (its low `k` bits).
    #[must_use]
    pub fn lane_of(self, ts: u64) -> u32 {
        // The mask fits in 32 bits by construction.
        (ts & self.mask()) as u32
    }
}

impl Default for LaneCount {
    fn default() -> Self {
        Self(16)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UnitError {
    #[error("{unit} out of range: {value}")]
    OutOfRange { unit: &'static str, value: u64 },
    #[error("{unit} must be a non-zero power of two, got {value}")]
    NotPowerOfTwo { unit: &'static str, value: u64 },
}

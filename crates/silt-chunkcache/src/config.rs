//! Chunk cache configuration.

use serde::{Deserialize, Serialize};
use silt_error::{Result, SiltError};
use silt_types::{HashSize, MAX_HASHSIZE, MIN_HASHSIZE};
use std::path::PathBuf;

/// Default size of a newly admitted chunk: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Where chunk buffers live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "directory_path")]
pub enum CacheBacking {
    /// Ordinary heap allocation.
    Dram,
    /// An arena file inside `directory_path` (must be absolute).
    File(PathBuf),
}

/// Chunk cache configuration. Immutable once the cache is constructed;
/// reconfiguration is not supported.
///
/// Key names mirror the engine's configuration strings:
/// `chunk_cache.enabled`, `chunk_cache.size`, `chunk_cache.type`,
/// `chunk_cache.directory_path`, `chunk_cache.hashsize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCacheConfig {
    /// Whether the cache participates in reads at all. A disabled cache is
    /// inert: every lookup misses without a reservation.
    pub enabled: bool,
    /// Capacity in bytes. Must be non-zero when enabled.
    #[serde(rename = "size")]
    pub capacity: u64,
    /// Number of hash buckets.
    #[serde(default)]
    pub hashsize: HashSize,
    /// Chunk buffer backing.
    #[serde(flatten)]
    pub backing: CacheBacking,
    /// Size of a newly admitted chunk, before clamping to capacity and to
    /// the backing object's length.
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: u64,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

impl ChunkCacheConfig {
    /// An enabled DRAM cache with the given capacity and chunk size.
    #[must_use]
    pub fn dram(capacity: u64, hashsize: HashSize, default_chunk_size: u64) -> Self {
        Self {
            enabled: true,
            capacity,
            hashsize,
            backing: CacheBacking::Dram,
            default_chunk_size,
        }
    }

    /// A disabled cache; lookups always miss without reservations.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            capacity: 0,
            hashsize: HashSize::default(),
            backing: CacheBacking::Dram,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Validate the configuration, returning it for chaining.
    ///
    /// A disabled configuration is always valid; nothing else is checked
    /// because nothing else is used.
    pub fn validate(self) -> Result<Self> {
        if !self.enabled {
            return Ok(self);
        }
        if self.capacity == 0 {
            return Err(SiltError::ConfigInvalid {
                field: "chunk_cache.size",
                reason: "capacity must be greater than zero",
            });
        }
        // HashSize construction and deserialization both enforce the range,
        // and this check catches any path around them.
        if !(MIN_HASHSIZE..=MAX_HASHSIZE).contains(&self.hashsize.get()) {
            return Err(SiltError::ConfigInvalid {
                field: "chunk_cache.hashsize",
                reason: "hash size out of range",
            });
        }
        if self.default_chunk_size == 0 {
            return Err(SiltError::ConfigInvalid {
                field: "chunk_cache.chunk_size",
                reason: "default chunk size must be greater than zero",
            });
        }
        if let CacheBacking::File(dir) = &self.backing {
            if !dir.is_absolute() {
                return Err(SiltError::ConfigInvalid {
                    field: "chunk_cache.directory_path",
                    reason: "file backing requires an absolute directory path",
                });
            }
        }
        Ok(self)
    }
}

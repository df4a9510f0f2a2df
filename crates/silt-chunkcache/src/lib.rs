#![forbid(unsafe_code)]
//! Sharded chunk cache for byte ranges of named backing objects.
//!
//! The cache maps `(object name, object id, offset)` to in-memory byte
//! chunks. Buckets are selected by a 64-bit hash of the object identity;
//! each bucket holds the chunk chains of the objects that hashed to it and
//! is guarded by its own lock, so structural changes and validity flips are
//! serialized per bucket while different buckets proceed in parallel.
//!
//! Reads are **copy-out**: a hit copies the requested bytes into the
//! caller's buffer inside the bucket critical section, so no reference to
//! cache-owned memory ever escapes a lock. A miss may come with a
//! [`Reservation`], a handle to a freshly admitted, not-yet-valid chunk
//! that the caller fills from the backing store and [`ChunkCache::publish`]es,
//! or [`ChunkCache::abandon`]s if the backing read fails.

mod backing;
mod config;

pub use config::{CacheBacking, ChunkCacheConfig, DEFAULT_CHUNK_SIZE};

use backing::{BackingKind, ChunkStorage, FileArena};
use parking_lot::Mutex;
use silt_error::{Result, SiltError};
use silt_types::{ObjectId, OBJECT_NAME_MAX};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use xxhash_rust::xxh64::xxh64;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Identity of a backing object: its name (truncated to
/// [`OBJECT_NAME_MAX`] bytes, zero-padded) and object id.
///
/// Equality is byte-exact; two names that agree on the kept prefix are the
/// same object as far as the cache is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashId {
    name: [u8; OBJECT_NAME_MAX],
    object_id: ObjectId,
}

impl HashId {
    #[must_use]
    pub fn new(name: &str, object_id: ObjectId) -> Self {
        let mut fixed = [0_u8; OBJECT_NAME_MAX];
        let bytes = name.as_bytes();
        let keep = bytes.len().min(OBJECT_NAME_MAX);
        fixed[..keep].copy_from_slice(&bytes[..keep]);
        Self {
            name: fixed,
            object_id,
        }
    }

    /// Stable 64-bit hash over the identity. Nothing outside bucket
    /// selection may depend on the specific function.
    #[must_use]
    fn hash64(&self) -> u64 {
        xxh64(&self.name, u64::from(self.object_id.0))
    }
}

// ---------------------------------------------------------------------------
// Chunks and chains
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Chunk {
    offset: u64,
    size: u64,
    /// Unique token tying reservations to this exact chunk instance.
    token: u64,
    /// Published flag. Set with release ordering once the buffer is filled;
    /// a reader observing `true` with acquire ordering sees the bytes.
    valid: AtomicBool,
    storage: ChunkStorage,
}

impl Chunk {
    fn end(&self) -> u64 {
        self.offset + self.size
    }

    fn contains(&self, offset: u64, end: u64) -> bool {
        self.offset <= offset && self.end() >= end
    }
}

/// All cached chunks of one object, ordered by ascending offset with no
/// overlaps. Chunks may leave gaps.
#[derive(Debug)]
struct ChunkChain {
    hash_id: HashId,
    chunks: Vec<Chunk>,
}

impl ChunkChain {
    #[cfg(debug_assertions)]
    fn assert_ordered(&self) {
        for pair in self.chunks.windows(2) {
            debug_assert!(
                pair[0].end() <= pair[1].offset,
                "chunk chain out of order: {}..{} then {}..{}",
                pair[0].offset,
                pair[0].end(),
                pair[1].offset,
                pair[1].end()
            );
        }
    }

    #[cfg(not(debug_assertions))]
    fn assert_ordered(&self) {}
}

#[derive(Debug, Default)]
struct Bucket {
    /// Collision list: chains of all objects that hashed here.
    chains: Vec<ChunkChain>,
}

// ---------------------------------------------------------------------------
// Public surface types
// ---------------------------------------------------------------------------

/// A logical read request against the cache.
///
/// `object_size` is the backing object's total length; admission never
/// reserves past it. The requested byte count is the length of the output
/// buffer handed to [`ChunkCache::lookup_or_reserve`].
#[derive(Debug, Clone, Copy)]
pub struct ChunkQuery<'a> {
    pub name: &'a str,
    pub object_id: ObjectId,
    pub object_size: u64,
    pub offset: u64,
}

/// Outcome of [`ChunkCache::lookup_or_reserve`].
#[derive(Debug)]
pub enum Lookup {
    /// The requested bytes were copied into the caller's buffer.
    Hit,
    /// Not cached. If a reservation is present, the caller should read
    /// `reservation.size()` bytes at `reservation.offset()` from the
    /// backing store and publish them; with `None`, the caller reads for
    /// itself and the cache stays out of the way.
    Miss(Option<Reservation>),
}

/// Handle to a freshly admitted, not-yet-valid chunk.
///
/// Reservations are handles, not pointers: they name the bucket, object and
/// chunk token, and every operation revalidates them under the bucket lock.
#[derive(Debug)]
pub struct Reservation {
    bucket: usize,
    hash_id: HashId,
    offset: u64,
    size: u64,
    token: u64,
}

impl Reservation {
    /// Offset within the backing object the caller must read from.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of bytes the caller must read and publish.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub bytes_used: u64,
    pub allocations: u64,
    pub removals: u64,
}

// ---------------------------------------------------------------------------
// The cache
// ---------------------------------------------------------------------------

/// Hashed, bucket-locked chunk cache. See the crate docs for the model.
#[derive(Debug)]
pub struct ChunkCache {
    buckets: Box<[Mutex<Bucket>]>,
    backing: BackingKind,
    capacity: u64,
    default_chunk_size: u64,
    enabled: bool,
    bytes_used: AtomicU64,
    next_token: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    allocations: AtomicU64,
    removals: AtomicU64,
}

impl ChunkCache {
    /// Build a cache from a validated configuration. One-shot: the returned
    /// cache cannot be reconfigured, only dropped.
    pub fn new(config: ChunkCacheConfig) -> Result<Self> {
        let config = config.validate()?;

        let backing = match &config.backing {
            CacheBacking::Dram => BackingKind::Dram,
            CacheBacking::File(dir) if config.enabled => {
                BackingKind::File(Arc::new(FileArena::create(dir)?))
            }
            CacheBacking::File(_) => BackingKind::Dram,
        };

        let bucket_count = if config.enabled {
            config.hashsize.get() as usize
        } else {
            1
        };
        let buckets = (0..bucket_count)
            .map(|_| Mutex::new(Bucket::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        if config.enabled {
            info!(
                capacity = config.capacity,
                hashsize = bucket_count,
                backing = ?config.backing,
                "chunkcache_configured"
            );
        }

        Ok(Self {
            buckets,
            backing,
            capacity: config.capacity,
            default_chunk_size: config.default_chunk_size,
            enabled: config.enabled,
            bytes_used: AtomicU64::new(0),
            next_token: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            removals: AtomicU64::new(0),
        })
    }

    /// Look up `out.len()` bytes of the queried object at `query.offset`.
    ///
    /// On a hit the bytes are copied into `out`. On a miss, a reservation
    /// may be handed back for a chunk admitted at (or just past, if an
    /// existing chunk covers the front of the range) the queried offset.
    ///
    /// At most one reservation is ever outstanding for a given range:
    /// concurrent callers race under the bucket lock, the winner inserts
    /// the pending chunk, and the rest miss without a reservation until it
    /// is published.
    pub fn lookup_or_reserve(&self, query: &ChunkQuery<'_>, out: &mut [u8]) -> Lookup {
        if !self.enabled || out.is_empty() {
            return Lookup::Miss(None);
        }

        let offset = query.offset;
        let size = out.len() as u64;
        let end = match offset.checked_add(size) {
            Some(end) if end <= query.object_size => end,
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Lookup::Miss(None);
            }
        };

        let hash_id = HashId::new(query.name, query.object_id);
        let bucket_index = self.bucket_index(&hash_id);
        let mut bucket = self.buckets[bucket_index].lock();

        let Some(chain_index) = bucket
            .chains
            .iter()
            .position(|chain| chain.hash_id == hash_id)
        else {
            // No chain for this object yet; admit into a fresh one.
            let reservation = self.admit(
                &mut bucket,
                bucket_index,
                hash_id,
                None,
                offset,
                query.object_size,
            );
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Lookup::Miss(reservation);
        };

        // Walk the ordered chain; stop at the first chunk past the query.
        let mut cursor = bucket.chains[chain_index].chunks.len();
        for (i, chunk) in bucket.chains[chain_index].chunks.iter().enumerate() {
            if chunk.contains(offset, end) {
                if chunk.valid.load(Ordering::Acquire) {
                    let within = offset - chunk.offset;
                    if let Err(err) = chunk.storage.read_into(within, out) {
                        // Degrade to a plain miss; the caller reads the
                        // backing store itself.
                        warn!(%err, offset, size, "chunkcache_copyout_failed");
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        return Lookup::Miss(None);
                    }
                    trace!(
                        object_id = query.object_id.0,
                        offset,
                        size,
                        chunk_offset = chunk.offset,
                        "chunkcache_hit"
                    );
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Lookup::Hit;
                }
                // A pending chunk already covers the range; its reserver
                // will publish it. No second reservation.
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Lookup::Miss(None);
            }
            if chunk.offset > offset {
                cursor = i;
                break;
            }
        }

        let reservation = self.admit(
            &mut bucket,
            bucket_index,
            hash_id,
            Some((chain_index, cursor)),
            offset,
            query.object_size,
        );
        self.misses.fetch_add(1, Ordering::Relaxed);
        Lookup::Miss(reservation)
    }

    /// Copy `bytes` into the reserved chunk and mark it valid.
    ///
    /// `bytes.len()` must equal the reservation's size. A stale handle
    /// (the chunk was abandoned or the cache terminated) is an error. An
    /// I/O failure writing a file-backed chunk abandons the chunk and
    /// reports success; the range simply stays uncached.
    pub fn publish(&self, reservation: &Reservation, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 != reservation.size {
            return Err(SiltError::PublishSizeMismatch {
                expected: reservation.size,
                actual: bytes.len() as u64,
            });
        }

        let mut bucket = self.buckets[reservation.bucket].lock();
        let (chain_index, chunk_index) = Self::find_reserved(&bucket, reservation)?;

        let write_result = bucket.chains[chain_index].chunks[chunk_index]
            .storage
            .write_all(bytes);
        if let Err(err) = write_result {
            warn!(%err, offset = reservation.offset, "chunkcache_publish_write_failed");
            self.remove_chunk(&mut bucket, chain_index, chunk_index);
            Self::prune_empty_chain(&mut bucket, chain_index);
            return Ok(());
        }
        bucket.chains[chain_index].chunks[chunk_index]
            .valid
            .store(true, Ordering::Release);
        trace!(
            offset = reservation.offset,
            size = reservation.size,
            "chunkcache_published"
        );
        Ok(())
    }

    /// Give up a reservation whose backing read failed. The unpublished
    /// chunk is removed and its capacity refunded.
    pub fn abandon(&self, reservation: &Reservation) -> Result<()> {
        let mut bucket = self.buckets[reservation.bucket].lock();
        let (chain_index, chunk_index) = Self::find_reserved(&bucket, reservation)?;
        self.remove_chunk(&mut bucket, chain_index, chunk_index);
        Self::prune_empty_chain(&mut bucket, chain_index);
        debug!(
            offset = reservation.offset,
            size = reservation.size,
            "chunkcache_abandoned"
        );
        Ok(())
    }

    /// Drop every published chunk whose range contains, or is contained by,
    /// `[offset, offset + size)`.
    ///
    /// Chunks overlapping the range only partially are left alone: the
    /// cache never serves a range that spans chunks, so they can never
    /// serve stale bytes for this range.
    pub fn invalidate(&self, name: &str, object_id: ObjectId, offset: u64, size: u64) {
        if !self.enabled {
            return;
        }
        let Some(end) = offset.checked_add(size) else {
            return;
        };

        let hash_id = HashId::new(name, object_id);
        let bucket_index = self.bucket_index(&hash_id);
        let mut bucket = self.buckets[bucket_index].lock();

        let Some(chain_index) = bucket
            .chains
            .iter()
            .position(|chain| chain.hash_id == hash_id)
        else {
            return;
        };

        let mut i = 0;
        while i < bucket.chains[chain_index].chunks.len() {
            let chunk = &bucket.chains[chain_index].chunks[i];
            let covered = offset <= chunk.offset && end >= chunk.end();
            if chunk.valid.load(Ordering::Acquire) && (chunk.contains(offset, end) || covered) {
                trace!(
                    object_id = object_id.0,
                    chunk_offset = chunk.offset,
                    chunk_size = chunk.size,
                    "chunkcache_removed"
                );
                self.remove_chunk(&mut bucket, chain_index, i);
            } else {
                i += 1;
            }
        }
        Self::prune_empty_chain(&mut bucket, chain_index);
    }

    /// Drop all cached chunks and refund all capacity. Used at engine
    /// shutdown.
    pub fn terminate(&self) {
        for slot in self.buckets.iter() {
            let mut bucket = slot.lock();
            for chain in &bucket.chains {
                for chunk in &chain.chunks {
                    self.bytes_used.fetch_sub(chunk.size, Ordering::Relaxed);
                    self.removals.fetch_add(1, Ordering::Relaxed);
                }
            }
            bucket.chains.clear();
        }
        debug!("chunkcache_terminated");
    }

    /// Point-in-time statistics. `bytes_used` is a best-effort read.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes_used: self.bytes_used.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn bucket_index(&self, hash_id: &HashId) -> usize {
        (hash_id.hash64() % self.buckets.len() as u64) as usize
    }

    /// Charge up to `want` bytes against the capacity, returning how many
    /// were granted (possibly fewer, zero when the cache is full). The
    /// compare-exchange loop keeps `bytes_used <= capacity` even when
    /// admissions race across buckets.
    fn try_charge(&self, want: u64) -> u64 {
        let mut used = self.bytes_used.load(Ordering::Relaxed);
        loop {
            let take = want.min(self.capacity.saturating_sub(used));
            if take == 0 {
                return 0;
            }
            match self.bytes_used.compare_exchange_weak(
                used,
                used + take,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return take,
                Err(actual) => used = actual,
            }
        }
    }

    /// Admit a chunk for `offset` into the chain at `position`, creating
    /// the chain when `position` is `None`. Returns the reservation, or
    /// `None` when capacity or allocation says no.
    fn admit(
        &self,
        bucket: &mut Bucket,
        bucket_index: usize,
        hash_id: HashId,
        position: Option<(usize, usize)>,
        offset: u64,
        object_size: u64,
    ) -> Option<Reservation> {
        // Align past a predecessor that covers the front of the query, and
        // clamp to the successor so chains never overlap.
        let mut reserve_offset = offset;
        let mut limit = object_size;
        if let Some((chain_index, cursor)) = position {
            let chunks = &bucket.chains[chain_index].chunks;
            if cursor > 0 {
                reserve_offset = reserve_offset.max(chunks[cursor - 1].end());
            }
            if cursor < chunks.len() {
                limit = limit.min(chunks[cursor].offset);
            }
        }

        // Chunks never cross multiples of the default chunk size, so a
        // published chunk's end is a predictable boundary for later queries
        // and invalidations.
        let grid_room = self.default_chunk_size - (reserve_offset % self.default_chunk_size);
        let want = self
            .default_chunk_size
            .min(grid_room)
            .min(limit.saturating_sub(reserve_offset));
        if want == 0 {
            return None;
        }
        let new_size = self.try_charge(want);
        if new_size == 0 {
            return None;
        }

        let Some(storage) = ChunkStorage::allocate(&self.backing, new_size) else {
            self.bytes_used.fetch_sub(new_size, Ordering::Relaxed);
            return None;
        };
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let chunk = Chunk {
            offset: reserve_offset,
            size: new_size,
            token,
            valid: AtomicBool::new(false),
            storage,
        };

        self.allocations.fetch_add(1, Ordering::Relaxed);

        match position {
            Some((chain_index, cursor)) => {
                let chain = &mut bucket.chains[chain_index];
                trace!(
                    object_id = hash_id.object_id.0,
                    offset = reserve_offset,
                    size = new_size,
                    at = cursor,
                    "chunkcache_allocate"
                );
                chain.chunks.insert(cursor, chunk);
                chain.assert_ordered();
            }
            None => {
                trace!(
                    object_id = hash_id.object_id.0,
                    offset = reserve_offset,
                    size = new_size,
                    "chunkcache_allocate_first"
                );
                // New chains go to the collision-list head.
                bucket.chains.insert(
                    0,
                    ChunkChain {
                        hash_id,
                        chunks: vec![chunk],
                    },
                );
            }
        }

        Some(Reservation {
            bucket: bucket_index,
            hash_id,
            offset: reserve_offset,
            size: new_size,
            token,
        })
    }

    /// Locate the still-unpublished chunk a reservation points at.
    fn find_reserved(bucket: &Bucket, reservation: &Reservation) -> Result<(usize, usize)> {
        let chain_index = bucket
            .chains
            .iter()
            .position(|chain| chain.hash_id == reservation.hash_id)
            .ok_or(SiltError::StaleReservation)?;
        let chunk_index = bucket.chains[chain_index]
            .chunks
            .iter()
            .position(|chunk| {
                chunk.offset == reservation.offset
                    && chunk.token == reservation.token
                    && !chunk.valid.load(Ordering::Relaxed)
            })
            .ok_or(SiltError::StaleReservation)?;
        Ok((chain_index, chunk_index))
    }

    fn remove_chunk(&self, bucket: &mut Bucket, chain_index: usize, chunk_index: usize) {
        let chunk = bucket.chains[chain_index].chunks.remove(chunk_index);
        self.bytes_used.fetch_sub(chunk.size, Ordering::Relaxed);
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    fn prune_empty_chain(bucket: &mut Bucket, chain_index: usize) {
        if bucket.chains[chain_index].chunks.is_empty() {
            bucket.chains.swap_remove(chain_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_types::HashSize;

    fn cache_4k(capacity: u64) -> ChunkCache {
        let hashsize = HashSize::new(1024).expect("hashsize");
        ChunkCache::new(ChunkCacheConfig::dram(capacity, hashsize, 4096)).expect("cache")
    }

    fn query(name: &str, id: u32, object_size: u64, offset: u64) -> ChunkQuery<'_> {
        ChunkQuery {
            name,
            object_id: ObjectId(id),
            object_size,
            offset,
        }
    }

    fn reserve(
        cache: &ChunkCache,
        name: &str,
        id: u32,
        object_size: u64,
        offset: u64,
        len: usize,
    ) -> Reservation {
        let mut buf = vec![0_u8; len];
        match cache.lookup_or_reserve(&query(name, id, object_size, offset), &mut buf) {
            Lookup::Miss(Some(r)) => r,
            other => panic!("expected reservation, got {other:?}"),
        }
    }

    #[test]
    fn hit_after_publish() {
        let cache = cache_4k(1 << 20);
        let r0 = reserve(&cache, "obj", 0, 1 << 20, 100, 64);
        assert_eq!(r0.offset(), 100);
        // The chunk runs from the queried offset to the next 4 KiB boundary.
        assert_eq!(r0.size(), 3996);
        cache.publish(&r0, &[0xAB; 3996]).expect("publish");

        let mut buf = [0_u8; 64];
        match cache.lookup_or_reserve(&query("obj", 0, 1 << 20, 100), &mut buf) {
            Lookup::Hit => assert_eq!(buf, [0xAB; 64]),
            other => panic!("expected hit, got {other:?}"),
        }
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.bytes_used, 3996);
    }

    #[test]
    fn cross_chunk_query_misses_and_aligns() {
        let cache = cache_4k(1 << 20);
        let r0 = reserve(&cache, "obj", 0, 1 << 20, 100, 64);
        cache.publish(&r0, &vec![0xAB; r0.size() as usize]).expect("publish");

        // 100..4096 is cached; 4090..4106 spans the chunk boundary.
        let mut buf = [0_u8; 16];
        match cache.lookup_or_reserve(&query("obj", 0, 1 << 20, 4090), &mut buf) {
            Lookup::Miss(Some(r1)) => {
                // Aligned past the covering predecessor.
                assert_eq!(r1.offset(), 4096);
                assert_eq!(r1.size(), 4096);
            }
            other => panic!("expected aligned reservation, got {other:?}"),
        }
    }

    #[test]
    fn capacity_gate() {
        let cache = cache_4k(8192);
        let r0 = reserve(&cache, "obj", 0, 1 << 20, 0, 64);
        let r1 = reserve(&cache, "obj", 0, 1 << 20, 8192, 64);
        cache.publish(&r0, &[1; 4096]).expect("publish");
        cache.publish(&r1, &[2; 4096]).expect("publish");

        let mut buf = [0_u8; 64];
        match cache.lookup_or_reserve(&query("obj", 0, 1 << 20, 65536), &mut buf) {
            Lookup::Miss(None) => {}
            other => panic!("expected no-reservation miss, got {other:?}"),
        }
        assert_eq!(cache.stats().bytes_used, 8192);
    }

    #[test]
    fn invalidate_then_reserve_again() {
        let cache = cache_4k(1 << 20);
        let r0 = reserve(&cache, "obj", 0, 1 << 20, 100, 64);
        cache.publish(&r0, &vec![0xAB; r0.size() as usize]).expect("publish");

        cache.invalidate("obj", ObjectId(0), 0, 4096);

        let mut buf = [0_u8; 64];
        match cache.lookup_or_reserve(&query("obj", 0, 1 << 20, 100), &mut buf) {
            Lookup::Miss(Some(r1)) => assert_eq!(r1.offset(), 100),
            other => panic!("expected fresh reservation, got {other:?}"),
        }
        assert_eq!(cache.stats().bytes_used, 3996);
        assert_eq!(cache.stats().removals, 1);
    }

    #[test]
    fn partial_overlap_survives_invalidation() {
        let cache = cache_4k(1 << 20);
        let r0 = reserve(&cache, "obj", 0, 1 << 20, 0, 64);
        cache.publish(&r0, &[0xCD; 4096]).expect("publish");

        // The invalidation range only partially overlaps the chunk.
        cache.invalidate("obj", ObjectId(0), 4000, 4096);

        let mut buf = [0_u8; 64];
        match cache.lookup_or_reserve(&query("obj", 0, 1 << 20, 0), &mut buf) {
            Lookup::Hit => assert_eq!(buf, [0xCD; 64]),
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[test]
    fn pending_chunk_blocks_second_reservation() {
        let cache = cache_4k(1 << 20);
        let _r0 = reserve(&cache, "obj", 0, 1 << 20, 0, 64);

        let mut buf = [0_u8; 64];
        match cache.lookup_or_reserve(&query("obj", 0, 1 << 20, 0), &mut buf) {
            Lookup::Miss(None) => {}
            other => panic!("expected pending-blocked miss, got {other:?}"),
        }
    }

    #[test]
    fn abandon_refunds_capacity() {
        let cache = cache_4k(8192);
        let r0 = reserve(&cache, "obj", 0, 1 << 20, 0, 64);
        assert_eq!(cache.stats().bytes_used, 4096);
        cache.abandon(&r0).expect("abandon");
        assert_eq!(cache.stats().bytes_used, 0);
        assert!(matches!(
            cache.abandon(&r0),
            Err(SiltError::StaleReservation)
        ));
    }

    #[test]
    fn publish_size_mismatch_rejected() {
        let cache = cache_4k(1 << 20);
        let r0 = reserve(&cache, "obj", 0, 1 << 20, 0, 64);
        assert!(matches!(
            cache.publish(&r0, &[0; 100]),
            Err(SiltError::PublishSizeMismatch { .. })
        ));
    }

    #[test]
    fn admission_clamped_to_object_size() {
        let cache = cache_4k(1 << 20);
        // Object is 1000 bytes; a chunk at offset 900 may hold at most 100.
        let r0 = reserve(&cache, "short", 7, 1000, 900, 50);
        assert_eq!(r0.size(), 100);
    }

    #[test]
    fn truncated_names_collide() {
        let long_a = "a".repeat(60);
        let long_b = format!("{}b", "a".repeat(59));
        // Both truncate to 50 a's: same object identity.
        assert_eq!(HashId::new(&long_a, ObjectId(1)), HashId::new(&long_b, ObjectId(1)));
    }

    #[test]
    fn disabled_cache_is_inert() {
        let cache = ChunkCache::new(ChunkCacheConfig::disabled()).expect("cache");
        let mut buf = [0_u8; 16];
        assert!(matches!(
            cache.lookup_or_reserve(&query("obj", 0, 1 << 20, 0), &mut buf),
            Lookup::Miss(None)
        ));
        cache.invalidate("obj", ObjectId(0), 0, 4096);
    }

    #[test]
    fn file_backing_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ChunkCacheConfig {
            enabled: true,
            capacity: 1 << 20,
            hashsize: HashSize::new(64).expect("hashsize"),
            backing: CacheBacking::File(dir.path().to_path_buf()),
            default_chunk_size: 4096,
        };
        let cache = ChunkCache::new(config).expect("cache");
        let r0 = reserve(&cache, "obj", 3, 1 << 20, 0, 64);
        cache.publish(&r0, &[0x42; 4096]).expect("publish");

        let mut buf = [0_u8; 64];
        match cache.lookup_or_reserve(&query("obj", 3, 1 << 20, 1024), &mut buf) {
            Lookup::Hit => assert_eq!(buf, [0x42; 64]),
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[test]
    fn terminate_refunds_everything() {
        let cache = cache_4k(1 << 20);
        let r0 = reserve(&cache, "obj", 0, 1 << 20, 0, 64);
        cache.publish(&r0, &[1; 4096]).expect("publish");
        let _r1 = reserve(&cache, "other", 1, 1 << 20, 0, 64);
        cache.terminate();
        assert_eq!(cache.stats().bytes_used, 0);
    }
}

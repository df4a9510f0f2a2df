//! Chunk storage backing: DRAM buffers or a file arena.
//!
//! The file arena stands in for a persistent-memory allocator: chunk bytes
//! live in a single arena file created inside the configured directory and
//! are accessed with positioned reads/writes. It is an allocation choice,
//! not a crash-safe store; the arena file is removed when the cache goes
//! away.

use parking_lot::Mutex;
use silt_error::{Result, SiltError};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const ARENA_FILE_NAME: &str = "silt-chunkcache.arena";

#[derive(Debug)]
struct ArenaState {
    /// High-water mark for fresh allocations.
    next_offset: u64,
    /// Reusable slots from freed chunks, `(offset, len)`.
    free: Vec<(u64, u64)>,
}

/// Arena file providing slots for file-backed chunk storage.
///
/// Allocation is first-fit over the free list with a bump fallback. Slots
/// are returned whole; the arena never splits or merges them, which is
/// enough here because chunk sizes cluster around the configured default.
#[derive(Debug)]
pub(crate) struct FileArena {
    file: File,
    path: PathBuf,
    state: Mutex<ArenaState>,
}

impl FileArena {
    pub(crate) fn create(directory: &Path) -> Result<Self> {
        let path = directory.join(ARENA_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        debug!(path = %path.display(), "chunkcache_arena_created");
        Ok(Self {
            file,
            path,
            state: Mutex::new(ArenaState {
                next_offset: 0,
                free: Vec::new(),
            }),
        })
    }

    fn alloc(&self, len: u64) -> u64 {
        let mut state = self.state.lock();
        if let Some(pos) = state
            .free
            .iter()
            .position(|&(_, slot_len)| slot_len == len)
        {
            let (offset, _) = state.free.swap_remove(pos);
            return offset;
        }
        let offset = state.next_offset;
        state.next_offset += len;
        offset
    }

    fn free(&self, offset: u64, len: u64) {
        self.state.lock().free.push((offset, len));
    }

    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(dst, offset).map_err(SiltError::Io)
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.file.write_all_at(bytes, offset).map_err(SiltError::Io)
    }
}

impl Drop for FileArena {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "chunkcache_arena_unlink_failed");
        }
    }
}

/// Which kind of memory backs chunk buffers.
#[derive(Debug, Clone)]
pub(crate) enum BackingKind {
    Dram,
    File(Arc<FileArena>),
}

/// Owned storage for one chunk's bytes.
///
/// A file-backed slot is returned to its arena on drop, so removing a chunk
/// from a chain is all it takes to reclaim the slot.
#[derive(Debug)]
pub(crate) enum ChunkStorage {
    Dram(Vec<u8>),
    File {
        arena: Arc<FileArena>,
        offset: u64,
        len: u64,
    },
}

impl ChunkStorage {
    /// Allocate storage for `len` bytes, or `None` if allocation fails.
    ///
    /// DRAM failures are reported by `try_reserve` rather than aborting;
    /// arena failures cannot happen at allocation time because slots are
    /// materialized lazily by the first write.
    pub(crate) fn allocate(backing: &BackingKind, len: u64) -> Option<Self> {
        match backing {
            BackingKind::Dram => {
                let len_usize = usize::try_from(len).ok()?;
                let mut buf = Vec::new();
                if buf.try_reserve_exact(len_usize).is_err() {
                    warn!(len, "chunkcache_dram_alloc_failed");
                    return None;
                }
                buf.resize(len_usize, 0);
                Some(Self::Dram(buf))
            }
            BackingKind::File(arena) => {
                let offset = arena.alloc(len);
                Some(Self::File {
                    arena: Arc::clone(arena),
                    offset,
                    len,
                })
            }
        }
    }

    /// Copy `dst.len()` bytes starting at byte `from` of this chunk into `dst`.
    pub(crate) fn read_into(&self, from: u64, dst: &mut [u8]) -> Result<()> {
        match self {
            Self::Dram(buf) => {
                let start = usize::try_from(from).map_err(|_| SiltError::Io(
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "offset exceeds buffer"),
                ))?;
                dst.copy_from_slice(&buf[start..start + dst.len()]);
                Ok(())
            }
            Self::File { arena, offset, .. } => arena.read_at(offset + from, dst),
        }
    }

    /// Overwrite this chunk's bytes. `bytes.len()` must equal the chunk size.
    pub(crate) fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            Self::Dram(buf) => {
                buf.copy_from_slice(bytes);
                Ok(())
            }
            Self::File { arena, offset, .. } => arena.write_at(*offset, bytes),
        }
    }
}

impl Drop for ChunkStorage {
    fn drop(&mut self) {
        if let Self::File { arena, offset, len } = self {
            arena.free(*offset, *len);
        }
    }
}

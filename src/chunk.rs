use crate::bitmap::Bitmap;
use crate::emergency::{self, EmergencyKind};
use crate::error::{FsError, FsResult};
use crate::storage::{Chunker, ChunkerStats, MediumStat};
use parking_lot::RwLock;
use tracing::error;

/// Allocator and I/O front end for one object space: an allocation bitmap
/// plus a data container of fixed-size chunks.
///
/// `add`, `remove` and `sync` take the writer lock (the bitmap's resident
/// chunk and the container tail are shared mutable state); `read` and
/// `write` at stable indices run in parallel under the reader lock.
pub struct ChunkManager {
    inner: RwLock<ChunkInner>,
    chunk_size: usize,
    punch_holes: bool,
}

struct ChunkInner {
    map: Bitmap,
    chunks: Chunker,
    chunks_in_storage: u64,
}

impl ChunkManager {
    pub fn new(map: Bitmap, chunks: Chunker, punch_holes: bool) -> Self {
        let chunk_size = chunks.chunk_size();
        Self {
            inner: RwLock::new(ChunkInner {
                map,
                chunks,
                chunks_in_storage: 0,
            }),
            chunk_size,
            punch_holes,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn open(&self) -> FsResult<()> {
        let mut inner = self.inner.write();
        inner.map.open()?;
        inner.chunks.open()
    }

    pub fn initialize(&self) -> FsResult<()> {
        let mut inner = self.inner.write();
        inner.map.initialize()?;
        inner.chunks_in_storage = inner.chunks.size()?;
        Ok(())
    }

    pub fn chunks_in_storage(&self) -> u64 {
        self.inner.read().chunks_in_storage
    }

    pub fn sync(&self) -> FsResult<()> {
        self.inner.write().map.sync()
    }

    /// Sync and close both containers, returning their I/O statistics.
    pub fn shutdown(&self) -> (FsResult<()>, ChunkerStats, ChunkerStats) {
        let mut inner = self.inner.write();
        let mut result = inner.map.sync();
        let data_stats = inner.chunks.stats();
        let map_stats = inner.map.stats();
        if let Err(e) = inner.chunks.close() {
            if result.is_ok() {
                result = Err(e);
            }
        }
        if let Err(e) = inner.map.close() {
            if result.is_ok() {
                result = Err(e);
            }
        }
        (result, data_stats, map_stats)
    }

    /// Allocate the first free index and write `buf` there, growing the data
    /// container when the index lies past the tail. Failures roll the
    /// allocation back; a failed rollback leaves a dead chunk behind and is
    /// logged but does not mask the original error.
    pub fn add(&self, buf: &[u8]) -> FsResult<u64> {
        debug_assert_eq!(buf.len(), self.chunk_size);
        let mut inner = self.inner.write();

        let index = inner.map.first_zero()?;
        inner.map.set_one(index)?;
        if index >= inner.chunks_in_storage {
            inner.chunks_in_storage = index + 1;
            let grow = inner.chunks.set_size(index + 1);
            if let Err(e) = grow {
                inner.chunks_in_storage = index;
                if let Err(e2) = inner.map.set_zero(index) {
                    error!(
                        index,
                        error = %e2,
                        "chunk add: cannot recover from failed container growth; a dead chunk remains"
                    );
                }
                return Err(e);
            }
        }
        if let Err(e) = inner.chunks.write(index, buf) {
            let mut rollback = inner.map.set_zero(index);
            if rollback.is_ok() && index + 1 == inner.chunks_in_storage {
                inner.chunks_in_storage -= 1;
                let shrink_to = inner.chunks_in_storage;
                rollback = inner.chunks.set_size(shrink_to);
            }
            if let Err(e2) = rollback {
                error!(
                    index,
                    error = %e2,
                    "chunk add: cannot recover from failed chunk write; a dead chunk remains"
                );
            }
            return Err(e);
        }
        Ok(index)
    }

    /// Free the chunk at `index`. At the tail, all contiguous trailing free
    /// chunks are released from the container; in the middle, the chunk is
    /// optionally punched into a hole (best effort).
    pub fn remove(&self, index: u64) -> FsResult<()> {
        let mut inner = self.inner.write();

        if index >= inner.chunks_in_storage {
            error!(
                index,
                in_storage = inner.chunks_in_storage,
                chunk_size = self.chunk_size,
                "chunk remove: index out of range"
            );
            emergency::raise(EmergencyKind::Bug);
            return Err(FsError::NotRecoverable);
        }

        inner.map.set_zero(index)?;
        if index + 1 == inner.chunks_in_storage {
            inner.chunks_in_storage -= 1;
            let mut tail = index;
            while tail > 0 {
                tail -= 1;
                let live = match inner.map.get(tail) {
                    Ok(live) => live,
                    Err(e) => {
                        error!(error = %e, "chunk remove: cannot determine how many trailing chunks to release");
                        emergency::raise(EmergencyKind::SystemFailure);
                        return Err(FsError::NotRecoverable);
                    }
                };
                if live {
                    break;
                }
                inner.chunks_in_storage -= 1;
            }
            let shrink_to = inner.chunks_in_storage;
            if let Err(e) = inner.chunks.set_size(shrink_to) {
                error!(error = %e, "chunk remove: cannot release trailing chunks");
                emergency::raise(EmergencyKind::SystemFailure);
                return Err(FsError::NotRecoverable);
            }
        } else if self.punch_holes {
            if let Err(e) = inner.chunks.punch_hole(index, 1) {
                error!(index, error = %e, "chunk remove: cannot punch hole; ignoring");
            }
        }
        Ok(())
    }

    pub fn read(&self, index: u64, buf: &mut [u8]) -> FsResult<()> {
        debug_assert_eq!(buf.len(), self.chunk_size);
        let inner = self.inner.read();
        if index >= inner.chunks_in_storage {
            error!(
                index,
                in_storage = inner.chunks_in_storage,
                chunk_size = self.chunk_size,
                "chunk read: index out of range"
            );
            emergency::raise(EmergencyKind::Bug);
            return Err(FsError::NotRecoverable);
        }
        inner.chunks.read(index, buf)
    }

    pub fn write(&self, index: u64, buf: &[u8]) -> FsResult<()> {
        debug_assert_eq!(buf.len(), self.chunk_size);
        let inner = self.inner.read();
        if index >= inner.chunks_in_storage {
            error!(
                index,
                in_storage = inner.chunks_in_storage,
                chunk_size = self.chunk_size,
                "chunk write: index out of range"
            );
            emergency::raise(EmergencyKind::Bug);
            return Err(FsError::NotRecoverable);
        }
        inner.chunks.write(index, buf)
    }

    pub fn storage_size_in_bytes(&self) -> u64 {
        let inner = self.inner.read();
        inner.chunks_in_storage * self.chunk_size as u64 + inner.map.storage_size_in_bytes()
    }

    pub fn stat(&self) -> FsResult<MediumStat> {
        self.inner.read().chunks.stat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::BIT_CHUNK_SIZE;
    use crate::storage_mem::MemStorage;

    const CHUNK: usize = 32;

    fn manager(punch_holes: bool) -> ChunkManager {
        let map = Bitmap::new(Chunker::new(Box::new(MemStorage::new()), BIT_CHUNK_SIZE));
        let chunks = Chunker::new(Box::new(MemStorage::new()), CHUNK);
        let mgr = ChunkManager::new(map, chunks, punch_holes);
        mgr.open().unwrap();
        mgr.initialize().unwrap();
        mgr
    }

    #[test]
    fn add_allocates_dense_indices() {
        let mgr = manager(false);
        for expected in 0..5u64 {
            let index = mgr.add(&[expected as u8; CHUNK]).unwrap();
            assert_eq!(index, expected);
        }
        assert_eq!(mgr.chunks_in_storage(), 5);

        let mut buf = [0u8; CHUNK];
        mgr.read(3, &mut buf).unwrap();
        assert_eq!(buf, [3u8; CHUNK]);
    }

    #[test]
    fn freed_index_is_reused_first() {
        let mgr = manager(false);
        for _ in 0..4 {
            mgr.add(&[0u8; CHUNK]).unwrap();
        }
        mgr.remove(1).unwrap();
        assert_eq!(mgr.add(&[9u8; CHUNK]).unwrap(), 1);
        assert_eq!(mgr.chunks_in_storage(), 4);
    }

    #[test]
    fn tail_removal_shrinks_contiguous_free_run() {
        let mgr = manager(false);
        for _ in 0..6 {
            mgr.add(&[0u8; CHUNK]).unwrap();
        }
        mgr.remove(4).unwrap();
        assert_eq!(mgr.chunks_in_storage(), 6);
        // removing the tail releases chunk 5 and the already-free chunk 4
        mgr.remove(5).unwrap();
        assert_eq!(mgr.chunks_in_storage(), 4);
        assert_eq!(mgr.add(&[1u8; CHUNK]).unwrap(), 4);
    }

    #[test]
    fn writes_at_stable_indices_round_trip() {
        let mgr = manager(true);
        let index = mgr.add(&[0u8; CHUNK]).unwrap();
        mgr.add(&[0u8; CHUNK]).unwrap();
        mgr.write(index, &[0x5A; CHUNK]).unwrap();
        let mut buf = [0u8; CHUNK];
        mgr.read(index, &mut buf).unwrap();
        assert_eq!(buf, [0x5A; CHUNK]);
    }

    #[test]
    fn mid_container_removal_keeps_size() {
        let mgr = manager(true);
        for _ in 0..3 {
            mgr.add(&[7u8; CHUNK]).unwrap();
        }
        mgr.remove(1).unwrap();
        assert_eq!(mgr.chunks_in_storage(), 3);
    }

    #[test]
    fn storage_size_counts_data_and_map() {
        let mgr = manager(false);
        mgr.add(&[0u8; CHUNK]).unwrap();
        assert_eq!(
            mgr.storage_size_in_bytes(),
            CHUNK as u64 + BIT_CHUNK_SIZE as u64
        );
    }
}

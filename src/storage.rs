use crate::error::FsResult;
use std::sync::atomic::{AtomicU64, Ordering};

/// Capacity report of the medium underneath a container, for statfs.
#[derive(Clone, Copy, Debug, Default)]
pub struct MediumStat {
    pub max_bytes: u64,
    pub available_bytes: u64,
}

/// Byte-addressable backing store for one container file.
///
/// Implementations must tolerate concurrent `read_bytes`/`write_bytes` calls;
/// the lifecycle methods (`open`, `close`, `set_size_bytes`) are only invoked
/// with exclusive access.
pub trait Storage: Send + Sync {
    fn open(&mut self) -> FsResult<()>;
    fn close(&mut self) -> FsResult<()>;
    fn stat(&self) -> FsResult<MediumStat>;

    fn size_bytes(&self) -> FsResult<u64>;
    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> FsResult<()>;
    fn write_bytes(&self, offset: u64, buf: &[u8]) -> FsResult<()>;
    fn punch_hole_bytes(&self, offset: u64, len: u64) -> FsResult<()>;
    fn set_size_bytes(&mut self, len: u64) -> FsResult<()>;
}

/// Chunk-indexed view over a [`Storage`] with a fixed chunk size, plus I/O
/// statistics. All offsets are `index * chunk_size`; buffer lengths must be
/// whole multiples of the chunk size.
pub struct Chunker {
    storage: Box<dyn Storage>,
    chunk_size: usize,
    chunks_in: AtomicU64,
    chunks_out: AtomicU64,
    chunks_punched: AtomicU64,
}

impl Chunker {
    pub fn new(storage: Box<dyn Storage>, chunk_size: usize) -> Self {
        Self {
            storage,
            chunk_size,
            chunks_in: AtomicU64::new(0),
            chunks_out: AtomicU64::new(0),
            chunks_punched: AtomicU64::new(0),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn open(&mut self) -> FsResult<()> {
        self.storage.open()
    }

    pub fn close(&mut self) -> FsResult<()> {
        self.storage.close()
    }

    pub fn stat(&self) -> FsResult<MediumStat> {
        self.storage.stat()
    }

    /// Number of whole chunks currently in the container.
    pub fn size(&self) -> FsResult<u64> {
        Ok(self.storage.size_bytes()? / self.chunk_size as u64)
    }

    pub fn read(&self, index: u64, buf: &mut [u8]) -> FsResult<()> {
        debug_assert_eq!(buf.len() % self.chunk_size, 0);
        self.storage
            .read_bytes(index * self.chunk_size as u64, buf)?;
        self.chunks_in
            .fetch_add((buf.len() / self.chunk_size) as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn write(&self, index: u64, buf: &[u8]) -> FsResult<()> {
        debug_assert_eq!(buf.len() % self.chunk_size, 0);
        self.storage
            .write_bytes(index * self.chunk_size as u64, buf)?;
        self.chunks_out
            .fetch_add((buf.len() / self.chunk_size) as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn punch_hole(&self, index: u64, count: u64) -> FsResult<()> {
        self.storage.punch_hole_bytes(
            index * self.chunk_size as u64,
            count * self.chunk_size as u64,
        )?;
        self.chunks_punched.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_size(&mut self, chunks: u64) -> FsResult<()> {
        self.storage.set_size_bytes(chunks * self.chunk_size as u64)
    }

    pub fn stats(&self) -> ChunkerStats {
        ChunkerStats {
            chunk_size: self.chunk_size,
            chunks_in: self.chunks_in.load(Ordering::Relaxed),
            chunks_out: self.chunks_out.load(Ordering::Relaxed),
            chunks_punched: self.chunks_punched.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ChunkerStats {
    pub chunk_size: usize,
    pub chunks_in: u64,
    pub chunks_out: u64,
    pub chunks_punched: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_mem::MemStorage;

    #[test]
    fn chunk_io_multiplies_indices() {
        let mut chunker = Chunker::new(Box::new(MemStorage::new()), 8);
        chunker.open().unwrap();
        chunker.set_size(3).unwrap();
        assert_eq!(chunker.size().unwrap(), 3);

        chunker.write(2, &7u64.to_ne_bytes()).unwrap();
        let mut buf = [0u8; 8];
        chunker.read(2, &mut buf).unwrap();
        assert_eq!(u64::from_ne_bytes(buf), 7);

        let stats = chunker.stats();
        assert_eq!(stats.chunks_in, 1);
        assert_eq!(stats.chunks_out, 1);
        assert_eq!(stats.chunk_size, 8);
    }

    #[test]
    fn multi_chunk_transfers_count_each_chunk() {
        let mut chunker = Chunker::new(Box::new(MemStorage::new()), 4);
        chunker.open().unwrap();
        chunker.set_size(4).unwrap();
        chunker.write(0, &[1u8; 16]).unwrap();
        let mut buf = [0u8; 16];
        chunker.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1u8; 16]);
        assert_eq!(chunker.stats().chunks_out, 4);
        assert_eq!(chunker.stats().chunks_in, 4);
    }
}

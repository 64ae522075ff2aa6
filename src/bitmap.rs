use crate::INVALID_INDEX;
use crate::emergency::{self, EmergencyKind};
use crate::error::{FsError, FsResult};
use crate::storage::Chunker;
use tracing::error;

/// One allocation bit per object slot, stored in 8-byte chunks (bit `i` of
/// chunk `c` covers slot `64c + i`). Exactly one chunk is resident at a
/// time; a first-zero hint advances on allocation and retreats on free.
pub struct Bitmap {
    chunks: Chunker,
    bit_chunks_in_storage: u64,
    current: u64,
    current_index: u64,
    modified: bool,
    first_zero_candidate: u64,
}

pub const BIT_CHUNK_SIZE: usize = size_of::<u64>();
const BITS_PER_CHUNK: u64 = 64;

fn to_bit_chunk_index(index: u64) -> u64 {
    index / BITS_PER_CHUNK
}

fn to_bit_index(index: u64) -> u64 {
    index % BITS_PER_CHUNK
}

impl Bitmap {
    pub fn new(chunks: Chunker) -> Self {
        debug_assert_eq!(chunks.chunk_size(), BIT_CHUNK_SIZE);
        Self {
            chunks,
            bit_chunks_in_storage: 0,
            current: 0,
            current_index: INVALID_INDEX,
            modified: false,
            first_zero_candidate: 0,
        }
    }

    pub fn open(&mut self) -> FsResult<()> {
        self.chunks.open()
    }

    pub fn close(&mut self) -> FsResult<()> {
        self.chunks.close()
    }

    pub fn initialize(&mut self) -> FsResult<()> {
        self.bit_chunks_in_storage = self.chunks.size()?;
        if self.bit_chunks_in_storage == 0 {
            self.current = 0;
            self.bit_chunks_in_storage = 1;
            self.chunks.set_size(1)?;
        } else {
            self.current = self.read_chunk(0)?;
        }
        self.current_index = 0;
        Ok(())
    }

    fn read_chunk(&self, index: u64) -> FsResult<u64> {
        let mut buf = [0u8; BIT_CHUNK_SIZE];
        self.chunks.read(index, &mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    /// Swap the resident chunk, flushing the old one first. Chunks past the
    /// end of the container are brought into existence as all-zero.
    fn set_current_index(&mut self, bit_chunk_index: u64) -> FsResult<()> {
        if bit_chunk_index == self.current_index {
            return Ok(());
        }
        self.sync()?;
        if bit_chunk_index >= self.bit_chunks_in_storage {
            self.current = 0;
            self.bit_chunks_in_storage = bit_chunk_index + 1;
            self.chunks.set_size(self.bit_chunks_in_storage)?;
        } else {
            self.current = match self.read_chunk(bit_chunk_index) {
                Ok(chunk) => chunk,
                Err(e) => {
                    error!(bit_chunk_index, "bitmap: cannot load bit chunk");
                    return Err(e);
                }
            };
        }
        self.current_index = bit_chunk_index;
        Ok(())
    }

    /// Smallest index whose bit is zero, starting the scan at the hint.
    pub fn first_zero(&mut self) -> FsResult<u64> {
        let mut bit_chunk_index = to_bit_chunk_index(self.first_zero_candidate);
        let bit_index;
        loop {
            self.set_current_index(bit_chunk_index)?;
            if !self.current != 0 {
                // first zero bit = number of trailing ones
                bit_index = (!self.current).trailing_zeros() as u64;
                break;
            }
            bit_chunk_index += 1;
        }
        self.first_zero_candidate = bit_chunk_index * BITS_PER_CHUNK + bit_index;
        Ok(self.first_zero_candidate)
    }

    pub fn set(&mut self, index: u64, bit: bool) -> FsResult<()> {
        self.set_current_index(to_bit_chunk_index(index))?;
        let previous = self.current;
        let mask = 1u64 << to_bit_index(index);
        if bit {
            self.current |= mask;
            if index == self.first_zero_candidate {
                self.first_zero_candidate += 1;
            }
        } else {
            self.current &= !mask;
            if index < self.first_zero_candidate {
                self.first_zero_candidate = index;
            }
        }
        self.modified |= previous != self.current;
        Ok(())
    }

    pub fn set_one(&mut self, index: u64) -> FsResult<()> {
        self.set(index, true)
    }

    pub fn set_zero(&mut self, index: u64) -> FsResult<()> {
        self.set(index, false)
    }

    pub fn get(&mut self, index: u64) -> FsResult<bool> {
        self.set_current_index(to_bit_chunk_index(index))?;
        Ok(self.current & (1u64 << to_bit_index(index)) != 0)
    }

    /// Flush the resident chunk. When the resident chunk is the trailing
    /// chunk and all-zero, trailing zero chunks are removed from the
    /// container (at least one chunk always remains) and the new tail chunk
    /// becomes resident.
    pub fn sync(&mut self) -> FsResult<()> {
        if self.current_index >= self.bit_chunks_in_storage {
            error!("bitmap sync: resident bit chunk index out of range");
            emergency::raise(EmergencyKind::Bug);
            return Err(FsError::NotRecoverable);
        }

        if self.current == 0
            && self.current_index + 1 == self.bit_chunks_in_storage
            && self.bit_chunks_in_storage > 1
        {
            let mut remaining = self.current_index;
            while remaining > 1 {
                if self.read_chunk(remaining - 1)? != 0 {
                    break;
                }
                remaining -= 1;
            }
            self.chunks.set_size(remaining)?;
            self.bit_chunks_in_storage = remaining;
            self.current_index = remaining - 1;
            self.current = self.read_chunk(self.current_index)?;
        } else if self.modified {
            let buf = self.current.to_ne_bytes();
            if let Err(e) = self.chunks.write(self.current_index, &buf) {
                error!(index = self.current_index, "bitmap sync: write failed");
                return Err(e);
            }
        }

        self.modified = false;
        Ok(())
    }

    pub fn storage_size_in_bytes(&self) -> u64 {
        self.bit_chunks_in_storage * BIT_CHUNK_SIZE as u64
    }

    pub fn stats(&self) -> crate::storage::ChunkerStats {
        self.chunks.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Chunker;
    use crate::storage_mem::MemStorage;

    fn bitmap() -> Bitmap {
        let chunker = Chunker::new(Box::new(MemStorage::new()), BIT_CHUNK_SIZE);
        let mut bitmap = Bitmap::new(chunker);
        bitmap.open().unwrap();
        bitmap.initialize().unwrap();
        bitmap
    }

    #[test]
    fn first_zero_tracks_allocations() {
        let mut map = bitmap();
        for expected in 0..130u64 {
            let index = map.first_zero().unwrap();
            assert_eq!(index, expected);
            map.set_one(index).unwrap();
        }
        map.set_zero(7).unwrap();
        assert_eq!(map.first_zero().unwrap(), 7);
        map.set_one(7).unwrap();
        assert_eq!(map.first_zero().unwrap(), 130);
    }

    #[test]
    fn get_reflects_set() {
        let mut map = bitmap();
        map.set_one(100).unwrap();
        assert!(map.get(100).unwrap());
        assert!(!map.get(99).unwrap());
        map.set_zero(100).unwrap();
        assert!(!map.get(100).unwrap());
    }

    #[test]
    fn bits_survive_chunk_swapping() {
        let mut map = bitmap();
        map.set_one(3).unwrap();
        map.set_one(64 * 5 + 1).unwrap();
        // touch a distant chunk so both earlier ones get written out
        map.set_one(64 * 9).unwrap();
        assert!(map.get(3).unwrap());
        assert!(map.get(64 * 5 + 1).unwrap());
        assert!(!map.get(64 * 5).unwrap());
    }

    #[test]
    fn sync_shrinks_trailing_zero_chunks() {
        let mut map = bitmap();
        map.set_one(64 * 4).unwrap(); // forces five chunks into storage
        map.sync().unwrap();
        assert_eq!(map.storage_size_in_bytes(), 5 * BIT_CHUNK_SIZE as u64);

        map.set_zero(64 * 4).unwrap();
        map.sync().unwrap();
        // all chunks are zero again; one chunk is always kept
        assert_eq!(map.storage_size_in_bytes(), BIT_CHUNK_SIZE as u64);
        assert_eq!(map.first_zero().unwrap(), 0);
    }

    #[test]
    fn sync_keeps_populated_tail() {
        let mut map = bitmap();
        map.set_one(64 * 2 + 5).unwrap();
        map.set_one(64 * 4 + 1).unwrap();
        map.set_zero(64 * 4 + 1).unwrap();
        map.sync().unwrap();
        // shrink stops at the populated chunk 2
        assert_eq!(map.storage_size_in_bytes(), 3 * BIT_CHUNK_SIZE as u64);
        assert!(map.get(64 * 2 + 5).unwrap());
    }

    #[test]
    fn idempotent_set_does_not_lose_dirty_state() {
        let mut map = bitmap();
        map.set_one(1).unwrap();
        map.set_one(1).unwrap(); // no-op must not clear the dirty flag
        map.sync().unwrap();
        // move away and back to force a reload from storage
        map.set_one(64 * 3).unwrap();
        assert!(map.get(1).unwrap());
    }
}

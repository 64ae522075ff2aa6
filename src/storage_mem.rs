use crate::error::{FsError, FsResult};
use crate::storage::{MediumStat, Storage};
use parking_lot::Mutex;

/// RAM-backed container. Once an allocation fails the backend latches a
/// fatal flag and reports an I/O error to every subsequent call, so a
/// half-grown container is never silently used.
pub struct MemStorage {
    inner: Mutex<MemInner>,
}

struct MemInner {
    data: Vec<u8>,
    fatal: bool,
}

impl MemStorage {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemInner {
                data: Vec::new(),
                fatal: false,
            }),
        }
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn io_error() -> FsError {
    FsError::Io(std::io::Error::from_raw_os_error(libc::EIO))
}

impl MemInner {
    fn grow_to(&mut self, len: usize) -> FsResult<()> {
        if self.data.try_reserve(len.saturating_sub(self.data.len())).is_err() {
            self.fatal = true;
            return Err(FsError::OutOfMemory);
        }
        self.data.resize(len, 0);
        Ok(())
    }
}

impl Storage for MemStorage {
    fn open(&mut self) -> FsResult<()> {
        Ok(())
    }

    fn close(&mut self) -> FsResult<()> {
        let mut inner = self.inner.lock();
        if inner.fatal {
            return Err(io_error());
        }
        inner.data.clear();
        Ok(())
    }

    fn stat(&self) -> FsResult<MediumStat> {
        let info = nix::sys::sysinfo::sysinfo()?;
        Ok(MediumStat {
            max_bytes: info.ram_total(),
            available_bytes: info.ram_unused(),
        })
    }

    fn size_bytes(&self) -> FsResult<u64> {
        let inner = self.inner.lock();
        if inner.fatal {
            return Err(io_error());
        }
        Ok(inner.data.len() as u64)
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        let inner = self.inner.lock();
        if inner.fatal {
            return Err(io_error());
        }
        let end = offset as usize + buf.len();
        if end > inner.data.len() {
            return Err(io_error());
        }
        buf.copy_from_slice(&inner.data[offset as usize..end]);
        Ok(())
    }

    fn write_bytes(&self, offset: u64, buf: &[u8]) -> FsResult<()> {
        let mut inner = self.inner.lock();
        if inner.fatal {
            return Err(io_error());
        }
        let end = offset as usize + buf.len();
        if end > inner.data.len() {
            inner.grow_to(end)?;
        }
        inner.data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn punch_hole_bytes(&self, _offset: u64, _len: u64) -> FsResult<()> {
        let inner = self.inner.lock();
        if inner.fatal {
            return Err(io_error());
        }
        Ok(())
    }

    fn set_size_bytes(&mut self, len: u64) -> FsResult<()> {
        let mut inner = self.inner.lock();
        if inner.fatal {
            return Err(io_error());
        }
        if len as usize > inner.data.len() {
            inner.grow_to(len as usize)?;
        } else {
            inner.data.truncate(len as usize);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_grow_the_container() {
        let storage = MemStorage::new();
        storage.write_bytes(10, &[0xAB; 4]).unwrap();
        assert_eq!(storage.size_bytes().unwrap(), 14);

        let mut buf = [0u8; 4];
        storage.read_bytes(10, &mut buf).unwrap();
        assert_eq!(buf, [0xAB; 4]);

        // bytes below the write are zero-filled
        let mut head = [0xFFu8; 10];
        storage.read_bytes(0, &mut head).unwrap();
        assert_eq!(head, [0u8; 10]);
    }

    #[test]
    fn read_past_end_is_an_error() {
        let storage = MemStorage::new();
        let mut buf = [0u8; 1];
        assert!(storage.read_bytes(0, &mut buf).is_err());
    }

    #[test]
    fn resize_truncates_and_extends() {
        let mut storage = MemStorage::new();
        storage.set_size_bytes(8).unwrap();
        storage.write_bytes(0, &[1u8; 8]).unwrap();
        storage.set_size_bytes(4).unwrap();
        assert_eq!(storage.size_bytes().unwrap(), 4);
        storage.set_size_bytes(8).unwrap();
        let mut buf = [0xFFu8; 8];
        storage.read_bytes(0, &mut buf).unwrap();
        assert_eq!(&buf[..4], &[1u8; 4]);
        assert_eq!(&buf[4..], &[0u8; 4]);
    }
}

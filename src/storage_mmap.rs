use crate::error::{FsError, FsResult};
use crate::storage::{MediumStat, Storage};
use memmap2::MmapRaw;
use nix::sys::statvfs::statvfs;
use nix::unistd::{SysconfVar, sysconf};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;

/// Memory-mapped container. The mapping length is the logical size rounded
/// up to the page size (at least one page); the logical size is tracked
/// separately and the file is truncated back to it on close, so readers of
/// the raw file never see the rounded-up tail.
pub struct MmapStorage {
    page_size: u64,
    path: PathBuf,
    state: Option<MmapState>,
}

struct MmapState {
    file: File,
    map: MmapRaw,
    mapped_len: u64,
    size: u64,
}

fn page_size() -> u64 {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(n)) if n > 0 => n as u64,
        _ => 4096,
    }
}

fn size_to_map_length(page_size: u64, size: u64) -> u64 {
    let len = size.next_multiple_of(page_size);
    if len == 0 { page_size } else { len }
}

impl MmapStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            page_size: page_size(),
            path: path.into(),
            state: None,
        }
    }

    fn state(&self) -> FsResult<&MmapState> {
        self.state.as_ref().ok_or(FsError::InvalidArgument)
    }
}

impl Storage for MmapStorage {
    fn open(&mut self) -> FsResult<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        let size = file.metadata()?.len();
        let mapped_len = size_to_map_length(self.page_size, size);
        file.set_len(mapped_len)?;
        let map = MmapRaw::map_raw(&file)?;
        self.state = Some(MmapState {
            file,
            map,
            mapped_len,
            size,
        });
        Ok(())
    }

    fn close(&mut self) -> FsResult<()> {
        if let Some(state) = self.state.take() {
            let MmapState { file, map, size, .. } = state;
            drop(map);
            file.set_len(size)?;
        }
        Ok(())
    }

    fn stat(&self) -> FsResult<MediumStat> {
        let vfs = statvfs(&self.path)?;
        Ok(MediumStat {
            max_bytes: vfs.blocks() * vfs.fragment_size(),
            available_bytes: vfs.blocks_available() * vfs.fragment_size(),
        })
    }

    fn size_bytes(&self) -> FsResult<u64> {
        Ok(self.state()?.size)
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        let state = self.state()?;
        if offset + buf.len() as u64 > state.size {
            return Err(FsError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
        }
        // In-bounds by the check above; concurrent accesses never overlap
        // because chunk ownership is exclusive per caller.
        unsafe {
            std::ptr::copy_nonoverlapping(
                state.map.as_ptr().add(offset as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    fn write_bytes(&self, offset: u64, buf: &[u8]) -> FsResult<()> {
        let state = self.state()?;
        if offset + buf.len() as u64 > state.size {
            // Growth goes through set_size_bytes; a write past the logical
            // size would race the mapping.
            return Err(FsError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                state.map.as_mut_ptr().add(offset as usize),
                buf.len(),
            );
        }
        Ok(())
    }

    fn punch_hole_bytes(&self, _offset: u64, _len: u64) -> FsResult<()> {
        Ok(())
    }

    fn set_size_bytes(&mut self, len: u64) -> FsResult<()> {
        let state = self.state.as_mut().ok_or(FsError::InvalidArgument)?;
        let new_mapped = size_to_map_length(self.page_size, len);
        if new_mapped != state.mapped_len {
            state.file.set_len(new_mapped)?;
            state.map = MmapRaw::map_raw(&state.file)?;
            state.mapped_len = new_mapped;
        }
        state.size = len;
        Ok(())
    }
}

impl Drop for MmapStorage {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn map_length_rounds_up_to_pages() {
        assert_eq!(size_to_map_length(4096, 0), 4096);
        assert_eq!(size_to_map_length(4096, 1), 4096);
        assert_eq!(size_to_map_length(4096, 4096), 4096);
        assert_eq!(size_to_map_length(4096, 4097), 8192);
    }

    #[test]
    fn logical_size_survives_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.6fs");
        {
            let mut storage = MmapStorage::new(&path);
            storage.open().unwrap();
            storage.set_size_bytes(10).unwrap();
            storage.write_bytes(0, b"0123456789").unwrap();
            storage.close().unwrap();
        }
        // on-disk file is truncated back to the logical size
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);

        let mut storage = MmapStorage::new(&path);
        storage.open().unwrap();
        assert_eq!(storage.size_bytes().unwrap(), 10);
        let mut buf = [0u8; 10];
        storage.read_bytes(0, &mut buf).unwrap();
        assert_eq!(&buf, b"0123456789");
    }

    #[test]
    fn growth_across_page_boundary_remaps() {
        let dir = tempdir().unwrap();
        let mut storage = MmapStorage::new(dir.path().join("data.6fs"));
        storage.open().unwrap();
        storage.set_size_bytes(4096).unwrap();
        storage.write_bytes(4090, &[0xEE; 6]).unwrap();
        storage.set_size_bytes(3 * 4096 + 5).unwrap();
        let mut buf = [0u8; 6];
        storage.read_bytes(4090, &mut buf).unwrap();
        assert_eq!(buf, [0xEE; 6]);
        storage.write_bytes(3 * 4096, &[1; 5]).unwrap();
        storage.close().unwrap();
    }

    #[test]
    fn reads_past_logical_size_fail() {
        let dir = tempdir().unwrap();
        let mut storage = MmapStorage::new(dir.path().join("data.6fs"));
        storage.open().unwrap();
        storage.set_size_bytes(8).unwrap();
        let mut buf = [0u8; 9];
        assert!(storage.read_bytes(0, &mut buf).is_err());
    }
}

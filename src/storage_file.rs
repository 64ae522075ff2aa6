use crate::error::{FsError, FsResult};
use crate::storage::{MediumStat, Storage};
use nix::fcntl::{FallocateFlags, OFlag, fallocate, open};
use nix::sys::stat::{Mode, fstat};
use nix::sys::statvfs::statvfs;
use nix::sys::uio::{pread, pwrite};
use nix::unistd::ftruncate;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;

/// Plain-file container driven with positional I/O. Short reads and writes
/// are retried until the transfer completes.
pub struct FileStorage {
    path: PathBuf,
    fd: Option<OwnedFd>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fd: None,
        }
    }

    fn fd(&self) -> FsResult<&OwnedFd> {
        self.fd.as_ref().ok_or(FsError::InvalidArgument)
    }
}

impl Storage for FileStorage {
    fn open(&mut self) -> FsResult<()> {
        let fd = open(
            &self.path,
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_CLOEXEC,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        // open(2) hands us a fresh descriptor that nobody else owns
        self.fd = Some(unsafe { OwnedFd::from_raw_fd(fd) });
        Ok(())
    }

    fn close(&mut self) -> FsResult<()> {
        self.fd = None;
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
        let stat = fstat(self.fd()?.as_raw_fd())?;
        Ok(stat.st_size as u64)
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        let fd = self.fd()?;
        let mut done = 0usize;
        while done < buf.len() {
            let n = pread(fd.as_fd(), &mut buf[done..], (offset as i64) + done as i64)?;
            if n == 0 {
                return Err(FsError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
            }
            done += n;
        }
        Ok(())
    }

    fn write_bytes(&self, offset: u64, buf: &[u8]) -> FsResult<()> {
        let fd = self.fd()?;
        let mut done = 0usize;
        while done < buf.len() {
            let n = pwrite(fd.as_fd(), &buf[done..], (offset as i64) + done as i64)?;
            done += n;
        }
        Ok(())
    }

    fn punch_hole_bytes(&self, offset: u64, len: u64) -> FsResult<()> {
        let fd = self.fd()?;
        // Not every filesystem supports hole punching; the structure stays
        // valid without it, so failures are ignored.
        let _ = fallocate(
            fd.as_raw_fd(),
            FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE,
            offset as i64,
            len as i64,
        );
        Ok(())
    }

    fn set_size_bytes(&mut self, len: u64) -> FsResult<()> {
        let fd = self.fd.as_ref().ok_or(FsError::InvalidArgument)?;
        ftruncate(fd.as_fd(), len as i64)?;
        Ok(())
    }
}

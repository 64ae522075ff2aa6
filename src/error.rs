use std::fmt;
use std::io;

/// Failure taxonomy of the filesystem core. Every variant maps onto a POSIX
/// errno so adapters can hand results straight back to the kernel.
#[derive(Debug)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    NotEmpty,
    NotADirectory,
    IsADirectory,
    NameTooLong,
    TooManyLinks,
    NoSpace,
    InvalidArgument,
    /// The emergency latch is set; all writers are refused.
    ReadOnlyFilesystem,
    /// Internal consistency violation; the latch has been raised.
    NotRecoverable,
    /// The containers hold records in an unsupported format.
    BadFileFormat,
    OutOfMemory,
    Io(io::Error),
}

impl FsError {
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => FsError::NotFound,
            libc::EEXIST => FsError::AlreadyExists,
            libc::ENOTEMPTY => FsError::NotEmpty,
            libc::ENOTDIR => FsError::NotADirectory,
            libc::EISDIR => FsError::IsADirectory,
            libc::ENAMETOOLONG => FsError::NameTooLong,
            libc::EMLINK => FsError::TooManyLinks,
            libc::ENOSPC => FsError::NoSpace,
            libc::EINVAL => FsError::InvalidArgument,
            libc::EROFS => FsError::ReadOnlyFilesystem,
            libc::ENOTRECOVERABLE => FsError::NotRecoverable,
            libc::EBADF => FsError::BadFileFormat,
            libc::ENOMEM => FsError::OutOfMemory,
            _ => FsError::Io(io::Error::from_raw_os_error(errno)),
        }
    }

    /// Positive errno value for this error; adapters negate it for the kernel.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::TooManyLinks => libc::EMLINK,
            FsError::NoSpace => libc::ENOSPC,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::ReadOnlyFilesystem => libc::EROFS,
            FsError::NotRecoverable => libc::ENOTRECOVERABLE,
            FsError::BadFileFormat => libc::EBADF,
            FsError::OutOfMemory => libc::ENOMEM,
            FsError::Io(ioe) => ioe.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::NotFound => write!(f, "no such file or directory"),
            FsError::AlreadyExists => write!(f, "file exists"),
            FsError::NotEmpty => write!(f, "directory not empty"),
            FsError::NotADirectory => write!(f, "not a directory"),
            FsError::IsADirectory => write!(f, "is a directory"),
            FsError::NameTooLong => write!(f, "file name too long"),
            FsError::TooManyLinks => write!(f, "too many links"),
            FsError::NoSpace => write!(f, "no space left on device"),
            FsError::InvalidArgument => write!(f, "invalid argument"),
            FsError::ReadOnlyFilesystem => write!(f, "read-only file system"),
            FsError::NotRecoverable => write!(f, "state not recoverable"),
            FsError::BadFileFormat => write!(f, "bad container format"),
            FsError::OutOfMemory => write!(f, "out of memory"),
            FsError::Io(ioe) => write!(f, "I/O error: {ioe}"),
        }
    }
}

impl std::error::Error for FsError {}

impl From<io::Error> for FsError {
    fn from(value: io::Error) -> Self {
        if let Some(errno) = value.raw_os_error() {
            FsError::from_errno(errno)
        } else {
            FsError::Io(value)
        }
    }
}

impl From<nix::Error> for FsError {
    fn from(value: nix::Error) -> Self {
        FsError::from_errno(value as i32)
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trip() {
        for errno in [
            libc::ENOENT,
            libc::EEXIST,
            libc::ENOTEMPTY,
            libc::ENOTDIR,
            libc::EISDIR,
            libc::ENAMETOOLONG,
            libc::EMLINK,
            libc::ENOSPC,
            libc::EINVAL,
            libc::EROFS,
            libc::ENOTRECOVERABLE,
            libc::ENOMEM,
        ] {
            assert_eq!(FsError::from_errno(errno).errno(), errno);
        }
    }

    #[test]
    fn unknown_errno_becomes_io() {
        let err = FsError::from_errno(libc::EIO);
        assert!(matches!(err, FsError::Io(_)));
        assert_eq!(err.errno(), libc::EIO);
    }
}

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Bytes reserved for a dirent name, including the NUL terminator.
pub const NAME_CAPACITY: usize = 256;

/// Longest usable name: the capacity minus the terminator.
pub const MAX_NAME_LEN: usize = NAME_CAPACITY - 1;

pub const DIRENT_SIZE: usize = size_of::<Dirent>();

/// A directory entry: fixed-size NUL-terminated name plus the index of the
/// inode it refers to. Directory inodes point at dirents through their slot
/// trees, in ascending name order.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Dirent {
    pub name: [u8; NAME_CAPACITY],
    pub inode_index: u64,
}

impl Dirent {
    pub fn new(name: &[u8], inode_index: u64) -> Self {
        debug_assert!(name.len() <= MAX_NAME_LEN);
        let mut dirent = Self {
            name: [0; NAME_CAPACITY],
            inode_index,
        };
        dirent.name[..name.len()].copy_from_slice(name);
        dirent
    }

    /// Name content up to the NUL terminator.
    pub fn name_bytes(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_NAME_LEN);
        &self.name[..end]
    }

    pub fn set_name(&mut self, name: &[u8]) {
        debug_assert!(name.len() <= MAX_NAME_LEN);
        self.name = [0; NAME_CAPACITY];
        self.name[..name.len()].copy_from_slice(name);
    }
}

impl std::fmt::Debug for Dirent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dirent")
            .field("name", &String::from_utf8_lossy(self.name_bytes()))
            .field("inode_index", &self.inode_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_has_no_padding() {
        assert_eq!(DIRENT_SIZE, NAME_CAPACITY + 8);
    }

    #[test]
    fn name_is_terminated_and_recoverable() {
        let dirent = Dirent::new(b"hello", 42);
        assert_eq!(dirent.name_bytes(), b"hello");
        assert_eq!(dirent.inode_index, 42);
        assert!(dirent.name[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn set_name_clears_previous_content() {
        let mut dirent = Dirent::new(b"longer-name", 1);
        dirent.set_name(b"ab");
        assert_eq!(dirent.name_bytes(), b"ab");
        assert!(dirent.name[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn max_length_name_fits() {
        let name = [b'x'; MAX_NAME_LEN];
        let dirent = Dirent::new(&name, 0);
        assert_eq!(dirent.name_bytes(), &name);
    }
}

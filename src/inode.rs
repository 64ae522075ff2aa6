use crate::INVALID_INDEX;
use crate::time::UnixTime;
use nix::unistd::{getegid, geteuid};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

// POSIX file type bits, top nibble of type_and_mode.
pub const TYPE_MASK: u32 = 0o170000;
pub const TYPE_SOCK: u32 = 0o140000;
pub const TYPE_LNK: u32 = 0o120000;
pub const TYPE_REG: u32 = 0o100000;
pub const TYPE_BLK: u32 = 0o060000;
pub const TYPE_DIR: u32 = 0o040000;
pub const TYPE_CHR: u32 = 0o020000;
pub const TYPE_FIFO: u32 = 0o010000;

// Permission, set-ID and sticky bits.
pub const MODE_MASK: u32 = 0o7777;
pub const MODE_SUID: u32 = 0o4000;
pub const MODE_SGID: u32 = 0o2000;
pub const MODE_SVTX: u32 = 0o1000;
pub const MODE_RWXU: u32 = 0o0700;

pub const INODE_SIZE: usize = size_of::<Inode>();

/// Number of slot-tree roots per inode (tree depths 0 through 4).
pub const SLOT_TREE_COUNT: usize = 5;

/// An inode record: owner, type, permissions, link count, size, timestamps,
/// plus the roots of the five slot trees that address the inode's blocks or
/// dirents. `xattr_index` is reserved.
#[derive(Clone, Copy, Debug, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Inode {
    pub atime: UnixTime,
    pub ctime: UnixTime,
    pub mtime: UnixTime,
    pub uid: u32,
    pub gid: u32,
    pub type_and_mode: u32,
    reserved: u32,
    pub nlink: u64,
    pub rdev: u64,
    pub size: u64,
    pub slot_trees: [u64; SLOT_TREE_COUNT],
    pub xattr_index: u64,
}

impl Inode {
    /// Freshly born inode: current timestamps, effective owner, one link,
    /// no type bits, no slots.
    pub fn empty() -> Self {
        let now = UnixTime::now();
        Self {
            atime: now,
            ctime: now,
            mtime: now,
            uid: geteuid().as_raw(),
            gid: getegid().as_raw(),
            type_and_mode: 0,
            reserved: 0,
            nlink: 1,
            rdev: 0,
            size: 0,
            slot_trees: [INVALID_INDEX; SLOT_TREE_COUNT],
            xattr_index: INVALID_INDEX,
        }
    }

    /// Directory inode; inherits the group and the set-group-ID bit from a
    /// set-group-ID parent. Link count 2 for "." and "..".
    pub fn directory(parent: Option<&Inode>, mode: u32) -> Self {
        let mut inode = Self::empty();
        inode.type_and_mode = TYPE_DIR | (mode & !TYPE_MASK);
        if let Some(parent) = parent {
            if parent.type_and_mode & MODE_SGID != 0 {
                inode.gid = parent.gid;
                inode.type_and_mode |= MODE_SGID;
            }
        }
        inode.nlink = 2;
        inode
    }

    /// Regular file, device node, fifo or socket.
    pub fn node(type_and_mode: u32, rdev: u64) -> Self {
        let mut inode = Self::empty();
        inode.type_and_mode = type_and_mode;
        inode.rdev = rdev;
        inode
    }

    /// Symlink whose target string lives in the block at `block_index`.
    pub fn symlink(target_len: u64, block_index: u64) -> Self {
        let mut inode = Self::empty();
        inode.type_and_mode = TYPE_LNK;
        inode.size = target_len;
        inode.slot_trees[0] = block_index;
        inode
    }

    pub fn file_type(&self) -> u32 {
        self.type_and_mode & TYPE_MASK
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == TYPE_DIR
    }

    pub fn is_regular(&self) -> bool {
        self.file_type() == TYPE_REG
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == TYPE_LNK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_has_no_padding() {
        // 3 * 16 (times) + 4 * 4 (ids, mode, reserved) + 3 * 8 + 5 * 8 + 8
        assert_eq!(INODE_SIZE, 136);
    }

    #[test]
    fn empty_inode_has_one_link_and_no_slots() {
        let inode = Inode::empty();
        assert_eq!(inode.nlink, 1);
        assert_eq!(inode.size, 0);
        assert_eq!(inode.slot_trees, [INVALID_INDEX; SLOT_TREE_COUNT]);
        assert_eq!(inode.xattr_index, INVALID_INDEX);
    }

    #[test]
    fn directory_counts_dot_and_dotdot() {
        let dir = Inode::directory(None, 0o755);
        assert!(dir.is_dir());
        assert_eq!(dir.nlink, 2);
        assert_eq!(dir.type_and_mode & MODE_MASK, 0o755);
    }

    #[test]
    fn directory_inherits_setgid_group() {
        let mut parent = Inode::directory(None, 0o775);
        parent.type_and_mode |= MODE_SGID;
        parent.gid = 1234;
        let child = Inode::directory(Some(&parent), 0o755);
        assert_eq!(child.gid, 1234);
        assert_ne!(child.type_and_mode & MODE_SGID, 0);

        let plain_parent = Inode::directory(None, 0o755);
        let plain_child = Inode::directory(Some(&plain_parent), 0o755);
        assert_eq!(plain_child.type_and_mode & MODE_SGID, 0);
    }

    #[test]
    fn symlink_keeps_target_block_and_length() {
        let inode = Inode::symlink(4, 99);
        assert!(inode.is_symlink());
        assert_eq!(inode.size, 4);
        assert_eq!(inode.slot_trees[0], 99);
    }

    #[test]
    fn node_carries_rdev() {
        let inode = Inode::node(TYPE_BLK | 0o660, 0x0801);
        assert_eq!(inode.file_type(), TYPE_BLK);
        assert_eq!(inode.rdev, 0x0801);
    }
}

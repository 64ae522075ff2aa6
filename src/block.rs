use crate::INVALID_INDEX;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

pub const BLOCK_SIZE: usize = 4096;

/// Number of child indices an indirection block holds.
pub const INDICES_PER_BLOCK: usize = BLOCK_SIZE / size_of::<u64>();

/// A 4096-byte payload, interpreted as raw file data, as 512 child indices
/// of an indirection level, or as a symlink target string. The index view is
/// the typed field; the byte views come from the zerocopy derives.
#[derive(Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Block {
    pub indices: [u64; INDICES_PER_BLOCK],
}

impl Block {
    pub fn zeroed() -> Self {
        Self::new_zeroed()
    }

    /// All entries set to `INVALID_INDEX`: an indirection block with no
    /// children.
    pub fn invalid_indices() -> Self {
        Self {
            indices: [INVALID_INDEX; INDICES_PER_BLOCK],
        }
    }

    /// Block holding a symlink target (unterminated; the length lives in the
    /// inode).
    pub fn target(target: &[u8]) -> Self {
        let mut block = Self::zeroed();
        block.as_mut_bytes()[..target.len()].copy_from_slice(target);
        block
    }

    pub fn target_bytes(&self, len: usize) -> &[u8] {
        &self.as_bytes()[..len.min(BLOCK_SIZE)]
    }

    /// True when every child entry is `INVALID_INDEX`.
    pub fn all_indices_invalid(&self) -> bool {
        self.indices.iter().all(|&i| i == INVALID_INDEX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn layout_is_one_block() {
        assert_eq!(size_of::<Block>(), BLOCK_SIZE);
        assert_eq!(INDICES_PER_BLOCK, 512);
    }

    #[test]
    fn index_and_byte_views_alias() {
        let mut block = Block::zeroed();
        block.indices[0] = 0x0102030405060708;
        block.indices[511] = 77;
        let bytes = block.as_bytes();
        assert_eq!(
            u64::from_ne_bytes(bytes[..8].try_into().unwrap()),
            0x0102030405060708
        );
        assert_eq!(
            u64::from_ne_bytes(bytes[BLOCK_SIZE - 8..].try_into().unwrap()),
            77
        );
    }

    #[test]
    fn invalid_indices_block_is_empty() {
        let mut block = Block::invalid_indices();
        assert!(block.all_indices_invalid());
        block.indices[3] = 9;
        assert!(!block.all_indices_invalid());
    }

    #[test]
    fn target_round_trip() {
        let block = Block::target(b"/a/x");
        assert_eq!(block.target_bytes(4), b"/a/x");
        assert_eq!(block.target_bytes(5), b"/a/x\0");
    }
}

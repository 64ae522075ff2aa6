use crate::INVALID_INDEX;
use crate::base::Base;
use crate::block::{BLOCK_SIZE, Block, INDICES_PER_BLOCK};
use crate::dirent::{Dirent, MAX_NAME_LEN};
use crate::emergency::{self, EmergencyKind};
use crate::error::{FsError, FsResult};
use crate::inode::{Inode, MODE_SGID, MODE_SUID, TYPE_MASK};
use crate::time::UnixTime;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::error;
use zerocopy::IntoBytes;

/// Indirection fan-out per level.
const N: u64 = INDICES_PER_BLOCK as u64;

/// Largest logical slot array an inode can address through its five trees.
pub const MAX_SLOT_COUNT: u64 = 1 + N + N * N + N * N * N + N * N * N * N;

/// Depth of the deepest tree; also the size of the per-level block cache.
const MAX_TREE_DEPTH: usize = 4;

/// Result of a name lookup in a directory: the match, or the slot where the
/// name would have to be inserted to keep the slots sorted.
pub(crate) enum DirentSearch {
    Found {
        slot: u64,
        dirent_index: u64,
        dirent: Dirent,
    },
    Missing {
        insert_slot: u64,
    },
}

fn slot_count_for(inode: &Inode) -> u64 {
    if inode.is_regular() {
        inode.size.div_ceil(BLOCK_SIZE as u64)
    } else if inode.is_dir() {
        inode.size
    } else {
        0
    }
}

/// Map a logical slot number to its tree (0..=4) and the per-level indices
/// inside that tree's indirection blocks.
fn slot_to_tree_indices(slot: u64) -> (usize, [u64; MAX_TREE_DEPTH]) {
    let mut ijkl = [INVALID_INDEX; MAX_TREE_DEPTH];
    if slot == 0 {
        return (0, ijkl);
    }
    let mut slot = slot - 1;
    if slot < N {
        ijkl[0] = slot;
        return (1, ijkl);
    }
    slot -= N;
    if slot < N * N {
        ijkl[0] = slot / N;
        ijkl[1] = slot % N;
        return (2, ijkl);
    }
    slot -= N * N;
    if slot < N * N * N {
        ijkl[0] = slot / (N * N);
        slot -= ijkl[0] * (N * N);
        ijkl[1] = slot / N;
        ijkl[2] = slot % N;
        return (3, ijkl);
    }
    slot -= N * N * N;
    ijkl[0] = slot / (N * N * N);
    slot -= ijkl[0] * (N * N * N);
    ijkl[1] = slot / (N * N);
    slot -= ijkl[1] * (N * N);
    ijkl[2] = slot / N;
    ijkl[3] = slot % N;
    (4, ijkl)
}

struct HandleState {
    inode: Inode,
    slot_count: u64,
    /// Set by a rw open with O_APPEND; writes then ignore their offset.
    append: bool,
    cached_indices: [u64; MAX_TREE_DEPTH],
    cached_blocks: Box<[Block; MAX_TREE_DEPTH]>,
}

/// The per-inode operational object. Holds the inode and the indirection
/// cache behind one reader-writer lock; every walk that can touch the cache
/// takes the lock exclusively. Lifetime is governed by the handle cache in
/// [`Base`], which also carries the deferred-removal flag across the last
/// release.
pub struct Handle {
    inode_index: u64,
    remove_once_unused: AtomicBool,
    state: RwLock<HandleState>,
}

impl Handle {
    pub(crate) fn new(inode_index: u64, inode: Inode) -> Self {
        Self {
            inode_index,
            remove_once_unused: AtomicBool::new(false),
            state: RwLock::new(HandleState {
                slot_count: slot_count_for(&inode),
                inode,
                append: false,
                cached_indices: [INVALID_INDEX; MAX_TREE_DEPTH],
                cached_blocks: Box::new([
                    Block::zeroed(),
                    Block::zeroed(),
                    Block::zeroed(),
                    Block::zeroed(),
                ]),
            }),
        }
    }

    pub fn inode_index(&self) -> u64 {
        self.inode_index
    }

    /// Snapshot of the cached inode.
    pub fn inode(&self) -> Inode {
        self.state.read().inode
    }

    pub(crate) fn remove_once_unused(&self) -> bool {
        self.remove_once_unused.load(Ordering::SeqCst)
    }

    pub fn get_attr(&self) -> (u64, Inode) {
        (self.inode_index, self.state.read().inode)
    }

    /// Mark the inode for removal. Callers always hold a cache reference,
    /// so the actual removal happens when the last reference goes away.
    pub(crate) fn remove(&self) {
        self.remove_once_unused.store(true, Ordering::SeqCst);
    }

    /// Drop the inode's storage now. Regular files free their data and
    /// indirection blocks (unless other hard links remain), symlinks free
    /// their target block, everything else is just the inode record.
    pub(crate) fn remove_now(&self, base: &Base) -> FsResult<()> {
        let mut state = self.state.write();
        if state.inode.is_regular() {
            if state.inode.nlink == 0 {
                error!("inode removal: nlink was already zero");
                emergency::raise(EmergencyKind::Bug);
                return Err(FsError::NotRecoverable);
            }
            state.inode.nlink -= 1;
            if state.inode.nlink == 0 {
                base.inode_remove(self.inode_index)?;
                // Walking the slots reuses the indirection cache: whenever
                // the cached index at a level changes, the block it pointed
                // at before is done with and gets freed, so large files are
                // released without rewriting any indirection block.
                let mut last_removed = [INVALID_INDEX; MAX_TREE_DEPTH];
                for slot in 0..state.slot_count {
                    let block_index = state.get_slot(base, slot)?;
                    if block_index != INVALID_INDEX {
                        base.block_remove(block_index)?;
                    }
                    for level in 0..MAX_TREE_DEPTH {
                        if state.cached_indices[level] != last_removed[level] {
                            if state.cached_indices[level] != INVALID_INDEX {
                                base.block_remove(state.cached_indices[level])?;
                            }
                            last_removed[level] = state.cached_indices[level];
                        }
                    }
                }
            } else {
                state.inode.ctime = UnixTime::now();
                base.inode_write(self.inode_index, &state.inode)?;
            }
        } else if state.inode.is_symlink() {
            base.inode_remove(self.inode_index)?;
            base.block_remove(state.inode.slot_trees[0])?;
        } else {
            base.inode_remove(self.inode_index)?;
        }
        Ok(())
    }

    /// Add one hard link. Regular files only; the dirent insertion is the
    /// caller's business.
    pub(crate) fn link(&self, base: &Base) -> FsResult<()> {
        let mut state = self.state.write();
        if !state.inode.is_regular() {
            return Err(FsError::InvalidArgument);
        }
        if state.inode.nlink == u64::MAX {
            return Err(FsError::TooManyLinks);
        }
        let old_ctime = state.inode.ctime;
        state.inode.nlink += 1;
        state.inode.ctime = UnixTime::now();
        if let Err(e) = base.inode_write(self.inode_index, &state.inode) {
            state.inode.nlink -= 1;
            state.inode.ctime = old_ctime;
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn open_dir(&self, base: &Base) -> FsResult<()> {
        let mut state = self.state.write();
        if !state.inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let old = state.inode;
        if state.update_atime() {
            if let Err(e) = base.inode_write(self.inode_index, &state.inode) {
                state.inode = old;
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) fn find_dirent(&self, base: &Base, name: &[u8]) -> FsResult<DirentSearch> {
        self.state.write().find_dirent_now(base, name)
    }

    pub(crate) fn read_dirent(&self, base: &Base, dirent_slot: u64) -> FsResult<Dirent> {
        let mut state = self.state.write();
        if dirent_slot >= state.slot_count {
            return Err(FsError::InvalidArgument);
        }
        let dirent_index = state.get_slot(base, dirent_slot)?;
        base.dirent_read(dirent_index)
    }

    pub(crate) fn read_dirent_plus(
        &self,
        base: &Base,
        dirent_slot: u64,
    ) -> FsResult<(Dirent, Inode)> {
        let mut state = self.state.write();
        if dirent_slot >= state.slot_count {
            return Err(FsError::InvalidArgument);
        }
        let dirent_index = state.get_slot(base, dirent_slot)?;
        let dirent = base.dirent_read(dirent_index)?;
        let inode = base.inode_read(dirent.inode_index)?;
        Ok((dirent, inode))
    }

    /// Create a dirent for `name` in this directory, allocating a fresh
    /// inode through `creator` unless `existing` carries a hard-link target.
    /// `creator` sees the parent inode so group inheritance can work.
    pub(crate) fn mkdirent(
        &self,
        base: &Base,
        name: &[u8],
        existing: Option<u64>,
        creator: impl FnOnce(&Inode) -> Inode,
    ) -> FsResult<()> {
        let mut state = self.state.write();
        if !state.inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if name.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(FsError::NameTooLong);
        }
        if state.inode.nlink == u64::MAX {
            return Err(FsError::TooManyLinks);
        }
        if state.slot_count == MAX_SLOT_COUNT {
            return Err(FsError::NoSpace);
        }

        let insert_slot = match state.find_dirent_now(base, name)? {
            DirentSearch::Found { .. } => return Err(FsError::AlreadyExists),
            DirentSearch::Missing { insert_slot } => insert_slot,
        };

        let inode_index = match existing {
            Some(index) => index,
            None => base.inode_add(&creator(&state.inode))?,
        };

        let dirent = Dirent::new(name, inode_index);
        let dirent_index = base.dirent_add(&dirent)?;
        state.insert_slot(base, insert_slot, dirent_index)?;

        state.inode.size += 1;
        let now = UnixTime::now();
        state.inode.mtime = now;
        state.inode.ctime = now;
        state.inode.nlink += 1;
        base.inode_write(self.inode_index, &state.inode)
    }

    /// Remove the dirent for `name`. `checker` vets the target inode (this
    /// is where rmdir rejects non-empty directories and unlink rejects
    /// directories); the target's storage goes away once its last handle
    /// reference drops.
    pub(crate) fn rmdirent(
        &self,
        base: &Base,
        name: &[u8],
        checker: impl FnOnce(&Inode) -> FsResult<()>,
    ) -> FsResult<()> {
        let mut state = self.state.write();
        if !state.inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(FsError::NameTooLong);
        }
        if state.inode.nlink == 2 {
            // only "." and ".." left, so no entry can match
            return Err(FsError::NotFound);
        }

        let (slot, dirent) = match state.find_dirent_now(base, name)? {
            DirentSearch::Found { slot, dirent, .. } => (slot, dirent),
            DirentSearch::Missing { .. } => return Err(FsError::NotFound),
        };

        let target = base.handle_get(dirent.inode_index)?;
        let result: FsResult<()> = (|| {
            checker(&target.inode())?;
            state.remove_slot(base, slot, true)?;
            target.remove();
            Ok(())
        })();
        let release = base.handle_release(target);
        result?;
        release?;

        state.inode.size -= 1;
        let now = UnixTime::now();
        state.inode.mtime = now;
        state.inode.ctime = now;
        state.inode.nlink -= 1;
        base.inode_write(self.inode_index, &state.inode)
    }

    pub(crate) fn readlink(&self, base: &Base) -> FsResult<Vec<u8>> {
        let mut state = self.state.write();
        if !state.inode.is_symlink() {
            return Err(FsError::InvalidArgument);
        }
        let block = base.block_read(state.inode.slot_trees[0])?;
        let target = block.target_bytes(state.inode.size as usize).to_vec();
        let old = state.inode;
        if state.update_atime() {
            if let Err(e) = base.inode_write(self.inode_index, &state.inode) {
                state.inode = old;
                return Err(e);
            }
        }
        Ok(target)
    }

    pub(crate) fn chmod(&self, base: &Base, mode: u32) -> FsResult<()> {
        let mut state = self.state.write();
        let old = state.inode;
        state.inode.type_and_mode = (state.inode.type_and_mode & TYPE_MASK) | (mode & !TYPE_MASK);
        state.inode.ctime = UnixTime::now();
        if let Err(e) = base.inode_write(self.inode_index, &state.inode) {
            state.inode = old;
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn chown(&self, base: &Base, uid: u32, gid: u32) -> FsResult<()> {
        let mut state = self.state.write();
        let old = state.inode;
        state.inode.uid = uid;
        state.inode.gid = gid;
        state.inode.type_and_mode &= !(MODE_SUID | MODE_SGID);
        state.inode.ctime = UnixTime::now();
        if let Err(e) = base.inode_write(self.inode_index, &state.inode) {
            state.inode = old;
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn utimens(
        &self,
        base: &Base,
        atime: Option<UnixTime>,
        mtime: Option<UnixTime>,
        ctime: Option<UnixTime>,
    ) -> FsResult<()> {
        if atime.is_none() && mtime.is_none() && ctime.is_none() {
            return Ok(());
        }
        let mut state = self.state.write();
        let old = state.inode;
        if let Some(atime) = atime {
            state.inode.atime = atime;
        }
        if let Some(mtime) = mtime {
            state.inode.mtime = mtime;
        }
        if let Some(ctime) = ctime {
            state.inode.ctime = ctime;
        }
        if let Err(e) = base.inode_write(self.inode_index, &state.inode) {
            state.inode = old;
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn truncate(&self, base: &Base, length: u64) -> FsResult<()> {
        let mut state = self.state.write();
        state.truncate_now(base, length)?;
        state.inode.type_and_mode &= !(MODE_SUID | MODE_SGID);
        let now = UnixTime::now();
        state.inode.mtime = now;
        state.inode.ctime = now;
        base.inode_write(self.inode_index, &state.inode)
    }

    pub(crate) fn open(
        &self,
        base: &Base,
        read_only: bool,
        trunc: bool,
        append: bool,
    ) -> FsResult<()> {
        let mut state = self.state.write();
        if !state.inode.is_regular() {
            return Err(FsError::InvalidArgument);
        }
        state.append = append;
        if trunc && state.inode.size != 0 {
            state.truncate_now(base, 0)?;
        }
        let updated = if read_only {
            state.update_atime()
        } else {
            let now = UnixTime::now();
            state.inode.mtime = now;
            state.inode.ctime = now;
            state.inode.type_and_mode &= !(MODE_SUID | MODE_SGID);
            true
        };
        if updated {
            base.inode_write(self.inode_index, &state.inode)?;
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes at `offset`, clipped at the file size.
    /// Slots without a block read as zeros. Returns the byte count.
    pub(crate) fn read(&self, base: &Base, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let mut state = self.state.write();
        let size = state.inode.size;
        let total = if offset >= size {
            0
        } else {
            buf.len().min((size - offset) as usize)
        };

        let mut offset = offset;
        let mut pos = 0usize;
        let mut block = Block::zeroed();
        while pos < total {
            let block_slot = offset / BLOCK_SIZE as u64;
            let block_offset = (offset % BLOCK_SIZE as u64) as usize;
            let len = (total - pos).min(BLOCK_SIZE - block_offset);
            let block_index = state.get_slot(base, block_slot)?;
            if block_index == INVALID_INDEX {
                block = Block::zeroed();
            } else {
                base.block_read_into(block_index, &mut block)?;
            }
            buf[pos..pos + len].copy_from_slice(&block.as_bytes()[block_offset..block_offset + len]);
            offset += len as u64;
            pos += len;
        }

        if total > 0 {
            // best effort; a failed atime update must not fail the read
            let old = state.inode;
            if state.update_atime() && base.inode_write(self.inode_index, &state.inode).is_err() {
                state.inode = old;
            }
        }
        Ok(total)
    }

    /// Write `buf` at `offset` (or at the end in append mode), allocating
    /// blocks and growing the file as needed. Returns the byte count.
    pub(crate) fn write(&self, base: &Base, offset: u64, buf: &[u8]) -> FsResult<usize> {
        let mut state = self.state.write();
        let orig_inode = state.inode;

        let offset = if state.append {
            state.inode.size
        } else {
            offset
        };

        let result = state.write_blocks(base, offset, buf);
        if result.is_ok() && !buf.is_empty() {
            let now = UnixTime::now();
            state.inode.mtime = now;
            state.inode.ctime = now;
            state.inode.type_and_mode &= !(MODE_SUID | MODE_SGID);
        }
        if state.inode != orig_inode {
            let persisted = base.inode_write(self.inode_index, &state.inode);
            if result.is_ok() {
                persisted?;
            }
        }
        result?;
        Ok(buf.len())
    }

    pub(crate) fn rename_helper_add(
        &self,
        base: &Base,
        dirent_slot: u64,
        dirent_index: u64,
    ) -> FsResult<()> {
        let mut state = self.state.write();
        state.insert_slot(base, dirent_slot, dirent_index)?;
        state.inode.size += 1;
        base.inode_write(self.inode_index, &state.inode)
    }

    pub(crate) fn rename_helper_remove(&self, base: &Base, dirent_slot: u64) -> FsResult<()> {
        let mut state = self.state.write();
        state.remove_slot(base, dirent_slot, false)?;
        state.inode.size -= 1;
        base.inode_write(self.inode_index, &state.inode)
    }

    pub(crate) fn rename_helper_replace(
        &self,
        base: &Base,
        dirent_slot: u64,
        new_dirent_index: u64,
    ) -> FsResult<()> {
        let mut state = self.state.write();
        state.set_slot(base, dirent_slot, new_dirent_index)?;
        base.inode_write(self.inode_index, &state.inode)
    }
}

impl HandleState {
    /// Relatime: refresh atime only when it lags ctime or mtime, or is more
    /// than a day old; anything else would amplify every read into a write.
    fn update_atime(&mut self) -> bool {
        let now = UnixTime::now();
        let day_ago = UnixTime::new(now.seconds - 60 * 60 * 24, now.nanoseconds);
        if self.inode.atime.is_older_than(&self.inode.ctime)
            || self.inode.atime.is_older_than(&self.inode.mtime)
            || self.inode.atime.is_older_than(&day_ago)
        {
            self.inode.atime = now;
            true
        } else {
            false
        }
    }

    fn cache_block(&mut self, base: &Base, level: usize, block_index: u64) -> FsResult<()> {
        if self.cached_indices[level] != block_index {
            match base.block_read_into(block_index, &mut self.cached_blocks[level]) {
                Ok(()) => self.cached_indices[level] = block_index,
                Err(e) => {
                    self.cached_indices[level] = INVALID_INDEX;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Resolve slot -> block/dirent index, walking the tree. An INVALID
    /// intermediate means the slot logically holds nothing.
    fn get_slot(&mut self, base: &Base, slot: u64) -> FsResult<u64> {
        if slot >= self.slot_count {
            error!(slot, slot_count = self.slot_count, "slot lookup out of range");
            emergency::raise(EmergencyKind::Bug);
            return Err(FsError::NotRecoverable);
        }

        let (tree, ijkl) = slot_to_tree_indices(slot);
        if tree == 0 {
            return Ok(self.inode.slot_trees[0]);
        }

        let mut block_index = self.inode.slot_trees[tree];
        for level in 0..tree {
            if block_index == INVALID_INDEX {
                return Ok(INVALID_INDEX);
            }
            self.cache_block(base, level, block_index)?;
            let next = self.cached_blocks[level].indices[ijkl[level] as usize];
            if level == tree - 1 {
                return Ok(next);
            }
            block_index = next;
        }
        Ok(INVALID_INDEX)
    }

    /// Store a value into a slot, materializing missing indirection blocks
    /// on the way down. Setting a leaf to INVALID frees the leaf block when
    /// it empties, and the free cascades upward while ancestors empty too.
    fn set_slot(&mut self, base: &Base, slot: u64, index: u64) -> FsResult<()> {
        if slot >= self.slot_count {
            error!(slot, slot_count = self.slot_count, "slot store out of range");
            emergency::raise(EmergencyKind::Bug);
            return Err(FsError::NotRecoverable);
        }

        let (tree, ijkl) = slot_to_tree_indices(slot);
        if tree == 0 {
            self.inode.slot_trees[0] = index;
            return Ok(());
        }

        let mut block_index = self.inode.slot_trees[tree];
        for level in 0..tree {
            if block_index == INVALID_INDEX {
                self.cached_blocks[level] = Block::invalid_indices();
                block_index = match base.block_add(&self.cached_blocks[level]) {
                    Ok(new_index) => new_index,
                    Err(e) => {
                        self.cached_indices[level] = INVALID_INDEX;
                        return Err(e);
                    }
                };
                self.cached_indices[level] = block_index;
                if level > 0 {
                    self.cached_blocks[level - 1].indices[ijkl[level - 1] as usize] = block_index;
                    base.block_write(
                        self.cached_indices[level - 1],
                        &self.cached_blocks[level - 1],
                    )?;
                } else {
                    self.inode.slot_trees[tree] = block_index;
                }
            }
            self.cache_block(base, level, block_index)?;
            if level == tree - 1 {
                let leaf = ijkl[level] as usize;
                let old = self.cached_blocks[level].indices[leaf];
                self.cached_blocks[level].indices[leaf] = index;
                let mut all_invalid =
                    index == INVALID_INDEX && self.cached_blocks[level].all_indices_invalid();
                if all_invalid {
                    let mut up = level as isize;
                    while all_invalid && up >= 0 {
                        let l = up as usize;
                        base.block_remove(self.cached_indices[l])?;
                        self.cached_indices[l] = INVALID_INDEX;
                        if l > 0 {
                            self.cached_blocks[l - 1].indices[ijkl[l - 1] as usize] = INVALID_INDEX;
                            all_invalid = self.cached_blocks[l - 1].all_indices_invalid();
                            if !all_invalid {
                                base.block_write(
                                    self.cached_indices[l - 1],
                                    &self.cached_blocks[l - 1],
                                )?;
                            }
                        } else {
                            self.inode.slot_trees[tree] = INVALID_INDEX;
                        }
                        up -= 1;
                    }
                } else if let Err(e) =
                    base.block_write(self.cached_indices[level], &self.cached_blocks[level])
                {
                    self.cached_blocks[level].indices[leaf] = old;
                    return Err(e);
                }
                return Ok(());
            }
            block_index = self.cached_blocks[level].indices[ijkl[level] as usize];
        }
        Ok(())
    }

    /// Shift slots `slot..` one to the right and store `index` at `slot`.
    /// Only directories change their slot count this way.
    fn insert_slot(&mut self, base: &Base, slot: u64, index: u64) -> FsResult<()> {
        if slot > self.slot_count {
            error!(slot, slot_count = self.slot_count, "slot insert out of range");
            emergency::raise(EmergencyKind::Bug);
            return Err(FsError::NotRecoverable);
        }
        if self.slot_count == MAX_SLOT_COUNT {
            return Err(FsError::NoSpace);
        }

        self.slot_count += 1;
        let mut i = self.slot_count - 1;
        while i > slot {
            let shifted = self.get_slot(base, i - 1)?;
            self.set_slot(base, i, shifted)?;
            i -= 1;
        }
        self.set_slot(base, slot, index)
    }

    /// Shift slots `slot+1..` one to the left and drop the tail slot,
    /// optionally freeing the dirent or block the removed slot held.
    fn remove_slot(&mut self, base: &Base, slot: u64, free_target: bool) -> FsResult<()> {
        if slot >= self.slot_count {
            error!(slot, slot_count = self.slot_count, "slot removal out of range");
            emergency::raise(EmergencyKind::Bug);
            return Err(FsError::NotRecoverable);
        }

        let mut target = INVALID_INDEX;
        if free_target {
            target = self.get_slot(base, slot)?;
        }

        for i in slot..self.slot_count - 1 {
            let shifted = self.get_slot(base, i + 1)?;
            self.set_slot(base, i, shifted)?;
        }
        self.set_slot(base, self.slot_count - 1, INVALID_INDEX)?;

        if free_target && target != INVALID_INDEX {
            if self.inode.is_dir() {
                base.dirent_remove(target)?;
            } else if self.inode.is_regular() {
                base.block_remove(target)?;
            } else {
                return Err(FsError::InvalidArgument);
            }
        }

        self.slot_count -= 1;
        Ok(())
    }

    /// Binary search over the name-ordered dirent slots.
    fn find_dirent_now(&mut self, base: &Base, name: &[u8]) -> FsResult<DirentSearch> {
        let mut a: i64 = 0;
        let mut b: i64 = self.slot_count as i64 - 1;
        while b >= a {
            let c = (a + b) / 2;
            let dirent_index = self.get_slot(base, c as u64)?;
            let dirent = base.dirent_read(dirent_index)?;
            match name.cmp(dirent.name_bytes()) {
                std::cmp::Ordering::Greater => a = c + 1,
                std::cmp::Ordering::Less => b = c - 1,
                std::cmp::Ordering::Equal => {
                    return Ok(DirentSearch::Found {
                        slot: c as u64,
                        dirent_index,
                        dirent,
                    });
                }
            }
        }
        Ok(DirentSearch::Missing {
            insert_slot: a as u64,
        })
    }

    /// Grow or shrink the slot array to match `length`, zeroing the tail of
    /// the formerly-last block when the file grows out of it.
    fn truncate_now(&mut self, base: &Base, length: u64) -> FsResult<()> {
        if length == self.inode.size {
            return Ok(());
        }
        let orig_size = self.inode.size;
        let orig_block_count = self.slot_count;
        let new_block_count = length.div_ceil(BLOCK_SIZE as u64);
        if new_block_count > MAX_SLOT_COUNT {
            return Err(FsError::NoSpace);
        }
        while new_block_count < self.slot_count {
            self.remove_slot(base, self.slot_count - 1, true)?;
        }
        while new_block_count > self.slot_count {
            let at = self.slot_count;
            self.insert_slot(base, at, INVALID_INDEX)?;
        }
        if length > orig_size && orig_size % BLOCK_SIZE as u64 != 0 {
            let last_index = self.get_slot(base, orig_block_count - 1)?;
            if last_index != INVALID_INDEX {
                let mut block = Block::zeroed();
                base.block_read_into(last_index, &mut block)?;
                let valid = (orig_size % BLOCK_SIZE as u64) as usize;
                block.as_mut_bytes()[valid..].fill(0);
                base.block_write(last_index, &block)?;
            }
        }
        self.inode.size = length;
        Ok(())
    }

    fn write_blocks(&mut self, base: &Base, offset: u64, buf: &[u8]) -> FsResult<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(FsError::NoSpace)?;
        if end.div_ceil(BLOCK_SIZE as u64) > MAX_SLOT_COUNT {
            return Err(FsError::NoSpace);
        }
        if offset > self.inode.size {
            self.truncate_now(base, offset)?;
        }

        let mut offset = offset;
        let mut pos = 0usize;
        let mut block = Block::zeroed();
        while pos < buf.len() {
            let block_slot = offset / BLOCK_SIZE as u64;
            let block_offset = (offset % BLOCK_SIZE as u64) as usize;
            let len = (buf.len() - pos).min(BLOCK_SIZE - block_offset);

            if block_slot >= MAX_SLOT_COUNT {
                return Err(FsError::NoSpace);
            }
            if block_slot > self.slot_count {
                error!(
                    block_slot,
                    slot_count = self.slot_count,
                    "write reached a slot past the block count"
                );
                emergency::raise(EmergencyKind::Bug);
                return Err(FsError::NotRecoverable);
            }

            let whole_block = block_offset == 0 && len == BLOCK_SIZE;
            let mut block_index = INVALID_INDEX;
            if block_slot < self.slot_count {
                block_index = self.get_slot(base, block_slot)?;
            }
            if block_index == INVALID_INDEX {
                if !whole_block {
                    block = Block::zeroed();
                }
                block.as_mut_bytes()[block_offset..block_offset + len]
                    .copy_from_slice(&buf[pos..pos + len]);
                block_index = base.block_add(&block)?;
                if block_slot == self.slot_count {
                    self.insert_slot(base, block_slot, block_index)?;
                } else {
                    self.set_slot(base, block_slot, block_index)?;
                }
            } else {
                if !whole_block {
                    base.block_read_into(block_index, &mut block)?;
                }
                block.as_mut_bytes()[block_offset..block_offset + len]
                    .copy_from_slice(&buf[pos..pos + len]);
                base.block_write(block_index, &block)?;
            }

            if offset + len as u64 > self.inode.size {
                self.inode.size = offset + len as u64;
            }
            offset += len as u64;
            pos += len;
        }
        Ok(())
    }
}

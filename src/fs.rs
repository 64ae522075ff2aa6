use crate::INVALID_INDEX;
use crate::base::{Base, StatFs};
use crate::block::{BLOCK_SIZE, Block};
use crate::config::Config;
use crate::dirent::{Dirent, MAX_NAME_LEN};
use crate::emergency::{self, EmergencyKind};
use crate::error::{FsError, FsResult};
use crate::handle::{DirentSearch, Handle};
use crate::inode::Inode;
use crate::time::UnixTime;
use std::sync::Arc;
use tracing::{debug, error};

/// Rename semantics selector, mirroring renameat2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenameMode {
    Normal,
    NoReplace,
    Exchange,
}

/// Split an absolute path into its parent path and trailing name.
fn separate(path: &str) -> (&str, &str) {
    if path.is_empty() {
        return ("/", "");
    }
    let bytes = path.as_bytes();
    let mut parent_len = bytes.len().saturating_sub(1);
    while parent_len > 0 {
        if bytes[parent_len] == b'/' {
            break;
        }
        parent_len -= 1;
    }
    if parent_len == 0 {
        parent_len = 1;
    }
    let name_offset = if parent_len == 1 { 1 } else { parent_len + 1 };
    (&path[..parent_len], &path[name_offset..])
}

/// The filesystem: translates absolute paths into inode operations and
/// enforces the structure-lock discipline around the compound ones.
pub struct SixFs {
    config: Config,
    base: Option<Base>,
}

impl SixFs {
    pub fn new(config: Config) -> Self {
        Self { config, base: None }
    }

    pub fn mount(&mut self) -> FsResult<()> {
        let (base, needs_root) = Base::open(&self.config)?;
        if needs_root {
            base.create_root_node()?;
        }
        self.base = Some(base);
        debug!(dir = %self.config.dir.display(), "mounted");
        Ok(())
    }

    pub fn unmount(&mut self) -> FsResult<()> {
        match self.base.take() {
            Some(base) => {
                let result = base.cleanup();
                debug!(dir = %self.config.dir.display(), ok = result.is_ok(), "unmounted");
                result
            }
            None => Ok(()),
        }
    }

    fn base(&self) -> FsResult<&Base> {
        self.base.as_ref().ok_or(FsError::InvalidArgument)
    }

    /// Resolve an absolute path to an inode index. Runs on transient
    /// handles, so it never touches the handle cache.
    fn recursive_find(base: &Base, path: &str) -> FsResult<u64> {
        if path.len() == 1 {
            return Ok(0); // root directory inode
        }
        let (parent_path, name) = separate(path);
        if name.len() > MAX_NAME_LEN {
            return Err(FsError::NameTooLong);
        }
        let parent_index = Self::recursive_find(base, parent_path)?;
        let parent_inode = base.inode_read(parent_index)?;
        if !parent_inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let parent = Handle::new(parent_index, parent_inode);
        match parent.find_dirent(base, name.as_bytes())? {
            DirentSearch::Found { dirent, .. } => Ok(dirent.inode_index),
            DirentSearch::Missing { .. } => Err(FsError::NotFound),
        }
    }

    fn find_inode(base: &Base, path: &str) -> FsResult<u64> {
        if !path.starts_with('/') {
            return Err(FsError::NotFound);
        }
        Self::recursive_find(base, path)
    }

    fn get_handle(base: &Base, path: &str) -> FsResult<Arc<Handle>> {
        let inode_index = Self::find_inode(base, path)?;
        base.handle_get(inode_index)
    }

    /// Run `f` on the given handle, or on one resolved from `path` and
    /// released afterwards.
    fn with_handle<T>(
        base: &Base,
        handle: Option<&Arc<Handle>>,
        path: &str,
        f: impl FnOnce(&Handle) -> FsResult<T>,
    ) -> FsResult<T> {
        match handle {
            Some(h) => f(h),
            None => {
                let h = Self::get_handle(base, path)?;
                let result = f(&h);
                let release = base.handle_release(h);
                let value = result?;
                release?;
                Ok(value)
            }
        }
    }

    fn mkdirent_at(
        base: &Base,
        path: &str,
        existing: Option<u64>,
        creator: impl FnOnce(&Inode) -> Inode,
    ) -> FsResult<()> {
        let (parent_path, name) = separate(path);
        let parent = Self::get_handle(base, parent_path)?;
        let result = parent.mkdirent(base, name.as_bytes(), existing, creator);
        let release = base.handle_release(parent);
        result?;
        release
    }

    fn rmdirent_at(
        base: &Base,
        path: &str,
        checker: impl FnOnce(&Inode) -> FsResult<()>,
    ) -> FsResult<()> {
        let (parent_path, name) = separate(path);
        let parent = Self::get_handle(base, parent_path)?;
        let result = parent.rmdirent(base, name.as_bytes(), checker);
        let release = base.handle_release(parent);
        result?;
        release
    }

    pub fn statfs(&self) -> FsResult<StatFs> {
        let result = self.base()?.statfs();
        debug!(ok = result.is_ok(), "statfs");
        result
    }

    /// Flush pending allocation-bitmap state to the containers.
    pub fn sync(&self) -> FsResult<()> {
        let result = self.base()?.sync();
        debug!(ok = result.is_ok(), "sync");
        result
    }

    pub fn get_attr(&self, handle: Option<&Arc<Handle>>, path: &str) -> FsResult<(u64, Inode)> {
        if let Some(h) = handle {
            return Ok(h.get_attr());
        }
        let base = self.base()?;
        let _guard = base.structure_read();
        let result = Self::with_handle(base, None, path, |h| Ok(h.get_attr()));
        debug!(path, ok = result.is_ok(), "get_attr");
        result
    }

    pub fn open_dir(&self, path: &str) -> FsResult<Arc<Handle>> {
        let base = self.base()?;
        let _guard = base.structure_read();
        let handle = Self::get_handle(base, path)?;
        if let Err(e) = handle.open_dir(base) {
            if let Err(e2) = base.handle_release(handle) {
                error!(error = %e2, "open_dir: unhandled error after failure");
            }
            debug!(path, ok = false, "open_dir");
            return Err(e);
        }
        debug!(path, ok = true, "open_dir");
        Ok(handle)
    }

    pub fn close_dir(&self, handle: Arc<Handle>) -> FsResult<()> {
        let base = self.base()?;
        // the directory might be deleted on close
        let _guard = base.structure_write();
        let result = base.handle_release(handle);
        debug!(ok = result.is_ok(), "close_dir");
        result
    }

    pub fn read_dirent(&self, handle: &Arc<Handle>, dirent_slot: u64) -> FsResult<Dirent> {
        let base = self.base()?;
        let _guard = base.structure_read();
        handle.read_dirent(base, dirent_slot)
    }

    pub fn read_dirent_plus(
        &self,
        handle: &Arc<Handle>,
        dirent_slot: u64,
    ) -> FsResult<(Dirent, Inode)> {
        let base = self.base()?;
        let _guard = base.structure_read();
        handle.read_dirent_plus(base, dirent_slot)
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        let base = self.base()?;
        let _guard = base.structure_write();
        let result = Self::mkdirent_at(base, path, None, |parent| {
            Inode::directory(Some(parent), mode)
        });
        debug!(path, ok = result.is_ok(), "mkdir");
        result
    }

    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        let base = self.base()?;
        let _guard = base.structure_write();
        let result = Self::rmdirent_at(base, path, |inode| {
            if !inode.is_dir() {
                return Err(FsError::NotADirectory);
            }
            if inode.size > 0 {
                return Err(FsError::NotEmpty);
            }
            Ok(())
        });
        debug!(path, ok = result.is_ok(), "rmdir");
        result
    }

    pub fn mknod(&self, path: &str, type_and_mode: u32, rdev: u64) -> FsResult<()> {
        let base = self.base()?;
        let _guard = base.structure_write();
        let result = Self::mkdirent_at(base, path, None, |_| Inode::node(type_and_mode, rdev));
        debug!(path, ok = result.is_ok(), "mknod");
        result
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let base = self.base()?;
        let _guard = base.structure_write();
        let result = Self::rmdirent_at(base, path, |inode| {
            if inode.is_dir() {
                return Err(FsError::IsADirectory);
            }
            Ok(())
        });
        debug!(path, ok = result.is_ok(), "unlink");
        result
    }

    pub fn symlink(&self, target: &str, linkpath: &str) -> FsResult<()> {
        let base = self.base()?;
        let _guard = base.structure_write();

        let target_bytes = target.as_bytes();
        let result = if target_bytes.len() > BLOCK_SIZE {
            Err(FsError::NameTooLong)
        } else {
            let block = Block::target(target_bytes);
            match base.block_add(&block) {
                Ok(block_index) => {
                    let made = Self::mkdirent_at(base, linkpath, None, |_| {
                        Inode::symlink(target_bytes.len() as u64, block_index)
                    });
                    if made.is_err() {
                        if let Err(e) = base.block_remove(block_index) {
                            error!(error = %e, "symlink: cannot recover from failure; a dead block remains");
                        }
                    }
                    made
                }
                Err(e) => Err(e),
            }
        };
        debug!(target, linkpath, ok = result.is_ok(), "symlink");
        result
    }

    pub fn readlink(&self, path: &str) -> FsResult<Vec<u8>> {
        let base = self.base()?;
        let _guard = base.structure_read();
        let result = Self::with_handle(base, None, path, |h| h.readlink(base));
        debug!(path, ok = result.is_ok(), "readlink");
        result
    }

    pub fn link(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        let base = self.base()?;
        let _guard = base.structure_write();

        let result = match Self::get_handle(base, old_path) {
            Ok(handle) => {
                let linked = (|| {
                    handle.link(base)?;
                    let made =
                        Self::mkdirent_at(base, new_path, Some(handle.inode_index()), |_| {
                            Inode::empty()
                        });
                    if made.is_err() {
                        // undo the nlink bump once the handle goes unused
                        handle.remove();
                    }
                    made
                })();
                let release = base.handle_release(handle);
                match linked {
                    Ok(()) => release,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };
        debug!(old_path, new_path, ok = result.is_ok(), "link");
        result
    }

    pub fn rename(&self, old_path: &str, new_path: &str, mode: RenameMode) -> FsResult<()> {
        let base = self.base()?;
        let _guard = base.structure_write();
        let result = Self::rename_locked(base, old_path, new_path, mode);
        debug!(old_path, new_path, ?mode, ok = result.is_ok(), "rename");
        result
    }

    fn rename_locked(
        base: &Base,
        old_path: &str,
        new_path: &str,
        mode: RenameMode,
    ) -> FsResult<()> {
        let (old_parent_path, old_name) = separate(old_path);
        let (new_parent_path, new_name) = separate(new_path);
        if old_name.len() > MAX_NAME_LEN || new_name.len() > MAX_NAME_LEN {
            return Err(FsError::NameTooLong);
        }

        let old_parent = Self::get_handle(base, old_parent_path)?;
        let result = (|| {
            if !old_parent.inode().is_dir() {
                return Err(FsError::NotADirectory);
            }
            let new_parent_index = Self::find_inode(base, new_parent_path)?;
            let new_parent = base.handle_get(new_parent_index)?;
            let inner = Self::rename_with_parents(
                base,
                &old_parent,
                &new_parent,
                old_name,
                new_name,
                mode,
            );
            let release = base.handle_release(new_parent);
            inner?;
            release
        })();
        let release = base.handle_release(old_parent);
        result?;
        release
    }

    fn rename_with_parents(
        base: &Base,
        old_parent: &Arc<Handle>,
        new_parent: &Arc<Handle>,
        old_name: &str,
        new_name: &str,
        mode: RenameMode,
    ) -> FsResult<()> {
        if !new_parent.inode().is_dir() {
            return Err(FsError::NotADirectory);
        }

        let (mut old_slot, old_dirent_index, mut old_dirent) =
            match old_parent.find_dirent(base, old_name.as_bytes())? {
                DirentSearch::Found {
                    slot,
                    dirent_index,
                    dirent,
                } => (slot, dirent_index, dirent),
                DirentSearch::Missing { .. } => return Err(FsError::NotFound),
            };

        let (new_slot, new_dirent_index, new_dirent) =
            match new_parent.find_dirent(base, new_name.as_bytes())? {
                DirentSearch::Found {
                    slot,
                    dirent_index,
                    dirent,
                } => (slot, dirent_index, Some(dirent)),
                DirentSearch::Missing { insert_slot } => (insert_slot, INVALID_INDEX, None),
            };

        if new_dirent.is_some() && mode == RenameMode::NoReplace {
            return Err(FsError::AlreadyExists);
        }
        if new_dirent.is_none() && mode == RenameMode::Exchange {
            return Err(FsError::NotFound);
        }

        // both names already refer to the same inode: success without change
        if let Some(displaced) = &new_dirent {
            if displaced.inode_index == old_dirent.inode_index {
                return Ok(());
            }
        }

        let old_inode = base.inode_read(old_dirent.inode_index)?;
        if let Some(displaced) = &new_dirent {
            let new_inode = base.inode_read(displaced.inode_index)?;
            if old_inode.is_dir() && !new_inode.is_dir() {
                return Err(FsError::NotADirectory);
            }
            if old_inode.is_dir() && new_inode.is_dir() && new_inode.size > 0 {
                return Err(FsError::NotEmpty);
            }
            if !old_inode.is_dir() && new_inode.is_dir() {
                return Err(FsError::IsADirectory);
            }
        }

        if mode == RenameMode::Exchange {
            // Swap the targets inside the two records; names and slots stay
            // where they are, so the sort order is untouched.
            let Some(mut swapped_new) = new_dirent else {
                return Err(FsError::NotFound);
            };
            let old_target = old_dirent.inode_index;
            old_dirent.inode_index = swapped_new.inode_index;
            swapped_new.inode_index = old_target;
            base.dirent_write(old_dirent_index, &old_dirent)?;
            if let Err(e) = base.dirent_write(new_dirent_index, &swapped_new) {
                old_dirent.inode_index = old_target;
                if let Err(e2) = base.dirent_write(old_dirent_index, &old_dirent) {
                    error!(error = %e2, "rename: cannot recover from failed exchange");
                    emergency::raise(EmergencyKind::SystemFailure);
                    return Err(FsError::NotRecoverable);
                }
                return Err(e);
            }
            return Ok(());
        }

        let displaced_inode = new_dirent.as_ref().map(|d| d.inode_index);
        old_dirent.set_name(new_name.as_bytes());
        base.dirent_write(old_dirent_index, &old_dirent)?;

        let mut undo = false;
        let mut result = if new_dirent.is_some() {
            let replaced = new_parent.rename_helper_replace(base, new_slot, old_dirent_index);
            match replaced {
                Ok(()) => {
                    if let Err(e) = base.dirent_remove(new_dirent_index) {
                        error!(error = %e, "rename: cannot remove displaced directory entry; it remains");
                    }
                    if let Some(inode_index) = displaced_inode {
                        match base.handle_get(inode_index) {
                            Ok(handle) => {
                                handle.remove();
                                if let Err(e) = base.handle_release(handle) {
                                    error!(error = %e, "rename: removing displaced inode might have failed");
                                }
                            }
                            Err(e) => {
                                error!(error = %e, "rename: cannot get handle for displaced inode; it remains");
                            }
                        }
                    }
                    Ok(())
                }
                Err(e) => {
                    undo = true;
                    Err(e)
                }
            }
        } else {
            match new_parent.rename_helper_add(base, new_slot, old_dirent_index) {
                Ok(()) => {
                    if old_parent.inode_index() == new_parent.inode_index()
                        && old_slot >= new_slot
                    {
                        // the insertion shifted our entry within the shared parent
                        old_slot += 1;
                    }
                    Ok(())
                }
                Err(e) => {
                    undo = true;
                    Err(e)
                }
            }
        };

        if result.is_ok() {
            result = old_parent.rename_helper_remove(base, old_slot);
            if result.is_err() {
                undo = true;
            }
        }

        if undo {
            old_dirent.set_name(old_name.as_bytes());
            if let Err(e) = base.dirent_write(old_dirent_index, &old_dirent) {
                error!(error = %e, "rename: cannot recover from failure");
                emergency::raise(EmergencyKind::SystemFailure);
                return Err(FsError::NotRecoverable);
            }
        }
        result
    }

    pub fn chmod(&self, handle: Option<&Arc<Handle>>, path: &str, mode: u32) -> FsResult<()> {
        let base = self.base()?;
        let _guard = base.structure_read();
        let result = Self::with_handle(base, handle, path, |h| h.chmod(base, mode));
        debug!(path, mode, ok = result.is_ok(), "chmod");
        result
    }

    pub fn chown(
        &self,
        handle: Option<&Arc<Handle>>,
        path: &str,
        uid: u32,
        gid: u32,
    ) -> FsResult<()> {
        let base = self.base()?;
        let _guard = base.structure_read();
        let result = Self::with_handle(base, handle, path, |h| h.chown(base, uid, gid));
        debug!(path, uid, gid, ok = result.is_ok(), "chown");
        result
    }

    pub fn utimens(
        &self,
        handle: Option<&Arc<Handle>>,
        path: &str,
        atime: Option<UnixTime>,
        mtime: Option<UnixTime>,
        ctime: Option<UnixTime>,
    ) -> FsResult<()> {
        let base = self.base()?;
        let _guard = base.structure_read();
        let result = Self::with_handle(base, handle, path, |h| h.utimens(base, atime, mtime, ctime));
        debug!(path, ok = result.is_ok(), "utimens");
        result
    }

    pub fn truncate(&self, handle: Option<&Arc<Handle>>, path: &str, length: u64) -> FsResult<()> {
        let base = self.base()?;
        let _guard = base.structure_read();
        let result = Self::with_handle(base, handle, path, |h| {
            if !h.inode().is_regular() {
                return Err(FsError::InvalidArgument);
            }
            h.truncate(base, length)
        });
        debug!(path, length, ok = result.is_ok(), "truncate");
        result
    }

    pub fn open(
        &self,
        path: &str,
        read_only: bool,
        trunc: bool,
        append: bool,
    ) -> FsResult<Arc<Handle>> {
        let base = self.base()?;
        // the file may be created fresh or truncated
        let _guard = base.structure_write();
        let handle = Self::get_handle(base, path)?;
        if let Err(e) = handle.open(base, read_only, trunc, append) {
            if let Err(e2) = base.handle_release(handle) {
                error!(error = %e2, "open: unhandled error after failure");
            }
            debug!(path, ok = false, "open");
            return Err(e);
        }
        debug!(path, read_only, trunc, append, ok = true, "open");
        Ok(handle)
    }

    pub fn close(&self, handle: Arc<Handle>) -> FsResult<()> {
        let base = self.base()?;
        // the file might be unlinked-on-close
        let _guard = base.structure_write();
        let inode_index = handle.inode_index();
        let result = base.handle_release(handle);
        debug!(inode_index, ok = result.is_ok(), "close");
        result
    }

    pub fn read(&self, handle: &Arc<Handle>, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let base = self.base()?;
        let result = handle.read(base, offset, buf);
        debug!(
            inode_index = handle.inode_index(),
            offset,
            count = buf.len(),
            ok = result.is_ok(),
            "read"
        );
        result
    }

    pub fn write(&self, handle: &Arc<Handle>, offset: u64, buf: &[u8]) -> FsResult<usize> {
        let base = self.base()?;
        let result = handle.write(base, offset, buf);
        debug!(
            inode_index = handle.inode_index(),
            offset,
            count = buf.len(),
            ok = result.is_ok(),
            "write"
        );
        result
    }
}

impl Drop for SixFs {
    fn drop(&mut self) {
        if let Some(base) = self.base.take() {
            let _ = base.cleanup();
        }
    }
}

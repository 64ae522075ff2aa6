use crate::bitmap::{BIT_CHUNK_SIZE, Bitmap};
use crate::block::{BLOCK_SIZE, Block};
use crate::chunk::ChunkManager;
use crate::config::{BackendKind, Config};
use crate::crypt::{ENC_BLOCK_SIZE, ENC_DIRENT_SIZE, ENC_INODE_SIZE, Sealer};
use crate::dirent::{DIRENT_SIZE, Dirent, MAX_NAME_LEN};
use crate::emergency;
use crate::error::{FsError, FsResult};
use crate::handle::Handle;
use crate::inode::{Inode, INODE_SIZE, MODE_RWXU};
use crate::storage::{Chunker, Storage};
use crate::storage_file::FileStorage;
use crate::storage_mem::MemStorage;
use crate::storage_mmap::MmapStorage;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use zerocopy::{FromZeros, IntoBytes};

const INODE_MAP_FILE: &str = "inodemap.6fs";
const INODE_DAT_FILE: &str = "inodedat.6fs";
const DIRENT_MAP_FILE: &str = "direnmap.6fs";
const DIRENT_DAT_FILE: &str = "direndat.6fs";
const BLOCK_MAP_FILE: &str = "blockmap.6fs";
const BLOCK_DAT_FILE: &str = "blockdat.6fs";

/// Derived filesystem-wide capacity figures for statfs.
#[derive(Clone, Copy, Debug)]
pub struct StatFs {
    pub block_size: u64,
    pub max_name_len: usize,
    pub max_block_count: u64,
    pub free_block_count: u64,
    pub max_inode_count: u64,
    pub free_inode_count: u64,
}

struct HandleSlot {
    handle: Arc<Handle>,
    refs: u64,
}

/// Owner of the three object spaces and everything that cuts across them:
/// capacity accounting, the structure lock, the handle cache, and the
/// encryption gateway every persistent record passes through.
pub struct Base {
    max_size: u64,
    sealer: Option<Sealer>,
    pub(crate) inodes: ChunkManager,
    pub(crate) dirents: ChunkManager,
    pub(crate) blocks: ChunkManager,
    structure: RwLock<()>,
    handles: Mutex<HashMap<u64, HandleSlot>>,
}

fn make_storage(backend: BackendKind, dir: &Path, file: &str) -> Box<dyn Storage> {
    match backend {
        BackendKind::Mmap => Box::new(MmapStorage::new(dir.join(file))),
        BackendKind::File => Box::new(FileStorage::new(dir.join(file))),
        BackendKind::Mem => Box::new(MemStorage::new()),
    }
}

impl Base {
    /// Open (creating as needed) the six containers and validate the inode
    /// format. Returns the base plus a flag telling the caller that the
    /// filesystem is fresh and still needs its root directory.
    pub fn open(config: &Config) -> FsResult<(Self, bool)> {
        let sealer = config.key.as_ref().map(Sealer::new);
        let (inode_size, dirent_size, block_size) = if sealer.is_some() {
            (ENC_INODE_SIZE, ENC_DIRENT_SIZE, ENC_BLOCK_SIZE)
        } else {
            (INODE_SIZE, DIRENT_SIZE, BLOCK_SIZE)
        };

        let backend = config.backend;
        let dir = config.dir.as_path();
        let inodes = ChunkManager::new(
            Bitmap::new(Chunker::new(
                make_storage(backend, dir, INODE_MAP_FILE),
                BIT_CHUNK_SIZE,
            )),
            Chunker::new(make_storage(backend, dir, INODE_DAT_FILE), inode_size),
            false,
        );
        let dirents = ChunkManager::new(
            Bitmap::new(Chunker::new(
                make_storage(backend, dir, DIRENT_MAP_FILE),
                BIT_CHUNK_SIZE,
            )),
            Chunker::new(make_storage(backend, dir, DIRENT_DAT_FILE), dirent_size),
            false,
        );
        let blocks = ChunkManager::new(
            Bitmap::new(Chunker::new(
                make_storage(backend, dir, BLOCK_MAP_FILE),
                BIT_CHUNK_SIZE,
            )),
            Chunker::new(make_storage(backend, dir, BLOCK_DAT_FILE), block_size),
            config.punch_holes,
        );

        inodes.open()?;
        dirents.open()?;
        blocks.open()?;
        inodes.initialize()?;
        dirents.initialize()?;
        blocks.initialize()?;

        let needs_root = inodes.chunks_in_storage() == 0;
        let base = Self {
            max_size: config.max_size,
            sealer,
            inodes,
            dirents,
            blocks,
            structure: RwLock::new(()),
            handles: Mutex::new(HashMap::new()),
        };

        if !needs_root {
            let root = base.inode_read(0)?;
            if root.type_and_mode >> 16 != 0 {
                error!("inodes are in v0 format");
                return Err(FsError::BadFileFormat);
            }
        }

        Ok((base, needs_root))
    }

    /// Give a fresh filesystem its root directory at inode index 0.
    pub fn create_root_node(&self) -> FsResult<()> {
        let root = Inode::directory(None, MODE_RWXU);
        let index = self.inode_add(&root)?;
        debug_assert_eq!(index, 0);
        Ok(())
    }

    /// Sync and close all six containers, logging their I/O statistics.
    /// The first error wins but never stops the remaining shutdowns.
    pub fn cleanup(&self) -> FsResult<()> {
        let mut result = Ok(());
        for (name, mgr) in [
            ("block", &self.blocks),
            ("dirent", &self.dirents),
            ("inode", &self.inodes),
        ] {
            let (r, data, map) = mgr.shutdown();
            info!(
                space = name,
                record_size = data.chunk_size,
                records_in = data.chunks_in,
                records_out = data.chunks_out,
                holes_punched = data.chunks_punched,
                map_chunks_in = map.chunks_in,
                map_chunks_out = map.chunks_out,
                "container statistics"
            );
            if result.is_ok() {
                result = r;
            }
        }
        result
    }

    pub(crate) fn storage_size_in_bytes(&self) -> u64 {
        self.inodes.storage_size_in_bytes()
            + self.dirents.storage_size_in_bytes()
            + self.blocks.storage_size_in_bytes()
    }

    /// Gate for every mutation: refuse when the emergency latch is set, and
    /// refuse allocations that would push the containers past the configured
    /// ceiling (reserving room for up to four new indirection blocks).
    pub(crate) fn check_write_action(&self, additional_bytes: u64) -> FsResult<()> {
        if emergency::current().is_some() {
            return Err(FsError::ReadOnlyFilesystem);
        }
        if self.max_size > 0 && additional_bytes > 0 {
            let reserved = additional_bytes + 4 * BLOCK_SIZE as u64;
            if self.storage_size_in_bytes() + reserved > self.max_size {
                return Err(FsError::NoSpace);
            }
        }
        Ok(())
    }

    fn add_record<const ENC: usize>(&self, mgr: &ChunkManager, record: &[u8]) -> FsResult<u64> {
        self.check_write_action(mgr.chunk_size() as u64)?;
        match &self.sealer {
            Some(sealer) => {
                let mut framed = [0u8; ENC];
                sealer.seal(record, &mut framed)?;
                mgr.add(&framed)
            }
            None => mgr.add(record),
        }
    }

    fn read_record<const ENC: usize>(
        &self,
        mgr: &ChunkManager,
        index: u64,
        record: &mut [u8],
    ) -> FsResult<()> {
        match &self.sealer {
            Some(sealer) => {
                let mut framed = [0u8; ENC];
                mgr.read(index, &mut framed)?;
                sealer.open(&framed, record)
            }
            None => mgr.read(index, record),
        }
    }

    fn write_record<const ENC: usize>(
        &self,
        mgr: &ChunkManager,
        index: u64,
        record: &[u8],
    ) -> FsResult<()> {
        self.check_write_action(0)?;
        match &self.sealer {
            Some(sealer) => {
                let mut framed = [0u8; ENC];
                sealer.seal(record, &mut framed)?;
                mgr.write(index, &framed)
            }
            None => mgr.write(index, record),
        }
    }

    fn remove_record(&self, mgr: &ChunkManager, index: u64) -> FsResult<()> {
        self.check_write_action(0)?;
        mgr.remove(index)
    }

    pub(crate) fn inode_add(&self, inode: &Inode) -> FsResult<u64> {
        self.add_record::<ENC_INODE_SIZE>(&self.inodes, inode.as_bytes())
    }

    pub(crate) fn inode_read(&self, index: u64) -> FsResult<Inode> {
        let mut inode = Inode::new_zeroed();
        self.read_record::<ENC_INODE_SIZE>(&self.inodes, index, inode.as_mut_bytes())?;
        Ok(inode)
    }

    pub(crate) fn inode_write(&self, index: u64, inode: &Inode) -> FsResult<()> {
        self.write_record::<ENC_INODE_SIZE>(&self.inodes, index, inode.as_bytes())
    }

    pub(crate) fn inode_remove(&self, index: u64) -> FsResult<()> {
        self.remove_record(&self.inodes, index)
    }

    pub(crate) fn dirent_add(&self, dirent: &Dirent) -> FsResult<u64> {
        self.add_record::<ENC_DIRENT_SIZE>(&self.dirents, dirent.as_bytes())
    }

    pub(crate) fn dirent_read(&self, index: u64) -> FsResult<Dirent> {
        let mut dirent = Dirent::new_zeroed();
        self.read_record::<ENC_DIRENT_SIZE>(&self.dirents, index, dirent.as_mut_bytes())?;
        Ok(dirent)
    }

    pub(crate) fn dirent_write(&self, index: u64, dirent: &Dirent) -> FsResult<()> {
        self.write_record::<ENC_DIRENT_SIZE>(&self.dirents, index, dirent.as_bytes())
    }

    pub(crate) fn dirent_remove(&self, index: u64) -> FsResult<()> {
        self.remove_record(&self.dirents, index)
    }

    pub(crate) fn block_add(&self, block: &Block) -> FsResult<u64> {
        self.add_record::<ENC_BLOCK_SIZE>(&self.blocks, block.as_bytes())
    }

    pub(crate) fn block_read_into(&self, index: u64, block: &mut Block) -> FsResult<()> {
        self.read_record::<ENC_BLOCK_SIZE>(&self.blocks, index, block.as_mut_bytes())
    }

    pub(crate) fn block_read(&self, index: u64) -> FsResult<Block> {
        let mut block = Block::zeroed();
        self.block_read_into(index, &mut block)?;
        Ok(block)
    }

    pub(crate) fn block_write(&self, index: u64, block: &Block) -> FsResult<()> {
        self.write_record::<ENC_BLOCK_SIZE>(&self.blocks, index, block.as_bytes())
    }

    pub(crate) fn block_remove(&self, index: u64) -> FsResult<()> {
        self.remove_record(&self.blocks, index)
    }

    pub(crate) fn structure_read(&self) -> RwLockReadGuard<'_, ()> {
        self.structure.read()
    }

    pub(crate) fn structure_write(&self) -> RwLockWriteGuard<'_, ()> {
        self.structure.write()
    }

    /// Fetch the cached handle for an inode, creating it from the stored
    /// record on first use. Every successful get must be paired with a
    /// `handle_release`.
    pub(crate) fn handle_get(&self, inode_index: u64) -> FsResult<Arc<Handle>> {
        let mut handles = self.handles.lock();
        if let Some(slot) = handles.get_mut(&inode_index) {
            slot.refs += 1;
            return Ok(slot.handle.clone());
        }
        let inode = self.inode_read(inode_index)?;
        let handle = Arc::new(Handle::new(inode_index, inode));
        handles.insert(
            inode_index,
            HandleSlot {
                handle: handle.clone(),
                refs: 1,
            },
        );
        Ok(handle)
    }

    /// Drop one reference. The last release evicts the handle and, when the
    /// inode was remove()-marked while open, performs the deferred removal.
    pub(crate) fn handle_release(&self, handle: Arc<Handle>) -> FsResult<()> {
        let mut handles = self.handles.lock();
        let index = handle.inode_index();
        let dead = match handles.get_mut(&index) {
            Some(slot) => {
                slot.refs -= 1;
                slot.refs == 0
            }
            None => false,
        };
        if dead {
            handles.remove(&index);
            if handle.remove_once_unused() {
                return handle.remove_now(self);
            }
        }
        Ok(())
    }

    /// Flush the resident bitmap chunk of every space.
    pub(crate) fn sync(&self) -> FsResult<()> {
        self.inodes.sync()?;
        self.dirents.sync()?;
        self.blocks.sync()
    }

    pub fn statfs(&self) -> FsResult<StatFs> {
        let medium = self.blocks.stat()?;
        let mut max_size = self.max_size;
        let mut available = max_size.saturating_sub(self.storage_size_in_bytes());
        if max_size == 0 {
            max_size = medium.max_bytes;
            available = medium.available_bytes;
        }
        Ok(StatFs {
            block_size: BLOCK_SIZE as u64,
            max_name_len: MAX_NAME_LEN,
            max_block_count: max_size / BLOCK_SIZE as u64,
            free_block_count: available / BLOCK_SIZE as u64,
            max_inode_count: max_size / (INODE_SIZE + DIRENT_SIZE) as u64,
            free_inode_count: available / (INODE_SIZE + DIRENT_SIZE) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::INVALID_INDEX;
    use crate::crypt::KEY_SIZE;

    fn mem_base() -> Base {
        let config = Config::new("/nonexistent").backend(BackendKind::Mem);
        let (base, needs_root) = Base::open(&config).unwrap();
        assert!(needs_root);
        base.create_root_node().unwrap();
        base
    }

    #[test]
    fn root_node_is_inode_zero() {
        let base = mem_base();
        let root = base.inode_read(0).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.nlink, 2);
        assert_eq!(root.size, 0);
    }

    #[test]
    fn inode_round_trip() {
        let base = mem_base();
        let mut inode = Inode::node(crate::inode::TYPE_REG | 0o644, 0);
        inode.size = 12345;
        let index = base.inode_add(&inode).unwrap();
        assert_eq!(base.inode_read(index).unwrap(), inode);

        inode.size = 54321;
        base.inode_write(index, &inode).unwrap();
        assert_eq!(base.inode_read(index).unwrap().size, 54321);

        base.inode_remove(index).unwrap();
        assert_eq!(base.inodes.chunks_in_storage(), index);
    }

    #[test]
    fn encrypted_records_round_trip() {
        let config = Config::new("/nonexistent")
            .backend(BackendKind::Mem)
            .key([7u8; KEY_SIZE]);
        let (base, needs_root) = Base::open(&config).unwrap();
        assert!(needs_root);
        base.create_root_node().unwrap();

        assert_eq!(base.inodes.chunk_size(), ENC_INODE_SIZE);
        assert_eq!(base.dirents.chunk_size(), ENC_DIRENT_SIZE);
        assert_eq!(base.blocks.chunk_size(), ENC_BLOCK_SIZE);

        let dirent = Dirent::new(b"secret", 17);
        let index = base.dirent_add(&dirent).unwrap();
        let back = base.dirent_read(index).unwrap();
        assert_eq!(back.name_bytes(), b"secret");
        assert_eq!(back.inode_index, 17);

        let mut block = Block::zeroed();
        block.indices[0] = 0xDEAD;
        let block_index = base.block_add(&block).unwrap();
        assert_eq!(base.block_read(block_index).unwrap().indices[0], 0xDEAD);
    }

    #[test]
    fn handle_cache_reuses_and_counts() {
        let base = mem_base();
        let a = base.handle_get(0).unwrap();
        let b = base.handle_get(0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        base.handle_release(b).unwrap();
        base.handle_release(a).unwrap();
        // cache is empty again; a fresh get reads the inode anew
        let c = base.handle_get(0).unwrap();
        assert_eq!(c.inode().nlink, 2);
        base.handle_release(c).unwrap();
    }

    #[test]
    fn max_size_is_enforced_with_reservation() {
        let config = Config::new("/nonexistent")
            .backend(BackendKind::Mem)
            .max_size(BLOCK_SIZE as u64 * 6);
        let (base, _) = Base::open(&config).unwrap();
        base.create_root_node().unwrap();

        // one block fits: current + block + 4-block reservation <= 6 blocks
        let first = base.block_add(&Block::zeroed());
        assert!(first.is_ok());
        let second = base.block_add(&Block::zeroed());
        assert!(matches!(second, Err(FsError::NoSpace)));
        // writes to existing chunks stay possible
        base.block_write(first.unwrap(), &Block::zeroed()).unwrap();
    }

    #[test]
    fn statfs_reports_configured_ceiling() {
        let config = Config::new("/nonexistent")
            .backend(BackendKind::Mem)
            .max_size(1 << 20);
        let (base, _) = Base::open(&config).unwrap();
        base.create_root_node().unwrap();
        let statfs = base.statfs().unwrap();
        assert_eq!(statfs.block_size, BLOCK_SIZE as u64);
        assert_eq!(statfs.max_name_len, MAX_NAME_LEN);
        assert_eq!(statfs.max_block_count, (1 << 20) / BLOCK_SIZE as u64);
        assert_eq!(
            statfs.max_inode_count,
            (1 << 20) / (INODE_SIZE + DIRENT_SIZE) as u64
        );
        assert!(statfs.free_block_count < statfs.max_block_count);
    }

    #[test]
    fn v0_format_is_rejected_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path()).backend(BackendKind::File);
        {
            let (base, needs_root) = Base::open(&config).unwrap();
            assert!(needs_root);
            let mut legacy = Inode::directory(None, MODE_RWXU);
            legacy.type_and_mode = 0x0004_0000; // type bits above bit 16
            let index = base.inode_add(&legacy).unwrap();
            assert_eq!(index, 0);
            base.cleanup().unwrap();
        }
        assert!(matches!(
            Base::open(&config),
            Err(FsError::BadFileFormat)
        ));
    }

    #[test]
    fn fresh_filesystem_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path()).backend(BackendKind::File);
        {
            let (base, needs_root) = Base::open(&config).unwrap();
            assert!(needs_root);
            base.create_root_node().unwrap();
            base.cleanup().unwrap();
        }
        let (base, needs_root) = Base::open(&config).unwrap();
        assert!(!needs_root);
        assert!(base.inode_read(0).unwrap().is_dir());
        base.cleanup().unwrap();
    }

    #[test]
    fn slot_trees_start_invalid() {
        let base = mem_base();
        let root = base.inode_read(0).unwrap();
        assert_eq!(root.slot_trees, [INVALID_INDEX; 5]);
    }
}

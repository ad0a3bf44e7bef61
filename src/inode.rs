//! Open files and the sector-granularity read/write path.
//!
//! Every file is described by a [`DiskInode`] occupying one whole sector; the sector's number
//! is the file's identity. An [`InodeTable`] makes sure that all openers of the same sector
//! share one in-memory [`Inode`], counts the openers, and reclaims the file's sectors when the
//! last opener of a removed file closes it.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};

use crate::{
    directory_lock::DirectoryLock,
    disk_format::{
        inode::DiskInode,
        sector::{bytes_to_sectors, Sector, SectorNumber, SECTOR_SIZE, ZERO_SECTOR},
    },
    free_map::SpaceAllocator,
    storage::SectorStore,
};

/// An open file.
#[derive(Debug)]
pub struct Inode {
    /// The sector holding the on-disk inode.
    sector: SectorNumber,
    /// The on-disk inode, read once when the inode is first opened. Files never grow, so this
    /// never goes stale.
    data: DiskInode,
    state: Mutex<InodeState>,
    directory_lock: DirectoryLock,
}

#[derive(Debug)]
struct InodeState {
    /// The number of live [`InodeHandle`]s.
    open_count: usize,
    /// Whether the file is deleted once the last handle is closed.
    removed: bool,
}

impl Inode {
    fn new(sector: SectorNumber, data: DiskInode) -> Self {
        Self {
            sector,
            data,
            state: Mutex::new(InodeState {
                open_count: 1,
                removed: false,
            }),
            directory_lock: DirectoryLock::new(),
        }
    }

    /// The inode number, which is the sector holding the on-disk inode.
    pub fn inumber(&self) -> SectorNumber {
        self.sector
    }

    /// The file length in bytes.
    pub fn length(&self) -> usize {
        self.data.length()
    }

    /// Returns the sector holding the byte at `offset`, or `None` past the end of the file.
    pub fn byte_to_sector(&self, offset: usize) -> Option<SectorNumber> {
        (offset < self.length()).then(|| self.data.start() + offset / SECTOR_SIZE)
    }

    pub fn open_count(&self) -> usize {
        self.state().open_count
    }

    /// Marks the file to be deleted when its last opener closes it. Until then the file stays
    /// fully usable.
    pub fn remove(&self) {
        self.state().removed = true;
        debug!("[inode @{}] marked for removal", self.sector);
    }

    pub fn is_removed(&self) -> bool {
        self.state().removed
    }

    /// Acquires the lock reserved for the directory layer.
    pub fn lock_directory(&self) {
        self.directory_lock.acquire();
    }

    pub fn unlock_directory(&self) {
        self.directory_lock.release();
    }

    pub fn init_directory_lock(&self) {
        self.directory_lock.init();
    }

    fn state(&self) -> MutexGuard<'_, InodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locates the sector and the number of bytes to transfer for the next step of a read or
    /// write of `remaining` bytes at `offset`.
    fn chunk_at(&self, offset: usize, remaining: usize) -> Option<Chunk> {
        let sector = self.byte_to_sector(offset)?;
        let sector_offset = offset % SECTOR_SIZE;

        let inode_left = self.length() - offset;
        let sector_left = SECTOR_SIZE - sector_offset;
        let min_left = inode_left.min(sector_left);

        let len = remaining.min(min_left);
        (len > 0).then_some(Chunk {
            sector,
            sector_offset,
            len,
            min_left,
        })
    }
}

/// One sector's share of a read or write.
struct Chunk {
    sector: SectorNumber,
    /// where the transfer starts within the sector
    sector_offset: usize,
    /// bytes to transfer
    len: usize,
    /// bytes of file data from `sector_offset` to the end of the sector or the file
    min_left: usize,
}

impl Chunk {
    fn is_whole_sector(&self) -> bool {
        self.sector_offset == 0 && self.len == SECTOR_SIZE
    }

    fn range(&self) -> std::ops::Range<usize> {
        self.sector_offset..self.sector_offset + self.len
    }
}

/// A counted reference to an open [`Inode`].
///
/// Handles are obtained from [`InodeTable::open`] or [`InodeHandle::reopen`] and must be given
/// back through [`InodeTable::close`].
#[derive(Debug)]
#[must_use = "open inodes must be closed"]
pub struct InodeHandle(Arc<Inode>);

impl InodeHandle {
    /// Hands out another reference to the same inode.
    pub fn reopen(&self) -> InodeHandle {
        self.0.state().open_count += 1;
        InodeHandle(Arc::clone(&self.0))
    }
}

impl Deref for InodeHandle {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        &self.0
    }
}

/// The table of open inodes, along with the storage and allocator they live in.
pub struct InodeTable<S: SectorStore, A: SpaceAllocator> {
    storage: S,
    allocator: A,
    /// Open inodes keyed by the sector of their on-disk inode.
    open_inodes: Mutex<HashMap<SectorNumber, Arc<Inode>>>,
}

impl<S: SectorStore, A: SpaceAllocator> InodeTable<S, A> {
    #[must_use]
    pub fn new(storage: S, allocator: A) -> Self {
        Self {
            storage,
            allocator,
            open_inodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// The number of distinct inodes currently open.
    pub fn num_open(&self) -> usize {
        self.open_inodes().len()
    }

    /// Writes a new inode for a file of `length` bytes to `sector` and zero-fills its data
    /// sectors.
    ///
    /// Nothing is written to `sector` unless the data sectors could be allocated. The caller is
    /// responsible for `sector` not holding a live inode.
    pub fn create(&self, sector: SectorNumber, length: usize) -> Result<()> {
        let disk_length = i32::try_from(length)
            .map_err(|_| anyhow!("file length {length} exceeds the maximum file size"))?;

        let num_sectors = bytes_to_sectors(length);
        let start = self
            .allocator
            .allocate(num_sectors)
            .ok_or_else(|| anyhow!("no run of {num_sectors} free sectors"))?;

        if let Err(err) = self.write_new_inode(sector, start, disk_length, num_sectors) {
            self.allocator.release(start, num_sectors);
            return Err(err);
        }

        info!(
            "[inode @{sector}] created with {length} bytes in {num_sectors} sectors from {start}"
        );
        Ok(())
    }

    fn write_new_inode(
        &self,
        sector: SectorNumber,
        start: SectorNumber,
        length: i32,
        num_sectors: usize,
    ) -> Result<()> {
        let start = u32::try_from(start).context("data sector does not fit in an inode")?;
        let inode = DiskInode::new(start, length);

        self.storage
            .write_sector(sector, &inode.to_sector()?)
            .context("writing inode")?;

        for data_sector in inode.start()..inode.start() + num_sectors {
            self.storage
                .write_sector(data_sector, &ZERO_SECTOR)
                .context("zeroing data sector")?;
        }

        Ok(())
    }

    /// Opens the inode stored at `sector`, sharing the in-memory inode with any other opener.
    pub fn open(&self, sector: SectorNumber) -> Result<InodeHandle> {
        let mut open_inodes = self.open_inodes();

        if let Some(inode) = open_inodes.get(&sector) {
            // the count may be zero here if a close of the last handle is waiting for the table
            // lock; that close sees the new count and leaves the inode registered
            let mut state = inode.state();
            state.open_count += 1;
            debug!(
                "[inode @{sector}] reopened (open count = {})",
                state.open_count
            );
            drop(state);

            return Ok(InodeHandle(Arc::clone(inode)));
        }

        let mut buf = ZERO_SECTOR;
        self.storage
            .read_sector(sector, &mut buf)
            .with_context(|| format!("reading inode at sector {sector}"))?;
        let data = DiskInode::from_sector(&buf)?;

        let inode = Arc::new(Inode::new(sector, data));
        open_inodes.insert(sector, Arc::clone(&inode));
        debug!("[inode @{sector}] opened (length = {})", inode.length());

        Ok(InodeHandle(inode))
    }

    /// Gives back a handle. Closing the last handle drops the inode from the table and, if the
    /// file was removed, releases its sectors.
    pub fn close(&self, handle: InodeHandle) {
        let InodeHandle(inode) = handle;

        {
            let mut state = inode.state();
            state.open_count -= 1;
            if state.open_count > 0 {
                debug!(
                    "[inode @{}] closed (open count = {})",
                    inode.sector, state.open_count
                );
                return;
            }
        }

        let removed = {
            let mut open_inodes = self.open_inodes();
            let state = inode.state();

            if state.open_count > 0 {
                // reopened while we waited for the table lock
                return;
            }

            let registered = open_inodes
                .get(&inode.sector)
                .is_some_and(|open| Arc::ptr_eq(open, &inode));
            if !registered {
                // another closer of a reopened inode got here first
                return;
            }

            open_inodes.remove(&inode.sector);
            state.removed
        };

        debug!("[inode @{}] closed by last opener", inode.sector);

        if removed {
            self.allocator.release(inode.sector, 1);
            self.allocator
                .release(inode.data.start(), inode.data.sectors());
            info!(
                "[inode @{}] deleted; released {} data sectors",
                inode.sector,
                inode.data.sectors()
            );
        }
    }

    /// [`Self::close`], tolerating the absence of a handle.
    pub fn close_opt(&self, handle: Option<InodeHandle>) {
        if let Some(handle) = handle {
            self.close(handle);
        }
    }

    /// Reads up to `buffer.len()` bytes starting at `offset`. Returns the number of bytes read,
    /// which is short when the end of the file is reached.
    ///
    /// A storage failure is returned as an error only if nothing was read yet; otherwise the
    /// bytes read so far are reported.
    pub fn read_at(&self, inode: &Inode, buffer: &mut [u8], offset: usize) -> Result<usize> {
        debug!(
            "[inode @{}] reading (offset = {offset}; size = {})",
            inode.sector,
            buffer.len()
        );

        let mut bounce: Option<Sector> = None;
        let mut bytes_read = 0;

        while let Some(chunk) = inode.chunk_at(offset + bytes_read, buffer.len() - bytes_read) {
            let destination = &mut buffer[bytes_read..bytes_read + chunk.len];

            let result = if chunk.is_whole_sector() {
                let destination: &mut Sector = destination
                    .try_into()
                    .expect("a whole-sector chunk is SECTOR_SIZE bytes long");
                self.storage.read_sector(chunk.sector, destination)
            } else {
                let bounce = bounce.get_or_insert(ZERO_SECTOR);
                self.storage
                    .read_sector(chunk.sector, bounce)
                    .map(|()| destination.copy_from_slice(&bounce[chunk.range()]))
            };

            if let Err(err) = result {
                return partial_transfer(inode, "read", bytes_read, err);
            }

            bytes_read += chunk.len;
        }

        Ok(bytes_read)
    }

    /// Writes up to `buffer.len()` bytes starting at `offset`. Returns the number of bytes
    /// written, which is short when the end of the file is reached: files do not grow.
    ///
    /// Storage failures are reported as in [`Self::read_at`].
    pub fn write_at(&self, inode: &Inode, buffer: &[u8], offset: usize) -> Result<usize> {
        debug!(
            "[inode @{}] writing (offset = {offset}; size = {})",
            inode.sector,
            buffer.len()
        );

        let mut bounce: Option<Sector> = None;
        let mut bytes_written = 0;

        while let Some(chunk) = inode.chunk_at(offset + bytes_written, buffer.len() - bytes_written)
        {
            let source = &buffer[bytes_written..bytes_written + chunk.len];

            let result = if chunk.is_whole_sector() {
                let source: &Sector = source
                    .try_into()
                    .expect("a whole-sector chunk is SECTOR_SIZE bytes long");
                self.storage.write_sector(chunk.sector, source)
            } else {
                let bounce = bounce.get_or_insert(ZERO_SECTOR);
                self.write_partial_sector(&chunk, source, bounce)
            };

            if let Err(err) = result {
                return partial_transfer(inode, "write", bytes_written, err);
            }

            bytes_written += chunk.len;
        }

        Ok(bytes_written)
    }

    fn write_partial_sector(
        &self,
        chunk: &Chunk,
        source: &[u8],
        bounce: &mut Sector,
    ) -> Result<()> {
        // file data before or after the chunk has to survive; if there is none, the sector
        // starts out as zeros
        if chunk.sector_offset > 0 || chunk.len < chunk.min_left {
            self.storage.read_sector(chunk.sector, bounce)?;
        } else {
            bounce.fill(0);
        }

        bounce[chunk.range()].copy_from_slice(source);
        self.storage.write_sector(chunk.sector, bounce)
    }

    fn open_inodes(&self) -> MutexGuard<'_, HashMap<SectorNumber, Arc<Inode>>> {
        self.open_inodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn partial_transfer(
    inode: &Inode,
    operation: &str,
    transferred: usize,
    err: anyhow::Error,
) -> Result<usize> {
    if transferred == 0 {
        let context = format!("{operation} of inode @{} failed", inode.sector);
        return Err(err.context(context));
    }

    warn!(
        "[inode @{}] {operation} stopped after {transferred} bytes: {err:#}",
        inode.sector
    );
    Ok(transferred)
}

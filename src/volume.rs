use anyhow::{anyhow, bail, ensure, Context, Result};
use log::info;

use crate::{
    disk_format::{
        inode::DiskInode,
        sector::{SectorNumber, ZERO_SECTOR},
    },
    free_map::{FreeMap, SpaceAllocator},
    inode::InodeTable,
    storage::SectorStore,
};

/// The sector holding the inode of the free map file.
pub const FREE_MAP_SECTOR: SectorNumber = 0;

/// A formatted disk: the inode table plus a free map persisted in a file of its own.
pub struct Volume<S: SectorStore> {
    inodes: InodeTable<S, FreeMap>,
}

/// What [`Volume::check`] found.
#[derive(Debug, PartialEq, Eq)]
pub struct CheckReport {
    pub num_sectors: usize,
    pub num_free: usize,
}

impl<S: SectorStore> Volume<S> {
    /// Lays out an empty volume over the whole of `storage`.
    pub fn format(storage: S) -> Result<Self> {
        let num_sectors = storage.num_sectors()?;
        // we need at least the free map's inode and one sector of bitmap
        ensure!(
            num_sectors >= 2,
            "disk has {num_sectors} sectors but at least 2 are needed"
        );

        let free_map = FreeMap::new(num_sectors);
        free_map.mark_used(FREE_MAP_SECTOR);

        let inodes = InodeTable::new(storage, free_map);
        inodes
            .create(FREE_MAP_SECTOR, FreeMap::file_size(num_sectors))
            .context("creating free map file")?;

        let volume = Self { inodes };
        volume.sync()?;

        info!("formatted {num_sectors} sectors");
        Ok(volume)
    }

    /// Opens a volume previously laid out by [`Self::format`].
    pub fn mount(storage: S) -> Result<Self> {
        let num_sectors = storage.num_sectors()?;
        ensure!(num_sectors >= 2, "disk has only {num_sectors} sectors");

        let inodes = InodeTable::new(storage, FreeMap::new(num_sectors));

        let mut bitmap = vec![0; FreeMap::file_size(num_sectors)];
        let file = inodes.open(FREE_MAP_SECTOR)?;
        let read = inodes.read_at(&file, &mut bitmap, 0);
        inodes.close(file);

        let read = read.context("reading free map")?;
        ensure!(
            read == bitmap.len(),
            "free map file holds {read} bytes but {num_sectors} sectors need {}",
            bitmap.len()
        );

        inodes.allocator().load(&bitmap)?;

        info!(
            "mounted {num_sectors} sectors ({} free)",
            inodes.allocator().num_free()
        );
        Ok(Self { inodes })
    }

    /// Writes the free map back to disk.
    pub fn sync(&self) -> Result<()> {
        let bitmap = self.inodes.allocator().to_bytes();

        let file = self.inodes.open(FREE_MAP_SECTOR)?;
        let written = self.inodes.write_at(&file, &bitmap, 0);
        self.inodes.close(file);

        let written = written.context("writing free map")?;
        ensure!(
            written == bitmap.len(),
            "wrote {written} of {} free map bytes",
            bitmap.len()
        );

        Ok(())
    }

    /// Allocates an inode sector and creates a `length`-byte file there. Returns the new file's
    /// inode number.
    pub fn create_file(&self, length: usize) -> Result<SectorNumber> {
        let sector = self
            .inodes
            .allocator()
            .allocate(1)
            .ok_or_else(|| anyhow!("no free sector for an inode"))?;

        if let Err(err) = self.inodes.create(sector, length) {
            self.inodes.allocator().release(sector, 1);
            return Err(err);
        }

        Ok(sector)
    }

    pub fn inodes(&self) -> &InodeTable<S, FreeMap> {
        &self.inodes
    }

    pub fn num_sectors(&self) -> usize {
        self.inodes.allocator().num_sectors()
    }

    pub fn num_free(&self) -> usize {
        self.inodes.allocator().num_free()
    }

    /// Checks the free map file for consistency with the disk and with itself.
    pub fn check(&self) -> Result<CheckReport> {
        let free_map = self.inodes.allocator();
        let num_sectors = free_map.num_sectors();

        let mut sector = ZERO_SECTOR;
        self.inodes
            .storage()
            .read_sector(FREE_MAP_SECTOR, &mut sector)?;
        let inode = DiskInode::from_sector(&sector)?;

        if !inode.has_valid_magic() {
            bail!("free map inode has bad magic number {:#010x}", inode.magic);
        }

        if inode.length < 0 {
            bail!("invalid free map length: {}", inode.length);
        }

        if inode.length() != FreeMap::file_size(num_sectors) {
            bail!(
                "free map is {} bytes long but {num_sectors} sectors need {}",
                inode.length(),
                FreeMap::file_size(num_sectors)
            );
        }

        if !free_map.is_used(FREE_MAP_SECTOR) {
            bail!("free map inode sector is marked free");
        }

        let data = inode.start()..inode.start() + inode.sectors();
        if data.end > num_sectors {
            bail!("free map data {data:?} lies beyond the end of the disk");
        }

        if let Some(free) = data.clone().find(|&sector| !free_map.is_used(sector)) {
            bail!("free map data sector {free} is marked free");
        }

        if data.contains(&FREE_MAP_SECTOR) {
            bail!("free map data overlaps its inode");
        }

        Ok(CheckReport {
            num_sectors,
            num_free: free_map.num_free(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use crate::{
        disk_format::sector::SECTOR_SIZE,
        storage::{FileBackedStorage, MemoryStorage},
    };

    use super::*;

    fn disk(num_sectors: usize) -> File {
        let file = tempfile::tempfile().unwrap();
        file.set_len((num_sectors * SECTOR_SIZE) as u64).unwrap();
        file
    }

    fn storage(file: &File) -> FileBackedStorage {
        FileBackedStorage::new(file.try_clone().unwrap())
    }

    #[test]
    fn test_format_layout() {
        let volume = Volume::format(MemoryStorage::new(100)).unwrap();

        // inode at 0, 13 bytes of bitmap in sector 1
        assert_eq!(volume.num_sectors(), 100);
        assert_eq!(volume.num_free(), 98);
        assert_eq!(volume.check().unwrap().num_free, 98);

        let sector = volume.inodes().storage().peek(0).unwrap();
        let inode = DiskInode::from_sector(&sector).unwrap();
        assert_eq!(inode.start(), 1);
        assert_eq!(inode.length(), 13);

        let bitmap = volume.inodes().storage().peek(1).unwrap();
        assert_eq!(bitmap[0], 0b0000_0011);
        assert!(bitmap[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_format_too_small() {
        assert!(Volume::format(MemoryStorage::new(1)).is_err());
        assert!(Volume::format(MemoryStorage::new(2)).is_ok());
    }

    #[test]
    fn test_mount_unformatted() {
        assert!(Volume::mount(MemoryStorage::new(10)).is_err());
    }

    #[test]
    fn test_remount_keeps_files() {
        let file = disk(64);

        let inum = {
            let volume = Volume::format(storage(&file)).unwrap();
            let inum = volume.create_file(1000).unwrap();

            let inodes = volume.inodes();
            let handle = inodes.open(inum).unwrap();
            assert_eq!(inodes.write_at(&handle, b"persisted", 600).unwrap(), 9);
            inodes.close(handle);

            volume.sync().unwrap();
            inum
        };

        let volume = Volume::mount(storage(&file)).unwrap();
        assert_eq!(volume.num_free(), 64 - 2 - 3);
        assert!(volume.check().is_ok());

        let inodes = volume.inodes();
        let handle = inodes.open(inum).unwrap();
        assert_eq!(handle.length(), 1000);

        let mut buf = [0; 9];
        assert_eq!(inodes.read_at(&handle, &mut buf, 600).unwrap(), 9);
        assert_eq!(&buf, b"persisted");
        inodes.close(handle);
    }

    #[test]
    fn test_remove_then_remount_frees_sectors() {
        let file = disk(32);

        {
            let volume = Volume::format(storage(&file)).unwrap();
            let inum = volume.create_file(SECTOR_SIZE * 4).unwrap();
            assert_eq!(volume.num_free(), 32 - 2 - 5);

            let handle = volume.inodes().open(inum).unwrap();
            handle.remove();
            volume.inodes().close(handle);
            volume.sync().unwrap();
        }

        let volume = Volume::mount(storage(&file)).unwrap();
        assert_eq!(volume.num_free(), 32 - 2);
    }

    #[test]
    fn test_create_file_failure_releases_inode_sector() {
        let volume = Volume::format(MemoryStorage::new(8)).unwrap();
        assert_eq!(volume.num_free(), 6);

        assert!(volume.create_file(6 * SECTOR_SIZE).is_err());
        assert_eq!(volume.num_free(), 6);

        assert!(volume.create_file(5 * SECTOR_SIZE).is_ok());
        assert_eq!(volume.num_free(), 0);
    }

    #[test]
    fn test_check_bad_magic() {
        let volume = Volume::format(MemoryStorage::new(16)).unwrap();

        let mut sector = volume.inodes().storage().peek(0).unwrap();
        sector[8] ^= 0xff;
        volume.inodes().storage().write_sector(0, &sector).unwrap();

        assert!(volume.check().is_err());
    }

    #[test]
    fn test_check_free_map_data_marked_free() {
        let volume = Volume::format(MemoryStorage::new(16)).unwrap();
        volume.inodes().allocator().release(1, 1);

        assert!(volume.check().is_err());
    }
}

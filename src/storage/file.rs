use std::fs::File;
use std::os::unix::prelude::FileExt;

use anyhow::{ensure, Context, Result};

use crate::disk_format::sector::{Sector, SectorNumber, SECTOR_SIZE};

use super::sector_store::SectorStore;

/// Sector storage backed by a disk image on the host filesystem.
pub struct FileBackedStorage(File);

impl FileBackedStorage {
    pub fn new(file: File) -> Self {
        FileBackedStorage(file)
    }

    /// Resizes the underlying image to hold exactly `num_sectors` sectors.
    pub fn set_num_sectors(&self, num_sectors: usize) -> Result<()> {
        self.0
            .set_len((num_sectors * SECTOR_SIZE) as u64)
            .context("resizing disk image")
    }

    fn check_bounds(&self, sector_number: SectorNumber) -> Result<()> {
        let num_sectors = self.num_sectors()?;
        ensure!(
            sector_number < num_sectors,
            "sector number out of bounds: {sector_number} (disk has {num_sectors} sectors)"
        );

        Ok(())
    }
}

impl SectorStore for FileBackedStorage {
    fn read_sector(&self, sector_number: SectorNumber, sector: &mut Sector) -> Result<()> {
        self.check_bounds(sector_number)?;
        let position = sector_number * SECTOR_SIZE;

        self.0
            .read_exact_at(sector, position as u64)
            .with_context(|| format!("reading sector {sector_number}"))
    }

    fn write_sector(&self, sector_number: SectorNumber, sector: &Sector) -> Result<()> {
        self.check_bounds(sector_number)?;
        let position = sector_number * SECTOR_SIZE;

        self.0
            .write_all_at(sector, position as u64)
            .with_context(|| format!("writing sector {sector_number}"))
    }

    fn num_sectors(&self) -> Result<usize> {
        let metadata = self.0.metadata().context("reading disk image metadata")?;

        Ok(metadata.len() as usize / SECTOR_SIZE)
    }
}

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use anyhow::{bail, Context, Result};

use crate::disk_format::sector::{Sector, SectorNumber, ZERO_SECTOR};

use super::sector_store::SectorStore;

/// Sector storage held in memory. Counts transfers and can be told to fail on chosen sectors.
pub struct MemoryStorage {
    sectors: RwLock<Vec<Sector>>,
    faulty: RwLock<HashSet<SectorNumber>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStorage {
    /// Constructs a zero-filled [`MemoryStorage`] with `num_sectors` sectors.
    #[must_use]
    pub fn new(num_sectors: usize) -> Self {
        Self {
            sectors: RwLock::new(vec![ZERO_SECTOR; num_sectors]),
            faulty: RwLock::new(HashSet::new()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Makes every transfer to or from `sector_number` fail.
    pub fn set_faulty(&self, sector_number: SectorNumber) {
        self.faulty
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sector_number);
    }

    /// The number of sector reads performed so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// The number of sector writes performed so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// A copy of a sector's contents, bypassing the transfer counters.
    pub fn peek(&self, sector_number: SectorNumber) -> Option<Sector> {
        self.sectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sector_number)
            .copied()
    }

    fn check_faulty(&self, sector_number: SectorNumber) -> Result<()> {
        let faulty = self.faulty.read().unwrap_or_else(PoisonError::into_inner);
        if faulty.contains(&sector_number) {
            bail!("sector {sector_number} is faulty");
        }

        Ok(())
    }
}

impl SectorStore for MemoryStorage {
    fn read_sector(&self, sector_number: SectorNumber, sector: &mut Sector) -> Result<()> {
        self.check_faulty(sector_number)?;

        let sectors = self.sectors.read().unwrap_or_else(PoisonError::into_inner);
        *sector = *sectors
            .get(sector_number)
            .with_context(|| format!("sector number out of bounds: {sector_number}"))?;

        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_sector(&self, sector_number: SectorNumber, sector: &Sector) -> Result<()> {
        self.check_faulty(sector_number)?;

        let mut sectors = self.sectors.write().unwrap_or_else(PoisonError::into_inner);
        *sectors
            .get_mut(sector_number)
            .with_context(|| format!("sector number out of bounds: {sector_number}"))? = *sector;

        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn num_sectors(&self) -> Result<usize> {
        Ok(self
            .sectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len())
    }
}

#[cfg(test)]
mod tests {
    use crate::disk_format::sector::SECTOR_SIZE;

    use super::*;

    #[test]
    fn test_new_storage_is_zeroed() {
        let storage = MemoryStorage::new(4);
        assert_eq!(storage.num_sectors().unwrap(), 4);

        let mut sector = [0xfe; SECTOR_SIZE];
        storage.read_sector(3, &mut sector).unwrap();
        assert_eq!(sector, ZERO_SECTOR);
    }

    #[test]
    fn test_write_then_read() {
        let storage = MemoryStorage::new(2);
        storage.write_sector(1, &[0xcd; SECTOR_SIZE]).unwrap();

        let mut sector = ZERO_SECTOR;
        storage.read_sector(1, &mut sector).unwrap();
        assert_eq!(sector, [0xcd; SECTOR_SIZE]);
        assert_eq!(storage.peek(0), Some(ZERO_SECTOR));

        assert_eq!(storage.reads(), 1);
        assert_eq!(storage.writes(), 1);
    }

    #[test]
    fn test_out_of_bounds() {
        let storage = MemoryStorage::new(2);
        let mut sector = ZERO_SECTOR;

        assert!(storage.read_sector(1, &mut sector).is_ok());
        assert!(storage.read_sector(2, &mut sector).is_err());
        assert!(storage.write_sector(2, &sector).is_err());
        assert_eq!(storage.peek(2), None);
    }

    #[test]
    fn test_faulty_sector() {
        let storage = MemoryStorage::new(3);
        storage.set_faulty(1);
        let mut sector = ZERO_SECTOR;

        assert!(storage.read_sector(1, &mut sector).is_err());
        assert!(storage.write_sector(1, &sector).is_err());
        assert!(storage.read_sector(2, &mut sector).is_ok());
        assert_eq!(storage.reads(), 1);
        assert_eq!(storage.writes(), 0);
    }
}

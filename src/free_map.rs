use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{ensure, Result};
use bitvec::prelude::{BitVec, Lsb0};
use log::warn;

use crate::disk_format::sector::SectorNumber;

/// Grants and reclaims runs of sectors.
pub trait SpaceAllocator {
    /// Reserves `count` contiguous sectors and returns the first one, or `None` if no run of
    /// that length is free. Allocating zero sectors always succeeds.
    fn allocate(&self, count: usize) -> Option<SectorNumber>;

    /// Returns `count` sectors starting at `start` to the pool.
    fn release(&self, start: SectorNumber, count: usize);
}

/// A free-sector bitmap with first-fit allocation.
pub struct FreeMap {
    /// Tracks the allocation status of sectors.
    /// A value of `true` represents "occupied".
    bitmap: Mutex<BitVec<u8, Lsb0>>,
}

impl FreeMap {
    /// Constructs a [`FreeMap`] for `num_sectors` sectors, all of them free.
    #[must_use]
    pub fn new(num_sectors: usize) -> Self {
        Self {
            bitmap: Mutex::new(BitVec::repeat(false, num_sectors)),
        }
    }

    /// The number of bytes needed to persist a map of `num_sectors` sectors.
    pub const fn file_size(num_sectors: usize) -> usize {
        num_sectors.div_ceil(8)
    }

    pub fn num_sectors(&self) -> usize {
        self.bitmap().len()
    }

    pub fn num_free(&self) -> usize {
        self.bitmap().count_zeros()
    }

    pub fn is_used(&self, sector: SectorNumber) -> bool {
        self.bitmap().get(sector).is_some_and(|bit| *bit)
    }

    /// Marks a single sector as occupied without going through [`SpaceAllocator::allocate`].
    pub fn mark_used(&self, sector: SectorNumber) {
        let mut bitmap = self.bitmap();
        let bit = bitmap.get_mut(sector);
        match bit {
            Some(mut bit) => *bit = true,
            None => warn!("marking out-of-range sector {sector} as used"),
        }
    }

    /// The persisted form of the map: one bit per sector, least significant bit first.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bitmap().as_raw_slice().to_vec()
    }

    /// Replaces the map's contents with a persisted map. Bits past the map's sector count are
    /// ignored.
    pub fn load(&self, bytes: &[u8]) -> Result<()> {
        let mut bitmap = self.bitmap();
        let num_sectors = bitmap.len();
        ensure!(
            bytes.len() >= Self::file_size(num_sectors),
            "free map holds {} bytes but {num_sectors} sectors need {}",
            bytes.len(),
            Self::file_size(num_sectors)
        );

        let mut loaded = BitVec::<u8, Lsb0>::from_slice(bytes);
        loaded.truncate(num_sectors);
        loaded.set_uninitialized(false);
        *bitmap = loaded;

        Ok(())
    }

    fn bitmap(&self) -> MutexGuard<'_, BitVec<u8, Lsb0>> {
        self.bitmap.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SpaceAllocator for FreeMap {
    fn allocate(&self, count: usize) -> Option<SectorNumber> {
        if count == 0 {
            return Some(0);
        }

        let mut bitmap = self.bitmap();
        if count > bitmap.len() {
            return None;
        }

        let start = bitmap.windows(count).position(|run| run.not_any())?;
        bitmap[start..start + count].fill(true);

        Some(start)
    }

    fn release(&self, start: SectorNumber, count: usize) {
        let mut bitmap = self.bitmap();
        let end = start.saturating_add(count);

        let Some(run) = bitmap.get_mut(start..end) else {
            warn!("releasing out-of-range sectors {start}..{end}");
            return;
        };

        if !run.all() {
            warn!("releasing sectors {start}..{end} which are not all in use");
        }

        run.fill(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_first_fit() {
        let free_map = FreeMap::new(8);

        assert_eq!(free_map.allocate(3), Some(0));
        assert_eq!(free_map.allocate(2), Some(3));
        assert_eq!(free_map.num_free(), 3);

        free_map.release(0, 3);
        assert_eq!(free_map.allocate(1), Some(0));
        assert_eq!(free_map.allocate(3), Some(5));
        assert_eq!(free_map.allocate(2), Some(1));
        assert_eq!(free_map.num_free(), 0);
    }

    #[test]
    fn test_allocate_needs_contiguous_run() {
        let free_map = FreeMap::new(6);
        free_map.mark_used(2);

        assert_eq!(free_map.allocate(3), Some(3));
        assert_eq!(free_map.allocate(3), None);
        assert_eq!(free_map.allocate(2), Some(0));
    }

    #[test]
    fn test_allocate_zero() {
        let free_map = FreeMap::new(0);

        assert_eq!(free_map.allocate(0), Some(0));
        assert_eq!(free_map.allocate(1), None);
        free_map.release(0, 0);
    }

    #[test]
    fn test_allocate_more_than_disk() {
        let free_map = FreeMap::new(4);
        assert_eq!(free_map.allocate(5), None);
        assert_eq!(free_map.num_free(), 4);
    }

    #[test]
    fn test_mark_used() {
        let free_map = FreeMap::new(4);
        free_map.mark_used(1);
        free_map.mark_used(1);
        free_map.mark_used(4);

        assert!(free_map.is_used(1));
        assert!(!free_map.is_used(4));
        assert_eq!(free_map.num_free(), 3);
        assert_eq!(free_map.allocate(2), Some(2));
    }

    #[test]
    fn test_release_out_of_range_is_ignored() {
        let free_map = FreeMap::new(4);
        free_map.mark_used(3);

        free_map.release(3, 2);
        assert!(free_map.is_used(3));
        assert!(!free_map.is_used(4));
    }

    #[test]
    fn test_double_release() {
        let free_map = FreeMap::new(4);
        let start = free_map.allocate(2).unwrap();

        free_map.release(start, 2);
        free_map.release(start, 2);
        assert_eq!(free_map.num_free(), 4);
    }

    #[test]
    fn test_persisted_form() {
        let free_map = FreeMap::new(10);
        free_map.mark_used(0);
        free_map.mark_used(9);

        let bytes = free_map.to_bytes();
        assert_eq!(bytes, vec![0b0000_0001, 0b0000_0010]);
        assert_eq!(FreeMap::file_size(10), 2);

        let loaded = FreeMap::new(10);
        loaded.load(&bytes).unwrap();
        assert!(loaded.is_used(0));
        assert!(loaded.is_used(9));
        assert_eq!(loaded.num_free(), 8);
    }

    #[test]
    fn test_load_ignores_trailing_bits() {
        let free_map = FreeMap::new(4);
        free_map.load(&[0b1111_0010]).unwrap();

        assert_eq!(free_map.num_sectors(), 4);
        assert!(free_map.is_used(1));
        assert_eq!(free_map.num_free(), 3);
    }

    #[test]
    fn test_load_too_short() {
        let free_map = FreeMap::new(9);
        assert!(free_map.load(&[0]).is_err());
        assert_eq!(free_map.num_sectors(), 9);
    }
}

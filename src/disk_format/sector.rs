use std::mem::size_of;

/// The size of a disk sector in bytes. Sectors are the unit of all device I/O.
pub const SECTOR_SIZE: usize = 512;

/// One sector's worth of bytes.
pub type Sector = [u8; SECTOR_SIZE];
const_assert!(size_of::<Sector>() == SECTOR_SIZE);

/// A sector of zeros.
pub const ZERO_SECTOR: Sector = [0; SECTOR_SIZE];

// sector numbers are stored as `u32`s on the disk, but we use `usize`s to avoid littering the
// code with casts.
pub type SectorNumber = usize;

/// The number of sectors needed to hold `size` bytes.
pub const fn bytes_to_sectors(size: usize) -> usize {
    size.div_ceil(SECTOR_SIZE)
}

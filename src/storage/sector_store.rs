use anyhow::Result;

use crate::disk_format::sector::{Sector, SectorNumber};

/// A block device that transfers whole sectors synchronously.
pub trait SectorStore {
    fn read_sector(&self, sector_number: SectorNumber, sector: &mut Sector) -> Result<()>;

    fn write_sector(&self, sector_number: SectorNumber, sector: &Sector) -> Result<()>;

    /// The number of sectors on the device.
    fn num_sectors(&self) -> Result<usize>;
}

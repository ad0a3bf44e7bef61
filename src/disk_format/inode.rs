use std::mem::size_of;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::sector::{bytes_to_sectors, Sector, SectorNumber, SECTOR_SIZE};

/// The number of bytes occupied by an on-disk inode. An inode fills its sector exactly.
pub const DISK_INODE_SIZE: usize = SECTOR_SIZE;
const_assert!(size_of::<DiskInode>() == DISK_INODE_SIZE);

/// Identifies an inode ("INOD").
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// The number of padding words following the inode's fields.
const UNUSED_WORDS: usize = 125;
const_assert!(12 + UNUSED_WORDS * 4 == DISK_INODE_SIZE);

// serde only derives for arrays of up to 32 elements, so the padding is stored as 5 rows of 25
// words. bincode writes arrays without a length prefix, so the bytes are the same as a flat array.
type Unused = [[u32; 25]; 5];
const_assert!(size_of::<Unused>() == UNUSED_WORDS * 4);

/// The on-disk file descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct DiskInode {
    /// first data sector
    pub start: u32,
    /// file size in bytes
    pub length: i32,
    /// magic number
    pub magic: u32,
    /// not used; carried verbatim
    pub unused: Unused,
}

impl DiskInode {
    /// Constructs a new [`DiskInode`] for a file of `length` bytes whose data starts at `start`.
    #[must_use]
    pub fn new(start: u32, length: i32) -> Self {
        Self {
            start,
            length,
            magic: INODE_MAGIC,
            unused: [[0; 25]; 5],
        }
    }

    /// Parses an inode from the contents of its sector.
    pub fn from_sector(sector: &Sector) -> Result<Self> {
        bincode::deserialize(sector).context("parsing inode")
    }

    /// Serializes the inode into a full sector.
    pub fn to_sector(&self) -> Result<Sector> {
        let bytes = bincode::serialize(self).context("serializing inode")?;

        Ok(bytes
            .try_into()
            .expect("an inode serializes to exactly one sector"))
    }

    /// The file length in bytes. Negative lengths read from a damaged disk are treated as empty.
    pub fn length(&self) -> usize {
        self.length.max(0) as usize
    }

    /// The first data sector.
    pub fn start(&self) -> SectorNumber {
        self.start as SectorNumber
    }

    /// The number of data sectors owned by the inode.
    pub fn sectors(&self) -> usize {
        bytes_to_sectors(self.length())
    }

    pub fn has_valid_magic(&self) -> bool {
        self.magic == INODE_MAGIC
    }
}

mod directory_lock;
pub mod disk_format;
pub mod free_map;
pub mod inode;
pub mod storage;
pub mod volume;

pub use directory_lock::DirectoryLock;

/// File-backed sector storage.
mod file;
/// Memory-backed sector storage.
mod memory;
/// The sector storage abstraction.
mod sector_store;

pub use file::*;
pub use memory::*;
pub use sector_store::*;

/// Perform a const assertion.
macro_rules! const_assert {
    ($($tt:tt)*) => {
        const _: () = assert!($($tt)*);
    }
}

/// The on-disk file descriptor.
pub mod inode;
/// Sectors and sector numbers.
pub mod sector;

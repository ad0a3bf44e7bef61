use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use log::warn;

/// A blocking lock acquired and released by separate calls rather than through a guard.
///
/// Inodes carry one of these for the directory layer above them. The lock does not protect
/// any data of its own.
#[derive(Debug, Default)]
pub struct DirectoryLock {
    locked: Mutex<bool>,
    released: Condvar,
}

impl DirectoryLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the lock is free, then takes it.
    pub fn acquire(&self) {
        let mut locked = self.locked();
        while *locked {
            locked = self
                .released
                .wait(locked)
                .unwrap_or_else(PoisonError::into_inner);
        }

        *locked = true;
    }

    /// Takes the lock if it is free.
    #[cfg(test)]
    pub fn try_acquire(&self) -> bool {
        let mut locked = self.locked();
        if *locked {
            return false;
        }

        *locked = true;
        true
    }

    pub fn release(&self) {
        let mut locked = self.locked();
        debug_assert!(*locked, "releasing a directory lock that is not held");
        if !*locked {
            warn!("releasing a directory lock that is not held");
        }

        *locked = false;
        self.released.notify_one();
    }

    /// Puts the lock back into its released state. Reinitializing a lock that someone holds is
    /// the caller's mistake and is not detected.
    pub fn init(&self) {
        *self.locked() = false;
        self.released.notify_all();
    }

    #[cfg(test)]
    pub fn is_locked(&self) -> bool {
        *self.locked()
    }

    fn locked(&self) -> MutexGuard<'_, bool> {
        self.locked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

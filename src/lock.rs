use std::sync::atomic::{AtomicU64, Ordering::*};

#[derive(Debug, thiserror::Error)]
pub enum OptLockError {
    #[error("Version mismatch")]
    VersionMismatch,

    #[error("Node is write locked")]
    Locked,

    #[error("Node is obsoleted")]
    Obsoleted,
}

use OptLockError::*;

pub type OptResult<T> = Result<T, OptLockError>;

const OBSOLETE_BIT: u64 = 0b01;
const LOCKED_BIT: u64 = 0b10;
const VERSION_STEP: u64 = 0b100;

/// Optimistic lock embedded in a node header.
///
/// The word is `| version: 62 bit | lock: 1 bit | obsolete: 1 bit |`.
/// The lock guards the fields living next to it in the node; readers
/// snapshot the word, read those fields, and revalidate, restarting on
/// any change. `write_unlock` bumps the version as it clears the lock
/// bit, which is what invalidates concurrent readers.
#[derive(Debug)]
pub struct VersionLock {
    word: AtomicU64,
}

fn is_obsoleted(word: u64) -> bool {
    word & OBSOLETE_BIT != 0
}

fn is_locked(word: u64) -> bool {
    word & LOCKED_BIT != 0
}

impl VersionLock {
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    /// Observe the current version, signaling restart if a writer holds
    /// the lock or the node has been retired.
    pub fn read_or_restart(&self) -> OptResult<u64> {
        let word = self.word.load(Acquire);
        if is_obsoleted(word) {
            return Err(Obsoleted);
        }
        if is_locked(word) {
            return Err(Locked);
        }
        Ok(word)
    }

    /// Revalidate a previously observed version. Named for the two call
    /// sites: mid-traversal checks and the final read unlock are the
    /// same reload-and-compare.
    pub fn check_or_restart(&self, version: u64) -> OptResult<()> {
        if self.word.load(Acquire) == version {
            Ok(())
        } else {
            Err(VersionMismatch)
        }
    }

    pub fn read_unlock_or_restart(&self, version: u64) -> OptResult<()> {
        self.check_or_restart(version)
    }

    /// Atomically trade an observed version for the write lock.
    pub fn upgrade_or_restart(&self, version: u64) -> OptResult<()> {
        match self
            .word
            .compare_exchange(version, version + LOCKED_BIT, Acquire, Relaxed)
        {
            Ok(_) => Ok(()),
            Err(_) => Err(VersionMismatch),
        }
    }

    pub fn write_lock_or_restart(&self) -> OptResult<()> {
        let version = self.read_or_restart()?;
        self.upgrade_or_restart(version)
    }

    pub fn write_unlock(&self) {
        self.word.fetch_add(LOCKED_BIT, Release);
    }

    /// Release the write lock on a node that has been replaced. Readers
    /// holding a pointer to it will fail their next validation.
    pub fn write_unlock_obsolete(&self) {
        self.word.fetch_add(LOCKED_BIT | OBSOLETE_BIT, Release);
    }

    /// Raw peek used by the transactional path, which has no use for a
    /// version snapshot: any locked or obsolete node aborts the
    /// transaction outright.
    pub fn is_locked_or_obsolete(&self) -> bool {
        self.word.load(Acquire) & (LOCKED_BIT | OBSOLETE_BIT) != 0
    }

    /// Advance the version without taking the lock. Only meaningful
    /// inside a hardware transaction, where the commit makes the store
    /// atomic with the mutation it publishes.
    pub fn bump(&self) {
        let word = self.word.load(Relaxed);
        self.word.store(word + VERSION_STEP, Release);
    }
}

impl Default for VersionLock {
    fn default() -> Self {
        Self::new()
    }
}

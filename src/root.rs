//! Root bookkeeping record (stored in the header page's payload) and the
//! single-word spinlock that guards mutation of arena metadata.

use std::sync::atomic::{AtomicU32, Ordering};

/// Arena-wide bookkeeping, persisted as part of the header page's payload.
///
/// `committer_reserved` is dead space: a live committer cannot be soundly
/// persisted as raw bytes across a process boundary (it would require
/// serializing a `dyn Trait`), so the field exists only to keep the on-disk
/// layout stable. The real committer handle lives on the Rust-side
/// [`crate::arena::Arena`] and is re-supplied on every attach.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RootRecord {
    pub total_size: u64,
    pub total_available: u64,
    pub alloc_objects: u32,
    pub min_alloc: u32,
    pub user1: u64,
    pub user2: u64,
    pub user3: u64,
    pub user4: u64,
    pub committer_reserved: u64,
    pub lock: u32,
    pub _pad: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<RootRecord>(), 72);

/// Byte offset of `user1` within `RootRecord`: past `total_size`,
/// `total_available`, `alloc_objects`, and `min_alloc`. Hardcoded rather than
/// computed so `commit_user_data` does not depend on a field-offset macro.
pub const USER_SLOTS_OFFSET: u64 = 24;
pub const USER_SLOTS_LEN: u64 = 4 * 8;

impl RootRecord {
    pub fn user_slot(&self, index: u8) -> u64 {
        match index {
            0 => self.user1,
            1 => self.user2,
            2 => self.user3,
            3 => self.user4,
            _ => panic!("user slot index out of range: {index}"),
        }
    }

    pub fn set_user_slot(&mut self, index: u8, value: u64) {
        match index {
            0 => self.user1 = value,
            1 => self.user2 = value,
            2 => self.user3 = value,
            3 => self.user4 = value,
            _ => panic!("user slot index out of range: {index}"),
        }
    }
}

/// A single sequentially-consistent compare-and-swap spinlock, stored as one
/// `u32` word so it can live inside arena bytes shared across processes.
///
/// Modeled on [`crate::arena`]'s cross-process requirements; the lock itself
/// carries no identity of its own and works the same whether contended by
/// threads in one process or by separate processes mapping the same memory.
pub struct SpinLock {
    word: *mut u32,
}

impl SpinLock {
    /// # Safety
    /// `word` must point to a valid, live `u32` for as long as the returned
    /// value (or any guard derived from it) is used.
    pub unsafe fn at(word: *mut u32) -> Self {
        SpinLock { word }
    }

    fn atomic(&self) -> &AtomicU32 {
        // SAFETY: `word` is a valid `u32` for the lifetime of this lock, and
        // `AtomicU32` has the same layout as `u32`.
        unsafe { &*(self.word as *const AtomicU32) }
    }

    /// Acquires the lock, returning a guard that releases it on drop. The
    /// guard holds the word pointer directly rather than borrowing `self` so
    /// it can outlive a `SpinLock` built as a temporary over arena bytes.
    pub fn lock(&self) -> SpinLockGuard {
        while self
            .atomic()
            .compare_exchange_weak(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinLockGuard { word: self.word }
    }

    /// Unconditionally resets the lock to unlocked. Used on `from_existing`
    /// to recover from a process that crashed while holding the lock; unsound
    /// if another process is genuinely mid-operation at the moment of reset.
    pub fn force_unlock(&self) {
        self.atomic().store(0, Ordering::SeqCst);
    }
}

pub struct SpinLockGuard {
    word: *mut u32,
}

impl Drop for SpinLockGuard {
    fn drop(&mut self) {
        // SAFETY: `word` was valid when the lock was acquired and the arena
        // outlives every guard derived from it.
        unsafe { &*(self.word as *const AtomicU32) }.store(0, Ordering::SeqCst);
    }
}

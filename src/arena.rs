//! The public orchestration layer: ties the list, page, and root modules
//! together under the arena's spinlock and the optional commit protocol.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::commit::{CommitRange, Committer};
use crate::error::FmemError;
use crate::list::{self, Link};
use crate::page::{self, Fit, PageHeader};
use crate::root::{RootRecord, SpinLock, USER_SLOTS_LEN, USER_SLOTS_OFFSET};
use crate::{DEFAULT_MIN_ALLOC, HEADER_SIZE, MIN_TOTAL_ALLOCATION, ROOT_RECORD_SIZE};

const HEADER_PAGE_OFFSET: u64 = 0;
const ROOT_RECORD_OFFSET: u64 = HEADER_SIZE as u64;

/// A fixed-region allocator installed over caller-owned memory.
///
/// `Arena` holds only a raw base pointer and length; it never allocates or
/// frees the underlying memory itself. All mutation of the mapped bytes is
/// funneled through the spinlock-guarded paths below, which is what makes
/// concurrent `&Arena` access from multiple threads (or processes, if the
/// memory is shared) sound.
pub struct Arena {
    base: *mut u8,
    length: u64,
    committer: UnsafeCell<Option<Box<dyn Committer>>>,
    poisoned: AtomicBool,
}

// SAFETY: every mutation of `base`'s bytes goes through `lock()`, and
// `committer` is only ever touched through `&*self.committer.get()`, which is
// sound because `Committer: Send` and the cell is only written during
// construction before the `Arena` is shared.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

fn corruption_error(offset: u64) -> FmemError {
    log::error!("page header at offset {offset} failed its magic check");
    if cfg!(test) || cfg!(feature = "poison-test-errors") {
        FmemError::BadMem(offset)
    } else {
        log::error!("corruption is unrecoverable in a release build; terminating process");
        std::process::abort();
    }
}

impl Arena {
    fn root_ptr(&self) -> *mut RootRecord {
        // SAFETY: `base` points to a valid arena for the lifetime of `self`,
        // and the root record was written at this offset by `create_new`.
        unsafe { self.base.add(ROOT_RECORD_OFFSET as usize) as *mut RootRecord }
    }

    fn lock(&self) -> crate::root::SpinLockGuard {
        // SAFETY: the `lock` field lives inside the root record for as long
        // as `self` does.
        unsafe { SpinLock::at(std::ptr::addr_of_mut!((*self.root_ptr()).lock)) }.lock()
    }

    fn check_poisoned(&self) -> Result<(), FmemError> {
        if self.poisoned.load(Ordering::Acquire) {
            Err(FmemError::CommitFailed)
        } else {
            Ok(())
        }
    }

    fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    fn verify_magic(&self, offset: u64) -> Result<(), FmemError> {
        if cfg!(feature = "poison-checks") {
            // SAFETY: `offset` is expected to name a live page header; callers
            // only invoke this on offsets they derived from the arena itself.
            if !unsafe { page::check_magic(self.base, offset) } {
                return Err(corruption_error(offset));
            }
        }
        Ok(())
    }

    fn invoke_committer(&self, ranges: &[CommitRange]) -> Result<(), FmemError> {
        // SAFETY: `committer` is only written during construction, before the
        // arena is shared across threads.
        let committer = unsafe { &*self.committer.get() };
        match committer {
            Some(c) => c.commit(ranges).map_err(|e| {
                self.poison();
                e
            }),
            None => Ok(()),
        }
    }

    /// Installs a new allocator over `length` bytes starting at `base`.
    ///
    /// # Safety
    /// `base` must be valid for reads and writes of `length` bytes for as
    /// long as the returned `Arena` (and anything derived from it) is used,
    /// and must not be aliased by any other live reference.
    pub unsafe fn create_new(
        base: *mut u8,
        length: u64,
        min_alloc_request: u64,
        committer: Option<Box<dyn Committer>>,
    ) -> Result<Arena, FmemError> {
        if length < MIN_TOTAL_ALLOCATION {
            return Err(FmemError::TotalAllocationSizeTooSmall(length));
        }
        if length < min_alloc_request + 2 * HEADER_SIZE as u64 + ROOT_RECORD_SIZE as u64 {
            return Err(FmemError::BadInitMem { length, min_alloc: min_alloc_request });
        }
        let min_alloc = if min_alloc_request < DEFAULT_MIN_ALLOC {
            DEFAULT_MIN_ALLOC
        } else {
            min_alloc_request
        };

        let header_page_size = HEADER_SIZE as u32 + ROOT_RECORD_SIZE as u32;

        std::ptr::write(
            page::page_ptr(base, HEADER_PAGE_OFFSET),
            PageHeader {
                flags: 0,
                size: header_page_size,
                link: Link { prev: HEADER_PAGE_OFFSET, next: HEADER_PAGE_OFFSET },
            },
        );
        page::set_busy(base, HEADER_PAGE_OFFSET);
        page::stamp_magic(base, HEADER_PAGE_OFFSET);

        std::ptr::write(
            base.add(ROOT_RECORD_OFFSET as usize) as *mut RootRecord,
            RootRecord {
                total_size: length,
                total_available: length - 2 * HEADER_SIZE as u64 - ROOT_RECORD_SIZE as u64,
                alloc_objects: 0,
                min_alloc: min_alloc as u32,
                user1: 0,
                user2: 0,
                user3: 0,
                user4: 0,
                committer_reserved: 0,
                lock: 0,
                _pad: 0,
            },
        );

        let main_offset = header_page_size as u64;
        let main_size = (length - header_page_size as u64) as u32;
        std::ptr::write(
            page::page_ptr(base, main_offset),
            PageHeader {
                flags: 0,
                size: main_size,
                link: Link { prev: main_offset, next: main_offset },
            },
        );
        page::stamp_magic(base, main_offset);
        list::insert_after(base, HEADER_PAGE_OFFSET, main_offset);

        let arena = Arena {
            base,
            length,
            committer: UnsafeCell::new(committer),
            poisoned: AtomicBool::new(false),
        };

        // One range spanning the header page, the root record, and the main
        // page's header: everything a fresh arena needs to be rehydrated.
        let range = CommitRange::new(0, header_page_size as u64 + HEADER_SIZE as u64);
        arena.invoke_committer(&[range])?;

        Ok(arena)
    }

    /// Reattaches to an arena previously built by [`Arena::create_new`],
    /// whose bytes are already present at `base` (e.g. freshly `mmap`ed from
    /// a backing file).
    ///
    /// Resets the lock unconditionally, on the assumption that attach only
    /// ever happens after a clean shutdown or crash recovery, never while
    /// another process genuinely still holds it.
    ///
    /// # Safety
    /// `base` must point to bytes previously written by `create_new` (or a
    /// prior `from_existing`), valid for reads and writes for as long as the
    /// returned `Arena` is used.
    pub unsafe fn from_existing(
        base: *mut u8,
        committer: Option<Box<dyn Committer>>,
    ) -> Result<Arena, FmemError> {
        if cfg!(feature = "poison-checks") && !page::check_magic(base, HEADER_PAGE_OFFSET) {
            return Err(corruption_error(HEADER_PAGE_OFFSET));
        }

        let root = &*(base.add(ROOT_RECORD_OFFSET as usize) as *const RootRecord);
        let arena = Arena {
            base,
            length: root.total_size,
            committer: UnsafeCell::new(committer),
            poisoned: AtomicBool::new(false),
        };

        SpinLock::at(std::ptr::addr_of_mut!((*arena.root_ptr()).lock)).force_unlock();

        Ok(arena)
    }

    /// Total length of the arena, as supplied to `create_new`.
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Reads one of the four opaque 64-bit user slots in the root record.
    pub fn user_slot(&self, index: u8) -> u64 {
        // SAFETY: the root record is always initialized by the time an
        // `Arena` exists.
        unsafe { (*self.root_ptr()).user_slot(index) }
    }

    /// Writes one of the four opaque 64-bit user slots in the root record.
    /// Not synchronized against other operations; the caller owns these
    /// bytes.
    pub fn set_user_slot(&self, index: u8, value: u64) {
        unsafe { (*self.root_ptr()).set_user_slot(index, value) }
    }

    /// Allocates at least `size` bytes, returning a pointer to the payload.
    pub fn allocate(&self, size: u64) -> Result<*mut u8, FmemError> {
        self.check_poisoned()?;

        // SAFETY: `min_alloc` is fixed at creation time and never mutated.
        let min_alloc = unsafe { (*self.root_ptr()).min_alloc as u64 };
        let adjusted = std::cmp::max(size, min_alloc) as u32;

        let _guard = self.lock();

        // SAFETY: held under the lock; no other access to the root record
        // happens concurrently while `_guard` is alive.
        if unsafe { (*self.root_ptr()).total_available } < adjusted as u64 {
            return Err(FmemError::NoMem);
        }

        let mut selected: Option<u64> = None;
        let mut carved_from: Option<u64> = None;

        // SAFETY: traversal and per-page operations stay within the arena;
        // `HEADER_PAGE_OFFSET` is a live, initialized list head.
        unsafe {
            for offset in list::Iter::new(self.base, HEADER_PAGE_OFFSET) {
                self.verify_magic(offset)?;
                if !page::is_free(self.base, offset) {
                    continue;
                }
                match page::classify_fit(self.base, offset, adjusted) {
                    Fit::CannotFit => continue,
                    Fit::FitAsIs => {
                        selected = Some(offset);
                        break;
                    }
                    Fit::FitWithCarve => {
                        let carved = page::carve(self.base, offset, adjusted);
                        selected = Some(carved);
                        carved_from = Some(offset);
                        break;
                    }
                }
            }
        }

        let offset = match selected {
            Some(o) => o,
            None => return Err(FmemError::NoMem),
        };

        // SAFETY: `offset` names a page just selected from the live list.
        unsafe {
            page::set_busy(self.base, offset);
            page::stamp_magic(self.base, offset);
            let sz = page::size_of_page(self.base, offset) as u64;
            (*self.root_ptr()).total_available -= sz;
            (*self.root_ptr()).alloc_objects += 1;

            let ranges: Vec<CommitRange> = match carved_from {
                Some(prev) => {
                    let next_offset = (*page::page_ptr(self.base, offset)).link.next;
                    vec![
                        CommitRange::new(offset, page::size_of_page(self.base, offset) as u64),
                        CommitRange::new(prev, page::size_of_page(self.base, prev) as u64),
                        CommitRange::new(
                            next_offset + page::LINK_FIELD_OFFSET,
                            std::mem::size_of::<Link>() as u64,
                        ),
                    ]
                }
                None => vec![CommitRange::new(offset, sz)],
            };
            self.invoke_committer(&ranges)?;

            Ok(self.base.add(page::payload_offset(offset) as usize))
        }
    }

    /// Frees a payload pointer previously returned by [`Arena::allocate`],
    /// returning the number of bytes the owning page held.
    pub fn free(&self, ptr: *mut u8) -> Result<u64, FmemError> {
        self.check_poisoned()?;

        // SAFETY: `ptr` must have been returned by `allocate` on this arena.
        let payload_offset = unsafe { ptr.offset_from(self.base) as u64 };
        let offset = page::page_from_payload(payload_offset);

        self.verify_magic(offset)?;

        let _guard = self.lock();

        unsafe {
            let freed = page::size_of_page(self.base, offset) as u64;
            page::set_free(self.base, offset);
            let survivor = page::merge(self.base, offset);

            (*self.root_ptr()).alloc_objects -= 1;
            (*self.root_ptr()).total_available += freed;

            let link = (*page::page_ptr(self.base, survivor)).link;
            let link_size = std::mem::size_of::<Link>() as u64;
            let ranges = [
                CommitRange::new(survivor, page::size_of_page(self.base, survivor) as u64),
                CommitRange::new(link.prev + page::LINK_FIELD_OFFSET, link_size),
                CommitRange::new(link.next + page::LINK_FIELD_OFFSET, link_size),
            ];
            self.invoke_committer(&ranges)?;

            Ok(freed)
        }
    }

    /// Commits the four user slots in the root record to the backing store.
    pub fn commit_user_data(&self) -> Result<u64, FmemError> {
        self.check_poisoned()?;
        self.verify_magic(HEADER_PAGE_OFFSET)?;

        // SAFETY: `committer` access is read-only here.
        if unsafe { &*self.committer.get() }.is_none() {
            return Err(FmemError::CommitFailed);
        }

        let range = CommitRange::new(ROOT_RECORD_OFFSET + USER_SLOTS_OFFSET, USER_SLOTS_LEN);
        self.invoke_committer(&[range])?;
        Ok(USER_SLOTS_LEN)
    }

    /// Commits `len` bytes of a payload previously returned by `allocate` to
    /// the backing store; `len == 0` commits the page's full usable size.
    pub fn commit_mem(&self, ptr: *mut u8, len: u64) -> Result<u64, FmemError> {
        self.check_poisoned()?;

        // SAFETY: `ptr` must have been returned by `allocate` on this arena.
        let payload_offset = unsafe { ptr.offset_from(self.base) as u64 };
        let offset = page::page_from_payload(payload_offset);

        self.verify_magic(offset)?;

        if unsafe { &*self.committer.get() }.is_none() {
            return Err(FmemError::CommitFailed);
        }

        // SAFETY: `offset` names a live page header.
        let usable = unsafe { page::usable_size(self.base, offset) as u64 };
        let len = if len == 0 { usable } else { len };

        if len > usable || payload_offset + len > offset + HEADER_SIZE as u64 + usable {
            return Err(FmemError::CommitFailed);
        }

        let range = CommitRange::new(payload_offset, len);
        self.invoke_committer(&[range])?;
        Ok(len)
    }
}

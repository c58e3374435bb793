//! # fmem
//!
//! A fixed-region memory allocator: the caller supplies a contiguous byte
//! range and this crate installs its own bookkeeping inside it, thereafter
//! serving `allocate`/`free` requests whose results point back into that same
//! range. Because every byte of metadata lives in the block itself, an arena
//! is rehydratable: a fresh process that maps the same backing store can
//! reattach to an existing allocator state with [`Arena::from_existing`]
//! instead of rebuilding it.
//!
//! | module | responsibility |
//! |---|---|
//! | [`list`] | intrusive circular list of page headers, addressed by offset |
//! | [`page`] | page header codec, fit classifier, carve, merge |
//! | [`root`] | root bookkeeping record and the per-arena spinlock |
//! | [`commit`] | the `Committer` trait external callers implement |
//! | [`error`] | `FmemError`, the crate's single error enum |
//! | [`arena`] | `Arena`: the public orchestration layer |
//!
//! Backing stores (anonymous memory, POSIX shared memory, file-backed mmap)
//! are out of scope for the core allocator; see `demos/` for example
//! programs that supply one via the [`commit::Committer`] trait.

pub mod arena;
pub mod commit;
pub mod error;
pub mod list;
pub mod page;
pub mod root;

pub use arena::Arena;
pub use commit::{CommitRange, Committer};
pub use error::FmemError;

/// Total on-disk size of a [`page::PageHeader`]: `flags(4) + size(4) +
/// link(16)`.
pub const HEADER_SIZE: usize = 24;

/// Total on-disk size of a [`root::RootRecord`].
pub const ROOT_RECORD_SIZE: usize = 72;

/// A free page whose leftover after a carve would be smaller than this is
/// handed out whole instead (`FIT_AS_IS`); see [`page::classify_fit`].
pub const REMAIN_THRESHOLD: usize = 2 * HEADER_SIZE;

/// The floor every `min_alloc` is raised to if the caller requests smaller.
pub const DEFAULT_MIN_ALLOC: u64 = HEADER_SIZE as u64;

/// Magic stamped into every page header's high 16 bits when `poison-checks`
/// is enabled.
pub const POISON: u16 = 0xBEEF;

/// The smallest arena `create_new` will accept: header page + root record +
/// one empty main page.
pub const MIN_TOTAL_ALLOCATION: u64 = 3 * HEADER_SIZE as u64 + ROOT_RECORD_SIZE as u64;

use thiserror::Error;

/// Every failure sentinel the allocator can return.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FmemError {
    /// `length` passed to `create_new` is smaller than `MIN_TOTAL_ALLOCATION`.
    #[error("total allocation size {0} is too small to hold even the header pages")]
    TotalAllocationSizeTooSmall(u64),

    /// `length` cannot accommodate the header pages plus one `min_alloc` page.
    #[error("init memory of {length} bytes cannot satisfy min_alloc of {min_alloc} bytes")]
    BadInitMem { length: u64, min_alloc: u64 },

    /// No free page of sufficient size was found during `allocate`.
    #[error("arena has no free page large enough to satisfy the request")]
    NoMem,

    /// A page header's magic did not match `POISON`; the arena is corrupt.
    #[error("page header at offset {0} failed its magic check")]
    BadMem(u64),

    /// The committer callback returned an error, or a commit precondition
    /// (range inside page, committer installed) was violated.
    #[error("commit to backing store failed")]
    CommitFailed,
}

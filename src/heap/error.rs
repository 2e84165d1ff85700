use std::error::Error;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum HeapError<E: Error> {
    #[error("error in backing store: {0}")]
    Store(#[from] E),
    #[error("the backing store does not contain a tangle heap (magic bytes are missing)")]
    NotAHeap,
    #[error("heap format version {found} is not supported (expected {expected})")]
    VersionMismatch { found: u8, expected: u8 },
    #[error("data in the heap is corrupt or misinterpreted")]
    Corrupt,
    #[error("heap free list has filled up!")]
    FreeListFull,
    #[error("attempted to free a pointer that points to already free data")]
    DoubleFree,
    #[error("pointer does not match the chunk it points to")]
    PointerMismatch,
    #[error("access of {len} bytes at {addr:#x} is outside the allocated heap (used: {used})")]
    OutOfBounds { addr: u64, len: u64, used: u64 },
}

impl<E: Error> HeapError<E> {
    /// true for the variants that indicate damaged on-disk state rather
    /// than a backing-store fault. used by callers deciding whether an
    /// index rebuild would help.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::NotAHeap
                | Self::Corrupt
                | Self::DoubleFree
                | Self::PointerMismatch
                | Self::OutOfBounds { .. }
        )
    }
}

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use super::{
    ptr::{Ptr, Void},
    tuning,
};

pub const MAGIC_BYTES: [u8; 11] = *b"tangle heap";
pub const FORMAT_VERSION: u8 = 1;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
    pub struct ChunkFlags: u32 {
        const FREE = 0b10000000_00000000_00000000_00000000;
    }
}

/// metadata preceding every allocated chunk of heap space
#[derive(Clone, Copy, PartialEq, Eq, Debug, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct ChunkHeader {
    /// (ChunkFlags)
    pub flags: u32,
    /// length of the chunk data, not including this header
    pub len: u32,
    /// pointer to the next free chunk of this size (null if last / in use)
    pub next: Ptr<ChunkHeader>,
}

pub const CHUNK_HEADER_SIZE: u64 = std::mem::size_of::<ChunkHeader>() as u64;
const_assert_eq!(std::mem::size_of::<ChunkHeader>(), 16);

/// head pointer for the linked list of free chunks of one size.
/// unused entries have `size` set to zero.
#[derive(Clone, Copy, PartialEq, Eq, Debug, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct FreeCategory {
    pub size: u64,
    pub head: Ptr<ChunkHeader>,
}

#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct HeapHeader {
    pub magic_bytes: [u8; 11],
    pub version: u8,
    pub _padding: [u8; 4],
    /// watermark: everything below this offset is either the header, a live
    /// chunk, or a chunk on a free list. growth happens past this point.
    pub used: u64,
    /// well-known root pointers for the shared search indexes. slots are
    /// handed out by the schema registry at startup.
    pub index_roots: [Ptr<Void>; tuning::INDEX_ROOTS],
    /// this has a hard cap to avoid cursed recursion, where the free list
    /// would contain former entries of itself. string allocations round up
    /// to powers of two so the number of distinct sizes stays small.
    ///
    /// unused entries will have the size set to zero.
    pub free_list: [FreeCategory; tuning::FREE_LIST_SIZE],
}

pub const HEAP_HEADER_SIZE: u64 = std::mem::size_of::<HeapHeader>() as u64;

impl HeapHeader {
    pub fn new() -> Self {
        Self {
            magic_bytes: MAGIC_BYTES,
            version: FORMAT_VERSION,
            _padding: [0u8; 4],
            used: HEAP_HEADER_SIZE,
            index_roots: [Ptr::null(); tuning::INDEX_ROOTS],
            free_list: <_ as FromZeroes>::new_zeroed(),
        }
    }

    pub fn verify(&self) -> bool {
        self.magic_bytes == MAGIC_BYTES
    }
}

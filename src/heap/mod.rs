//! The persistent heap backing every record in the graph.
//!
//! Allocation design: many repeats of a handful of fixed record sizes, plus
//! strings. Free space is kept in per-size linked lists threaded through the
//! freed chunks themselves; the heads live in a bounded table in the heap
//! header. Chunks that cannot be reused are carved off the end of the file
//! (the `used` watermark), growing the backing store as needed.
//!
//! Every chunk is preceded by a [`repr::ChunkHeader`] carrying its flags and
//! length, so `free` can validate a pointer in O(1) before trusting it.

pub mod error;
pub mod ptr;
pub mod repr;
pub mod store;
#[cfg(test)]
mod test;

use self::{
    error::HeapError,
    ptr::{Ptr, Void},
    repr::{
        ChunkFlags, ChunkHeader, FreeCategory, HeapHeader, CHUNK_HEADER_SIZE, FORMAT_VERSION,
        HEAP_HEADER_SIZE,
    },
    store::Storage,
};

pub(crate) mod tuning {
    /// maximum number of distinct allocation sizes that can have a free list.
    pub const FREE_LIST_SIZE: usize = 256;
    /// number of well-known search-index root slots in the heap header.
    pub const INDEX_ROOTS: usize = 8;
    /// smallest string allocation, bytes, including the length prefix.
    pub const STRING_MIN_ALLOC: u64 = 16;
}

/// string length prefix (u32) stored before the character data.
const STRING_PREFIX_SIZE: u64 = 4;

fn round_up_to_8(n: u64) -> u64 {
    (n + 7) & !7
}

/// allocation size for a string of `len` bytes. rounded up to a power of
/// two so arbitrary string lengths cannot exhaust the free-list table.
fn string_alloc_size(len: u64) -> u64 {
    (STRING_PREFIX_SIZE + len)
        .next_power_of_two()
        .max(tuning::STRING_MIN_ALLOC)
}

/// the heap: a growable, byte-addressable store of chunks. addresses are
/// stable 64-bit offsets, and address zero always means "no value".
#[derive(Debug)]
pub struct Heap<S: Storage> {
    store: S,
    /// cached copy of the header's `used` watermark, for bounds checks
    /// without a header round-trip on every accessor call.
    used: u64,
}

impl<S: Storage> Heap<S> {
    #[instrument(skip(store))]
    pub fn new(mut store: S, init_overwrite: bool) -> Result<Self, HeapError<S::Error>> {
        let size = store.size()?;

        // if the store is empty, it is probably new and needs to be initialized
        if size < HEAP_HEADER_SIZE {
            warn!("store is empty / too small, initializing a new heap");
            let new_header = HeapHeader::new();
            store.expand_by(HEAP_HEADER_SIZE - size)?;
            store.write_typed(Ptr::<HeapHeader>::with(0u64), &new_header)?;
        }

        let header = store.read_typed(Ptr::<HeapHeader>::with(0u64))?;

        // verify the magic bytes (if they aren't there, it is possible that
        // the wrong backing [file] was opened instead of a heap, and we do
        // not want to overwrite it.)
        if !header.verify() {
            if init_overwrite {
                warn!("overwriting the current contents to initialize the heap");
                // there should be enough space
                let new_header = HeapHeader::new();
                store.write_typed(Ptr::<HeapHeader>::with(0u64), &new_header)?;
            } else {
                error!("the store in use contains data that is NOT a heap (magic bytes are missing) - refusing to continue to avoid any damage");
                return Err(HeapError::NotAHeap);
            }
        }

        let header = store.read_typed(Ptr::<HeapHeader>::with(0u64))?;
        if header.version != FORMAT_VERSION {
            error!(
                found = header.version,
                expected = FORMAT_VERSION,
                "heap was written with a different format version"
            );
            return Err(HeapError::VersionMismatch {
                found: header.version,
                expected: FORMAT_VERSION,
            });
        }

        let used = header.used;
        Ok(Self { store, used })
    }

    fn header(&mut self) -> Result<HeapHeader, HeapError<S::Error>> {
        Ok(self.store.read_typed(Ptr::<HeapHeader>::with(0u64))?)
    }

    fn put_header(&mut self, header: &HeapHeader) -> Result<(), HeapError<S::Error>> {
        self.used = header.used;
        Ok(self.store.write_typed(Ptr::<HeapHeader>::with(0u64), header)?)
    }

    /// current watermark: every valid address is below this.
    pub fn used(&self) -> u64 {
        self.used
    }

    /// get the head pointer for the linked list of free chunks of size `size`
    fn free_category(&mut self, size: u64) -> Result<Option<FreeCategory>, HeapError<S::Error>> {
        let header = self.header()?;
        Ok(header.free_list.iter().find(|x| x.size == size).copied())
    }

    /// set the head pointer for the linked list of free chunks of size `size`.
    /// setting it to null will effectively remove it.
    fn set_free_category(
        &mut self,
        size: u64,
        to: Ptr<ChunkHeader>,
    ) -> Result<(), HeapError<S::Error>> {
        let mut header = self.header()?;
        // if `to` is null then size and head both go to zero, removing the entry
        let new_entry = FreeCategory {
            size: if to.is_null() { 0 } else { size },
            head: to,
        };
        if let Some((idx, _)) = header
            .free_list
            .iter()
            .enumerate()
            .find(|x| x.1.size == size)
        {
            header.free_list[idx] = new_entry;
        } else if let Some((idx, _)) = header
            .free_list
            .iter()
            .enumerate()
            .find(|x| x.1.size == 0)
        {
            header.free_list[idx] = new_entry;
        } else {
            error!(
                "free list is full! since it is unlikely to have more than {} unique chunk sizes, this is probably a bug",
                tuning::FREE_LIST_SIZE
            );
            return Err(HeapError::FreeListFull);
        }
        self.put_header(&header)?;
        Ok(())
    }

    /// allocate a zeroed chunk of `size` bytes and return a pointer to it.
    #[instrument(skip(self))]
    pub fn alloc(&mut self, size: u64) -> Result<Ptr<Void>, HeapError<S::Error>> {
        assert!(size > 0, "zero-sized allocation");
        let size = round_up_to_8(size);
        let ptr = if let Some(category) = self.free_category(size)? {
            trace!("free list includes an entry for this size");
            let mut first_entry: ChunkHeader = self.store.read_typed(category.head)?;
            let flags = match ChunkFlags::from_bits(first_entry.flags) {
                Some(flags) if flags.contains(ChunkFlags::FREE) => flags,
                Some(..) => {
                    error!("corrupt data: in-use chunk on free list");
                    return Err(HeapError::Corrupt);
                }
                None => {
                    error!("corrupt data: chunk flags contained invalid bits");
                    return Err(HeapError::Corrupt);
                }
            };
            if first_entry.len as u64 != size {
                error!("corrupt data: mis-sized chunk on free list");
                return Err(HeapError::Corrupt);
            }
            // swap the head of the list to the next free chunk (if any)
            self.set_free_category(size, first_entry.next)?;
            // unset the `free` flag for the now in-use chunk
            first_entry.flags = (flags ^ ChunkFlags::FREE).bits();
            first_entry.next = Ptr::null();
            self.store.write_typed(category.head, &first_entry)?;
            let data = category.head.offset(CHUNK_HEADER_SIZE).cast::<Void>();
            // records must start out zero/null
            self.store.write_buf(data, size, &vec![0u8; size as usize])?;
            data
        } else {
            trace!("no free list entry - expanding");
            let expand_by = CHUNK_HEADER_SIZE + size;
            let mut header = self.header()?;
            let chunk = Ptr::<ChunkHeader>::with(header.used);
            let store_size = self.store.size()?;
            // make up the difference if the store is too small
            if store_size - header.used < expand_by {
                let delta = expand_by - (store_size - header.used);
                self.store.expand_by(delta)?;
            }
            header.used += expand_by;
            self.put_header(&header)?;
            self.store.write_typed(
                chunk,
                &ChunkHeader {
                    flags: ChunkFlags::empty().bits(),
                    len: size as u32,
                    next: Ptr::null(),
                },
            )?;
            chunk.offset(CHUNK_HEADER_SIZE).cast::<Void>()
        };
        debug!("alloc'd {} bytes @ {:#X}", size, ptr.addr);
        Ok(ptr)
    }

    /// validate the chunk header behind `at` before trusting the pointer.
    fn chunk_of(&mut self, at: Ptr<Void>) -> Result<(Ptr<ChunkHeader>, ChunkHeader), HeapError<S::Error>> {
        if at.addr < HEAP_HEADER_SIZE + CHUNK_HEADER_SIZE || at.addr >= self.used {
            return Err(HeapError::PointerMismatch);
        }
        let chunk_loc = Ptr::<ChunkHeader>::with(at.addr - CHUNK_HEADER_SIZE);
        let header: ChunkHeader = self.store.read_typed(chunk_loc)?;
        if header.len == 0 || chunk_loc.addr + CHUNK_HEADER_SIZE + header.len as u64 > self.used {
            error!("pointer does not point at a plausible chunk");
            return Err(HeapError::PointerMismatch);
        }
        Ok((chunk_loc, header))
    }

    /// return a chunk to the free list for its size.
    #[instrument(skip(self))]
    pub fn free(&mut self, at: Ptr<Void>) -> Result<(), HeapError<S::Error>> {
        debug!("free @ {:#X}", at.addr);
        let (chunk_loc, header) = self.chunk_of(at)?;
        let Some(flags) = ChunkFlags::from_bits(header.flags) else {
            error!("corrupt data: chunk flags contains invalid bits");
            return Err(HeapError::Corrupt);
        };
        if flags.contains(ChunkFlags::FREE) {
            return Err(HeapError::DoubleFree);
        }
        let mut new_header = header;
        new_header.flags = (flags | ChunkFlags::FREE).bits();
        // insert the newly freed chunk at the start of the free list for its size
        new_header.next = match self.free_category(header.len as u64)? {
            Some(category) => category.head,
            None => Ptr::null(),
        };
        self.store.write_typed(chunk_loc, &new_header)?;
        self.set_free_category(header.len as u64, chunk_loc)?;
        Ok(())
    }

    fn check_bounds(&self, addr: u64, len: u64) -> Result<(), HeapError<S::Error>> {
        if addr < HEAP_HEADER_SIZE || addr.checked_add(len).is_none() || addr + len > self.used {
            return Err(HeapError::OutOfBounds {
                addr,
                len,
                used: self.used,
            });
        }
        Ok(())
    }

    // -- bounds-checked scalar accessors (record fields go through these) --

    pub fn get_u16(&mut self, at: Ptr<Void>) -> Result<u16, HeapError<S::Error>> {
        self.check_bounds(at.addr, 2)?;
        Ok(self.store.read_typed(at.cast::<u16>())?)
    }

    pub fn put_u16(&mut self, at: Ptr<Void>, value: u16) -> Result<(), HeapError<S::Error>> {
        self.check_bounds(at.addr, 2)?;
        Ok(self.store.write_typed(at.cast::<u16>(), &value)?)
    }

    pub fn get_u32(&mut self, at: Ptr<Void>) -> Result<u32, HeapError<S::Error>> {
        self.check_bounds(at.addr, 4)?;
        Ok(self.store.read_typed(at.cast::<u32>())?)
    }

    pub fn put_u32(&mut self, at: Ptr<Void>, value: u32) -> Result<(), HeapError<S::Error>> {
        self.check_bounds(at.addr, 4)?;
        Ok(self.store.write_typed(at.cast::<u32>(), &value)?)
    }

    pub fn get_u64(&mut self, at: Ptr<Void>) -> Result<u64, HeapError<S::Error>> {
        self.check_bounds(at.addr, 8)?;
        Ok(self.store.read_typed(at.cast::<u64>())?)
    }

    pub fn put_u64(&mut self, at: Ptr<Void>, value: u64) -> Result<(), HeapError<S::Error>> {
        self.check_bounds(at.addr, 8)?;
        Ok(self.store.write_typed(at.cast::<u64>(), &value)?)
    }

    /// read a record pointer stored at `at`.
    pub fn get_ptr(&mut self, at: Ptr<Void>) -> Result<Ptr<Void>, HeapError<S::Error>> {
        Ok(Ptr::with(self.get_u64(at)?))
    }

    /// store a record pointer at `at`.
    pub fn put_ptr(&mut self, at: Ptr<Void>, value: Ptr<Void>) -> Result<(), HeapError<S::Error>> {
        self.put_u64(at, value.addr)
    }

    pub fn read<T: zerocopy::FromBytes>(&mut self, at: Ptr<T>) -> Result<T, HeapError<S::Error>> {
        self.check_bounds(at.addr, std::mem::size_of::<T>() as u64)?;
        Ok(self.store.read_typed(at)?)
    }

    pub fn write<T: zerocopy::AsBytes>(
        &mut self,
        at: Ptr<T>,
        value: &T,
    ) -> Result<(), HeapError<S::Error>> {
        self.check_bounds(at.addr, std::mem::size_of::<T>() as u64)?;
        Ok(self.store.write_typed(at, value)?)
    }

    // -- interned strings (length-prefixed, content-addressed by the caller) --

    /// intern a new string and return its handle.
    #[instrument(skip(self, value))]
    pub fn new_string(&mut self, value: &str) -> Result<Ptr<Void>, HeapError<S::Error>> {
        let bytes = value.as_bytes();
        assert!(bytes.len() <= u32::MAX as usize, "string too large");
        let at = self.alloc(string_alloc_size(bytes.len() as u64))?;
        self.put_u32(at, bytes.len() as u32)?;
        if !bytes.is_empty() {
            self.store
                .write_buf(at.offset(STRING_PREFIX_SIZE), bytes.len() as u64, bytes)?;
        }
        Ok(at)
    }

    pub fn get_string(&mut self, at: Ptr<Void>) -> Result<String, HeapError<S::Error>> {
        let len = self.get_u32(at)? as u64;
        self.check_bounds(at.addr + STRING_PREFIX_SIZE, len)?;
        let mut buf = vec![0; len as usize];
        self.store
            .read_buf(at.offset(STRING_PREFIX_SIZE), len, &mut buf)?;
        String::from_utf8(buf).map_err(|_| {
            error!("corrupt data: interned string is not valid utf-8");
            HeapError::Corrupt
        })
    }

    /// content-compare the interned string at `at` against `value` without
    /// reallocating anything.
    pub fn string_eq(&mut self, at: Ptr<Void>, value: &str) -> Result<bool, HeapError<S::Error>> {
        let len = self.get_u32(at)? as u64;
        if len != value.len() as u64 {
            return Ok(false);
        }
        Ok(self.get_string(at)?.as_bytes() == value.as_bytes())
    }

    pub fn free_string(&mut self, at: Ptr<Void>) -> Result<(), HeapError<S::Error>> {
        self.free(at)
    }

    // -- search-index roots --

    pub fn index_root(&mut self, slot: usize) -> Result<Ptr<Void>, HeapError<S::Error>> {
        assert!(slot < tuning::INDEX_ROOTS, "index root slot out of range");
        Ok(self.header()?.index_roots[slot])
    }

    pub fn set_index_root(
        &mut self,
        slot: usize,
        to: Ptr<Void>,
    ) -> Result<(), HeapError<S::Error>> {
        assert!(slot < tuning::INDEX_ROOTS, "index root slot out of range");
        let mut header = self.header()?;
        header.index_roots[slot] = to;
        self.put_header(&header)?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn infodump(&mut self) -> Result<(), HeapError<S::Error>> {
        let header = self.header()?;
        let size = self.store.size()?;
        info!(
            "heap tracking {} / {} bytes (includes space that has been freed)",
            header.used, size
        );
        let sizes = header
            .free_list
            .iter()
            .filter(|x| x.size != 0)
            .map(|x| x.size)
            .collect::<Vec<_>>();
        info!("heap contains free chunks of size {sizes:?}");
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), HeapError<S::Error>> {
        Ok(self.store.sync()?)
    }

    #[instrument(skip(self))]
    pub fn close(self) -> Result<(), HeapError<S::Error>> {
        Ok(self.store.close()?)
    }
}

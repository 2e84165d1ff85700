use std::{error::Error, fs, io, mem, path::Path};

use memmap2::MmapMut;
use zerocopy::{AsBytes, FromBytes};

use super::ptr::{Ptr, Void};

/// trait that all storage backings for the heap must implement.
///
/// all operations are synchronous and run to completion - suspension,
/// internal blocking I/O queues, and cancellation are the business of
/// whatever layer sits on top of the graph, not of this one.
pub trait Storage {
    type Error: Error + 'static;
    fn read_buf(&mut self, at: Ptr<Void>, amnt: u64, into: &mut [u8]) -> Result<(), Self::Error>;
    fn write_buf(&mut self, at: Ptr<Void>, amnt: u64, from: &[u8]) -> Result<(), Self::Error>;
    fn size(&mut self) -> Result<u64, Self::Error>;
    fn expand_by(&mut self, amnt: u64) -> Result<(), Self::Error>;
    fn sync(&mut self) -> Result<(), Self::Error>;
    fn close(self) -> Result<(), Self::Error>;

    fn read_typed<T: FromBytes>(&mut self, at: Ptr<T>) -> Result<T, Self::Error> {
        let mut buf = vec![0; mem::size_of::<T>()];
        self.read_buf(at.cast::<Void>(), buf.len() as u64, &mut buf)?;
        Ok(T::read_from(buf.as_slice()).unwrap())
    }

    fn write_typed<T: AsBytes>(&mut self, at: Ptr<T>, from: &T) -> Result<(), Self::Error> {
        self.write_buf(
            at.cast::<Void>(),
            mem::size_of::<T>() as u64,
            from.as_bytes(),
        )
    }
}

/// in-memory storage. used by the tests, and useful for ephemeral graphs
/// that never need to hit the disk.
#[derive(Default, Debug)]
pub struct MemStore {
    data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemStoreError {
    #[error("access of {amnt} bytes at {at:#x} is out of bounds (store holds {size} bytes)")]
    OutOfBounds { at: u64, amnt: u64, size: u64 },
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self, at: u64, amnt: u64) -> Result<(), MemStoreError> {
        if at.checked_add(amnt).is_none() || at + amnt > self.data.len() as u64 {
            return Err(MemStoreError::OutOfBounds {
                at,
                amnt,
                size: self.data.len() as u64,
            });
        }
        Ok(())
    }
}

impl Storage for MemStore {
    type Error = MemStoreError;

    fn read_buf(&mut self, at: Ptr<Void>, amnt: u64, into: &mut [u8]) -> Result<(), Self::Error> {
        assert!(into.len() >= amnt as usize);
        self.check(at.addr, amnt)?;
        into[..amnt as usize]
            .copy_from_slice(&self.data[at.addr as usize..(at.addr + amnt) as usize]);
        Ok(())
    }

    fn write_buf(&mut self, at: Ptr<Void>, amnt: u64, from: &[u8]) -> Result<(), Self::Error> {
        assert!(from.len() >= amnt as usize);
        self.check(at.addr, amnt)?;
        self.data[at.addr as usize..(at.addr + amnt) as usize]
            .copy_from_slice(&from[..amnt as usize]);
        Ok(())
    }

    fn size(&mut self) -> Result<u64, Self::Error> {
        Ok(self.data.len() as u64)
    }

    fn expand_by(&mut self, amnt: u64) -> Result<(), Self::Error> {
        self.data.resize(self.data.len() + amnt as usize, 0);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn close(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    #[error("I/O Error: {0}")]
    Io(#[from] io::Error),
    #[error("attempted to write to a read-only store")]
    Readonly,
    #[error("access of {amnt} bytes at {at:#x} is out of bounds (store holds {size} bytes)")]
    OutOfBounds { at: u64, amnt: u64, size: u64 },
}

/// file-backed storage via a mutable memory map. the map is torn down and
/// re-created whenever the file grows.
pub struct FileStore {
    file: fs::File,
    map: Option<MmapMut>,
    readonly: bool,
}

impl FileStore {
    /// Opens (creating if missing) the file at `path` as a store.
    ///
    /// ## Safety
    /// see memmap2::MmapMut::map_mut - the file must be appropriately
    /// protected, and it is UB if it is modified externally while mapped
    #[instrument]
    pub unsafe fn new(path: &Path, readonly: bool) -> Result<Self, FileStoreError> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(!readonly)
            .create(!readonly)
            .open(path)?;
        let map = if file.metadata()?.len() == 0 {
            // cannot map an empty file. expand_by will create the map once
            // there is something to map.
            None
        } else {
            // Safety: forwarded to the caller
            Some(unsafe { MmapMut::map_mut(&file) }?)
        };
        Ok(Self {
            file,
            map,
            readonly,
        })
    }

    fn check(&self, at: u64, amnt: u64) -> Result<(), FileStoreError> {
        let size = self.map.as_ref().map_or(0, |m| m.len() as u64);
        if at.checked_add(amnt).is_none() || at + amnt > size {
            return Err(FileStoreError::OutOfBounds { at, amnt, size });
        }
        Ok(())
    }
}

impl Storage for FileStore {
    type Error = FileStoreError;

    fn read_buf(&mut self, at: Ptr<Void>, amnt: u64, into: &mut [u8]) -> Result<(), Self::Error> {
        assert!(into.len() >= amnt as usize);
        self.check(at.addr, amnt)?;
        let map = self.map.as_ref().expect("checked by self.check");
        into[..amnt as usize].copy_from_slice(&map[at.addr as usize..(at.addr + amnt) as usize]);
        Ok(())
    }

    fn write_buf(&mut self, at: Ptr<Void>, amnt: u64, from: &[u8]) -> Result<(), Self::Error> {
        if self.readonly {
            return Err(FileStoreError::Readonly);
        }
        assert!(from.len() >= amnt as usize);
        self.check(at.addr, amnt)?;
        let map = self.map.as_mut().expect("checked by self.check");
        map[at.addr as usize..(at.addr + amnt) as usize].copy_from_slice(&from[..amnt as usize]);
        Ok(())
    }

    fn size(&mut self) -> Result<u64, Self::Error> {
        Ok(self.file.metadata()?.len())
    }

    fn expand_by(&mut self, amnt: u64) -> Result<(), Self::Error> {
        if self.readonly {
            return Err(FileStoreError::Readonly);
        }
        let size = self.file.metadata()?.len();
        // unmap before resizing the file underneath the mapping
        drop(self.map.take());
        self.file.set_len(size + amnt)?;
        // Safety: same conditions as in Self::new, upheld by whoever called it
        self.map = Some(unsafe { MmapMut::map_mut(&self.file) }?);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Self::Error> {
        if let Some(map) = &self.map {
            map.flush()?;
        }
        Ok(())
    }

    fn close(mut self) -> Result<(), Self::Error> {
        self.sync()?;
        drop(self.map.take());
        self.file.sync_all()?;
        Ok(())
    }
}

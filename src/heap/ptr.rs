use std::{fmt::Debug, marker::PhantomData};

use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// marker for pointers to untyped bytes (record base addresses, string data)
pub enum Void {}

/// a typed address into the heap. address 0 is the null pointer ("no value").
#[repr(transparent)]
pub struct Ptr<T> {
    pub addr: u64,
    _ph: PhantomData<T>,
}

impl<T> Ptr<T> {
    pub fn with(addr: u64) -> Self {
        Self {
            addr,
            _ph: PhantomData,
        }
    }

    pub fn null() -> Self {
        Self::with(0)
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }

    pub fn cast<U>(self) -> Ptr<U> {
        Ptr {
            addr: self.addr,
            _ph: PhantomData,
        }
    }

    pub fn offset(self, by: u64) -> Self {
        Self::with(self.addr.checked_add(by).unwrap_or_else(|| {
            panic!("offsetting pointer {}u64 by {by}u64 overflowed!", self.addr)
        }))
    }
}

impl<T> Copy for Ptr<T> {}
impl<T> Clone for Ptr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Debug for Ptr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ptr").field("addr", &self.addr).finish()
    }
}
impl<T> PartialEq for Ptr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}
impl<T> Eq for Ptr<T> {}
unsafe impl<T> FromZeroes for Ptr<T> {
    fn only_derive_is_allowed_to_implement_this_trait()
    where
        Self: Sized,
    {
    }
}
unsafe impl<T> FromBytes for Ptr<T> {
    fn only_derive_is_allowed_to_implement_this_trait()
    where
        Self: Sized,
    {
    }
}
unsafe impl<T> AsBytes for Ptr<T> {
    fn only_derive_is_allowed_to_implement_this_trait()
    where
        Self: Sized,
    {
    }
}
unsafe impl<T> Sync for Ptr<T> {}
unsafe impl<T> Send for Ptr<T> {}

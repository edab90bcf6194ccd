use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::scan::Visitor;
use crate::Trace;

/// A typed handle to a value placed in the heap by [`crate::Heap::manage`].
///
/// The handle is just the payload address, so a `Gc` sitting on the stack, in
/// a registered range or inside another managed object keeps its value alive.
/// Handles kept anywhere else (a `Box`, a `static`) are invisible to the
/// collector.
pub struct Gc<T> {
    ptr: NonNull<T>,
    _marker: PhantomData<T>,
}

impl<T> Copy for Gc<T> {}
impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Gc<T> {
    /// # Safety
    /// `payload` must hold an initialized `T` managed by a heap.
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        Self {
            ptr: payload.cast(),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn ptr_eq(a: Gc<T>, b: Gc<T>) -> bool {
        a.ptr == b.ptr
    }

    /// The payload address, as understood by the untyped heap API.
    pub fn as_payload(self) -> NonNull<u8> {
        self.ptr.cast()
    }

    #[inline]
    pub fn to_bits(self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// # Safety
    /// `value` must have come from [`Gc::to_bits`] on a value that is still live.
    #[inline]
    pub unsafe fn from_bits(value: usize) -> Self {
        Self {
            ptr: NonNull::new_unchecked(value as *mut T),
            _marker: PhantomData,
        }
    }
}

impl<T> Deref for Gc<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe {
            self.ptr.as_ref()
        }
    }
}

impl<T> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        Gc::ptr_eq(*self, *other)
    }
}

impl<T> Eq for Gc<T> {}

impl<T> fmt::Debug for Gc<T> where T: fmt::Debug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

impl<T> fmt::Display for Gc<T> where T: fmt::Display {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

unsafe impl<T> Trace for Gc<T> {
    fn trace(&self, visitor: &mut Visitor) {
        visitor.visit(self.to_bits());
    }
}

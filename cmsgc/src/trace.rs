use std::cell::Cell;
use std::ptr::NonNull;

use crate::scan::Visitor;
use crate::RootRange;

/// Reports the words a host value holds that may point into the heap.
///
/// Values handed to [`crate::Heap::collect_with`] are traced before the
/// worklist is drained, so anything they report is kept alive together with
/// everything reachable from it.
///
/// # Safety
/// Implementations must only hand the visitor memory that is readable.
pub unsafe trait Trace {
    fn trace(&self, visitor: &mut Visitor);
}

unsafe impl Trace for usize {
    fn trace(&self, visitor: &mut Visitor) {
        visitor.visit(*self);
    }
}

unsafe impl<T> Trace for NonNull<T> {
    fn trace(&self, visitor: &mut Visitor) {
        visitor.visit(self.as_ptr() as usize);
    }
}

unsafe impl<T> Trace for *const T {
    fn trace(&self, visitor: &mut Visitor) {
        visitor.visit(*self as usize);
    }
}

unsafe impl<T> Trace for *mut T {
    fn trace(&self, visitor: &mut Visitor) {
        visitor.visit(*self as usize);
    }
}

/// Scans the words of the range, the caller guarantees it stays readable.
unsafe impl Trace for RootRange {
    fn trace(&self, visitor: &mut Visitor) {
        unsafe {
            visitor.visit_range(self.from, self.to);
        }
    }
}

unsafe impl<T: Trace> Trace for Option<T> {
    fn trace(&self, visitor: &mut Visitor) {
        if let Some(inner) = self {
            inner.trace(visitor);
        }
    }
}

unsafe impl<T: Trace> Trace for [T] {
    #[inline]
    fn trace(&self, visitor: &mut Visitor) {
        for el in self {
            el.trace(visitor);
        }
    }
}

unsafe impl<T: Trace, const N: usize> Trace for [T; N] {
    #[inline]
    fn trace(&self, visitor: &mut Visitor) {
        self.as_slice().trace(visitor);
    }
}

unsafe impl<T: Trace> Trace for Vec<T> {
    #[inline]
    fn trace(&self, visitor: &mut Visitor) {
        self.as_slice().trace(visitor);
    }
}

unsafe impl<T: Trace + ?Sized> Trace for Box<T> {
    fn trace(&self, visitor: &mut Visitor) {
        (**self).trace(visitor);
    }
}

unsafe impl<T> Trace for Cell<T> where T: Trace + Copy {
    fn trace(&self, visitor: &mut Visitor) {
        self.get().trace(visitor);
    }
}

use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display, Formatter},
    hash::{Hash, Hasher},
    marker::PhantomData,
    mem::size_of,
    ops::{Add, Sub},
};

/// The referent of an untyped tracee pointer. Byte-sized so that arithmetic
/// on `RemotePtr<Void>` is byte arithmetic.
pub type Void = u8;

/// A typed pointer into a tracee's address space. Never dereferenced
/// locally; all access goes through task memory I/O. Arithmetic is scaled
/// by the referent size, like a raw pointer.
pub struct RemotePtr<T> {
    ptr: usize,
    phantom: PhantomData<*const T>,
}

impl<T> RemotePtr<T> {
    pub fn new(ptr: usize) -> RemotePtr<T> {
        RemotePtr {
            ptr,
            phantom: PhantomData,
        }
    }

    pub fn null() -> RemotePtr<T> {
        Self::new(0)
    }

    pub fn is_null(&self) -> bool {
        self.ptr == 0
    }

    pub fn as_usize(&self) -> usize {
        self.ptr
    }

    pub fn as_isize(&self) -> isize {
        self.ptr as isize
    }

    pub fn referent_size(&self) -> usize {
        size_of::<T>()
    }

    pub fn cast<U>(r: RemotePtr<U>) -> RemotePtr<T> {
        RemotePtr::new(r.ptr)
    }
}

// Manual impls: deriving would put bounds on T, and T is phantom.
impl<T> Copy for RemotePtr<T> {}

impl<T> Clone for RemotePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Default for RemotePtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> From<usize> for RemotePtr<T> {
    fn from(ptr: usize) -> Self {
        Self::new(ptr)
    }
}

impl<T> Display for RemotePtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl<T> Debug for RemotePtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl<T> Add<usize> for RemotePtr<T> {
    type Output = Self;

    fn add(self, delta: usize) -> Self {
        Self::new(self.ptr + delta * size_of::<T>())
    }
}

impl<T> Sub<usize> for RemotePtr<T> {
    type Output = Self;

    fn sub(self, delta: usize) -> Self {
        Self::new(self.ptr - delta * size_of::<T>())
    }
}

impl<T> Sub<RemotePtr<T>> for RemotePtr<T> {
    type Output = usize;

    /// Element count between two pointers of the same type.
    fn sub(self, rhs: RemotePtr<T>) -> usize {
        (self.ptr - rhs.ptr) / size_of::<T>()
    }
}

impl<T> PartialEq for RemotePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for RemotePtr<T> {}

impl<T> PartialOrd for RemotePtr<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for RemotePtr<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ptr.cmp(&other.ptr)
    }
}

impl<T> Hash for RemotePtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_by_default() {
        let a = RemotePtr::<u64>::default();
        assert!(a.is_null());
        assert_eq!(0, a.as_usize());
    }

    #[test]
    fn add_scales_by_referent() {
        let a = RemotePtr::<u64>::null();
        assert_eq!(8, (a + 1).as_usize());

        struct S(u64, u64);
        let b = RemotePtr::<S>::null();
        assert_eq!(16, (b + 1).as_usize());
        let _ = S(0, 0);
    }

    #[test]
    fn byte_arithmetic_through_void() {
        let a = RemotePtr::<Void>::new(0x1000);
        assert_eq!(0x1003, (a + 3).as_usize());
        assert_eq!(3, (a + 3) - a);
    }

    #[test]
    fn add_sub_round_trip() {
        let a = RemotePtr::<u64>::new(64);
        assert_eq!(a, a + 2 - 2);
    }

    #[test]
    fn cast_changes_referent() {
        struct S(u64, u64);
        let a = RemotePtr::<u64>::new(8);
        let b = RemotePtr::<S>::cast(a);
        assert_eq!(8, b.as_usize());
        assert_eq!(16, b.referent_size());
        let _ = S(0, 0);
    }

    #[test]
    fn ordering() {
        let c = RemotePtr::<u64>::new(0);
        let d = RemotePtr::<u64>::new(16);
        assert!(c < d);
        assert!(d > c);
        assert_ne!(c, d);
    }
}

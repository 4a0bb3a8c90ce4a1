//! Cell types.

use core::cell::UnsafeCell;

/// A wrapper for [`UnsafeCell`] which is also [`Sync`].
///
/// This type is for state whose exclusivity is enforced by a locking
/// protocol the type system cannot see, such as cache slot metadata that is
/// guarded by whichever bucket lock currently owns the slot.
#[repr(transparent)]
pub struct SyncUnsafeCell<T: ?Sized> {
    /// The inner cell.
    inner: UnsafeCell<T>,
}

impl<T> SyncUnsafeCell<T> {
    /// Construct a new [`SyncUnsafeCell`].
    ///
    /// The value must be `Send` and `Sync` because the cell can be used to
    /// share or send it between threads.
    pub const fn new(value: T) -> Self
    where
        T: Send + Sync,
    {
        Self {
            inner: UnsafeCell::new(value),
        }
    }

    /// Convert back into the original value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> SyncUnsafeCell<T> {
    /// Get a pointer to the inner value.
    ///
    /// This method is always safe to call; dereferencing the result is only
    /// sound under whatever aliasing discipline the surrounding protocol
    /// provides.
    pub const fn get(&self) -> *mut T {
        self.inner.get()
    }

    /// Get an exclusive reference to the inner value (safely).
    ///
    /// The exclusive reference to `self` ensures no one else can access the
    /// inner value.
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

// SAFETY: Safe construction only permits `Sync` values.
unsafe impl<T> Sync for SyncUnsafeCell<T> {}
// SAFETY: Safe construction only permits `Send` values.
unsafe impl<T> Send for SyncUnsafeCell<T> {}
